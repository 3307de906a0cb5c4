// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Accumulates controller output and looks for the acknowledgment token.

use crate::protocol::ACK_TOKEN;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AckError {
    #[error("response buffer overflow: {received} bytes without acknowledgment (capacity {capacity})")]
    Overflow { capacity: usize, received: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    Matched,
    Pending,
}

/// Bytes received from the controller since the last acknowledgment.
///
/// The whole buffer is scanned after every append, so a token split across
/// two receive events is still found once it is complete.
pub struct ResponseBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl ResponseBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        ResponseBuffer {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, data: &[u8]) -> Result<Scan, AckError> {
        self.bytes.extend_from_slice(data);

        if contains(&self.bytes, ACK_TOKEN) {
            return Ok(Scan::Matched);
        }

        if self.bytes.len() > self.capacity {
            return Err(AckError::Overflow {
                capacity: self.capacity,
                received: self.bytes.len(),
            });
        }

        Ok(Scan::Pending)
    }

    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_in_single_event() {
        let mut buf = ResponseBuffer::with_capacity(32);
        assert_eq!(buf.append(b"OK\r\n"), Ok(Scan::Matched));
    }

    #[test]
    fn test_token_split_across_events() {
        let mut buf = ResponseBuffer::with_capacity(32);
        assert_eq!(buf.append(b"O"), Ok(Scan::Pending));
        assert_eq!(buf.append(b"K\r"), Ok(Scan::Pending));
        assert_eq!(buf.append(b"\n"), Ok(Scan::Matched));
    }

    #[test]
    fn test_token_after_noise() {
        let mut buf = ResponseBuffer::with_capacity(32);
        assert_eq!(buf.append(b"echo: G1 X1\r\n"), Ok(Scan::Pending));
        assert_eq!(buf.append(b"OK\r\n"), Ok(Scan::Matched));
    }

    #[test]
    fn test_partial_token_does_not_match() {
        let mut buf = ResponseBuffer::with_capacity(32);
        assert_eq!(buf.append(b"OK"), Ok(Scan::Pending));
        assert_eq!(buf.append(b"\r"), Ok(Scan::Pending));
        assert_eq!(buf.append(b"OK\n"), Ok(Scan::Pending));
    }

    #[test]
    fn test_reset_forgets_stale_token() {
        let mut buf = ResponseBuffer::with_capacity(32);
        assert_eq!(buf.append(b"OK\r\n"), Ok(Scan::Matched));
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.append(b"busy\r\n"), Ok(Scan::Pending));
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_overflow_without_token() {
        let mut buf = ResponseBuffer::with_capacity(8);
        assert_eq!(buf.append(b"12345678"), Ok(Scan::Pending));
        assert_eq!(
            buf.append(b"9"),
            Err(AckError::Overflow { capacity: 8, received: 9 })
        );
    }

    #[test]
    fn test_token_in_overflowing_chunk_still_matches() {
        let mut buf = ResponseBuffer::with_capacity(8);
        assert_eq!(buf.append(b"garbage!OK\r\n"), Ok(Scan::Matched));
    }
}
