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

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::warn;
use crate::protocol::LINE_TERMINATOR;

/// Reads the relay source one line at a time, ready for the wire.
pub struct LineReader {
    inner: Box<dyn BufRead + Send>,
    max_len: usize,
    line_no: usize,
}

impl LineReader {
    pub fn new<R: BufRead + Send + 'static>(inner: R, max_len: usize) -> Self {
        LineReader {
            inner: Box::new(inner),
            max_len,
            line_no: 0,
        }
    }

    pub fn open(path: &Path, max_len: usize) -> std::io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), max_len))
    }

    /// Number of lines handed out so far.
    pub fn line_no(&self) -> usize {
        self.line_no
    }

    /// Next line with its original ending replaced by CR/LF, or `None` at end of file.
    ///
    /// Content beyond `max_len` bytes is dropped; the rest of that source
    /// line does not become a line of its own. At most `max_len` plus the
    /// ending is ever held in memory.
    pub fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let limit = self.max_len as u64 + LINE_TERMINATOR.len() as u64;
        let mut line = Vec::new();
        if (&mut self.inner).take(limit).read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        self.line_no += 1;

        let mut truncated = false;
        if line.ends_with(b"\n") {
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
        } else if line.len() as u64 == limit {
            // Stopped at the bound, not at end of file
            self.discard_rest_of_line()?;
            truncated = true;
        }

        if truncated || line.len() > self.max_len {
            warn!("Line {} exceeds {} bytes, truncating", self.line_no, self.max_len);
            line.truncate(self.max_len);
        }

        line.extend_from_slice(LINE_TERMINATOR);
        Ok(Some(line))
    }

    /// Skips input up to and including the next newline without buffering it.
    fn discard_rest_of_line(&mut self) -> std::io::Result<()> {
        loop {
            let (newline, available) = {
                let buf = self.inner.fill_buf()?;
                (buf.iter().position(|&b| b == b'\n'), buf.len())
            };
            match newline {
                Some(pos) => {
                    self.inner.consume(pos + 1);
                    return Ok(());
                }
                None if available == 0 => return Ok(()),
                None => self.inner.consume(available),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(text: &'static str, max_len: usize) -> LineReader {
        LineReader::new(Cursor::new(text.as_bytes()), max_len)
    }

    #[test]
    fn test_line_endings_normalized() {
        let mut lines = reader("G28\nG1 X10\r\nM84", 200);
        assert_eq!(lines.next_line().unwrap(), Some(b"G28\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), Some(b"G1 X10\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), Some(b"M84\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), None);
        assert_eq!(lines.line_no(), 3);
    }

    #[test]
    fn test_blank_line_is_bare_terminator() {
        let mut lines = reader("\nG28\n", 200);
        assert_eq!(lines.next_line().unwrap(), Some(b"\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), Some(b"G28\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), None);
    }

    #[test]
    fn test_long_line_truncated() {
        let mut lines = reader("ABCDEFGH\nXY\n", 4);
        assert_eq!(lines.next_line().unwrap(), Some(b"ABCD\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), Some(b"XY\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), None);
    }

    #[test]
    fn test_truncation_at_ending_boundaries() {
        let mut lines = reader("ABCD\r\nABCDE\r\nABCDEF\nXY", 4);
        assert_eq!(lines.next_line().unwrap(), Some(b"ABCD\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), Some(b"ABCD\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), Some(b"ABCD\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), Some(b"XY\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), None);
        assert_eq!(lines.line_no(), 4);
    }

    #[test]
    fn test_huge_line_is_skipped_not_buffered() {
        let huge = std::io::repeat(b'A').take(64 << 20).chain(&b"\nG28\n"[..]);
        let mut lines = LineReader::new(BufReader::new(huge), 4);
        assert_eq!(lines.next_line().unwrap(), Some(b"AAAA\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), Some(b"G28\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), None);
    }

    #[test]
    fn test_unterminated_long_tail() {
        let tail = std::io::repeat(b'B').take(10_000);
        let mut lines = LineReader::new(BufReader::new(tail), 8);
        assert_eq!(lines.next_line().unwrap(), Some(b"BBBBBBBB\r\n".to_vec()));
        assert_eq!(lines.next_line().unwrap(), None);
    }

    #[test]
    fn test_empty_source() {
        let mut lines = reader("", 200);
        assert_eq!(lines.next_line().unwrap(), None);
        assert_eq!(lines.line_no(), 0);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LineReader::open(&dir.path().join("missing.gcode"), 200).is_err());
    }
}
