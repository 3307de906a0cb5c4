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

//! SAM3X line relay protocol constants

use std::time::Duration;

/// Carriage return + line feed, appended to every outgoing line
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Controller acknowledgment - ready for the next line
pub const ACK_TOKEN: &[u8] = b"OK\r\n";

/// Supervisory timer period
pub const TICK_PERIOD: Duration = Duration::from_millis(100);

/// Ticks to wait for the first acknowledgment (controller may still be booting)
pub const INITIAL_TIMEOUT_TICKS: u32 = 500;

/// Ticks to wait for each following acknowledgment
pub const STEADY_TIMEOUT_TICKS: u32 = 100;

/// Longest line content relayed, terminator excluded
pub const MAX_LINE_LENGTH: usize = 200;

/// Bytes accumulated from the controller before giving up on an acknowledgment
pub const RESPONSE_CAPACITY: usize = 256;

/// Default baud rate of the controller link
pub const DEFAULT_BAUD: u32 = 115_200;

/// Status reported when the whole source file has been acknowledged
pub const STATUS_OK: &str = "OK";

/// Status reported when the controller stopped acknowledging
pub const STATUS_TIMEOUT: &str = "TIMEOUT";

/// HTTP status that marks a fetch as successful
pub const HTTP_OK: u16 = 200;

/// Error code for argument, resource and internal failures
pub const INTERNAL_ERROR: u16 = 500;

/// Error code for frames that cannot be decoded
pub const BAD_REQUEST: u16 = 400;

/// Error code for unknown methods
pub const NOT_FOUND: u16 = 404;
