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

//! Upload protocol tokens and timing

use std::time::Duration;

/// Device has no file staged - host must send the start command
pub const FILE_MISSING: &str = "FILE_MISSING";

/// Device is ready for the size field
pub const READY_TO_RECEIVE: &str = "READY_TO_RECEIVE";

/// Prefix of the device's size acknowledgement
pub const SIZE_ACK: &str = "SIZE:";

/// Device has written the previous chunk and wants the next one
pub const NEXT: &str = "NEXT";

/// Device has verified the complete file
pub const DONE: &str = "DONE";

/// Host command telling the device to prepare for an upload
pub const START_UPLOAD: &[u8] = b"START_UPLOAD\n";

// ============================================================================
// Defaults & Timing
// ============================================================================

pub const DEFAULT_PORT: &str = "/dev/ttyACM0";
pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_FILE: &str = "data/eye.gif";

/// Must equal the receiver's compiled-in chunk size
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// How long DTR is held asserted to reset the device
pub const RESET_PULSE: Duration = Duration::from_millis(100);

/// Boot time allowed after the reset pulse
pub const SETTLE_TIME: Duration = Duration::from_secs(2);

/// Handshake polling interval
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pause after sending START_UPLOAD before reading again
pub const START_BACKOFF: Duration = Duration::from_millis(500);

/// Quiet period during the handshake after which a status note is printed
pub const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Per-read timeout on the serial connection
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Line Matching
// ============================================================================

/// How a received line is compared against an expected token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Line contains the token anywhere
    Contains(&'static str),
    /// Line is exactly the token
    Exact(&'static str),
    /// Line contains the first token but not the second
    ContainsUnless(&'static str, &'static str),
}

impl Token {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Token::Contains(token) => line.contains(token),
            Token::Exact(token) => line == *token,
            Token::ContainsUnless(token, unless) => line.contains(token) && !line.contains(unless),
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Contains(token) => write!(f, "*{}*", token),
            Token::Exact(token) => write!(f, "{}", token),
            Token::ContainsUnless(token, unless) => write!(f, "*{}* without *{}*", token, unless),
        }
    }
}

// ============================================================================
// Size Field
// ============================================================================

/// The size field is a raw little-endian u32
pub fn encode_size(size: u32) -> [u8; 4] {
    size.to_le_bytes()
}

/// Pull the number out of a `SIZE:` acknowledgement.
///
/// The acknowledgement is informational only; `None` just means there was
/// nothing numeric to compare against.
pub fn parse_size_ack(line: &str) -> Option<u32> {
    let (_, rest) = line.split_once(SIZE_ACK)?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
