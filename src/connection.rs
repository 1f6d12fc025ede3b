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

//! Line-oriented view of the serial connection
//!
//! The device speaks in newline-terminated text lines while the host writes
//! raw binary. `Connection` buffers incoming bytes until a full line is
//! available, decodes it permissively and hands it to the protocol. It owns
//! the port for the whole session and closes it when dropped.

use std::io;
use std::time::Duration;
use log::debug;
use crate::protocol::Token;
use crate::serial::SerialPort;

pub struct Connection {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl Connection {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Connection {
            port,
            pending: Vec::new(),
        }
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        debug!("Sent: {} bytes", buf.len());
        Ok(())
    }

    pub fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.port.set_dtr(level)
    }

    pub fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.port.set_rts(level)
    }

    /// Drop both the OS receive buffer and any partial line already read
    pub fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.port.clear_input()
    }

    pub fn close(&mut self) {
        if self.port.is_open() {
            self.port.close();
            debug!("Serial port closed");
        }
    }

    /// Next complete line, or `None` if none arrived within `timeout`.
    ///
    /// Bytes of an unfinished line stay buffered for the next call.
    pub fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        let mut buf = [0u8; 256];
        match self.port.read_timeout(&mut buf, timeout) {
            Ok(n) => self.pending.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => return Err(e),
        }

        Ok(self.take_line())
    }

    /// Read lines until one satisfies `token`, returning that line.
    ///
    /// `on_other` runs for every line that does not match (`Some`) and for
    /// every read that produced no complete line (`None`). Errors from the
    /// port or from `on_other` end the wait.
    pub fn wait_for<F>(&mut self, token: Token, timeout: Duration, mut on_other: F) -> io::Result<String>
    where
        F: FnMut(&mut Connection, Option<&str>) -> io::Result<()>,
    {
        loop {
            match self.read_line(timeout)? {
                Some(line) if token.matches(&line) => {
                    debug!("Received: {:?}", line);
                    return Ok(line);
                }
                Some(line) => {
                    if !line.is_empty() {
                        debug!("Ignored while waiting for {}: {:?}", token, line);
                    }
                    on_other(self, Some(&line))?;
                }
                None => on_other(self, None)?,
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        Some(decode_line(&raw))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decode a raw line, dropping bytes that are not valid UTF-8 and
/// surrounding whitespace (including the line terminator)
fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|&c| c != char::REPLACEMENT_CHARACTER)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Ignore everything that doesn't match
pub fn ignore(_: &mut Connection, _: Option<&str>) -> io::Result<()> {
    Ok(())
}
