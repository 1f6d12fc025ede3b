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

use std::io::{self, Read, Write};
use std::time::Duration;
use serialport::{ClearBuffer, SerialPort as SerialPortTrait};
use crate::protocol::READ_TIMEOUT;

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Trait for serial port operations needed by the upload protocol
pub trait SerialPort: Send {
    /// Write the whole buffer and flush it to the wire
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn set_dtr(&mut self, level: bool) -> io::Result<()>;

    fn set_rts(&mut self, level: bool) -> io::Result<()>;

    /// Discard anything already sitting in the receive buffer
    fn clear_input(&mut self) -> io::Result<()>;

    fn is_open(&self) -> bool;

    /// Release the port. Calling this on a closed port does nothing.
    fn close(&mut self);
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port is closed")
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Option<Box<dyn SerialPortTrait>>,
}

impl RealSerialPort {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;

        Ok(RealSerialPort { port: Some(port) })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPortTrait>> {
        self.port.as_mut().ok_or_else(not_connected)
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        port.write_all(buf)?;
        port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let port = self.port()?;
        port.set_timeout(timeout).map_err(io::Error::from)?;
        port.read(buf)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.port()?.write_data_terminal_ready(level).map_err(io::Error::from)
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.port()?.write_request_to_send(level).map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port()?.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) {
        self.port = None;
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(test)]
#[derive(Default)]
pub struct MockState {
    // Data to return on reads (None = timeout, exhausted = disconnect)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // One entry per write_all call
    writes: Vec<Vec<u8>>,
    dtr: Vec<bool>,
    rts: Vec<bool>,
    input_clears: usize,
    closes: usize,
    open: bool,
}

#[cfg(test)]
pub struct MockSerialPort {
    state: Arc<Mutex<MockState>>,
}

/// Test-side view of a `MockSerialPort` that outlives the port itself
#[cfg(test)]
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState {
            read_buffer: responses,
            open: true,
            ..MockState::default()
        }));
        (MockSerialPort { state: state.clone() }, MockHandle { state })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

#[cfg(test)]
impl MockHandle {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Every byte written, in order
    pub fn written(&self) -> Vec<u8> {
        self.state().writes.concat()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    pub fn dtr_levels(&self) -> Vec<bool> {
        self.state().dtr.clone()
    }

    pub fn rts_levels(&self) -> Vec<bool> {
        self.state().rts.clone()
    }

    pub fn input_clears(&self) -> usize {
        self.state().input_clears
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    pub fn unconsumed(&self) -> usize {
        let state = self.state();
        state.read_buffer.len() - state.read_pos
    }
}

/// Script one device line, terminated the way the device prints it
#[cfg(test)]
pub fn line(text: &str) -> Vec<Option<u8>> {
    text.bytes().chain(*b"\r\n").map(Some).collect()
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        if !state.open {
            return Err(not_connected());
        }
        state.writes.push(buf.to_vec());
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let mut guard = self.state();
        let state = &mut *guard;
        if !state.open {
            return Err(not_connected());
        }

        // Out of responses = device went away
        if state.read_pos >= state.read_buffer.len() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "Mock disconnected"
            ));
        }

        // If current response is None = timeout
        if state.read_buffer[state.read_pos].is_none() {
            state.read_pos += 1;
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && state.read_pos < state.read_buffer.len() {
            match state.read_buffer[state.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    state.read_pos += 1;
                }
                None => break,  // Stop at timeout marker
            }
        }

        Ok(bytes_read)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.state().dtr.push(level);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.state().rts.push(level);
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state().input_clears += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn close(&mut self) {
        let mut state = self.state();
        if state.open {
            state.open = false;
            state.closes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_reads_stop_at_timeout_marker() {
        let mut responses = line("NEXT");
        responses.push(None);
        responses.extend(line("DONE"));
        let (mut port, handle) = MockSerialPort::new(responses);

        let mut buf = [0u8; 64];
        assert_eq!(port.read_timeout(&mut buf, READ_TIMEOUT).unwrap(), 6);
        assert_eq!(&buf[..6], b"NEXT\r\n");

        let err = port.read_timeout(&mut buf, READ_TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        assert_eq!(port.read_timeout(&mut buf, READ_TIMEOUT).unwrap(), 6);
        assert_eq!(handle.unconsumed(), 0);

        let err = port.read_timeout(&mut buf, READ_TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_mock_close_is_idempotent() {
        let (mut port, handle) = MockSerialPort::new(vec![]);
        port.write_all(b"abc").unwrap();
        port.close();
        port.close();

        assert_eq!(handle.closes(), 1);
        assert!(!handle.is_open());
        assert_eq!(port.write_all(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert_eq!(handle.written(), b"abc");
    }
}
