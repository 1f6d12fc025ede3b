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

use std::marker::PhantomData;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use log::{debug, warn};
use thiserror::Error;
use crate::clock::Clock;
use crate::connection::{ignore, Connection};
use crate::protocol::*;
use crate::report::Reporter;
use crate::serial::SerialPort;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub file: PathBuf,
    pub port: String,
    pub baud_rate: u32,
    /// Must match the receiver; it is not negotiated on the wire
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            file: PathBuf::from(DEFAULT_FILE),
            port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Outcome of a completed upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub file_size: u32,
    pub bytes_sent: u32,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{} not found", .0.display())]
    FileMissing(PathBuf),
    #[error("file is {0} bytes, larger than the 32-bit size field allows")]
    FileTooLarge(u64),
    #[error("chunk size must be at least 1 byte")]
    InvalidChunkSize,
    #[error("failed to open serial port: {0}")]
    Open(#[from] serialport::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Transfer complete")]
    TransferComplete(TransferReport),
}

// ============================================================================
// States
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Resetting,
    AwaitingHandshake,
    SizeNegotiation,
    Transferring,
    AwaitingCompletion,
    Closed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Resetting => "resetting",
            Phase::AwaitingHandshake => "awaiting handshake",
            Phase::SizeNegotiation => "size negotiation",
            Phase::Transferring => "transferring",
            Phase::AwaitingCompletion => "awaiting completion",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub trait PhaseMarker {
    const PHASE: Phase;
}

pub struct Resetting;
pub struct AwaitingHandshake;
pub struct SizeNegotiation;
pub struct Transferring;
pub struct AwaitingCompletion;
pub struct Closed;

impl PhaseMarker for Resetting { const PHASE: Phase = Phase::Resetting; }
impl PhaseMarker for AwaitingHandshake { const PHASE: Phase = Phase::AwaitingHandshake; }
impl PhaseMarker for SizeNegotiation { const PHASE: Phase = Phase::SizeNegotiation; }
impl PhaseMarker for Transferring { const PHASE: Phase = Phase::Transferring; }
impl PhaseMarker for AwaitingCompletion { const PHASE: Phase = Phase::AwaitingCompletion; }
impl PhaseMarker for Closed { const PHASE: Phase = Phase::Closed; }

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SessionFsm<State> {
    state: PhantomData<State>,
    conn: Connection,
    file: File,
    file_size: u32,
    bytes_sent: u32,
    chunk: Vec<u8>,
    clock: Box<dyn Clock>,
    reporter: Box<dyn Reporter>,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SessionState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn SessionState>, SessionError>;

    fn phase(&self) -> Phase;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S: PhaseMarker> SessionFsm<S> {
    fn transition<T: PhaseMarker>(self) -> Box<SessionFsm<T>> {
        debug!("Phase: {} -> {}", S::PHASE, T::PHASE);
        Box::new(SessionFsm {
            state: PhantomData,
            conn: self.conn,
            file: self.file,
            file_size: self.file_size,
            bytes_sent: self.bytes_sent,
            chunk: self.chunk,
            clock: self.clock,
            reporter: self.reporter,
        })
    }

    fn io_error(&self, e: io::Error) -> SessionError {
        SessionError::Io(io::Error::new(
            e.kind(),
            format!("{} (in phase: {})", e, S::PHASE)
        ))
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SessionFsm<Resetting> {
    /// Both control lines low, then a DTR pulse reboots the device
    fn pulse_reset(&mut self) -> io::Result<()> {
        self.conn.set_dtr(false)?;
        self.conn.set_rts(false)?;
        self.conn.set_dtr(true)?;
        self.clock.sleep(RESET_PULSE);
        self.conn.set_dtr(false)?;
        self.clock.sleep(SETTLE_TIME);
        Ok(())
    }
}

impl SessionState for SessionFsm<Resetting> {
    fn step(self: Box<Self>) -> Result<Box<dyn SessionState>, SessionError> {
        let mut fsm = *self;
        fsm.reporter.status("Resetting device...");

        match fsm.pulse_reset() {
            Ok(()) => Ok(fsm.transition::<AwaitingHandshake>() as Box<dyn SessionState>),
            Err(e) => Err(fsm.io_error(e)),
        }
    }

    fn phase(&self) -> Phase {
        Resetting::PHASE
    }
}

impl SessionState for SessionFsm<AwaitingHandshake> {
    fn step(self: Box<Self>) -> Result<Box<dyn SessionState>, SessionError> {
        let mut fsm = *self;
        fsm.reporter.status("Waiting for handshake...");
        if let Err(e) = fsm.conn.clear_input() {
            return Err(fsm.io_error(e));
        }

        let clock = &fsm.clock;
        let reporter = &mut fsm.reporter;
        let mut last_note = clock.now();

        // A FILE_MISSING notice takes precedence over READY_TO_RECEIVE on the same line
        let ready = Token::ContainsUnless(READY_TO_RECEIVE, FILE_MISSING);
        let result = fsm.conn.wait_for(ready, POLL_INTERVAL, |conn, line| {
            match line {
                Some(line) if line.contains(FILE_MISSING) => {
                    reporter.status("Handshake: sending start command...");
                    conn.write_all(START_UPLOAD)?;
                    clock.sleep(START_BACKOFF);
                }
                Some(_) => {}
                None => clock.sleep(POLL_INTERVAL),
            }

            // There is no overall handshake timeout
            if clock.now().duration_since(last_note) > STATUS_INTERVAL {
                reporter.status("...still waiting for device (formatting its filesystem can take 60s+)...");
                last_note = clock.now();
            }
            Ok(())
        });

        match result {
            Ok(_) => {
                fsm.reporter.status("Handshake: connected!");
                Ok(fsm.transition::<SizeNegotiation>() as Box<dyn SessionState>)
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }

    fn phase(&self) -> Phase {
        AwaitingHandshake::PHASE
    }
}

impl SessionState for SessionFsm<SizeNegotiation> {
    fn step(self: Box<Self>) -> Result<Box<dyn SessionState>, SessionError> {
        let mut fsm = *self;
        fsm.reporter.status("Sending file size...");

        if let Err(e) = fsm.conn.write_all(&encode_size(fsm.file_size)) {
            return Err(fsm.io_error(e));
        }

        let ack = match fsm.conn.wait_for(Token::Contains(SIZE_ACK), READ_TIMEOUT, ignore) {
            Ok(line) => line,
            Err(e) => return Err(fsm.io_error(e)),
        };

        // Informational only; the transfer proceeds whatever the device reports
        match parse_size_ack(&ack) {
            Some(size) if size != fsm.file_size => {
                warn!("Device acknowledged {} bytes, sending {}", size, fsm.file_size);
            }
            _ => {}
        }

        fsm.reporter.status(&format!("Device confirmed size: {}", ack));
        fsm.reporter.status("Starting transfer...");
        Ok(fsm.transition::<Transferring>() as Box<dyn SessionState>)
    }

    fn phase(&self) -> Phase {
        SizeNegotiation::PHASE
    }
}

impl SessionState for SessionFsm<Transferring> {
    fn step(self: Box<Self>) -> Result<Box<dyn SessionState>, SessionError> {
        let mut fsm = *self;

        if fsm.bytes_sent >= fsm.file_size {
            return Ok(fsm.transition::<AwaitingCompletion>() as Box<dyn SessionState>);
        }

        // The device has no other backpressure: never send before its NEXT
        if let Err(e) = fsm.conn.wait_for(Token::Exact(NEXT), READ_TIMEOUT, ignore) {
            return Err(fsm.io_error(e));
        }

        let remaining = (fsm.file_size - fsm.bytes_sent) as usize;
        let limit = fsm.chunk.len().min(remaining);
        let bytes_read = read_chunk(&mut fsm.file, &mut fsm.chunk[..limit])?;

        if bytes_read == 0 {
            warn!(
                "Source file ended after {} of {} bytes",
                fsm.bytes_sent, fsm.file_size
            );
            return Ok(fsm.transition::<AwaitingCompletion>() as Box<dyn SessionState>);
        }

        if let Err(e) = fsm.conn.write_all(&fsm.chunk[..bytes_read]) {
            return Err(fsm.io_error(e));
        }
        fsm.bytes_sent += bytes_read as u32;
        fsm.reporter.progress(fsm.bytes_sent, fsm.file_size);

        Ok(Box::new(fsm) as Box<dyn SessionState>)
    }

    fn phase(&self) -> Phase {
        Transferring::PHASE
    }
}

impl SessionState for SessionFsm<AwaitingCompletion> {
    fn step(self: Box<Self>) -> Result<Box<dyn SessionState>, SessionError> {
        let mut fsm = *self;
        fsm.reporter.status("Waiting for verification...");

        match fsm.conn.wait_for(Token::Exact(DONE), READ_TIMEOUT, ignore) {
            Ok(_) => {
                fsm.reporter.status("Success! Device is restarting.");
                Ok(fsm.transition::<Closed>() as Box<dyn SessionState>)
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }

    fn phase(&self) -> Phase {
        AwaitingCompletion::PHASE
    }
}

impl SessionState for SessionFsm<Closed> {
    fn step(self: Box<Self>) -> Result<Box<dyn SessionState>, SessionError> {
        let mut fsm = *self;
        fsm.conn.close();
        Err(SessionError::TransferComplete(TransferReport {
            file_size: fsm.file_size,
            bytes_sent: fsm.bytes_sent,
        }))
    }

    fn phase(&self) -> Phase {
        Closed::PHASE
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl SessionFsm<Resetting> {
    pub fn new(
        conn: Connection,
        file: File,
        file_size: u32,
        chunk_size: usize,
        clock: Box<dyn Clock>,
        reporter: Box<dyn Reporter>,
    ) -> Self {
        SessionFsm {
            state: PhantomData::<Resetting>,
            conn,
            file,
            file_size,
            bytes_sent: 0,
            chunk: vec![0; chunk_size],
            clock,
            reporter,
        }
    }
}

/// Upload `config.file` to the device.
///
/// The source file is checked and opened before `connect` is called, so a
/// missing file never touches the port. Once connected, the port is closed
/// exactly once whichever phase the session ends in.
pub fn run<C>(
    config: &TransferConfig,
    connect: C,
    clock: Box<dyn Clock>,
    mut reporter: Box<dyn Reporter>,
) -> Result<TransferReport, SessionError>
where
    C: FnOnce(&TransferConfig) -> Result<Box<dyn SerialPort>, SessionError>,
{
    if config.chunk_size == 0 {
        return Err(SessionError::InvalidChunkSize);
    }

    if !config.file.is_file() {
        return Err(SessionError::FileMissing(config.file.clone()));
    }

    let file = File::open(&config.file)?;
    let len = file.metadata()?.len();
    let file_size = u32::try_from(len).map_err(|_| SessionError::FileTooLarge(len))?;
    reporter.status(&format!("Found file: {} ({} bytes)", config.file.display(), file_size));

    reporter.status(&format!("Opening serial port: {} ({} baud)", config.port, config.baud_rate));
    let conn = Connection::new(connect(config)?);
    let mut state: Box<dyn SessionState> = Box::new(SessionFsm::new(
        conn,
        file,
        file_size,
        config.chunk_size,
        clock,
        reporter,
    ));

    loop {
        let phase = state.phase();
        match state.step() {
            Ok(next_state) => {
                state = next_state;
            }
            Err(SessionError::TransferComplete(report)) => {
                return Ok(report);
            }
            Err(e) => {
                debug!("Session failed while {}: {}", phase, e);
                return Err(e);
            }
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Fill `buf` from `reader`, stopping early only at end of file
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use tempfile::NamedTempFile;
    use crate::clock::MockClock;
    use crate::report::RecordingReporter;
    use crate::serial::{line, MockHandle, MockSerialPort};

    struct Outcome {
        result: Result<TransferReport, SessionError>,
        port: MockHandle,
        clock: MockClock,
        reporter: RecordingReporter,
    }

    fn source_file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn config_for(path: &Path, chunk_size: usize) -> TransferConfig {
        TransferConfig {
            file: path.to_path_buf(),
            chunk_size,
            ..TransferConfig::default()
        }
    }

    /// A well-behaved device: optional FILE_MISSING notices, then the
    /// handshake, size ack, `nexts` chunk requests and DONE
    fn device_script(missing: usize, size: u32, nexts: usize) -> Vec<Option<u8>> {
        let mut responses = Vec::new();
        for _ in 0..missing {
            responses.extend(line(FILE_MISSING));
        }
        responses.extend(line(READY_TO_RECEIVE));
        responses.extend(line(&format!("SIZE:{}", size)));
        for _ in 0..nexts {
            responses.extend(line(NEXT));
        }
        responses.extend(line(DONE));
        responses
    }

    fn run_mock(config: &TransferConfig, responses: Vec<Option<u8>>) -> Outcome {
        let (port, handle) = MockSerialPort::new(responses);
        let clock = MockClock::new();
        let reporter = RecordingReporter::new();

        let result = run(
            config,
            move |_| Ok(Box::new(port) as Box<dyn SerialPort>),
            Box::new(clock.clone()),
            Box::new(reporter.clone()),
        );

        Outcome { result, port: handle, clock, reporter }
    }

    fn drive(mut state: Box<dyn SessionState>) -> Result<TransferReport, SessionError> {
        loop {
            match state.step() {
                Ok(next) => state = next,
                Err(SessionError::TransferComplete(report)) => return Ok(report),
                Err(e) => return Err(e),
            }
        }
    }

    #[test]
    fn test_full_transfer_in_chunks() {
        let content = pattern(2500);
        let source = source_file(&content);
        let config = config_for(source.path(), 1024);

        let outcome = run_mock(&config, device_script(0, 2500, 3));

        let report = outcome.result.expect("transfer should succeed");
        assert_eq!(report, TransferReport { file_size: 2500, bytes_sent: 2500 });

        let writes = outcome.port.writes();
        assert_eq!(writes[0], encode_size(2500));
        let chunk_sizes: Vec<usize> = writes[1..].iter().map(Vec::len).collect();
        assert_eq!(chunk_sizes, vec![1024, 1024, 452]);
        assert_eq!(writes[1..].concat(), content);

        assert_eq!(outcome.port.unconsumed(), 0);
        assert_eq!(outcome.port.closes(), 1);
        assert!(!outcome.port.is_open());
    }

    #[test]
    fn test_chunk_count_matches_next_requests() {
        for &(size, chunk_size) in &[(1usize, 1usize), (1023, 1024), (1024, 1024), (1025, 1024), (5000, 7), (4096, 512)] {
            let content = pattern(size);
            let source = source_file(&content);
            let config = config_for(source.path(), chunk_size);
            let nexts = size.div_ceil(chunk_size);

            let outcome = run_mock(&config, device_script(0, size as u32, nexts));

            let report = outcome.result.expect("transfer should succeed");
            assert_eq!(report.bytes_sent as usize, size);
            assert_eq!(outcome.port.writes().len(), 1 + nexts, "size {} chunk {}", size, chunk_size);
            assert_eq!(outcome.port.written()[4..], content[..]);
            assert_eq!(outcome.port.unconsumed(), 0);
        }
    }

    #[test]
    fn test_start_command_sent_per_file_missing() {
        for missing in [0, 1, 3] {
            let source = source_file(b"gif!");
            let config = config_for(source.path(), 1024);

            let outcome = run_mock(&config, device_script(missing, 4, 1));
            outcome.result.expect("transfer should succeed");

            let writes = outcome.port.writes();
            let starts = writes.iter().filter(|w| w.as_slice() == START_UPLOAD).count();
            assert_eq!(starts, missing);
            assert_eq!(writes[missing], encode_size(4));
            assert_eq!(outcome.reporter.count_status("sending start command"), missing);
            assert_eq!(outcome.reporter.count_status("connected"), 1);
            assert_eq!(outcome.clock.elapsed(), RESET_PULSE + SETTLE_TIME + START_BACKOFF * missing as u32);
        }
    }

    #[test]
    fn test_file_missing_wins_over_ready_on_same_line() {
        let source = source_file(b"gif!");
        let config = config_for(source.path(), 1024);

        let mut responses = line("FILE_MISSING (READY_TO_RECEIVE after START_UPLOAD)");
        responses.extend(device_script(0, 4, 1));

        let outcome = run_mock(&config, responses);
        outcome.result.expect("transfer should succeed");

        let writes = outcome.port.writes();
        assert_eq!(writes[0], START_UPLOAD);
        assert_eq!(writes[1], encode_size(4));
        assert_eq!(writes[2], b"gif!");
        assert_eq!(outcome.reporter.count_status("sending start command"), 1);
        assert_eq!(outcome.port.unconsumed(), 0);
    }

    #[test]
    fn test_reset_pulses_dtr_and_waits_for_boot() {
        let source = source_file(b"x");
        let config = config_for(source.path(), 1024);

        let outcome = run_mock(&config, device_script(0, 1, 1));
        outcome.result.expect("transfer should succeed");

        assert_eq!(outcome.port.dtr_levels(), vec![false, true, false]);
        assert_eq!(outcome.port.rts_levels(), vec![false]);
        assert_eq!(outcome.port.input_clears(), 1);
        assert_eq!(outcome.clock.elapsed(), RESET_PULSE + SETTLE_TIME);
    }

    #[test]
    fn test_handshake_prints_status_while_device_is_quiet() {
        let source = source_file(b"abc");
        let config = config_for(source.path(), 1024);

        // 11 seconds of silence at the handshake poll interval
        let mut responses = vec![None; 1100];
        responses.extend(device_script(0, 3, 1));

        let outcome = run_mock(&config, responses);
        outcome.result.expect("transfer should succeed");

        assert_eq!(outcome.reporter.count_status("still waiting"), 2);
        assert_eq!(outcome.port.unconsumed(), 0);
    }

    #[test]
    fn test_missing_file_never_opens_port() {
        let config = config_for(Path::new("/nonexistent/data/eye.gif"), 1024);
        let mut connected = false;

        let result = run(
            &config,
            |_| {
                connected = true;
                Err(SessionError::InvalidChunkSize)
            },
            Box::new(MockClock::new()),
            Box::new(RecordingReporter::new()),
        );

        assert!(matches!(result, Err(SessionError::FileMissing(_))));
        assert!(!connected);
    }

    #[test]
    fn test_open_failure_is_reported() {
        let source = source_file(b"abc");
        let config = config_for(source.path(), 1024);
        let reporter = RecordingReporter::new();

        let result = run(
            &config,
            |_| Err(serialport::Error::new(serialport::ErrorKind::NoDevice, "no such port").into()),
            Box::new(MockClock::new()),
            Box::new(reporter.clone()),
        );

        let err = result.unwrap_err();
        assert!(matches!(err, SessionError::Open(_)));
        assert!(err.to_string().contains("no such port"));
        assert_eq!(reporter.count_status("Found file"), 1);
        assert_eq!(reporter.count_status("Opening serial port: /dev/ttyACM0 (115200 baud)"), 1);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let source = source_file(b"abc");
        let config = config_for(source.path(), 0);

        let outcome = run_mock(&config, vec![]);

        assert!(matches!(outcome.result, Err(SessionError::InvalidChunkSize)));
        assert!(outcome.port.writes().is_empty());
    }

    #[test]
    fn test_disconnect_mid_transfer_closes_port() {
        let content = pattern(2500);
        let source = source_file(&content);
        let config = config_for(source.path(), 1024);

        let mut responses = line(READY_TO_RECEIVE);
        responses.extend(line("SIZE:2500"));
        responses.extend(line(NEXT));

        let outcome = run_mock(&config, responses);

        let err = outcome.result.unwrap_err();
        match &err {
            SessionError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("transferring"));

        // The second chunk is never sent without its NEXT
        let writes = outcome.port.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1], content[..1024]);

        assert_eq!(outcome.port.closes(), 1);
        assert!(!outcome.port.is_open());
    }

    #[test]
    fn test_disconnect_during_handshake_closes_port() {
        let source = source_file(b"abc");
        let config = config_for(source.path(), 1024);

        let outcome = run_mock(&config, line(FILE_MISSING));

        let err = outcome.result.unwrap_err();
        assert!(err.to_string().contains("awaiting handshake"));
        assert_eq!(outcome.port.writes(), vec![START_UPLOAD.to_vec()]);
        assert_eq!(outcome.port.closes(), 1);
    }

    #[test]
    fn test_other_lines_ignored_while_waiting() {
        let content = pattern(300);
        let source = source_file(&content);
        let config = config_for(source.path(), 256);

        let mut responses = line("Formatting...");
        responses.extend(line(READY_TO_RECEIVE));
        responses.extend(line("SIZ"));
        responses.push(None);
        responses.extend(line("SIZE:300"));
        responses.extend(line("NEXT please"));
        responses.extend(line(""));
        responses.push(None);
        responses.extend(line(NEXT));
        responses.extend(line("Wrote 256 bytes"));
        responses.extend(line(NEXT));
        responses.extend(line("verifying"));
        responses.push(None);
        responses.extend(line(DONE));

        let outcome = run_mock(&config, responses);

        assert_eq!(outcome.result.unwrap().bytes_sent, 300);
        assert_eq!(outcome.port.written()[4..], content[..]);
        assert_eq!(outcome.port.unconsumed(), 0);
    }

    #[test]
    fn test_size_ack_value_is_not_enforced() {
        let source = source_file(&pattern(10));
        let config = config_for(source.path(), 1024);

        let mut responses = line(READY_TO_RECEIVE);
        responses.extend(line("SIZE:999"));
        responses.extend(line(NEXT));
        responses.extend(line(DONE));

        let outcome = run_mock(&config, responses);

        assert_eq!(outcome.result.unwrap().bytes_sent, 10);
        assert_eq!(outcome.reporter.count_status("Device confirmed size: SIZE:999"), 1);
    }

    #[test]
    fn test_progress_is_monotonic_and_reaches_100() {
        let source = source_file(&pattern(2500));
        let config = config_for(source.path(), 1024);

        let outcome = run_mock(&config, device_script(0, 2500, 3));
        outcome.result.expect("transfer should succeed");

        let progress = outcome.reporter.progress_values();
        assert_eq!(progress.len(), 3);
        assert!(progress[0] > 0.0);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*progress.last().unwrap(), 100.0);
    }

    #[test]
    fn test_empty_file_skips_chunk_loop() {
        let source = source_file(b"");
        let config = config_for(source.path(), 1024);

        let outcome = run_mock(&config, device_script(0, 0, 0));

        assert_eq!(outcome.result.unwrap(), TransferReport { file_size: 0, bytes_sent: 0 });
        assert_eq!(outcome.port.writes(), vec![encode_size(0).to_vec()]);
        assert!(outcome.reporter.progress_values().is_empty());
    }

    #[test]
    fn test_phases_advance_in_order() {
        let source = source_file(&pattern(2500));
        let (port, handle) = MockSerialPort::new(device_script(0, 2500, 3));
        let fsm = SessionFsm::new(
            Connection::new(Box::new(port)),
            File::open(source.path()).unwrap(),
            2500,
            1024,
            Box::new(MockClock::new()),
            Box::new(RecordingReporter::new()),
        );

        let mut phases = Vec::new();
        let mut state: Box<dyn SessionState> = Box::new(fsm);
        loop {
            phases.push(state.phase());
            match state.step() {
                Ok(next) => state = next,
                Err(SessionError::TransferComplete(_)) => break,
                Err(e) => panic!("Transfer failed: {:?}", e),
            }
        }

        assert_eq!(
            phases,
            vec![
                Phase::Resetting,
                Phase::AwaitingHandshake,
                Phase::SizeNegotiation,
                Phase::Transferring,
                Phase::Transferring,
                Phase::Transferring,
                Phase::Transferring,
                Phase::AwaitingCompletion,
                Phase::Closed,
            ]
        );
        assert_eq!(handle.closes(), 1);
    }

    #[test]
    fn test_short_file_ends_chunk_loop_early() {
        let content = pattern(100);
        let source = source_file(&content);

        let mut responses = line(NEXT);
        responses.extend(line(NEXT));
        responses.extend(line(DONE));
        let (port, handle) = MockSerialPort::new(responses);
        let reporter = RecordingReporter::new();

        // Declared size larger than what the file actually holds
        let fsm = SessionFsm::new(
            Connection::new(Box::new(port)),
            File::open(source.path()).unwrap(),
            300,
            128,
            Box::new(MockClock::new()),
            Box::new(reporter.clone()),
        )
        .transition::<Transferring>();

        let report = drive(fsm).expect("short file is not an error");

        assert_eq!(report, TransferReport { file_size: 300, bytes_sent: 100 });
        assert_eq!(handle.writes(), vec![content]);
        assert_eq!(handle.unconsumed(), 0);
        assert_eq!(reporter.count_status("Success"), 1);
        assert_eq!(handle.closes(), 1);
    }

    #[test]
    fn test_chunks_stop_at_declared_size() {
        let content = pattern(3000);
        let source = source_file(&content);

        let mut responses = Vec::new();
        for _ in 0..3 {
            responses.extend(line(NEXT));
        }
        responses.extend(line(DONE));
        let (port, handle) = MockSerialPort::new(responses);

        // File grew after its size was declared
        let fsm = SessionFsm::new(
            Connection::new(Box::new(port)),
            File::open(source.path()).unwrap(),
            2500,
            1024,
            Box::new(MockClock::new()),
            Box::new(RecordingReporter::new()),
        )
        .transition::<Transferring>();

        let report = drive(fsm).expect("transfer should succeed");

        assert_eq!(report.bytes_sent, 2500);
        assert_eq!(handle.written(), content[..2500]);
    }

    #[test]
    fn test_read_chunk_fills_across_short_reads() {
        let mut reader = io::Cursor::new(vec![1u8; 5]).chain(io::Cursor::new(vec![2u8; 5]));
        let mut buf = [0u8; 8];

        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), 8);
        assert_eq!(buf, [1, 1, 1, 1, 1, 2, 2, 2]);
        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), 2);
        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_error_messages() {
        let err = SessionError::FileMissing(PathBuf::from("data/eye.gif"));
        assert_eq!(err.to_string(), "data/eye.gif not found");

        let err = SessionError::FileTooLarge(5_000_000_000);
        assert!(err.to_string().contains("5000000000"));
    }
}
