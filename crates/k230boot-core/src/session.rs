//! Protocol state machine
//!
//! A [`Session`] owns a [`Transport`] and walks the ROM through
//!
//! ```text
//! Disconnected -> Handshaking -> Identified -> Staging(n) -> Executing -> Done
//! ```
//!
//! Any failure other than a wrong-state call moves the session to the
//! terminal `Faulted` state. Exactly one command is in flight at a time and
//! every transfer carries its own timeout.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::chip::{ChipIdentity, ProtocolVersion, MASK_ROM_BASE};
use crate::error::{ProtocolError, Result, TransportError};
use crate::frame::{self, Opcode, ResponseFrame, Status, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::plan::Region;
use crate::progress::BootProgress;
use crate::sequencer::{Chunk, StageWrite, WritePlan};
use crate::transport::{Transport, REQUEST_RESYNC};

/// Receive buffer for a single response frame
const RESPONSE_BUF_LEN: usize = 512;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No exchange has happened yet
    Disconnected,
    /// The ROM answered the handshake
    Handshaking,
    /// The chip has been identified
    Identified,
    /// Writing the stage with this index
    Staging(usize),
    /// Execution is being handed off
    Executing,
    /// Boot finished
    Done,
    /// A fatal error occurred
    Faulted,
}

impl SessionState {
    /// Whether no further operation is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Faulted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => f.write_str("disconnected"),
            SessionState::Handshaking => f.write_str("handshaking"),
            SessionState::Identified => f.write_str("identified"),
            SessionState::Staging(n) => write!(f, "staging #{}", n),
            SessionState::Executing => f.write_str("executing"),
            SessionState::Done => f.write_str("done"),
            SessionState::Faulted => f.write_str("faulted"),
        }
    }
}

/// Cooperative cancellation flag
///
/// Checked between commands, never in the middle of one.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an unset token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Timeouts, retry bounds and chunking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Per-transfer timeout for handshake commands
    pub handshake_timeout: Duration,
    /// Handshake commands sent before giving up
    pub handshake_attempts: u32,
    /// Linear backoff unit between handshake attempts
    pub handshake_backoff: Duration,
    /// Per-transfer timeout for ReadInfo and FlushCaches
    pub command_timeout: Duration,
    /// Attempts for ReadInfo and FlushCaches
    pub command_attempts: u32,
    /// Per-transfer timeout for WriteMemory
    pub write_timeout: Duration,
    /// Attempts per chunk
    pub write_attempts: u32,
    /// Time allowed for a called stage (DRAM training) to return
    pub call_timeout: Duration,
    /// Preferred chunk payload size
    pub chunk_size: usize,
    /// Issue FlushCaches before Execute
    pub flush_before_execute: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(500),
            handshake_attempts: 3,
            handshake_backoff: Duration::from_millis(100),
            command_timeout: Duration::from_secs(1),
            command_attempts: 3,
            write_timeout: Duration::from_secs(5),
            write_attempts: 3,
            call_timeout: Duration::from_secs(5),
            chunk_size: 4096,
            flush_before_execute: true,
        }
    }
}

impl SessionConfig {
    /// Effective chunk size for a transport with the given largest transfer
    pub fn chunk_size_for(&self, max_transfer: usize) -> usize {
        self.chunk_size
            .min(max_transfer.saturating_sub(HEADER_LEN))
            .min(MAX_PAYLOAD_LEN)
    }
}

/// Outcome of a completed boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Identified chip
    pub chip: ChipIdentity,
    /// Negotiated protocol version
    pub protocol: ProtocolVersion,
    /// Stages fully written
    pub stages_completed: usize,
    /// Payload bytes acknowledged by the ROM
    pub bytes_written: usize,
    /// Address execution was handed to
    pub entry: Option<u32>,
}

/// A boot session with one device
pub struct Session<T: Transport> {
    transport: T,
    config: SessionConfig,
    state: SessionState,
    protocol: Option<ProtocolVersion>,
    chip: Option<ChipIdentity>,
    cancel: CancelToken,
    stages_completed: usize,
    bytes_written: usize,
    entry: Option<u32>,
}

impl<T: Transport> Session<T> {
    /// Create a session over an opened transport
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Disconnected,
            protocol: None,
            chip: None,
            cancel: CancelToken::new(),
            stages_completed: 0,
            bytes_written: 0,
            entry: None,
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle that cancels this session
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identified chip, once known
    pub fn chip(&self) -> Option<&ChipIdentity> {
        self.chip.as_ref()
    }

    /// Negotiated protocol version, once known
    pub fn protocol(&self) -> Option<ProtocolVersion> {
        self.protocol
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Borrow the transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the session, returning the transport
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Chunk size that fits this session's transport
    pub fn chunk_size(&self) -> usize {
        self.config
            .chunk_size_for(self.transport.max_transfer_size())
    }

    /// Summary of what the session has done so far
    ///
    /// Available once the chip has been identified.
    pub fn summary(&self) -> Option<SessionSummary> {
        Some(SessionSummary {
            chip: self.chip.clone()?,
            protocol: self.protocol?,
            stages_completed: self.stages_completed,
            bytes_written: self.bytes_written,
            entry: self.entry,
        })
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Open the session
    ///
    /// Sends up to `handshake_attempts` handshake commands, backing off
    /// linearly between them.
    pub fn handshake(&mut self) -> Result<ProtocolVersion> {
        self.require(self.state == SessionState::Disconnected, "handshake")?;
        let result = self.do_handshake();
        self.settle(result)
    }

    /// Read and check the chip identity
    pub fn identify(&mut self) -> Result<ChipIdentity> {
        self.require(self.state == SessionState::Handshaking, "identify")?;
        let result = self.do_identify();
        self.settle(result)
    }

    /// Write every stage of a plan in order
    pub fn stage<P: BootProgress + ?Sized>(
        &mut self,
        plan: &WritePlan,
        progress: &mut P,
    ) -> Result<()> {
        self.require(self.state == SessionState::Identified, "stage")?;
        let result = self.do_stage(plan, progress);
        self.settle(result)
    }

    /// Write a single buffer to SRAM at `address`
    pub fn load<P: BootProgress + ?Sized>(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut P,
    ) -> Result<()> {
        self.require(self.can_stage(), "load")?;
        let region = match load_region(address, data.len()) {
            Ok(region) => region,
            Err(e) => return self.settle(Err(e)),
        };
        let index = self.stages_completed;
        self.state = SessionState::Staging(index);
        let stage = StageWrite::new("load", region, data.to_vec());
        let chunk_size = self.chunk_size();
        let result = self.write_stage(index, &stage, chunk_size, progress);
        self.settle(result)
    }

    /// Hand off execution at `entry`
    ///
    /// The ROM never answers an Execute command, so the session is `Done` as
    /// soon as the frame has been sent.
    pub fn execute(&mut self, entry: u32) -> Result<()> {
        self.require(self.can_stage(), "execute")?;
        let flush = self.config.flush_before_execute;
        let result = self.do_execute(entry, flush);
        self.settle(result)
    }

    /// Jump back into the mask ROM loader
    pub fn return_to_rom(&mut self) -> Result<()> {
        self.require(self.can_stage(), "return to ROM")?;
        let result = self.do_execute(MASK_ROM_BASE, false);
        self.settle(result)
    }

    /// End a session that loads without executing
    pub fn finish(&mut self) -> Result<()> {
        self.require(self.can_stage(), "finish")?;
        self.state = SessionState::Done;
        Ok(())
    }

    /// Run a whole boot: handshake, identify, stage, execute
    pub fn run<P: BootProgress + ?Sized>(
        &mut self,
        plan: &WritePlan,
        progress: &mut P,
    ) -> Result<SessionSummary> {
        self.handshake()?;
        progress.state_changed(self.state);
        self.identify()?;
        progress.state_changed(self.state);

        self.stage(plan, progress)?;

        match plan.entry {
            Some(entry) => self.execute(entry)?,
            None => self.finish()?,
        }
        progress.state_changed(self.state);

        let summary = self.summary().ok_or(ProtocolError::InvalidState {
            state: self.state,
            operation: "summary",
        })?;
        log::info!(
            "Boot complete: {} stage(s), {} bytes written",
            summary.stages_completed,
            summary.bytes_written
        );
        progress.complete(&summary);
        Ok(summary)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn require(&self, ok: bool, operation: &'static str) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(ProtocolError::InvalidState {
                state: self.state,
                operation,
            })
        }
    }

    fn can_stage(&self) -> bool {
        matches!(
            self.state,
            SessionState::Identified | SessionState::Staging(_)
        )
    }

    fn settle<R>(&mut self, result: Result<R>) -> Result<R> {
        result.map_err(|e| {
            log::error!("Session faulted in state {}: {}", self.state, e);
            self.state = SessionState::Faulted;
            e
        })
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        Ok(())
    }

    fn do_handshake(&mut self) -> Result<ProtocolVersion> {
        self.check_cancel()?;
        self.state = SessionState::Handshaking;

        let attempts = self.config.handshake_attempts.max(1);
        let mut last = ProtocolError::Transport(TransportError::Timeout);
        for attempt in 1..=attempts {
            if attempt > 1 {
                let wait = self.config.handshake_backoff * (attempt - 1);
                self.transport.delay(wait);
            }

            let timeout = self.config.handshake_timeout;
            let result = self
                .exchange(Opcode::Handshake, 0, &[], timeout)
                .and_then(|response| ProtocolVersion::from_handshake(&response.payload));
            match result {
                Ok(version) => {
                    log::debug!("ROM protocol version {}", version);
                    self.protocol = Some(version);
                    return Ok(version);
                }
                Err(e) if handshake_retryable(&e) => {
                    log::warn!("Handshake attempt {}/{} failed: {}", attempt, attempts, e);
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ProtocolError::HandshakeFailed {
            attempts,
            last: Box::new(last),
        })
    }

    fn do_identify(&mut self) -> Result<ChipIdentity> {
        self.check_cancel()?;
        let timeout = self.config.command_timeout;
        let attempts = self.config.command_attempts;
        let response = self.command(Opcode::ReadInfo, 0, &[], timeout, attempts)?;
        let chip = ChipIdentity::parse(&response.payload)?;
        log::info!("Found {} ({})", chip.family, chip);
        self.chip = Some(chip.clone());
        self.state = SessionState::Identified;
        Ok(chip)
    }

    fn do_stage<P: BootProgress + ?Sized>(
        &mut self,
        plan: &WritePlan,
        progress: &mut P,
    ) -> Result<()> {
        for (index, stage) in plan.stages.iter().enumerate() {
            self.check_cancel()?;
            self.state = SessionState::Staging(index);
            progress.state_changed(self.state);
            self.write_stage(index, stage, plan.chunk_size, progress)?;
        }
        Ok(())
    }

    fn write_stage<P: BootProgress + ?Sized>(
        &mut self,
        index: usize,
        stage: &StageWrite,
        chunk_size: usize,
        progress: &mut P,
    ) -> Result<()> {
        let max = self
            .transport
            .max_transfer_size()
            .saturating_sub(HEADER_LEN)
            .min(MAX_PAYLOAD_LEN);
        let total = stage.len();

        log::info!(
            "Writing stage '{}': {} bytes to {} at 0x{:08X}",
            stage.name,
            total,
            stage.region.kind,
            stage.region.base
        );
        progress.stage_started(index, stage);

        let mut written = 0;
        for chunk in stage.chunks(chunk_size) {
            self.check_cancel()?;
            if chunk.data.len() > max {
                return Err(ProtocolError::ChunkTooLarge {
                    len: chunk.data.len(),
                    max,
                });
            }
            self.write_chunk(&stage.name, &chunk)
                .map_err(|e| locate(stage, chunk.offset, e))?;
            written += chunk.data.len();
            self.bytes_written += chunk.data.len();
            progress.stage_progress(index, written, total);
        }

        if stage.call_after_write {
            self.check_cancel()?;
            log::info!(
                "Running '{}' at 0x{:08X} to bring up DRAM",
                stage.name,
                stage.region.base
            );
            let timeout = self.config.call_timeout;
            // Not retried: a second call would re-run the training code
            self.command(Opcode::Call, stage.region.base, &[], timeout, 1)
                .map_err(|e| locate(stage, total, e))?;
        }

        self.stages_completed += 1;
        progress.stage_completed(index, stage);
        Ok(())
    }

    fn write_chunk(&mut self, stage: &str, chunk: &Chunk<'_>) -> Result<()> {
        let expected = frame::crc32(chunk.data);
        let attempts = self.config.write_attempts.max(1);
        let mut last = ProtocolError::DeviceChecksum;

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.resync(chunk.address)?;
            }
            match self.try_write(chunk, expected) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    log::warn!(
                        "Write of '{}' at 0x{:08X} failed (attempt {}/{}): {}",
                        stage,
                        chunk.address,
                        attempt,
                        attempts,
                        e
                    );
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ProtocolError::WriteFailed {
            stage: stage.to_string(),
            offset: chunk.offset,
            address: chunk.address,
            attempts,
            last: Box::new(last),
        })
    }

    fn try_write(&mut self, chunk: &Chunk<'_>, expected: u32) -> Result<()> {
        let timeout = self.config.write_timeout;
        let response = self.exchange(Opcode::WriteMemory, chunk.address, chunk.data, timeout)?;
        // An OK ack without its CRC echo is a partial acknowledgment
        let reported = match response.payload.get(..4) {
            Some(&[b0, b1, b2, b3]) => u32::from_le_bytes([b0, b1, b2, b3]),
            _ => {
                return Err(ProtocolError::UnexpectedResponse {
                    command: Opcode::WriteMemory,
                    opcode: response.opcode,
                    status: response.status,
                    address: response.address,
                })
            }
        };
        if reported != expected {
            return Err(ProtocolError::EchoMismatch { expected, reported });
        }
        Ok(())
    }

    fn do_execute(&mut self, entry: u32, flush: bool) -> Result<()> {
        self.check_cancel()?;
        if flush {
            log::debug!("Flushing caches");
            let timeout = self.config.command_timeout;
            let attempts = self.config.command_attempts;
            self.command(Opcode::FlushCaches, 0, &[], timeout, attempts)?;
        }

        self.state = SessionState::Executing;
        log::info!("Jumping to 0x{:08X}", entry);
        let request = frame::encode(Opcode::Execute, entry, &[])?;
        self.transport
            .bulk_out(&request, self.config.command_timeout)?;

        self.entry = Some(entry);
        self.state = SessionState::Done;
        Ok(())
    }

    /// Send a command, re-sending on damaged frames
    fn command(
        &mut self,
        opcode: Opcode,
        address: u32,
        payload: &[u8],
        timeout: Duration,
        attempts: u32,
    ) -> Result<ResponseFrame> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.exchange(opcode, address, payload, timeout) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    log::warn!(
                        "{} failed (attempt {}/{}): {}",
                        opcode,
                        attempt,
                        attempts,
                        e
                    );
                    self.resync(address)?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One request/response round trip
    fn exchange(
        &mut self,
        opcode: Opcode,
        address: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<ResponseFrame> {
        let request = frame::encode(opcode, address, payload)?;
        log::trace!(
            "-> {} 0x{:08X} ({} byte payload)",
            opcode,
            address,
            payload.len()
        );
        self.transport.bulk_out(&request, timeout)?;

        let mut buf = [0u8; RESPONSE_BUF_LEN];
        let n = self.transport.bulk_in(&mut buf, timeout)?;
        let response = frame::decode(&buf[..n.min(buf.len())])?;
        log::trace!(
            "<- 0x{:02X} {} 0x{:08X} ({} byte payload)",
            response.opcode,
            response.status,
            response.address,
            response.payload.len()
        );

        validate(opcode, address, &response)?;
        Ok(response)
    }

    fn resync(&mut self, address: u32) -> Result<()> {
        log::debug!("Resyncing ROM receiver");
        let timeout = self.config.command_timeout;
        self.transport
            .control_out(REQUEST_RESYNC, address, &[], timeout)?;
        Ok(())
    }
}

fn handshake_retryable(err: &ProtocolError) -> bool {
    matches!(
        err,
        ProtocolError::Transport(TransportError::Timeout)
            | ProtocolError::Frame(_)
            | ProtocolError::BadSignature(_)
            | ProtocolError::DeviceChecksum
    )
}

fn validate(command: Opcode, address: u32, response: &ResponseFrame) -> Result<()> {
    let unexpected = || ProtocolError::UnexpectedResponse {
        command,
        opcode: response.opcode,
        status: response.status,
        address: response.address,
    };
    // A reply to some other command is never retried, whatever its status
    if response.opcode != command as u8 || response.address != address {
        return Err(unexpected());
    }
    match response.status {
        Status::Ok => Ok(()),
        Status::BadChecksum => Err(ProtocolError::DeviceChecksum),
        _ => Err(unexpected()),
    }
}

/// SRAM region for a single-buffer load
fn load_region(address: u32, len: usize) -> Result<Region> {
    let size = u32::try_from(len).map_err(|_| ProtocolError::ChunkTooLarge {
        len,
        max: u32::MAX as usize,
    })?;
    Ok(Region::sram(address, size))
}

/// Attach the stage location to a staging failure
fn locate(stage: &StageWrite, offset: usize, err: ProtocolError) -> ProtocolError {
    match err {
        ProtocolError::WriteFailed { .. }
        | ProtocolError::Staging { .. }
        | ProtocolError::Cancelled => err,
        other => ProtocolError::Staging {
            stage: stage.name.clone(),
            offset,
            source: Box::new(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::CPU_INFO_LEN;
    use crate::frame::CommandFrame;
    use crate::progress::NoProgress;
    use std::collections::VecDeque;

    /// Replays canned responses in order and records everything sent
    #[derive(Default)]
    struct Scripted {
        responses: VecDeque<std::result::Result<Vec<u8>, TransportError>>,
        sent: Vec<CommandFrame>,
        resyncs: Vec<u32>,
        delays: Vec<Duration>,
    }

    impl Scripted {
        fn new(responses: Vec<std::result::Result<Vec<u8>, TransportError>>) -> Self {
            Self {
                responses: responses.into(),
                ..Default::default()
            }
        }

        fn count(&self, opcode: Opcode) -> usize {
            self.sent.iter().filter(|f| f.opcode() == opcode).count()
        }
    }

    impl Transport for Scripted {
        fn bulk_out(
            &mut self,
            data: &[u8],
            _timeout: Duration,
        ) -> std::result::Result<(), TransportError> {
            self.sent.push(frame::decode_command(data).unwrap());
            Ok(())
        }

        fn bulk_in(
            &mut self,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> std::result::Result<usize, TransportError> {
            match self.responses.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(TransportError::Timeout),
            }
        }

        fn control_out(
            &mut self,
            request: u8,
            arg: u32,
            _data: &[u8],
            _timeout: Duration,
        ) -> std::result::Result<(), TransportError> {
            assert_eq!(request, REQUEST_RESYNC);
            self.resyncs.push(arg);
            Ok(())
        }

        fn control_in(
            &mut self,
            _request: u8,
            _arg: u32,
            _buf: &mut [u8],
            _timeout: Duration,
        ) -> std::result::Result<usize, TransportError> {
            Err(TransportError::Stall)
        }

        fn max_transfer_size(&self) -> usize {
            64 * 1024
        }

        fn delay(&mut self, duration: Duration) {
            self.delays.push(duration);
        }
    }

    type Reply = std::result::Result<Vec<u8>, TransportError>;

    fn reply(opcode: Opcode, status: Status, address: u32, payload: &[u8]) -> Reply {
        Ok(ResponseFrame::new(opcode as u8, status, address, payload).encode())
    }

    fn handshake_ok() -> Reply {
        reply(
            Opcode::Handshake,
            Status::Ok,
            0,
            &ProtocolVersion::new(1, 0).to_handshake(),
        )
    }

    fn info(s: &str) -> Reply {
        let mut block = vec![0u8; CPU_INFO_LEN];
        block[..s.len()].copy_from_slice(s.as_bytes());
        reply(Opcode::ReadInfo, Status::Ok, 0, &block)
    }

    fn write_ack(address: u32, data: &[u8]) -> Reply {
        reply(
            Opcode::WriteMemory,
            Status::Ok,
            address,
            &frame::crc32(data).to_le_bytes(),
        )
    }

    fn single_stage(data: &[u8], entry: Option<u32>) -> WritePlan {
        WritePlan {
            stages: vec![StageWrite::new(
                "spl",
                Region::sram(0x8000_0000, 0x1000),
                data.to_vec(),
            )],
            entry,
            chunk_size: 512,
        }
    }

    #[test]
    fn test_handshake_exhausts_exact_attempts() {
        let mut session = Session::new(Scripted::default(), SessionConfig::default());

        let err = session.handshake().unwrap_err();
        match err {
            ProtocolError::HandshakeFailed { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, ProtocolError::Transport(TransportError::Timeout));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Faulted);
        assert_eq!(session.transport().count(Opcode::Handshake), 3);
        assert_eq!(session.transport().sent.len(), 3);
        assert_eq!(
            session.transport().delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn test_handshake_recovers_from_bad_frame() {
        let transport = Scripted::new(vec![
            Ok(vec![0u8; 3]),
            reply(Opcode::Handshake, Status::Ok, 0, b"NOPE\x01\x00"),
            handshake_ok(),
        ]);
        let mut session = Session::new(transport, SessionConfig::default());

        assert_eq!(session.handshake().unwrap(), ProtocolVersion::new(1, 0));
        assert_eq!(session.state(), SessionState::Handshaking);
        assert_eq!(session.transport().count(Opcode::Handshake), 3);
        assert!(session.transport().resyncs.is_empty());
    }

    #[test]
    fn test_handshake_disconnect_is_fatal() {
        let transport = Scripted::new(vec![Err(TransportError::Disconnected)]);
        let mut session = Session::new(transport, SessionConfig::default());

        assert_eq!(
            session.handshake(),
            Err(ProtocolError::Transport(TransportError::Disconnected))
        );
        assert_eq!(session.transport().count(Opcode::Handshake), 1);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_unsupported_chip_writes_nothing() {
        let transport = Scripted::new(vec![handshake_ok(), info("K210")]);
        let mut session = Session::new(transport, SessionConfig::default());

        let err = session
            .run(&single_stage(&[0xAA; 16], None), &mut NoProgress)
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedDevice("K210".into()));
        assert_eq!(session.state(), SessionState::Faulted);
        assert_eq!(session.transport().count(Opcode::ReadInfo), 1);
        assert_eq!(session.transport().count(Opcode::WriteMemory), 0);
    }

    #[test]
    fn test_identify_retries_damaged_frame() {
        let transport = Scripted::new(vec![handshake_ok(), Ok(vec![0xFF; 20]), info("K230D")]);
        let mut session = Session::new(transport, SessionConfig::default());

        session.handshake().unwrap();
        let chip = session.identify().unwrap();
        assert_eq!(chip.family, crate::chip::ChipFamily::K230D);
        assert_eq!(session.state(), SessionState::Identified);
        assert_eq!(session.transport().resyncs.len(), 1);
    }

    #[test]
    fn test_unexpected_response_faults() {
        let transport = Scripted::new(vec![
            handshake_ok(),
            reply(Opcode::WriteMemory, Status::Ok, 0, &[0; 4]),
        ]);
        let mut session = Session::new(transport, SessionConfig::default());

        session.handshake().unwrap();
        assert!(matches!(
            session.identify(),
            Err(ProtocolError::UnexpectedResponse {
                command: Opcode::ReadInfo,
                opcode: 0x01,
                ..
            })
        ));
        assert_eq!(session.transport().count(Opcode::ReadInfo), 1);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_wrong_state_is_not_a_fault() {
        let mut session = Session::new(Scripted::default(), SessionConfig::default());

        assert!(matches!(
            session.identify(),
            Err(ProtocolError::InvalidState {
                state: SessionState::Disconnected,
                ..
            })
        ));
        assert!(session.execute(0x8000_0000).is_err());
        assert!(session
            .stage(&single_stage(&[1, 2, 3], None), &mut NoProgress)
            .is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.transport().sent.is_empty());
    }

    #[test]
    fn test_write_retry_bound() {
        let data = [0x5Au8; 16];
        let nak = reply(Opcode::WriteMemory, Status::BadChecksum, 0x8000_0000, &[]);
        let transport = Scripted::new(vec![
            handshake_ok(),
            info("K230D"),
            nak.clone(),
            nak.clone(),
            nak.clone(),
            write_ack(0x8000_0000, &data),
        ]);
        let mut session = Session::new(transport, SessionConfig::default());

        let err = session
            .run(&single_stage(&data, None), &mut NoProgress)
            .unwrap_err();
        match err {
            ProtocolError::WriteFailed {
                stage,
                offset,
                address,
                attempts,
                last,
            } => {
                assert_eq!(stage, "spl");
                assert_eq!(offset, 0);
                assert_eq!(address, 0x8000_0000);
                assert_eq!(attempts, 3);
                assert_eq!(*last, ProtocolError::DeviceChecksum);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(session.transport().count(Opcode::WriteMemory), 3);
        assert_eq!(session.transport().resyncs, vec![0x8000_0000; 2]);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_echo_mismatch_resent_in_place() {
        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let transport = Scripted::new(vec![
            handshake_ok(),
            info("K230"),
            write_ack(0x8000_0000, &data[..512]),
            reply(Opcode::WriteMemory, Status::Ok, 0x8000_0200, &0xDEADu32.to_le_bytes()),
            write_ack(0x8000_0200, &data[512..]),
        ]);
        let mut session = Session::new(transport, SessionConfig::default());

        let summary = session
            .run(&single_stage(&data, None), &mut NoProgress)
            .unwrap();
        assert_eq!(summary.bytes_written, 600);
        assert_eq!(summary.stages_completed, 1);
        assert_eq!(summary.entry, None);
        assert_eq!(session.state(), SessionState::Done);

        let writes: Vec<u32> = session
            .transport()
            .sent
            .iter()
            .filter(|f| f.opcode() == Opcode::WriteMemory)
            .map(|f| f.address())
            .collect();
        assert_eq!(writes, vec![0x8000_0000, 0x8000_0200, 0x8000_0200]);
        assert_eq!(session.transport().resyncs, vec![0x8000_0200]);
    }

    #[test]
    fn test_transport_error_during_staging_is_located() {
        let data = [0u8; 1024];
        let transport = Scripted::new(vec![
            handshake_ok(),
            info("K230D"),
            write_ack(0x8000_0000, &data[..512]),
            Err(TransportError::Stall),
        ]);
        let mut session = Session::new(transport, SessionConfig::default());

        let err = session
            .run(&single_stage(&data, None), &mut NoProgress)
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Staging {
                stage: "spl".into(),
                offset: 512,
                source: Box::new(ProtocolError::Transport(TransportError::Stall)),
            }
        );
        assert_eq!(session.transport().count(Opcode::WriteMemory), 2);
    }

    #[test]
    fn test_execute_does_not_wait_for_reply() {
        let data = [0x13u8; 32];
        let transport = Scripted::new(vec![
            handshake_ok(),
            info("K230D"),
            write_ack(0x8000_0000, &data),
            reply(Opcode::FlushCaches, Status::Ok, 0, &[]),
        ]);
        let mut session = Session::new(transport, SessionConfig::default());

        let summary = session
            .run(&single_stage(&data, Some(0x8000_0000)), &mut NoProgress)
            .unwrap();
        assert_eq!(summary.entry, Some(0x8000_0000));
        assert_eq!(session.state(), SessionState::Done);

        let last = session.transport().sent.last().unwrap();
        assert_eq!(last.opcode(), Opcode::Execute);
        assert_eq!(last.address(), 0x8000_0000);
        assert_eq!(session.transport().count(Opcode::FlushCaches), 1);
    }

    #[test]
    fn test_dram_init_stage_is_called() {
        let data = [0x42u8; 64];
        let mut stage = StageWrite::new("ddr", Region::sram(0x8000_4000, 0x400), data.to_vec());
        stage.call_after_write = true;
        let plan = WritePlan {
            stages: vec![stage],
            entry: None,
            chunk_size: 512,
        };
        let transport = Scripted::new(vec![
            handshake_ok(),
            info("K230D"),
            write_ack(0x8000_4000, &data),
            reply(Opcode::Call, Status::Ok, 0x8000_4000, &[]),
        ]);
        let mut session = Session::new(transport, SessionConfig::default());

        session.run(&plan, &mut NoProgress).unwrap();
        let sent = &session.transport().sent;
        assert_eq!(sent.last().map(|f| f.opcode()), Some(Opcode::Call));
        assert_eq!(sent.last().map(|f| f.address()), Some(0x8000_4000));
    }

    #[test]
    fn test_cancel_between_commands() {
        let transport = Scripted::new(vec![handshake_ok(), info("K230D")]);
        let token = CancelToken::new();
        let mut session =
            Session::new(transport, SessionConfig::default()).with_cancel_token(token.clone());

        session.handshake().unwrap();
        session.identify().unwrap();
        token.cancel();

        assert_eq!(
            session.stage(&single_stage(&[1; 8], None), &mut NoProgress),
            Err(ProtocolError::Cancelled)
        );
        assert_eq!(session.state(), SessionState::Faulted);
        assert_eq!(session.transport().count(Opcode::WriteMemory), 0);
    }

    /// Cancels the session once `after` bytes of a stage are written
    struct CancelAfter {
        token: CancelToken,
        after: usize,
    }

    impl BootProgress for CancelAfter {
        fn stage_progress(&mut self, _index: usize, written: usize, _total: usize) {
            if written >= self.after {
                self.token.cancel();
            }
        }
    }

    #[test]
    fn test_cancel_between_chunks() {
        let data = [0x77u8; 1024];
        let transport = Scripted::new(vec![
            handshake_ok(),
            info("K230D"),
            write_ack(0x8000_0000, &data[..512]),
            write_ack(0x8000_0200, &data[512..]),
        ]);
        let token = CancelToken::new();
        let mut session =
            Session::new(transport, SessionConfig::default()).with_cancel_token(token.clone());
        let mut progress = CancelAfter { token, after: 512 };

        assert_eq!(
            session.run(&single_stage(&data, None), &mut progress),
            Err(ProtocolError::Cancelled)
        );
        assert_eq!(session.transport().count(Opcode::WriteMemory), 1);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_bad_checksum_for_other_command_is_fatal() {
        let data = [0x11u8; 16];
        let transport = Scripted::new(vec![
            handshake_ok(),
            info("K230D"),
            reply(Opcode::Handshake, Status::BadChecksum, 0x1234_5678, &[]),
            write_ack(0x8000_0000, &data),
        ]);
        let mut session = Session::new(transport, SessionConfig::default());

        let err = session
            .run(&single_stage(&data, None), &mut NoProgress)
            .unwrap_err();
        match err {
            ProtocolError::Staging { stage, source, .. } => {
                assert_eq!(stage, "spl");
                assert!(matches!(
                    *source,
                    ProtocolError::UnexpectedResponse {
                        command: Opcode::WriteMemory,
                        opcode: 0x10,
                        status: Status::BadChecksum,
                        address: 0x1234_5678,
                    }
                ));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(session.transport().count(Opcode::WriteMemory), 1);
        assert!(session.transport().resyncs.is_empty());
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_ack_without_echo_is_fatal() {
        let data = [0x22u8; 16];
        let transport = Scripted::new(vec![
            handshake_ok(),
            info("K230D"),
            reply(Opcode::WriteMemory, Status::Ok, 0x8000_0000, &[]),
            write_ack(0x8000_0000, &data),
        ]);
        let mut session = Session::new(transport, SessionConfig::default());

        let err = session
            .run(&single_stage(&data, None), &mut NoProgress)
            .unwrap_err();
        match err {
            ProtocolError::Staging { offset, source, .. } => {
                assert_eq!(offset, 0);
                assert!(matches!(
                    *source,
                    ProtocolError::UnexpectedResponse {
                        command: Opcode::WriteMemory,
                        status: Status::Ok,
                        ..
                    }
                ));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(session.transport().count(Opcode::WriteMemory), 1);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_load_region_rejects_oversized_buffer() {
        assert_eq!(
            load_region(0x8036_0000, 0x1000),
            Ok(Region::sram(0x8036_0000, 0x1000))
        );
        #[cfg(target_pointer_width = "64")]
        assert_eq!(
            load_region(0x8036_0000, u32::MAX as usize + 1),
            Err(ProtocolError::ChunkTooLarge {
                len: u32::MAX as usize + 1,
                max: u32::MAX as usize,
            })
        );
    }

    #[test]
    fn test_return_to_rom() {
        let transport = Scripted::new(vec![handshake_ok(), info("K230D")]);
        let mut session = Session::new(transport, SessionConfig::default());

        session.handshake().unwrap();
        session.identify().unwrap();
        session.return_to_rom().unwrap();

        let last = session.transport().sent.last().unwrap();
        assert_eq!(last.opcode(), Opcode::Execute);
        assert_eq!(last.address(), MASK_ROM_BASE);
        assert_eq!(session.transport().count(Opcode::FlushCaches), 0);
    }

    #[test]
    fn test_chunk_size_capped_by_transport() {
        let config = SessionConfig::default();
        assert_eq!(config.chunk_size_for(512 * 128), 4096);
        assert_eq!(config.chunk_size_for(1024), 1024 - HEADER_LEN);
    }
}
