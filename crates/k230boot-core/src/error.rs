//! Error types for k230boot-core
//!
//! The taxonomy follows how each failure may be handled:
//!
//! - [`TransportError`] - the USB link failed; surfaced, never retried across
//!   commands
//! - [`FrameError`] - a frame arrived damaged; the same command may be re-sent
//! - [`ProtocolError`] - the session cannot continue; aborts the whole run
//! - [`PlanError`] - the boot plan is invalid; raised before any device I/O

use thiserror::Error;

use crate::frame::{Opcode, Status};
use crate::session::SessionState;

/// Errors raised by the USB transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transfer did not complete within its timeout
    #[error("USB transfer timed out")]
    Timeout,
    /// The device went away
    #[error("device disconnected")]
    Disconnected,
    /// The endpoint returned a STALL handshake
    #[error("endpoint stalled")]
    Stall,
    /// Any other host-side transfer failure
    #[error("USB transfer failed: {0}")]
    Other(String),
}

/// Errors raised while decoding a frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes arrived than the frame declares
    #[error("frame truncated: expected {expected} bytes, received {actual}")]
    Truncated {
        /// Bytes the frame header declares (header included)
        expected: usize,
        /// Bytes actually received
        actual: usize,
    },
    /// The checksum carried by the frame does not match its contents
    #[error("frame checksum mismatch: computed 0x{computed:08X}, frame carries 0x{received:08X}")]
    ChecksumMismatch {
        /// Checksum recomputed over the received bytes
        computed: u32,
        /// Checksum found in the frame header
        received: u32,
    },
    /// The status byte is not one the ROM defines
    #[error("unknown status byte 0x{0:02X}")]
    UnknownStatus(u8),
    /// The opcode byte is not one the ROM defines
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    /// The payload exceeds the largest frame the ROM accepts
    #[error("payload of {len} bytes exceeds the {max}-byte frame limit")]
    Oversized {
        /// Declared or supplied payload length
        len: usize,
        /// Maximum payload length
        max: usize,
    },
}

/// Errors raised by an image source
#[derive(Debug, Error)]
pub enum ImageError {
    /// The requested range is not inside the image
    #[error("range 0x{offset:X}+0x{length:X} is outside the {size}-byte image")]
    OutOfRange {
        /// Requested offset
        offset: u64,
        /// Requested length
        length: u64,
        /// Image size
        size: u64,
    },
    /// Reading the backing storage failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Boot plan validation failures
///
/// All of these are detected by the sequencer before the device is touched.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The plan has no stages
    #[error("boot plan has no stages")]
    Empty,
    /// Chunk size of zero was requested
    #[error("chunk size must be non-zero")]
    ZeroChunkSize,
    /// Two stages share a name
    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),
    /// A stage names an image the image set does not provide
    #[error("stage '{stage}': image '{image}' not found")]
    MissingImage {
        /// Stage name
        stage: String,
        /// Image name
        image: String,
    },
    /// Reading a stage's source failed
    #[error("stage '{stage}': {source}")]
    Image {
        /// Stage name
        stage: String,
        /// Underlying image error
        #[source]
        source: ImageError,
    },
    /// An image source returned a different number of bytes than requested
    #[error("stage '{stage}': image returned {actual} bytes, expected {expected}")]
    ShortRead {
        /// Stage name
        stage: String,
        /// Declared source length
        expected: u64,
        /// Bytes returned
        actual: usize,
    },
    /// The stage's source range is empty
    #[error("stage '{0}' has an empty source range")]
    EmptySource(String),
    /// The source does not fit in the target region
    #[error("stage '{stage}': {length} bytes do not fit in a {max_size}-byte region")]
    SourceTooLarge {
        /// Stage name
        stage: String,
        /// Source length
        length: u64,
        /// Region maximum size
        max_size: u32,
    },
    /// The target region runs past the end of the 32-bit address space
    #[error("stage '{0}': target region wraps the address space")]
    RegionWraps(String),
    /// The target region is not backed by memory of the declared kind
    #[error("stage '{stage}': {kind} region 0x{base:08X}+0x{size:X} is outside the memory map")]
    OutsideMemoryMap {
        /// Stage name
        stage: String,
        /// Declared memory kind
        kind: crate::plan::MemoryKind,
        /// Region base
        base: u32,
        /// Region maximum size
        size: u32,
    },
    /// Two stages claim overlapping target memory
    #[error("stages '{first}' and '{second}' have overlapping target regions")]
    Overlap {
        /// Earlier stage
        first: String,
        /// Later stage
        second: String,
    },
    /// A stage depends on a stage that does not exist
    #[error("stage '{stage}' depends on unknown stage '{predecessor}'")]
    UnknownPredecessor {
        /// Stage name
        stage: String,
        /// Missing predecessor
        predecessor: String,
    },
    /// A stage depends on itself
    #[error("stage '{0}' depends on itself")]
    SelfDependency(String),
    /// A stage depends on a stage that comes later in the plan
    #[error("stage '{stage}' depends on '{predecessor}', which is loaded after it")]
    DependencyOrder {
        /// Stage name
        stage: String,
        /// Predecessor that appears later
        predecessor: String,
    },
    /// A DRAM stage has no DRAM-init stage among its predecessors
    #[error("DRAM stage '{0}' does not depend on a DRAM-init stage")]
    DramBeforeInit(String),
    /// A DRAM-init stage targets DRAM itself
    #[error("DRAM-init stage '{0}' must target SRAM")]
    DramInitNotSram(String),
    /// A DRAM-init stage is only run at handoff, too late for DRAM stages
    #[error("DRAM-init stage '{init}' is the handoff stage, so '{stage}' would be loaded before DRAM is up")]
    DramInitIsHandoff {
        /// DRAM-init stage
        init: String,
        /// DRAM stage depending on it
        stage: String,
    },
    /// More than one stage requests execution handoff
    #[error("stages '{first}' and '{second}' both request execution handoff")]
    MultipleHandoff {
        /// First handoff stage
        first: String,
        /// Second handoff stage
        second: String,
    },
    /// The entry override lies outside the handoff stage
    #[error("entry 0x{entry:08X} is not inside handoff stage '{stage}'")]
    EntryOutsideStage {
        /// Entry address
        entry: u32,
        /// Handoff stage
        stage: String,
    },
    /// An entry override was given but no stage requests handoff
    #[error("entry 0x{0:08X} given but no stage requests execution handoff")]
    EntryWithoutHandoff(u32),
}

/// Fatal session errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Frame failure that exhausted its retries
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    /// The ROM never produced a valid handshake
    #[error("handshake failed after {attempts} attempt(s): {last}")]
    HandshakeFailed {
        /// Number of handshake commands sent
        attempts: u32,
        /// Failure of the final attempt
        last: Box<ProtocolError>,
    },
    /// The handshake response carried the wrong signature
    #[error("bad handshake signature {0:02X?}")]
    BadSignature(Vec<u8>),
    /// The chip identified itself as something this tool cannot boot
    #[error("unsupported device {0:?}")]
    UnsupportedDevice(String),
    /// The response does not belong to the command that was sent
    #[error(
        "unexpected response to {command}: opcode 0x{opcode:02X}, status {status}, address 0x{address:08X}"
    )]
    UnexpectedResponse {
        /// Command that was sent
        command: Opcode,
        /// Echoed opcode byte
        opcode: u8,
        /// Returned status
        status: Status,
        /// Echoed address
        address: u32,
    },
    /// The ROM reported that the command frame arrived damaged
    #[error("device rejected the frame checksum")]
    DeviceChecksum,
    /// The ROM acknowledged a write with the wrong data checksum
    #[error("device echoed checksum 0x{reported:08X}, chunk checksum is 0x{expected:08X}")]
    EchoMismatch {
        /// Checksum of the chunk that was sent
        expected: u32,
        /// Checksum the ROM reported
        reported: u32,
    },
    /// A chunk could not be written within the retry bound
    #[error(
        "write to stage '{stage}' failed at offset 0x{offset:X} (address 0x{address:08X}) after {attempts} attempt(s): {last}"
    )]
    WriteFailed {
        /// Stage name
        stage: String,
        /// Offset of the chunk within the stage
        offset: usize,
        /// Target address of the chunk
        address: u32,
        /// Attempts made
        attempts: u32,
        /// Failure of the final attempt
        last: Box<ProtocolError>,
    },
    /// A fatal error during staging, with its location
    #[error("stage '{stage}' aborted at offset 0x{offset:X}: {source}")]
    Staging {
        /// Stage name
        stage: String,
        /// Offset of the chunk being written
        offset: usize,
        /// Underlying error
        #[source]
        source: Box<ProtocolError>,
    },
    /// A chunk is larger than the transport can carry in one frame
    #[error("chunk of {len} bytes exceeds the transport limit of {max}")]
    ChunkTooLarge {
        /// Chunk length
        len: usize,
        /// Largest payload the transport can carry
        max: usize,
    },
    /// Operation called in the wrong session state
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        /// Current state
        state: SessionState,
        /// Operation attempted
        operation: &'static str,
    },
    /// The session was cancelled between commands
    #[error("session cancelled")]
    Cancelled,
}

impl ProtocolError {
    /// Whether re-sending the same command may succeed
    ///
    /// Only damaged frames and checksum disagreements qualify. Anything that
    /// leaves the device state ambiguous is not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Frame(_) | ProtocolError::DeviceChecksum | ProtocolError::EchoMismatch { .. }
        )
    }
}

/// Result type alias using [`ProtocolError`]
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProtocolError::Frame(FrameError::UnknownStatus(0x7F)).is_retryable());
        assert!(ProtocolError::DeviceChecksum.is_retryable());
        assert!(ProtocolError::EchoMismatch {
            expected: 1,
            reported: 2
        }
        .is_retryable());
        assert!(!ProtocolError::Transport(TransportError::Timeout).is_retryable());
        assert!(!ProtocolError::UnsupportedDevice("X".into()).is_retryable());
        assert!(!ProtocolError::Cancelled.is_retryable());
    }

    #[test]
    fn test_write_failed_message_names_location() {
        let err = ProtocolError::WriteFailed {
            stage: "spl".into(),
            offset: 0x1000,
            address: 0x8030_1000,
            attempts: 3,
            last: Box::new(ProtocolError::DeviceChecksum),
        };
        let msg = err.to_string();
        assert!(msg.contains("'spl'"));
        assert!(msg.contains("0x1000"));
        assert!(msg.contains("0x80301000"));
        assert!(msg.contains("3 attempt"));
    }
}
