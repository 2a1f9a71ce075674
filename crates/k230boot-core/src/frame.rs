//! Mask-ROM command/response framing
//!
//! Every exchange with the boot ROM is one frame in each direction. Commands
//! and responses share the same 16-byte little-endian header:
//!
//! ```text
//! offset size field
//! 0      1    opcode   (echoed by the ROM in responses)
//! 1      1    status   (always 0 in commands)
//! 2      2    reserved (0)
//! 4      4    address
//! 8      4    length   payload length in bytes
//! 12     4    checksum CRC-32/ISO-HDLC over bytes 0..12, then the payload
//! 16     n    payload
//! ```
//!
//! The layout is a fixed contract with the ROM. Changing any offset or the
//! checksum polynomial silently corrupts every transfer.

use core::fmt;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::FrameError;

/// Size of the frame header in bytes
pub const HEADER_LEN: usize = 16;

/// Largest payload a single frame may carry
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Offset of the checksum field; everything before it is checksummed
const CHECKSUM_OFFSET: usize = 12;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute the CRC-32 of a data block
///
/// This is the same checksum the ROM echoes back after a memory write.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

// ===========================================================================
// Opcodes and status codes
// ===========================================================================

/// Command opcodes understood by the mask ROM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Read the 32-byte CPU info string
    ReadInfo = 0x00,
    /// Write the payload to memory at the frame address
    WriteMemory = 0x01,
    /// Flush instruction and data caches
    FlushCaches = 0x03,
    /// Jump to the frame address; the ROM does not answer
    Execute = 0x04,
    /// Call code at the frame address and acknowledge when it returns
    Call = 0x05,
    /// Open a session; answered with the ROM signature and protocol version
    Handshake = 0x10,
}

impl Opcode {
    /// Create an Opcode from a raw byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::ReadInfo),
            0x01 => Some(Opcode::WriteMemory),
            0x03 => Some(Opcode::FlushCaches),
            0x04 => Some(Opcode::Execute),
            0x05 => Some(Opcode::Call),
            0x10 => Some(Opcode::Handshake),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::ReadInfo => "READ-INFO",
            Opcode::WriteMemory => "WRITE-MEMORY",
            Opcode::FlushCaches => "FLUSH-CACHES",
            Opcode::Execute => "EXECUTE",
            Opcode::Call => "CALL",
            Opcode::Handshake => "HANDSHAKE",
        };
        f.write_str(name)
    }
}

/// Status codes carried by response frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Command accepted
    Ok = 0x00,
    /// The command frame failed the ROM's checksum check
    BadChecksum = 0x01,
    /// The address is not writable or not executable
    BadAddress = 0x02,
    /// The payload length is not acceptable
    BadLength = 0x03,
    /// The opcode is not supported
    BadOpcode = 0x04,
}

impl Status {
    /// Create a Status from a raw byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Status::Ok),
            0x01 => Some(Status::BadChecksum),
            0x02 => Some(Status::BadAddress),
            0x03 => Some(Status::BadLength),
            0x04 => Some(Status::BadOpcode),
            _ => None,
        }
    }

    /// Check if this status indicates success
    pub fn is_ok(&self) -> bool {
        *self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::BadChecksum => "BAD-CHECKSUM",
            Status::BadAddress => "BAD-ADDRESS",
            Status::BadLength => "BAD-LENGTH",
            Status::BadOpcode => "BAD-OPCODE",
        };
        f.write_str(name)
    }
}

// ===========================================================================
// Frame structures
// ===========================================================================

/// An outbound request to the ROM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    opcode: Opcode,
    address: u32,
    payload: Vec<u8>,
}

impl CommandFrame {
    /// Create a command frame
    ///
    /// Fails if the payload does not fit in one frame.
    pub fn new(opcode: Opcode, address: u32, payload: &[u8]) -> Result<Self, FrameError> {
        check_payload_len(payload.len())?;
        Ok(Self {
            opcode,
            address,
            payload: payload.to_vec(),
        })
    }

    /// Create a command frame without a payload
    pub fn bare(opcode: Opcode, address: u32) -> Self {
        Self {
            opcode,
            address,
            payload: Vec::new(),
        }
    }

    /// Command opcode
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Target address
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        encode_raw(self.opcode as u8, 0, self.address, &self.payload)
    }
}

/// An inbound acknowledgment from the ROM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Echoed opcode byte, kept raw so unknown values can be reported
    pub opcode: u8,
    /// Status code
    pub status: Status,
    /// Echoed address
    pub address: u32,
    /// Payload bytes (chip info, echoed checksum, ...)
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    /// Create a response frame
    pub fn new(opcode: u8, status: Status, address: u32, payload: &[u8]) -> Self {
        Self {
            opcode,
            status,
            address,
            payload: payload.to_vec(),
        }
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        encode_raw(self.opcode, self.status as u8, self.address, &self.payload)
    }
}

/// Encode a command frame
pub fn encode(opcode: Opcode, address: u32, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    check_payload_len(payload.len())?;
    Ok(encode_raw(opcode as u8, 0, address, payload))
}

/// Decode a response frame
pub fn decode(bytes: &[u8]) -> Result<ResponseFrame, FrameError> {
    let raw = decode_raw(bytes)?;
    let status = Status::from_u8(raw.status).ok_or(FrameError::UnknownStatus(raw.status))?;
    Ok(ResponseFrame {
        opcode: raw.opcode,
        status,
        address: raw.address,
        payload: raw.payload.to_vec(),
    })
}

/// Decode a command frame
///
/// This is the ROM side of the exchange, used by device simulators.
pub fn decode_command(bytes: &[u8]) -> Result<CommandFrame, FrameError> {
    let raw = decode_raw(bytes)?;
    let opcode = Opcode::from_u8(raw.opcode).ok_or(FrameError::UnknownOpcode(raw.opcode))?;
    Ok(CommandFrame {
        opcode,
        address: raw.address,
        payload: raw.payload.to_vec(),
    })
}

// ===========================================================================
// Wire helpers
// ===========================================================================

struct RawFrame<'a> {
    opcode: u8,
    status: u8,
    address: u32,
    payload: &'a [u8],
}

fn check_payload_len(len: usize) -> Result<(), FrameError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::Oversized {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(())
}

fn encode_raw(opcode: u8, status: u8, address: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(opcode);
    buf.push(status);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&address.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = frame_checksum(&buf[..CHECKSUM_OFFSET], payload);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn frame_checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(header);
    digest.update(payload);
    digest.finalize()
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn decode_raw(bytes: &[u8]) -> Result<RawFrame<'_>, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: HEADER_LEN,
            actual: bytes.len(),
        });
    }

    let declared = read_u32(bytes, 8) as usize;
    let received = read_u32(bytes, CHECKSUM_OFFSET);
    let available = bytes.len() - HEADER_LEN;

    if declared > available {
        // A complete frame whose length field was damaged in flight still
        // checksums correctly once the length is taken from the transfer.
        let mut header = [0u8; CHECKSUM_OFFSET];
        header.copy_from_slice(&bytes[..CHECKSUM_OFFSET]);
        header[8..12].copy_from_slice(&(available as u32).to_le_bytes());
        if frame_checksum(&header, &bytes[HEADER_LEN..]) == received {
            return Err(FrameError::ChecksumMismatch {
                computed: frame_checksum(&bytes[..CHECKSUM_OFFSET], &bytes[HEADER_LEN..]),
                received,
            });
        }
        if declared > MAX_PAYLOAD_LEN {
            return Err(FrameError::Oversized {
                len: declared,
                max: MAX_PAYLOAD_LEN,
            });
        }
        return Err(FrameError::Truncated {
            expected: HEADER_LEN + declared,
            actual: bytes.len(),
        });
    }

    let payload = &bytes[HEADER_LEN..HEADER_LEN + declared];
    let computed = frame_checksum(&bytes[..CHECKSUM_OFFSET], payload);
    if computed != received {
        return Err(FrameError::ChecksumMismatch { computed, received });
    }

    if available > declared {
        log::trace!(
            "ignoring {} trailing byte(s) after frame",
            available - declared
        );
    }

    Ok(RawFrame {
        opcode: bytes[0],
        status: bytes[1],
        address: read_u32(bytes, 4),
        payload,
    })
}
