//! Frame bridge for the real mask ROM
//!
//! The session speaks checksummed command/response frames. The K230 ROM
//! only understands vendor requests plus raw bulk data and never replies on
//! bulk IN. [`RomBridge`] sits between the two: every command frame written
//! to it is carried out as the matching vendor requests on the wrapped link,
//! and the response frame the session waits for is built locally.
//!
//! | Frame        | On the wire                                     |
//! |--------------|-------------------------------------------------|
//! | Handshake    | `GET_CPU_INFO` (the ROM must answer)            |
//! | ReadInfo     | `GET_CPU_INFO`, 32 bytes                        |
//! | WriteMemory  | `SET_DATA_ADDRESS`, then the payload on bulk OUT |
//! | FlushCaches  | `FLUSH_CACHES`                                  |
//! | Call         | `PROG_START`                                    |
//! | Execute      | `PROG_START`, no response                       |
//!
//! The WriteMemory echo is the CRC of the bytes the bulk pipe accepted.

use std::time::Duration;

use k230boot_core::chip::CPU_INFO_LEN;
use k230boot_core::frame::{self, CommandFrame, Opcode, ResponseFrame, Status};
use k230boot_core::transport::REQUEST_RESYNC;
use k230boot_core::{FrameError, ProtocolVersion, Transport, TransportError};

use crate::protocol::*;

/// Version reported for the ROM, which has no handshake of its own
pub const ROM_PROTOCOL: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Adapts a raw vendor-request link to the frame protocol
pub struct RomBridge<T: Transport> {
    link: T,
    pending: Option<Vec<u8>>,
}

impl<T: Transport> RomBridge<T> {
    /// Wrap a raw link
    pub fn new(link: T) -> Self {
        Self {
            link,
            pending: None,
        }
    }

    /// The wrapped link
    pub fn link(&self) -> &T {
        &self.link
    }

    /// Unwrap the link
    pub fn into_link(self) -> T {
        self.link
    }

    fn read_cpu_info(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut info = vec![0u8; CPU_INFO_LEN];
        let n = self
            .link
            .control_in(REQUEST_GET_CPU_INFO, 0, &mut info, timeout)?;
        log::trace!("CPU info: {} bytes", n);
        Ok(info)
    }

    /// Carry out one command; `None` means the ROM stays silent
    fn perform(
        &mut self,
        command: &CommandFrame,
        timeout: Duration,
    ) -> Result<Option<ResponseFrame>, TransportError> {
        let opcode = command.opcode();
        let address = command.address();
        let ok = |payload: &[u8]| Some(ResponseFrame::new(opcode as u8, Status::Ok, address, payload));

        match opcode {
            Opcode::Handshake => {
                self.read_cpu_info(timeout)?;
                Ok(ok(&ROM_PROTOCOL.to_handshake()))
            }
            Opcode::ReadInfo => {
                let info = self.read_cpu_info(timeout)?;
                Ok(ok(&info))
            }
            Opcode::WriteMemory => {
                let data = command.payload();
                log::trace!("ROM write {} bytes at 0x{:08X}", data.len(), address);
                self.link
                    .control_out(REQUEST_SET_DATA_ADDRESS, address, &[], timeout)?;
                self.link.bulk_out(data, timeout)?;
                Ok(ok(&frame::crc32(data).to_le_bytes()))
            }
            Opcode::FlushCaches => {
                self.link
                    .control_out(REQUEST_FLUSH_CACHES, 0, &[], timeout)?;
                Ok(ok(&[]))
            }
            Opcode::Call => {
                self.link
                    .control_out(REQUEST_PROG_START, address, &[], timeout)?;
                Ok(ok(&[]))
            }
            Opcode::Execute => {
                self.link
                    .control_out(REQUEST_PROG_START, address, &[], timeout)?;
                Ok(None)
            }
        }
    }
}

/// Answer for a frame that failed to decode, as the ROM firmware would
fn reject(data: &[u8], err: &FrameError) -> ResponseFrame {
    let status = match err {
        FrameError::ChecksumMismatch { .. } => Status::BadChecksum,
        FrameError::UnknownOpcode(_) => Status::BadOpcode,
        _ => Status::BadLength,
    };
    let opcode = data.first().copied().unwrap_or(0);
    let address = data
        .get(4..8)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0);
    ResponseFrame::new(opcode, status, address, &[])
}

impl<T: Transport> Transport for RomBridge<T> {
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.pending = None;
        let response = match frame::decode_command(data) {
            Ok(command) => self.perform(&command, timeout)?,
            Err(e) => {
                log::debug!("Rejecting malformed frame: {}", e);
                Some(reject(data, &e))
            }
        };
        self.pending = response.map(|r| r.encode());
        Ok(())
    }

    fn bulk_in(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        let response = self.pending.take().ok_or(TransportError::Timeout)?;
        let len = response.len().min(buf.len());
        buf[..len].copy_from_slice(&response[..len]);
        Ok(len)
    }

    fn control_out(
        &mut self,
        request: u8,
        arg: u32,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if request == REQUEST_RESYNC {
            // Nothing is buffered on the device side
            self.pending = None;
            return Ok(());
        }
        self.link.control_out(request, arg, data, timeout)
    }

    fn control_in(
        &mut self,
        request: u8,
        arg: u32,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.link.control_in(request, arg, buf, timeout)
    }

    fn max_transfer_size(&self) -> usize {
        self.link.max_transfer_size()
    }

    fn delay(&mut self, duration: Duration) {
        self.link.delay(duration)
    }
}
