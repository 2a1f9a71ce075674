//! k230boot-dummy - Simulated K230 mask ROM
//!
//! This crate provides a [`Transport`] that behaves like the USB loader in
//! the K230 boot ROM: it answers frames, keeps a sparse memory image, and
//! refuses DRAM writes until a DRAM-training stage has been called. Faults
//! can be injected to exercise retry paths. It's useful for testing and for
//! dry runs without real hardware.

use std::collections::BTreeMap;
use std::time::Duration;

use k230boot_core::chip::CPU_INFO_LEN;
use k230boot_core::frame::{self, CommandFrame, Opcode, ResponseFrame, Status, HEADER_LEN};
use k230boot_core::transport::REQUEST_RESYNC;
use k230boot_core::{FrameError, ProtocolVersion, Transport, TransportError};

const PAGE_SIZE: usize = 4096;

/// Configuration for the simulated ROM
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// CPU info string returned by ReadInfo
    pub cpu_info: String,
    /// Protocol version returned by the handshake
    pub protocol: ProtocolVersion,
    /// SRAM base address
    pub sram_base: u32,
    /// SRAM size in bytes
    pub sram_size: u32,
    /// DRAM base address
    pub dram_base: u32,
    /// DRAM size in bytes
    pub dram_size: u32,
    /// Largest bulk transfer accepted
    pub max_transfer: usize,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            cpu_info: "K230D-DUMMY".to_string(),
            protocol: ProtocolVersion::new(1, 0),
            sram_base: 0x8000_0000,
            sram_size: 4 * 1024 * 1024,
            dram_base: 0,
            dram_size: 128 * 1024 * 1024,
            max_transfer: 512 * 128,
        }
    }
}

/// A command the ROM received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRecord {
    /// Opcode
    pub opcode: Opcode,
    /// Target address
    pub address: u32,
    /// Payload length
    pub len: usize,
}

/// Injected faults, each consumed as it fires
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Flip a byte in this many upcoming responses
    pub corrupt_responses: u32,
    /// Drop this many upcoming responses (the host sees a timeout)
    pub drop_responses: u32,
    /// Answer this many upcoming writes with BAD-CHECKSUM
    pub nak_writes: u32,
    /// Never answer anything
    pub silent: bool,
}

/// Simulated mask ROM
pub struct DummyRom {
    config: DummyConfig,
    faults: Faults,
    memory: BTreeMap<u32, Box<[u8; PAGE_SIZE]>>,
    pending: Option<Vec<u8>>,
    dram_ready: bool,
    executed: Option<u32>,
    commands: Vec<CommandRecord>,
    resyncs: usize,
}

impl DummyRom {
    /// Create a simulated ROM with the given configuration
    pub fn new(config: DummyConfig) -> Self {
        Self {
            config,
            faults: Faults::default(),
            memory: BTreeMap::new(),
            pending: None,
            dram_ready: false,
            executed: None,
            commands: Vec::new(),
            resyncs: 0,
        }
    }

    /// Create a simulated K230D
    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    /// Inject faults
    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Replace the injected faults
    pub fn inject(&mut self, faults: Faults) {
        self.faults = faults;
    }

    /// Get the configuration
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Commands received so far
    pub fn commands(&self) -> &[CommandRecord] {
        &self.commands
    }

    /// Number of received commands with the given opcode
    pub fn command_count(&self, opcode: Opcode) -> usize {
        self.commands.iter().filter(|c| c.opcode == opcode).count()
    }

    /// Number of RESYNC requests received
    pub fn resyncs(&self) -> usize {
        self.resyncs
    }

    /// Whether a DRAM-training stage has been called
    pub fn dram_ready(&self) -> bool {
        self.dram_ready
    }

    /// Address execution was handed to
    pub fn executed(&self) -> Option<u32> {
        self.executed
    }

    /// Read back simulated memory; unwritten bytes read as zero
    pub fn read_memory(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let addr = address.wrapping_add(i as u32);
                let page = addr & !(PAGE_SIZE as u32 - 1);
                self.memory
                    .get(&page)
                    .map(|p| p[(addr - page) as usize])
                    .unwrap_or(0)
            })
            .collect()
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let addr = address.wrapping_add(i as u32);
            let page = addr & !(PAGE_SIZE as u32 - 1);
            let buf = self
                .memory
                .entry(page)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            buf[(addr - page) as usize] = byte;
        }
    }

    fn in_window(base: u32, size: u32, address: u32, len: usize) -> bool {
        let start = address as u64;
        let end = start + len as u64;
        start >= base as u64 && end <= base as u64 + size as u64
    }

    fn in_sram(&self, address: u32, len: usize) -> bool {
        Self::in_window(self.config.sram_base, self.config.sram_size, address, len)
    }

    fn in_dram(&self, address: u32, len: usize) -> bool {
        Self::in_window(self.config.dram_base, self.config.dram_size, address, len)
    }

    fn handle(&mut self, command: &CommandFrame) -> Option<ResponseFrame> {
        let opcode = command.opcode();
        let address = command.address();
        let payload = command.payload();
        let reply = |status: Status, data: &[u8]| {
            Some(ResponseFrame::new(opcode as u8, status, address, data))
        };

        match opcode {
            Opcode::Handshake => reply(Status::Ok, &self.config.protocol.to_handshake()),
            Opcode::ReadInfo => {
                let mut info = vec![0u8; CPU_INFO_LEN];
                let bytes = self.config.cpu_info.as_bytes();
                let len = bytes.len().min(CPU_INFO_LEN);
                info[..len].copy_from_slice(&bytes[..len]);
                reply(Status::Ok, &info)
            }
            Opcode::WriteMemory => {
                if self.faults.nak_writes > 0 {
                    self.faults.nak_writes -= 1;
                    log::debug!("dummy: NAK write at 0x{:08X}", address);
                    return reply(Status::BadChecksum, &[]);
                }
                let writable = self.in_sram(address, payload.len())
                    || (self.dram_ready && self.in_dram(address, payload.len()));
                if payload.is_empty() {
                    return reply(Status::BadLength, &[]);
                }
                if !writable {
                    log::debug!("dummy: rejecting write at 0x{:08X}", address);
                    return reply(Status::BadAddress, &[]);
                }
                let data = payload.to_vec();
                self.write_memory(address, &data);
                reply(Status::Ok, &frame::crc32(&data).to_le_bytes())
            }
            Opcode::FlushCaches => reply(Status::Ok, &[]),
            Opcode::Call => {
                if !self.in_sram(address, 1) {
                    return reply(Status::BadAddress, &[]);
                }
                log::debug!("dummy: called 0x{:08X}, DRAM is up", address);
                self.dram_ready = true;
                reply(Status::Ok, &[])
            }
            Opcode::Execute => {
                log::debug!("dummy: executing at 0x{:08X}", address);
                self.executed = Some(address);
                None
            }
        }
    }
}

impl Transport for DummyRom {
    fn bulk_out(&mut self, data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        if data.len() > self.config.max_transfer {
            return Err(TransportError::Other(format!(
                "{}-byte transfer exceeds {}",
                data.len(),
                self.config.max_transfer
            )));
        }
        // Once the ROM has jumped away nothing listens on the pipe
        if self.executed.is_some() {
            return Err(TransportError::Disconnected);
        }

        let response = match frame::decode_command(data) {
            Ok(command) => {
                self.commands.push(CommandRecord {
                    opcode: command.opcode(),
                    address: command.address(),
                    len: command.payload().len(),
                });
                self.handle(&command)
            }
            Err(e) => {
                log::debug!("dummy: bad frame: {}", e);
                let status = match e {
                    FrameError::ChecksumMismatch { .. } => Status::BadChecksum,
                    FrameError::UnknownOpcode(_) => Status::BadOpcode,
                    _ => Status::BadLength,
                };
                let opcode = data.first().copied().unwrap_or(0);
                let address = data
                    .get(4..8)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .unwrap_or(0);
                Some(ResponseFrame::new(opcode, status, address, &[]))
            }
        };

        self.pending = response.map(|r| r.encode());
        Ok(())
    }

    fn bulk_in(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.faults.silent {
            self.pending = None;
            return Err(TransportError::Timeout);
        }
        let Some(mut response) = self.pending.take() else {
            return Err(TransportError::Timeout);
        };
        if self.faults.drop_responses > 0 {
            self.faults.drop_responses -= 1;
            return Err(TransportError::Timeout);
        }
        if self.faults.corrupt_responses > 0 {
            self.faults.corrupt_responses -= 1;
            let last = response.len() - 1;
            response[last] ^= 0x5A;
        }

        let len = response.len().min(buf.len());
        buf[..len].copy_from_slice(&response[..len]);
        Ok(len)
    }

    fn control_out(
        &mut self,
        request: u8,
        _arg: u32,
        _data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        if request != REQUEST_RESYNC {
            return Err(TransportError::Stall);
        }
        self.resyncs += 1;
        self.pending = None;
        Ok(())
    }

    fn control_in(
        &mut self,
        _request: u8,
        _arg: u32,
        _buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        // The simulated ROM speaks frames only
        Err(TransportError::Stall)
    }

    fn max_transfer_size(&self) -> usize {
        self.config.max_transfer.max(HEADER_LEN + 1)
    }

    fn delay(&mut self, _duration: Duration) {}
}
