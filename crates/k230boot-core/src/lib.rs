//! k230boot-core - USB mask-ROM boot protocol engine
//!
//! This crate drives the boot ROM of a Kendryte K230 / K230D SoC: it frames
//! commands, performs the handshake and identification exchange, stages
//! firmware into SRAM and DRAM, and hands off execution. It never enumerates
//! USB devices or opens files itself; callers supply an already-opened
//! [`Transport`] and an [`ImageSet`].
//!
//! # Layers
//!
//! - [`frame`] - bit-exact command/response framing with CRC-32 checksums
//! - [`sequencer`] - turns a [`BootPlan`] into a validated [`WritePlan`]
//!   before any device I/O happens
//! - [`session`] - the protocol state machine
//!
//! # Example
//!
//! ```ignore
//! use k230boot_core::{BootPlan, NoProgress, Region, Sequencer, Session, SessionConfig};
//! use k230boot_core::{SourceRange, StageDescriptor, StageFlags};
//!
//! let plan = BootPlan::new().stage(
//!     StageDescriptor::new("spl", Region::sram(0x8030_0000, 0x10_0000), SourceRange::new("spl", 0, len))
//!         .with_flags(StageFlags::EXECUTE),
//! );
//!
//! let mut session = Session::new(transport, SessionConfig::default());
//! let writes = Sequencer::new(session.chunk_size()).build(&plan, &images)?;
//! let summary = session.run(&writes, &mut NoProgress)?;
//! println!("booted {} ({} stages)", summary.chip, summary.stages_completed);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod chip;
pub mod error;
pub mod frame;
pub mod image;
pub mod plan;
pub mod progress;
pub mod sequencer;
pub mod session;
pub mod transport;

pub use chip::{ChipFamily, ChipIdentity, ProtocolVersion};
pub use error::{FrameError, ImageError, PlanError, ProtocolError, Result, TransportError};
pub use image::{ImageSet, ImageSource};
pub use plan::{
    BootPlan, MemoryKind, MemoryMap, MemoryWindow, Region, SourceRange, StageDescriptor,
    StageFlags,
};
pub use progress::{BootProgress, NoProgress};
pub use sequencer::{Chunk, Sequencer, StageWrite, WritePlan};
pub use session::{CancelToken, Session, SessionConfig, SessionState, SessionSummary};
pub use transport::Transport;
