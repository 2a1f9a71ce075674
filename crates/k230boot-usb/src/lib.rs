//! k230boot-usb - USB transport for the K230 mask-ROM loader
//!
//! When a K230 or K230D is strapped for USB boot, its mask ROM enumerates
//! as VID:29f1 PID:0230 with one vendor interface holding a bulk IN and a
//! bulk OUT endpoint. This crate finds that device and claims the interface
//! ([`K230Usb`]), and translates session frames into the ROM's vendor
//! requests ([`RomBridge`]).
//!
//! # Example
//!
//! ```no_run
//! use k230boot_core::{Session, SessionConfig};
//! use k230boot_usb::{K230Usb, RomBridge};
//!
//! let usb = K230Usb::open()?;
//! let mut session = Session::new(RomBridge::new(usb), SessionConfig::default());
//! session.handshake()?;
//! let chip = session.identify()?;
//! println!("Found {}", chip);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod bridge;
mod device;
mod error;
pub mod protocol;

pub use bridge::{RomBridge, ROM_PROTOCOL};
pub use device::{K230DeviceInfo, K230Usb, UsbConfig};
pub use error::{Result, UsbError};
