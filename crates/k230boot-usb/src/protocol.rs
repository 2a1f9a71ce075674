//! K230 USB loader constants
//!
//! The mask ROM enumerates as a vendor device with a single interface
//! carrying one bulk IN and one bulk OUT endpoint. It is driven entirely by
//! vendor requests on EP0; the bulk OUT pipe only carries raw memory data
//! and the ROM never answers on bulk IN.

use std::time::Duration;

use nusb::Speed;

/// Kendryte USB vendor ID
pub const KENDRYTE_USB_VENDOR: u16 = 0x29f1;
/// Product ID of the K230 / K230D boot ROM loader
pub const K230_ROM_USB_PRODUCT: u16 = 0x0230;

/// How long to keep retrying the interface claim
///
/// The ROM re-enumerates right after reset and the OS may still hold the
/// interface for a moment.
pub const CLAIM_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause between claim attempts
pub const CLAIM_RETRY_INTERVAL: Duration = Duration::from_micros(200);

/// Vendor control-in: read the 32-byte CPU info string
pub const REQUEST_GET_CPU_INFO: u8 = 0x00;
/// Vendor control-out: set the destination of following bulk data
pub const REQUEST_SET_DATA_ADDRESS: u8 = 0x01;
/// Vendor control-out: write back and invalidate the CPU caches
pub const REQUEST_FLUSH_CACHES: u8 = 0x03;
/// Vendor control-out: jump to the given address
pub const REQUEST_PROG_START: u8 = 0x04;

/// Largest bulk transfer, in packets
pub const PACKETS_PER_TRANSFER: usize = 128;

/// Bulk max packet size for a bus speed
pub fn packet_size(speed: Speed) -> Option<usize> {
    match speed {
        Speed::Low | Speed::Full => Some(64),
        Speed::High => Some(512),
        Speed::Super | Speed::SuperPlus => Some(1024),
        _ => None,
    }
}

/// Split a 32-bit vendor request argument into `(wValue, wIndex)`
pub fn split_arg(arg: u32) -> (u16, u16) {
    ((arg >> 16) as u16, arg as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_size() {
        assert_eq!(packet_size(Speed::Full), Some(64));
        assert_eq!(packet_size(Speed::Low), Some(64));
        assert_eq!(packet_size(Speed::High), Some(512));
        assert_eq!(packet_size(Speed::Super), Some(1024));
        assert_eq!(packet_size(Speed::SuperPlus), Some(1024));
    }

    #[test]
    fn test_split_arg() {
        assert_eq!(split_arg(0x8036_0000), (0x8036, 0x0000));
        assert_eq!(split_arg(0x9120_1234), (0x9120, 0x1234));
    }
}
