//! Transport abstraction
//!
//! A [`Transport`] is an already-opened pipe to a device in mask-ROM mode.
//! The session exchanges frames over the bulk methods and uses the control
//! methods for out-of-band vendor requests. Implementations live in other
//! crates (USB in `k230boot-usb`, a simulated ROM in `k230boot-dummy`).

use std::time::Duration;

use crate::error::TransportError;

/// Vendor control request asking the ROM to discard a half-received frame
pub const REQUEST_RESYNC: u8 = 0x06;

/// Blocking byte transport to the mask ROM
///
/// Every transfer carries its own timeout. Implementations must not retry
/// internally; retry policy belongs to the session.
pub trait Transport {
    /// Write `data` to the bulk OUT endpoint
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes from the bulk IN endpoint
    ///
    /// Returns the number of bytes received.
    fn bulk_in(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Issue a vendor control-out request to the device
    ///
    /// The 32-bit `arg` is split by the implementation into `wValue`
    /// (high half) and `wIndex` (low half).
    fn control_out(
        &mut self,
        request: u8,
        arg: u32,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Issue a vendor control-in request, filling up to `buf.len()` bytes
    ///
    /// Returns the number of bytes received. `arg` is split as for
    /// [`Transport::control_out`].
    fn control_in(
        &mut self,
        request: u8,
        arg: u32,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Largest single bulk transfer, header included
    fn max_transfer_size(&self) -> usize;

    /// Sleep between retries
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        (**self).bulk_out(data, timeout)
    }

    fn bulk_in(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).bulk_in(buf, timeout)
    }

    fn control_out(
        &mut self,
        request: u8,
        arg: u32,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        (**self).control_out(request, arg, data, timeout)
    }

    fn control_in(
        &mut self,
        request: u8,
        arg: u32,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        (**self).control_in(request, arg, buf, timeout)
    }

    fn max_transfer_size(&self) -> usize {
        (**self).max_transfer_size()
    }

    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        (**self).bulk_out(data, timeout)
    }

    fn bulk_in(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).bulk_in(buf, timeout)
    }

    fn control_out(
        &mut self,
        request: u8,
        arg: u32,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        (**self).control_out(request, arg, data, timeout)
    }

    fn control_in(
        &mut self,
        request: u8,
        arg: u32,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        (**self).control_in(request, arg, buf, timeout)
    }

    fn max_transfer_size(&self) -> usize {
        (**self).max_transfer_size()
    }

    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
}
