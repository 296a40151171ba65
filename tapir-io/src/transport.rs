use std::time::Duration;

use crate::Result;

/// A duplex byte channel to the fabric, e.g. a pair of bulk endpoints.
///
/// Every call is bounded by `timeout`. After a timeout the channel is in an
/// unspecified state and should be reopened before further use.
pub trait Transport {
    /// Send all of `data`, or fail.
    fn send(&mut self, data: &[u8], timeout: Duration) -> impl Future<Output = Result<()>>;

    /// Receive up to `buf.len()` bytes in a single bounded receive, returning
    /// the number of bytes that arrived.
    ///
    /// Bytes that arrive after this call returns are not kept for the next
    /// call, so callers must ask for the whole reply at once.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> impl Future<Output = Result<usize>>;
}

/// Vendor control request addressed to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    pub const fn new(request: u8) -> Self {
        Self {
            request,
            value: 0,
            index: 0,
        }
    }

    pub const fn with_value(self, value: u16) -> Self {
        Self { value, ..self }
    }

    pub const fn with_index(self, index: u16) -> Self {
        Self { index, ..self }
    }
}

/// The control endpoint of a device.
pub trait ControlChannel {
    /// Returns the number of bytes the device accepted.
    ///
    /// USB control transfers either complete or fail, so [`crate::usb::UsbControl`]
    /// always reports the full length; only a fake can acknowledge less.
    fn control_write(
        &mut self,
        req: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<usize>>;

    /// Returns the number of bytes written into `buf`.
    fn control_read(
        &mut self,
        req: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<usize>>;
}

pub trait Buffer {
    /// Extend the buffer, returning a mutable slice to the newly-allocated
    /// memory
    fn extend(&mut self, size: usize) -> &mut [u8];
}

impl<T: Transport> Transport for &mut T {
    fn send(&mut self, data: &[u8], timeout: Duration) -> impl Future<Output = Result<()>> {
        T::send(&mut **self, data, timeout)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> impl Future<Output = Result<usize>> {
        T::recv(&mut **self, buf, timeout)
    }
}

impl<C: ControlChannel> ControlChannel for &mut C {
    fn control_write(
        &mut self,
        req: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<usize>> {
        C::control_write(&mut **self, req, data, timeout)
    }

    fn control_read(
        &mut self,
        req: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<usize>> {
        C::control_read(&mut **self, req, buf, timeout)
    }
}

impl Buffer for Vec<u8> {
    fn extend(&mut self, size: usize) -> &mut [u8] {
        let len = self.len();
        self.resize(len + size, 0);
        &mut self[len..]
    }
}
