use std::{io, time::Duration};

use futures_lite::{AsyncRead, AsyncReadExt};
use nusb::transfer::{self, ControlIn, ControlOut, ControlType, Recipient, TransferError};
use tracing::debug;

use crate::{ControlChannel, ControlRequest, Error, Result, SpaceHex, Transport};

const CHUNK_SIZE: usize = 1024;

/// Open the first device matching `vid:pid`.
#[tracing::instrument]
pub async fn open(vid: u16, pid: u16) -> Result<nusb::Device> {
    let info = nusb::list_devices()
        .await?
        .find(|d| d.vendor_id() == vid && d.product_id() == pid)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no device {vid:04X}:{pid:04X}"),
            )
        })?;
    debug!(?info, "found device");
    Ok(info.open().await?)
}

/// Claim `interface`, detaching any kernel driver bound to it first.
#[tracing::instrument(skip(device))]
pub async fn claim(device: &nusb::Device, interface: u8) -> Result<nusb::Interface> {
    let _ = device.detach_kernel_driver(interface);
    Ok(device.claim_interface(interface).await?)
}

/// A bulk OUT/IN endpoint pair.
pub struct BulkTransport {
    iface: nusb::Interface,
    out_ep: u8,
    in_ep: u8,
}

impl BulkTransport {
    /// `out_ep` and `in_ep` are endpoint addresses; bit 7 of `in_ep` is set
    /// if missing.
    pub fn new(iface: nusb::Interface, out_ep: u8, in_ep: u8) -> Self {
        Self {
            iface,
            out_ep: out_ep & 0x7f,
            in_ep: in_ep | 0x80,
        }
    }
}

fn map_io(err: io::Error, timeout: Duration) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut => Error::Timeout(timeout),
        io::ErrorKind::UnexpectedEof => Error::protocol("endpoint closed mid-reply"),
        _ => Error::Io(err),
    }
}

fn map_transfer(err: TransferError, timeout: Duration) -> Error {
    match err {
        TransferError::Cancelled => Error::Timeout(timeout),
        err => Error::Transfer(err),
    }
}

/// Fill `buf` until it is full or `reader` reports the end of the transfer.
async fn read_to_end_of_transfer(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut [u8],
) -> io::Result<usize> {
    let mut len = 0;
    while len < buf.len() {
        match reader.read(&mut buf[len..]).await? {
            0 => break,
            n => len += n,
        }
    }
    Ok(len)
}

impl Transport for BulkTransport {
    #[tracing::instrument(skip_all)]
    async fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        use futures_lite::AsyncWriteExt;
        let mut writer = self
            .iface
            .endpoint::<transfer::Bulk, transfer::Out>(self.out_ep)?
            .writer(CHUNK_SIZE)
            .with_write_timeout(timeout);
        debug!(len = data.len(), data = %SpaceHex(data), "writing");
        writer.write_all(data).await.map_err(|e| map_io(e, timeout))?;
        writer.flush().await.map_err(|e| map_io(e, timeout))?;
        Ok(())
    }

    /// Stops at the first short packet, so a short reply comes back as a
    /// short count instead of waiting out the timeout.
    #[tracing::instrument(skip_all)]
    async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut reader = self
            .iface
            .endpoint::<transfer::Bulk, transfer::In>(self.in_ep)?
            .reader(CHUNK_SIZE)
            .with_read_timeout(timeout);
        let len = read_to_end_of_transfer(&mut reader.until_short_packet(), buf)
            .await
            .map_err(|e| map_io(e, timeout))?;
        debug!(len, data = %SpaceHex(&buf[..len]), "read");
        Ok(len)
    }
}

/// Vendor requests on the control endpoint, addressed to the device.
pub struct UsbControl {
    iface: nusb::Interface,
}

impl UsbControl {
    pub fn new(iface: nusb::Interface) -> Self {
        Self { iface }
    }
}

impl ControlChannel for UsbControl {
    #[tracing::instrument(skip(self, data), fields(len = data.len()))]
    async fn control_write(
        &mut self,
        req: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let out = ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: req.request,
            value: req.value,
            index: req.index,
            data,
        };
        self.iface
            .control_out(out, timeout)
            .await
            .map_err(|e| map_transfer(e, timeout))?;
        Ok(data.len())
    }

    #[tracing::instrument(skip(self, buf), fields(len = buf.len()))]
    async fn control_read(
        &mut self,
        req: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let length = u16::try_from(buf.len())
            .map_err(|_| Error::invalid_parameter("control read longer than 64 KiB"))?;
        let in_ = ControlIn {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: req.request,
            value: req.value,
            index: req.index,
            length,
        };
        let data = self
            .iface
            .control_in(in_, timeout)
            .await
            .map_err(|e| map_transfer(e, timeout))?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        debug!(len, data = %SpaceHex(&buf[..len]), "control in");
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping() {
        let t = Duration::from_millis(5);
        let e = map_io(io::Error::from(io::ErrorKind::TimedOut), t);
        assert!(matches!(e, Error::Timeout(d) if d == t));
        let e = map_io(io::Error::from(io::ErrorKind::UnexpectedEof), t);
        assert!(matches!(e, Error::Protocol(_)));
        let e = map_io(io::Error::from(io::ErrorKind::BrokenPipe), t);
        assert!(matches!(e, Error::Io(_)));

        assert!(map_transfer(TransferError::Cancelled, t).is_timeout());
        assert!(matches!(
            map_transfer(TransferError::Stall, t),
            Error::Transfer(TransferError::Stall)
        ));
    }

    #[test]
    fn short_transfer_returns_short_count() {
        smol::block_on(async {
            let mut buf = [0; 6];
            let mut short = futures_lite::io::Cursor::new(vec![5, 0x02, 0x44]);
            assert_eq!(read_to_end_of_transfer(&mut short, &mut buf).await.unwrap(), 3);
            assert_eq!(buf[..3], [5, 0x02, 0x44]);

            let mut long = futures_lite::io::Cursor::new(vec![1; 10]);
            assert_eq!(read_to_end_of_transfer(&mut long, &mut buf).await.unwrap(), 6);

            let mut empty = futures_lite::io::Cursor::new(Vec::new());
            assert_eq!(read_to_end_of_transfer(&mut empty, &mut buf).await.unwrap(), 0);
        });
    }
}
