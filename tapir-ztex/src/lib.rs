//! Firmware commands of ZTEX-style FPGA modules, spoken over the USB control
//! endpoint.

use std::{fmt, time::Duration};

use tapir_io::{ControlChannel, ControlRequest, Error, Hex, Result};
use tracing::{debug, warn};

pub mod bitstream;

pub use crate::bitstream::{Bitstream, upload};

pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(1500);

/// Vendor request codes understood by the firmware.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr, strum::VariantArray)]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    Usb3Errors = 0x29,

    FpgaInfo = 0x30,
    FpgaReset = 0x31,
    FpgaSend = 0x32,
    FpgaFastInfo = 0x33,
    FpgaFastStart = 0x34,
    FpgaFastFinish = 0x35,

    MacEepromRead = 0x3b,
    MacEepromWrite = 0x3c,
    MacEepromInfo = 0x3d,

    FlashInfo = 0x40,
    FlashRead = 0x41,
    FlashWrite = 0x42,
    FlashInfo2 = 0x43,
    Flash2Info = 0x44,
    Flash2Read = 0x45,
    Flash2Write = 0x46,

    ResetToggle = 0x60,
    GpioCtrl = 0x61,
    LsiWrite = 0x62,
    LsiRead = 0x63,
    LsiInfo = 0x64,
}

impl Command {
    pub const fn request(self) -> ControlRequest {
        ControlRequest::new(self as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub fx_version: u8,
    pub board_series: u8,
    pub board_number: u8,
    pub board_variant: String,
    /// Zero when the firmware has no fast configuration.
    pub fast_config_ep: u8,
    pub fast_config_if: u8,
    pub default_version1: u8,
    pub default_version2: u8,
    /// Bulk OUT endpoint of the default interface, bit 7 clear.
    pub default_out_ep: u8,
    /// Bulk IN endpoint of the default interface, bit 7 set.
    pub default_in_ep: u8,
}

impl DeviceInfo {
    pub fn supports_fast_config(&self) -> bool {
        self.fast_config_ep != 0
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "board: {}.{:02}{} (fx{})",
            self.board_series, self.board_number, self.board_variant, self.fx_version
        )?;
        writeln!(
            f,
            "default interface: v{}.{} out {} in {}",
            self.default_version1,
            self.default_version2,
            Hex(self.default_out_ep),
            Hex(self.default_in_ep)
        )?;
        if self.supports_fast_config() {
            write!(
                f,
                "fast config: ep {} if {}",
                Hex(self.fast_config_ep),
                self.fast_config_if
            )
        } else {
            write!(f, "fast config: unsupported")
        }
    }
}

const CONFIG_LEN: usize = 128;
const CONFIG_MAGIC: &[u8; 3] = b"CD0";

#[tracing::instrument(skip_all)]
pub async fn device_info<C: ControlChannel>(ctrl: &mut C) -> Result<DeviceInfo> {
    // Firmware without fast configuration does not answer this request at all.
    let mut buf = [0; CONFIG_LEN];
    let (fast_config_ep, fast_config_if) = match ctrl
        .control_read(Command::FpgaFastInfo.request(), &mut buf, CONTROL_TIMEOUT)
        .await
    {
        Ok(len) => (
            if len >= 1 { buf[0] } else { 0 },
            if len == 2 { buf[1] } else { 0 },
        ),
        Err(e) => {
            warn!(error = %e, "no fast configuration");
            (0, 0)
        }
    };

    let mut buf = [0; CONFIG_LEN];
    let len = ctrl
        .control_read(Command::MacEepromRead.request(), &mut buf, CONTROL_TIMEOUT)
        .await?;
    if len != CONFIG_LEN || !buf.starts_with(CONFIG_MAGIC) {
        return Err(Error::protocol("invalid configuration descriptor"));
    }
    let board_variant = String::from_utf8_lossy(&buf[6..8])
        .trim_end_matches('\0')
        .to_owned();

    let mut intf = [0; CONFIG_LEN];
    let intf_len = ctrl
        .control_read(Command::LsiInfo.request(), &mut intf, CONTROL_TIMEOUT)
        .await?;
    if intf_len < 2 || intf[0] == 0 {
        return Err(Error::protocol("invalid interface configuration"));
    }

    let info = DeviceInfo {
        fx_version: buf[3],
        board_series: buf[4],
        board_number: buf[5],
        board_variant,
        fast_config_ep,
        fast_config_if,
        default_version1: intf[0],
        default_version2: if intf_len > 3 { intf[3] } else { 0 },
        default_out_ep: intf[1] & 0x7f,
        default_in_ep: intf[2] | 0x80,
    };
    debug!(?info);
    Ok(info)
}

/// Whether the FPGA reports a loaded configuration.
#[tracing::instrument(skip_all)]
pub async fn is_configured<C: ControlChannel>(ctrl: &mut C) -> Result<bool> {
    let mut buf = [0; 16];
    let len = ctrl
        .control_read(Command::FpgaInfo.request(), &mut buf, CONTROL_TIMEOUT)
        .await?;
    if len == 0 {
        return Err(Error::protocol("empty FPGA state reply"));
    }
    debug!(state = %Hex(buf[0]));
    Ok(buf[0] == 0)
}

/// Drive the firmware GPIOs selected by `mask` to `value`, returning the
/// pin state the firmware reports back.
#[tracing::instrument(skip(ctrl))]
pub async fn ctrl_gpio<C: ControlChannel>(ctrl: &mut C, mask: u8, value: u8) -> Result<u8> {
    let req = Command::GpioCtrl
        .request()
        .with_value(value.into())
        .with_index(mask.into());
    let mut buf = [0; 8];
    let len = ctrl.control_read(req, &mut buf, CONTROL_TIMEOUT).await?;
    if len == 0 {
        return Err(Error::protocol("empty GPIO reply"));
    }
    Ok(buf[0])
}

/// Assert (`leave == false`) or release the FPGA reset line.
#[tracing::instrument(skip(ctrl))]
pub async fn reset_fpga<C: ControlChannel>(ctrl: &mut C, leave: bool) -> Result<()> {
    let req = Command::ResetToggle.request().with_value(leave.into());
    ctrl.control_write(req, &[], CONTROL_TIMEOUT).await?;
    Ok(())
}
