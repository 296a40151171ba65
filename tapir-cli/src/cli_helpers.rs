use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use color_eyre::eyre::OptionExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbAddr {
    pub vid: u16,
    pub pid: u16,
}

impl FromStr for UsbAddr {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (vid, pid) = s.split_once(':').ok_or_eyre("no ':'")?;
        let vid = u16::from_str_radix(vid, 16)?;
        let pid = u16::from_str_radix(pid, 16)?;
        Ok(Self { vid, pid })
    }
}

impl Display for UsbAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vid, self.pid)
    }
}

/// `0x`-prefixed hex or decimal.
pub fn parse_int<T>(s: &str) -> color_eyre::Result<T>
where
    T: TryFrom<u64>,
    T::Error: std::error::Error + Send + Sync + 'static,
{
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16)?,
        None => s.replace('_', "").parse()?,
    };
    Ok(T::try_from(value)?)
}
