use std::{borrow::Cow, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A value the caller passed cannot be represented on the wire.
    #[error("invalid parameter: {0}")]
    InvalidParameter(Cow<'static, str>),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Reply was short, malformed, or reported a failure.
    #[error("protocol error: {0}")]
    Protocol(Cow<'static, str>),

    #[error("transfer failed: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    #[error("usb error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn invalid_parameter(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn protocol(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
