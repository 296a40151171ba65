//! ISO7816-3 Answer-To-Reset.
//!
//! ```text
//! TS T0 [TA1 TB1 TC1 TD1] [TA2 TB2 TC2 TD2] ... T1..TK [TCK]
//! ```
//!
//! The high nibble of T0 and of every TDi flags which of the next group's
//! interface bytes follow. The low nibble of T0 is the number of historical
//! bytes K; the low nibble of a TDi is a protocol T. TCK is present unless
//! only T=0 is indicated.

use std::fmt;

use tapir_io::{Error, SpaceHex, high_nibble_ones, low_nibble};
use thiserror::Error;
use tracing::debug;

/// Direct convention initial character.
pub const INITIAL_BYTE: u8 = 0x3b;
pub const MAX_ATR_LEN: usize = 32;

const TD_PRESENT: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AtrError {
    #[error("unexpected initial byte {0:#04x}")]
    InitialByte(u8),
    #[error("declared length {0} exceeds {MAX_ATR_LEN} bytes")]
    TooLong(usize),
    #[error("receive failed after {0} bytes")]
    Receive(usize),
}

impl From<AtrError> for Error {
    fn from(e: AtrError) -> Self {
        Error::protocol(e.to_string())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Atr {
    buf: [u8; MAX_ATR_LEN],
    len: usize,
    historical: usize,
    has_check_byte: bool,
    /// Bit `t` set when protocol T=t was declared.
    protocols: u16,
}

impl Atr {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn historical_bytes(&self) -> &[u8] {
        let end = self.len - usize::from(self.has_check_byte);
        &self.buf[end - self.historical..end]
    }

    pub fn check_byte(&self) -> Option<u8> {
        self.has_check_byte.then(|| self.buf[self.len - 1])
    }

    /// Protocols declared by the TD bytes, ascending.
    pub fn protocols(&self) -> impl Iterator<Item = u8> + '_ {
        (0..16).filter(|t| self.protocols & (1 << t) != 0)
    }

    /// `None` without a check byte, otherwise whether T0..TCK XOR to zero.
    pub fn checksum_ok(&self) -> Option<bool> {
        self.has_check_byte
            .then(|| self.as_bytes()[1..].iter().fold(0, |acc, b| acc ^ b) == 0)
    }
}

impl fmt::Debug for Atr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atr({})", SpaceHex(self.as_bytes()))
    }
}

/// Receive an ATR through `recv`, which must fill the whole slice it is given
/// or return `false`.
///
/// Exactly the bytes the ATR declares are requested, so nothing following
/// it is consumed.
pub async fn receive_atr(mut recv: impl AsyncFnMut(&mut [u8]) -> bool) -> Result<Atr, AtrError> {
    let mut buf = [0; MAX_ATR_LEN];
    let mut consumed = 0;

    let mut take = async |buf: &mut [u8; MAX_ATR_LEN], consumed: &mut usize, n: usize| {
        if n == 0 {
            return Ok(());
        }
        let end = *consumed + n;
        if end > MAX_ATR_LEN {
            return Err(AtrError::TooLong(end));
        }
        if !recv(&mut buf[*consumed..end]).await {
            return Err(AtrError::Receive(*consumed));
        }
        *consumed = end;
        Ok(())
    };

    take(&mut buf, &mut consumed, 2).await?;
    if buf[0] != INITIAL_BYTE {
        return Err(AtrError::InitialByte(buf[0]));
    }
    let historical = usize::from(low_nibble(buf[1]));
    let mut td = buf[1];
    let mut protocols = 0u16;
    let mut needs_check_byte = false;

    loop {
        let n = high_nibble_ones(td);
        if n == 0 {
            break;
        }
        take(&mut buf, &mut consumed, n).await?;
        if td & TD_PRESENT == 0 {
            break;
        }
        td = buf[consumed - 1];
        let protocol = low_nibble(td);
        protocols |= 1 << protocol;
        if protocol != 0 {
            needs_check_byte = true;
        }
    }

    take(&mut buf, &mut consumed, historical).await?;
    if needs_check_byte {
        take(&mut buf, &mut consumed, 1).await?;
    }

    let atr = Atr {
        buf,
        len: consumed,
        historical,
        has_check_byte: needs_check_byte,
        protocols,
    };
    debug!(?atr, "received");
    Ok(atr)
}
