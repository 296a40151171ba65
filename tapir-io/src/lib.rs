//! Host side of the fabric bridge: transports, the register-bus frame codec,
//! and the register bus itself.

mod bits;
pub mod bus;
mod error;
pub mod fake;
pub mod frame;
mod transport;
pub mod usb;
mod utils;

pub use crate::{
    bits::{high_nibble_ones, low_nibble, merge_masked, reverse_bits_in_place},
    bus::{RegisterAccess, RegisterBus},
    error::{Error, Result},
    transport::{Buffer, ControlChannel, ControlRequest, Transport},
    utils::{Hex, ShortHex, SpaceHex},
};
