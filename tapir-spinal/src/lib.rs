//! Drivers for the peripheral modules behind the register bus.

pub mod atr;
pub mod gpio;
pub mod iomux;
pub mod iso7816;
pub mod pwm;
pub mod spi;

pub use crate::{
    atr::{Atr, AtrError, receive_atr},
    gpio::Gpio,
    iomux::Iomux,
    iso7816::Iso7816Master,
    pwm::Pwm,
    spi::SpiMaster,
};
