use std::time::Duration;

use bitflags::bitflags;
use tapir_io::{Error, RegisterAccess, Result, SpaceHex};
use tracing::debug;

mod reg {
    pub const INFO: u32 = 0x00;
    pub const FREQUENCY: u32 = 0x04;
    pub const PRESCALER_WIDTH: u32 = 0x0c;
    pub const STATUS: u32 = 0x10;
    pub const CONFIG: u32 = 0x18;
    pub const TRIGGER: u32 = 0x1c;
    pub const RX: u32 = 0x20;
    pub const TX: u32 = 0x24;

    pub const CONFIG_CPHA: u32 = 0x0001;
    pub const CONFIG_CPOL: u32 = 0x0002;
    pub const CONFIG_DIVIDER_POS: u32 = 2;
    pub const CONFIG_DIVIDER_MSK: u32 = 0xfffc;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const BUSY = 0x0001;
        const RX_OVERFLOW = 0x0002;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Trigger: u32 {
        const START = 0x0001;
        const FLUSH_RX = 0x0002;
        const FLUSH_TX = 0x0004;
    }
}

/// Clock level while idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    IdleLow,
    IdleHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    FirstEdgeShifts,
    FirstEdgeLatches,
}

/// Upper bound on a single transfer.
pub const TRANSFER_DEADLINE: Duration = Duration::from_secs(1);

pub struct SpiMaster<B> {
    bus: B,
    base: u32,
    module_frequency: u32,
    divider_width: u32,
}

impl<B: RegisterAccess> SpiMaster<B> {
    /// Read the module parameters and flush both FIFOs.
    #[tracing::instrument(skip(bus))]
    pub async fn new(mut bus: B, base: u32) -> Result<Self> {
        let module_frequency = bus.read(base + reg::FREQUENCY).await?;
        let divider_width = bus.read(base + reg::PRESCALER_WIDTH).await?;
        debug!(module_frequency, divider_width);
        let flush = Trigger::FLUSH_RX | Trigger::FLUSH_TX;
        bus.write(base + reg::TRIGGER, flush.bits()).await?;
        Ok(Self {
            bus,
            base,
            module_frequency,
            divider_width,
        })
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    pub fn module_frequency(&self) -> u32 {
        self.module_frequency
    }

    /// Raw identification word of the module.
    pub async fn info(&mut self) -> Result<u32> {
        self.bus.read(self.base + reg::INFO).await
    }

    pub async fn status(&mut self) -> Result<Status> {
        let raw = self.bus.read(self.base + reg::STATUS).await?;
        Ok(Status::from_bits_retain(raw))
    }

    fn divider(&self, hz: u32) -> Result<u32> {
        let too_low = || Error::invalid_parameter(format!("SPI frequency {hz} Hz too low"));
        let divider = self.module_frequency.checked_div(hz).ok_or_else(too_low)?;
        if divider < 1 {
            return Err(Error::invalid_parameter(format!(
                "SPI frequency {hz} Hz too high"
            )));
        }
        let width_limit = 1u64.checked_shl(self.divider_width).unwrap_or(u64::MAX);
        let field_limit = u64::from(reg::CONFIG_DIVIDER_MSK >> reg::CONFIG_DIVIDER_POS) + 1;
        if u64::from(divider) >= width_limit.min(field_limit) {
            return Err(too_low());
        }
        Ok(divider)
    }

    fn frequency_of(&self, divider: u32) -> u32 {
        self.module_frequency.checked_div(divider).unwrap_or(0)
    }

    /// Returns the frequency actually configured.
    #[tracing::instrument(skip(self))]
    pub async fn configure(&mut self, polarity: Polarity, phase: Phase, hz: u32) -> Result<u32> {
        let divider = self.divider(hz)?;
        let mut config = divider << reg::CONFIG_DIVIDER_POS;
        if polarity == Polarity::IdleHigh {
            config |= reg::CONFIG_CPOL;
        }
        if phase == Phase::FirstEdgeLatches {
            config |= reg::CONFIG_CPHA;
        }
        self.bus.write(self.base + reg::CONFIG, config).await?;
        Ok(self.frequency_of(divider))
    }

    pub async fn polarity(&mut self) -> Result<Polarity> {
        let config = self.bus.read(self.base + reg::CONFIG).await?;
        Ok(if config & reg::CONFIG_CPOL != 0 {
            Polarity::IdleHigh
        } else {
            Polarity::IdleLow
        })
    }

    pub async fn set_polarity(&mut self, polarity: Polarity) -> Result<()> {
        let value = match polarity {
            Polarity::IdleLow => 0,
            Polarity::IdleHigh => reg::CONFIG_CPOL,
        };
        self.bus
            .read_modify_write(self.base + reg::CONFIG, reg::CONFIG_CPOL, value)
            .await
    }

    pub async fn phase(&mut self) -> Result<Phase> {
        let config = self.bus.read(self.base + reg::CONFIG).await?;
        Ok(if config & reg::CONFIG_CPHA != 0 {
            Phase::FirstEdgeLatches
        } else {
            Phase::FirstEdgeShifts
        })
    }

    pub async fn set_phase(&mut self, phase: Phase) -> Result<()> {
        let value = match phase {
            Phase::FirstEdgeShifts => 0,
            Phase::FirstEdgeLatches => reg::CONFIG_CPHA,
        };
        self.bus
            .read_modify_write(self.base + reg::CONFIG, reg::CONFIG_CPHA, value)
            .await
    }

    pub async fn frequency(&mut self) -> Result<u32> {
        let config = self.bus.read(self.base + reg::CONFIG).await?;
        let divider = (config & reg::CONFIG_DIVIDER_MSK) >> reg::CONFIG_DIVIDER_POS;
        Ok(self.frequency_of(divider))
    }

    /// Returns the frequency actually configured.
    pub async fn set_frequency(&mut self, hz: u32) -> Result<u32> {
        let divider = self.divider(hz)?;
        self.bus
            .read_modify_write(
                self.base + reg::CONFIG,
                reg::CONFIG_DIVIDER_MSK,
                divider << reg::CONFIG_DIVIDER_POS,
            )
            .await?;
        Ok(self.frequency_of(divider))
    }

    async fn run(&mut self, tx: &[u8]) -> Result<()> {
        self.bus.write_stream(self.base + reg::TX, tx).await?;
        self.bus
            .write(self.base + reg::TRIGGER, Trigger::START.bits())
            .await?;
        let idle = self
            .bus
            .poll(
                self.base + reg::STATUS,
                Status::BUSY.bits(),
                0,
                TRANSFER_DEADLINE,
            )
            .await?;
        if !idle {
            return Err(Error::Timeout(TRANSFER_DEADLINE));
        }
        Ok(())
    }

    /// Clock out `tx` and collect `rx.len()` received bytes. `rx` must be
    /// at least as long as `tx`.
    #[tracing::instrument(skip_all, fields(tx = tx.len(), rx = rx.len()))]
    pub async fn transceive(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        if rx.len() < tx.len() {
            return Err(Error::invalid_parameter("rx buffer shorter than tx"));
        }
        debug!(data = %SpaceHex(tx), "tx");
        self.run(tx).await?;
        self.bus.read_stream(self.base + reg::RX, rx).await?;
        debug!(data = %SpaceHex(rx), "rx");
        Ok(())
    }

    /// Clock out `tx`, leaving received bytes in the FIFO.
    pub async fn send(&mut self, tx: &[u8]) -> Result<()> {
        debug!(data = %SpaceHex(tx), "tx");
        self.run(tx).await
    }

    /// Clock out zeros while receiving.
    pub async fn recv(&mut self, rx: &mut [u8]) -> Result<()> {
        let dummy = vec![0; rx.len()];
        self.transceive(&dummy, rx).await
    }
}
