//! ISO7816 smart-card interface master.
//!
//! All timings are programmed as dividers of the module clock.

use std::time::{Duration, Instant};

use bitflags::bitflags;
use tapir_io::{Error, RegisterAccess, Result, bus::POLL_INTERVAL};
use tracing::debug;

use crate::atr::{self, Atr};

mod reg {
    pub const FREQUENCY: u32 = 0x00;
    pub const BUFFER_SIZES: u32 = 0x04;
    pub const STATUS: u32 = 0x08;
    pub const CONFIG: u32 = 0x0c;
    pub const TRIGGER: u32 = 0x10;
    pub const CLOCKRATE: u32 = 0x14;
    pub const TA: u32 = 0x18;
    pub const TB: u32 = 0x1c;
    pub const TE: u32 = 0x20;
    pub const TH: u32 = 0x24;
    pub const VCC_OFFSET: u32 = 0x28;
    pub const CLK_OFFSET: u32 = 0x2c;
    pub const BUFFERS: u32 = 0x30;
    pub const RX_FIFO: u32 = 0x3c;
    pub const TX_FIFO: u32 = 0x40;
    pub const BLOCK_TIMEOUT: u32 = 0x44;
    pub const CHAR_TIMEOUT: u32 = 0x48;
    pub const DATARATE: u32 = 0x4c;

    pub const STATE_POS: u32 = 3;
    pub const CONFIG_CHARREP: u32 = 0x01;
    pub const CONFIG_CGT_POS: u32 = 1;
    pub const CONFIG_CGT_MSK: u32 = 0x1e;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const RX_ACTIVE = 0x001;
        const TX_ACTIVE = 0x002;
        const CHANGE_ACTIVE = 0x004;
        const STATE = 0x018;
        const RX_FIFO_OVERFLOW = 0x100;
        const TX_FIFO_STALL = 0x200;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Trigger: u32 {
        const RX = 0x01;
        const TX = 0x02;
        const RESET = 0x04;
        const DEACTIVATE = 0x08;
        const ACTIVATE = 0x10;
        const STOP_CLOCK = 0x20;
        const RX_FLUSH = 0x40;
        const TX_FLUSH = 0x80;

        const WARM_RESET = Self::RESET.bits() | Self::ACTIVATE.bits();
        const COLD_RESET = Self::DEACTIVATE.bits() | Self::ACTIVATE.bits();
    }
}

/// What the module is busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Idle,
    StateChange,
    Tx,
    Rx,
}

/// Electrical state of the card interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Inactive,
    Active,
    Reset,
    ClockStop,
}

impl Status {
    pub fn module_state(self) -> ModuleState {
        if self.contains(Self::RX_ACTIVE) {
            ModuleState::Rx
        } else if self.contains(Self::TX_ACTIVE) {
            ModuleState::Tx
        } else if self.contains(Self::CHANGE_ACTIVE) {
            ModuleState::StateChange
        } else {
            ModuleState::Idle
        }
    }

    pub fn interface_state(self) -> InterfaceState {
        match (self & Self::STATE).bits() >> reg::STATE_POS {
            0 => InterfaceState::Inactive,
            1 => InterfaceState::Active,
            2 => InterfaceState::Reset,
            _ => InterfaceState::ClockStop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Cold,
    Warm,
}

/// Activation and reset sequencing times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetTiming {
    pub ta: Duration,
    pub tb: Duration,
    pub te: Duration,
    pub th: Duration,
    pub vcc_offset: Duration,
    pub clk_offset: Duration,
}

pub struct Iso7816Master<B> {
    bus: B,
    base: u32,
    clock_frequency: u32,
    rx_buffer_size: u16,
    tx_buffer_size: u16,
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

impl<B: RegisterAccess> Iso7816Master<B> {
    #[tracing::instrument(skip(bus))]
    pub async fn new(mut bus: B, base: u32) -> Result<Self> {
        let clock_frequency = bus.read(base + reg::FREQUENCY).await?;
        if clock_frequency == 0 {
            return Err(Error::protocol("ISO7816 module reports a 0 Hz clock"));
        }
        let sizes = bus.read(base + reg::BUFFER_SIZES).await?;
        let rx_buffer_size = sizes as u16;
        let tx_buffer_size = (sizes >> 16) as u16;
        debug!(clock_frequency, rx_buffer_size, tx_buffer_size);
        Ok(Self {
            bus,
            base,
            clock_frequency,
            rx_buffer_size,
            tx_buffer_size,
        })
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    pub fn module_clock_frequency(&self) -> u32 {
        self.clock_frequency
    }

    pub fn rx_buffer_size(&self) -> u16 {
        self.rx_buffer_size
    }

    pub fn tx_buffer_size(&self) -> u16 {
        self.tx_buffer_size
    }

    async fn trigger(&mut self, trigger: Trigger) -> Result<()> {
        debug!(?trigger);
        self.bus
            .write(self.base + reg::TRIGGER, trigger.bits())
            .await
    }

    /// Power up the card, optionally arming the receiver.
    pub async fn activate(&mut self, receive: bool, flush_rx: bool) -> Result<()> {
        if flush_rx {
            self.trigger(Trigger::RX_FLUSH).await?;
        }
        let mut trigger = Trigger::ACTIVATE;
        trigger.set(Trigger::RX, receive);
        self.trigger(trigger).await
    }

    pub async fn deactivate(&mut self) -> Result<()> {
        self.trigger(Trigger::DEACTIVATE).await
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.trigger(Trigger::RESET).await
    }

    pub async fn stop_clock(&mut self) -> Result<()> {
        self.trigger(Trigger::STOP_CLOCK).await
    }

    /// Flush the receiver, then run a reset sequence.
    pub async fn reset_and_activate(&mut self, kind: ResetKind, receive: bool) -> Result<()> {
        self.trigger(Trigger::RX_FLUSH).await?;
        let mut trigger = match kind {
            ResetKind::Cold => Trigger::COLD_RESET,
            ResetKind::Warm => Trigger::WARM_RESET,
        };
        trigger.set(Trigger::RX, receive);
        self.trigger(trigger).await
    }

    pub async fn status(&mut self) -> Result<Status> {
        let raw = self.bus.read(self.base + reg::STATUS).await?;
        Ok(Status::from_bits_retain(raw))
    }

    pub async fn state(&mut self) -> Result<(ModuleState, InterfaceState)> {
        let status = self.status().await?;
        Ok((status.module_state(), status.interface_state()))
    }

    /// `false` if the module is still busy once `deadline` has passed.
    pub async fn wait_until_idle(&mut self, deadline: Duration) -> Result<bool> {
        let busy = Status::RX_ACTIVE | Status::TX_ACTIVE | Status::CHANGE_ACTIVE;
        self.bus
            .poll(self.base + reg::STATUS, busy.bits(), 0, deadline)
            .await
    }

    pub async fn character_repetition(&mut self) -> Result<bool> {
        let config = self.bus.read(self.base + reg::CONFIG).await?;
        Ok(config & reg::CONFIG_CHARREP != 0)
    }

    pub async fn set_character_repetition(&mut self, enable: bool) -> Result<()> {
        let value = if enable { reg::CONFIG_CHARREP } else { 0 };
        self.bus
            .read_modify_write(self.base + reg::CONFIG, reg::CONFIG_CHARREP, value)
            .await
    }

    /// Extra guard time between characters, in ETUs.
    pub async fn character_guard_time(&mut self) -> Result<u32> {
        let config = self.bus.read(self.base + reg::CONFIG).await?;
        Ok((config & reg::CONFIG_CGT_MSK) >> reg::CONFIG_CGT_POS)
    }

    pub async fn set_character_guard_time(&mut self, cgt: u32) -> Result<()> {
        let value = u64::from(cgt) << reg::CONFIG_CGT_POS;
        if value > u64::from(reg::CONFIG_CGT_MSK) {
            return Err(Error::invalid_parameter(format!(
                "guard time {cgt} does not fit the register"
            )));
        }
        self.bus
            .read_modify_write(self.base + reg::CONFIG, reg::CONFIG_CGT_MSK, value as u32)
            .await
    }

    fn to_duration(&self, divider: u32) -> Duration {
        let nanos = u128::from(divider) * NANOS_PER_SEC / u128::from(self.clock_frequency);
        Duration::from_nanos(nanos as u64)
    }

    fn to_divider(&self, duration: Duration) -> u32 {
        let divider = duration.as_nanos() * u128::from(self.clock_frequency) / NANOS_PER_SEC;
        u32::try_from(divider).unwrap_or(u32::MAX)
    }

    /// Nearest divider producing `hz`.
    fn frequency_divider(&self, hz: u32) -> Result<u32> {
        let clock = u64::from(self.clock_frequency);
        let hz = u64::from(hz);
        if hz == 0 || hz > clock * 2 {
            return Err(Error::invalid_parameter(format!(
                "frequency {hz} Hz out of range for a {clock} Hz module clock"
            )));
        }
        Ok(((clock + hz / 2) / hz) as u32)
    }

    async fn read_duration(&mut self, offset: u32) -> Result<Duration> {
        let divider = self.bus.read(self.base + offset).await?;
        Ok(self.to_duration(divider))
    }

    async fn write_divider(&mut self, offset: u32, divider: u32) -> Result<Duration> {
        self.bus.write(self.base + offset, divider).await?;
        Ok(self.to_duration(divider))
    }

    /// Period of the card clock.
    pub async fn iso_clock(&mut self) -> Result<Duration> {
        self.read_duration(reg::CLOCKRATE).await
    }

    /// Returns the period actually configured.
    pub async fn set_iso_clock(&mut self, hz: u32) -> Result<Duration> {
        let divider = self.frequency_divider(hz)?;
        self.write_divider(reg::CLOCKRATE, divider).await
    }

    /// Duration of one elementary time unit.
    pub async fn datarate(&mut self) -> Result<Duration> {
        self.read_duration(reg::DATARATE).await
    }

    /// Returns the ETU actually configured.
    pub async fn set_datarate(&mut self, baud: u32) -> Result<Duration> {
        let divider = self.frequency_divider(baud)?;
        self.write_divider(reg::DATARATE, divider).await
    }

    pub async fn block_timeout(&mut self) -> Result<Duration> {
        self.read_duration(reg::BLOCK_TIMEOUT).await
    }

    pub async fn set_block_timeout(&mut self, timeout: Duration) -> Result<Duration> {
        let divider = self.to_divider(timeout);
        self.write_divider(reg::BLOCK_TIMEOUT, divider).await
    }

    pub async fn disable_block_timeout(&mut self) -> Result<()> {
        self.bus.write(self.base + reg::BLOCK_TIMEOUT, 0).await
    }

    pub async fn character_timeout(&mut self) -> Result<Duration> {
        self.read_duration(reg::CHAR_TIMEOUT).await
    }

    pub async fn set_character_timeout(&mut self, timeout: Duration) -> Result<Duration> {
        let divider = self.to_divider(timeout);
        self.write_divider(reg::CHAR_TIMEOUT, divider).await
    }

    pub async fn disable_character_timeout(&mut self) -> Result<()> {
        self.bus.write(self.base + reg::CHAR_TIMEOUT, 0).await
    }

    pub async fn reset_timing(&mut self) -> Result<ResetTiming> {
        Ok(ResetTiming {
            ta: self.read_duration(reg::TA).await?,
            tb: self.read_duration(reg::TB).await?,
            te: self.read_duration(reg::TE).await?,
            th: self.read_duration(reg::TH).await?,
            vcc_offset: self.read_duration(reg::VCC_OFFSET).await?,
            clk_offset: self.read_duration(reg::CLK_OFFSET).await?,
        })
    }

    /// Returns the timing actually configured.
    pub async fn set_reset_timing(&mut self, timing: &ResetTiming) -> Result<ResetTiming> {
        let dividers = [
            (reg::TA, timing.ta),
            (reg::TB, timing.tb),
            (reg::TE, timing.te),
            (reg::TH, timing.th),
            (reg::VCC_OFFSET, timing.vcc_offset),
            (reg::CLK_OFFSET, timing.clk_offset),
        ]
        .map(|(offset, d)| (self.base + offset, self.to_divider(d)));
        self.bus.write_batch(&dividers).await?;

        let [ta, tb, te, th, vcc_offset, clk_offset] = dividers.map(|(_, d)| self.to_duration(d));
        Ok(ResetTiming {
            ta,
            tb,
            te,
            th,
            vcc_offset,
            clk_offset,
        })
    }

    /// Bytes waiting in the receive FIFO.
    pub async fn rx_fifo_available(&mut self) -> Result<u16> {
        let buffers = self.bus.read(self.base + reg::BUFFERS).await?;
        Ok(buffers as u16)
    }

    /// Free space in the transmit FIFO.
    pub async fn tx_fifo_free(&mut self) -> Result<u16> {
        let buffers = self.bus.read(self.base + reg::BUFFERS).await?;
        Ok((buffers >> 16) as u16)
    }

    /// Wait until `buf.len()` bytes are buffered, then read them. Returns
    /// `false` if they did not arrive before `deadline`.
    #[tracing::instrument(skip(self, buf), fields(len = buf.len()))]
    pub async fn receive_exact(&mut self, buf: &mut [u8], deadline: Duration) -> Result<bool> {
        if buf.is_empty() {
            return Ok(true);
        }
        let end = Instant::now() + deadline;
        while usize::from(self.rx_fifo_available().await?) < buf.len() {
            if Instant::now() >= end {
                debug!("receive expired");
                return Ok(false);
            }
            smol::Timer::after(POLL_INTERVAL).await;
        }
        self.bus.read_stream(self.base + reg::RX_FIFO, buf).await?;
        Ok(true)
    }

    /// Drain whatever the receive FIFO holds.
    pub async fn receive_available(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.rx_fifo_available().await?.into()];
        if !buf.is_empty() {
            self.bus.read_stream(self.base + reg::RX_FIFO, &mut buf).await?;
        }
        Ok(buf)
    }

    #[tracing::instrument(skip(self, data), fields(len = data.len()))]
    pub async fn transmit(&mut self, data: &[u8], receive: bool, flush_rx: bool) -> Result<()> {
        if data.len() > usize::from(self.tx_buffer_size) {
            return Err(Error::invalid_parameter(format!(
                "{} bytes exceed the {} byte transmit buffer",
                data.len(),
                self.tx_buffer_size
            )));
        }
        if flush_rx {
            self.trigger(Trigger::RX_FLUSH).await?;
        }
        self.bus.write_stream(self.base + reg::TX_FIFO, data).await?;
        let mut trigger = Trigger::TX;
        trigger.set(Trigger::RX, receive);
        self.trigger(trigger).await
    }

    /// Receive the answer to a reset triggered with the receiver armed.
    /// Each ATR fragment may take up to `deadline` to arrive.
    pub async fn receive_atr(&mut self, deadline: Duration) -> Result<Atr> {
        let mut failure = None;
        let atr = atr::receive_atr(async |buf: &mut [u8]| {
            match self.receive_exact(buf, deadline).await {
                Ok(complete) => complete,
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        })
        .await;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(atr?)
    }
}
