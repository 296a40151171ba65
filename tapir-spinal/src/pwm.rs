use tapir_io::{Error, RegisterAccess, Result};

mod reg {
    pub const CTRL: u32 = 0x00;
    pub const CTRL_RUN: u32 = 0x01;
    pub const PRESCALER: u32 = 0x04;
    pub const MAX: u32 = 0x08;

    pub const fn level(idx: usize) -> u32 {
        0x0c + 4 * idx as u32
    }
}

/// Number of output channels.
pub const CHANNELS: usize = 3;

/// Three-channel PWM generator sharing one prescaler and counter.
pub struct Pwm<B> {
    bus: B,
    base: u32,
}

impl<B: RegisterAccess> Pwm<B> {
    pub fn new(bus: B, base: u32) -> Self {
        Self { bus, base }
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    fn level_address(&self, idx: usize) -> Result<u32> {
        if idx >= CHANNELS {
            return Err(Error::invalid_parameter(format!("invalid PWM index {idx}")));
        }
        Ok(self.base + reg::level(idx))
    }

    pub async fn running(&mut self) -> Result<bool> {
        Ok(self.bus.read(self.base + reg::CTRL).await? & reg::CTRL_RUN != 0)
    }

    pub async fn set_running(&mut self, run: bool) -> Result<()> {
        let value = if run { reg::CTRL_RUN } else { 0 };
        self.bus
            .read_modify_write(self.base + reg::CTRL, reg::CTRL_RUN, value)
            .await
    }

    pub async fn prescaler(&mut self) -> Result<u32> {
        self.bus.read(self.base + reg::PRESCALER).await
    }

    pub async fn set_prescaler(&mut self, prescaler: u32) -> Result<()> {
        self.bus.write(self.base + reg::PRESCALER, prescaler).await
    }

    pub async fn max_count(&mut self) -> Result<u32> {
        self.bus.read(self.base + reg::MAX).await
    }

    pub async fn set_max_count(&mut self, max: u32) -> Result<()> {
        self.bus.write(self.base + reg::MAX, max).await
    }

    pub async fn width(&mut self, idx: usize) -> Result<u8> {
        let address = self.level_address(idx)?;
        Ok(self.bus.read(address).await? as u8)
    }

    pub async fn set_width(&mut self, idx: usize, width: u8) -> Result<()> {
        let address = self.level_address(idx)?;
        self.bus.write(address, width.into()).await
    }

    pub async fn widths(&mut self) -> Result<[u8; CHANNELS]> {
        let mut widths = [0; CHANNELS];
        for (idx, w) in widths.iter_mut().enumerate() {
            *w = self.width(idx).await?;
        }
        Ok(widths)
    }

    /// All channels in one bus round trip.
    pub async fn set_widths(&mut self, widths: [u8; CHANNELS]) -> Result<()> {
        let mut pairs = [(0, 0); CHANNELS];
        for (idx, (pair, w)) in pairs.iter_mut().zip(widths).enumerate() {
            *pair = (self.level_address(idx)?, w.into());
        }
        self.bus.write_batch(&pairs).await
    }
}

#[cfg(test)]
mod tests {
    use tapir_io::{
        RegisterBus,
        fake::{Access, FakeDevice},
    };

    use super::*;

    #[test]
    fn widths_are_batched() {
        smol::block_on(async {
            let mut bus = RegisterBus::new(FakeDevice::new());
            let mut pwm = Pwm::new(&mut bus, 0x200);
            pwm.set_widths([10, 20, 30]).await.unwrap();
            assert_eq!(pwm.widths().await.unwrap(), [10, 20, 30]);
            assert_eq!(pwm.width(1).await.unwrap(), 20);

            let dev = bus.transport();
            assert_eq!(dev.sends[0], 24);
            assert_eq!(
                dev.log[..3],
                [
                    Access::Write(0x20c, 10),
                    Access::Write(0x210, 20),
                    Access::Write(0x214, 30)
                ]
            );
        });
    }

    #[test]
    fn index_out_of_range() {
        smol::block_on(async {
            let mut bus = RegisterBus::new(FakeDevice::new());
            let mut pwm = Pwm::new(&mut bus, 0);
            assert!(matches!(pwm.width(3).await, Err(Error::InvalidParameter(_))));
            assert!(matches!(
                pwm.set_width(7, 1).await,
                Err(Error::InvalidParameter(_))
            ));
            assert!(bus.transport().sends.is_empty());
        });
    }

    #[test]
    fn control_registers() {
        smol::block_on(async {
            let mut bus = RegisterBus::new(FakeDevice::new());
            bus.transport_mut().set_register(0x00, 0xf0);
            let mut pwm = Pwm::new(&mut bus, 0);
            pwm.set_prescaler(99).await.unwrap();
            pwm.set_max_count(255).await.unwrap();
            pwm.set_running(true).await.unwrap();
            assert!(pwm.running().await.unwrap());
            assert_eq!(pwm.prescaler().await.unwrap(), 99);
            assert_eq!(pwm.max_count().await.unwrap(), 255);
            pwm.set_running(false).await.unwrap();
            assert!(!pwm.running().await.unwrap());
            assert_eq!(bus.transport().register(0x00), 0xf0);
        });
    }
}
