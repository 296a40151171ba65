use tapir_io::{RegisterAccess, Result};

mod reg {
    pub const READ: u32 = 0x00;
    pub const WRITE: u32 = 0x04;
    pub const WRITE_ENABLE: u32 = 0x08;
}

pub struct Gpio<B> {
    bus: B,
    base: u32,
}

impl<B: RegisterAccess> Gpio<B> {
    pub fn new(bus: B, base: u32) -> Self {
        Self { bus, base }
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    /// Sampled input levels.
    pub async fn read(&mut self) -> Result<u32> {
        self.bus.read(self.base + reg::READ).await
    }

    /// Current output levels.
    pub async fn write(&mut self) -> Result<u32> {
        self.bus.read(self.base + reg::WRITE).await
    }

    pub async fn set_write(&mut self, bits: u32) -> Result<()> {
        self.bus.write(self.base + reg::WRITE, bits).await
    }

    /// Pins driven as outputs.
    pub async fn write_enable(&mut self) -> Result<u32> {
        self.bus.read(self.base + reg::WRITE_ENABLE).await
    }

    pub async fn set_write_enable(&mut self, bits: u32) -> Result<()> {
        self.bus.write(self.base + reg::WRITE_ENABLE, bits).await
    }
}

#[cfg(test)]
mod tests {
    use tapir_io::{RegisterBus, fake::FakeDevice};

    use super::*;

    #[test]
    fn offsets() {
        smol::block_on(async {
            let mut bus = RegisterBus::new(FakeDevice::new());
            bus.transport_mut().set_register(0x100, 0xa5);

            let mut gpio = Gpio::new(&mut bus, 0x100);
            assert_eq!(gpio.read().await.unwrap(), 0xa5);
            gpio.set_write(0x0f).await.unwrap();
            gpio.set_write_enable(0xff).await.unwrap();
            assert_eq!(gpio.write().await.unwrap(), 0x0f);
            assert_eq!(gpio.write_enable().await.unwrap(), 0xff);

            let dev = bus.transport();
            assert_eq!(dev.register(0x104), 0x0f);
            assert_eq!(dev.register(0x108), 0xff);
        });
    }
}
