//! IO multiplexer routing fabric inputs to outputs.
//!
//! Each output has an 8-bit select field holding the input it is driven by,
//! four fields per 32-bit route register.

use tapir_io::{RegisterAccess, Result};
use tracing::debug;

mod reg {
    pub const FIELDS_PER_REGISTER: u32 = 4;
    pub const ROUTE_SEL_MSK: u32 = 0xff;

    pub const fn route(output: u8) -> u32 {
        output as u32 / FIELDS_PER_REGISTER * 4
    }

    pub const fn route_sel_pos(output: u8) -> u32 {
        output as u32 % FIELDS_PER_REGISTER * 8
    }
}

pub struct Iomux<B> {
    bus: B,
    base: u32,
}

impl<B: RegisterAccess> Iomux<B> {
    pub fn new(bus: B, base: u32) -> Self {
        Self { bus, base }
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    /// Drive `output` from `input`, leaving the other routes alone.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&mut self, input: u8, output: u8) -> Result<()> {
        let pos = reg::route_sel_pos(output);
        debug!(register = reg::route(output), pos);
        self.bus
            .read_modify_write(
                self.base + reg::route(output),
                reg::ROUTE_SEL_MSK << pos,
                u32::from(input) << pos,
            )
            .await
    }

    /// Input currently routed to `output`.
    pub async fn source(&mut self, output: u8) -> Result<u8> {
        let route = self.bus.read(self.base + reg::route(output)).await?;
        Ok((route >> reg::route_sel_pos(output)) as u8)
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
    fn field_layout() {
        assert_eq!(reg::route(0), 0x00);
        assert_eq!(reg::route(3), 0x00);
        assert_eq!(reg::route(4), 0x04);
        assert_eq!(reg::route(255), 0xfc);
        let positions: Vec<_> = (0..8).map(reg::route_sel_pos).collect();
        assert_eq!(positions, [0, 8, 16, 24, 0, 8, 16, 24]);
    }

    #[test]
    fn connect_keeps_other_routes() {
        smol::block_on(async {
            let mut bus = RegisterBus::new(FakeDevice::new());
            bus.transport_mut().set_register(0x500, 0x4433_2211);
            bus.transport_mut().set_register(0x504, 0x8877_6655);

            let mut mux = Iomux::new(&mut bus, 0x500);
            mux.connect(0xaa, 2).await.unwrap();
            mux.connect(0x0b, 7).await.unwrap();
            assert_eq!(mux.source(2).await.unwrap(), 0xaa);
            assert_eq!(mux.source(1).await.unwrap(), 0x22);
            assert_eq!(mux.source(7).await.unwrap(), 0x0b);

            let dev = bus.transport();
            assert_eq!(dev.register(0x500), 0x44aa_2211);
            assert_eq!(dev.register(0x504), 0x0b77_6655);
            assert_eq!(
                dev.log[..2],
                [Access::Read(0x500), Access::Write(0x500, 0x44aa_2211)]
            );
        });
    }
}
