// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary to SoC adapters.
//!
//! A [`TargetConfig`] is plain data describing the memory shape and the
//! clock; real SoC models implement [`SocAdapter`] and are wired in by
//! the host (MMIO registration, flash-controller binding, poll and tick
//! entry points). The core ships one built-in layout used by the test
//! suite; everything device-specific lives outside this crate.

use serde::{Deserialize, Serialize};

use crate::err::ConfigError;
use crate::mem::{BankSpec, MemoryMap};
use crate::nvic::Nvic;
use crate::prot::IdauFn;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub flash_base_s: u32,
    pub flash_base_ns: u32,
    pub flash_size: u32,
    pub ram_base_s: u32,
    pub ram_base_ns: u32,
    pub ram_size: u32,
    /// Secure and non-secure flash windows alias the same bytes.
    pub shared_flash_backing: bool,
    pub shared_ram_backing: bool,
    pub cpu_hz: u64,
    /// Implementation-defined attribution table, when the SoC has one.
    #[serde(skip)]
    pub idau: Option<IdauFn>,
}

impl TargetConfig {
    /// A generic Cortex-M33 layout: banked windows over shared backing,
    /// 1 MiB of flash and 1 MiB of SRAM.
    pub fn generic() -> Self {
        TargetConfig {
            name: "m33-generic".to_string(),
            flash_base_s: 0x1000_0000,
            flash_base_ns: 0x0000_0000,
            flash_size: 0x0010_0000,
            ram_base_s: 0x3000_0000,
            ram_base_ns: 0x2000_0000,
            ram_size: 0x0010_0000,
            shared_flash_backing: true,
            shared_ram_backing: true,
            cpu_hz: 64_000_000,
            idau: None,
        }
    }

    /// Looks up a built-in target by name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "m33-generic" => Some(Self::generic()),
            _ => None,
        }
    }

    pub(crate) fn flash_bank(&self) -> BankSpec {
        BankSpec {
            base_s: self.flash_base_s,
            base_ns: self.flash_base_ns,
            size: self.flash_size,
            shared: self.shared_flash_backing,
        }
    }

    pub(crate) fn ram_bank(&self) -> BankSpec {
        BankSpec {
            base_s: self.ram_base_s,
            base_ns: self.ram_base_ns,
            size: self.ram_size,
            shared: self.shared_ram_backing,
        }
    }
}

/// Hooks a SoC model supplies. All have empty defaults so an adapter
/// implements only the peripherals it models.
pub trait SocAdapter {
    fn name(&self) -> &str;

    /// Puts the SoC-side state back to its power-on values.
    fn reset(&mut self) {}

    /// Registers the model's MMIO regions.
    fn register_mmio(&mut self, _map: &mut MemoryMap) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Installs the programmable-flash-controller interceptor.
    fn bind_flash(&mut self, _map: &mut MemoryMap) {}

    fn usart_init(&mut self, _map: &mut MemoryMap) {}
    fn usart_reset(&mut self) {}
    fn usart_poll(&mut self, _nvic: &mut Nvic, _cycles: u64) {}

    fn spi_init(&mut self, _map: &mut MemoryMap) {}
    fn spi_reset(&mut self) {}
    fn spi_poll(&mut self, _nvic: &mut Nvic, _cycles: u64) {}

    fn timer_init(&mut self, _map: &mut MemoryMap) {}
    fn timer_reset(&mut self) {}
    fn timer_tick(&mut self, _nvic: &mut Nvic, _cycles: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_layout_is_consistent() {
        let cfg = TargetConfig::generic();
        assert!(cfg.shared_flash_backing);
        assert_ne!(cfg.flash_base_s, cfg.flash_base_ns);
        assert!(cfg.cpu_hz > 0);
        assert_eq!(
            TargetConfig::by_name("m33-generic").unwrap().flash_size,
            cfg.flash_size
        );
        assert!(TargetConfig::by_name("no-such-soc").is_none());
    }

    #[test]
    fn config_round_trips_through_serde() {
        let cfg = TargetConfig::generic();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TargetConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, cfg.name);
        assert_eq!(back.flash_base_s, cfg.flash_base_s);
        assert_eq!(back.ram_size, cfg.ram_size);
        assert!(back.idau.is_none());
    }
}
