// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The memory map: banked flash and RAM plus the MMIO region registry.
//!
//! Address decode order per access: flash window, RAM window, MMIO scan,
//! then a bus error. Bank windows are matched against the originator's
//! security state only; an access to the other world's window falls
//! through (attribution has already been checked a layer up, this is
//! purely the physical decode).
//!
//! Unaligned accesses to backing memory are legal and byte-assembled;
//! unaligned MMIO accesses fault before the handler is consulted.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use musca_arch::{AccessKind, FaultInfo, Security};

use crate::err::ConfigError;

/// A peripheral model mapped into the address space.
///
/// `read` returns `None` and `write` returns `false` to signal an access
/// the device rejects; the memory system turns that into a bus error.
/// Handlers needing the originator's security state read [`active_sec`].
pub trait MmioDevice {
    fn read(&mut self, offset: u32, size: u32) -> Option<u32>;
    fn write(&mut self, offset: u32, size: u32, value: u32) -> bool;
}

pub type DeviceRef = Rc<RefCell<dyn MmioDevice>>;

/// Flash-controller write interceptor: `(sec, addr, size, value)`.
pub type FlashHook =
    Box<dyn FnMut(Security, u32, u32, u32) -> Result<(), FaultInfo>>;

thread_local! {
    static ACTIVE_SEC: Cell<Security> = const { Cell::new(Security::Secure) };
}

/// Security state of the MMIO access currently in flight. Published by
/// the memory system immediately before handler dispatch.
pub fn active_sec() -> Security {
    ACTIVE_SEC.with(|c| c.get())
}

fn with_active_sec<R>(sec: Security, f: impl FnOnce() -> R) -> R {
    ACTIVE_SEC.with(|c| {
        let prev = c.replace(sec);
        let r = f();
        c.set(prev);
        r
    })
}

/// Layout of one memory bank as seen from both worlds.
#[derive(Copy, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BankSpec {
    pub base_s: u32,
    pub base_ns: u32,
    pub size: u32,
    /// Both windows alias the same bytes; otherwise each window gets its
    /// own half of the backing store.
    pub shared: bool,
}

struct Bank {
    /// Window base per security state, indexed by [`Security::bank`].
    base: [u32; 2],
    size: u32,
    shared: bool,
    bytes: Vec<u8>,
}

impl Bank {
    fn new(spec: BankSpec) -> Self {
        let len = if spec.shared {
            spec.size as usize
        } else {
            spec.size as usize * 2
        };
        Bank {
            base: [spec.base_ns, spec.base_s],
            size: spec.size,
            shared: spec.shared,
            bytes: vec![0; len],
        }
    }

    /// Backing offset for `addr` if it falls in this bank's window for
    /// `sec`, leaving room for `size` bytes.
    fn offset(&self, sec: Security, addr: u32, size: u32) -> Option<usize> {
        let base = self.base[sec.bank()];
        let off = addr.wrapping_sub(base);
        if off >= self.size || self.size - off < size {
            return None;
        }
        // Split backing serves the non-secure window from the first half
        // and the secure window from the second.
        let half = if !self.shared && sec.is_secure() {
            self.size as usize
        } else {
            0
        };
        Some(half + off as usize)
    }

    fn contains_window(&self, base: u32, size: u32) -> bool {
        for wbase in self.base {
            let wend = wbase.wrapping_add(self.size);
            if base < wend && wbase < base.wrapping_add(size) && self.size != 0
            {
                return true;
            }
        }
        false
    }
}

struct MmioRegion {
    base: u32,
    size: u32,
    device: DeviceRef,
}

pub struct MemoryMap {
    flash: Bank,
    ram: Bank,
    regions: Vec<MmioRegion>,
    flash_hook: Option<FlashHook>,
}

impl MemoryMap {
    pub fn new(flash: BankSpec, ram: BankSpec) -> Result<Self, ConfigError> {
        if flash.size == 0 {
            return Err(ConfigError::EmptyBank { base: flash.base_s });
        }
        if ram.size == 0 {
            return Err(ConfigError::EmptyBank { base: ram.base_s });
        }
        Ok(MemoryMap {
            flash: Bank::new(flash),
            ram: Bank::new(ram),
            regions: Vec::new(),
            flash_hook: None,
        })
    }

    /// Installs the programmable-flash-controller hook. Without one,
    /// flash writes are dropped without fault.
    pub fn set_flash_hook(&mut self, hook: FlashHook) {
        self.flash_hook = Some(hook);
    }

    /// Registers a peripheral region. Regions may not overlap each other
    /// or either memory bank.
    pub fn register_mmio(
        &mut self,
        base: u32,
        size: u32,
        device: DeviceRef,
    ) -> Result<(), ConfigError> {
        if size == 0 {
            return Err(ConfigError::EmptyRegion { base });
        }
        if self.flash.contains_window(base, size)
            || self.ram.contains_window(base, size)
        {
            return Err(ConfigError::MmioOverlapsBank { base, size });
        }
        for r in &self.regions {
            if base < r.base.wrapping_add(r.size)
                && r.base < base.wrapping_add(size)
            {
                return Err(ConfigError::MmioOverlap { base, size });
            }
        }
        self.regions.push(MmioRegion { base, size, device });
        Ok(())
    }

    pub fn read(
        &mut self,
        sec: Security,
        addr: u32,
        size: u32,
        access: AccessKind,
    ) -> Result<u32, FaultInfo> {
        debug_assert!(matches!(size, 1 | 2 | 4));

        if let Some(off) = self.flash.offset(sec, addr, size) {
            return Ok(read_backing(&self.flash.bytes, off, size));
        }
        if let Some(off) = self.ram.offset(sec, addr, size) {
            return Ok(read_backing(&self.ram.bytes, off, size));
        }
        if let Some(i) = self.find_region(addr) {
            let r = &self.regions[i];
            if addr % size != 0 {
                return Err(FaultInfo::Unaligned { address: addr });
            }
            let offset = addr - r.base;
            let device = Rc::clone(&r.device);
            let value = with_active_sec(sec, || {
                device.borrow_mut().read(offset, size)
            });
            return value.ok_or(FaultInfo::BusError {
                address: Some(addr),
                access,
            });
        }
        Err(FaultInfo::BusError { address: Some(addr), access })
    }

    pub fn write(
        &mut self,
        sec: Security,
        addr: u32,
        size: u32,
        value: u32,
    ) -> Result<(), FaultInfo> {
        debug_assert!(matches!(size, 1 | 2 | 4));

        if self.flash.offset(sec, addr, size).is_some() {
            // Programmable flash: the controller hook decides. A machine
            // with no hook bound models a locked controller that ignores
            // stray programming.
            return match &mut self.flash_hook {
                Some(hook) => hook(sec, addr, size, value),
                None => Ok(()),
            };
        }
        if let Some(off) = self.ram.offset(sec, addr, size) {
            write_backing(&mut self.ram.bytes, off, size, value);
            return Ok(());
        }
        if let Some(i) = self.find_region(addr) {
            let r = &self.regions[i];
            if addr % size != 0 {
                return Err(FaultInfo::Unaligned { address: addr });
            }
            let offset = addr - r.base;
            let device = Rc::clone(&r.device);
            let ok = with_active_sec(sec, || {
                device.borrow_mut().write(offset, size, value)
            });
            return if ok {
                Ok(())
            } else {
                Err(FaultInfo::BusError {
                    address: Some(addr),
                    access: AccessKind::Write,
                })
            };
        }
        Err(FaultInfo::BusError {
            address: Some(addr),
            access: AccessKind::Write,
        })
    }

    /// Probes whether a write of `size` bytes at `addr` would decode,
    /// without performing it. Multi-word stores use this so a fault in
    /// the middle of a transfer list cannot leave half the stores done.
    pub fn check_write(
        &self,
        sec: Security,
        addr: u32,
        size: u32,
    ) -> Result<(), FaultInfo> {
        if self.flash.offset(sec, addr, size).is_some()
            || self.ram.offset(sec, addr, size).is_some()
        {
            return Ok(());
        }
        if self.find_region(addr).is_some() {
            if addr % size != 0 {
                return Err(FaultInfo::Unaligned { address: addr });
            }
            return Ok(());
        }
        Err(FaultInfo::BusError {
            address: Some(addr),
            access: AccessKind::Write,
        })
    }

    fn find_region(&self, addr: u32) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| addr.wrapping_sub(r.base) < r.size)
    }

    /// Direct access to the flash backing, for firmware loading and the
    /// reset-vector fetch. Secure-window view.
    pub fn flash_bytes_mut(&mut self) -> &mut [u8] {
        let len = if self.flash.shared {
            self.flash.bytes.len()
        } else {
            self.flash.size as usize
        };
        let start = self.flash.bytes.len() - len;
        &mut self.flash.bytes[start..]
    }

    pub fn flash_size(&self) -> u32 {
        self.flash.size
    }

    pub fn flash_base(&self, sec: Security) -> u32 {
        self.flash.base[sec.bank()]
    }

    pub fn ram_base(&self, sec: Security) -> u32 {
        self.ram.base[sec.bank()]
    }
}

fn read_backing(bytes: &[u8], off: usize, size: u32) -> u32 {
    match size {
        1 => bytes[off] as u32,
        2 => LittleEndian::read_u16(&bytes[off..off + 2]) as u32,
        _ => LittleEndian::read_u32(&bytes[off..off + 4]),
    }
}

fn write_backing(bytes: &mut [u8], off: usize, size: u32, value: u32) {
    match size {
        1 => bytes[off] = value as u8,
        2 => LittleEndian::write_u16(&mut bytes[off..off + 2], value as u16),
        _ => LittleEndian::write_u32(&mut bytes[off..off + 4], value),
    }
}
