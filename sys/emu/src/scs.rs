// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The System Control Space register file.
//!
//! Accesses to `0xE000E000..=0xE000EFFF` land here in the caller's
//! register bank; `0xE002E000..=0xE002EFFF` is the non-secure alias,
//! reachable from the Secure state only. The SAU registers and NVIC_ITNS
//! exist once and are RAZ/WI for non-secure callers.
//!
//! Registers whose state lives elsewhere (VTOR in the CPU bank, the MPU
//! and SAU region files, the NVIC bitsets) are accessed through the
//! borrowed context; everything else is stored here.

use musca_arch::{RegionAttributes, Security, IRQ_COUNT};

use crate::cpu::Cpu;
use crate::nvic::{Nvic, NvicSet};
use crate::prot::{Mpu, Sau, MPU_REGIONS, SAU_REGIONS};

/// Cortex-M33 r0p4.
pub const CPUID_RESET: u32 = 0x410f_d214;

const AIRCR_VECTKEY: u32 = 0x05fa;

/// SHCSR enable bits consulted when a configurable fault is delivered.
pub const SHCSR_MEMFAULTENA: u32 = 1 << 16;
pub const SHCSR_BUSFAULTENA: u32 = 1 << 17;
pub const SHCSR_USGFAULTENA: u32 = 1 << 18;
pub const SHCSR_SECUREFAULTENA: u32 = 1 << 19;

/// One bank's system tick timer.
#[derive(Clone, Debug, Default)]
pub struct SysTick {
    pub enabled: bool,
    pub tickint: bool,
    pub countflag: bool,
    pub rvr: u32,
    pub cvr: u32,
}

impl SysTick {
    /// Advances the countdown by `cycles`. Returns true when the counter
    /// wrapped, which pends the banked SysTick exception if TICKINT is
    /// set.
    pub fn tick(&mut self, cycles: u64) -> bool {
        if !self.enabled || self.rvr == 0 {
            return false;
        }
        let period = self.rvr as u64 + 1;
        let mut remaining = self.cvr as u64;
        if cycles <= remaining {
            self.cvr = (remaining - cycles) as u32;
            return false;
        }
        // Wrapped at least once: reload and keep phase.
        remaining += 1; // crossing zero consumes one cycle
        let past = (cycles - remaining) % period;
        self.cvr = (self.rvr as u64 - past) as u32;
        self.countflag = true;
        true
    }

    fn read_csr(&mut self) -> u32 {
        let v = self.enabled as u32
            | (self.tickint as u32) << 1
            | 1 << 2 // CLKSOURCE: core clock
            | (self.countflag as u32) << 16;
        self.countflag = false;
        v
    }

    fn write_csr(&mut self, value: u32) {
        self.enabled = value & 1 != 0;
        self.tickint = value & 2 != 0;
    }
}

/// Borrowed machine state the register file reads through.
pub struct ScsCtx<'a> {
    pub cpu: &'a mut Cpu,
    pub nvic: &'a mut Nvic,
    pub sau: &'a mut Sau,
    pub mpu: &'a mut [Mpu; 2],
}

#[derive(Clone, Debug)]
pub struct Scs {
    pub cpuid: u32,
    pub scr: [u32; 2],
    pub ccr: [u32; 2],
    pub aircr: [u32; 2],
    /// Priorities of configurable system exceptions 4..=15.
    pub shpr: [[u8; 12]; 2],
    pub shcsr: [u32; 2],
    pub cfsr: [u32; 2],
    pub hfsr: [u32; 2],
    pub mmfar: [u32; 2],
    pub bfar: [u32; 2],
    pub sfsr: u32,
    pub sfar: u32,
    pub pend_nmi: bool,
    pub pend_sv: [bool; 2],
    pub pend_st: [bool; 2],
    /// Bit n set while exception number n (1..=15) is active.
    pub sys_active: [u32; 2],
    pub systick: [SysTick; 2],
}

impl Default for Scs {
    fn default() -> Self {
        Scs {
            cpuid: CPUID_RESET,
            scr: [0; 2],
            ccr: [0; 2],
            aircr: [0; 2],
            shpr: [[0; 12]; 2],
            shcsr: [0; 2],
            cfsr: [0; 2],
            hfsr: [0; 2],
            mmfar: [0; 2],
            bfar: [0; 2],
            sfsr: 0,
            sfar: 0,
            pend_nmi: false,
            pend_sv: [false; 2],
            pend_st: [false; 2],
            sys_active: [0; 2],
            systick: [SysTick::default(), SysTick::default()],
        }
    }
}

impl Scs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Priority of configurable system exception `num` in `bank`.
    pub fn sys_priority(&self, bank: Security, num: u16) -> u8 {
        if (4..=15).contains(&num) {
            self.shpr[bank.bank()][num as usize - 4]
        } else {
            0
        }
    }

    /// Word-granular read. `caller` is the originating security state;
    /// `bank` the register bank addressed (differs under the alias).
    pub fn read(
        &mut self,
        ctx: &mut ScsCtx<'_>,
        caller: Security,
        bank: Security,
        offset: u32,
        size: u32,
    ) -> Option<u32> {
        let b = bank.bank();
        // The priority bytes allow byte access; everything else is
        // word-only.
        if let Some(v) = self.ipr_access(ctx, offset, size, None) {
            return Some(v);
        }
        if size != 4 {
            return None;
        }
        let v = match offset {
            0x004 => (IRQ_COUNT as u32 / 32).saturating_sub(1), // ICTR
            0x010 => self.systick[b].read_csr(),
            0x014 => self.systick[b].rvr,
            0x018 => self.systick[b].cvr,
            0x01c => 0, // SYST_CALIB: no reference tick
            0x100 | 0x104 => {
                ctx.nvic.word(NvicSet::Enable, (offset as usize - 0x100) / 4)
            }
            0x180 | 0x184 => {
                ctx.nvic.word(NvicSet::Enable, (offset as usize - 0x180) / 4)
            }
            0x200 | 0x204 => {
                ctx.nvic.word(NvicSet::Pending, (offset as usize - 0x200) / 4)
            }
            0x280 | 0x284 => {
                ctx.nvic.word(NvicSet::Pending, (offset as usize - 0x280) / 4)
            }
            0x300 | 0x304 => {
                ctx.nvic.word(NvicSet::Active, (offset as usize - 0x300) / 4)
            }
            0x380 | 0x384 => {
                if !caller.is_secure() {
                    0
                } else {
                    ctx.nvic.word(NvicSet::Itns, (offset as usize - 0x380) / 4)
                }
            }
            0xd00 => self.cpuid,
            0xd04 => {
                ctx.cpu.xpsr.ipsr() as u32
                    | (self.pend_st[b] as u32) << 26
                    | (self.pend_sv[b] as u32) << 28
                    | (self.pend_nmi as u32) << 31
            }
            0xd08 => ctx.cpu.vtor[b],
            0xd0c => AIRCR_VECTKEY << 16 | self.aircr[b],
            0xd10 => self.scr[b],
            0xd14 => self.ccr[b],
            0xd18 | 0xd1c | 0xd20 => {
                let base = offset as usize - 0xd18;
                let p = &self.shpr[b];
                u32::from_le_bytes([
                    p[base],
                    p[base + 1],
                    p[base + 2],
                    p[base + 3],
                ])
            }
            0xd24 => self.shcsr[b],
            0xd28 => self.cfsr[b],
            0xd2c => self.hfsr[b],
            0xd30 => 0, // DFSR
            0xd34 => self.mmfar[b],
            0xd38 => self.bfar[b],
            0xd3c => 0, // AFSR
            0xd90 => (MPU_REGIONS as u32) << 8, // MPU_TYPE.DREGION
            0xd94 => {
                let m = &ctx.mpu[b];
                m.enabled as u32 | (m.priv_default as u32) << 2
            }
            0xd98 => ctx.mpu[b].rnr,
            0xd9c => {
                let m = &ctx.mpu[b];
                let r = m.regions.get(m.rnr as usize)?;
                mpu_rbar_encode(r.base, r.attrs)
            }
            0xda0 => {
                let m = &ctx.mpu[b];
                let r = m.regions.get(m.rnr as usize)?;
                r.limit & !0x1f | r.enabled as u32
            }
            0xdd0 => {
                if caller.is_secure() {
                    ctx.sau.enabled as u32 | (ctx.sau.allns as u32) << 1
                } else {
                    0
                }
            }
            0xdd4 => {
                if caller.is_secure() {
                    SAU_REGIONS as u32
                } else {
                    0
                }
            }
            0xdd8 => {
                if caller.is_secure() {
                    ctx.sau.rnr
                } else {
                    0
                }
            }
            0xddc => {
                if !caller.is_secure() {
                    0
                } else {
                    let r = ctx.sau.regions.get(ctx.sau.rnr as usize)?;
                    r.base & !0x1f
                }
            }
            0xde0 => {
                if !caller.is_secure() {
                    0
                } else {
                    let r = ctx.sau.regions.get(ctx.sau.rnr as usize)?;
                    r.limit & !0x1f | (r.nsc as u32) << 1 | r.enabled as u32
                }
            }
            0xde4 => {
                if caller.is_secure() {
                    self.sfsr
                } else {
                    0
                }
            }
            0xde8 => {
                if caller.is_secure() {
                    self.sfar
                } else {
                    0
                }
            }
            _ => return None,
        };
        Some(v)
    }

    pub fn write(
        &mut self,
        ctx: &mut ScsCtx<'_>,
        caller: Security,
        bank: Security,
        offset: u32,
        size: u32,
        value: u32,
    ) -> bool {
        let b = bank.bank();
        if self.ipr_access(ctx, offset, size, Some(value)).is_some() {
            return true;
        }
        if size != 4 {
            return false;
        }
        match offset {
            0x010 => self.systick[b].write_csr(value),
            0x014 => self.systick[b].rvr = value & 0x00ff_ffff,
            0x018 => {
                // Any write clears the counter and COUNTFLAG.
                self.systick[b].cvr = 0;
                self.systick[b].countflag = false;
            }
            0x100 | 0x104 => ctx.nvic.word_set_bits(
                NvicSet::Enable,
                (offset as usize - 0x100) / 4,
                value,
            ),
            0x180 | 0x184 => ctx.nvic.word_clear_bits(
                NvicSet::Enable,
                (offset as usize - 0x180) / 4,
                value,
            ),
            0x200 | 0x204 => ctx.nvic.word_set_bits(
                NvicSet::Pending,
                (offset as usize - 0x200) / 4,
                value,
            ),
            0x280 | 0x284 => ctx.nvic.word_clear_bits(
                NvicSet::Pending,
                (offset as usize - 0x280) / 4,
                value,
            ),
            0x300 | 0x304 => {} // IABR is read-only
            0x380 | 0x384 => {
                if caller.is_secure() {
                    ctx.nvic.word_write(
                        NvicSet::Itns,
                        (offset as usize - 0x380) / 4,
                        value,
                    );
                }
            }
            0xd04 => {
                // ICSR: set/clear pending for PendSV and SysTick.
                if value & 1 << 28 != 0 {
                    self.pend_sv[b] = true;
                }
                if value & 1 << 27 != 0 {
                    self.pend_sv[b] = false;
                }
                if value & 1 << 26 != 0 {
                    self.pend_st[b] = true;
                }
                if value & 1 << 25 != 0 {
                    self.pend_st[b] = false;
                }
                if value & 1 << 31 != 0 {
                    self.pend_nmi = true;
                }
            }
            0xd08 => ctx.cpu.vtor[b] = value & !0x7f,
            0xd0c => {
                if value >> 16 == AIRCR_VECTKEY {
                    self.aircr[b] = value & 0x0000_7700;
                    if value & 1 << 2 != 0 {
                        log::debug!("scs: SYSRESETREQ");
                        crate::runloop::request_reset();
                    }
                }
            }
            0xd10 => self.scr[b] = value & 0x16,
            0xd14 => self.ccr[b] = value,
            0xd18 | 0xd1c | 0xd20 => {
                let base = offset as usize - 0xd18;
                let bytes = value.to_le_bytes();
                for (i, byte) in bytes.iter().enumerate() {
                    self.shpr[b][base + i] = *byte;
                }
            }
            0xd24 => self.shcsr[b] = value,
            0xd28 => self.cfsr[b] &= !value, // write-one-to-clear
            0xd2c => self.hfsr[b] &= !value,
            0xd34 => self.mmfar[b] = value,
            0xd38 => self.bfar[b] = value,
            0xd94 => {
                let m = &mut ctx.mpu[b];
                m.enabled = value & 1 != 0;
                m.priv_default = value & 1 << 2 != 0;
            }
            0xd98 => ctx.mpu[b].rnr = value & (MPU_REGIONS as u32 - 1),
            0xd9c => {
                let m = &mut ctx.mpu[b];
                let rnr = m.rnr as usize;
                if let Some(r) = m.regions.get_mut(rnr) {
                    r.base = value & !0x1f;
                    r.attrs = mpu_rbar_decode(value);
                }
            }
            0xda0 => {
                let m = &mut ctx.mpu[b];
                let rnr = m.rnr as usize;
                if let Some(r) = m.regions.get_mut(rnr) {
                    r.limit = value & !0x1f | 0x1f;
                    r.enabled = value & 1 != 0;
                }
            }
            0xdd0 => {
                if caller.is_secure() {
                    ctx.sau.enabled = value & 1 != 0;
                    ctx.sau.allns = value & 2 != 0;
                }
            }
            0xdd8 => {
                if caller.is_secure() {
                    ctx.sau.rnr = value & (SAU_REGIONS as u32 - 1);
                }
            }
            0xddc => {
                if caller.is_secure() {
                    let rnr = ctx.sau.rnr as usize;
                    if let Some(r) = ctx.sau.regions.get_mut(rnr) {
                        r.base = value & !0x1f;
                    }
                }
            }
            0xde0 => {
                if caller.is_secure() {
                    let rnr = ctx.sau.rnr as usize;
                    if let Some(r) = ctx.sau.regions.get_mut(rnr) {
                        r.limit = value & !0x1f | 0x1f;
                        r.nsc = value & 2 != 0;
                        r.enabled = value & 1 != 0;
                    }
                }
            }
            0xde4 => {
                if caller.is_secure() {
                    self.sfsr &= !value;
                }
            }
            0xde8 => {
                if caller.is_secure() {
                    self.sfar = value;
                }
            }
            0xf00 => {
                // STIR: software-pend an external interrupt.
                ctx.nvic.set_pending((value & 0x1ff) as u16, true);
            }
            _ => return false,
        }
        true
    }

    /// NVIC_IPR window at 0x400: per-interrupt priority bytes, byte or
    /// aligned-word access.
    fn ipr_access(
        &mut self,
        ctx: &mut ScsCtx<'_>,
        offset: u32,
        size: u32,
        write: Option<u32>,
    ) -> Option<u32> {
        if !(0x400..0x500).contains(&offset) {
            return None;
        }
        let index = offset as usize - 0x400;
        match (size, write) {
            (1, None) => Some(ctx.nvic.priority(index as u16) as u32),
            (1, Some(v)) => {
                ctx.nvic.set_priority(index as u16, v as u8);
                Some(0)
            }
            (4, None) if offset % 4 == 0 => {
                let mut v = 0u32;
                for i in 0..4 {
                    v |= (ctx.nvic.priority((index + i) as u16) as u32)
                        << (i * 8);
                }
                Some(v)
            }
            (4, Some(v)) if offset % 4 == 0 => {
                for i in 0..4 {
                    ctx.nvic.set_priority(
                        (index + i) as u16,
                        (v >> (i * 8)) as u8,
                    );
                }
                Some(0)
            }
            _ => None,
        }
    }
}

fn mpu_rbar_decode(value: u32) -> RegionAttributes {
    let ap = value >> 1 & 0x3;
    let xn = value & 1 != 0;
    let mut attrs = RegionAttributes::READ;
    match ap {
        0 => attrs |= RegionAttributes::WRITE | RegionAttributes::PRIV_ONLY,
        1 => attrs |= RegionAttributes::WRITE,
        2 => attrs |= RegionAttributes::PRIV_ONLY,
        _ => {}
    }
    if !xn {
        attrs |= RegionAttributes::EXECUTE;
    }
    attrs
}

fn mpu_rbar_encode(base: u32, attrs: RegionAttributes) -> u32 {
    let ap = match (
        attrs.contains(RegionAttributes::WRITE),
        attrs.contains(RegionAttributes::PRIV_ONLY),
    ) {
        (true, true) => 0,
        (true, false) => 1,
        (false, true) => 2,
        (false, false) => 3,
    };
    base & !0x1f | ap << 1 | !attrs.contains(RegionAttributes::EXECUTE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        cpu: Cpu,
        nvic: Nvic,
        sau: Sau,
        mpu: [Mpu; 2],
        scs: Scs,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                cpu: Cpu::new(),
                nvic: Nvic::new(),
                sau: Sau::default(),
                mpu: [Mpu::default(), Mpu::default()],
                scs: Scs::new(),
            }
        }

        fn read(
            &mut self,
            caller: Security,
            bank: Security,
            offset: u32,
        ) -> Option<u32> {
            let mut ctx = ScsCtx {
                cpu: &mut self.cpu,
                nvic: &mut self.nvic,
                sau: &mut self.sau,
                mpu: &mut self.mpu,
            };
            self.scs.read(&mut ctx, caller, bank, offset, 4)
        }

        fn write(
            &mut self,
            caller: Security,
            bank: Security,
            offset: u32,
            value: u32,
        ) -> bool {
            let mut ctx = ScsCtx {
                cpu: &mut self.cpu,
                nvic: &mut self.nvic,
                sau: &mut self.sau,
                mpu: &mut self.mpu,
            };
            self.scs.write(&mut ctx, caller, bank, offset, 4, value)
        }
    }

    const S: Security = Security::Secure;
    const NS: Security = Security::NonSecure;

    #[test]
    fn vtor_is_banked() {
        let mut f = Fixture::new();
        assert!(f.write(S, S, 0xd08, 0x1000));
        assert_eq!(f.read(S, S, 0xd08), Some(0x1000));
        assert_eq!(f.read(S, NS, 0xd08), Some(0));
        assert!(f.write(S, NS, 0xd08, 0x2000));
        assert_eq!(f.cpu.vtor[NS.bank()], 0x2000);
    }

    #[test]
    fn cpuid_reads_same_from_both_banks() {
        let mut f = Fixture::new();
        assert_eq!(f.read(S, S, 0xd00), Some(CPUID_RESET));
        assert_eq!(f.read(S, NS, 0xd00), Some(CPUID_RESET));
    }

    #[test]
    fn shcsr_round_trips() {
        let mut f = Fixture::new();
        assert!(f.write(S, S, 0xd24, SHCSR_USGFAULTENA | 1));
        assert_eq!(f.read(S, S, 0xd24), Some(SHCSR_USGFAULTENA | 1));
        assert_eq!(f.read(S, NS, 0xd24), Some(0));
    }

    #[test]
    fn mpu_type_and_banked_ctrl() {
        let mut f = Fixture::new();
        assert_eq!(f.read(S, S, 0xd90), Some((MPU_REGIONS as u32) << 8));
        assert!(f.write(S, S, 0xd94, 0x5));
        assert_eq!(f.read(S, S, 0xd94), Some(0x5));
        assert!(f.mpu[S.bank()].enabled);
        assert!(f.mpu[S.bank()].priv_default);
        assert!(!f.mpu[NS.bank()].enabled);
    }

    #[test]
    fn mpu_region_programming() {
        let mut f = Fixture::new();
        assert!(f.write(S, S, 0xd98, 2));
        // RW, any privilege, XN.
        assert!(f.write(S, S, 0xd9c, 0x2000_0000 | 1 << 1 | 1));
        assert!(f.write(S, S, 0xda0, 0x2000_0fe0 | 1));
        let r = &f.mpu[S.bank()].regions[2];
        assert!(r.enabled);
        assert_eq!(r.base, 0x2000_0000);
        assert_eq!(r.limit, 0x2000_0fff);
        assert!(r.attrs.contains(RegionAttributes::WRITE));
        assert!(!r.attrs.contains(RegionAttributes::EXECUTE));
    }

    #[test]
    fn sau_is_secure_only() {
        let mut f = Fixture::new();
        assert_eq!(f.read(S, S, 0xdd4), Some(SAU_REGIONS as u32));
        assert!(f.write(S, S, 0xdd0, 0x3));
        assert_eq!(f.read(S, S, 0xdd0), Some(0x3));
        assert!(f.sau.enabled);
        assert!(f.sau.allns);

        // Non-secure callers see zeros and write nothing.
        assert!(f.write(NS, NS, 0xdd0, 0x0));
        assert!(f.sau.enabled);
        assert_eq!(f.read(NS, NS, 0xdd0), Some(0));
        assert_eq!(f.read(NS, NS, 0xdd4), Some(0));
    }

    #[test]
    fn sau_region_bank_round_trip() {
        let mut f = Fixture::new();
        for (rnr, rbar, rlar) in [
            (2u32, 0x1111_1000u32, 0x2222_2001u32),
            (3, 0x3333_3000, 0x4444_4001),
        ] {
            assert!(f.write(S, S, 0xdd8, rnr));
            assert!(f.write(S, S, 0xddc, rbar));
            assert!(f.write(S, S, 0xde0, rlar));
        }
        assert!(f.write(S, S, 0xdd8, 2));
        assert_eq!(f.read(S, S, 0xddc), Some(0x1111_1000));
        assert_eq!(f.read(S, S, 0xde0), Some(0x2222_2001));
        assert!(f.write(S, S, 0xdd8, 3));
        assert_eq!(f.read(S, S, 0xddc), Some(0x3333_3000));
        assert_eq!(f.read(S, S, 0xde0), Some(0x4444_4001));
        assert!(f.sau.regions[2].enabled);
        assert_eq!(f.sau.regions[2].limit, 0x2222_201f);
    }

    #[test]
    fn nvic_enable_pend_words() {
        let mut f = Fixture::new();
        assert!(f.write(S, S, 0x100, 1 << 5));
        assert!(f.nvic.is_enabled(5));
        assert!(f.write(S, S, 0x200, 1 << 5));
        assert!(f.nvic.is_pending(5));
        assert_eq!(f.read(S, S, 0x200), Some(1 << 5));
        assert!(f.write(S, S, 0x280, 1 << 5));
        assert!(!f.nvic.is_pending(5));
        assert!(f.write(S, S, 0x180, 1 << 5));
        assert!(!f.nvic.is_enabled(5));
    }

    #[test]
    fn itns_raz_wi_from_nonsecure() {
        let mut f = Fixture::new();
        assert!(f.write(S, S, 0x380, 1 << 7));
        assert_eq!(f.nvic.target_sec(7), Security::NonSecure);
        assert_eq!(f.read(S, S, 0x380), Some(1 << 7));
        assert!(f.write(NS, NS, 0x380, 0));
        assert_eq!(f.nvic.target_sec(7), Security::NonSecure);
        assert_eq!(f.read(NS, NS, 0x380), Some(0));
    }

    #[test]
    fn ipr_byte_and_word_agree() {
        let mut f = Fixture::new();
        let mut ctx_scope = |f: &mut Fixture, offset, size, write| {
            let mut ctx = ScsCtx {
                cpu: &mut f.cpu,
                nvic: &mut f.nvic,
                sau: &mut f.sau,
                mpu: &mut f.mpu,
            };
            f.scs.ipr_access(&mut ctx, offset, size, write)
        };
        // Word write programs four lines at once.
        assert!(ctx_scope(&mut f, 0x400, 4, Some(0x4030_2010)).is_some());
        assert_eq!(f.nvic.priority(0), 0x10);
        assert_eq!(f.nvic.priority(3), 0x40);
        // Byte read of line 2.
        assert_eq!(ctx_scope(&mut f, 0x402, 1, None), Some(0x30));
        // Byte write then word read back.
        assert!(ctx_scope(&mut f, 0x401, 1, Some(0x99)).is_some());
        assert_eq!(ctx_scope(&mut f, 0x400, 4, None), Some(0x4030_9910));
    }

    #[test]
    fn icsr_pend_bits() {
        let mut f = Fixture::new();
        assert!(f.write(S, S, 0xd04, 1 << 28));
        assert!(f.scs.pend_sv[S.bank()]);
        assert!(!f.scs.pend_sv[NS.bank()]);
        assert_eq!(f.read(S, S, 0xd04).unwrap() & 1 << 28, 1 << 28);
        assert!(f.write(S, S, 0xd04, 1 << 27));
        assert!(!f.scs.pend_sv[S.bank()]);
        assert!(f.write(S, NS, 0xd04, 1 << 26));
        assert!(f.scs.pend_st[NS.bank()]);
    }

    #[test]
    fn systick_countdown_and_wrap() {
        let mut st = SysTick {
            enabled: true,
            tickint: true,
            rvr: 99,
            cvr: 99,
            ..SysTick::default()
        };
        assert!(!st.tick(50));
        assert_eq!(st.cvr, 49);
        assert!(!st.tick(49));
        assert_eq!(st.cvr, 0);
        // Crossing zero reloads from RVR.
        assert!(st.tick(1));
        assert_eq!(st.cvr, 99);
        assert!(st.countflag);
    }

    #[test]
    fn systick_csr_countflag_clears_on_read() {
        let mut st = SysTick {
            enabled: true,
            countflag: true,
            ..SysTick::default()
        };
        let v = st.read_csr();
        assert!(v & 1 << 16 != 0);
        assert!(st.read_csr() & 1 << 16 == 0);
    }

    #[test]
    fn aircr_needs_vectkey() {
        let mut f = Fixture::new();
        assert!(f.write(S, S, 0xd0c, 0x0000_4000));
        assert_eq!(f.read(S, S, 0xd0c).unwrap() & 0xffff, 0);
        assert!(f.write(S, S, 0xd0c, 0x05fa_4000));
        assert_eq!(f.read(S, S, 0xd0c).unwrap() & 0xffff, 0x4000);
    }

    #[test]
    fn cfsr_write_one_to_clear() {
        let mut f = Fixture::new();
        f.scs.cfsr[S.bank()] = 0x0001_0100;
        assert!(f.write(S, S, 0xd28, 0x0000_0100));
        assert_eq!(f.read(S, S, 0xd28), Some(0x0001_0000));
    }
}
