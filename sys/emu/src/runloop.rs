// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The machine and its cooperative run loop.
//!
//! Each step services a pending exception or executes one instruction,
//! then advances the cycle counter, drains due scheduler events, ticks
//! the banked SysTicks, and runs the peripheral poll pass. Faults raised
//! mid-instruction are recorded on the CPU and delivered at the top of
//! the next step, before any fetch.
//!
//! All memory traffic from the executor funnels through [`Machine::mem_read`]
//! and [`Machine::mem_write`]: System Control Space routing first (the
//! PPB is exempt from attribution), then the SAU/IDAU walk, the MPU of
//! the access, and finally the physical decode in [`MemoryMap`].

use std::sync::atomic::{AtomicBool, Ordering};

use musca_arch::{
    AccessKind, ExceptionNum, FaultInfo, Security, SecureCause,
};

use crate::cpu::Cpu;
use crate::decode::{self, Op};
use crate::err::ConfigError;
use crate::exec;
use crate::fetch::{is_wide_prefix, FetchResult};
use crate::mem::MemoryMap;
use crate::nvic::Nvic;
use crate::prot::{attribute, Attribution, IdauFn, Mpu, Sau};
use crate::sched::Scheduler;
use crate::scs::{Scs, ScsCtx};
use crate::target::TargetConfig;

/// Process-wide reset request, observed between instructions. Signal
/// handlers and watchdog models set it through [`request_reset`].
static RESET_REQUEST: AtomicBool = AtomicBool::new(false);

pub fn request_reset() {
    RESET_REQUEST.store(true, Ordering::Relaxed);
}

fn take_reset_request() -> bool {
    RESET_REQUEST.swap(false, Ordering::Relaxed)
}

const PPB_BASE: u32 = 0xe000_e000;
const PPB_NS_ALIAS: u32 = 0xe002_e000;
const PPB_SIZE: u32 = 0x1000;

/// Cycles consumed per idle (sleeping) step.
const SLEEP_TIMESLICE: u64 = 64;

/// What one iteration of the loop did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StepOutcome {
    /// One instruction retired.
    Executed,
    /// An exception was entered (or a pending fault delivered).
    TookException(ExceptionNum),
    /// Asleep; cycles advanced without fetching.
    Idle,
    /// A reset request was honored this step.
    Reset,
    /// Unrecoverable fault state; only reset or NMI leaves it.
    Lockup,
}

/// Peripheral poll hook, run after every step.
pub type PollFn = Box<dyn FnMut(&mut Nvic, u64)>;

pub struct Machine {
    pub cpu: Cpu,
    pub map: MemoryMap,
    pub nvic: Nvic,
    pub scs: Scs,
    pub sau: Sau,
    pub mpu: [Mpu; 2],
    pub idau: Option<IdauFn>,
    pub sched: Scheduler,
    pub cycles: u64,
    pub cpu_hz: u64,
    /// Exclusive-access reservation: (owner security, address).
    pub(crate) monitor: Option<(Security, u32)>,
    /// Set by WFE when it parks; WFI sleeps wake on interrupts only.
    pub(crate) sleep_on_event: bool,
    polls: Vec<PollFn>,
    cfg: TargetConfig,
}

impl Machine {
    pub fn new(cfg: TargetConfig) -> Result<Self, ConfigError> {
        let map = MemoryMap::new(cfg.flash_bank(), cfg.ram_bank())?;
        let mut m = Machine {
            cpu: Cpu::new(),
            map,
            nvic: Nvic::new(),
            scs: Scs::new(),
            sau: Sau::default(),
            mpu: [Mpu::default(), Mpu::default()],
            idau: cfg.idau,
            sched: Scheduler::new(),
            cycles: 0,
            cpu_hz: cfg.cpu_hz,
            monitor: None,
            sleep_on_event: false,
            polls: Vec::new(),
            cfg,
        };
        m.reset_core();
        Ok(m)
    }

    pub fn config(&self) -> &TargetConfig {
        &self.cfg
    }

    /// Copies a firmware image to the start of flash. An image large
    /// enough to carry a vector table must have a reset vector that
    /// points back into flash.
    pub fn load_firmware(&mut self, image: &[u8]) -> Result<(), ConfigError> {
        if image.len() >= 8 {
            let entry = u32::from_le_bytes(
                image[4..8].try_into().unwrap_or_default(),
            );
            if (entry & !1).wrapping_sub(self.cfg.flash_base_s)
                >= self.cfg.flash_size
            {
                return Err(ConfigError::BadResetVector);
            }
        }
        let flash = self.map.flash_bytes_mut();
        if image.len() > flash.len() {
            return Err(ConfigError::ImageTooLarge {
                image: image.len(),
                flash: flash.len(),
            });
        }
        flash[..image.len()].copy_from_slice(image);
        Ok(())
    }

    pub fn add_poll(&mut self, poll: PollFn) {
        self.polls.push(poll);
    }

    /// Full reset: registers cleared, Secure Thread mode, MSP and PC
    /// loaded from the head of secure flash, VTOR_S at the flash base.
    pub fn reset(&mut self) {
        self.reset_core();
        log::debug!(
            "reset: msp={:#010x} pc={:#010x}",
            self.cpu.sp(),
            self.cpu.pc()
        );
    }

    fn reset_core(&mut self) {
        take_reset_request();
        self.cpu = Cpu::new();
        self.nvic = Nvic::new();
        self.scs = Scs::new();
        self.sau = Sau::default();
        self.mpu = [Mpu::default(), Mpu::default()];
        self.monitor = None;
        self.sleep_on_event = false;
        self.sched.clear();

        let base = self.cfg.flash_base_s;
        self.cpu.vtor[Security::Secure.bank()] = base;
        self.cpu.vtor[Security::NonSecure.bank()] = self.cfg.flash_base_ns;

        let flash = self.map.flash_bytes_mut();
        if flash.len() >= 8 {
            let msp =
                u32::from_le_bytes(flash[0..4].try_into().unwrap_or_default());
            let entry =
                u32::from_le_bytes(flash[4..8].try_into().unwrap_or_default());
            self.cpu.set_sp_of(
                Security::Secure,
                musca_arch::StackSel::Main,
                msp & !3,
            );
            self.cpu.set_pc(entry | 1);
        }
    }

    // --- attribution-checked memory access ----------------------------

    pub fn attribution(&self, addr: u32) -> Attribution {
        attribute(&self.sau, self.idau, addr)
    }

    fn scs_window(
        &self,
        sec: Security,
        addr: u32,
    ) -> Option<(Security, u32)> {
        let off = addr.wrapping_sub(PPB_BASE);
        if off < PPB_SIZE {
            return Some((sec, off));
        }
        let off = addr.wrapping_sub(PPB_NS_ALIAS);
        if sec.is_secure() && off < PPB_SIZE {
            return Some((Security::NonSecure, off));
        }
        None
    }

    fn check_data(
        &self,
        sec: Security,
        addr: u32,
        access: AccessKind,
    ) -> Result<(), FaultInfo> {
        let attr = self.attribution(addr);
        if !sec.is_secure() && attr.sec.is_secure() {
            return Err(FaultInfo::SecureViolation {
                address: Some(addr),
                cause: SecureCause::AttributionViolation,
            });
        }
        if self.mpu[sec.bank()]
            .check(addr, access, self.cpu.privileged())
            .is_err()
        {
            return Err(FaultInfo::MemAccess { address: addr, access });
        }
        Ok(())
    }

    pub fn mem_read(
        &mut self,
        sec: Security,
        addr: u32,
        size: u32,
    ) -> Result<u32, FaultInfo> {
        if let Some((bank, off)) = self.scs_window(sec, addr) {
            if addr % size != 0 {
                return Err(FaultInfo::Unaligned { address: addr });
            }
            let mut ctx = ScsCtx {
                cpu: &mut self.cpu,
                nvic: &mut self.nvic,
                sau: &mut self.sau,
                mpu: &mut self.mpu,
            };
            return self.scs.read(&mut ctx, sec, bank, off, size).ok_or(
                FaultInfo::BusError {
                    address: Some(addr),
                    access: AccessKind::Read,
                },
            );
        }
        self.check_data(sec, addr, AccessKind::Read)?;
        self.map.read(sec, addr, size, AccessKind::Read)
    }

    pub fn mem_write(
        &mut self,
        sec: Security,
        addr: u32,
        size: u32,
        value: u32,
    ) -> Result<(), FaultInfo> {
        if let Some((bank, off)) = self.scs_window(sec, addr) {
            if addr % size != 0 {
                return Err(FaultInfo::Unaligned { address: addr });
            }
            let mut ctx = ScsCtx {
                cpu: &mut self.cpu,
                nvic: &mut self.nvic,
                sau: &mut self.sau,
                mpu: &mut self.mpu,
            };
            return if self.scs.write(&mut ctx, sec, bank, off, size, value) {
                Ok(())
            } else {
                Err(FaultInfo::BusError {
                    address: Some(addr),
                    access: AccessKind::Write,
                })
            };
        }
        self.check_data(sec, addr, AccessKind::Write)?;
        self.map.write(sec, addr, size, value)
    }

    /// Probe used before multi-word stores so no partial transfer is
    /// committed when a later word would fault.
    pub fn mem_check_write(
        &self,
        sec: Security,
        addr: u32,
        size: u32,
    ) -> Result<(), FaultInfo> {
        if self.scs_window(sec, addr).is_some() {
            return Ok(());
        }
        self.check_data(sec, addr, AccessKind::Write)?;
        self.map.check_write(sec, addr, size)
    }

    // --- fetch --------------------------------------------------------

    fn read_code(&mut self, sec: Security, addr: u32) -> Result<u32, FaultInfo> {
        let attr = self.attribution(addr);
        if !sec.is_secure() && attr.sec.is_secure() && !attr.nsc {
            return Err(FaultInfo::InvalidEntry { address: addr });
        }
        if sec.is_secure() && !attr.sec.is_secure() {
            // Secure execution never leaves secure memory without an
            // interworking transition.
            return Err(FaultInfo::SecureViolation {
                address: Some(addr),
                cause: SecureCause::InvalidTransition,
            });
        }
        if self.mpu[sec.bank()]
            .check(addr, AccessKind::Fetch, self.cpu.privileged())
            .is_err()
        {
            return Err(FaultInfo::MemAccess {
                address: addr,
                access: AccessKind::Fetch,
            });
        }
        self.map.read(sec, addr, 2, AccessKind::Fetch)
    }

    /// Fetches one instruction and advances PC past it. On a fault, PC
    /// is left at the failed instruction.
    pub fn fetch(&mut self) -> Result<FetchResult, FaultInfo> {
        let sec = self.cpu.sec;
        let pc = self.cpu.pc() & !1;
        let hw1 = self.read_code(sec, pc)?;
        let (insn, len) = if is_wide_prefix(hw1 as u16) {
            let hw2 = self.read_code(sec, pc.wrapping_add(2))?;
            (hw1 << 16 | hw2, 4u8)
        } else {
            (hw1, 2)
        };
        self.cpu.set_pc(pc.wrapping_add(len as u32) | 1);
        Ok(FetchResult { insn, len, pc })
    }

    // --- the loop -----------------------------------------------------

    pub fn step(&mut self) -> StepOutcome {
        if take_reset_request() {
            self.reset();
            return StepOutcome::Reset;
        }
        if self.cpu.locked_up {
            return StepOutcome::Lockup;
        }

        let outcome = if let Some(fault) = self.cpu.pending_fault.take() {
            let num = self.deliver_fault(fault);
            if self.cpu.locked_up {
                StepOutcome::Lockup
            } else {
                StepOutcome::TookException(num)
            }
        } else if let Some((num, target)) = self.select_exception() {
            self.take_exception(num, target);
            StepOutcome::TookException(num)
        } else if self.cpu.sleeping {
            self.idle_step()
        } else {
            self.execute_one()
        };

        let delta = if outcome == StepOutcome::Idle {
            SLEEP_TIMESLICE
        } else {
            1
        };
        self.cycles += delta;
        self.tick_systicks(delta);
        self.sched.run_due(self.cycles);
        let cycles = self.cycles;
        for poll in &mut self.polls {
            poll(&mut self.nvic, cycles);
        }
        outcome
    }

    fn idle_step(&mut self) -> StepOutcome {
        if self.sleep_on_event {
            let bank = self.cpu.sec.bank();
            if self.cpu.event[bank] {
                self.cpu.event[bank] = false;
                self.cpu.sleeping = false;
                self.sleep_on_event = false;
                return StepOutcome::Executed;
            }
        }
        StepOutcome::Idle
    }

    fn execute_one(&mut self) -> StepOutcome {
        let fetch = match self.fetch() {
            Ok(f) => f,
            Err(fault) => {
                self.cpu.pending_fault = Some(fault);
                return StepOutcome::Executed;
            }
        };
        let decoded = decode::decode(&fetch);
        // A non-SG instruction on non-secure-callable memory is not a
        // legal entry from the non-secure side.
        if !self.cpu.sec.is_secure() && decoded.op != Op::Sg {
            let attr = self.attribution(fetch.pc);
            if attr.sec.is_secure() && attr.nsc {
                self.cpu.set_pc(fetch.pc | 1);
                self.cpu.pending_fault =
                    Some(FaultInfo::InvalidEntry { address: fetch.pc });
                return StepOutcome::Executed;
            }
        }
        match exec::execute(self, &fetch, &decoded) {
            Ok(()) => StepOutcome::Executed,
            Err(fault) => {
                // No partial commit: the faulting instruction is where
                // the frame will point.
                self.cpu.set_pc(fetch.pc | 1);
                self.cpu.pending_fault = Some(fault);
                StepOutcome::Executed
            }
        }
    }

    fn tick_systicks(&mut self, delta: u64) {
        for sec in [Security::NonSecure, Security::Secure] {
            let bank = sec.bank();
            if self.scs.systick[bank].tick(delta)
                && self.scs.systick[bank].tickint
            {
                self.scs.pend_st[bank] = true;
            }
        }
    }

    /// Runs until the machine goes idle, locks up, or `max_steps` pass.
    pub fn run(&mut self, max_steps: u64) -> StepOutcome {
        let mut last = StepOutcome::Executed;
        for _ in 0..max_steps {
            last = self.step();
            if last == StepOutcome::Lockup {
                break;
            }
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetConfig;

    fn machine() -> Machine {
        crate::init_test_logging();
        Machine::new(TargetConfig::generic()).unwrap()
    }

    /// Builds a flash image: vector table (MSP, reset) then code at
    /// offset 0x40.
    fn boot_image(code: &[u16]) -> Vec<u8> {
        let cfg = TargetConfig::generic();
        let mut image = vec![0u8; 0x40 + code.len() * 2];
        image[0..4].copy_from_slice(&(cfg.ram_base_s + 0x1000).to_le_bytes());
        image[4..8].copy_from_slice(&(cfg.flash_base_s + 0x41).to_le_bytes());
        for (i, hw) in code.iter().enumerate() {
            let at = 0x40 + i * 2;
            image[at..at + 2].copy_from_slice(&hw.to_le_bytes());
        }
        image
    }

    #[test]
    fn reset_loads_vector_table() {
        let mut m = machine();
        m.load_firmware(&boot_image(&[0xbf00])).unwrap();
        m.reset();
        let cfg = TargetConfig::generic();
        assert_eq!(m.cpu.sec, Security::Secure);
        assert!(!m.cpu.handler_mode());
        assert_eq!(m.cpu.sp(), cfg.ram_base_s + 0x1000);
        assert_eq!(m.cpu.pc() & !1, cfg.flash_base_s + 0x40);
        assert!(m.cpu.xpsr.t());
        assert_eq!(
            m.cpu.vtor[Security::Secure.bank()],
            cfg.flash_base_s
        );
    }

    #[test]
    fn nop_advances_pc_and_cycles() {
        let mut m = machine();
        m.load_firmware(&boot_image(&[0xbf00, 0xbf00])).unwrap();
        m.reset();
        let pc0 = m.cpu.pc() & !1;
        assert_eq!(m.step(), StepOutcome::Executed);
        assert_eq!(m.cpu.pc() & !1, pc0 + 2);
        assert_eq!(m.cycles, 1);
    }

    #[test]
    fn firmware_with_stray_reset_vector_is_rejected() {
        let cfg = TargetConfig::generic();
        let mut m = machine();
        let mut image = boot_image(&[0xbf00]);
        // Point the reset vector into RAM instead of flash.
        image[4..8].copy_from_slice(&(cfg.ram_base_s + 1).to_le_bytes());
        assert!(matches!(
            m.load_firmware(&image),
            Err(ConfigError::BadResetVector)
        ));
        // A short blob with no vector table loads unchecked.
        m.load_firmware(&[0xde, 0xad]).unwrap();
    }

    #[test]
    fn wide_fetch_advances_by_four() {
        let cfg = TargetConfig::generic();
        let mut m = machine();
        // BL .+0x20 at the entry point.
        let mut image = boot_image(&[0xf000, 0xf810]);
        image.resize(0x100, 0);
        m.load_firmware(&image).unwrap();
        m.reset();
        assert_eq!(m.step(), StepOutcome::Executed);
        assert_eq!(m.cpu.pc() & !1, cfg.flash_base_s + 0x40 + 4 + 0x20);
        assert_eq!(m.cpu.lr(), cfg.flash_base_s + 0x44 | 1);
    }

    #[test]
    fn fetch_from_unmapped_faults_without_moving_pc() {
        let mut m = machine();
        m.load_firmware(&boot_image(&[0xbf00])).unwrap();
        m.reset();
        m.cpu.set_pc(0x9000_0001);
        m.step();
        assert!(m.cpu.pending_fault.is_some());
        assert_eq!(m.cpu.pc(), 0x9000_0001);
    }

    #[test]
    fn reset_request_is_observed_between_steps() {
        let mut m = machine();
        m.load_firmware(&boot_image(&[0xbf00, 0xbf00, 0xbf00])).unwrap();
        m.reset();
        m.step();
        request_reset();
        assert_eq!(m.step(), StepOutcome::Reset);
        let cfg = TargetConfig::generic();
        assert_eq!(m.cpu.pc() & !1, cfg.flash_base_s + 0x40);
    }

    #[test]
    fn poll_pass_can_pend_interrupts() {
        let mut m = machine();
        m.load_firmware(&boot_image(&[0xbf00, 0xbf00])).unwrap();
        m.reset();
        m.add_poll(Box::new(|nvic, _cycles| {
            nvic.set_pending(3, true);
        }));
        m.step();
        assert!(m.nvic.is_pending(3));
    }

    #[test]
    fn interrupt_preempts_and_returns_to_firmware() {
        let cfg = TargetConfig::generic();
        let mut image = vec![0u8; 0x200];
        image[0..4].copy_from_slice(&(cfg.ram_base_s + 0x1000).to_le_bytes());
        image[4..8].copy_from_slice(&(cfg.flash_base_s + 0x141).to_le_bytes());
        // IRQ 0 vector -> handler at +0x160.
        image[0x40..0x44]
            .copy_from_slice(&(cfg.flash_base_s + 0x161).to_le_bytes());
        // Main loop at +0x140: NOP; B .-2
        image[0x140..0x142].copy_from_slice(&0xbf00u16.to_le_bytes());
        image[0x142..0x144].copy_from_slice(&0xe7feu16.to_le_bytes());
        // Handler: MOVS R7, #1; BX LR
        image[0x160..0x162].copy_from_slice(&0x2701u16.to_le_bytes());
        image[0x162..0x164].copy_from_slice(&0x4770u16.to_le_bytes());

        let mut m = machine();
        m.load_firmware(&image).unwrap();
        m.reset();
        m.nvic.set_enable(0, true);
        m.nvic.set_priority(0, 0x80);

        assert_eq!(m.step(), StepOutcome::Executed); // NOP
        m.nvic.set_pending(0, true);
        assert_eq!(
            m.step(),
            StepOutcome::TookException(musca_arch::ExceptionNum(16))
        );
        assert_eq!(m.cpu.pc() & !1, cfg.flash_base_s + 0x160);
        assert_eq!(m.step(), StepOutcome::Executed); // MOVS R7, #1
        assert_eq!(m.cpu.reg(7), 1);
        assert_eq!(m.step(), StepOutcome::Executed); // BX LR (return)
        assert!(!m.cpu.handler_mode());
        // Back in the spin loop.
        assert_eq!(m.cpu.pc() & !1, cfg.flash_base_s + 0x142);
        assert_eq!(m.step(), StepOutcome::Executed); // B .-2
        assert_eq!(m.cpu.pc() & !1, cfg.flash_base_s + 0x142);
    }

    #[test]
    fn wfi_idles_until_interrupt_wakes() {
        let cfg = TargetConfig::generic();
        let mut image = vec![0u8; 0x200];
        image[0..4].copy_from_slice(&(cfg.ram_base_s + 0x1000).to_le_bytes());
        image[4..8].copy_from_slice(&(cfg.flash_base_s + 0x141).to_le_bytes());
        image[0x40..0x44]
            .copy_from_slice(&(cfg.flash_base_s + 0x161).to_le_bytes());
        // Main: WFI; B .-2
        image[0x140..0x142].copy_from_slice(&0xbf30u16.to_le_bytes());
        image[0x142..0x144].copy_from_slice(&0xe7feu16.to_le_bytes());
        // Handler: BX LR
        image[0x160..0x162].copy_from_slice(&0x4770u16.to_le_bytes());

        let mut m = machine();
        m.load_firmware(&image).unwrap();
        m.reset();
        m.nvic.set_enable(0, true);
        m.nvic.set_priority(0, 0x80);

        assert_eq!(m.step(), StepOutcome::Executed); // WFI parks the core
        assert!(m.cpu.sleeping);
        assert_eq!(m.step(), StepOutcome::Idle);
        let idle_cycles = m.cycles;
        assert!(idle_cycles > 2); // slept a coarse timeslice

        m.nvic.set_pending(0, true);
        assert_eq!(
            m.step(),
            StepOutcome::TookException(musca_arch::ExceptionNum(16))
        );
        assert!(!m.cpu.sleeping);
    }

    #[test]
    fn systick_fires_through_the_loop() {
        let cfg = TargetConfig::generic();
        let mut image = vec![0u8; 0x200];
        image[0..4].copy_from_slice(&(cfg.ram_base_s + 0x1000).to_le_bytes());
        image[4..8].copy_from_slice(&(cfg.flash_base_s + 0x141).to_le_bytes());
        // SysTick vector (15) -> handler at +0x160.
        image[15 * 4..15 * 4 + 4]
            .copy_from_slice(&(cfg.flash_base_s + 0x161).to_le_bytes());
        // Main: B . ; handler: BX LR
        image[0x140..0x142].copy_from_slice(&0xe7feu16.to_le_bytes());
        image[0x160..0x162].copy_from_slice(&0x4770u16.to_le_bytes());

        let mut m = machine();
        m.load_firmware(&image).unwrap();
        m.reset();
        let bank = Security::Secure.bank();
        m.scs.systick[bank].enabled = true;
        m.scs.systick[bank].tickint = true;
        m.scs.systick[bank].rvr = 10;
        m.scs.systick[bank].cvr = 10;

        let mut took = false;
        for _ in 0..40 {
            if m.step()
                == StepOutcome::TookException(musca_arch::ExceptionNum(15))
            {
                took = true;
                break;
            }
        }
        assert!(took, "SysTick never fired");
        assert!(m.scs.systick[bank].countflag);
    }

    #[test]
    fn scs_reachable_through_memory_path() {
        let mut m = machine();
        let v = m.mem_read(Security::Secure, 0xe000_ed00, 4).unwrap();
        assert_eq!(v, crate::scs::CPUID_RESET);
        // NS alias from Secure reaches the NS bank.
        m.mem_write(Security::Secure, 0xe002_ed08, 4, 0x2000).unwrap();
        assert_eq!(m.cpu.vtor[Security::NonSecure.bank()], 0x2000);
        // The alias does not exist for non-secure callers.
        assert!(m.mem_read(Security::NonSecure, 0xe002_ed00, 4).is_err());
    }
}
