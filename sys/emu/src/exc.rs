// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exception entry, return, selection, and fault delivery.
//!
//! Selection folds three sources together: NMI, the banked PendSV and
//! SysTick pendings, and the external interrupts from the NVIC. A
//! candidate preempts only when its priority is numerically below the
//! current execution priority (the minimum over all active handlers);
//! ties between candidates resolve by exception number, so PendSV and
//! SysTick beat any external interrupt of equal priority.
//!
//! Entry stacks the 32-byte basic frame on the interrupted context's
//! stack. Entering a Secure-targeted exception from non-secure context
//! additionally pushes an integrity frame (signature word plus the
//! expected EXC_RETURN) on the secure main stack; the matching return
//! authenticates against it and raises a SecureFault on mismatch.

use musca_arch::{
    BasicFrame, Control, ExcReturn, ExceptionNum, FaultInfo, Security,
    StackSel, Xpsr, STACK_INTEGRITY_SIG,
};
use zerocopy::{FromBytes, IntoBytes};

use crate::runloop::Machine;
use crate::scs::{
    SHCSR_BUSFAULTENA, SHCSR_MEMFAULTENA, SHCSR_SECUREFAULTENA,
    SHCSR_USGFAULTENA,
};

/// Priority value meaning "nothing active": below every real priority.
const BASE_PRIORITY: i16 = 256;
const HFSR_FORCED: u32 = 1 << 30;

impl Machine {
    /// Minimum priority over every active handler.
    pub(crate) fn execution_priority(&self) -> i16 {
        let mut p = BASE_PRIORITY;
        for sec in [Security::NonSecure, Security::Secure] {
            let bank = sec.bank();
            let active = self.scs.sys_active[bank];
            for num in 2..16u16 {
                if active & 1 << num != 0 {
                    let num = ExceptionNum(num);
                    let prio = num
                        .fixed_priority()
                        .unwrap_or(self.scs.sys_priority(sec, num.0) as i16);
                    p = p.min(prio);
                }
            }
        }
        for irq in 0..musca_arch::IRQ_COUNT as u16 {
            if self.nvic.is_active(irq) {
                p = p.min(self.nvic.priority(irq) as i16);
            }
        }
        p
    }

    fn masked_for(&self, target: Security, prio: i16) -> bool {
        let bank = target.bank();
        if self.cpu.primask[bank] || self.cpu.faultmask[bank] {
            return true;
        }
        let basepri = self.cpu.basepri[bank] as i16;
        basepri != 0 && prio >= basepri
    }

    /// Highest-urgency deliverable exception, if it may preempt now.
    pub(crate) fn select_exception(
        &self,
    ) -> Option<(ExceptionNum, Security)> {
        let exec_prio = self.execution_priority();
        let mut best: Option<(i16, u16, Security)> = None;
        let mut consider = |prio: i16, num: u16, target: Security| {
            match best {
                Some((bp, bn, _)) if (bp, bn) <= (prio, num) => {}
                _ => best = Some((prio, num, target)),
            }
        };

        if self.scs.pend_nmi
            && self.scs.sys_active[Security::Secure.bank()]
                & 1 << ExceptionNum::NMI.0
                == 0
        {
            consider(-2, ExceptionNum::NMI.0, Security::Secure);
        }
        for sec in [Security::NonSecure, Security::Secure] {
            let bank = sec.bank();
            for (pend, num) in [
                (self.scs.pend_sv[bank], ExceptionNum::PENDSV),
                (self.scs.pend_st[bank], ExceptionNum::SYSTICK),
            ] {
                if !pend || self.scs.sys_active[bank] & 1 << num.0 != 0 {
                    continue;
                }
                let prio = self.scs.sys_priority(sec, num.0) as i16;
                if !self.masked_for(sec, prio) {
                    consider(prio, num.0, sec);
                }
            }
        }
        if let Some(p) = self.nvic.select_pending(&self.cpu) {
            consider(
                p.priority as i16,
                ExceptionNum::external(p.irq).0,
                p.target,
            );
        }

        let (prio, num, target) = best?;
        if prio < exec_prio {
            Some((ExceptionNum(num), target))
        } else {
            None
        }
    }

    /// Exception entry: frame stacking, bookkeeping, vector fetch.
    pub(crate) fn take_exception(
        &mut self,
        num: ExceptionNum,
        target: Security,
    ) {
        let from_sec = self.cpu.sec;
        let from_thread = !self.cpu.handler_mode();
        let sel = if from_thread {
            self.cpu.stack_sel()
        } else {
            StackSel::Main
        };
        let use_psp = sel == StackSel::Process;

        // Build and push the basic frame.
        let mut sp = self.cpu.sp_of(from_sec, sel);
        let mut saved_xpsr = self.cpu.xpsr;
        if sp & 4 != 0 {
            sp -= 4;
            saved_xpsr.0 |= Xpsr::SPREALIGN;
        } else {
            saved_xpsr.0 &= !Xpsr::SPREALIGN;
        }
        sp -= BasicFrame::SIZE;
        if sp < self.cpu.sp_limit_of(from_sec, sel) {
            log::warn!("stack limit violated during exception entry");
            self.scs.cfsr[from_sec.bank()] |=
                FaultInfo::StackOverflow { address: sp }.cfsr_bits();
            self.cpu.locked_up = true;
            return;
        }
        let frame = BasicFrame {
            r0: self.cpu.reg(0),
            r1: self.cpu.reg(1),
            r2: self.cpu.reg(2),
            r3: self.cpu.reg(3),
            r12: self.cpu.reg(12),
            lr: self.cpu.lr(),
            return_addr: self.cpu.pc() & !1,
            xpsr: saved_xpsr.0,
        };
        if self.push_frame(from_sec, sp, &frame).is_err() {
            log::warn!("frame stacking failed at {sp:#010x}");
            self.cpu.locked_up = true;
            return;
        }
        self.cpu.set_sp_of(from_sec, sel, sp);

        let exc_ret = ExcReturn::encode(from_sec, use_psp, from_thread);

        // Cross-state entry into the secure world leaves an integrity
        // frame on the secure main stack for the return to verify.
        if target.is_secure() && !from_sec.is_secure() {
            let ssp =
                self.cpu.sp_of(Security::Secure, StackSel::Main) - 8;
            let ok = self
                .mem_write(Security::Secure, ssp, 4, STACK_INTEGRITY_SIG)
                .and_then(|()| {
                    self.mem_write(Security::Secure, ssp + 4, 4, exc_ret)
                });
            if ok.is_err() {
                self.cpu.locked_up = true;
                return;
            }
            self.cpu.set_sp_of(Security::Secure, StackSel::Main, ssp);
        }

        // Pending/active bookkeeping.
        match num.irq() {
            Some(irq) => {
                self.nvic.set_pending(irq, false);
                self.nvic.set_active(irq, true);
            }
            None => {
                let bank = target.bank();
                self.scs.sys_active[bank] |= 1 << num.0;
                match num {
                    ExceptionNum::PENDSV => self.scs.pend_sv[bank] = false,
                    ExceptionNum::SYSTICK => self.scs.pend_st[bank] = false,
                    ExceptionNum::NMI => self.scs.pend_nmi = false,
                    _ => {}
                }
            }
        }

        // Switch worlds and branch through the vector table. The vector
        // read is a hardware access, exempt from attribution.
        self.cpu.sec = target;
        self.cpu.it_clear();
        self.cpu.sleeping = false;
        self.sleep_on_event = false;
        self.cpu.xpsr.set_ipsr(num.0);
        self.cpu.xpsr.set_t(true);
        self.monitor = None;

        let vector =
            self.cpu.vtor[target.bank()].wrapping_add(num.vector_offset());
        let entry = match self.map.read(
            target,
            vector,
            4,
            musca_arch::AccessKind::Fetch,
        ) {
            Ok(v) => v,
            Err(_) => {
                log::warn!("vector fetch failed at {vector:#010x}");
                self.cpu.locked_up = true;
                return;
            }
        };
        if entry & 1 == 0 {
            self.cpu.pending_fault = Some(FaultInfo::InvalidState);
            return;
        }
        self.cpu.set_pc(entry);
        self.cpu.set_lr(exc_ret);
        log::debug!(
            "exception {} -> {:?} vector {vector:#010x} lr {exc_ret:#010x}",
            num.0,
            target,
        );
    }

    fn push_frame(
        &mut self,
        sec: Security,
        sp: u32,
        frame: &BasicFrame,
    ) -> Result<(), FaultInfo> {
        let bytes = frame.as_bytes();
        for i in 0..(BasicFrame::SIZE / 4) {
            self.mem_check_write(sec, sp + i * 4, 4)?;
        }
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            let word = u32::from_le_bytes(chunk.try_into().unwrap_or_default());
            self.mem_write(sec, sp + i as u32 * 4, 4, word)?;
        }
        Ok(())
    }

    fn pop_frame(
        &mut self,
        sec: Security,
        sp: u32,
    ) -> Result<BasicFrame, FaultInfo> {
        let mut bytes = [0u8; BasicFrame::SIZE as usize];
        for i in 0..(BasicFrame::SIZE / 4) {
            let w = self.mem_read(sec, sp + i * 4, 4)?;
            let at = i as usize * 4;
            bytes[at..at + 4].copy_from_slice(&w.to_le_bytes());
        }
        Ok(BasicFrame::read_from_bytes(&bytes).unwrap_or_default())
    }

    /// Delivers a synchronous fault, escalating to HardFault (and from
    /// there to lockup) when its handler cannot run.
    pub(crate) fn deliver_fault(&mut self, fault: FaultInfo) -> ExceptionNum {
        let num = fault.exception();
        let target = if num == ExceptionNum::SECURE_FAULT {
            Security::Secure
        } else {
            self.cpu.sec
        };
        let bank = target.bank();

        // Populate the status registers first; handlers diagnose from
        // these whether or not escalation happens.
        self.scs.cfsr[bank] |= fault.cfsr_bits();
        self.scs.sfsr |= fault.sfsr_bits();
        if let Some(addr) = fault.address() {
            match num {
                ExceptionNum::MEM_MANAGE => self.scs.mmfar[bank] = addr,
                ExceptionNum::BUS_FAULT => self.scs.bfar[bank] = addr,
                ExceptionNum::SECURE_FAULT => self.scs.sfar = addr,
                _ => {}
            }
        }

        let enabled = match num {
            ExceptionNum::USAGE_FAULT => {
                self.scs.shcsr[bank] & SHCSR_USGFAULTENA != 0
            }
            ExceptionNum::BUS_FAULT => {
                self.scs.shcsr[bank] & SHCSR_BUSFAULTENA != 0
            }
            ExceptionNum::MEM_MANAGE => {
                self.scs.shcsr[bank] & SHCSR_MEMFAULTENA != 0
            }
            ExceptionNum::SECURE_FAULT => {
                self.scs.shcsr[Security::Secure.bank()]
                    & SHCSR_SECUREFAULTENA
                    != 0
            }
            _ => true,
        };
        let already_active = self.scs.sys_active[bank] & 1 << num.0 != 0;
        let prio = self.scs.sys_priority(target, num.0) as i16;
        let exec_prio = self.execution_priority();

        if enabled && !already_active && prio < exec_prio {
            log::debug!("fault {fault:?} -> exception {}", num.0);
            self.take_exception(num, target);
            return num;
        }

        // Escalate.
        self.scs.hfsr[Security::Secure.bank()] |= HFSR_FORCED;
        let hf_blocked = exec_prio <= -1
            || self.cpu.faultmask[Security::Secure.bank()];
        if hf_blocked {
            log::warn!("unrecoverable fault {fault:?}: lockup");
            self.cpu.locked_up = true;
        } else {
            log::debug!("fault {fault:?} escalated to HardFault");
            self.take_exception(ExceptionNum::HARD_FAULT, Security::Secure);
        }
        ExceptionNum::HARD_FAULT
    }

    /// Handles a magic value written to PC: decode, tail-chain or
    /// unstack, restore.
    pub(crate) fn exc_return(&mut self, value: u32) -> Result<(), FaultInfo> {
        let er = ExcReturn::decode(value).ok_or(FaultInfo::InvalidState)?;
        if !self.cpu.handler_mode() {
            return Err(FaultInfo::InvalidState);
        }
        let returning = self.cpu.xpsr.ipsr();

        // The completing handler no longer counts toward execution
        // priority.
        match ExceptionNum(returning).irq() {
            Some(irq) => self.nvic.set_active(irq, false),
            None => {
                self.scs.sys_active[self.cpu.sec.bank()] &=
                    !(1 << returning);
            }
        }

        // Tail-chain: a same-world exception that is now deliverable is
        // entered directly, without touching the stacked frame.
        if let Some((num, target)) = self.select_exception() {
            if target == self.cpu.sec {
                log::debug!(
                    "tail-chain from {} to {}",
                    returning,
                    num.0
                );
                match num.irq() {
                    Some(irq) => {
                        self.nvic.set_pending(irq, false);
                        self.nvic.set_active(irq, true);
                    }
                    None => {
                        let bank = target.bank();
                        self.scs.sys_active[bank] |= 1 << num.0;
                        match num {
                            ExceptionNum::PENDSV => {
                                self.scs.pend_sv[bank] = false
                            }
                            ExceptionNum::SYSTICK => {
                                self.scs.pend_st[bank] = false
                            }
                            ExceptionNum::NMI => self.scs.pend_nmi = false,
                            _ => {}
                        }
                    }
                }
                self.cpu.xpsr.set_ipsr(num.0);
                let vector = self.cpu.vtor[target.bank()]
                    .wrapping_add(num.vector_offset());
                let entry = self
                    .map
                    .read(target, vector, 4, musca_arch::AccessKind::Fetch)
                    .map_err(|_| FaultInfo::InvalidState)?;
                self.cpu.set_pc(entry | 1);
                self.cpu.set_lr(value);
                return Ok(());
            }
        }

        // Cross-state return: authenticate against the integrity frame.
        if self.cpu.sec.is_secure() && !er.target_sec.is_secure() {
            let ssp = self.cpu.sp_of(Security::Secure, StackSel::Main);
            let sig = self.mem_read(Security::Secure, ssp, 4)?;
            let expected = self.mem_read(Security::Secure, ssp + 4, 4)?;
            if sig != STACK_INTEGRITY_SIG || expected != value {
                return Err(FaultInfo::InvalidReturn);
            }
            self.cpu
                .set_sp_of(Security::Secure, StackSel::Main, ssp + 8);
        }

        // Unstack from the stack named by the return value.
        let sec = er.target_sec;
        let sel = if er.to_thread && er.use_psp {
            StackSel::Process
        } else {
            StackSel::Main
        };
        let sp = self.cpu.sp_of(sec, sel);
        let frame = self.pop_frame(sec, sp)?;
        let mut new_sp = sp + BasicFrame::SIZE;
        if frame.xpsr & Xpsr::SPREALIGN != 0 {
            new_sp += 4;
        }

        self.cpu.sec = sec;
        self.cpu.set_sp_of(sec, sel, new_sp);
        self.cpu.set_reg(0, frame.r0);
        self.cpu.set_reg(1, frame.r1);
        self.cpu.set_reg(2, frame.r2);
        self.cpu.set_reg(3, frame.r3);
        self.cpu.set_reg(12, frame.r12);
        self.cpu.set_lr(frame.lr);
        self.cpu.xpsr = Xpsr(frame.xpsr & !Xpsr::SPREALIGN);
        self.cpu.set_pc(frame.return_addr | 1);
        if er.to_thread {
            let bank = sec.bank();
            self.cpu.control[bank].set(Control::SPSEL, er.use_psp);
        }
        log::debug!(
            "exception return {} -> {:?} pc {:#010x}",
            returning,
            sec,
            frame.return_addr
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runloop::StepOutcome;
    use crate::target::TargetConfig;

    const S: Security = Security::Secure;
    const NS: Security = Security::NonSecure;

    /// Flash image with both worlds' vector tables (shared backing, so
    /// one image serves the secure and non-secure windows).
    fn image_with_vectors() -> Vec<u8> {
        let cfg = TargetConfig::generic();
        let mut image = vec![0u8; 0x400];
        // Secure table at the flash base.
        image[0..4].copy_from_slice(&(cfg.ram_base_s + 0x2000).to_le_bytes());
        image[4..8].copy_from_slice(&(cfg.flash_base_s + 0x201).to_le_bytes());
        // Vector entries (both tables alias the same bytes here): every
        // exception lands on a handler stub at +0x300.
        for num in 2..=63 + 16 {
            let at = num * 4;
            image[at..at + 4]
                .copy_from_slice(&(cfg.flash_base_ns + 0x301).to_le_bytes());
        }
        image
    }

    fn machine() -> Machine {
        crate::init_test_logging();
        let mut m = Machine::new(TargetConfig::generic()).unwrap();
        m.load_firmware(&image_with_vectors()).unwrap();
        m.reset();
        m
    }

    #[test]
    fn entry_and_return_round_trip() {
        let mut m = machine();
        let cfg = TargetConfig::generic();

        // Thread mode on the secure process stack.
        m.cpu.control[S.bank()] |= Control::SPSEL;
        let psp0 = cfg.ram_base_s + 0x800;
        m.cpu.set_sp_of(S, StackSel::Process, psp0);
        for r in 0..4 {
            m.cpu.set_reg(r, 0x1111_0000 + r as u32);
        }
        m.cpu.set_reg(12, 0xc0c0_c0c0);
        m.cpu.set_lr(0xffff_fffd);
        m.cpu.set_pc(0x1234 | 1);

        // IRQ 5 pending, enabled, routed non-secure.
        m.nvic.set_enable(5, true);
        m.nvic.set_pending(5, true);
        m.nvic.set_priority(5, 0x80);
        m.nvic.set_itns(5, true);

        let outcome = m.step();
        assert_eq!(outcome, StepOutcome::TookException(ExceptionNum(21)));
        assert_eq!(m.cpu.xpsr.ipsr(), 21);
        assert_eq!(m.cpu.sec, NS);
        assert_eq!(m.cpu.pc() & !1, cfg.flash_base_ns + 0x300);
        assert_eq!(m.cpu.lr(), 0xffff_ffed);
        assert!(m.nvic.is_active(5));
        assert!(!m.nvic.is_pending(5));

        // The frame lives on the secure process stack.
        assert_eq!(m.cpu.sp_of(S, StackSel::Process), psp0 - 32);
        let ret = m.mem_read(S, psp0 - 8, 4).unwrap();
        assert_eq!(ret, 0x1234);

        // Scribble over the caller-saved registers, then return.
        for r in 0..4 {
            m.cpu.set_reg(r, 0xdead_0000 + r as u32);
        }
        m.exc_return(0xffff_ffed).unwrap();

        assert_eq!(m.cpu.sec, S);
        assert!(!m.cpu.handler_mode());
        for r in 0..4 {
            assert_eq!(m.cpu.reg(r), 0x1111_0000 + r as u32);
        }
        assert_eq!(m.cpu.reg(12), 0xc0c0_c0c0);
        assert_eq!(m.cpu.lr(), 0xffff_fffd);
        assert_eq!(m.cpu.pc() & !1, 0x1234);
        assert_eq!(m.cpu.sp_of(S, StackSel::Process), psp0);
        assert!(!m.nvic.is_active(5));
    }

    #[test]
    fn frame_alignment_pad_round_trips() {
        let mut m = machine();
        let cfg = TargetConfig::generic();
        // A stack pointer that is 4- but not 8-aligned forces the pad.
        let sp0 = cfg.ram_base_s + 0x804;
        m.cpu.set_sp_of(S, StackSel::Main, sp0);
        m.cpu.set_pc(0x400 | 1);
        m.nvic.set_enable(2, true);
        m.nvic.set_pending(2, true);
        m.nvic.set_priority(2, 0);

        m.step();
        // 4 bytes of pad plus the 32-byte frame.
        assert_eq!(m.cpu.sp_of(S, StackSel::Main), sp0 - 36);

        m.exc_return(m.cpu.lr()).unwrap();
        assert_eq!(m.cpu.sp_of(S, StackSel::Main), sp0);
        assert!(m.cpu.xpsr.0 & Xpsr::SPREALIGN == 0);
    }

    #[test]
    fn nested_entry_uses_main_stack_and_returns_to_handler() {
        let mut m = machine();
        let cfg = TargetConfig::generic();
        m.cpu.set_sp_of(S, StackSel::Main, cfg.ram_base_s + 0x1000);
        m.cpu.set_pc(0x500 | 1);
        m.nvic.set_enable(1, true);
        m.nvic.set_pending(1, true);
        m.nvic.set_priority(1, 0x80);
        m.step();
        assert_eq!(m.cpu.xpsr.ipsr(), 17);

        // A higher-urgency interrupt preempts the running handler.
        m.nvic.set_enable(2, true);
        m.nvic.set_pending(2, true);
        m.nvic.set_priority(2, 0x10);
        m.step();
        assert_eq!(m.cpu.xpsr.ipsr(), 18);
        // From-handler return value: to-Handler, main stack.
        let lr = m.cpu.lr();
        let er = ExcReturn::decode(lr).unwrap();
        assert!(!er.to_thread);
        assert!(!er.use_psp);

        m.exc_return(lr).unwrap();
        assert_eq!(m.cpu.xpsr.ipsr(), 17);
        assert!(m.nvic.is_active(1));
        assert!(!m.nvic.is_active(2));
    }

    #[test]
    fn equal_priority_does_not_preempt() {
        let mut m = machine();
        let cfg = TargetConfig::generic();
        m.cpu.set_sp_of(S, StackSel::Main, cfg.ram_base_s + 0x1000);
        m.cpu.set_pc(0x500 | 1);
        m.nvic.set_enable(1, true);
        m.nvic.set_pending(1, true);
        m.nvic.set_priority(1, 0x40);
        m.step();
        assert_eq!(m.cpu.xpsr.ipsr(), 17);

        m.nvic.set_enable(2, true);
        m.nvic.set_pending(2, true);
        m.nvic.set_priority(2, 0x40);
        assert!(m.select_exception().is_none());
    }

    #[test]
    fn pendsv_beats_equal_priority_external() {
        let mut m = machine();
        m.scs.pend_sv[S.bank()] = true;
        m.nvic.set_enable(0, true);
        m.nvic.set_pending(0, true);
        m.nvic.set_priority(0, 0);
        let (num, _) = m.select_exception().unwrap();
        assert_eq!(num, ExceptionNum::PENDSV);
    }

    #[test]
    fn tail_chain_keeps_frame() {
        let mut m = machine();
        let cfg = TargetConfig::generic();
        m.cpu.set_sp_of(S, StackSel::Main, cfg.ram_base_s + 0x1000);
        m.cpu.set_pc(0x500 | 1);
        m.nvic.set_enable(1, true);
        m.nvic.set_pending(1, true);
        m.nvic.set_priority(1, 0x40);
        m.step();
        let sp_in_handler = m.cpu.sp();

        // A second, same-or-lower-urgency interrupt pends while the
        // first runs; the return chains into it without unstacking.
        m.nvic.set_enable(9, true);
        m.nvic.set_pending(9, true);
        m.nvic.set_priority(9, 0x40);
        let lr = m.cpu.lr();
        m.exc_return(lr).unwrap();
        assert_eq!(m.cpu.xpsr.ipsr(), 25);
        assert_eq!(m.cpu.sp(), sp_in_handler);
        assert_eq!(m.cpu.lr(), lr);
        assert!(m.nvic.is_active(9));
        assert!(!m.nvic.is_active(1));

        // The real return still restores the original frame.
        m.exc_return(lr).unwrap();
        assert!(!m.cpu.handler_mode());
        assert_eq!(m.cpu.pc() & !1, 0x500);
    }

    #[test]
    fn cross_state_integrity_round_trip() {
        let mut m = machine();
        let cfg = TargetConfig::generic();
        // Non-secure thread code, secure-targeted interrupt.
        m.cpu.sec = NS;
        m.cpu.set_sp_of(NS, StackSel::Main, cfg.ram_base_ns + 0x1000);
        m.cpu.set_sp_of(S, StackSel::Main, cfg.ram_base_s + 0x1000);
        m.cpu.set_pc(0x600 | 1);
        // Make non-secure RAM and flash actually non-secure so the NS
        // frame can be stacked.
        m.sau.enabled = true;
        m.sau.regions[0] = crate::prot::SauRegion {
            base: 0x0000_0000,
            limit: 0x2fff_ffff,
            enabled: true,
            nsc: false,
        };

        m.nvic.set_enable(4, true);
        m.nvic.set_pending(4, true);
        m.nvic.set_priority(4, 0x20);
        // ITNS clear: targets Secure.
        m.step();
        assert_eq!(m.cpu.sec, S);
        assert_eq!(m.cpu.xpsr.ipsr(), 20);
        let lr = m.cpu.lr();
        let er = ExcReturn::decode(lr).unwrap();
        assert_eq!(er.target_sec, NS);

        // The integrity frame sits on the secure main stack.
        let ssp = m.cpu.sp_of(S, StackSel::Main);
        assert_eq!(m.mem_read(S, ssp, 4).unwrap(), STACK_INTEGRITY_SIG);
        assert_eq!(m.mem_read(S, ssp + 4, 4).unwrap(), lr);

        m.exc_return(lr).unwrap();
        assert_eq!(m.cpu.sec, NS);
        assert_eq!(m.cpu.pc() & !1, 0x600);
        assert_eq!(m.cpu.sp_of(S, StackSel::Main), cfg.ram_base_s + 0x1000);
    }

    #[test]
    fn corrupted_integrity_frame_is_rejected() {
        let mut m = machine();
        let cfg = TargetConfig::generic();
        m.cpu.sec = NS;
        m.cpu.set_sp_of(NS, StackSel::Main, cfg.ram_base_ns + 0x1000);
        m.cpu.set_sp_of(S, StackSel::Main, cfg.ram_base_s + 0x1000);
        m.cpu.set_pc(0x600 | 1);
        m.sau.enabled = true;
        m.sau.regions[0] = crate::prot::SauRegion {
            base: 0x0000_0000,
            limit: 0x2fff_ffff,
            enabled: true,
            nsc: false,
        };
        m.nvic.set_enable(4, true);
        m.nvic.set_pending(4, true);
        m.nvic.set_priority(4, 0x20);
        m.step();
        let lr = m.cpu.lr();

        let ssp = m.cpu.sp_of(S, StackSel::Main);
        m.mem_write(S, ssp, 4, 0x1234_5678).unwrap();
        assert_eq!(m.exc_return(lr), Err(FaultInfo::InvalidReturn));
    }

    #[test]
    fn stacking_below_the_limit_register_is_refused() {
        let mut m = machine();
        let cfg = TargetConfig::generic();
        // Barely enough room for nothing: the 32-byte frame would cross
        // the limit.
        m.cpu.set_sp_of(S, StackSel::Main, cfg.ram_base_s + 0x20);
        m.cpu.msplim[S.bank()] = cfg.ram_base_s + 0x10;
        m.cpu.set_pc(0x500 | 1);
        m.nvic.set_enable(2, true);
        m.nvic.set_pending(2, true);
        m.nvic.set_priority(2, 0);
        m.step();
        assert!(m.cpu.locked_up);
        // The stack-overflow cause is recorded for post-mortem.
        assert!(m.scs.cfsr[S.bank()] & 1 << 20 != 0);
    }

    #[test]
    fn disabled_configurable_fault_escalates_to_hardfault() {
        let mut m = machine();
        let cfg = TargetConfig::generic();
        m.cpu.set_sp_of(S, StackSel::Main, cfg.ram_base_s + 0x1000);
        m.cpu.set_pc(0x700 | 1);
        let num =
            m.deliver_fault(FaultInfo::UndefInstruction { encoding: 0xde00 });
        assert_eq!(num, ExceptionNum::HARD_FAULT);
        assert_eq!(m.cpu.xpsr.ipsr(), 3);
        assert!(m.scs.hfsr[S.bank()] & HFSR_FORCED != 0);
        // The original cause is still recorded.
        assert!(m.scs.cfsr[S.bank()] & 1 << 16 != 0);
    }

    #[test]
    fn enabled_usage_fault_is_taken_directly() {
        let mut m = machine();
        let cfg = TargetConfig::generic();
        m.cpu.set_sp_of(S, StackSel::Main, cfg.ram_base_s + 0x1000);
        m.cpu.set_pc(0x700 | 1);
        m.scs.shcsr[S.bank()] |= SHCSR_USGFAULTENA;
        let num =
            m.deliver_fault(FaultInfo::UndefInstruction { encoding: 0xde00 });
        assert_eq!(num, ExceptionNum::USAGE_FAULT);
        assert_eq!(m.cpu.xpsr.ipsr(), 6);
    }

    #[test]
    fn fault_inside_hardfault_locks_up() {
        let mut m = machine();
        let cfg = TargetConfig::generic();
        m.cpu.set_sp_of(S, StackSel::Main, cfg.ram_base_s + 0x1000);
        m.cpu.set_pc(0x700 | 1);
        m.deliver_fault(FaultInfo::InvalidState);
        assert_eq!(m.cpu.xpsr.ipsr(), 3);
        // A second fault while HardFault is active cannot be delivered.
        m.deliver_fault(FaultInfo::InvalidState);
        assert!(m.cpu.locked_up);
        assert_eq!(m.step(), StepOutcome::Lockup);
    }
}
