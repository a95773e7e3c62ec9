// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The executor: one handler per decoded operation.
//!
//! PC has already been advanced past the instruction by the fetch, so
//! ordinary handlers only touch registers and memory; branch handlers
//! overwrite PC. A handler that fails returns the fault without having
//! committed partial state: loads stage into locals before any register
//! writeback, and multi-word stores probe the whole range first. The run
//! loop rewinds PC when a handler faults.
//!
//! Flag discipline: `SetFlags::UnlessItBlock` resolves against the IT
//! state sampled before it advances; logical operations adopt the
//! decoder's modified-immediate carry only when it carries one.

use musca_arch::{
    ExcReturn, ExceptionNum, FaultInfo, Security, StackSel, Xpsr,
    FNC_RETURN,
};

use crate::alu::{
    self, add_with_carry, shift_c_imm, shift_c_reg, ShiftKind, Shifted,
};
use crate::decode::{Decoded, Op, SetFlags};
use crate::fetch::FetchResult;
use crate::runloop::Machine;

pub(crate) fn execute(
    m: &mut Machine,
    f: &FetchResult,
    d: &Decoded,
) -> Result<(), FaultInfo> {
    if d.is_undefined() {
        return Err(FaultInfo::UndefInstruction { encoding: d.raw });
    }

    // IT loads new state and is never itself conditional.
    if d.op == Op::It {
        m.cpu.xpsr.set_it_state(d.imm as u8);
        return Ok(());
    }

    let was_in_it = m.cpu.in_it_block();
    let gate = if was_in_it {
        m.cpu.it_cond()
    } else if d.op == Op::BCond {
        Some(d.cond)
    } else {
        None
    };
    if was_in_it {
        m.cpu.it_advance();
    }
    if let Some(cond) = gate {
        if !cond.holds(m.cpu.xpsr) {
            // Skipped: PC has already moved past it.
            return Ok(());
        }
    }

    let setflags = match d.setflags {
        SetFlags::Yes => true,
        SetFlags::No => false,
        SetFlags::UnlessItBlock => !was_in_it,
    };

    Exec { m, f, d, setflags }.run()
}

struct Exec<'a> {
    m: &'a mut Machine,
    f: &'a FetchResult,
    d: &'a Decoded,
    setflags: bool,
}

impl Exec<'_> {
    fn run(mut self) -> Result<(), FaultInfo> {
        let d = *self.d;
        match d.op {
            Op::Nop | Op::Yield | Op::Dsb | Op::Dmb | Op::Isb => Ok(()),
            Op::Bkpt => {
                log::debug!("bkpt #{}", d.imm);
                Ok(())
            }
            Op::Udf => Err(FaultInfo::UndefInstruction { encoding: d.raw }),
            Op::Svc => {
                let sec = self.m.cpu.sec;
                self.m.take_exception(ExceptionNum::SVCALL, sec);
                Ok(())
            }
            Op::Cps => self.cps(),
            Op::Wfi => {
                self.m.cpu.sleeping = true;
                self.m.sleep_on_event = false;
                Ok(())
            }
            Op::Wfe => {
                let bank = self.m.cpu.sec.bank();
                if self.m.cpu.event[bank] {
                    self.m.cpu.event[bank] = false;
                } else {
                    self.m.cpu.sleeping = true;
                    self.m.sleep_on_event = true;
                }
                Ok(())
            }
            Op::Sev => {
                self.m.cpu.event = [true, true];
                Ok(())
            }

            Op::BCond | Op::B => {
                self.branch(self.f.branch_base().wrapping_add(d.imm));
                Ok(())
            }
            Op::Bl => {
                let lr = self.f.next_pc() | 1;
                self.m.cpu.set_lr(lr);
                self.branch(self.f.branch_base().wrapping_add(d.imm));
                Ok(())
            }
            Op::Bx => {
                let v = self.reg(d.rm);
                self.interwork(v)
            }
            Op::Blx => {
                let v = self.reg(d.rm);
                if v & 1 == 0 {
                    return Err(FaultInfo::InvalidState);
                }
                let lr = self.f.next_pc() | 1;
                self.m.cpu.set_lr(lr);
                self.branch(v & !1);
                Ok(())
            }
            Op::Cbz | Op::Cbnz => {
                let zero = self.reg(d.rn) == 0;
                if zero == (d.op == Op::Cbz) {
                    self.branch(self.f.branch_base().wrapping_add(d.imm));
                }
                Ok(())
            }
            Op::Tbb | Op::Tbh => self.table_branch(),
            Op::Sg => self.sg(),
            Op::Bxns => self.bxns(),
            Op::Blxns => self.blxns(),

            Op::Adr => {
                let v = self.f.pc_operand().wrapping_add(d.imm);
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::Movw => {
                self.m.cpu.set_reg(d.rd, d.imm);
                Ok(())
            }
            Op::Movt => {
                let low = self.reg(d.rd) & 0xffff;
                self.m.cpu.set_reg(d.rd, low | d.imm << 16);
                Ok(())
            }
            Op::MovImm => {
                self.write_logic(d.rd, d.imm, d.imm_carry);
                Ok(())
            }
            Op::MvnImm => {
                self.write_logic(d.rd, !d.imm, d.imm_carry);
                Ok(())
            }
            Op::MovReg => {
                let v = self.reg(d.rm);
                if d.rd == 15 {
                    self.branch(v & !1);
                } else {
                    self.write_logic(d.rd, v, None);
                }
                Ok(())
            }
            Op::MvnReg => {
                let s = self.shifted_rm();
                self.write_logic(d.rd, !s.value, Some(s.carry));
                Ok(())
            }

            Op::AndImm => self.logic_imm(|a, b| a & b),
            Op::OrrImm => self.logic_imm(|a, b| a | b),
            Op::OrnImm => self.logic_imm(|a, b| a | !b),
            Op::EorImm => self.logic_imm(|a, b| a ^ b),
            Op::BicImm => self.logic_imm(|a, b| a & !b),
            Op::AndReg => self.logic_reg(|a, b| a & b),
            Op::OrrReg => self.logic_reg(|a, b| a | b),
            Op::OrnReg => self.logic_reg(|a, b| a | !b),
            Op::EorReg => self.logic_reg(|a, b| a ^ b),
            Op::BicReg => self.logic_reg(|a, b| a & !b),

            Op::TstImm => {
                let r = self.reg(d.rn) & d.imm;
                self.flags_logic(r, d.imm_carry);
                Ok(())
            }
            Op::TeqImm => {
                let r = self.reg(d.rn) ^ d.imm;
                self.flags_logic(r, d.imm_carry);
                Ok(())
            }
            Op::TstReg => {
                let s = self.shifted_rm();
                let r = self.reg(d.rn) & s.value;
                self.flags_logic(r, Some(s.carry));
                Ok(())
            }
            Op::TeqReg => {
                let s = self.shifted_rm();
                let r = self.reg(d.rn) ^ s.value;
                self.flags_logic(r, Some(s.carry));
                Ok(())
            }

            Op::AddImm => self.arith_imm(|rn, imm, _| (rn, imm, false)),
            Op::AdcImm => self.arith_imm(|rn, imm, c| (rn, imm, c)),
            Op::SubImm => self.arith_imm(|rn, imm, _| (rn, !imm, true)),
            Op::SbcImm => self.arith_imm(|rn, imm, c| (rn, !imm, c)),
            Op::RsbImm => self.arith_imm(|rn, imm, _| (!rn, imm, true)),
            Op::AddReg => self.arith_reg(|rn, b, _| (rn, b, false)),
            Op::AdcReg => self.arith_reg(|rn, b, c| (rn, b, c)),
            Op::SubReg => self.arith_reg(|rn, b, _| (rn, !b, true)),
            Op::SbcReg => self.arith_reg(|rn, b, c| (rn, !b, c)),
            Op::RsbReg => self.arith_reg(|rn, b, _| (!rn, b, true)),

            Op::CmpImm => {
                let (r, c, v) =
                    add_with_carry(self.reg(d.rn), !d.imm, true);
                self.m.cpu.xpsr.set_nzcv(r, c, v);
                Ok(())
            }
            Op::CmnImm => {
                let (r, c, v) =
                    add_with_carry(self.reg(d.rn), d.imm, false);
                self.m.cpu.xpsr.set_nzcv(r, c, v);
                Ok(())
            }
            Op::CmpReg => {
                let s = self.shifted_rm();
                let (r, c, v) =
                    add_with_carry(self.reg(d.rn), !s.value, true);
                self.m.cpu.xpsr.set_nzcv(r, c, v);
                Ok(())
            }
            Op::CmnReg => {
                let s = self.shifted_rm();
                let (r, c, v) =
                    add_with_carry(self.reg(d.rn), s.value, false);
                self.m.cpu.xpsr.set_nzcv(r, c, v);
                Ok(())
            }

            Op::AddSpImm => {
                let v = self.m.cpu.sp().wrapping_add(d.imm);
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::SubSpImm => {
                let v = self.m.cpu.sp().wrapping_sub(d.imm);
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }

            Op::LslImm | Op::LsrImm | Op::AsrImm | Op::RorImm => {
                let kind = match d.op {
                    Op::LslImm => ShiftKind::Lsl,
                    Op::LsrImm => ShiftKind::Lsr,
                    Op::AsrImm => ShiftKind::Asr,
                    _ => ShiftKind::Ror,
                };
                let s = shift_c_imm(
                    self.reg(d.rm),
                    kind,
                    d.imm,
                    self.m.cpu.xpsr.c(),
                );
                self.write_logic(d.rd, s.value, Some(s.carry));
                Ok(())
            }
            Op::LslReg | Op::LsrReg | Op::AsrReg | Op::RorReg => {
                let kind = match d.op {
                    Op::LslReg => ShiftKind::Lsl,
                    Op::LsrReg => ShiftKind::Lsr,
                    Op::AsrReg => ShiftKind::Asr,
                    _ => ShiftKind::Ror,
                };
                let s = shift_c_reg(
                    self.reg(d.rn),
                    kind,
                    self.reg(d.rm),
                    self.m.cpu.xpsr.c(),
                );
                self.write_logic(d.rd, s.value, Some(s.carry));
                Ok(())
            }

            Op::Sxtb | Op::Uxtb | Op::Sxth | Op::Uxth => {
                let rotate = d.imm & 0x1f;
                let v = self.reg(d.rm);
                let mut r = match d.op {
                    Op::Sxtb => alu::sxtb(v, rotate),
                    Op::Uxtb => alu::uxtb(v, rotate),
                    Op::Sxth => alu::sxth(v, rotate),
                    _ => alu::uxth(v, rotate),
                };
                if d.imm & 1 << 31 != 0 {
                    r = r.wrapping_add(self.reg(d.rn));
                }
                self.m.cpu.set_reg(d.rd, r);
                Ok(())
            }
            Op::Rev => {
                let v = self.reg(d.rm).swap_bytes();
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::Rev16 => {
                let v = alu::rev16(self.reg(d.rm));
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::Revsh => {
                let v = alu::revsh(self.reg(d.rm));
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::Clz => {
                let v = self.reg(d.rm).leading_zeros();
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::Rbit => {
                let v = self.reg(d.rm).reverse_bits();
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::Ubfx => {
                let v =
                    alu::ubfx(self.reg(d.rn), d.imm & 0xff, (d.imm >> 8) + 1);
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::Sbfx => {
                let v =
                    alu::sbfx(self.reg(d.rn), d.imm & 0xff, (d.imm >> 8) + 1);
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::Bfi => {
                let lsb = d.imm & 0xff;
                let msb = d.imm >> 8;
                let width = msb.wrapping_sub(lsb).wrapping_add(1);
                let v =
                    alu::bfi(self.reg(d.rd), self.reg(d.rn), lsb, width);
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::Bfc => {
                let lsb = d.imm & 0xff;
                let msb = d.imm >> 8;
                let width = msb.wrapping_sub(lsb).wrapping_add(1);
                let v = alu::bfc(self.reg(d.rd), lsb, width);
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }

            Op::Mul => {
                let r = self.reg(d.rn).wrapping_mul(self.reg(d.rm));
                self.m.cpu.set_reg(d.rd, r);
                if self.setflags {
                    self.m.cpu.xpsr.set_nz(r);
                }
                Ok(())
            }
            Op::Mla => {
                let r = self
                    .reg(d.rn)
                    .wrapping_mul(self.reg(d.rm))
                    .wrapping_add(self.reg(d.ra));
                self.m.cpu.set_reg(d.rd, r);
                Ok(())
            }
            Op::Mls => {
                let r = self
                    .reg(d.ra)
                    .wrapping_sub(self.reg(d.rn).wrapping_mul(self.reg(d.rm)));
                self.m.cpu.set_reg(d.rd, r);
                Ok(())
            }
            Op::Smla => self.smla(),
            Op::Umull | Op::Umlal | Op::Umaal | Op::Smull | Op::Smlal => {
                self.long_multiply()
            }
            Op::Udiv => {
                let n = self.reg(d.rn);
                let den = self.reg(d.rm);
                let r = if den == 0 { 0 } else { n / den };
                self.m.cpu.set_reg(d.rd, r);
                Ok(())
            }
            Op::Sdiv => {
                let n = self.reg(d.rn) as i32;
                let den = self.reg(d.rm) as i32;
                let r = if den == 0 { 0 } else { n.wrapping_div(den) };
                self.m.cpu.set_reg(d.rd, r as u32);
                Ok(())
            }

            Op::LdrLit => {
                let addr = self.f.pc_operand().wrapping_add(d.imm);
                let v = self.load(addr, 4, false)?;
                self.write_or_branch(d.rd, v)
            }
            Op::LdrImm => self.load_offset(4, false),
            Op::LdrbImm => self.load_offset(1, false),
            Op::LdrhImm => self.load_offset(2, false),
            Op::LdrsbImm => self.load_offset(1, true),
            Op::LdrshImm => self.load_offset(2, true),
            Op::StrImm => self.store_offset(4),
            Op::StrbImm => self.store_offset(1),
            Op::StrhImm => self.store_offset(2),
            Op::LdrReg => self.load_indexed(4, false),
            Op::LdrbReg => self.load_indexed(1, false),
            Op::LdrhReg => self.load_indexed(2, false),
            Op::LdrsbReg => self.load_indexed(1, true),
            Op::LdrshReg => self.load_indexed(2, true),
            Op::StrReg => self.store_indexed(4),
            Op::StrbReg => self.store_indexed(1),
            Op::StrhReg => self.store_indexed(2),
            Op::LdrPre | Op::LdrbPre => {
                self.load_writeback(d.op == Op::LdrPre, true, false)
            }
            Op::LdrPost | Op::LdrbPost | Op::LdrhPost => {
                let size = match d.op {
                    Op::LdrPost => 4,
                    Op::LdrhPost => 2,
                    _ => 1,
                };
                self.load_writeback_sized(size, false, false)
            }
            Op::StrPre | Op::StrbPre => {
                self.store_writeback(if d.op == Op::StrPre { 4 } else { 1 }, true)
            }
            Op::StrPost | Op::StrbPost | Op::StrhPost => {
                let size = match d.op {
                    Op::StrPost => 4,
                    Op::StrhPost => 2,
                    _ => 1,
                };
                self.store_writeback(size, false)
            }
            Op::Ldrd => self.ldrd(),
            Op::Strd => self.strd(),
            Op::Ldm => self.ldm(),
            Op::Stm => self.stm(),
            Op::Push => self.push(),
            Op::Pop => self.pop(),
            Op::Ldrex => {
                let addr = self.reg(d.rn).wrapping_add(d.imm);
                let v = self.load(addr, 4, false)?;
                self.m.monitor = Some((self.m.cpu.sec, addr));
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::Strex => {
                let addr = self.reg(d.rn);
                let sec = self.m.cpu.sec;
                if self.m.monitor == Some((sec, addr)) {
                    let v = self.reg(d.rm);
                    self.m.mem_write(sec, addr, 4, v)?;
                    self.m.monitor = None;
                    self.m.cpu.set_reg(d.rd, 0);
                } else {
                    self.m.cpu.set_reg(d.rd, 1);
                }
                Ok(())
            }
            Op::Clrex => {
                self.m.monitor = None;
                Ok(())
            }

            Op::Mrs => {
                let v = self
                    .m
                    .cpu
                    .read_sysreg(d.imm & 0xff)
                    .ok_or(FaultInfo::UndefInstruction { encoding: d.raw })?;
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }
            Op::Msr => self.msr(),
            Op::Tt | Op::Ttt | Op::Tta | Op::Ttat => {
                let addr = self.reg(d.rn);
                let attr = self.m.attribution(addr);
                let mut v = 0;
                if attr.sec.is_secure() {
                    v |= 1 << 23;
                }
                if attr.nsc {
                    v |= 1 << 22;
                }
                self.m.cpu.set_reg(d.rd, v);
                Ok(())
            }

            Op::It | Op::Undefined => unreachable!("handled by caller"),
        }
    }

    // --- operand helpers ----------------------------------------------

    fn reg(&self, r: u8) -> u32 {
        if r == 15 {
            self.f.pc.wrapping_add(4)
        } else {
            self.m.cpu.reg(r)
        }
    }

    /// Shifted second operand: `type << 5 | imm5` packed by the decoder.
    fn shifted_rm(&self) -> Shifted {
        shift_c_imm(
            self.reg(self.d.rm),
            ShiftKind::from_bits(self.d.imm >> 5),
            self.d.imm & 0x1f,
            self.m.cpu.xpsr.c(),
        )
    }

    fn flags_logic(&mut self, result: u32, carry: Option<bool>) {
        self.m.cpu.xpsr.set_nz(result);
        if let Some(c) = carry {
            self.m.cpu.xpsr.set_c(c);
        }
    }

    fn write_logic(&mut self, rd: u8, result: u32, carry: Option<bool>) {
        self.m.cpu.set_reg(rd, result);
        if self.setflags {
            self.flags_logic(result, carry);
        }
    }

    fn logic_imm(
        &mut self,
        op: impl Fn(u32, u32) -> u32,
    ) -> Result<(), FaultInfo> {
        let r = op(self.reg(self.d.rn), self.d.imm);
        self.write_logic(self.d.rd, r, self.d.imm_carry);
        Ok(())
    }

    fn logic_reg(
        &mut self,
        op: impl Fn(u32, u32) -> u32,
    ) -> Result<(), FaultInfo> {
        let s = self.shifted_rm();
        let r = op(self.reg(self.d.rn), s.value);
        self.write_logic(self.d.rd, r, Some(s.carry));
        Ok(())
    }

    /// Shared add-with-carry core; `shape` turns (Rn, operand, C) into
    /// the actual addends.
    fn arith_imm(
        &mut self,
        shape: impl Fn(u32, u32, bool) -> (u32, u32, bool),
    ) -> Result<(), FaultInfo> {
        let (a, b, cin) =
            shape(self.reg(self.d.rn), self.d.imm, self.m.cpu.xpsr.c());
        self.arith_commit(a, b, cin)
    }

    fn arith_reg(
        &mut self,
        shape: impl Fn(u32, u32, bool) -> (u32, u32, bool),
    ) -> Result<(), FaultInfo> {
        let s = self.shifted_rm();
        let (a, b, cin) =
            shape(self.reg(self.d.rn), s.value, self.m.cpu.xpsr.c());
        self.arith_commit(a, b, cin)
    }

    fn arith_commit(
        &mut self,
        a: u32,
        b: u32,
        cin: bool,
    ) -> Result<(), FaultInfo> {
        let (r, c, v) = add_with_carry(a, b, cin);
        if self.d.rd == 15 {
            // ADD PC, ... : a plain branch, never flag-setting.
            self.branch(r & !1);
            return Ok(());
        }
        self.m.cpu.set_reg(self.d.rd, r);
        if self.setflags {
            self.m.cpu.xpsr.set_nzcv(r, c, v);
        }
        Ok(())
    }

    fn smla(&mut self) -> Result<(), FaultInfo> {
        let d = self.d;
        let take = |v: u32, top: bool| {
            if top {
                (v >> 16) as i16 as i32
            } else {
                v as i16 as i32
            }
        };
        let op1 = take(self.reg(d.rn), d.imm & 2 != 0);
        let op2 = take(self.reg(d.rm), d.imm & 1 != 0);
        let prod = op1.wrapping_mul(op2);
        let (r, overflow) = prod.overflowing_add(self.reg(d.ra) as i32);
        self.m.cpu.set_reg(d.rd, r as u32);
        if overflow {
            self.m.cpu.xpsr.set_q(true);
        }
        Ok(())
    }

    fn long_multiply(&mut self) -> Result<(), FaultInfo> {
        let d = self.d;
        let rn = self.reg(d.rn);
        let rm = self.reg(d.rm);
        let lo = self.reg(d.rd);
        let hi = self.reg(d.ra);
        let result: u64 = match d.op {
            Op::Umull => rn as u64 * rm as u64,
            Op::Umlal => {
                (rn as u64 * rm as u64)
                    .wrapping_add((hi as u64) << 32 | lo as u64)
            }
            Op::Umaal => {
                (rn as u64 * rm as u64)
                    .wrapping_add(lo as u64)
                    .wrapping_add(hi as u64)
            }
            Op::Smull => {
                (rn as i32 as i64).wrapping_mul(rm as i32 as i64) as u64
            }
            _ => {
                // SMLAL
                let acc = ((hi as u64) << 32 | lo as u64) as i64;
                (rn as i32 as i64)
                    .wrapping_mul(rm as i32 as i64)
                    .wrapping_add(acc) as u64
            }
        };
        self.m.cpu.set_reg(d.rd, result as u32);
        self.m.cpu.set_reg(d.ra, (result >> 32) as u32);
        Ok(())
    }

    // --- control flow -------------------------------------------------

    fn branch(&mut self, addr: u32) {
        self.m.cpu.it_clear();
        self.m.cpu.set_pc(addr | 1);
    }

    /// BX-style PC write: exception return, secure function return, or
    /// an interworking branch whose bit 0 must be set.
    fn interwork(&mut self, value: u32) -> Result<(), FaultInfo> {
        if ExcReturn::is_magic(value) && self.m.cpu.handler_mode() {
            return self.m.exc_return(value);
        }
        if value == FNC_RETURN {
            return self.fnc_return();
        }
        if value & 1 == 0 {
            return Err(FaultInfo::InvalidState);
        }
        self.branch(value & !1);
        Ok(())
    }

    fn table_branch(&mut self) -> Result<(), FaultInfo> {
        let d = self.d;
        let base = self.reg(d.rn);
        let index = self.reg(d.rm);
        let offset = if d.op == Op::Tbh {
            self.load(base.wrapping_add(index << 1), 2, false)?
        } else {
            self.load(base.wrapping_add(index), 1, false)?
        };
        self.branch(self.f.branch_base().wrapping_add(offset << 1));
        Ok(())
    }

    fn sg(&mut self) -> Result<(), FaultInfo> {
        if !self.m.cpu.sec.is_secure() {
            let attr = self.m.attribution(self.f.pc);
            if attr.sec.is_secure() && attr.nsc {
                log::debug!("sg: entering secure state at {:#010x}", self.f.pc);
                self.m.cpu.sec = Security::Secure;
            }
        }
        Ok(())
    }

    fn bxns(&mut self) -> Result<(), FaultInfo> {
        if !self.m.cpu.sec.is_secure() {
            return Err(FaultInfo::InvalidState);
        }
        let v = self.reg(self.d.rm);
        let attr = self.m.attribution(v & !1);
        if v & 1 != 0 || attr.sec.is_secure() {
            return Err(FaultInfo::InvalidState);
        }
        log::debug!("bxns: leaving secure state for {:#010x}", v & !1);
        // The non-secure callee gets no secure return address.
        self.m.cpu.set_lr(FNC_RETURN);
        self.m.cpu.sec = Security::NonSecure;
        self.branch(v & !1);
        Ok(())
    }

    fn blxns(&mut self) -> Result<(), FaultInfo> {
        if !self.m.cpu.sec.is_secure() {
            return Err(FaultInfo::InvalidState);
        }
        let v = self.reg(self.d.rm);
        let attr = self.m.attribution(v & !1);
        if v & 1 != 0 || attr.sec.is_secure() {
            return Err(FaultInfo::InvalidState);
        }
        // Secure function-call frame: return address and the caller's
        // xPSR with IPSR cleared.
        let sel = self.m.cpu.stack_sel();
        let sp = self.m.cpu.sp_of(Security::Secure, sel) - 8;
        let ret = self.f.next_pc() | 1;
        let saved_xpsr = self.m.cpu.xpsr.0 & !0x1ff;
        self.m.mem_write(Security::Secure, sp, 4, ret)?;
        self.m.mem_write(Security::Secure, sp + 4, 4, saved_xpsr)?;
        self.m.cpu.set_sp_of(Security::Secure, sel, sp);
        self.m.cpu.set_lr(FNC_RETURN);
        log::debug!("blxns: calling {:#010x}", v & !1);
        self.m.cpu.sec = Security::NonSecure;
        self.branch(v & !1);
        Ok(())
    }

    /// The non-secure side branched to `FNC_RETURN`: pop the secure
    /// function-call frame and resume the secure caller.
    fn fnc_return(&mut self) -> Result<(), FaultInfo> {
        if self.m.cpu.sec.is_secure() {
            return Err(FaultInfo::InvalidState);
        }
        let bank = Security::Secure.bank();
        let sel = if self.m.cpu.handler_mode() {
            StackSel::Main
        } else if self.m.cpu.control[bank]
            .contains(musca_arch::Control::SPSEL)
        {
            StackSel::Process
        } else {
            StackSel::Main
        };
        let sp = self.m.cpu.sp_of(Security::Secure, sel);
        let ret = self.m.mem_read(Security::Secure, sp, 4)?;
        let saved_xpsr = self.m.mem_read(Security::Secure, sp + 4, 4)?;
        self.m.cpu.set_sp_of(Security::Secure, sel, sp + 8);
        self.m.cpu.sec = Security::Secure;
        self.m.cpu.xpsr = Xpsr(saved_xpsr | Xpsr::T);
        log::debug!("secure function return to {:#010x}", ret & !1);
        self.branch(ret & !1);
        Ok(())
    }

    // --- loads and stores ---------------------------------------------

    fn load(
        &mut self,
        addr: u32,
        size: u32,
        signed: bool,
    ) -> Result<u32, FaultInfo> {
        let sec = self.m.cpu.sec;
        let v = self.m.mem_read(sec, addr, size)?;
        Ok(if signed {
            match size {
                1 => v as u8 as i8 as i32 as u32,
                _ => v as u16 as i16 as i32 as u32,
            }
        } else {
            v
        })
    }

    fn store(&mut self, addr: u32, size: u32, value: u32) -> Result<(), FaultInfo> {
        let sec = self.m.cpu.sec;
        self.m.mem_write(sec, addr, size, value)
    }

    /// Writes a load result; a PC destination is an interworking branch.
    fn write_or_branch(&mut self, rd: u8, value: u32) -> Result<(), FaultInfo> {
        if rd == 15 {
            self.interwork(value)
        } else {
            self.m.cpu.set_reg(rd, value);
            Ok(())
        }
    }

    fn load_offset(
        &mut self,
        size: u32,
        signed: bool,
    ) -> Result<(), FaultInfo> {
        let d = self.d;
        let addr = self.reg(d.rn).wrapping_add(d.imm);
        let v = self.load(addr, size, signed)?;
        self.write_or_branch(d.rd, v)
    }

    fn store_offset(&mut self, size: u32) -> Result<(), FaultInfo> {
        let d = self.d;
        let addr = self.reg(d.rn).wrapping_add(d.imm);
        let v = self.reg(d.rd);
        self.store(addr, size, v)
    }

    fn load_indexed(
        &mut self,
        size: u32,
        signed: bool,
    ) -> Result<(), FaultInfo> {
        let d = self.d;
        let addr =
            self.reg(d.rn).wrapping_add(self.reg(d.rm) << (d.imm & 3));
        let v = self.load(addr, size, signed)?;
        self.write_or_branch(d.rd, v)
    }

    fn store_indexed(&mut self, size: u32) -> Result<(), FaultInfo> {
        let d = self.d;
        let addr =
            self.reg(d.rn).wrapping_add(self.reg(d.rm) << (d.imm & 3));
        let v = self.reg(d.rd);
        self.store(addr, size, v)
    }

    fn load_writeback(
        &mut self,
        word: bool,
        pre: bool,
        signed: bool,
    ) -> Result<(), FaultInfo> {
        self.load_writeback_sized(if word { 4 } else { 1 }, pre, signed)
    }

    fn load_writeback_sized(
        &mut self,
        size: u32,
        pre: bool,
        signed: bool,
    ) -> Result<(), FaultInfo> {
        let d = self.d;
        let base = self.reg(d.rn);
        let offset_addr = base.wrapping_add(d.imm);
        let addr = if pre { offset_addr } else { base };
        let v = self.load(addr, size, signed)?;
        // Loaded value beats the writeback when Rt == Rn.
        self.m.cpu.set_reg(d.rn, offset_addr);
        self.write_or_branch(d.rd, v)
    }

    fn store_writeback(
        &mut self,
        size: u32,
        pre: bool,
    ) -> Result<(), FaultInfo> {
        let d = self.d;
        let base = self.reg(d.rn);
        let offset_addr = base.wrapping_add(d.imm);
        let addr = if pre { offset_addr } else { base };
        let v = self.reg(d.rd);
        self.store(addr, size, v)?;
        self.m.cpu.set_reg(d.rn, offset_addr);
        Ok(())
    }

    fn ldrd(&mut self) -> Result<(), FaultInfo> {
        let d = self.d;
        let (addr, offset_addr, writeback) = self.ldrd_address();
        let lo = self.load(addr, 4, false)?;
        let hi = self.load(addr.wrapping_add(4), 4, false)?;
        self.m.cpu.set_reg(d.rd, lo);
        self.m.cpu.set_reg(d.rm, hi);
        if writeback {
            self.m.cpu.set_reg(d.rn, offset_addr);
        }
        Ok(())
    }

    fn strd(&mut self) -> Result<(), FaultInfo> {
        let d = self.d;
        let (addr, offset_addr, writeback) = self.ldrd_address();
        let sec = self.m.cpu.sec;
        self.m.mem_check_write(sec, addr, 4)?;
        self.m.mem_check_write(sec, addr.wrapping_add(4), 4)?;
        let lo = self.reg(d.rd);
        let hi = self.reg(d.rm);
        self.store(addr, 4, lo)?;
        self.store(addr.wrapping_add(4), 4, hi)?;
        if writeback {
            self.m.cpu.set_reg(d.rn, offset_addr);
        }
        Ok(())
    }

    /// Applies the P/U/W fields packed into the LDRD/STRD immediate.
    fn ldrd_address(&self) -> (u32, u32, bool) {
        let d = self.d;
        let offset = d.imm & 0x3fc;
        let up = d.imm & 1 << 31 != 0;
        let writeback = d.imm & 1 << 30 != 0;
        let pre = d.imm & 1 << 29 != 0;
        let base = self.reg(d.rn);
        let offset_addr = if up {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        };
        let addr = if pre { offset_addr } else { base };
        (addr, offset_addr, writeback)
    }

    fn ldm(&mut self) -> Result<(), FaultInfo> {
        let d = self.d;
        let list = d.imm & 0xffff;
        let writeback = d.imm & 1 << 16 != 0;
        let decrement = d.imm >> 24 & 3 == 2;
        let count = list.count_ones();
        let base = self.reg(d.rn);
        let start = if decrement {
            base.wrapping_sub(4 * count)
        } else {
            base
        };
        let final_base = if decrement {
            start
        } else {
            base.wrapping_add(4 * count)
        };

        // Stage every word before committing any register.
        let mut values = [0u32; 16];
        let mut addr = start;
        for r in 0..16 {
            if list & 1 << r != 0 {
                values[r] = self.load(addr, 4, false)?;
                addr = addr.wrapping_add(4);
            }
        }
        for r in 0..15 {
            if list & 1 << r != 0 {
                self.m.cpu.set_reg(r as u8, values[r]);
            }
        }
        if writeback && list & 1 << d.rn == 0 {
            self.m.cpu.set_reg(d.rn, final_base);
        }
        if list & 1 << 15 != 0 {
            return self.write_or_branch(15, values[15]);
        }
        Ok(())
    }

    fn stm(&mut self) -> Result<(), FaultInfo> {
        let d = self.d;
        let list = d.imm & 0xffff;
        let writeback = d.imm & 1 << 16 != 0;
        let decrement = d.imm >> 24 & 3 == 2;
        let count = list.count_ones();
        let base = self.reg(d.rn);
        let start = if decrement {
            base.wrapping_sub(4 * count)
        } else {
            base
        };
        let final_base = if decrement {
            start
        } else {
            base.wrapping_add(4 * count)
        };

        let sec = self.m.cpu.sec;
        for i in 0..count {
            self.m.mem_check_write(sec, start.wrapping_add(4 * i), 4)?;
        }
        let mut addr = start;
        for r in 0..16u8 {
            if list & 1 << r != 0 {
                let v = self.reg(r);
                self.store(addr, 4, v)?;
                addr = addr.wrapping_add(4);
            }
        }
        if writeback {
            self.m.cpu.set_reg(d.rn, final_base);
        }
        Ok(())
    }

    fn push(&mut self) -> Result<(), FaultInfo> {
        let list = self.d.imm & 0xffff;
        let count = list.count_ones();
        let sp = self.m.cpu.sp();
        let start = sp.wrapping_sub(4 * count);
        let sec = self.m.cpu.sec;
        let limit = self
            .m
            .cpu
            .sp_limit_of(sec, self.m.cpu.stack_sel());
        if start < limit {
            return Err(FaultInfo::StackOverflow { address: start });
        }
        for i in 0..count {
            self.m.mem_check_write(sec, start.wrapping_add(4 * i), 4)?;
        }
        let mut addr = start;
        for r in 0..16u8 {
            if list & 1 << r != 0 {
                let v = self.reg(r);
                self.store(addr, 4, v)?;
                addr = addr.wrapping_add(4);
            }
        }
        self.m.cpu.set_sp(start);
        Ok(())
    }

    fn pop(&mut self) -> Result<(), FaultInfo> {
        let list = self.d.imm & 0xffff;
        let count = list.count_ones();
        let sp = self.m.cpu.sp();

        let mut values = [0u32; 16];
        let mut addr = sp;
        for r in 0..16 {
            if list & 1 << r != 0 {
                values[r] = self.load(addr, 4, false)?;
                addr = addr.wrapping_add(4);
            }
        }
        for r in 0..15 {
            if list & 1 << r != 0 {
                self.m.cpu.set_reg(r as u8, values[r]);
            }
        }
        self.m.cpu.set_sp(sp.wrapping_add(4 * count));
        if list & 1 << 15 != 0 {
            return self.write_or_branch(15, values[15]);
        }
        Ok(())
    }

    // --- system -------------------------------------------------------

    fn cps(&mut self) -> Result<(), FaultInfo> {
        if !self.m.cpu.privileged() {
            return Ok(());
        }
        let disable = self.d.imm & 0x10 != 0;
        let bank = self.m.cpu.sec.bank();
        if self.d.imm & 0x2 != 0 {
            self.m.cpu.primask[bank] = disable;
        }
        if self.d.imm & 0x1 != 0 {
            self.m.cpu.faultmask[bank] = disable;
        }
        Ok(())
    }

    fn msr(&mut self) -> Result<(), FaultInfo> {
        let d = self.d;
        let sysm = d.imm & 0xff;
        let mask = d.imm >> 8 & 0xf;
        let value = self.reg(d.rm);
        if sysm < 4 {
            // APSR write: mask bit 3 selects NZCVQ, bit 2 the GE field.
            if mask & 0x8 != 0 {
                self.m.cpu.xpsr.write_apsr(value, false);
            }
            if mask & 0x4 != 0 {
                let ge = value >> 16 & 0xf;
                self.m.cpu.xpsr.set_ge(ge);
            }
            return Ok(());
        }
        self.m
            .cpu
            .write_sysreg(sysm, value)
            .ok_or(FaultInfo::UndefInstruction { encoding: d.raw })
    }
}
