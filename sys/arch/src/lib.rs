// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Armv8-M Mainline architectural definitions, shared between the emulator
//! core and SoC adapters.
//!
//! Everything in this crate is a plain description of the architecture:
//! security states, exception numbers, the program status register, the
//! EXC_RETURN encoding, fault records, and the stacked exception frame.
//! Nothing here touches emulator state; the core (`musca-emu`) interprets
//! these types.

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of external interrupt lines modeled by the interrupt controller.
pub const IRQ_COUNT: usize = 64;

/// One of the two Armv8-M security states.
///
/// Banked processor state is stored in two-element arrays indexed by
/// [`Security::bank`], so flipping the machine between worlds is a single
/// enum write rather than a field-by-field swap.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub enum Security {
    NonSecure,
    Secure,
}

impl Security {
    /// Index of this state's slot in banked-register arrays.
    pub const fn bank(self) -> usize {
        match self {
            Security::NonSecure => 0,
            Security::Secure => 1,
        }
    }

    /// The opposite security state.
    pub const fn other(self) -> Self {
        match self {
            Security::NonSecure => Security::Secure,
            Security::Secure => Security::NonSecure,
        }
    }

    pub const fn is_secure(self) -> bool {
        matches!(self, Security::Secure)
    }
}

/// Which stack pointer a thread-mode context is using.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StackSel {
    Main,
    Process,
}

/// Architectural exception numbers. External interrupt `n` is exception
/// `16 + n`; the low 9 bits of xPSR (IPSR) hold the number of the exception
/// being serviced, or 0 in Thread mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ExceptionNum(pub u16);

impl ExceptionNum {
    pub const RESET: Self = Self(1);
    pub const NMI: Self = Self(2);
    pub const HARD_FAULT: Self = Self(3);
    pub const MEM_MANAGE: Self = Self(4);
    pub const BUS_FAULT: Self = Self(5);
    pub const USAGE_FAULT: Self = Self(6);
    pub const SECURE_FAULT: Self = Self(7);
    pub const SVCALL: Self = Self(11);
    pub const PENDSV: Self = Self(14);
    pub const SYSTICK: Self = Self(15);

    /// First external interrupt.
    pub const EXTERNAL_BASE: u16 = 16;

    /// Exception number of external interrupt line `irq`.
    pub const fn external(irq: u16) -> Self {
        Self(Self::EXTERNAL_BASE + irq)
    }

    /// External interrupt line, if this is an external exception.
    pub const fn irq(self) -> Option<u16> {
        if self.0 >= Self::EXTERNAL_BASE {
            Some(self.0 - Self::EXTERNAL_BASE)
        } else {
            None
        }
    }

    /// Fixed (non-configurable) priority, if this exception has one.
    ///
    /// Numerically lower is more urgent; fixed priorities are negative so
    /// they always win over the configurable 0..=255 range.
    pub const fn fixed_priority(self) -> Option<i16> {
        match self.0 {
            1 => Some(-4), // Reset
            2 => Some(-2), // NMI
            3 => Some(-1), // HardFault
            _ => None,
        }
    }

    /// Word offset of this exception's vector within a vector table.
    pub const fn vector_offset(self) -> u32 {
        self.0 as u32 * 4
    }
}

/// Condition codes used by conditional branches and IT blocks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Cs = 2,
    Cc = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
    Nv = 15,
}

impl Cond {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0xf {
            0 => Cond::Eq,
            1 => Cond::Ne,
            2 => Cond::Cs,
            3 => Cond::Cc,
            4 => Cond::Mi,
            5 => Cond::Pl,
            6 => Cond::Vs,
            7 => Cond::Vc,
            8 => Cond::Hi,
            9 => Cond::Ls,
            10 => Cond::Ge,
            11 => Cond::Lt,
            12 => Cond::Gt,
            13 => Cond::Le,
            14 => Cond::Al,
            _ => Cond::Nv,
        }
    }

    /// Evaluates this condition against the current flags.
    ///
    /// `Nv` ("never") is not a real condition in T32; encodings that would
    /// carry it are repurposed, so it never reaches evaluation. Treat it as
    /// always-true like `Al` if it does.
    pub fn holds(self, xpsr: Xpsr) -> bool {
        let (n, z, c, v) = (xpsr.n(), xpsr.z(), xpsr.c(), xpsr.v());
        match self {
            Cond::Eq => z,
            Cond::Ne => !z,
            Cond::Cs => c,
            Cond::Cc => !c,
            Cond::Mi => n,
            Cond::Pl => !n,
            Cond::Vs => v,
            Cond::Vc => !v,
            Cond::Hi => c && !z,
            Cond::Ls => !c || z,
            Cond::Ge => n == v,
            Cond::Lt => n != v,
            Cond::Gt => !z && n == v,
            Cond::Le => z || n != v,
            Cond::Al | Cond::Nv => true,
        }
    }
}

/// The combined program status register.
///
/// Bit layout (Armv8-M Mainline, no DSP extension bits beyond GE):
/// N=31, Z=30, C=29, V=28, Q=27, GE=19:16, T=24, IPSR=8:0,
/// IT/ICI split across 26:25 and 15:10, stack-alignment pad flag at bit 9.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Xpsr(pub u32);

impl Xpsr {
    pub const N: u32 = 1 << 31;
    pub const Z: u32 = 1 << 30;
    pub const C: u32 = 1 << 29;
    pub const V: u32 = 1 << 28;
    pub const Q: u32 = 1 << 27;
    pub const T: u32 = 1 << 24;
    /// Frame-alignment adjustment flag, recorded during stacking.
    pub const SPREALIGN: u32 = 1 << 9;

    const IPSR_MASK: u32 = 0x1ff;

    pub const fn n(self) -> bool {
        self.0 & Self::N != 0
    }
    pub const fn z(self) -> bool {
        self.0 & Self::Z != 0
    }
    pub const fn c(self) -> bool {
        self.0 & Self::C != 0
    }
    pub const fn v(self) -> bool {
        self.0 & Self::V != 0
    }
    pub const fn q(self) -> bool {
        self.0 & Self::Q != 0
    }
    pub const fn t(self) -> bool {
        self.0 & Self::T != 0
    }

    fn set_bit(&mut self, mask: u32, value: bool) {
        if value {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }

    pub fn set_n(&mut self, v: bool) {
        self.set_bit(Self::N, v)
    }
    pub fn set_z(&mut self, v: bool) {
        self.set_bit(Self::Z, v)
    }
    pub fn set_c(&mut self, v: bool) {
        self.set_bit(Self::C, v)
    }
    pub fn set_v(&mut self, v: bool) {
        self.set_bit(Self::V, v)
    }
    pub fn set_q(&mut self, v: bool) {
        self.set_bit(Self::Q, v)
    }
    pub fn set_t(&mut self, v: bool) {
        self.set_bit(Self::T, v)
    }

    /// Updates N and Z from a result, leaving C and V alone.
    pub fn set_nz(&mut self, result: u32) {
        self.set_n(result & 0x8000_0000 != 0);
        self.set_z(result == 0);
    }

    /// Updates all four arithmetic flags.
    pub fn set_nzcv(&mut self, result: u32, carry: bool, overflow: bool) {
        self.set_nz(result);
        self.set_c(carry);
        self.set_v(overflow);
    }

    pub const fn ge(self) -> u32 {
        (self.0 >> 16) & 0xf
    }

    pub fn set_ge(&mut self, ge: u32) {
        self.0 = (self.0 & !(0xf << 16)) | ((ge & 0xf) << 16);
    }

    /// Current exception number, 0 in Thread mode.
    pub const fn ipsr(self) -> u16 {
        (self.0 & Self::IPSR_MASK) as u16
    }

    pub fn set_ipsr(&mut self, num: u16) {
        self.0 = (self.0 & !Self::IPSR_MASK) | (num as u32 & Self::IPSR_MASK);
    }

    /// Packed IT/ICI state: bits 7:2 live in xPSR 15:10, bits 1:0 in 26:25.
    pub const fn it_state(self) -> u8 {
        (((self.0 >> 25) & 0x3) | ((self.0 >> 8) & 0xfc)) as u8
    }

    pub fn set_it_state(&mut self, it: u8) {
        self.0 &= !((0x3 << 25) | (0x3f << 10));
        self.0 |= ((it as u32) & 0x3) << 25;
        self.0 |= (((it as u32) >> 2) & 0x3f) << 10;
    }

    /// APSR write: replaces N Z C V Q (and optionally GE), preserving the
    /// execution and interrupt state.
    pub fn write_apsr(&mut self, value: u32, with_ge: bool) {
        let mut mask = Self::N | Self::Z | Self::C | Self::V | Self::Q;
        if with_ge {
            mask |= 0xf << 16;
        }
        self.0 = (self.0 & !mask) | (value & mask);
    }
}

/// Decoded form of the magic `0xFFFFFFxx` value that exception handlers
/// load into PC to return.
///
/// Low-byte assignment: bit 6 selects the target security state, bit 3
/// Thread vs Handler, bit 2 PSP vs MSP, bit 4 whether the stacked frame
/// carries no FP state. FP state is not modeled here, so encode leaves the
/// frame bit clear and the return path treats every frame as basic.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExcReturn {
    pub target_sec: Security,
    pub to_thread: bool,
    pub use_psp: bool,
    pub basic_frame: bool,
}

/// Value BXNS/BLXNS leave in LR so a non-secure return re-enters the
/// secure function-return path instead of leaking a secure address.
pub const FNC_RETURN: u32 = 0xFEFF_FFFF;

/// Signature word pushed with the cross-state integrity frame; checked on
/// the matching exception return.
pub const STACK_INTEGRITY_SIG: u32 = 0xFEFA_125B;

impl ExcReturn {
    const PSP: u32 = 1 << 2;
    const THREAD: u32 = 1 << 3;
    const BASIC: u32 = 1 << 4;
    const SECURE: u32 = 1 << 6;

    /// Checks whether a PC target is an exception-return value at all.
    pub const fn is_magic(value: u32) -> bool {
        value & 0xffff_ff00 == 0xffff_ff00
    }

    pub fn decode(value: u32) -> Option<Self> {
        if !Self::is_magic(value) {
            return None;
        }
        Some(ExcReturn {
            target_sec: if value & Self::SECURE != 0 {
                Security::Secure
            } else {
                Security::NonSecure
            },
            to_thread: value & Self::THREAD != 0,
            use_psp: value & Self::PSP != 0,
            basic_frame: value & Self::BASIC != 0,
        })
    }

    pub fn encode(sec: Security, use_psp: bool, to_thread: bool) -> u32 {
        let mut v = 0xffff_ffa1;
        if sec.is_secure() {
            v |= Self::SECURE;
        }
        if use_psp {
            v |= Self::PSP;
        }
        if to_thread {
            v |= Self::THREAD;
        }
        v
    }
}

/// Kind of access that tripped a fault check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessKind {
    Fetch,
    Read,
    Write,
}

/// Cause detail for security-attribution faults.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SecureCause {
    /// Data access violated the attribution rules.
    AttributionViolation,
    /// Branch crossed the security boundary without going through a gate.
    InvalidTransition,
}

/// A record describing a fault raised by the core.
///
/// Variants carry what the banked fault-status registers need; the mapping
/// onto exception numbers and CFSR/SFSR bits lives in the accessors below
/// so the executor and memory system can stay oblivious to register
/// layouts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultInfo {
    /// Unrecognized or architecturally undefined encoding.
    UndefInstruction { encoding: u32 },
    /// Interworking to non-Thumb, malformed IT continuation, or a similar
    /// execution-state violation.
    InvalidState,
    /// Stack pointer crossed its limit register during stacking.
    StackOverflow { address: u32 },
    /// Access to unmapped space, or an MMIO access the region rejected.
    BusError {
        address: Option<u32>,
        access: AccessKind,
    },
    /// Unaligned access where the architecture forbids one.
    Unaligned { address: u32 },
    /// MPU permission violation.
    MemAccess { address: u32, access: AccessKind },
    /// SAU/IDAU attribution violation.
    SecureViolation {
        address: Option<u32>,
        cause: SecureCause,
    },
    /// Non-secure code branched to secure memory without landing on SG.
    InvalidEntry { address: u32 },
    /// Exception-return integrity check failed.
    InvalidReturn,
}

impl FaultInfo {
    /// Exception this fault is delivered as (before any escalation).
    pub fn exception(&self) -> ExceptionNum {
        match self {
            FaultInfo::UndefInstruction { .. } | FaultInfo::InvalidState => {
                ExceptionNum::USAGE_FAULT
            }
            FaultInfo::StackOverflow { .. } => ExceptionNum::USAGE_FAULT,
            FaultInfo::BusError { .. } | FaultInfo::Unaligned { .. } => {
                ExceptionNum::BUS_FAULT
            }
            FaultInfo::MemAccess { .. } => ExceptionNum::MEM_MANAGE,
            FaultInfo::SecureViolation { .. }
            | FaultInfo::InvalidEntry { .. }
            | FaultInfo::InvalidReturn => ExceptionNum::SECURE_FAULT,
        }
    }

    /// Bits this fault contributes to the Configurable Fault Status
    /// Register, positioned as in the architectural CFSR word
    /// (MMFSR byte 0, BFSR byte 1, UFSR upper half).
    pub fn cfsr_bits(&self) -> u32 {
        const IACCVIOL: u32 = 1 << 0;
        const DACCVIOL: u32 = 1 << 1;
        const MMARVALID: u32 = 1 << 7;
        const IBUSERR: u32 = 1 << 8;
        const PRECISERR: u32 = 1 << 9;
        const BFARVALID: u32 = 1 << 15;
        const UNDEFINSTR: u32 = 1 << 16;
        const INVSTATE: u32 = 1 << 17;
        const STKOF: u32 = 1 << 20;
        const UNALIGNED: u32 = 1 << 24;

        match self {
            FaultInfo::UndefInstruction { .. } => UNDEFINSTR,
            FaultInfo::InvalidState => INVSTATE,
            FaultInfo::StackOverflow { .. } => STKOF,
            FaultInfo::BusError { address, access } => {
                let err = if *access == AccessKind::Fetch {
                    IBUSERR
                } else {
                    PRECISERR
                };
                if address.is_some() && *access != AccessKind::Fetch {
                    err | BFARVALID
                } else {
                    err
                }
            }
            FaultInfo::Unaligned { .. } => UNALIGNED | PRECISERR | BFARVALID,
            FaultInfo::MemAccess { access, .. } => {
                if *access == AccessKind::Fetch {
                    IACCVIOL
                } else {
                    DACCVIOL | MMARVALID
                }
            }
            _ => 0,
        }
    }

    /// Bits for the Secure Fault Status Register.
    pub fn sfsr_bits(&self) -> u32 {
        const INVEP: u32 = 1 << 0;
        const INVER: u32 = 1 << 2;
        const AUVIOL: u32 = 1 << 3;
        const INVTRAN: u32 = 1 << 4;
        const SFARVALID: u32 = 1 << 6;

        match self {
            FaultInfo::SecureViolation { address, cause } => {
                let bit = match cause {
                    SecureCause::AttributionViolation => AUVIOL,
                    SecureCause::InvalidTransition => INVTRAN,
                };
                if address.is_some() {
                    bit | SFARVALID
                } else {
                    bit
                }
            }
            FaultInfo::InvalidEntry { .. } => INVEP | SFARVALID,
            FaultInfo::InvalidReturn => INVER,
            _ => 0,
        }
    }

    /// Faulting address for MMFAR/BFAR/SFAR, when one is known.
    pub fn address(&self) -> Option<u32> {
        match self {
            FaultInfo::BusError { address, .. }
            | FaultInfo::SecureViolation { address, .. } => *address,
            FaultInfo::Unaligned { address }
            | FaultInfo::MemAccess { address, .. }
            | FaultInfo::StackOverflow { address }
            | FaultInfo::InvalidEntry { address } => Some(*address),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Access rights conferred by a protection region.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct RegionAttributes: u32 {
        /// Region can be read.
        const READ = 1 << 0;
        /// Region can be written.
        const WRITE = 1 << 1;
        /// Region can contain executable code.
        const EXECUTE = 1 << 2;
        /// Region is reachable from privileged execution only.
        const PRIV_ONLY = 1 << 3;
    }
}

bitflags::bitflags! {
    /// The CONTROL special register, banked per security state.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct Control: u32 {
        /// Thread mode runs unprivileged.
        const NPRIV = 1 << 0;
        /// Thread mode uses the process stack.
        const SPSEL = 1 << 1;
    }
}

/// The 32-byte frame pushed on exception entry and popped on return.
///
/// Field order matches the architectural stacking order from low address
/// to high, so the struct can be moved to and from guest memory as bytes.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct BasicFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub return_addr: u32,
    pub xpsr: u32,
}

impl BasicFrame {
    pub const SIZE: u32 = 32;
}
