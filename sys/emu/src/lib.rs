// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An Armv8-M Mainline instruction-set emulator core with TrustZone-M.
//!
//! The crate executes Thumb-2 firmware for Cortex-M33-class parts
//! faithfully enough to boot RTOS workloads: the full T32 decoder and
//! executor, a banked Secure/Non-secure memory map with MMIO dispatch,
//! SAU/IDAU attribution with banked MPUs, the NVIC with exception
//! entry/return and tail-chaining, and a cooperative run loop with a
//! cycle-driven scheduler.
//!
//! The host builds a [`runloop::Machine`] from a [`target::TargetConfig`],
//! loads a firmware image, and steps it. SoC peripheral models live
//! outside the core behind [`mem::MmioDevice`] and
//! [`target::SocAdapter`]; they raise interrupts from the poll pass
//! through [`nvic::Nvic::set_pending`].

pub mod alu;
pub mod cpu;
pub mod decode;
pub mod err;
pub mod fetch;
pub mod mem;
pub mod nvic;
pub mod prot;
pub mod runloop;
pub mod sched;
pub mod scs;
pub mod target;

mod exc;
mod exec;

pub use err::ConfigError;
pub use runloop::{request_reset, Machine, StepOutcome};
pub use target::{SocAdapter, TargetConfig};

/// Routes `log` output from the code under test through `RUST_LOG`.
/// Safe to call from every test; only the first call installs the
/// logger.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
