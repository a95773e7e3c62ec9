// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machine construction and firmware loading errors.
//!
//! Architectural faults are not errors in this sense; they are
//! [`musca_arch::FaultInfo`] records delivered as exceptions. The types
//! here cover the host-facing setup surface only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MMIO region {base:#010x}+{size:#x} overlaps an existing region")]
    MmioOverlap { base: u32, size: u32 },

    #[error("MMIO region {base:#010x}+{size:#x} overlaps a memory bank")]
    MmioOverlapsBank { base: u32, size: u32 },

    #[error("zero-size MMIO region at {base:#010x}")]
    EmptyRegion { base: u32 },

    #[error("memory bank at {base:#010x} has zero size")]
    EmptyBank { base: u32 },

    #[error("firmware image ({image} bytes) does not fit in flash ({flash} bytes)")]
    ImageTooLarge { image: usize, flash: usize },

    #[error("reset vector table is outside flash")]
    BadResetVector,
}
