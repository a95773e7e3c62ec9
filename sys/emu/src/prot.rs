// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Security attribution (SAU + IDAU) and the banked MPU.
//!
//! Attribution pipeline, applied to every fetch and data access: start
//! from the IDAU's answer (Secure unless the target's table overrides),
//! then refine through the SAU. A matching enabled SAU region marks the
//! address non-secure, or secure-and-NSC when its NSC bit is set;
//! overlapping matches with different answers collapse to Secure. The
//! more-secure of the SAU and IDAU answers wins.
//!
//! The MPU of the resulting security state then checks the access
//! against the current privilege.

use musca_arch::{AccessKind, RegionAttributes, Security};

/// Result of attributing one address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Attribution {
    pub sec: Security,
    /// Secure and non-secure-callable: the only legal NS entry is SG.
    pub nsc: bool,
}

impl Attribution {
    pub const SECURE: Self =
        Attribution { sec: Security::Secure, nsc: false };
    pub const NON_SECURE: Self =
        Attribution { sec: Security::NonSecure, nsc: false };
    pub const NSC: Self = Attribution { sec: Security::Secure, nsc: true };
}

/// Implementation-defined attribution hook supplied by the target.
pub type IdauFn = fn(addr: u32) -> Option<Attribution>;

pub const SAU_REGIONS: usize = 8;

#[derive(Copy, Clone, Debug, Default)]
pub struct SauRegion {
    /// Inclusive 32-byte-aligned bounds, as programmed through RBAR/RLAR.
    pub base: u32,
    pub limit: u32,
    pub enabled: bool,
    pub nsc: bool,
}

impl SauRegion {
    fn matches(&self, addr: u32) -> bool {
        self.enabled && addr >= self.base && addr <= self.limit
    }
}

#[derive(Clone, Debug, Default)]
pub struct Sau {
    pub enabled: bool,
    /// With the SAU disabled, ALLNS flips the default attribution to
    /// non-secure.
    pub allns: bool,
    /// Region number register, the RBAR/RLAR window selector.
    pub rnr: u32,
    pub regions: [SauRegion; SAU_REGIONS],
}

impl Sau {
    /// SAU-only attribution, before IDAU merging.
    fn attribute(&self, addr: u32) -> Attribution {
        if !self.enabled {
            return if self.allns {
                Attribution::NON_SECURE
            } else {
                Attribution::SECURE
            };
        }
        let mut hit: Option<Attribution> = None;
        for r in &self.regions {
            if r.matches(addr) {
                let a = if r.nsc {
                    Attribution::NSC
                } else {
                    Attribution::NON_SECURE
                };
                match hit {
                    None => hit = Some(a),
                    Some(prev) if prev != a => return Attribution::SECURE,
                    Some(_) => {}
                }
            }
        }
        hit.unwrap_or(Attribution::SECURE)
    }
}

/// Full attribution: IDAU default merged with the SAU walk; the
/// more-secure answer wins.
pub fn attribute(sau: &Sau, idau: Option<IdauFn>, addr: u32) -> Attribution {
    let from_sau = sau.attribute(addr);
    let from_idau = idau.and_then(|f| f(addr));
    match from_idau {
        None => from_sau,
        Some(i) => {
            if i.sec.is_secure() || from_sau.sec.is_secure() {
                // Secure wins; NSC survives only if either side grants it
                // and neither demands plain Secure exclusively.
                if i.sec.is_secure() && !i.nsc {
                    Attribution::SECURE
                } else if from_sau.sec.is_secure() && !from_sau.nsc {
                    Attribution::SECURE
                } else {
                    Attribution::NSC
                }
            } else {
                Attribution::NON_SECURE
            }
        }
    }
}

pub const MPU_REGIONS: usize = 16;

#[derive(Copy, Clone, Debug, Default)]
pub struct MpuRegion {
    pub base: u32,
    pub limit: u32,
    pub enabled: bool,
    pub attrs: RegionAttributes,
}

/// One security state's MPU.
#[derive(Clone, Debug, Default)]
pub struct Mpu {
    pub enabled: bool,
    /// PRIVDEFENA: privileged accesses fall back to the default map when
    /// no region matches.
    pub priv_default: bool,
    pub rnr: u32,
    pub regions: [MpuRegion; MPU_REGIONS],
}

impl Mpu {
    /// Checks one access; `Err(())` is a permission violation, reported
    /// by the caller as a MemManage fault.
    pub fn check(
        &self,
        addr: u32,
        access: AccessKind,
        privileged: bool,
    ) -> Result<(), ()> {
        if !self.enabled {
            return Ok(());
        }
        let hit = self
            .regions
            .iter()
            .find(|r| r.enabled && addr >= r.base && addr <= r.limit);
        let attrs = match hit {
            Some(r) => r.attrs,
            None => {
                return if privileged && self.priv_default {
                    Ok(())
                } else {
                    Err(())
                };
            }
        };
        if attrs.contains(RegionAttributes::PRIV_ONLY) && !privileged {
            return Err(());
        }
        let needed = match access {
            AccessKind::Read => RegionAttributes::READ,
            AccessKind::Write => RegionAttributes::WRITE,
            AccessKind::Fetch => {
                RegionAttributes::READ | RegionAttributes::EXECUTE
            }
        };
        if attrs.contains(needed) {
            Ok(())
        } else {
            Err(())
        }
    }
}
