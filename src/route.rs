// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-VM vSID routing.
//!
//! The host declares every (viommu, vsid) endpoint a guest will see
//! before the guest launches, then seals the table. After `finalise`
//! the table is immutable, so guest-side lookups take no lock.

use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::consts::{MAX_SIDS_PER_VIOMMU, MAX_VIOMMUS};
use crate::error::PvResult;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouteEntry {
    pub iommu: u32,
    pub sid: u32,
    pub vsid: u32,
}

struct ViommuRoutes {
    viommu: u32,
    entries: Vec<RouteEntry>,
}

pub struct RouteTable {
    builder: Mutex<Vec<ViommuRoutes>>,
    frozen: Once<Vec<ViommuRoutes>>,
}

impl RouteTable {
    pub const fn new() -> Self {
        Self {
            builder: Mutex::new(Vec::new()),
            frozen: Once::new(),
        }
    }

    /// Declare that the guest will see `viommu`.
    pub fn attach(&self, viommu: u32) -> PvResult {
        if self.is_finalised() {
            return pv_result_err!(InvalidParam, "route table already finalised");
        }
        let mut builder = self.builder.lock();
        if builder.iter().any(|v| v.viommu == viommu) {
            return pv_result_err!(Busy, format!("viommu {} already attached", viommu));
        }
        if builder.len() >= MAX_VIOMMUS {
            return pv_result_err!(InvalidParam);
        }
        builder.push(ViommuRoutes {
            viommu,
            entries: Vec::new(),
        });
        Ok(())
    }

    pub fn add_vsid(&self, viommu: u32, iommu: u32, sid: u32, vsid: u32) -> PvResult {
        if self.is_finalised() {
            return pv_result_err!(InvalidParam, "route table already finalised");
        }
        let mut builder = self.builder.lock();
        let routes = builder
            .iter_mut()
            .find(|v| v.viommu == viommu)
            .ok_or(pv_err!(NotFound, format!("viommu {} not attached", viommu)))?;
        if routes.entries.len() >= MAX_SIDS_PER_VIOMMU {
            return pv_result_err!(InvalidParam);
        }
        if routes.entries.iter().any(|e| e.vsid == vsid) {
            return pv_result_err!(InvalidParam, format!("vsid {} already routed", vsid));
        }
        routes.entries.push(RouteEntry { iommu, sid, vsid });
        Ok(())
    }

    /// Seal the table. Idempotent; the second call changes nothing.
    pub fn finalise(&self) {
        self.frozen
            .call_once(|| core::mem::take(&mut *self.builder.lock()));
    }

    pub fn is_finalised(&self) -> bool {
        self.frozen.is_completed()
    }

    /// Guest-side lookup; lock-free once finalised.
    pub fn route(&self, viommu: u32, vsid: u32) -> PvResult<(u32, u32)> {
        let frozen = self.frozen.get().ok_or(pv_err!(NotFound))?;
        frozen
            .iter()
            .find(|v| v.viommu == viommu)
            .and_then(|v| v.entries.iter().find(|e| e.vsid == vsid))
            .map(|e| (e.iommu, e.sid))
            .ok_or(pv_err!(NotFound))
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PvErrorNum;

    #[test]
    fn test_route_after_finalise() {
        let table = RouteTable::new();
        table.attach(0).unwrap();
        table.add_vsid(0, 7, 0x42, 1).unwrap();
        table.finalise();
        assert_eq!(table.route(0, 1).unwrap(), (7, 0x42));
        assert_eq!(table.route(0, 2).unwrap_err().num(), PvErrorNum::NotFound);
        assert_eq!(table.route(9, 1).unwrap_err().num(), PvErrorNum::NotFound);
    }

    #[test]
    fn test_no_route_before_finalise() {
        let table = RouteTable::new();
        table.attach(0).unwrap();
        table.add_vsid(0, 7, 0x42, 1).unwrap();
        assert_eq!(table.route(0, 1).unwrap_err().num(), PvErrorNum::NotFound);
    }

    #[test]
    fn test_finalise_is_idempotent() {
        let table = RouteTable::new();
        table.attach(0).unwrap();
        table.add_vsid(0, 7, 0x42, 1).unwrap();
        table.finalise();
        table.finalise();
        assert_eq!(table.route(0, 1).unwrap(), (7, 0x42));
    }

    #[test]
    fn test_mutation_after_finalise_fails() {
        let table = RouteTable::new();
        table.attach(0).unwrap();
        table.finalise();
        assert_eq!(table.attach(1).unwrap_err().num(), PvErrorNum::InvalidParam);
        assert_eq!(
            table.add_vsid(0, 7, 0x42, 1).unwrap_err().num(),
            PvErrorNum::InvalidParam
        );
    }

    #[test]
    fn test_limits() {
        let table = RouteTable::new();
        for viommu in 0..MAX_VIOMMUS as u32 {
            table.attach(viommu).unwrap();
        }
        assert_eq!(
            table.attach(MAX_VIOMMUS as u32).unwrap_err().num(),
            PvErrorNum::InvalidParam
        );

        for vsid in 0..MAX_SIDS_PER_VIOMMU as u32 {
            table.add_vsid(0, 1, vsid, vsid).unwrap();
        }
        assert_eq!(
            table.add_vsid(0, 1, 99, 99).unwrap_err().num(),
            PvErrorNum::InvalidParam
        );
    }

    #[test]
    fn test_duplicate_attach_is_busy() {
        let table = RouteTable::new();
        table.attach(0).unwrap();
        assert_eq!(table.attach(0).unwrap_err().num(), PvErrorNum::Busy);
    }
}
