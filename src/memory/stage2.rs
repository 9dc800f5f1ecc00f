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

//! Guest stage-2 leaf resolution.
//!
//! Every guest-supplied IPA is resolved through the VM's stage-2 tables
//! before it reaches the IOMMU; the guest's claim about what it owns is
//! never taken on faith.

use bit_field::BitField;

use super::addr::{GuestPhysAddr, PhysAddr};
use crate::consts::{PAGE_SHIFT, PAGE_SIZE};
use crate::error::PvResult;

pub type Pte = u64;

const PTE_VALID: u64 = 1 << 0;

/// Stage-2 walker of one guest VM. The implementation wraps the
/// hypervisor page-table code and does its own locking; a leaf read here
/// is a coherent snapshot.
pub trait GuestStage2: Send + Sync {
    /// Returns the leaf entry covering `ipa` and its table level
    /// (0 highest, 3 is the page level with a 4 KiB granule).
    fn get_leaf(&self, ipa: GuestPhysAddr) -> PvResult<(Pte, u32)>;
}

pub fn pte_is_valid(pte: Pte) -> bool {
    pte & PTE_VALID != 0
}

pub fn pte_to_phys(pte: Pte) -> PhysAddr {
    (pte.get_bits(PAGE_SHIFT..48) as usize) << PAGE_SHIFT
}

pub const fn granule_size(level: u32) -> usize {
    1 << (PAGE_SHIFT + 9 * (3 - level as usize))
}

/// Resolve `ipa` to the host-physical page backing it, or `NotFound` if
/// the leaf is missing or invalid (the caller escapes to the host for a
/// top-up in that case).
pub fn resolve(pgt: &dyn GuestStage2, ipa: GuestPhysAddr) -> PvResult<PhysAddr> {
    let (pte, level) = pgt.get_leaf(ipa)?;
    if !pte_is_valid(pte) {
        return pv_result_err!(NotFound);
    }
    let mut paddr = pte_to_phys(pte);
    // Block mappings cover more than one page; pick the page inside.
    paddr |= (ipa & (granule_size(level) - 1)) & !(PAGE_SIZE - 1);
    Ok(paddr)
}
