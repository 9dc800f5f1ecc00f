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

//! Guest-half domain ID allocation and ownership.
//!
//! Host domains draw from the lower half of the ID space and never pass
//! through here; the partition is what keeps a malicious host from
//! loading a guest's domain. Allocation is a rare control-plane event,
//! so one lock over a brute-force bitmap is plenty.

use alloc::collections::BTreeMap;

use bitmap_allocator::{BitAlloc, BitAlloc64K};
use spin::Mutex;

use crate::consts::{GUEST_DOMAIN_BASE, NR_GUEST_DOMAINS, TOTAL_DOMAINS};
use crate::error::PvResult;
use crate::iommu::{DomainType, IommuOps};
use crate::memory::HypPool;
use crate::vm::VmId;

pub struct GuestDomain {
    pub owner: VmId,
    pub ty: DomainType,
}

pub(crate) struct DomainIdAllocator {
    bitmap: BitAlloc64K,
    domains: BTreeMap<u32, GuestDomain>,
}

static DOMAIN_ALLOCATOR: Mutex<DomainIdAllocator> = Mutex::new(DomainIdAllocator::empty());

impl DomainIdAllocator {
    const fn empty() -> Self {
        Self {
            bitmap: BitAlloc64K::DEFAULT,
            domains: BTreeMap::new(),
        }
    }

    fn insert_all(&mut self) {
        self.bitmap.insert(0..NR_GUEST_DOMAINS);
    }

    fn alloc(&mut self) -> Option<u32> {
        self.bitmap.alloc().map(|idx| idx as u32 + GUEST_DOMAIN_BASE)
    }

    fn release(&mut self, domain_id: u32) {
        if !Self::in_guest_half(domain_id) {
            warn!("Free of domain {} outside the guest half", domain_id);
            return;
        }
        let idx = (domain_id - GUEST_DOMAIN_BASE) as usize;
        if self.bitmap.test(idx) {
            warn!("Free of unallocated domain {}", domain_id);
            return;
        }
        self.bitmap.dealloc(idx);
        self.domains.remove(&domain_id);
    }

    fn in_guest_half(domain_id: u32) -> bool {
        (GUEST_DOMAIN_BASE..TOTAL_DOMAINS as u32).contains(&domain_id)
    }

    pub(crate) fn alloc_for(
        &mut self,
        vm: VmId,
        ty: DomainType,
        ops: &dyn IommuOps,
        pool: &HypPool,
    ) -> PvResult<u32> {
        let domain_id = self.alloc().ok_or(pv_err!(Busy, "guest domain IDs exhausted"))?;
        // Allocate and register under the same lock so the ID cannot be
        // observed half-initialized.
        match ops.alloc_domain(pool, domain_id, ty) {
            Ok(()) => {
                self.domains.insert(domain_id, GuestDomain { owner: vm, ty });
                Ok(domain_id)
            }
            Err(e) => {
                self.release(domain_id);
                Err(e)
            }
        }
    }

    pub(crate) fn free_for(&mut self, vm: VmId, domain_id: u32, ops: &dyn IommuOps) -> PvResult {
        self.owned_by(domain_id, vm)?;
        // The driver refuses while mappings or attached devices remain.
        ops.free_domain(domain_id)?;
        self.release(domain_id);
        Ok(())
    }

    pub(crate) fn owned_by(&self, domain_id: u32, vm: VmId) -> PvResult {
        match self.domains.get(&domain_id) {
            None => pv_result_err!(NotFound, format!("domain {} unknown", domain_id)),
            Some(d) if d.owner != vm => pv_result_err!(Denied),
            Some(_) => Ok(()),
        }
    }

    /// Free every domain the dying VM still holds. A domain the driver
    /// refuses to drop keeps its ID bit; releasing it would let the ID
    /// be reissued while translations still reference it.
    pub(crate) fn teardown_for(&mut self, vm: VmId, ops: &dyn IommuOps) {
        let stale: alloc::vec::Vec<u32> = self
            .domains
            .iter()
            .filter(|(_, d)| d.owner == vm)
            .map(|(id, _)| *id)
            .collect();
        for domain_id in stale {
            match ops.free_domain(domain_id) {
                Ok(()) => self.release(domain_id),
                Err(e) => warn!(
                    "Domain {} leaked at teardown of VM {}: {:?}",
                    domain_id, vm, e
                ),
            }
        }
    }
}

pub(crate) fn init() {
    DOMAIN_ALLOCATOR.lock().insert_all();
}

pub fn alloc_for(vm: VmId, ty: DomainType, ops: &dyn IommuOps, pool: &HypPool) -> PvResult<u32> {
    DOMAIN_ALLOCATOR.lock().alloc_for(vm, ty, ops, pool)
}

pub fn free_for(vm: VmId, domain_id: u32, ops: &dyn IommuOps) -> PvResult {
    if !DomainIdAllocator::in_guest_half(domain_id) {
        warn!("VM {} tried to free domain {} outside the guest half", vm, domain_id);
        return pv_result_err!(InvalidParam);
    }
    DOMAIN_ALLOCATOR.lock().free_for(vm, domain_id, ops)
}

pub fn owned_by(domain_id: u32, vm: VmId) -> PvResult {
    DOMAIN_ALLOCATOR.lock().owned_by(domain_id, vm)
}

pub fn teardown(vm: VmId) {
    if let Some(ops) = crate::iommu::ops() {
        DOMAIN_ALLOCATOR.lock().teardown_for(vm, ops);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PvErrorNum;

    struct NopIommu;

    impl IommuOps for NopIommu {
        fn alloc_domain(&self, _pool: &HypPool, _domain_id: u32, _ty: DomainType) -> PvResult {
            Ok(())
        }
        fn free_domain(&self, _domain_id: u32) -> PvResult {
            Ok(())
        }
        fn attach_dev(
            &self,
            _pool: &HypPool,
            _iommu: u32,
            _domain_id: u32,
            _sid: u32,
            _pasid: u32,
            _pasid_bits: u32,
        ) -> PvResult {
            Ok(())
        }
        fn detach_dev(&self, _iommu: u32, _domain_id: u32, _sid: u32, _pasid: u32) -> PvResult {
            Ok(())
        }
        fn map_pages(
            &self,
            _pool: &HypPool,
            _domain_id: u32,
            _iova: crate::memory::Iova,
            _paddr: crate::memory::PhysAddr,
            pgsize: usize,
            pgcount: usize,
            _prot: crate::memory::IommuProt,
        ) -> usize {
            pgsize * pgcount
        }
        fn unmap_pages(
            &self,
            _pool: &HypPool,
            _domain_id: u32,
            _iova: crate::memory::Iova,
            pgsize: usize,
            pgcount: usize,
        ) -> usize {
            pgsize * pgcount
        }
        fn iova_to_phys(
            &self,
            _domain_id: u32,
            _iova: crate::memory::Iova,
        ) -> PvResult<crate::memory::PhysAddr> {
            pv_result_err!(NotFound)
        }
    }

    struct RefusingIommu;

    impl IommuOps for RefusingIommu {
        fn alloc_domain(&self, _pool: &HypPool, _domain_id: u32, _ty: DomainType) -> PvResult {
            pv_result_err!(OutOfMem)
        }
        fn free_domain(&self, _domain_id: u32) -> PvResult {
            pv_result_err!(InvalidParam)
        }
        fn attach_dev(
            &self,
            _pool: &HypPool,
            _iommu: u32,
            _domain_id: u32,
            _sid: u32,
            _pasid: u32,
            _pasid_bits: u32,
        ) -> PvResult {
            Ok(())
        }
        fn detach_dev(&self, _iommu: u32, _domain_id: u32, _sid: u32, _pasid: u32) -> PvResult {
            Ok(())
        }
        fn map_pages(
            &self,
            _pool: &HypPool,
            _domain_id: u32,
            _iova: crate::memory::Iova,
            _paddr: crate::memory::PhysAddr,
            _pgsize: usize,
            _pgcount: usize,
            _prot: crate::memory::IommuProt,
        ) -> usize {
            0
        }
        fn unmap_pages(
            &self,
            _pool: &HypPool,
            _domain_id: u32,
            _iova: crate::memory::Iova,
            _pgsize: usize,
            _pgcount: usize,
        ) -> usize {
            0
        }
        fn iova_to_phys(
            &self,
            _domain_id: u32,
            _iova: crate::memory::Iova,
        ) -> PvResult<crate::memory::PhysAddr> {
            pv_result_err!(NotFound)
        }
    }

    fn fresh() -> DomainIdAllocator {
        let mut a = DomainIdAllocator::empty();
        a.insert_all();
        a
    }

    #[test]
    fn test_alloc_from_guest_half() {
        let mut a = fresh();
        let pool = HypPool::new();
        let d0 = a.alloc_for(1, DomainType::Unmanaged, &NopIommu, &pool).unwrap();
        let d1 = a.alloc_for(1, DomainType::Unmanaged, &NopIommu, &pool).unwrap();
        assert_eq!(d0, GUEST_DOMAIN_BASE);
        assert_eq!(d1, GUEST_DOMAIN_BASE + 1);
    }

    #[test]
    fn test_free_releases_exactly_one_bit() {
        let mut a = fresh();
        let pool = HypPool::new();
        let d0 = a.alloc_for(1, DomainType::Unmanaged, &NopIommu, &pool).unwrap();
        let _d1 = a.alloc_for(1, DomainType::Unmanaged, &NopIommu, &pool).unwrap();
        a.free_for(1, d0, &NopIommu).unwrap();
        // Lowest index first.
        let d2 = a.alloc_for(1, DomainType::Unmanaged, &NopIommu, &pool).unwrap();
        assert_eq!(d2, d0);
    }

    #[test]
    fn test_double_free_fails() {
        let mut a = fresh();
        let pool = HypPool::new();
        let d = a.alloc_for(1, DomainType::Unmanaged, &NopIommu, &pool).unwrap();
        a.free_for(1, d, &NopIommu).unwrap();
        let err = a.free_for(1, d, &NopIommu).unwrap_err();
        assert_eq!(err.num(), PvErrorNum::NotFound);
    }

    #[test]
    fn test_foreign_owner_cannot_free() {
        let mut a = fresh();
        let pool = HypPool::new();
        let d = a.alloc_for(1, DomainType::Unmanaged, &NopIommu, &pool).unwrap();
        let err = a.free_for(2, d, &NopIommu).unwrap_err();
        assert_eq!(err.num(), PvErrorNum::Denied);
        a.owned_by(d, 1).unwrap();
    }

    #[test]
    fn test_driver_oom_releases_id() {
        let mut a = fresh();
        let pool = HypPool::new();
        let err = a
            .alloc_for(1, DomainType::Unmanaged, &RefusingIommu, &pool)
            .unwrap_err();
        assert_eq!(err.num(), PvErrorNum::OutOfMem);
        // The ID went back; the next alloc starts from the base again.
        let d = a.alloc_for(1, DomainType::Unmanaged, &NopIommu, &pool).unwrap();
        assert_eq!(d, GUEST_DOMAIN_BASE);
    }

    #[test]
    fn test_teardown_frees_only_vm_domains() {
        let mut a = fresh();
        let pool = HypPool::new();
        let d1 = a.alloc_for(1, DomainType::Unmanaged, &NopIommu, &pool).unwrap();
        let d2 = a.alloc_for(2, DomainType::Unmanaged, &NopIommu, &pool).unwrap();

        a.teardown_for(1, &NopIommu);
        assert_eq!(a.owned_by(d1, 1).unwrap_err().num(), PvErrorNum::NotFound);
        a.owned_by(d2, 2).unwrap();
    }

    #[test]
    fn test_teardown_keeps_undroppable_domain() {
        let mut a = fresh();
        let pool = HypPool::new();
        let d = a.alloc_for(1, DomainType::Unmanaged, &NopIommu, &pool).unwrap();

        // The driver still holds translations; the ID must not be
        // reissued.
        a.teardown_for(1, &RefusingIommu);
        a.owned_by(d, 1).unwrap();
    }

    #[test]
    fn test_driver_refusing_free_keeps_domain() {
        let mut a = fresh();
        let pool = HypPool::new();
        let d = a.alloc_for(1, DomainType::Unmanaged, &NopIommu, &pool).unwrap();
        let err = a.free_for(1, d, &RefusingIommu).unwrap_err();
        assert_eq!(err.num(), PvErrorNum::InvalidParam);
        a.owned_by(d, 1).unwrap();
    }
}
