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

use alloc::vec::Vec;

use spin::Once;

use crate::error::PvResult;
use crate::memory::{HypPool, IommuProt, Iova, PhysAddr};

/// One physical IOMMU discovered at boot; immutable thereafter.
#[derive(Clone, Copy, Debug)]
pub struct IommuInfo {
    pub iommu_id: u32,
    pub pgsize_bitmap: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DomainType {
    Unmanaged,
    Dma,
}

/// Capability set of the physical IOMMU driver.
///
/// Calls that may allocate draw translation-table pages from the given
/// pool and report `OutOfMem` (or zero mapped bytes) when it runs dry;
/// the dispatcher turns that into a host top-up round trip and replays
/// the hypercall. Because a replayed `map_pages` revisits pages it
/// already installed, re-installing an identical mapping must succeed
/// and count as mapped.
pub trait IommuOps: Sync {
    fn alloc_domain(&self, pool: &HypPool, domain_id: u32, ty: DomainType) -> PvResult;

    /// Fails while the domain still has mappings or attached devices.
    fn free_domain(&self, domain_id: u32) -> PvResult;

    fn attach_dev(
        &self,
        pool: &HypPool,
        iommu: u32,
        domain_id: u32,
        sid: u32,
        pasid: u32,
        pasid_bits: u32,
    ) -> PvResult;

    fn detach_dev(&self, iommu: u32, domain_id: u32, sid: u32, pasid: u32) -> PvResult;

    /// Returns the number of bytes mapped; 0 may mean the pool ran dry.
    fn map_pages(
        &self,
        pool: &HypPool,
        domain_id: u32,
        iova: Iova,
        paddr: PhysAddr,
        pgsize: usize,
        pgcount: usize,
        prot: IommuProt,
    ) -> usize;

    /// Returns the number of bytes unmapped.
    fn unmap_pages(&self, pool: &HypPool, domain_id: u32, iova: Iova, pgsize: usize, pgcount: usize)
        -> usize;

    fn iova_to_phys(&self, domain_id: u32, iova: Iova) -> PvResult<PhysAddr>;
}

static IOMMU_OPS: Once<&'static dyn IommuOps> = Once::new();
static IOMMU_LIST: Once<Vec<IommuInfo>> = Once::new();

/// Install the driver. Exactly one driver registers, at init, before the
/// first hypercall can arrive.
pub fn register_driver(ops: &'static dyn IommuOps) -> PvResult {
    let mut installed = false;
    IOMMU_OPS.call_once(|| {
        installed = true;
        ops
    });
    if installed {
        Ok(())
    } else {
        pv_result_err!(Busy, "IOMMU driver already registered")
    }
}

pub fn ops() -> Option<&'static dyn IommuOps> {
    IOMMU_OPS.get().copied()
}

pub fn init(iommus: Vec<IommuInfo>) -> PvResult {
    let mut installed = false;
    IOMMU_LIST.call_once(|| {
        installed = true;
        info!("Init IOMMU...");
        for info in &iommus {
            info!("Setup IOMMU: {:#x?}", info);
        }
        crate::domain::init();
        iommus
    });
    if installed {
        Ok(())
    } else {
        pv_result_err!(Busy, "IOMMU list already initialized")
    }
}

pub fn find(iommu_id: u32) -> Option<&'static IommuInfo> {
    IOMMU_LIST
        .get()
        .and_then(|list| list.iter().find(|info| info.iommu_id == iommu_id))
}
