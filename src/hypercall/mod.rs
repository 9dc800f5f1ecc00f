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

//! Guest hypercall dispatch.
//!
//! Runs synchronously on the trapping vCPU's core. Every handler that
//! may allocate follows the same two-step contract: on entry, a still
//! unserviced request from a previous run rewinds the PC and exits
//! again; on an allocation failure, a request is parked, the PC is
//! rewound and the exit code tells the host to top up and re-enter.
//! The guest replays the hypercall and never observes the round trip.

#[macro_use]
pub mod error;

use alloc::sync::Arc;

use bitflags::bitflags;
use numeric_enum_macro::numeric_enum;

use crate::consts::{PAGE_SIZE, POOL_TOPUP_PAGES, PVIOMMU_VERSION};
use crate::device;
use crate::domain;
use crate::error::{PvErrorNum, PvResult};
use crate::iommu::{self, DomainType, IommuOps};
use crate::memory::addr::{GuestPhysAddr, PhysAddr};
use crate::memory::{stage2, IommuProt};
use crate::vcpu::{ExitReason, HypReq, VcpuAccess};
use crate::vm::Vm;

pub use self::error::{HyperCallError, HyperCallErrorType, HyperCallResult};

pub const SMCCC_RET_SUCCESS: i64 = 0;
pub const SMCCC_RET_NOT_SUPPORTED: i64 = -1;
pub const SMCCC_RET_NOT_REQUIRED: i64 = -2;
pub const SMCCC_RET_INVALID_PARAMETER: i64 = -3;

pub const FEATURE_PGSZ_BITMAP: u64 = 0x1;

/// Vendor function block reserved for this interface; IDs inside it
/// that decode to nothing are answered, not forwarded.
const VENDOR_FN_FIRST: u32 = 0xC600_0020;
const VENDOR_FN_LAST: u32 = 0xC600_002F;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    /// Wire function IDs; keep in sync with the host driver header.
    pub enum HyperCallCode {
        IommuMap = 0xC600_0020,
        IommuUnmap = 0xC600_0021,
        IommuDetachDev = 0xC600_0022,
        IommuVersion = 0xC600_0023,
        IommuGetFeature = 0xC600_0024,
        IommuAllocDomain = 0xC600_0025,
        IommuFreeDomain = 0xC600_0026,
        IommuDevReqDma = 0xC600_0027,
        IommuAttachDev = 0xC600_0028,
    }
}

impl HyperCallCode {
    /// Calls that can run into the pool and must honor the re-entry
    /// contract.
    fn may_allocate(self) -> bool {
        matches!(
            self,
            HyperCallCode::IommuMap
                | HyperCallCode::IommuUnmap
                | HyperCallCode::IommuAllocDomain
                | HyperCallCode::IommuAttachDev
        )
    }
}

bitflags! {
    /// Protection mask as the guest passes it.
    pub struct WireProt: u64 {
        const READ   = 0x01;
        const WRITE  = 0x02;
        const CACHE  = 0x04;
        const NOEXEC = 0x08;
        const MMIO   = 0x10;
        const PRIV   = 0x20;
    }
}

fn wire_to_prot(prot: u64) -> PvResult<IommuProt> {
    let wire = WireProt::from_bits(prot)
        .ok_or(pv_err!(InvalidParam, format!("bad prot mask {:#x}", prot)))?;
    let mut out = IommuProt::empty();
    if wire.contains(WireProt::READ) {
        out |= IommuProt::READ;
    }
    if wire.contains(WireProt::WRITE) {
        out |= IommuProt::WRITE;
    }
    if wire.contains(WireProt::CACHE) {
        out |= IommuProt::CACHE;
    }
    if wire.contains(WireProt::NOEXEC) {
        out |= IommuProt::NOEXEC;
    }
    if wire.contains(WireProt::MMIO) {
        out |= IommuProt::MMIO;
    }
    if wire.contains(WireProt::PRIV) {
        out |= IommuProt::PRIV;
    }
    Ok(out)
}

/// Nothing from the driver leaks to the guest verbatim.
fn wire_code(num: PvErrorNum) -> i64 {
    match num {
        PvErrorNum::NotFound
        | PvErrorNum::Denied
        | PvErrorNum::Busy
        | PvErrorNum::InvalidParam => SMCCC_RET_INVALID_PARAMETER,
        PvErrorNum::Unsupported => SMCCC_RET_NOT_SUPPORTED,
        // Handlers turn OutOfMem into a host exit before it gets here.
        PvErrorNum::OutOfMem => SMCCC_RET_NOT_SUPPORTED,
    }
}

/// Resolve a guest IPA through its stage-2 tables. A missing leaf parks
/// a backing request, rewinds the PC and reports the host exit.
pub(crate) fn resolve_guest_pa<V: VcpuAccess>(
    vcpu: &mut V,
    ipa: GuestPhysAddr,
    size: u64,
) -> HyperCallResult<PhysAddr> {
    let vm = vcpu.vm();
    match stage2::resolve(vm.stage2(), ipa) {
        Ok(paddr) => Ok(paddr),
        Err(_) => {
            vcpu.req_area()
                .reserve(HypReq::Map { ipa: ipa as u64, size })?;
            vcpu.rewind_hvc();
            Err(hypercall_hyp_req!())
        }
    }
}

/// The pool ran dry inside an IOMMU operation: ask the host for pages
/// and arrange for the guest to replay the call.
fn oom_escape<V: VcpuAccess>(vcpu: &mut V) -> HyperCallError {
    if let Err(e) = vcpu.req_area().reserve(HypReq::Mem {
        nr_pages: POOL_TOPUP_PAGES,
    }) {
        return e.into();
    }
    vcpu.rewind_hvc();
    hypercall_hyp_req!()
}

/// Entry from the exception handler for an HVC in the vendor range.
pub fn handle_hvc<V: VcpuAccess>(vcpu: &mut V) -> ExitReason {
    let fn_id = vcpu.smccc_fn();
    let code = match HyperCallCode::try_from(fn_id) {
        Ok(code) => code,
        Err(_) => {
            if (VENDOR_FN_FIRST..=VENDOR_FN_LAST).contains(&fn_id) {
                warn!("Hypercall not supported: {:#x}", fn_id);
                vcpu.set_retval(SMCCC_RET_NOT_SUPPORTED, 0, 0, 0);
                return ExitReason::Handled;
            }
            return ExitReason::Forward;
        }
    };

    let vm = vcpu.vm();
    // Fill the VM pool eagerly so no IOMMU operation has to take the
    // host donation path while holding hypervisor locks.
    vm.pool().refill_from(vcpu.memcache());

    if code.may_allocate() && vcpu.req_area().has_pending() {
        // The host has not serviced the request a previous run parked;
        // never let the guest see a partial result.
        vcpu.rewind_hvc();
        return ExitReason::HypRequest;
    }

    let ops = match iommu::ops() {
        Some(ops) => ops,
        None => {
            warn!("Hypercall {:?} with no IOMMU driver registered", code);
            vcpu.set_retval(SMCCC_RET_NOT_SUPPORTED, 0, 0, 0);
            return ExitReason::Handled;
        }
    };

    let ret = {
        let mut hc = HyperCall {
            vcpu: &mut *vcpu,
            vm: vm.clone(),
            ops,
        };
        match code {
            HyperCallCode::IommuVersion => hc.version(),
            HyperCallCode::IommuGetFeature => hc.get_feature(),
            HyperCallCode::IommuAllocDomain => hc.alloc_domain(),
            HyperCallCode::IommuFreeDomain => hc.free_domain(),
            HyperCallCode::IommuAttachDev => hc.attach_dev(),
            HyperCallCode::IommuDetachDev => hc.detach_dev(),
            HyperCallCode::IommuMap => hc.map(),
            HyperCallCode::IommuUnmap => hc.unmap(),
            HyperCallCode::IommuDevReqDma => hc.dev_req_dma(),
        }
    };

    debug!("HyperCall: {:?} <= {:x?}", code, ret);

    match ret {
        Ok(vals) => {
            vcpu.set_retval(SMCCC_RET_SUCCESS, vals[0], vals[1], vals[2]);
            ExitReason::Handled
        }
        Err(err) => match err.error() {
            HyperCallErrorType::HypRequest => ExitReason::HypRequest,
            HyperCallErrorType::Pv(num) => {
                warn!("Hypercall: {:?} failed: {:?}", code, err);
                vcpu.set_retval(wire_code(*num), err.partial(), 0, 0);
                ExitReason::Handled
            }
        },
    }
}

type RetVals = [u64; 3];

struct HyperCall<'a, V: VcpuAccess> {
    vcpu: &'a mut V,
    vm: Arc<Vm>,
    ops: &'static dyn IommuOps,
}

impl<'a, V: VcpuAccess> HyperCall<'a, V> {
    fn arg_u32(&self, n: usize) -> HyperCallResult<u32> {
        let val = self.vcpu.smccc_arg(n);
        if val > u32::MAX as u64 {
            return hypercall_pv_err_result!(
                InvalidParam,
                format!("arg{} out of range: {:#x}", n, val)
            );
        }
        Ok(val as u32)
    }

    fn version(&mut self) -> HyperCallResult<RetVals> {
        Ok([PVIOMMU_VERSION, 0, 0])
    }

    fn get_feature(&mut self) -> HyperCallResult<RetVals> {
        let feature = self.vcpu.smccc_arg(2);
        match feature {
            // Only the smallest granule is advertised: IPA contiguity
            // says nothing about PA contiguity, so larger granules
            // cannot be honored for a guest.
            FEATURE_PGSZ_BITMAP => Ok([PAGE_SIZE as u64, 0, 0]),
            _ => hypercall_pv_err_result!(
                InvalidParam,
                format!("unknown feature {:#x}", feature)
            ),
        }
    }

    fn alloc_domain(&mut self) -> HyperCallResult<RetVals> {
        match domain::alloc_for(
            self.vm.id(),
            DomainType::Unmanaged,
            self.ops,
            self.vm.pool(),
        ) {
            Ok(domain_id) => Ok([domain_id as u64, 0, 0]),
            Err(e) if e.num() == PvErrorNum::OutOfMem => Err(oom_escape(self.vcpu)),
            Err(e) => Err(e.into()),
        }
    }

    fn free_domain(&mut self) -> HyperCallResult<RetVals> {
        let domain_id = self.arg_u32(1)?;
        domain::free_for(self.vm.id(), domain_id, self.ops)?;
        Ok([0, 0, 0])
    }

    fn attach_dev(&mut self) -> HyperCallResult<RetVals> {
        let viommu = self.arg_u32(1)?;
        let vsid = self.arg_u32(2)?;
        let pasid = self.arg_u32(3)?;
        let domain_id = self.arg_u32(4)?;
        let pasid_bits = self.arg_u32(5)?;

        let (iommu, sid) = self.vm.routes().route(viommu, vsid)?;
        domain::owned_by(domain_id, self.vm.id())?;

        // Hold the registry so ownership cannot move under the driver.
        let _guard = device::iommu_lock(iommu, sid, Some(self.vm.id()))?;
        match self
            .ops
            .attach_dev(self.vm.pool(), iommu, domain_id, sid, pasid, pasid_bits)
        {
            Ok(()) => Ok([0, 0, 0]),
            Err(e) if e.num() == PvErrorNum::OutOfMem => Err(oom_escape(self.vcpu)),
            Err(_) => hypercall_pv_err_result!(InvalidParam),
        }
    }

    fn detach_dev(&mut self) -> HyperCallResult<RetVals> {
        let viommu = self.arg_u32(1)?;
        let vsid = self.arg_u32(2)?;
        let pasid = self.arg_u32(3)?;
        let domain_id = self.arg_u32(4)?;

        let (iommu, sid) = self.vm.routes().route(viommu, vsid)?;
        domain::owned_by(domain_id, self.vm.id())?;

        let _guard = device::iommu_lock(iommu, sid, Some(self.vm.id()))?;
        // Detach frees, never allocates; no top-up path here.
        match self.ops.detach_dev(iommu, domain_id, sid, pasid) {
            Ok(()) => Ok([0, 0, 0]),
            Err(_) => hypercall_pv_err_result!(InvalidParam),
        }
    }

    fn map(&mut self) -> HyperCallResult<RetVals> {
        let domain_id = self.arg_u32(1)?;
        let mut iova = self.vcpu.smccc_arg(2);
        let mut ipa = self.vcpu.smccc_arg(3);
        let pgsize = self.vcpu.smccc_arg(4);
        let pgcount = self.vcpu.smccc_arg(5);
        let prot = self.vcpu.smccc_arg(6);

        if pgsize != PAGE_SIZE as u64 {
            return hypercall_pv_err_result!(
                InvalidParam,
                format!("unsupported pgsize {:#x}", pgsize)
            );
        }
        let prot = wire_to_prot(prot)?;
        domain::owned_by(domain_id, self.vm.id())?;

        let mut total_mapped: u64 = 0;
        for i in 0..pgcount {
            // Per page: the guest's claim of contiguity is worthless,
            // every IPA goes through its stage-2.
            let paddr = resolve_guest_pa(
                self.vcpu,
                ipa as GuestPhysAddr,
                (pgcount - i) * pgsize,
            )
            .map_err(|e| e.with_partial(total_mapped))?;

            let mapped = self
                .ops
                .map_pages(self.vm.pool(), domain_id, iova, paddr, PAGE_SIZE, 1, prot);
            if mapped == 0 {
                if self.vm.pool().is_empty() {
                    return Err(oom_escape(self.vcpu));
                }
                return Err(
                    HyperCallError::from(pv_err!(InvalidParam, "map_pages refused"))
                        .with_partial(total_mapped),
                );
            }
            total_mapped += mapped as u64;
            ipa += pgsize;
            iova += pgsize;
        }

        Ok([total_mapped, 0, 0])
    }

    fn unmap(&mut self) -> HyperCallResult<RetVals> {
        let domain_id = self.arg_u32(1)?;
        let iova = self.vcpu.smccc_arg(2);
        let pgsize = self.vcpu.smccc_arg(3);
        let pgcount = self.vcpu.smccc_arg(4);

        if pgsize != PAGE_SIZE as u64 {
            return hypercall_pv_err_result!(
                InvalidParam,
                format!("unsupported pgsize {:#x}", pgsize)
            );
        }
        domain::owned_by(domain_id, self.vm.id())?;

        let unmapped = self
            .ops
            .unmap_pages(self.vm.pool(), domain_id, iova, PAGE_SIZE, pgcount as usize)
            as u64;
        if unmapped < pgsize * pgcount {
            // Splitting a block mapping allocates; a dry pool means the
            // shortfall is on us, not the guest.
            if self.vm.pool().is_empty() {
                return Err(oom_escape(self.vcpu));
            }
            return Err(
                HyperCallError::from(pv_err!(InvalidParam, "unmap_pages fell short"))
                    .with_partial(unmapped),
            );
        }
        Ok([unmapped, 0, 0])
    }

    /// Identity check for a protected guest's firmware: hand back the
    /// device token so it can be cross-checked against the platform
    /// attestation channel.
    fn dev_req_dma(&mut self) -> HyperCallResult<RetVals> {
        let viommu = self.arg_u32(1)?;
        let vsid = self.arg_u32(2)?;

        let (iommu, sid) = self.vm.routes().route(viommu, vsid)?;
        let token = device::dma_token(iommu, sid, self.vm.id())?;
        Ok([token[0], token[1], 0])
    }
}
