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

//! Passthrough device ownership.
//!
//! One spinlock covers the whole registry. Ownership only changes at
//! assignment and teardown, so there is no congestion to speak of, and
//! every MMIO or IOMMU check must be atomic with the owner field anyway.
//!
//! A device headed for a guest transitions host -> hypervisor -> guest,
//! so there is a moment where neither the host nor the guest can touch
//! it and the hypervisor can reset it. Assignment is atomic over the
//! whole IOMMU group; isolation is only as strong as the weakest group
//! member.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard, Once};

use crate::consts::PAGE_SIZE;
use crate::error::PvResult;
use crate::hypercall::{self, HyperCallErrorType, SMCCC_RET_INVALID_PARAMETER, SMCCC_RET_SUCCESS};
use crate::memory::addr::{pfn_to_phys, GuestPhysAddr, PhysAddr};
use crate::vcpu::{ExitReason, VcpuAccess};
use crate::vm::{Vm, VmId};

pub type ResetHandler = fn(&Device) -> PvResult;

#[derive(Clone, Copy, Debug)]
pub struct DevResource {
    pub base: PhysAddr,
    pub size: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DevEndpoint {
    pub iommu: u32,
    pub sid: u32,
}

/// Registration input, built from the device tree at boot.
pub struct DeviceInfo {
    pub group_id: u32,
    pub resources: Vec<DevResource>,
    pub endpoints: Vec<DevEndpoint>,
    pub dma_token: [u64; 2],
    pub reset_handler: Option<ResetHandler>,
}

pub struct Device {
    group_id: u32,
    resources: Vec<DevResource>,
    endpoints: Vec<DevEndpoint>,
    dma_token: [u64; 2],
    reset_handler: Option<ResetHandler>,
    owner: Option<VmId>,
}

impl Device {
    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn resources(&self) -> &[DevResource] {
        &self.resources
    }

    pub fn owner(&self) -> Option<VmId> {
        self.owner
    }
}

/// Page ownership transitions, provided by the stage-2 machinery of the
/// embedding hypervisor.
pub trait MemTransition: Sync {
    /// Host page becomes hypervisor-owned; `device_attrs` maps it with
    /// device memory attributes.
    fn host_donate_hyp(&self, pfn: u64, nr_pages: usize, device_attrs: bool) -> PvResult;
    fn hyp_donate_host(&self, pfn: u64, nr_pages: usize) -> PvResult;
    fn donate_to_guest(&self, vm: VmId, pfn: u64, gfn: u64, nr_pages: usize) -> PvResult;
    fn check_range_hyp_owned(&self, base: PhysAddr, size: usize) -> PvResult;
    fn reclaim_to_host(&self, base: PhysAddr, size: usize);
}

static MEM_TRANSITION: Once<&'static dyn MemTransition> = Once::new();

pub fn init(mt: &'static dyn MemTransition) -> PvResult {
    let mut installed = false;
    MEM_TRANSITION.call_once(|| {
        installed = true;
        mt
    });
    if installed {
        Ok(())
    } else {
        pv_result_err!(Busy, "memory transition hooks already registered")
    }
}

fn mem() -> PvResult<&'static dyn MemTransition> {
    MEM_TRANSITION
        .get()
        .copied()
        .ok_or(pv_err!(Unsupported, "memory transition hooks not registered"))
}

pub(crate) struct DeviceRegistry {
    devices: Vec<Device>,
}

static REGISTRY: Mutex<DeviceRegistry> = Mutex::new(DeviceRegistry::empty());

impl DeviceRegistry {
    const fn empty() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    fn register(&mut self, info: DeviceInfo) {
        info!(
            "Register device: group {} resources {:#x?} endpoints {:?}",
            info.group_id, info.resources, info.endpoints
        );
        self.devices.push(Device {
            group_id: info.group_id,
            resources: info.resources,
            endpoints: info.endpoints,
            dma_token: info.dma_token,
            reset_handler: info.reset_handler,
            owner: None,
        });
    }

    fn find_by_phys(&self, paddr: PhysAddr) -> Option<usize> {
        self.devices.iter().position(|dev| {
            dev.resources
                .iter()
                .any(|res| paddr >= res.base && paddr < res.base + res.size)
        })
    }

    fn find_by_endpoint(&self, iommu: u32, sid: u32) -> Option<usize> {
        self.devices.iter().position(|dev| {
            dev.endpoints
                .iter()
                .any(|ep| ep.iommu == iommu && ep.sid == sid)
        })
    }

    fn reset(dev: &Device) -> PvResult {
        if let Some(cb) = dev.reset_handler {
            cb(dev)
        } else {
            Ok(())
        }
    }

    /// The host donates a device page ahead of guest assignment. Once a
    /// VM holds the device there are no take backs.
    fn host_assign_mmio(&mut self, mt: &dyn MemTransition, pfn: u64) -> PvResult {
        let idx = self
            .find_by_phys(pfn_to_phys(pfn))
            .ok_or(pv_err!(NotFound))?;
        if self.devices[idx].owner.is_some() {
            return pv_result_err!(Busy);
        }
        mt.host_donate_hyp(pfn, 1, true)
    }

    /// The VM never launched or died before claiming the device; hand
    /// the page back to the host.
    fn reclaim_mmio(&mut self, mt: &dyn MemTransition, pfn: u64) -> PvResult {
        let idx = self
            .find_by_phys(pfn_to_phys(pfn))
            .ok_or(pv_err!(NotFound))?;
        if self.devices[idx].owner.is_some() {
            return pv_result_err!(Busy);
        }
        mt.hyp_donate_host(pfn, 1)
    }

    fn is_assignable(&self, pfn: u64) -> bool {
        self.find_by_phys(pfn_to_phys(pfn)).is_some()
    }

    /// Atomically tag every device of the group as owned by `vm`. All
    /// members must be fully hypervisor-owned and unclaimed; any failure
    /// rewinds the owners set by this call.
    fn group_assign(&mut self, mt: &dyn MemTransition, group_id: u32, vm: VmId) -> PvResult {
        let mut assigned = Vec::new();
        let mut result = Ok(());
        for idx in 0..self.devices.len() {
            if self.devices[idx].group_id != group_id {
                continue;
            }
            let dev = &self.devices[idx];
            if dev.owner.is_some() {
                result = pv_result_err!(Denied, format!("group {} partially claimed", group_id));
                break;
            }
            result = dev
                .resources
                .iter()
                .try_for_each(|res| mt.check_range_hyp_owned(res.base, res.size))
                .and_then(|_| Self::reset(dev));
            if result.is_err() {
                break;
            }
            self.devices[idx].owner = Some(vm);
            assigned.push(idx);
        }
        if result.is_err() {
            for idx in assigned {
                self.devices[idx].owner = None;
            }
        }
        result
    }

    /// First guest touch assigns the whole group, then donates the page
    /// into the guest stage-2.
    fn map_guest_mmio(&mut self, mt: &dyn MemTransition, vm: VmId, pfn: u64, gfn: u64) -> PvResult {
        let idx = self
            .find_by_phys(pfn_to_phys(pfn))
            .ok_or(pv_err!(NotFound))?;
        match self.devices[idx].owner {
            None => {
                let group_id = self.devices[idx].group_id;
                self.group_assign(mt, group_id, vm)?;
            }
            Some(owner) if owner != vm => return pv_result_err!(Denied),
            Some(_) => {}
        }
        mt.donate_to_guest(vm, pfn, gfn, 1)
    }

    fn teardown(&mut self, mt: &dyn MemTransition, vm: VmId) {
        for idx in 0..self.devices.len() {
            if self.devices[idx].owner != Some(vm) {
                continue;
            }
            if let Err(e) = Self::reset(&self.devices[idx]) {
                warn!("Device reset failed at teardown of VM {}: {:?}", vm, e);
            }
            self.devices[idx].owner = None;
            for res in &self.devices[idx].resources {
                mt.reclaim_to_host(res.base, res.size);
            }
        }
    }

    fn register_reset(&mut self, paddr: PhysAddr, cb: ResetHandler) -> PvResult {
        let idx = self.find_by_phys(paddr).ok_or(pv_err!(NotFound))?;
        // No reason to prevent changing the callback.
        self.devices[idx].reset_handler = Some(cb);
        Ok(())
    }

    fn dma_token(&self, iommu: u32, sid: u32, vm: VmId) -> PvResult<[u64; 2]> {
        let idx = self.find_by_endpoint(iommu, sid).ok_or(pv_err!(NotFound))?;
        if self.devices[idx].owner != Some(vm) {
            return pv_result_err!(Denied);
        }
        Ok(self.devices[idx].dma_token)
    }

    /// Check that `token` lies inside an MMIO resource of a device the
    /// VM owns.
    fn request_mmio_pa(&self, vm: VmId, token: PhysAddr) -> PvResult {
        for dev in self.devices.iter().filter(|dev| dev.owner == Some(vm)) {
            for res in &dev.resources {
                if token >= res.base && token + PAGE_SIZE <= res.base + res.size {
                    return Ok(());
                }
            }
        }
        pv_result_err!(InvalidParam)
    }
}

/// Registry lock held for the duration of an ownership-gated IOMMU
/// operation; dropping it re-permits ownership transitions.
pub struct IommuGuard<'a> {
    _guard: Option<MutexGuard<'a, DeviceRegistry>>,
}

/// Confirm that the caller (the host when `vm` is `None`, else that VM)
/// owns the device behind the endpoint, and keep the registry locked so
/// the ownership cannot change under the driver call that follows.
pub fn iommu_lock(iommu: u32, sid: u32, vm: Option<VmId>) -> PvResult<IommuGuard<'static>> {
    let registry = REGISTRY.lock();
    match registry.find_by_endpoint(iommu, sid) {
        // Endpoint of a non-assignable device; those stay with the host.
        None => {
            if vm.is_some() {
                pv_result_err!(Denied)
            } else {
                Ok(IommuGuard { _guard: None })
            }
        }
        Some(idx) => {
            if registry.devices[idx].owner == vm {
                Ok(IommuGuard {
                    _guard: Some(registry),
                })
            } else {
                pv_result_err!(Denied)
            }
        }
    }
}

pub fn register_device(info: DeviceInfo) {
    REGISTRY.lock().register(info);
}

pub fn host_assign_mmio(pfn: u64) -> PvResult {
    REGISTRY.lock().host_assign_mmio(mem()?, pfn)
}

pub fn reclaim_mmio(pfn: u64) -> PvResult {
    REGISTRY.lock().reclaim_mmio(mem()?, pfn)
}

pub fn is_assignable(pfn: u64) -> bool {
    REGISTRY.lock().is_assignable(pfn)
}

pub fn map_guest_mmio(vm: &Vm, pfn: u64, gfn: u64) -> PvResult {
    REGISTRY.lock().map_guest_mmio(mem()?, vm.id(), pfn, gfn)
}

pub fn teardown(vm: VmId) {
    if let Ok(mt) = mem() {
        REGISTRY.lock().teardown(mt, vm);
    }
}

pub fn register_reset(paddr: PhysAddr, cb: ResetHandler) -> PvResult {
    REGISTRY.lock().register_reset(paddr, cb)
}

pub(crate) fn dma_token(iommu: u32, sid: u32, vm: VmId) -> PvResult<[u64; 2]> {
    REGISTRY.lock().dma_token(iommu, sid, vm)
}

/// Guest call: turn the IPA of an already-assigned device page into the
/// physical token the firmware cross-checks over its attestation
/// channel. Faults on an unbacked IPA escape to the host for a top-up.
pub fn request_mmio<V: VcpuAccess>(vcpu: &mut V) -> ExitReason {
    let ipa = vcpu.smccc_arg(1) as GuestPhysAddr;
    let vm: Arc<Vm> = vcpu.vm();
    let token = match hypercall::resolve_guest_pa(vcpu, ipa, PAGE_SIZE as u64) {
        Ok(paddr) => paddr,
        Err(e) => match e.error() {
            HyperCallErrorType::HypRequest => return ExitReason::HypRequest,
            HyperCallErrorType::Pv(_) => {
                vcpu.set_retval(SMCCC_RET_INVALID_PARAMETER, 0, 0, 0);
                return ExitReason::Handled;
            }
        },
    };

    match REGISTRY.lock().request_mmio_pa(vm.id(), token) {
        Ok(()) => vcpu.set_retval(SMCCC_RET_SUCCESS, token as u64, 0, 0),
        Err(_) => vcpu.set_retval(SMCCC_RET_INVALID_PARAMETER, 0, 0, 0),
    }
    ExitReason::Handled
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::PvErrorNum;

    struct OkMem;

    impl MemTransition for OkMem {
        fn host_donate_hyp(&self, _pfn: u64, _nr_pages: usize, _device_attrs: bool) -> PvResult {
            Ok(())
        }
        fn hyp_donate_host(&self, _pfn: u64, _nr_pages: usize) -> PvResult {
            Ok(())
        }
        fn donate_to_guest(&self, _vm: VmId, _pfn: u64, _gfn: u64, _nr_pages: usize) -> PvResult {
            Ok(())
        }
        fn check_range_hyp_owned(&self, _base: PhysAddr, _size: usize) -> PvResult {
            Ok(())
        }
        fn reclaim_to_host(&self, _base: PhysAddr, _size: usize) {}
    }

    /// Refuses the hyp-ownership check for one resource base.
    struct PartialMem {
        bad_base: PhysAddr,
    }

    impl MemTransition for PartialMem {
        fn host_donate_hyp(&self, _pfn: u64, _nr_pages: usize, _device_attrs: bool) -> PvResult {
            Ok(())
        }
        fn hyp_donate_host(&self, _pfn: u64, _nr_pages: usize) -> PvResult {
            Ok(())
        }
        fn donate_to_guest(&self, _vm: VmId, _pfn: u64, _gfn: u64, _nr_pages: usize) -> PvResult {
            Ok(())
        }
        fn check_range_hyp_owned(&self, base: PhysAddr, _size: usize) -> PvResult {
            if base == self.bad_base {
                pv_result_err!(Denied)
            } else {
                Ok(())
            }
        }
        fn reclaim_to_host(&self, _base: PhysAddr, _size: usize) {}
    }

    fn device(group_id: u32, base: PhysAddr, iommu: u32, sid: u32) -> DeviceInfo {
        DeviceInfo {
            group_id,
            resources: vec![DevResource {
                base,
                size: 2 * PAGE_SIZE,
            }],
            endpoints: vec![DevEndpoint { iommu, sid }],
            dma_token: [base as u64, sid as u64],
            reset_handler: None,
        }
    }

    #[test]
    fn test_host_assign_and_reclaim() {
        let mut registry = DeviceRegistry::empty();
        registry.register(device(1, 0x4000_0000, 0, 1));

        registry.host_assign_mmio(&OkMem, 0x4000_0000 >> 12).unwrap();
        registry.reclaim_mmio(&OkMem, 0x4000_0000 >> 12).unwrap();
        assert_eq!(
            registry
                .host_assign_mmio(&OkMem, 0x9000_0000 >> 12)
                .unwrap_err()
                .num(),
            PvErrorNum::NotFound
        );
    }

    #[test]
    fn test_group_assign_is_atomic() {
        let mut registry = DeviceRegistry::empty();
        registry.register(device(1, 0x4000_0000, 0, 1));
        registry.register(device(1, 0x4100_0000, 0, 2));

        // Second member not yet donated to the hypervisor: nothing in
        // the group may end up owned.
        let err = registry
            .group_assign(&PartialMem { bad_base: 0x4100_0000 }, 1, 7)
            .unwrap_err();
        assert_eq!(err.num(), PvErrorNum::Denied);
        assert!(registry.devices.iter().all(|d| d.owner.is_none()));

        registry.group_assign(&OkMem, 1, 7).unwrap();
        assert!(registry.devices.iter().all(|d| d.owner == Some(7)));
    }

    #[test]
    fn test_group_assign_denied_when_claimed() {
        let mut registry = DeviceRegistry::empty();
        registry.register(device(1, 0x4000_0000, 0, 1));
        registry.register(device(1, 0x4100_0000, 0, 2));
        registry.devices[1].owner = Some(3);

        let err = registry.group_assign(&OkMem, 1, 7).unwrap_err();
        assert_eq!(err.num(), PvErrorNum::Denied);
        assert_eq!(registry.devices[0].owner, None);
        assert_eq!(registry.devices[1].owner, Some(3));
    }

    #[test]
    fn test_map_guest_mmio_assigns_group_once() {
        let mut registry = DeviceRegistry::empty();
        registry.register(device(1, 0x4000_0000, 0, 1));
        registry.register(device(1, 0x4100_0000, 0, 2));

        registry
            .map_guest_mmio(&OkMem, 7, 0x4000_0000 >> 12, 0x100)
            .unwrap();
        assert!(registry.devices.iter().all(|d| d.owner == Some(7)));

        // A second VM touching the sibling is rejected.
        let err = registry
            .map_guest_mmio(&OkMem, 8, 0x4100_0000 >> 12, 0x200)
            .unwrap_err();
        assert_eq!(err.num(), PvErrorNum::Denied);
    }

    #[test]
    fn test_mmio_busy_while_owned() {
        let mut registry = DeviceRegistry::empty();
        registry.register(device(1, 0x4000_0000, 0, 1));
        registry.devices[0].owner = Some(7);

        assert_eq!(
            registry
                .host_assign_mmio(&OkMem, 0x4000_0000 >> 12)
                .unwrap_err()
                .num(),
            PvErrorNum::Busy
        );
        assert_eq!(
            registry
                .reclaim_mmio(&OkMem, 0x4000_0000 >> 12)
                .unwrap_err()
                .num(),
            PvErrorNum::Busy
        );
    }

    static TEARDOWN_RESETS: AtomicUsize = AtomicUsize::new(0);

    fn counting_reset(_dev: &Device) -> PvResult {
        TEARDOWN_RESETS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[test]
    fn test_teardown_resets_and_releases() {
        let mut registry = DeviceRegistry::empty();
        let mut info = device(1, 0x4000_0000, 0, 1);
        info.reset_handler = Some(counting_reset);
        registry.register(info);
        registry.devices[0].owner = Some(7);

        registry.teardown(&OkMem, 7);
        assert_eq!(TEARDOWN_RESETS.load(Ordering::SeqCst), 1);
        assert_eq!(registry.devices[0].owner, None);
    }

    #[test]
    fn test_dma_token_requires_ownership() {
        let mut registry = DeviceRegistry::empty();
        registry.register(device(1, 0x4000_0000, 3, 9));

        assert_eq!(
            registry.dma_token(3, 9, 7).unwrap_err().num(),
            PvErrorNum::Denied
        );
        registry.devices[0].owner = Some(7);
        assert_eq!(registry.dma_token(3, 9, 7).unwrap(), [0x4000_0000, 9]);
        assert_eq!(
            registry.dma_token(3, 8, 7).unwrap_err().num(),
            PvErrorNum::NotFound
        );
    }

    #[test]
    fn test_request_mmio_pa_bounds() {
        let mut registry = DeviceRegistry::empty();
        registry.register(device(1, 0x4000_0000, 0, 1));
        registry.devices[0].owner = Some(7);

        registry.request_mmio_pa(7, 0x4000_0000).unwrap();
        registry.request_mmio_pa(7, 0x4000_1000).unwrap();
        // One past the last full page of the 2-page resource.
        assert!(registry.request_mmio_pa(7, 0x4000_2000).is_err());
        // Wrong VM.
        assert!(registry.request_mmio_pa(8, 0x4000_0000).is_err());
    }

    #[test]
    fn test_register_reset_replaces_handler() {
        let mut registry = DeviceRegistry::empty();
        registry.register(device(1, 0x4000_0000, 0, 1));
        registry.register_reset(0x4000_0000, counting_reset).unwrap();
        assert!(registry.devices[0].reset_handler.is_some());
        assert_eq!(
            registry
                .register_reset(0x9000_0000, counting_reset)
                .unwrap_err()
                .num(),
            PvErrorNum::NotFound
        );
    }
}
