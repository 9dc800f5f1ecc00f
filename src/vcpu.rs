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

use alloc::sync::Arc;

use crate::error::PvResult;
use crate::memory::Memcache;
use crate::vm::Vm;

/// What the exception handler does after a hypercall returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitReason {
    /// Return values are in the guest's registers; re-enter the guest.
    Handled,
    /// Not ours; the embedder forwards the call.
    Forward,
    /// A request is parked in the vCPU's request area and the guest PC
    /// has been rewound; exit to the host so it can service the request
    /// and re-enter. The guest replays the hypercall transparently.
    HypRequest,
}

/// One record the host must service before the vCPU can make progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HypReq {
    /// Back `size` bytes of guest memory starting at `ipa` at stage-2.
    Map { ipa: u64, size: u64 },
    /// Deposit `nr_pages` into the vCPU's IOMMU memcache.
    Mem { nr_pages: u32 },
}

pub const NR_HYP_REQS: usize = 4;

/// Per-vCPU area of parked requests, shared with the host. A request
/// left unserviced across a re-entry means the guest must not run the
/// pending hypercall to completion; the dispatcher rewinds and exits
/// again rather than expose a partial result.
#[derive(Default)]
pub struct HypReqArea {
    slots: [Option<HypReq>; NR_HYP_REQS],
}

impl HypReqArea {
    pub const fn new() -> Self {
        Self {
            slots: [None; NR_HYP_REQS],
        }
    }

    pub fn reserve(&mut self, req: HypReq) -> PvResult {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(req);
                return Ok(());
            }
        }
        pv_result_err!(Busy, "hyp request area full")
    }

    pub fn has_pending(&self) -> bool {
        self.slots.iter().any(|slot| slot.is_some())
    }

    /// Host-side: take the next request to service.
    pub fn pop(&mut self) -> Option<HypReq> {
        for slot in self.slots.iter_mut() {
            if slot.is_some() {
                return slot.take();
            }
        }
        None
    }
}

/// Access to the trapping vCPU. The embedding hypervisor implements this
/// over its guest register file; tests implement it over a plain struct.
pub trait VcpuAccess {
    fn vm(&self) -> Arc<Vm>;

    /// Hypercall function ID (r0 of the HVC64 convention).
    fn smccc_fn(&self) -> u32;

    /// Argument register `n` with `n` in 1..=6.
    fn smccc_arg(&self, n: usize) -> u64;

    fn set_retval(&mut self, a0: i64, a1: u64, a2: u64, a3: u64);

    /// Rewind the exception-return PC by one hypercall instruction so
    /// the guest replays the call on re-entry.
    fn rewind_hvc(&mut self);

    fn memcache(&mut self) -> &mut Memcache;

    fn req_area(&mut self) -> &mut HypReqArea;
}
