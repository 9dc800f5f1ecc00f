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

//! Page pools backing IOMMU translation-table allocations.
//!
//! The host deposits pages into a per-vCPU [`Memcache`] before re-entering
//! the guest; the dispatcher drains the memcache into the owning VM's
//! [`HypPool`] at every hypercall entry. Draining up front keeps the
//! donation path out of the IOMMU critical sections, which is what makes
//! the top-up escape deadlock-free.

use alloc::vec::Vec;

use spin::Mutex;

use super::addr::PhysAddr;

/// Host-deposited pages for one vCPU. No lock; only the owning physical
/// core touches it.
#[derive(Default)]
pub struct Memcache {
    pages: Vec<PhysAddr>,
}

impl Memcache {
    pub const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// Host-side: deposit one donated page.
    pub fn topup(&mut self, paddr: PhysAddr) {
        self.pages.push(paddr);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn drain(&mut self) -> Vec<PhysAddr> {
        core::mem::take(&mut self.pages)
    }
}

/// Per-VM pool the IOMMU driver allocates translation-table pages from.
pub struct HypPool {
    pages: Mutex<Vec<PhysAddr>>,
}

impl HypPool {
    pub const fn new() -> Self {
        Self {
            pages: Mutex::new(Vec::new()),
        }
    }

    /// Move every page the host deposited into the pool.
    pub fn refill_from(&self, mc: &mut Memcache) {
        if mc.is_empty() {
            return;
        }
        let mut pages = self.pages.lock();
        for paddr in mc.drain() {
            trace!("Pool refill: {:#x}", paddr);
            pages.push(paddr);
        }
    }

    pub fn alloc_page(&self) -> Option<PhysAddr> {
        self.pages.lock().pop()
    }

    pub fn free_page(&self, paddr: PhysAddr) {
        self.pages.lock().push(paddr);
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }
}

impl Default for HypPool {
    fn default() -> Self {
        Self::new()
    }
}
