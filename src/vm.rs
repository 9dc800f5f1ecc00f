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

use crate::memory::stage2::GuestStage2;
use crate::memory::HypPool;
use crate::route::RouteTable;

/// Opaque VM handle. Device and domain ownership is tracked by value,
/// never by pointer, so teardown order cannot dangle.
pub type VmId = u32;

/// The slice of a guest VM this subsystem cares about.
pub struct Vm {
    id: VmId,
    pgt: Arc<dyn GuestStage2>,
    pool: HypPool,
    routes: RouteTable,
}

impl Vm {
    pub fn new(id: VmId, pgt: Arc<dyn GuestStage2>) -> Self {
        Self {
            id,
            pgt,
            pool: HypPool::new(),
            routes: RouteTable::new(),
        }
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn stage2(&self) -> &dyn GuestStage2 {
        &*self.pgt
    }

    pub fn pool(&self) -> &HypPool {
        &self.pool
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// VM death. Every vCPU has parked by the time this runs; devices
    /// the VM owned are reset and their MMIO handed back to the host,
    /// and its leftover domains are dropped.
    pub fn teardown(&self) {
        info!("Teardown VM {}", self.id);
        crate::device::teardown(self.id);
        crate::domain::teardown(self.id);
    }
}
