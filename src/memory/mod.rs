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

pub mod addr;
pub mod pool;
pub mod stage2;

use bitflags::bitflags;

pub use addr::{GuestPhysAddr, HostPhysAddr, Iova, PhysAddr};
pub use pool::{HypPool, Memcache};

pub const PAGE_SIZE: usize = 0x1000;

bitflags! {
    /// Protection attributes in the form the physical IOMMU driver
    /// consumes. Translated from the wire mask at the hypercall boundary.
    pub struct IommuProt: u64 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const NOEXEC    = 1 << 2;
        const MMIO      = 1 << 3;
        const CACHE     = 1 << 4;
        const PRIV      = 1 << 5;
    }
}
