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

pub use crate::memory::PAGE_SIZE;

pub const PAGE_SHIFT: usize = 12;

/// Size of the global domain ID space. Host domains live in the lower
/// half, guest domains in the upper half; the two never overlap.
pub const TOTAL_DOMAINS: usize = 1 << 16;
pub const NR_GUEST_DOMAINS: usize = TOTAL_DOMAINS / 2;
pub const GUEST_DOMAIN_BASE: u32 = (TOTAL_DOMAINS / 2) as u32;

pub const MAX_VIOMMUS: usize = 32;
pub const MAX_SIDS_PER_VIOMMU: usize = 16;

/// Width of the hypercall instruction; the exception-return PC is wound
/// back by exactly this much when a call must be transparently replayed.
pub const HVC_INSN_SIZE: u64 = 4;

/// Implemented version of the guest-facing ABI.
pub const PVIOMMU_VERSION: u64 = 0x1000;

/// Pages requested from the host per memory-top-up round trip.
pub const POOL_TOPUP_PAGES: u32 = 8;
