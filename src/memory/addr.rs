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

//! Definition of the address kinds the core juggles.

#![allow(dead_code)]

use crate::consts::{PAGE_SHIFT, PAGE_SIZE};

pub type PhysAddr = usize;
pub type HostPhysAddr = PhysAddr;

/// Guest-physical (intermediate physical) address.
pub type GuestPhysAddr = usize;

/// Device-visible I/O virtual address.
pub type Iova = u64;

pub const fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub const fn align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn is_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

pub const fn pfn_to_phys(pfn: u64) -> PhysAddr {
    (pfn as usize) << PAGE_SHIFT
}

pub const fn phys_to_pfn(paddr: PhysAddr) -> u64 {
    (paddr >> PAGE_SHIFT) as u64
}
