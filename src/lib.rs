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

//! Hypervisor-side paravirtualized IOMMU core.
//!
//! The host cannot be trusted to program the IOMMU on behalf of a protected
//! guest, so every translation-table change goes through a narrow hypercall
//! ABI mediated here. The crate provides the hypercall dispatcher, the
//! per-VM vSID routing table, the device ownership registry and the
//! guest-half domain ID allocator. The physical IOMMU driver, the stage-2
//! walker and the page ownership transitions are consumed as traits
//! registered at init.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(test, allow(dead_code))]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

#[macro_use]
pub mod error;
#[macro_use]
pub mod hypercall;

pub mod consts;
pub mod device;
pub mod domain;
pub mod iommu;
pub mod logging;
pub mod memory;
pub mod route;
pub mod vcpu;
pub mod vm;
