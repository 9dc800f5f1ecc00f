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

use alloc::string::String;
use core::fmt::{Debug, Formatter, Result};

use crate::error::{PvError, PvErrorNum};

pub enum HyperCallErrorType {
    /// Mapped to a wire return code in the guest's r0.
    Pv(PvErrorNum),
    /// A request is parked for the host and the guest PC is rewound;
    /// nothing is written to the guest's registers.
    HypRequest,
}

pub struct HyperCallError {
    error: HyperCallErrorType,
    loc_file: &'static str,
    loc_line: u32,
    loc_col: u32,
    msg: Option<String>,
    /// Bytes of partial progress reported in r1 alongside an error.
    partial: u64,
}

pub type HyperCallResult<T = ()> = core::result::Result<T, HyperCallError>;

impl HyperCallError {
    pub fn new_hyp_request(loc_file: &'static str, loc_line: u32, loc_col: u32) -> Self {
        Self {
            error: HyperCallErrorType::HypRequest,
            loc_file,
            loc_line,
            loc_col,
            msg: None,
            partial: 0,
        }
    }

    pub fn error(&self) -> &HyperCallErrorType {
        &self.error
    }

    pub fn partial(&self) -> u64 {
        self.partial
    }

    pub fn with_partial(mut self, partial: u64) -> Self {
        self.partial = partial;
        self
    }
}

impl From<PvError> for HyperCallError {
    fn from(err: PvError) -> Self {
        HyperCallError {
            error: HyperCallErrorType::Pv(err.num()),
            loc_file: err.loc_file(),
            loc_line: err.loc_line(),
            loc_col: err.loc_col(),
            msg: err.msg(),
            partial: 0,
        }
    }
}

impl Debug for HyperCallError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let kind = match &self.error {
            HyperCallErrorType::Pv(num) => num.as_str(),
            HyperCallErrorType::HypRequest => "Hyp request parked",
        };
        write!(
            f,
            "[{}:{}:{}] {}",
            self.loc_file, self.loc_line, self.loc_col, kind
        )?;
        if let Some(ref msg) = self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! hypercall_pv_err {
    ($num: ident) => {{
        use $crate::hypercall::error::HyperCallError;
        HyperCallError::from(pv_err!($num))
    }};
    ($num: ident, $msg: expr) => {{
        use $crate::hypercall::error::HyperCallError;
        HyperCallError::from(pv_err!($num, $msg))
    }};
}

#[macro_export]
macro_rules! hypercall_pv_err_result {
    ($num: ident) => {
        Err(hypercall_pv_err!($num))
    };
    ($num: ident, $msg: expr) => {
        Err(hypercall_pv_err!($num, $msg))
    };
}

#[macro_export]
macro_rules! hypercall_hyp_req {
    () => {{
        use $crate::hypercall::error::HyperCallError;
        HyperCallError::new_hyp_request(file!(), line!(), column!())
    }};
}
