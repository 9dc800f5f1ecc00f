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

/// Error kinds the core produces.
///
/// `OutOfMem` is never surfaced to a guest; it arms the memory-top-up
/// escape instead. Everything else maps to a wire return code in the
/// hypercall layer.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PvErrorNum {
    NotFound = 1,
    Denied = 2,
    Busy = 3,
    InvalidParam = 4,
    OutOfMem = 5,
    Unsupported = 6,
}

pub struct PvError {
    num: PvErrorNum,
    loc_file: &'static str,
    loc_line: u32,
    loc_col: u32,
    msg: Option<String>,
}

pub type PvResult<T = ()> = core::result::Result<T, PvError>;

impl PvErrorNum {
    pub fn as_str(&self) -> &'static str {
        use PvErrorNum::*;
        match *self {
            NotFound => "Route, device or domain unknown",
            Denied => "Caller is not the owner",
            Busy => "Resource busy or exhausted",
            InvalidParam => "Invalid argument",
            OutOfMem => "Out of memory",
            Unsupported => "Not supported",
        }
    }
}

impl PvError {
    pub fn new(
        num: PvErrorNum,
        loc_file: &'static str,
        loc_line: u32,
        loc_col: u32,
        msg: Option<String>,
    ) -> Self {
        Self {
            num,
            loc_file,
            loc_line,
            loc_col,
            msg,
        }
    }

    pub fn num(&self) -> PvErrorNum {
        self.num
    }

    pub fn loc_file(&self) -> &'static str {
        self.loc_file
    }

    pub fn loc_line(&self) -> u32 {
        self.loc_line
    }

    pub fn loc_col(&self) -> u32 {
        self.loc_col
    }

    pub fn msg(&self) -> Option<String> {
        self.msg.as_ref().map(|string| string.into())
    }
}

impl Debug for PvError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(
            f,
            "[{}:{}:{}] {}",
            self.loc_file,
            self.loc_line,
            self.loc_col,
            self.num.as_str()
        )?;
        if let Some(ref msg) = self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! pv_err {
    ($num: ident) => {{
        use $crate::error::{PvError, PvErrorNum::*};
        PvError::new($num, file!(), line!(), column!(), None)
    }};
    ($num: ident, $msg: expr) => {{
        use $crate::error::{PvError, PvErrorNum::*};
        PvError::new($num, file!(), line!(), column!(), Some($msg.into()))
    }};
}

#[macro_export]
macro_rules! pv_result_err {
    ($num: ident) => {
        Err(pv_err!($num))
    };
    ($num: ident, $msg: expr) => {
        Err(pv_err!($num, $msg))
    };
}
