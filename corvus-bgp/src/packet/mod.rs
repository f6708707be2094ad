//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod attribute;
pub mod consts;
pub mod error;
pub mod message;
pub mod nlri;
