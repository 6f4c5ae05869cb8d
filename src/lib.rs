// SPDX-License-Identifier: MIT

pub mod baton;
pub mod common;
