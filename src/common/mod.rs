// SPDX-License-Identifier: MIT

pub mod config;
pub mod error;
