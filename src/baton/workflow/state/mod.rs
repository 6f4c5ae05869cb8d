// SPDX-License-Identifier: MIT

//! Persistence for workflow documents
//!
//! This module provides:
//! - `GraphStore` - load/save/exists contract with compare-and-swap saves
//! - `JsonGraphStore` - atomic JSON file implementation
//! - `FileLock` / `LockGuard` - exclusive lock held across load-modify-save

mod lock;
mod store;

pub use lock::{FileLock, LockGuard};
pub use store::{GraphStore, JsonGraphStore};
