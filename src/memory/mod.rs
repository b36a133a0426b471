//! Shared-memory management.
//!
//! This module provides the storage behind every zero-copy buffer:
//!
//! - [`SharedBlock`]: a named, file-backed `MAP_SHARED` region made of a
//!   [`BlockHeader`] (dirty byte, identity) followed by the payload
//! - [`SharedBlockAllocator`]: allocates, frees, resizes and renames blocks
//!   inside the configured namespace
//!
//! # Example
//!
//! ```rust,ignore
//! use coral_runtime::memory::SharedBlockAllocator;
//!
//! let alloc = SharedBlockAllocator::in_dir("/dev/shm/inaccel")?;
//! let mut slot = alloc.allocate(64)?;
//! alloc.reallocate(&mut slot, 4096)?;
//!
//! // A peer maps the same bytes by identity
//! let view = alloc.open(slot.as_ref().unwrap().id())?;
//! ```

mod allocator;
mod block;

pub use allocator::SharedBlockAllocator;
pub use block::{BlockHeader, MAX_ID_LEN, META_BYTES, SharedBlock};
