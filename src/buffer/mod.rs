//! Change-tracking buffers backed by shared blocks.
//!
//! A change-tracking buffer is a growable, indexable sequence whose storage
//! always comes from a [`SharedBlockAllocator`](crate::memory::SharedBlockAllocator)
//! and which keeps a *dirty* flag in the block header. The flag means "may
//! differ from what was last transmitted": every operation that can alter
//! stored bytes sets it, and only the protocol layer clears it after a
//! successful round trip. The resource manager reads the same flag to decide
//! whether it can reuse its cached copy.
//!
//! - [`TrackedBuffer<T>`]: elements of any [`Element`] type
//! - [`TrackedBitBuffer`]: bit-packed booleans, accessed through [`BitRef`]
//!
//! # Example
//!
//! ```rust,ignore
//! use coral_runtime::buffer::TrackedBuffer;
//!
//! let mut weights = TrackedBuffer::from_elem_in(0.0f32, 1000, &alloc)?;
//! assert!(weights.is_dirty());
//!
//! weights.unset_dirty();   // normally done by `wait` after transmission
//! weights[5] = 1.5;        // any mutable access marks it dirty again
//! assert!(weights.is_dirty());
//! ```

mod bits;
mod tracked;

pub use bits::{BitRef, TrackedBitBuffer};
pub use tracked::TrackedBuffer;

use crate::memory::SharedBlock;
use std::sync::atomic::{AtomicBool, Ordering};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Types that can live in a shared block.
///
/// Any bit pattern must be a valid value (the resource manager writes results
/// straight into the payload), so elements are plain-old-data as described by
/// `zerocopy`. Derive `FromBytes`, `IntoBytes` and `Immutable` on `#[repr(C)]`
/// structs to store them.
pub trait Element: FromBytes + IntoBytes + Immutable + Copy + 'static {}

impl<T: FromBytes + IntoBytes + Immutable + Copy + 'static> Element for T {}

/// A buffer whose identity and dirty state can be reported to the
/// resource manager.
pub trait Tracked {
    /// The block currently backing the buffer, if any storage is allocated.
    fn block(&self) -> Option<&SharedBlock>;

    /// Whether the contents may differ from what was last transmitted.
    fn is_dirty(&self) -> bool;

    /// Mark the contents as possibly modified.
    fn set_dirty(&self);

    /// Mark the contents as transmitted.
    ///
    /// Reserved for the protocol layer after a successful round trip.
    fn unset_dirty(&self);

    /// Identity of the backing block, or an empty string without storage.
    fn identity(&self) -> String {
        self.block().map(|b| b.id().to_string()).unwrap_or_default()
    }
}

/// Dirty flag that follows the buffer's storage.
///
/// Without a block the flag is held locally; once a block exists the header
/// byte is authoritative so that other mappers observe it.
#[derive(Debug)]
pub(crate) struct DirtyState {
    local: AtomicBool,
}

impl DirtyState {
    pub(crate) fn new(dirty: bool) -> Self {
        Self {
            local: AtomicBool::new(dirty),
        }
    }

    pub(crate) fn get(&self, block: Option<&SharedBlock>) -> bool {
        match block {
            Some(block) => block.header().is_dirty(),
            None => self.local.load(Ordering::Acquire),
        }
    }

    pub(crate) fn set(&self, block: Option<&SharedBlock>, dirty: bool) {
        self.local.store(dirty, Ordering::Release);
        if let Some(block) = block {
            block.header().set_dirty(dirty);
        }
    }
}

/// Growth policy shared by both buffer kinds: double, starting at one.
pub(crate) fn grown_capacity(current: usize, required: usize) -> usize {
    current.saturating_mul(2).max(required).max(1)
}
