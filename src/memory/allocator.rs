//! Allocator handing out named shared blocks.
//!
//! The allocator follows the C allocation contract closely (`allocate`,
//! `free`, `reallocate`) so that buffers built on it behave like ordinary
//! growable storage, while every block stays visible to other processes
//! under the configured namespace.

use super::SharedBlock;
use crate::config::Config;
use crate::error::{Error, Result};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Number of random characters in a generated block identity.
const ID_RANDOM_LEN: usize = 16;

/// Prefix of every generated block identity.
const ID_PREFIX: &str = "cube";

/// Allocator of named shared-memory blocks.
///
/// Cheap to clone; clones share the namespace directory.
///
/// # Example
///
/// ```rust,ignore
/// use coral_runtime::{Config, memory::SharedBlockAllocator};
///
/// let alloc = SharedBlockAllocator::new(&Config::from_env()?)?;
/// let mut block = alloc.allocate(4096)?.expect("non-zero size");
/// block.payload_mut()[0] = 1;
/// println!("share {} with the resource manager", block.id());
/// alloc.free(Some(block))?;
/// ```
#[derive(Clone, Debug)]
pub struct SharedBlockAllocator {
    dir: Arc<PathBuf>,
}

impl SharedBlockAllocator {
    /// Create an allocator for the namespace described by `config`.
    ///
    /// The namespace directory is created if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the directory cannot be created.
    pub fn new(config: &Config) -> Result<Self> {
        Self::in_dir(config.block_dir())
    }

    /// Create an allocator that materializes blocks directly in `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::Allocation(format!("create namespace {}: {e}", dir.display()))
        })?;

        Ok(Self { dir: Arc::new(dir) })
    }

    /// Directory holding this allocator's blocks.
    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a block with `size` payload bytes.
    ///
    /// Returns `Ok(None)` for a zero-sized request. The payload is zeroed and
    /// the dirty byte is clear.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] with the OS error text if the backing
    /// file cannot be created, sized or mapped.
    pub fn allocate(&self, size: usize) -> Result<Option<SharedBlock>> {
        if size == 0 {
            return Ok(None);
        }

        let id = generate_id();
        let block = SharedBlock::create(&self.dir, id, size)?;
        tracing::debug!(id = %block.id(), size, "allocated shared block");
        Ok(Some(block))
    }

    /// Free a block, removing its namespace entry.
    ///
    /// Freeing `None` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the entry cannot be removed, for
    /// example because the same identity was already freed.
    pub fn free(&self, block: Option<SharedBlock>) -> Result<()> {
        let Some(block) = block else {
            return Ok(());
        };

        let id = block.id().to_string();
        block.release()?;
        tracing::debug!(id = %id, "freed shared block");
        Ok(())
    }

    /// Resize the block held in `slot`, with C `realloc` semantics.
    ///
    /// - empty slot and `new_size > 0`: allocate
    /// - occupied slot and `new_size == 0`: free, leaving the slot empty
    /// - otherwise: resize in place, keeping the identity and the first
    ///   `min(old, new)` payload bytes
    ///
    /// If a resize fails the slot still holds the original block, untouched.
    pub fn reallocate(&self, slot: &mut Option<SharedBlock>, new_size: usize) -> Result<()> {
        if new_size == 0 {
            return self.free(slot.take());
        }

        match slot {
            Some(block) => block.resize(new_size),
            None => {
                *slot = self.allocate(new_size)?;
                Ok(())
            }
        }
    }

    /// Give `block` a fresh identity without touching its payload.
    ///
    /// Used to present existing bytes to the resource manager as logically
    /// new data.
    pub fn rename(&self, block: &mut SharedBlock) -> Result<()> {
        block.rename_to(&self.dir, generate_id())
    }

    /// Map an existing block by identity as a non-owning view.
    ///
    /// This is what a peer does with an identity received over the wire.
    pub fn open(&self, id: &str) -> Result<SharedBlock> {
        if id.is_empty() || id.contains('/') || id == "." || id == ".." {
            return Err(Error::Allocation(format!("invalid block id {id:?}")));
        }
        SharedBlock::open(&self.dir, id)
    }
}

fn generate_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ID_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{ID_PREFIX}-{}-{suffix}", std::process::id())
}
