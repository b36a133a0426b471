//! Named shared-memory blocks with an embedded metadata header.
//!
//! Every block is a regular file inside the namespace directory (normally on
//! a tmpfs such as `/dev/shm`), mapped `MAP_SHARED`. Any process that knows
//! the block identity can map the same bytes, which is how the resource
//! manager reads buffers without a copy over the socket.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────┐ offset 0
//! │ BlockHeader                          │
//! │ - dirty byte (AtomicU8)              │
//! │ - id length (u8)                     │
//! │ - id bytes                           │
//! │ (zero padding up to META_BYTES)      │
//! ├──────────────────────────────────────┤ offset META_BYTES
//! │ Payload (payload_len bytes)          │
//! └──────────────────────────────────────┘
//! ```
//!
//! The mapping starts on a page boundary and `META_BYTES` is one page, so the
//! payload is page-aligned and can be viewed as a slice of any element type
//! with alignment up to 4096.

use crate::buffer::Element;
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

/// Size of the metadata region preceding every payload.
pub const META_BYTES: usize = 4096;

/// Longest identity a block header can hold.
pub const MAX_ID_LEN: usize = 255;

const _: () = assert!(std::mem::size_of::<BlockHeader>() <= META_BYTES);

/// Metadata stored at the start of every shared block.
///
/// The header lives in shared memory, so the dirty byte written here is seen
/// by every process that maps the same block.
#[repr(C)]
pub struct BlockHeader {
    dirty: AtomicU8,
    id_len: u8,
    id: [u8; MAX_ID_LEN],
}

impl BlockHeader {
    /// The dirty byte (`get_dirty`).
    #[inline]
    pub fn dirty(&self) -> &AtomicU8 {
        &self.dirty
    }

    /// Whether the dirty byte is currently set.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire) != 0
    }

    /// Set or clear the dirty byte.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty as u8, Ordering::Release);
    }

    /// Identity bytes as recorded in shared memory.
    pub fn id_bytes(&self) -> &[u8] {
        let len = (self.id_len as usize).min(MAX_ID_LEN);
        &self.id[..len]
    }

    fn write_id(&mut self, id: &str) {
        let bytes = id.as_bytes();
        debug_assert!(bytes.len() <= MAX_ID_LEN);
        self.id[..bytes.len()].copy_from_slice(bytes);
        self.id[bytes.len()..].fill(0);
        self.id_len = bytes.len() as u8;
    }
}

/// A named shared-memory block.
///
/// Blocks come from [`SharedBlockAllocator`](super::SharedBlockAllocator).
/// An *owning* block (from `allocate`) removes its namespace entry when
/// dropped; a *view* (from `open`) only unmaps.
pub struct SharedBlock {
    fd: OwnedFd,
    base: NonNull<u8>,
    payload_len: usize,
    path: PathBuf,
    id: String,
    owned: bool,
}

impl SharedBlock {
    /// Create a new block file `dir/id` with `payload_len` payload bytes.
    pub(crate) fn create(dir: &Path, id: String, payload_len: usize) -> Result<Self> {
        if id.len() > MAX_ID_LEN {
            return Err(Error::Allocation(format!(
                "block id too long: {} > {MAX_ID_LEN} bytes",
                id.len()
            )));
        }

        let path = dir.join(&id);
        let fd = rustix::fs::open(
            &path,
            OFlags::RDWR | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o666),
        )
        .map_err(|e| Error::allocation(&format!("create {}", path.display()), e))?;

        let map_len = map_len(payload_len)?;
        let base = match size_and_map(&fd, map_len) {
            Ok(base) => base,
            Err(e) => {
                let _ = rustix::fs::unlink(&path);
                return Err(e);
            }
        };

        let mut block = Self {
            fd,
            base,
            payload_len,
            path,
            id,
            owned: true,
        };
        let id = block.id.clone();
        block.header_mut().write_id(&id);

        Ok(block)
    }

    /// Map an existing block file `dir/id` as a non-owning view.
    pub(crate) fn open(dir: &Path, id: &str) -> Result<Self> {
        let path = dir.join(id);
        let fd = rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| Error::allocation(&format!("open {}", path.display()), e))?;

        let stat = rustix::fs::fstat(&fd).map_err(|e| Error::allocation("fstat", e))?;
        let map_len = stat.st_size as usize;
        if map_len < META_BYTES {
            return Err(Error::Allocation(format!(
                "{} is not a shared block ({map_len} bytes)",
                path.display()
            )));
        }

        let base = map(&fd, map_len)?;
        let block = Self {
            fd,
            base,
            payload_len: map_len - META_BYTES,
            path,
            id: id.to_string(),
            owned: false,
        };

        if block.header().id_bytes() != id.as_bytes() {
            return Err(Error::Allocation(format!(
                "header of {} does not match its identity",
                block.path.display()
            )));
        }

        Ok(block)
    }

    /// Resize the payload, keeping header, identity and the common prefix.
    ///
    /// On failure the block is left exactly as it was.
    pub(crate) fn resize(&mut self, payload_len: usize) -> Result<()> {
        if payload_len == self.payload_len {
            return Ok(());
        }

        let old_len = META_BYTES + self.payload_len;
        let new_len = map_len(payload_len)?;

        if new_len > old_len {
            rustix::fs::ftruncate(&self.fd, new_len as u64)
                .map_err(|e| Error::allocation("ftruncate", e))?;
            let base = match map(&self.fd, new_len) {
                Ok(base) => base,
                Err(e) => {
                    let _ = rustix::fs::ftruncate(&self.fd, old_len as u64);
                    return Err(e);
                }
            };
            self.replace_mapping(base, old_len);
        } else {
            let base = map(&self.fd, new_len)?;
            self.replace_mapping(base, old_len);
            // The new mapping never touches the tail, so a failed truncate
            // only leaves slack in the file.
            if let Err(e) = rustix::fs::ftruncate(&self.fd, new_len as u64) {
                tracing::warn!(id = %self.id, error = %e, "failed to shrink shared block file");
            }
        }

        tracing::debug!(id = %self.id, from = self.payload_len, to = payload_len, "resized shared block");
        self.payload_len = payload_len;
        Ok(())
    }

    fn replace_mapping(&mut self, base: NonNull<u8>, old_len: usize) {
        let old = std::mem::replace(&mut self.base, base);
        // SAFETY: `old` was returned by mmap with length `old_len` and nothing
        // borrows it anymore (we hold `&mut self`).
        unsafe {
            let _ = rustix::mm::munmap(old.as_ptr().cast(), old_len);
        }
    }

    /// Move the block to a fresh identity inside `dir`; the payload is untouched.
    pub(crate) fn rename_to(&mut self, dir: &Path, new_id: String) -> Result<()> {
        if new_id.len() > MAX_ID_LEN {
            return Err(Error::Allocation(format!(
                "block id too long: {} > {MAX_ID_LEN} bytes",
                new_id.len()
            )));
        }

        let new_path = dir.join(&new_id);
        rustix::fs::rename(&self.path, &new_path)
            .map_err(|e| Error::allocation(&format!("rename {}", self.path.display()), e))?;

        self.header_mut().write_id(&new_id);
        tracing::debug!(from = %self.id, to = %new_id, "renamed shared block");
        self.path = new_path;
        self.id = new_id;
        Ok(())
    }

    /// Remove the namespace entry and give up ownership.
    pub(crate) fn release(mut self) -> Result<()> {
        self.owned = false;
        rustix::fs::unlink(&self.path)
            .map_err(|e| Error::allocation(&format!("unlink {}", self.path.display()), e))
    }

    /// The block identity (`get_id`).
    ///
    /// This is the string sent to the resource manager in place of the
    /// payload bytes.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether dropping this handle removes the namespace entry.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owned
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload_len
    }

    /// Returns true if the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload_len == 0
    }

    /// The metadata header.
    #[inline]
    pub fn header(&self) -> &BlockHeader {
        // SAFETY: the mapping is at least META_BYTES long, page-aligned, and
        // BlockHeader is repr(C) with only byte-sized fields.
        unsafe { &*self.base.as_ptr().cast::<BlockHeader>() }
    }

    fn header_mut(&mut self) -> &mut BlockHeader {
        // SAFETY: as in `header`, and `&mut self` gives exclusive access.
        unsafe { &mut *self.base.as_ptr().cast::<BlockHeader>() }
    }

    /// The dirty byte inside the header (`get_dirty`).
    #[inline]
    pub fn dirty(&self) -> &AtomicU8 {
        self.header().dirty()
    }

    /// Payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        // SAFETY: the mapping covers META_BYTES + payload_len bytes.
        unsafe { std::slice::from_raw_parts(self.payload_ptr(), self.payload_len) }
    }

    /// Mutable payload bytes.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: the mapping covers META_BYTES + payload_len bytes and
        // `&mut self` gives exclusive access within this process.
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(), self.payload_len) }
    }

    #[inline]
    fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: META_BYTES is inside the mapping.
        unsafe { self.base.as_ptr().add(META_BYTES) }
    }

    /// View the first `len` payload elements.
    pub(crate) fn elements<T: Element>(&self, len: usize) -> &[T] {
        debug_assert!(len * std::mem::size_of::<T>() <= self.payload_len);
        // SAFETY: the payload is page-aligned, large enough for `len` values,
        // and every bit pattern is a valid `T` (`T: FromBytes`).
        unsafe { std::slice::from_raw_parts(self.payload_ptr().cast::<T>(), len) }
    }

    /// Mutable view of the first `len` payload elements.
    pub(crate) fn elements_mut<T: Element>(&mut self, len: usize) -> &mut [T] {
        self.split_elements_mut(len).1
    }

    /// The dirty byte together with a mutable view of the first `len` elements.
    ///
    /// Header and payload never overlap, so both borrows may coexist.
    pub(crate) fn split_elements_mut<T: Element>(&mut self, len: usize) -> (&AtomicU8, &mut [T]) {
        debug_assert!(len * std::mem::size_of::<T>() <= self.payload_len);
        // SAFETY: see `elements`; the header occupies [0, META_BYTES) and the
        // slice starts at META_BYTES, so the two references are disjoint.
        unsafe {
            let header = &*self.base.as_ptr().cast::<BlockHeader>();
            let elems = std::slice::from_raw_parts_mut(self.payload_ptr().cast::<T>(), len);
            (header.dirty(), elems)
        }
    }
}

impl std::fmt::Debug for SharedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBlock")
            .field("id", &self.id)
            .field("len", &self.payload_len)
            .field("owned", &self.owned)
            .field("dirty", &self.header().is_dirty())
            .finish()
    }
}

impl Drop for SharedBlock {
    fn drop(&mut self) {
        // SAFETY: base/len describe the live mapping created in create/open/resize.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), META_BYTES + self.payload_len);
        }
        if self.owned {
            if let Err(e) = rustix::fs::unlink(&self.path) {
                tracing::warn!(id = %self.id, error = %e, "failed to unlink shared block");
            }
        }
        // fd is closed when OwnedFd is dropped
    }
}

// SAFETY: SharedBlock is Send + Sync because:
// - The mapping is process-wide and may be touched from any thread
// - Shared access only reads the payload or uses the atomic dirty byte
// - Mutation of the payload and header id requires `&mut self`
unsafe impl Send for SharedBlock {}
unsafe impl Sync for SharedBlock {}

fn map_len(payload_len: usize) -> Result<usize> {
    payload_len
        .checked_add(META_BYTES)
        .ok_or_else(|| Error::Allocation(format!("payload size overflow: {payload_len}")))
}

fn size_and_map(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>> {
    rustix::fs::ftruncate(fd, len as u64).map_err(|e| Error::allocation("ftruncate", e))?;
    map(fd, len)
}

fn map(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>> {
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|e| Error::allocation("mmap", e))?;

    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::Allocation("mmap returned null".into()))
}
