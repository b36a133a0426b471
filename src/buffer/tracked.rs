//! Generic change-tracking buffer.

use super::{DirtyState, Element, Tracked, grown_capacity};
use crate::error::{Error, Result};
use crate::memory::{META_BYTES, SharedBlock, SharedBlockAllocator};
use std::marker::PhantomData;
use std::ops::{Bound, Index, IndexMut, RangeBounds};
use std::slice::SliceIndex;

/// A growable sequence of `T` stored in a shared block.
///
/// Behaves like `Vec<T>` with two differences: storage comes exclusively
/// from a [`SharedBlockAllocator`], so fallible operations return
/// [`Result`], and the buffer maintains a dirty flag in the block header.
///
/// The flag is set by construction and by every operation that obtains
/// mutable access to the elements or changes the storage, including
/// `get_mut`, `IndexMut` and `iter_mut` even if nothing is written
/// afterwards. It is cleared only through [`unset_dirty`](Self::unset_dirty),
/// which `wait` calls once the buffer has been transmitted.
///
/// Operations either succeed or fail before touching any element.
pub struct TrackedBuffer<T: Element> {
    alloc: SharedBlockAllocator,
    block: Option<SharedBlock>,
    len: usize,
    dirty: DirtyState,
    _marker: PhantomData<T>,
}

impl<T: Element> TrackedBuffer<T> {
    /// Create an empty buffer. No block is allocated until the first insertion.
    pub fn new_in(alloc: &SharedBlockAllocator) -> Self {
        const {
            assert!(std::mem::size_of::<T>() > 0, "zero-sized elements are not supported");
            assert!(std::mem::align_of::<T>() <= META_BYTES);
        }

        Self {
            alloc: alloc.clone(),
            block: None,
            len: 0,
            dirty: DirtyState::new(true),
            _marker: PhantomData,
        }
    }

    /// Create an empty buffer with room for exactly `capacity` elements.
    pub fn with_capacity_in(capacity: usize, alloc: &SharedBlockAllocator) -> Result<Self> {
        let mut buffer = Self::new_in(alloc);
        buffer.set_capacity(capacity)?;
        Ok(buffer)
    }

    /// Create a buffer holding `n` copies of `value`.
    pub fn from_elem_in(value: T, n: usize, alloc: &SharedBlockAllocator) -> Result<Self> {
        let mut buffer = Self::with_capacity_in(n, alloc)?;
        buffer.resize(n, value)?;
        Ok(buffer)
    }

    /// Create a buffer holding a copy of `values`.
    pub fn from_slice_in(values: &[T], alloc: &SharedBlockAllocator) -> Result<Self> {
        let mut buffer = Self::with_capacity_in(values.len(), alloc)?;
        buffer.extend_from_slice(values)?;
        Ok(buffer)
    }

    /// Create a buffer from the items of an iterator.
    pub fn from_iter_in<I>(iter: I, alloc: &SharedBlockAllocator) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
    {
        let iter = iter.into_iter();
        let mut buffer = Self::with_capacity_in(iter.size_hint().0, alloc)?;
        for value in iter {
            buffer.push(value)?;
        }
        Ok(buffer)
    }

    /// Copy the buffer into a new block. The copy has `capacity == len`.
    pub fn try_clone(&self) -> Result<Self> {
        Self::from_slice_in(self.as_slice(), &self.alloc)
    }

    /// Move the contents out, leaving this buffer empty.
    ///
    /// This is an ownership transfer, not a mutation: the emptied buffer
    /// keeps its previous dirty state.
    pub fn take(&mut self) -> Self {
        let dirty = self.is_dirty();
        let empty = Self {
            alloc: self.alloc.clone(),
            block: None,
            len: 0,
            dirty: DirtyState::new(dirty),
            _marker: PhantomData,
        };
        std::mem::replace(self, empty)
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements the current block can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block
            .as_ref()
            .map_or(0, |b| b.len() / std::mem::size_of::<T>())
    }

    /// The allocator providing this buffer's storage.
    #[inline]
    pub fn allocator(&self) -> &SharedBlockAllocator {
        &self.alloc
    }

    /// The block backing this buffer, if storage is allocated.
    #[inline]
    pub fn block(&self) -> Option<&SharedBlock> {
        self.block.as_ref()
    }

    /// Whether the contents may differ from what was last transmitted.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.get(self.block.as_ref())
    }

    /// Mark the contents as possibly modified.
    #[inline]
    pub fn set_dirty(&self) {
        self.dirty.set(self.block.as_ref(), true);
    }

    /// Mark the contents as transmitted.
    ///
    /// Reserved for the protocol layer; see [`Request::cleanup`](crate::Request::cleanup).
    #[inline]
    pub fn unset_dirty(&self) {
        self.dirty.set(self.block.as_ref(), false);
    }

    /// The elements as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        match &self.block {
            Some(block) => block.elements(self.len),
            None => &[],
        }
    }

    /// The elements as a mutable slice. Marks the buffer dirty.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.set_dirty();
        let len = self.len;
        match &mut self.block {
            Some(block) => block.elements_mut(len),
            None => &mut [],
        }
    }

    /// Element at `index`, or `None` if out of range.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Mutable element at `index`, or `None` if out of range.
    ///
    /// Marks the buffer dirty when the element exists.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len {
            return None;
        }
        self.as_mut_slice().get_mut(index)
    }

    /// Checked element access.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index >= len`.
    pub fn at(&self, index: usize) -> Result<&T> {
        let len = self.len;
        self.get(index).ok_or(Error::OutOfRange { index, len })
    }

    /// Checked mutable element access. Marks the buffer dirty on success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index >= len`.
    pub fn at_mut(&mut self, index: usize) -> Result<&mut T> {
        let len = self.len;
        self.get_mut(index).ok_or(Error::OutOfRange { index, len })
    }

    /// First element.
    #[inline]
    pub fn first(&self) -> Option<&T> {
        self.as_slice().first()
    }

    /// Last element.
    #[inline]
    pub fn last(&self) -> Option<&T> {
        self.as_slice().last()
    }

    /// Iterate over the elements.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Iterate mutably over the elements. Marks the buffer dirty.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.as_mut_slice().iter_mut()
    }

    /// Append an element, growing the block if needed.
    pub fn push(&mut self, value: T) -> Result<()> {
        self.reserve_amortized(1)?;
        let len = self.len;
        self.elements_mut_to(len + 1)[len] = value;
        self.len = len + 1;
        self.set_dirty();
        Ok(())
    }

    /// Remove and return the last element.
    pub fn pop(&mut self) -> Option<T> {
        let value = *self.last()?;
        self.len -= 1;
        self.set_dirty();
        Some(value)
    }

    /// Insert `value` at `index`, shifting later elements right.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index > len`.
    pub fn insert(&mut self, index: usize, value: T) -> Result<()> {
        let len = self.len;
        if index > len {
            return Err(Error::OutOfRange { index, len });
        }

        self.reserve_amortized(1)?;
        let elems = self.elements_mut_to(len + 1);
        elems.copy_within(index..len, index + 1);
        elems[index] = value;
        self.len = len + 1;
        self.set_dirty();
        Ok(())
    }

    /// Remove and return the element at `index`, shifting later elements left.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index >= len`.
    pub fn remove(&mut self, index: usize) -> Result<T> {
        let len = self.len;
        if index >= len {
            return Err(Error::OutOfRange { index, len });
        }

        let elems = self.elements_mut_to(len);
        let value = elems[index];
        elems.copy_within(index + 1..len, index);
        self.len = len - 1;
        self.set_dirty();
        Ok(value)
    }

    /// Remove the elements in `range`, shifting later elements left.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the range does not fit in the buffer.
    pub fn erase<R: RangeBounds<usize>>(&mut self, range: R) -> Result<()> {
        let len = self.len;
        let (start, end) = bounds(range, len)?;

        let elems = self.elements_mut_to(len);
        elems.copy_within(end..len, start);
        self.len = len - (end - start);
        self.set_dirty();
        Ok(())
    }

    /// Shorten the buffer to `len` elements. Capacity is unchanged.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
        self.set_dirty();
    }

    /// Remove all elements. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Resize to `new_len`, filling new slots with `value`.
    pub fn resize(&mut self, new_len: usize, value: T) -> Result<()> {
        let len = self.len;
        if new_len > len {
            self.reserve_amortized(new_len - len)?;
            self.elements_mut_to(new_len)[len..].fill(value);
        }
        self.len = new_len;
        self.set_dirty();
        Ok(())
    }

    /// Append all elements of `values`.
    pub fn extend_from_slice(&mut self, values: &[T]) -> Result<()> {
        let len = self.len;
        self.reserve_amortized(values.len())?;
        self.elements_mut_to(len + values.len())[len..].copy_from_slice(values);
        self.len = len + values.len();
        self.set_dirty();
        Ok(())
    }

    /// Replace the contents with a copy of `values`.
    pub fn assign_from_slice(&mut self, values: &[T]) -> Result<()> {
        if values.len() > self.capacity() {
            self.set_capacity(values.len())?;
        }
        self.elements_mut_to(values.len()).copy_from_slice(values);
        self.len = values.len();
        self.set_dirty();
        Ok(())
    }

    /// Ensure room for exactly `additional` more elements.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let required = self.required(additional)?;
        if required > self.capacity() {
            self.set_capacity(required)?;
        }
        Ok(())
    }

    /// Shrink the block to exactly `len` elements, freeing it when empty.
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        if self.capacity() > self.len {
            self.set_capacity(self.len)?;
        }
        Ok(())
    }

    /// Exchange contents and storage with `other`. Both become dirty.
    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
        self.set_dirty();
        other.set_dirty();
    }

    /// Give the backing block a fresh identity; contents are untouched.
    ///
    /// Does nothing when no storage is allocated.
    pub fn rename(&mut self) -> Result<()> {
        match &mut self.block {
            Some(block) => self.alloc.rename(block),
            None => Ok(()),
        }
    }

    fn required(&self, additional: usize) -> Result<usize> {
        self.len
            .checked_add(additional)
            .ok_or_else(|| Error::Allocation("capacity overflow".into()))
    }

    fn reserve_amortized(&mut self, additional: usize) -> Result<()> {
        let required = self.required(additional)?;
        let capacity = self.capacity();
        if required > capacity {
            self.set_capacity(grown_capacity(capacity, required))?;
        }
        Ok(())
    }

    /// Move the storage to a block of exactly `capacity` elements.
    fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        let bytes = capacity
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| Error::Allocation("capacity overflow".into()))?;

        self.alloc.reallocate(&mut self.block, bytes)?;
        self.len = self.len.min(capacity);
        self.set_dirty();
        Ok(())
    }

    /// Mutable view of the first `len` storage slots (`len <= capacity`).
    fn elements_mut_to(&mut self, len: usize) -> &mut [T] {
        debug_assert!(len <= self.capacity());
        match &mut self.block {
            Some(block) => block.elements_mut(len),
            None => &mut [],
        }
    }
}

fn bounds<R: RangeBounds<usize>>(range: R, len: usize) -> Result<(usize, usize)> {
    let start = match range.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s.saturating_add(1),
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&e) => e.saturating_add(1),
        Bound::Excluded(&e) => e,
        Bound::Unbounded => len,
    };

    if end > len {
        return Err(Error::OutOfRange { index: end, len });
    }
    if start > end {
        return Err(Error::OutOfRange { index: start, len });
    }
    Ok((start, end))
}

impl<T: Element> Tracked for TrackedBuffer<T> {
    fn block(&self) -> Option<&SharedBlock> {
        self.block.as_ref()
    }

    fn is_dirty(&self) -> bool {
        self.dirty.get(self.block.as_ref())
    }

    fn set_dirty(&self) {
        self.dirty.set(self.block.as_ref(), true);
    }

    fn unset_dirty(&self) {
        self.dirty.set(self.block.as_ref(), false);
    }
}

impl<T: Element, I: SliceIndex<[T]>> Index<I> for TrackedBuffer<T> {
    type Output = I::Output;

    #[inline]
    fn index(&self, index: I) -> &Self::Output {
        &self.as_slice()[index]
    }
}

impl<T: Element, I: SliceIndex<[T]>> IndexMut<I> for TrackedBuffer<T> {
    #[inline]
    fn index_mut(&mut self, index: I) -> &mut Self::Output {
        &mut self.as_mut_slice()[index]
    }
}

impl<'a, T: Element> IntoIterator for &'a TrackedBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: Element + PartialEq> PartialEq for TrackedBuffer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Element + PartialEq> PartialEq<[T]> for TrackedBuffer<T> {
    fn eq(&self, other: &[T]) -> bool {
        self.as_slice() == other
    }
}

impl<T: Element + PartialEq> PartialEq<Vec<T>> for TrackedBuffer<T> {
    fn eq(&self, other: &Vec<T>) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Element + std::fmt::Debug> std::fmt::Debug for TrackedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedBuffer")
            .field("id", &self.block.as_ref().map(SharedBlock::id))
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("dirty", &self.is_dirty())
            .field("elements", &self.as_slice())
            .finish()
    }
}

impl<T: Element> Drop for TrackedBuffer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.alloc.free(self.block.take()) {
            tracing::warn!(error = %e, "failed to free tracked buffer storage");
        }
    }
}
