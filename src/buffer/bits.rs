//! Bit-packed change-tracking buffer.

use super::{DirtyState, Tracked, grown_capacity};
use crate::error::{Error, Result};
use crate::memory::{SharedBlock, SharedBlockAllocator};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU8, Ordering};

const WORD_BITS: usize = u64::BITS as usize;

#[inline]
fn word_count(bits: usize) -> usize {
    bits.div_ceil(WORD_BITS)
}

#[inline]
fn locate(index: usize) -> (usize, u64) {
    (index / WORD_BITS, 1u64 << (index % WORD_BITS))
}

/// Read/write handle to one bit of a [`TrackedBitBuffer`].
///
/// Writing through the handle changes exactly one bit of the owning word
/// and sets the buffer's dirty byte. Handles compare by boolean value.
pub struct BitRef<'a> {
    word: &'a mut u64,
    mask: u64,
    dirty: &'a AtomicU8,
}

impl BitRef<'_> {
    /// Current value of the bit.
    #[inline]
    pub fn get(&self) -> bool {
        *self.word & self.mask != 0
    }

    /// Write the bit and mark the buffer dirty.
    #[inline]
    pub fn set(&mut self, value: bool) {
        if value {
            *self.word |= self.mask;
        } else {
            *self.word &= !self.mask;
        }
        self.dirty.store(1, Ordering::Release);
    }

    /// Invert the bit, mark the buffer dirty, and return the new value.
    #[inline]
    pub fn flip(&mut self) -> bool {
        *self.word ^= self.mask;
        self.dirty.store(1, Ordering::Release);
        self.get()
    }
}

impl PartialEq for BitRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Eq for BitRef<'_> {}

impl PartialEq<bool> for BitRef<'_> {
    fn eq(&self, other: &bool) -> bool {
        self.get() == *other
    }
}

impl PartialOrd for BitRef<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for BitRef<'_> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.get().cmp(&other.get())
    }
}

impl PartialOrd<bool> for BitRef<'_> {
    fn partial_cmp(&self, other: &bool) -> Option<CmpOrdering> {
        Some(self.get().cmp(other))
    }
}

impl std::fmt::Debug for BitRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.get().fmt(f)
    }
}

/// A growable sequence of booleans packed into 64-bit words.
///
/// Storage, growth and dirty tracking follow [`TrackedBuffer`](super::TrackedBuffer).
/// Bits past `len` are kept zero so the remote side can read whole words.
///
/// # Example
///
/// ```rust,ignore
/// let mut mask = TrackedBitBuffer::from_elem_in(false, 100, &alloc)?;
/// mask.unset_dirty();
///
/// if let Some(mut bit) = mask.bit(42) {
///     bit.set(true);
/// }
/// assert!(mask.is_dirty());
/// assert_eq!(mask.count_ones(), 1);
/// ```
pub struct TrackedBitBuffer {
    alloc: SharedBlockAllocator,
    block: Option<SharedBlock>,
    len: usize,
    dirty: DirtyState,
}

impl TrackedBitBuffer {
    /// Create an empty buffer without storage.
    pub fn new_in(alloc: &SharedBlockAllocator) -> Self {
        Self {
            alloc: alloc.clone(),
            block: None,
            len: 0,
            dirty: DirtyState::new(true),
        }
    }

    /// Create an empty buffer with room for at least `bits` bits.
    pub fn with_capacity_in(bits: usize, alloc: &SharedBlockAllocator) -> Result<Self> {
        let mut buffer = Self::new_in(alloc);
        buffer.set_word_capacity(word_count(bits))?;
        Ok(buffer)
    }

    /// Create a buffer of `n` copies of `value`.
    pub fn from_elem_in(value: bool, n: usize, alloc: &SharedBlockAllocator) -> Result<Self> {
        let mut buffer = Self::with_capacity_in(n, alloc)?;
        buffer.resize(n, value)?;
        Ok(buffer)
    }

    /// Create a buffer holding a copy of `values`.
    pub fn from_slice_in(values: &[bool], alloc: &SharedBlockAllocator) -> Result<Self> {
        Self::from_iter_in(values.iter().copied(), alloc)
    }

    /// Create a buffer from the items of an iterator.
    pub fn from_iter_in<I>(iter: I, alloc: &SharedBlockAllocator) -> Result<Self>
    where
        I: IntoIterator<Item = bool>,
    {
        let iter = iter.into_iter();
        let mut buffer = Self::with_capacity_in(iter.size_hint().0, alloc)?;
        for value in iter {
            buffer.push(value)?;
        }
        Ok(buffer)
    }

    /// Copy the buffer into a new block.
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::with_capacity_in(self.len, &self.alloc)?;
        let words = word_count(self.len);
        copy.words_mut_to(words).copy_from_slice(self.words());
        copy.len = self.len;
        copy.set_dirty();
        Ok(copy)
    }

    /// Move the contents out, leaving this buffer empty with its dirty state.
    pub fn take(&mut self) -> Self {
        let empty = Self {
            alloc: self.alloc.clone(),
            block: None,
            len: 0,
            dirty: DirtyState::new(self.is_dirty()),
        };
        std::mem::replace(self, empty)
    }

    /// Number of bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer holds no bits.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of bits the current block can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.word_capacity() * WORD_BITS
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

    /// Mark the contents as transmitted. Reserved for the protocol layer.
    #[inline]
    pub fn unset_dirty(&self) {
        self.dirty.set(self.block.as_ref(), false);
    }

    /// The packed words covering `len` bits.
    pub fn words(&self) -> &[u64] {
        match &self.block {
            Some(block) => block.elements(word_count(self.len)),
            None => &[],
        }
    }

    /// Value of bit `index`, or `None` if out of range.
    #[inline]
    pub fn get(&self, index: usize) -> Option<bool> {
        (index < self.len).then(|| self.read(index))
    }

    /// Checked bit read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index >= len`.
    pub fn at(&self, index: usize) -> Result<bool> {
        let len = self.len;
        self.get(index).ok_or(Error::OutOfRange { index, len })
    }

    /// Read/write handle to bit `index`, or `None` if out of range.
    ///
    /// Obtaining the handle does not mark the buffer dirty; writing through it does.
    pub fn bit(&mut self, index: usize) -> Option<BitRef<'_>> {
        if index >= self.len {
            return None;
        }

        let (word, mask) = locate(index);
        let words = word_count(self.len);
        let block = self.block.as_mut()?;
        let (dirty, elems) = block.split_elements_mut::<u64>(words);
        Some(BitRef {
            word: &mut elems[word],
            mask,
            dirty,
        })
    }

    /// Write bit `index`.
    pub fn set(&mut self, index: usize, value: bool) -> Result<()> {
        self.check(index)?;
        self.write(index, value);
        self.set_dirty();
        Ok(())
    }

    /// Invert bit `index` and return its new value.
    pub fn flip(&mut self, index: usize) -> Result<bool> {
        self.check(index)?;
        let value = !self.read(index);
        self.write(index, value);
        self.set_dirty();
        Ok(value)
    }

    /// First bit.
    pub fn first(&self) -> Option<bool> {
        self.get(0)
    }

    /// Last bit.
    pub fn last(&self) -> Option<bool> {
        self.len.checked_sub(1).map(|i| self.read(i))
    }

    /// Iterate over the bits.
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(move |i| self.read(i))
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words().iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Append a bit.
    pub fn push(&mut self, value: bool) -> Result<()> {
        self.reserve_amortized(1)?;
        let index = self.len;
        self.len += 1;
        self.write(index, value);
        self.set_dirty();
        Ok(())
    }

    /// Remove and return the last bit.
    pub fn pop(&mut self) -> Option<bool> {
        let value = self.last()?;
        self.write(self.len - 1, false);
        self.len -= 1;
        self.set_dirty();
        Some(value)
    }

    /// Insert a bit at `index`, shifting later bits up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index > len`.
    pub fn insert(&mut self, index: usize, value: bool) -> Result<()> {
        let len = self.len;
        if index > len {
            return Err(Error::OutOfRange { index, len });
        }

        self.reserve_amortized(1)?;
        self.len = len + 1;
        for i in (index..len).rev() {
            let bit = self.read(i);
            self.write(i + 1, bit);
        }
        self.write(index, value);
        self.set_dirty();
        Ok(())
    }

    /// Remove and return bit `index`, shifting later bits down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index >= len`.
    pub fn remove(&mut self, index: usize) -> Result<bool> {
        self.check(index)?;

        let value = self.read(index);
        for i in index + 1..self.len {
            let bit = self.read(i);
            self.write(i - 1, bit);
        }
        self.write(self.len - 1, false);
        self.len -= 1;
        self.set_dirty();
        Ok(value)
    }

    /// Shorten to `len` bits. Capacity is unchanged.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.clear_from(len);
            self.len = len;
        }
        self.set_dirty();
    }

    /// Remove all bits. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Resize to `new_len` bits, filling new positions with `value`.
    pub fn resize(&mut self, new_len: usize, value: bool) -> Result<()> {
        let len = self.len;
        if new_len > len {
            self.reserve_amortized(new_len - len)?;
            self.len = new_len;
            if value {
                for i in len..new_len {
                    self.write(i, true);
                }
            }
            self.set_dirty();
        } else {
            self.truncate(new_len);
        }
        Ok(())
    }

    /// Ensure room for `additional` more bits, rounded up to whole words.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let required = word_count(self.required(additional)?);
        if required > self.word_capacity() {
            self.set_word_capacity(required)?;
        }
        Ok(())
    }

    /// Shrink the block to the words covering `len`, freeing it when empty.
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        let required = word_count(self.len);
        if self.word_capacity() > required {
            self.set_word_capacity(required)?;
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
    pub fn rename(&mut self) -> Result<()> {
        match &mut self.block {
            Some(block) => self.alloc.rename(block),
            None => Ok(()),
        }
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.len {
            return Err(Error::OutOfRange {
                index,
                len: self.len,
            });
        }
        Ok(())
    }

    fn word_capacity(&self) -> usize {
        self.block
            .as_ref()
            .map_or(0, |b| b.len() / std::mem::size_of::<u64>())
    }

    fn required(&self, additional: usize) -> Result<usize> {
        self.len
            .checked_add(additional)
            .ok_or_else(|| Error::Allocation("capacity overflow".into()))
    }

    fn reserve_amortized(&mut self, additional: usize) -> Result<()> {
        let required = word_count(self.required(additional)?);
        let capacity = self.word_capacity();
        if required > capacity {
            self.set_word_capacity(grown_capacity(capacity, required))?;
        }
        Ok(())
    }

    fn set_word_capacity(&mut self, words: usize) -> Result<()> {
        let bytes = words
            .checked_mul(std::mem::size_of::<u64>())
            .ok_or_else(|| Error::Allocation("capacity overflow".into()))?;

        self.alloc.reallocate(&mut self.block, bytes)?;
        self.len = self.len.min(words * WORD_BITS);
        self.set_dirty();
        Ok(())
    }

    fn words_mut_to(&mut self, words: usize) -> &mut [u64] {
        match &mut self.block {
            Some(block) => block.elements_mut(words),
            None => &mut [],
        }
    }

    /// Read bit `index` (`index < len`).
    fn read(&self, index: usize) -> bool {
        let (word, mask) = locate(index);
        self.words()[word] & mask != 0
    }

    /// Write bit `index` (`index < len`) without touching the dirty flag.
    fn write(&mut self, index: usize, value: bool) {
        let (word, mask) = locate(index);
        let words = self.words_mut_to(word_count(self.len));
        if value {
            words[word] |= mask;
        } else {
            words[word] &= !mask;
        }
    }

    /// Zero bits `from..len`.
    fn clear_from(&mut self, from: usize) {
        let words = self.words_mut_to(word_count(self.len));
        let mut start = from / WORD_BITS;
        let offset = from % WORD_BITS;
        if offset != 0 {
            words[start] &= (1u64 << offset) - 1;
            start += 1;
        }
        if start < words.len() {
            words[start..].fill(0);
        }
    }
}

impl Tracked for TrackedBitBuffer {
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

impl PartialEq for TrackedBitBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.words() == other.words()
    }
}

impl std::fmt::Debug for TrackedBitBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits: String = self.iter().map(|b| if b { '1' } else { '0' }).collect();
        f.debug_struct("TrackedBitBuffer")
            .field("id", &self.block.as_ref().map(SharedBlock::id))
            .field("len", &self.len)
            .field("dirty", &self.is_dirty())
            .field("bits", &bits)
            .finish()
    }
}

impl Drop for TrackedBitBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.alloc.free(self.block.take()) {
            tracing::warn!(error = %e, "failed to free tracked bit buffer storage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> (tempfile::TempDir, SharedBlockAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SharedBlockAllocator::in_dir(dir.path()).unwrap();
        (dir, alloc)
    }

    #[test]
    fn test_push_and_read() {
        let (_dir, alloc) = allocator();
        let mut bits = TrackedBitBuffer::new_in(&alloc);
        for i in 0..130 {
            bits.push(i % 3 == 0).unwrap();
        }

        assert_eq!(bits.len(), 130);
        assert_eq!(bits.words().len(), 3);
        for i in 0..130 {
            assert_eq!(bits.get(i), Some(i % 3 == 0), "bit {i}");
        }
        assert_eq!(bits.get(130), None);
        assert_eq!(bits.count_ones(), (0..130).filter(|i| i % 3 == 0).count());
    }

    #[test]
    fn test_bit_ref_writes_one_bit_and_flags_dirty() {
        let (_dir, alloc) = allocator();
        let mut bits = TrackedBitBuffer::from_elem_in(true, 128, &alloc).unwrap();
        bits.unset_dirty();

        {
            let bit = bits.bit(64).unwrap();
            assert!(bit == true);
        }
        assert!(!bits.is_dirty());

        bits.bit(64).unwrap().set(false);
        assert!(bits.is_dirty());
        assert_eq!(bits.words(), &[u64::MAX, u64::MAX - 1]);
    }

    #[test]
    fn test_bit_ref_flip_and_compare() {
        let (_dir, alloc) = allocator();
        let mut bits = TrackedBitBuffer::from_slice_in(&[false, true], &alloc).unwrap();

        let mut bit = bits.bit(0).unwrap();
        assert!(bit < true);
        assert!(bit.flip());
        assert!(bit == true);
        assert_eq!(bits.first(), Some(true));
    }

    #[test]
    fn test_insert_remove_shift() {
        let (_dir, alloc) = allocator();
        let mut bits = TrackedBitBuffer::from_elem_in(false, 70, &alloc).unwrap();
        bits.set(69, true).unwrap();

        bits.insert(0, true).unwrap();
        assert_eq!(bits.len(), 71);
        assert_eq!(bits.get(0), Some(true));
        assert_eq!(bits.get(70), Some(true));
        assert_eq!(bits.count_ones(), 2);

        assert_eq!(bits.remove(0).unwrap(), true);
        assert_eq!(bits.get(69), Some(true));
        assert_eq!(bits.count_ones(), 1);
    }

    #[test]
    fn test_truncate_zeroes_tail() {
        let (_dir, alloc) = allocator();
        let mut bits = TrackedBitBuffer::from_elem_in(true, 100, &alloc).unwrap();
        bits.truncate(65);
        assert_eq!(bits.count_ones(), 65);

        bits.resize(100, false).unwrap();
        assert_eq!(bits.count_ones(), 65);
        assert_eq!(bits.get(80), Some(false));
    }

    #[test]
    fn test_pop_and_out_of_range() {
        let (_dir, alloc) = allocator();
        let mut bits = TrackedBitBuffer::from_slice_in(&[true, false, true], &alloc).unwrap();
        assert_eq!(bits.pop(), Some(true));
        assert_eq!(bits.count_ones(), 1);
        assert!(matches!(bits.at(2), Err(Error::OutOfRange { index: 2, len: 2 })));
        assert!(bits.set(2, true).is_err());
        assert!(bits.bit(2).is_none());
    }

    #[test]
    fn test_mutations_set_dirty() {
        let (_dir, alloc) = allocator();
        let mut bits = TrackedBitBuffer::from_elem_in(false, 10, &alloc).unwrap();

        let ops: [(&str, fn(&mut TrackedBitBuffer)); 11] = [
            ("set", |b| b.set(1, false).unwrap()),
            ("flip", |b| {
                let _ = b.flip(1).unwrap();
            }),
            ("push", |b| b.push(true).unwrap()),
            ("pop", |b| {
                let _ = b.pop();
            }),
            ("insert", |b| b.insert(3, true).unwrap()),
            ("remove", |b| {
                let _ = b.remove(3).unwrap();
            }),
            ("resize", |b| b.resize(200, true).unwrap()),
            ("truncate", |b| b.truncate(5)),
            ("reserve", |b| b.reserve(1000).unwrap()),
            ("shrink_to_fit", |b| b.shrink_to_fit().unwrap()),
            ("clear", |b| b.clear()),
        ];

        for (name, op) in ops {
            bits.unset_dirty();
            op(&mut bits);
            assert!(bits.is_dirty(), "{name} did not set dirty");
        }
    }

    #[test]
    fn test_clone_and_take() {
        let (_dir, alloc) = allocator();
        let mut bits = TrackedBitBuffer::from_iter_in((0..200).map(|i| i % 7 == 0), &alloc).unwrap();
        let copy = bits.try_clone().unwrap();
        assert_eq!(copy, bits);

        let moved = bits.take();
        assert_eq!(moved, copy);
        assert!(bits.is_empty());
        assert!(bits.block().is_none());
    }
}
