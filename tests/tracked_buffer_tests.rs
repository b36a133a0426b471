//! Integration tests for change-tracking buffers.
//!
//! These tests drive buffers through long operation sequences and compare
//! them against `Vec`, and check that the dirty flag is visible to a second
//! mapping of the same block, as the resource manager would see it.

use coral_runtime::buffer::{Tracked, TrackedBitBuffer, TrackedBuffer};
use coral_runtime::memory::SharedBlockAllocator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn allocator() -> (tempfile::TempDir, SharedBlockAllocator) {
    let dir = tempfile::tempdir().unwrap();
    let alloc = SharedBlockAllocator::in_dir(dir.path().join("inaccel")).unwrap();
    (dir, alloc)
}

// ============================================================================
// Reference Model Tests
// ============================================================================

/// Random push/insert/remove/pop/write sequences match `Vec`.
#[test]
fn test_matches_vec_reference() {
    let (_dir, alloc) = allocator();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut buffer = TrackedBuffer::<u32>::new_in(&alloc);
    let mut model: Vec<u32> = Vec::new();

    for step in 0..5000 {
        let value: u32 = rng.random();
        match rng.random_range(0..6) {
            0 | 1 => {
                buffer.push(value).unwrap();
                model.push(value);
            }
            2 => {
                let index = rng.random_range(0..=model.len());
                buffer.insert(index, value).unwrap();
                model.insert(index, value);
            }
            3 if !model.is_empty() => {
                let index = rng.random_range(0..model.len());
                assert_eq!(buffer.remove(index).unwrap(), model.remove(index));
            }
            4 => assert_eq!(buffer.pop(), model.pop()),
            5 if !model.is_empty() => {
                let index = rng.random_range(0..model.len());
                buffer[index] = value;
                model[index] = value;
            }
            _ => {}
        }

        assert_eq!(buffer.len(), model.len(), "length diverged at step {step}");
    }

    assert_eq!(buffer, model);
    assert!(buffer.capacity() >= buffer.len());
}

/// Bulk operations match `Vec` as well.
#[test]
fn test_bulk_operations_match_vec() {
    let (_dir, alloc) = allocator();
    let mut buffer = TrackedBuffer::from_slice_in(&[1i64, 2, 3], &alloc).unwrap();
    let mut model = vec![1i64, 2, 3];

    buffer.extend_from_slice(&[4, 5, 6, 7]).unwrap();
    model.extend_from_slice(&[4, 5, 6, 7]);
    assert_eq!(buffer, model);

    buffer.erase(1..4).unwrap();
    model.drain(1..4);
    assert_eq!(buffer, model);

    buffer.resize(10, -1).unwrap();
    model.resize(10, -1);
    assert_eq!(buffer, model);

    buffer.truncate(2);
    model.truncate(2);
    assert_eq!(buffer, model);

    buffer.assign_from_slice(&[9; 20]).unwrap();
    assert_eq!(buffer, vec![9; 20]);
}

/// Random bit writes never disturb neighbouring bits.
#[test]
fn test_bit_writes_are_isolated() {
    let (_dir, alloc) = allocator();
    let mut rng = StdRng::seed_from_u64(42);
    let mut bits = TrackedBitBuffer::from_elem_in(false, 300, &alloc).unwrap();
    let mut model = vec![false; 300];

    for _ in 0..2000 {
        let index = rng.random_range(0..300);
        let value = rng.random_bool(0.5);
        bits.bit(index).unwrap().set(value);
        model[index] = value;

        assert_eq!(bits.get(index), Some(value));
    }

    assert!(bits.iter().eq(model.iter().copied()));
    assert_eq!(bits.count_ones(), model.iter().filter(|b| **b).count());
}

/// Random push/insert/remove/pop/flip sequences match `Vec<bool>`, and bits
/// shifted past the end never linger in the words.
#[test]
fn test_bits_match_vec_reference() {
    let (_dir, alloc) = allocator();
    let mut rng = StdRng::seed_from_u64(0xb175);
    let mut bits = TrackedBitBuffer::new_in(&alloc);
    let mut model: Vec<bool> = Vec::new();

    for step in 0..4000 {
        let value = rng.random_bool(0.5);
        match rng.random_range(0..6) {
            0 | 1 => {
                bits.push(value).unwrap();
                model.push(value);
            }
            2 => {
                let index = rng.random_range(0..=model.len());
                bits.insert(index, value).unwrap();
                model.insert(index, value);
            }
            3 if !model.is_empty() => {
                let index = rng.random_range(0..model.len());
                assert_eq!(bits.remove(index).unwrap(), model.remove(index));
            }
            4 => assert_eq!(bits.pop(), model.pop()),
            5 if !model.is_empty() => {
                let index = rng.random_range(0..model.len());
                assert_eq!(bits.flip(index).unwrap(), !model[index]);
                model[index] = !model[index];
            }
            _ => {}
        }

        assert_eq!(bits.len(), model.len(), "length diverged at step {step}");
        assert_eq!(
            bits.count_ones(),
            model.iter().filter(|b| **b).count(),
            "stale bits past the end at step {step}"
        );
    }

    assert!(bits.iter().eq(model.iter().copied()));
}

/// Setting a bit at a word boundary leaves the adjacent words untouched.
#[test]
fn test_bit_word_boundaries() {
    let (_dir, alloc) = allocator();
    let mut bits = TrackedBitBuffer::from_elem_in(false, 192, &alloc).unwrap();

    for index in [63, 64, 127, 128] {
        bits.set(index, true).unwrap();
    }
    assert_eq!(bits.words(), &[1 << 63, 1 | (1 << 63), 1]);

    bits.set(64, false).unwrap();
    assert_eq!(bits.words(), &[1 << 63, 1 << 63, 1]);
}

// ============================================================================
// Dirty Flag Tests
// ============================================================================

/// Writing back the value already stored still counts as a modification.
#[test]
fn test_no_op_write_sets_dirty() {
    let (_dir, alloc) = allocator();
    let mut buffer = TrackedBuffer::from_elem_in(3.5f32, 16, &alloc).unwrap();
    buffer.unset_dirty();

    let current = buffer[7];
    buffer[7] = current;
    assert!(buffer.is_dirty());
}

/// Clean stays clean without mutation; one mutation flips it back.
#[test]
fn test_clean_until_mutated() {
    let (_dir, alloc) = allocator();
    let mut buffer = TrackedBuffer::from_elem_in(0u8, 64, &alloc).unwrap();
    buffer.unset_dirty();

    for _ in 0..3 {
        let _ = buffer.iter().count();
        let _ = buffer.as_slice();
        assert!(!buffer.is_dirty());
    }

    buffer[0] += 1;
    assert!(buffer.is_dirty());
}

/// A second mapping of the block observes the dirty byte and the payload.
#[test]
fn test_peer_mapping_sees_dirty_and_payload() {
    let (_dir, alloc) = allocator();
    let mut buffer = TrackedBuffer::from_elem_in(0u32, 8, &alloc).unwrap();
    buffer.unset_dirty();

    let peer = alloc.open(&buffer.identity()).unwrap();
    assert!(!peer.is_owner());
    assert!(!peer.header().is_dirty());

    buffer[2] = 0xdead_beef;
    assert!(peer.header().is_dirty());
    assert_eq!(&peer.payload()[8..12], &0xdead_beef_u32.to_ne_bytes());
}

/// Bytes written by the peer are visible through the buffer.
#[test]
fn test_peer_writes_are_visible() {
    let (_dir, alloc) = allocator();
    let buffer = TrackedBuffer::from_elem_in(0u16, 4, &alloc).unwrap();

    let mut peer = alloc.open(&buffer.identity()).unwrap();
    peer.payload_mut()[..2].copy_from_slice(&7u16.to_ne_bytes());
    assert_eq!(buffer[0], 7);
}

/// Growth keeps the identity the peer already knows.
#[test]
fn test_growth_preserves_identity_and_dirty() {
    let (_dir, alloc) = allocator();
    let mut buffer = TrackedBuffer::from_elem_in(1u64, 2, &alloc).unwrap();
    let id = buffer.identity();

    buffer.unset_dirty();
    buffer.reserve(100_000).unwrap();
    assert_eq!(buffer.identity(), id);
    assert!(buffer.is_dirty());
}
