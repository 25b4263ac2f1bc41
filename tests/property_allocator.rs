//! Property-based tests for allocator correctness
//!
//! Drives random allocate/free sequences against a real block file and
//! checks that the allocator's bookkeeping, bitmaps, and segment contents
//! stay consistent.

use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tessera::{BlockFile, FixedSizeAllocator, MetadataWriter, SegmentPointer};

fn open_allocator(segment_size: u64) -> (FixedSizeAllocator, Arc<BlockFile>, NamedTempFile) {
    let temp = NamedTempFile::new().unwrap();
    let file = Arc::new(BlockFile::create(temp.path()).unwrap());
    let allocator = FixedSizeAllocator::new(segment_size, Arc::clone(&file)).unwrap();
    (allocator, file, temp)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_random_ops_keep_invariants(
        segment_size in prop_oneof![1u64..=8, Just(16u64), Just(512u64)],
        ops in prop::collection::vec(any::<u16>(), 1..400),
    ) {
        let (mut allocator, _file, _temp) = open_allocator(segment_size);
        let mut live: Vec<(SegmentPointer, u8)> = Vec::new();
        let mut seen: HashSet<u64> = HashSet::new();

        for op in ops {
            if op % 3 == 2 && !live.is_empty() {
                let idx = (op as usize / 3) % live.len();
                let (ptr, _) = live.swap_remove(idx);
                allocator.free(ptr).unwrap();
                seen.remove(&ptr.to_raw());
            } else {
                let ptr = allocator.allocate().unwrap();
                // a live handle must never be handed out twice
                prop_assert!(seen.insert(ptr.to_raw()), "duplicate handle {:?}", ptr);
                let seed = (op as u8) | 1;
                allocator.get(ptr).unwrap().fill(seed);
                live.push((ptr, seed));
            }
        }

        // live count matches, contents are intact, bitmaps agree
        prop_assert_eq!(allocator.total_segment_count(), live.len() as u64);
        for (ptr, seed) in &live {
            prop_assert!(allocator.get(*ptr).unwrap().iter().all(|&b| b == *seed));
        }
        allocator.check_integrity().unwrap();

        // the free-space set holds exactly the non-full buffer ids
        let avail = allocator.segments_per_buffer();
        let free_set: HashSet<u64> = allocator.buffers_with_free_space().collect();
        for id in allocator.buffer_ids().collect::<Vec<_>>() {
            let count = allocator.buffer_segment_count(id).unwrap();
            prop_assert_eq!(free_set.contains(&id), count < avail);
        }
    }

    #[test]
    fn prop_allocate_free_round_trips(
        segment_size in 1u64..512,
        warmup in 0usize..50,
    ) {
        let (mut allocator, _file, _temp) = open_allocator(segment_size);
        for _ in 0..warmup {
            allocator.allocate().unwrap();
        }
        let before = allocator.total_segment_count();

        let ptr = allocator.allocate().unwrap();
        allocator.free(ptr).unwrap();

        prop_assert_eq!(allocator.total_segment_count(), before);
        allocator.check_integrity().unwrap();
    }

    #[test]
    fn prop_serialize_round_trips(
        segment_size in prop_oneof![Just(8u64), Just(24u64), Just(4096u64)],
        ops in prop::collection::vec(any::<u16>(), 1..200),
    ) {
        let (mut allocator, file, _temp) = open_allocator(segment_size);
        let mut live: Vec<(SegmentPointer, u8)> = Vec::new();
        let mut per_buffer: HashMap<u64, u64> = HashMap::new();

        for op in ops {
            if op % 3 == 2 {
                // only free from buffers that keep at least one live
                // segment; empty buffers cannot be serialized
                let candidates: Vec<usize> = live
                    .iter()
                    .enumerate()
                    .filter(|(_, (ptr, _))| per_buffer[&ptr.buffer_id()] > 1)
                    .map(|(i, _)| i)
                    .collect();
                if let Some(&idx) = candidates.get(op as usize % candidates.len().max(1)) {
                    let (ptr, _) = live.swap_remove(idx);
                    allocator.free(ptr).unwrap();
                    *per_buffer.get_mut(&ptr.buffer_id()).unwrap() -= 1;
                    continue;
                }
            }
            let ptr = allocator.allocate().unwrap();
            let seed = (op as u8) | 1;
            allocator.get(ptr).unwrap().fill(seed);
            *per_buffer.entry(ptr.buffer_id()).or_insert(0) += 1;
            live.push((ptr, seed));
        }

        let mut writer = MetadataWriter::new(Arc::clone(&file));
        let directory = allocator.serialize(&mut writer).unwrap();
        writer.flush().unwrap();

        let mut restored = FixedSizeAllocator::deserialize(Arc::clone(&file), directory).unwrap();
        prop_assert_eq!(restored.segment_size(), allocator.segment_size());
        prop_assert_eq!(restored.total_segment_count(), allocator.total_segment_count());
        prop_assert_eq!(
            restored.buffers_with_free_space().collect::<Vec<_>>(),
            allocator.buffers_with_free_space().collect::<Vec<_>>()
        );
        for id in allocator.buffer_ids().collect::<Vec<_>>() {
            prop_assert_eq!(
                restored.buffer_segment_count(id),
                allocator.buffer_segment_count(id)
            );
        }
        for (ptr, seed) in &live {
            prop_assert!(restored.get(*ptr).unwrap().iter().all(|&b| b == *seed));
        }
        restored.check_integrity().unwrap();
    }

    #[test]
    fn prop_vacuum_preserves_live_segments(
        buffer_count in 2u64..5,
        keep_stride in 2u64..16,
    ) {
        let (mut allocator, _file, _temp) = open_allocator(4096);
        let avail = allocator.segments_per_buffer();

        let pointers: Vec<_> = (0..buffer_count * avail)
            .map(|_| allocator.allocate().unwrap())
            .collect();
        let mut live = HashMap::new();
        for (i, ptr) in pointers.into_iter().enumerate() {
            if i as u64 % keep_stride == 0 {
                let seed = (i as u8).wrapping_mul(29) | 1;
                allocator.get(ptr).unwrap().fill(seed);
                live.insert(ptr, seed);
            } else {
                allocator.free(ptr).unwrap();
            }
        }

        let buffers_before = allocator.buffer_count();
        let total_before = allocator.total_segment_count();

        if allocator.initialize_vacuum() {
            let mut rewritten = HashMap::new();
            for (ptr, seed) in live {
                if allocator.needs_vacuum(ptr) {
                    rewritten.insert(allocator.vacuum_pointer(ptr).unwrap(), seed);
                } else {
                    rewritten.insert(ptr, seed);
                }
            }
            allocator.finalize_vacuum();
            live = rewritten;
        }

        prop_assert!(allocator.buffer_count() <= buffers_before);
        prop_assert_eq!(allocator.total_segment_count(), total_before);
        for (ptr, seed) in &live {
            prop_assert!(allocator.get(*ptr).unwrap().iter().all(|&b| b == *seed));
        }
        allocator.check_integrity().unwrap();
    }
}
