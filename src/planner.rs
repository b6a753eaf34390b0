// src/planner.rs

use crate::models::ChunkRange;

/// Splits `[0, total)` into at most `threads` contiguous inclusive ranges.
///
/// Every range but the last has `total / threads` bytes; the last one absorbs
/// the remainder. A resource smaller than the thread count gets one range per
/// byte, and an empty resource gets no ranges at all.
pub fn plan_chunks(total: u64, threads: usize) -> Vec<ChunkRange> {
    if total == 0 {
        return Vec::new();
    }
    let count = (threads.max(1) as u64).min(total);
    let chunk_size = total / count;

    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = if i == count - 1 { total - 1 } else { start + chunk_size - 1 };
            ChunkRange {
                index: i as usize,
                start,
                end,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(ranges: &[ChunkRange], total: u64) {
        assert_eq!(ranges.first().map(|r| r.start), Some(0));
        assert_eq!(ranges.last().map(|r| r.end), Some(total - 1));
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start, "gap or overlap in {pair:?}");
        }
        assert_eq!(ranges.iter().map(ChunkRange::len).sum::<u64>(), total);
        for (i, r) in ranges.iter().enumerate() {
            assert_eq!(r.index, i);
        }
    }

    #[test]
    fn ten_megabytes_in_four_chunks() {
        let total = 10 * 1024 * 1024;
        let ranges = plan_chunks(total, 4);
        assert_eq!(ranges.len(), 4);
        assert!(ranges.iter().all(|r| r.len() == 2_621_440));
        assert_covers(&ranges, total);
    }

    #[test]
    fn last_chunk_absorbs_remainder() {
        let ranges = plan_chunks(10, 3);
        let lens: Vec<u64> = ranges.iter().map(ChunkRange::len).collect();
        assert_eq!(lens, vec![3, 3, 4]);
        assert_covers(&ranges, 10);
    }

    #[test]
    fn tiny_resource_caps_chunk_count() {
        let ranges = plan_chunks(2, 8);
        assert_eq!(ranges.len(), 2);
        assert_covers(&ranges, 2);
    }

    #[test]
    fn empty_resource_has_no_chunks() {
        assert!(plan_chunks(0, 4).is_empty());
    }

    #[test]
    fn many_shapes_cover_exactly() {
        for total in [1u64, 7, 100, 4097, 1_000_003] {
            for threads in 1..=9 {
                assert_covers(&plan_chunks(total, threads), total);
            }
        }
    }
}
