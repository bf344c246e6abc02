use proptest::prelude::*;
use std::collections::HashSet;

use pim_core::engine::accessor::AffineAccessor;
use pim_core::engine::memory::{BulkMemory, ByteSpace, ScratchpadPool};
use pim_core::engine::partition::{equal_partition, tile_2d, LaneStride};
use pim_core::engine::staging::{stage_in, stage_out};
use pim_core::{Point, Rect};

fn rect2() -> impl Strategy<Value = Rect<2>> {
    (-5i64..5, -5i64..5, -1i64..6, -1i64..6).prop_map(|(r, c, h, w)| {
        Rect::new(Point::new([r, c]), Point::new([r + h - 1, c + w - 1]))
    })
}

proptest! {
    #[test]
    fn iteration_visits_each_point_once(rect in rect2()) {
        let points: Vec<_> = rect.points().collect();
        prop_assert_eq!(points.len() as u64, rect.volume());
        let unique: HashSet<_> = points.iter().copied().collect();
        prop_assert_eq!(unique.len(), points.len());
        prop_assert!(points.iter().all(|p| rect.contains(*p)));
        for (i, p) in points.iter().enumerate() {
            prop_assert_eq!(rect.linearize(*p), i as u64);
            prop_assert_eq!(rect.delinearize(i as u64), *p);
        }
    }

    #[test]
    fn advance_matches_repeated_steps(rect in rect2(), k in 0u64..40) {
        let mut jumped = rect.points();
        jumped.advance(k);
        let mut walked = rect.points();
        for _ in 0..k {
            walked.step();
        }
        prop_assert_eq!(jumped.current(), walked.current());
        prop_assert_eq!(jumped.count(), walked.count());
    }

    #[test]
    fn accessor_reads_back_writes(rect in rect2(), value in any::<i64>(), pick in any::<prop::sample::Index>()) {
        prop_assume!(!rect.is_empty());
        let acc = AffineAccessor::<i64, 2>::dense(rect);
        let mut mem = vec![0u8; rect.volume() as usize * 8];
        let p = rect.delinearize(pick.index(rect.volume() as usize) as u64);
        acc.write(&mut mem, p, value);
        prop_assert_eq!(acc.read(&mem, p), value);
    }

    #[test]
    fn staging_reproduces_the_block(
        data in prop::collection::vec(any::<u32>(), 1..64),
        from in any::<prop::sample::Index>(),
        to in 0i64..64,
    ) {
        let mut bulk = BulkMemory::new(1024).unwrap();
        let acc = AffineAccessor::<u32, 1>::dense(Rect::span(0, 255));
        for (i, v) in data.iter().enumerate() {
            acc.write(&mut bulk, Point::new([i as i64]), *v);
        }
        let start = from.index(data.len());
        let count = data.len() - start;
        let pool = ScratchpadPool::new(256);
        let mut buf = pool.alloc(count * 4).unwrap();
        let scratch = AffineAccessor::<u32, 1>::scratch();
        let dst = Point::new([128 + to]);
        unsafe {
            stage_in(&bulk, &acc, Point::new([start as i64]), &mut buf, &scratch, count * 4).unwrap();
            stage_out(&bulk, &acc, dst, &buf, &scratch, count * 4).unwrap();
        }
        let src_bytes = &bulk.bytes()[start * 4..data.len() * 4];
        let dst_at = (128 + to) as usize * 4;
        prop_assert_eq!(src_bytes, &bulk.bytes()[dst_at..dst_at + count * 4]);
    }

    #[test]
    fn lane_indices_cover_exactly_once(nr_lanes in 1usize..20, len in 0u64..300) {
        let mut seen = vec![0u8; len as usize];
        for lane in 0..nr_lanes {
            let stride = LaneStride::new(lane, nr_lanes).unwrap();
            for i in stride.indices(0..len) {
                seen[i as usize] += 1;
            }
        }
        prop_assert!(seen.iter().all(|c| *c == 1));
    }

    #[test]
    fn lane_blocks_cover_exactly_once(nr_lanes in 1usize..12, len in 0u64..300, block in 1u64..17) {
        let mut seen = vec![0u8; len as usize];
        for lane in 0..nr_lanes {
            let stride = LaneStride::new(lane, nr_lanes).unwrap();
            for range in stride.blocks(0..len, block) {
                prop_assert!(range.end - range.start <= block);
                for i in range {
                    seen[i as usize] += 1;
                }
            }
        }
        prop_assert!(seen.iter().all(|c| *c == 1));
    }

    #[test]
    fn lane_points_cover_exactly_once(rect in rect2(), nr_lanes in 1usize..9) {
        let mut seen = HashSet::new();
        for lane in 0..nr_lanes {
            for p in LaneStride::new(lane, nr_lanes).unwrap().points(&rect) {
                prop_assert!(seen.insert(p));
            }
        }
        prop_assert_eq!(seen.len() as u64, rect.volume());
    }

    #[test]
    fn equal_partition_is_contiguous(lo in -100i64..100, len in 1i64..500, parts in 1usize..17) {
        let rect = Rect::span(lo, lo + len - 1);
        let blocks = equal_partition(&rect, parts);
        prop_assert_eq!(blocks.len(), parts);
        let mut next = lo;
        for b in &blocks {
            if b.is_empty() {
                continue;
            }
            prop_assert_eq!(b.lo[0], next);
            next = b.hi[0] + 1;
        }
        prop_assert_eq!(next, lo + len);
        let sizes: Vec<u64> = blocks.iter().map(Rect::volume).collect();
        let max = sizes.iter().copied().max().unwrap_or(0);
        let min = sizes.iter().copied().min().unwrap_or(0);
        prop_assert!(max - min <= 1);
    }

    #[test]
    fn tiles_cover_exactly_once(rows in 1i64..20, cols in 1i64..20, grid in 1usize..5) {
        let rect = Rect::new(Point::new([0, 0]), Point::new([rows - 1, cols - 1]));
        let mut seen = HashSet::new();
        for tile in tile_2d(&rect, grid) {
            for p in tile.points() {
                prop_assert!(seen.insert(p));
            }
        }
        prop_assert_eq!(seen.len() as u64, rect.volume());
    }
}
