// Work partitioning across lanes and across execution nodes
use bitvec::prelude::*;
use std::ops::Range;

use crate::engine::geometry::{Coord, Point, PointInRectIterator, Rect};
use crate::error::{PimError, Result};

/// Stride-by-lane-count partition: lane `L` of `NR` owns positions
/// `L, L + NR, L + 2·NR, …` of whatever sequence it is applied to.
///
/// Every position belongs to exactly one lane; when the length is not a
/// multiple of `NR` the leftover positions fall to the lowest lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneStride {
    lane: usize,
    nr_lanes: usize,
}

impl LaneStride {
    pub fn new(lane: usize, nr_lanes: usize) -> Result<Self> {
        if nr_lanes == 0 || lane >= nr_lanes {
            return Err(PimError::InvalidConfig(format!(
                "lane {lane} does not exist among {nr_lanes} lanes"
            )));
        }
        Ok(Self { lane, nr_lanes })
    }

    pub fn lane(&self) -> usize {
        self.lane
    }

    pub fn nr_lanes(&self) -> usize {
        self.nr_lanes
    }

    /// Indices of `range` owned by this lane.
    pub fn indices(&self, range: Range<u64>) -> impl Iterator<Item = u64> {
        let start = range.start.saturating_add(self.lane as u64).min(range.end);
        (start..range.end).step_by(self.nr_lanes)
    }

    /// Blocks of `block` consecutive indices owned by this lane; the final
    /// block of the range is clipped.
    pub fn blocks(&self, range: Range<u64>, block: u64) -> impl Iterator<Item = Range<u64>> {
        let block = block.max(1);
        let end = range.end;
        let first = range
            .start
            .saturating_add(self.lane as u64 * block)
            .min(end);
        (first..end)
            .step_by((self.nr_lanes as u64 * block) as usize)
            .map(move |start| start..(start + block).min(end))
    }

    /// The same block partition expressed over a 1-D rectangle.
    pub fn rect_blocks(&self, rect: &Rect<1>, block: u64) -> impl Iterator<Item = Rect<1>> {
        let lo = rect.lo[0];
        let range = 0..rect.volume();
        self.blocks(range, block)
            .map(move |b| Rect::span(lo + b.start as Coord, lo + b.end as Coord - 1))
    }

    /// Points of `rect` owned by this lane, in row-major order.
    pub fn points<const N: usize>(&self, rect: &Rect<N>) -> StridedPoints<N> {
        let mut cursor = rect.points();
        cursor.advance(self.lane as u64);
        StridedPoints {
            cursor,
            stride: self.nr_lanes as u64,
        }
    }
}

/// Iterator over one lane's share of a rectangle.
#[derive(Debug, Clone)]
pub struct StridedPoints<const N: usize> {
    cursor: PointInRectIterator<N>,
    stride: u64,
}

impl<const N: usize> StridedPoints<N> {
    /// Row-major rank of the next point inside the rectangle.
    pub fn position(&self) -> u64 {
        self.cursor.position()
    }
}

impl<const N: usize> Iterator for StridedPoints<N> {
    type Item = Point<N>;

    fn next(&mut self) -> Option<Point<N>> {
        let p = self.cursor.current()?;
        self.cursor.advance(self.stride);
        Some(p)
    }
}

/// Split `0..len` into `parts` contiguous ranges. The first `len % parts`
/// ranges get one extra element.
pub fn equal_split(len: u64, parts: usize) -> Vec<Range<u64>> {
    let parts = parts.max(1) as u64;
    let base = len / parts;
    let extra = len % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let size = base + u64::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Equal block partition of a 1-D index space, one block per node.
pub fn equal_partition(rect: &Rect<1>, parts: usize) -> Vec<Rect<1>> {
    let lo = rect.lo[0];
    equal_split(rect.volume(), parts)
        .into_iter()
        .map(|r| Rect::span(lo + r.start as Coord, lo + r.end as Coord - 1))
        .collect()
}

/// Block coordinates `(row, col)` of tile `k` in a `grid × grid` tiling.
pub fn tile_coords(k: usize, grid: usize) -> (usize, usize) {
    (k / grid, k % grid)
}

/// Row-major block tiling of a 2-D index space into `grid × grid` tiles.
/// Tile `k` covers block row `k / grid` and block column `k % grid`; each
/// axis is split by [`equal_split`].
pub fn tile_2d(rect: &Rect<2>, grid: usize) -> Vec<Rect<2>> {
    let grid = grid.max(1);
    let rows = equal_split(rect.extent(0), grid);
    let cols = equal_split(rect.extent(1), grid);
    (0..grid * grid)
        .map(|k| {
            let (br, bc) = tile_coords(k, grid);
            let (r, c) = (&rows[br], &cols[bc]);
            Rect::new(
                Point::new([rect.lo[0] + r.start as Coord, rect.lo[1] + c.start as Coord]),
                Point::new([rect.lo[0] + r.end as Coord - 1, rect.lo[1] + c.end as Coord - 1]),
            )
        })
        .collect()
}

/// Fail on the first pair of rectangles that share a point.
pub fn check_disjoint<const N: usize>(rects: &[Rect<N>]) -> Result<()> {
    for (i, a) in rects.iter().enumerate() {
        for (j, b) in rects.iter().enumerate().skip(i + 1) {
            let common = a.intersection(b);
            if !common.is_empty() {
                return Err(PimError::OverlappingWrites {
                    first: format!("partition {i} {a}"),
                    second: format!("partition {j} {b}"),
                    location: common.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Byte-granular record of who writes what inside one memory span.
#[derive(Debug)]
pub struct WriteSet {
    span: Range<usize>,
    written: BitVec,
    claims: Vec<(usize, Range<usize>)>,
    sorted: bool,
}

impl WriteSet {
    pub fn new(span: Range<usize>) -> Self {
        let len = span.len();
        Self {
            span,
            written: bitvec![0; len],
            claims: Vec::new(),
            sorted: true,
        }
    }

    /// Record that `owner` writes `bytes`; fails if any byte is already claimed.
    pub fn claim(&mut self, owner: usize, bytes: Range<usize>) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if bytes.start < self.span.start || bytes.end > self.span.end {
            return Err(PimError::InvalidRegion(format!(
                "write {bytes:?} by lane {owner} outside {:?}",
                self.span
            )));
        }
        let local = bytes.start - self.span.start..bytes.end - self.span.start;
        if let Some(hit) = self.written[local.clone()].first_one() {
            let addr = bytes.start + hit;
            let previous = self
                .claims
                .iter()
                .find(|(_, r)| r.contains(&addr))
                .map(|(lane, _)| *lane)
                .unwrap_or(owner);
            return Err(PimError::OverlappingWrites {
                first: format!("lane {previous}"),
                second: format!("lane {owner}"),
                location: format!("byte {addr}"),
            });
        }
        self.written[local].fill(true);
        if self.claims.last().is_some_and(|(_, r)| r.start > bytes.start) {
            self.sorted = false;
        }
        self.claims.push((owner, bytes));
        Ok(())
    }

    /// Fail if `reader` reads a byte that another lane writes.
    pub fn check_read(&mut self, reader: usize, bytes: Range<usize>) -> Result<()> {
        let start = bytes.start.max(self.span.start);
        let end = bytes.end.min(self.span.end);
        if start >= end
            || self.written[start - self.span.start..end - self.span.start].not_any()
        {
            return Ok(());
        }
        if !self.sorted {
            self.claims.sort_by_key(|(_, r)| r.start);
            self.sorted = true;
        }
        // claims are disjoint, so sorting by start also sorts them by end
        let first = self.claims.partition_point(|(_, r)| r.end <= start);
        let conflict = self.claims[first..]
            .iter()
            .take_while(|(_, r)| r.start < end)
            .find(|(writer, _)| *writer != reader);
        match conflict {
            Some((writer, r)) => Err(PimError::ReadWriteConflict {
                writer: format!("lane {writer}"),
                reader: format!("lane {reader}"),
                location: format!("byte {}", r.start.max(start)),
            }),
            None => Ok(()),
        }
    }

    pub fn claimed_bytes(&self) -> usize {
        self.written.count_ones()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// One bulk byte range touched by one lane between two barriers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub lane: usize,
    pub phase: usize,
    pub kind: AccessKind,
    pub bytes: Range<usize>,
}

/// Every bulk access of a launch, grouped by barrier phase.
///
/// Lanes of one phase run unordered, so within a phase no byte may be written
/// by two lanes, nor written by one lane and read by another. Accesses of
/// different phases are ordered by the barrier between them.
#[derive(Debug, Default)]
pub struct Footprint {
    accesses: Vec<Access>,
}

impl Footprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, lane: usize, phase: usize, bytes: Range<usize>) {
        self.push(lane, phase, AccessKind::Read, bytes);
    }

    pub fn write(&mut self, lane: usize, phase: usize, bytes: Range<usize>) {
        self.push(lane, phase, AccessKind::Write, bytes);
    }

    fn push(&mut self, lane: usize, phase: usize, kind: AccessKind, bytes: Range<usize>) {
        if !bytes.is_empty() {
            self.accesses.push(Access {
                lane,
                phase,
                kind,
                bytes,
            });
        }
    }

    pub fn accesses(&self) -> &[Access] {
        &self.accesses
    }

    fn in_phase(&self, phase: usize, kind: AccessKind) -> impl Iterator<Item = &Access> + '_ {
        self.accesses
            .iter()
            .filter(move |a| a.phase == phase && a.kind == kind)
    }

    /// Check every phase for lane conflicts; returns the number of bytes
    /// written.
    pub fn verify(&self) -> Result<usize> {
        let phases = self.accesses.iter().map(|a| a.phase + 1).max().unwrap_or(0);
        let mut written = 0;
        for phase in 0..phases {
            // the bit vector only covers the bytes this phase writes
            let lo = self.in_phase(phase, AccessKind::Write).map(|a| a.bytes.start).min();
            let hi = self.in_phase(phase, AccessKind::Write).map(|a| a.bytes.end).max();
            let (Some(lo), Some(hi)) = (lo, hi) else {
                continue;
            };
            let mut set = WriteSet::new(lo..hi);
            for access in self.in_phase(phase, AccessKind::Write) {
                set.claim(access.lane, access.bytes.clone())?;
            }
            for access in self.in_phase(phase, AccessKind::Read) {
                set.check_read(access.lane, access.bytes.clone())?;
            }
            written += set.claimed_bytes();
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lanes(nr: usize) -> Vec<LaneStride> {
        (0..nr).map(|l| LaneStride::new(l, nr).unwrap()).collect()
    }

    #[test]
    fn strided_indices_cover_once() {
        let mut seen = vec![0u32; 10];
        for lane in lanes(3) {
            for i in lane.indices(0..10) {
                seen[i as usize] += 1;
            }
        }
        assert!(seen.iter().all(|c| *c == 1));
        let lane0: Vec<_> = lanes(3)[0].indices(0..10).collect();
        assert_eq!(lane0, vec![0, 3, 6, 9]);
    }

    #[test]
    fn more_lanes_than_work() {
        let lane = LaneStride::new(7, 8).unwrap();
        assert_eq!(lane.indices(0..3).count(), 0);
        assert_eq!(lane.blocks(0..3, 2).count(), 0);
    }

    #[test]
    fn blocks_clip_the_tail() {
        let lane1 = LaneStride::new(1, 2).unwrap();
        let blocks: Vec<_> = lane1.blocks(0..10, 3).collect();
        assert_eq!(blocks, vec![3..6, 9..10]);
    }

    #[test]
    fn rect_blocks_keep_global_coordinates() {
        let lane0 = LaneStride::new(0, 2).unwrap();
        let blocks: Vec<_> = lane0.rect_blocks(&Rect::span(100, 109), 4).collect();
        assert_eq!(blocks, vec![Rect::span(100, 103), Rect::span(108, 109)]);
    }

    #[test]
    fn strided_points_cover_rect() {
        let rect = Rect::new(Point::new([0, 0]), Point::new([2, 3]));
        let mut total = 0;
        for lane in lanes(5) {
            for p in lane.points(&rect) {
                assert!(rect.contains(p));
                total += 1;
            }
        }
        assert_eq!(total, 12);
        let lane2: Vec<_> = lanes(5)[2].points(&rect).collect();
        assert_eq!(lane2, vec![Point::new([0, 2]), Point::new([1, 3])]);
    }

    #[test]
    fn invalid_lane_rejected() {
        assert!(LaneStride::new(4, 4).is_err());
        assert!(LaneStride::new(0, 0).is_err());
    }

    #[test]
    fn equal_partition_gives_remainder_to_first_parts() {
        let parts = equal_partition(&Rect::span(0, 9), 4);
        assert_eq!(
            parts,
            vec![
                Rect::span(0, 2),
                Rect::span(3, 5),
                Rect::span(6, 7),
                Rect::span(8, 9)
            ]
        );
        check_disjoint(&parts).unwrap();
    }

    #[test]
    fn tiling_is_row_major() {
        let rect = Rect::new(Point::new([0, 0]), Point::new([3, 3]));
        let tiles = tile_2d(&rect, 2);
        assert_eq!(tiles.len(), 4);
        assert_eq!(tiles[1], Rect::new(Point::new([0, 2]), Point::new([1, 3])));
        assert_eq!(tiles[2], Rect::new(Point::new([2, 0]), Point::new([3, 1])));
        assert_eq!(tiles.iter().map(Rect::volume).sum::<u64>(), 16);
        check_disjoint(&tiles).unwrap();
    }

    #[test]
    fn overlapping_partitions_flagged() {
        let err = check_disjoint(&[Rect::span(0, 7), Rect::span(4, 11)]).unwrap_err();
        assert!(matches!(err, PimError::OverlappingWrites { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn write_set_rejects_second_claim() {
        let mut set = WriteSet::new(64..128);
        set.claim(0, 64..72).unwrap();
        set.claim(1, 72..80).unwrap();
        let err = set.claim(2, 76..84).unwrap_err();
        match err {
            PimError::OverlappingWrites { first, second, .. } => {
                assert_eq!(first, "lane 1");
                assert_eq!(second, "lane 2");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(set.claimed_bytes(), 16);
        assert!(set.claim(0, 0..8).is_err());
    }

    #[test]
    fn write_set_rejects_reads_of_foreign_writes() {
        let mut set = WriteSet::new(0..64);
        set.claim(1, 32..48).unwrap();
        set.claim(0, 0..16).unwrap();
        set.check_read(0, 0..16).unwrap();
        set.check_read(3, 16..32).unwrap();
        set.check_read(2, 60..200).unwrap();
        let err = set.check_read(2, 20..36).unwrap_err();
        match err {
            PimError::ReadWriteConflict { writer, reader, location } => {
                assert_eq!(writer, "lane 1");
                assert_eq!(reader, "lane 2");
                assert_eq!(location, "byte 32");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn footprint_orders_phases_by_barrier() {
        let mut fp = Footprint::new();
        // phase 0: each lane writes its own row
        fp.write(0, 0, 0..16);
        fp.write(1, 0, 16..32);
        fp.read(0, 0, 100..132);
        // phase 1: every lane reads both rows
        fp.read(0, 1, 0..32);
        fp.read(1, 1, 0..32);
        fp.write(1, 1, 200..204);
        assert_eq!(fp.verify().unwrap(), 36);

        // reading a row in the phase that writes it races
        fp.read(1, 0, 0..4);
        assert!(matches!(
            fp.verify(),
            Err(PimError::ReadWriteConflict { .. })
        ));
    }

    #[test]
    fn footprint_sizes_bits_to_written_span() {
        let mut fp = Footprint::new();
        fp.write(0, 0, 1 << 30..(1 << 30) + 8);
        fp.write(1, 0, (1 << 30) + 8..(1 << 30) + 16);
        fp.read(2, 0, 0..8);
        assert_eq!(fp.verify().unwrap(), 16);
        assert_eq!(fp.accesses().len(), 3);
    }
}
