// Computation Kernels
// The closed kernel table: axpy, matmul and histogram over staged blocks
use std::mem::size_of;
use std::ops::Range;

use crate::engine::accessor::AffineAccessor;
use crate::engine::args::{
    AnyAxpyArgs, AnyHistogramArgs, AnyMatmulArgs, AxpyArgs, HistogramArgs, KernelArgs,
    MatmulArgs,
};
use crate::engine::element::{BinKey, Element};
use crate::engine::geometry::{Coord, Point};
use crate::engine::lane::{LaneContext, LanePhase};
use crate::engine::memory::align_up;
use crate::engine::partition::{Footprint, LaneStride};
use crate::error::{PimError, Result};

/// The node-side parameters a launch is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchShape {
    pub nr_lanes: usize,
    pub block_elems: usize,
    pub bulk_bytes: usize,
    pub scratchpad_bytes: usize,
}

/// One entry of the kernel table, for a fixed element type.
pub trait LaneKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Argument checks that do not depend on memory contents.
    fn validate(&self, shape: &LaunchShape) -> Result<()>;

    /// Scratchpad bytes one lane allocates over the whole invocation.
    fn scratch_per_lane(&self, shape: &LaunchShape) -> usize;

    /// Record every bulk byte range each lane stages in or out, per barrier
    /// phase. Fails on the first range outside bulk memory.
    fn footprint(&self, shape: &LaunchShape, fp: &mut Footprint) -> Result<()>;

    /// Body executed by every lane.
    fn run(&self, ctx: &mut LaneContext<'_>) -> Result<()>;
}

macro_rules! as_kernel {
    ($any:expr, $enum:ident, [$($variant:ident),*]) => {
        match $any {
            $($enum::$variant(args) => args as &dyn LaneKernel,)*
        }
    };
}

impl KernelArgs {
    /// Exhaustive dispatch from typed arguments to the kernel table.
    pub fn kernel(&self) -> &dyn LaneKernel {
        match self {
            KernelArgs::Axpy(any) => {
                as_kernel!(any, AnyAxpyArgs, [I32, U32, I64, U64, F32, F64, C64])
            }
            KernelArgs::Matmul(any) => as_kernel!(any, AnyMatmulArgs, [I32, I64, F32, F64]),
            KernelArgs::Histogram(any) => as_kernel!(any, AnyHistogramArgs, [U32, I32, U64]),
        }
    }
}

/// Reject a launch before any lane runs: argument shape, scratchpad budget,
/// bulk ranges of every staged read and write and, when `check_overlap` is
/// set, conflicts between lanes.
pub fn validate_launch(args: &KernelArgs, shape: &LaunchShape, check_overlap: bool) -> Result<()> {
    let kernel = args.kernel();
    kernel.validate(shape)?;

    let per_lane = kernel.scratch_per_lane(shape);
    let total = per_lane.saturating_mul(shape.nr_lanes);
    if total > shape.scratchpad_bytes {
        return Err(PimError::ScratchpadExhausted {
            requested: total,
            available: shape.scratchpad_bytes,
            capacity: shape.scratchpad_bytes,
        });
    }

    let mut footprint = Footprint::new();
    kernel.footprint(shape, &mut footprint)?;
    if check_overlap {
        let written = footprint.verify()?;
        tracing::debug!(
            kernel = kernel.name(),
            accesses = footprint.accesses().len(),
            bytes = written,
            "lane footprint is disjoint"
        );
    }
    Ok(())
}

/// Byte range of `count` elements at bulk address `addr`.
fn bulk_span<T>(addr: i64, count: usize, bulk_bytes: usize) -> Result<Range<usize>> {
    let len = count * size_of::<T>();
    match usize::try_from(addr) {
        Ok(start) if start + len <= bulk_bytes => Ok(start..start + len),
        _ => Err(PimError::OutOfBulkMemory {
            offset: addr,
            end: addr.saturating_add(len as i64),
            capacity: bulk_bytes,
        }),
    }
}

fn require_dense<T: Element, const N: usize>(acc: &AffineAccessor<T, N>, what: &str) -> Result<()> {
    if acc.is_innermost_dense() {
        Ok(())
    } else {
        Err(PimError::InvalidRegion(format!(
            "{what} must be contiguous along its last axis, strides {:?}",
            acc.strides()
        )))
    }
}

fn lanes(shape: &LaunchShape) -> impl Iterator<Item = LaneStride> + '_ {
    (0..shape.nr_lanes).filter_map(move |lane| LaneStride::new(lane, shape.nr_lanes).ok())
}

impl<T: Element> LaneKernel for AxpyArgs<T> {
    fn name(&self) -> &'static str {
        "axpy"
    }

    fn validate(&self, _shape: &LaunchShape) -> Result<()> {
        require_dense(&self.x, "axpy x")?;
        require_dense(&self.y, "axpy y")?;
        require_dense(&self.z, "axpy z")
    }

    fn scratch_per_lane(&self, shape: &LaunchShape) -> usize {
        3 * align_up(shape.block_elems * size_of::<T>())
    }

    fn footprint(&self, shape: &LaunchShape, fp: &mut Footprint) -> Result<()> {
        for lane in lanes(shape) {
            let l = lane.lane();
            for block in lane.rect_blocks(&self.rect, shape.block_elems as u64) {
                let n = block.volume() as usize;
                let span = |acc: &AffineAccessor<T, 1>| {
                    bulk_span::<T>(acc.element_pointer(block.lo), n, shape.bulk_bytes)
                };
                fp.read(l, 0, span(&self.x)?);
                fp.read(l, 0, span(&self.y)?);
                fp.write(l, 0, span(&self.z)?);
            }
        }
        Ok(())
    }

    fn run(&self, ctx: &mut LaneContext<'_>) -> Result<()> {
        ctx.enter(LanePhase::Partition);
        let block = ctx.block_elems();
        let scratch = AffineAccessor::<T, 1>::scratch();
        let mut xs = ctx.alloc::<T>(block)?;
        let mut ys = ctx.alloc::<T>(block)?;
        let mut zs = ctx.alloc::<T>(block)?;

        for span in ctx.stride().rect_blocks(&self.rect, block as u64) {
            let n = span.volume() as usize;
            ctx.stage_in(&self.x, span.lo, &mut xs, n)?;
            ctx.stage_in(&self.y, span.lo, &mut ys, n)?;

            ctx.enter(LanePhase::Compute);
            for i in 0..n as Coord {
                let z = self
                    .alpha
                    .wrapping_mul(scratch.get(&xs, i))
                    .wrapping_add(scratch.get(&ys, i));
                scratch.set(&mut zs, i, z);
            }

            ctx.stage_out(&self.z, span.lo, &zs, n)?;
        }
        ctx.enter(LanePhase::Done);
        Ok(())
    }
}

impl<T: Element> LaneKernel for MatmulArgs<T> {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn validate(&self, _shape: &LaunchShape) -> Result<()> {
        MatmulArgs::validate(self)?;
        require_dense(&self.a, "matmul A")?;
        require_dense(&self.b_t, "matmul Bᵀ")
    }

    fn scratch_per_lane(&self, _shape: &LaunchShape) -> usize {
        let row = align_up(self.inner() as usize * size_of::<T>());
        2 * row + align_up(size_of::<T>())
    }

    fn footprint(&self, shape: &LaunchShape, fp: &mut Footprint) -> Result<()> {
        let k = self.inner() as usize;
        for lane in lanes(shape) {
            let l = lane.lane();
            let mut staged_row: Option<Coord> = None;
            for p in lane.points(&self.tile) {
                let (row, col) = (p[0], p[1]);
                if staged_row != Some(row) {
                    let a_row = self.a.element_pointer(Point::new([row, self.rect_a.lo[1]]));
                    fp.read(l, 0, bulk_span::<T>(a_row, k, shape.bulk_bytes)?);
                    staged_row = Some(row);
                }
                let b_row = self.b_t.element_pointer(Point::new([col, self.rect_b.lo[1]]));
                fp.read(l, 0, bulk_span::<T>(b_row, k, shape.bulk_bytes)?);
                fp.write(l, 0, bulk_span::<T>(self.c.element_pointer(p), 1, shape.bulk_bytes)?);
            }
        }
        Ok(())
    }

    fn run(&self, ctx: &mut LaneContext<'_>) -> Result<()> {
        ctx.enter(LanePhase::Partition);
        let k = self.inner() as usize;
        let scratch = AffineAccessor::<T, 1>::scratch();
        let mut a_row = ctx.alloc::<T>(k)?;
        let mut b_row = ctx.alloc::<T>(k)?;
        let mut out = ctx.alloc::<T>(1)?;

        // consecutive points of one lane often share a row of A
        let mut staged_row: Option<Coord> = None;
        for p in ctx.stride().points(&self.tile) {
            let (row, col) = (p[0], p[1]);
            if staged_row != Some(row) {
                ctx.stage_in(&self.a, Point::new([row, self.rect_a.lo[1]]), &mut a_row, k)?;
                staged_row = Some(row);
            }
            ctx.stage_in(&self.b_t, Point::new([col, self.rect_b.lo[1]]), &mut b_row, k)?;

            ctx.enter(LanePhase::Compute);
            let mut dot = T::zero();
            for i in 0..k as Coord {
                let term = scratch.get(&a_row, i).wrapping_mul(scratch.get(&b_row, i));
                dot = dot.wrapping_add(term);
            }
            scratch.set(&mut out, 0, dot);

            ctx.stage_out(&self.c, p, &out, 1)?;
        }
        ctx.enter(LanePhase::Done);
        Ok(())
    }
}

impl<T: BinKey> HistogramArgs<T> {
    fn partial_row(&self, lane: usize) -> Point<2> {
        Point::new([
            self.partials_rect.lo[0] + lane as Coord,
            self.partials_rect.lo[1],
        ])
    }

    fn owned_bins(&self, lane: &LaneStride) -> impl Iterator<Item = u64> {
        lane.indices(0..u64::from(self.bins))
    }

    /// Phase 1: private histogram of this lane's blocks, staged to its row
    /// of the partials area.
    fn accumulate(&self, ctx: &mut LaneContext<'_>) -> Result<()> {
        ctx.enter(LanePhase::Partition);
        let block = ctx.block_elems();
        let bins = self.bins as usize;
        let values = AffineAccessor::<T, 1>::scratch();
        let counts = AffineAccessor::<u32, 1>::scratch();
        let mut input = ctx.alloc::<T>(block)?;
        let mut hist = ctx.alloc::<u32>(bins)?;

        for span in ctx.stride().rect_blocks(&self.rect, block as u64) {
            let n = span.volume() as usize;
            ctx.stage_in(&self.input, span.lo, &mut input, n)?;
            ctx.enter(LanePhase::Compute);
            for i in 0..n as Coord {
                let bin = values.get(&input, i).bin_index(self.bins, self.depth) as Coord;
                let count = counts.get(&hist, bin);
                counts.set(&mut hist, bin, count.wrapping_add(1));
            }
        }
        if ctx.phase() == LanePhase::Partition {
            ctx.enter(LanePhase::Compute);
        }
        let row = self.partial_row(ctx.lane());
        ctx.stage_out(&self.partials, row, &hist, bins)
    }

    /// Phase 2: sum every lane's partial row over the bins this lane owns.
    fn combine(&self, ctx: &mut LaneContext<'_>) -> Result<()> {
        let owned: Vec<u64> = self.owned_bins(&ctx.stride()).collect();
        if owned.is_empty() {
            ctx.enter(LanePhase::Done);
            return Ok(());
        }
        let bins = self.bins as usize;
        let counts = AffineAccessor::<u32, 1>::scratch();
        let mut row = ctx.alloc::<u32>(bins)?;
        let mut sums = ctx.alloc::<u32>(owned.len())?;
        let mut out = ctx.alloc::<u32>(1)?;

        for lane in 0..ctx.nr_lanes() {
            ctx.stage_in(&self.partials, self.partial_row(lane), &mut row, bins)?;
            ctx.enter(LanePhase::Compute);
            for (j, bin) in owned.iter().enumerate() {
                let total = counts.get(&sums, j as Coord);
                counts.set(
                    &mut sums,
                    j as Coord,
                    total.wrapping_add(counts.get(&row, *bin as Coord)),
                );
            }
        }
        for (j, bin) in owned.iter().enumerate() {
            counts.set(&mut out, 0, counts.get(&sums, j as Coord));
            let at = Point::new([self.output_rect.lo[0] + *bin as Coord]);
            ctx.stage_out(&self.output, at, &out, 1)?;
            if j + 1 < owned.len() {
                ctx.enter(LanePhase::Compute);
            }
        }
        ctx.enter(LanePhase::Done);
        Ok(())
    }
}

impl<T: BinKey> LaneKernel for HistogramArgs<T> {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn validate(&self, shape: &LaunchShape) -> Result<()> {
        HistogramArgs::validate(self)?;
        require_dense(&self.input, "histogram input")?;
        require_dense(&self.partials, "histogram partials")?;
        if self.partials_rect.extent(0) < shape.nr_lanes as u64 {
            return Err(PimError::InvalidRegion(format!(
                "partials {} have fewer rows than the node's {} lanes",
                self.partials_rect, shape.nr_lanes
            )));
        }
        Ok(())
    }

    fn scratch_per_lane(&self, shape: &LaunchShape) -> usize {
        let bins = self.bins as usize;
        let owned = bins.div_ceil(shape.nr_lanes.max(1));
        let phase1 = align_up(shape.block_elems * size_of::<T>()) + align_up(bins * 4);
        let phase2 = align_up(bins * 4) + align_up(owned * 4) + align_up(4);
        phase1 + phase2
    }

    fn footprint(&self, shape: &LaunchShape, fp: &mut Footprint) -> Result<()> {
        let bins = self.bins as usize;
        let row_span = |lane: usize| {
            let row = self.partials.element_pointer(self.partial_row(lane));
            bulk_span::<u32>(row, bins, shape.bulk_bytes)
        };
        for lane in lanes(shape) {
            let l = lane.lane();
            // phase 0: input blocks in, own partial row out
            for block in lane.rect_blocks(&self.rect, shape.block_elems as u64) {
                let at = self.input.element_pointer(block.lo);
                fp.read(l, 0, bulk_span::<T>(at, block.volume() as usize, shape.bulk_bytes)?);
            }
            fp.write(l, 0, row_span(l)?);

            // phase 1: every partial row in, owned bins out
            let mut owned = self.owned_bins(&lane).peekable();
            if owned.peek().is_none() {
                continue;
            }
            for other in 0..shape.nr_lanes {
                fp.read(l, 1, row_span(other)?);
            }
            for bin in owned {
                let at = Point::new([self.output_rect.lo[0] + bin as Coord]);
                let span = bulk_span::<u32>(self.output.element_pointer(at), 1, shape.bulk_bytes)?;
                fp.write(l, 1, span);
            }
        }
        Ok(())
    }

    fn run(&self, ctx: &mut LaneContext<'_>) -> Result<()> {
        // every lane must reach the barrier, even one whose first phase failed
        let first = ctx.guarded(|ctx| self.accumulate(ctx));
        ctx.barrier();
        first?;
        self.combine(ctx)
    }
}
