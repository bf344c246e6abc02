// Workloads
// Host drivers: partition a problem across nodes, launch, gather
use ndarray::{Array2, ArrayView2};
use std::mem::size_of;

use crate::engine::accessor::AffineAccessor;
use crate::engine::args::{AxpyArgs, HistogramArgs, KernelArgs, MatmulArgs};
use crate::engine::controller::{CompletionToken, CopySource, Placement, PimRuntime};
use crate::engine::element::{BinKey, Element};
use crate::engine::geometry::{Coord, Point, Rect};
use crate::engine::memory::{align_up, RegionHandle};
use crate::engine::partition::{check_disjoint, equal_partition, tile_2d};
use crate::error::{PimError, Result};

/// Default histogram parameters: 14-bit inputs into 256 bins.
pub const HISTOGRAM_DEPTH: u32 = 14;
pub const HISTOGRAM_BINS: u32 = 256;

fn span_of(len: usize) -> Rect<1> {
    Rect::span(0, len as Coord - 1)
}

fn slice_of<'a, T>(values: &'a [T], part: &Rect<1>) -> &'a [T] {
    let lo = part.lo[0] as usize;
    &values[lo..lo + part.volume() as usize]
}

/// `alpha * x + y`, distributed over every node.
pub fn run_axpy<T: Element>(rt: &PimRuntime, x: &[T], y: &[T], alpha: T) -> Result<Vec<T>>
where
    KernelArgs: From<AxpyArgs<T>>,
{
    if x.len() != y.len() {
        return Err(PimError::InvalidRegion(format!(
            "axpy operands differ in length: {} vs {}",
            x.len(),
            y.len()
        )));
    }
    if x.is_empty() {
        return Ok(Vec::new());
    }

    // 1. Partition
    let parts = equal_partition(&span_of(x.len()), rt.num_nodes());
    check_disjoint(&parts)?;
    tracing::info!(elements = x.len(), nodes = parts.len(), "axpy partitioned");

    // 2. Stage operands and launch, one node per part
    let mut launches = Vec::new();
    let mut outputs = Vec::new();
    for (node, part) in parts.iter().enumerate().filter(|(_, p)| !p.is_empty()) {
        let bytes = part.volume() as usize * size_of::<T>();
        let rx = rt.allocate_region(bytes, Placement::Node(node))?;
        let ry = rt.allocate_region(bytes, Placement::Node(node))?;
        let rz = rt.allocate_region(bytes, Placement::Node(node))?;
        let ready = [
            rt.write_region(&rx, slice_of(x, part))?,
            rt.write_region(&ry, slice_of(y, part))?,
            rt.copy(CopySource::Fill(T::zero()), &rz, part.volume() as usize, &[])?,
        ];
        let args = AxpyArgs {
            rect: *part,
            x: AffineAccessor::for_region(&rx, *part)?,
            y: AffineAccessor::for_region(&ry, *part)?,
            z: AffineAccessor::for_region(&rz, *part)?,
            alpha,
        };
        launches.push(rt.launch_kernel(node, &KernelArgs::from(args), &ready)?);
        outputs.push((rz, *part));
    }

    // 3. Gather in partition order
    rt.wait(&rt.merge(&launches))?;
    let mut z = Vec::with_capacity(x.len());
    for (region, part) in outputs {
        let mut values = rt.read_region::<T>(&region)?;
        values.truncate(part.volume() as usize);
        z.extend(values);
    }
    Ok(z)
}

/// `A × B` for row-major `a` (`m × k`) and `b` (`k × n`), tiled over the
/// largest square grid of nodes.
pub fn run_matmul<T: Element>(
    rt: &PimRuntime,
    a: &[T],
    b: &[T],
    m: usize,
    k: usize,
    n: usize,
) -> Result<Array2<T>>
where
    KernelArgs: From<MatmulArgs<T>>,
{
    if m == 0 || k == 0 || n == 0 {
        return Err(PimError::InvalidRegion(format!(
            "matmul dimensions must be non-zero, got {m}x{k} by {k}x{n}"
        )));
    }
    if a.len() != m * k || b.len() != k * n {
        return Err(PimError::InvalidRegion(format!(
            "matmul operands hold {} and {} elements, expected {} and {}",
            a.len(),
            b.len(),
            m * k,
            k * n
        )));
    }
    let a = ArrayView2::from_shape((m, k), a).map_err(|e| PimError::InvalidRegion(e.to_string()))?;
    let b = ArrayView2::from_shape((k, n), b).map_err(|e| PimError::InvalidRegion(e.to_string()))?;
    // B is shipped transposed so each of its columns is one contiguous row
    let b_t = b.t();

    // 1. Tile C over a grid × grid block of nodes
    let grid = (1..=rt.num_nodes()).take_while(|g| g * g <= rt.num_nodes()).last().unwrap_or(1);
    let c_rect = Rect::new(Point::new([0, 0]), Point::new([m as Coord - 1, n as Coord - 1]));
    let tiles = tile_2d(&c_rect, grid);
    check_disjoint(&tiles)?;
    tracing::info!(m, k, n, grid, "matmul tiled");

    let mut launches = Vec::new();
    let mut outputs = Vec::new();
    for (node, tile) in tiles.iter().enumerate().filter(|(_, t)| !t.is_empty()) {
        let (r0, r1) = (tile.lo[0], tile.hi[0]);
        let (c0, c1) = (tile.lo[1], tile.hi[1]);
        let rect_a = Rect::new(Point::new([r0, 0]), Point::new([r1, k as Coord - 1]));
        let rect_b = Rect::new(Point::new([c0, 0]), Point::new([c1, k as Coord - 1]));

        // 2. One input region holding the A rows followed by the Bᵀ rows
        let a_bytes = rect_a.volume() as usize * size_of::<T>();
        let b_bytes = rect_b.volume() as usize * size_of::<T>();
        let inputs = rt.allocate_region(align_up(a_bytes) + b_bytes, Placement::Node(node))?;
        let ra = inputs.slice(0, a_bytes)?;
        let rb = inputs.slice(align_up(a_bytes), b_bytes)?;
        let rc = rt.allocate_region(tile.volume() as usize * size_of::<T>(), Placement::Node(node))?;

        let a_rows: Vec<T> = a.slice(ndarray::s![r0 as usize..=r1 as usize, ..]).iter().copied().collect();
        let b_rows: Vec<T> = b_t.slice(ndarray::s![c0 as usize..=c1 as usize, ..]).iter().copied().collect();
        let ready = [
            rt.write_region(&ra, &a_rows)?,
            rt.write_region(&rb, &b_rows)?,
            rt.copy(CopySource::Fill(T::zero()), &rc, tile.volume() as usize, &[])?,
        ];
        let args = MatmulArgs {
            tile: *tile,
            rect_a,
            rect_b,
            a: AffineAccessor::for_region(&ra, rect_a)?,
            b_t: AffineAccessor::for_region(&rb, rect_b)?,
            c: AffineAccessor::for_region(&rc, *tile)?,
        };
        launches.push(rt.launch_kernel(node, &KernelArgs::from(args), &ready)?);
        outputs.push((rc, *tile));
    }

    // 3. Gather tiles into C
    rt.wait(&rt.merge(&launches))?;
    let mut c = Array2::from_elem((m, n), T::zero());
    for (region, tile) in outputs {
        let rows = tile.extent(0) as usize;
        let cols = tile.extent(1) as usize;
        let block = rt.read_array2::<T>(&region, rows, cols)?;
        let (r0, c0) = (tile.lo[0] as usize, tile.lo[1] as usize);
        c.slice_mut(ndarray::s![r0..r0 + rows, c0..c0 + cols]).assign(&block);
    }
    Ok(c)
}

/// Per-node histograms of one distributed input.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramRun {
    /// One row per node, `bins` columns.
    pub per_node: Array2<u32>,
}

impl HistogramRun {
    pub fn bins(&self) -> usize {
        self.per_node.ncols()
    }

    /// Counts summed over every node.
    pub fn totals(&self) -> Vec<u32> {
        self.per_node
            .columns()
            .into_iter()
            .map(|col| col.iter().fold(0u32, |acc, c| acc.wrapping_add(*c)))
            .collect()
    }

    /// The flat output: node-major concatenation of the per-node histograms.
    pub fn flat(&self) -> Vec<u32> {
        self.per_node.iter().copied().collect()
    }
}

/// Histogram of `values` into `bins` bins of `depth`-bit inputs. Every node
/// histograms its own part; the output keeps one histogram per node.
pub fn run_histogram<T: BinKey>(
    rt: &PimRuntime,
    values: &[T],
    bins: u32,
    depth: u32,
) -> Result<HistogramRun>
where
    KernelArgs: From<HistogramArgs<T>>,
{
    let nodes = rt.num_nodes();
    let nr_lanes = rt.config().nr_lanes;
    let width = bins as usize;
    let mut per_node = Array2::<u32>::zeros((nodes, width));
    if values.is_empty() || bins == 0 {
        return Ok(HistogramRun { per_node });
    }

    let parts = equal_partition(&span_of(values.len()), nodes);
    check_disjoint(&parts)?;
    tracing::info!(elements = values.len(), bins, depth, nodes, "histogram partitioned");

    let mut launches = Vec::new();
    let mut outputs = Vec::new();
    for (node, part) in parts.iter().enumerate().filter(|(_, p)| !p.is_empty()) {
        let input = rt.allocate_region(part.volume() as usize * size_of::<T>(), Placement::Node(node))?;
        let partials_rect = Rect::new(
            Point::new([0, 0]),
            Point::new([nr_lanes as Coord - 1, width as Coord - 1]),
        );
        let partials = rt.allocate_region(nr_lanes * width * 4, Placement::Node(node))?;
        // this node's slice of the node-major output
        let lo = (node * width) as Coord;
        let output_rect = Rect::span(lo, lo + width as Coord - 1);
        let output = rt.allocate_region(width * 4, Placement::Node(node))?;

        let ready = [
            rt.write_region(&input, slice_of(values, part))?,
            rt.copy(CopySource::Fill(0u32), &output, width, &[])?,
        ];
        let args = HistogramArgs {
            rect: *part,
            input: AffineAccessor::for_region(&input, *part)?,
            partials_rect,
            partials: AffineAccessor::for_region(&partials, partials_rect)?,
            output_rect,
            output: AffineAccessor::for_region(&output, output_rect)?,
            bins,
            depth,
        };
        launches.push(rt.launch_kernel(node, &KernelArgs::from(args), &ready)?);
        outputs.push((node, output));
    }

    rt.wait(&CompletionToken::merge(launches))?;
    for (node, output) in outputs {
        let counts = read_counts(rt, &output, width)?;
        per_node.row_mut(node).assign(&ndarray::ArrayView1::from(&counts[..]));
    }
    Ok(HistogramRun { per_node })
}

fn read_counts(rt: &PimRuntime, region: &RegionHandle, width: usize) -> Result<Vec<u32>> {
    let mut counts = rt.read_region::<u32>(region)?;
    counts.truncate(width);
    Ok(counts)
}

/// `alpha * x + y` computed directly, without staging.
pub fn reference_axpy<T: Element>(x: &[T], y: &[T], alpha: T) -> Vec<T> {
    x.iter().zip(y).map(|(x, y)| alpha.wrapping_mul(*x).wrapping_add(*y)).collect()
}

/// `A × B` computed directly on row-major operands.
pub fn reference_matmul<T: Element>(a: &[T], b: &[T], m: usize, k: usize, n: usize) -> Array2<T> {
    Array2::from_shape_fn((m, n), |(r, c)| {
        (0..k).fold(T::zero(), |acc, i| acc.wrapping_add(a[r * k + i].wrapping_mul(b[i * n + c])))
    })
}

/// Histogram computed directly, without partitioning.
pub fn reference_histogram<T: BinKey>(values: &[T], bins: u32, depth: u32) -> Vec<u32> {
    let mut counts = vec![0u32; bins as usize];
    if bins == 0 {
        return counts;
    }
    for v in values {
        counts[v.bin_index(bins, depth)] += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    fn runtime(num_nodes: usize, nr_lanes: usize) -> PimRuntime {
        PimRuntime::new(MachineConfig {
            num_nodes,
            nr_lanes,
            bulk_bytes: 1 << 18,
            scratchpad_bytes: 1 << 14,
            block_elems: 4,
            ..MachineConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn axpy_matches_reference() {
        let rt = runtime(3, 4);
        let x: Vec<i32> = (0..50).collect();
        let y: Vec<i32> = (0..50).map(|v| 100 - v).collect();
        let z = run_axpy(&rt, &x, &y, -2).unwrap();
        assert_eq!(z, reference_axpy(&x, &y, -2));
    }

    #[test]
    fn axpy_length_mismatch_rejected() {
        let rt = runtime(1, 2);
        assert!(run_axpy(&rt, &[1.0f64], &[], 1.0).is_err());
        assert!(run_axpy::<f64>(&rt, &[], &[], 1.0).unwrap().is_empty());
    }

    #[test]
    fn matmul_on_a_two_by_two_grid() {
        let rt = runtime(4, 3);
        let (m, k, n) = (5, 3, 7);
        let a: Vec<i64> = (0..(m * k) as i64).collect();
        let b: Vec<i64> = (0..(k * n) as i64).map(|v| v % 5 - 2).collect();
        let c = run_matmul(&rt, &a, &b, m, k, n).unwrap();
        assert_eq!(c, reference_matmul(&a, &b, m, k, n));
    }

    #[test]
    fn histogram_keeps_one_row_per_node() {
        let rt = runtime(2, 4);
        let values: Vec<u32> = (0..64).map(|v| (v * 37) % 256).collect();
        let run = run_histogram(&rt, &values, 8, 8).unwrap();
        assert_eq!(run.per_node.dim(), (2, 8));
        assert_eq!(run.totals(), reference_histogram(&values, 8, 8));
        assert_eq!(run.per_node.row(0).iter().sum::<u32>(), 32);
        assert_eq!(run.flat().len(), 16);
    }

    #[test]
    fn reference_histogram_clamps() {
        assert_eq!(reference_histogram(&[0u64, 3, 4, 1 << 20], 2, 3), vec![2, 2]);
    }
}
