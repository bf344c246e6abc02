// Execution Node
// One near-memory unit: a lane pool, its bulk memory and its scratchpad
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Barrier};
use tokio::sync::Mutex;

use crate::config::MachineConfig;
use crate::engine::args::KernelArgBlock;
use crate::engine::kernels::LaunchShape;
use crate::engine::lane::{panic_message, LaneContext};
use crate::engine::memory::{BulkMemory, RegionAllocator, RegionHandle, ScratchpadPool};
use crate::error::{PimError, Result};

pub struct ExecutionNode {
    id: usize,
    nr_lanes: usize,
    block_elems: usize,
    lanes: rayon::ThreadPool,
    /// The node lock: held by the host for a whole copy or kernel launch.
    bulk: Arc<Mutex<BulkMemory>>,
    bulk_bytes: usize,
    regions: RegionAllocator,
    scratchpad: ScratchpadPool,
}

impl ExecutionNode {
    pub fn new(id: usize, config: &MachineConfig) -> Result<Self> {
        // 1. One pool thread per lane, so a broadcast runs every lane exactly once
        let lanes = rayon::ThreadPoolBuilder::new()
            .num_threads(config.nr_lanes)
            .thread_name(move |lane| format!("pim-n{id}-l{lane}"))
            .build()
            .map_err(|e| PimError::Runtime(format!("lane pool for node {id}: {e}")))?;

        // 2. Bulk memory
        let bulk = BulkMemory::new(config.bulk_bytes)?;

        tracing::debug!(
            node = id,
            lanes = config.nr_lanes,
            bulk_bytes = config.bulk_bytes,
            scratchpad_bytes = config.scratchpad_bytes,
            "execution node ready"
        );
        Ok(Self {
            id,
            nr_lanes: config.nr_lanes,
            block_elems: config.block_elems,
            lanes,
            bulk: Arc::new(Mutex::new(bulk)),
            bulk_bytes: config.bulk_bytes,
            regions: RegionAllocator::new(config.bulk_bytes),
            scratchpad: ScratchpadPool::new(config.scratchpad_bytes),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn nr_lanes(&self) -> usize {
        self.nr_lanes
    }

    pub fn free_bytes(&self) -> usize {
        self.regions.free_bytes()
    }

    pub fn allocate(&self, bytes: usize) -> Result<RegionHandle> {
        let region = self.regions.allocate(self.id, bytes)?;
        tracing::debug!(node = self.id, offset = region.offset, bytes, "region allocated");
        Ok(region)
    }

    pub fn memory(&self) -> Arc<Mutex<BulkMemory>> {
        Arc::clone(&self.bulk)
    }

    pub fn shape(&self) -> LaunchShape {
        LaunchShape {
            nr_lanes: self.nr_lanes,
            block_elems: self.block_elems,
            bulk_bytes: self.bulk_bytes,
            scratchpad_bytes: self.scratchpad.capacity(),
        }
    }

    /// Run one kernel invocation on every lane and wait for all of them.
    ///
    /// `bulk` must be this node's memory, borrowed under the node lock. The
    /// first lane error, in lane order, is returned.
    pub fn run_kernel(&self, bulk: &BulkMemory, block: &KernelArgBlock) -> Result<()> {
        let barrier = Barrier::new(self.nr_lanes);
        let results = self
            .lanes
            .broadcast(|lane| self.run_lane(lane.index(), bulk, block, &barrier));
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    fn run_lane(
        &self,
        lane: usize,
        bulk: &BulkMemory,
        block: &KernelArgBlock,
        barrier: &Barrier,
    ) -> Result<()> {
        // lane 0 resets the scratchpad before anyone allocates
        if lane == 0 {
            self.scratchpad.reset();
        }
        barrier.wait();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let args = block.decode()?;
            let mut ctx = LaneContext::new(
                self.id,
                lane,
                self.nr_lanes,
                self.block_elems,
                bulk,
                &self.scratchpad,
                barrier,
            )?;
            args.kernel().run(&mut ctx)
        }));
        match outcome {
            Ok(result) => result,
            Err(payload) => Err(PimError::LanePanicked {
                lane,
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl std::fmt::Debug for ExecutionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionNode")
            .field("id", &self.id)
            .field("nr_lanes", &self.nr_lanes)
            .field("bulk_bytes", &self.bulk_bytes)
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::accessor::AffineAccessor;
    use crate::engine::args::{AxpyArgs, HistogramArgs, KernelArgs};
    use crate::engine::geometry::{Point, Rect};

    fn small_config(nr_lanes: usize) -> MachineConfig {
        MachineConfig {
            num_nodes: 1,
            nr_lanes,
            bulk_bytes: 1 << 16,
            scratchpad_bytes: 1 << 12,
            block_elems: 4,
            ..MachineConfig::default()
        }
    }

    #[test]
    fn axpy_runs_on_all_lanes() {
        let node = ExecutionNode::new(0, &small_config(4)).unwrap();
        let rect = Rect::span(0, 36);
        let n = rect.volume() as usize;
        let x = node.allocate(n * 4).unwrap();
        let y = node.allocate(n * 4).unwrap();
        let z = node.allocate(n * 4).unwrap();
        let args = AxpyArgs {
            rect,
            x: AffineAccessor::<f32, 1>::for_region(&x, rect).unwrap(),
            y: AffineAccessor::for_region(&y, rect).unwrap(),
            z: AffineAccessor::for_region(&z, rect).unwrap(),
            alpha: 0.5,
        };
        let memory = node.memory();
        let mut bulk = memory.try_lock().unwrap();
        for p in rect.points() {
            args.x.write(&mut *bulk, p, p[0] as f32);
            args.y.write(&mut *bulk, p, 1.0);
        }
        node.run_kernel(&bulk, &KernelArgs::from(args).encode()).unwrap();
        for p in rect.points() {
            assert_eq!(args.z.read(&*bulk, p), p[0] as f32 * 0.5 + 1.0);
        }
    }

    #[test]
    fn histogram_lanes_meet_at_the_barrier() {
        let config = small_config(3);
        let node = ExecutionNode::new(0, &config).unwrap();
        let rect = Rect::span(0, 19);
        let bins = 4u32;
        let input = node.allocate(20 * 4).unwrap();
        let partials_rect = Rect::new(Point::new([0, 0]), Point::new([2, 3]));
        let partials = node.allocate(12 * 4).unwrap();
        let output_rect = Rect::span(0, 3);
        let output = node.allocate(16).unwrap();
        let args = HistogramArgs {
            rect,
            input: AffineAccessor::<u32, 1>::for_region(&input, rect).unwrap(),
            partials_rect,
            partials: AffineAccessor::for_region(&partials, partials_rect).unwrap(),
            output_rect,
            output: AffineAccessor::for_region(&output, output_rect).unwrap(),
            bins,
            depth: 4,
        };
        let memory = node.memory();
        let mut bulk = memory.try_lock().unwrap();
        for p in rect.points() {
            // values 0..16 then 4 out-of-range values clamped to the last bin
            args.input.write(&mut *bulk, p, p[0] as u32);
        }
        node.run_kernel(&bulk, &KernelArgs::from(args).encode()).unwrap();
        let counts: Vec<u32> = output_rect.points().map(|p| args.output.read(&*bulk, p)).collect();
        assert_eq!(counts, vec![4, 4, 4, 8]);
    }

    #[test]
    fn lane_errors_are_reported() {
        let node = ExecutionNode::new(0, &small_config(2)).unwrap();
        let rect = Rect::span(0, 7);
        let acc = AffineAccessor::<u64, 1>::dense(rect);
        // reads past the end of bulk memory
        let args = AxpyArgs {
            rect,
            x: AffineAccessor::dense_at((1 << 16) - 16, rect),
            y: acc,
            z: AffineAccessor::dense_at(64, rect),
            alpha: 1,
        };
        let memory = node.memory();
        let bulk = memory.try_lock().unwrap();
        let err = node
            .run_kernel(&bulk, &KernelArgs::from(args).encode())
            .unwrap_err();
        assert!(matches!(err, PimError::OutOfBulkMemory { .. }));
    }
}
