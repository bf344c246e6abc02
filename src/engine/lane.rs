// Lane Context
// Everything one lane needs for one kernel invocation, passed explicitly
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Barrier;

use crate::engine::accessor::AffineAccessor;
use crate::engine::element::Element;
use crate::engine::geometry::Point;
use crate::engine::memory::{BulkMemory, ScratchBuffer, ScratchpadPool};
use crate::engine::partition::LaneStride;
use crate::engine::staging::{self, block_bytes};
use crate::error::{PimError, Result};

/// Where a lane is in its kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanePhase {
    Init,
    Partition,
    StageIn,
    Compute,
    StageOut,
    Done,
}

impl LanePhase {
    /// `Init → Partition → {StageIn → Compute → StageOut}* → Done`, where a
    /// cycle may stage several inputs, and a lane with no input work may go
    /// straight from `Partition` to `Compute` or `Done`.
    pub fn can_enter(self, next: LanePhase) -> bool {
        use LanePhase::*;
        matches!(
            (self, next),
            (Init, Partition)
                | (Partition, StageIn | Compute | Done)
                | (StageIn, StageIn | Compute)
                | (Compute, StageIn | StageOut)
                | (StageOut, StageIn | Compute | Done)
        )
    }
}

/// Per-lane, per-invocation state: identity, the node's shared memories and
/// the lane's progress through the kernel.
pub struct LaneContext<'a> {
    node: usize,
    stride: LaneStride,
    block_elems: usize,
    bulk: &'a BulkMemory,
    scratchpad: &'a ScratchpadPool,
    barrier: &'a Barrier,
    phase: LanePhase,
}

impl<'a> LaneContext<'a> {
    pub(crate) fn new(
        node: usize,
        lane: usize,
        nr_lanes: usize,
        block_elems: usize,
        bulk: &'a BulkMemory,
        scratchpad: &'a ScratchpadPool,
        barrier: &'a Barrier,
    ) -> Result<Self> {
        Ok(Self {
            node,
            stride: LaneStride::new(lane, nr_lanes)?,
            block_elems,
            bulk,
            scratchpad,
            barrier,
            phase: LanePhase::Init,
        })
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn lane(&self) -> usize {
        self.stride.lane()
    }

    pub fn nr_lanes(&self) -> usize {
        self.stride.nr_lanes()
    }

    pub fn block_elems(&self) -> usize {
        self.block_elems
    }

    /// This lane's share of the node's work.
    pub fn stride(&self) -> LaneStride {
        self.stride
    }

    pub fn phase(&self) -> LanePhase {
        self.phase
    }

    pub fn enter(&mut self, next: LanePhase) {
        debug_assert!(
            self.phase.can_enter(next),
            "lane {} of node {}: illegal transition {:?} -> {:?}",
            self.lane(),
            self.node,
            self.phase,
            next
        );
        if matches!(next, LanePhase::Partition | LanePhase::Done) {
            tracing::trace!(node = self.node, lane = self.lane(), phase = ?next, "lane phase");
        }
        self.phase = next;
    }

    /// Scratch space for `count` elements of `T`, charged to the node budget.
    pub fn alloc<T: Element>(&self, count: usize) -> Result<ScratchBuffer> {
        self.scratchpad.alloc(block_bytes::<T>(count))
    }

    /// Wait for every lane of the node.
    pub fn barrier(&self) {
        self.barrier.wait();
    }

    /// Run `step`, turning a panic into an error so the lane can still reach
    /// the barrier that follows.
    pub fn guarded<R>(&mut self, step: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let lane = self.lane();
        match catch_unwind(AssertUnwindSafe(|| step(self))) {
            Ok(result) => result,
            Err(payload) => Err(PimError::LanePanicked {
                lane,
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Stage `count` elements starting at `src_point` into the origin of `dst`.
    pub(crate) fn stage_in<T: Element, const N: usize>(
        &mut self,
        src: &AffineAccessor<T, N>,
        src_point: Point<N>,
        dst: &mut ScratchBuffer,
        count: usize,
    ) -> Result<()> {
        self.enter(LanePhase::StageIn);
        let scratch = AffineAccessor::<T, 1>::scratch();
        // Safety: a validated launch has no byte that one lane writes while
        // another lane reads or writes it within the same barrier phase, and
        // the host stays out of bulk memory while the node lock is held.
        // With `check_overlap` off the caller upholds the same rule.
        unsafe {
            staging::stage_in(self.bulk, src, src_point, dst, &scratch, block_bytes::<T>(count))
        }
    }

    /// Stage `count` elements from the origin of `src` out to `dst_point`.
    pub(crate) fn stage_out<T: Element, const N: usize>(
        &mut self,
        dst: &AffineAccessor<T, N>,
        dst_point: Point<N>,
        src: &ScratchBuffer,
        count: usize,
    ) -> Result<()> {
        self.enter(LanePhase::StageOut);
        let scratch = AffineAccessor::<T, 1>::scratch();
        // Safety: as for `stage_in`.
        unsafe {
            staging::stage_out(self.bulk, dst, dst_point, src, &scratch, block_bytes::<T>(count))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
