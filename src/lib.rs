pub mod config;
pub mod engine;
pub mod error;
pub mod telemetry;

#[cfg(feature = "python")]
mod python;

pub use crate::config::MachineConfig;
pub use crate::engine::accessor::AffineAccessor;
pub use crate::engine::args::{
    AxpyArgs, HistogramArgs, KernelArgBlock, KernelArgs, KernelKind, MatmulArgs, ARG_BLOCK_SIZE,
};
pub use crate::engine::controller::{CompletionToken, CopySource, Placement, PimRuntime};
pub use crate::engine::element::{BinKey, Element, ElementType};
pub use crate::engine::geometry::{Coord, Point, PointInRectIterator, Rect};
pub use crate::engine::memory::RegionHandle;
pub use crate::error::{PimError, Result};
