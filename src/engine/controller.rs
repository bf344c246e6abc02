// Host Runtime
// Regions, copies, launches and completion tokens over a set of execution nodes
use futures::future::{BoxFuture, FutureExt, Shared};
use ndarray::Array2;
use std::future::Future;
use std::mem::size_of;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::config::MachineConfig;
use crate::engine::args::{KernelArgBlock, KernelArgs, ARG_BLOCK_SIZE};
use crate::engine::element::Element;
use crate::engine::io::dump_elements;
use crate::engine::kernels::validate_launch;
use crate::engine::memory::{ByteSpace, ByteSpaceMut, RegionHandle};
use crate::engine::node::ExecutionNode;
use crate::error::{PimError, Result};

/// Handle to an asynchronous host operation.
///
/// Cheap to clone; every clone resolves to the same outcome, including the
/// first error of the operation or of anything it waited on.
#[derive(Clone)]
pub struct CompletionToken {
    inner: Shared<BoxFuture<'static, Result<()>>>,
}

impl CompletionToken {
    fn from_future(fut: impl Future<Output = Result<()>> + Send + 'static) -> Self {
        Self {
            inner: fut.boxed().shared(),
        }
    }

    fn from_task(task: tokio::task::JoinHandle<Result<()>>) -> Self {
        Self::from_future(async move {
            task.await
                .map_err(|e| PimError::Runtime(format!("host task did not finish: {e}")))?
        })
    }

    /// A token that has already completed successfully.
    pub fn ready() -> Self {
        Self::from_future(futures::future::ready(Ok(())))
    }

    /// Completes when every token completes; fails with the first failure.
    pub fn merge(tokens: impl IntoIterator<Item = CompletionToken>) -> Self {
        let tokens: Vec<_> = tokens.into_iter().collect();
        match tokens.len() {
            0 => Self::ready(),
            1 => tokens.into_iter().next().unwrap_or_else(Self::ready),
            _ => Self::from_future(async move {
                futures::future::try_join_all(tokens).await.map(|_| ())
            }),
        }
    }

    /// The outcome, if the operation has already finished.
    pub fn peek(&self) -> Option<Result<()>> {
        self.inner.peek().cloned()
    }
}

impl Future for CompletionToken {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_unpin(cx)
    }
}

impl std::fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.peek() {
            None => "pending",
            Some(Ok(())) => "done",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("CompletionToken").field("state", &state).finish()
    }
}

/// Where a new region goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Node(usize),
    /// The node with the most free bulk memory, lowest id on ties.
    BestFit,
}

/// Source of a host copy into a region.
#[derive(Debug, Clone, PartialEq)]
pub enum CopySource<T> {
    /// Repeat one element.
    Fill(T),
    /// Elements from host memory.
    Host(Vec<T>),
    /// Another region, on this node or another one.
    Region(RegionHandle),
}

/// The simulated host runtime: owns the execution nodes and drives every
/// transfer and launch on a tokio runtime.
///
/// Blocking calls (`wait`, `read_region`) must not be made from inside an
/// async context, and the runtime must be dropped outside one.
pub struct PimRuntime {
    config: MachineConfig,
    nodes: Vec<Arc<ExecutionNode>>,
    host: tokio::runtime::Runtime,
}

impl PimRuntime {
    pub fn new(config: MachineConfig) -> Result<Self> {
        config.validate()?;

        // 1. Host executor
        let host = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.host_threads)
            .thread_name("pim-host")
            .enable_all()
            .build()?;

        // 2. Execution nodes
        let nodes = (0..config.num_nodes)
            .map(|id| ExecutionNode::new(id, &config).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            nodes = config.num_nodes,
            lanes = config.nr_lanes,
            bulk_bytes = config.bulk_bytes,
            "PIM runtime initialized"
        );
        Ok(Self {
            config,
            nodes,
            host,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: usize) -> Result<&Arc<ExecutionNode>> {
        self.nodes.get(id).ok_or(PimError::UnknownNode(id))
    }

    pub fn allocate_region(&self, byte_size: usize, placement: Placement) -> Result<RegionHandle> {
        let node = match placement {
            Placement::Node(id) => self.node(id)?,
            Placement::BestFit => self
                .nodes
                .iter()
                .max_by(|a, b| {
                    a.free_bytes()
                        .cmp(&b.free_bytes())
                        .then(b.id().cmp(&a.id()))
                })
                .ok_or(PimError::UnknownNode(0))?,
        };
        node.allocate(byte_size)
    }

    /// Copy `element_count` elements into the start of `dst` once every token
    /// in `after` has completed.
    pub fn copy<T: Element>(
        &self,
        src: CopySource<T>,
        dst: &RegionHandle,
        element_count: usize,
        after: &[CompletionToken],
    ) -> Result<CompletionToken> {
        let bytes = element_count * size_of::<T>();
        let dst = *dst;
        let dst_node = self.node(dst.node)?.clone();
        check_in_node(&dst, &dst_node)?;
        if bytes > dst.bytes {
            return Err(PimError::InvalidRegion(format!(
                "copy of {bytes} bytes into a {}-byte region",
                dst.bytes
            )));
        }

        // 1. Resolve the source to bytes, or to a locked region read
        let payload = match src {
            CopySource::Fill(value) => {
                Payload::Bytes(bytemuck::bytes_of(&value).repeat(element_count))
            }
            CopySource::Host(values) => {
                if values.len() != element_count {
                    return Err(PimError::InvalidRegion(format!(
                        "host buffer holds {} elements, copy expects {element_count}",
                        values.len()
                    )));
                }
                Payload::Bytes(bytemuck::cast_slice::<T, u8>(&values).to_vec())
            }
            CopySource::Region(src) => {
                if bytes > src.bytes {
                    return Err(PimError::InvalidRegion(format!(
                        "copy of {bytes} bytes out of a {}-byte region",
                        src.bytes
                    )));
                }
                let src_node = self.node(src.node)?.clone();
                check_in_node(&src, &src_node)?;
                Payload::Region(src_node, src)
            }
        };

        // 2. Transfer under the node lock(s)
        let after = CompletionToken::merge(after.iter().cloned());
        let task = self.host.spawn(async move {
            after.await?;
            let data = match payload {
                Payload::Bytes(data) => data,
                Payload::Region(src_node, src) => {
                    if src.node == dst.node {
                        let mut bulk = dst_node.memory().lock_owned().await;
                        bulk.bytes_mut()
                            .copy_within(src.offset..src.offset + bytes, dst.offset);
                        tracing::debug!(node = dst.node, bytes, "region copy");
                        return Ok(());
                    }
                    let bulk = src_node.memory().lock_owned().await;
                    bulk.bytes()[src.offset..src.offset + bytes].to_vec()
                }
            };
            let mut bulk = dst_node.memory().lock_owned().await;
            bulk.bytes_mut()[dst.offset..dst.offset + bytes].copy_from_slice(&data);
            tracing::debug!(node = dst.node, offset = dst.offset, bytes, "copy into region");
            Ok(())
        });
        Ok(CompletionToken::from_task(task))
    }

    /// Copy host elements into the start of `region`.
    pub fn write_region<T: Element>(
        &self,
        region: &RegionHandle,
        values: &[T],
    ) -> Result<CompletionToken> {
        self.copy(CopySource::Host(values.to_vec()), region, values.len(), &[])
    }

    /// Launch the kernel encoded in `arg_block` on `node`.
    ///
    /// The block is validated here, before anything is queued: its size,
    /// header and selector, the scratchpad budget, the bulk range of every
    /// staged access and, when configured, conflicts between lanes.
    pub fn launch(
        &self,
        node: usize,
        arg_block: &[u8],
        arg_size: usize,
        after: &[CompletionToken],
    ) -> Result<CompletionToken> {
        if arg_size != arg_block.len() || arg_size != ARG_BLOCK_SIZE {
            return Err(PimError::ArgBlockSize {
                expected: ARG_BLOCK_SIZE,
                got: arg_size,
            });
        }
        let target = self.node(node)?.clone();
        let block = KernelArgBlock::from_bytes(arg_block)?;
        let args = block.decode()?;
        validate_launch(&args, &target.shape(), self.config.check_overlap)?;

        let kernel = args.kernel().name();
        tracing::info!(node, kernel, dtype = %args.dtype(), "launch queued");

        let after = CompletionToken::merge(after.iter().cloned());
        let task = self.host.spawn(async move {
            after.await?;
            let bulk = target.memory().lock_owned().await;
            tokio::task::spawn_blocking(move || {
                let result = target.run_kernel(&bulk, &block);
                tracing::debug!(node = target.id(), kernel, ok = result.is_ok(), "kernel finished");
                result
            })
            .await
            .map_err(|e| PimError::Runtime(format!("kernel task on node {node}: {e}")))?
        });
        Ok(CompletionToken::from_task(task))
    }

    /// Encode and launch typed arguments.
    pub fn launch_kernel(
        &self,
        node: usize,
        args: &KernelArgs,
        after: &[CompletionToken],
    ) -> Result<CompletionToken> {
        let bytes = args.to_bytes();
        self.launch(node, &bytes, bytes.len(), after)
    }

    /// Block until `token` completes.
    pub fn wait(&self, token: &CompletionToken) -> Result<()> {
        self.host.block_on(token.clone())
    }

    pub fn merge(&self, tokens: &[CompletionToken]) -> CompletionToken {
        CompletionToken::merge(tokens.iter().cloned())
    }

    /// Every whole element of `region`, read under the node lock.
    pub fn read_region<T: Element>(&self, region: &RegionHandle) -> Result<Vec<T>> {
        let node = self.node(region.node)?.clone();
        let count = region.capacity_of::<T>();
        let range = region.offset..region.offset + count * size_of::<T>();
        self.host.block_on(async move {
            let bulk = node.memory().lock_owned().await;
            let bytes = bulk.bytes().get(range).ok_or_else(|| {
                PimError::InvalidRegion(format!("{region:?} is outside node memory"))
            })?;
            Ok(bytes
                .chunks_exact(size_of::<T>())
                .map(bytemuck::pod_read_unaligned)
                .collect())
        })
    }

    /// The first `rows × cols` elements of `region` as a row-major matrix.
    pub fn read_array2<T: Element>(
        &self,
        region: &RegionHandle,
        rows: usize,
        cols: usize,
    ) -> Result<Array2<T>> {
        let mut values = self.read_region::<T>(region)?;
        if values.len() < rows * cols {
            return Err(PimError::InvalidRegion(format!(
                "{rows}x{cols} matrix does not fit a region of {} elements",
                values.len()
            )));
        }
        values.truncate(rows * cols);
        Array2::from_shape_vec((rows, cols), values)
            .map_err(|e| PimError::InvalidRegion(e.to_string()))
    }

    /// Write the elements of `region` to a flat binary file.
    pub fn dump_region<T: Element>(&self, region: &RegionHandle, path: impl AsRef<Path>) -> Result<()> {
        let values = self.read_region::<T>(region)?;
        dump_elements(path, &values)
    }
}

impl std::fmt::Debug for PimRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PimRuntime")
            .field("config", &self.config)
            .field("nodes", &self.nodes)
            .finish()
    }
}

fn check_in_node(region: &RegionHandle, node: &ExecutionNode) -> Result<()> {
    let capacity = node.shape().bulk_bytes;
    if region.end() > capacity {
        return Err(PimError::OutOfBulkMemory {
            offset: region.offset as i64,
            end: region.end() as i64,
            capacity,
        });
    }
    Ok(())
}

enum Payload {
    Bytes(Vec<u8>),
    Region(Arc<ExecutionNode>, RegionHandle),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(num_nodes: usize) -> PimRuntime {
        PimRuntime::new(MachineConfig {
            num_nodes,
            nr_lanes: 4,
            bulk_bytes: 1 << 16,
            scratchpad_bytes: 1 << 12,
            block_elems: 8,
            ..MachineConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn fill_then_read() {
        let rt = runtime(1);
        let region = rt.allocate_region(10 * 4, Placement::Node(0)).unwrap();
        let token = rt.copy(CopySource::Fill(7i32), &region, 10, &[]).unwrap();
        rt.wait(&token).unwrap();
        assert_eq!(rt.read_region::<i32>(&region).unwrap(), vec![7; 10]);
        assert!(matches!(token.peek(), Some(Ok(()))));
    }

    #[test]
    fn region_copy_across_nodes_waits_for_its_source() {
        let rt = runtime(2);
        let src = rt.allocate_region(32, Placement::Node(0)).unwrap();
        let dst = rt.allocate_region(32, Placement::Node(1)).unwrap();
        let filled = rt.write_region(&src, &[1.0f64, 2.0, 3.0, 4.0]).unwrap();
        let copied = rt
            .copy(CopySource::<f64>::Region(src), &dst, 4, &[filled])
            .unwrap();
        rt.wait(&copied).unwrap();
        assert_eq!(rt.read_region::<f64>(&dst).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn best_fit_prefers_emptier_node() {
        let rt = runtime(3);
        rt.allocate_region(1024, Placement::Node(0)).unwrap();
        let region = rt.allocate_region(64, Placement::BestFit).unwrap();
        assert_eq!(region.node, 1);
        assert!(matches!(
            rt.allocate_region(8, Placement::Node(3)),
            Err(PimError::UnknownNode(3))
        ));
    }

    #[test]
    fn failure_flows_through_dependents() {
        let rt = runtime(1);
        let failed = CompletionToken::from_future(async { Err(PimError::Runtime("lost".into())) });
        let region = rt.allocate_region(8, Placement::Node(0)).unwrap();
        let copy = rt.copy(CopySource::Fill(1u32), &region, 2, &[failed]).unwrap();
        let merged = rt.merge(&[CompletionToken::ready(), copy]);
        match rt.wait(&merged) {
            Err(PimError::Runtime(msg)) => assert_eq!(msg, "lost"),
            other => panic!("unexpected {other:?}"),
        }
        // the copy never ran
        assert_eq!(rt.read_region::<u32>(&region).unwrap(), vec![0, 0]);
    }

    #[test]
    fn oversized_copies_rejected_up_front() {
        let rt = runtime(1);
        let region = rt.allocate_region(8, Placement::Node(0)).unwrap();
        assert!(rt.copy(CopySource::Fill(0u64), &region, 2, &[]).is_err());
        assert!(rt.copy(CopySource::Host(vec![1u32]), &region, 2, &[]).is_err());
    }

    #[test]
    fn short_arg_block_rejected() {
        let rt = runtime(1);
        let err = rt.launch(0, &[0u8; 64], 64, &[]).unwrap_err();
        assert!(matches!(err, PimError::ArgBlockSize { got: 64, .. }));
    }

    #[test]
    fn read_array2_shapes_rows() {
        let rt = runtime(1);
        let region = rt.allocate_region(6 * 8, Placement::Node(0)).unwrap();
        let token = rt.write_region(&region, &[1i64, 2, 3, 4, 5, 6]).unwrap();
        rt.wait(&token).unwrap();
        let m = rt.read_array2::<i64>(&region, 2, 3).unwrap();
        assert_eq!(m[[1, 0]], 4);
        assert!(rt.read_array2::<i64>(&region, 3, 3).is_err());
    }
}
