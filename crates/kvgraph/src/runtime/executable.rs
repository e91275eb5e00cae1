use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use super::binding::DimBindings;
use super::plan::CompiledPlan;
use crate::backend::spec::{BackendError, OpBackend};
use crate::env;
use crate::error::{GraphError, Result};
use crate::graph::{Graph, ValueId, ValueRole};
use crate::kv::{validate_indices, KvCacheGeometry};
use crate::ops::Op;
use crate::tensor::{Layout, MatrixIndexer, TensorDesc};

/// Dispatch behaviour shared by [`Session`](super::Session) and
/// [`Context`](super::Context).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Read caller-bound index tensors back to the host and range-check them
    /// against the bound caches before anything is enqueued. A failing run
    /// then leaves the caches untouched. Skipped for backends that cannot
    /// download.
    pub check_indices: bool,
    /// Synchronize after every node so a device fault names the node that
    /// raised it.
    pub sync_each_node: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            check_indices: true,
            sync_each_node: false,
        }
    }
}

impl DispatchOptions {
    /// Defaults with `sync_each_node` taken from `KVGRAPH_SYNC_EACH_NODE`.
    pub fn from_env() -> Self {
        Self::default().with_sync_each_node(env::sync_each_node())
    }

    pub fn with_check_indices(mut self, enabled: bool) -> Self {
        self.check_indices = enabled;
        self
    }

    pub fn with_sync_each_node(mut self, enabled: bool) -> Self {
        self.sync_each_node = enabled;
        self
    }
}

/// How a launch treats slot shapes across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindMode {
    /// Every launch may bind new shapes.
    Respecialize,
    /// The first launch fixes every slot's dims and layout.
    Pinned,
}

/// Per-slot signature fixed by the first pinned launch.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SlotSignature {
    dims: Vec<usize>,
    layout: Layout,
}

/// A compiled graph plus the device buffers it owns between runs.
pub struct Executable<B: OpBackend> {
    plan: CompiledPlan,
    pinned: Option<Vec<SlotSignature>>,
    scratch: HashMap<ValueId, B::Buffer>,
    staging: HashMap<ValueId, B::Buffer>,
    runs: u64,
}

/// Buffers chosen for one launch.
struct Bound<Buf> {
    storage: Vec<Option<Buf>>,
    convert_in: Vec<(Buf, Buf)>,
    write_back: Vec<(Buf, Buf)>,
    copy_out: Vec<(ValueId, Buf)>,
}

impl<B: OpBackend> Executable<B> {
    pub(crate) fn new(plan: CompiledPlan) -> Self {
        Self {
            plan,
            pinned: None,
            scratch: HashMap::new(),
            staging: HashMap::new(),
            runs: 0,
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.plan.graph
    }

    /// Largest scratch requirement of any selected kernel.
    pub fn workspace_bytes(&self) -> usize {
        self.plan.workspace_bytes
    }

    pub fn node_count(&self) -> usize {
        self.plan.order.len()
    }

    /// Kernel names in dispatch order.
    pub fn kernels(&self) -> impl Iterator<Item = &str> {
        self.plan.kernels.iter().map(|kernel| kernel.kernel.as_str())
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Binds buffers and enqueues every node. Returns once the work is queued.
    pub(crate) fn launch(
        &mut self,
        backend: &B,
        externals: &[B::Buffer],
        declared_layouts: Option<&[Layout]>,
        outputs: &[B::Buffer],
        mode: BindMode,
        options: DispatchOptions,
    ) -> Result<()> {
        let graph = Arc::clone(&self.plan.graph);
        let bound = self.bind(backend, &graph, externals, declared_layouts, outputs, mode)?;
        if options.check_indices {
            self.check_indices(backend, &graph, externals, &bound)?;
        }

        debug!(
            graph = graph.name(),
            nodes = self.plan.order.len(),
            conversions = bound.convert_in.len() + bound.write_back.len() + bound.copy_out.len(),
            run = self.runs,
            "dispatching graph"
        );
        for (src, dst) in &bound.convert_in {
            backend.convert_layout(src, dst)?;
        }
        for (position, node_id) in self.plan.order.iter().enumerate() {
            let node = &graph.nodes()[node_id.index()];
            let inputs = collect(&bound.storage, &node.inputs)?;
            let outputs = collect(&bound.storage, &node.outputs)?;
            trace!(
                node = %node_id,
                op = node.op.name(),
                kernel = self.plan.kernels[position].kernel.as_str(),
                "enqueue"
            );
            backend.enqueue(&node.op, &inputs, &outputs)?;
            if options.sync_each_node {
                backend.synchronize().map_err(|err| {
                    GraphError::from_sync(err).context(format!("{node_id} ({})", node.op.name()))
                })?;
            }
        }
        for (src, dst) in &bound.write_back {
            backend.convert_layout(src, dst)?;
        }
        for (value, dst) in &bound.copy_out {
            let src = collect(&bound.storage, &[*value])?;
            backend.convert_layout(&src[0], dst)?;
        }
        self.runs += 1;
        Ok(())
    }

    fn bind(
        &mut self,
        backend: &B,
        graph: &Graph,
        externals: &[B::Buffer],
        declared_layouts: Option<&[Layout]>,
        outputs: &[B::Buffer],
        mode: BindMode,
    ) -> Result<Bound<B::Buffer>> {
        let slots: Vec<ValueId> = graph.external_slots().collect();
        if externals.len() != slots.len() {
            return Err(GraphError::shape(format!(
                "graph {} binds {} inputs and {} weights, got {} buffers",
                graph.name(),
                graph.inputs().len(),
                graph.weights().len(),
                externals.len()
            )));
        }
        if outputs.len() != graph.outputs().len() {
            return Err(GraphError::shape(format!(
                "graph {} has {} outputs, got {} buffers",
                graph.name(),
                graph.outputs().len(),
                outputs.len()
            )));
        }

        let external_descs: Vec<TensorDesc> = externals.iter().map(|b| backend.describe(b)).collect();
        let output_descs: Vec<TensorDesc> = outputs.iter().map(|b| backend.describe(b)).collect();

        if let Some(layouts) = declared_layouts {
            if layouts.len() != graph.inputs().len() {
                return Err(GraphError::shape(format!(
                    "{} input layouts declared for {} inputs",
                    layouts.len(),
                    graph.inputs().len()
                )));
            }
            for ((id, layout), actual) in graph.inputs().iter().zip(layouts).zip(&external_descs) {
                if *layout != actual.layout {
                    return Err(GraphError::layout(format!(
                        "input {} is declared {layout} but its buffer is stored as {}",
                        graph.values()[id.index()].name,
                        actual.layout
                    )));
                }
            }
        }

        let mut dims = DimBindings::default();
        let mut signature = Vec::with_capacity(slots.len() + outputs.len());
        for (id, actual) in slots
            .iter()
            .zip(&external_descs)
            .chain(graph.outputs().iter().zip(&output_descs))
        {
            let info = &graph.values()[id.index()];
            if info.desc.dtype != actual.dtype {
                return Err(GraphError::shape(format!(
                    "slot {} expects {}, bound buffer is {}",
                    info.name, info.desc.dtype, actual.dtype
                )));
            }
            let actual_dims = actual.require_static()?;
            dims.unify(&info.name, &info.desc.shape, &actual_dims)?;
            signature.push(SlotSignature {
                dims: actual_dims,
                layout: actual.layout,
            });
        }
        if mode == BindMode::Pinned {
            self.check_pinned(graph, &slots, &signature)?;
        }

        let mut bound = Bound {
            storage: vec![None; graph.values().len()],
            convert_in: Vec::new(),
            write_back: Vec::new(),
            copy_out: Vec::new(),
        };

        for ((id, buffer), actual) in slots.iter().zip(externals).zip(&external_descs) {
            let info = &graph.values()[id.index()];
            if actual.layout == info.desc.layout {
                bound.storage[id.index()] = Some(buffer.clone());
                continue;
            }
            let dims_of = dims.resolve(&info.desc.shape)?;
            MatrixIndexer::new(&dims_of, info.desc.layout).map_err(|err| {
                GraphError::layout(format!(
                    "slot {} cannot be converted from {} to {}: {err}",
                    info.name, actual.layout, info.desc.layout
                ))
            })?;
            let target = dims.resolve_desc(&info.desc)?;
            let staging = reuse_or_allocate(backend, &mut self.staging, *id, &target)?;
            debug!(slot = info.name.as_str(), from = %actual.layout, to = %info.desc.layout, "staging conversion");
            bound.convert_in.push((buffer.clone(), staging.clone()));
            if is_overwritten(graph, *id) {
                bound.write_back.push((staging.clone(), buffer.clone()));
            }
            bound.storage[id.index()] = Some(staging);
        }

        for ((id, buffer), actual) in graph.outputs().iter().zip(outputs).zip(&output_descs) {
            let info = &graph.values()[id.index()];
            let direct = info.role == ValueRole::Intermediate
                && info.alias_of.is_none()
                && bound.storage[id.index()].is_none()
                && actual.layout == info.desc.layout
                && !externals.iter().any(|ext| backend.same_buffer(ext, buffer));
            if direct {
                bound.storage[id.index()] = Some(buffer.clone());
            } else {
                bound.copy_out.push((*id, buffer.clone()));
            }
        }

        for (index, info) in graph.values().iter().enumerate() {
            if info.role != ValueRole::Intermediate || info.alias_of.is_some() {
                continue;
            }
            if bound.storage[index].is_some() {
                continue;
            }
            let id = ValueId(index as u32);
            let desc = dims.resolve_desc(&info.desc)?;
            bound.storage[index] = Some(reuse_or_allocate(backend, &mut self.scratch, id, &desc)?);
        }
        for (index, info) in graph.values().iter().enumerate() {
            if info.alias_of.is_some() {
                let root = graph.storage_root(ValueId(index as u32));
                bound.storage[index] = bound.storage[root.index()].clone();
            }
        }

        if mode == BindMode::Pinned && self.pinned.is_none() {
            self.pinned = Some(signature);
        }
        Ok(bound)
    }

    /// Range-checks slot mappings, block tables and context lengths of every
    /// cache operator. Index tensors produced on the device are skipped.
    fn check_indices(
        &self,
        backend: &B,
        graph: &Graph,
        externals: &[B::Buffer],
        bound: &Bound<B::Buffer>,
    ) -> Result<()> {
        let slots: HashMap<ValueId, usize> = graph
            .external_slots()
            .enumerate()
            .map(|(index, id)| (id, index))
            .collect();
        let mut host: HashMap<ValueId, Vec<i32>> = HashMap::new();
        let mut read = |id: ValueId| -> Result<Option<Vec<i32>>> {
            let root = graph.storage_root(id);
            let Some(&slot) = slots.get(&root) else {
                return Ok(None);
            };
            if let Some(values) = host.get(&root) {
                return Ok(Some(values.clone()));
            }
            let tensor = match backend.download(&externals[slot]) {
                Ok(tensor) => tensor,
                Err(BackendError::Unsupported { .. }) => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            let values = tensor
                .as_i32()
                .ok_or_else(|| {
                    GraphError::shape(format!(
                        "index slot {} holds {}, expected i32",
                        graph.values()[root.index()].name,
                        tensor.dtype()
                    ))
                })?
                .to_vec();
            host.insert(root, values.clone());
            Ok(Some(values))
        };

        for node_id in &self.plan.order {
            let node = &graph.nodes()[node_id.index()];
            let checked = match &node.op {
                Op::ReshapeAndCache => {
                    let geometry = cache_geometry(backend, bound, node.inputs[2], node.inputs[0])?;
                    match read(node.inputs[4])? {
                        Some(slot_mapping) => validate_indices(&geometry, &slot_mapping, &[], &[]),
                        None => continue,
                    }
                }
                Op::PagedAttention(_) => {
                    let geometry = cache_geometry(backend, bound, node.inputs[1], node.inputs[0])?;
                    match (read(node.inputs[3])?, read(node.inputs[4])?) {
                        (Some(block_tables), Some(context_lens)) => {
                            validate_indices(&geometry, &[], &block_tables, &context_lens)
                        }
                        _ => continue,
                    }
                }
                _ => continue,
            };
            checked.map_err(|err| err.context(format!("{node_id} ({})", node.op.name())))?;
        }
        Ok(())
    }

    fn check_pinned(&self, graph: &Graph, slots: &[ValueId], signature: &[SlotSignature]) -> Result<()> {
        let Some(pinned) = &self.pinned else {
            return Ok(());
        };
        let ids = slots.iter().chain(graph.outputs().iter());
        for ((id, expected), actual) in ids.zip(pinned).zip(signature) {
            let name = &graph.values()[id.index()].name;
            if expected.dims != actual.dims {
                return Err(GraphError::shape(format!(
                    "slot {name} was first bound with dims {:?}, now {:?}",
                    expected.dims, actual.dims
                )));
            }
            if expected.layout != actual.layout {
                return Err(GraphError::layout(format!(
                    "slot {name} was first bound as {}, now {}",
                    expected.layout, actual.layout
                )));
            }
        }
        Ok(())
    }
}

/// Geometry of the cache bound to `cache`, with the head width taken from the
/// last axis of `heads` (the key rows or the query).
fn cache_geometry<B: OpBackend>(
    backend: &B,
    bound: &Bound<B::Buffer>,
    cache: ValueId,
    heads: ValueId,
) -> Result<KvCacheGeometry> {
    let dims_of = |id: ValueId| -> Result<Vec<usize>> {
        let buffer = collect(&bound.storage, &[id])?;
        backend.describe(&buffer[0]).require_static()
    };
    let head_dim = dims_of(heads)?.last().copied().unwrap_or(0);
    KvCacheGeometry::from_cache_dims(&dims_of(cache)?, head_dim)
}

fn is_overwritten(graph: &Graph, id: ValueId) -> bool {
    graph.values().iter().any(|info| info.alias_of == Some(id))
}

fn reuse_or_allocate<B: OpBackend>(
    backend: &B,
    cache: &mut HashMap<ValueId, B::Buffer>,
    id: ValueId,
    desc: &TensorDesc,
) -> Result<B::Buffer> {
    if let Some(buffer) = cache.get(&id) {
        if backend.describe(buffer) == *desc {
            return Ok(buffer.clone());
        }
    }
    let buffer = backend.allocate(desc)?;
    cache.insert(id, buffer.clone());
    Ok(buffer)
}

fn collect<Buf: Clone>(storage: &[Option<Buf>], ids: &[ValueId]) -> Result<Vec<Buf>> {
    ids.iter()
        .map(|id| {
            storage
                .get(id.index())
                .and_then(Option::clone)
                .ok_or_else(|| GraphError::compile(format!("{id} has no bound storage")))
        })
        .collect()
}
