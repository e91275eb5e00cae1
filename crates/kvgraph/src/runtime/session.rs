use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::executable::{BindMode, DispatchOptions, Executable};
use super::plan::compile;
use crate::backend::spec::OpBackend;
use crate::error::{GraphError, Result};
use crate::graph::Graph;

pub type GraphId = u32;

struct Entry<B: OpBackend> {
    graph: Arc<Graph>,
    executable: Option<Executable<B>>,
}

/// Table of registered graphs executed repeatedly on one backend stream.
///
/// Lifecycle per id: [`add_graph`](Session::add_graph), then
/// [`compile_graph`](Session::compile_graph) once, then any number of
/// [`run_async`](Session::run_async) calls. Completion is observed through
/// [`synchronize`](Session::synchronize).
pub struct Session<B: OpBackend> {
    backend: Arc<B>,
    entries: BTreeMap<GraphId, Entry<B>>,
    options: DispatchOptions,
}

impl<B: OpBackend> Session<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            entries: BTreeMap::new(),
            options: DispatchOptions::from_env(),
        }
    }

    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> DispatchOptions {
        self.options
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Registers `graph` under `id`, replacing and returning any previous graph
    /// along with its compiled state.
    pub fn add_graph(&mut self, id: GraphId, graph: Graph) -> Option<Arc<Graph>> {
        debug!(id, graph = graph.name(), "registering graph");
        self.entries
            .insert(
                id,
                Entry {
                    graph: Arc::new(graph),
                    executable: None,
                },
            )
            .map(|previous| previous.graph)
    }

    pub fn remove_graph(&mut self, id: GraphId) -> Option<Arc<Graph>> {
        self.entries.remove(&id).map(|entry| entry.graph)
    }

    pub fn graph_ids(&self) -> impl Iterator<Item = GraphId> + '_ {
        self.entries.keys().copied()
    }

    pub fn graph(&self, id: GraphId) -> Option<&Arc<Graph>> {
        self.entries.get(&id).map(|entry| &entry.graph)
    }

    pub fn executable(&self, id: GraphId) -> Option<&Executable<B>> {
        self.entries.get(&id).and_then(|entry| entry.executable.as_ref())
    }

    /// Orders the graph and selects kernels. Compiling twice is a no-op.
    pub fn compile_graph(&mut self, id: GraphId) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| GraphError::compile(format!("graph id {id} is not registered")))?;
        if entry.executable.is_some() {
            debug!(id, "graph already compiled");
            return Ok(());
        }
        let plan = compile(self.backend.as_ref(), Arc::clone(&entry.graph))?;
        entry.executable = Some(Executable::new(plan));
        Ok(())
    }

    /// Binds `inputs` (graph inputs followed by weights) and `outputs`, then
    /// enqueues the graph without waiting for it.
    ///
    /// The first run fixes every slot's dims and layout; later runs must bind
    /// buffers of the same shape and layout. Out-of-range indices are reported
    /// here when [`DispatchOptions::check_indices`] is set, otherwise by the
    /// next [`synchronize`](Session::synchronize).
    pub fn run_async(&mut self, id: GraphId, inputs: &[B::Buffer], outputs: &[B::Buffer]) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| GraphError::compile(format!("graph id {id} is not registered")))?;
        let executable = entry
            .executable
            .as_mut()
            .ok_or_else(|| GraphError::compile(format!("graph id {id} has not been compiled")))?;
        executable.launch(
            self.backend.as_ref(),
            inputs,
            None,
            outputs,
            BindMode::Pinned,
            self.options,
        )
    }

    /// Waits for all queued work and reports the first device failure.
    pub fn synchronize(&self) -> Result<()> {
        self.backend.synchronize().map_err(GraphError::from_sync)
    }
}
