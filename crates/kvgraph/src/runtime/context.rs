use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::debug;

use super::executable::{BindMode, DispatchOptions, Executable};
use super::plan::compile;
use crate::backend::spec::OpBackend;
use crate::error::{GraphError, Result};
use crate::graph::Graph;
use crate::tensor::Layout;

pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 64;

/// One-shot execution: bind, run and wait in a single call.
///
/// Compiled plans are cached by graph fingerprint, so calling
/// [`Context::setup_then_run`] repeatedly with the same graph compiles once.
pub struct Context<B: OpBackend> {
    backend: Arc<B>,
    plans: LruCache<u64, Executable<B>>,
    options: DispatchOptions,
}

impl<B: OpBackend> Context<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_capacity(backend, DEFAULT_PLAN_CACHE_CAPACITY)
    }

    pub fn with_capacity(backend: Arc<B>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            plans: LruCache::new(capacity),
            options: DispatchOptions::from_env(),
        }
    }

    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Number of compiled plans currently cached.
    pub fn cached_plans(&self) -> usize {
        self.plans.len()
    }

    /// Binds `inputs` (each stored as `input_layouts[i]`), `weights` and
    /// `outputs` to `graph`, dispatches it and blocks until the outputs are
    /// valid.
    ///
    /// A slot whose buffer layout differs from what its consumer requires is
    /// converted through a staging buffer; in-place slots are converted back
    /// afterwards.
    pub fn setup_then_run(
        &mut self,
        graph: &Graph,
        inputs: &[B::Buffer],
        input_layouts: &[Layout],
        weights: &[B::Buffer],
        outputs: &[B::Buffer],
    ) -> Result<()> {
        let fingerprint = graph.fingerprint()?;
        if !self.plans.contains(&fingerprint) {
            let plan = compile(self.backend.as_ref(), Arc::new(graph.clone()))?;
            self.plans.put(fingerprint, Executable::new(plan));
        } else {
            debug!(graph = graph.name(), fingerprint, "reusing cached plan");
        }
        let executable = self
            .plans
            .get_mut(&fingerprint)
            .ok_or_else(|| GraphError::compile(format!("plan for graph {} was evicted", graph.name())))?;

        let mut externals = Vec::with_capacity(inputs.len() + weights.len());
        externals.extend_from_slice(inputs);
        externals.extend_from_slice(weights);
        executable.launch(
            self.backend.as_ref(),
            &externals,
            Some(input_layouts),
            outputs,
            BindMode::Respecialize,
            self.options,
        )?;
        self.synchronize()
    }

    pub fn synchronize(&self) -> Result<()> {
        self.backend.synchronize().map_err(GraphError::from_sync)
    }
}
