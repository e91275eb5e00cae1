use std::sync::Arc;

use tracing::debug;

use crate::backend::spec::{KernelPlan, OpBackend};
use crate::error::Result;
use crate::graph::{topology, Graph, NodeId, ValueId};

/// Dispatch order and kernel choices for one graph on one backend.
#[derive(Debug, Clone)]
pub(crate) struct CompiledPlan {
    pub(crate) graph: Arc<Graph>,
    pub(crate) order: Vec<NodeId>,
    /// Aligned with `order`.
    pub(crate) kernels: Vec<KernelPlan>,
    pub(crate) workspace_bytes: usize,
}

pub(crate) fn compile<B: OpBackend>(backend: &B, graph: Arc<Graph>) -> Result<CompiledPlan> {
    let schedule = topology::schedule(&graph)?;
    let mut kernels = Vec::with_capacity(schedule.order.len());
    for node_id in &schedule.order {
        let node = &graph.nodes()[node_id.index()];
        let desc = |id: &ValueId| graph.values()[id.index()].desc.clone();
        let inputs: Vec<_> = node.inputs.iter().map(desc).collect();
        let outputs: Vec<_> = node.outputs.iter().map(desc).collect();
        kernels.push(backend.prepare(&node.op, &inputs, &outputs)?);
    }
    let workspace_bytes = kernels
        .iter()
        .map(|kernel| kernel.workspace_bytes)
        .max()
        .unwrap_or(0);
    debug!(
        graph = graph.name(),
        backend = backend.backend_name(),
        nodes = schedule.order.len(),
        workspace_bytes,
        "compiled graph"
    );
    Ok(CompiledPlan {
        graph,
        order: schedule.order,
        kernels,
        workspace_bytes,
    })
}
