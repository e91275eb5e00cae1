//! Structural validation and scheduling of a [`Graph`].

use std::collections::{BTreeSet, HashMap};

use super::ir::{Graph, NodeId, ValueId, ValueRole};
use crate::error::{GraphError, Result};
use crate::ops::contract;

/// Dispatch order of a validated graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub order: Vec<NodeId>,
    /// Producer of each value, indexed by [`ValueId`].
    pub producers: Vec<Option<NodeId>>,
}

fn check_id(graph: &Graph, id: ValueId, context: &str) -> Result<()> {
    if graph.value(id).is_none() {
        return Err(GraphError::compile(format!(
            "{context} references {id}, but graph {} has {} values",
            graph.name(),
            graph.values().len()
        )));
    }
    Ok(())
}

fn value_name(graph: &Graph, id: ValueId) -> &str {
    graph.value(id).map_or("?", |info| info.name.as_str())
}

/// Validates wiring, single-writer rules and operator contracts, then orders
/// the nodes.
///
/// Nodes are ordered by data dependencies plus one extra rule: a node that
/// overwrites a value in place runs after every other reader of that value.
/// Among ready nodes the one declared first wins, so recipes dispatch in the
/// order they were built.
pub fn schedule(graph: &Graph) -> Result<Schedule> {
    for (role, ids) in [
        (ValueRole::Input, graph.inputs()),
        (ValueRole::Weight, graph.weights()),
    ] {
        for id in ids {
            check_id(graph, *id, "binding list")?;
            let info = &graph.values()[id.index()];
            if info.role != role {
                return Err(GraphError::compile(format!(
                    "slot {} is listed as {role:?} but declared {:?}",
                    info.name, info.role
                )));
            }
        }
    }
    for id in graph.outputs() {
        check_id(graph, *id, "output list")?;
    }

    let mut producers: Vec<Option<NodeId>> = vec![None; graph.values().len()];
    for (index, node) in graph.nodes().iter().enumerate() {
        let node_id = NodeId(index as u32);
        let context = format!("node {node_id} ({})", node.op.name());
        if node.inputs.len() != node.op.num_inputs() || node.outputs.len() != node.op.num_outputs() {
            return Err(GraphError::compile(format!(
                "{context} has {} inputs and {} outputs, expected {} and {}",
                node.inputs.len(),
                node.outputs.len(),
                node.op.num_inputs(),
                node.op.num_outputs()
            )));
        }
        for id in node.inputs.iter().chain(node.outputs.iter()) {
            check_id(graph, *id, &context)?;
        }
        for output in &node.outputs {
            let info = &graph.values()[output.index()];
            if info.role != ValueRole::Intermediate {
                return Err(GraphError::compile(format!(
                    "{context} writes {:?} slot {}",
                    info.role, info.name
                )));
            }
            if let Some(previous) = producers[output.index()] {
                return Err(GraphError::compile(format!(
                    "value {} has multiple producers: {previous} and {node_id}",
                    info.name
                )));
            }
            producers[output.index()] = Some(node_id);
        }
    }

    for (index, info) in graph.values().iter().enumerate() {
        let id = ValueId(index as u32);
        let bound = match info.role {
            ValueRole::Input => graph.inputs().contains(&id),
            ValueRole::Weight => graph.weights().contains(&id),
            ValueRole::Intermediate => producers[index].is_some(),
        };
        if !bound {
            return Err(GraphError::compile(format!(
                "slot {} ({:?}) is never bound",
                info.name, info.role
            )));
        }
    }

    let overwrites = check_aliases(graph, &producers)?;
    verify_contracts(graph)?;

    // successors[a] holds nodes that must run after a
    let node_count = graph.nodes().len();
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); node_count];
    for (index, node) in graph.nodes().iter().enumerate() {
        for input in &node.inputs {
            if let Some(producer) = producers[input.index()] {
                successors[producer.index()].insert(index);
            }
            if let Some(writer) = overwrites.get(input) {
                if writer.index() != index {
                    successors[index].insert(writer.index());
                }
            }
        }
    }

    let mut indegree = vec![0usize; node_count];
    for targets in &successors {
        for target in targets {
            indegree[*target] += 1;
        }
    }
    let mut ready: BTreeSet<usize> = (0..node_count).filter(|n| indegree[*n] == 0).collect();
    let mut order = Vec::with_capacity(node_count);
    while let Some(next) = ready.pop_first() {
        order.push(NodeId(next as u32));
        for target in &successors[next] {
            indegree[*target] -= 1;
            if indegree[*target] == 0 {
                ready.insert(*target);
            }
        }
    }
    if order.len() != node_count {
        let stuck: Vec<String> = (0..node_count)
            .filter(|n| indegree[*n] > 0)
            .map(|n| format!("n{n} ({})", graph.nodes()[n].op.name()))
            .collect();
        return Err(GraphError::compile(format!(
            "graph {} has a cycle through {}",
            graph.name(),
            stuck.join(", ")
        )));
    }

    Ok(Schedule { order, producers })
}

/// Checks in-place versions and returns, for each overwritten value, the node
/// that overwrites it.
fn check_aliases(graph: &Graph, producers: &[Option<NodeId>]) -> Result<HashMap<ValueId, NodeId>> {
    let mut overwrites: HashMap<ValueId, NodeId> = HashMap::new();
    for (index, node) in graph.nodes().iter().enumerate() {
        let node_id = NodeId(index as u32);
        for (output, input) in node.op.in_place() {
            let out = node.outputs[*output];
            let source = node.inputs[*input];
            let declared = graph.values()[out.index()].alias_of;
            if declared != Some(source) {
                return Err(GraphError::compile(format!(
                    "{} overwrites {} in place but value {} does not alias it",
                    node.op.name(),
                    value_name(graph, source),
                    value_name(graph, out)
                )));
            }
            if let Some(previous) = overwrites.insert(source, node_id) {
                return Err(GraphError::compile(format!(
                    "value {} is overwritten in place by both {previous} and {node_id}",
                    value_name(graph, source)
                )));
            }
        }
    }

    for (index, info) in graph.values().iter().enumerate() {
        let Some(source) = info.alias_of else {
            continue;
        };
        check_id(graph, source, "alias")?;
        let written_by_alias = producers[index]
            .map(|producer| overwrites.get(&source) == Some(&producer))
            .unwrap_or(false);
        if !written_by_alias {
            return Err(GraphError::compile(format!(
                "value {} claims to alias {} but no in-place write produces it",
                info.name,
                value_name(graph, source)
            )));
        }
    }
    Ok(overwrites)
}

/// Re-runs every operator contract over the declared descriptors.
fn verify_contracts(graph: &Graph) -> Result<()> {
    for (index, node) in graph.nodes().iter().enumerate() {
        let inputs: Vec<_> = node
            .inputs
            .iter()
            .map(|id| graph.values()[id.index()].desc.clone())
            .collect();
        let inferred = contract::infer(&node.op, &inputs)?;
        for (output, expected) in node.outputs.iter().zip(inferred.iter()) {
            let declared = &graph.values()[output.index()].desc;
            if declared.dtype != expected.dtype
                || declared.layout != expected.layout
                || !declared.shape.compatible(&expected.shape)
            {
                return Err(GraphError::shape(format!(
                    "n{index} ({}) produces {expected} but {} is declared {declared}",
                    node.op.name(),
                    value_name(graph, *output)
                )));
            }
        }
    }
    Ok(())
}
