use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::backend::hashing::hash_serializable;
use crate::error::Result;
use crate::ops::Op;
use crate::tensor::TensorDesc;

/// Handle of a value slot in a [`Graph`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Handle of a node in a [`Graph`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueRole {
    /// Bound per run by the caller.
    Input,
    /// Bound per run by the caller; conventionally model parameters.
    Weight,
    /// Produced by exactly one node.
    Intermediate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    pub desc: TensorDesc,
    pub role: ValueRole,
    /// Earlier version whose storage this value overwrites in place.
    pub alias_of: Option<ValueId>,
}

impl ValueInfo {
    pub fn new(name: impl Into<String>, desc: TensorDesc, role: ValueRole) -> Self {
        Self {
            name: name.into(),
            desc,
            role,
            alias_of: None,
        }
    }

    pub fn with_alias(mut self, source: ValueId) -> Self {
        self.alias_of = Some(source);
        self
    }

    pub fn is_external(&self) -> bool {
        matches!(self.role, ValueRole::Input | ValueRole::Weight)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: Op,
    pub inputs: SmallVec<[ValueId; 5]>,
    pub outputs: SmallVec<[ValueId; 2]>,
}

/// Immutable operator DAG with its expected slot descriptors.
///
/// Values and nodes live in flat arenas addressed by [`ValueId`] and
/// [`NodeId`]. Binding order is `inputs` followed by `weights`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    name: String,
    values: Vec<ValueInfo>,
    nodes: Vec<Node>,
    inputs: Vec<ValueId>,
    weights: Vec<ValueId>,
    outputs: Vec<ValueId>,
}

impl Graph {
    /// Assembles a graph from raw parts without checking it.
    ///
    /// Structural problems (cycles, unbound slots, multiple producers) are
    /// reported as compile errors when the graph is compiled.
    pub fn from_parts(
        name: impl Into<String>,
        values: Vec<ValueInfo>,
        nodes: Vec<Node>,
        inputs: Vec<ValueId>,
        weights: Vec<ValueId>,
        outputs: Vec<ValueId>,
    ) -> Self {
        Self {
            name: name.into(),
            values,
            nodes,
            inputs,
            weights,
            outputs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[ValueInfo] {
        &self.values
    }

    pub fn value(&self, id: ValueId) -> Option<&ValueInfo> {
        self.values.get(id.index())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn weights(&self) -> &[ValueId] {
        &self.weights
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Slots the caller binds, in binding order.
    pub fn external_slots(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.inputs.iter().chain(self.weights.iter()).copied()
    }

    /// Follows `alias_of` links back to the value that owns the storage.
    pub fn storage_root(&self, id: ValueId) -> ValueId {
        let mut current = id;
        let mut hops = 0;
        while let Some(source) = self.value(current).and_then(|info| info.alias_of) {
            current = source;
            hops += 1;
            if hops > self.values.len() {
                break;
            }
        }
        current
    }

    pub fn find_value(&self, name: &str) -> Option<ValueId> {
        self.values
            .iter()
            .position(|info| info.name == name)
            .map(|index| ValueId(index as u32))
    }

    /// Structural fingerprint; equal graphs share compiled plans.
    pub fn fingerprint(&self) -> Result<u64> {
        hash_serializable(self)
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {} {{", self.name)?;
        for id in self.external_slots() {
            if let Some(info) = self.value(id) {
                writeln!(f, "  {id} = {:?} {}: {}", info.role, info.name, info.desc)?;
            }
        }
        for (index, node) in self.nodes.iter().enumerate() {
            let outputs: Vec<String> = node.outputs.iter().map(ToString::to_string).collect();
            let inputs: Vec<String> = node.inputs.iter().map(ToString::to_string).collect();
            writeln!(
                f,
                "  n{index}: {} = {}({})",
                outputs.join(", "),
                node.op,
                inputs.join(", ")
            )?;
        }
        let outputs: Vec<String> = self.outputs.iter().map(ToString::to_string).collect();
        writeln!(f, "  return {}", outputs.join(", "))?;
        f.write_str("}")
    }
}
