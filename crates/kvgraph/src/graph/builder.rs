use smallvec::SmallVec;

use super::ir::{Graph, Node, ValueId, ValueInfo, ValueRole};
use super::topology;
use crate::error::{GraphError, Result};
use crate::ops::{contract, Op};
use crate::tensor::TensorDesc;

/// Stages values and nodes of a [`Graph`], checking each operator contract as
/// nodes are emitted.
#[derive(Debug)]
pub struct GraphBuilder {
    name: String,
    values: Vec<ValueInfo>,
    nodes: Vec<Node>,
    inputs: Vec<ValueId>,
    weights: Vec<ValueId>,
    outputs: Vec<ValueId>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            weights: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn push_value(&mut self, info: ValueInfo) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(info);
        id
    }

    /// Declares the next per-run input slot.
    pub fn input(&mut self, name: impl Into<String>, desc: TensorDesc) -> ValueId {
        let id = self.push_value(ValueInfo::new(name, desc, ValueRole::Input));
        self.inputs.push(id);
        id
    }

    /// Declares the next weight slot.
    pub fn weight(&mut self, name: impl Into<String>, desc: TensorDesc) -> ValueId {
        let id = self.push_value(ValueInfo::new(name, desc, ValueRole::Weight));
        self.weights.push(id);
        id
    }

    pub fn desc(&self, id: ValueId) -> Result<&TensorDesc> {
        self.values
            .get(id.index())
            .map(|info| &info.desc)
            .ok_or_else(|| GraphError::compile(format!("{id} is not part of graph {}", self.name)))
    }

    /// Appends a node and returns its outputs.
    ///
    /// In-place outputs are versions of the overwritten input and keep its name.
    pub fn emit(&mut self, op: Op, inputs: &[ValueId]) -> Result<SmallVec<[ValueId; 2]>> {
        let descs = inputs
            .iter()
            .map(|id| self.desc(*id).cloned())
            .collect::<Result<Vec<_>>>()?;
        let inferred = contract::infer(&op, &descs)?;

        let node_index = self.nodes.len();
        let mut outputs = SmallVec::new();
        for (index, desc) in inferred.into_iter().enumerate() {
            let alias = op
                .in_place()
                .iter()
                .find(|(output, _)| *output == index)
                .map(|(_, input)| inputs[*input]);
            let info = match alias {
                Some(source) => {
                    let name = self.values[source.index()].name.clone();
                    ValueInfo::new(name, desc, ValueRole::Intermediate).with_alias(source)
                }
                None => ValueInfo::new(
                    format!("{}.{node_index}.{index}", op.name()),
                    desc,
                    ValueRole::Intermediate,
                ),
            };
            outputs.push(self.push_value(info));
        }

        self.nodes.push(Node {
            op,
            inputs: inputs.iter().copied().collect(),
            outputs: outputs.clone(),
        });
        Ok(outputs)
    }

    /// [`GraphBuilder::emit`] for single-output operators.
    pub fn emit_one(&mut self, op: Op, inputs: &[ValueId]) -> Result<ValueId> {
        let name = op.name();
        let outputs = self.emit(op, inputs)?;
        match outputs.as_slice() {
            [single] => Ok(*single),
            _ => Err(GraphError::compile(format!(
                "{name} yields {} outputs, expected one",
                outputs.len()
            ))),
        }
    }

    pub fn rename(&mut self, id: ValueId, name: impl Into<String>) -> Result<()> {
        let graph = self.name.clone();
        let info = self
            .values
            .get_mut(id.index())
            .ok_or_else(|| GraphError::compile(format!("{id} is not part of graph {graph}")))?;
        info.name = name.into();
        Ok(())
    }

    pub fn output(&mut self, id: ValueId) {
        self.outputs.push(id);
    }

    /// Freezes the builder, running the same checks compilation does.
    pub fn finish(self) -> Result<Graph> {
        let graph = Graph::from_parts(
            self.name,
            self.values,
            self.nodes,
            self.inputs,
            self.weights,
            self.outputs,
        );
        topology::schedule(&graph)?;
        Ok(graph)
    }
}
