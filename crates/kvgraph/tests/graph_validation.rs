use std::sync::Arc;

use kvgraph::graph::{recipes, Graph, Node, ValueId, ValueInfo, ValueRole};
use kvgraph::ops::{Op, ReshapeParams};
use kvgraph::tensor::Shape;
use kvgraph::{DType, GraphConfig, GraphError, Session, TensorDesc};
use kvgraph_backend_tests::recording_backend::RecordingBackend;
use smallvec::smallvec;

fn desc() -> TensorDesc {
    TensorDesc::new([2, 4], DType::F16)
}

fn value(name: &str, role: ValueRole) -> ValueInfo {
    ValueInfo::new(name, desc(), role)
}

fn reshape(input: u32, output: u32) -> Node {
    Node {
        op: Op::Reshape(ReshapeParams {
            shape: Shape::from([2, 4]),
        }),
        inputs: smallvec![ValueId(input)],
        outputs: smallvec![ValueId(output)],
    }
}

fn compile(graph: Graph) -> kvgraph::Result<()> {
    let mut session = Session::new(Arc::new(RecordingBackend::default()));
    session.add_graph(0, graph);
    session.compile_graph(0)
}

fn three_values() -> Vec<ValueInfo> {
    vec![
        value("x", ValueRole::Input),
        value("a", ValueRole::Intermediate),
        value("b", ValueRole::Intermediate),
    ]
}

#[test]
fn well_formed_chain_compiles() {
    let graph = Graph::from_parts(
        "chain",
        three_values(),
        vec![reshape(0, 1), reshape(1, 2)],
        vec![ValueId(0)],
        vec![],
        vec![ValueId(2)],
    );
    assert!(compile(graph).is_ok());
}

#[test]
fn cycles_are_rejected() {
    let graph = Graph::from_parts(
        "cycle",
        three_values(),
        vec![reshape(2, 1), reshape(1, 2)],
        vec![ValueId(0)],
        vec![],
        vec![ValueId(2)],
    );
    let err = compile(graph).unwrap_err();
    assert!(matches!(err, GraphError::Compile(_)));
    assert!(err.to_string().contains("cycle"), "{err}");
}

#[test]
fn values_without_a_producer_are_rejected() {
    let graph = Graph::from_parts(
        "unbound",
        three_values(),
        vec![reshape(1, 2)],
        vec![ValueId(0)],
        vec![],
        vec![ValueId(2)],
    );
    let err = compile(graph).unwrap_err();
    assert!(matches!(err, GraphError::Compile(_)));
    assert!(err.to_string().contains("never bound"), "{err}");
}

#[test]
fn unlisted_weights_are_rejected() {
    let mut values = three_values();
    values.push(value("w", ValueRole::Weight));
    let graph = Graph::from_parts(
        "unlisted",
        values,
        vec![reshape(0, 1), reshape(1, 2)],
        vec![ValueId(0)],
        vec![],
        vec![ValueId(2)],
    );
    assert!(matches!(compile(graph), Err(GraphError::Compile(_))));
}

#[test]
fn multiple_producers_are_rejected() {
    let graph = Graph::from_parts(
        "two_writers",
        three_values(),
        vec![reshape(0, 1), reshape(0, 1), reshape(1, 2)],
        vec![ValueId(0)],
        vec![],
        vec![ValueId(2)],
    );
    let err = compile(graph).unwrap_err();
    assert!(err.to_string().contains("multiple producers"), "{err}");
}

#[test]
fn writes_to_bound_slots_are_rejected() {
    let graph = Graph::from_parts(
        "overwrite_input",
        three_values(),
        vec![reshape(1, 0), reshape(0, 1), reshape(1, 2)],
        vec![ValueId(0)],
        vec![],
        vec![ValueId(2)],
    );
    assert!(matches!(compile(graph), Err(GraphError::Compile(_))));
}

#[test]
fn dangling_ids_are_rejected() {
    let graph = Graph::from_parts(
        "dangling",
        three_values(),
        vec![reshape(0, 1), reshape(1, 2)],
        vec![ValueId(0)],
        vec![],
        vec![ValueId(7)],
    );
    assert!(matches!(compile(graph), Err(GraphError::Compile(_))));
}

#[test]
fn aliases_need_an_in_place_writer() {
    let mut values = three_values();
    values[2] = values[2].clone().with_alias(ValueId(1));
    let graph = Graph::from_parts(
        "fake_alias",
        values,
        vec![reshape(0, 1), reshape(1, 2)],
        vec![ValueId(0)],
        vec![],
        vec![ValueId(2)],
    );
    let err = compile(graph).unwrap_err();
    assert!(err.to_string().contains("alias"), "{err}");
}

#[test]
fn declared_outputs_must_match_the_contract() {
    let mut values = three_values();
    values[2].desc = TensorDesc::new([2, 4], DType::F32);
    let graph = Graph::from_parts(
        "wrong_dtype",
        values,
        vec![reshape(0, 1), reshape(1, 2)],
        vec![ValueId(0)],
        vec![],
        vec![ValueId(2)],
    );
    assert!(matches!(compile(graph), Err(GraphError::Shape(_))));
}

#[test]
fn unknown_and_uncompiled_ids_are_compile_errors() {
    let mut session = Session::new(Arc::new(RecordingBackend::default()));
    assert!(matches!(session.compile_graph(4), Err(GraphError::Compile(_))));
    assert!(matches!(session.run_async(4, &[], &[]), Err(GraphError::Compile(_))));
    assert!(session.graph_ids().next().is_none());
}

#[test]
fn removed_graphs_are_forgotten() -> anyhow::Result<()> {
    let config = GraphConfig::default().with_batch_size(2).with_hidden_size(32);
    let mut session = Session::new(Arc::new(RecordingBackend::default()));
    session.add_graph(1, recipes::build_embedding(&config)?);
    session.add_graph(3, recipes::build_rmsnorm(&config)?);
    session.compile_graph(1)?;
    assert_eq!(session.graph_ids().collect::<Vec<_>>(), [1, 3]);

    let removed = session.remove_graph(1).expect("graph 1 was registered");
    assert_eq!(removed.name(), "embedding");
    assert!(session.executable(1).is_none());
    assert!(session.remove_graph(1).is_none());
    assert!(matches!(session.compile_graph(1), Err(GraphError::Compile(_))));
    assert_eq!(session.graph_ids().collect::<Vec<_>>(), [3]);
    Ok(())
}
