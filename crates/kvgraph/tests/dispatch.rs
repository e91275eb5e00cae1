use std::sync::Arc;

use kvgraph::graph::recipes::{
    build_mlp, build_model, build_paged_attn, build_rmsnorm, DIM_MAX_BLOCKS, DIM_PAGES, DIM_PAGE_SIZE, DIM_VOCAB,
};
use kvgraph::runtime::Context;
use kvgraph::tensor::Dim;
use kvgraph::{Graph, GraphConfig, HostTensor, Layout, OpBackend, Session};
use kvgraph_backend_tests::fixtures::allocate_outputs;
use kvgraph_backend_tests::recording_backend::{RecordedBuffer, RecordingBackend};
use kvgraph_backend_tests::small_config;

fn extent(dim: &Dim) -> usize {
    match dim {
        Dim::Static(n) => *n,
        Dim::Dynamic(sym) => match sym.as_str() {
            DIM_PAGES => 8,
            DIM_PAGE_SIZE => 16,
            DIM_MAX_BLOCKS => 2,
            DIM_VOCAB => 40,
            other => panic!("unexpected symbol {other}"),
        },
    }
}

/// Zero buffers for every input and weight, stored in `cache_layout` for the
/// tiled slots and row-major otherwise.
fn bind_all(backend: &RecordingBackend, graph: &Graph, cache_layout: Layout) -> Vec<RecordedBuffer> {
    graph
        .external_slots()
        .map(|id| {
            let desc = &graph.values()[id.index()].desc;
            let dims: Vec<usize> = desc.dims().iter().map(extent).collect();
            let layout = match desc.layout {
                Layout::FractalNz => cache_layout,
                Layout::Nd => Layout::Nd,
            };
            backend
                .upload(&HostTensor::zeros(&dims, desc.dtype), layout)
                .expect("upload")
        })
        .collect()
}

#[test]
fn session_compiles_once_and_dispatches_in_dependency_order() -> anyhow::Result<()> {
    let backend = Arc::new(RecordingBackend::with_workspace(256));
    let graph = build_model(&small_config())?;
    let node_count = graph.nodes().len();
    let mut session = Session::new(Arc::clone(&backend));
    session.add_graph(7, graph.clone());
    session.compile_graph(7)?;
    session.compile_graph(7)?;
    assert_eq!(backend.prepared().len(), node_count);

    let executable = session.executable(7).expect("compiled");
    assert_eq!(executable.node_count(), node_count);
    assert_eq!(executable.workspace_bytes(), 256);
    assert!(executable.kernels().all(|kernel| kernel.starts_with("recording.")));

    let inputs = bind_all(&backend, &graph, Layout::FractalNz);
    let outputs = allocate_outputs(backend.as_ref(), &graph)?;
    session.run_async(7, &inputs, &outputs)?;
    session.synchronize()?;

    let enqueued = backend.enqueued();
    assert_eq!(enqueued.len(), node_count);
    assert_eq!(enqueued.first(), Some(&"embedding"));
    assert_eq!(enqueued.last(), Some(&"argmax"));
    let writes: Vec<usize> = positions(&enqueued, "reshape_and_cache");
    let reads: Vec<usize> = positions(&enqueued, "paged_attention");
    assert_eq!(writes.len(), 2);
    assert_eq!(reads.len(), 2);
    assert!(writes.iter().zip(&reads).all(|(w, r)| w < r));
    assert!(backend.conversions().is_empty());
    Ok(())
}

fn positions(ops: &[&str], name: &str) -> Vec<usize> {
    ops.iter()
        .enumerate()
        .filter(|(_, op)| **op == name)
        .map(|(index, _)| index)
        .collect()
}

#[test]
fn context_reuses_plans_by_fingerprint() -> anyhow::Result<()> {
    let backend = Arc::new(RecordingBackend::default());
    let mut context = Context::new(Arc::clone(&backend));
    let config = small_config();

    for _ in 0..2 {
        let graph = build_mlp(&config)?;
        let buffers = bind_all(&backend, &graph, Layout::Nd);
        let outputs = allocate_outputs(backend.as_ref(), &graph)?;
        context.setup_then_run(&graph, &buffers[..1], &[Layout::Nd], &buffers[1..], &outputs)?;
    }
    assert_eq!(context.cached_plans(), 1);
    assert_eq!(backend.prepared().len(), 3);
    assert_eq!(backend.enqueued().len(), 6);

    let wider = build_mlp(&config.clone().with_intermediate_size(128))?;
    let buffers = bind_all(&backend, &wider, Layout::Nd);
    let outputs = allocate_outputs(backend.as_ref(), &wider)?;
    context.setup_then_run(&wider, &buffers[..1], &[Layout::Nd], &buffers[1..], &outputs)?;
    assert_eq!(context.cached_plans(), 2);
    assert_eq!(backend.prepared().len(), 6);
    Ok(())
}

#[test]
fn context_evicts_least_recently_used_plan() -> anyhow::Result<()> {
    let backend = Arc::new(RecordingBackend::default());
    let mut context = Context::with_capacity(Arc::clone(&backend), 1);
    let config = small_config();
    let mlp = build_mlp(&config)?;
    let norm = build_rmsnorm(&config)?;

    for graph in [&mlp, &norm, &mlp] {
        let buffers = bind_all(&backend, graph, Layout::Nd);
        let outputs = allocate_outputs(backend.as_ref(), graph)?;
        context.setup_then_run(graph, &buffers[..1], &[Layout::Nd], &buffers[1..], &outputs)?;
    }
    assert_eq!(context.cached_plans(), 1);
    assert_eq!(backend.prepared().len(), 3 + 1 + 3);
    Ok(())
}

#[test]
fn row_major_caches_are_staged_and_written_back() -> anyhow::Result<()> {
    let backend = Arc::new(RecordingBackend::default());
    let graph = build_paged_attn(&small_config())?;
    let mut context = Context::new(Arc::clone(&backend));
    let inputs = bind_all(&backend, &graph, Layout::Nd);
    let outputs = allocate_outputs(backend.as_ref(), &graph)?;
    let layouts = vec![Layout::Nd; inputs.len()];
    context.setup_then_run(&graph, &inputs, &layouts, &[], &outputs)?;

    assert_eq!(
        backend.conversions(),
        [
            (Layout::Nd, Layout::FractalNz),
            (Layout::Nd, Layout::FractalNz),
            (Layout::FractalNz, Layout::Nd),
            (Layout::FractalNz, Layout::Nd),
        ]
    );
    assert_eq!(backend.enqueued(), ["reshape_and_cache", "paged_attention"]);
    Ok(())
}

#[test]
fn config_json_drives_the_model_recipe() -> anyhow::Result<()> {
    let json = r#"{
        "batch_size": 2,
        "hidden_size": 64,
        "num_heads": 4,
        "num_kv_heads": 2,
        "intermediate_size": 96,
        "num_layers": 1
    }"#;
    let config = GraphConfig::from_json_str(json)?;
    let graph = build_model(&config)?;
    assert_eq!(graph.fingerprint()?, build_model(&config)?.fingerprint()?);
    let other = build_model(&config.clone().with_rms_norm_eps(1e-5))?;
    assert_ne!(graph.fingerprint()?, other.fingerprint()?);

    let dump = graph.to_string();
    assert!(dump.contains("paged_attention(heads=4, kv_heads=2"), "{dump}");
    assert!(dump.contains("layers.0.qkv_proj"), "{dump}");
    Ok(())
}
