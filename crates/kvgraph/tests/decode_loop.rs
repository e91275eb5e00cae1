use std::sync::Arc;

use kvgraph::graph::recipes::{build_model, build_paged_attn};
use kvgraph::kv::{validate_indices, BlockTable, KvCacheGeometry, PagePool, SlotMapping};
use kvgraph::runtime::DispatchOptions;
use kvgraph::{Context, DType, GraphError, HostTensor, Layout, OpBackend, Session};
use kvgraph_backend_ref_cpu::{CpuBackend, CpuBuffer};
use kvgraph_backend_tests::fixtures::{allocate_outputs, changed_slots, random_weights};
use kvgraph_backend_tests::small_config;
use rand::rngs::StdRng;
use rand::SeedableRng;

const VOCAB: usize = 40;

#[test]
fn greedy_decode_loop_writes_one_slot_per_request_per_step() -> anyhow::Result<()> {
    let config = small_config().with_num_layers(1);
    let backend = Arc::new(CpuBackend::new()?);
    let geometry = KvCacheGeometry::new(6, 16, config.num_kv_heads, config.head_dim());
    let graph = build_model(&config)?;
    let mut rng = StdRng::seed_from_u64(3);
    let weights = random_weights(backend.as_ref(), &graph, VOCAB, &mut rng)?;
    let key_cache = backend.allocate(&geometry.cache_desc())?;
    let value_cache = backend.allocate(&geometry.cache_desc())?;

    let steps = 4;
    let mut lens = vec![3usize, 15, 20];
    let mut pool = PagePool::new(geometry.num_pages);
    let mut table = BlockTable::new(lens.len(), geometry.page_size);
    for (request, len) in lens.iter().enumerate() {
        table.reserve(&mut pool, request, len + steps)?;
    }
    table.check_geometry(&geometry)?;
    assert_eq!(pool.available(), 1);
    let block_tables = table.to_tensor()?;
    assert_eq!(block_tables.dims(), [3, 2]);

    let mut session = Session::new(Arc::clone(&backend));
    session.add_graph(0, graph.clone());
    session.compile_graph(0)?;
    let outputs = allocate_outputs(backend.as_ref(), &graph)?;
    let mut tokens = vec![1i32, 2, 3];
    let mut before = backend.download(&key_cache)?;

    for _ in 0..steps {
        let slots = SlotMapping::from_positions(&table, &lens)?;
        let context_lens: Vec<i32> = lens.iter().map(|len| *len as i32 + 1).collect();
        validate_indices(
            &geometry,
            slots.as_slice(),
            block_tables.as_i32().unwrap_or_default(),
            &context_lens,
        )?;

        let mut inputs = vec![
            backend.upload(&HostTensor::from_i32(&[3], tokens.clone())?, Layout::Nd)?,
            key_cache.clone(),
            value_cache.clone(),
            backend.upload(&slots.to_tensor()?, Layout::Nd)?,
            backend.upload(&block_tables, Layout::Nd)?,
            backend.upload(&HostTensor::from_i32(&[3], context_lens)?, Layout::Nd)?,
        ];
        inputs.extend(weights.iter().cloned());
        session.run_async(0, &inputs, &outputs)?;
        session.synchronize()?;

        let after = backend.download(&key_cache)?;
        let mut expected: Vec<usize> = slots.as_slice().iter().map(|slot| *slot as usize).collect();
        expected.sort_unstable();
        assert_eq!(changed_slots(&before, &after)?, expected);
        before = after;

        let next = backend.download(&outputs[0])?;
        tokens = next.as_i32().unwrap_or_default().to_vec();
        assert!(tokens.iter().all(|id| (0..VOCAB as i32).contains(id)), "{tokens:?}");
        for len in lens.iter_mut() {
            *len += 1;
        }
    }

    for page in table.row(0).unwrap_or_default() {
        pool.free(*page)?;
    }
    assert_eq!(pool.available(), 2);
    Ok(())
}

/// One-layer model inputs over three single-page requests.
fn single_page_step(
    backend: &CpuBackend,
    geometry: &KvCacheGeometry,
    slots: Vec<i32>,
    context_lens: Vec<i32>,
    weights: &[CpuBuffer],
) -> anyhow::Result<Vec<CpuBuffer>> {
    let table = BlockTable::contiguous(3, 1, geometry.page_size);
    let mut inputs = vec![
        backend.upload(&HostTensor::from_i32(&[3], vec![0, 1, 2])?, Layout::Nd)?,
        backend.allocate(&geometry.cache_desc())?,
        backend.allocate(&geometry.cache_desc())?,
        backend.upload(&HostTensor::from_i32(&[3], slots)?, Layout::Nd)?,
        backend.upload(&table.to_tensor()?, Layout::Nd)?,
        backend.upload(&HostTensor::from_i32(&[3], context_lens)?, Layout::Nd)?,
    ];
    inputs.extend(weights.iter().cloned());
    Ok(inputs)
}

#[test]
fn unchecked_out_of_range_indices_surface_at_synchronize() -> anyhow::Result<()> {
    let config = small_config().with_num_layers(1);
    let backend = Arc::new(CpuBackend::new()?);
    let geometry = KvCacheGeometry::new(4, 16, config.num_kv_heads, config.head_dim());
    let graph = build_model(&config)?;
    let mut rng = StdRng::seed_from_u64(4);
    let weights = random_weights(backend.as_ref(), &graph, VOCAB, &mut rng)?;

    let bad_slots = vec![0, 16, geometry.num_slots() as i32];
    let context_lens = vec![1, 1, 1];
    let host_check = validate_indices(
        &geometry,
        &bad_slots,
        BlockTable::contiguous(3, 1, geometry.page_size).to_tensor()?.as_i32().unwrap_or_default(),
        &context_lens,
    );
    assert!(matches!(host_check, Err(GraphError::Range(_))));

    let inputs = single_page_step(&backend, &geometry, bad_slots, context_lens, &weights)?;
    let outputs = allocate_outputs(backend.as_ref(), &graph)?;
    let mut session = Session::new(Arc::clone(&backend))
        .with_options(DispatchOptions::default().with_check_indices(false));
    session.add_graph(0, graph);
    session.compile_graph(0)?;
    session.run_async(0, &inputs, &outputs)?;
    let err = session.synchronize().unwrap_err();
    assert!(matches!(err, GraphError::Range(_)), "{err}");
    assert!(err.to_string().contains("slot"), "{err}");
    session.synchronize()?;
    Ok(())
}

#[test]
fn checked_runs_reject_long_contexts_before_touching_caches() -> anyhow::Result<()> {
    let config = small_config().with_num_layers(1);
    let backend = Arc::new(CpuBackend::new()?);
    let geometry = KvCacheGeometry::new(4, 16, config.num_kv_heads, config.head_dim());
    let graph = build_model(&config)?;
    let mut rng = StdRng::seed_from_u64(5);
    let weights = random_weights(backend.as_ref(), &graph, VOCAB, &mut rng)?;
    let outputs = allocate_outputs(backend.as_ref(), &graph)?;

    let mut session = Session::new(Arc::clone(&backend));
    assert!(session.options().check_indices);
    session.add_graph(0, graph);
    session.compile_graph(0)?;

    // the third request claims 17 tokens but owns one page of 16
    let inputs = single_page_step(&backend, &geometry, vec![0, 16, 32], vec![1, 1, 17], &weights)?;
    let before = backend.download(&inputs[1])?;
    let err = session.run_async(0, &inputs, &outputs).unwrap_err();
    assert!(matches!(err, GraphError::Range(_)), "{err}");
    assert!(err.to_string().contains("paged_attention"), "{err}");
    assert!(err.to_string().contains("context length 17"), "{err}");
    session.synchronize()?;
    assert!(changed_slots(&before, &backend.download(&inputs[1])?)?.is_empty());

    let inputs = single_page_step(&backend, &geometry, vec![0, 16, 64], vec![1, 1, 1], &weights)?;
    let err = session.run_async(0, &inputs, &outputs).unwrap_err();
    assert!(matches!(err, GraphError::Range(_)), "{err}");
    assert!(err.to_string().contains("reshape_and_cache"), "{err}");

    let inputs = single_page_step(&backend, &geometry, vec![0, 16, 32], vec![1, 1, 1], &weights)?;
    let before = backend.download(&inputs[1])?;
    session.run_async(0, &inputs, &outputs)?;
    session.synchronize()?;
    assert_eq!(changed_slots(&before, &backend.download(&inputs[1])?)?, [0, 16, 32]);
    Ok(())
}

#[test]
fn one_shot_runs_check_indices_before_dispatch() -> anyhow::Result<()> {
    let config = small_config();
    let backend = Arc::new(CpuBackend::new()?);
    let geometry = KvCacheGeometry::new(4, 16, config.num_kv_heads, config.head_dim());
    let graph = build_paged_attn(&config)?;
    let mut rng = StdRng::seed_from_u64(6);
    let (batch, head_dim) = (config.batch_size, config.head_dim());
    let rows = |heads: usize, rng: &mut StdRng| -> anyhow::Result<CpuBuffer> {
        let host = HostTensor::random(&[batch, heads, head_dim], DType::F16, 1.0, rng)?;
        Ok(backend.upload(&host, Layout::Nd)?)
    };
    let inputs = vec![
        rows(config.num_heads, &mut rng)?,
        rows(config.num_kv_heads, &mut rng)?,
        rows(config.num_kv_heads, &mut rng)?,
        backend.allocate(&geometry.cache_desc())?,
        backend.allocate(&geometry.cache_desc())?,
        backend.upload(&HostTensor::from_i32(&[3], vec![0, 16, 32])?, Layout::Nd)?,
        backend.upload(&BlockTable::contiguous(3, 1, geometry.page_size).to_tensor()?, Layout::Nd)?,
        backend.upload(&HostTensor::from_i32(&[3], vec![1, 1, 17])?, Layout::Nd)?,
    ];
    let layouts: Vec<Layout> = inputs.iter().map(|buffer| backend.describe(buffer).layout).collect();
    let outputs = allocate_outputs(backend.as_ref(), &graph)?;
    let before = backend.download(&inputs[3])?;

    let mut context = Context::new(Arc::clone(&backend));
    let err = context
        .setup_then_run(&graph, &inputs, &layouts, &[], &outputs)
        .unwrap_err();
    assert!(matches!(err, GraphError::Range(_)), "{err}");
    assert!(changed_slots(&before, &backend.download(&inputs[3])?)?.is_empty());
    Ok(())
}
