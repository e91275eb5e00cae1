//! Whole-graph properties: sessions, one-shot contexts and the model recipe.

use std::sync::Arc;

use anyhow::ensure;
use kvgraph::graph::recipes::{
    build_attn_with_output, build_embedding, build_paged_attn, build_rmsnorm, AttnOutput, ModelHead,
};
use kvgraph::ops::functional;
use kvgraph::{Context, DType, GraphConfig, GraphError, HostTensor, Layout, OpBackend, Session};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::fixtures::{allocate_outputs, changed_slots, random_weights, DecodeStep, ModelFixture};
use crate::small_config;

fn bits(values: &[f32]) -> Vec<u32> {
    values.iter().map(|v| v.to_bits()).collect()
}

pub fn session_runs_are_bit_identical<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let fixture = ModelFixture::new(backend.as_ref(), &small_config(), ModelHead::Hidden, 8, 16, 40, 7)?;
    let mut session = Session::new(Arc::clone(backend));
    session.add_graph(1, fixture.graph.clone());
    session.compile_graph(1)?;
    let outputs = allocate_outputs(backend.as_ref(), &fixture.graph)?;
    let inputs = fixture.session_inputs();

    session.run_async(1, &inputs, &outputs)?;
    session.synchronize()?;
    let first = backend.download(&outputs[0])?;
    session.run_async(1, &inputs, &outputs)?;
    session.synchronize()?;
    let second = backend.download(&outputs[0])?;

    ensure!(first.dims() == [3, 64], "hidden output dims {:?}", first.dims());
    ensure!(
        bits(&first.to_f32_vec()) == bits(&second.to_f32_vec()),
        "second run diverged from the first"
    );
    ensure!(session.executable(1).map(|exe| exe.runs()) == Some(2), "run count not tracked");
    Ok(())
}

/// Runs one greedy decode step and checks the token ids and that each cache
/// changed only in the slots the step addressed.
pub fn decode_step_touches_only_addressed_slots<B: OpBackend + 'static>(
    backend: &Arc<B>,
    config: &GraphConfig,
    num_pages: usize,
    page_size: usize,
    vocab: usize,
) -> anyhow::Result<()> {
    let fixture = ModelFixture::new(backend.as_ref(), config, ModelHead::Greedy, num_pages, page_size, vocab, 21)?;
    let mut session = Session::new(Arc::clone(backend));
    session.add_graph(0, fixture.graph.clone());
    session.compile_graph(0)?;
    let outputs = allocate_outputs(backend.as_ref(), &fixture.graph)?;
    session.run_async(0, &fixture.session_inputs(), &outputs)?;
    session.synchronize()?;

    let ids = backend.download(&outputs[0])?;
    ensure!(ids.dims() == [config.batch_size], "token ids dims {:?}", ids.dims());
    ensure!(ids.dtype() == DType::I32, "token ids dtype {}", ids.dtype());
    let ids = ids.as_i32().unwrap_or_default();
    ensure!(
        ids.iter().all(|id| (0..vocab as i32).contains(id)),
        "token ids outside the vocabulary: {ids:?}"
    );

    let addressed: Vec<usize> = fixture
        .step
        .slot_mapping
        .as_slice()
        .iter()
        .map(|slot| *slot as usize)
        .collect();
    for (cache, before) in fixture.caches.iter().zip(&fixture.initial_caches) {
        let changed = changed_slots(before, &backend.download(cache)?)?;
        ensure!(
            changed.iter().all(|slot| addressed.contains(slot)),
            "cache rows {changed:?} changed outside the addressed slots {addressed:?}"
        );
        ensure!(!changed.is_empty(), "decode step did not write the cache");
    }
    Ok(())
}

pub fn session_pins_first_binding<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let fixture = ModelFixture::new(backend.as_ref(), &small_config(), ModelHead::Greedy, 8, 16, 40, 8)?;
    let mut session = Session::new(Arc::clone(backend));
    session.add_graph(3, fixture.graph.clone());
    let outputs = allocate_outputs(backend.as_ref(), &fixture.graph)?;
    let mut inputs = fixture.session_inputs();

    let err = session.run_async(3, &inputs, &outputs);
    ensure!(matches!(err, Err(GraphError::Compile(_))), "uncompiled graph ran");
    ensure!(matches!(session.compile_graph(9), Err(GraphError::Compile(_))), "unknown id compiled");
    session.compile_graph(3)?;
    session.run_async(3, &inputs, &outputs)?;
    session.synchronize()?;

    let tables = fixture
        .graph
        .inputs()
        .iter()
        .position(|id| fixture.graph.values()[id.index()].name == "block_tables")
        .ok_or_else(|| anyhow::anyhow!("model has no block_tables input"))?;
    let width = fixture.step.table.max_blocks() + 1;
    let wider = HostTensor::from_i32(&[3, width], vec![0; 3 * width])?;
    inputs[tables] = backend.upload(&wider, Layout::Nd)?;
    let err = session.run_async(3, &inputs, &outputs);
    ensure!(matches!(err, Err(GraphError::Shape(_))), "rebinding with new dims was accepted");

    let previous = session.add_graph(3, fixture.graph.clone());
    ensure!(previous.is_some(), "re-registering did not return the old graph");
    ensure!(session.executable(3).is_none(), "re-registering kept the compiled state");
    Ok(())
}

fn paged_attn_inputs<B: OpBackend>(
    backend: &B,
    config: &GraphConfig,
    step: &DecodeStep,
    caches: [&HostTensor; 2],
    cache_layout: Layout,
    seed: u64,
) -> anyhow::Result<Vec<B::Buffer>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (batch, head_dim) = (config.batch_size, config.head_dim());
    let query = HostTensor::random(&[batch, config.num_heads, head_dim], DType::F16, 1.0, &mut rng)?;
    let key = HostTensor::random(&[batch, config.num_kv_heads, head_dim], DType::F16, 1.0, &mut rng)?;
    let value = HostTensor::random(&[batch, config.num_kv_heads, head_dim], DType::F16, 1.0, &mut rng)?;
    let mut buffers = Vec::with_capacity(8);
    for tensor in [&query, &key, &value] {
        buffers.push(backend.upload(tensor, Layout::Nd)?);
    }
    for cache in caches {
        buffers.push(backend.upload(cache, cache_layout)?);
    }
    for tensor in step.index_tensors()? {
        buffers.push(backend.upload(&tensor, Layout::Nd)?);
    }
    Ok(buffers)
}

pub fn context_stages_row_major_caches<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let config = small_config();
    let graph = build_paged_attn(&config)?;
    let mut rng = StdRng::seed_from_u64(31);
    let geometry = kvgraph::kv::KvCacheGeometry::new(8, 16, config.num_kv_heads, config.head_dim());
    let step = DecodeStep::random(&geometry, config.batch_size, 8, &mut rng)?;
    let cache_dims = [geometry.num_pages, geometry.page_size, geometry.row_width()];
    let key_cache = HostTensor::random(&cache_dims, DType::F16, 1.0, &mut rng)?;
    let value_cache = HostTensor::random(&cache_dims, DType::F16, 1.0, &mut rng)?;

    let mut context = Context::new(Arc::clone(backend));
    let mut results = Vec::new();
    for cache_layout in [Layout::FractalNz, Layout::Nd] {
        let inputs = paged_attn_inputs(backend.as_ref(), &config, &step, [&key_cache, &value_cache], cache_layout, 32)?;
        let layouts: Vec<Layout> = inputs.iter().map(|buffer| backend.describe(buffer).layout).collect();
        let outputs = allocate_outputs(backend.as_ref(), &graph)?;
        context.setup_then_run(&graph, &inputs, &layouts, &[], &outputs)?;
        results.push((
            backend.download(&outputs[0])?,
            backend.download(&inputs[3])?,
            backend.download(&inputs[4])?,
        ));
    }
    ensure!(context.cached_plans() == 1, "identical graphs compiled {} plans", context.cached_plans());
    ensure!(results[0] == results[1], "row-major caches produced different results");
    let written = changed_slots(&key_cache, &results[1].1)?;
    ensure!(!written.is_empty(), "staged cache writes were not copied back");
    Ok(())
}

pub fn context_rejects_misdeclared_layouts<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let config = small_config();
    let graph = build_paged_attn(&config)?;
    let mut rng = StdRng::seed_from_u64(33);
    let geometry = kvgraph::kv::KvCacheGeometry::new(8, 16, config.num_kv_heads, config.head_dim());
    let step = DecodeStep::random(&geometry, config.batch_size, 8, &mut rng)?;
    let cache = HostTensor::zeros(&[8, 16, geometry.row_width()], DType::F16);
    let inputs = paged_attn_inputs(backend.as_ref(), &config, &step, [&cache, &cache], Layout::FractalNz, 34)?;
    let outputs = allocate_outputs(backend.as_ref(), &graph)?;

    let mut context = Context::new(Arc::clone(backend));
    let all_nd = vec![Layout::Nd; inputs.len()];
    let err = context.setup_then_run(&graph, &inputs, &all_nd, &[], &outputs);
    ensure!(matches!(err, Err(GraphError::Layout(_))), "misdeclared cache layout accepted");
    let err = context.setup_then_run(&graph, &inputs[1..], &all_nd[1..], &[], &outputs);
    ensure!(matches!(err, Err(GraphError::Shape(_))), "missing input accepted");
    Ok(())
}

/// With no decoder layers the model is the embedding followed by the final
/// normalisation.
pub fn model_without_layers_is_embedding_then_norm<B: OpBackend + 'static>(
    backend: &Arc<B>,
) -> anyhow::Result<()> {
    let config = small_config().with_num_layers(0);
    let fixture = ModelFixture::new(backend.as_ref(), &config, ModelHead::Hidden, 8, 16, 40, 9)?;
    let (vocab_weight, final_norm) = (&fixture.weights[0], &fixture.weights[1]);
    let mut context = Context::new(Arc::clone(backend));

    let model_out = allocate_outputs(backend.as_ref(), &fixture.graph)?;
    context.setup_then_run(
        &fixture.graph,
        &fixture.inputs,
        &fixture.input_layouts(),
        &fixture.weights,
        &model_out,
    )?;

    let embedding = build_embedding(&config)?;
    let hidden = allocate_outputs(backend.as_ref(), &embedding)?;
    context.setup_then_run(&embedding, &fixture.inputs, &[Layout::Nd], &[vocab_weight.clone()], &hidden)?;
    let norm = build_rmsnorm(&config)?;
    let normed = allocate_outputs(backend.as_ref(), &norm)?;
    context.setup_then_run(&norm, &hidden, &[Layout::Nd], &[final_norm.clone()], &normed)?;

    let (model, staged) = (backend.download(&model_out[0])?, backend.download(&normed[0])?);
    ensure!(
        bits(&model.to_f32_vec()) == bits(&staged.to_f32_vec()),
        "layerless model differs from embedding then rmsnorm"
    );
    ensure!(context.cached_plans() == 3, "expected three cached plans");
    Ok(())
}

pub fn weights_bind_after_inputs<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let config = small_config();
    let graph = build_rmsnorm(&config)?;
    let mut rng = StdRng::seed_from_u64(35);
    let x = HostTensor::random(&[config.batch_size, config.hidden_size], DType::F16, 1.0, &mut rng)?;
    let x = backend.upload(&x, Layout::Nd)?;
    let weights = random_weights(backend.as_ref(), &graph, 1, &mut rng)?;
    let outputs = allocate_outputs(backend.as_ref(), &graph)?;

    let mut session = Session::new(Arc::clone(backend));
    session.add_graph(0, graph);
    session.compile_graph(0)?;
    session.compile_graph(0)?;
    let err = session.run_async(0, &[x.clone()], &outputs);
    ensure!(matches!(err, Err(GraphError::Shape(_))), "run without weights accepted");
    session.run_async(0, &[x.clone(), weights[0].clone()], &outputs)?;
    session.synchronize()?;

    let (eager, _) = functional::normalize(backend.as_ref(), &x, &weights[0], config.rms_norm_eps, None)?;
    ensure!(
        backend.download(&eager)? == backend.download(&outputs[0])?,
        "session rmsnorm differs from the eager operator"
    );
    Ok(())
}

pub fn attn_qk_norm_matches_eager_ops<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let config = small_config();
    let (batch, head_dim) = (config.batch_size, config.head_dim());
    let (q_size, kv_size) = (config.q_size(), config.kv_size());
    let graph = build_attn_with_output(&config, AttnOutput::NormedQk)?;
    let mut rng = StdRng::seed_from_u64(36);
    let x = HostTensor::random(&[batch, config.hidden_size], DType::F16, 1.0, &mut rng)?;
    let x = backend.upload(&x, Layout::Nd)?;
    let weights = random_weights(backend.as_ref(), &graph, 1, &mut rng)?;
    let outputs = allocate_outputs(backend.as_ref(), &graph)?;

    let mut session = Session::new(Arc::clone(backend));
    session.add_graph(0, graph);
    session.compile_graph(0)?;
    let mut inputs = vec![x.clone()];
    inputs.extend(weights.iter().cloned());
    session.run_async(0, &inputs, &outputs)?;
    session.synchronize()?;

    let qkv = backend.download(&functional::dense_matmul(backend.as_ref(), &x, &weights[0])?)?.to_f32_vec();
    let width = q_size + 2 * kv_size;
    let slice = |start: usize, len: usize| -> Vec<f32> {
        qkv.chunks(width).flat_map(|row| row[start..start + len].to_vec()).collect()
    };
    let heads = [
        (slice(0, q_size), config.num_heads, &weights[1], &outputs[0]),
        (slice(q_size, kv_size), config.num_kv_heads, &weights[2], &outputs[1]),
    ];
    for (rows, count, norm, produced) in heads {
        let rows = backend.upload(&HostTensor::f16(&[batch, count, head_dim], rows)?, Layout::Nd)?;
        let (expected, _) = functional::normalize(backend.as_ref(), &rows, norm, config.rms_norm_eps, None)?;
        let expected = backend.download(&expected)?;
        let produced = backend.download(produced)?;
        ensure!(produced.dims() == [batch, count * head_dim], "unexpected dims {:?}", produced.dims());
        ensure!(
            bits(&produced.to_f32_vec()) == bits(&expected.to_f32_vec()),
            "normalised rows differ from the eager operators"
        );
    }
    Ok(())
}
