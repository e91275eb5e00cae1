//! Eager operator properties every backend must satisfy.

use std::sync::Arc;

use anyhow::{ensure, Context as _};
use kvgraph::kv::KvCacheGeometry;
use kvgraph::ops::{functional, Op};
use kvgraph::{DType, GraphError, HostTensor, Layout, OpBackend};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::assert_close;
use crate::fixtures::DecodeStep;

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

fn expect_kind<T>(result: kvgraph::Result<T>, kind: &str) -> anyhow::Result<()> {
    match result {
        Ok(_) => anyhow::bail!("expected a {kind} error, call succeeded"),
        Err(err) => {
            ensure!(err.kind() == kind, "expected a {kind} error, got {err}");
            Ok(())
        }
    }
}

pub fn gated_activation_matches_closed_form<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    let x = HostTensor::random(&[3, 32], DType::F16, 4.0, &mut rng)?;
    let y = functional::gated_activation(backend.as_ref(), &backend.upload(&x, Layout::Nd)?)?;
    let y = backend.download(&y)?;
    ensure!(y.dims() == [3, 16], "unexpected output dims {:?}", y.dims());

    let expected: Vec<f32> = x
        .to_f32_vec()
        .chunks(32)
        .flat_map(|row| {
            let (a, b) = row.split_at(16);
            a.iter()
                .zip(b)
                .map(|(a, b)| DType::F16.round_f32((a * sigmoid(*a)) * b))
                .collect::<Vec<_>>()
        })
        .collect();
    assert_close(&y.to_f32_vec(), &expected, 1e-3, 2e-3)
}

pub fn gated_activation_single_pair_is_exact<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    for (a, b) in [(0.75f32, -1.5f32), (-3.0, 2.0), (0.0, 7.0)] {
        let x = HostTensor::from_f32(&[1, 2], DType::F32, vec![a, b])?;
        let y = functional::gated_activation(backend.as_ref(), &backend.upload(&x, Layout::Nd)?)?;
        let y = backend.download(&y)?;
        ensure!(y.dims() == [1, 1], "unexpected output dims {:?}", y.dims());
        let expected = (a * sigmoid(a)) * b;
        let actual = y.to_f32_vec()[0];
        ensure!(
            actual.to_bits() == expected.to_bits(),
            "gated_activation([{a}, {b}]) = {actual}, expected {expected}"
        );
    }
    Ok(())
}

pub fn normalize_with_residual_returns_sum<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(12);
    let x = HostTensor::random(&[4, 64], DType::F16, 2.0, &mut rng)?;
    let r = HostTensor::random(&[4, 64], DType::F16, 2.0, &mut rng)?;
    let w = HostTensor::random(&[64], DType::F16, 1.0, &mut rng)?;
    let (xb, rb, wb) = (
        backend.upload(&x, Layout::Nd)?,
        backend.upload(&r, Layout::Nd)?,
        backend.upload(&w, Layout::Nd)?,
    );

    let (y, sum) = functional::normalize(backend.as_ref(), &xb, &wb, 1e-6, Some(&rb))?;
    let sum = sum.context("fused normalize must return the residual sum")?;
    let expected_sum: Vec<f32> = x
        .to_f32_vec()
        .iter()
        .zip(r.to_f32_vec())
        .map(|(a, b)| DType::F16.round_f32(a + b))
        .collect();
    ensure!(backend.download(&sum)?.to_f32_vec() == expected_sum, "residual sum differs from x + r");

    let (plain, none) = functional::normalize(backend.as_ref(), &sum, &wb, 1e-6, None)?;
    ensure!(none.is_none(), "unfused normalize returned a residual");
    ensure!(
        backend.download(&y)?.to_f32_vec() == backend.download(&plain)?.to_f32_vec(),
        "fused normalize differs from normalizing the sum"
    );
    Ok(())
}

fn rows_of(host: &HostTensor, start: usize, end: usize) -> anyhow::Result<HostTensor> {
    let cols = host.dims()[1];
    let values = host.to_f32_vec()[start * cols..end * cols].to_vec();
    Ok(HostTensor::from_f32(&[end - start, cols], host.dtype(), values)?)
}

fn group_weight(w: &HostTensor, group: usize) -> anyhow::Result<HostTensor> {
    let (n, k) = (w.dims()[1], w.dims()[2]);
    let values = w.to_f32_vec()[group * n * k..(group + 1) * n * k].to_vec();
    Ok(HostTensor::from_f32(&[n, k], w.dtype(), values)?)
}

fn grouped_against_dense<B: OpBackend>(backend: &B, boundaries: &[i64], seed: u64) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows = boundaries.last().copied().unwrap_or(0) as usize;
    let x = HostTensor::random(&[rows, 32], DType::F16, 1.0, &mut rng)?;
    let w = HostTensor::random(&[boundaries.len(), 8, 32], DType::F16, 0.2, &mut rng)?;

    let grouped = functional::grouped_matmul(
        backend,
        &backend.upload(&x, Layout::Nd)?,
        &backend.upload(&w, Layout::Nd)?,
        boundaries,
    )?;
    let grouped = backend.download(&grouped)?.to_f32_vec();

    let mut expected = Vec::with_capacity(rows * 8);
    let mut start = 0usize;
    for (group, end) in boundaries.iter().enumerate() {
        let end = *end as usize;
        if end > start {
            let xg = backend.upload(&rows_of(&x, start, end)?, Layout::Nd)?;
            let wg = backend.upload(&group_weight(&w, group)?, Layout::Nd)?;
            let dense = functional::dense_matmul(backend, &xg, &wg)?;
            expected.extend(backend.download(&dense)?.to_f32_vec());
        }
        start = end;
    }
    ensure!(grouped == expected, "grouped matmul differs from per-group dense matmul for {boundaries:?}");
    Ok(())
}

pub fn grouped_matmul_matches_dense_per_group<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    grouped_against_dense(backend.as_ref(), &[2, 2, 5, 7], 13)?;
    grouped_against_dense(backend.as_ref(), &[6], 14)?;
    grouped_against_dense(backend.as_ref(), &[0, 4], 15)
}

pub fn grouped_matmul_rejects_bad_boundaries<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let x = backend.upload(&HostTensor::zeros(&[5, 16], DType::F16), Layout::Nd)?;
    let w = backend.upload(&HostTensor::zeros(&[2, 4, 16], DType::F16), Layout::Nd)?;
    expect_kind(functional::grouped_matmul(backend.as_ref(), &x, &w, &[3, 2]), "range")?;
    expect_kind(functional::grouped_matmul(backend.as_ref(), &x, &w, &[3, 6]), "range")?;
    expect_kind(functional::grouped_matmul(backend.as_ref(), &x, &w, &[5]), "shape")
}

/// Dense softmax attention over the logical cache rows of each request.
fn dense_attention(
    query: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    step: &DecodeStep,
    geometry: &KvCacheGeometry,
    num_heads: usize,
    scale: f32,
) -> anyhow::Result<Vec<f32>> {
    let (head_dim, width) = (geometry.head_dim, geometry.row_width());
    let group = num_heads / geometry.num_kv_heads;
    let mut out = vec![0.0f32; step.batch() * num_heads * head_dim];
    for (request, len) in step.context_lens.iter().enumerate() {
        let slots = (0..*len as usize)
            .map(|position| step.table.slot_for(request, position))
            .collect::<kvgraph::Result<Vec<_>>>()?;
        for head in 0..num_heads {
            let col0 = (head / group) * head_dim;
            let q = &query[(request * num_heads + head) * head_dim..][..head_dim];
            let scores: Vec<f64> = slots
                .iter()
                .map(|slot| {
                    let k = &key_cache[slot * width + col0..][..head_dim];
                    q.iter().zip(k).map(|(a, b)| f64::from(a * b)).sum::<f64>() * f64::from(scale)
                })
                .collect();
            let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let weights: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
            let total: f64 = weights.iter().sum();
            let acc = &mut out[(request * num_heads + head) * head_dim..][..head_dim];
            for (slot, weight) in slots.iter().zip(&weights) {
                let v = &value_cache[slot * width + col0..][..head_dim];
                for (a, b) in acc.iter_mut().zip(v) {
                    *a += (weight / total) as f32 * b;
                }
            }
        }
    }
    Ok(out)
}

pub fn paged_attention_matches_dense_attention<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let (batch, num_heads) = (3, 4);
    let geometry = KvCacheGeometry::new(9, 16, 2, 16);
    let mut rng = StdRng::seed_from_u64(16);
    let step = DecodeStep::random(&geometry, batch, 32, &mut rng)?;
    let cache_dims = [geometry.num_pages, geometry.page_size, geometry.row_width()];

    let key_cache = backend.upload(&HostTensor::random(&cache_dims, DType::F16, 1.0, &mut rng)?, Layout::FractalNz)?;
    let value_cache = backend.upload(&HostTensor::random(&cache_dims, DType::F16, 1.0, &mut rng)?, Layout::FractalNz)?;
    let kv_dims = [batch, geometry.num_kv_heads, geometry.head_dim];
    let key = HostTensor::random(&kv_dims, DType::F16, 1.0, &mut rng)?;
    let value = HostTensor::random(&kv_dims, DType::F16, 1.0, &mut rng)?;
    let query = HostTensor::random(&[batch, num_heads, geometry.head_dim], DType::F16, 1.0, &mut rng)?;
    let [slots, tables, lens] = step.index_tensors()?;

    functional::reshape_and_cache(
        backend.as_ref(),
        &backend.upload(&key, Layout::Nd)?,
        &backend.upload(&value, Layout::Nd)?,
        &key_cache,
        &value_cache,
        &backend.upload(&slots, Layout::Nd)?,
    )?;
    let scale = 1.0 / (geometry.head_dim as f32).sqrt();
    let out = functional::paged_attention(
        backend.as_ref(),
        &backend.upload(&query, Layout::Nd)?,
        &key_cache,
        &value_cache,
        &backend.upload(&tables, Layout::Nd)?,
        &backend.upload(&lens, Layout::Nd)?,
        scale,
    )?;
    let out = backend.download(&out)?;
    ensure!(out.dims() == query.dims(), "attention output dims {:?}", out.dims());

    let keys = backend.download(&key_cache)?.to_f32_vec();
    let values = backend.download(&value_cache)?.to_f32_vec();
    let width = geometry.row_width();
    for (token, slot) in step.slot_mapping.as_slice().iter().enumerate() {
        let slot = *slot as usize;
        ensure!(
            keys[slot * width..(slot + 1) * width] == key.to_f32_vec()[token * width..(token + 1) * width],
            "key of token {token} was not written to slot {slot}"
        );
    }

    let expected = dense_attention(&query.to_f32_vec(), &keys, &values, &step, &geometry, num_heads, scale)?;
    assert_close(&out.to_f32_vec(), &expected, 2e-3, 5e-3)
}

pub fn reshape_and_cache_skips_padding<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let geometry = KvCacheGeometry::new(2, 16, 1, 16);
    let cache_dims = [2, 16, 16];
    let key_cache = backend.upload(&HostTensor::zeros(&cache_dims, DType::F16), Layout::FractalNz)?;
    let value_cache = backend.upload(&HostTensor::zeros(&cache_dims, DType::F16), Layout::FractalNz)?;
    let rows = HostTensor::f16(&[2, 1, 16], vec![1.0; 32])?;
    let rows = backend.upload(&rows, Layout::Nd)?;
    let slots = backend.upload(&HostTensor::from_i32(&[2], vec![-1, 21])?, Layout::Nd)?;
    functional::reshape_and_cache(backend.as_ref(), &rows, &rows, &key_cache, &value_cache, &slots)?;

    let before = HostTensor::zeros(&cache_dims, DType::F16);
    for cache in [&key_cache, &value_cache] {
        let changed = crate::fixtures::changed_slots(&before, &backend.download(cache)?)?;
        ensure!(changed == [geometry.slot(1, 5)?], "padding token touched the cache: {changed:?}");
    }
    Ok(())
}

pub fn index_faults_are_range_errors<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let cache_dims = [2, 16, 16];
    let cache = backend.upload(&HostTensor::zeros(&cache_dims, DType::F16), Layout::FractalNz)?;
    let rows = backend.upload(&HostTensor::zeros(&[1, 1, 16], DType::F16), Layout::Nd)?;
    let slots = backend.upload(&HostTensor::from_i32(&[1], vec![32])?, Layout::Nd)?;
    expect_kind(
        functional::reshape_and_cache(backend.as_ref(), &rows, &rows, &cache, &cache.clone(), &slots),
        "range",
    )?;

    let query = backend.upload(&HostTensor::zeros(&[1, 1, 16], DType::F16), Layout::Nd)?;
    let tables = backend.upload(&HostTensor::from_i32(&[1, 1], vec![0])?, Layout::Nd)?;
    let long = backend.upload(&HostTensor::from_i32(&[1], vec![17])?, Layout::Nd)?;
    expect_kind(
        functional::paged_attention(backend.as_ref(), &query, &cache, &cache, &tables, &long, 0.25),
        "range",
    )?;
    let missing_page = backend.upload(&HostTensor::from_i32(&[1, 1], vec![2])?, Layout::Nd)?;
    let one = backend.upload(&HostTensor::from_i32(&[1], vec![1])?, Layout::Nd)?;
    expect_kind(
        functional::paged_attention(backend.as_ref(), &query, &cache, &cache, &missing_page, &one, 0.25),
        "range",
    )?;

    let table = backend.upload(&HostTensor::zeros(&[4, 16], DType::F16), Layout::Nd)?;
    let ids = backend.upload(&HostTensor::from_i32(&[2], vec![1, 4])?, Layout::Nd)?;
    expect_kind(functional::run(backend.as_ref(), &Op::Embedding, &[&ids, &table]), "range")
}

pub fn empty_context_attends_to_nothing<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(17);
    let cache = HostTensor::random(&[1, 16, 16], DType::F16, 1.0, &mut rng)?;
    let key_cache = backend.upload(&cache, Layout::FractalNz)?;
    let value_cache = backend.upload(&cache, Layout::FractalNz)?;
    let query = HostTensor::random(&[2, 1, 16], DType::F16, 1.0, &mut rng)?;
    let out = functional::paged_attention(
        backend.as_ref(),
        &backend.upload(&query, Layout::Nd)?,
        &key_cache,
        &value_cache,
        &backend.upload(&HostTensor::from_i32(&[2, 1], vec![0, 0])?, Layout::Nd)?,
        &backend.upload(&HostTensor::from_i32(&[2], vec![0, 3])?, Layout::Nd)?,
        0.25,
    )?;
    let out = backend.download(&out)?.to_f32_vec();
    ensure!(out[..16].iter().all(|v| *v == 0.0), "request with no context produced {:?}", &out[..16]);
    ensure!(out[16..].iter().any(|v| *v != 0.0), "request with context produced zeros");
    Ok(())
}

pub fn layout_conversion_round_trips<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(18);
    let host = HostTensor::random(&[2, 8, 32], DType::F16, 1.0, &mut rng)?;
    let nd = backend.upload(&host, Layout::Nd)?;
    let nz = functional::convert(backend.as_ref(), &nd, Layout::FractalNz)?;
    ensure!(backend.describe(&nz).layout == Layout::FractalNz, "conversion kept the source layout");
    ensure!(backend.download(&nz)? == host, "tiled copy reads back differently");
    let back = functional::convert(backend.as_ref(), &nz, Layout::Nd)?;
    ensure!(backend.download(&back)? == host, "round trip changed the data");

    let vector = backend.upload(&HostTensor::zeros(&[32], DType::F16), Layout::Nd)?;
    expect_kind(functional::convert(backend.as_ref(), &vector, Layout::FractalNz), "layout")?;
    let ragged = backend.upload(&HostTensor::zeros(&[4, 24], DType::F16), Layout::Nd)?;
    expect_kind(functional::convert(backend.as_ref(), &ragged, Layout::FractalNz), "layout")
}

pub fn argmax_picks_first_maximum<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let logits = HostTensor::f16(&[3, 4], vec![0.0, 2.0, 2.0, 1.0, -1.0, -3.0, -2.0, -1.5, 5.0, 0.0, 0.0, 0.0])?;
    let ids = functional::run(backend.as_ref(), &Op::Argmax, &[&backend.upload(&logits, Layout::Nd)?])?;
    let ids = backend.download(&ids[0])?;
    ensure!(ids.dtype() == DType::I32, "argmax returned {}", ids.dtype());
    ensure!(ids.as_i32() == Some(&[1, 0, 0][..]), "argmax returned {:?}", ids.as_i32());
    Ok(())
}

pub fn mismatched_operands_are_shape_errors<B: OpBackend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let x = backend.upload(&HostTensor::zeros(&[2, 16], DType::F16), Layout::Nd)?;
    let w = backend.upload(&HostTensor::zeros(&[4, 8], DType::F16), Layout::Nd)?;
    expect_kind(functional::dense_matmul(backend.as_ref(), &x, &w), "shape")?;
    let odd = backend.upload(&HostTensor::zeros(&[2, 15], DType::F16), Layout::Nd)?;
    expect_kind(functional::gated_activation(backend.as_ref(), &odd), "shape")?;
    let err = functional::normalize(backend.as_ref(), &x, &w, 1e-6, None);
    ensure!(matches!(err, Err(GraphError::Shape(_))), "normalize accepted a [4, 8] weight");
    Ok(())
}
