//! Reference numerics for every operator.
//!
//! Kernels read their inputs into owned f32 vectors, compute in f32 and round
//! once when writing outputs. Index tensors are validated in full before any
//! output is touched, so a range fault leaves device memory unchanged.

use kvgraph::backend::{BackendError, BackendResult};
use kvgraph::ops::functional::validate_group_list;
use kvgraph::ops::{NormalizeParams, Op, PagedAttentionParams};

use crate::buffer::{CpuBuffer, Storage};

pub(crate) fn execute(op: &Op, inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
    match op {
        Op::Embedding => op_embedding(inputs, outputs),
        Op::Normalize(params) => op_normalize(params, inputs, outputs),
        Op::GatedActivation => op_gated_activation(inputs, outputs),
        Op::DenseMatmul => op_dense_matmul(inputs, outputs),
        Op::GroupedMatmul => op_grouped_matmul(inputs, outputs),
        Op::ReshapeAndCache => op_reshape_and_cache(inputs, outputs),
        Op::PagedAttention(params) => op_paged_attention(params, inputs, outputs),
        Op::Split(_) => op_split(inputs, outputs),
        Op::Reshape(_) => op_reshape(inputs, outputs),
        Op::Argmax => op_argmax(inputs, outputs),
    }
}

fn last_dim(buffer: &CpuBuffer) -> usize {
    buffer.dims().last().copied().unwrap_or(1)
}

fn op_embedding(inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
    let ids = inputs[0].read_logical_i64()?;
    let (vocab, hidden) = (inputs[1].dims()[0], inputs[1].dims()[1]);
    if let Some((row, id)) = ids
        .iter()
        .enumerate()
        .find(|(_, id)| **id < 0 || **id as u64 >= vocab as u64)
    {
        return Err(BackendError::range(format!(
            "token id {id} at row {row} is outside a vocabulary of {vocab}"
        )));
    }
    let table = inputs[1].read_logical_f32()?;
    let mut out = Vec::with_capacity(ids.len() * hidden);
    for id in ids {
        let start = id as usize * hidden;
        out.extend_from_slice(&table[start..start + hidden]);
    }
    outputs[0].write_logical_f32(&out)
}

fn rms_row(x: &[f32], weight: &[f32], eps: f32, out: &mut [f32]) {
    let mean = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let inv = 1.0 / (mean + eps).sqrt();
    for ((o, v), w) in out.iter_mut().zip(x).zip(weight) {
        *o = v * inv * w;
    }
}

fn op_normalize(params: &NormalizeParams, inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
    let mut x = inputs[0].read_logical_f32()?;
    let weight = inputs[1].read_logical_f32()?;
    if params.fused_residual {
        let residual = inputs[2].read_logical_f32()?;
        let dtype = outputs[1].dtype();
        for (v, r) in x.iter_mut().zip(&residual) {
            *v = dtype.round_f32(*v + r);
        }
        outputs[1].write_logical_f32(&x)?;
    }
    let cols = weight.len();
    let mut y = vec![0.0f32; x.len()];
    if cols > 0 {
        for (row, out) in x.chunks(cols).zip(y.chunks_mut(cols)) {
            rms_row(row, &weight, params.eps, out);
        }
    }
    outputs[0].write_logical_f32(&y)
}

#[inline]
fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

fn op_gated_activation(inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
    let x = inputs[0].read_logical_f32()?;
    let cols = last_dim(&inputs[0]);
    let half = cols / 2;
    let mut out = Vec::with_capacity(x.len() / 2);
    if cols > 0 {
        for row in x.chunks(cols) {
            let (gate, up) = row.split_at(half);
            out.extend(gate.iter().zip(up).map(|(a, b)| (a * sigmoid(*a)) * b));
        }
    }
    outputs[0].write_logical_f32(&out)
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(0.0f32, |acc, (x, y)| acc + x * y)
}

/// `out[r, j] = x[r, :] · w[j, :]` for row-major `x [rows, k]`, `w [n, k]`.
fn matmul_rows(x: &[f32], w: &[f32], k: usize, n: usize, out: &mut [f32]) {
    if n == 0 {
        return;
    }
    if k == 0 {
        out.fill(0.0);
        return;
    }
    for (row, out_row) in x.chunks(k).zip(out.chunks_mut(n)) {
        for (j, o) in out_row.iter_mut().enumerate() {
            *o = dot(row, &w[j * k..(j + 1) * k]);
        }
    }
}

fn op_dense_matmul(inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
    let x = inputs[0].read_logical_f32()?;
    let w = inputs[1].read_logical_f32()?;
    let (k, n) = (inputs[0].dims()[1], inputs[1].dims()[0]);
    let mut out = vec![0.0f32; inputs[0].dims()[0] * n];
    matmul_rows(&x, &w, k, n, &mut out);
    outputs[0].write_logical_f32(&out)
}

fn op_grouped_matmul(inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
    let (m, k) = (inputs[0].dims()[0], inputs[0].dims()[1]);
    let n = inputs[1].dims()[1];
    let boundaries = inputs[2].read_logical_i64()?;
    validate_group_list(&boundaries, m)?;

    let x = inputs[0].read_logical_f32()?;
    let w = inputs[1].read_logical_f32()?;
    let mut out = vec![0.0f32; m * n];
    let mut start = 0usize;
    for (group, boundary) in boundaries.iter().enumerate() {
        let end = *boundary as usize;
        matmul_rows(
            &x[start * k..end * k],
            &w[group * n * k..(group + 1) * n * k],
            k,
            n,
            &mut out[start * n..end * n],
        );
        start = end;
    }
    outputs[0].write_logical_f32(&out)
}

fn op_reshape_and_cache(inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
    let slots = inputs[4].read_logical_i64()?;
    let cache_dims = outputs[0].dims();
    let (pages, page_size, width) = (cache_dims[0], cache_dims[1], cache_dims[2]);
    let capacity = (pages * page_size) as i64;
    if let Some((token, slot)) = slots.iter().enumerate().find(|(_, slot)| **slot >= capacity) {
        return Err(BackendError::range(format!(
            "slot {slot} of token {token} is outside {capacity} cache slots"
        )));
    }

    for (cache, source) in [(&outputs[0], &inputs[0]), (&outputs[1], &inputs[1])] {
        let rows = source.read_logical_f32()?;
        let indexer = cache.indexer()?;
        let mut storage = cache.write()?;
        for (token, slot) in slots.iter().enumerate() {
            // negative slots mark padding tokens
            if *slot < 0 {
                continue;
            }
            let (page, offset) = (*slot as usize / page_size, *slot as usize % page_size);
            let row = &rows[token * width..(token + 1) * width];
            for (col, value) in row.iter().enumerate() {
                storage.set_f32(indexer.offset(page, offset, col), *value);
            }
        }
    }
    Ok(())
}

fn op_paged_attention(
    params: &PagedAttentionParams,
    inputs: &[CpuBuffer],
    outputs: &[CpuBuffer],
) -> BackendResult<()> {
    let (key_cache, value_cache) = (&inputs[1], &inputs[2]);
    let (batch, heads, head_dim) = (inputs[0].dims()[0], inputs[0].dims()[1], inputs[0].dims()[2]);
    let (pages, page_size) = (key_cache.dims()[0], key_cache.dims()[1]);
    let max_blocks = inputs[3].dims()[1];
    let tables = inputs[3].read_logical_i64()?;
    let lens = inputs[4].read_logical_i64()?;

    for (request, len) in lens.iter().enumerate() {
        if *len < 0 || *len as usize > max_blocks * page_size {
            return Err(BackendError::range(format!(
                "context length {len} of request {request} exceeds {max_blocks} blocks of {page_size}"
            )));
        }
        let used = (*len as usize).div_ceil(page_size);
        let row = &tables[request * max_blocks..request * max_blocks + used];
        if let Some(page) = row.iter().find(|page| **page < 0 || **page as usize >= pages) {
            return Err(BackendError::range(format!(
                "request {request} references page {page} of {pages}"
            )));
        }
    }

    let query = inputs[0].read_logical_f32()?;
    let group = heads / params.num_kv_heads.max(1);
    let mut out = vec![0.0f32; batch * heads * head_dim];
    {
        let (k_index, v_index) = (key_cache.indexer()?, value_cache.indexer()?);
        let keys = key_cache.read()?;
        let values = value_cache.read()?;
        let mut scores = Vec::new();
        for request in 0..batch {
            let len = lens[request] as usize;
            if len == 0 {
                continue;
            }
            let table = &tables[request * max_blocks..(request + 1) * max_blocks];
            let locate = |position: usize| (table[position / page_size] as usize, position % page_size);
            for head in 0..heads {
                let col0 = (head / group.max(1)) * head_dim;
                let q = &query[(request * heads + head) * head_dim..][..head_dim];

                scores.clear();
                for position in 0..len {
                    let (page, offset) = locate(position);
                    let mut score = 0.0f32;
                    for (e, qv) in q.iter().enumerate() {
                        score += qv * keys.get_f32(k_index.offset(page, offset, col0 + e));
                    }
                    scores.push(score * params.scale);
                }
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut total = 0.0f32;
                for score in scores.iter_mut() {
                    *score = (*score - max).exp();
                    total += *score;
                }

                let acc = &mut out[(request * heads + head) * head_dim..][..head_dim];
                for (position, weight) in scores.iter().enumerate() {
                    let (page, offset) = locate(position);
                    for (e, slot) in acc.iter_mut().enumerate() {
                        *slot += weight * values.get_f32(v_index.offset(page, offset, col0 + e));
                    }
                }
                for slot in acc.iter_mut() {
                    *slot /= total;
                }
            }
        }
    }
    outputs[0].write_logical_f32(&out)
}

fn op_split(inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
    let x = inputs[0].read_logical_f32()?;
    let cols = last_dim(&inputs[0]);
    let mut start = 0;
    for output in outputs {
        let width = last_dim(output);
        let mut piece = Vec::with_capacity(output.element_count());
        if cols > 0 {
            for row in x.chunks(cols) {
                piece.extend_from_slice(&row[start..start + width]);
            }
        }
        output.write_logical_f32(&piece)?;
        start += width;
    }
    Ok(())
}

fn op_reshape(inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
    let data: Storage = inputs[0].read()?.clone();
    *outputs[0].write()? = data;
    Ok(())
}

fn op_argmax(inputs: &[CpuBuffer], outputs: &[CpuBuffer]) -> BackendResult<()> {
    let x = inputs[0].read_logical_f32()?;
    let cols = last_dim(&inputs[0]);
    let rows = inputs[0].dims()[0];
    let mut ids = Vec::with_capacity(rows);
    for row in 0..rows {
        let values = &x[row * cols..(row + 1) * cols];
        let mut best: Option<(usize, f32)> = None;
        for (index, value) in values.iter().enumerate() {
            if value.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, top)| *value > top) {
                best = Some((index, *value));
            }
        }
        let index = best.map_or(0, |(index, _)| index);
        ids.push(i32::try_from(index).map_err(|_| BackendError::range("argmax index exceeds i32"))?);
    }
    *outputs[0].write()? = Storage::I32(ids);
    Ok(())
}
