//! Eager entry points: each call checks the contract, allocates outputs,
//! enqueues one operator and waits for it.

use tracing::trace;

use super::{contract, NormalizeParams, Op, PagedAttentionParams};
use crate::backend::spec::OpBackend;
use crate::error::{GraphError, Result};
use crate::tensor::{HostTensor, Layout};

/// Runs one operator to completion and returns its outputs.
///
/// In-place outputs are the aliased input buffers themselves.
pub fn run<B: OpBackend>(backend: &B, op: &Op, inputs: &[&B::Buffer]) -> Result<Vec<B::Buffer>> {
    let descs: Vec<_> = inputs.iter().map(|buffer| backend.describe(buffer)).collect();
    let output_descs = contract::infer(op, &descs)?;

    let mut outputs = Vec::with_capacity(output_descs.len());
    for (index, desc) in output_descs.iter().enumerate() {
        let aliased = op
            .in_place()
            .iter()
            .find(|(output, _)| *output == index)
            .map(|(_, input)| inputs[*input].clone());
        match aliased {
            Some(buffer) => outputs.push(buffer),
            None => outputs.push(backend.allocate(desc)?),
        }
    }

    let owned: Vec<B::Buffer> = inputs.iter().map(|buffer| (*buffer).clone()).collect();
    trace!(op = op.name(), backend = backend.backend_name(), "eager dispatch");
    backend.enqueue(op, &owned, &outputs)?;
    backend.synchronize().map_err(GraphError::from_sync)?;
    Ok(outputs)
}

fn single<T>(mut outputs: Vec<T>) -> T {
    outputs.swap_remove(0)
}

/// RMS-normalises `x` over its last axis. With `residual`, normalises
/// `x + residual` and also returns that sum.
pub fn normalize<B: OpBackend>(
    backend: &B,
    x: &B::Buffer,
    weight: &B::Buffer,
    eps: f32,
    residual: Option<&B::Buffer>,
) -> Result<(B::Buffer, Option<B::Buffer>)> {
    let op = Op::Normalize(NormalizeParams {
        eps,
        fused_residual: residual.is_some(),
    });
    let mut inputs = vec![x, weight];
    inputs.extend(residual);
    let mut outputs = run(backend, &op, &inputs)?.into_iter();
    let y = outputs
        .next()
        .ok_or_else(|| GraphError::execution("normalize produced no output"))?;
    Ok((y, outputs.next()))
}

pub fn gated_activation<B: OpBackend>(backend: &B, x: &B::Buffer) -> Result<B::Buffer> {
    run(backend, &Op::GatedActivation, &[x]).map(single)
}

/// `x @ wᵀ` for `x [m, k]` and `w [n, k]`.
pub fn dense_matmul<B: OpBackend>(backend: &B, x: &B::Buffer, w: &B::Buffer) -> Result<B::Buffer> {
    run(backend, &Op::DenseMatmul, &[x, w]).map(single)
}

/// Checks cumulative group boundaries against the row count `rows`.
pub fn validate_group_list(group_list: &[i64], rows: usize) -> Result<()> {
    let mut previous = 0i64;
    for (group, boundary) in group_list.iter().enumerate() {
        if *boundary < previous {
            return Err(GraphError::range(format!(
                "group boundary {group} ({boundary}) is below the previous boundary {previous}"
            )));
        }
        if *boundary as u64 > rows as u64 {
            return Err(GraphError::range(format!(
                "group boundary {group} ({boundary}) exceeds {rows} rows"
            )));
        }
        previous = *boundary;
    }
    Ok(())
}

/// Per-group matmul with cumulative row boundaries taken from the host.
pub fn grouped_matmul<B: OpBackend>(
    backend: &B,
    x: &B::Buffer,
    w: &B::Buffer,
    group_list: &[i64],
) -> Result<B::Buffer> {
    let rows = backend
        .describe(x)
        .dims()
        .first()
        .and_then(|dim| dim.as_static())
        .ok_or_else(|| GraphError::shape("grouped_matmul: x must be rank 2"))?;
    validate_group_list(group_list, rows)?;
    let groups = HostTensor::from_i64(&[group_list.len()], group_list.to_vec())?;
    let groups = backend.upload(&groups, Layout::Nd)?;
    run(backend, &Op::GroupedMatmul, &[x, w, &groups]).map(single)
}

/// Scatters `key`/`value` rows into the caches at `slot_mapping`.
pub fn reshape_and_cache<B: OpBackend>(
    backend: &B,
    key: &B::Buffer,
    value: &B::Buffer,
    key_cache: &B::Buffer,
    value_cache: &B::Buffer,
    slot_mapping: &B::Buffer,
) -> Result<()> {
    run(
        backend,
        &Op::ReshapeAndCache,
        &[key, value, key_cache, value_cache, slot_mapping],
    )?;
    Ok(())
}

/// Attention of `query [batch, heads, head_dim]` over the paged caches.
///
/// The kv head count is derived from the cache row width.
pub fn paged_attention<B: OpBackend>(
    backend: &B,
    query: &B::Buffer,
    key_cache: &B::Buffer,
    value_cache: &B::Buffer,
    block_tables: &B::Buffer,
    context_lens: &B::Buffer,
    scale: f32,
) -> Result<B::Buffer> {
    let query_dims = backend.describe(query).require_static()?;
    let cache_dims = backend.describe(key_cache).require_static()?;
    let (num_heads, head_dim) = match query_dims.as_slice() {
        [_, heads, dim] => (*heads, *dim),
        _ => return Err(GraphError::shape("paged_attention: query must be rank 3")),
    };
    let row = cache_dims.last().copied().unwrap_or(0);
    if head_dim == 0 || row % head_dim != 0 {
        return Err(GraphError::shape(format!(
            "paged_attention: cache rows of {row} do not hold whole heads of {head_dim}"
        )));
    }
    let op = Op::PagedAttention(PagedAttentionParams {
        num_heads,
        num_kv_heads: row / head_dim,
        scale,
    });
    run(
        backend,
        &op,
        &[query, key_cache, value_cache, block_tables, context_lens],
    )
    .map(single)
}

/// Re-lays a buffer out into `layout`, returning a new buffer.
pub fn convert<B: OpBackend>(backend: &B, src: &B::Buffer, layout: Layout) -> Result<B::Buffer> {
    let mut desc = backend.describe(src);
    desc.layout = layout;
    desc.storage_len()?;
    let dst = backend.allocate(&desc)?;
    backend.convert_layout(src, &dst)?;
    backend.synchronize().map_err(GraphError::from_sync)?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::validate_group_list;
    use crate::error::GraphError;

    #[test]
    fn group_boundaries_are_cumulative() {
        assert!(validate_group_list(&[2, 2, 5], 5).is_ok());
        assert!(validate_group_list(&[], 3).is_ok());
        assert!(matches!(
            validate_group_list(&[3, 2], 5),
            Err(GraphError::Range(_))
        ));
        assert!(matches!(
            validate_group_list(&[6], 5),
            Err(GraphError::Range(_))
        ));
        assert!(matches!(
            validate_group_list(&[-1], 5),
            Err(GraphError::Range(_))
        ));
    }
}
