//! Shape, dtype and layout contracts of every [`Op`].
//!
//! Graph construction and eager dispatch both run [`infer`] so contract
//! violations surface before anything is enqueued.

use smallvec::{smallvec, SmallVec};

use super::{Op, PagedAttentionParams};
use crate::ensure_shape;
use crate::error::{GraphError, Result};
use crate::tensor::{DType, Dim, Layout, Shape, TensorDesc};

pub type OutputDescs = SmallVec<[TensorDesc; 2]>;

/// Layout the operator requires for input `index`.
pub fn required_layout(op: &Op, index: usize) -> Layout {
    match (op, index) {
        (Op::ReshapeAndCache, 2 | 3) | (Op::PagedAttention(_), 1 | 2) => Layout::FractalNz,
        _ => Layout::Nd,
    }
}

/// Validates `inputs` against the operator contract and returns the output descriptors.
pub fn infer(op: &Op, inputs: &[TensorDesc]) -> Result<OutputDescs> {
    ensure_shape!(
        inputs.len() == op.num_inputs(),
        "{} expects {} inputs, got {}",
        op.name(),
        op.num_inputs(),
        inputs.len()
    );
    for (index, desc) in inputs.iter().enumerate() {
        let required = required_layout(op, index);
        if desc.layout != required {
            return Err(GraphError::layout(format!(
                "{} input {index} must be stored as {required}, got {desc}",
                op.name()
            )));
        }
    }

    match op {
        Op::Embedding => embedding(inputs),
        Op::Normalize(params) => normalize(inputs, params.fused_residual),
        Op::GatedActivation => gated_activation(&inputs[0]),
        Op::DenseMatmul => dense_matmul(&inputs[0], &inputs[1]),
        Op::GroupedMatmul => grouped_matmul(&inputs[0], &inputs[1], &inputs[2]),
        Op::ReshapeAndCache => reshape_and_cache(inputs),
        Op::PagedAttention(params) => paged_attention(params, inputs),
        Op::Split(params) => split(&inputs[0], &params.sizes),
        Op::Reshape(params) => reshape(&inputs[0], &params.shape),
        Op::Argmax => argmax(&inputs[0]),
    }
}

fn expect_rank(op: &str, what: &str, desc: &TensorDesc, rank: usize) -> Result<()> {
    ensure_shape!(
        desc.rank() == rank,
        "{op}: {what} must be rank {rank}, got {desc}"
    );
    Ok(())
}

fn expect_dtype(op: &str, what: &str, desc: &TensorDesc, dtype: DType) -> Result<()> {
    ensure_shape!(
        desc.dtype == dtype,
        "{op}: {what} must be {dtype}, got {desc}"
    );
    Ok(())
}

fn expect_float(op: &str, what: &str, desc: &TensorDesc) -> Result<()> {
    ensure_shape!(
        desc.dtype.is_float(),
        "{op}: {what} must be floating point, got {desc}"
    );
    Ok(())
}

fn expect_dim(op: &str, what: &str, actual: &Dim, expected: &Dim) -> Result<()> {
    ensure_shape!(
        actual.compatible(expected),
        "{op}: {what} is {actual}, expected {expected}"
    );
    Ok(())
}

fn dim(desc: &TensorDesc, axis: usize) -> Dim {
    desc.dims()[axis].clone()
}

fn nd(shape: Vec<Dim>, dtype: DType) -> TensorDesc {
    TensorDesc::new(Shape::new(shape), dtype)
}

fn embedding(inputs: &[TensorDesc]) -> Result<OutputDescs> {
    let (ids, table) = (&inputs[0], &inputs[1]);
    expect_rank("embedding", "token ids", ids, 1)?;
    expect_dtype("embedding", "token ids", ids, DType::I32)?;
    expect_rank("embedding", "table", table, 2)?;
    expect_float("embedding", "table", table)?;
    Ok(smallvec![nd(vec![dim(ids, 0), dim(table, 1)], table.dtype)])
}

fn normalize(inputs: &[TensorDesc], fused_residual: bool) -> Result<OutputDescs> {
    let (x, weight) = (&inputs[0], &inputs[1]);
    ensure_shape!(x.rank() >= 1, "normalize: input must have at least one axis");
    expect_float("normalize", "input", x)?;
    expect_rank("normalize", "weight", weight, 1)?;
    expect_dtype("normalize", "weight", weight, x.dtype)?;
    let last = dim(x, x.rank() - 1);
    expect_dim("normalize", "weight extent", &weight.dims()[0], &last)?;

    let y = nd(x.dims().to_vec(), x.dtype);
    if !fused_residual {
        return Ok(smallvec![y]);
    }
    let residual = &inputs[2];
    expect_dtype("normalize", "residual", residual, x.dtype)?;
    ensure_shape!(
        residual.shape.compatible(&x.shape),
        "normalize: residual {residual} does not match input {x}"
    );
    Ok(smallvec![y.clone(), y])
}

fn gated_activation(x: &TensorDesc) -> Result<OutputDescs> {
    ensure_shape!(x.rank() >= 1, "gated_activation: input must have at least one axis");
    expect_float("gated_activation", "input", x)?;
    let last = x.dims()[x.rank() - 1].as_static().ok_or_else(|| {
        GraphError::shape(format!("gated_activation: last axis of {x} must be static"))
    })?;
    ensure_shape!(
        last % 2 == 0,
        "gated_activation: last axis {last} must split into two equal halves"
    );
    Ok(smallvec![nd(x.shape.with_last(Dim::Static(last / 2)).into_dims(), x.dtype)])
}

fn dense_matmul(x: &TensorDesc, w: &TensorDesc) -> Result<OutputDescs> {
    expect_rank("dense_matmul", "x", x, 2)?;
    expect_rank("dense_matmul", "w", w, 2)?;
    expect_float("dense_matmul", "x", x)?;
    expect_dtype("dense_matmul", "w", w, x.dtype)?;
    expect_dim("dense_matmul", "reduction extent of w", &dim(w, 1), &dim(x, 1))?;
    Ok(smallvec![nd(vec![dim(x, 0), dim(w, 0)], x.dtype)])
}

fn grouped_matmul(x: &TensorDesc, w: &TensorDesc, group_list: &TensorDesc) -> Result<OutputDescs> {
    expect_rank("grouped_matmul", "x", x, 2)?;
    expect_rank("grouped_matmul", "w", w, 3)?;
    expect_float("grouped_matmul", "x", x)?;
    expect_dtype("grouped_matmul", "w", w, x.dtype)?;
    expect_rank("grouped_matmul", "group_list", group_list, 1)?;
    expect_dtype("grouped_matmul", "group_list", group_list, DType::I64)?;
    expect_dim(
        "grouped_matmul",
        "group_list length",
        &dim(group_list, 0),
        &dim(w, 0),
    )?;
    expect_dim("grouped_matmul", "reduction extent of w", &dim(w, 2), &dim(x, 1))?;
    Ok(smallvec![nd(vec![dim(x, 0), dim(w, 1)], x.dtype)])
}

/// `a * b` when both are static, otherwise unknown.
fn product(a: &Dim, b: &Dim) -> Option<Dim> {
    Some(Dim::Static(a.as_static()? * b.as_static()?))
}

fn reshape_and_cache(inputs: &[TensorDesc]) -> Result<OutputDescs> {
    const OP: &str = "reshape_and_cache";
    let (key, value, key_cache, value_cache, slots) =
        (&inputs[0], &inputs[1], &inputs[2], &inputs[3], &inputs[4]);
    expect_rank(OP, "key", key, 3)?;
    expect_float(OP, "key", key)?;
    expect_dtype(OP, "value", value, key.dtype)?;
    ensure_shape!(
        value.shape.compatible(&key.shape),
        "{OP}: value {value} does not match key {key}"
    );
    expect_rank(OP, "key cache", key_cache, 3)?;
    expect_dtype(OP, "key cache", key_cache, key.dtype)?;
    expect_dtype(OP, "value cache", value_cache, key.dtype)?;
    ensure_shape!(
        value_cache.shape.compatible(&key_cache.shape),
        "{OP}: value cache {value_cache} does not match key cache {key_cache}"
    );
    if let Some(row) = product(&dim(key, 1), &dim(key, 2)) {
        expect_dim(OP, "cache row width", &dim(key_cache, 2), &row)?;
    }
    expect_rank(OP, "slot mapping", slots, 1)?;
    expect_dtype(OP, "slot mapping", slots, DType::I32)?;
    expect_dim(OP, "slot mapping length", &dim(slots, 0), &dim(key, 0))?;
    Ok(smallvec![key_cache.clone(), value_cache.clone()])
}

fn paged_attention(params: &PagedAttentionParams, inputs: &[TensorDesc]) -> Result<OutputDescs> {
    const OP: &str = "paged_attention";
    let (query, key_cache, value_cache, block_tables, context_lens) =
        (&inputs[0], &inputs[1], &inputs[2], &inputs[3], &inputs[4]);
    ensure_shape!(
        params.num_kv_heads > 0 && params.num_heads % params.num_kv_heads == 0,
        "{OP}: {} query heads cannot share {} kv heads",
        params.num_heads,
        params.num_kv_heads
    );
    expect_rank(OP, "query", query, 3)?;
    expect_float(OP, "query", query)?;
    expect_dim(OP, "query heads", &dim(query, 1), &Dim::Static(params.num_heads))?;
    expect_rank(OP, "key cache", key_cache, 3)?;
    expect_dtype(OP, "key cache", key_cache, query.dtype)?;
    expect_dtype(OP, "value cache", value_cache, query.dtype)?;
    ensure_shape!(
        value_cache.shape.compatible(&key_cache.shape),
        "{OP}: value cache {value_cache} does not match key cache {key_cache}"
    );
    if let Some(row) = product(&Dim::Static(params.num_kv_heads), &dim(query, 2)) {
        expect_dim(OP, "cache row width", &dim(key_cache, 2), &row)?;
    }
    expect_rank(OP, "block tables", block_tables, 2)?;
    expect_dtype(OP, "block tables", block_tables, DType::I32)?;
    expect_dim(OP, "block table rows", &dim(block_tables, 0), &dim(query, 0))?;
    expect_rank(OP, "context lens", context_lens, 1)?;
    expect_dtype(OP, "context lens", context_lens, DType::I32)?;
    expect_dim(OP, "context lens length", &dim(context_lens, 0), &dim(query, 0))?;
    Ok(smallvec![nd(query.dims().to_vec(), query.dtype)])
}

fn split(x: &TensorDesc, sizes: &[usize]) -> Result<OutputDescs> {
    ensure_shape!(x.rank() >= 1, "split: input must have at least one axis");
    ensure_shape!(!sizes.is_empty(), "split: needs at least one piece");
    let last = &x.dims()[x.rank() - 1];
    let total: usize = sizes.iter().sum();
    expect_dim("split", "last axis", last, &Dim::Static(total))?;
    Ok(sizes
        .iter()
        .map(|size| nd(x.shape.with_last(Dim::Static(*size)).into_dims(), x.dtype))
        .collect())
}

fn reshape(x: &TensorDesc, shape: &Shape) -> Result<OutputDescs> {
    if let (Some(from), Some(to)) = (x.element_count(), shape.element_count()) {
        ensure_shape!(from == to, "reshape: cannot view {x} as {shape}");
    }
    Ok(smallvec![TensorDesc::new(shape.clone(), x.dtype)])
}

fn argmax(x: &TensorDesc) -> Result<OutputDescs> {
    expect_rank("argmax", "input", x, 2)?;
    expect_float("argmax", "input", x)?;
    Ok(smallvec![nd(vec![dim(x, 0)], DType::I32)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{NormalizeParams, ReshapeParams, SplitParams};

    fn f16(dims: &[usize]) -> TensorDesc {
        TensorDesc::new(dims, DType::F16)
    }

    fn i32(dims: &[usize]) -> TensorDesc {
        TensorDesc::new(dims, DType::I32)
    }

    fn cache(dims: Vec<Dim>) -> TensorDesc {
        TensorDesc::new(dims, DType::F16).with_layout(Layout::FractalNz)
    }

    #[test]
    fn dense_matmul_contracts_over_shared_axis() {
        let out = infer(&Op::DenseMatmul, &[f16(&[4, 64]), f16(&[96, 64])]).unwrap();
        assert_eq!(out[0], f16(&[4, 96]));
        let err = infer(&Op::DenseMatmul, &[f16(&[4, 64]), f16(&[96, 32])]).unwrap_err();
        assert!(matches!(err, GraphError::Shape(_)));
    }

    #[test]
    fn fused_normalize_returns_residual_version() {
        let op = Op::Normalize(NormalizeParams {
            eps: 1e-6,
            fused_residual: true,
        });
        let out = infer(&op, &[f16(&[2, 32]), f16(&[32]), f16(&[2, 32])]).unwrap();
        assert_eq!(out.len(), 2);
        assert!(infer(&op, &[f16(&[2, 32]), f16(&[16]), f16(&[2, 32])]).is_err());
    }

    #[test]
    fn gated_activation_halves_last_axis() {
        let out = infer(&Op::GatedActivation, &[f16(&[3, 128])]).unwrap();
        assert_eq!(out[0], f16(&[3, 64]));
        assert!(infer(&Op::GatedActivation, &[f16(&[3, 7])]).is_err());
    }

    #[test]
    fn grouped_matmul_checks_group_list_length() {
        let w = f16(&[3, 8, 16]);
        let groups = TensorDesc::new([3], DType::I64);
        assert_eq!(
            infer(&Op::GroupedMatmul, &[f16(&[5, 16]), w.clone(), groups]).unwrap()[0],
            f16(&[5, 8])
        );
        let short = TensorDesc::new([2], DType::I64);
        assert!(infer(&Op::GroupedMatmul, &[f16(&[5, 16]), w, short]).is_err());
    }

    #[test]
    fn cache_writes_require_tiled_caches() {
        let pages = Dim::sym("pages");
        let key = f16(&[4, 2, 16]);
        let tiled = cache(vec![pages.clone(), Dim::Static(16), Dim::Static(32)]);
        let out = infer(
            &Op::ReshapeAndCache,
            &[key.clone(), key.clone(), tiled.clone(), tiled.clone(), i32(&[4])],
        )
        .unwrap();
        assert_eq!(out[0], tiled);

        let flat = TensorDesc::new(vec![pages, Dim::Static(16), Dim::Static(32)], DType::F16);
        let err = infer(
            &Op::ReshapeAndCache,
            &[key.clone(), key, flat.clone(), flat, i32(&[4])],
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::Layout(_)));
    }

    #[test]
    fn paged_attention_rejects_mismatched_cache_width() {
        let params = PagedAttentionParams {
            num_heads: 4,
            num_kv_heads: 2,
            scale: 0.25,
        };
        let kv = cache(vec![Dim::Static(8), Dim::Static(16), Dim::Static(32)]);
        let out = infer(
            &Op::PagedAttention(params),
            &[f16(&[3, 4, 16]), kv.clone(), kv.clone(), i32(&[3, 2]), i32(&[3])],
        )
        .unwrap();
        assert_eq!(out[0], f16(&[3, 4, 16]));

        let wide = cache(vec![Dim::Static(8), Dim::Static(16), Dim::Static(64)]);
        assert!(infer(
            &Op::PagedAttention(params),
            &[f16(&[3, 4, 16]), wide.clone(), wide, i32(&[3, 2]), i32(&[3])],
        )
        .is_err());
    }

    #[test]
    fn split_and_reshape_preserve_elements() {
        let split_op = Op::Split(SplitParams {
            sizes: smallvec![64, 32, 32],
        });
        let parts = infer(&split_op, &[f16(&[2, 128])]).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], f16(&[2, 32]));

        let view = Op::Reshape(ReshapeParams {
            shape: Shape::from([2, 4, 16]),
        });
        assert!(infer(&view, &[f16(&[2, 64])]).is_ok());
        assert!(infer(&view, &[f16(&[2, 60])]).is_err());
    }

    #[test]
    fn argmax_emits_token_ids() {
        let logits = TensorDesc::new(vec![Dim::Static(8), Dim::sym("vocab")], DType::F16);
        assert_eq!(infer(&Op::Argmax, &[logits]).unwrap()[0], i32(&[8]));
    }
}
