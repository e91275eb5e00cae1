//! Graph recipes for the decode-step building blocks of a decoder-only model.
//!
//! Every recipe validates only the config fields it reads. Slot binding order
//! is documented per recipe; caches are `f16` fractal-NZ with symbolic page
//! count and page size, fixed when the first buffers are bound.

use smallvec::smallvec;

use super::builder::GraphBuilder;
use super::config::GraphConfig;
use super::ir::{Graph, ValueId};
use crate::error::Result;
use crate::ops::{NormalizeParams, Op, PagedAttentionParams, ReshapeParams, SplitParams};
use crate::tensor::{DType, Dim, Layout, Shape, TensorDesc};

pub const DIM_VOCAB: &str = "vocab";
pub const DIM_PAGES: &str = "pages";
pub const DIM_PAGE_SIZE: &str = "page_size";
pub const DIM_MAX_BLOCKS: &str = "max_blocks";

const ACTIVATION_DTYPE: DType = DType::F16;

/// What `build_model_with_head` returns after the final normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelHead {
    /// Tied lm-head projection followed by argmax: `I32 [batch]` token ids.
    #[default]
    Greedy,
    /// The normalised hidden state `[batch, hidden]`.
    Hidden,
}

/// Where `build_attn_with_output` stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttnOutput {
    /// Full decode-step attention through the o projection. Inputs
    /// `[x, key_cache, value_cache, slot_mapping, block_tables, context_lens]`,
    /// weights `[qkv_proj, q_norm, k_norm, o_proj]`, outputs `[y]`.
    #[default]
    Projected,
    /// Stops after the per-head q/k normalisation and touches no cache.
    /// Inputs `[x]`, weights `[qkv_proj, q_norm, k_norm]`, outputs
    /// `[q [batch, q_size], k [batch, kv_size]]`.
    NormedQk,
}

fn activation(dims: &[usize]) -> TensorDesc {
    TensorDesc::new(dims, ACTIVATION_DTYPE)
}

fn vocab_desc(config: &GraphConfig) -> TensorDesc {
    TensorDesc::new(
        vec![Dim::sym(DIM_VOCAB), Dim::Static(config.hidden_size)],
        ACTIVATION_DTYPE,
    )
}

fn cache_desc(config: &GraphConfig) -> TensorDesc {
    TensorDesc::new(
        vec![
            Dim::sym(DIM_PAGES),
            Dim::sym(DIM_PAGE_SIZE),
            Dim::Static(config.kv_size()),
        ],
        ACTIVATION_DTYPE,
    )
    .with_layout(Layout::FractalNz)
}

fn normalize_op(config: &GraphConfig, fused_residual: bool) -> Op {
    Op::Normalize(NormalizeParams {
        eps: config.rms_norm_eps,
        fused_residual,
    })
}

fn reshape_op(dims: &[usize]) -> Op {
    Op::Reshape(ReshapeParams {
        shape: Shape::from_static(dims),
    })
}

/// Per-step index slots shared by every attention layer.
#[derive(Debug, Clone, Copy)]
struct StepIndices {
    slot_mapping: ValueId,
    block_tables: ValueId,
    context_lens: ValueId,
}

impl StepIndices {
    fn declare(builder: &mut GraphBuilder, config: &GraphConfig) -> Self {
        let batch = config.batch_size;
        Self {
            slot_mapping: builder.input("slot_mapping", TensorDesc::new([batch], DType::I32)),
            block_tables: builder.input(
                "block_tables",
                TensorDesc::new(
                    vec![Dim::Static(batch), Dim::sym(DIM_MAX_BLOCKS)],
                    DType::I32,
                ),
            ),
            context_lens: builder.input("context_lens", TensorDesc::new([batch], DType::I32)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QkvWeights {
    qkv_proj: ValueId,
    q_norm: ValueId,
    k_norm: ValueId,
}

impl QkvWeights {
    fn declare(builder: &mut GraphBuilder, config: &GraphConfig, prefix: &str) -> Self {
        let qkv_rows = config.q_size() + 2 * config.kv_size();
        Self {
            qkv_proj: builder.weight(
                format!("{prefix}qkv_proj"),
                activation(&[qkv_rows, config.hidden_size]),
            ),
            q_norm: builder.weight(format!("{prefix}q_norm"), activation(&[config.head_dim()])),
            k_norm: builder.weight(format!("{prefix}k_norm"), activation(&[config.head_dim()])),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AttnWeights {
    qkv: QkvWeights,
    o_proj: ValueId,
}

impl AttnWeights {
    fn declare(builder: &mut GraphBuilder, config: &GraphConfig, prefix: &str) -> Self {
        let qkv = QkvWeights::declare(builder, config, prefix);
        let o_proj = builder.weight(
            format!("{prefix}o_proj"),
            activation(&[config.hidden_size, config.q_size()]),
        );
        Self { qkv, o_proj }
    }
}

#[derive(Debug, Clone, Copy)]
struct MlpWeights {
    gate_up_proj: ValueId,
    down_proj: ValueId,
}

impl MlpWeights {
    fn declare(builder: &mut GraphBuilder, config: &GraphConfig, prefix: &str) -> Self {
        let (hidden, inter) = (config.hidden_size, config.intermediate_size);
        Self {
            gate_up_proj: builder.weight(format!("{prefix}gate_up_proj"), activation(&[2 * inter, hidden])),
            down_proj: builder.weight(format!("{prefix}down_proj"), activation(&[hidden, inter])),
        }
    }
}

fn paged_attention_op(config: &GraphConfig) -> Op {
    Op::PagedAttention(PagedAttentionParams {
        num_heads: config.num_heads,
        num_kv_heads: config.num_kv_heads,
        scale: 1.0 / (config.head_dim() as f32).sqrt(),
    })
}

fn mlp_block(builder: &mut GraphBuilder, x: ValueId, weights: MlpWeights) -> Result<ValueId> {
    let gate_up = builder.emit_one(Op::DenseMatmul, &[x, weights.gate_up_proj])?;
    let act = builder.emit_one(Op::GatedActivation, &[gate_up])?;
    builder.emit_one(Op::DenseMatmul, &[act, weights.down_proj])
}

/// Normalised per-head q and k rows, plus the flat v slice of the projection.
#[derive(Debug, Clone, Copy)]
struct HeadRows {
    q: ValueId,
    k: ValueId,
    v: ValueId,
}

/// qkv projection, split into heads and per-head normalisation of q and k.
fn qkv_block(builder: &mut GraphBuilder, config: &GraphConfig, x: ValueId, weights: QkvWeights) -> Result<HeadRows> {
    let batch = config.batch_size;
    let (heads, kv_heads, head_dim) = (config.num_heads, config.num_kv_heads, config.head_dim());

    let qkv = builder.emit_one(Op::DenseMatmul, &[x, weights.qkv_proj])?;
    let parts = builder.emit(
        Op::Split(SplitParams {
            sizes: smallvec![config.q_size(), config.kv_size(), config.kv_size()],
        }),
        &[qkv],
    )?;
    let q = builder.emit_one(reshape_op(&[batch, heads, head_dim]), &[parts[0]])?;
    let k = builder.emit_one(reshape_op(&[batch, kv_heads, head_dim]), &[parts[1]])?;

    let q = builder.emit_one(normalize_op(config, false), &[q, weights.q_norm])?;
    let k = builder.emit_one(normalize_op(config, false), &[k, weights.k_norm])?;
    Ok(HeadRows { q, k, v: parts[2] })
}

/// qkv projection through o projection for one decode step. Writes the new
/// key/value rows into the caches before attending.
fn attn_block(
    builder: &mut GraphBuilder,
    config: &GraphConfig,
    x: ValueId,
    key_cache: ValueId,
    value_cache: ValueId,
    indices: StepIndices,
    weights: AttnWeights,
) -> Result<ValueId> {
    let HeadRows { q, k, v } = qkv_block(builder, config, x, weights.qkv)?;
    let v = builder.emit_one(
        reshape_op(&[config.batch_size, config.num_kv_heads, config.head_dim()]),
        &[v],
    )?;

    let caches = builder.emit(
        Op::ReshapeAndCache,
        &[k, v, key_cache, value_cache, indices.slot_mapping],
    )?;
    let attn = builder.emit_one(
        paged_attention_op(config),
        &[
            q,
            caches[0],
            caches[1],
            indices.block_tables,
            indices.context_lens,
        ],
    )?;
    let attn = builder.emit_one(reshape_op(&[config.batch_size, config.q_size()]), &[attn])?;
    builder.emit_one(Op::DenseMatmul, &[attn, weights.o_proj])
}

/// Inputs `[token_ids]`, weights `[vocab_weight]`, outputs `[hidden]`.
pub fn build_embedding(config: &GraphConfig) -> Result<Graph> {
    config.validate_dense()?;
    let mut builder = GraphBuilder::new("embedding");
    let ids = builder.input("token_ids", TensorDesc::new([config.batch_size], DType::I32));
    let table = builder.weight("vocab_weight", vocab_desc(config));
    let hidden = builder.emit_one(Op::Embedding, &[ids, table])?;
    builder.rename(hidden, "hidden")?;
    builder.output(hidden);
    builder.finish()
}

/// Inputs `[x]`, weights `[weight]`, outputs `[y]`.
pub fn build_rmsnorm(config: &GraphConfig) -> Result<Graph> {
    config.validate_dense()?;
    config.validate_eps()?;
    let shape = [config.batch_size, config.hidden_size];
    let mut builder = GraphBuilder::new("rmsnorm");
    let x = builder.input("x", activation(&shape));
    let weight = builder.weight("weight", activation(&[config.hidden_size]));
    let y = builder.emit_one(normalize_op(config, false), &[x, weight])?;
    builder.rename(y, "y")?;
    builder.output(y);
    builder.finish()
}

/// Inputs `[x, residual]`, weights `[weight]`, outputs `[y, residual_out]`.
pub fn build_rmsnorm_with_residual(config: &GraphConfig) -> Result<Graph> {
    config.validate_dense()?;
    config.validate_eps()?;
    let shape = [config.batch_size, config.hidden_size];
    let mut builder = GraphBuilder::new("rmsnorm_with_residual");
    let x = builder.input("x", activation(&shape));
    let residual = builder.input("residual", activation(&shape));
    let weight = builder.weight("weight", activation(&[config.hidden_size]));
    let outputs = builder.emit(normalize_op(config, true), &[x, weight, residual])?;
    builder.rename(outputs[0], "y")?;
    builder.rename(outputs[1], "residual_out")?;
    builder.output(outputs[0]);
    builder.output(outputs[1]);
    builder.finish()
}

/// Inputs `[x]`, weights `[gate_up_proj, down_proj]`, outputs `[y]`.
pub fn build_mlp(config: &GraphConfig) -> Result<Graph> {
    config.validate_mlp()?;
    let mut builder = GraphBuilder::new("mlp");
    let x = builder.input("x", activation(&[config.batch_size, config.hidden_size]));
    let weights = MlpWeights::declare(&mut builder, config, "");
    let y = mlp_block(&mut builder, x, weights)?;
    builder.rename(y, "y")?;
    builder.output(y);
    builder.finish()
}

/// Inputs `[x, key_cache, value_cache, slot_mapping, block_tables,
/// context_lens]`, weights `[qkv_proj, q_norm, k_norm, o_proj]`, outputs `[y]`.
pub fn build_attn(config: &GraphConfig) -> Result<Graph> {
    build_attn_with_output(config, AttnOutput::Projected)
}

/// Attention recipe ending at `output`; see [`AttnOutput`] for the slots of
/// each variant.
pub fn build_attn_with_output(config: &GraphConfig, output: AttnOutput) -> Result<Graph> {
    config.validate_attention()?;
    if output == AttnOutput::NormedQk {
        return build_qk_norm(config);
    }
    let mut builder = GraphBuilder::new("attn");
    let x = builder.input("x", activation(&[config.batch_size, config.hidden_size]));
    let key_cache = builder.input("key_cache", cache_desc(config));
    let value_cache = builder.input("value_cache", cache_desc(config));
    let indices = StepIndices::declare(&mut builder, config);
    let weights = AttnWeights::declare(&mut builder, config, "");
    let y = attn_block(&mut builder, config, x, key_cache, value_cache, indices, weights)?;
    builder.rename(y, "y")?;
    builder.output(y);
    builder.finish()
}

fn build_qk_norm(config: &GraphConfig) -> Result<Graph> {
    let batch = config.batch_size;
    let mut builder = GraphBuilder::new("attn_qk_norm");
    let x = builder.input("x", activation(&[batch, config.hidden_size]));
    let weights = QkvWeights::declare(&mut builder, config, "");
    let rows = qkv_block(&mut builder, config, x, weights)?;
    let q = builder.emit_one(reshape_op(&[batch, config.q_size()]), &[rows.q])?;
    let k = builder.emit_one(reshape_op(&[batch, config.kv_size()]), &[rows.k])?;
    builder.rename(q, "q")?;
    builder.rename(k, "k")?;
    builder.output(q);
    builder.output(k);
    builder.finish()
}

/// Inputs `[query, key, value, key_cache, value_cache, slot_mapping,
/// block_tables, context_lens]`, no weights, outputs `[out]`.
pub fn build_paged_attn(config: &GraphConfig) -> Result<Graph> {
    config.validate_attention()?;
    let (batch, head_dim) = (config.batch_size, config.head_dim());
    let mut builder = GraphBuilder::new("paged_attn");
    let query = builder.input("query", activation(&[batch, config.num_heads, head_dim]));
    let key = builder.input("key", activation(&[batch, config.num_kv_heads, head_dim]));
    let value = builder.input("value", activation(&[batch, config.num_kv_heads, head_dim]));
    let key_cache = builder.input("key_cache", cache_desc(config));
    let value_cache = builder.input("value_cache", cache_desc(config));
    let indices = StepIndices::declare(&mut builder, config);

    let caches = builder.emit(
        Op::ReshapeAndCache,
        &[key, value, key_cache, value_cache, indices.slot_mapping],
    )?;
    let out = builder.emit_one(
        paged_attention_op(config),
        &[
            query,
            caches[0],
            caches[1],
            indices.block_tables,
            indices.context_lens,
        ],
    )?;
    builder.rename(out, "out")?;
    builder.output(out);
    builder.finish()
}

/// Greedy decode step of the full model; see [`build_model_with_head`].
pub fn build_model(config: &GraphConfig) -> Result<Graph> {
    build_model_with_head(config, ModelHead::Greedy)
}

/// One decode step of a decoder-only model.
///
/// Inputs: `[token_ids, key_cache.0, value_cache.0, .., slot_mapping,
/// block_tables, context_lens]`. Weights: `[vocab_weight]`, then per layer
/// `[pre_norm, qkv_proj, q_norm, k_norm, o_proj, post_norm, gate_up_proj,
/// down_proj]`, then `[final_norm]`. Residual adds are fused into the
/// normalisation that follows them.
pub fn build_model_with_head(config: &GraphConfig, head: ModelHead) -> Result<Graph> {
    if config.num_layers > 0 {
        config.validate()?;
    } else {
        config.validate_dense()?;
        config.validate_eps()?;
    }
    let mut builder = GraphBuilder::new("model");
    let token_ids = builder.input("token_ids", TensorDesc::new([config.batch_size], DType::I32));
    let caches: Vec<(ValueId, ValueId)> = (0..config.num_layers)
        .map(|layer| {
            (
                builder.input(format!("key_cache.{layer}"), cache_desc(config)),
                builder.input(format!("value_cache.{layer}"), cache_desc(config)),
            )
        })
        .collect();
    let layers: Vec<(ValueId, ValueId, StepIndices)> = if caches.is_empty() {
        Vec::new()
    } else {
        let indices = StepIndices::declare(&mut builder, config);
        caches
            .into_iter()
            .map(|(key_cache, value_cache)| (key_cache, value_cache, indices))
            .collect()
    };

    let vocab = builder.weight("vocab_weight", vocab_desc(config));
    let mut hidden = builder.emit_one(Op::Embedding, &[token_ids, vocab])?;
    let mut residual: Option<ValueId> = None;

    for (layer, (key_cache, value_cache, indices)) in layers.into_iter().enumerate() {
        let prefix = format!("layers.{layer}.");
        let norm_shape = [config.hidden_size];
        let pre_norm = builder.weight(format!("{prefix}pre_norm"), activation(&norm_shape));
        let attn_weights = AttnWeights::declare(&mut builder, config, &prefix);
        let post_norm = builder.weight(format!("{prefix}post_norm"), activation(&norm_shape));
        let mlp_weights = MlpWeights::declare(&mut builder, config, &prefix);

        let (x, stream) = residual_norm(&mut builder, config, hidden, residual, pre_norm)?;
        let attn = attn_block(&mut builder, config, x, key_cache, value_cache, indices, attn_weights)?;
        let (x, stream) = residual_norm(&mut builder, config, attn, Some(stream), post_norm)?;
        hidden = mlp_block(&mut builder, x, mlp_weights)?;
        residual = Some(stream);
    }

    let final_norm = builder.weight("final_norm", activation(&[config.hidden_size]));
    let (normed, _) = residual_norm(&mut builder, config, hidden, residual, final_norm)?;

    let output = match head {
        ModelHead::Hidden => {
            builder.rename(normed, "hidden")?;
            normed
        }
        ModelHead::Greedy => {
            let logits = builder.emit_one(Op::DenseMatmul, &[normed, vocab])?;
            builder.rename(logits, "logits")?;
            let ids = builder.emit_one(Op::Argmax, &[logits])?;
            builder.rename(ids, "next_token_ids")?;
            ids
        }
    };
    builder.output(output);
    builder.finish()
}

/// Normalises `x`, first folding in `residual` when there is one. Returns the
/// normalised value and the residual stream to carry forward.
fn residual_norm(
    builder: &mut GraphBuilder,
    config: &GraphConfig,
    x: ValueId,
    residual: Option<ValueId>,
    weight: ValueId,
) -> Result<(ValueId, ValueId)> {
    match residual {
        None => {
            let y = builder.emit_one(normalize_op(config, false), &[x, weight])?;
            Ok((y, x))
        }
        Some(residual) => {
            let outputs = builder.emit(normalize_op(config, true), &[x, weight, residual])?;
            Ok((outputs[0], outputs[1]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::topology::schedule;
    use crate::graph::ValueRole;
    use crate::ops::Op;

    fn small() -> GraphConfig {
        GraphConfig::default()
            .with_batch_size(2)
            .with_hidden_size(64)
            .with_heads(4, 2)
            .with_intermediate_size(96)
            .with_num_layers(2)
    }

    fn names(graph: &Graph, ids: &[ValueId]) -> Vec<String> {
        ids.iter()
            .map(|id| graph.value(*id).unwrap().name.clone())
            .collect()
    }

    #[test]
    fn attn_binding_order() {
        let graph = build_attn(&small()).unwrap();
        assert_eq!(
            names(&graph, graph.inputs()),
            [
                "x",
                "key_cache",
                "value_cache",
                "slot_mapping",
                "block_tables",
                "context_lens"
            ]
        );
        assert_eq!(
            names(&graph, graph.weights()),
            ["qkv_proj", "q_norm", "k_norm", "o_proj"]
        );
    }

    #[test]
    fn residual_norm_returns_both_streams() {
        let graph = build_rmsnorm_with_residual(&small()).unwrap();
        assert_eq!(names(&graph, graph.inputs()), ["x", "residual"]);
        assert_eq!(names(&graph, graph.outputs()), ["y", "residual_out"]);
        let y = graph.find_value("y").unwrap();
        let residual_out = graph.find_value("residual_out").unwrap();
        assert_eq!(graph.value(y).unwrap().desc, graph.value(residual_out).unwrap().desc);
        assert!(graph.find_value("missing").is_none());
        assert_eq!(graph.nodes().len(), 1);
    }

    #[test]
    fn qk_norm_variant_stops_before_the_cache() {
        let config = small();
        let graph = build_attn_with_output(&config, AttnOutput::NormedQk).unwrap();
        assert_eq!(names(&graph, graph.inputs()), ["x"]);
        assert_eq!(names(&graph, graph.weights()), ["qkv_proj", "q_norm", "k_norm"]);
        assert_eq!(names(&graph, graph.outputs()), ["q", "k"]);
        let q = graph.value(graph.outputs()[0]).unwrap();
        let k = graph.value(graph.outputs()[1]).unwrap();
        assert_eq!(q.desc, TensorDesc::new([2, config.q_size()], DType::F16));
        assert_eq!(k.desc, TensorDesc::new([2, config.kv_size()], DType::F16));
        assert!(graph
            .nodes()
            .iter()
            .all(|node| !matches!(node.op, Op::ReshapeAndCache | Op::PagedAttention(_))));
        assert_eq!(
            build_attn_with_output(&config, AttnOutput::Projected).unwrap().fingerprint().unwrap(),
            build_attn(&config).unwrap().fingerprint().unwrap()
        );
    }

    #[test]
    fn cache_write_precedes_attention() {
        let graph = build_paged_attn(&small()).unwrap();
        let schedule = schedule(&graph).unwrap();
        let ops: Vec<&str> = schedule
            .order
            .iter()
            .map(|id| graph.node(*id).unwrap().op.name())
            .collect();
        assert_eq!(ops, ["reshape_and_cache", "paged_attention"]);
        let cache_version = graph.nodes()[0].outputs[0];
        assert_eq!(graph.storage_root(cache_version), graph.inputs()[3]);
    }

    #[test]
    fn model_weight_order_is_layer_major() {
        let graph = build_model(&small()).unwrap();
        let weights = names(&graph, graph.weights());
        assert_eq!(weights.len(), 1 + 8 * 2 + 1);
        assert_eq!(weights[0], "vocab_weight");
        assert_eq!(
            &weights[1..9],
            [
                "layers.0.pre_norm",
                "layers.0.qkv_proj",
                "layers.0.q_norm",
                "layers.0.k_norm",
                "layers.0.o_proj",
                "layers.0.post_norm",
                "layers.0.gate_up_proj",
                "layers.0.down_proj"
            ]
        );
        assert_eq!(weights.last().unwrap(), "final_norm");

        let inputs = names(&graph, graph.inputs());
        assert_eq!(inputs[..3], ["token_ids", "key_cache.0", "value_cache.0"]);
        assert_eq!(inputs.len(), 1 + 2 * 2 + 3);

        let output = graph.value(graph.outputs()[0]).unwrap();
        assert_eq!(output.desc, TensorDesc::new([2], DType::I32));
    }

    #[test]
    fn residual_adds_are_fused() {
        let graph = build_model(&small()).unwrap();
        let fused = graph
            .nodes()
            .iter()
            .filter(|node| matches!(node.op, Op::Normalize(p) if p.fused_residual))
            .count();
        // post-norm of each layer, pre-norm of layer 1 and the final norm
        assert_eq!(fused, 2 + 1 + 1);
    }

    #[test]
    fn zero_layers_needs_no_attention_fields() {
        let config = GraphConfig::default()
            .with_batch_size(3)
            .with_hidden_size(32)
            .with_heads(0, 0)
            .with_num_layers(0);
        let graph = build_model_with_head(&config, ModelHead::Hidden).unwrap();
        let ops: Vec<&str> = graph.nodes().iter().map(|node| node.op.name()).collect();
        assert_eq!(ops, ["embedding", "normalize"]);
        assert_eq!(graph.inputs().len(), 1);
        assert!(graph
            .values()
            .iter()
            .all(|info| info.role != ValueRole::Input || info.name == "token_ids"));
    }

    #[test]
    fn invalid_head_split_is_a_shape_error() {
        let config = small().with_heads(5, 1);
        assert!(matches!(
            build_attn(&config),
            Err(crate::error::GraphError::Shape(_))
        ));
        // the embedding recipe does not care about heads
        assert!(build_embedding(&config).is_ok());
    }
}
