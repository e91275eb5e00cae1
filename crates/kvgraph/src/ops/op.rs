use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::tensor::Shape;

/// Root-mean-square normalisation over the last axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizeParams {
    pub eps: f32,
    /// Adds a residual input first and returns the sum as a second output.
    pub fused_residual: bool,
}

/// Attention of one query token per request over its paged history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PagedAttentionParams {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub scale: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitParams {
    /// Extents of the pieces along the last axis.
    pub sizes: SmallVec<[usize; 4]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshapeParams {
    pub shape: Shape,
}

/// Closed set of operators a graph node can carry.
///
/// Operand order for each variant:
///
/// | op | inputs | outputs |
/// |---|---|---|
/// | `Embedding` | ids, table | hidden |
/// | `Normalize` | x, weight, residual? | y, residual_out? |
/// | `GatedActivation` | x | y |
/// | `DenseMatmul` | x, w | y |
/// | `GroupedMatmul` | x, w, group_list | y |
/// | `ReshapeAndCache` | key, value, key_cache, value_cache, slot_mapping | key_cache', value_cache' |
/// | `PagedAttention` | query, key_cache, value_cache, block_tables, context_lens | out |
/// | `Split` | x | one per size |
/// | `Reshape` | x | y |
/// | `Argmax` | x | ids |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Embedding,
    Normalize(NormalizeParams),
    GatedActivation,
    DenseMatmul,
    GroupedMatmul,
    ReshapeAndCache,
    PagedAttention(PagedAttentionParams),
    Split(SplitParams),
    Reshape(ReshapeParams),
    Argmax,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Embedding => "embedding",
            Op::Normalize(_) => "normalize",
            Op::GatedActivation => "gated_activation",
            Op::DenseMatmul => "dense_matmul",
            Op::GroupedMatmul => "grouped_matmul",
            Op::ReshapeAndCache => "reshape_and_cache",
            Op::PagedAttention(_) => "paged_attention",
            Op::Split(_) => "split",
            Op::Reshape(_) => "reshape",
            Op::Argmax => "argmax",
        }
    }

    pub fn num_inputs(&self) -> usize {
        match self {
            Op::Embedding | Op::DenseMatmul => 2,
            Op::Normalize(params) => {
                if params.fused_residual {
                    3
                } else {
                    2
                }
            }
            Op::GatedActivation | Op::Split(_) | Op::Reshape(_) | Op::Argmax => 1,
            Op::GroupedMatmul => 3,
            Op::ReshapeAndCache | Op::PagedAttention(_) => 5,
        }
    }

    pub fn num_outputs(&self) -> usize {
        match self {
            Op::Normalize(params) if params.fused_residual => 2,
            Op::ReshapeAndCache => 2,
            Op::Split(params) => params.sizes.len(),
            _ => 1,
        }
    }

    /// `(output, input)` pairs whose output is written into the input's storage.
    pub fn in_place(&self) -> &'static [(usize, usize)] {
        match self {
            Op::ReshapeAndCache => &[(0, 2), (1, 3)],
            _ => &[],
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Normalize(params) => write!(
                f,
                "normalize(eps={}, residual={})",
                params.eps, params.fused_residual
            ),
            Op::PagedAttention(params) => write!(
                f,
                "paged_attention(heads={}, kv_heads={}, scale={})",
                params.num_heads, params.num_kv_heads, params.scale
            ),
            Op::Split(params) => write!(f, "split({:?})", params.sizes.as_slice()),
            Op::Reshape(params) => write!(f, "reshape({})", params.shape),
            other => f.write_str(other.name()),
        }
    }
}
