//! Operator vocabulary: the closed [`Op`] set, its contracts and eager helpers.

pub mod contract;
pub mod functional;
mod op;

pub use op::{NormalizeParams, Op, PagedAttentionParams, ReshapeParams, SplitParams};
