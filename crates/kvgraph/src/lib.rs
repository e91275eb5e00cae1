//! Graph execution engine for decode-step transformer inference over a paged
//! KV cache.
//!
//! Recipes in [`graph::recipes`] build an immutable [`graph::Graph`] of fused
//! operators for a [`graph::GraphConfig`]. A [`runtime::Context`] or
//! [`runtime::Session`] compiles it against an injected
//! [`backend::OpBackend`], binds device buffers (converting layouts where an
//! operator needs a different one) and enqueues the nodes in dependency order
//! on the backend's stream.

pub mod backend;
mod env;
pub mod error;
pub mod graph;
pub mod kv;
pub mod ops;
pub mod runtime;
pub mod tensor;

pub use backend::{BackendError, BackendResult, KernelPlan, OpBackend};
pub use error::{GraphError, Result};
pub use graph::{Graph, GraphBuilder, GraphConfig};
pub use runtime::{Context, Session};
pub use tensor::{DType, HostTensor, Layout, TensorDesc};
