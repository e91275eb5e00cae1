//! Compilation, binding and dispatch of graphs on a backend stream.

mod binding;
mod context;
mod executable;
mod plan;
mod session;

pub use context::{Context, DEFAULT_PLAN_CACHE_CAPACITY};
pub use executable::{DispatchOptions, Executable};
pub use session::{GraphId, Session};
