//! Device capability boundary.

pub mod hashing;
pub mod spec;

pub use spec::{BackendError, BackendResult, KernelPlan, OpBackend};
