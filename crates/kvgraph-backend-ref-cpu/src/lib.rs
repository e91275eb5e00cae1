//! Reference CPU backend for kvgraph.
//!
//! Buffers live in host memory behind shared handles; every launch and layout
//! conversion is queued on one worker thread, mirroring a device stream.

mod buffer;
pub mod cpu;
mod kernels;
mod stream;

pub use buffer::{CpuBuffer, Storage};
pub use cpu::{CpuBackend, CpuKernelInterceptor, GenericCpuBackend, NoopInterceptor};
