//! Tensor descriptors, memory layouts and host-side tensors.

mod desc;
mod dtype;
mod host;
pub mod layout;
mod shape;

pub use desc::TensorDesc;
pub use dtype::DType;
pub use host::{HostData, HostTensor};
pub use layout::{Layout, MatrixIndexer, NZ_BLOCK};
pub use shape::{Dim, DimSymbol, Shape};
