use thiserror::Error;

use crate::error::GraphError;
use crate::ops::Op;
use crate::tensor::{HostTensor, Layout, TensorDesc};

/// Failures reported by an [`OpBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("layout mismatch: {0}")]
    Layout(String),
    #[error("index out of range: {0}")]
    Range(String),
    #[error("unsupported {op}: {reason}")]
    Unsupported { op: &'static str, reason: String },
    #[error("device failure: {0}")]
    Execution(String),
}

impl BackendError {
    pub fn shape(message: impl Into<String>) -> Self {
        BackendError::Shape(message.into())
    }

    pub fn range(message: impl Into<String>) -> Self {
        BackendError::Range(message.into())
    }

    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unsupported {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution(message.into())
    }
}

/// Core validation helpers return [`GraphError`]; backends reuse them.
impl From<GraphError> for BackendError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Shape(msg) => BackendError::Shape(msg),
            GraphError::Layout(msg) => BackendError::Layout(msg),
            GraphError::Range(msg) => BackendError::Range(msg),
            GraphError::Compile(msg) | GraphError::Execution(msg) => BackendError::Execution(msg),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Kernel chosen for one node at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPlan {
    pub kernel: String,
    /// Scratch bytes the kernel needs while running; zero when unknown until bind.
    pub workspace_bytes: usize,
}

/// Device capability injected into contexts and sessions.
///
/// A backend owns exactly one in-order command stream. `enqueue` and
/// `convert_layout` only schedule work; completion, and any failure that
/// happened on the device, is observed through `synchronize`.
pub trait OpBackend: Send + Sync {
    /// Handle to device memory. Clones refer to the same storage.
    type Buffer: Clone + Send + Sync + 'static;

    fn backend_name(&self) -> &str;

    /// Allocates an uninitialised-by-contract buffer for a fully static descriptor.
    fn allocate(&self, desc: &TensorDesc) -> BackendResult<Self::Buffer>;

    /// Copies a host tensor into a new buffer stored in `layout`.
    fn upload(&self, tensor: &HostTensor, layout: Layout) -> BackendResult<Self::Buffer>;

    /// Reads a buffer back in logical row-major order.
    ///
    /// Does not wait for queued work; callers synchronize first.
    fn download(&self, buffer: &Self::Buffer) -> BackendResult<HostTensor>;

    fn describe(&self, buffer: &Self::Buffer) -> TensorDesc;

    /// Whether two handles refer to the same storage.
    fn same_buffer(&self, a: &Self::Buffer, b: &Self::Buffer) -> bool;

    /// Schedules a copy of `src` into `dst`, rearranging between their layouts.
    /// Both must have the same logical shape and dtype.
    fn convert_layout(&self, src: &Self::Buffer, dst: &Self::Buffer) -> BackendResult<()>;

    /// Selects a kernel for `op` over the given (possibly symbolic) descriptors.
    fn prepare(
        &self,
        op: &Op,
        inputs: &[TensorDesc],
        outputs: &[TensorDesc],
    ) -> BackendResult<KernelPlan>;

    fn enqueue(&self, op: &Op, inputs: &[Self::Buffer], outputs: &[Self::Buffer]) -> BackendResult<()>;

    /// Blocks until the stream drains and reports the first failure since the
    /// previous barrier.
    fn synchronize(&self) -> BackendResult<()>;
}
