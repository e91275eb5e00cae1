use thiserror::Error;

use crate::backend::spec::BackendError;

/// Error taxonomy surfaced by graph construction, binding and dispatch.
///
/// Shape, layout and compile errors are raised synchronously before any work
/// reaches the device stream. Range errors are raised there when the index
/// tensors can be read on the host, otherwise at the next synchronize.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("shape error: {0}")]
    Shape(String),
    #[error("layout error: {0}")]
    Layout(String),
    #[error("range error: {0}")]
    Range(String),
    #[error("compile error: {0}")]
    Compile(String),
    #[error("execution error: {0}")]
    Execution(String),
}

impl GraphError {
    pub fn shape(message: impl Into<String>) -> Self {
        GraphError::Shape(message.into())
    }

    pub fn layout(message: impl Into<String>) -> Self {
        GraphError::Layout(message.into())
    }

    pub fn range(message: impl Into<String>) -> Self {
        GraphError::Range(message.into())
    }

    pub fn compile(message: impl Into<String>) -> Self {
        GraphError::Compile(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        GraphError::Execution(message.into())
    }

    /// Short lowercase name of the error kind, handy in logs and assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            GraphError::Shape(_) => "shape",
            GraphError::Layout(_) => "layout",
            GraphError::Range(_) => "range",
            GraphError::Compile(_) => "compile",
            GraphError::Execution(_) => "execution",
        }
    }

    /// Maps a failure reported by `synchronize`. Index faults stay range
    /// errors; anything else the device reports is an execution error.
    pub(crate) fn from_sync(err: BackendError) -> Self {
        match err {
            BackendError::Range(msg) => GraphError::Range(msg),
            other => GraphError::Execution(other.to_string()),
        }
    }

    /// Prefixes the message with `context`, keeping the kind.
    pub(crate) fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            GraphError::Shape(msg) => GraphError::Shape(format!("{context}: {msg}")),
            GraphError::Layout(msg) => GraphError::Layout(format!("{context}: {msg}")),
            GraphError::Range(msg) => GraphError::Range(format!("{context}: {msg}")),
            GraphError::Compile(msg) => GraphError::Compile(format!("{context}: {msg}")),
            GraphError::Execution(msg) => GraphError::Execution(format!("{context}: {msg}")),
        }
    }
}

/// Enqueue-time backend failures keep their kind.
impl From<BackendError> for GraphError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Shape(msg) => GraphError::Shape(msg),
            BackendError::Layout(msg) => GraphError::Layout(msg),
            BackendError::Range(msg) => GraphError::Range(msg),
            BackendError::Unsupported { op, reason } => {
                GraphError::Compile(format!("backend cannot run {op}: {reason}"))
            }
            BackendError::Execution(msg) => GraphError::Execution(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Returns a [`GraphError::Shape`] built from a format string unless `cond` holds.
#[macro_export]
macro_rules! ensure_shape {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::GraphError::Shape(format!($($arg)+)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_failures_keep_range_kind() {
        let range = GraphError::from_sync(BackendError::range("slot 64 is outside 64 cache slots"));
        assert_eq!(range.kind(), "range");
        let device = GraphError::from_sync(BackendError::execution("device lost"));
        assert_eq!(device.kind(), "execution");
        let shape = GraphError::from_sync(BackendError::shape("bad rows"));
        assert_eq!(shape.kind(), "execution");
    }

    #[test]
    fn context_prefixes_without_changing_kind() {
        let err = GraphError::range("page 9 of 8").context("n3 (paged_attention)");
        assert_eq!(err, GraphError::Range("n3 (paged_attention): page 9 of 8".into()));
    }
}
