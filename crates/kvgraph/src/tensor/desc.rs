use std::fmt;

use serde::{Deserialize, Serialize};

use super::{layout, DType, Dim, Layout, Shape};
use crate::error::{GraphError, Result};

/// Expected shape, element type and memory layout of a graph slot or buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    pub shape: Shape,
    pub dtype: DType,
    #[serde(default)]
    pub layout: Layout,
}

impl TensorDesc {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
            layout: Layout::Nd,
        }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[Dim] {
        self.shape.dims()
    }

    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.shape.static_dims()
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Dims of a descriptor that must be fully static, such as an allocation request.
    pub fn require_static(&self) -> Result<Vec<usize>> {
        self.static_dims()
            .ok_or_else(|| GraphError::shape(format!("{self} has unresolved symbolic extents")))
    }

    /// Physical element count, including fractal-NZ padding.
    pub fn storage_len(&self) -> Result<usize> {
        layout::storage_len(&self.require_static()?, self.layout)
    }

    pub fn byte_len(&self) -> Result<usize> {
        Ok(self.storage_len()? * self.dtype.size_in_bytes())
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@{}", self.dtype, self.shape, self.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_includes_tile_padding() {
        let cache = TensorDesc::new([4, 8, 32], DType::F16).with_layout(Layout::FractalNz);
        assert_eq!(cache.storage_len().unwrap(), 4 * 16 * 32);
        assert_eq!(cache.byte_len().unwrap(), 4 * 16 * 32 * 2);
        assert_eq!(cache.to_string(), "f16[4, 8, 32]@nz");
    }

    #[test]
    fn symbolic_desc_has_no_storage() {
        let desc = TensorDesc::new(vec![Dim::sym("vocab"), Dim::Static(64)], DType::F16);
        assert!(matches!(desc.storage_len(), Err(GraphError::Shape(_))));
    }
}
