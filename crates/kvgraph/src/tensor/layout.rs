use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Edge length of a fractal-NZ tile.
pub const NZ_BLOCK: usize = 16;

/// Physical arrangement of a buffer's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Layout {
    /// Row-major, the logical order.
    #[default]
    Nd,
    /// 16x16-tiled arrangement of the trailing `[rows, cols]` matrix: columns
    /// grouped in blocks of 16, rows padded to a multiple of 16.
    FractalNz,
}

impl Layout {
    const ACL_FORMAT_ND: i64 = 2;
    const ACL_FORMAT_FRACTAL_NZ: i64 = 29;

    /// Maps the numeric format codes used by the device runtime.
    pub fn from_acl_format(code: i64) -> Option<Self> {
        match code {
            Self::ACL_FORMAT_ND => Some(Layout::Nd),
            Self::ACL_FORMAT_FRACTAL_NZ => Some(Layout::FractalNz),
            _ => None,
        }
    }

    pub fn acl_format(self) -> i64 {
        match self {
            Layout::Nd => Self::ACL_FORMAT_ND,
            Layout::FractalNz => Self::ACL_FORMAT_FRACTAL_NZ,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Layout::Nd => "nd",
            Layout::FractalNz => "nz",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maps `(matrix, row, col)` coordinates of a logical tensor to physical
/// element offsets.
///
/// The trailing two axes form the matrix, leading axes are flattened into a
/// batch of matrices stored back to back. Rank 1 and rank 0 tensors are a
/// single-row matrix in `Nd` and cannot be tiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixIndexer {
    layout: Layout,
    batch: usize,
    rows: usize,
    cols: usize,
    rows_padded: usize,
}

impl MatrixIndexer {
    pub fn new(dims: &[usize], layout: Layout) -> Result<Self> {
        let (batch, rows, cols) = match dims.len() {
            0 => (1, 1, 1),
            1 => (1, 1, dims[0]),
            rank => (
                dims[..rank - 2].iter().product(),
                dims[rank - 2],
                dims[rank - 1],
            ),
        };
        let rows_padded = match layout {
            Layout::Nd => rows,
            Layout::FractalNz => {
                if dims.len() < 2 {
                    return Err(GraphError::layout(format!(
                        "a rank-{} tensor cannot be tiled into {}",
                        dims.len(),
                        layout
                    )));
                }
                if cols % NZ_BLOCK != 0 {
                    return Err(GraphError::layout(format!(
                        "fractal-nz needs the last axis to be a multiple of {NZ_BLOCK}, got {cols}"
                    )));
                }
                rows.div_ceil(NZ_BLOCK) * NZ_BLOCK
            }
        };
        Ok(Self {
            layout,
            batch,
            rows,
            cols,
            rows_padded,
        })
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Physical element count including tile padding.
    pub fn storage_len(&self) -> usize {
        self.batch * self.rows_padded * self.cols
    }

    #[inline]
    pub fn offset(&self, matrix: usize, row: usize, col: usize) -> usize {
        let base = matrix * self.rows_padded * self.cols;
        match self.layout {
            Layout::Nd => base + row * self.cols + col,
            Layout::FractalNz => {
                base + (col / NZ_BLOCK) * (self.rows_padded * NZ_BLOCK)
                    + row * NZ_BLOCK
                    + col % NZ_BLOCK
            }
        }
    }

    /// Physical offset of the element at a row-major logical index.
    #[inline]
    pub fn offset_of_linear(&self, index: usize) -> usize {
        let per_matrix = self.rows * self.cols;
        let matrix = index / per_matrix;
        let within = index % per_matrix;
        self.offset(matrix, within / self.cols, within % self.cols)
    }

    fn logical_len(&self) -> usize {
        self.batch * self.rows * self.cols
    }
}

/// Number of elements a buffer of `dims` occupies in `layout`.
pub fn storage_len(dims: &[usize], layout: Layout) -> Result<usize> {
    Ok(MatrixIndexer::new(dims, layout)?.storage_len())
}

/// Rearranges row-major `logical` values into `layout`, filling padding with
/// `T::default()`.
pub fn to_physical<T: Copy + Default>(dims: &[usize], layout: Layout, logical: &[T]) -> Result<Vec<T>> {
    let indexer = MatrixIndexer::new(dims, layout)?;
    if logical.len() != indexer.logical_len() {
        return Err(GraphError::shape(format!(
            "expected {} logical elements for {:?}, got {}",
            indexer.logical_len(),
            dims,
            logical.len()
        )));
    }
    if layout == Layout::Nd {
        return Ok(logical.to_vec());
    }
    let mut physical = vec![T::default(); indexer.storage_len()];
    for (index, value) in logical.iter().enumerate() {
        physical[indexer.offset_of_linear(index)] = *value;
    }
    Ok(physical)
}

/// Inverse of [`to_physical`]: reads a buffer in `layout` back into row-major order.
pub fn to_logical<T: Copy>(dims: &[usize], layout: Layout, physical: &[T]) -> Result<Vec<T>> {
    let indexer = MatrixIndexer::new(dims, layout)?;
    if physical.len() != indexer.storage_len() {
        return Err(GraphError::shape(format!(
            "expected {} physical elements for {:?} in {}, got {}",
            indexer.storage_len(),
            dims,
            layout,
            physical.len()
        )));
    }
    if layout == Layout::Nd {
        return Ok(physical.to_vec());
    }
    Ok((0..indexer.logical_len())
        .map(|index| physical[indexer.offset_of_linear(index)])
        .collect())
}
