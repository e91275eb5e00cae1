//! Host-side bookkeeping for the paged KV cache.
//!
//! The device cache of one layer is a pool of pages, each a tiled
//! `[page_size, num_kv_heads * head_dim]` matrix. Requests own chains of pages
//! recorded in a [`BlockTable`]; a token's absolute slot is
//! `page_id * page_size + offset`.

mod pool;
mod table;

pub use pool::PagePool;
pub use table::{BlockTable, SlotMapping};

use crate::error::{GraphError, Result};
use crate::tensor::{DType, Layout, TensorDesc};

/// Dimensions of one K or V cache buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KvCacheGeometry {
    pub num_pages: usize,
    pub page_size: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl KvCacheGeometry {
    pub fn new(num_pages: usize, page_size: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_pages,
            page_size,
            num_kv_heads,
            head_dim,
        }
    }

    /// Geometry of a cache buffer with dims `[pages, page_size, kv_heads * head_dim]`.
    pub fn from_cache_dims(dims: &[usize], head_dim: usize) -> Result<Self> {
        match dims {
            [pages, page_size, row] if head_dim > 0 && row % head_dim == 0 => {
                Ok(Self::new(*pages, *page_size, row / head_dim, head_dim))
            }
            _ => Err(GraphError::shape(format!(
                "cache dims {dims:?} do not hold heads of width {head_dim}"
            ))),
        }
    }

    pub fn row_width(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    pub fn num_slots(&self) -> usize {
        self.num_pages * self.page_size
    }

    /// Device descriptor of one cache buffer: f16, fractal-NZ tiled per page.
    pub fn cache_desc(&self) -> TensorDesc {
        TensorDesc::new([self.num_pages, self.page_size, self.row_width()], DType::F16)
            .with_layout(Layout::FractalNz)
    }

    pub fn slot(&self, page: usize, offset: usize) -> Result<usize> {
        if page >= self.num_pages || offset >= self.page_size {
            return Err(GraphError::range(format!(
                "page {page} offset {offset} is outside a cache of {} pages of {}",
                self.num_pages, self.page_size
            )));
        }
        Ok(page * self.page_size + offset)
    }
}

/// Checks decode-step index tensors against a cache before dispatch.
///
/// `block_tables` is row-major `[batch, max_blocks]`. Negative slots mark
/// padding tokens and are skipped by the cache writer.
pub fn validate_indices(
    geometry: &KvCacheGeometry,
    slot_mapping: &[i32],
    block_tables: &[i32],
    context_lens: &[i32],
) -> Result<()> {
    for (token, slot) in slot_mapping.iter().enumerate() {
        if *slot >= 0 && *slot as usize >= geometry.num_slots() {
            return Err(GraphError::range(format!(
                "slot {slot} of token {token} is outside {} cache slots",
                geometry.num_slots()
            )));
        }
    }
    let batch = context_lens.len();
    if batch == 0 {
        return Ok(());
    }
    if block_tables.len() % batch != 0 {
        return Err(GraphError::shape(format!(
            "block tables of {} entries do not split into {batch} rows",
            block_tables.len()
        )));
    }
    let max_blocks = block_tables.len() / batch;

    for (request, len) in context_lens.iter().enumerate() {
        if *len < 0 || *len as usize > max_blocks * geometry.page_size {
            return Err(GraphError::range(format!(
                "context length {len} of request {request} exceeds {max_blocks} blocks of {}",
                geometry.page_size
            )));
        }
        let used = (*len as usize).div_ceil(geometry.page_size);
        let row = &block_tables[request * max_blocks..request * max_blocks + used];
        if let Some(page) = row
            .iter()
            .find(|page| **page < 0 || **page as usize >= geometry.num_pages)
        {
            return Err(GraphError::range(format!(
                "request {request} references page {page} of {}",
                geometry.num_pages
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> KvCacheGeometry {
        KvCacheGeometry::new(4, 8, 2, 16)
    }

    #[test]
    fn cache_desc_is_tiled_f16() {
        let desc = geometry().cache_desc();
        assert_eq!(desc.to_string(), "f16[4, 8, 32]@nz");
        assert_eq!(geometry().num_slots(), 32);
        assert_eq!(geometry().slot(3, 7).unwrap(), 31);
        assert!(geometry().slot(4, 0).is_err());
    }

    #[test]
    fn validate_accepts_consistent_indices() {
        let tables = [0, 1, 2, 3];
        validate_indices(&geometry(), &[9, -1], &tables, &[10, 16]).unwrap();
    }

    #[test]
    fn validate_rejects_out_of_range_entries() {
        let g = geometry();
        let tables = [0, 1, 2, 3];
        assert!(matches!(
            validate_indices(&g, &[32], &tables, &[1, 1]),
            Err(GraphError::Range(_))
        ));
        assert!(matches!(
            validate_indices(&g, &[0], &tables, &[17, 1]),
            Err(GraphError::Range(_))
        ));
        assert!(matches!(
            validate_indices(&g, &[0], &[0, 9, 2, 3], &[9, 1]),
            Err(GraphError::Range(_))
        ));
        // pages past the context length are never read
        validate_indices(&g, &[0], &[0, 9, 2, 3], &[8, 1]).unwrap();
    }

    #[test]
    fn slots_are_checked_without_a_batch() {
        assert!(matches!(
            validate_indices(&geometry(), &[40], &[], &[]),
            Err(GraphError::Range(_))
        ));
        validate_indices(&geometry(), &[-1, 31], &[], &[]).unwrap();
    }

    #[test]
    fn geometry_from_cache_dims() {
        assert_eq!(KvCacheGeometry::from_cache_dims(&[4, 8, 32], 16).unwrap(), geometry());
        assert!(KvCacheGeometry::from_cache_dims(&[4, 8, 30], 16).is_err());
        assert!(KvCacheGeometry::from_cache_dims(&[4, 8], 16).is_err());
    }
}
