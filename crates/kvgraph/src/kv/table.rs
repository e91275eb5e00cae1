use super::{KvCacheGeometry, PagePool};
use crate::error::{GraphError, Result};
use crate::tensor::HostTensor;

/// Logical-block to physical-page map for a batch of requests.
#[derive(Debug, Clone)]
pub struct BlockTable {
    page_size: usize,
    rows: Vec<Vec<usize>>,
}

impl BlockTable {
    pub fn new(batch: usize, page_size: usize) -> Self {
        Self {
            page_size,
            rows: vec![Vec::new(); batch],
        }
    }

    /// A table where request `i` owns pages `i * blocks .. (i + 1) * blocks`.
    pub fn contiguous(batch: usize, blocks_per_request: usize, page_size: usize) -> Self {
        Self {
            page_size,
            rows: (0..batch)
                .map(|request| {
                    (request * blocks_per_request..(request + 1) * blocks_per_request).collect()
                })
                .collect(),
        }
    }

    pub fn batch(&self) -> usize {
        self.rows.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_blocks(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn row(&self, request: usize) -> Option<&[usize]> {
        self.rows.get(request).map(Vec::as_slice)
    }

    pub fn push_page(&mut self, request: usize, page: usize) -> Result<()> {
        let batch = self.rows.len();
        let row = self
            .rows
            .get_mut(request)
            .ok_or_else(|| GraphError::range(format!("request {request} outside batch {batch}")))?;
        row.push(page);
        Ok(())
    }

    /// Grows request `request` from `pool` until it can hold `len` tokens.
    pub fn reserve(&mut self, pool: &mut PagePool, request: usize, len: usize) -> Result<()> {
        let needed = len.div_ceil(self.page_size);
        while self.row(request).map_or(0, <[usize]>::len) < needed {
            let page = pool.allocate()?;
            self.push_page(request, page)?;
        }
        Ok(())
    }

    pub fn page_for(&self, request: usize, position: usize) -> Result<usize> {
        let row = self
            .row(request)
            .ok_or_else(|| GraphError::range(format!("request {request} outside the table")))?;
        row.get(position / self.page_size).copied().ok_or_else(|| {
            GraphError::range(format!(
                "position {position} of request {request} is past its {} pages",
                row.len()
            ))
        })
    }

    /// Absolute cache slot of token `position` of request `request`.
    pub fn slot_for(&self, request: usize, position: usize) -> Result<usize> {
        Ok(self.page_for(request, position)? * self.page_size + position % self.page_size)
    }

    /// Device tensor `[batch, max_blocks]` I32; short rows repeat their first
    /// page so every entry names a real page.
    pub fn to_tensor(&self) -> Result<HostTensor> {
        let max_blocks = self.max_blocks().max(1);
        let mut values = Vec::with_capacity(self.batch() * max_blocks);
        for row in &self.rows {
            let pad = row.first().copied().unwrap_or(0);
            for block in 0..max_blocks {
                values.push(to_i32(row.get(block).copied().unwrap_or(pad))?);
            }
        }
        HostTensor::from_i32(&[self.batch(), max_blocks], values)
    }

    pub fn check_geometry(&self, geometry: &KvCacheGeometry) -> Result<()> {
        if self.page_size != geometry.page_size {
            return Err(GraphError::shape(format!(
                "block table uses pages of {}, cache pages hold {}",
                self.page_size, geometry.page_size
            )));
        }
        match self.rows.iter().flatten().find(|page| **page >= geometry.num_pages) {
            Some(page) => Err(GraphError::range(format!(
                "page {page} is outside a cache of {} pages",
                geometry.num_pages
            ))),
            None => Ok(()),
        }
    }
}

fn to_i32(value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| GraphError::range(format!("{value} does not fit an i32 index")))
}

/// Per-token scatter targets for one decode step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMapping(Vec<i32>);

impl SlotMapping {
    /// Slot of the token at `positions[i]` of request `i`.
    pub fn from_positions(table: &BlockTable, positions: &[usize]) -> Result<Self> {
        if positions.len() != table.batch() {
            return Err(GraphError::shape(format!(
                "{} positions for a batch of {}",
                positions.len(),
                table.batch()
            )));
        }
        positions
            .iter()
            .enumerate()
            .map(|(request, position)| to_i32(table.slot_for(request, *position)?))
            .collect::<Result<Vec<_>>>()
            .map(SlotMapping)
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    pub fn to_tensor(&self) -> Result<HostTensor> {
        HostTensor::from_i32(&[self.0.len()], self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_follow_the_table() {
        let mut table = BlockTable::new(2, 4);
        table.push_page(0, 3).unwrap();
        table.push_page(0, 1).unwrap();
        table.push_page(1, 0).unwrap();
        assert_eq!(table.slot_for(0, 5).unwrap(), 5);
        assert_eq!(table.slot_for(1, 3).unwrap(), 3);
        assert!(table.slot_for(1, 4).is_err());

        let mapping = SlotMapping::from_positions(&table, &[6, 2]).unwrap();
        assert_eq!(mapping.as_slice(), &[6, 2]);
    }

    #[test]
    fn tensor_pads_short_rows_with_first_page() {
        let mut table = BlockTable::new(2, 4);
        table.push_page(0, 2).unwrap();
        table.push_page(0, 5).unwrap();
        table.push_page(1, 7).unwrap();
        let tensor = table.to_tensor().unwrap();
        assert_eq!(tensor.dims(), &[2, 2]);
        assert_eq!(tensor.as_i32().unwrap(), &[2, 5, 7, 7]);
    }

    #[test]
    fn reserve_pulls_pages_from_pool() {
        let mut pool = PagePool::new(4);
        let mut table = BlockTable::new(2, 8);
        table.reserve(&mut pool, 0, 9).unwrap();
        table.reserve(&mut pool, 1, 1).unwrap();
        assert_eq!(table.row(0).unwrap(), &[0, 1]);
        assert_eq!(table.row(1).unwrap(), &[2]);
        assert_eq!(pool.available(), 1);
        assert!(table.reserve(&mut pool, 1, 24).is_err());
    }

    #[test]
    fn contiguous_matches_reference_layout() {
        let table = BlockTable::contiguous(3, 2, 128);
        let tensor = table.to_tensor().unwrap();
        assert_eq!(tensor.as_i32().unwrap(), &[0, 1, 2, 3, 4, 5]);
        table
            .check_geometry(&KvCacheGeometry::new(6, 128, 8, 128))
            .unwrap();
        assert!(table
            .check_geometry(&KvCacheGeometry::new(5, 128, 8, 128))
            .is_err());
    }
}
