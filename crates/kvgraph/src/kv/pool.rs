use std::collections::BTreeSet;

use crate::error::{GraphError, Result};

/// Free-list allocator over the physical page ids of a cache.
///
/// Pages are handed out lowest id first so page assignment is deterministic.
#[derive(Debug, Clone)]
pub struct PagePool {
    num_pages: usize,
    free: BTreeSet<usize>,
}

impl PagePool {
    pub fn new(num_pages: usize) -> Self {
        Self {
            num_pages,
            free: (0..num_pages).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.num_pages
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn is_allocated(&self, page: usize) -> bool {
        page < self.num_pages && !self.free.contains(&page)
    }

    pub fn allocate(&mut self) -> Result<usize> {
        self.free
            .pop_first()
            .ok_or_else(|| GraphError::range(format!("all {} pages are in use", self.num_pages)))
    }

    pub fn free(&mut self, page: usize) -> Result<()> {
        if page >= self.num_pages {
            return Err(GraphError::range(format!(
                "page {page} does not exist in a pool of {}",
                self.num_pages
            )));
        }
        if !self.free.insert(page) {
            return Err(GraphError::range(format!("page {page} is already free")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_reused_after_free() {
        let mut pool = PagePool::new(2);
        assert_eq!(pool.allocate().unwrap(), 0);
        assert_eq!(pool.allocate().unwrap(), 1);
        assert!(matches!(pool.allocate(), Err(GraphError::Range(_))));
        pool.free(0).unwrap();
        assert!(!pool.is_allocated(0));
        assert_eq!(pool.allocate().unwrap(), 0);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut pool = PagePool::new(3);
        let page = pool.allocate().unwrap();
        pool.free(page).unwrap();
        assert!(pool.free(page).is_err());
        assert!(pool.free(7).is_err());
    }
}
