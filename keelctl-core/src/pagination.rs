//! Page-based slicing of table reads.

use serde::{Deserialize, Serialize};

/// Maximum rows per page
const MAX_PER_PAGE: u32 = 500;

/// Default rows per page
const DEFAULT_PER_PAGE: u32 = 20;

/// Page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Page number (1-indexed)
    pub page: u32,
    /// Rows per page (max 500)
    pub per_page: u32,
}

impl Pagination {
    /// Create a page request.
    ///
    /// - Page is clamped to minimum of 1
    /// - Per page is clamped to 1..=500
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    /// OFFSET for this page.
    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.per_page as u64
    }

    /// LIMIT for this page.
    pub fn limit(&self) -> u64 {
        self.per_page as u64
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

/// One page of rows plus the total across all pages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Paginated<T> {
    pub fn total_pages(&self) -> u64 {
        if self.total == 0 {
            1
        } else {
            self.total.div_ceil(self.per_page.max(1) as u64)
        }
    }

    pub fn has_next(&self) -> bool {
        (self.page as u64) < self.total_pages()
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    /// Convert the items, keeping the page metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginated<U> {
        Paginated {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            per_page: self.per_page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(total: u64, page: u32, per_page: u32) -> Paginated<()> {
        Paginated {
            items: vec![],
            total,
            page,
            per_page,
        }
    }

    #[test]
    fn offset_calculation() {
        assert_eq!(Pagination::new(1, 10).offset(), 0);
        assert_eq!(Pagination::new(3, 25).offset(), 50);
    }

    #[test]
    fn clamps_inputs() {
        assert_eq!(Pagination::new(0, 10).page, 1);
        assert_eq!(Pagination::new(1, 0).per_page, 1);
        assert_eq!(Pagination::new(1, 9999).per_page, 500);
    }

    #[test]
    fn total_pages() {
        assert_eq!(page(0, 1, 10).total_pages(), 1);
        assert_eq!(page(25, 1, 10).total_pages(), 3);
        assert_eq!(page(100, 1, 10).total_pages(), 10);
    }

    #[test]
    fn has_next_prev() {
        assert!(page(30, 1, 10).has_next());
        assert!(!page(30, 1, 10).has_prev());
        assert!(!page(30, 3, 10).has_next());
        assert!(page(30, 3, 10).has_prev());
    }
}
