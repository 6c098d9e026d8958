use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// A 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    pub page_number: u64,
    pub page_size: u64,
}

impl PageRequest {
    pub fn new(page_number: u64, page_size: u64) -> Result<Self, DataError> {
        if page_number < 1 {
            return Err(DataError::InvalidArgument(format!(
                "page_number must be >= 1, got {page_number}"
            )));
        }
        if page_size < 1 {
            return Err(DataError::InvalidArgument(format!(
                "page_size must be >= 1, got {page_size}"
            )));
        }
        if (page_number - 1).checked_mul(page_size).is_none() {
            return Err(DataError::InvalidArgument(format!(
                "page {page_number} of size {page_size} is out of range"
            )));
        }
        Ok(Self {
            page_number,
            page_size,
        })
    }

    /// Number of items before this page. Saturates for requests built
    /// without [`new`](PageRequest::new).
    pub fn offset(&self) -> u64 {
        self.page_number.saturating_sub(1).saturating_mul(self.page_size)
    }
}

/// One page of results plus enough metadata to derive pagination state.
///
/// `total_item_count` counts matches across all pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedResult<T> {
    items: Vec<T>,
    total_item_count: u64,
    page_number: u64,
    page_size: u64,
}

impl<T> PagedResult<T> {
    pub fn new(items: Vec<T>, total_item_count: u64, request: PageRequest) -> Self {
        Self {
            items,
            total_item_count,
            page_number: request.page_number,
            page_size: request.page_size,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn total_item_count(&self) -> u64 {
        self.total_item_count
    }

    pub fn page_number(&self) -> u64 {
        self.page_number
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        if self.page_size == 0 {
            0
        } else {
            self.total_item_count.div_ceil(self.page_size)
        }
    }

    pub fn has_previous_page(&self) -> bool {
        self.page_number > 1
    }

    pub fn has_next_page(&self) -> bool {
        self.page_number < self.page_count()
    }

    pub fn is_first_page(&self) -> bool {
        self.page_number == 1
    }

    pub fn is_last_page(&self) -> bool {
        self.page_number >= self.page_count()
    }

    /// 1-based index of the first item on this page, clamped to the total.
    /// Zero when there are no items at all.
    pub fn first_item_on_page(&self) -> u64 {
        let first = self
            .page_number
            .saturating_sub(1)
            .saturating_mul(self.page_size)
            .saturating_add(1);
        first.min(self.total_item_count)
    }

    /// 1-based index of the last item on this page, clamped to the total.
    pub fn last_item_on_page(&self) -> u64 {
        self.page_number
            .saturating_mul(self.page_size)
            .min(self.total_item_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(total: u64, number: u64, size: u64) -> PagedResult<u32> {
        PagedResult::new(Vec::new(), total, PageRequest::new(number, size).unwrap())
    }

    #[test]
    fn test_rejects_zero_page_or_size() {
        assert!(matches!(PageRequest::new(0, 10), Err(DataError::InvalidArgument(_))));
        assert!(matches!(PageRequest::new(1, 0), Err(DataError::InvalidArgument(_))));
    }

    #[test]
    fn test_offset_is_one_based() {
        assert_eq!(PageRequest::new(1, 20).unwrap().offset(), 0);
        assert_eq!(PageRequest::new(3, 20).unwrap().offset(), 40);
    }

    #[test]
    fn test_out_of_range_page_is_rejected() {
        assert!(matches!(
            PageRequest::new(u64::MAX, 10),
            Err(DataError::InvalidArgument(_))
        ));
        assert!(matches!(
            PageRequest::new(3, u64::MAX),
            Err(DataError::InvalidArgument(_))
        ));
        // the last page whose offset still fits
        let request = PageRequest::new(u64::MAX / 10 + 1, 10).unwrap();
        assert_eq!(request.offset(), u64::MAX / 10 * 10);
        assert_eq!(PageRequest::new(1, u64::MAX).unwrap().offset(), 0);
    }

    #[test]
    fn test_item_bounds_saturate_on_huge_pages() {
        let p = page(25, 1, u64::MAX);
        assert_eq!(p.first_item_on_page(), 1);
        assert_eq!(p.last_item_on_page(), 25);
        let p = page(7, u64::MAX / 10 + 1, 10);
        assert_eq!(p.first_item_on_page(), 7);
        assert_eq!(p.last_item_on_page(), 7);
    }

    #[test]
    fn test_derived_state_middle_page() {
        let p = page(25, 2, 10);
        assert_eq!(p.page_count(), 3);
        assert!(p.has_previous_page());
        assert!(p.has_next_page());
        assert!(!p.is_first_page());
        assert!(!p.is_last_page());
        assert_eq!(p.first_item_on_page(), 11);
        assert_eq!(p.last_item_on_page(), 20);
    }

    #[test]
    fn test_derived_state_last_partial_page() {
        let p = page(25, 3, 10);
        assert!(!p.has_next_page());
        assert!(p.is_last_page());
        assert_eq!(p.first_item_on_page(), 21);
        assert_eq!(p.last_item_on_page(), 25);
    }

    #[test]
    fn test_empty_result() {
        let p = page(0, 1, 10);
        assert_eq!(p.page_count(), 0);
        assert!(!p.has_previous_page());
        assert!(!p.has_next_page());
        assert!(p.is_last_page());
        assert_eq!(p.first_item_on_page(), 0);
        assert_eq!(p.last_item_on_page(), 0);
    }
}
