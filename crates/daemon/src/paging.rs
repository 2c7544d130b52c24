//! Bidirectional paging over ordered result sets
//!
//! A [`PagingCursor`] remembers the parameters of one search and the page the
//! caller is on. Rows are fetched on demand from a [`PagedSource`], and the
//! page count is recomputed on every request so the cursor follows rows being
//! added or removed between pages.

use libwarden::model::Page;

use crate::store::StorageError;

/// Storage able to count and window the rows matching `P`.
///
/// `fetch` must return rows in a total order that is stable across calls.
pub trait PagedSource<P> {
    type Item;

    fn count(&self, parameters: &P) -> Result<u64, StorageError>;

    fn fetch(&self, parameters: &P, offset: u64, limit: u32)
    -> Result<Vec<Self::Item>, StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingCursor<P> {
    parameters: P,
    page_size: u32,
    page_index: u32,
    page_count: u32,
}

impl<P> PagingCursor<P> {
    /// Start at page 1; `page_size` is raised to at least 1
    pub fn create(parameters: P, page_size: u32) -> Self {
        Self {
            parameters,
            page_size: page_size.max(1),
            page_index: 1,
            page_count: 1,
        }
    }

    pub fn parameters(&self) -> &P {
        &self.parameters
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_index(&self) -> u32 {
        self.page_index
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn page_current<S>(&mut self, source: &S) -> Result<Page<S::Item>, StorageError>
    where
        S: PagedSource<P>,
    {
        self.refresh(source)?;
        self.fetch(source)
    }

    /// Advance one page; stays on the last page instead of wrapping
    pub fn page_next<S>(&mut self, source: &S) -> Result<Page<S::Item>, StorageError>
    where
        S: PagedSource<P>,
    {
        self.refresh(source)?;
        if self.page_index < self.page_count {
            self.page_index += 1;
        }
        self.fetch(source)
    }

    /// Go back one page; stays on page 1 instead of wrapping
    pub fn page_previous<S>(&mut self, source: &S) -> Result<Page<S::Item>, StorageError>
    where
        S: PagedSource<P>,
    {
        self.refresh(source)?;
        if self.page_index > 1 {
            self.page_index -= 1;
        }
        self.fetch(source)
    }

    fn refresh<S: PagedSource<P>>(&mut self, source: &S) -> Result<(), StorageError> {
        let total = source.count(&self.parameters)?;
        self.page_count = page_count(total, self.page_size);
        self.page_index = self.page_index.clamp(1, self.page_count);
        Ok(())
    }

    fn fetch<S: PagedSource<P>>(&self, source: &S) -> Result<Page<S::Item>, StorageError> {
        let offset = u64::from(self.page_index - 1) * u64::from(self.page_size);
        let items = source.fetch(&self.parameters, offset, self.page_size)?;
        Ok(Page {
            items,
            page_index: self.page_index,
            page_count: self.page_count,
            page_first_offset: offset,
        })
    }
}

/// `max(1, ceil(total / page_size))`, saturating at `u32::MAX`
pub fn page_count(total: u64, page_size: u32) -> u32 {
    let pages = total.div_ceil(u64::from(page_size.max(1))).max(1);
    u32::try_from(pages).unwrap_or(u32::MAX)
}
