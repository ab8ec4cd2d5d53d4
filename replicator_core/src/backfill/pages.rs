use crate::models::Cursor;
use crate::replicator::traits::{BackfillSource, Page, PageRequest};
use crate::Result;

/// Lazily walks a source's pages starting from a persisted cursor.
///
/// Finite: stops after an empty page or a page without a continuation cursor.
/// Holds no state beyond the cursor, so a run that stops early resumes by
/// building a new walker from the last persisted position.
pub struct PageWalker<'a> {
    source: &'a dyn BackfillSource,
    cursor: Option<Cursor>,
    incremental: bool,
    exhausted: bool,
}

impl<'a> PageWalker<'a> {
    pub fn new(source: &'a dyn BackfillSource, cursor: Option<Cursor>, incremental: bool) -> Self {
        Self {
            source,
            cursor,
            incremental,
            exhausted: false,
        }
    }

    /// Fetch the next non-empty page. A fetch error leaves the position unchanged.
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.exhausted {
            return Ok(None);
        }
        let request = PageRequest {
            cursor: self.cursor.clone(),
            incremental: self.incremental,
        };
        let page = self.source.fetch_page(&request).await?;
        if page.items.is_empty() {
            self.exhausted = true;
            self.cursor = None;
            return Ok(None);
        }

        self.cursor = page.continuation().cloned();
        self.exhausted = self.cursor.is_none();
        Ok(Some(page))
    }

    /// Position after the last returned page; `None` once exhausted.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
