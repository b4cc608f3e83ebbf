//! Tracking which code page the protected domain is executing from.

use crate::ct;
use crate::error::{ CampaignError, Result };
use crate::pte::PageDescriptor;

/// Result of a single [`PageTrackingWindow::classify_and_advance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowStep {
    /// Index of the current page *after* the window was updated.
    pub page: usize,
    /// The domain crossed into the next page.
    pub advanced: bool,
    /// Accessed bit of the current page (before the update).
    pub current_accessed: bool,
    /// Accessed bit of the next page (before the update).
    pub next_accessed: bool,
}

/// A window over the code pages covered by the measured code.
///
/// Instead of scanning every page-table entry on each interrupt, we only
/// watch two of them: the page the domain is currently executing from and
/// the page that follows it in program order. When the accessed bit of the
/// next page is set, the window slides forward by one page.
///
/// The last descriptor is a sentinel page which is expected never to be
/// executed. Sliding the window onto the sentinel and then trying to slide
/// it again means that the measured code spans more pages than were
/// provisioned, which is fatal.
pub struct PageTrackingWindow<'a, P: PageDescriptor> {
    pages: &'a [P],
    current: usize,
    next: usize,
    cursor: usize,
}
impl <'a, P: PageDescriptor> PageTrackingWindow<'a, P> {
    pub fn new(pages: &'a [P]) -> Result<Self> {
        if pages.len() < 2 {
            return Err(CampaignError::Config(format!(
                "page window needs at least two pages (got {})", pages.len()
            )));
        }
        Ok(Self { pages, current: 0, next: 1, cursor: 2 })
    }

    /// Move the window back to the first two pages.
    pub fn reset(&mut self) {
        self.current = 0;
        self.next = 1;
        self.cursor = 2;
    }

    /// Sample the accessed bits of the tracked pages and slide the window
    /// if the domain crossed into the next page.
    ///
    /// The window update itself is branch-free. The only branch is taken
    /// when the pool is exhausted, which ends the campaign.
    #[inline(always)]
    pub fn classify_and_advance(&mut self) -> Result<WindowStep> {
        let next_accessed = self.pages[self.next].read_accessed();
        let current_accessed = self.pages[self.current].read_accessed();

        let exhausted = next_accessed & (self.cursor >= self.pages.len());
        if exhausted {
            return Err(CampaignError::PoolExhausted { pages: self.pages.len() });
        }

        self.current = ct::select(next_accessed, self.current, self.next);
        self.next    = ct::select(next_accessed, self.next, self.cursor);
        self.cursor  = ct::select(next_accessed, self.cursor, self.cursor + 1);

        Ok(WindowStep {
            page: self.current,
            advanced: next_accessed,
            current_accessed,
            next_accessed,
        })
    }

    /// Clear the accessed bits of both tracked pages.
    #[inline(always)]
    pub fn clear_accessed(&self) {
        self.pages[self.current].clear_accessed();
        self.pages[self.next].clear_accessed();
    }

    /// Clear the accessed bits of every page in the set.
    pub fn clear_all(&self) {
        for page in self.pages.iter() {
            page.clear_accessed();
        }
    }

    pub fn current_page(&self) -> &P { &self.pages[self.current] }
    pub fn first_page(&self) -> &P { &self.pages[0] }
    pub fn current_index(&self) -> usize { self.current }
    pub fn next_index(&self) -> usize { self.next }
    pub fn pool_cursor(&self) -> usize { self.cursor }
    pub fn num_pages(&self) -> usize { self.pages.len() }
}
