//! Recycling of pages loaned to forks.
//!
//! Forks obtain every page they write to from a per-thread pool and hand
//! the pages back when they are dropped, so a steady stream of requests
//! stops allocating once the pool has warmed up.

use forkvm_machine::{PageData, PageInit};
use std::cell::RefCell;
use std::sync::Arc;

/// Default number of free pages a pool holds on to (64 MiB).
pub const DEFAULT_MAX_FREE_PAGES: usize = 16 * 1024;

struct LoanedPage {
    data: Arc<PageData>,
    /// Whether the page may hold non-zero bytes.
    dirty: bool,
}

/// A free list of page buffers.
pub struct LoanedPagePool {
    free: Vec<LoanedPage>,
    max_free: usize,
}

impl Default for LoanedPagePool {
    fn default() -> Self {
        LoanedPagePool::new()
    }
}

impl LoanedPagePool {
    pub fn new() -> LoanedPagePool {
        LoanedPagePool::with_max_free(DEFAULT_MAX_FREE_PAGES)
    }

    /// Creates a pool that drops released pages once it holds `max_free`.
    pub fn with_max_free(max_free: usize) -> LoanedPagePool {
        LoanedPagePool {
            free: Vec::new(),
            max_free,
        }
    }

    /// Takes a page from the pool, or allocates one if the pool is empty.
    ///
    /// With [`PageInit::Initialized`] the returned page reads as all zeroes.
    pub fn acquire(&mut self, init: PageInit) -> Arc<PageData> {
        let Some(page) = self.free.pop() else {
            return PageData::zeroed();
        };
        let mut data = page.data;
        if init == PageInit::Initialized && page.dirty {
            match Arc::get_mut(&mut data) {
                Some(data) => data.fill_zero(),
                None => data = PageData::zeroed(),
            }
        }
        data
    }

    /// Returns a page to the pool without touching its contents.
    pub fn release(&mut self, data: Arc<PageData>) {
        if self.free.len() < self.max_free {
            self.free.push(LoanedPage { data, dirty: true });
        }
    }

    /// Pre-allocates zeroed pages until the pool holds `count`.
    pub fn reserve(&mut self, count: usize) {
        let count = count.min(self.max_free);
        while self.free.len() < count {
            self.free.push(LoanedPage {
                data: PageData::zeroed(),
                dirty: false,
            });
        }
    }

    /// Number of free pages.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

thread_local! {
    static POOL: RefCell<LoanedPagePool> = RefCell::new(LoanedPagePool::new());
}

/// Takes a page from this thread's pool.
pub fn loan_page(init: PageInit) -> Arc<PageData> {
    POOL.try_with(|pool| pool.borrow_mut().acquire(init))
        .unwrap_or_else(|_| PageData::zeroed())
}

/// Returns pages to this thread's pool.
pub fn return_pages(pages: impl IntoIterator<Item = Arc<PageData>>) {
    // During thread teardown the pool may already be gone; the pages are
    // then simply freed.
    let _ = POOL.try_with(|pool| {
        let mut pool = pool.borrow_mut();
        for page in pages {
            pool.release(page);
        }
    });
}

/// Number of free pages in this thread's pool.
pub fn free_pages() -> usize {
    POOL.try_with(|pool| pool.borrow().len()).unwrap_or(0)
}

/// Pre-allocates zeroed pages in this thread's pool.
pub fn reserve_pages(count: usize) {
    let _ = POOL.try_with(|pool| pool.borrow_mut().reserve(count));
}
