//! # Page Pool Client
//!
//! Fixed-size memory pages and the budget that governs how many of them a
//! single join may hold.
//!
//! ## Design Overview
//!
//! Memory is granted by an external allocator implementing [`PagePool`]. The
//! pool is shared (it may serve many joins) and is accessed through a plain
//! acquire/release contract. Each join talks to it only through a
//! [`MemoryBudget`], which:
//!
//! - refuses to hold more than `budget` pages at once
//!   ([`MemoryError::BudgetExhausted`]), which is the signal for the caller to
//!   evict (spill) a partition and retry;
//! - forwards pool failures ([`MemoryError::PoolExhausted`]) unchanged;
//! - tracks the number of pages currently held and the peak.
//!
//! [`HeapPagePool`] is a bounded, heap-backed pool. Released pages are kept
//! on a free list and handed out again, so a long-running pool does not
//! churn the allocator.
//!
//! ## Ownership
//!
//! A [`Page`] is an owned boxed slice. Whoever holds the value owns the
//! memory exclusively; returning it to the pool moves it back.


use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::trace;

/// Default page size (32 KiB).
pub const DEFAULT_PAGE_SIZE: usize = 32 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by page acquisition.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The join already holds its full page budget.
    #[error("page budget exhausted ({budget} pages held)")]
    BudgetExhausted {
        /// Configured budget in pages.
        budget: usize,
    },

    /// The shared pool could not grant another page.
    #[error("page pool exhausted (capacity {capacity} pages)")]
    PoolExhausted {
        /// Pool capacity in pages.
        capacity: usize,
    },

    /// A page of the wrong size was handed to a pool or budget.
    #[error("page size mismatch: expected {expected} bytes, got {actual}")]
    PageSizeMismatch {
        /// The size the receiver works with.
        expected: usize,
        /// The size that was supplied.
        actual: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// Page
// ------------------------------------------------------------------------------------------------

/// A fixed-size block of memory, the unit of storage and spill I/O.
pub struct Page {
    buf: Box<[u8]>,
}

impl Page {
    /// Allocates a zeroed page of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Size of the page in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").field("size", &self.size()).finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Page pool contract
// ------------------------------------------------------------------------------------------------

/// An external allocator of fixed-size pages.
///
/// Implementations are shared between joins, hence `&self` methods and the
/// `Send + Sync` bound. A pool must only hand out pages of
/// [`page_size`](PagePool::page_size) bytes.
pub trait PagePool: Send + Sync + fmt::Debug {
    /// Size in bytes of every page this pool grants.
    fn page_size(&self) -> usize;

    /// Grants one page, or fails if the pool has none left.
    fn acquire_page(&self) -> Result<Page, MemoryError>;

    /// Takes a page back. The page must have come from this pool.
    fn release_page(&self, page: Page);
}

struct HeapPoolInner {
    free: Vec<Page>,
    in_use: usize,
    peak: usize,
}

/// A bounded pool of heap-allocated pages.
///
/// At most `capacity` pages are outstanding at any time. Pages are
/// allocated lazily and recycled through a free list.
pub struct HeapPagePool {
    page_size: usize,
    capacity: usize,
    inner: Mutex<HeapPoolInner>,
}

impl HeapPagePool {
    /// Creates a pool of at most `capacity` pages of `page_size` bytes.
    pub fn new(page_size: usize, capacity: usize) -> Self {
        Self {
            page_size,
            capacity,
            inner: Mutex::new(HeapPoolInner {
                free: Vec::new(),
                in_use: 0,
                peak: 0,
            }),
        }
    }

    /// Pages currently handed out.
    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    /// Highest number of pages ever handed out at once.
    pub fn peak_in_use(&self) -> usize {
        self.lock().peak
    }

    /// Maximum number of outstanding pages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Accounting must survive a panic elsewhere, so a poisoned lock is
    // recovered rather than propagated.
    fn lock(&self) -> std::sync::MutexGuard<'_, HeapPoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PagePool for HeapPagePool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn acquire_page(&self) -> Result<Page, MemoryError> {
        let mut inner = self.lock();
        if inner.in_use >= self.capacity {
            return Err(MemoryError::PoolExhausted {
                capacity: self.capacity,
            });
        }
        let page = inner
            .free
            .pop()
            .unwrap_or_else(|| Page::new(self.page_size));
        inner.in_use += 1;
        inner.peak = inner.peak.max(inner.in_use);
        Ok(page)
    }

    fn release_page(&self, page: Page) {
        let mut inner = self.lock();
        inner.in_use = inner.in_use.saturating_sub(1);
        if page.size() == self.page_size {
            inner.free.push(page);
        }
    }
}

impl fmt::Debug for HeapPagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("HeapPagePool")
            .field("page_size", &self.page_size)
            .field("capacity", &self.capacity)
            .field("in_use", &inner.in_use)
            .field("peak", &inner.peak)
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Memory budget
// ------------------------------------------------------------------------------------------------

/// The per-join view of a [`PagePool`]: a hard cap on pages held at once.
///
/// Every page the join touches passes through [`acquire`](Self::acquire)
/// and [`release`](Self::release), so `held()` is exact at every point.
pub struct MemoryBudget {
    pool: Arc<dyn PagePool>,
    budget: usize,
    held: usize,
    peak: usize,
}

impl MemoryBudget {
    pub fn new(pool: Arc<dyn PagePool>, budget: usize) -> Self {
        Self {
            pool,
            budget,
            held: 0,
            peak: 0,
        }
    }

    /// Acquires a page if the budget allows it.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::BudgetExhausted`] when `budget` pages are already held.
    /// - Whatever the pool reports when it cannot grant a page.
    pub fn acquire(&mut self) -> Result<Page, MemoryError> {
        if self.held >= self.budget {
            return Err(MemoryError::BudgetExhausted {
                budget: self.budget,
            });
        }
        let page = self.pool.acquire_page()?;
        if page.size() != self.pool.page_size() {
            let actual = page.size();
            self.pool.release_page(page);
            return Err(MemoryError::PageSizeMismatch {
                expected: self.pool.page_size(),
                actual,
            });
        }
        self.held += 1;
        self.peak = self.peak.max(self.held);
        trace!(held = self.held, budget = self.budget, "page acquired");
        Ok(page)
    }

    /// Returns a page to the pool.
    pub fn release(&mut self, page: Page) {
        self.held = self.held.saturating_sub(1);
        self.pool.release_page(page);
    }

    /// Returns every page yielded by `pages` to the pool.
    pub fn release_all(&mut self, pages: impl IntoIterator<Item = Page>) {
        for page in pages {
            self.release(page);
        }
    }

    /// Pages currently held.
    #[inline]
    pub fn held(&self) -> usize {
        self.held
    }

    /// Highest number of pages held at once.
    #[inline]
    pub fn peak(&self) -> usize {
        self.peak
    }

    #[inline]
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Pages that may still be acquired before the budget is exhausted.
    #[inline]
    pub fn available(&self) -> usize {
        self.budget.saturating_sub(self.held)
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.pool.page_size()
    }
}

impl fmt::Debug for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudget")
            .field("budget", &self.budget)
            .field("held", &self.held)
            .field("peak", &self.peak)
            .finish_non_exhaustive()
    }
}
