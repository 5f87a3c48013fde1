//! Per-document page cache
//!
//! Pages are kept in recency order. When the cache grows past
//! `max_pages_per_document`, the least-recently-used page nobody references
//! is disposed; referenced pages are never evicted, so the cache can stay
//! over its bound until references drop.

use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::page::PageContext;
use crate::error::{EngineError, Result};
use crate::pdfium::{NativePtr, PdfiumModule};

/// Page cache tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Idle time before an unreferenced page is closed
    pub page_ttl_ms: u64,
    pub max_pages_per_document: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_ttl_ms: 5000,
            max_pages_per_document: 32,
        }
    }
}

impl CacheConfig {
    pub fn page_ttl(&self) -> Duration {
        Duration::from_millis(self.page_ttl_ms)
    }
}

/// What happens to a page when a scoped access ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeExit {
    /// Drop the reference; the page idles out through its TTL
    Release,
    /// Close the page as soon as the scope ends
    DisposeImmediately,
}

/// Snapshot of one document's page cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCacheStats {
    pub cached_pages: usize,
    pub referenced_pages: usize,
    /// Ascending page indices
    pub page_indices: Vec<usize>,
}

struct PageCacheInner {
    entries: LruCache<usize, Arc<PageContext>>,
    config: CacheConfig,
    next_serial: u64,
}

#[derive(Clone)]
pub struct PageCache {
    module: Arc<dyn PdfiumModule>,
    doc_ptr: NativePtr,
    inner: Arc<Mutex<PageCacheInner>>,
}

impl PageCache {
    pub fn new(module: Arc<dyn PdfiumModule>, doc_ptr: NativePtr, config: CacheConfig) -> Self {
        Self {
            module,
            doc_ptr,
            inner: Arc::new(Mutex::new(PageCacheInner {
                entries: LruCache::unbounded(),
                config,
                next_serial: 0,
            })),
        }
    }

    /// Get a referenced page, loading it on a miss
    pub fn acquire(&self, page_index: usize) -> Result<Arc<PageContext>> {
        let mut inner = self.inner.lock();

        if let Some(page) = inner.entries.get(&page_index).cloned() {
            match page.bump_ref_count() {
                Ok(()) => return Ok(page),
                // Expired between its timer firing and the hook running
                Err(EngineError::UseAfterDispose(_)) => {
                    inner.entries.pop(&page_index);
                }
                Err(e) => return Err(e),
            }
        }

        let page_ptr = self.module.load_page(self.doc_ptr, page_index);
        if page_ptr.is_null() {
            return Err(EngineError::NotFound(format!("page {page_index}")));
        }

        inner.next_serial += 1;
        let serial = inner.next_serial;
        let page = PageContext::new(
            self.module.clone(),
            self.doc_ptr,
            page_index,
            page_ptr,
            inner.config.page_ttl(),
            serial,
            self.removal_hook(page_index, serial),
        );
        debug!(page_index, page = %page_ptr, "Page loaded");

        inner.entries.put(page_index, page.clone());
        Self::evict(&mut inner);
        Ok(page)
    }

    /// Hook a page runs after disposing itself. Holds the cache weakly and
    /// only removes the entry it was created for.
    fn removal_hook(&self, page_index: usize, serial: u64) -> Box<dyn Fn() + Send + Sync> {
        let inner: Weak<Mutex<PageCacheInner>> = Arc::downgrade(&self.inner);
        Box::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut inner = inner.lock();
            let current = inner
                .entries
                .peek(&page_index)
                .is_some_and(|page| page.serial() == serial);
            if current {
                inner.entries.pop(&page_index);
            }
        })
    }

    fn evict(inner: &mut PageCacheInner) {
        let max = inner.config.max_pages_per_document;
        while inner.entries.len() > max {
            // `iter()` runs most- to least-recently used
            let victim = inner
                .entries
                .iter()
                .rev()
                .find(|(_, page)| page.ref_count() == 0)
                .map(|(index, _)| *index);

            let Some(index) = victim else {
                debug!(
                    cached = inner.entries.len(),
                    max, "Every cached page is referenced; eviction deferred"
                );
                break;
            };
            if let Some(page) = inner.entries.pop(&index) {
                page.dispose_detached();
                debug!(page_index = index, "Page evicted");
            }
        }
    }

    /// Run `f` on a page, then release or dispose it per `exit`
    pub fn with_page<R>(
        &self,
        page_index: usize,
        exit: ScopeExit,
        f: impl FnOnce(&PageContext) -> R,
    ) -> Result<R> {
        let page = self.acquire(page_index)?;
        let guard = ScopeGuard { page, exit };
        Ok(f(&guard.page))
    }

    /// One-shot access that leaves the cache as it found it: a page that
    /// was already resident is released normally, one this call loaded is
    /// disposed right away
    pub fn borrow_page<R>(&self, page_index: usize, f: impl FnOnce(&PageContext) -> R) -> Result<R> {
        let resident = self.inner.lock().entries.contains(&page_index);
        let exit = if resident {
            ScopeExit::Release
        } else {
            ScopeExit::DisposeImmediately
        };
        self.with_page(page_index, exit, f)
    }

    /// Close every page regardless of references or TTL
    pub fn force_release_all(&self) -> usize {
        let pages: Vec<Arc<PageContext>> = {
            let mut inner = self.inner.lock();
            std::iter::from_fn(|| inner.entries.pop_lru().map(|(_, page)| page)).collect()
        };

        let count = pages.len();
        for page in pages {
            page.dispose_detached();
        }
        count
    }

    /// Apply new limits. Live pages pick up the TTL; the size bound is
    /// enforced on the next acquire.
    pub fn update_config(&self, config: CacheConfig) {
        let mut inner = self.inner.lock();
        inner.config = config;
        for (_, page) in inner.entries.iter() {
            page.set_ttl(config.page_ttl());
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.lock().config
    }

    /// Cached page without touching recency or references
    pub fn get(&self, page_index: usize) -> Option<Arc<PageContext>> {
        self.inner.lock().entries.peek(&page_index).cloned()
    }

    pub fn contains(&self, page_index: usize) -> bool {
        self.inner.lock().entries.contains(&page_index)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PageCacheStats {
        let inner = self.inner.lock();
        let mut page_indices: Vec<usize> = inner.entries.iter().map(|(i, _)| *i).collect();
        page_indices.sort_unstable();
        PageCacheStats {
            cached_pages: inner.entries.len(),
            referenced_pages: inner
                .entries
                .iter()
                .filter(|(_, page)| page.ref_count() > 0)
                .count(),
            page_indices,
        }
    }
}

struct ScopeGuard {
    page: Arc<PageContext>,
    exit: ScopeExit,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        match self.exit {
            ScopeExit::Release => self.page.release(),
            ScopeExit::DisposeImmediately => self.page.dispose_immediate(),
        }
    }
}
