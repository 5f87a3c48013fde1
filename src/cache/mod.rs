//! Two-level native resource cache
//!
//! Documents are opened and closed explicitly; pages are loaded on demand,
//! reference counted, and closed after idling for their TTL or when the
//! per-document bound forces eviction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                    PdfCache                      │
//! │          id → DocumentContext (explicit)         │
//! └───────────────┬──────────────────────────────────┘
//!                 │ one per document
//!                 ▼
//! ┌──────────────────────────────────────────────────┐
//! │                    PageCache                     │
//! │   page_index → PageContext (LRU, bounded)        │
//! └───────────────┬──────────────────────────────────┘
//!                 │ ref_count / TTL timer
//!                 ▼
//! ┌──────────────────────────────────────────────────┐
//! │                   PageContext                    │
//! │   page handle + lazy text page + lazy form env   │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Locks are taken cache first, page second. A page never holds its own
//! lock while running the hook that removes it from its cache.

pub mod document;
pub mod page;
pub mod page_cache;

pub use document::{CacheStats, DocumentContext, PdfCache};
pub use page::PageContext;
pub use page_cache::{CacheConfig, PageCache, PageCacheStats, ScopeExit};
