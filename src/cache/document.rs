//! Document-level resource bookkeeping
//!
//! Documents live from `set_document` until `close_document`; there is no
//! automatic expiry at this level. Closing tears down in a fixed order:
//! cached pages, then the document handle, then the file buffer it was
//! loaded from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::page_cache::{CacheConfig, PageCache, PageCacheStats};
use crate::error::{EngineError, Result};
use crate::pdfium::{MemoryManager, NativePtr, PdfiumModule};

/// One open document and its pages
pub struct DocumentContext {
    id: String,
    file_ptr: NativePtr,
    doc_ptr: NativePtr,
    page_cache: PageCache,
    module: Arc<dyn PdfiumModule>,
    memory: Arc<MemoryManager>,
    disposed: AtomicBool,
}

impl DocumentContext {
    fn new(
        id: String,
        file_ptr: NativePtr,
        doc_ptr: NativePtr,
        module: Arc<dyn PdfiumModule>,
        memory: Arc<MemoryManager>,
        config: CacheConfig,
    ) -> Self {
        Self {
            page_cache: PageCache::new(module.clone(), doc_ptr, config),
            id,
            file_ptr,
            doc_ptr,
            module,
            memory,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn doc_ptr(&self) -> NativePtr {
        self.doc_ptr
    }

    pub fn file_ptr(&self) -> NativePtr {
        self.file_ptr
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    /// Pages, then document, then file buffer. Runs once.
    fn dispose(&self) -> usize {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let pages = self.page_cache.force_release_all();
        self.module.close_document(self.doc_ptr);
        self.memory.free(self.file_ptr);
        pages
    }
}

impl std::fmt::Debug for DocumentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentContext")
            .field("id", &self.id)
            .field("doc_ptr", &self.doc_ptr)
            .field("cached_pages", &self.page_cache.len())
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Cache-wide statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub documents: usize,
    pub cached_pages: usize,
    pub per_document: HashMap<String, PageCacheStats>,
}

/// Thread-safe registry of open documents
#[derive(Clone)]
pub struct PdfCache {
    module: Arc<dyn PdfiumModule>,
    memory: Arc<MemoryManager>,
    documents: Arc<RwLock<HashMap<String, Arc<DocumentContext>>>>,
    config: Arc<RwLock<CacheConfig>>,
}

impl PdfCache {
    pub fn new(module: Arc<dyn PdfiumModule>, memory: Arc<MemoryManager>, config: CacheConfig) -> Self {
        Self {
            module,
            memory,
            documents: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Register a loaded document; the cache takes ownership of both handles
    pub fn set_document(
        &self,
        id: impl Into<String>,
        file_ptr: NativePtr,
        doc_ptr: NativePtr,
    ) -> Result<Arc<DocumentContext>> {
        let id = id.into();
        let mut documents = self.documents.write();
        if documents.contains_key(&id) {
            return Err(EngineError::AlreadyOpen(id));
        }

        let context = Arc::new(DocumentContext::new(
            id.clone(),
            file_ptr,
            doc_ptr,
            self.module.clone(),
            self.memory.clone(),
            *self.config.read(),
        ));
        documents.insert(id.clone(), context.clone());

        info!(doc_id = %id, doc = %doc_ptr, "Document registered");
        Ok(context)
    }

    pub fn get_context(&self, id: &str) -> Option<Arc<DocumentContext>> {
        self.documents.read().get(id).cloned()
    }

    /// Like [`get_context`](Self::get_context) but a miss is an error
    pub fn require(&self, id: &str) -> Result<Arc<DocumentContext>> {
        self.get_context(id)
            .ok_or_else(|| EngineError::NotFound(format!("document {id}")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.read().contains_key(id)
    }

    /// Tear down and forget a document. Returns whether it was open.
    pub fn close_document(&self, id: &str) -> bool {
        let Some(context) = self.documents.write().remove(id) else {
            debug!(doc_id = %id, "close_document on unknown id");
            return false;
        };

        let pages = context.dispose();
        info!(doc_id = %id, pages, "Document closed");
        true
    }

    /// Close every open document; returns how many were closed
    pub fn close_all_documents(&self) -> usize {
        let contexts: Vec<_> = self.documents.write().drain().map(|(_, c)| c).collect();
        let count = contexts.len();
        for context in contexts {
            context.dispose();
        }
        if count > 0 {
            info!(count, "All documents closed");
        }
        count
    }

    /// New limits for current and future documents
    pub fn update_config(&self, config: CacheConfig) {
        *self.config.write() = config;
        for context in self.documents.read().values() {
            context.page_cache.update_config(config);
        }
    }

    pub fn config(&self) -> CacheConfig {
        *self.config.read()
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let documents = self.documents.read();
        let per_document: HashMap<String, PageCacheStats> = documents
            .iter()
            .map(|(id, context)| (id.clone(), context.page_cache.stats()))
            .collect();

        CacheStats {
            documents: documents.len(),
            cached_pages: per_document.values().map(|s| s.cached_pages).sum(),
            per_document,
        }
    }
}
