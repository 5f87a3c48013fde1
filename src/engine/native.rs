//! In-process engine over a [`PdfiumModule`]
//!
//! Every method resolves its document through [`PdfCache`] and its page
//! through the document's page cache before any native call, and routes
//! every heap block it creates through [`MemoryManager`]. Work runs on the
//! blocking pool when a tokio runtime is present and inline otherwise.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::types::*;
use super::{PdfEngine, PdfTask};
use crate::cache::{CacheStats, PdfCache, ScopeExit};
use crate::config::Config;
use crate::error::{EngineError, PdfErrorCode, PdfErrorReason, Result};
use crate::pdfium::{
    MemoryManager, MemoryStats, NativePtr, PdfiumModule, FPDF_ANNOT_WIDGET, FPDF_RENDER_ANNOT,
};

/// Characters of page text kept on each side of a search hit
const SEARCH_CONTEXT_CHARS: usize = 30;

/// Outline depth past which nesting is ignored
const MAX_BOOKMARK_DEPTH: usize = 64;

#[derive(Clone)]
pub struct PdfiumEngine {
    module: Arc<dyn PdfiumModule>,
    memory: Arc<MemoryManager>,
    cache: PdfCache,
    initialized: Arc<AtomicBool>,
}

impl PdfiumEngine {
    pub fn new(module: Arc<dyn PdfiumModule>, config: &Config) -> Self {
        let memory = Arc::new(MemoryManager::with_limit(
            module.clone(),
            config.memory.max_total_memory,
            config.memory.verbose_diagnostics,
        ));
        let cache = PdfCache::new(module.clone(), memory.clone(), config.cache);
        Self {
            module,
            memory,
            cache,
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn cache(&self) -> &PdfCache {
        &self.cache
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Start `job` and hand back its task. A job whose task was aborted
    /// before it started does not run.
    fn run<T, P, F>(&self, method: &'static str, job: F) -> PdfTask<T, P>
    where
        T: Clone + Send + Sync + 'static,
        P: Send + Sync + 'static,
        F: FnOnce(&PdfiumEngine, &PdfTask<T, P>) -> Result<T> + Send + 'static,
    {
        let task = PdfTask::<T, P>::new();
        let engine = self.clone();
        let handle = task.clone();

        let work = move || {
            if !handle.is_pending() {
                debug!(method, "Skipping aborted call");
                return;
            }
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                job(&engine, &handle)
            }));
            match outcome {
                Ok(Ok(value)) => {
                    handle.resolve(value);
                }
                Ok(Err(err)) => {
                    debug!(method, error = %err, "Call failed");
                    handle.reject(err.into());
                }
                Err(_) => {
                    handle.reject(PdfErrorReason::new(
                        PdfErrorCode::Unknown,
                        format!("{method} panicked"),
                    ));
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(work);
            }
            Err(_) => work(),
        }
        task
    }

    fn page_size(&self, doc: NativePtr, page_index: usize) -> Result<(f32, f32)> {
        self.module
            .get_page_size_by_index(doc, page_index)
            .ok_or_else(|| EngineError::NotFound(format!("page {page_index}")))
    }

    fn native_error(&self, call: &'static str) -> EngineError {
        EngineError::Native {
            call,
            code: self.module.get_last_error(),
        }
    }

    fn open(&self, file: PdfFile, password: Option<String>) -> Result<PdfDocumentObject> {
        if self.cache.contains(&file.id) {
            return Err(EngineError::AlreadyOpen(file.id));
        }

        let file_ptr = self.memory.alloc_bytes(&file.content)?;
        let doc_ptr =
            self.module
                .load_mem_document(file_ptr, file.content.len(), password.as_deref());
        if doc_ptr.is_null() {
            let err = self.native_error("FPDF_LoadMemDocument");
            self.memory.free(file_ptr);
            return Err(err);
        }

        let page_count = self.module.get_page_count(doc_ptr);
        let pages = (0..page_count)
            .map(|index| {
                let (width, height) = self
                    .module
                    .get_page_size_by_index(doc_ptr, index)
                    .unwrap_or((0.0, 0.0));
                PdfPageObject {
                    index,
                    size: PageSize { width, height },
                }
            })
            .collect();

        if let Err(err) = self.cache.set_document(file.id.clone(), file_ptr, doc_ptr) {
            self.module.close_document(doc_ptr);
            self.memory.free(file_ptr);
            return Err(err);
        }

        info!(doc_id = %file.id, page_count, "Document opened");
        Ok(PdfDocumentObject {
            id: file.id,
            page_count,
            pages,
        })
    }

    fn render(&self, doc_id: &str, page_index: usize, options: RenderOptions) -> Result<RenderedPage> {
        let context = self.cache.require(doc_id)?;
        let (page_width, page_height) = self.page_size(context.doc_ptr(), page_index)?;

        let scale = options.scale_factor;
        if !(scale.is_finite() && scale > 0.0) {
            return Err(EngineError::InvalidArgs {
                method: "renderPage".into(),
                message: format!("scaleFactor must be positive, got {scale}"),
            });
        }
        let mut width = ((page_width * scale).round() as usize).max(1);
        let mut height = ((page_height * scale).round() as usize).max(1);
        if options.rotation.swaps_axes() {
            std::mem::swap(&mut width, &mut height);
        }
        let len = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(4))
            .ok_or(EngineError::OutOfMemory {
                requested: usize::MAX,
                limit: self.memory.limit(),
            })?;

        let flags = if options.with_annotations {
            FPDF_RENDER_ANNOT
        } else {
            0
        };

        context
            .page_cache()
            .with_page(page_index, ScopeExit::Release, |page| -> Result<RenderedPage> {
                let page_ptr = page.page_ptr()?;
                let buffer = self.memory.malloc(len)?;
                let rendered = self.module.render_page_bitmap(
                    page_ptr,
                    buffer,
                    width,
                    height,
                    options.rotation.quarter_turns(),
                    flags,
                );
                let data = if rendered {
                    self.memory.read(buffer, len)
                } else {
                    Err(self.native_error("FPDF_RenderPageBitmap"))
                };
                self.memory.free(buffer);

                Ok(RenderedPage {
                    width,
                    height,
                    data: data?,
                })
            })?
    }

    fn page_text(&self, doc_id: &str, page_index: usize) -> Result<String> {
        let context = self.cache.require(doc_id)?;
        context
            .page_cache()
            .with_page(page_index, ScopeExit::Release, |page| -> Result<String> {
                let text_page = page.text_page()?;
                Ok(self.module.text_get_text(text_page))
            })?
    }

    fn annotations(&self, doc_id: &str, page_index: usize) -> Result<Vec<PdfAnnotationObject>> {
        let context = self.cache.require(doc_id)?;
        context
            .page_cache()
            .with_page(page_index, ScopeExit::Release, |page| -> Result<Vec<_>> {
                let count = self.module.get_annot_count(page.page_ptr()?);
                (0..count)
                    .map(|index| {
                        page.with_annotation(index, |annot| -> Result<PdfAnnotationObject> {
                            let subtype = self.module.annot_subtype(annot);
                            let field_value = if subtype == FPDF_ANNOT_WIDGET {
                                let form = page.form_handle()?;
                                self.module.form_get_field_value(form, annot)
                            } else {
                                None
                            };
                            Ok(PdfAnnotationObject {
                                index,
                                subtype,
                                rect: self.module.annot_rect(annot),
                                contents: self.module.annot_contents(annot),
                                field_value,
                            })
                        })?
                    })
                    .collect()
            })?
    }

    fn bookmarks(&self, doc_id: &str) -> Result<PdfBookmarksObject> {
        let context = self.cache.require(doc_id)?;
        let mut seen = HashSet::new();
        Ok(PdfBookmarksObject {
            bookmarks: self.read_bookmarks(context.doc_ptr(), NativePtr::NULL, 0, &mut seen),
        })
    }

    fn read_bookmarks(
        &self,
        doc: NativePtr,
        parent: NativePtr,
        depth: usize,
        seen: &mut HashSet<NativePtr>,
    ) -> Vec<PdfBookmarkObject> {
        let mut bookmarks = Vec::new();
        if depth >= MAX_BOOKMARK_DEPTH {
            return bookmarks;
        }

        let mut current = self.module.bookmark_first_child(doc, parent);
        // Malformed outlines can loop back on themselves
        while !current.is_null() && seen.insert(current) {
            bookmarks.push(PdfBookmarkObject {
                title: self.module.bookmark_title(current),
                page_index: self.module.bookmark_page_index(doc, current),
                children: self.read_bookmarks(doc, current, depth + 1, seen),
            });
            current = self.module.bookmark_next_sibling(doc, current);
        }
        bookmarks
    }

    fn attachments(&self, doc_id: &str) -> Result<Vec<PdfAttachmentObject>> {
        let context = self.cache.require(doc_id)?;
        let doc = context.doc_ptr();
        let attachments = (0..self.module.attachment_count(doc))
            .filter_map(|index| {
                Some(PdfAttachmentObject {
                    index,
                    name: self.module.attachment_name(doc, index)?,
                    size: self.module.attachment_size(doc, index).unwrap_or(0),
                })
            })
            .collect();
        Ok(attachments)
    }

    fn save(&self, doc_id: &str) -> Result<PdfBinary> {
        let context = self.cache.require(doc_id)?;
        self.module
            .save_as_copy(context.doc_ptr())
            .map(PdfBinary)
            .ok_or_else(|| self.native_error("FPDF_SaveAsCopy"))
    }

    fn search(
        &self,
        task: &PdfTask<SearchAllPagesResult, SearchProgress>,
        doc_id: &str,
        keyword: &str,
        options: SearchOptions,
    ) -> Result<SearchAllPagesResult> {
        let context = self.cache.require(doc_id)?;
        // Matched as given, surrounding whitespace included
        if keyword.is_empty() {
            return Ok(SearchAllPagesResult::default());
        }

        let page_count = self.module.get_page_count(context.doc_ptr());
        let mut results = Vec::new();
        for page_index in 0..page_count {
            // Abort lands at the next page boundary
            if !task.is_pending() {
                debug!(doc_id, page_index, "Search aborted");
                return Err(EngineError::Cancelled(format!("search in {doc_id}")));
            }

            let matches = context.page_cache().borrow_page(page_index, |page| {
                let text = self.module.text_get_text(page.text_page()?);
                Ok::<_, EngineError>(find_matches(&text, keyword, page_index, options))
            })??;

            task.progress(SearchProgress {
                page_index,
                matches: matches.clone(),
            });
            results.extend(matches);
        }

        Ok(SearchAllPagesResult {
            total: results.len(),
            results,
        })
    }
}

fn chars_equal(a: char, b: char, match_case: bool) -> bool {
    if match_case {
        a == b
    } else {
        a == b || a.to_lowercase().eq(b.to_lowercase())
    }
}

/// Non-overlapping hits of `keyword` in `text`, by character offset
fn find_matches(
    text: &str,
    keyword: &str,
    page_index: usize,
    options: SearchOptions,
) -> Vec<SearchResult> {
    let haystack: Vec<char> = text.chars().collect();
    let needle: Vec<char> = keyword.chars().collect();
    let mut results = Vec::new();
    if needle.is_empty() || needle.len() > haystack.len() {
        return results;
    }

    let mut start = 0;
    while start + needle.len() <= haystack.len() {
        let hit = haystack[start..start + needle.len()]
            .iter()
            .zip(&needle)
            .all(|(a, b)| chars_equal(*a, *b, options.match_case));
        if !hit {
            start += 1;
            continue;
        }

        let end = start + needle.len();
        let before_start = start.saturating_sub(SEARCH_CONTEXT_CHARS);
        let after_end = (end + SEARCH_CONTEXT_CHARS).min(haystack.len());
        results.push(SearchResult {
            page_index,
            char_index: start,
            char_count: needle.len(),
            context: TextContext {
                before: haystack[before_start..start].iter().collect(),
                matched: haystack[start..end].iter().collect(),
                after: haystack[end..after_end].iter().collect(),
            },
        });
        start = end;
    }
    results
}

impl PdfEngine for PdfiumEngine {
    fn initialize(&self) -> PdfTask<bool> {
        self.run("initialize", |engine, _| {
            engine.initialized.store(true, Ordering::SeqCst);
            info!("Engine initialized");
            Ok(true)
        })
    }

    fn open_document(&self, file: PdfFile, password: Option<String>) -> PdfTask<PdfDocumentObject> {
        self.run("openDocument", move |engine, _| engine.open(file, password))
    }

    fn close_document(&self, doc_id: &str) -> PdfTask<bool> {
        let doc_id = doc_id.to_string();
        self.run("closeDocument", move |engine, _| {
            Ok(engine.cache.close_document(&doc_id))
        })
    }

    fn close_all_documents(&self) -> PdfTask<bool> {
        self.run("closeAllDocuments", |engine, _| {
            engine.cache.close_all_documents();
            Ok(true)
        })
    }

    fn render_page(
        &self,
        doc_id: &str,
        page_index: usize,
        options: RenderOptions,
    ) -> PdfTask<RenderedPage> {
        let doc_id = doc_id.to_string();
        self.run("renderPage", move |engine, _| {
            engine.render(&doc_id, page_index, options)
        })
    }

    fn get_page_text(&self, doc_id: &str, page_index: usize) -> PdfTask<String> {
        let doc_id = doc_id.to_string();
        self.run("getPageText", move |engine, _| {
            engine.page_text(&doc_id, page_index)
        })
    }

    fn get_page_annotations(
        &self,
        doc_id: &str,
        page_index: usize,
    ) -> PdfTask<Vec<PdfAnnotationObject>> {
        let doc_id = doc_id.to_string();
        self.run("getPageAnnotations", move |engine, _| {
            engine.annotations(&doc_id, page_index)
        })
    }

    fn get_bookmarks(&self, doc_id: &str) -> PdfTask<PdfBookmarksObject> {
        let doc_id = doc_id.to_string();
        self.run("getBookmarks", move |engine, _| engine.bookmarks(&doc_id))
    }

    fn get_attachments(&self, doc_id: &str) -> PdfTask<Vec<PdfAttachmentObject>> {
        let doc_id = doc_id.to_string();
        self.run("getAttachments", move |engine, _| engine.attachments(&doc_id))
    }

    fn save_as_copy(&self, doc_id: &str) -> PdfTask<PdfBinary> {
        let doc_id = doc_id.to_string();
        self.run("saveAsCopy", move |engine, _| engine.save(&doc_id))
    }

    fn search_all_pages(
        &self,
        doc_id: &str,
        keyword: &str,
        options: SearchOptions,
    ) -> PdfTask<SearchAllPagesResult, SearchProgress> {
        let doc_id = doc_id.to_string();
        let keyword = keyword.to_string();
        self.run("searchAllPages", move |engine, task| {
            engine.search(task, &doc_id, &keyword, options)
        })
    }

    fn get_cache_stats(&self) -> PdfTask<CacheStats> {
        self.run("getCacheStats", |engine, _| Ok(engine.cache.get_cache_stats()))
    }

    fn get_memory_stats(&self) -> PdfTask<MemoryStats> {
        self.run("getMemoryStats", |engine, _| Ok(engine.memory.stats()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::PdfErrorCode;
    use crate::pdfium::{NativeRect, SimAnnotation, SimAttachment, SimBookmark, SimDocument, SimulatedPdfium};
    use crate::task::TaskOutcome;

    fn engine() -> (Arc<SimulatedPdfium>, PdfiumEngine) {
        let sim = Arc::new(SimulatedPdfium::new());
        let engine = PdfiumEngine::new(sim.clone(), &Config::default());
        (sim, engine)
    }

    fn file(id: &str, document: &SimDocument) -> PdfFile {
        PdfFile {
            id: id.into(),
            content: document.to_bytes(),
        }
    }

    fn value<T: Clone + Send + Sync + 'static, P: 'static>(task: PdfTask<T, P>) -> T {
        match task.outcome() {
            Some(TaskOutcome::Result(value)) => value,
            other => panic!("expected a result, got {:?}", other.map(|o| o.stage())),
        }
    }

    fn reason<T: Clone + Send + Sync + 'static, P: 'static>(task: PdfTask<T, P>) -> PdfErrorReason {
        match task.outcome() {
            Some(TaskOutcome::Error(error)) => error.reason,
            other => panic!("expected an error, got {:?}", other.map(|o| o.stage())),
        }
    }

    fn rich_document() -> SimDocument {
        let mut document = SimDocument::with_pages(3);
        document.pages[1].text = "The quick brown fox. THE END".into();
        document.pages[2].text = "the fox den".into();
        document.pages[0].annotations = vec![
            SimAnnotation {
                subtype: 1,
                rect: NativeRect {
                    left: 0.0,
                    top: 10.0,
                    right: 10.0,
                    bottom: 0.0,
                },
                contents: Some("note".into()),
                field_value: None,
            },
            SimAnnotation {
                subtype: FPDF_ANNOT_WIDGET,
                rect: NativeRect {
                    left: 20.0,
                    top: 40.0,
                    right: 80.0,
                    bottom: 30.0,
                },
                contents: None,
                field_value: Some("Ada".into()),
            },
        ];
        document.bookmarks = vec![SimBookmark {
            title: "Chapter 1".into(),
            page_index: Some(0),
            children: vec![SimBookmark {
                title: "Section 1.1".into(),
                page_index: Some(1),
                children: Vec::new(),
            }],
        }];
        document.attachments = vec![SimAttachment {
            name: "data.csv".into(),
            content: "a,b\n1,2\n".into(),
        }];
        document
    }

    // Without a runtime every call completes inline

    #[test]
    fn test_open_and_close_frees_everything() {
        let (sim, engine) = engine();
        let doc = value(engine.open_document(file("a", &SimDocument::with_pages(4)), None));
        assert_eq!(doc.page_count, 4);
        assert_eq!(doc.pages[3].size, PageSize { width: 612.0, height: 792.0 });
        assert_eq!(engine.memory().stats().allocation_count, 1);

        value(engine.get_page_text("a", 0));
        value(engine.get_page_text("a", 1));
        assert!(value(engine.close_document("a")));
        assert!(!value(engine.close_document("a")));

        assert_eq!(sim.live_handles(), 0);
        assert_eq!(engine.memory().check_leaks(), 0);
    }

    #[test]
    fn test_open_failures_release_file_buffer() {
        let (sim, engine) = engine();

        let garbage = PdfFile {
            id: "bad".into(),
            content: b"%PDF-garbage".to_vec(),
        };
        assert_eq!(reason(engine.open_document(garbage, None)).code, PdfErrorCode::Format);

        let locked = SimDocument {
            password: Some("pw".into()),
            ..SimDocument::with_pages(1)
        };
        assert_eq!(
            reason(engine.open_document(file("locked", &locked), None)).code,
            PdfErrorCode::Password
        );
        value(engine.open_document(file("locked", &locked), Some("pw".into())));

        assert_eq!(
            reason(engine.open_document(file("locked", &locked), Some("pw".into()))).code,
            PdfErrorCode::AlreadyOpen
        );
        assert_eq!(engine.memory().stats().allocation_count, 1);
        assert_eq!(sim.live_documents(), 1);
    }

    #[test]
    fn test_unknown_document_and_page() {
        let (_sim, engine) = engine();
        assert_eq!(reason(engine.get_page_text("nope", 0)).code, PdfErrorCode::NotFound);

        value(engine.open_document(file("a", &SimDocument::with_pages(1)), None));
        assert_eq!(reason(engine.get_page_text("a", 5)).code, PdfErrorCode::NotFound);
    }

    #[test]
    fn test_render_frees_bitmap_and_caches_page() {
        let (sim, engine) = engine();
        value(engine.open_document(file("a", &SimDocument::with_pages(2)), None));

        let page = value(engine.render_page(
            "a",
            1,
            RenderOptions {
                scale_factor: 0.5,
                rotation: Rotation::Degree90,
                with_annotations: true,
            },
        ));
        assert_eq!((page.width, page.height), (396, 306));
        assert_eq!(page.data.len(), 396 * 306 * 4);
        assert_eq!(page.data[1], 1);
        assert_eq!(page.data[3], 0xff);

        // Only the file buffer is still allocated; the page stays cached
        assert_eq!(engine.memory().stats().allocation_count, 1);
        let stats = value(engine.get_cache_stats());
        assert_eq!(stats.per_document["a"].page_indices, vec![1]);
        assert_eq!(stats.per_document["a"].referenced_pages, 0);
        assert_eq!(sim.calls("load_page"), 1);

        let bad = RenderOptions {
            scale_factor: 0.0,
            ..RenderOptions::default()
        };
        assert_eq!(reason(engine.render_page("a", 0, bad)).code, PdfErrorCode::InvalidArgs);
    }

    #[test]
    fn test_render_respects_memory_ceiling() {
        let sim = Arc::new(SimulatedPdfium::new());
        let mut config = Config::default();
        config.memory.max_total_memory = 64 * 1024;
        let engine = PdfiumEngine::new(sim, &config);

        value(engine.open_document(file("a", &SimDocument::with_pages(1)), None));
        assert_eq!(
            reason(engine.render_page("a", 0, RenderOptions::default())).code,
            PdfErrorCode::OutOfMemory
        );
        // The failed render did not leak its reference
        let stats = value(engine.get_cache_stats());
        assert_eq!(stats.per_document["a"].referenced_pages, 0);
    }

    #[test]
    fn test_annotations_read_widget_values() {
        let (sim, engine) = engine();
        value(engine.open_document(file("a", &rich_document()), None));

        let annotations = value(engine.get_page_annotations("a", 0));
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].contents.as_deref(), Some("note"));
        assert_eq!(annotations[0].field_value, None);
        assert_eq!(annotations[1].field_value.as_deref(), Some("Ada"));

        assert_eq!(sim.calls("get_annot"), sim.calls("close_annot"));
        assert_eq!(sim.calls("init_form_fill_environment"), 1);

        value(engine.close_all_documents());
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn test_bookmarks_attachments_and_save() {
        let (_sim, engine) = engine();
        let document = rich_document();
        value(engine.open_document(file("a", &document), None));

        let outline = value(engine.get_bookmarks("a"));
        assert_eq!(outline.bookmarks.len(), 1);
        assert_eq!(outline.bookmarks[0].children[0].title, "Section 1.1");
        assert_eq!(outline.bookmarks[0].children[0].page_index, Some(1));

        let attachments = value(engine.get_attachments("a"));
        assert_eq!(
            attachments,
            vec![PdfAttachmentObject {
                index: 0,
                name: "data.csv".into(),
                size: 8
            }]
        );

        let saved = value(engine.save_as_copy("a"));
        let reparsed: SimDocument = serde_json::from_slice(&saved.0).unwrap();
        assert_eq!(reparsed, document);
    }

    #[test]
    fn test_search_reports_each_page_and_leaves_cache_clean() {
        let (sim, engine) = engine();
        value(engine.open_document(file("a", &rich_document()), None));
        value(engine.get_page_text("a", 2));

        let task = engine.search_all_pages("a", "the", SearchOptions::default());
        let result = value(task);
        assert_eq!(result.total, 3);
        assert_eq!(result.results[0].page_index, 1);
        assert_eq!(result.results[0].char_index, 0);
        assert_eq!(result.results[1].context.matched, "THE");
        assert_eq!(result.results[2].page_index, 2);
        assert_eq!(result.results[2].context.after, " fox den");

        // Page 2 was resident before the search and stays; pages 0 and 1 were borrowed
        let stats = value(engine.get_cache_stats());
        assert_eq!(stats.per_document["a"].page_indices, vec![2]);
        assert_eq!(sim.live_pages(), 1);

        let strict = value(engine.search_all_pages("a", "THE", SearchOptions { match_case: true }));
        assert_eq!(strict.total, 1);
    }

    #[test]
    fn test_search_keeps_keyword_whitespace() {
        let (_sim, engine) = engine();
        value(engine.open_document(file("a", &rich_document()), None));

        // "fox." on page 1 has no trailing space; "fox den" on page 2 does
        let spaced = value(engine.search_all_pages("a", "fox ", SearchOptions::default()));
        assert_eq!(spaced.total, 1);
        assert_eq!(spaced.results[0].page_index, 2);
        assert_eq!(spaced.results[0].context.matched, "fox ");

        let empty = value(engine.search_all_pages("a", "", SearchOptions::default()));
        assert_eq!(empty.total, 0);
    }

    #[tokio::test]
    async fn test_search_emits_progress_then_result() {
        let (_sim, engine) = engine();
        // Inside a runtime calls settle on the blocking pool
        engine
            .open_document(file("a", &rich_document()), None)
            .settled()
            .await
            .into_result()
            .unwrap();

        let task = engine.search_all_pages("a", "fox", SearchOptions::default());
        let pages = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = pages.clone();
        task.on_progress(move |event: &SearchProgress| sink.lock().push(event.page_index));

        let outcome = task.settled().await;
        let result = outcome.into_result().unwrap();
        assert_eq!(result.total, 2);

        // Pages scanned before the observer attached are replayed to it
        assert_eq!(*pages.lock(), vec![0, 1, 2]);
    }
}
