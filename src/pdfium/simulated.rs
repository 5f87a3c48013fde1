//! In-process PDFium stand-in
//!
//! `SimulatedPdfium` implements [`PdfiumModule`] over a byte heap and JSON
//! documents. It keeps the same handle discipline as the real engine (every
//! open must be paired with a close) and records call counts and live handles,
//! so cache behavior can be asserted without a native build.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{NativeErrorCode, NativePtr, NativeRect, PdfiumModule, FPDF_RENDER_ANNOT};

const HEAP_BASE: usize = 0x1000;
const HANDLE_BASE: usize = 0x4000_0000;

/// Document format understood by the simulator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub pages: Vec<SimPage>,
    #[serde(default)]
    pub bookmarks: Vec<SimBookmark>,
    #[serde(default)]
    pub attachments: Vec<SimAttachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimPage {
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub annotations: Vec<SimAnnotation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimAnnotation {
    pub subtype: i32,
    pub rect: NativeRect,
    #[serde(default)]
    pub contents: Option<String>,
    #[serde(default)]
    pub field_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimBookmark {
    pub title: String,
    #[serde(default)]
    pub page_index: Option<usize>,
    #[serde(default)]
    pub children: Vec<SimBookmark>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimAttachment {
    pub name: String,
    #[serde(default)]
    pub content: String,
}

impl SimDocument {
    /// Letter-sized document whose page `i` reads "Page i"
    pub fn with_pages(count: usize) -> Self {
        Self {
            pages: (0..count)
                .map(|i| SimPage {
                    width: 612.0,
                    height: 792.0,
                    text: format!("Page {i}"),
                    annotations: Vec::new(),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Encoded file bytes, as they would be handed to `openDocument`
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

fn bookmark_at<'a>(roots: &'a [SimBookmark], path: &[usize]) -> Option<&'a SimBookmark> {
    let (first, rest) = path.split_first()?;
    let mut node = roots.get(*first)?;
    for &i in rest {
        node = node.children.get(i)?;
    }
    Some(node)
}

#[derive(Default)]
struct SimState {
    heap: BTreeMap<usize, Vec<u8>>,
    next_addr: usize,
    next_handle: usize,

    documents: HashMap<usize, SimDocument>,
    pages: HashMap<usize, (usize, usize)>,
    text_pages: HashMap<usize, usize>,
    form_infos: HashSet<usize>,
    forms: HashMap<usize, usize>,
    annots: HashMap<usize, (usize, usize)>,
    bookmarks: HashMap<usize, (usize, Vec<usize>)>,

    calls: HashMap<&'static str, usize>,
    log: Vec<&'static str>,
    last_error: Option<NativeErrorCode>,
    fail_allocations: bool,
}

impl SimState {
    fn record(&mut self, call: &'static str) {
        *self.calls.entry(call).or_default() += 1;
        self.log.push(call);
    }

    fn handle(&mut self) -> usize {
        self.next_handle += 1;
        HANDLE_BASE + self.next_handle
    }

    /// Block containing `[addr, addr + len)`
    fn block_mut(&mut self, addr: usize, len: usize) -> Option<&mut [u8]> {
        let (&start, block) = self.heap.range_mut(..=addr).next_back()?;
        let offset = addr - start;
        block.get_mut(offset..offset.checked_add(len)?)
    }

    fn page(&self, page: NativePtr) -> Option<&SimPage> {
        let (doc, index) = self.pages.get(&page.raw())?;
        self.documents.get(doc)?.pages.get(*index)
    }

    fn annotation(&self, annot: NativePtr) -> Option<&SimAnnotation> {
        let (page, index) = self.annots.get(&annot.raw())?;
        self.page(NativePtr::new(*page))?.annotations.get(*index)
    }

    fn bookmark(&self, bookmark: NativePtr) -> Option<&SimBookmark> {
        let (doc, path) = self.bookmarks.get(&bookmark.raw())?;
        bookmark_at(&self.documents.get(doc)?.bookmarks, path)
    }

    fn bookmark_handle(&mut self, doc: usize, path: Vec<usize>) -> NativePtr {
        let exists = self
            .documents
            .get(&doc)
            .and_then(|d| bookmark_at(&d.bookmarks, &path))
            .is_some();
        if !exists {
            return NativePtr::NULL;
        }
        let handle = self.handle();
        self.bookmarks.insert(handle, (doc, path));
        NativePtr::new(handle)
    }
}

/// In-process implementation of [`PdfiumModule`]
pub struct SimulatedPdfium {
    state: Mutex<SimState>,
}

impl Default for SimulatedPdfium {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPdfium {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_addr: HEAP_BASE,
                ..Default::default()
            }),
        }
    }

    /// Number of times `call` has been made
    pub fn calls(&self, call: &str) -> usize {
        self.state.lock().calls.get(call).copied().unwrap_or(0)
    }

    /// Every recorded call, in order
    pub fn call_log(&self) -> Vec<&'static str> {
        self.state.lock().log.clone()
    }

    /// Open handles that require an explicit close
    pub fn live_handles(&self) -> usize {
        let state = self.state.lock();
        state.documents.len()
            + state.pages.len()
            + state.text_pages.len()
            + state.form_infos.len()
            + state.forms.len()
            + state.annots.len()
    }

    pub fn live_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn live_documents(&self) -> usize {
        self.state.lock().documents.len()
    }

    pub fn heap_blocks(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Make every subsequent `malloc` return null
    pub fn fail_allocations(&self, fail: bool) {
        self.state.lock().fail_allocations = fail;
    }
}

impl PdfiumModule for SimulatedPdfium {
    fn malloc(&self, size: usize) -> NativePtr {
        let mut state = self.state.lock();
        state.record("malloc");
        if state.fail_allocations {
            return NativePtr::NULL;
        }

        let addr = state.next_addr;
        // Keep blocks 16-byte aligned and never adjacent
        state.next_addr = addr + ((size.max(1) + 31) & !15);
        state.heap.insert(addr, vec![0; size]);
        NativePtr::new(addr)
    }

    fn free(&self, ptr: NativePtr) {
        let mut state = self.state.lock();
        state.record("free");
        state.heap.remove(&ptr.raw());
    }

    fn heap_write(&self, ptr: NativePtr, bytes: &[u8]) -> bool {
        let mut state = self.state.lock();
        match state.block_mut(ptr.raw(), bytes.len()) {
            Some(dest) => {
                dest.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn heap_read(&self, ptr: NativePtr, len: usize) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        state.block_mut(ptr.raw(), len).map(|src| src.to_vec())
    }

    fn load_mem_document(&self, file: NativePtr, len: usize, password: Option<&str>) -> NativePtr {
        let mut state = self.state.lock();
        state.record("load_mem_document");

        let Some(bytes) = state.block_mut(file.raw(), len).map(|b| b.to_vec()) else {
            state.last_error = Some(NativeErrorCode::File);
            return NativePtr::NULL;
        };

        let document: SimDocument = match serde_json::from_slice(&bytes) {
            Ok(document) => document,
            Err(_) => {
                state.last_error = Some(NativeErrorCode::Format);
                return NativePtr::NULL;
            }
        };

        if let Some(expected) = &document.password {
            if password != Some(expected.as_str()) {
                state.last_error = Some(NativeErrorCode::Password);
                return NativePtr::NULL;
            }
        }

        let handle = state.handle();
        state.documents.insert(handle, document);
        state.last_error = Some(NativeErrorCode::Success);
        NativePtr::new(handle)
    }

    fn get_last_error(&self) -> NativeErrorCode {
        self.state
            .lock()
            .last_error
            .unwrap_or(NativeErrorCode::Success)
    }

    fn close_document(&self, doc: NativePtr) {
        let mut state = self.state.lock();
        state.record("close_document");
        state.documents.remove(&doc.raw());
        state.bookmarks.retain(|_, (owner, _)| *owner != doc.raw());
    }

    fn get_page_count(&self, doc: NativePtr) -> usize {
        self.state
            .lock()
            .documents
            .get(&doc.raw())
            .map_or(0, |d| d.pages.len())
    }

    fn get_page_size_by_index(&self, doc: NativePtr, index: usize) -> Option<(f32, f32)> {
        let state = self.state.lock();
        let page = state.documents.get(&doc.raw())?.pages.get(index)?;
        Some((page.width, page.height))
    }

    fn save_as_copy(&self, doc: NativePtr) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        state.record("save_as_copy");
        state.documents.get(&doc.raw()).map(SimDocument::to_bytes)
    }

    fn load_page(&self, doc: NativePtr, index: usize) -> NativePtr {
        let mut state = self.state.lock();
        state.record("load_page");

        let in_range = state
            .documents
            .get(&doc.raw())
            .is_some_and(|d| index < d.pages.len());
        if !in_range {
            state.last_error = Some(NativeErrorCode::Page);
            return NativePtr::NULL;
        }

        let handle = state.handle();
        state.pages.insert(handle, (doc.raw(), index));
        NativePtr::new(handle)
    }

    fn close_page(&self, page: NativePtr) {
        let mut state = self.state.lock();
        state.record("close_page");
        state.pages.remove(&page.raw());
    }

    fn render_page_bitmap(
        &self,
        page: NativePtr,
        buffer: NativePtr,
        width: usize,
        height: usize,
        rotation: u8,
        flags: u32,
    ) -> bool {
        let mut state = self.state.lock();
        state.record("render_page_bitmap");

        let Some(&(_, page_index)) = state.pages.get(&page.raw()) else {
            return false;
        };
        let Some(len) = width.checked_mul(height).and_then(|n| n.checked_mul(4)) else {
            return false;
        };
        let Some(dest) = state.block_mut(buffer.raw(), len) else {
            return false;
        };

        let alpha = if flags & FPDF_RENDER_ANNOT != 0 { 0xff } else { 0xfe };
        for (i, pixel) in dest.chunks_exact_mut(4).enumerate() {
            pixel[0] = (i % 251) as u8;
            pixel[1] = page_index as u8;
            pixel[2] = rotation;
            pixel[3] = alpha;
        }
        true
    }

    fn text_load_page(&self, page: NativePtr) -> NativePtr {
        let mut state = self.state.lock();
        state.record("text_load_page");
        if !state.pages.contains_key(&page.raw()) {
            return NativePtr::NULL;
        }
        let handle = state.handle();
        state.text_pages.insert(handle, page.raw());
        NativePtr::new(handle)
    }

    fn text_close_page(&self, text_page: NativePtr) {
        let mut state = self.state.lock();
        state.record("text_close_page");
        state.text_pages.remove(&text_page.raw());
    }

    fn text_get_text(&self, text_page: NativePtr) -> String {
        let state = self.state.lock();
        state
            .text_pages
            .get(&text_page.raw())
            .and_then(|page| state.page(NativePtr::new(*page)))
            .map(|page| page.text.clone())
            .unwrap_or_default()
    }

    fn open_form_fill_info(&self) -> NativePtr {
        let mut state = self.state.lock();
        state.record("open_form_fill_info");
        let handle = state.handle();
        state.form_infos.insert(handle);
        NativePtr::new(handle)
    }

    fn close_form_fill_info(&self, info: NativePtr) {
        let mut state = self.state.lock();
        state.record("close_form_fill_info");
        state.form_infos.remove(&info.raw());
    }

    fn init_form_fill_environment(&self, doc: NativePtr, info: NativePtr) -> NativePtr {
        let mut state = self.state.lock();
        state.record("init_form_fill_environment");
        if !state.documents.contains_key(&doc.raw()) || !state.form_infos.contains(&info.raw()) {
            return NativePtr::NULL;
        }
        let handle = state.handle();
        state.forms.insert(handle, doc.raw());
        NativePtr::new(handle)
    }

    fn exit_form_fill_environment(&self, form: NativePtr) {
        let mut state = self.state.lock();
        state.record("exit_form_fill_environment");
        state.forms.remove(&form.raw());
    }

    fn form_on_after_load_page(&self, _page: NativePtr, _form: NativePtr) {
        self.state.lock().record("form_on_after_load_page");
    }

    fn form_on_before_close_page(&self, _page: NativePtr, _form: NativePtr) {
        self.state.lock().record("form_on_before_close_page");
    }

    fn form_get_field_value(&self, form: NativePtr, annot: NativePtr) -> Option<String> {
        let state = self.state.lock();
        if !state.forms.contains_key(&form.raw()) {
            return None;
        }
        state.annotation(annot)?.field_value.clone()
    }

    fn get_annot_count(&self, page: NativePtr) -> usize {
        self.state
            .lock()
            .page(page)
            .map_or(0, |p| p.annotations.len())
    }

    fn get_annot(&self, page: NativePtr, index: usize) -> NativePtr {
        let mut state = self.state.lock();
        state.record("get_annot");
        let exists = state
            .page(page)
            .is_some_and(|p| index < p.annotations.len());
        if !exists {
            return NativePtr::NULL;
        }
        let handle = state.handle();
        state.annots.insert(handle, (page.raw(), index));
        NativePtr::new(handle)
    }

    fn close_annot(&self, annot: NativePtr) {
        let mut state = self.state.lock();
        state.record("close_annot");
        state.annots.remove(&annot.raw());
    }

    fn annot_subtype(&self, annot: NativePtr) -> i32 {
        self.state
            .lock()
            .annotation(annot)
            .map_or(0, |a| a.subtype)
    }

    fn annot_rect(&self, annot: NativePtr) -> Option<NativeRect> {
        self.state.lock().annotation(annot).map(|a| a.rect)
    }

    fn annot_contents(&self, annot: NativePtr) -> Option<String> {
        self.state.lock().annotation(annot)?.contents.clone()
    }

    fn bookmark_first_child(&self, doc: NativePtr, parent: NativePtr) -> NativePtr {
        let mut state = self.state.lock();
        let mut path = if parent.is_null() {
            Vec::new()
        } else {
            match state.bookmarks.get(&parent.raw()) {
                Some((_, path)) => path.clone(),
                None => return NativePtr::NULL,
            }
        };
        path.push(0);
        state.bookmark_handle(doc.raw(), path)
    }

    fn bookmark_next_sibling(&self, doc: NativePtr, bookmark: NativePtr) -> NativePtr {
        let mut state = self.state.lock();
        let Some((_, mut path)) = state.bookmarks.get(&bookmark.raw()).cloned() else {
            return NativePtr::NULL;
        };
        if let Some(last) = path.last_mut() {
            *last += 1;
        }
        state.bookmark_handle(doc.raw(), path)
    }

    fn bookmark_title(&self, bookmark: NativePtr) -> String {
        self.state
            .lock()
            .bookmark(bookmark)
            .map(|b| b.title.clone())
            .unwrap_or_default()
    }

    fn bookmark_page_index(&self, _doc: NativePtr, bookmark: NativePtr) -> Option<usize> {
        self.state.lock().bookmark(bookmark)?.page_index
    }

    fn attachment_count(&self, doc: NativePtr) -> usize {
        self.state
            .lock()
            .documents
            .get(&doc.raw())
            .map_or(0, |d| d.attachments.len())
    }

    fn attachment_name(&self, doc: NativePtr, index: usize) -> Option<String> {
        let state = self.state.lock();
        let attachment = state.documents.get(&doc.raw())?.attachments.get(index)?;
        Some(attachment.name.clone())
    }

    fn attachment_size(&self, doc: NativePtr, index: usize) -> Option<usize> {
        let state = self.state.lock();
        let attachment = state.documents.get(&doc.raw())?.attachments.get(index)?;
        Some(attachment.content.len())
    }
}
