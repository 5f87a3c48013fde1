//! Native PDFium boundary
//!
//! Everything above this module talks to the engine through [`PdfiumModule`],
//! a handle-level interface over the engine's sandboxed linear memory. Every
//! native object (document, page, text page, form environment, annotation,
//! heap block) is a [`NativePtr`]; `0` is null and signals failure.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────────┐
//! │   MemoryManager      │─────▶│      PdfiumModule        │
//! │ (tracked malloc/free)│      │ (native calls, handles)  │
//! └──────────────────────┘      └──────────────────────────┘
//!                                          ▲
//!                               ┌──────────┴───────────┐
//!                               │   SimulatedPdfium    │
//!                               │ (in-process backend) │
//!                               └──────────────────────┘
//! ```

pub mod memory;
pub mod simulated;

use serde::{Deserialize, Serialize};

pub use memory::{Allocation, MemoryManager, MemoryStats, MAX_TOTAL_MEMORY};
pub use simulated::{
    SimulatedPdfium, SimAnnotation, SimAttachment, SimBookmark, SimDocument, SimPage,
};

/// Annotation subtype code for form widgets (`FPDF_ANNOT_WIDGET`)
pub const FPDF_ANNOT_WIDGET: i32 = 20;

/// Render flag that draws annotations (`FPDF_ANNOT`)
pub const FPDF_RENDER_ANNOT: u32 = 0x01;

/// Pointer-sized handle into the engine's linear memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativePtr(usize);

impl NativePtr {
    pub const NULL: NativePtr = NativePtr(0);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for NativePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Engine last-error codes (`FPDF_ERR_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum NativeErrorCode {
    Success = 0,
    Unknown = 1,
    File = 2,
    Format = 3,
    Password = 4,
    Security = 5,
    Page = 6,
}

impl NativeErrorCode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Success,
            2 => Self::File,
            3 => Self::Format,
            4 => Self::Password,
            5 => Self::Security,
            6 => Self::Page,
            _ => Self::Unknown,
        }
    }
}

/// Annotation rectangle in page coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NativeRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

/// Handle-level interface to the native engine
///
/// Implementations must be callable from any thread; the cache layer
/// serializes access per document, not per call.
pub trait PdfiumModule: Send + Sync {
    // -- linear memory --

    /// Raw heap allocation; returns null on exhaustion
    fn malloc(&self, size: usize) -> NativePtr;
    fn free(&self, ptr: NativePtr);
    /// Copy bytes into a heap block starting at `ptr`
    fn heap_write(&self, ptr: NativePtr, bytes: &[u8]) -> bool;
    /// Copy `len` bytes out of the heap starting at `ptr`
    fn heap_read(&self, ptr: NativePtr, len: usize) -> Option<Vec<u8>>;

    // -- documents --

    fn load_mem_document(&self, file: NativePtr, len: usize, password: Option<&str>) -> NativePtr;
    fn get_last_error(&self) -> NativeErrorCode;
    fn close_document(&self, doc: NativePtr);
    fn get_page_count(&self, doc: NativePtr) -> usize;
    fn get_page_size_by_index(&self, doc: NativePtr, index: usize) -> Option<(f32, f32)>;
    fn save_as_copy(&self, doc: NativePtr) -> Option<Vec<u8>>;

    // -- pages --

    fn load_page(&self, doc: NativePtr, index: usize) -> NativePtr;
    fn close_page(&self, page: NativePtr);
    /// Rasterize into a BGRA buffer of `width * height * 4` bytes at `buffer`
    fn render_page_bitmap(
        &self,
        page: NativePtr,
        buffer: NativePtr,
        width: usize,
        height: usize,
        rotation: u8,
        flags: u32,
    ) -> bool;

    // -- text pages --

    fn text_load_page(&self, page: NativePtr) -> NativePtr;
    fn text_close_page(&self, text_page: NativePtr);
    fn text_get_text(&self, text_page: NativePtr) -> String;

    // -- form-fill environment --

    fn open_form_fill_info(&self) -> NativePtr;
    fn close_form_fill_info(&self, info: NativePtr);
    fn init_form_fill_environment(&self, doc: NativePtr, info: NativePtr) -> NativePtr;
    fn exit_form_fill_environment(&self, form: NativePtr);
    fn form_on_after_load_page(&self, page: NativePtr, form: NativePtr);
    fn form_on_before_close_page(&self, page: NativePtr, form: NativePtr);
    fn form_get_field_value(&self, form: NativePtr, annot: NativePtr) -> Option<String>;

    // -- annotations --

    fn get_annot_count(&self, page: NativePtr) -> usize;
    fn get_annot(&self, page: NativePtr, index: usize) -> NativePtr;
    fn close_annot(&self, annot: NativePtr);
    fn annot_subtype(&self, annot: NativePtr) -> i32;
    fn annot_rect(&self, annot: NativePtr) -> Option<NativeRect>;
    fn annot_contents(&self, annot: NativePtr) -> Option<String>;

    // -- outline --

    /// First child of `parent`; a null parent addresses the outline root
    fn bookmark_first_child(&self, doc: NativePtr, parent: NativePtr) -> NativePtr;
    fn bookmark_next_sibling(&self, doc: NativePtr, bookmark: NativePtr) -> NativePtr;
    fn bookmark_title(&self, bookmark: NativePtr) -> String;
    fn bookmark_page_index(&self, doc: NativePtr, bookmark: NativePtr) -> Option<usize>;

    // -- attachments --

    fn attachment_count(&self, doc: NativePtr) -> usize;
    fn attachment_name(&self, doc: NativePtr, index: usize) -> Option<String>;
    fn attachment_size(&self, doc: NativePtr, index: usize) -> Option<usize>;
}
