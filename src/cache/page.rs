//! Per-page native resource
//!
//! A `PageContext` owns one loaded page handle plus the sub-handles that hang
//! off it (text page, form-fill environment). Its lifecycle:
//!
//! ```text
//! acquired (ref_count > 0) ──release──▶ idle (timer armed) ──ttl──▶ disposed
//!          ▲                                 │
//!          └──────────bump_ref_count─────────┘
//! ```
//!
//! Disposal is one-way; every accessor afterwards fails with
//! [`EngineError::UseAfterDispose`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::pdfium::{NativePtr, PdfiumModule};

/// Called once after a page tears itself down, so the owner can drop it
pub type DisposeHook = Box<dyn Fn() + Send + Sync>;

struct PageState {
    ref_count: usize,
    ttl: Duration,
    expiry: Option<AbortHandle>,
    /// Bumped whenever a timer is armed or cancelled; a firing timer whose
    /// generation is stale does nothing
    timer_generation: u64,
    disposed: bool,
    text_page: Option<NativePtr>,
    form: Option<FormEnv>,
}

#[derive(Clone, Copy)]
struct FormEnv {
    info: NativePtr,
    handle: NativePtr,
}

/// Sub-handles taken out of the state for closing
struct Teardown {
    text_page: Option<NativePtr>,
    form: Option<FormEnv>,
}

pub struct PageContext {
    module: Arc<dyn PdfiumModule>,
    doc_ptr: NativePtr,
    page_index: usize,
    page_ptr: NativePtr,
    serial: u64,
    state: Mutex<PageState>,
    on_final_dispose: DisposeHook,
    this: Weak<PageContext>,
}

impl PageContext {
    /// Wrap a freshly loaded page with a reference count of one
    pub fn new(
        module: Arc<dyn PdfiumModule>,
        doc_ptr: NativePtr,
        page_index: usize,
        page_ptr: NativePtr,
        ttl: Duration,
        serial: u64,
        on_final_dispose: DisposeHook,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            module,
            doc_ptr,
            page_index,
            page_ptr,
            serial,
            state: Mutex::new(PageState {
                ref_count: 1,
                ttl,
                expiry: None,
                timer_generation: 0,
                disposed: false,
                text_page: None,
                form: None,
            }),
            on_final_dispose,
            this: this.clone(),
        })
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn doc_ptr(&self) -> NativePtr {
        self.doc_ptr
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Native page handle
    pub fn page_ptr(&self) -> Result<NativePtr> {
        self.ensure_alive(&self.state.lock())?;
        Ok(self.page_ptr)
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Whether an idle-expiry timer is currently armed
    pub fn has_pending_expiry(&self) -> bool {
        self.state.lock().expiry.is_some()
    }

    pub fn ttl(&self) -> Duration {
        self.state.lock().ttl
    }

    /// Takes effect the next time the page goes idle
    pub fn set_ttl(&self, ttl: Duration) {
        self.state.lock().ttl = ttl;
    }

    fn ensure_alive(&self, state: &PageState) -> Result<()> {
        if state.disposed {
            return Err(EngineError::UseAfterDispose(self.page_index));
        }
        Ok(())
    }

    /// Take another reference and cancel any pending expiry
    pub fn bump_ref_count(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_alive(&state)?;
        state.ref_count += 1;
        Self::clear_expiry_timer(&mut state);
        Ok(())
    }

    fn clear_expiry_timer(state: &mut PageState) {
        state.timer_generation += 1;
        if let Some(timer) = state.expiry.take() {
            timer.abort();
        }
    }

    /// Drop one reference; the last one arms the idle-expiry timer
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        if state.ref_count == 0 {
            warn!(page_index = self.page_index, "release() on page with no references");
            return;
        }

        state.ref_count -= 1;
        if state.ref_count == 0 {
            self.arm_expiry_timer(&mut state);
        }
    }

    fn arm_expiry_timer(&self, state: &mut PageState) {
        Self::clear_expiry_timer(state);

        // Without a runtime the page simply stays idle until evicted
        let Ok(runtime) = Handle::try_current() else {
            debug!(page_index = self.page_index, "No runtime; expiry timer not armed");
            return;
        };

        let generation = state.timer_generation;
        let ttl = state.ttl;
        let this = self.this.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(page) = this.upgrade() {
                page.expire(generation);
            }
        });
        state.expiry = Some(timer.abort_handle());
    }

    /// Timer callback: dispose if still idle and the timer is current
    fn expire(&self, generation: u64) {
        let teardown = self.begin_teardown(|state| {
            state.ref_count == 0 && state.timer_generation == generation
        });
        if let Some(teardown) = teardown {
            debug!(page_index = self.page_index, "Page expired");
            self.close_handles(teardown);
            (self.on_final_dispose)();
        }
    }

    /// Close every native handle now, then notify the owner.
    /// A second call is a no-op.
    pub fn dispose_immediate(&self) {
        if let Some(teardown) = self.begin_teardown(|_| true) {
            self.close_handles(teardown);
            (self.on_final_dispose)();
        }
    }

    /// Close every native handle without notifying the owner. Used by the
    /// owning cache, which has already dropped its entry.
    pub(crate) fn dispose_detached(&self) -> bool {
        match self.begin_teardown(|_| true) {
            Some(teardown) => {
                self.close_handles(teardown);
                true
            }
            None => false,
        }
    }

    /// Mark disposed under the lock if `admit` allows it
    fn begin_teardown(&self, admit: impl FnOnce(&PageState) -> bool) -> Option<Teardown> {
        let mut state = self.state.lock();
        if state.disposed || !admit(&state) {
            return None;
        }
        state.disposed = true;
        Self::clear_expiry_timer(&mut state);
        Some(Teardown {
            text_page: state.text_page.take(),
            form: state.form.take(),
        })
    }

    fn close_handles(&self, teardown: Teardown) {
        if let Some(text_page) = teardown.text_page {
            self.module.text_close_page(text_page);
        }
        if let Some(form) = teardown.form {
            self.module.form_on_before_close_page(self.page_ptr, form.handle);
            self.module.exit_form_fill_environment(form.handle);
            self.module.close_form_fill_info(form.info);
        }
        self.module.close_page(self.page_ptr);
        debug!(page_index = self.page_index, page = %self.page_ptr, "Page closed");
    }

    /// Text-page handle, opened on first use
    pub fn text_page(&self) -> Result<NativePtr> {
        let mut state = self.state.lock();
        self.ensure_alive(&state)?;
        if let Some(text_page) = state.text_page {
            return Ok(text_page);
        }

        let text_page = self.module.text_load_page(self.page_ptr);
        if text_page.is_null() {
            return Err(EngineError::Native {
                call: "FPDFText_LoadPage",
                code: self.module.get_last_error(),
            });
        }
        state.text_page = Some(text_page);
        Ok(text_page)
    }

    /// Form-fill environment handle, opened on first use
    pub fn form_handle(&self) -> Result<NativePtr> {
        let mut state = self.state.lock();
        self.ensure_alive(&state)?;
        if let Some(form) = state.form {
            return Ok(form.handle);
        }

        let info = self.module.open_form_fill_info();
        let handle = self.module.init_form_fill_environment(self.doc_ptr, info);
        if handle.is_null() {
            self.module.close_form_fill_info(info);
            return Err(EngineError::Native {
                call: "FPDFDOC_InitFormFillEnvironment",
                code: self.module.get_last_error(),
            });
        }
        self.module.form_on_after_load_page(self.page_ptr, handle);

        state.form = Some(FormEnv { info, handle });
        Ok(handle)
    }

    /// Open annotation `index`, run `f`, and close the annotation on every
    /// exit path
    pub fn with_annotation<R>(&self, index: usize, f: impl FnOnce(NativePtr) -> R) -> Result<R> {
        self.ensure_alive(&self.state.lock())?;

        let annot = self.module.get_annot(self.page_ptr, index);
        if annot.is_null() {
            return Err(EngineError::NotFound(format!(
                "annotation {index} on page {}",
                self.page_index
            )));
        }

        let _guard = AnnotationGuard {
            module: self.module.as_ref(),
            annot,
        };
        Ok(f(annot))
    }
}

struct AnnotationGuard<'a> {
    module: &'a dyn PdfiumModule,
    annot: NativePtr,
}

impl Drop for AnnotationGuard<'_> {
    fn drop(&mut self) {
        self.module.close_annot(self.annot);
    }
}

impl std::fmt::Debug for PageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PageContext")
            .field("page_index", &self.page_index)
            .field("page_ptr", &self.page_ptr)
            .field("ref_count", &state.ref_count)
            .field("disposed", &state.disposed)
            .finish()
    }
}
