//! Host-side engine that forwards every call to a worker
//!
//! Each call gets a fresh correlation id and a pending [`JsonTask`]. A
//! router task reads the worker's responses and settles the matching task;
//! responses for ids no longer tracked are dropped. Requests issued before
//! the worker announced readiness are held back and flushed on
//! `ReadyResponse`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{Request, Response};
use super::runner::EngineRunner;
use crate::cache::CacheStats;
use crate::config::RunnerConfig;
use crate::engine::{
    typed, EngineMethod, JsonTask, PdfAnnotationObject, PdfAttachmentObject, PdfBinary,
    PdfBookmarksObject, PdfDocumentObject, PdfEngine, PdfFile, PdfTask, RenderOptions,
    RenderedPage, SearchAllPagesResult, SearchOptions, SearchProgress,
};
use crate::error::{PdfErrorCode, PdfErrorReason};
use crate::pdfium::MemoryStats;

#[derive(Default)]
struct ClientState {
    ready: bool,
    closed: bool,
    pending: HashMap<String, JsonTask>,
    /// Requests waiting for `ReadyResponse`
    backlog: Vec<Request>,
}

struct ClientInner {
    outbox: mpsc::UnboundedSender<Request>,
    state: Mutex<ClientState>,
    ready: watch::Receiver<bool>,
}

impl ClientInner {
    fn send(&self, request: Request) {
        if self.outbox.send(request).is_err() {
            debug!("Worker channel closed; dropping request");
        }
    }
}

fn worker_gone() -> PdfErrorReason {
    PdfErrorReason::new(PdfErrorCode::Unknown, "worker channel closed")
}

#[derive(Clone)]
pub struct WorkerEngine {
    inner: Arc<ClientInner>,
}

impl WorkerEngine {
    /// Attach to a worker through a pair of channels. Must be called from
    /// within a tokio runtime; the response router runs as a spawned task.
    pub fn spawn(
        outbox: mpsc::UnboundedSender<Request>,
        inbox: mpsc::UnboundedReceiver<Response>,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            outbox,
            state: Mutex::new(ClientState::default()),
            ready: ready_rx,
        });

        tokio::spawn(route(Arc::downgrade(&inner), inbox, ready_tx));

        Self { inner }
    }

    /// Run `engine` behind an [`EngineRunner`] on this runtime and return a
    /// client wired to it
    pub fn in_process(engine: Arc<dyn PdfEngine>, config: RunnerConfig) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let runner = EngineRunner::new(engine, response_tx, config);
        tokio::spawn(runner.run(request_rx));

        Self::spawn(request_tx, response_rx)
    }

    /// Resolves `true` once the worker is ready, `false` if it went away
    /// first
    pub async fn wait_ready(&self) -> bool {
        let mut ready = self.inner.ready.clone();
        let became_ready = ready.wait_for(|ready| *ready).await.is_ok();
        became_ready
    }

    /// Calls still waiting for a response
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    fn call<T, P, A>(&self, method: EngineMethod, args: A) -> PdfTask<T, P>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
        P: DeserializeOwned + Send + Sync + 'static,
        A: Serialize,
    {
        let args = match serde_json::to_value(args) {
            Ok(args) => args,
            Err(err) => {
                return PdfTask::rejected(PdfErrorReason::new(
                    PdfErrorCode::InvalidArgs,
                    format!("failed to encode arguments for {method}: {err}"),
                ))
            }
        };

        let id = Uuid::new_v4().to_string();
        let task = JsonTask::new();
        let request = Request::execute(id.clone(), method.name(), args);

        {
            let mut state = self.inner.state.lock();
            if state.closed {
                drop(state);
                task.reject(worker_gone());
                return typed(task);
            }
            state.pending.insert(id.clone(), task.clone());
            if state.ready {
                self.inner.send(request);
            } else {
                state.backlog.push(request);
            }
        }
        debug!(id = %id, method = %method, "Request sent");

        // Aborted while still tracked: the worker has not answered
        let inner = Arc::downgrade(&self.inner);
        task.on_abort(move |_| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut state = inner.state.lock();
            if state.pending.remove(&id).is_none() {
                return;
            }
            let queued = state.backlog.len();
            state.backlog.retain(|request| request.id() != id);
            if state.backlog.len() == queued {
                debug!(id = %id, "Forwarding abort to worker");
                inner.send(Request::abort(id));
            }
        });

        typed(task)
    }
}

async fn route(
    inner: Weak<ClientInner>,
    mut inbox: mpsc::UnboundedReceiver<Response>,
    ready: watch::Sender<bool>,
) {
    while let Some(response) = inbox.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match response {
            Response::ReadyResponse { .. } => {
                // Flushed under the lock so a call racing this one queues
                // behind the backlog
                let mut state = inner.state.lock();
                state.ready = true;
                let backlog = std::mem::take(&mut state.backlog);
                info!(queued = backlog.len(), "Worker ready");
                for request in backlog {
                    inner.send(request);
                }
                drop(state);
                ready.send_replace(true);
            }
            Response::ExecuteProgress { id, data } => {
                let task = inner.state.lock().pending.get(&id).cloned();
                match task {
                    Some(task) => {
                        task.progress(data);
                    }
                    None => debug!(id = %id, "Discarding stale progress"),
                }
            }
            Response::ExecuteResponse { id, data } => {
                let task = inner.state.lock().pending.remove(&id);
                match task {
                    Some(task) => {
                        task.settle(data);
                    }
                    None => debug!(id = %id, "Discarding stale response"),
                }
            }
        }
    }

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let abandoned: Vec<JsonTask> = {
        let mut state = inner.state.lock();
        state.closed = true;
        state.backlog.clear();
        state.pending.drain().map(|(_, task)| task).collect()
    };
    if !abandoned.is_empty() {
        warn!(abandoned = abandoned.len(), "Worker went away with calls in flight");
    }
    for task in abandoned {
        task.reject(worker_gone());
    }
}

impl PdfEngine for WorkerEngine {
    fn initialize(&self) -> PdfTask<bool> {
        self.call(EngineMethod::Initialize, ())
    }

    fn open_document(&self, file: PdfFile, password: Option<String>) -> PdfTask<PdfDocumentObject> {
        self.call(EngineMethod::OpenDocument, (file, password))
    }

    fn close_document(&self, doc_id: &str) -> PdfTask<bool> {
        self.call(EngineMethod::CloseDocument, (doc_id,))
    }

    fn close_all_documents(&self) -> PdfTask<bool> {
        self.call(EngineMethod::CloseAllDocuments, ())
    }

    fn render_page(
        &self,
        doc_id: &str,
        page_index: usize,
        options: RenderOptions,
    ) -> PdfTask<RenderedPage> {
        self.call(EngineMethod::RenderPage, (doc_id, page_index, options))
    }

    fn get_page_text(&self, doc_id: &str, page_index: usize) -> PdfTask<String> {
        self.call(EngineMethod::GetPageText, (doc_id, page_index))
    }

    fn get_page_annotations(
        &self,
        doc_id: &str,
        page_index: usize,
    ) -> PdfTask<Vec<PdfAnnotationObject>> {
        self.call(EngineMethod::GetPageAnnotations, (doc_id, page_index))
    }

    fn get_bookmarks(&self, doc_id: &str) -> PdfTask<PdfBookmarksObject> {
        self.call(EngineMethod::GetBookmarks, (doc_id,))
    }

    fn get_attachments(&self, doc_id: &str) -> PdfTask<Vec<PdfAttachmentObject>> {
        self.call(EngineMethod::GetAttachments, (doc_id,))
    }

    fn save_as_copy(&self, doc_id: &str) -> PdfTask<PdfBinary> {
        self.call(EngineMethod::SaveAsCopy, (doc_id,))
    }

    fn search_all_pages(
        &self,
        doc_id: &str,
        keyword: &str,
        options: SearchOptions,
    ) -> PdfTask<SearchAllPagesResult, SearchProgress> {
        self.call(EngineMethod::SearchAllPages, (doc_id, keyword, options))
    }

    fn get_cache_stats(&self) -> PdfTask<CacheStats> {
        self.call(EngineMethod::GetCacheStats, ())
    }

    fn get_memory_stats(&self) -> PdfTask<MemoryStats> {
        self.call(EngineMethod::GetMemoryStats, ())
    }
}
