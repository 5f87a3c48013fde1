//! Engine surface
//!
//! [`PdfEngine`] is what callers program against. Every method returns a
//! [`Task`] immediately. Two implementations exist:
//!
//! - [`PdfiumEngine`] runs in-process, resolving documents and pages through
//!   the resource cache before it touches native code.
//! - [`WorkerEngine`](crate::worker::WorkerEngine) forwards each call to a
//!   worker over the message protocol.
//!
//! The worker side looks methods up by their wire name and decodes the
//! positional argument array with [`dispatch`].

pub mod native;
pub mod types;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::cache::CacheStats;
use crate::error::{EngineError, PdfErrorCode, PdfErrorReason, Result};
use crate::pdfium::MemoryStats;
use crate::task::{Task, TaskOutcome};

pub use native::PdfiumEngine;
pub use types::*;

/// Task returned by engine methods
pub type PdfTask<T, P = ()> = Task<T, PdfErrorReason, P>;

/// Task with JSON payloads, as carried over the worker boundary
pub type JsonTask = Task<Value, PdfErrorReason, Value>;

pub trait PdfEngine: Send + Sync {
    fn initialize(&self) -> PdfTask<bool>;

    fn open_document(&self, file: PdfFile, password: Option<String>) -> PdfTask<PdfDocumentObject>;

    fn close_document(&self, doc_id: &str) -> PdfTask<bool>;

    fn close_all_documents(&self) -> PdfTask<bool>;

    fn render_page(
        &self,
        doc_id: &str,
        page_index: usize,
        options: RenderOptions,
    ) -> PdfTask<RenderedPage>;

    fn get_page_text(&self, doc_id: &str, page_index: usize) -> PdfTask<String>;

    fn get_page_annotations(
        &self,
        doc_id: &str,
        page_index: usize,
    ) -> PdfTask<Vec<PdfAnnotationObject>>;

    fn get_bookmarks(&self, doc_id: &str) -> PdfTask<PdfBookmarksObject>;

    fn get_attachments(&self, doc_id: &str) -> PdfTask<Vec<PdfAttachmentObject>>;

    fn save_as_copy(&self, doc_id: &str) -> PdfTask<PdfBinary>;

    /// Scan every page; one progress event per page
    fn search_all_pages(
        &self,
        doc_id: &str,
        keyword: &str,
        options: SearchOptions,
    ) -> PdfTask<SearchAllPagesResult, SearchProgress>;

    fn get_cache_stats(&self) -> PdfTask<CacheStats>;

    fn get_memory_stats(&self) -> PdfTask<MemoryStats>;
}

/// Engine methods by wire name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineMethod {
    Initialize,
    OpenDocument,
    CloseDocument,
    CloseAllDocuments,
    RenderPage,
    GetPageText,
    GetPageAnnotations,
    GetBookmarks,
    GetAttachments,
    SaveAsCopy,
    SearchAllPages,
    GetCacheStats,
    GetMemoryStats,
}

impl EngineMethod {
    pub const ALL: [EngineMethod; 13] = [
        EngineMethod::Initialize,
        EngineMethod::OpenDocument,
        EngineMethod::CloseDocument,
        EngineMethod::CloseAllDocuments,
        EngineMethod::RenderPage,
        EngineMethod::GetPageText,
        EngineMethod::GetPageAnnotations,
        EngineMethod::GetBookmarks,
        EngineMethod::GetAttachments,
        EngineMethod::SaveAsCopy,
        EngineMethod::SearchAllPages,
        EngineMethod::GetCacheStats,
        EngineMethod::GetMemoryStats,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EngineMethod::Initialize => "initialize",
            EngineMethod::OpenDocument => "openDocument",
            EngineMethod::CloseDocument => "closeDocument",
            EngineMethod::CloseAllDocuments => "closeAllDocuments",
            EngineMethod::RenderPage => "renderPage",
            EngineMethod::GetPageText => "getPageText",
            EngineMethod::GetPageAnnotations => "getPageAnnotations",
            EngineMethod::GetBookmarks => "getBookmarks",
            EngineMethod::GetAttachments => "getAttachments",
            EngineMethod::SaveAsCopy => "saveAsCopy",
            EngineMethod::SearchAllPages => "searchAllPages",
            EngineMethod::GetCacheStats => "getCacheStats",
            EngineMethod::GetMemoryStats => "getMemoryStats",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Length of the positional argument tuple, trailing optionals included
    pub fn arity(self) -> usize {
        match self {
            EngineMethod::Initialize
            | EngineMethod::CloseAllDocuments
            | EngineMethod::GetCacheStats
            | EngineMethod::GetMemoryStats => 0,
            EngineMethod::CloseDocument
            | EngineMethod::GetBookmarks
            | EngineMethod::GetAttachments
            | EngineMethod::SaveAsCopy => 1,
            EngineMethod::OpenDocument
            | EngineMethod::GetPageText
            | EngineMethod::GetPageAnnotations => 2,
            EngineMethod::RenderPage | EngineMethod::SearchAllPages => 3,
        }
    }
}

impl std::fmt::Display for EngineMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Decode a positional argument array. Missing trailing entries are read
/// as `null`, so optional parameters may be omitted.
fn decode_args<A: DeserializeOwned>(method: EngineMethod, args: Value) -> Result<A> {
    let invalid = |message: String| EngineError::InvalidArgs {
        method: method.name().to_string(),
        message,
    };

    let mut items = match args {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => return Err(invalid(format!("expected an array, got {other}"))),
    };
    let arity = method.arity();
    if items.len() > arity {
        return Err(invalid(format!(
            "expected at most {arity} arguments, got {}",
            items.len()
        )));
    }
    items.resize(arity, Value::Null);

    serde_json::from_value(Value::Array(items)).map_err(|e| invalid(e.to_string()))
}

/// Invoke an engine method by wire name with JSON arguments
pub fn dispatch(engine: &dyn PdfEngine, name: &str, args: Value) -> Result<JsonTask> {
    let method =
        EngineMethod::from_name(name).ok_or_else(|| EngineError::UnknownMethod(name.to_string()))?;

    if method.arity() == 0 {
        decode_args::<[Value; 0]>(method, args.clone())?;
    }

    let task = match method {
        EngineMethod::Initialize => erase(engine.initialize()),
        EngineMethod::CloseAllDocuments => erase(engine.close_all_documents()),
        EngineMethod::GetCacheStats => erase(engine.get_cache_stats()),
        EngineMethod::GetMemoryStats => erase(engine.get_memory_stats()),
        EngineMethod::OpenDocument => {
            let (file, password): (PdfFile, Option<String>) = decode_args(method, args)?;
            erase(engine.open_document(file, password))
        }
        EngineMethod::CloseDocument => {
            let (doc_id,): (String,) = decode_args(method, args)?;
            erase(engine.close_document(&doc_id))
        }
        EngineMethod::RenderPage => {
            let (doc_id, page_index, options): (String, usize, Option<RenderOptions>) =
                decode_args(method, args)?;
            erase(engine.render_page(&doc_id, page_index, options.unwrap_or_default()))
        }
        EngineMethod::GetPageText => {
            let (doc_id, page_index): (String, usize) = decode_args(method, args)?;
            erase(engine.get_page_text(&doc_id, page_index))
        }
        EngineMethod::GetPageAnnotations => {
            let (doc_id, page_index): (String, usize) = decode_args(method, args)?;
            erase(engine.get_page_annotations(&doc_id, page_index))
        }
        EngineMethod::GetBookmarks => {
            let (doc_id,): (String,) = decode_args(method, args)?;
            erase(engine.get_bookmarks(&doc_id))
        }
        EngineMethod::GetAttachments => {
            let (doc_id,): (String,) = decode_args(method, args)?;
            erase(engine.get_attachments(&doc_id))
        }
        EngineMethod::SaveAsCopy => {
            let (doc_id,): (String,) = decode_args(method, args)?;
            erase(engine.save_as_copy(&doc_id))
        }
        EngineMethod::SearchAllPages => {
            let (doc_id, keyword, options): (String, String, Option<SearchOptions>) =
                decode_args(method, args)?;
            erase(engine.search_all_pages(&doc_id, &keyword, options.unwrap_or_default()))
        }
    };
    Ok(task)
}

fn encode_failure(err: serde_json::Error) -> PdfErrorReason {
    PdfErrorReason::new(PdfErrorCode::Unknown, format!("failed to encode result: {err}"))
}

fn decode_failure(err: serde_json::Error) -> PdfErrorReason {
    PdfErrorReason::new(PdfErrorCode::Unknown, format!("failed to decode result: {err}"))
}

/// View a typed task as a JSON task. Aborting the JSON task aborts the
/// typed one.
pub fn erase<T, P>(task: PdfTask<T, P>) -> JsonTask
where
    T: Serialize + Clone + Send + Sync + 'static,
    P: Serialize + Send + Sync + 'static,
{
    let json = JsonTask::new();

    let sink = json.clone();
    task.on_progress(move |event| match serde_json::to_value(event) {
        Ok(value) => {
            sink.progress(value);
        }
        Err(err) => warn!(error = %err, "Dropping unencodable progress event"),
    });

    let sink = json.clone();
    task.on_settled(move |outcome| {
        match outcome {
            TaskOutcome::Result(value) => match serde_json::to_value(value) {
                Ok(value) => sink.resolve(value),
                Err(err) => sink.reject(encode_failure(err)),
            },
            TaskOutcome::Error(error) => sink.fail(error.clone()),
        };
    });

    json.on_abort(move |reason| {
        task.abort(reason.clone());
    });

    json
}

/// Typed view of a JSON task. Aborting the typed task aborts the JSON one.
pub fn typed<T, P>(json: JsonTask) -> PdfTask<T, P>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
    P: DeserializeOwned + Send + Sync + 'static,
{
    let task = PdfTask::<T, P>::new();

    let sink = task.clone();
    json.on_progress(move |value| match P::deserialize(value) {
        Ok(event) => {
            sink.progress(event);
        }
        Err(err) => warn!(error = %err, "Dropping undecodable progress event"),
    });

    let sink = task.clone();
    json.on_settled(move |outcome| {
        match outcome {
            TaskOutcome::Result(value) => match T::deserialize(value) {
                Ok(value) => sink.resolve(value),
                Err(err) => sink.reject(decode_failure(err)),
            },
            TaskOutcome::Error(error) => sink.fail(error.clone()),
        };
    });

    task.on_abort(move |reason| {
        json.abort(reason.clone());
    });

    task
}
