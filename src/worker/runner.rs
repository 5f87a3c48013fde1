//! Worker-side request loop
//!
//! The runner owns the engine inside the execution unit. Incoming
//! `ExecuteRequest`s are queued; before each one starts, messages that
//! arrived in the meantime are drained so an `AbortRequest` racing its
//! request is seen first. Once the runner has been busy for longer than its
//! yield budget it yields to the scheduler and drains again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::protocol::{MethodCall, Request, Response};
use crate::config::RunnerConfig;
use crate::engine::{dispatch, JsonTask, PdfEngine};
use crate::error::{EngineError, PdfErrorReason};
use crate::task::{TaskError, TaskOutcome};

pub struct EngineRunner {
    engine: Arc<dyn PdfEngine>,
    outbox: mpsc::UnboundedSender<Response>,
    /// Started requests that have not answered yet
    in_flight: Arc<Mutex<HashMap<String, JsonTask>>>,
    /// Queued ids named by an `AbortRequest`; consumed when they come up
    cancelled: HashSet<String>,
    queue: VecDeque<(String, MethodCall)>,
    is_ready: bool,
    yield_budget: Duration,
    last_yield: Instant,
}

impl EngineRunner {
    pub fn new(
        engine: Arc<dyn PdfEngine>,
        outbox: mpsc::UnboundedSender<Response>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            engine,
            outbox,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            cancelled: HashSet::new(),
            queue: VecDeque::new(),
            is_ready: false,
            yield_budget: Duration::from_millis(config.yield_budget_ms),
            last_yield: Instant::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    /// Number of requests started but not yet answered
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Announce readiness. Only the first call sends `ReadyResponse`.
    pub fn ready(&mut self) {
        if self.is_ready {
            return;
        }
        self.is_ready = true;
        self.send(Response::ready());
        info!("Runner ready");
    }

    fn send(&self, response: Response) {
        if self.outbox.send(response).is_err() {
            debug!("Host channel closed; dropping response");
        }
    }

    fn respond_error(&self, id: String, error: TaskError<PdfErrorReason>) {
        self.send(Response::ExecuteResponse {
            id,
            data: TaskOutcome::Error(error),
        });
    }

    /// Accept one message. Executes are queued until [`start_queued`]
    /// runs; aborts take effect immediately.
    ///
    /// [`start_queued`]: Self::start_queued
    pub fn handle(&mut self, request: Request) {
        match request {
            Request::ExecuteRequest { id, data } => {
                if !self.is_ready {
                    self.respond_error(id, TaskError::reject(EngineError::NotReady.into()));
                    return;
                }
                debug!(id = %id, method = %data.name, "Execute queued");
                self.queue.push_back((id, data));
            }
            Request::AbortRequest { id } => {
                let task = self.in_flight.lock().get(&id).cloned();
                if let Some(task) = task {
                    debug!(id = %id, "Aborting in-flight request");
                    task.abort(PdfErrorReason::cancelled());
                } else if self.queue.iter().any(|(queued, _)| *queued == id) {
                    debug!(id = %id, "Cancelling queued request");
                    self.cancelled.insert(id);
                } else {
                    debug!(id = %id, "Ignoring abort for unknown or finished request");
                }
            }
        }
    }

    /// Start every queued request, in arrival order
    pub fn start_queued(&mut self) {
        while let Some((id, call)) = self.queue.pop_front() {
            self.start(id, call);
        }
    }

    fn start(&mut self, id: String, call: MethodCall) {
        if self.cancelled.remove(&id) {
            debug!(id = %id, "Skipping pre-cancelled request");
            self.respond_error(id, TaskError::reject(PdfErrorReason::pre_cancelled()));
            return;
        }

        let task = match dispatch(self.engine.as_ref(), &call.name, call.args) {
            Ok(task) => task,
            Err(err) => {
                warn!(id = %id, method = %call.name, error = %err, "Rejecting request");
                self.respond_error(id, TaskError::reject(err.into()));
                return;
            }
        };

        self.in_flight.lock().insert(id.clone(), task.clone());

        let outbox = self.outbox.clone();
        let progress_id = id.clone();
        task.on_progress(move |data| {
            outbox
                .send(Response::ExecuteProgress {
                    id: progress_id.clone(),
                    data: data.clone(),
                })
                .ok();
        });

        let outbox = self.outbox.clone();
        let in_flight = self.in_flight.clone();
        task.on_settled(move |outcome| {
            in_flight.lock().remove(&id);
            debug!(id = %id, stage = ?outcome.stage(), "Request settled");
            outbox
                .send(Response::ExecuteResponse {
                    id,
                    data: outcome.clone(),
                })
                .ok();
        });
    }

    fn drain(&mut self, inbox: &mut mpsc::UnboundedReceiver<Request>) {
        while let Ok(request) = inbox.try_recv() {
            self.handle(request);
        }
    }

    /// Yield once the budget is spent, then pick up whatever arrived
    async fn maybe_yield(&mut self, inbox: &mut mpsc::UnboundedReceiver<Request>) {
        if self.last_yield.elapsed() < self.yield_budget {
            return;
        }
        tokio::task::yield_now().await;
        self.last_yield = Instant::now();
        self.drain(inbox);
    }

    /// Initialize the engine, announce readiness, and serve until the
    /// inbox closes
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Request>) {
        match self.engine.initialize().settled().await {
            TaskOutcome::Result(true) => self.ready(),
            TaskOutcome::Result(false) => {
                error!("Engine refused to initialize");
                return;
            }
            TaskOutcome::Error(err) => {
                error!(reason = %err.reason, "Engine failed to initialize");
                return;
            }
        }
        self.last_yield = Instant::now();

        while let Some(request) = inbox.recv().await {
            self.handle(request);
            self.drain(&mut inbox);

            while let Some((id, call)) = self.queue.pop_front() {
                self.start(id, call);
                self.maybe_yield(&mut inbox).await;
            }
        }

        let abandoned: Vec<JsonTask> = self.in_flight.lock().values().cloned().collect();
        info!(abandoned = abandoned.len(), "Inbox closed; runner stopping");
        for task in abandoned {
            task.abort(PdfErrorReason::cancelled());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    use crate::cache::CacheStats;
    use crate::config::Config;
    use crate::engine::*;
    use crate::error::PdfErrorCode;
    use crate::pdfium::{MemoryStats, SimDocument, SimulatedPdfium};
    use crate::task::{TaskErrorKind, TaskStage};

    /// Engine whose calls stay pending until the test settles them
    #[derive(Default)]
    struct ManualEngine {
        searches: Mutex<Vec<PdfTask<SearchAllPagesResult, SearchProgress>>>,
    }

    impl PdfEngine for ManualEngine {
        fn initialize(&self) -> PdfTask<bool> {
            PdfTask::resolved(true)
        }
        fn open_document(&self, _: PdfFile, _: Option<String>) -> PdfTask<PdfDocumentObject> {
            PdfTask::new()
        }
        fn close_document(&self, _: &str) -> PdfTask<bool> {
            PdfTask::new()
        }
        fn close_all_documents(&self) -> PdfTask<bool> {
            PdfTask::new()
        }
        fn render_page(&self, _: &str, _: usize, _: RenderOptions) -> PdfTask<RenderedPage> {
            PdfTask::new()
        }
        fn get_page_text(&self, _: &str, _: usize) -> PdfTask<String> {
            PdfTask::new()
        }
        fn get_page_annotations(&self, _: &str, _: usize) -> PdfTask<Vec<PdfAnnotationObject>> {
            PdfTask::new()
        }
        fn get_bookmarks(&self, _: &str) -> PdfTask<PdfBookmarksObject> {
            PdfTask::new()
        }
        fn get_attachments(&self, _: &str) -> PdfTask<Vec<PdfAttachmentObject>> {
            PdfTask::new()
        }
        fn save_as_copy(&self, _: &str) -> PdfTask<PdfBinary> {
            PdfTask::new()
        }
        fn search_all_pages(
            &self,
            _: &str,
            _: &str,
            _: SearchOptions,
        ) -> PdfTask<SearchAllPagesResult, SearchProgress> {
            let task = PdfTask::new();
            self.searches.lock().push(task.clone());
            task
        }
        fn get_cache_stats(&self) -> PdfTask<CacheStats> {
            PdfTask::new()
        }
        fn get_memory_stats(&self) -> PdfTask<MemoryStats> {
            PdfTask::new()
        }
    }

    struct Harness {
        requests: mpsc::UnboundedSender<Request>,
        responses: mpsc::UnboundedReceiver<Response>,
    }

    impl Harness {
        async fn start(engine: Arc<dyn PdfEngine>) -> Self {
            let (requests, inbox) = mpsc::unbounded_channel();
            let (outbox, mut responses) = mpsc::unbounded_channel();
            let runner = EngineRunner::new(engine, outbox, RunnerConfig::default());
            tokio::spawn(runner.run(inbox));

            assert_eq!(responses.recv().await, Some(Response::ready()));
            Self {
                requests,
                responses,
            }
        }

        fn send(&self, request: Request) {
            self.requests.send(request).unwrap();
        }

        async fn next(&mut self) -> Response {
            self.responses.recv().await.unwrap()
        }

        async fn outcome(&mut self, id: &str) -> TaskOutcome<Value, PdfErrorReason> {
            loop {
                match self.next().await {
                    Response::ExecuteResponse { id: rid, data } if rid == id => return data,
                    _ => continue,
                }
            }
        }
    }

    fn sim_engine() -> Arc<PdfiumEngine> {
        Arc::new(PdfiumEngine::new(
            Arc::new(SimulatedPdfium::new()),
            &Config::default(),
        ))
    }

    fn open_request(id: &str, doc_id: &str, pages: usize) -> Request {
        let file = PdfFile {
            id: doc_id.into(),
            content: SimDocument::with_pages(pages).to_bytes(),
        };
        Request::execute(id, "openDocument", json!([file]))
    }

    fn rejection(outcome: TaskOutcome<Value, PdfErrorReason>) -> TaskError<PdfErrorReason> {
        match outcome {
            TaskOutcome::Error(error) => error,
            TaskOutcome::Result(value) => panic!("expected an error, got {value}"),
        }
    }

    #[test]
    fn test_ready_sent_once() {
        let (outbox, mut responses) = mpsc::unbounded_channel();
        let mut runner = EngineRunner::new(sim_engine(), outbox, RunnerConfig::default());

        runner.ready();
        runner.ready();
        assert_eq!(responses.try_recv().unwrap(), Response::ready());
        assert!(responses.try_recv().is_err());
    }

    #[test]
    fn test_execute_before_ready_is_rejected() {
        let (outbox, mut responses) = mpsc::unbounded_channel();
        let mut runner = EngineRunner::new(sim_engine(), outbox, RunnerConfig::default());

        runner.handle(Request::execute("early", "getCacheStats", json!([])));
        match responses.try_recv().unwrap() {
            Response::ExecuteResponse { id, data } => {
                assert_eq!(id, "early");
                assert_eq!(rejection(data).reason.code, PdfErrorCode::NotReady);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_abort_before_start_skips_request() {
        let (outbox, mut responses) = mpsc::unbounded_channel();
        let engine = Arc::new(ManualEngine::default());
        let mut runner = EngineRunner::new(engine.clone(), outbox, RunnerConfig::default());
        runner.ready();
        responses.try_recv().unwrap();

        runner.handle(Request::execute("r1", "searchAllPages", json!(["doc", "fox"])));
        runner.handle(Request::abort("r1"));
        runner.start_queued();

        match responses.try_recv().unwrap() {
            Response::ExecuteResponse { id, data } => {
                assert_eq!(id, "r1");
                let error = rejection(data);
                assert_eq!(error.reason, PdfErrorReason::pre_cancelled());
            }
            other => panic!("unexpected {other:?}"),
        }
        // The engine was never called
        assert!(engine.searches.lock().is_empty());
        assert_eq!(runner.in_flight(), 0);
    }

    #[test]
    fn test_late_abort_does_not_poison_id() {
        let (outbox, mut responses) = mpsc::unbounded_channel();
        let mut runner = EngineRunner::new(sim_engine(), outbox, RunnerConfig::default());
        runner.ready();
        responses.try_recv().unwrap();

        // Nothing in flight or queued under these ids
        runner.handle(Request::abort("done"));
        runner.handle(Request::abort("never-sent"));
        assert!(runner.cancelled.is_empty());

        // A queued id is recorded and consumed when it comes up
        runner.handle(Request::execute("q", "getCacheStats", json!([])));
        runner.handle(Request::abort("q"));
        assert!(runner.cancelled.contains("q"));
        runner.start_queued();
        assert!(runner.cancelled.is_empty());
        match responses.try_recv().unwrap() {
            Response::ExecuteResponse { id, data } => {
                assert_eq!(id, "q");
                assert_eq!(rejection(data).reason, PdfErrorReason::pre_cancelled());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reused_id_runs_after_late_abort() {
        let mut harness = Harness::start(sim_engine()).await;

        harness.send(open_request("open", "doc", 2));
        assert!(matches!(harness.outcome("open").await, TaskOutcome::Result(_)));

        harness.send(Request::execute("r1", "getPageText", json!(["doc", 1])));
        assert_eq!(harness.outcome("r1").await, TaskOutcome::Result(json!("Page 1")));

        // The abort arrives after r1 answered; the id is free for reuse
        harness.send(Request::abort("r1"));
        harness.send(Request::execute("r1", "getPageText", json!(["doc", 0])));
        assert_eq!(harness.outcome("r1").await, TaskOutcome::Result(json!("Page 0")));
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_args_rejected() {
        let mut harness = Harness::start(sim_engine()).await;

        harness.send(Request::execute("a", "rotateUniverse", json!([])));
        let error = rejection(harness.outcome("a").await);
        assert_eq!(error.kind, TaskErrorKind::Reject);
        assert_eq!(error.reason.code, PdfErrorCode::NotSupport);

        harness.send(Request::execute("b", "getPageText", json!(["doc", "zero"])));
        assert_eq!(
            rejection(harness.outcome("b").await).reason.code,
            PdfErrorCode::InvalidArgs
        );

        // The runner keeps serving after bad requests
        harness.send(Request::execute("c", "closeAllDocuments", json!([])));
        assert_eq!(harness.outcome("c").await, TaskOutcome::Result(json!(true)));
    }

    #[tokio::test]
    async fn test_execute_then_abort_never_succeeds() {
        let mut harness = Harness::start(sim_engine()).await;

        harness.send(open_request("open", "doc", 2));
        assert!(matches!(harness.outcome("open").await, TaskOutcome::Result(_)));

        // Both land before the runner gets to run again
        harness.send(Request::execute("r1", "renderPage", json!(["doc", 0, {"scaleFactor": 0.1}])));
        harness.send(Request::abort("r1"));

        let error = rejection(harness.outcome("r1").await);
        assert_eq!(error.reason.code, PdfErrorCode::Aborted);

        // Exactly one response for r1
        harness.send(Request::execute("after", "getCacheStats", json!([])));
        loop {
            match harness.next().await {
                Response::ExecuteResponse { id, .. } if id == "after" => break,
                other => assert_ne!(other.id(), "r1"),
            }
        }
    }

    #[tokio::test]
    async fn test_abort_in_flight_request() {
        let engine = Arc::new(ManualEngine::default());
        let mut harness = Harness::start(engine.clone()).await;

        harness.send(Request::execute("s", "searchAllPages", json!(["doc", "fox"])));
        // Wait until the engine has been called
        while engine.searches.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        harness.send(Request::abort("s"));
        let error = rejection(harness.outcome("s").await);
        assert_eq!(error.kind, TaskErrorKind::Abort);
        assert_eq!(error.reason, PdfErrorReason::cancelled());

        // The engine-side task saw the abort
        let search = engine.searches.lock()[0].clone();
        assert_eq!(search.stage(), TaskStage::Aborted);
        // Late completion from the engine is swallowed
        assert!(!search.resolve(SearchAllPagesResult::default()));
    }

    #[tokio::test]
    async fn test_progress_precedes_response() {
        let engine = Arc::new(ManualEngine::default());
        let mut harness = Harness::start(engine.clone()).await;

        harness.send(Request::execute("s", "searchAllPages", json!(["doc", "fox"])));
        while engine.searches.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let search = engine.searches.lock()[0].clone();
        for page_index in 0..3 {
            search.progress(SearchProgress {
                page_index,
                matches: Vec::new(),
            });
        }
        search.resolve(SearchAllPagesResult::default());
        search.progress(SearchProgress {
            page_index: 9,
            matches: Vec::new(),
        });

        let mut pages = Vec::new();
        loop {
            match harness.next().await {
                Response::ExecuteProgress { data, .. } => pages.push(data["pageIndex"].clone()),
                Response::ExecuteResponse { data, .. } => {
                    assert_eq!(data, TaskOutcome::Result(json!({"results": [], "total": 0})));
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(pages, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_search_progress_frames_then_single_response() {
        let mut harness = Harness::start(sim_engine()).await;

        let mut document = SimDocument::with_pages(4);
        document.pages[0].text = "a fox".into();
        document.pages[2].text = "fox and fox".into();
        let file = PdfFile {
            id: "doc".into(),
            content: document.to_bytes(),
        };
        harness.send(Request::execute("open", "openDocument", json!([file])));
        assert!(matches!(harness.outcome("open").await, TaskOutcome::Result(_)));

        harness.send(Request::execute("s", "searchAllPages", json!(["doc", "fox"])));
        let mut pages = Vec::new();
        let result = loop {
            match harness.next().await {
                Response::ExecuteProgress { id, data } => {
                    assert_eq!(id, "s");
                    pages.push(data["pageIndex"].as_u64().unwrap());
                }
                Response::ExecuteResponse { id, data } => {
                    assert_eq!(id, "s");
                    break data.into_result().unwrap();
                }
                other => panic!("unexpected {other:?}"),
            }
        };
        // One frame per page, in page order, all before the response
        assert_eq!(pages, vec![0, 1, 2, 3]);
        assert_eq!(result["total"], 3);

        // Nothing else arrives for "s"
        harness.send(Request::execute("after", "getCacheStats", json!([])));
        loop {
            match harness.next().await {
                Response::ExecuteResponse { id, .. } if id == "after" => break,
                other => assert_ne!(other.id(), "s"),
            }
        }
    }

    #[tokio::test]
    async fn test_full_round_trip_through_cache() {
        let mut harness = Harness::start(sim_engine()).await;

        harness.send(open_request("open", "doc", 3));
        let opened = harness.outcome("open").await.into_result().unwrap();
        assert_eq!(opened["pageCount"], 3);

        harness.send(Request::execute("text", "getPageText", json!(["doc", 2])));
        assert_eq!(harness.outcome("text").await, TaskOutcome::Result(json!("Page 2")));

        harness.send(Request::execute("close", "closeDocument", json!(["doc"])));
        assert_eq!(harness.outcome("close").await, TaskOutcome::Result(json!(true)));

        harness.send(Request::execute("mem", "getMemoryStats", json!([])));
        let stats = harness.outcome("mem").await.into_result().unwrap();
        assert_eq!(stats["totalAllocated"], 0);
    }
}
