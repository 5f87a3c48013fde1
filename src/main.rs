//! PDFium Worker
//!
//! Serves the engine protocol over stdio: one JSON envelope per line in on
//! stdin, one per line out on stdout. Logs go to stderr.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pdfium_worker::pdfium::SimulatedPdfium;
use pdfium_worker::worker::{Request, Response};
use pdfium_worker::{Config, EngineRunner, PdfiumEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();

    // Initialize tracing; stdout is reserved for protocol frames
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pdfium_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env().context("invalid PDFIUM_WORKER_* configuration")?;

    tracing::info!("Starting PDFium worker v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        page_ttl_ms = config.cache.page_ttl_ms,
        max_pages_per_document = config.cache.max_pages_per_document,
        max_total_memory = config.memory.max_total_memory,
        "Configuration loaded"
    );

    let engine = PdfiumEngine::new(Arc::new(SimulatedPdfium::new()), &config);

    let (request_tx, request_rx) = mpsc::unbounded_channel::<Request>();
    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<Response>();

    let runner = EngineRunner::new(Arc::new(engine), response_tx, config.runner);
    let runner = tokio::spawn(runner.run(request_rx));

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = response_rx.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                if request_tx.send(request).is_err() {
                    tracing::warn!("Runner stopped; no longer reading requests");
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Skipping malformed message"),
        }
    }

    tracing::info!("stdin closed, shutting down");
    drop(request_tx);
    runner.await.context("runner task failed")?;
    writer.await.context("writer task failed")??;

    Ok(())
}
