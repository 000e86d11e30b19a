mod adapters;
mod cli;
mod shutdown;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use bookforge_jobs::{
    make_concatenate_chapter_handler, make_extract_page_handler, Chapter, IngestJob, NaiveChapterConcatenator,
    NaivePageCounter, OcrJob, OcrJobConfig, PlaceholderPageExtractor, TtsJob, TtsJobConfig,
};
use bookforge_scheduler_core::config::{self, PoolConfig, SchedulerConfig};
use bookforge_scheduler_core::job::Job;
use bookforge_scheduler_core::provider_pool::ProviderHandle;
use bookforge_scheduler_core::scheduler::{JobFactory, Scheduler};
use bookforge_scheduler_core::sink::Sink;
use bookforge_scheduler_core::store::DocumentStore;
use bookforge_scheduler_core::{JobManager, StoreJobManager};
use bookforge_store_client::{HttpDocumentStore, InMemoryDocumentStore};

use crate::adapters::{ReferenceOcrAdapter, ReferenceTtsAdapter};
use crate::cli::{Cli, Command};
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};

/// Job-type-specific reconstruction parameters, persisted alongside the job
/// record so `resume` can rebuild a fully-configured job from nothing but its
/// book id. `JobRecord.metadata` only ever carries `book_id` (see
/// `bookforge_scheduler_core::job::JobRecord::new`); these sidecar documents,
/// one collection per job type, carry the rest.
mod job_spec {
    pub const INGEST: &str = "IngestJobSpec";
    pub const OCR: &str = "OcrJobSpec";
    pub const TTS: &str = "TtsJobSpec";
}

/// Resolve the most recently created spec document for `book_id` in `collection`.
async fn find_spec(store: &Arc<dyn DocumentStore>, collection: &str, book_id: &str) -> Result<Option<Value>> {
    let query = json!({"collection": collection, "op": "query", "filter": {"book_id": book_id}});
    let result = store.execute(&query, &Value::Null).await.context("querying job spec")?;
    Ok(result.as_array().and_then(|docs| docs.last()).cloned())
}

fn ingest_factory(store: Arc<dyn DocumentStore>) -> JobFactory {
    Arc::new(move |book_id: Option<String>| -> Arc<dyn Job> {
        let book_id = book_id.unwrap_or_default();
        let spec = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(find_spec(&store, job_spec::INGEST, &book_id))
        })
        .ok()
        .flatten()
        .unwrap_or_default();
        let source_path = spec.get("source_path").and_then(Value::as_str).map(PathBuf::from).unwrap_or_default();
        let title = spec.get("title").and_then(Value::as_str).map(str::to_string);
        Arc::new(IngestJob::new(source_path, title, Arc::new(NaivePageCounter)))
    })
}

fn ocr_factory(store: Arc<dyn DocumentStore>) -> JobFactory {
    Arc::new(move |book_id: Option<String>| -> Arc<dyn Job> {
        let book_id = book_id.unwrap_or_default();
        let spec = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(find_spec(&store, job_spec::OCR, &book_id))
        })
        .ok()
        .flatten()
        .unwrap_or_default();
        let pdf_path = spec.get("pdf_path").and_then(Value::as_str).map(PathBuf::from).unwrap_or_default();
        let output_dir = spec.get("output_dir").and_then(Value::as_str).map(PathBuf::from).unwrap_or_default();
        let page_count = spec.get("page_count").and_then(Value::as_u64).unwrap_or(0) as u32;
        let providers = spec
            .get("providers")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let max_page_retries =
            spec.get("max_page_retries").and_then(Value::as_u64).unwrap_or(config::DEFAULT_MAX_PAGE_RETRIES as u64) as u32;
        Arc::new(OcrJob::new(book_id, pdf_path, output_dir, page_count, OcrJobConfig { providers, max_page_retries }))
    })
}

fn tts_factory(store: Arc<dyn DocumentStore>) -> JobFactory {
    Arc::new(move |book_id: Option<String>| -> Arc<dyn Job> {
        let book_id = book_id.unwrap_or_default();
        let spec = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(find_spec(&store, job_spec::TTS, &book_id))
        })
        .ok()
        .flatten()
        .unwrap_or_default();
        let output_dir = spec.get("output_dir").and_then(Value::as_str).map(PathBuf::from).unwrap_or_default();
        let voice = spec.get("voice").and_then(Value::as_str).unwrap_or("default").to_string();
        let format = spec.get("format").and_then(Value::as_str).unwrap_or("mp3").to_string();
        let chapters: Vec<Chapter> =
            spec.get("chapters").cloned().and_then(|v| serde_json::from_value(v).ok()).unwrap_or_default();
        let config = TtsJobConfig { voice, format, ..TtsJobConfig::default() };
        Arc::new(TtsJob::new(book_id, chapters, output_dir, config))
    })
}

/// Shared scheduler plumbing: the store (so subcommands can persist sidecar
/// job specs) and the scheduler built over it, with cpu handlers and job
/// factories already registered.
struct Runtime {
    store: Arc<dyn DocumentStore>,
    scheduler: Arc<Scheduler>,
}

async fn build_runtime(cli: &Cli) -> Result<Runtime> {
    let store: Arc<dyn DocumentStore> = match &cli.backend_url {
        Some(url) => Arc::new(HttpDocumentStore::new(reqwest::Client::new(), url.clone())),
        None => Arc::new(InMemoryDocumentStore::new()),
    };

    let mut sched_config = config::load_config()?.unwrap_or_else(|| SchedulerConfig::with_home_dir(cli.home_dir.clone()));
    sched_config.home_dir = cli.home_dir.clone();
    if cli.cpu_workers != 0 {
        sched_config.cpu_workers = cli.cpu_workers;
    }
    tokio::fs::create_dir_all(&sched_config.home_dir).await.context("creating home dir")?;

    let sink = Arc::new(Sink::new(store.clone(), sched_config.sink_batch_size, sched_config.sink_flush_interval()));
    sink.start().await;

    let manager: Arc<dyn JobManager> = Arc::new(StoreJobManager::new(store.clone()));
    let scheduler = Scheduler::new(
        store.clone(),
        sink,
        Some(manager),
        sched_config.home_dir.clone(),
        sched_config.results_channel_capacity,
    );

    scheduler.init_cpu_pool(sched_config.cpu_workers).await;
    scheduler
        .register_cpu_handler("extract_page", make_extract_page_handler(Arc::new(PlaceholderPageExtractor)))
        .await;
    scheduler
        .register_cpu_handler("concatenate_chapter", make_concatenate_chapter_handler(Arc::new(NaiveChapterConcatenator)))
        .await;

    scheduler.register_factory("ingest", ingest_factory(store.clone())).await;
    scheduler.register_factory("ocr", ocr_factory(store.clone())).await;
    scheduler.register_factory("tts", tts_factory(store.clone())).await;

    Ok(Runtime { store, scheduler })
}

/// Drive `scheduler.run()` in the background until every active job has
/// finished, or the user asks to stop (ctrl-c once for graceful drain, twice
/// to cancel immediately).
async fn run_until_idle(scheduler: &Arc<Scheduler>) -> Result<()> {
    let runner = scheduler.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    loop {
        if scheduler.active_job_count().await == 0 {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            event = shutdown_rx.recv() => match event {
                Some(ShutdownEvent::Graceful) => {
                    tracing::warn!("ctrl-c received, draining in-flight work before exit (press again to stop immediately)");
                }
                Some(ShutdownEvent::Immediate) | None => {
                    tracing::warn!("forced shutdown, cancelling immediately");
                    break;
                }
            },
        }
    }

    scheduler.cancellation_token().cancel();
    let _ = run_handle.await;
    Ok(())
}

async fn print_job_record(store: &Arc<dyn DocumentStore>, job_id: &str) -> Result<()> {
    let query = json!({"collection": "Job", "op": "query", "filter": {"id": job_id}});
    let result = store.execute(&query, &Value::Null).await.context("querying job record")?;
    match result.as_array().and_then(|docs| docs.first()) {
        Some(doc) => println!("{}", serde_json::to_string_pretty(doc)?),
        None => bail!("no job record with id {job_id:?}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Ingest { source, title } => {
            let rt = build_runtime(&cli).await?;
            rt.store
                .create(job_spec::INGEST, &json!({"source_path": source, "title": title}))
                .await
                .context("persisting ingest job spec")?;
            let job = Arc::new(IngestJob::new(source.clone(), title.clone(), Arc::new(NaivePageCounter)));
            let job_id = rt.scheduler.submit(job).await.context("submitting ingest job")?;
            run_until_idle(&rt.scheduler).await?;
            print_job_record(&rt.store, &job_id).await?;
        }
        Command::Ocr { book_id, pdf_path, page_count, providers, max_page_retries } => {
            let rt = build_runtime(&cli).await?;
            for name in providers {
                rt.scheduler
                    .register_pool(
                        name.clone(),
                        ProviderHandle::Ocr(Arc::new(ReferenceOcrAdapter::new(name.clone()))),
                        PoolConfig { name: Some(name.clone()), ..Default::default() },
                    )
                    .await;
            }
            let output_dir = cli.home_dir.join("books").join(book_id).join("pages");
            rt.store
                .create(
                    job_spec::OCR,
                    &json!({
                        "book_id": book_id,
                        "pdf_path": pdf_path,
                        "output_dir": &output_dir,
                        "page_count": page_count,
                        "providers": providers,
                        "max_page_retries": max_page_retries,
                    }),
                )
                .await
                .context("persisting ocr job spec")?;
            let config = OcrJobConfig { providers: providers.clone(), max_page_retries: *max_page_retries };
            let job = Arc::new(OcrJob::new(book_id.clone(), pdf_path.clone(), output_dir, *page_count, config));
            let job_id = rt.scheduler.submit(job).await.context("submitting ocr job")?;
            run_until_idle(&rt.scheduler).await?;
            print_job_record(&rt.store, &job_id).await?;
        }
        Command::Tts { book_id, chapters_file, voice, format } => {
            let rt = build_runtime(&cli).await?;
            rt.scheduler
                .register_pool(
                    "reference-tts",
                    ProviderHandle::Tts(Arc::new(ReferenceTtsAdapter::new("reference-tts"))),
                    PoolConfig { name: Some("reference-tts".into()), ..Default::default() },
                )
                .await;
            let raw = tokio::fs::read_to_string(chapters_file).await.context("reading chapters file")?;
            let chapters: Vec<Chapter> = serde_json::from_str(&raw).context("parsing chapters file")?;
            let output_dir = cli.home_dir.join("books").join(book_id).join("audio");
            rt.store
                .create(
                    job_spec::TTS,
                    &json!({
                        "book_id": book_id,
                        "output_dir": &output_dir,
                        "voice": voice,
                        "format": format,
                        "chapters": &chapters,
                    }),
                )
                .await
                .context("persisting tts job spec")?;
            let config = TtsJobConfig { voice: voice.clone(), format: format.clone(), ..TtsJobConfig::default() };
            let job = Arc::new(TtsJob::new(book_id.clone(), chapters, output_dir, config));
            let job_id = rt.scheduler.submit(job).await.context("submitting tts job")?;
            run_until_idle(&rt.scheduler).await?;
            print_job_record(&rt.store, &job_id).await?;
        }
        Command::Resume => {
            let rt = build_runtime(&cli).await?;
            // Providers referenced by resumed jobs must already have a pool;
            // the reference adapters stand in for whatever pools were live
            // before the process restarted.
            rt.scheduler
                .register_pool(
                    "reference-ocr",
                    ProviderHandle::Ocr(Arc::new(ReferenceOcrAdapter::new("reference-ocr"))),
                    PoolConfig { name: Some("reference-ocr".into()), ..Default::default() },
                )
                .await;
            rt.scheduler
                .register_pool(
                    "reference-tts",
                    ProviderHandle::Tts(Arc::new(ReferenceTtsAdapter::new("reference-tts"))),
                    PoolConfig { name: Some("reference-tts".into()), ..Default::default() },
                )
                .await;
            let resumed = rt.scheduler.resume().await.context("resuming running jobs")?;
            println!("resumed {resumed} job(s)");
            run_until_idle(&rt.scheduler).await?;
        }
        Command::Status { job_id } => {
            let store: Arc<dyn DocumentStore> = match &cli.backend_url {
                Some(url) => Arc::new(HttpDocumentStore::new(reqwest::Client::new(), url.clone())),
                None => Arc::new(InMemoryDocumentStore::new()),
            };
            print_job_record(&store, job_id).await?;
        }
    }

    Ok(())
}
