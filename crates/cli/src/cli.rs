use std::path::PathBuf;

use clap::{Parser, Subcommand};

fn default_home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local/share/bookforge")
}

/// Reference CLI driving the scheduler core end to end.
#[derive(Debug, Clone, Parser)]
#[command(name = "bookforge", version, about = "Book-processing job scheduler")]
pub struct Cli {
    /// Home directory for on-disk artifacts (originals, page images, audio).
    #[arg(long, env = "BOOKFORGE_HOME", default_value_os_t = default_home_dir())]
    pub home_dir: PathBuf,

    /// Document-store backend URL. Omit to use an in-memory store (fine for
    /// a single CLI invocation; state does not survive the process).
    #[arg(long, env = "BOOKFORGE_BACKEND_URL")]
    pub backend_url: Option<reqwest::Url>,

    /// CPU pool worker count (0 = host cpu count).
    #[arg(long, env = "BOOKFORGE_CPU_WORKERS", default_value_t = 0)]
    pub cpu_workers: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Ingest a source PDF into a new book.
    Ingest {
        /// Path to the source PDF.
        #[arg(long)]
        source: PathBuf,
        /// Display title, defaulting to the file stem.
        #[arg(long)]
        title: Option<String>,
    },
    /// Run OCR over every page of a previously ingested book.
    Ocr {
        /// Book id returned by `ingest`.
        #[arg(long)]
        book_id: String,
        /// Path to the book's source PDF.
        #[arg(long)]
        pdf_path: PathBuf,
        /// Number of pages in the PDF.
        #[arg(long)]
        page_count: u32,
        /// OCR providers to run against each page.
        #[arg(long, value_delimiter = ',', default_value = "reference-ocr")]
        providers: Vec<String>,
        /// Per-page retry budget before giving up on a provider.
        #[arg(long, env = "BOOKFORGE_MAX_PAGE_RETRIES", default_value_t = bookforge_scheduler_core::config::DEFAULT_MAX_PAGE_RETRIES)]
        max_page_retries: u32,
    },
    /// Generate narrated audio for a book's chapters.
    Tts {
        /// Book id the chapters belong to.
        #[arg(long)]
        book_id: String,
        /// Path to a JSON file: an array of `{id, matter_type, paragraphs}` chapters.
        #[arg(long)]
        chapters_file: PathBuf,
        /// Voice identifier passed to the TTS provider.
        #[arg(long, default_value = "default")]
        voice: String,
        /// Output audio format/extension.
        #[arg(long, default_value = "mp3")]
        format: String,
    },
    /// Rebuild and resume every job record left `Running`, then wait for them to finish.
    Resume,
    /// Print the persisted status of a job record.
    Status {
        /// Job record id.
        #[arg(long)]
        job_id: String,
    },
}
