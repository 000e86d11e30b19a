//! Reference persisted-record shapes the job drivers round-trip through the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A book created by the ingest job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Store-assigned id.
    #[serde(default)]
    pub id: String,
    /// Display title, taken from the source filename absent better metadata.
    pub title: String,
    /// Absolute path to the original source PDF, under `<home>/originals`.
    pub original_path: String,
    /// Page count as reported by the PDF reader.
    pub page_count: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Result of one OCR provider call against one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResultRecord {
    /// Store-assigned id.
    #[serde(default)]
    pub id: String,
    /// Owning book id.
    pub book_id: String,
    /// Page number within the book.
    pub page_num: u32,
    /// Provider that produced this result.
    pub provider: String,
    /// Extracted text.
    pub text: String,
    /// Estimated cost in USD.
    pub cost_usd: f64,
}

/// One synthesized audio segment (one paragraph/unit of a chapter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSegment {
    /// Store-assigned id.
    #[serde(default)]
    pub id: String,
    /// Owning book id.
    pub book_id: String,
    /// Owning chapter document id (never a `chapter_idx` integer; see design notes).
    pub chapter_id: String,
    /// 0-based paragraph index within the chapter.
    pub paragraph_idx: u32,
    /// Path to the segment audio file on disk.
    pub audio_path: String,
    /// Provider-assigned request id, kept for prosody-continuity stitching.
    pub request_id: String,
    /// When the request id was obtained, for staleness pruning (> 110 min).
    pub request_id_at: DateTime<Utc>,
}

