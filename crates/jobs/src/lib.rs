//! Reference job drivers: ingest, OCR, and TTS.
//!
//! Each driver implements `bookforge_scheduler_core::job::Job` and is meant
//! to be registered with a job-record factory so the scheduler can rebuild it
//! on resume. PDF page counting, page-image extraction, and chapter-audio
//! concatenation are stubbed behind small traits so real libraries can be
//! swapped in without touching the driver logic.

#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

pub mod error;
pub mod ingest;
pub mod ocr;
pub mod tts;

pub use error::JobDriverError;
pub use ingest::{IngestJob, NaivePageCounter, PageCounter};
pub use ocr::{make_extract_page_handler, OcrJob, OcrJobConfig, PageExtractor, PlaceholderPageExtractor};
pub use tts::{
    make_concatenate_chapter_handler, Chapter, ChapterConcatenator, MatterType, NaiveChapterConcatenator, TtsJob,
    TtsJobConfig,
};
