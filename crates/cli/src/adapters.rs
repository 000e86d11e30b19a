//! Reference provider adapters.
//!
//! Real HTTP-backed chat/OCR/TTS clients are external collaborators, out of
//! scope for this repository (see `bookforge_scheduler_core::adapters`).
//! These stand-ins let the reference CLI exercise the scheduler core and
//! job drivers end to end without a live backend.

use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use bookforge_scheduler_core::adapters::{AdapterError, AdapterInfo, OcrAdapter, TtsAdapter};
use bookforge_scheduler_core::types::{OcrResult, TtsRequest, TtsResult};

/// Echoes a deterministic placeholder transcription instead of calling a real OCR service.
pub struct ReferenceOcrAdapter {
    name: String,
}

impl ReferenceOcrAdapter {
    /// Build an adapter presenting itself under `name` (used as the pool/provider name).
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl AdapterInfo for ReferenceOcrAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn requests_per_second(&self) -> f64 {
        4.0
    }

    fn max_concurrency(&self) -> usize {
        4
    }
}

#[async_trait]
impl OcrAdapter for ReferenceOcrAdapter {
    async fn process_image(&self, image_bytes: &[u8], page_num: u32) -> Result<OcrResult, AdapterError> {
        Ok(OcrResult {
            text: format!("[placeholder ocr text for page {page_num}, {} image bytes]", image_bytes.len()),
            cost_usd: 0.0,
            execution_time: Duration::from_millis(1),
        })
    }
}

/// Echoes the input text back as "audio" instead of calling a real TTS service.
pub struct ReferenceTtsAdapter {
    name: String,
}

impl ReferenceTtsAdapter {
    /// Build an adapter presenting itself under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl AdapterInfo for ReferenceTtsAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn requests_per_second(&self) -> f64 {
        4.0
    }

    fn max_concurrency(&self) -> usize {
        4
    }
}

#[async_trait]
impl TtsAdapter for ReferenceTtsAdapter {
    async fn generate(&self, req: &TtsRequest) -> Result<TtsResult, AdapterError> {
        Ok(TtsResult {
            audio: req.text.as_bytes().to_vec(),
            duration_ms: (req.text.len() as u64) * 60,
            char_count: req.text.len() as u64,
            cost_usd: 0.0,
            request_id: Ulid::new().to_string(),
            execution_time: Duration::from_millis(1),
        })
    }
}
