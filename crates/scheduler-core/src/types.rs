//! Work units, work results, and the pure priority-mapping function.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// The kind of work a unit carries, and the kind of pool that can execute it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Chat-completion style call against a language-model provider.
    Llm,
    /// Image-to-text extraction against an OCR provider.
    Ocr,
    /// Text-to-speech synthesis against a TTS provider.
    Tts,
    /// Local CPU-bound work dispatched to a registered handler.
    Cpu,
}

/// A tool descriptor attached to a chat request, opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name as presented to the model.
    pub name: String,
    /// Free-form JSON schema/description, passed through verbatim.
    pub schema: serde_json::Value,
}

/// Attribution carried alongside a work unit purely for metrics emission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricAttribution {
    /// Owning book id, if any.
    pub book_id: Option<String>,
    /// Page id within the book, if any.
    pub page_id: Option<String>,
    /// Pipeline stage name (used for priority mapping too, see [`stage_priority`]).
    pub stage: Option<String>,
    /// Free-form item key (e.g. chapter id, segment index).
    pub item_key: Option<String>,
    /// Prompt key or content-id, for prompt-level cost attribution.
    pub prompt_key: Option<String>,
}

/// A single chat message in an LLM request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role (system/user/assistant/tool).
    pub role: String,
    /// Message content.
    pub content: String,
}

/// Payload for an LLM work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Model name hint; adapters may ignore or override.
    pub model: Option<String>,
}

/// Payload for an OCR work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrRequest {
    /// Raw image bytes (PNG/JPEG, adapter-dependent).
    #[serde(with = "base64_bytes")]
    pub image_bytes: Vec<u8>,
    /// 1-based page number within the book.
    pub page_num: u32,
}

/// Payload for a TTS work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsRequest {
    /// Text to synthesize.
    pub text: String,
    /// Voice identifier, provider-specific.
    pub voice: String,
    /// Output audio format (e.g. "mp3", "wav").
    pub format: String,
    /// Previous request ids for prosody-continuity stitching (at most 3, oldest first).
    #[serde(default)]
    pub previous_request_ids: Vec<String>,
}

/// Payload for a CPU work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuRequest {
    /// Task name; looked up in the cpu pool's handler registry.
    pub task: String,
    /// Opaque task data, interpreted only by the registered handler.
    pub data: serde_json::Value,
}

/// Exactly one payload variant per [`WorkKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkPayload {
    /// See [`ChatRequest`].
    Llm(ChatRequest),
    /// See [`OcrRequest`].
    Ocr(OcrRequest),
    /// See [`TtsRequest`].
    Tts(TtsRequest),
    /// See [`CpuRequest`].
    Cpu(CpuRequest),
}

impl WorkPayload {
    /// The [`WorkKind`] this payload variant belongs to.
    pub fn kind(&self) -> WorkKind {
        match self {
            WorkPayload::Llm(_) => WorkKind::Llm,
            WorkPayload::Ocr(_) => WorkKind::Ocr,
            WorkPayload::Tts(_) => WorkKind::Tts,
            WorkPayload::Cpu(_) => WorkKind::Cpu,
        }
    }
}

/// An immutable, enqueueable piece of work targeted at a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Unique id, generated by [`WorkUnit::new`].
    pub id: String,
    /// Owning job record id. Set by the scheduler at routing time.
    pub job_id: String,
    /// Pinned provider pool name, or empty for "any pool of this kind".
    pub provider: String,
    /// Higher is processed first.
    pub priority: i64,
    /// Exactly one payload variant, matching `payload.kind()`.
    pub payload: WorkPayload,
    /// Optional tool descriptors for chat calls.
    pub tools: Option<Vec<ToolDescriptor>>,
    /// Optional attribution for metrics emission.
    pub metrics: Option<MetricAttribution>,
}

impl WorkUnit {
    /// Build a new work unit with a fresh id and an empty job id (set by the scheduler).
    pub fn new(priority: i64, payload: WorkPayload) -> Self {
        Self {
            id: Ulid::new().to_string(),
            job_id: String::new(),
            provider: String::new(),
            priority,
            payload,
            tools: None,
            metrics: None,
        }
    }

    /// The [`WorkKind`] of this unit, derived from its payload.
    pub fn kind(&self) -> WorkKind {
        self.payload.kind()
    }

    /// Attach a pinned provider pool name.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Attach metrics attribution.
    pub fn with_metrics(mut self, metrics: MetricAttribution) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Attach tool descriptors (llm only; ignored by other kinds).
    pub fn with_tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// Result payload mirroring [`WorkPayload`], one variant per kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultPayload {
    /// LLM chat result.
    Llm(ChatResult),
    /// OCR extraction result.
    Ocr(OcrResult),
    /// TTS synthesis result.
    Tts(TtsResult),
    /// CPU task result (opaque).
    Cpu(serde_json::Value),
}

/// Result fields returned by an LLM adapter call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResult {
    /// Provider name that served the request.
    pub provider: String,
    /// Model actually used.
    pub model_used: String,
    /// Prompt token count.
    pub prompt_tokens: u64,
    /// Completion token count.
    pub completion_tokens: u64,
    /// Reasoning token count, if the model reports one.
    pub reasoning_tokens: u64,
    /// Total token count.
    pub total_tokens: u64,
    /// Estimated cost in USD.
    pub cost_usd: f64,
    /// Time spent queued before execution.
    pub queue_time: Duration,
    /// Time spent executing the request.
    pub execution_time: Duration,
    /// Total wall time (queue + execution + overhead).
    pub total_time: Duration,
    /// Raw text content, if any.
    pub content: Option<String>,
    /// Parsed JSON content, if the call requested structured output.
    pub parsed_json: Option<serde_json::Value>,
    /// Set when the call completed without a transport-level exception but
    /// the provider's own response signals a failure (e.g. structured
    /// output that failed to parse as JSON). Distinct from an
    /// [`crate::adapters::AdapterError`] raised by `chat`/`chat_with_tools`
    /// themselves; classified separately and more narrowly by
    /// [`crate::adapters::is_result_error_retriable`].
    #[serde(default)]
    pub result_error: Option<String>,
}

/// Result fields returned by an OCR adapter call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcrResult {
    /// Extracted text.
    pub text: String,
    /// Estimated cost in USD.
    pub cost_usd: f64,
    /// Time spent executing the request.
    pub execution_time: Duration,
}

/// Result fields returned by a TTS adapter call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsResult {
    /// Synthesized audio bytes.
    #[serde(with = "base64_bytes")]
    pub audio: Vec<u8>,
    /// Audio duration in milliseconds.
    pub duration_ms: u64,
    /// Number of characters synthesized.
    pub char_count: u64,
    /// Estimated cost in USD.
    pub cost_usd: f64,
    /// Provider-assigned request id, used for stitching continuation requests.
    pub request_id: String,
    /// Time spent executing the request.
    pub execution_time: Duration,
}

/// Mirror of a work unit: the outcome of executing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResult {
    /// Id of the work unit this result corresponds to.
    pub work_unit_id: String,
    /// Owning job record id.
    pub job_id: String,
    /// Whether the unit completed successfully.
    pub success: bool,
    /// Error text, set when `success` is false.
    pub error: Option<String>,
    /// One payload-matching result variant, present on success.
    pub payload: Option<ResultPayload>,
    /// Id of the persisted metric record, if one was written.
    pub metric_id: Option<String>,
}

impl WorkResult {
    /// Build a failure result for `unit` with the given error message.
    pub fn failure(unit: &WorkUnit, error: impl Into<String>) -> Self {
        Self {
            work_unit_id: unit.id.clone(),
            job_id: unit.job_id.clone(),
            success: false,
            error: Some(error.into()),
            payload: None,
            metric_id: None,
        }
    }

    /// Build a success result for `unit` carrying `payload`.
    pub fn success(unit: &WorkUnit, payload: ResultPayload) -> Self {
        Self {
            work_unit_id: unit.id.clone(),
            job_id: unit.job_id.clone(),
            success: true,
            error: None,
            payload: Some(payload),
            metric_id: None,
        }
    }
}

/// Priority bucket, used only for queue statistics (see [`crate::priority_queue::QueueStats`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityBucket {
    /// priority < 10
    Low,
    /// 10 <= priority < 20
    Normal,
    /// priority >= 20
    High,
}

impl PriorityBucket {
    /// Classify a raw priority value into a bucket.
    pub fn of(priority: i64) -> Self {
        if priority < 10 {
            PriorityBucket::Low
        } else if priority < 20 {
            PriorityBucket::Normal
        } else {
            PriorityBucket::High
        }
    }
}

/// Book-level stages that always take priority over the high-volume page stream.
const BOOK_LEVEL_STAGES: &[&str] = &["toc_find", "toc_build", "book_finalize", "manifest_write"];

/// Page-level stages that are known to be high-volume and should stay at normal priority.
const PAGE_LEVEL_STAGES: &[&str] = &["page_extract", "page_ocr", "page_embed"];

/// Prefixes that resolve to normal priority when not an exact book-level match.
const NORMAL_PREFIXES: &[&str] = &["page_", "link_entry_", "entry_", "discover_", "gap_", "polish_"];

/// Pure mapping from a pipeline stage key to a queueing priority.
///
/// Known exact stages map to book-level (20, high) vs page-level (10, normal); known
/// prefixes resolve to normal; unknown keys default to normal. This keeps infrequent
/// book-level operations ahead of the high-volume page-level stream so a book's late
/// stages are never starved by the previous book's pages.
pub fn stage_priority(stage: &str) -> i64 {
    if BOOK_LEVEL_STAGES.contains(&stage) {
        return 20;
    }
    if PAGE_LEVEL_STAGES.contains(&stage) {
        return 10;
    }
    if NORMAL_PREFIXES.iter().any(|p| stage.starts_with(p)) {
        return 10;
    }
    10
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_priority_book_level_beats_page_level() {
        assert!(stage_priority("toc_find") > stage_priority("page_extract"));
    }

    #[test]
    fn stage_priority_unknown_defaults_to_normal() {
        assert_eq!(stage_priority("something_else"), 10);
    }

    #[test]
    fn stage_priority_prefix_matches() {
        assert_eq!(stage_priority("gap_fill_1"), 10);
    }

    #[test]
    fn priority_bucket_thresholds() {
        assert_eq!(PriorityBucket::of(0), PriorityBucket::Low);
        assert_eq!(PriorityBucket::of(9), PriorityBucket::Low);
        assert_eq!(PriorityBucket::of(10), PriorityBucket::Normal);
        assert_eq!(PriorityBucket::of(19), PriorityBucket::Normal);
        assert_eq!(PriorityBucket::of(20), PriorityBucket::High);
    }
}
