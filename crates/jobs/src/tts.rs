//! Per-chapter TTS driver: sequential segments within a chapter (for
//! prosody-continuity request stitching), parallel across chapters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use bookforge_scheduler_core::job::{ChapterAudioState, Job, JobContext, PendingUnitInfo, WorkUnitTracker};
use bookforge_scheduler_core::store::StoreOp;
use bookforge_scheduler_core::types::{
    stage_priority, CpuRequest, MetricAttribution, ResultPayload, TtsRequest, WorkPayload, WorkResult, WorkUnit,
};
use bookforge_store_client::records::AudioSegment;

use crate::error::JobDriverError;

/// How long a provider-assigned request id may sit before it is too stale to
/// offer as stitching context for the next segment.
const REQUEST_ID_FRESHNESS: chrono::Duration = chrono::Duration::minutes(110);

/// How many previous request ids a stitching-capable provider accepts.
const MAX_STITCH_IDS: usize = 3;

/// Coarse classification of a chapter, used to decide whether it gets audio
/// at all (see [`TtsJobConfig::audio_include`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatterType {
    /// Preface, table of contents, and similar lead-in material.
    FrontMatter,
    /// The book's main content.
    Body,
    /// Appendices, indices, and similar trailing material.
    BackMatter,
}

/// One chapter's worth of text, pre-split into synthesizable paragraphs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Chapter {
    /// Stable chapter document id. Used as the directory key throughout —
    /// never a positional index, so chapter reordering can't corrupt resume.
    pub id: String,
    /// Coarse matter classification, consulted by `audio_include`.
    pub matter_type: MatterType,
    /// Paragraphs in reading order; one TTS segment per paragraph.
    pub paragraphs: Vec<String>,
}

/// Tunables for [`TtsJob`].
#[derive(Clone)]
pub struct TtsJobConfig {
    /// Voice identifier passed to every request.
    pub voice: String,
    /// Output audio format (also the on-disk extension).
    pub format: String,
    /// Job-level retry budget per segment/concatenation, beyond pool retries.
    pub max_segment_retries: u32,
    /// Whether a chapter of a given matter type gets audio at all.
    pub audio_include: Arc<dyn Fn(MatterType) -> bool + Send + Sync>,
}

impl Default for TtsJobConfig {
    fn default() -> Self {
        Self {
            voice: "default".to_string(),
            format: "mp3".to_string(),
            max_segment_retries: 5,
            audio_include: Arc::new(|matter| !matches!(matter, MatterType::BackMatter)),
        }
    }
}

#[derive(Debug, Clone)]
struct ChapterEntry {
    chapter: Chapter,
    doc_id: Option<String>,
    state: ChapterAudioState,
    next_paragraph_idx: usize,
    segment_paths: Vec<Option<PathBuf>>,
    request_ids: Vec<(String, DateTime<Utc>)>,
    retry_count: u32,
}

impl ChapterEntry {
    fn fresh(chapter: Chapter) -> Self {
        let segment_paths = vec![None; chapter.paragraphs.len()];
        Self {
            chapter,
            doc_id: None,
            state: ChapterAudioState::Pending,
            next_paragraph_idx: 0,
            segment_paths,
            request_ids: Vec::new(),
            retry_count: 0,
        }
    }

    fn prune_and_take_stitch_ids(&mut self) -> Vec<String> {
        let cutoff = Utc::now() - REQUEST_ID_FRESHNESS;
        self.request_ids.retain(|(_, at)| *at >= cutoff);
        self.request_ids.iter().rev().take(MAX_STITCH_IDS).rev().map(|(id, _)| id.clone()).collect()
    }

    fn is_chapter_done(&self) -> bool {
        self.next_paragraph_idx >= self.chapter.paragraphs.len()
    }
}

/// Generates audio for every included chapter of one book.
pub struct TtsJob {
    record_id: Mutex<Option<String>>,
    book_id: String,
    output_dir: PathBuf,
    config: TtsJobConfig,
    chapters: Mutex<Vec<ChapterEntry>>,
    tracker: Mutex<WorkUnitTracker>,
    book_audio_doc_id: Mutex<Option<String>>,
    complete: AtomicBool,
    loaded: AtomicBool,
}

#[derive(serde::Deserialize)]
struct PersistedChapterAudio {
    id: String,
    chapter_id: String,
    state: ChapterAudioState,
}

#[derive(serde::Deserialize)]
struct PersistedAudioSegment {
    chapter_id: String,
    paragraph_idx: u32,
    audio_path: String,
    request_id: String,
    request_id_at: DateTime<Utc>,
}

impl TtsJob {
    /// Build a job over `chapters`, keeping only those `config.audio_include` selects.
    pub fn new(book_id: String, chapters: Vec<Chapter>, output_dir: PathBuf, config: TtsJobConfig) -> Self {
        let included: Vec<ChapterEntry> = chapters
            .into_iter()
            .filter(|c| (config.audio_include)(c.matter_type))
            .map(ChapterEntry::fresh)
            .collect();
        Self {
            record_id: Mutex::new(None),
            book_id,
            output_dir,
            config,
            chapters: Mutex::new(included),
            tracker: Mutex::new(WorkUnitTracker::new()),
            book_audio_doc_id: Mutex::new(None),
            complete: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
        }
    }

    /// Reload book/chapter/segment state already persisted for this book, so
    /// a resumed job skips work that finished before the previous process exited.
    async fn load_persisted_state(&self, ctx: &JobContext) -> Result<(), JobDriverError> {
        let book_audio_query = serde_json::json!({
            "collection": "BookAudio",
            "op": "query",
            "filter": { "book_id": self.book_id },
        });
        if let Value::Array(docs) = ctx.store.execute(&book_audio_query, &Value::Null).await? {
            if let Some(doc) = docs.into_iter().next() {
                let id = doc.get("id").and_then(Value::as_str).map(str::to_string);
                let state = doc.get("state").and_then(Value::as_str);
                *self.book_audio_doc_id.lock().expect("tts job book_audio poisoned") = id;
                if state == Some("complete") {
                    self.complete.store(true, Ordering::SeqCst);
                }
            }
        }

        let chapter_query = serde_json::json!({
            "collection": "ChapterAudio",
            "op": "query",
            "filter": { "book_id": self.book_id },
        });
        let chapter_docs = ctx.store.execute(&chapter_query, &Value::Null).await?;
        if let Value::Array(docs) = chapter_docs {
            let mut chapters = self.chapters.lock().expect("tts job chapters poisoned");
            for doc in docs {
                let Ok(parsed) = serde_json::from_value::<PersistedChapterAudio>(doc) else { continue };
                if let Some(entry) = chapters.iter_mut().find(|c| c.chapter.id == parsed.chapter_id) {
                    entry.doc_id = Some(parsed.id);
                    entry.state = parsed.state;
                }
            }
        }

        let segment_query = serde_json::json!({
            "collection": "AudioSegment",
            "op": "query",
            "filter": { "book_id": self.book_id },
        });
        let segment_docs = ctx.store.execute(&segment_query, &Value::Null).await?;
        if let Value::Array(docs) = segment_docs {
            let mut chapters = self.chapters.lock().expect("tts job chapters poisoned");
            for doc in docs {
                let Ok(parsed) = serde_json::from_value::<PersistedAudioSegment>(doc) else { continue };
                let Some(entry) = chapters.iter_mut().find(|c| c.chapter.id == parsed.chapter_id) else { continue };
                let idx = parsed.paragraph_idx as usize;
                if idx >= entry.segment_paths.len() {
                    continue;
                }
                entry.segment_paths[idx] = Some(PathBuf::from(parsed.audio_path));
                entry.next_paragraph_idx = entry.next_paragraph_idx.max(idx + 1);
                if !parsed.request_id.is_empty() {
                    entry.request_ids.push((parsed.request_id, parsed.request_id_at));
                }
            }
            for entry in chapters.iter_mut() {
                entry.request_ids.sort_by_key(|(_, at)| *at);
                if entry.request_ids.len() > MAX_STITCH_IDS {
                    let drain_to = entry.request_ids.len() - MAX_STITCH_IDS;
                    entry.request_ids.drain(0..drain_to);
                }
            }
        }

        Ok(())
    }

    async fn ensure_book_audio_doc(&self, ctx: &JobContext) -> Result<String, JobDriverError> {
        if let Some(id) = self.book_audio_doc_id.lock().expect("tts job book_audio poisoned").clone() {
            return Ok(id);
        }
        let doc = serde_json::json!({
            "book_id": self.book_id,
            "state": "generating",
            "started_at": Utc::now(),
        });
        let id = ctx.store.create("BookAudio", &doc).await?;
        *self.book_audio_doc_id.lock().expect("tts job book_audio poisoned") = Some(id.clone());
        Ok(id)
    }

    async fn ensure_chapter_doc(&self, ctx: &JobContext, idx: usize) -> Result<String, JobDriverError> {
        let existing = self.chapters.lock().expect("tts job chapters poisoned")[idx].doc_id.clone();
        if let Some(id) = existing {
            return Ok(id);
        }
        let chapter_id = self.chapters.lock().expect("tts job chapters poisoned")[idx].chapter.id.clone();
        let doc = serde_json::json!({
            "book_id": self.book_id,
            "chapter_id": chapter_id,
            "state": "pending",
            "audio_path": Value::Null,
        });
        let id = ctx.store.create("ChapterAudio", &doc).await?;
        self.chapters.lock().expect("tts job chapters poisoned")[idx].doc_id = Some(id.clone());
        Ok(id)
    }

    fn segment_unit(&self, idx: usize) -> WorkUnit {
        let mut chapters = self.chapters.lock().expect("tts job chapters poisoned");
        let entry = &mut chapters[idx];
        let text = entry.chapter.paragraphs[entry.next_paragraph_idx].clone();
        let previous_ids = entry.prune_and_take_stitch_ids();
        let chapter_id = entry.chapter.id.clone();
        drop(chapters);
        WorkUnit::new(
            stage_priority("tts_segment"),
            WorkPayload::Tts(TtsRequest { text, voice: self.config.voice.clone(), format: self.config.format.clone(), previous_request_ids: previous_ids }),
        )
        .with_metrics(MetricAttribution {
            book_id: Some(self.book_id.clone()),
            stage: Some("tts_segment".into()),
            item_key: Some(chapter_id),
            ..Default::default()
        })
    }

    fn concatenate_unit(&self, idx: usize) -> WorkUnit {
        let chapters = self.chapters.lock().expect("tts job chapters poisoned");
        let entry = &chapters[idx];
        let segment_paths: Vec<String> = entry
            .segment_paths
            .iter()
            .map(|p| p.as_ref().expect("all segments present before concatenation").display().to_string())
            .collect();
        let output_path = self.output_dir.join(&entry.chapter.id).join(format!("chapter.{}", self.config.format));
        let chapter_id = entry.chapter.id.clone();
        drop(chapters);
        let data = serde_json::json!({
            "chapter_id": chapter_id,
            "segment_paths": segment_paths,
            "output_path": output_path.display().to_string(),
        });
        WorkUnit::new(
            stage_priority("chapter_concat"),
            WorkPayload::Cpu(CpuRequest { task: "concatenate_chapter".into(), data }),
        )
        .with_metrics(MetricAttribution {
            book_id: Some(self.book_id.clone()),
            stage: Some("chapter_concat".into()),
            item_key: Some(chapter_id),
            ..Default::default()
        })
    }

    async fn persist_chapter_state(&self, ctx: &JobContext, idx: usize, audio_path: Option<String>) -> Result<(), JobDriverError> {
        let (doc_id, state) = {
            let chapters = self.chapters.lock().expect("tts job chapters poisoned");
            (chapters[idx].doc_id.clone(), chapters[idx].state)
        };
        let Some(doc_id) = doc_id else { return Ok(()) };
        let mut patch = serde_json::json!({ "state": state });
        if let Some(path) = audio_path {
            patch["audio_path"] = Value::String(path);
        }
        ctx.sink.send(StoreOp::update("ChapterAudio", doc_id, patch, "tts:chapter_state")).await?;
        Ok(())
    }

    async fn finalize_book_audio(&self, ctx: &JobContext, state: &str, error: Option<String>) -> Result<(), JobDriverError> {
        let Some(doc_id) = self.book_audio_doc_id.lock().expect("tts job book_audio poisoned").clone() else {
            return Ok(());
        };
        let mut patch = serde_json::json!({ "state": state, "completed_at": Utc::now() });
        if let Some(err) = error {
            patch["error"] = Value::String(err);
        }
        ctx.sink.send(StoreOp::update("BookAudio", doc_id, patch, "tts:book_audio")).await?;
        Ok(())
    }

    fn chapter_idx_by_id(&self, chapter_id: &str) -> Option<usize> {
        self.chapters
            .lock()
            .expect("tts job chapters poisoned")
            .iter()
            .position(|c| c.chapter.id == chapter_id)
    }
}

#[async_trait]
impl Job for TtsJob {
    fn set_record_id(&self, id: String) {
        *self.record_id.lock().expect("tts job record_id poisoned") = Some(id);
    }

    fn record_id(&self) -> Option<String> {
        self.record_id.lock().expect("tts job record_id poisoned").clone()
    }

    fn job_type(&self) -> String {
        "tts".to_string()
    }

    fn book_id(&self) -> Option<String> {
        Some(self.book_id.clone())
    }

    async fn start(&self, ctx: &JobContext) -> Result<Vec<WorkUnit>, String> {
        if !self.loaded.swap(true, Ordering::SeqCst) {
            self.load_persisted_state(ctx).await.map_err(|e| e.to_string())?;
        }
        self.ensure_book_audio_doc(ctx).await.map_err(|e| e.to_string())?;

        let chapter_count = self.chapters.lock().expect("tts job chapters poisoned").len();
        let mut units = Vec::new();
        let mut pending_info: Vec<(usize, PendingUnitInfo)> = Vec::new();

        for idx in 0..chapter_count {
            self.ensure_chapter_doc(ctx, idx).await.map_err(|e| e.to_string())?;
            let (chapter_id, state, chapter_done) = {
                let chapters = self.chapters.lock().expect("tts job chapters poisoned");
                let entry = &chapters[idx];
                (entry.chapter.id.clone(), entry.state, entry.is_chapter_done())
            };

            match state {
                ChapterAudioState::Concatenated | ChapterAudioState::Failed => continue,
                ChapterAudioState::SegmentsDone => {
                    let unit = self.concatenate_unit(idx);
                    pending_info.push((units.len(), PendingUnitInfo { sub_type: "concatenate".into(), chapter_id: Some(chapter_id), ..Default::default() }));
                    units.push(unit);
                }
                ChapterAudioState::Pending | ChapterAudioState::SegmentInProgress => {
                    if chapter_done {
                        self.chapters.lock().expect("tts job chapters poisoned")[idx].state = ChapterAudioState::SegmentsDone;
                        self.persist_chapter_state(ctx, idx, None).await.map_err(|e| e.to_string())?;
                        let unit = self.concatenate_unit(idx);
                        pending_info.push((units.len(), PendingUnitInfo { sub_type: "concatenate".into(), chapter_id: Some(chapter_id), ..Default::default() }));
                        units.push(unit);
                    } else {
                        let unit = self.segment_unit(idx);
                        pending_info.push((units.len(), PendingUnitInfo { sub_type: "segment".into(), chapter_id: Some(chapter_id), ..Default::default() }));
                        units.push(unit);
                        if state == ChapterAudioState::Pending {
                            self.chapters.lock().expect("tts job chapters poisoned")[idx].state = ChapterAudioState::SegmentInProgress;
                            self.persist_chapter_state(ctx, idx, None).await.map_err(|e| e.to_string())?;
                        }
                    }
                }
            }
        }

        let mut tracker = self.tracker.lock().expect("tts job tracker poisoned");
        for (i, info) in pending_info {
            tracker.track(&units[i], info);
        }
        drop(tracker);

        Ok(units)
    }

    async fn on_complete(&self, ctx: &JobContext, result: WorkResult) -> Result<Vec<WorkUnit>, String> {
        let info = {
            let mut tracker = self.tracker.lock().expect("tts job tracker poisoned");
            tracker.complete(&result.work_unit_id)
        };
        let Some(info) = info else { return Ok(Vec::new()) };
        let Some(chapter_id) = info.chapter_id.clone() else { return Ok(Vec::new()) };
        let Some(idx) = self.chapter_idx_by_id(&chapter_id) else { return Ok(Vec::new()) };

        match info.sub_type.as_str() {
            "segment" => self.on_segment_complete(ctx, idx, info, result).await,
            "concatenate" => self.on_concatenate_complete(ctx, idx, result).await,
            other => Err(format!("tts job: unknown pending sub_type {other:?}")),
        }
    }

    fn done(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    fn pending_count(&self) -> usize {
        self.tracker.lock().expect("tts job tracker poisoned").len()
    }

    fn progress(&self) -> HashMap<String, Value> {
        let chapters = self.chapters.lock().expect("tts job chapters poisoned");
        let total = chapters.len();
        let concatenated = chapters.iter().filter(|c| c.state == ChapterAudioState::Concatenated).count();
        let mut map = HashMap::new();
        map.insert("chapters_total".to_string(), Value::from(total as u64));
        map.insert("chapters_concatenated".to_string(), Value::from(concatenated as u64));
        map
    }
}

impl TtsJob {
    async fn on_segment_complete(
        &self,
        ctx: &JobContext,
        idx: usize,
        info: PendingUnitInfo,
        result: WorkResult,
    ) -> Result<Vec<WorkUnit>, String> {
        if !result.success {
            let rejected_stitching = result.error.as_deref().map(|e| e.contains("previous_request_ids")).unwrap_or(false);
            let retry_count = {
                let mut chapters = self.chapters.lock().expect("tts job chapters poisoned");
                let entry = &mut chapters[idx];
                if rejected_stitching {
                    entry.request_ids.clear();
                }
                entry.retry_count += 1;
                entry.retry_count
            };
            if retry_count > self.config.max_segment_retries {
                let chapter_id = info.chapter_id.clone().unwrap_or_default();
                self.chapters.lock().expect("tts job chapters poisoned")[idx].state = ChapterAudioState::Failed;
                self.persist_chapter_state(ctx, idx, None).await.map_err(|e| e.to_string())?;
                let msg = format!("chapter {chapter_id} tts failed after {retry_count} attempts: {}", result.error.unwrap_or_default());
                self.finalize_book_audio(ctx, "failed", Some(msg.clone())).await.map_err(|e| e.to_string())?;
                return Err(msg);
            }
            let unit = self.segment_unit(idx);
            self.tracker.lock().expect("tts job tracker poisoned").track(
                &unit,
                PendingUnitInfo { sub_type: "segment".into(), chapter_id: info.chapter_id, retry_count, ..Default::default() },
            );
            return Ok(vec![unit]);
        }

        let Some(ResultPayload::Tts(tts_result)) = result.payload else {
            return Err("tts segment result carried no payload".into());
        };

        let (chapter_doc_id, paragraph_idx, output_path) = {
            let chapters = self.chapters.lock().expect("tts job chapters poisoned");
            let entry = &chapters[idx];
            let paragraph_idx = entry.next_paragraph_idx;
            let dir = self.output_dir.join(&entry.chapter.id);
            let path = dir.join(format!("segment-{paragraph_idx:04}.{}", self.config.format));
            (entry.doc_id.clone(), paragraph_idx, path)
        };
        tokio::fs::create_dir_all(output_path.parent().expect("segment path has a parent")).await.map_err(|e| e.to_string())?;
        tokio::fs::write(&output_path, &tts_result.audio).await.map_err(|e| e.to_string())?;

        let record = AudioSegment {
            id: String::new(),
            book_id: self.book_id.clone(),
            chapter_id: chapter_doc_id.clone().unwrap_or_else(|| info.chapter_id.clone().unwrap_or_default()),
            paragraph_idx: paragraph_idx as u32,
            audio_path: output_path.display().to_string(),
            request_id: tts_result.request_id.clone(),
            request_id_at: Utc::now(),
        };
        ctx.sink
            .send(StoreOp::create("AudioSegment", serde_json::to_value(&record).map_err(|e| e.to_string())?, "tts:segment"))
            .await
            .map_err(|e| e.to_string())?;

        let chapter_done = {
            let mut chapters = self.chapters.lock().expect("tts job chapters poisoned");
            let entry = &mut chapters[idx];
            entry.segment_paths[paragraph_idx] = Some(output_path);
            entry.next_paragraph_idx += 1;
            entry.retry_count = 0;
            if !tts_result.request_id.is_empty() {
                entry.request_ids.push((tts_result.request_id, Utc::now()));
                if entry.request_ids.len() > MAX_STITCH_IDS {
                    let drain_to = entry.request_ids.len() - MAX_STITCH_IDS;
                    entry.request_ids.drain(0..drain_to);
                }
            }
            entry.is_chapter_done()
        };

        if chapter_done {
            self.chapters.lock().expect("tts job chapters poisoned")[idx].state = ChapterAudioState::SegmentsDone;
            self.persist_chapter_state(ctx, idx, None).await.map_err(|e| e.to_string())?;
            let unit = self.concatenate_unit(idx);
            self.tracker.lock().expect("tts job tracker poisoned").track(
                &unit,
                PendingUnitInfo { sub_type: "concatenate".into(), chapter_id: info.chapter_id, ..Default::default() },
            );
            Ok(vec![unit])
        } else {
            let unit = self.segment_unit(idx);
            self.tracker.lock().expect("tts job tracker poisoned").track(
                &unit,
                PendingUnitInfo { sub_type: "segment".into(), chapter_id: info.chapter_id, ..Default::default() },
            );
            Ok(vec![unit])
        }
    }

    async fn on_concatenate_complete(&self, ctx: &JobContext, idx: usize, result: WorkResult) -> Result<Vec<WorkUnit>, String> {
        if !result.success {
            let retry_count = {
                let mut chapters = self.chapters.lock().expect("tts job chapters poisoned");
                chapters[idx].retry_count += 1;
                chapters[idx].retry_count
            };
            if retry_count > self.config.max_segment_retries {
                self.chapters.lock().expect("tts job chapters poisoned")[idx].state = ChapterAudioState::Failed;
                self.persist_chapter_state(ctx, idx, None).await.map_err(|e| e.to_string())?;
                let msg = format!("chapter concatenation failed after {retry_count} attempts: {}", result.error.unwrap_or_default());
                self.finalize_book_audio(ctx, "failed", Some(msg.clone())).await.map_err(|e| e.to_string())?;
                return Err(msg);
            }
            let chapter_id = self.chapters.lock().expect("tts job chapters poisoned")[idx].chapter.id.clone();
            let unit = self.concatenate_unit(idx);
            self.tracker.lock().expect("tts job tracker poisoned").track(
                &unit,
                PendingUnitInfo { sub_type: "concatenate".into(), chapter_id: Some(chapter_id), retry_count, ..Default::default() },
            );
            return Ok(vec![unit]);
        }

        let Some(ResultPayload::Cpu(data)) = result.payload else {
            return Err("concatenate result carried no payload".into());
        };
        let audio_path = data.get("output_path").and_then(Value::as_str).map(str::to_string);

        {
            let mut chapters = self.chapters.lock().expect("tts job chapters poisoned");
            chapters[idx].state = ChapterAudioState::Concatenated;
        }
        self.persist_chapter_state(ctx, idx, audio_path).await.map_err(|e| e.to_string())?;

        let all_concatenated = self
            .chapters
            .lock()
            .expect("tts job chapters poisoned")
            .iter()
            .all(|c| c.state == ChapterAudioState::Concatenated);
        if all_concatenated {
            self.finalize_book_audio(ctx, "complete", None).await.map_err(|e| e.to_string())?;
            self.complete.store(true, Ordering::SeqCst);
        }

        Ok(Vec::new())
    }
}

/// Joins a chapter's segment audio files into one. Stubbed as a raw byte
/// concatenation; a real implementation would use a proper container/codec
/// library (e.g. `symphonia` for demux, a muxer for remux).
pub trait ChapterConcatenator: Send + Sync {
    /// Join `segment_paths`, in order, into `output_path`.
    fn concatenate(&self, segment_paths: &[PathBuf], output_path: &Path) -> Result<(), String>;
}

/// Reference concatenator: naive byte-level concatenation.
pub struct NaiveChapterConcatenator;

impl ChapterConcatenator for NaiveChapterConcatenator {
    fn concatenate(&self, segment_paths: &[PathBuf], output_path: &Path) -> Result<(), String> {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let mut joined = Vec::new();
        for path in segment_paths {
            joined.extend(std::fs::read(path).map_err(|e| e.to_string())?);
        }
        std::fs::write(output_path, joined).map_err(|e| e.to_string())
    }
}

/// Adapts a [`ChapterConcatenator`] into the CPU pool's synchronous handler shape.
///
/// Registered as the `concatenate_chapter` task: `scheduler.register_cpu_handler("concatenate_chapter", make_concatenate_chapter_handler(concatenator)).await`.
pub fn make_concatenate_chapter_handler(
    concatenator: Arc<dyn ChapterConcatenator>,
) -> bookforge_scheduler_core::cpu_pool::CpuTaskHandler {
    Arc::new(move |data: Value| -> Result<Value, String> {
        let segment_paths: Vec<PathBuf> = data
            .get("segment_paths")
            .and_then(Value::as_array)
            .ok_or("missing segment_paths")?
            .iter()
            .map(|v| v.as_str().map(PathBuf::from).ok_or_else(|| "invalid segment path entry".to_string()))
            .collect::<Result<_, _>>()?;
        let output_path = data.get("output_path").and_then(Value::as_str).ok_or("missing output_path")?;
        concatenator.concatenate(&segment_paths, Path::new(output_path))?;
        Ok(serde_json::json!({ "output_path": output_path }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookforge_scheduler_core::sink::Sink;
    use bookforge_scheduler_core::store::{DocumentStore, StoreOpResult};
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::time::Duration as StdDuration;

    #[derive(Default)]
    struct FakeStore {
        next_id: AtomicU64,
    }

    #[async_trait]
    impl DocumentStore for FakeStore {
        async fn execute(
            &self,
            _query_doc: &Value,
            _vars: &Value,
        ) -> Result<Value, bookforge_scheduler_core::error::StoreError> {
            Ok(Value::Array(Vec::new()))
        }

        async fn create(
            &self,
            _collection: &str,
            _doc: &Value,
        ) -> Result<String, bookforge_scheduler_core::error::StoreError> {
            Ok(format!("doc-{}", self.next_id.fetch_add(1, AtomicOrdering::Relaxed)))
        }

        async fn apply(&self, ops: &[StoreOp]) -> Vec<StoreOpResult> {
            ops.iter().map(|op| StoreOpResult { doc_id: op.doc_id.clone(), err: None }).collect()
        }
    }

    fn test_ctx(home_dir: PathBuf) -> (JobContext, Arc<Sink>) {
        let store: Arc<dyn DocumentStore> = Arc::new(FakeStore::default());
        let sink = Arc::new(Sink::new(store.clone(), 10, StdDuration::from_secs(10)));
        (JobContext { store, sink: sink.clone(), home_dir }, sink)
    }

    fn two_paragraph_chapter(id: &str) -> Chapter {
        Chapter { id: id.to_string(), matter_type: MatterType::Body, paragraphs: vec!["one".into(), "two".into()] }
    }

    #[tokio::test]
    async fn back_matter_excluded_by_default() {
        let tmp = std::env::temp_dir().join(format!("bookforge-tts-test-{}", ulid::Ulid::new()));
        let (ctx, sink) = test_ctx(tmp.clone());
        sink.start().await;

        let chapters = vec![
            two_paragraph_chapter("ch-1"),
            Chapter { id: "ch-appendix".into(), matter_type: MatterType::BackMatter, paragraphs: vec!["x".into()] },
        ];
        let job = TtsJob::new("book-1".into(), chapters, tmp.join("audio"), TtsJobConfig::default());
        let units = job.start(&ctx).await.unwrap();
        assert_eq!(units.len(), 1, "only the body chapter should queue a segment");

        sink.stop().await;
        tokio::fs::remove_dir_all(&tmp).await.ok();
    }

    #[tokio::test]
    async fn sequential_segments_then_concatenate_then_complete() {
        let tmp = std::env::temp_dir().join(format!("bookforge-tts-test-{}", ulid::Ulid::new()));
        let (ctx, sink) = test_ctx(tmp.clone());
        sink.start().await;

        let job = TtsJob::new("book-1".into(), vec![two_paragraph_chapter("ch-1")], tmp.join("audio"), TtsJobConfig::default());
        let start_units = job.start(&ctx).await.unwrap();
        assert_eq!(start_units.len(), 1);

        let seg1_result = WorkResult::success(
            &start_units[0],
            ResultPayload::Tts(bookforge_scheduler_core::types::TtsResult {
                audio: b"seg1".to_vec(),
                duration_ms: 100,
                char_count: 3,
                cost_usd: 0.001,
                request_id: "req-1".into(),
                execution_time: StdDuration::from_millis(10),
            }),
        );
        let after_seg1 = job.on_complete(&ctx, seg1_result).await.unwrap();
        assert_eq!(after_seg1.len(), 1, "second segment should be queued with stitching context");
        assert!(!job.done());

        let seg2_result = WorkResult::success(
            &after_seg1[0],
            ResultPayload::Tts(bookforge_scheduler_core::types::TtsResult {
                audio: b"seg2".to_vec(),
                duration_ms: 100,
                char_count: 3,
                cost_usd: 0.001,
                request_id: "req-2".into(),
                execution_time: StdDuration::from_millis(10),
            }),
        );
        let after_seg2 = job.on_complete(&ctx, seg2_result).await.unwrap();
        assert_eq!(after_seg2.len(), 1, "all segments done, should emit concatenate unit");
        assert_eq!(after_seg2[0].kind(), bookforge_scheduler_core::types::WorkKind::Cpu);

        let concat_result = WorkResult::success(&after_seg2[0], ResultPayload::Cpu(serde_json::json!({ "output_path": "final.mp3" })));
        let after_concat = job.on_complete(&ctx, concat_result).await.unwrap();
        assert!(after_concat.is_empty());
        assert!(job.done());

        sink.stop().await;
        tokio::fs::remove_dir_all(&tmp).await.ok();
    }

    #[tokio::test]
    async fn segment_failure_beyond_budget_fails_the_job() {
        let tmp = std::env::temp_dir().join(format!("bookforge-tts-test-{}", ulid::Ulid::new()));
        let (ctx, sink) = test_ctx(tmp.clone());
        sink.start().await;

        let mut config = TtsJobConfig::default();
        config.max_segment_retries = 0;
        let job = TtsJob::new("book-1".into(), vec![two_paragraph_chapter("ch-1")], tmp.join("audio"), config);
        let start_units = job.start(&ctx).await.unwrap();

        let failure = WorkResult::failure(&start_units[0], "provider unavailable");
        let outcome = job.on_complete(&ctx, failure).await;
        assert!(outcome.is_err(), "retry budget of 0 should fail immediately");

        sink.stop().await;
        tokio::fs::remove_dir_all(&tmp).await.ok();
    }
}
