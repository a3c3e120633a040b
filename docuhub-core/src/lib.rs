use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub type DocumentId = Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("another analysis is already running")]
    Busy,
    #[error("no primary document has been uploaded")]
    MissingPrimary,
    #[error("no text is selected in the viewer")]
    NoSelection,
    #[error("the document viewer is not ready")]
    ViewerNotReady,
    #[error("request failed: {0}")]
    Transport(String),
    #[error("malformed response field: {0}")]
    Decode(String),
    #[error("document '{0}' is not part of this session")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentRole {
    Primary,
    Prior,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub name: String,
    pub role: DocumentRole,
}

/// A pending request to move the displayed viewer to a page/offset.
/// Pages are one-based; the backend's zero-based section pages are
/// converted before a target is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavigationTarget {
    pub page: u32,
    pub x: f32,
    pub y: f32,
}

impl NavigationTarget {
    pub fn page_top(page: u32) -> Self {
        Self {
            page: page.max(1),
            x: 0.0,
            y: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    SectionSearch,
    InsightGeneration,
    PodcastSynthesis,
}

impl JobKind {
    pub fn panel(self) -> Panel {
        match self {
            JobKind::SectionSearch => Panel::Sections,
            JobKind::InsightGeneration => Panel::Insights,
            JobKind::PodcastSynthesis => Panel::Podcast,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum JobState {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed(String),
}

impl JobState {
    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    Sections,
    Insights,
    Podcast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionMatch {
    pub document: String,
    /// Zero-based page index as delivered by the backend.
    pub page_number: u32,
    #[serde(default)]
    pub section_title: String,
    #[serde(default)]
    pub refined_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightBundle {
    pub key_insights: Vec<String>,
    pub did_you_know: Vec<String>,
    pub counterpoints: Vec<String>,
}

impl InsightBundle {
    pub fn is_empty(&self) -> bool {
        self.key_insights.is_empty()
            && self.did_you_know.is_empty()
            && self.counterpoints.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PrimaryChanged(Option<DocumentId>),
    PriorAdded(DocumentId),
    PriorRemoved(DocumentId),
    DisplayChanged(DocumentId),
    PanelChanged(Option<Panel>),
    JobFinished { kind: JobKind, ok: bool },
}

/// Capability handle over one externally rendered viewer instance. A bridge
/// is bound to exactly one document for its lifetime; switching documents
/// means discarding the bridge and attaching a new one.
#[async_trait]
pub trait ViewerBridge: Send + Sync {
    fn document_id(&self) -> DocumentId;
    fn is_ready(&self) -> bool;
    /// Best-effort page query; falls back to page 1 rather than failing.
    async fn current_page(&self) -> u32;
    async fn selected_text(&self) -> Option<String>;
    async fn navigate_to(&self, target: NavigationTarget) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>, name: &str) -> Result<DocumentId>;
    async fn get(&self, id: DocumentId) -> Result<Option<StoredBlob>>;
}

#[derive(Debug, Clone, Default)]
struct JobTable {
    section_search: JobState,
    insight_generation: JobState,
    podcast_synthesis: JobState,
}

impl JobTable {
    fn get(&self, kind: JobKind) -> &JobState {
        match kind {
            JobKind::SectionSearch => &self.section_search,
            JobKind::InsightGeneration => &self.insight_generation,
            JobKind::PodcastSynthesis => &self.podcast_synthesis,
        }
    }

    fn get_mut(&mut self, kind: JobKind) -> &mut JobState {
        match kind {
            JobKind::SectionSearch => &mut self.section_search,
            JobKind::InsightGeneration => &mut self.insight_generation,
            JobKind::PodcastSynthesis => &mut self.podcast_synthesis,
        }
    }

    fn any_running(&self) -> bool {
        self.section_search.is_running()
            || self.insight_generation.is_running()
            || self.podcast_synthesis.is_running()
    }
}

// Sessions that never drain still keep the most recent entries.
const EVENT_LOG_CAP: usize = 256;

#[derive(Debug, Default)]
struct SessionState {
    primary: Option<DocumentRecord>,
    priors: Vec<DocumentRecord>,
    displayed: Option<DocumentId>,
    last_known_page: u32,
    pending_target: Option<NavigationTarget>,
    active_panel: Option<Panel>,
    jobs: JobTable,
    sections: Vec<SectionMatch>,
    insights: Option<InsightBundle>,
    podcast_audio: Option<Bytes>,
    upload_progress: HashMap<DocumentId, u8>,
    events: Vec<SessionEvent>,
}

impl SessionState {
    fn initial() -> Self {
        Self {
            last_known_page: 1,
            ..Self::default()
        }
    }

    fn record(&self, id: DocumentId) -> Option<&DocumentRecord> {
        self.primary
            .as_ref()
            .filter(|r| r.id == id)
            .or_else(|| self.priors.iter().find(|r| r.id == id))
    }

    fn push_event(&mut self, event: SessionEvent) {
        if self.events.len() == EVENT_LOG_CAP {
            self.events.remove(0);
        }
        self.events.push(event);
    }

    fn clear_result(&mut self, kind: JobKind) {
        match kind {
            JobKind::SectionSearch => self.sections.clear(),
            JobKind::InsightGeneration => self.insights = None,
            JobKind::PodcastSynthesis => self.podcast_audio = None,
        }
    }

    // Insights and podcast results are scoped to the primary document;
    // section-search results come from an ad-hoc selection and survive.
    fn invalidate_primary_scoped(&mut self) {
        self.jobs.insight_generation = JobState::Idle;
        self.jobs.podcast_synthesis = JobState::Idle;
        self.insights = None;
        self.podcast_audio = None;
    }
}

/// The single process-wide state container. Every component mutates the
/// session through these operations; each one is atomic with respect to the
/// cooperative single-threaded execution model.
pub struct SessionStore {
    inner: Mutex<SessionState>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionState::initial()),
        }
    }

    /// Restores the initial state. Refused while any job is running so an
    /// in-flight result can never land in a freshly reset session.
    pub fn reset(&self) -> Result<(), SessionError> {
        let mut state = self.inner.lock();
        if state.jobs.any_running() {
            return Err(SessionError::Busy);
        }
        *state = SessionState::initial();
        Ok(())
    }

    // ---- document set ----

    pub fn set_primary(&self, id: DocumentId, name: impl Into<String>) -> DocumentRecord {
        let mut state = self.inner.lock();
        if let Some(mut previous) = state.primary.take() {
            previous.role = DocumentRole::Prior;
            if !state.priors.iter().any(|r| r.id == previous.id) {
                state.priors.push(previous);
            }
        }
        let record = DocumentRecord {
            id,
            name: name.into(),
            role: DocumentRole::Primary,
        };
        state.primary = Some(record.clone());
        state.displayed = Some(id);
        state.last_known_page = 1;
        state.invalidate_primary_scoped();
        state.push_event(SessionEvent::PrimaryChanged(Some(id)));
        state.push_event(SessionEvent::DisplayChanged(id));
        debug!(%id, name = %record.name, "primary document set");
        record
    }

    /// Appends a prior document. Idempotent by id: a second add of a known
    /// document returns the existing record and changes nothing.
    pub fn add_prior(&self, id: DocumentId, name: impl Into<String>) -> DocumentRecord {
        let mut state = self.inner.lock();
        if let Some(existing) = state.record(id) {
            return existing.clone();
        }
        let record = DocumentRecord {
            id,
            name: name.into(),
            role: DocumentRole::Prior,
        };
        state.priors.push(record.clone());
        state.push_event(SessionEvent::PriorAdded(id));
        record
    }

    /// Removes a prior document and its upload-progress entry. A no-op when
    /// the id does not name a prior record. If the removed document was the
    /// one being displayed, the display falls back to the primary document.
    pub fn remove_prior(&self, id: DocumentId) {
        let mut state = self.inner.lock();
        let Some(pos) = state.priors.iter().position(|r| r.id == id) else {
            return;
        };
        state.priors.remove(pos);
        state.upload_progress.remove(&id);
        state.push_event(SessionEvent::PriorRemoved(id));
        if state.displayed == Some(id) {
            state.pending_target = None;
            state.displayed = state.primary.as_ref().map(|r| r.id);
            if let Some(primary_id) = state.displayed {
                state.push_event(SessionEvent::DisplayChanged(primary_id));
            }
        }
    }

    /// Clears the primary document, keeping the prior list. Cached insights
    /// are scoped to the primary and are dropped with it.
    pub fn clear_primary(&self) {
        let mut state = self.inner.lock();
        let Some(previous) = state.primary.take() else {
            return;
        };
        state.upload_progress.remove(&previous.id);
        state.jobs.insight_generation = JobState::Idle;
        state.insights = None;
        state.push_event(SessionEvent::PrimaryChanged(None));
    }

    pub async fn upload_primary(
        &self,
        blobs: &dyn BlobStore,
        bytes: Vec<u8>,
        name: &str,
    ) -> Result<DocumentRecord> {
        let id = blobs.put(bytes, name).await?;
        self.begin_upload(id);
        Ok(self.set_primary(id, name))
    }

    pub async fn upload_prior(
        &self,
        blobs: &dyn BlobStore,
        bytes: Vec<u8>,
        name: &str,
    ) -> Result<DocumentRecord> {
        let id = blobs.put(bytes, name).await?;
        self.begin_upload(id);
        Ok(self.add_prior(id, name))
    }

    pub fn primary(&self) -> Option<DocumentRecord> {
        self.inner.lock().primary.clone()
    }

    pub fn priors(&self) -> Vec<DocumentRecord> {
        self.inner.lock().priors.clone()
    }

    /// Resolves a backend-reported document name against the session's
    /// records. Names are normalized on both sides so `Report V2.pdf` and
    /// `report_v2.pdf` refer to the same record.
    pub fn resolve_document(&self, name: &str) -> Result<DocumentRecord, SessionError> {
        let wanted = normalize_document_name(name);
        let state = self.inner.lock();
        state
            .priors
            .iter()
            .find(|r| normalize_document_name(&r.name) == wanted)
            .or_else(|| {
                state
                    .primary
                    .as_ref()
                    .filter(|r| normalize_document_name(&r.name) == wanted)
            })
            .cloned()
            .ok_or_else(|| SessionError::NotFound(name.to_string()))
    }

    // ---- navigation ----

    pub fn displayed_document(&self) -> Option<DocumentId> {
        self.inner.lock().displayed
    }

    pub fn last_known_page(&self) -> u32 {
        self.inner.lock().last_known_page
    }

    pub fn record_last_page(&self, page: u32) {
        self.inner.lock().last_known_page = page.max(1);
    }

    pub fn pending_target(&self) -> Option<NavigationTarget> {
        self.inner.lock().pending_target
    }

    /// Consumes the pending target. At most one consumer ever observes a
    /// given target instance; an overwritten target is simply dropped.
    pub fn take_pending_target(&self) -> Option<NavigationTarget> {
        self.inner.lock().pending_target.take()
    }

    pub fn set_pending_target(&self, target: NavigationTarget) {
        self.inner.lock().pending_target = Some(target);
    }

    pub fn clear_pending_target(&self) {
        self.inner.lock().pending_target = None;
    }

    /// Requests a jump to `target` inside `document_id`. When the document
    /// is already displayed and its bridge is ready the jump happens
    /// immediately; otherwise the display switches and the target is left
    /// pending for the next bridge to consume on its readiness transition.
    pub async fn request_jump(
        &self,
        bridge: Option<&dyn ViewerBridge>,
        document_id: DocumentId,
        target: NavigationTarget,
    ) -> Result<(), SessionError> {
        let (known, displayed) = {
            let state = self.inner.lock();
            (state.record(document_id).is_some(), state.displayed)
        };
        if !known {
            return Err(SessionError::NotFound(document_id.to_string()));
        }

        if displayed == Some(document_id) {
            if let Some(bridge) =
                bridge.filter(|b| b.document_id() == document_id && b.is_ready())
            {
                if let Err(err) = bridge.navigate_to(target).await {
                    // best-effort; never retried
                    warn!(?err, page = target.page, "viewer navigation failed");
                }
                return Ok(());
            }
            self.set_pending_target(target);
            return Ok(());
        }

        let mut state = self.inner.lock();
        state.displayed = Some(document_id);
        state.pending_target = Some(target);
        state.push_event(SessionEvent::DisplayChanged(document_id));
        Ok(())
    }

    /// Jumps back to the primary document at the page the user was on
    /// before the last cross-document jump.
    pub async fn return_to_primary(
        &self,
        bridge: Option<&dyn ViewerBridge>,
    ) -> Result<(), SessionError> {
        let (primary_id, page) = {
            let state = self.inner.lock();
            let Some(primary) = state.primary.as_ref() else {
                return Err(SessionError::MissingPrimary);
            };
            (primary.id, state.last_known_page)
        };
        self.request_jump(bridge, primary_id, NavigationTarget::page_top(page))
            .await
    }

    // ---- upload progress ----

    pub fn begin_upload(&self, id: DocumentId) {
        self.inner.lock().upload_progress.insert(id, 0);
    }

    /// Applies a progress update. Updates are monotonic per id: regressions
    /// and anything after the terminal 100 are ignored, as are unknown ids.
    pub fn apply_upload_progress(&self, id: DocumentId, percent: u8) {
        let mut state = self.inner.lock();
        let Some(current) = state.upload_progress.get_mut(&id) else {
            return;
        };
        if *current >= 100 {
            return;
        }
        let next = percent.min(100);
        if next > *current {
            *current = next;
        }
    }

    pub fn finish_upload(&self, id: DocumentId) {
        self.apply_upload_progress(id, 100);
    }

    pub fn upload_progress(&self, id: DocumentId) -> Option<u8> {
        self.inner.lock().upload_progress.get(&id).copied()
    }

    pub fn is_upload_complete(&self, id: DocumentId) -> bool {
        self.upload_progress(id) == Some(100)
    }

    // ---- jobs and panels ----

    pub fn job_state(&self, kind: JobKind) -> JobState {
        self.inner.lock().jobs.get(kind).clone()
    }

    pub fn any_job_running(&self) -> bool {
        self.inner.lock().jobs.any_running()
    }

    /// Acquires the process-wide single-flight lock for `kind`, clears its
    /// previous result and opens its panel. Fails `Busy` when any job of
    /// any kind is already running.
    pub fn try_begin_job(&self, kind: JobKind) -> Result<(), SessionError> {
        let mut state = self.inner.lock();
        if state.jobs.any_running() {
            return Err(SessionError::Busy);
        }
        *state.jobs.get_mut(kind) = JobState::Running;
        state.clear_result(kind);
        state.active_panel = Some(kind.panel());
        state
            .events
            .push(SessionEvent::PanelChanged(Some(kind.panel())));
        Ok(())
    }

    pub fn record_job_success(&self, kind: JobKind) {
        let mut state = self.inner.lock();
        *state.jobs.get_mut(kind) = JobState::Succeeded;
        state.push_event(SessionEvent::JobFinished { kind, ok: true });
    }

    /// Marks the job failed and closes its panel; a failed job never keeps
    /// an empty panel open.
    pub fn record_job_failure(&self, kind: JobKind, message: impl Into<String>) {
        let mut state = self.inner.lock();
        *state.jobs.get_mut(kind) = JobState::Failed(message.into());
        state.active_panel = None;
        state.push_event(SessionEvent::JobFinished { kind, ok: false });
        state.push_event(SessionEvent::PanelChanged(None));
    }

    pub fn active_panel(&self) -> Option<Panel> {
        self.inner.lock().active_panel
    }

    pub fn set_active_panel(&self, panel: Option<Panel>) {
        let mut state = self.inner.lock();
        if state.active_panel != panel {
            state.active_panel = panel;
            state.push_event(SessionEvent::PanelChanged(panel));
        }
    }

    // ---- analysis results ----

    pub fn set_sections(&self, sections: Vec<SectionMatch>) {
        self.inner.lock().sections = sections;
    }

    pub fn sections(&self) -> Vec<SectionMatch> {
        self.inner.lock().sections.clone()
    }

    pub fn set_insights(&self, insights: InsightBundle) {
        self.inner.lock().insights = Some(insights);
    }

    pub fn insights(&self) -> Option<InsightBundle> {
        self.inner.lock().insights.clone()
    }

    pub fn set_podcast_audio(&self, audio: Bytes) {
        self.inner.lock().podcast_audio = Some(audio);
    }

    pub fn podcast_audio(&self) -> Option<Bytes> {
        self.inner.lock().podcast_audio.clone()
    }

    pub fn drain_events(&self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.inner.lock().events)
    }
}

/// Collapses a document name to the backend's canonical form: final path
/// segment, lowercased, runs of non-alphanumerics folded to `_`, with a
/// `.pdf` suffix. Idempotent, so already-normalized backend names pass
/// through unchanged.
pub fn normalize_document_name(name: &str) -> String {
    let filename = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .to_lowercase();
    let base = filename.strip_suffix(".pdf").unwrap_or(&filename);

    let mut out = String::with_capacity(base.len());
    let mut gap = false;
    for ch in base.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            gap = false;
        } else if !gap {
            out.push('_');
            gap = true;
        }
    }
    format!("{}.pdf", out.trim_matches('_'))
}

pub struct MemoryBlobStore {
    inner: Mutex<HashMap<DocumentId, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>, name: &str) -> Result<DocumentId> {
        let id = Uuid::new_v4();
        self.inner.lock().insert(
            id,
            StoredBlob {
                name: name.to_owned(),
                bytes,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: DocumentId) -> Result<Option<StoredBlob>> {
        Ok(self.inner.lock().get(&id).cloned())
    }
}

#[derive(Serialize, Deserialize)]
struct BlobMetadata {
    name: String,
}

/// Blob store backed by a directory: one `<id>.bin` payload plus an
/// `<id>.json` metadata sidecar per document. Entries are immutable once
/// written.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create blob directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn payload_path(&self, id: DocumentId) -> PathBuf {
        self.root.join(format!("{}.bin", id))
    }

    fn metadata_path(&self, id: DocumentId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, bytes: Vec<u8>, name: &str) -> Result<DocumentId> {
        let id = Uuid::new_v4();
        let payload = self.payload_path(id);
        let tmp = payload.with_extension("bin.tmp");
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create blob file {:?}", tmp))?;
        file.write_all(&bytes)?;
        file.flush()?;
        fs::rename(tmp, payload)?;

        let metadata = serde_json::to_string(&BlobMetadata {
            name: name.to_owned(),
        })?;
        fs::write(self.metadata_path(id), metadata)?;
        Ok(id)
    }

    async fn get(&self, id: DocumentId) -> Result<Option<StoredBlob>> {
        let payload = self.payload_path(id);
        if !payload.exists() {
            return Ok(None);
        }
        let mut bytes = Vec::new();
        File::open(&payload)
            .with_context(|| format!("failed to open blob file {:?}", payload))?
            .read_to_end(&mut bytes)?;
        let metadata: BlobMetadata =
            serde_json::from_str(&fs::read_to_string(self.metadata_path(id))?)
                .with_context(|| format!("failed to decode blob metadata for {}", id))?;
        Ok(Some(StoredBlob {
            name: metadata.name,
            bytes,
        }))
    }
}
