use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use docuhub_core::{
    BlobStore, InsightBundle, JobKind, NavigationTarget, Panel, SectionMatch, SessionError,
    SessionStore, ViewerBridge,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

const SESSION_HEADER: &str = "X-Session-Id";

/// One file handed to the backend for a session upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Insight payload exactly as the backend returns it: each field is either
/// a JSON-encoded array of strings or an already-decoded array, and any of
/// them may be malformed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawInsights {
    #[serde(default)]
    pub key_insights: Value,
    #[serde(default)]
    pub did_you_know: Value,
    #[serde(default)]
    pub counterpoints: Value,
}

#[derive(Debug, Deserialize)]
struct SectionsEnvelope {
    #[serde(default)]
    extracted_sections: Vec<SectionMatch>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    detail: String,
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn upload_documents(&self, current: UploadFile, past: Vec<UploadFile>) -> Result<()>;
    async fn find_relevant_sections(&self, selected_text: &str) -> Result<Vec<SectionMatch>>;
    async fn get_insights(&self) -> Result<RawInsights>;
    async fn generate_podcast(&self) -> Result<Bytes>;
}

/// HTTP implementation of the analysis backend. Every call carries the
/// opaque session id header; the backend scopes uploaded documents and
/// analysis results to it.
pub struct HttpAnalysisBackend {
    client: reqwest::Client,
    base_url: reqwest::Url,
    session_id: String,
}

impl HttpAnalysisBackend {
    pub fn new(base_url: reqwest::Url, session_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url,
            session_id: session_id.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<reqwest::Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid backend endpoint {:?}", path))
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    async fn upload_documents(&self, current: UploadFile, past: Vec<UploadFile>) -> Result<()> {
        let mut form = reqwest::multipart::Form::new().part(
            "files_current",
            reqwest::multipart::Part::bytes(current.bytes)
                .file_name(current.name)
                .mime_str("application/pdf")?,
        );
        for file in past {
            form = form.part(
                "files_past",
                reqwest::multipart::Part::bytes(file.bytes)
                    .file_name(file.name)
                    .mime_str("application/pdf")?,
            );
        }

        let response = self
            .client
            .post(self.endpoint("api/upload_documents/")?)
            .header(SESSION_HEADER, &self.session_id)
            .multipart(form)
            .send()
            .await
            .context("document upload request failed")?;
        if !response.status().is_success() {
            bail!("server error: {}", response.status());
        }
        Ok(())
    }

    async fn find_relevant_sections(&self, selected_text: &str) -> Result<Vec<SectionMatch>> {
        let form = reqwest::multipart::Form::new().text("selected_text", selected_text.to_owned());
        let response = self
            .client
            .post(self.endpoint("api/find_relevant_sections/")?)
            .header(SESSION_HEADER, &self.session_id)
            .multipart(form)
            .send()
            .await
            .context("section search request failed")?;
        if !response.status().is_success() {
            bail!("server error: {}", response.status());
        }
        let envelope: SectionsEnvelope = response
            .json()
            .await
            .context("failed to decode section search response")?;
        Ok(envelope.extracted_sections)
    }

    async fn get_insights(&self) -> Result<RawInsights> {
        let response = self
            .client
            .get(self.endpoint("api/get_insights/")?)
            .header(SESSION_HEADER, &self.session_id)
            .send()
            .await
            .context("insight request failed")?;
        if !response.status().is_success() {
            bail!("server error: {}", response.status());
        }
        response
            .json()
            .await
            .context("failed to decode insight response")
    }

    async fn generate_podcast(&self) -> Result<Bytes> {
        let response = self
            .client
            .get(self.endpoint("api/generate_audio_podcast/")?)
            .header(SESSION_HEADER, &self.session_id)
            .send()
            .await
            .context("podcast request failed")?;
        let status = response.status();
        if !status.is_success() {
            // failed synthesis carries a JSON body with a detail message
            if let Ok(error) = response.json::<ErrorDetail>().await {
                bail!("{}", error.detail);
            }
            bail!("server error: {}", status);
        }
        response
            .bytes()
            .await
            .context("failed to read podcast audio stream")
    }
}

/// Decodes the backend's insight payload, degrading per field: a field
/// that fails to decode yields an empty list while the others still
/// render.
pub fn decode_insights(raw: &RawInsights) -> InsightBundle {
    InsightBundle {
        key_insights: decode_insight_field("key_insights", &raw.key_insights),
        did_you_know: decode_insight_field("did_you_know", &raw.did_you_know),
        counterpoints: decode_insight_field("counterpoints", &raw.counterpoints),
    }
}

fn decode_insight_field(name: &str, value: &Value) -> Vec<String> {
    let items: Vec<String> = match value {
        Value::Null => return Vec::new(),
        Value::String(encoded) => match serde_json::from_str(encoded) {
            Ok(items) => items,
            Err(err) => {
                warn!(field = name, %err, "discarding malformed insight field");
                return Vec::new();
            }
        },
        Value::Array(values) => values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect(),
        other => {
            warn!(field = name, kind = ?other, "unexpected insight field shape");
            return Vec::new();
        }
    };
    items.iter().map(|item| clean_insight_text(item)).collect()
}

// The backend occasionally leaves literal "\n" escapes inside items.
fn clean_insight_text(text: &str) -> String {
    text.replace("\\n", " ").trim().to_owned()
}

/// How a job invocation concluded without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The backend was called and the result stored.
    Completed,
    /// The kind's panel was already open; it was closed and nothing ran.
    PanelClosed,
    /// A cached result was shown without a new backend call.
    CachedShown,
}

/// Holds the single-flight lock for one job. The lock is released on every
/// exit path: `succeed`/`fail` consume the guard, and dropping it mid-run
/// (a cancelled future, a panic) records the job as failed instead of
/// leaving it `Running` forever.
struct JobGuard {
    store: Arc<SessionStore>,
    kind: JobKind,
    finished: bool,
}

impl JobGuard {
    fn begin(store: &Arc<SessionStore>, kind: JobKind) -> Result<Self, SessionError> {
        store.try_begin_job(kind)?;
        Ok(Self {
            store: Arc::clone(store),
            kind,
            finished: false,
        })
    }

    fn succeed(mut self) {
        self.store.record_job_success(self.kind);
        self.finished = true;
    }

    fn fail(mut self, message: &str) {
        self.store.record_job_failure(self.kind, message);
        self.finished = true;
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.store
                .record_job_failure(self.kind, "job interrupted before completion");
        }
    }
}

/// Drives the three analysis job kinds against the backend, enforcing the
/// process-wide single-flight lock and the panel toggle shortcut on top of
/// the session store.
pub struct AnalysisOrchestrator {
    store: Arc<SessionStore>,
    backend: Arc<dyn AnalysisBackend>,
}

impl AnalysisOrchestrator {
    pub fn new(store: Arc<SessionStore>, backend: Arc<dyn AnalysisBackend>) -> Self {
        Self { store, backend }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Sends the session's primary and prior documents to the backend.
    /// Must precede any analysis call for the session.
    pub async fn upload_documents(&self, blobs: &dyn BlobStore) -> Result<(), SessionError> {
        let primary = self.store.primary().ok_or(SessionError::MissingPrimary)?;
        let current = match blobs.get(primary.id).await {
            Ok(Some(blob)) => UploadFile {
                name: blob.name,
                bytes: blob.bytes,
            },
            Ok(None) => return Err(SessionError::NotFound(primary.name)),
            Err(err) => return Err(SessionError::Transport(format!("{err:#}"))),
        };

        let mut past = Vec::new();
        for prior in self.store.priors() {
            match blobs.get(prior.id).await {
                Ok(Some(blob)) => past.push(UploadFile {
                    name: blob.name,
                    bytes: blob.bytes,
                }),
                Ok(None) => warn!(name = %prior.name, "prior document missing from blob store"),
                Err(err) => return Err(SessionError::Transport(format!("{err:#}"))),
            }
        }

        self.backend
            .upload_documents(current, past)
            .await
            .map_err(|err| SessionError::Transport(format!("{err:#}")))
    }

    /// Finds sections relevant to the viewer's current text selection.
    #[instrument(skip(self, bridge))]
    pub async fn run_section_search(
        &self,
        bridge: &dyn ViewerBridge,
    ) -> Result<JobOutcome, SessionError> {
        if self.store.any_job_running() {
            return Err(SessionError::Busy);
        }
        if self.store.active_panel() == Some(Panel::Sections) {
            self.store.set_active_panel(None);
            return Ok(JobOutcome::PanelClosed);
        }
        if !bridge.is_ready() {
            return Err(SessionError::ViewerNotReady);
        }
        let selected = bridge
            .selected_text()
            .await
            .filter(|text| !text.trim().is_empty())
            .ok_or(SessionError::NoSelection)?;

        // remember where the user was so "go back to original" can restore it
        let page = bridge.current_page().await;
        self.store.record_last_page(page);

        let guard = JobGuard::begin(&self.store, JobKind::SectionSearch)?;
        match self.backend.find_relevant_sections(&selected).await {
            Ok(sections) => {
                debug!(count = sections.len(), "section search finished");
                self.store.set_sections(sections);
                guard.succeed();
                Ok(JobOutcome::Completed)
            }
            Err(err) => {
                let message = format!("{err:#}");
                guard.fail(&message);
                Err(SessionError::Transport(message))
            }
        }
    }

    /// Generates structured insights for the primary document. A result
    /// cached for the current primary is shown again without a new call.
    #[instrument(skip(self))]
    pub async fn run_insight_generation(&self) -> Result<JobOutcome, SessionError> {
        if self.store.primary().is_none() {
            return Err(SessionError::MissingPrimary);
        }
        if self.store.any_job_running() {
            return Err(SessionError::Busy);
        }
        if self.store.active_panel() == Some(Panel::Insights) {
            self.store.set_active_panel(None);
            return Ok(JobOutcome::PanelClosed);
        }
        if self.store.insights().is_some() {
            self.store.set_active_panel(Some(Panel::Insights));
            return Ok(JobOutcome::CachedShown);
        }

        let guard = JobGuard::begin(&self.store, JobKind::InsightGeneration)?;
        match self.backend.get_insights().await {
            Ok(raw) => {
                self.store.set_insights(decode_insights(&raw));
                guard.succeed();
                Ok(JobOutcome::Completed)
            }
            Err(err) => {
                let message = format!("{err:#}");
                guard.fail(&message);
                Err(SessionError::Transport(message))
            }
        }
    }

    /// Synthesizes an audio summary of the primary document.
    #[instrument(skip(self))]
    pub async fn run_podcast_synthesis(&self) -> Result<JobOutcome, SessionError> {
        if self.store.primary().is_none() {
            return Err(SessionError::MissingPrimary);
        }
        if self.store.any_job_running() {
            return Err(SessionError::Busy);
        }
        if self.store.active_panel() == Some(Panel::Podcast) {
            self.store.set_active_panel(None);
            return Ok(JobOutcome::PanelClosed);
        }

        let guard = JobGuard::begin(&self.store, JobKind::PodcastSynthesis)?;
        match self.backend.generate_podcast().await {
            Ok(audio) => {
                debug!(bytes = audio.len(), "podcast audio received");
                self.store.set_podcast_audio(audio);
                guard.succeed();
                Ok(JobOutcome::Completed)
            }
            Err(err) => {
                let message = format!("{err:#}");
                guard.fail(&message);
                Err(SessionError::Transport(message))
            }
        }
    }

    /// Jumps the viewer to a section match, remembering the page the user
    /// was on first. The backend reports zero-based pages; targets are
    /// one-based.
    pub async fn navigate_to_section(
        &self,
        bridge: &dyn ViewerBridge,
        section: &SectionMatch,
    ) -> Result<(), SessionError> {
        let page = bridge.current_page().await;
        self.store.record_last_page(page);

        let record = self.store.resolve_document(&section.document)?;
        let target = NavigationTarget::page_top(section.page_number.saturating_add(1));
        self.store
            .request_jump(Some(bridge), record.id, target)
            .await
    }
}
