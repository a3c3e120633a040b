use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use directories::ProjectDirs;
use docuhub_analysis::{AnalysisBackend, AnalysisOrchestrator, HttpAnalysisBackend};
use docuhub_core::{DocumentId, FileBlobStore, InsightBundle, SessionStore};
use docuhub_viewer::{EmbeddedViewer, EmbeddedViewerBridge, SelectedContent};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "docuhub",
    version,
    about = "session-scoped document analysis client"
)]
struct Args {
    /// Analysis backend base URL
    #[arg(long, default_value = "http://localhost:8000/")]
    backend: Url,

    /// Session identifier; a fresh one is generated when omitted
    #[arg(long)]
    session: Option<String>,

    /// Current (primary) document
    current: PathBuf,

    /// Past versions uploaded for comparison
    #[arg(short = 'p', long = "past")]
    past: Vec<PathBuf>,

    /// Page the viewer reports as currently displayed
    #[arg(long, default_value_t = 1)]
    page: u32,

    /// Search the uploaded documents for sections relevant to this text,
    /// as if it were selected in the viewer
    #[arg(long, value_name = "TEXT")]
    select: Option<String>,

    /// Generate insights for the primary document and print them
    #[arg(long)]
    insights: bool,

    /// Synthesize the audio summary and write it to this file
    #[arg(long, value_name = "FILE")]
    podcast: Option<PathBuf>,
}

/// Headless stand-in for the embeddable viewer so the orchestration flow
/// can run end to end from a terminal: the "selection" comes from the
/// command line and jumps are logged instead of rendered.
struct ScriptedViewer {
    page: u32,
    selection: Option<String>,
}

#[async_trait]
impl EmbeddedViewer for ScriptedViewer {
    async fn initialize(&self, container_id: &str, _document_bytes: &[u8]) -> Result<()> {
        debug!(container_id, "scripted viewer initialized");
        Ok(())
    }

    async fn get_current_page(&self) -> Result<u32> {
        Ok(self.page)
    }

    async fn get_selected_content(&self) -> Result<Option<SelectedContent>> {
        Ok(self.selection.clone().map(SelectedContent::text))
    }

    async fn goto_location(&self, page: u32, x: f32, y: f32) -> Result<()> {
        info!(page, x, y, "viewer jump requested");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "docuhub", "docuhub")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let session_id = args
        .session
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(session = %session_id, backend = %args.backend, "starting session");

    let blobs = FileBlobStore::new(project_dirs.data_local_dir().join("blobs"))?;
    let store = Arc::new(SessionStore::new());

    let current_name = file_name(&args.current)?;
    let current_bytes = fs::read(&args.current)
        .with_context(|| format!("failed to read {:?}", args.current))?;
    let primary = store
        .upload_primary(&blobs, current_bytes.clone(), &current_name)
        .await?;

    let mut progress = vec![tokio::spawn(simulate_upload_progress(
        Arc::clone(&store),
        primary.id,
    ))];
    for path in &args.past {
        let name = file_name(path)?;
        let bytes = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
        let record = store.upload_prior(&blobs, bytes, &name).await?;
        progress.push(tokio::spawn(simulate_upload_progress(
            Arc::clone(&store),
            record.id,
        )));
    }
    for task in progress {
        task.await?;
    }

    let backend: Arc<dyn AnalysisBackend> =
        Arc::new(HttpAnalysisBackend::new(args.backend.clone(), session_id)?);
    let orchestrator = AnalysisOrchestrator::new(Arc::clone(&store), backend);

    orchestrator.upload_documents(&blobs).await?;
    info!(
        priors = store.priors().len(),
        "documents are ready for analysis"
    );
    log_session_events(&store);

    if let Some(text) = &args.select {
        let viewer = Arc::new(ScriptedViewer {
            page: args.page.max(1),
            selection: Some(text.clone()),
        });
        let bridge = EmbeddedViewerBridge::new(
            Arc::clone(&store),
            viewer as Arc<dyn EmbeddedViewer>,
            primary.id,
        );
        bridge
            .open(&format!("docuhub-viewer-{}", primary.id), &current_bytes)
            .await?;

        orchestrator.run_section_search(&bridge).await?;
        let sections = store.sections();
        if sections.is_empty() {
            println!("No relevant sections found for the selection.");
        } else {
            for section in &sections {
                println!(
                    "{} — page {} — {}",
                    section.document,
                    section.page_number + 1,
                    if section.section_title.is_empty() {
                        "(untitled)"
                    } else {
                        section.section_title.as_str()
                    }
                );
                if !section.refined_text.is_empty() {
                    println!("    {}", section.refined_text);
                }
            }
            orchestrator
                .navigate_to_section(&bridge, &sections[0])
                .await?;
            if let Some(target) = store.pending_target() {
                info!(
                    page = target.page,
                    "display switched; target pending for the next viewer"
                );
            }
        }
        log_session_events(&store);
    }

    if args.insights {
        orchestrator.run_insight_generation().await?;
        match store.insights() {
            Some(bundle) if !bundle.is_empty() => print_insights(&bundle),
            _ => println!("No insights were generated."),
        }
    }

    if let Some(path) = &args.podcast {
        orchestrator.run_podcast_synthesis().await?;
        let audio = store
            .podcast_audio()
            .ok_or_else(|| anyhow!("podcast synthesis returned no audio"))?;
        fs::write(path, &audio).with_context(|| format!("failed to write {:?}", path))?;
        println!("Podcast audio written to {:?} ({} bytes).", path, audio.len());
    }
    log_session_events(&store);

    Ok(())
}

fn log_session_events(store: &SessionStore) {
    for event in store.drain_events() {
        debug!(?event, "session event");
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("{:?} has no usable file name", path))
}

/// Fixed-increment stand-in for transport-level progress reporting. Kept
/// behind the store's progress interface so a real transport can replace
/// it without touching the document flow.
async fn simulate_upload_progress(store: Arc<SessionStore>, id: DocumentId) {
    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    loop {
        ticker.tick().await;
        let Some(current) = store.upload_progress(id) else {
            return;
        };
        if current >= 100 {
            return;
        }
        store.apply_upload_progress(id, current.saturating_add(10));
    }
}

fn print_insights(bundle: &InsightBundle) {
    print_insight_group("Key Insights", &bundle.key_insights);
    print_insight_group("Did You Know?", &bundle.did_you_know);
    print_insight_group("Counterpoints", &bundle.counterpoints);
}

fn print_insight_group(title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("{title}:");
    for item in items {
        println!("  - {item}");
    }
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "docuhub.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
