use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use docuhub_core::{DocumentId, NavigationTarget, SessionStore, ViewerBridge};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Capability surface of the external embeddable viewer SDK. Implemented
/// by whatever hosts the real viewer; the rest of the system only ever
/// talks to it through [`EmbeddedViewerBridge`].
#[async_trait]
pub trait EmbeddedViewer: Send + Sync {
    async fn initialize(&self, container_id: &str, document_bytes: &[u8]) -> Result<()>;
    async fn get_current_page(&self) -> Result<u32>;
    async fn get_selected_content(&self) -> Result<Option<SelectedContent>>;
    async fn goto_location(&self, page: u32, x: f32, y: f32) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SelectedContent {
    pub kind: String,
    pub data: String,
}

impl SelectedContent {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            data: data.into(),
        }
    }
}

/// Bridge over one external viewer instance, bound to a single document
/// for its lifetime. Switching documents means dropping the bridge and
/// attaching a fresh one; there is no in-place rebinding.
///
/// Construction is asynchronous: capability calls are refused until the
/// external viewer signals initialization through [`mark_ready`]. Each
/// bridge resolves its own readiness independently, so a stale instance
/// can never consume a target meant for its successor.
///
/// [`mark_ready`]: EmbeddedViewerBridge::mark_ready
pub struct EmbeddedViewerBridge {
    document_id: DocumentId,
    store: Arc<SessionStore>,
    viewer: Arc<dyn EmbeddedViewer>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl EmbeddedViewerBridge {
    pub fn new(
        store: Arc<SessionStore>,
        viewer: Arc<dyn EmbeddedViewer>,
        document_id: DocumentId,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            document_id,
            store,
            viewer,
            ready_tx,
            ready_rx,
        }
    }

    /// Initializes the external viewer and flips this bridge ready.
    pub async fn open(&self, container_id: &str, document_bytes: &[u8]) -> Result<()> {
        self.viewer
            .initialize(container_id, document_bytes)
            .await
            .with_context(|| format!("failed to initialize viewer for {}", self.document_id))?;
        self.mark_ready().await;
        Ok(())
    }

    /// Records the external viewer's readiness signal. On the transition a
    /// pending navigation target is consumed exactly once: it is taken
    /// from the store before the jump, so it is cleared on success and
    /// failure alike. Later calls are no-ops; a bridge has one readiness
    /// transition.
    pub async fn mark_ready(&self) {
        if *self.ready_rx.borrow() {
            return;
        }
        let _ = self.ready_tx.send(true);
        debug!(document = %self.document_id, "viewer bridge ready");

        // only consume a target aimed at the document this bridge shows
        if self.store.displayed_document() != Some(self.document_id) {
            return;
        }
        if let Some(target) = self.store.take_pending_target() {
            if let Err(err) = self
                .viewer
                .goto_location(target.page, target.x, target.y)
                .await
            {
                warn!(?err, page = target.page, "deferred navigation failed");
            }
        }
    }

    /// Waits until the external viewer has signalled readiness.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

#[async_trait]
impl ViewerBridge for EmbeddedViewerBridge {
    fn document_id(&self) -> DocumentId {
        self.document_id
    }

    fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    async fn current_page(&self) -> u32 {
        if !self.is_ready() {
            return 1;
        }
        match self.viewer.get_current_page().await {
            Ok(page) => page.max(1),
            Err(err) => {
                // display positions are best-effort, never fatal
                warn!(?err, "failed to query current page");
                1
            }
        }
    }

    async fn selected_text(&self) -> Option<String> {
        if !self.is_ready() {
            warn!(document = %self.document_id, "selection queried before viewer was ready");
            return None;
        }
        match self.viewer.get_selected_content().await {
            Ok(Some(content)) if content.kind == "text" && !content.data.is_empty() => {
                Some(content.data)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(?err, "failed to query selected content");
                None
            }
        }
    }

    async fn navigate_to(&self, target: NavigationTarget) -> Result<()> {
        if !self.is_ready() {
            return Err(anyhow!("viewer is not ready"));
        }
        self.viewer
            .goto_location(target.page, target.x, target.y)
            .await
            .with_context(|| format!("failed to jump to page {}", target.page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeViewer {
        page: Mutex<u32>,
        selection: Mutex<Option<SelectedContent>>,
        visited: Mutex<Vec<(u32, f32, f32)>>,
        fail_page: Mutex<bool>,
        fail_goto: Mutex<bool>,
    }

    #[async_trait]
    impl EmbeddedViewer for FakeViewer {
        async fn initialize(&self, _container_id: &str, _document_bytes: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn get_current_page(&self) -> Result<u32> {
            if *self.fail_page.lock() {
                return Err(anyhow!("page query failed"));
            }
            Ok(*self.page.lock())
        }

        async fn get_selected_content(&self) -> Result<Option<SelectedContent>> {
            Ok(self.selection.lock().clone())
        }

        async fn goto_location(&self, page: u32, x: f32, y: f32) -> Result<()> {
            if *self.fail_goto.lock() {
                return Err(anyhow!("jump rejected"));
            }
            self.visited.lock().push((page, x, y));
            Ok(())
        }
    }

    fn bridge_for(
        store: &Arc<SessionStore>,
        viewer: &Arc<FakeViewer>,
        id: DocumentId,
    ) -> EmbeddedViewerBridge {
        EmbeddedViewerBridge::new(
            Arc::clone(store),
            Arc::clone(viewer) as Arc<dyn EmbeddedViewer>,
            id,
        )
    }

    #[tokio::test]
    async fn pending_target_is_consumed_once_on_readiness() {
        let store = Arc::new(SessionStore::new());
        let record = store.set_primary(Uuid::new_v4(), "report.pdf");
        store.set_pending_target(NavigationTarget::page_top(6));

        let viewer = Arc::new(FakeViewer::default());
        let bridge = bridge_for(&store, &viewer, record.id);

        bridge.open("viewer-container", b"%PDF").await.unwrap();
        assert_eq!(viewer.visited.lock().clone(), vec![(6, 0.0, 0.0)]);
        assert!(store.pending_target().is_none());

        // a second readiness signal is a no-op
        store.set_pending_target(NavigationTarget::page_top(9));
        bridge.mark_ready().await;
        assert_eq!(viewer.visited.lock().len(), 1);
        assert_eq!(store.pending_target().unwrap().page, 9);
    }

    #[tokio::test]
    async fn failed_deferred_navigation_still_clears_the_target() {
        let store = Arc::new(SessionStore::new());
        let record = store.set_primary(Uuid::new_v4(), "report.pdf");
        store.set_pending_target(NavigationTarget::page_top(4));

        let viewer = Arc::new(FakeViewer::default());
        *viewer.fail_goto.lock() = true;
        let bridge = bridge_for(&store, &viewer, record.id);

        bridge.mark_ready().await;
        assert!(store.pending_target().is_none());
        assert!(viewer.visited.lock().is_empty());
        assert!(bridge.is_ready());
    }

    #[tokio::test]
    async fn stale_bridge_leaves_a_target_for_another_document() {
        let store = Arc::new(SessionStore::new());
        let primary = store.set_primary(Uuid::new_v4(), "a.pdf");
        let prior = store.add_prior(Uuid::new_v4(), "b.pdf");
        store
            .request_jump(None, prior.id, NavigationTarget::page_top(5))
            .await
            .unwrap();

        // the old bridge for the primary document reports ready late
        let viewer = Arc::new(FakeViewer::default());
        let stale = bridge_for(&store, &viewer, primary.id);
        stale.mark_ready().await;
        assert_eq!(store.pending_target().unwrap().page, 5);
        assert!(viewer.visited.lock().is_empty());
    }

    #[tokio::test]
    async fn capability_calls_degrade_before_readiness() {
        let store = Arc::new(SessionStore::new());
        let record = store.set_primary(Uuid::new_v4(), "report.pdf");
        let viewer = Arc::new(FakeViewer::default());
        *viewer.page.lock() = 7;
        let bridge = bridge_for(&store, &viewer, record.id);

        assert!(!bridge.is_ready());
        assert_eq!(bridge.current_page().await, 1);
        assert!(bridge.selected_text().await.is_none());
        assert!(bridge.navigate_to(NavigationTarget::page_top(2)).await.is_err());

        bridge.mark_ready().await;
        assert_eq!(bridge.current_page().await, 7);
    }

    #[tokio::test]
    async fn current_page_falls_back_to_one_on_failure() {
        let store = Arc::new(SessionStore::new());
        let record = store.set_primary(Uuid::new_v4(), "report.pdf");
        let viewer = Arc::new(FakeViewer::default());
        *viewer.fail_page.lock() = true;
        let bridge = bridge_for(&store, &viewer, record.id);
        bridge.mark_ready().await;

        assert_eq!(bridge.current_page().await, 1);
    }

    #[tokio::test]
    async fn only_non_empty_text_selections_count() {
        let store = Arc::new(SessionStore::new());
        let record = store.set_primary(Uuid::new_v4(), "report.pdf");
        let viewer = Arc::new(FakeViewer::default());
        let bridge = bridge_for(&store, &viewer, record.id);
        bridge.mark_ready().await;

        assert!(bridge.selected_text().await.is_none());

        *viewer.selection.lock() = Some(SelectedContent {
            kind: "image".into(),
            data: "…".into(),
        });
        assert!(bridge.selected_text().await.is_none());

        *viewer.selection.lock() = Some(SelectedContent::text(""));
        assert!(bridge.selected_text().await.is_none());

        *viewer.selection.lock() = Some(SelectedContent::text("the indemnity clause"));
        assert_eq!(
            bridge.selected_text().await.as_deref(),
            Some("the indemnity clause")
        );
    }

    #[tokio::test]
    async fn wait_ready_wakes_on_the_readiness_signal() {
        let store = Arc::new(SessionStore::new());
        let record = store.set_primary(Uuid::new_v4(), "report.pdf");
        let viewer = Arc::new(FakeViewer::default());
        let bridge = Arc::new(bridge_for(&store, &viewer, record.id));

        let waiter = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.wait_ready().await }
        });
        tokio::task::yield_now().await;
        bridge.mark_ready().await;
        waiter.await.unwrap();
        assert!(bridge.is_ready());
    }
}
