//! Per-viewer load sessions.
//!
//! A [`LoadController`] drives one viewer. Every render with a new
//! [`LoadKey`] starts a session that streams the file, builds a table and
//! hands it to the viewer. Starting a session cancels the previous one, and
//! all late work of a cancelled session is dropped.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::Serialize;
use tokio::{
    sync::{Mutex as AsyncMutex, watch},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    api::DataApi,
    codec,
    consumer::{StreamProgress, consume},
    engine::{TableEngine, TableHandle},
    error::LoadError,
    ipc_stream::record_batches,
    viewer::{DisplayConfig, ViewerAdapter, ViewerHost},
};

/// Identifies the file a session loads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadKey {
    pub resource_id: i64,
    pub file_path: String,
}

impl LoadKey {
    #[must_use]
    pub fn new(resource_id: i64, file_path: impl Into<String>) -> Self {
        Self {
            resource_id,
            file_path: file_path.into(),
        }
    }
}

impl fmt::Display for LoadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_id, self.file_path)
    }
}

/// Cancellation token of one session. Two tokens belong to the same session
/// when their ids match.
#[derive(Debug, Clone)]
pub struct AbortToken {
    id: u64,
    token: CancellationToken,
}

impl AbortToken {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPhase {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPanel {
    pub title: String,
    pub message: String,
    pub hint: String,
}

impl ErrorPanel {
    fn from_error(error: &LoadError) -> Self {
        Self {
            title: "Failed to load data".to_string(),
            message: error.to_string(),
            hint: error.hint().to_string(),
        }
    }
}

/// What the viewer region shows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViewState {
    pub phase: LoadPhase,
    pub progress: StreamProgress,
    pub error: Option<ErrorPanel>,
}

impl ViewState {
    fn loading() -> Self {
        Self {
            phase: LoadPhase::Loading,
            ..Self::default()
        }
    }
}

/// Inputs of a render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderProps {
    pub resource_id: i64,
    pub file_path: String,
    /// CSS height of the viewer region.
    pub height: Option<String>,
}

#[derive(Default)]
struct Session {
    key: Option<LoadKey>,
    token: Option<AbortToken>,
    table: Option<TableHandle>,
    task: Option<JoinHandle<()>>,
    generation: u64,
}

impl Session {
    fn is_current(&self, token: &AbortToken) -> bool {
        !token.is_cancelled() && self.token.as_ref().is_some_and(|t| t.id() == token.id())
    }
}

struct ControllerState {
    api: Arc<dyn DataApi>,
    engine: Arc<dyn TableEngine>,
    display: DisplayConfig,
    viewer: AsyncMutex<ViewerAdapter>,
    session: Mutex<Session>,
    state: watch::Sender<ViewState>,
    tracker: TaskTracker,
}

/// Drives the loading of files into one viewer.
pub struct LoadController {
    shared: Arc<ControllerState>,
}

impl LoadController {
    #[must_use]
    pub fn new(
        api: Arc<dyn DataApi>,
        engine: Arc<dyn TableEngine>,
        host: Box<dyn ViewerHost>,
        display: DisplayConfig,
    ) -> Self {
        codec::init_codecs();
        Self {
            shared: Arc::new(ControllerState {
                api,
                engine,
                display,
                viewer: AsyncMutex::new(ViewerAdapter::new(host)),
                session: Mutex::default(),
                state: watch::Sender::new(ViewState::default()),
                tracker: TaskTracker::new(),
            }),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> ViewState {
        self.shared.state.borrow().clone()
    }

    /// Show the file named by `props`.
    ///
    /// Rendering the key that is already loading or loaded does nothing.
    /// Any other key cancels the running session and starts a new one.
    pub async fn render(&self, props: RenderProps) {
        let key = LoadKey::new(props.resource_id, props.file_path);
        let (token, previous, running) = {
            let mut session = self.shared.lock_session();
            let phase = self.shared.state.borrow().phase;
            if session.key.as_ref() == Some(&key)
                && matches!(phase, LoadPhase::Loading | LoadPhase::Ready)
            {
                debug!("Ignoring duplicate render of {key}");
                return;
            }
            if let Some(token) = session.token.take() {
                debug!("Cancelling session {}", token.id());
                token.cancel();
            }
            session.generation += 1;
            let token = AbortToken::new(session.generation);
            session.token = Some(token.clone());
            session.key = Some(key.clone());
            self.shared.state.send_replace(ViewState::loading());
            (token, session.table.take(), session.task.take())
        };

        {
            let mut viewer = self.shared.viewer.lock().await;
            if let Err(e) = viewer.reset().await {
                warn!("Failed to reset viewer: {e}");
            }
            viewer.set_height(props.height);
            viewer.set_visible(true);
        }
        if let Some(table) = previous {
            table.release().await;
        }
        // A cancelled session releases its partial table before it exits, so
        // no two tables of this viewer are alive at once.
        if let Some(task) = running {
            if let Err(e) = task.await {
                warn!("Previous load task failed: {e}");
            }
        }

        info!("Loading {key}");
        let shared = self.shared.clone();
        let run_token = token.clone();
        let task = self
            .shared
            .tracker
            .spawn(async move { shared.run(key, run_token).await });
        let mut session = self.shared.lock_session();
        if session.is_current(&token) {
            session.task = Some(task);
        }
    }

    /// Cancel the running session, release the table, destroy the viewer and
    /// wait for background work to finish.
    pub async fn unmount(self) {
        let table = {
            let mut session = self.shared.lock_session();
            if let Some(token) = session.token.take() {
                token.cancel();
            }
            session.key = None;
            session.table.take()
        };
        if let Some(table) = table {
            table.release().await;
        }
        self.shared.viewer.lock().await.dispose().await;
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        self.shared.state.send_replace(ViewState::default());
        debug!("Viewer unmounted");
    }
}

impl Drop for LoadController {
    fn drop(&mut self) {
        if let Ok(session) = self.shared.session.lock() {
            if let Some(token) = &session.token {
                token.cancel();
            }
        }
    }
}

impl ControllerState {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().expect("Session lock poisoned")
    }

    /// Apply `update` to the view state if `token` still owns the session.
    fn update_if_current(&self, token: &AbortToken, update: impl FnOnce(&mut ViewState)) -> bool {
        let session = self.lock_session();
        if !session.is_current(token) {
            return false;
        }
        self.state.send_modify(update);
        true
    }

    async fn run(self: Arc<Self>, key: LoadKey, token: AbortToken) {
        match self.load(&key, &token).await {
            Ok(rows) => info!("Loaded {key} with {rows} rows"),
            Err(e) if e.is_cancellation() => debug!("Load of {key} cancelled"),
            Err(e) => self.fail(&key, &token, &e).await,
        }
    }

    async fn load(&self, key: &LoadKey, token: &AbortToken) -> Result<usize, LoadError> {
        let stream = tokio::select! {
            biased;
            () = token.cancelled() => return Err(LoadError::Cancelled),
            stream = self.api.fetch_file_stream(key.resource_id, key.file_path.clone()) => stream?,
        };
        debug!("Stream for {key} announces {} rows", stream.total_rows);
        let table = consume(
            record_batches(stream.body),
            stream.total_rows,
            self.engine.clone(),
            token,
            |progress| {
                self.update_if_current(token, |state| state.progress = progress.clone());
            },
        )
        .await?;
        self.present(token, table).await
    }

    /// Hand a finished table to the viewer and keep it for the session.
    async fn present(&self, token: &AbortToken, table: TableHandle) -> Result<usize, LoadError> {
        let rows = match table.num_rows().await {
            Ok(rows) => rows,
            Err(e) => {
                table.release().await;
                return Err(e.into());
            }
        };
        if !self.update_if_current(token, |state| state.progress.materializing()) {
            table.release().await;
            return Err(LoadError::Cancelled);
        }

        let mut viewer = self.viewer.lock().await;
        if token.is_cancelled() {
            drop(viewer);
            table.release().await;
            return Err(LoadError::Cancelled);
        }
        let shown = match viewer.load(table.table_ref()).await {
            Ok(true) => viewer.restore(self.display).await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        drop(viewer);
        if let Err(e) = shown {
            table.release().await;
            return Err(e.into());
        }

        let stale = {
            let mut session = self.lock_session();
            if session.is_current(token) {
                session.table = Some(table);
                self.state.send_modify(|state| {
                    state.phase = LoadPhase::Ready;
                    state.progress.finished();
                });
                None
            } else {
                Some(table)
            }
        };
        if let Some(table) = stale {
            table.release().await;
            return Err(LoadError::Cancelled);
        }
        Ok(rows)
    }

    async fn fail(&self, key: &LoadKey, token: &AbortToken, error: &LoadError) {
        error!("Failed to load {key}: {error}");
        let current = self.update_if_current(token, |state| {
            state.phase = LoadPhase::Failed;
            state.error = Some(ErrorPanel::from_error(error));
        });
        if current {
            let mut viewer = self.viewer.lock().await;
            if !token.is_cancelled() {
                viewer.set_visible(false);
            }
        }
    }
}
