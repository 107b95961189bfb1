//! Binding between loaded tables and the widget that displays them.

use std::{fmt, sync::Arc};

use arrow_array::RecordBatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    engine::{TableEngine, TableId},
    error::{EngineError, ViewerError},
};

/// Display options applied to the viewer after a table is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Show the settings panel.
    pub settings: bool,
    /// Allow editing cells.
    pub editable: bool,
}

impl DisplayConfig {
    pub const VIEW_ONLY: Self = Self {
        settings: true,
        editable: false,
    };
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self::VIEW_ONLY
    }
}

/// Non-owning reference to an engine table, handed to viewer hosts.
///
/// The table stays owned by its [`TableHandle`](crate::engine::TableHandle);
/// reads through a reference fail with [`EngineError::NotFound`] once it is
/// released.
#[derive(Clone)]
pub struct TableRef {
    id: TableId,
    engine: Arc<dyn TableEngine>,
}

impl TableRef {
    #[must_use]
    pub fn new(id: TableId, engine: Arc<dyn TableEngine>) -> Self {
        Self { id, engine }
    }

    #[must_use]
    pub const fn id(&self) -> TableId {
        self.id
    }

    pub async fn num_rows(&self) -> Result<usize, EngineError> {
        self.engine.size(self.id).await
    }

    pub async fn preview(&self, limit: usize) -> Result<RecordBatch, EngineError> {
        self.engine.view(self.id, limit).await
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRef")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A widget able to display one table at a time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ViewerHost: Send {
    /// Whether the widget is currently attached to its display surface.
    fn is_attached(&self) -> bool;
    async fn load(&mut self, table: TableRef) -> Result<(), ViewerError>;
    /// Detach the current table, keeping the widget alive.
    async fn reset(&mut self) -> Result<(), ViewerError>;
    async fn restore(&mut self, config: DisplayConfig) -> Result<(), ViewerError>;
    /// Destroy the widget.
    async fn dispose(&mut self);
    fn set_visible(&mut self, _visible: bool) {}
    fn set_height(&mut self, _height: Option<String>) {}
}

/// Owns one [`ViewerHost`] and tracks which table is bound to it.
pub struct ViewerAdapter {
    host: Box<dyn ViewerHost>,
    bound: Option<TableId>,
    disposed: bool,
}

impl ViewerAdapter {
    #[must_use]
    pub fn new(host: Box<dyn ViewerHost>) -> Self {
        Self {
            host,
            bound: None,
            disposed: false,
        }
    }

    #[must_use]
    pub const fn bound(&self) -> Option<TableId> {
        self.bound
    }

    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Bind `table` to the widget. Returns `false` when the widget is not
    /// attached or already disposed and nothing was loaded.
    pub async fn load(&mut self, table: TableRef) -> Result<bool, ViewerError> {
        if self.disposed {
            return Ok(false);
        }
        if !self.host.is_attached() {
            warn!("Viewer is not attached, skipping load of table {}", table.id());
            return Ok(false);
        }
        let id = table.id();
        self.host.load(table).await?;
        self.bound = Some(id);
        Ok(true)
    }

    /// Detach the bound table, if any.
    pub async fn reset(&mut self) -> Result<(), ViewerError> {
        if self.disposed {
            return Ok(());
        }
        if let Some(id) = self.bound.take() {
            debug!("Detaching table {id} from viewer");
            self.host.reset().await?;
        }
        Ok(())
    }

    pub async fn restore(&mut self, config: DisplayConfig) -> Result<(), ViewerError> {
        if self.disposed || self.bound.is_none() {
            return Ok(());
        }
        self.host.restore(config).await
    }

    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.bound = None;
        self.host.dispose().await;
    }

    pub fn set_visible(&mut self, visible: bool) {
        if !self.disposed {
            self.host.set_visible(visible);
        }
    }

    pub fn set_height(&mut self, height: Option<String>) {
        if !self.disposed {
            self.host.set_height(height);
        }
    }
}

impl fmt::Debug for ViewerAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewerAdapter")
            .field("bound", &self.bound)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}
