//! Applies a stream of record batches to an engine table, in order.

use std::{pin::pin, sync::Arc};

use arrow_array::RecordBatch;
use arrow_ipc::writer::StreamWriter;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::debug;

use crate::{
    engine::{TableEngine, TableHandle},
    error::{DecodeError, LoadError},
    session::AbortToken,
};

/// Share of the progress range reserved for data transfer. The rest covers
/// building the view.
pub const PROGRESS_CEILING: u8 = 80;

pub const STAGE_DOWNLOADING: &str = "Downloading...";
pub const STAGE_MATERIALIZING: &str = "Generating UI components...";
pub const STAGE_FINISHED: &str = "Finished";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamProgress {
    pub received_rows: u64,
    /// Zero when the server did not announce a row count.
    pub total_rows: u64,
    pub percent: u8,
    pub stage: String,
}

impl Default for StreamProgress {
    fn default() -> Self {
        Self {
            received_rows: 0,
            total_rows: 0,
            percent: 0,
            stage: STAGE_DOWNLOADING.to_string(),
        }
    }
}

impl StreamProgress {
    #[must_use]
    pub fn downloading(total_rows: u64) -> Self {
        Self {
            total_rows,
            ..Self::default()
        }
    }

    pub fn advance(&mut self, rows: usize) {
        self.received_rows += rows as u64;
        if self.total_rows > 0 {
            self.percent = transfer_percent(self.received_rows, self.total_rows);
        }
    }

    pub fn materializing(&mut self) {
        self.percent = PROGRESS_CEILING;
        STAGE_MATERIALIZING.clone_into(&mut self.stage);
    }

    pub fn finished(&mut self) {
        self.percent = 100;
        STAGE_FINISHED.clone_into(&mut self.stage);
    }
}

/// `round(received / total * PROGRESS_CEILING)`, saturating at the ceiling.
#[must_use]
pub fn transfer_percent(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let received = u128::from(received.min(total));
    let total = u128::from(total);
    let ceiling = u128::from(PROGRESS_CEILING);
    let percent = (2 * received * ceiling + total) / (2 * total);
    u8::try_from(percent).unwrap_or(PROGRESS_CEILING)
}

/// Encode one batch as a standalone IPC stream for the table engine.
pub fn encode_frame(batch: &RecordBatch) -> Result<Bytes, DecodeError> {
    let mut writer = StreamWriter::try_new(Vec::new(), &batch.schema())?;
    writer.write(batch)?;
    writer.finish()?;
    Ok(Bytes::from(writer.into_inner()?))
}

/// Feed `batches` into a new engine table.
///
/// The first batch creates the table and later batches update it, strictly
/// one after another. `on_progress` is called after each applied batch.
/// Cancellation is checked before every application; on any error or
/// cancellation the partially built table is released before returning.
pub async fn consume<S, F>(
    batches: S,
    total_rows: u64,
    engine: Arc<dyn TableEngine>,
    token: &AbortToken,
    mut on_progress: F,
) -> Result<TableHandle, LoadError>
where
    S: Stream<Item = Result<RecordBatch, LoadError>>,
    F: FnMut(&StreamProgress),
{
    let mut table = None;
    let outcome = apply_batches(
        batches,
        total_rows,
        &engine,
        token,
        &mut table,
        &mut on_progress,
    )
    .await;
    match (outcome, table) {
        (Ok(rows), Some(table)) => {
            debug!("Applied {rows} rows to table {}", table.id());
            Ok(table)
        }
        (Ok(_), None) => Err(LoadError::EmptyStream),
        (Err(e), table) => {
            if let Some(table) = table {
                table.release().await;
            }
            Err(e)
        }
    }
}

async fn apply_batches<S, F>(
    batches: S,
    total_rows: u64,
    engine: &Arc<dyn TableEngine>,
    token: &AbortToken,
    table: &mut Option<TableHandle>,
    on_progress: &mut F,
) -> Result<u64, LoadError>
where
    S: Stream<Item = Result<RecordBatch, LoadError>>,
    F: FnMut(&StreamProgress),
{
    let mut batches = pin!(batches);
    let mut progress = StreamProgress::downloading(total_rows);
    loop {
        let next = tokio::select! {
            biased;
            () = token.cancelled() => return Err(LoadError::Cancelled),
            next = batches.next() => next,
        };
        let Some(batch) = next else {
            return Ok(progress.received_rows);
        };
        let batch = batch?;
        if token.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        let frame = encode_frame(&batch)?;
        match table {
            Some(table) => engine.update(table.id(), frame).await?,
            None => {
                let id = engine.create(frame).await?;
                *table = Some(TableHandle::new(id, engine.clone()));
            }
        }
        progress.advance(batch.num_rows());
        on_progress(&progress);
    }
}
