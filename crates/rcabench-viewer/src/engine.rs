//! Table engine: the worker that materializes streamed batches into tables.
//!
//! Frames sent to the engine are standalone Arrow IPC streams. The worker
//! runs on its own thread so decoding and concatenation never block the
//! async runtime, and it is shared by every viewer in the process through
//! [`shared_worker`].

use std::{
    collections::HashMap,
    fmt,
    io::Cursor,
    sync::Arc,
    thread,
};

use arrow_array::RecordBatch;
use arrow_ipc::reader::StreamReader;
use arrow_schema::SchemaRef;
use arrow_select::concat::concat_batches;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::{error::EngineError, viewer::TableRef};

pub type TableId = u64;

#[async_trait]
pub trait TableEngine: Send + Sync {
    /// Create a table from the batches of `frame`.
    async fn create(&self, frame: Bytes) -> Result<TableId, EngineError>;
    /// Append the batches of `frame` to table `id`.
    async fn update(&self, id: TableId, frame: Bytes) -> Result<(), EngineError>;
    async fn size(&self, id: TableId) -> Result<usize, EngineError>;
    /// First `limit` rows of table `id` as one batch.
    async fn view(&self, id: TableId, limit: usize) -> Result<RecordBatch, EngineError>;
    async fn delete(&self, id: TableId) -> Result<(), EngineError>;
    /// Schedule deletion without waiting for it. Used from `Drop`.
    fn delete_detached(&self, id: TableId);
}

/// Exclusive owner of one engine table.
///
/// Call [`TableHandle::release`] when done; a handle dropped without being
/// released schedules the deletion itself.
pub struct TableHandle {
    id: TableId,
    engine: Arc<dyn TableEngine>,
    released: bool,
}

impl TableHandle {
    #[must_use]
    pub fn new(id: TableId, engine: Arc<dyn TableEngine>) -> Self {
        Self {
            id,
            engine,
            released: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> TableId {
        self.id
    }

    /// Non-owning reference for viewer hosts.
    #[must_use]
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.id, self.engine.clone())
    }

    pub async fn num_rows(&self) -> Result<usize, EngineError> {
        self.engine.size(self.id).await
    }

    pub async fn preview(&self, limit: usize) -> Result<RecordBatch, EngineError> {
        self.engine.view(self.id, limit).await
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.engine.delete(self.id).await {
            warn!("Failed to release table {}: {e}", self.id);
        }
    }
}

impl fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableHandle")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        if !self.released {
            debug!("Table {} dropped without release", self.id);
            self.engine.delete_detached(self.id);
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Command {
    Create {
        frame: Bytes,
        reply: Reply<TableId>,
    },
    Update {
        id: TableId,
        frame: Bytes,
        reply: Reply<()>,
    },
    Size {
        id: TableId,
        reply: Reply<usize>,
    },
    View {
        id: TableId,
        limit: usize,
        reply: Reply<RecordBatch>,
    },
    Delete {
        id: TableId,
        reply: Option<Reply<()>>,
    },
}

/// Handle to a table worker thread.
#[derive(Debug, Clone)]
pub struct TableWorker {
    sender: mpsc::UnboundedSender<Command>,
}

impl TableWorker {
    /// Start a new worker thread. The thread exits when every handle is
    /// dropped.
    #[must_use]
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Err(e) = thread::Builder::new()
            .name("rcabench-table-worker".into())
            .spawn(move || worker_loop(receiver))
        {
            error!("Failed to start table worker: {e}");
        }
        Self { sender }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(command(reply))
            .map_err(|_| EngineError::WorkerGone)?;
        response.await.map_err(|_| EngineError::WorkerGone)?
    }
}

#[async_trait]
impl TableEngine for TableWorker {
    async fn create(&self, frame: Bytes) -> Result<TableId, EngineError> {
        self.request(|reply| Command::Create { frame, reply }).await
    }

    async fn update(&self, id: TableId, frame: Bytes) -> Result<(), EngineError> {
        self.request(|reply| Command::Update { id, frame, reply })
            .await
    }

    async fn size(&self, id: TableId) -> Result<usize, EngineError> {
        self.request(|reply| Command::Size { id, reply }).await
    }

    async fn view(&self, id: TableId, limit: usize) -> Result<RecordBatch, EngineError> {
        self.request(|reply| Command::View { id, limit, reply })
            .await
    }

    async fn delete(&self, id: TableId) -> Result<(), EngineError> {
        self.request(|reply| Command::Delete {
            id,
            reply: Some(reply),
        })
        .await
    }

    fn delete_detached(&self, id: TableId) {
        let _ = self.sender.send(Command::Delete { id, reply: None });
    }
}

static SHARED_WORKER: OnceCell<Arc<TableWorker>> = OnceCell::const_new();

/// The process-wide worker, started by the first caller.
///
/// Concurrent first callers wait for the same initialization.
pub async fn shared_worker() -> Arc<TableWorker> {
    SHARED_WORKER
        .get_or_init(|| async {
            debug!("Starting shared table worker");
            Arc::new(TableWorker::spawn())
        })
        .await
        .clone()
}

struct Table {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    num_rows: usize,
}

impl Table {
    fn append(&mut self, batches: Vec<RecordBatch>) {
        self.num_rows += batches.iter().map(RecordBatch::num_rows).sum::<usize>();
        self.batches.extend(batches);
    }

    fn head(&self, limit: usize) -> Result<RecordBatch, EngineError> {
        let mut taken = Vec::new();
        let mut rows = 0;
        for batch in &self.batches {
            if rows >= limit {
                break;
            }
            let take = batch.num_rows().min(limit - rows);
            taken.push(batch.slice(0, take));
            rows += take;
        }
        Ok(concat_batches(&self.schema, &taken)?)
    }
}

#[derive(Default)]
struct Tables {
    next_id: TableId,
    tables: HashMap<TableId, Table>,
}

impl Tables {
    fn create(&mut self, frame: Bytes) -> Result<TableId, EngineError> {
        let (schema, batches) = decode_frame(frame)?;
        self.next_id += 1;
        let id = self.next_id;
        let mut table = Table {
            schema,
            batches: Vec::new(),
            num_rows: 0,
        };
        table.append(batches);
        self.tables.insert(id, table);
        Ok(id)
    }

    fn update(&mut self, id: TableId, frame: Bytes) -> Result<(), EngineError> {
        let table = self.tables.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        let (schema, batches) = decode_frame(frame)?;
        if schema.fields() != table.schema.fields() {
            return Err(EngineError::SchemaMismatch(id));
        }
        table.append(batches);
        Ok(())
    }

    fn get(&self, id: TableId) -> Result<&Table, EngineError> {
        self.tables.get(&id).ok_or(EngineError::NotFound(id))
    }
}

fn decode_frame(frame: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>), EngineError> {
    if frame.is_empty() {
        return Err(EngineError::EmptyFrame);
    }
    let reader = StreamReader::try_new(Cursor::new(frame), None)?;
    let schema = reader.schema();
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    Ok((schema, batches))
}

fn worker_loop(mut receiver: mpsc::UnboundedReceiver<Command>) {
    let mut tables = Tables::default();
    while let Some(command) = receiver.blocking_recv() {
        match command {
            Command::Create { frame, reply } => {
                let _ = reply.send(tables.create(frame));
            }
            Command::Update { id, frame, reply } => {
                let _ = reply.send(tables.update(id, frame));
            }
            Command::Size { id, reply } => {
                let _ = reply.send(tables.get(id).map(|t| t.num_rows));
            }
            Command::View { id, limit, reply } => {
                let _ = reply.send(tables.get(id).and_then(|t| t.head(limit)));
            }
            Command::Delete { id, reply } => {
                let result = tables
                    .tables
                    .remove(&id)
                    .map(|_| ())
                    .ok_or(EngineError::NotFound(id));
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }
    debug!("Table worker stopped with {} tables", tables.tables.len());
}

#[cfg(test)]
mod tests {
    use arrow_array::{Array, Int64Array};
    use arrow_schema::{DataType, Field, Schema};

    use super::*;
    use crate::{
        consumer::encode_frame,
        testing::{metrics_batch, metrics_schema},
    };

    fn frame(batch: &RecordBatch) -> Bytes {
        encode_frame(batch).unwrap()
    }

    #[tokio::test]
    async fn create_update_view_delete() {
        let worker = TableWorker::spawn();
        let schema = metrics_schema();

        let id = worker.create(frame(&metrics_batch(&schema, 0, 10))).await.unwrap();
        worker
            .update(id, frame(&metrics_batch(&schema, 10, 15)))
            .await
            .unwrap();
        assert_eq!(worker.size(id).await.unwrap(), 25);

        let head = worker.view(id, 12).await.unwrap();
        assert_eq!(head.num_rows(), 12);
        let rows = head
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(rows.value(11), 11);

        worker.delete(id).await.unwrap();
        assert!(matches!(worker.size(id).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn table_ids_are_unique() {
        let worker = TableWorker::spawn();
        let schema = metrics_schema();
        let first = worker.create(frame(&metrics_batch(&schema, 0, 1))).await.unwrap();
        let second = worker.create(frame(&metrics_batch(&schema, 0, 1))).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn update_rejects_other_schema() {
        let worker = TableWorker::spawn();
        let id = worker
            .create(frame(&metrics_batch(&metrics_schema(), 0, 3)))
            .await
            .unwrap();
        let other = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            other,
            vec![Arc::new(Int64Array::from(vec![1, 2])) as Arc<dyn Array>],
        )
        .unwrap();
        assert!(matches!(
            worker.update(id, frame(&batch)).await,
            Err(EngineError::SchemaMismatch(_))
        ));
        assert_eq!(worker.size(id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn bad_frames_are_rejected() {
        let worker = TableWorker::spawn();
        assert!(matches!(
            worker.create(Bytes::new()).await,
            Err(EngineError::EmptyFrame)
        ));
        assert!(matches!(
            worker.create(Bytes::from_static(b"not arrow at all")).await,
            Err(EngineError::Arrow(_))
        ));
        assert!(matches!(
            worker.update(999, frame(&metrics_batch(&metrics_schema(), 0, 1))).await,
            Err(EngineError::NotFound(999))
        ));
    }

    #[tokio::test]
    async fn dropped_handle_deletes_table() {
        let worker = Arc::new(TableWorker::spawn());
        let engine: Arc<dyn TableEngine> = worker.clone();
        let id = worker
            .create(frame(&metrics_batch(&metrics_schema(), 0, 4)))
            .await
            .unwrap();
        drop(TableHandle::new(id, engine));
        // The worker handles commands in order, so the detached delete has
        // run once this reply arrives.
        assert!(matches!(worker.size(id).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn released_handle_deletes_once() {
        let worker = Arc::new(TableWorker::spawn());
        let id = worker
            .create(frame(&metrics_batch(&metrics_schema(), 0, 4)))
            .await
            .unwrap();
        let handle = TableHandle::new(id, worker.clone());
        assert_eq!(handle.num_rows().await.unwrap(), 4);
        assert_eq!(handle.preview(2).await.unwrap().num_rows(), 2);
        handle.release().await;
        assert!(matches!(worker.size(id).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn shared_worker_is_memoized() {
        let (a, b) = tokio::join!(shared_worker(), shared_worker());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &shared_worker().await));
    }
}
