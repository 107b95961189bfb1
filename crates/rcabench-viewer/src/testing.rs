//! Fakes and fixtures shared by the unit tests.

use std::sync::{Arc, Mutex};

use arrow_array::{Float64Array, Int64Array, RecordBatch};
use arrow_ipc::{
    CompressionType,
    writer::{IpcWriteOptions, StreamWriter},
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    api::{DataApi, FileStream},
    engine::{TableEngine, TableId, TableWorker},
    error::{EngineError, TransportError, ViewerError},
    session::LoadKey,
    viewer::{DisplayConfig, TableRef, ViewerHost},
};

pub fn metrics_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("row", DataType::Int64, false),
        Field::new("latency_ms", DataType::Float64, true),
    ]))
}

pub fn metrics_batch(schema: &SchemaRef, start: i64, n: i64) -> RecordBatch {
    let rows = Int64Array::from_iter_values(start..start + n);
    #[allow(clippy::cast_precision_loss)]
    let latency = Float64Array::from_iter_values((start..start + n).map(|v| v as f64 * 0.5));
    RecordBatch::try_new(schema.clone(), vec![Arc::new(rows), Arc::new(latency)]).unwrap()
}

/// One chunk per IPC message: schema, each batch, end-of-stream marker.
pub fn stream_chunks(
    schema: &SchemaRef,
    batches: &[RecordBatch],
    compression: Option<CompressionType>,
) -> Vec<Bytes> {
    let options = IpcWriteOptions::default()
        .try_with_compression(compression)
        .unwrap();
    let mut writer = StreamWriter::try_new_with_options(Vec::new(), schema, options).unwrap();
    let mut cuts = vec![writer.get_ref().len()];
    for batch in batches {
        writer.write(batch).unwrap();
        cuts.push(writer.get_ref().len());
    }
    writer.finish().unwrap();
    let bytes = Bytes::from(writer.into_inner().unwrap());
    cuts.push(bytes.len());

    let mut start = 0;
    cuts.into_iter()
        .map(|end| {
            let chunk = bytes.slice(start..end);
            start = end;
            chunk
        })
        .collect()
}

pub fn stream_bytes(
    schema: &SchemaRef,
    batches: &[RecordBatch],
    compression: Option<CompressionType>,
) -> Vec<u8> {
    stream_chunks(schema, batches, compression).concat()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCall {
    Create(TableId),
    Update(TableId),
    Delete(TableId),
}

/// Real table worker that records every mutating call.
pub struct RecordingEngine {
    worker: TableWorker,
    calls: Mutex<Vec<EngineCall>>,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            worker: TableWorker::spawn(),
            calls: Mutex::default(),
        })
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deletes_of(&self, id: TableId) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == EngineCall::Delete(id))
            .count()
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TableEngine for RecordingEngine {
    async fn create(&self, frame: Bytes) -> Result<TableId, EngineError> {
        let id = self.worker.create(frame).await?;
        self.record(EngineCall::Create(id));
        Ok(id)
    }

    async fn update(&self, id: TableId, frame: Bytes) -> Result<(), EngineError> {
        self.record(EngineCall::Update(id));
        self.worker.update(id, frame).await
    }

    async fn size(&self, id: TableId) -> Result<usize, EngineError> {
        self.worker.size(id).await
    }

    async fn view(&self, id: TableId, limit: usize) -> Result<RecordBatch, EngineError> {
        self.worker.view(id, limit).await
    }

    async fn delete(&self, id: TableId) -> Result<(), EngineError> {
        self.record(EngineCall::Delete(id));
        self.worker.delete(id).await
    }

    fn delete_detached(&self, id: TableId) {
        self.record(EngineCall::Delete(id));
        self.worker.delete_detached(id);
    }
}

type ChunkSender = mpsc::UnboundedSender<Result<Bytes, TransportError>>;

/// Data API whose response bodies are fed by the test.
#[derive(Default)]
pub struct ChannelApi {
    requests: Mutex<Vec<(LoadKey, Option<ChunkSender>)>>,
    total_rows: Mutex<u64>,
}

impl ChannelApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_total_rows(&self, total_rows: u64) {
        *self.total_rows.lock().unwrap() = total_rows;
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requested_keys(&self) -> Vec<LoadKey> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Send a chunk to the body of request `index`. Returns false once the
    /// reader is gone.
    pub fn send(&self, index: usize, chunk: Bytes) -> bool {
        self.requests.lock().unwrap()[index]
            .1
            .as_ref()
            .is_some_and(|sender| sender.send(Ok(chunk)).is_ok())
    }

    pub fn send_all(&self, index: usize, chunks: &[Bytes]) {
        for chunk in chunks {
            self.send(index, chunk.clone());
        }
    }

    /// End the body of request `index`.
    pub fn close(&self, index: usize) {
        self.requests.lock().unwrap()[index].1 = None;
    }

    pub async fn wait_for_requests(&self, count: usize) {
        while self.request_count() < count {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl DataApi for ChannelApi {
    async fn fetch_file_stream(
        &self,
        resource_id: i64,
        file_path: String,
    ) -> Result<FileStream, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.requests
            .lock()
            .unwrap()
            .push((LoadKey::new(resource_id, file_path), Some(sender)));
        Ok(FileStream {
            total_rows: *self.total_rows.lock().unwrap(),
            body: UnboundedReceiverStream::new(receiver).boxed(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerCall {
    Load(TableId),
    Reset,
    Restore(DisplayConfig),
    Dispose,
    Visible(bool),
    Height(Option<String>),
}

/// Viewer host that records calls into a shared log.
#[derive(Clone, Default)]
pub struct RecordingViewer {
    calls: Arc<Mutex<Vec<ViewerCall>>>,
    detached: bool,
}

impl RecordingViewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detached() -> Self {
        Self {
            detached: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ViewerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: &ViewerCall) -> usize {
        self.calls().iter().filter(|call| *call == wanted).count()
    }

    pub fn loads(&self) -> Vec<TableId> {
        self.calls()
            .iter()
            .filter_map(|call| match call {
                ViewerCall::Load(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ViewerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ViewerHost for RecordingViewer {
    fn is_attached(&self) -> bool {
        !self.detached
    }

    async fn load(&mut self, table: TableRef) -> Result<(), ViewerError> {
        self.record(ViewerCall::Load(table.id()));
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), ViewerError> {
        self.record(ViewerCall::Reset);
        Ok(())
    }

    async fn restore(&mut self, config: DisplayConfig) -> Result<(), ViewerError> {
        self.record(ViewerCall::Restore(config));
        Ok(())
    }

    async fn dispose(&mut self) {
        self.record(ViewerCall::Dispose);
    }

    fn set_visible(&mut self, visible: bool) {
        self.record(ViewerCall::Visible(visible));
    }

    fn set_height(&mut self, height: Option<String>) {
        self.record(ViewerCall::Height(height));
    }
}
