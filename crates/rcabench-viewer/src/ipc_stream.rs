//! Incremental decoding of the Arrow IPC streaming format.
//!
//! The HTTP body arrives in arbitrary chunks. [`BatchDecoder`] buffers them,
//! cuts complete encapsulated messages and turns them into record batches.
//! Compressed batches are expanded with the codecs from [`crate::codec`]
//! before the regular Arrow decoder sees them.

use std::{collections::HashMap, pin::pin, sync::Arc};

use arrow_array::{ArrayRef, RecordBatch};
use arrow_buffer::{Buffer, MutableBuffer};
use arrow_ipc::{self as ipc, convert::fb_to_schema, reader};
use arrow_schema::SchemaRef;
use async_stream::try_stream;
use bytes::{Buf, Bytes, BytesMut};
use flatbuffers::{FlatBufferBuilder, UnionWIPOffset, WIPOffset};
use futures::{Stream, StreamExt};

use crate::{
    codec::{self, ALIGNMENT},
    error::{DecodeError, LoadError, TransportError},
};

const CONTINUATION_MARKER: i32 = -1;

/// Lazily decode `body` into record batches, in stream order.
pub fn record_batches<S>(body: S) -> impl Stream<Item = Result<RecordBatch, LoadError>>
where
    S: Stream<Item = Result<Bytes, TransportError>>,
{
    try_stream! {
        let mut body = pin!(body);
        let mut decoder = BatchDecoder::new();
        while let Some(chunk) = body.next().await {
            decoder.push(&chunk?);
            while let Some(batch) = decoder.next_batch()? {
                yield batch;
            }
        }
        decoder.finish()?;
    }
}

#[derive(Debug)]
enum Frame {
    Message { metadata: Bytes, body: Bytes },
    End,
}

#[derive(Debug, Default)]
pub struct BatchDecoder {
    buffer: BytesMut,
    schema: Option<SchemaRef>,
    dictionaries: HashMap<i64, ArrayRef>,
    finished: bool,
}

impl BatchDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if !self.finished {
            self.buffer.extend_from_slice(chunk);
        }
    }

    #[must_use]
    pub fn schema(&self) -> Option<SchemaRef> {
        self.schema.clone()
    }

    /// Decode buffered messages until a record batch is available or more
    /// input is needed.
    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>, DecodeError> {
        while let Some(frame) = self.next_frame()? {
            let (metadata, body) = match frame {
                Frame::End => {
                    self.finished = true;
                    self.buffer.clear();
                    return Ok(None);
                }
                Frame::Message { metadata, body } => (metadata, body),
            };
            if let Some(batch) = self.decode_message(&metadata, body)? {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    /// Check that the input stopped on a message boundary.
    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.finished || self.buffer.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::Truncated(self.buffer.len()))
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.finished {
            return Ok(None);
        }
        let Some(mut length) = read_i32(&self.buffer, 0) else {
            return Ok(None);
        };
        let mut prefix = 4;
        if length == CONTINUATION_MARKER {
            let Some(actual) = read_i32(&self.buffer, 4) else {
                return Ok(None);
            };
            length = actual;
            prefix = 8;
        }
        if length == 0 {
            self.buffer.advance(prefix);
            return Ok(Some(Frame::End));
        }
        let metadata_len =
            usize::try_from(length).map_err(|_| DecodeError::InvalidLength(length.into()))?;
        let metadata_end = prefix + metadata_len;
        if self.buffer.len() < metadata_end {
            return Ok(None);
        }
        let message = ipc::root_as_message(&self.buffer[prefix..metadata_end])
            .map_err(|e| DecodeError::Flatbuffer(e.to_string()))?;
        let body_len = usize::try_from(message.bodyLength())
            .map_err(|_| DecodeError::InvalidLength(message.bodyLength()))?;
        let total = metadata_end + body_len;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let mut frame = self.buffer.split_to(total).freeze();
        let body = frame.split_off(metadata_end);
        let metadata = frame.split_off(prefix);
        Ok(Some(Frame::Message { metadata, body }))
    }

    fn decode_message(
        &mut self,
        metadata: &[u8],
        body: Bytes,
    ) -> Result<Option<RecordBatch>, DecodeError> {
        let message =
            ipc::root_as_message(metadata).map_err(|e| DecodeError::Flatbuffer(e.to_string()))?;
        if let Some((metadata, body)) = expand_compressed(message, &body)? {
            return self.decode_plain(&metadata, &body);
        }
        self.decode_plain(metadata, &Buffer::from(body))
    }

    fn decode_plain(
        &mut self,
        metadata: &[u8],
        body: &Buffer,
    ) -> Result<Option<RecordBatch>, DecodeError> {
        let message =
            ipc::root_as_message(metadata).map_err(|e| DecodeError::Flatbuffer(e.to_string()))?;
        match message.header_type() {
            ipc::MessageHeader::Schema => {
                let schema = message
                    .header_as_schema()
                    .ok_or(DecodeError::Malformed("unreadable schema message"))?;
                self.schema = Some(Arc::new(fb_to_schema(schema)));
                self.dictionaries.clear();
                Ok(None)
            }
            ipc::MessageHeader::DictionaryBatch => {
                let schema = self
                    .schema
                    .clone()
                    .ok_or(DecodeError::Malformed("dictionary batch before schema"))?;
                let dictionary = message
                    .header_as_dictionary_batch()
                    .ok_or(DecodeError::Malformed("unreadable dictionary batch"))?;
                reader::read_dictionary(
                    body,
                    dictionary,
                    &schema,
                    &mut self.dictionaries,
                    &message.version(),
                )?;
                Ok(None)
            }
            ipc::MessageHeader::RecordBatch => {
                let schema = self
                    .schema
                    .clone()
                    .ok_or(DecodeError::Malformed("record batch before schema"))?;
                let batch = message
                    .header_as_record_batch()
                    .ok_or(DecodeError::Malformed("unreadable record batch"))?;
                let batch = reader::read_record_batch(
                    body,
                    batch,
                    schema,
                    &self.dictionaries,
                    None,
                    &message.version(),
                )?;
                Ok(Some(batch))
            }
            _ => Err(DecodeError::Malformed("unexpected message type in stream")),
        }
    }
}

fn read_i32(buffer: &[u8], at: usize) -> Option<i32> {
    let bytes = buffer.get(at..at + 4)?;
    bytes.try_into().ok().map(i32::from_le_bytes)
}

/// Decompress a compressed record or dictionary batch.
///
/// Returns rebuilt message metadata without the compression field and the
/// expanded body, or `None` when the message carries no compressed data.
fn expand_compressed(
    message: ipc::Message<'_>,
    body: &[u8],
) -> Result<Option<(Vec<u8>, Buffer)>, DecodeError> {
    let mut fbb = FlatBufferBuilder::new();
    let mut expanded = MutableBuffer::new(body.len());
    let header: WIPOffset<UnionWIPOffset> = match message.header_type() {
        ipc::MessageHeader::RecordBatch => {
            let batch = message
                .header_as_record_batch()
                .ok_or(DecodeError::Malformed("unreadable record batch"))?;
            if batch.compression().is_none() {
                return Ok(None);
            }
            rebuild_batch(&mut fbb, batch, body, &mut expanded)?.as_union_value()
        }
        ipc::MessageHeader::DictionaryBatch => {
            let dictionary = message
                .header_as_dictionary_batch()
                .ok_or(DecodeError::Malformed("unreadable dictionary batch"))?;
            let Some(batch) = dictionary.data().filter(|b| b.compression().is_some()) else {
                return Ok(None);
            };
            let data = rebuild_batch(&mut fbb, batch, body, &mut expanded)?;
            let mut builder = ipc::DictionaryBatchBuilder::new(&mut fbb);
            builder.add_id(dictionary.id());
            builder.add_data(data);
            builder.add_isDelta(dictionary.isDelta());
            builder.finish().as_union_value()
        }
        _ => return Ok(None),
    };
    let body_length = i64::try_from(expanded.len())
        .map_err(|_| DecodeError::Malformed("expanded body too large"))?;
    let mut builder = ipc::MessageBuilder::new(&mut fbb);
    builder.add_version(message.version());
    builder.add_header_type(message.header_type());
    builder.add_header(header);
    builder.add_bodyLength(body_length);
    let root = builder.finish();
    fbb.finish(root, None);
    Ok(Some((fbb.finished_data().to_vec(), expanded.into())))
}

fn rebuild_batch<'fbb>(
    fbb: &mut FlatBufferBuilder<'fbb>,
    batch: ipc::RecordBatch<'_>,
    body: &[u8],
    expanded: &mut MutableBuffer,
) -> Result<WIPOffset<ipc::RecordBatch<'fbb>>, DecodeError> {
    let compression = batch
        .compression()
        .ok_or(DecodeError::Malformed("batch is not compressed"))?;
    let codec = codec::lookup(compression.codec())?;
    let specs = batch
        .buffers()
        .ok_or(DecodeError::Malformed("record batch without buffers"))?;

    let mut rebuilt = Vec::with_capacity(specs.len());
    for spec in specs.iter() {
        let range = buffer_range(spec.offset(), spec.length())?;
        let frame = body
            .get(range)
            .ok_or(DecodeError::Malformed("buffer exceeds message body"))?;
        let decoded = codec::decode_buffer(codec.as_ref(), frame)?;
        let offset = expanded.len();
        expanded.extend_from_slice(decoded.as_slice());
        let padding = expanded.len().next_multiple_of(ALIGNMENT) - expanded.len();
        expanded.extend_zeros(padding);
        rebuilt.push(ipc::Buffer::new(
            i64::try_from(offset).map_err(|_| DecodeError::Malformed("body too large"))?,
            i64::try_from(decoded.len()).map_err(|_| DecodeError::Malformed("body too large"))?,
        ));
    }

    let nodes: Vec<ipc::FieldNode> = batch
        .nodes()
        .map(|nodes| nodes.iter().copied().collect())
        .unwrap_or_default();
    let nodes = fbb.create_vector(&nodes);
    let buffers = fbb.create_vector(&rebuilt);
    let variadic = batch
        .variadicBufferCounts()
        .map(|counts| fbb.create_vector(&counts.iter().collect::<Vec<i64>>()));

    let mut builder = ipc::RecordBatchBuilder::new(fbb);
    builder.add_length(batch.length());
    builder.add_nodes(nodes);
    builder.add_buffers(buffers);
    if let Some(variadic) = variadic {
        builder.add_variadicBufferCounts(variadic);
    }
    Ok(builder.finish())
}

fn buffer_range(offset: i64, length: i64) -> Result<std::ops::Range<usize>, DecodeError> {
    let start = usize::try_from(offset).map_err(|_| DecodeError::InvalidLength(offset))?;
    let length = usize::try_from(length).map_err(|_| DecodeError::InvalidLength(length))?;
    let end = start
        .checked_add(length)
        .ok_or(DecodeError::InvalidLength(offset))?;
    Ok(start..end)
}
