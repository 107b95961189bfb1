//! Body-buffer codecs for compressed Arrow IPC batches.
//!
//! Codecs live in a process-wide table keyed by the IPC `CompressionType`.
//! [`init_codecs`] registers the built-in LZ4 frame and Zstandard decoders;
//! the stream framing looks codecs up by the type announced in each batch.

use std::{
    collections::HashMap,
    io::Read,
    sync::{Arc, LazyLock, Once, RwLock},
};

use arrow_buffer::{Buffer, MutableBuffer};
use arrow_ipc::CompressionType;
use thiserror::Error;
use tracing::debug;

/// Required start alignment of every decoded buffer.
pub const ALIGNMENT: usize = 8;

const LENGTH_PREFIX: usize = 8;
const LENGTH_NO_COMPRESSED_DATA: i64 = -1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("No decoder registered for codec {0}")]
    Unregistered(String),
    #[error("Compressed buffer of {0} bytes is shorter than its length prefix")]
    Truncated(usize),
    #[error("Invalid uncompressed length {0}")]
    InvalidLength(i64),
    #[error("{codec} decompression failed: {message}")]
    Decompress {
        codec: &'static str,
        message: String,
    },
    #[error("{codec} produced {actual} bytes, expected {expected}")]
    LengthMismatch {
        codec: &'static str,
        expected: usize,
        actual: usize,
    },
}

pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decompress `input`, which is known to expand to `uncompressed_len`
    /// bytes.
    fn decompress(&self, input: &[u8], uncompressed_len: usize) -> Result<Vec<u8>, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4FrameCodec;

impl Codec for Lz4FrameCodec {
    fn name(&self) -> &'static str {
        "LZ4_FRAME"
    }

    fn decompress(&self, input: &[u8], uncompressed_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut output = Vec::with_capacity(uncompressed_len);
        lz4_flex::frame::FrameDecoder::new(input)
            .read_to_end(&mut output)
            .map_err(|e| CodecError::Decompress {
                codec: self.name(),
                message: e.to_string(),
            })?;
        Ok(output)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn name(&self) -> &'static str {
        "ZSTD"
    }

    fn decompress(&self, input: &[u8], uncompressed_len: usize) -> Result<Vec<u8>, CodecError> {
        zstd::bulk::decompress(input, uncompressed_len).map_err(|e| CodecError::Decompress {
            codec: self.name(),
            message: e.to_string(),
        })
    }
}

static REGISTRY: LazyLock<RwLock<HashMap<i8, Arc<dyn Codec>>>> = LazyLock::new(RwLock::default);
static BUILTIN: Once = Once::new();

/// Register the built-in codecs. Safe to call any number of times.
pub fn init_codecs() {
    BUILTIN.call_once(|| {
        register(CompressionType::LZ4_FRAME, Arc::new(Lz4FrameCodec));
        register(CompressionType::ZSTD, Arc::new(ZstdCodec));
    });
}

/// Install `codec` for `kind`, replacing any previous registration.
pub fn register(kind: CompressionType, codec: Arc<dyn Codec>) {
    debug!("Registering {} codec", codec.name());
    REGISTRY
        .write()
        .expect("Lock should not be poisoned as the critical section doesn't panic")
        .insert(kind.0, codec);
}

pub fn lookup(kind: CompressionType) -> Result<Arc<dyn Codec>, CodecError> {
    REGISTRY
        .read()
        .expect("Lock should not be poisoned as the critical section doesn't panic")
        .get(&kind.0)
        .cloned()
        .ok_or_else(|| {
            CodecError::Unregistered(
                kind.variant_name()
                    .map_or_else(|| format!("#{}", kind.0), str::to_string),
            )
        })
}

/// Decode one compressed body buffer.
///
/// The frame is an 8-byte little-endian uncompressed length followed by the
/// compressed payload. A length of `-1` marks a payload stored as-is.
pub fn decode_buffer(codec: &dyn Codec, frame: &[u8]) -> Result<Buffer, CodecError> {
    if frame.is_empty() {
        return Ok(Buffer::from(MutableBuffer::new(0)));
    }
    let (prefix, payload) = frame
        .split_first_chunk::<LENGTH_PREFIX>()
        .ok_or(CodecError::Truncated(frame.len()))?;
    let length = i64::from_le_bytes(*prefix);
    if length == LENGTH_NO_COMPRESSED_DATA {
        return Ok(copy_aligned(payload));
    }
    let expected = usize::try_from(length).map_err(|_| CodecError::InvalidLength(length))?;
    let decoded = codec.decompress(payload, expected)?;
    if decoded.len() != expected {
        return Err(CodecError::LengthMismatch {
            codec: codec.name(),
            expected,
            actual: decoded.len(),
        });
    }
    Ok(align(Buffer::from_vec(decoded)))
}

#[must_use]
pub fn is_aligned(buffer: &Buffer) -> bool {
    buffer.as_ptr().align_offset(ALIGNMENT) == 0
}

/// Return `buffer` unchanged when aligned, otherwise an aligned copy.
#[must_use]
pub fn align(buffer: Buffer) -> Buffer {
    if is_aligned(&buffer) {
        buffer
    } else {
        copy_aligned(buffer.as_slice())
    }
}

fn copy_aligned(bytes: &[u8]) -> Buffer {
    let mut aligned = MutableBuffer::new(bytes.len());
    aligned.extend_from_slice(bytes);
    aligned.into()
}
