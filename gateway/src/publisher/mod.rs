use std::io::{self, Read, Write};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

pub mod socket;

pub use socket::{PubSocket, Subscriber};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("invalid publish endpoint {0}, expected tcp://host:port or ipc:///path")]
    InvalidEndpoint(String),
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode frame: {0}")]
    Encoding(String),
    #[error("frame of {size} bytes exceeds the {max} bytes limit")]
    FrameTooLarge { size: usize, max: usize },
    #[error("publisher I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("publisher is closed")]
    Closed,
}

/// Process-wide publish side of the announcer bus.
///
/// Implementations must write each frame atomically: two frames are never interleaved
/// on the wire. No ordering across frames and no acknowledgment are provided.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, frame: Bytes) -> Result<(), PublishError>;

    /// Stops accepting frames and releases the bound endpoints.
    async fn close(&self) {}
}

pub struct PrintPublisher {}

#[async_trait]
impl Publisher for PrintPublisher {
    async fn publish(&self, frame: Bytes) -> Result<(), PublishError> {
        let json = decompress_frame(&frame)?;
        info!("frame: {}", String::from_utf8_lossy(&json));
        counter!("gateway_publish_frames_total").increment(1);

        Ok(())
    }
}

/// Serializes a message and zlib-compresses it into a publish frame.
pub fn envelope(message: &Value) -> Result<Bytes, PublishError> {
    let json = serde_json::to_vec(message).map_err(|e| PublishError::Encoding(e.to_string()))?;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?.into())
}

/// Inflates a frame back into its JSON document, for subscribers.
pub fn decompress_frame(frame: &[u8]) -> io::Result<Vec<u8>> {
    let mut json = Vec::new();
    ZlibDecoder::new(frame).read_to_end(&mut json)?;
    Ok(json)
}
