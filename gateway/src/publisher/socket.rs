//! Publish socket fanning frames out to announcers.
//!
//! Every bound endpoint runs an accept loop, and every connected subscriber gets a
//! single writer task fed by a broadcast channel. Frames are length-delimited on the
//! wire, and a subscriber only ever has one writer, so frames never interleave.
//! Subscribers falling more than the channel capacity behind skip frames: delivery
//! is at-most-once, nothing is retried. Frames over the configured maximum length are
//! refused before fan-out, both ends of a connection must agree on that maximum.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::publisher::{PublishError, Publisher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// host:port, as accepted by `TcpListener::bind`
    Tcp(String),
    #[cfg(unix)]
    Ipc(PathBuf),
}

impl FromStr for Endpoint {
    type Err = PublishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || PublishError::InvalidEndpoint(s.to_string());

        if let Some(addr) = s.strip_prefix("tcp://") {
            let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
            let port: u16 = port.parse().map_err(|_| invalid())?;
            return match host {
                "" => Err(invalid()),
                "*" => Ok(Endpoint::Tcp(format!("0.0.0.0:{port}"))),
                host => Ok(Endpoint::Tcp(format!("{host}:{port}"))),
            };
        }

        parse_ipc(s).ok_or_else(invalid)
    }
}

#[cfg(unix)]
fn parse_ipc(s: &str) -> Option<Endpoint> {
    s.strip_prefix("ipc://")
        .filter(|path| !path.is_empty())
        .map(|path| Endpoint::Ipc(PathBuf::from(path)))
}

#[cfg(not(unix))]
fn parse_ipc(_: &str) -> Option<Endpoint> {
    None
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(unix)]
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

pub struct PubSocket {
    frames: broadcast::Sender<Bytes>,
    max_frame_bytes: usize,
    endpoints: Vec<Endpoint>,
    ipc_paths: Vec<PathBuf>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl PubSocket {
    /// Binds every endpoint and starts accepting subscribers. Fails if any endpoint
    /// is invalid or cannot be bound, releasing the ones already bound.
    pub async fn bind(
        bindings: &[String],
        buffer_frames: usize,
        max_frame_bytes: usize,
    ) -> Result<PubSocket, PublishError> {
        let (frames, _) = broadcast::channel(buffer_frames.max(1));
        let mut socket = PubSocket {
            frames,
            max_frame_bytes,
            endpoints: Vec::with_capacity(bindings.len()),
            ipc_paths: Vec::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };

        if bindings.is_empty() {
            warn!("no publish endpoint configured, frames will be dropped");
        }

        for binding in bindings {
            if let Err(e) = socket.bind_endpoint(binding).await {
                socket.close().await;
                return Err(e);
            }
        }

        Ok(socket)
    }

    async fn bind_endpoint(&mut self, binding: &str) -> Result<(), PublishError> {
        let endpoint: Endpoint = binding.parse()?;
        let bind_error = |source| PublishError::Bind {
            endpoint: binding.to_string(),
            source,
        };

        let local = match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(&addr).await.map_err(bind_error)?;
                let local = Endpoint::Tcp(listener.local_addr()?.to_string());
                self.tasks.spawn(accept_tcp(
                    listener,
                    self.frames.clone(),
                    self.max_frame_bytes,
                    self.shutdown.clone(),
                    self.tasks.clone(),
                ));
                local
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                // Same as zeromq: a socket file left over by a previous process is replaced
                if path.exists() {
                    std::fs::remove_file(&path).map_err(bind_error)?;
                }
                let listener = tokio::net::UnixListener::bind(&path).map_err(bind_error)?;
                self.ipc_paths.push(path.clone());
                self.tasks.spawn(accept_unix(
                    listener,
                    self.frames.clone(),
                    self.max_frame_bytes,
                    self.shutdown.clone(),
                    self.tasks.clone(),
                ));
                Endpoint::Ipc(path)
            }
        };

        info!("publishing on {}", local);
        self.endpoints.push(local);
        Ok(())
    }

    /// Bound endpoints, with ephemeral ports resolved.
    pub fn local_endpoints(&self) -> Vec<String> {
        self.endpoints.iter().map(Endpoint::to_string).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.frames.receiver_count()
    }
}

#[async_trait]
impl Publisher for PubSocket {
    async fn publish(&self, frame: Bytes) -> Result<(), PublishError> {
        if self.shutdown.is_cancelled() {
            return Err(PublishError::Closed);
        }

        histogram!("gateway_publish_frame_bytes").record(frame.len() as f64);
        if frame.len() > self.max_frame_bytes {
            counter!("gateway_publish_dropped_total", "cause" => "oversized").increment(1);
            return Err(PublishError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
        }

        match self.frames.send(frame) {
            Ok(subscribers) => {
                gauge!("gateway_pubsocket_subscribers").set(subscribers as f64);
                counter!("gateway_publish_frames_total").increment(1);
            }
            Err(_) => {
                gauge!("gateway_pubsocket_subscribers").set(0.0);
                counter!("gateway_publish_dropped_total", "cause" => "no_subscribers").increment(1);
            }
        }

        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        for path in &self.ipc_paths {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("failed to remove {}: {}", path.display(), e);
            }
        }
        info!("publish socket closed");
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

async fn accept_tcp(
    listener: TcpListener,
    frames: broadcast::Sender<Bytes>,
    max_frame_bytes: usize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("failed to set TCP_NODELAY: {}", e);
                    }
                    tasks.spawn(serve_subscriber(
                        stream,
                        frames.subscribe(),
                        frame_codec(max_frame_bytes),
                        shutdown.clone(),
                        peer.to_string(),
                    ));
                }
                Err(e) => error!("failed to accept subscriber: {}", e),
            }
        }
    }
}

#[cfg(unix)]
async fn accept_unix(
    listener: tokio::net::UnixListener,
    frames: broadcast::Sender<Bytes>,
    max_frame_bytes: usize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    next_id += 1;
                    tasks.spawn(serve_subscriber(
                        stream,
                        frames.subscribe(),
                        frame_codec(max_frame_bytes),
                        shutdown.clone(),
                        format!("ipc#{next_id}"),
                    ));
                }
                Err(e) => error!("failed to accept subscriber: {}", e),
            }
        }
    }
}

/// Single writer for one subscriber connection. Subscribers never send anything, reads
/// only serve to notice the peer going away. A subscriber that stops reading blocks
/// its own writer only, and shutdown still gets through.
async fn serve_subscriber<S>(
    stream: S,
    mut frames: broadcast::Receiver<Bytes>,
    codec: LengthDelimitedCodec,
    shutdown: CancellationToken,
    peer: String,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let mut sink = FramedWrite::new(writer, codec);
    let mut discard = [0u8; 64];
    debug!("subscriber {} connected", peer);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut discard) => match read {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("subscriber {} read error: {}", peer, e);
                    break;
                }
            },
            frame = frames.recv() => match frame {
                Ok(frame) => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    sent = sink.send(frame) => if let Err(e) = sent {
                        debug!("failed to write to subscriber {}: {}", peer, e);
                        break;
                    },
                },
                Err(RecvError::Lagged(skipped)) => {
                    counter!("gateway_pubsocket_lagged_frames_total").increment(skipped);
                    warn!("subscriber {} is lagging, skipped {} frames", peer, skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    debug!("subscriber {} disconnected", peer);
}

/// Client side of the publish socket, as used by announcers.
pub struct Subscriber {
    frames: FramedRead<Box<dyn AsyncRead + Send + Unpin>, LengthDelimitedCodec>,
}

impl Subscriber {
    /// `max_frame_bytes` must be at least the publisher's, longer frames fail the read.
    pub async fn connect(endpoint: &str, max_frame_bytes: usize) -> Result<Subscriber, PublishError> {
        let io: Box<dyn AsyncRead + Send + Unpin> = match endpoint.parse::<Endpoint>()? {
            Endpoint::Tcp(addr) => Box::new(TcpStream::connect(addr).await?),
            #[cfg(unix)]
            Endpoint::Ipc(path) => Box::new(tokio::net::UnixStream::connect(path).await?),
        };

        Ok(Subscriber {
            frames: FramedRead::new(io, frame_codec(max_frame_bytes)),
        })
    }

    /// Next compressed frame, `None` once the publisher went away.
    pub async fn recv(&mut self) -> Option<Result<Bytes, PublishError>> {
        self.frames
            .next()
            .await
            .map(|frame| frame.map(BytesMut::freeze).map_err(PublishError::from))
    }
}
