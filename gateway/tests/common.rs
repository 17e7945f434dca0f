#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{bail, Context};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::timeout;

use gateway::config::Config;
use gateway::publisher::{decompress_frame, PubSocket, Publisher, Subscriber};
use gateway::server::serve_with_publisher;

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| Config {
    print_publisher: false,
    address: SocketAddr::from_str("127.0.0.1:0").unwrap(),
    sender_bindings: "tcp://127.0.0.1:0".to_string(),
    ip_key_salt: None,
    publish_buffer_frames: 1000,
    publish_concurrency_limit: None,
    max_payload_bytes: 1024 * 1024,
    max_frame_bytes: 64 * 1024 * 1024,
    export_prometheus: false,
    otel_url: None,
    otel_sampling_rate: 0.0,
    otel_service_name: "gateway-testing".to_string(),
    log_level: tracing::Level::INFO,
});

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    endpoints: Vec<String>,
    max_frame_bytes: usize,
    shutdown: Arc<Notify>,
    client: reqwest::Client,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = PubSocket::bind(
            &config.bindings(),
            config.publish_buffer_frames,
            config.max_frame_bytes,
        )
            .await
            .expect("failed to bind publish socket");
        let endpoints = socket.local_endpoints();
        let max_frame_bytes = config.max_frame_bytes;
        let publisher: Arc<dyn Publisher + Send + Sync> = Arc::new(socket);

        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();
        tokio::spawn(serve_with_publisher(
            config,
            listener,
            publisher,
            async move { notify.notified().await },
        ));

        Self {
            addr,
            endpoints,
            max_frame_bytes,
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    /// Connects an announcer and waits until the publish socket has registered it.
    pub async fn subscribe(&self) -> Subscriber {
        let subscriber = Subscriber::connect(&self.endpoints[0], self.max_frame_bytes)
            .await
            .expect("failed to connect subscriber");
        // Frames sent before the subscriber's writer task starts would be missed
        tokio::time::sleep(Duration::from_millis(100)).await;
        subscriber
    }

    pub async fn upload(
        &self,
        body: impl Into<reqwest::Body>,
        content_encoding: Option<&str>,
        content_type: Option<&str>,
    ) -> reqwest::Response {
        let mut request = self
            .client
            .post(format!("http://{}/upload/", self.addr))
            .body(body);
        if let Some(encoding) = content_encoding {
            request = request.header(CONTENT_ENCODING, encoding);
        }
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }
        request.send().await.expect("failed to send request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("http://{}{}", self.addr, path))
            .send()
            .await
            .expect("failed to send request")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}

pub async fn next_message(subscriber: &mut Subscriber) -> anyhow::Result<Value> {
    let frame = match timeout(Duration::from_secs(5), subscriber.recv()).await {
        Ok(Some(frame)) => frame?,
        Ok(None) => bail!("publisher went away"),
        Err(_) => bail!("timed out waiting for a frame"),
    };
    let json = decompress_frame(&frame).context("frame is not zlib")?;
    Ok(serde_json::from_slice(&json)?)
}

pub async fn assert_no_message(subscriber: &mut Subscriber) {
    assert!(
        timeout(Duration::from_millis(500), subscriber.recv())
            .await
            .is_err(),
        "subscriber received an unexpected frame"
    );
}

pub fn gzip(input: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input).unwrap();
    encoder.finish().unwrap()
}

pub fn zlib(input: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input).unwrap();
    encoder.finish().unwrap()
}

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}_{}", prefix, suffix)
}
