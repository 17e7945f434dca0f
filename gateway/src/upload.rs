use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap};
use bytes::Bytes;
use metrics::counter;
use tracing::instrument;

use crate::api::{GatewayError, UPLOAD_OK};
use crate::message::parse_and_augment;
use crate::payload::{NormalizedPayload, RawUpload};
use crate::prometheus::report_rejected_upload;
use crate::router;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Accepts a market data upload and hands it to the broadcaster.
///
/// The response never waits for the publish to happen.
#[instrument(
    skip_all,
    fields(remote_addr, content_encoding, content_type, source)
)]
pub async fn upload(
    state: State<router::State>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, GatewayError> {
    let remote_addr = remote_address(&headers, &peer);
    let content_encoding = headers
        .get(header::CONTENT_ENCODING)
        .map_or("", |v| v.to_str().unwrap_or("unknown"));
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .map_or("", |v| v.to_str().unwrap_or("unknown"));

    tracing::Span::current().record("remote_addr", remote_addr.as_str());
    tracing::Span::current().record("content_encoding", content_encoding);
    tracing::Span::current().record("content_type", content_type);

    counter!("gateway_uploads_received_total").increment(1);

    let upload = RawUpload::from_parts(&headers, body);
    let payload = NormalizedPayload::from_upload(upload, state.max_payload_bytes)
        .await
        .map_err(|err| reject(&remote_addr, err))?;
    tracing::Span::current().record("source", payload.source.as_str());

    let message = parse_and_augment(&payload, &remote_addr, state.salt.as_deref())
        .map_err(|err| reject(&remote_addr, err))?;

    state.broadcaster.dispatch(message);

    counter!("gateway_uploads_accepted_total", "source" => payload.source.as_str()).increment(1);
    tracing::info!("accepted {} upload from {}", payload.source.as_str(), remote_addr);

    Ok(UPLOAD_OK)
}

/// Address the upload is attributed to, and hashed into its upload key.
///
/// The `X-Forwarded-For` value is taken as sent, proxy chain included, so keys stay
/// stable for consumers grouping uploads by them. Without it, the peer IP is used.
pub fn remote_address(headers: &HeaderMap, peer: &SocketAddr) -> String {
    headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| peer.ip().to_string(), String::from)
}

fn reject(remote_addr: &str, err: GatewayError) -> GatewayError {
    report_rejected_upload(err.cause());
    tracing::warn!("rejected upload from {}: {}", remote_addr, err);
    err
}
