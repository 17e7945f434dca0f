use std::io::prelude::*;

use axum::http::{header, HeaderMap};
use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use flate2::{Decompress, FlushDecompress, Status};
use futures::stream;
use multer::Multipart;
use tracing::instrument;

use crate::api::GatewayError;

static GZIP_MAGIC_NUMBERS: [u8; 3] = [0x1f, 0x8b, 8];

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const MULTIPART_CONTENT_TYPE: &str = "multipart/form-data";
const FORM_DATA_KEY: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
}

impl ContentEncoding {
    /// Only gzip and deflate are decompressed, anything else goes through the uncompressed path.
    pub fn from_header(value: &str) -> Option<ContentEncoding> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" => Some(ContentEncoding::Gzip),
            "deflate" => Some(ContentEncoding::Deflate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
        }
    }
}

/// Decoding path that produced a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Raw,
    DecompressedRaw,
    Form,
    MultipartForm,
    DecompressedForm,
}

impl PayloadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadSource::Raw => "raw",
            PayloadSource::DecompressedRaw => "decompressed_raw",
            PayloadSource::Form => "form",
            PayloadSource::MultipartForm => "multipart_form",
            PayloadSource::DecompressedForm => "decompressed_form",
        }
    }
}

/// Form encoding announced by the request content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormEncoding {
    None,
    UrlEncoded,
    Multipart { boundary: String },
}

impl FormEncoding {
    fn from_content_type(content_type: &str) -> FormEncoding {
        let mime = content_type.split(';').next().unwrap_or_default().trim();
        if mime.eq_ignore_ascii_case(FORM_CONTENT_TYPE) {
            return FormEncoding::UrlEncoded;
        }
        if mime.eq_ignore_ascii_case(MULTIPART_CONTENT_TYPE) {
            return match multer::parse_boundary(content_type) {
                Ok(boundary) => FormEncoding::Multipart { boundary },
                Err(e) => {
                    tracing::debug!("ignoring multipart body without boundary: {}", e);
                    FormEncoding::None
                }
            };
        }
        FormEncoding::None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FormEncoding::None => "none",
            FormEncoding::UrlEncoded => "urlencoded",
            FormEncoding::Multipart { .. } => "multipart",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawUpload {
    pub body: Bytes,
    pub content_encoding: Option<ContentEncoding>,
    pub form: FormEncoding,
}

impl RawUpload {
    pub fn from_parts(headers: &HeaderMap, body: Bytes) -> RawUpload {
        let content_encoding = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .and_then(ContentEncoding::from_header);
        let form = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(FormEncoding::None, FormEncoding::from_content_type);

        RawUpload {
            body,
            content_encoding,
            form,
        }
    }
}

/// Canonical bytes believed to be JSON, and how they were obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPayload {
    pub body: Bytes,
    pub source: PayloadSource,
}

impl NormalizedPayload {
    /// Normalizes an upload body into its canonical payload.
    ///
    /// Compressed bodies are inflated first, and can then either be a raw payload or
    /// a form-encoded one that carries the payload in its `data` field. For
    /// uncompressed bodies, a form is only considered when the content type says so.
    #[instrument(skip_all, fields(encoding, form = upload.form.as_str()))]
    pub async fn from_upload(
        upload: RawUpload,
        max_bytes: usize,
    ) -> Result<NormalizedPayload, GatewayError> {
        tracing::debug!(len = upload.body.len(), "normalizing new upload");

        if let Some(encoding) = upload.content_encoding {
            tracing::Span::current().record("encoding", encoding.as_str());
            let inflated = decompress(upload.body, max_bytes)?;
            return match FormBody::detect(&inflated) {
                FormBody::NotForm => Ok(NormalizedPayload {
                    body: inflated,
                    source: PayloadSource::DecompressedRaw,
                }),
                FormBody::Form(Some(data)) => Ok(NormalizedPayload {
                    body: Bytes::from(data),
                    source: PayloadSource::DecompressedForm,
                }),
                FormBody::Form(None) => Err(GatewayError::MalformedUpload),
            };
        }

        let form_data = match &upload.form {
            FormEncoding::None => None,
            FormEncoding::UrlEncoded => match FormBody::parse(&upload.body) {
                FormBody::Form(Some(data)) => Some((data, PayloadSource::Form)),
                _ => None,
            },
            FormEncoding::Multipart { boundary } => {
                multipart_data(upload.body.clone(), boundary.clone())
                    .await
                    .map(|data| (data, PayloadSource::MultipartForm))
            }
        };

        Ok(match form_data {
            Some((data, source)) => NormalizedPayload {
                body: Bytes::from(data),
                source,
            },
            None => NormalizedPayload {
                body: upload.body,
                source: PayloadSource::Raw,
            },
        })
    }
}

/// First non-blank `data` field of a multipart body. File parts don't count as form
/// fields, and a body that fails to parse is treated as having no form at all.
async fn multipart_data(body: Bytes, boundary: String) -> Option<String> {
    let body = stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = Multipart::new(body, boundary);

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!("failed to parse multipart body: {}", e);
                return None;
            }
        };
        if field.name() != Some(FORM_DATA_KEY) || field.file_name().is_some() {
            continue;
        }
        match field.text().await {
            Ok(data) if !data.is_empty() => return Some(data),
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("failed to read multipart data field: {}", e);
                return None;
            }
        }
    }
}

enum FormBody {
    NotForm,
    Form(Option<String>),
}

impl FormBody {
    /// Sniffs a decompressed body, where no content type tells us what we're looking at.
    /// JSON documents can hold `=` characters, so anything opening an object or an array
    /// is taken as raw.
    fn detect(bytes: &[u8]) -> FormBody {
        let Ok(text) = std::str::from_utf8(bytes) else {
            return FormBody::NotForm;
        };
        if text.trim_start().starts_with(['{', '[']) {
            return FormBody::NotForm;
        }
        FormBody::parse(bytes)
    }

    /// Blank values are ignored, a form needs at least one key with a value.
    fn parse(bytes: &[u8]) -> FormBody {
        let pairs: Vec<(String, String)> = match serde_urlencoded::from_bytes(bytes) {
            Ok(pairs) => pairs,
            Err(_) => return FormBody::NotForm,
        };

        let mut pairs = pairs
            .into_iter()
            .filter(|(key, value)| !key.is_empty() && !value.is_empty())
            .peekable();
        if pairs.peek().is_none() {
            return FormBody::NotForm;
        }

        FormBody::Form(
            pairs
                .find(|(key, _)| key == FORM_DATA_KEY)
                .map(|(_, value)| value),
        )
    }
}

/// Inflates a compressed body. Header detection covers both gzip and zlib framing, some
/// compressors send bare deflate streams instead, so we retry without header and checksum
/// before giving up.
pub fn decompress(bytes: Bytes, max_bytes: usize) -> Result<Bytes, GatewayError> {
    let detected = if bytes.starts_with(&GZIP_MAGIC_NUMBERS) {
        gunzip(bytes.clone(), max_bytes)
    } else {
        inflate(&bytes, true, max_bytes)
    };

    let inflated = match detected {
        Ok(inflated) => Ok(inflated),
        Err(InflateError::TooBig(max_bytes)) => Err(InflateError::TooBig(max_bytes)),
        Err(e) => {
            tracing::debug!("header detection failed, retrying as raw deflate: {}", e);
            inflate(&bytes, false, max_bytes)
        }
    };

    inflated.map(Bytes::from).map_err(|e| {
        tracing::debug!("failed to decompress body: {}", e);
        GatewayError::DecompressionError(e.to_string())
    })
}

#[derive(Debug, thiserror::Error)]
enum InflateError {
    #[error("decompressed payload exceeds {0} bytes")]
    TooBig(usize),
    #[error("incomplete or truncated stream")]
    Truncated,
    #[error("{0}")]
    Invalid(String),
}

fn gunzip(bytes: Bytes, max_bytes: usize) -> Result<Vec<u8>, InflateError> {
    let mut decoder = GzDecoder::new(bytes.reader()).take(max_bytes as u64 + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| InflateError::Invalid(e.to_string()))?;
    if out.len() > max_bytes {
        return Err(InflateError::TooBig(max_bytes));
    }
    Ok(out)
}

fn inflate(bytes: &[u8], zlib_header: bool, max_bytes: usize) -> Result<Vec<u8>, InflateError> {
    let mut decoder = Decompress::new(zlib_header);
    let mut out = Vec::with_capacity(bytes.len().saturating_mul(4).clamp(1024, max_bytes.max(1024)));

    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity());
        }

        let before = (decoder.total_in(), decoder.total_out());
        let consumed = before.0 as usize;
        let status = decoder
            .decompress_vec(&bytes[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| InflateError::Invalid(e.to_string()))?;

        if out.len() > max_bytes {
            return Err(InflateError::TooBig(max_bytes));
        }
        if status == Status::StreamEnd {
            return Ok(out);
        }
        // No progress while there is room left: the input ended before the end of stream marker
        if before == (decoder.total_in(), decoder.total_out()) && out.len() < out.capacity() {
            return Err(InflateError::Truncated);
        }
    }
}
