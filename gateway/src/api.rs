use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub const UPLOAD_OK: &str = "OK";

pub const MISSING_DATA_KEY: &str = "No 'data' POST key/value found. Check your POST key name for spelling, and make sure you're passing a value.";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GatewayError {
    /// Corrupt or incompatible compressed body, holds the decompressor's message.
    #[error("{0}")]
    DecompressionError(String),
    /// Form-encoded upload without a usable `data` field.
    #[error("{}", MISSING_DATA_KEY)]
    MalformedUpload,
    /// Invalid JSON, or a message that cannot receive upload keys.
    #[error("{0}")]
    ParseError(String),
}

impl GatewayError {
    /// Metric label for the failure kind
    pub fn cause(&self) -> &'static str {
        match self {
            GatewayError::DecompressionError(_) => "decompression",
            GatewayError::MalformedUpload => "malformed_upload",
            GatewayError::ParseError(_) => "parse",
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::ParseError(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::DecompressionError(_)
            | GatewayError::MalformedUpload
            | GatewayError::ParseError(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        }
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use super::{GatewayError, MISSING_DATA_KEY};

    #[test]
    fn every_kind_is_a_client_error() {
        for err in [
            GatewayError::DecompressionError("invalid block type".to_string()),
            GatewayError::MalformedUpload,
            GatewayError::ParseError("EOF while parsing".to_string()),
        ] {
            assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn messages_are_returned_verbatim() {
        let parse_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let expected = parse_error.to_string();
        assert_eq!(GatewayError::from(parse_error).to_string(), expected);
        assert_eq!(GatewayError::MalformedUpload.to_string(), MISSING_DATA_KEY);
        assert_eq!(
            GatewayError::DecompressionError("corrupt deflate stream".to_string()).to_string(),
            "corrupt deflate stream"
        );
    }
}
