use serde::Serialize;
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::instrument;

use crate::api::GatewayError;
use crate::payload::NormalizedPayload;

pub const UPLOAD_KEYS_FIELD: &str = "upload_keys";
pub const UPLOAD_KEY_NAME: &str = "EMDR";

/// Provenance entry appended to salted uploads. The key is a salted hash of the
/// uploader's address, so that consumers can group uploads without learning the address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadKey {
    pub name: &'static str,
    pub key: String,
}

impl UploadKey {
    pub fn for_remote_addr(salt: &str, remote_addr: &str) -> UploadKey {
        let mut hasher = Sha1::new();
        hasher.update(salt.as_bytes());
        hasher.update(remote_addr.as_bytes());

        UploadKey {
            name: UPLOAD_KEY_NAME,
            key: hex::encode(hasher.finalize()),
        }
    }
}

/// Parses a canonical payload and, when a salt is configured, stamps it with the
/// uploader's upload key.
#[instrument(skip_all, fields(salted = salt.is_some()))]
pub fn parse_and_augment(
    payload: &NormalizedPayload,
    remote_addr: &str,
    salt: Option<&str>,
) -> Result<Value, GatewayError> {
    let mut message: Value = serde_json::from_slice(&payload.body)?;

    if let Some(salt) = salt {
        append_upload_key(&mut message, UploadKey::for_remote_addr(salt, remote_addr))?;
    }

    Ok(message)
}

pub fn append_upload_key(message: &mut Value, key: UploadKey) -> Result<(), GatewayError> {
    let fields = match message {
        Value::Object(fields) => fields,
        other => {
            return Err(GatewayError::ParseError(format!(
                "upload must be a JSON object to receive {UPLOAD_KEYS_FIELD}, got {}",
                json_kind(other)
            )))
        }
    };

    let keys = fields
        .entry(UPLOAD_KEYS_FIELD)
        .or_insert_with(|| Value::Array(Vec::new()));
    if keys.is_null() {
        *keys = Value::Array(Vec::new());
    }

    match keys {
        Value::Array(keys) => {
            keys.push(serde_json::to_value(key)?);
            Ok(())
        }
        other => Err(GatewayError::ParseError(format!(
            "{UPLOAD_KEYS_FIELD} must be an array, got {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use bytes::Bytes;
    use serde_json::json;

    use super::{parse_and_augment, UploadKey};
    use crate::api::GatewayError;
    use crate::payload::{NormalizedPayload, PayloadSource};

    fn payload(body: &'static str) -> NormalizedPayload {
        NormalizedPayload {
            body: Bytes::from(body),
            source: PayloadSource::Raw,
        }
    }

    #[test]
    fn parses_without_salt() {
        let message = parse_and_augment(&payload(r#"{"a":1}"#), "10.0.0.1", None).unwrap();
        assert_json_eq!(message, json!({"a": 1}));

        // Without a salt, any JSON value goes through untouched
        let message = parse_and_augment(&payload("[1,2]"), "10.0.0.1", None).unwrap();
        assert_json_eq!(message, json!([1, 2]));
    }

    #[test]
    fn parse_errors_carry_the_parser_message() {
        for body in ["", "{", r#"{"a":}"#, "not json"] {
            let expected = serde_json::from_str::<serde_json::Value>(body)
                .unwrap_err()
                .to_string();
            assert_eq!(
                parse_and_augment(&payload(body), "10.0.0.1", None),
                Err(GatewayError::ParseError(expected))
            );
        }
    }

    #[test]
    fn creates_upload_keys() {
        let message =
            parse_and_augment(&payload(r#"{"a":1}"#), "10.0.0.1", Some("salt")).unwrap();
        let key = UploadKey::for_remote_addr("salt", "10.0.0.1").key;
        assert_json_eq!(
            message,
            json!({"a": 1, "upload_keys": [{"name": "EMDR", "key": key}]})
        );
    }

    #[test]
    fn appends_to_existing_upload_keys() {
        let body = r#"{"upload_keys":[{"name":"client","key":"abc"}]}"#;
        let message = parse_and_augment(&payload(body), "10.0.0.1", Some("salt")).unwrap();
        let key = UploadKey::for_remote_addr("salt", "10.0.0.1").key;
        assert_json_eq!(
            message,
            json!({"upload_keys": [
                {"name": "client", "key": "abc"},
                {"name": "EMDR", "key": key},
            ]})
        );

        let message =
            parse_and_augment(&payload(r#"{"upload_keys":null}"#), "10.0.0.1", Some("salt"))
                .unwrap();
        assert_eq!(message["upload_keys"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn rejects_non_objects_when_salted() {
        for body in ["[1,2]", "\"text\"", "42", "null", "true"] {
            let err = parse_and_augment(&payload(body), "10.0.0.1", Some("salt")).unwrap_err();
            assert!(matches!(err, GatewayError::ParseError(_)), "{body}");
        }

        let err = parse_and_augment(&payload(r#"{"upload_keys":"x"}"#), "10.0.0.1", Some("salt"))
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::ParseError("upload_keys must be an array, got string".to_string())
        );
    }

    #[test]
    fn upload_key_hash() {
        let first = UploadKey::for_remote_addr("salt", "10.0.0.1");
        assert_eq!(first.name, "EMDR");
        assert_eq!(first.key.len(), 40);
        assert!(!first.key.contains("10.0.0.1"));

        // Deterministic per address, distinct across addresses and salts
        assert_eq!(first, UploadKey::for_remote_addr("salt", "10.0.0.1"));
        assert_ne!(first, UploadKey::for_remote_addr("salt", "10.0.0.2"));
        assert_ne!(first, UploadKey::for_remote_addr("pepper", "10.0.0.1"));

        // sha1("salt10.0.0.1")
        let mut hasher = <sha1::Sha1 as sha1::Digest>::new();
        sha1::Digest::update(&mut hasher, b"salt10.0.0.1");
        assert_eq!(first.key, hex::encode(sha1::Digest::finalize(hasher)));
    }
}
