//! Input validation for keys and payloads.
//!
//! Validation runs before any storage round trip so malformed input is rejected
//! synchronously.

use chrono::{DateTime, Utc};

use crate::error::ValidationError;

/// Default upper bound on key length, in bytes.
pub const DEFAULT_MAX_KEY_LEN: usize = 256;

/// Default upper bound on serialized payload size, in bytes.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Limits applied to incoming keys and payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLimits {
    /// Maximum key length in bytes.
    pub max_key_len: usize,
    /// Maximum serialized payload size in bytes.
    pub max_payload_bytes: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl InputLimits {
    /// Validates a key and returns it trimmed.
    pub fn key<'a>(&self, field: &'static str, value: &'a str) -> Result<&'a str, ValidationError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyKey { field });
        }
        if trimmed.len() > self.max_key_len {
            return Err(ValidationError::KeyTooLong {
                field,
                max_length: self.max_key_len,
            });
        }
        if trimmed.chars().any(char::is_control) {
            return Err(ValidationError::ControlCharacters { field });
        }
        Ok(trimmed)
    }

    /// Validates that a timestamp fits in signed 64-bit nanoseconds since the
    /// epoch, the widest range every backend can rank without losing precision.
    pub fn timestamp(&self, field: &'static str, at: DateTime<Utc>) -> Result<(), ValidationError> {
        at.timestamp_nanos_opt()
            .map(|_| ())
            .ok_or(ValidationError::TimestampOutOfRange { field })
    }

    /// Validates that a payload is a JSON object within the size limit.
    pub fn payload(&self, payload: &serde_json::Value) -> Result<(), ValidationError> {
        use serde_json::Value;

        let kind = match payload {
            Value::Object(_) => None,
            Value::Null => Some("null"),
            Value::Bool(_) => Some("bool"),
            Value::Number(_) => Some("number"),
            Value::String(_) => Some("string"),
            Value::Array(_) => Some("array"),
        };
        if let Some(kind) = kind {
            return Err(ValidationError::PayloadNotObject { kind });
        }

        // Serializing a Value cannot fail.
        let actual = serde_json::to_vec(payload).map_or(usize::MAX, |b| b.len());
        if actual > self.max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                actual,
                max_bytes: self.max_payload_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_trimmed_and_checked() {
        let limits = InputLimits::default();
        assert_eq!(limits.key("k", "  emp1 ").unwrap(), "emp1");
        assert_eq!(
            limits.key("k", "   "),
            Err(ValidationError::EmptyKey { field: "k" })
        );
        assert_eq!(
            limits.key("k", "a\u{0007}b"),
            Err(ValidationError::ControlCharacters { field: "k" })
        );
    }

    #[test]
    fn test_key_length_limit() {
        let limits = InputLimits {
            max_key_len: 4,
            ..InputLimits::default()
        };
        assert!(limits.key("k", "abcd").is_ok());
        assert!(matches!(
            limits.key("k", "abcde"),
            Err(ValidationError::KeyTooLong { max_length: 4, .. })
        ));
    }

    #[test]
    fn test_payload_must_be_object() {
        let limits = InputLimits::default();
        assert!(limits.payload(&json!({"name": "Ada"})).is_ok());
        assert_eq!(
            limits.payload(&json!(null)),
            Err(ValidationError::PayloadNotObject { kind: "null" })
        );
        assert_eq!(
            limits.payload(&json!([1, 2])),
            Err(ValidationError::PayloadNotObject { kind: "array" })
        );
    }

    #[test]
    fn test_timestamp_range() {
        let limits = InputLimits::default();
        assert!(limits.timestamp("observed_at", Utc::now()).is_ok());
        assert_eq!(
            limits.timestamp("observed_at", DateTime::<Utc>::MAX_UTC),
            Err(ValidationError::TimestampOutOfRange { field: "observed_at" })
        );
    }

    #[test]
    fn test_payload_size_limit() {
        let limits = InputLimits {
            max_payload_bytes: 16,
            ..InputLimits::default()
        };
        assert!(limits.payload(&json!({"a": 1})).is_ok());
        assert!(matches!(
            limits.payload(&json!({"a": "a long string value"})),
            Err(ValidationError::PayloadTooLarge { .. })
        ));
    }
}
