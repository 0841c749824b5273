//! The structured error type shared by every combinator and HTTP helper.
//!
//! Unlike a plain error enum, [`Error`] is a wire-oriented value: it carries a
//! numeric code, a human message, an optional machine key, an HTTP status
//! hint, a free-form params map, and an optional alternative body that
//! overrides the default serialization entirely. Reserved code ranges are
//! collected in [`codes`].

use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Reserved error codes.
///
/// Negative codes are produced when a user closure panics inside a
/// combinator. Small positive codes belong to the timing combinators, the
/// 4000 range to the transport, 5019 to configuration loading, and the 9000
/// range to JSON response decoding.
pub mod codes {
    /// A pure `map` closure panicked.
    pub const MAP_FAILURE: i32 = -1;
    /// A `then` sequencing closure panicked.
    pub const SEQUENCE_FAILURE: i32 = -2;
    /// A `catch_then` recovery closure panicked.
    pub const RECOVER_FAILURE: i32 = -3;
    /// The underlying timer reported a failure. Reserved: tokio's steady
    /// timer cannot fail, so this code is kept for wire compatibility only.
    pub const TIMER_ERROR: i32 = 1;
    /// The operation did not complete within the allotted duration.
    pub const TIMEOUT: i32 = 2;
    /// Polling exhausted its attempts without becoming satisfied.
    pub const POLL_EXHAUSTED: i32 = 3;
    /// An invalid argument or an unavailable response.
    pub const INVALID_ARGUMENT: i32 = 400;
    /// The connection attempt timed out.
    pub const CONNECTION_TIMEOUT: i32 = 4001;
    /// The connection was refused by the peer.
    pub const CONNECTION_REFUSED: i32 = 4002;
    /// The host was unreachable, or the transport failed in some other way.
    pub const HOST_UNREACHABLE: i32 = 4003;
    /// Name resolution failed.
    pub const DNS_LOOKUP_FAILED: i32 = 4004;
    /// Configuration content was not found or unreadable.
    pub const CONFIG_UNREADABLE: i32 = 5019;
    /// The response body was empty where JSON was expected.
    pub const JSON_MALFORMED: i32 = 9000;
    /// The response body failed low-level JSON parsing.
    pub const JSON_DECODE: i32 = 9001;
    /// The JSON parsed but did not match the requested type.
    pub const JSON_TYPE_MISMATCH: i32 = 9003;
    /// A required JSON field was missing.
    pub const JSON_MISSING_FIELD: i32 = 9004;
    /// The JSON did not conform to the expected schema.
    pub const JSON_INVALID_SCHEMA: i32 = 9005;
}

fn default_response_status() -> i32 {
    500
}

fn default_content_type() -> String {
    "application/json".to_string()
}

/// Structured failure value.
///
/// Every [`crate::IO`](crate::io::IO) chain resolves to `Result<T, Error>`.
/// The `code` is always populated; `params` is always a map (possibly empty);
/// if `alternative_body` is set it becomes the entire serialized error body.
///
/// # Examples
///
/// ```
/// use tidewater::{codes, Error};
///
/// let err = Error::new(codes::TIMEOUT, "Operation timed out")
///     .with_key("timeout")
///     .with_status(504);
/// assert_eq!(err.code, 2);
/// assert_eq!(err.response_status, 504);
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error, Deserialize)]
#[error("[Error {code}] {what}")]
pub struct Error {
    /// Numeric category. See [`codes`] for the reserved ranges.
    pub code: i32,
    /// Human-readable message.
    #[serde(default)]
    pub what: String,
    /// Optional machine key for i18n or categorization.
    #[serde(default)]
    pub key: String,
    /// HTTP status hint. Defaults to 500.
    #[serde(default = "default_response_status")]
    pub response_status: i32,
    /// Free-form context, e.g. `response_body_preview`.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Content type governing the wire form. Defaults to `application/json`.
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// When set, this value serialized as JSON is the entire error body.
    #[serde(default)]
    pub alternative_body: Option<Value>,
}

impl Error {
    /// Creates an error with the given code and message; all other fields
    /// take their defaults.
    pub fn new(code: i32, what: impl Into<String>) -> Self {
        Error {
            code,
            what: what.into(),
            key: String::new(),
            response_status: default_response_status(),
            params: Map::new(),
            content_type: default_content_type(),
            alternative_body: None,
        }
    }

    /// Sets the machine key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Sets the HTTP status hint.
    pub fn with_status(mut self, status: i32) -> Self {
        self.response_status = status;
        self
    }

    /// Inserts a context parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Returns `true` when the failure is worth retrying: transport
    /// failures, timeouts, and 5xx statuses. Decode failures and invalid
    /// arguments are not.
    pub fn is_retryable(&self) -> bool {
        match self.code {
            codes::TIMEOUT | codes::CONNECTION_TIMEOUT | codes::CONNECTION_REFUSED => true,
            codes::HOST_UNREACHABLE | codes::DNS_LOOKUP_FAILED => true,
            429 => true,
            code => (500..600).contains(&code),
        }
    }

    /// The `{code, what, key, params}` object used inside the default wire
    /// envelope.
    pub fn to_wire_json(&self) -> Value {
        json!({
            "code": self.code,
            "what": self.what,
            "key": self.key,
            "params": Value::Object(self.params.clone()),
        })
    }

    /// Serializes the full response body for this error.
    ///
    /// `alternative_body`, when present, wins outright. Otherwise a JSON
    /// content type yields `{"error": {...}}` and anything else the
    /// `code:`/`what:` plain-text form.
    pub fn to_body_string(&self) -> String {
        if let Some(alternative) = &self.alternative_body {
            return alternative.to_string();
        }
        if self.content_type == "application/json" {
            json!({ "error": self.to_wire_json() }).to_string()
        } else {
            format!("code: {}\nwhat: {}", self.code, self.what)
        }
    }
}
