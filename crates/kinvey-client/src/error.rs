//! Client error types and response classification

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Response header carrying the backend-assigned request correlation id
pub const REQUEST_ID_HEADER: &str = "X-Kinvey-Request-Id";

/// Error code reported when a failure body cannot be interpreted
pub const UNKNOWN_ERROR_CODE: &str = "Unknown";

/// Client errors
#[derive(Error, Debug)]
pub enum Error {
    /// A path template placeholder had no bound value
    #[error("Missing value for placeholder '{{{name}}}' in template '{template}'")]
    MissingPlaceholderValue { name: String, template: String },

    /// A request could not be built because its path template did not resolve
    #[error("Invalid template binding: no value for '{{{name}}}' in '{template}'")]
    InvalidTemplateBinding { name: String, template: String },

    /// Base URL rejected at configuration time
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),

    /// The session could not be renewed; the caller must authenticate again
    #[error("Authentication expired")]
    AuthenticationExpired,

    /// Transport-level failure; retrying with backoff may succeed
    #[error("Network error: {0}")]
    TransientNetwork(#[from] reqwest::Error),

    /// Backend failure (5xx) with the parsed error payload
    #[error("Server error ({status}): {error}")]
    Server { status: u16, error: KinveyError },

    /// Request rejected by the backend (4xx) with the parsed error payload
    #[error("Client error ({status}): {error}")]
    Client { status: u16, error: KinveyError },

    /// A resumable transfer was cancelled or ran out of attempts
    #[error("Transfer aborted for '{resource_id}': {reason}")]
    TransferAborted { resource_id: String, reason: String },

    /// Credential or record store failure
    #[error("Store error: {0}")]
    Store(#[from] kinvey_store::StoreError),

    /// Local file IO during a transfer
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization of a request or response body
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Response missing a field the protocol requires
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// Check if retrying the same exchange with backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    /// Check if this is an authentication failure
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::AuthenticationExpired)
            || matches!(self, Self::Client { status: 401, .. })
    }

    /// The structured backend error, when the failure carries one
    pub fn kinvey_error(&self) -> Option<&KinveyError> {
        match self {
            Self::Server { error, .. } | Self::Client { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Check if the failure may be retried for the given verb
    ///
    /// Transport failures are always retryable. Backend 5xx failures are
    /// retryable only for idempotent verbs; a non-idempotent request may
    /// already have taken effect on the server.
    pub(crate) fn is_retryable_for(&self, method: &Method) -> bool {
        match self {
            Self::TransientNetwork(_) => true,
            Self::Server { .. } => is_idempotent(method),
            _ => false,
        }
    }

    /// Check if a transfer chunk exchange may be retried
    ///
    /// Chunk exchanges are range-addressed PUTs and GETs, so 5xx failures
    /// are safe to retry alongside transport failures.
    pub(crate) fn is_retryable_for_transfer(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::Server { .. })
    }

    pub(crate) fn into_template_binding(self) -> Self {
        match self {
            Self::MissingPlaceholderValue { name, template } => {
                Self::InvalidTemplateBinding { name, template }
            }
            other => other,
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
    )
}

/// A structured error reported by the backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KinveyError {
    /// Correlation id tying this failure to the originating request, empty
    /// when the response carried none
    pub request_id: String,
    /// Short machine-readable error code
    pub code: String,
    /// Human-readable description
    pub description: String,
    /// Optional debug payload with request-specific detail
    pub debug: Option<String>,
}

/// Failure body shape used by the backend
#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    debug: Option<Value>,
}

impl KinveyError {
    /// Build a structured error from a failure body
    ///
    /// Never fails: a body that does not parse as the expected JSON shape
    /// produces an `Unknown` error carrying the raw body as its description.
    pub fn from_body(request_id: String, body: &str) -> Self {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => Self {
                request_id,
                code: parsed.error,
                description: parsed.description,
                debug: parsed.debug.map(|value| match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                }),
            },
            Err(_) => Self {
                request_id,
                code: UNKNOWN_ERROR_CODE.to_string(),
                description: body.to_string(),
                debug: None,
            },
        }
    }
}

impl std::fmt::Display for KinveyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.request_id.is_empty() {
            write!(f, "{}: {}", self.code, self.description)
        } else {
            write!(f, "{}: {} [request {}]", self.code, self.description, self.request_id)
        }
    }
}

/// Convert a non-success response into the matching typed error
///
/// Consumes the response body. The correlation id is read case-insensitively
/// from the response headers and left empty when absent or unreadable.
pub(crate) async fn classify_response(response: reqwest::Response) -> Error {
    let status = response.status();
    let request_id = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.text().await.unwrap_or_default();
    let error = KinveyError::from_body(request_id, &body);

    if status.is_server_error() {
        Error::Server {
            status: status.as_u16(),
            error,
        }
    } else {
        Error::Client {
            status: status.as_u16(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_body() {
        let body = r#"{"error":"EntityNotFound","description":"This entity not found in the collection.","debug":""}"#;
        let error = KinveyError::from_body("req-1".to_string(), body);

        assert_eq!(error.code, "EntityNotFound");
        assert_eq!(error.description, "This entity not found in the collection.");
        assert_eq!(error.request_id, "req-1");
    }

    #[test]
    fn test_unparseable_body_falls_back_to_unknown() {
        let body = "<html>Bad Gateway</html>";
        let error = KinveyError::from_body(String::new(), body);

        assert_eq!(error.code, UNKNOWN_ERROR_CODE);
        assert_eq!(error.description, body);
        assert!(error.request_id.is_empty());
    }

    #[test]
    fn test_debug_payload_kept_as_text() {
        let body = r#"{"error":"BadRequest","description":"nope","debug":{"field":"name"}}"#;
        let error = KinveyError::from_body(String::new(), body);

        assert_eq!(error.debug.as_deref(), Some(r#"{"field":"name"}"#));
    }

    #[test]
    fn test_retry_gate_respects_idempotency() {
        let server = Error::Server {
            status: 503,
            error: KinveyError::from_body(String::new(), "{}"),
        };
        assert!(server.is_retryable_for(&Method::GET));
        assert!(server.is_retryable_for(&Method::PUT));
        assert!(!server.is_retryable_for(&Method::POST));

        let client = Error::Client {
            status: 400,
            error: KinveyError::from_body(String::new(), "{}"),
        };
        assert!(!client.is_retryable_for(&Method::GET));
    }

    #[test]
    fn test_missing_placeholder_converts_to_binding_error() {
        let error = Error::MissingPlaceholderValue {
            name: "collection".to_string(),
            template: "appdata/{appKey}/{collection}".to_string(),
        };
        match error.into_template_binding() {
            Error::InvalidTemplateBinding { name, .. } => assert_eq!(name, "collection"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
