//! Error vocabulary for the RPC runtime.
//!
//! Two layers live here. [`RpcError`] is the wire-level call error: it is
//! what a CALLERROR frame carries, what a handler returns to reject a call,
//! and what every failed outbound call resolves to (timeouts, disconnects
//! and aborts are synthesized as [`ErrorCode::GenericError`]). [`Error`] is
//! the library error for connection-level operations such as configuration,
//! dialing and closing.

use serde_json::{Value, json};
use thiserror::Error;

/// Result type for connection-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// OCPP-J wire error codes.
///
/// Both the historical `Occurence…` spelling and the corrected
/// `Occurrence…` spelling appear on the wire; they are distinct wire
/// identities mapping to the same semantic category. Inbound parsing
/// accepts both; outbound code mapping emits the legacy spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Catch-all for errors with no better code.
    GenericError,
    /// The requested method is not implemented by the receiver.
    NotImplemented,
    /// The requested method is recognized but not supported.
    NotSupported,
    /// The receiver failed while executing the method.
    InternalError,
    /// Payload for the method is incomplete or the frame violates protocol.
    ProtocolError,
    /// The sender is not authorized to perform this call.
    SecurityError,
    /// Payload is syntactically incorrect (legacy name).
    FormationViolation,
    /// Payload is syntactically incorrect or violates size/format limits.
    FormatViolation,
    /// A field value violates a property constraint.
    PropertyConstraintViolation,
    /// Occurrence constraint violated (legacy spelling).
    OccurenceConstraintViolation,
    /// Occurrence constraint violated (corrected spelling).
    OccurrenceConstraintViolation,
    /// A field value has the wrong type.
    TypeConstraintViolation,
    /// The message type id is not supported.
    MessageTypeNotSupported,
    /// An error internal to the RPC framework itself.
    RpcFrameworkError,
}

impl ErrorCode {
    /// The exact string this code puts on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GenericError => "GenericError",
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::FormatViolation => "FormatViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            Self::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::MessageTypeNotSupported => "MessageTypeNotSupported",
            Self::RpcFrameworkError => "RpcFrameworkError",
        }
    }

    /// Parse a wire error-code name. Accepts both occurrence spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "GenericError" => Self::GenericError,
            "NotImplemented" => Self::NotImplemented,
            "NotSupported" => Self::NotSupported,
            "InternalError" => Self::InternalError,
            "ProtocolError" => Self::ProtocolError,
            "SecurityError" => Self::SecurityError,
            "FormationViolation" => Self::FormationViolation,
            "FormatViolation" => Self::FormatViolation,
            "PropertyConstraintViolation" => Self::PropertyConstraintViolation,
            "OccurenceConstraintViolation" => Self::OccurenceConstraintViolation,
            "OccurrenceConstraintViolation" => Self::OccurrenceConstraintViolation,
            "TypeConstraintViolation" => Self::TypeConstraintViolation,
            "MessageTypeNotSupported" => Self::MessageTypeNotSupported,
            "RpcFrameworkError" => Self::RpcFrameworkError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed RPC call error.
///
/// Carried by CALLERROR frames in both directions and returned from every
/// failed outbound call.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {description}")]
pub struct RpcError {
    /// Wire error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub description: String,
    /// Free-form details object (empty object when there is nothing to say).
    pub details: Value,
}

impl RpcError {
    /// Create an error with the given code and description and empty details.
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: json!({}),
        }
    }

    /// Attach a details object.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// A `GenericError` with the given description.
    pub fn generic(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::GenericError, description)
    }

    /// The synthetic error resolved into calls that outlive their deadline.
    pub fn timeout() -> Self {
        Self::generic("Call timeout")
    }

    /// The synthetic error resolved into calls when the connection drops.
    pub fn disconnected() -> Self {
        Self::generic("Client disconnected")
    }

    /// The synthetic error resolved into calls rejected by a local close.
    pub fn closing() -> Self {
        Self::generic("Client closing")
    }

    /// The synthetic error resolved into calls cancelled by their signal.
    pub fn aborted() -> Self {
        Self::generic("Call aborted")
    }

    /// True for the synthetic timeout error.
    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::GenericError && self.description == "Call timeout"
    }
}

/// Degrade an arbitrary error into a `{stack, message}` details object.
///
/// Used for detailed CALLERROR payloads when the original value cannot be
/// JSON-serialized as-is.
pub(crate) fn degraded_details(message: &str, stack: Option<&str>) -> Value {
    json!({
        "message": message,
        "stack": stack.unwrap_or(message),
    })
}

/// Errors produced by connection-level operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration detected before any I/O.
    #[error("Configuration error: {message}")]
    Config {
        /// What is wrong with the configuration.
        message: String,
    },

    /// Endpoint URL could not be parsed or manipulated.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// The HTTP upgrade was refused.
    #[error("Handshake rejected: status={status}, {message}")]
    Handshake {
        /// HTTP status the server answered with.
        status: u16,
        /// Reason phrase or body excerpt.
        message: String,
    },

    /// Transport-level failure (socket, TLS, WebSocket protocol).
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the underlying failure.
        message: String,
    },

    /// Non-retryable connect failure; the reconnect loop gives up on these.
    #[error("{message}")]
    Fatal {
        /// One of the fatal connect-error strings.
        message: String,
    },

    /// An operation timed out.
    #[error("Operation timed out after {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: std::time::Duration,
    },

    /// I/O error from a listener or socket.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a fatal (non-retryable) connect error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns `true` if the reconnect loop must not retry after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(resp) => {
                let status = resp.status().as_u16();
                let message = resp
                    .into_body()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default();
                Self::Handshake { status, message }
            }
            other => {
                // tungstenite validates Sec-WebSocket-Accept and subprotocol
                // negotiation itself; those failures are never worth a retry.
                let message = other.to_string();
                const FATAL: &[&str] = &[
                    "Server sent no subprotocol",
                    "Server sent an invalid subprotocol",
                    "Server sent a subprotocol but none was requested",
                ];
                if let Some(fatal) = FATAL.iter().find(|f| message.contains(**f)) {
                    Self::fatal(*fatal)
                } else if message.contains("Sec-WebSocket-Accept") {
                    Self::fatal("Invalid Sec-WebSocket-Accept header")
                } else if message.contains("redirect") {
                    Self::fatal("Maximum redirects exceeded")
                } else {
                    Self::Transport { message }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trips_every_name() {
        let codes = [
            ErrorCode::GenericError,
            ErrorCode::NotImplemented,
            ErrorCode::NotSupported,
            ErrorCode::InternalError,
            ErrorCode::ProtocolError,
            ErrorCode::SecurityError,
            ErrorCode::FormationViolation,
            ErrorCode::FormatViolation,
            ErrorCode::PropertyConstraintViolation,
            ErrorCode::OccurenceConstraintViolation,
            ErrorCode::OccurrenceConstraintViolation,
            ErrorCode::TypeConstraintViolation,
            ErrorCode::MessageTypeNotSupported,
            ErrorCode::RpcFrameworkError,
        ];
        for code in codes {
            assert_eq!(ErrorCode::from_name(code.as_str()), Some(code));
        }
    }

    #[test]
    fn both_occurrence_spellings_parse() {
        assert_eq!(
            ErrorCode::from_name("OccurenceConstraintViolation"),
            Some(ErrorCode::OccurenceConstraintViolation)
        );
        assert_eq!(
            ErrorCode::from_name("OccurrenceConstraintViolation"),
            Some(ErrorCode::OccurrenceConstraintViolation)
        );
        assert_eq!(ErrorCode::from_name("NoSuchCode"), None);
    }

    #[test]
    fn synthetic_errors_use_generic_code() {
        assert_eq!(RpcError::timeout().code, ErrorCode::GenericError);
        assert_eq!(RpcError::disconnected().description, "Client disconnected");
        assert_eq!(RpcError::closing().description, "Client closing");
        assert_eq!(RpcError::aborted().description, "Call aborted");
        assert!(RpcError::timeout().is_timeout());
        assert!(!RpcError::aborted().is_timeout());
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::fatal("Server sent no subprotocol").is_fatal());
        assert!(!Error::transport("connection refused").is_fatal());
    }
}
