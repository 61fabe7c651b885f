// Error handling module
// Defines the authentication error taxonomy shared by strategies, caches and the executor

use thiserror::Error;

/// Errors raised while configuring, acquiring or applying credentials
#[derive(Error, Debug)]
pub enum AuthError {
    /// Malformed or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required field is missing or has an invalid value
    #[error("Validation error: {0}")]
    Validation(String),

    /// The identity provider or site rejected the exchange
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Non-success HTTP status from a protocol endpoint or protected resource
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    /// Network level failure (connect, timeout, broken body)
    #[error("Transport error ({kind}): {message}")]
    Transport { kind: &'static str, message: String },

    /// Credential cache failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Whether the executor may retry the failed call
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Transport { .. })
    }

    /// Process exit code used by the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            AuthError::Config(_) | AuthError::Validation(_) => 2,
            _ => 1,
        }
    }

    /// Build a protocol error from a non-success response body
    pub fn http(status: u16, body: &str) -> Self {
        AuthError::Http {
            status,
            message: truncate(body, 512),
        }
    }
}

/// Categorize a reqwest failure into a coarse error kind
pub fn error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Transport {
            kind: error_kind(&e),
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        AuthError::Config(e.to_string())
    }
}

impl From<std::io::Error> for AuthError {
    fn from(e: std::io::Error) -> Self {
        AuthError::Cache(e.to_string())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Result type alias for authentication operations
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AuthError::Protocol("ID3242: invalid credentials".to_string());
        assert_eq!(err.to_string(), "Protocol error: ID3242: invalid credentials");

        let err = AuthError::Http {
            status: 429,
            message: "Rate limit exceeded".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error: 429 - Rate limit exceeded");

        let err = AuthError::Transport {
            kind: "timeout",
            message: "operation timed out".to_string(),
        };
        assert_eq!(err.to_string(), "Transport error (timeout): operation timed out");
    }

    #[test]
    fn test_config_error_message() {
        let err = AuthError::Config("missing siteUrl".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing siteUrl");
    }

    #[test]
    fn test_internal_error_message() {
        let err = AuthError::Internal(anyhow::anyhow!("Something went wrong"));
        assert_eq!(err.to_string(), "Internal error: Something went wrong");
    }

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(AuthError::Transport {
            kind: "connection_failed",
            message: "reset".to_string()
        }
        .is_retryable());
        assert!(!AuthError::Protocol("bad password".to_string()).is_retryable());
        assert!(!AuthError::Config("x".to_string()).is_retryable());
        assert!(!AuthError::Http {
            status: 503,
            message: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(AuthError::Config("x".into()).exit_code(), 2);
        assert_eq!(AuthError::Validation("x".into()).exit_code(), 2);
        assert_eq!(AuthError::Protocol("x".into()).exit_code(), 1);
        assert_eq!(AuthError::Cache("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_http_body_truncated() {
        let body = "é".repeat(400);
        let err = AuthError::http(500, &body);
        match err {
            AuthError::Http { status, message } => {
                assert_eq!(status, 500);
                assert!(message.ends_with("..."));
                assert!(message.len() <= 515);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_serde_error_is_config() {
        let err: AuthError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, AuthError::Config(_)));
    }
}
