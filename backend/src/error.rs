use std::fmt;
use std::fmt::Formatter;

/// Error type for calls to the conversion backend or to object storage.
///
/// The variants matter to callers: authorization failures are never retried
/// at this layer (the whole conversion flow has to restart with a fresh
/// credential), while transport and status errors are fair game for the
/// uploader's retry budget.
///
#[derive(Debug)]
pub enum ApiError {
    /// The backend rejected the session credential (401 or 403).
    ///
    Unauthorized {
        /// The HTTP status code that was returned.
        status: u16,
    },

    /// Any other non-2xx response.
    ///
    Status {
        /// The HTTP status code that was returned.
        status: u16,

        /// The response body, for diagnostics.
        body: String,
    },

    /// A connection-level failure before a response was received.
    ///
    Transport(reqwest::Error),

    /// The response arrived but did not match the wire contract.
    ///
    Malformed(String),

    /// Object storage acknowledged a part PUT without returning an `ETag`.
    ///
    MissingEtag,
}

impl ApiError {
    /// Classify a non-2xx status code into the right variant.
    ///
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ApiError::Unauthorized { status },
            _ => ApiError::Status { status, body },
        }
    }

    /// Whether this error is an authorization rejection from the backend.
    ///
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// Whether a retry with the same inputs could plausibly succeed.
    ///
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Unauthorized { .. } => false,
            ApiError::Status { .. } => true,
            ApiError::Transport(_) => true,
            ApiError::Malformed(_) => false,
            ApiError::MissingEtag => true,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Unauthorized { status } => {
                write!(f, "backend rejected session credential (status {})", status)
            }
            ApiError::Status { status, body } => {
                if body.is_empty() {
                    write!(f, "unexpected status {}", status)
                } else {
                    write!(f, "unexpected status {}: {}", status, body)
                }
            }
            ApiError::Transport(err) => write!(f, "transport failure: {}", err),
            ApiError::Malformed(reason) => write!(f, "malformed response: {}", reason),
            ApiError::MissingEtag => write!(f, "object storage returned no ETag for uploaded part"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_statuses() {
        assert!(ApiError::from_status(401, String::new()).is_unauthorized());
        assert!(ApiError::from_status(403, String::new()).is_unauthorized());
        assert!(!ApiError::from_status(500, String::new()).is_unauthorized());
        assert!(!ApiError::from_status(404, String::new()).is_unauthorized());
    }

    #[test]
    fn test_retryability() {
        assert!(!ApiError::from_status(401, String::new()).is_retryable());
        assert!(ApiError::from_status(503, String::new()).is_retryable());
        assert!(ApiError::MissingEtag.is_retryable());
        assert!(!ApiError::Malformed("bad".into()).is_retryable());
    }

    #[test]
    fn test_display_includes_status_and_body() {
        let err = ApiError::from_status(502, "bad gateway".into());
        let message = err.to_string();
        assert!(message.contains("502"));
        assert!(message.contains("bad gateway"));
    }
}
