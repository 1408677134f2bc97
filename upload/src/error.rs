use std::fmt;
use std::fmt::Formatter;
use std::time::Duration;

use backend::ApiError;

/// Error type for a whole upload task.
///
/// Callers branch on these: authorization failures restart the conversion
/// flow with fresh credentials, `Aborted` is an expected outcome of
/// cancellation rather than a fault, and `Incomplete` carries the counts a
/// user needs to understand a mid-upload interruption.
///
#[derive(Debug)]
pub enum UploadError {
    /// A backend or object-storage call failed unrecovered.
    ///
    Api(ApiError),

    /// One part exhausted its retry budget; the wrapped error is the last
    /// failure observed.
    ///
    PartFailed {
        /// 1-based part number.
        part_number: u32,

        /// How many attempts were made.
        attempts: u32,

        /// The failure of the final attempt.
        source: Box<UploadError>,
    },

    /// Object storage never produced an ETag for this part.
    ///
    MissingEtag {
        /// 1-based part number.
        part_number: u32,
    },

    /// One part-upload attempt exceeded its planned timeout.
    ///
    Timeout {
        /// 1-based part number.
        part_number: u32,
    },

    /// The backend answered the part-completion call without acknowledging
    /// success.
    ///
    CompletionRejected {
        /// 1-based part number.
        part_number: u32,
    },

    /// Finalize reported fewer confirmed parts than the upload produced.
    ///
    Incomplete {
        /// Parts the backend had confirmation for.
        completed: u64,

        /// Parts the backend expected.
        total: u64,
    },

    /// The task was cancelled, by the caller or by the registry.
    ///
    Aborted,

    /// Another live upload session holds this job id.
    ///
    SessionBusy {
        /// Age of the competing session's marker.
        age: Duration,
    },

    /// An upload for this job id or for the same logical file is already
    /// running in this process.
    ///
    DuplicateUpload {
        /// The contested job id.
        job_id: String,
    },

    /// Reading the local source file failed.
    ///
    Io(std::io::Error),

    /// A bookkeeping invariant broke; indicates a bug, not bad input.
    ///
    Internal(String),
}

impl UploadError {
    /// Whether this error is the distinguished cancellation outcome.
    ///
    pub fn is_aborted(&self) -> bool {
        matches!(self, UploadError::Aborted)
    }

    /// Whether the root cause is an authorization rejection, meaning the
    /// caller should refresh credentials and restart the whole flow.
    ///
    pub fn is_unauthorized(&self) -> bool {
        match self.root() {
            UploadError::Api(err) => err.is_unauthorized(),
            _ => false,
        }
    }

    /// Whether the part uploader may spend another attempt on this failure.
    ///
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Api(err) => err.is_retryable(),
            UploadError::MissingEtag { .. } => true,
            UploadError::Timeout { .. } => true,
            UploadError::CompletionRejected { .. } => true,
            UploadError::Aborted => false,
            _ => false,
        }
    }

    /// Unwrap `PartFailed` layers down to the originating failure.
    ///
    pub fn root(&self) -> &UploadError {
        match self {
            UploadError::PartFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Api(err) => write!(f, "{}", err),
            UploadError::PartFailed {
                part_number,
                attempts,
                source,
            } => write!(
                f,
                "part {} failed after {} attempts: {}",
                part_number, attempts, source
            ),
            UploadError::MissingEtag { part_number } => {
                write!(f, "object storage returned no ETag for part {}", part_number)
            }
            UploadError::Timeout { part_number } => {
                write!(f, "part {} upload timed out", part_number)
            }
            UploadError::CompletionRejected { part_number } => {
                write!(f, "backend did not acknowledge completion of part {}", part_number)
            }
            UploadError::Incomplete { completed, total } => write!(
                f,
                "upload incomplete: backend confirmed {} of {} parts \
                 (a page reload or network loss mid-upload is the usual cause)",
                completed, total
            ),
            UploadError::Aborted => write!(f, "upload aborted"),
            UploadError::SessionBusy { age } => write!(
                f,
                "another upload session for this job started {}s ago and is still active",
                age.as_secs()
            ),
            UploadError::DuplicateUpload { job_id } => write!(
                f,
                "an upload for job {} (or the same file) is already in progress",
                job_id
            ),
            UploadError::Io(err) => write!(f, "reading source file failed: {}", err),
            UploadError::Internal(reason) => write!(f, "internal upload error: {}", reason),
        }
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UploadError::Api(err) => Some(err),
            UploadError::PartFailed { source, .. } => Some(source.as_ref()),
            UploadError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ApiError> for UploadError {
    fn from(err: ApiError) -> Self {
        UploadError::Api(err)
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_message_contains_counts() {
        let err = UploadError::Incomplete {
            completed: 8,
            total: 10,
        };
        let message = err.to_string();
        assert!(message.contains('8'));
        assert!(message.contains("10"));
    }

    #[test]
    fn test_unauthorized_detected_through_part_failure() {
        let err = UploadError::PartFailed {
            part_number: 3,
            attempts: 1,
            source: Box::new(UploadError::Api(ApiError::Unauthorized { status: 401 })),
        };
        assert!(err.is_unauthorized());
        assert!(!err.is_aborted());
    }

    #[test]
    fn test_aborted_is_not_retryable() {
        assert!(!UploadError::Aborted.is_retryable());
        assert!(UploadError::Timeout { part_number: 1 }.is_retryable());
        assert!(UploadError::MissingEtag { part_number: 1 }.is_retryable());
    }
}
