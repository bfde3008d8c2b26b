//! Error types for MTA lifecycle operations.

use thiserror::Error;

/// The deploy service answered, but not in the shape the protocol requires.
///
/// These are fatal for the call that hit them and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The CSRF token endpoint did not return an `x-csrf-token` header.
    #[error("CSRF token response carried no x-csrf-token header")]
    MissingCsrfToken,

    /// The CSRF token endpoint did not set the session cookies.
    #[error("CSRF token response set {found} session cookie(s), expected at least 2")]
    MissingSessionCookies { found: usize },

    /// A token or cookie value could not be sent back as a request header.
    #[error("CSRF credentials cannot be sent as a {header} header")]
    MalformedCredentials { header: String },

    /// An accepted (202) response carried no `Location` header.
    #[error("accepted response carried no Location header")]
    MissingLocation,

    /// The `Location` header could not be read as a URL.
    #[error("Location header is not a valid URL: {value}")]
    MalformedLocation { value: String },

    /// The `Location` URL is well formed but does not point at an operation or job.
    #[error("did not find operation or job id in location path {path}")]
    NoJobId { path: String },

    /// A call that must complete synchronously was accepted as a job instead.
    #[error("call was unexpectedly accepted for asynchronous processing as {id}")]
    UnexpectedAsync { id: String },

    /// A call that must be processed asynchronously completed synchronously.
    #[error("expected 202 Accepted, got {status}")]
    NotAccepted { status: u16 },
}

/// Errors that can occur while talking to the deploy service.
#[derive(Error, Debug)]
pub enum MtaError {
    /// HTTP request failed (connection, DNS, timeout).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local I/O failed (reading an archive to upload).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The service violated the request protocol.
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// API returned an error response.
    #[error("API error: {status} {status_text} - {body}")]
    Api {
        status: u16,
        status_text: String,
        body: String,
    },

    /// An operation reached the ERROR state.
    #[error("Operation {operation_id} failed: {detail}")]
    OperationFailed {
        operation_id: String,
        detail: String,
    },

    /// An upload job reached the ERROR state.
    #[error("Upload job {job_id} failed with {message}")]
    JobFailed { job_id: String, message: String },

    /// Zero or more than one MTA matched a name/namespace lookup.
    #[error("no mta found with given id {mta_id} in namespace '{namespace}' ({matches} matches)")]
    MtaNotFound {
        mta_id: String,
        namespace: String,
        matches: usize,
    },

    /// A remote archive was served with a content type other than a binary file.
    #[error("archive at {url} has content type '{content_type}', expected application/octet-stream")]
    InvalidContentType { url: String, content_type: String },

    /// Polling was cancelled before the tracked operation or job settled.
    #[error("Polling of {id} was cancelled")]
    Cancelled { id: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Caller supplied an unusable argument.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl MtaError {
    /// Whether this is the dedicated "MTA not found" signal.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::MtaNotFound { .. })
    }

    /// Whether this error came from a cancelled poll.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<url::ParseError> for MtaError {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("invalid URL: {err}"))
    }
}
