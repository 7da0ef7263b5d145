//! Crate-wide error types (C2/C7/C8 ambient): the typed classification the
//! rest of the engine matches on instead of re-inspecting raw status codes
//! at every call site.

use thiserror::Error;

/// Transport/protocol-level failure from a single DAV request.
#[derive(Debug, Error)]
pub enum DavError {
    #[error("network error: {0}")]
    Network(#[from] hyper_util::client::legacy::Error),

    #[error("request timed out")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("access denied")]
    AccessDenied,

    #[error("resource not found")]
    NotFound,

    /// A mutation (`PUT`/`DELETE`) was rejected by the server with `403`.
    /// Per the soft-success rule this is surfaced to the orchestrator as a
    /// per-item failure, never as a fatal abort of the whole sync.
    #[error("mutation forbidden by server")]
    MutationForbidden,

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl DavError {
    /// Classifies an HTTP status code for a read (non-mutating) request.
    pub fn from_status_read(status: u16, body: impl Into<String>) -> Self {
        match status {
            401 => DavError::AuthenticationRequired,
            403 => DavError::AccessDenied,
            404 => DavError::NotFound,
            _ => DavError::Server { status, body: body.into() },
        }
    }

    /// Classifies an HTTP status code for a `PUT`/`DELETE` mutation, where
    /// `403` is a soft failure rather than an access-denied abort.
    pub fn from_status_mutation(status: u16, body: impl Into<String>) -> Self {
        match status {
            401 => DavError::AuthenticationRequired,
            403 => DavError::MutationForbidden,
            404 => DavError::NotFound,
            _ => DavError::Server { status, body: body.into() },
        }
    }

    /// True for statuses that should trigger a single re-authentication
    /// retry (stale bearer token) before being surfaced to the caller.
    pub fn is_auth_elevation_candidate(&self) -> bool {
        matches!(self, DavError::AuthenticationRequired)
    }
}

/// Outcome of one `PUT` upload (C5). A soft failure (403) still counts as
/// "handled" for the purposes of the delta set it came from — the item is
/// reported via `ItemFailure`, not retried within the same cycle.
#[derive(Debug, Clone)]
pub enum PutOutcome {
    Created { etag: Option<String> },
    Updated { etag: Option<String> },
    SoftFailed { status: u16 },
}

/// Outcome of one `DELETE` (C5). A `404`/`410` on delete means the
/// resource is already gone — not an error, since that's exactly the
/// end state the caller wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
    SoftFailed { status: u16 },
}

/// One item-level failure surfaced in a `SyncOutcome::ItemFailures` list.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub uid: String,
    pub recurrence_id: Option<String>,
    pub reason: String,
}

/// Per-account aggregate sync result (`spec.md` §6 exit statuses).
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Success,
    Cancelled,
    AuthenticationFailure,
    ConnectionError,
    DatabaseFailure,
    ItemFailures(Vec<ItemFailure>),
    InternalError(String),
    /// A notebook's remote collection 404s out on the initial ETag
    /// REPORT (`spec.md` §8 scenario S6). Notebook-level only: the
    /// orchestrator removes the notebook and does not propagate this
    /// into the account's aggregate outcome.
    NotebookVanished,
}
