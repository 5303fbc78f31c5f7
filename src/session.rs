//! Sessions: the persisted, resumable record of one test run.
//!
//! ```text
//!   new ──► selecting ──► resolving ──► running ──► complete
//!                            ▲             │
//!                            └─────────────┘
//!                     local/resource job added units
//! ```
//!
//! [`SessionState`] owns the catalogue, the per-job results and the resource
//! records, and is the only writer of either. [`SessionDocument`] is its
//! serialized form and [`SessionStorage`] writes it crash-safely next to the
//! per-job I/O logs:
//!
//! ```text
//! <storage_dir>/<id>.session/
//! ├── session             gzip JSON checkpoint
//! ├── io-logs/
//! │   └── <job>.record.gz one JSON line per captured chunk
//! └── session-share/      scratch space shared by all jobs
//! ```

pub mod iolog;
pub mod state;
pub mod storage;
pub mod suspend;

use crate::qualifier::QualifierError;
use crate::resolver::ResolveError;

pub use iolog::{IoLogReader, IoLogRecord, IoLogWriter, IoStream};
pub use state::{
    FLAG_INCOMPLETE, FLAG_SUBMITTED, JobResult, JobState, Outcome, ResultEffect, SessionMetadata,
    SessionPhase, SessionState,
};
pub use storage::{SessionRepository, SessionStorage};
pub use suspend::{DiscoveredUnit, SESSION_DOCUMENT_VERSION, SessionDocument, SessionSnapshot};

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Cannot resume session: {0}")]
    Resume(#[from] ResumeError),

    #[error("{job} already has the final outcome {outcome}; request a re-run to change it")]
    ResultOverwrite { job: String, outcome: Outcome },

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Invalid session id: {0:?}")]
    InvalidId(String),

    #[error("Selection failed: {0}")]
    Qualifier(#[from] QualifierError),

    #[error("Resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Reasons a stored session cannot be resumed.
///
/// The caller is expected to start a new session instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResumeError {
    #[error("unsupported session document version {0}")]
    UnsupportedVersion(u64),

    #[error("session document is corrupted: {0}")]
    Corrupted(String),

    #[error("job {0} is no longer defined")]
    UnknownJob(String),

    #[error("definition of job {job} changed since the session was saved")]
    ChecksumMismatch { job: String },
}
