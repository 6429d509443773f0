//! User-facing error classification for the gateway.
//!
//! Every terminal state of a request maps onto one of these kinds. The
//! `Display` text is what callers see; underlying details are logged where
//! the failure happens and never carried in here.

use serde::Serialize;
use thiserror::Error;

/// Machine status reported for a successful request.
pub const STATUS_OK: &str = "ok";

/// Closed set of failure classifications surfaced to callers.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Empty question or empty SQL; nothing was sent anywhere.
    #[error("Nothing to do: please enter a question or SQL statement.")]
    EmptyInput,

    /// Transport failure or timeout talking to a model backend.
    #[error("The language model backend is unavailable. Please try again shortly.")]
    BackendUnavailable,

    /// The model answered but no statement could be extracted.
    #[error("The model did not produce a SQL statement.")]
    GenerationFailed,

    /// The validator rejected the statement.
    #[error("Unsafe SQL detected. Only a single read-only SELECT or WITH query is allowed.")]
    UnsafeStatement,

    /// The database rejected the statement or the deadline expired.
    #[error("The query could not be executed. Please rephrase the question and try again.")]
    ExecutionFailed,

    /// Narrative summarisation failed; the request itself still succeeds.
    #[error("The narrative summary could not be generated.")]
    ReportUnavailable,
}

impl ErrorKind {
    /// Stable machine-checkable status string.
    pub fn status(&self) -> &'static str {
        match self {
            Self::EmptyInput => "empty_input",
            Self::BackendUnavailable => "backend_unavailable",
            Self::GenerationFailed => "generation_failed",
            Self::UnsafeStatement => "unsafe_statement",
            Self::ExecutionFailed => "execution_failed",
            Self::ReportUnavailable => "report_unavailable",
        }
    }

    /// Whether the overall request may still be reported as successful.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ReportUnavailable)
    }
}

/// Status string for an optional error, `ok` when absent.
pub fn status_of(error: Option<ErrorKind>) -> &'static str {
    error.map(|e| e.status()).unwrap_or(STATUS_OK)
}
