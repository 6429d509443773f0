use serde::Serialize;

use crate::error::{status_of, ErrorKind};

/// Output of one generation request. Owned by the caller.
///
/// When `error` is set the caller has no obligation to execute `sql`; it is
/// kept for display (e.g. the rejected statement).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationResult {
    pub sql: String,
    pub reasoning: String,
    pub error: Option<ErrorKind>,
}

impl GenerationResult {
    pub fn success(sql: String, reasoning: String) -> Self {
        Self {
            sql,
            reasoning,
            error: None,
        }
    }

    pub fn failure(error: ErrorKind, sql: String, reasoning: String) -> Self {
        Self {
            sql,
            reasoning,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn status(&self) -> &'static str {
        status_of(self.error)
    }

    pub fn message(&self) -> String {
        match self.error {
            Some(kind) => kind.to_string(),
            None => "SQL generated.".to_string(),
        }
    }
}
