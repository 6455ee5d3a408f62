use serde::{Deserialize, Serialize};

/// A field path another manager already owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub manager: String,
    pub path: String,
}

/// Errors surfaced by every Strata API, suitable for transport over HTTP or the bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum StrataError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {}", render_conflicts(.0))]
    Conflict(Vec<FieldConflict>),
    #[error("validation: {0}")]
    Validation(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("internal: {0}")]
    Internal(String),
}

fn render_conflicts(conflicts: &[FieldConflict]) -> String {
    let parts: Vec<String> = conflicts
        .iter()
        .map(|c| format!("field {:?} is owned by manager {:?}", c.path, c.manager))
        .collect();
    parts.join("; ")
}

impl StrataError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// HTTP status used by both transports.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Validation(_) => 400,
            Self::Transport(m) if m.contains("deadline") => 504,
            Self::Transport(_) => 502,
            Self::Internal(_) => 500,
        }
    }

    /// Reconstruction on the client side when the body is not a structured error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => Self::NotFound(message),
            409 => Self::Conflict(vec![FieldConflict { manager: String::new(), path: message }]),
            400..=499 => Self::Validation(message),
            502..=504 => Self::Transport(message),
            _ => Self::Internal(message),
        }
    }

    /// Short machine-readable name, used in the HTTP error body and bus status header.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::Transport(_) => "transport",
            Self::Internal(_) => "internal",
        }
    }
}

pub type StrataResult<T> = Result<T, StrataError>;

/// Collapse NotFound into success, for reconcilers that treat a missing object as done.
pub fn ignore_not_found<T: Default>(res: StrataResult<T>) -> StrataResult<T> {
    match res {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}
