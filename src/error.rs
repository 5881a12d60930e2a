//! Error taxonomy for the tutoring core.
//!
//! - `TutorError`: caller-facing failures of the session lifecycle API. Each
//!   maps to a stable code and HTTP status so clients never confuse them with
//!   a wrong answer.
//! - `StoreError`: failures of the content/profile/session stores.
//! - `ItemError`: authored content that fails validation at load time.
//!
//! Adjudication problems (CAS timeouts, malformed judge payloads) are not
//! errors at this level; the pipeline resolves them internally.

use axum::{http::StatusCode, response::IntoResponse, Json};
use thiserror::Error;

use crate::domain::SessionStatus;
use crate::protocol::ErrorOut;

#[derive(Debug, Error)]
pub enum TutorError {
  #[error("item not found: {0}")]
  ItemNotFound(String),

  #[error("session not found: {0}")]
  SessionNotFound(String),

  #[error("session {session_id} is {status}, not active")]
  InvalidState { session_id: String, status: SessionStatus },

  #[error("step mismatch: session is on step '{expected}', request was for '{got}'")]
  StepMismatch { expected: String, got: String },

  #[error("session {0} already has a request in flight")]
  SessionBusy(String),

  #[error("session store unavailable: {0}")]
  SessionStore(#[source] StoreError),

  #[error("content store unavailable: {0}")]
  ContentStore(#[source] StoreError),

  #[error("profile store unavailable: {0}")]
  ProfileStore(#[source] StoreError),

  #[error("request for session {0} was aborted before it could be committed")]
  CommitAborted(String),
}

impl TutorError {
  /// Stable machine-readable code used in API error bodies.
  pub fn code(&self) -> &'static str {
    match self {
      Self::ItemNotFound(_) => "item_not_found",
      Self::SessionNotFound(_) => "session_not_found",
      Self::InvalidState { .. } => "invalid_state",
      Self::StepMismatch { .. } => "step_mismatch",
      Self::SessionBusy(_) => "session_busy",
      Self::SessionStore(_) => "session_store_unavailable",
      Self::ContentStore(_) => "content_store_unavailable",
      Self::ProfileStore(_) => "profile_store_unavailable",
      Self::CommitAborted(_) => "commit_aborted",
    }
  }

  pub fn status_code(&self) -> StatusCode {
    match self {
      Self::ItemNotFound(_) | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
      Self::InvalidState { .. } | Self::StepMismatch { .. } | Self::SessionBusy(_) => StatusCode::CONFLICT,
      Self::SessionStore(_) | Self::ContentStore(_) | Self::ProfileStore(_) => StatusCode::SERVICE_UNAVAILABLE,
      Self::CommitAborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for TutorError {
  fn into_response(self) -> axum::response::Response {
    let body = ErrorOut { error: self.code().to_string(), message: self.to_string() };
    (self.status_code(), Json(body)).into_response()
  }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
  /// Transient: the backend could not be reached or timed out.
  #[error("store unavailable: {0}")]
  Unavailable(String),

  /// Permanent: the backend refused the operation.
  #[error("store rejected operation: {0}")]
  Rejected(String),
}

impl StoreError {
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Unavailable(_))
  }
}

#[derive(Debug, Error)]
pub enum ItemError {
  #[error("item {item}: has no steps")]
  NoSteps { item: String },

  #[error("item {item}: duplicate step id '{step}'")]
  DuplicateStep { item: String, step: String },

  #[error("item {item}, step {step}: no acceptable-answer pattern")]
  NoPatterns { item: String, step: String },

  #[error("item {item}, step {step}: hint ladder must be contiguous from level 1 ({detail})")]
  HintLadder { item: String, step: String, detail: String },

  #[error("item {item}, step {step}: invalid regex pattern '{pattern}': {source}")]
  InvalidRegex {
    item: String,
    step: String,
    pattern: String,
    #[source]
    source: regex::Error,
  },

  #[error("item {item}, step {step}: unknown commutative operator '{op}'")]
  UnknownOperator { item: String, step: String, op: String },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn caller_errors_map_to_distinct_statuses() {
    assert_eq!(TutorError::ItemNotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
    assert_eq!(
      TutorError::StepMismatch { expected: "s1".into(), got: "s2".into() }.status_code(),
      StatusCode::CONFLICT
    );
    assert_eq!(
      TutorError::SessionStore(StoreError::Unavailable("down".into())).code(),
      "session_store_unavailable"
    );
  }

  #[test]
  fn only_unavailable_is_transient() {
    assert!(StoreError::Unavailable("timeout".into()).is_transient());
    assert!(!StoreError::Rejected("bad key".into()).is_transient());
  }
}
