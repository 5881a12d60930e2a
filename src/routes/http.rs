//! HTTP endpoint handlers. These are thin wrappers that forward to the session engine.
//! Each handler is instrumented and logs its parameters and basic result info.

use std::sync::Arc;
use axum::{extract::{Path, Query, State}, Json};
use tracing::{info, instrument};

use crate::error::TutorError;
use crate::progression::ProgressionStatus;
use crate::domain::SessionSummary;
use crate::protocol::*;
use crate::state::AppState;

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> Json<HealthOut> {
  Json(HealthOut {
    ok: true,
    items: state.item_count,
    cas_enabled: state.settings.cas_enabled,
    llm_enabled: state.settings.llm_enabled && state.judge_available,
  })
}

#[instrument(level = "info", skip(state, body), fields(%body.learner_id, item_id = ?body.item_id))]
pub async fn http_start_session(
  State(state): State<Arc<AppState>>,
  Json(body): Json<StartIn>,
) -> Result<Json<SessionOut>, TutorError> {
  let view = state.engine.start(&body.learner_id, body.item_id.as_deref()).await?;
  info!(target: "session", session_id = %view.session.session_id, item_id = %view.session.item_id, "HTTP session started");
  Ok(Json(view.into()))
}

#[instrument(level = "info", skip(state, body), fields(%body.session_id, %body.step_id, response_len = body.response.len()))]
pub async fn http_submit_step(
  State(state): State<Arc<AppState>>,
  Json(body): Json<StepIn>,
) -> Result<Json<StepOut>, TutorError> {
  let result = state.engine.step(&body.session_id, &body.step_id, &body.response).await?;
  info!(target: "session", session_id = %body.session_id, outcome = %result.outcome, "HTTP step evaluated");
  Ok(Json(result.into()))
}

#[instrument(level = "info", skip(state, body), fields(%body.session_id))]
pub async fn http_end_session(
  State(state): State<Arc<AppState>>,
  Json(body): Json<EndIn>,
) -> Result<Json<SessionSummary>, TutorError> {
  let summary = state.engine.end(&body.session_id).await?;
  info!(target: "session", session_id = %body.session_id, status = %summary.status, xp = summary.xp_awarded, "HTTP session ended");
  Ok(Json(summary))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_session(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
) -> Result<Json<SessionOut>, TutorError> {
  Ok(Json(state.engine.get(&session_id).await?.into()))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_item(
  State(state): State<Arc<AppState>>,
  Path(item_id): Path<String>,
) -> Result<Json<ItemOut>, TutorError> {
  let item = state.engine.item(&item_id).await?;
  Ok(Json(item_out(&item)))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_profile(
  State(state): State<Arc<AppState>>,
  Path(learner_id): Path<String>,
) -> Result<Json<ProfileOut>, TutorError> {
  let profile = state.profiles.get_profile(&learner_id).await.map_err(TutorError::ProfileStore)?;
  let mastery = state.profiles.list_mastery(&learner_id).await.map_err(TutorError::ProfileStore)?;
  let misconceptions = state.profiles.get_misconceptions(&learner_id).await.map_err(TutorError::ProfileStore)?;
  Ok(Json(ProfileOut { profile, mastery, misconceptions }))
}

#[instrument(level = "info", skip(state, q))]
pub async fn http_get_progression(
  State(state): State<Arc<AppState>>,
  Path(learner_id): Path<String>,
  Query(q): Query<ProgressionQuery>,
) -> Result<Json<ProgressionStatus>, TutorError> {
  let status = state.engine.progression_status(&learner_id, q.topic.as_deref()).await?;
  info!(target: "session", %learner_id, completed = status.completed_count, total = status.total_items, "HTTP progression served");
  Ok(Json(status))
}
