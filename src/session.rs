//! Session lifecycle: `start`, `step`, `end` and `get` (resume).
//!
//! A call runs in two phases:
//!
//!   1. Verdict: load the session, check state and step id, run the
//!      evaluation pipeline. Nothing is written; no lock is held while the
//!      pipeline awaits its engines. Dropping the caller's future here
//!      discards the attempt.
//!   2. Commit: apply the verdict (session record, mastery, misconceptions,
//!      profile, events) inside a spawned task that is awaited. Once started
//!      it runs to completion even if the caller goes away.
//!
//! At most one `step`/`end` per session is in flight at a time; an
//! overlapping call is rejected with `SessionBusy`. Learner records are
//! written under a per-learner lock: each record is computed once and only
//! its idempotent put is retried with backoff. If the put still fails the
//! verdict stands and the result reports `progress_saved = false`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::domain::{
  Hint, Item, LearnerProfile, Outcome, Session, SessionStatus, SessionSummary, SessionView, StepEvent,
  StepResult, Verdict,
};
use crate::error::{StoreError, TutorError};
use crate::events::{EventSink, TutorEvent};
use crate::hints::next_hint;
use crate::mastery::MasteryEstimator;
use crate::misconceptions::MisconceptionTracker;
use crate::pipeline::{EnabledStages, EvaluationContext, EvaluationPipeline};
use crate::progression::{next_streak, session_xp, Progression, ProgressionStatus};
use crate::retry::with_backoff;
use crate::store::{ContentStore, LearnerLocks, ProfileStore, SessionStore};

type InFlightSet = Arc<Mutex<HashSet<String>>>;

/// Marks a session as busy until dropped.
struct InFlight {
  set: InFlightSet,
  session_id: String,
}

impl InFlight {
  fn enter(set: &InFlightSet, session_id: &str) -> Result<Self, TutorError> {
    let mut busy = set.lock().unwrap_or_else(PoisonError::into_inner);
    if !busy.insert(session_id.to_string()) {
      return Err(TutorError::SessionBusy(session_id.to_string()));
    }
    Ok(Self { set: set.clone(), session_id: session_id.to_string() })
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    self.set.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.session_id);
  }
}

#[derive(Clone)]
pub struct SessionEngine {
  content: Arc<dyn ContentStore>,
  sessions: Arc<dyn SessionStore>,
  profiles: Arc<dyn ProfileStore>,
  pipeline: EvaluationPipeline,
  mastery: MasteryEstimator,
  misconceptions: MisconceptionTracker,
  events: Arc<dyn EventSink>,
  settings: Arc<EngineSettings>,
  in_flight: InFlightSet,
  learner_locks: LearnerLocks,
}

impl SessionEngine {
  pub fn new(
    content: Arc<dyn ContentStore>,
    sessions: Arc<dyn SessionStore>,
    profiles: Arc<dyn ProfileStore>,
    pipeline: EvaluationPipeline,
    events: Arc<dyn EventSink>,
    settings: EngineSettings,
  ) -> Self {
    let retry = settings.store_retry.clone();
    let mastery = MasteryEstimator::new(profiles.clone(), settings.mastery.clone(), retry.clone());
    let misconceptions = MisconceptionTracker::new(profiles.clone(), settings.misconception_weight, retry);
    Self {
      content,
      sessions,
      profiles,
      pipeline,
      mastery,
      misconceptions,
      events,
      settings: Arc::new(settings),
      in_flight: Arc::new(Mutex::new(HashSet::new())),
      learner_locks: LearnerLocks::new(),
    }
  }

  // -------------------------------------------------------------------------
  // Lifecycle
  // -------------------------------------------------------------------------

  /// Without an `item_id` the learner's recommended next item is started.
  #[instrument(level = "info", skip(self))]
  pub async fn start(&self, learner_id: &str, item_id: Option<&str>) -> Result<SessionView, TutorError> {
    let item = match item_id {
      Some(id) => self.load_item(id).await?,
      None => {
        let next = self.progression_status(learner_id, None).await?.next_item_id;
        let id = next.ok_or_else(|| TutorError::ItemNotFound(format!("no uncompleted item for {learner_id}")))?;
        self.load_item(&id).await?
      }
    };
    let session = Session::new(Uuid::new_v4().to_string(), learner_id.to_string(), item.id.clone(), Utc::now());
    self.sessions.insert(session.clone()).await.map_err(TutorError::SessionStore)?;
    info!(target: "session", session_id = %session.session_id, %learner_id, item_id = %item.id, adaptive = item_id.is_none(), steps = item.steps.len(), "Session started");
    Ok(view(session, &item))
  }

  #[instrument(level = "info", skip(self, response_text), fields(response_len = response_text.len()))]
  pub async fn step(&self, session_id: &str, step_id: &str, response_text: &str) -> Result<StepResult, TutorError> {
    let guard = InFlight::enter(&self.in_flight, session_id)?;

    let session = self.load_session(session_id).await?;
    if session.status != SessionStatus::Active {
      return Err(TutorError::InvalidState { session_id: session_id.to_string(), status: session.status });
    }
    let item = self.load_item(&session.item_id).await?;
    let Some(step) = item.steps.get(session.current_step_index) else {
      return Err(TutorError::InvalidState { session_id: session_id.to_string(), status: session.status });
    };
    if step.id != step_id {
      return Err(TutorError::StepMismatch { expected: step.id.clone(), got: step_id.to_string() });
    }

    let attempts = session.attempts_on_current_step.saturating_add(1);
    let enabled = EnabledStages::for_rule(&step.rule, self.settings.cas_enabled, self.settings.llm_enabled);
    let ctx = EvaluationContext { item: &item, step, prior_responses: &session.recent_responses, attempts };
    let verdict = self.pipeline.evaluate(&ctx, response_text, enabled).await;
    info!(target: "session", %session_id, %step_id, attempts, outcome = %verdict.outcome, resolved_by = %verdict.resolved_by, "Step evaluated");

    let engine = self.clone();
    let response = response_text.trim().to_string();
    let commit = tokio::spawn(async move {
      let _guard = guard;
      engine.commit_step(session, item, verdict, response).await
    });
    commit.await.map_err(|e| TutorError::CommitAborted(format!("{session_id}: {e}")))?
  }

  /// Idempotent: a session that already has a summary returns it unchanged.
  #[instrument(level = "info", skip(self))]
  pub async fn end(&self, session_id: &str) -> Result<SessionSummary, TutorError> {
    let guard = InFlight::enter(&self.in_flight, session_id)?;

    let session = self.load_session(session_id).await?;
    if let Some(summary) = &session.summary {
      return Ok(summary.clone());
    }
    let item = self.load_item(&session.item_id).await?;

    let engine = self.clone();
    let commit = tokio::spawn(async move {
      let _guard = guard;
      engine.commit_end(session, item).await
    });
    commit.await.map_err(|e| TutorError::CommitAborted(format!("{session_id}: {e}")))?
  }

  /// Resume: the session plus the prompt of its current step, if any.
  pub async fn get(&self, session_id: &str) -> Result<SessionView, TutorError> {
    let session = self.load_session(session_id).await?;
    let item = self.load_item(&session.item_id).await?;
    Ok(view(session, &item))
  }

  pub async fn item(&self, item_id: &str) -> Result<Arc<Item>, TutorError> {
    self.load_item(item_id).await
  }

  pub async fn progression(&self) -> Result<Progression, TutorError> {
    let items = self.content.list_items().await.map_err(TutorError::ContentStore)?;
    Ok(Progression::new(&items))
  }

  pub async fn progression_status(&self, learner_id: &str, topic: Option<&str>) -> Result<ProgressionStatus, TutorError> {
    let profile = self.profiles.get_profile(learner_id).await.map_err(TutorError::ProfileStore)?;
    Ok(self.progression().await?.status(&profile.completed_items, topic))
  }

  // -------------------------------------------------------------------------
  // Commit phase
  // -------------------------------------------------------------------------

  async fn commit_step(
    &self,
    mut session: Session,
    item: Arc<Item>,
    verdict: Verdict,
    response: String,
  ) -> Result<StepResult, TutorError> {
    let now = Utc::now();
    let Verdict { outcome, resolved_by, misconception_tag, confidence, .. } = verdict;
    let Some(step) = item.steps.get(session.current_step_index) else {
      return Err(TutorError::InvalidState { session_id: session.session_id.clone(), status: session.status });
    };
    let attempts = session.attempts_on_current_step.saturating_add(1);
    let correct = outcome == Outcome::Correct;

    session.total_attempts = session.total_attempts.saturating_add(1);
    session.last_activity_at = now;

    let mut hint = None;
    let mut next_step = None;
    if correct {
      session.correct_steps = session.correct_steps.saturating_add(1);
      session.attempts_on_current_step = 0;
      session.recent_responses.clear();
      session.last_misconception_tag = None;
      session.current_step_index += 1;
      next_step = item.steps.get(session.current_step_index);
      if next_step.is_none() {
        session.status = self.transition(&session, SessionStatus::Completed)?;
      }
    } else {
      session.attempts_on_current_step = attempts;
      session.recent_responses.push(response);
      let window = self.settings.prior_response_window;
      if session.recent_responses.len() > window {
        let excess = session.recent_responses.len() - window;
        session.recent_responses.drain(..excess);
      }
      session.last_misconception_tag = misconception_tag.clone();
      hint = Some(match next_hint(step, attempts) {
        Some(h) => {
          session.hints_shown = session.hints_shown.saturating_add(1);
          h.clone()
        }
        None => Hint { level: 0, text: self.settings.generic_nudge.clone() },
      });
    }

    let summary = (session.status == SessionStatus::Completed).then(|| self.summarize(&session, &item, now));
    session.summary = summary.clone();
    self.persist(&session).await?;

    let mut progress_saved = true;
    let mut mastery_score = None;
    if correct {
      match self.save_mastery(&session.learner_id, &item.skill, true, attempts - 1, now).await {
        Ok(score) => mastery_score = Some(score),
        Err(_) => progress_saved = false,
      }
    } else if let Some(tag) = misconception_tag.as_deref() {
      let _learner = self.learner_locks.lock(&session.learner_id).await;
      if let Err(e) = self.misconceptions.record(&session.learner_id, Some(tag), confidence, now).await {
        warn!(target: "session", session_id = %session.session_id, error = %e, "Misconception not saved");
        progress_saved = false;
      }
    }

    self.events.emit(TutorEvent::StepResolved(StepEvent {
      learner_id: session.learner_id.clone(),
      session_id: session.session_id.clone(),
      item_id: item.id.clone(),
      step_id: step.id.clone(),
      skill: item.skill.clone(),
      outcome,
      hints_used: attempts - 1,
      misconception_tag,
      mastery_score,
      at: now,
    }));

    let mut next_item_id = None;
    if let Some(summary) = summary {
      let summary = self.close(&mut session, summary, progress_saved).await;
      progress_saved = summary.progress_saved;
      next_item_id = self.recommend_after(&session.learner_id, &item.id).await;
    }

    Ok(StepResult {
      session_id: session.session_id,
      step_id: step.id.clone(),
      outcome,
      resolved_by,
      attempts,
      hint,
      next_step_id: next_step.map(|s| s.id.clone()),
      next_prompt: next_step.map(|s| s.prompt.clone()),
      session_status: session.status,
      progress_saved,
      next_item_id,
    })
  }

  async fn commit_end(&self, mut session: Session, item: Arc<Item>) -> Result<SessionSummary, TutorError> {
    let now = Utc::now();
    let pending_failures = session.attempts_on_current_step;
    let current_step = item.steps.get(session.current_step_index);

    if session.status == SessionStatus::Active {
      session.status = self.transition(&session, SessionStatus::Abandoned)?;
    }
    session.last_activity_at = now;
    let summary = self.summarize(&session, &item, now);
    session.summary = Some(summary.clone());
    self.persist(&session).await?;

    let mut progress_saved = true;
    if let (SessionStatus::Abandoned, Some(step)) = (session.status, current_step) {
      if pending_failures > 0 {
        let mastery_score = match self.save_mastery(&session.learner_id, &item.skill, false, pending_failures, now).await {
          Ok(score) => Some(score),
          Err(_) => {
            progress_saved = false;
            None
          }
        };
        self.events.emit(TutorEvent::StepResolved(StepEvent {
          learner_id: session.learner_id.clone(),
          session_id: session.session_id.clone(),
          item_id: item.id.clone(),
          step_id: step.id.clone(),
          skill: item.skill.clone(),
          outcome: Outcome::Incorrect,
          hints_used: pending_failures,
          misconception_tag: session.last_misconception_tag.clone(),
          mastery_score,
          at: now,
        }));
      }
    }

    Ok(self.close(&mut session, summary, progress_saved).await)
  }

  /// Applies the archived summary to the learner profile, marks it saved on
  /// success and publishes it. Returns the final summary.
  async fn close(&self, session: &mut Session, mut summary: SessionSummary, saved_so_far: bool) -> SessionSummary {
    let profile_saved = match self.save_profile(&summary).await {
      Ok(profile) => {
        info!(target: "session", learner_id = %profile.learner_id, xp = profile.xp, streak = profile.current_streak, "Profile updated");
        true
      }
      Err(e) => {
        warn!(target: "session", session_id = %summary.session_id, error = %e, "Profile not saved");
        false
      }
    };

    if saved_so_far && profile_saved {
      summary.progress_saved = true;
      session.summary = Some(summary.clone());
      if let Err(e) = self.persist(session).await {
        warn!(target: "session", session_id = %summary.session_id, error = %e, "Could not mark summary as saved");
      }
    }

    self.events.emit(TutorEvent::SessionEnded(summary.clone()));
    summary
  }

  fn summarize(&self, session: &Session, item: &Item, now: DateTime<Utc>) -> SessionSummary {
    SessionSummary {
      session_id: session.session_id.clone(),
      learner_id: session.learner_id.clone(),
      item_id: session.item_id.clone(),
      skill: item.skill.clone(),
      status: session.status,
      total_steps: item.steps.len() as u32,
      correct_steps: session.correct_steps,
      total_attempts: session.total_attempts,
      hints_shown: session.hints_shown,
      xp_awarded: session_xp(&item.scoring, session.status, session.hints_shown),
      progress_saved: false,
      started_at: session.created_at,
      ended_at: now,
    }
  }

  fn transition(&self, session: &Session, to: SessionStatus) -> Result<SessionStatus, TutorError> {
    session
      .status
      .transition(to)
      .map_err(|e| TutorError::InvalidState { session_id: session.session_id.clone(), status: e.from })
  }

  async fn recommend_after(&self, learner_id: &str, item_id: &str) -> Option<String> {
    let completed = match self.profiles.get_profile(learner_id).await {
      Ok(p) => p.completed_items,
      Err(e) => {
        warn!(target: "session", %learner_id, error = %e, "Profile unavailable for recommendation");
        vec![item_id.to_string()]
      }
    };
    match self.progression().await {
      Ok(p) => p.recommend_next(Some(item_id), &completed, None).filter(|next| next != item_id),
      Err(e) => {
        warn!(target: "session", %learner_id, error = %e, "Catalog unavailable for recommendation");
        None
      }
    }
  }

  // -------------------------------------------------------------------------
  // Store access
  // -------------------------------------------------------------------------

  async fn load_session(&self, session_id: &str) -> Result<Session, TutorError> {
    self
      .sessions
      .get(session_id)
      .await
      .map_err(TutorError::SessionStore)?
      .ok_or_else(|| TutorError::SessionNotFound(session_id.to_string()))
  }

  async fn load_item(&self, item_id: &str) -> Result<Arc<Item>, TutorError> {
    self
      .content
      .get_item(item_id)
      .await
      .map_err(TutorError::ContentStore)?
      .ok_or_else(|| TutorError::ItemNotFound(item_id.to_string()))
  }

  async fn persist(&self, session: &Session) -> Result<(), TutorError> {
    with_backoff(&self.settings.store_retry, "put_session", || self.sessions.put(session.clone()))
      .await
      .map_err(TutorError::SessionStore)
  }

  async fn save_mastery(
    &self,
    learner_id: &str,
    skill: &str,
    correct: bool,
    hints_used: u32,
    at: DateTime<Utc>,
  ) -> Result<f64, StoreError> {
    let _learner = self.learner_locks.lock(learner_id).await;
    self
      .mastery
      .update(learner_id, skill, correct, hints_used, at)
      .await
      .inspect_err(|e| warn!(target: "session", %learner_id, %skill, error = %e, "Mastery not saved"))
  }

  async fn save_profile(&self, summary: &SessionSummary) -> Result<LearnerProfile, StoreError> {
    let learner_id = summary.learner_id.as_str();
    let item_id = summary.item_id.as_str();
    let status = summary.status;
    let xp = u64::from(summary.xp_awarded);

    let retry = &self.settings.store_retry;

    let _learner = self.learner_locks.lock(learner_id).await;
    let mut p = with_backoff(retry, "get_profile", || self.profiles.get_profile(learner_id)).await?;
    p.xp = p.xp.saturating_add(xp);
    if status == SessionStatus::Completed {
      p.sessions_completed = p.sessions_completed.saturating_add(1);
      if !p.completed_items.iter().any(|c| c == item_id) {
        p.completed_items.push(item_id.to_string());
      }
    }
    let (current, best) = next_streak(p.current_streak, p.best_streak, status);
    p.current_streak = current;
    p.best_streak = best;

    with_backoff(retry, "put_profile", || self.profiles.put_profile(p.clone())).await?;
    Ok(p)
  }
}

fn view(session: Session, item: &Item) -> SessionView {
  let step = (session.status == SessionStatus::Active)
    .then(|| item.steps.get(session.current_step_index))
    .flatten();
  SessionView {
    title: item.title.clone(),
    problem_text: item.problem_text.clone(),
    step_id: step.map(|s| s.id.clone()),
    prompt: step.map(|s| s.prompt.clone()),
    session,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeSet;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  use async_trait::async_trait;
  use tokio::sync::Notify;

  use crate::config::Prompts;
  use crate::domain::{AnswerPattern, EvaluationRule, MasteryRecord, MisconceptionRecord, ResolvedBy, Scoring, Step};
  use crate::equivalence::{Equivalence, EquivalenceAdjudicator, EquivalenceEngine, EquivalenceError, SampledEquivalence};
  use crate::events::BroadcastSink;
  use crate::judge::{JudgeAdapter, JudgeEngine, JudgeError, JudgeRequest};
  use crate::retry::RetryPolicy;
  use crate::seeds::seed_items;
  use crate::store::{InMemoryContentStore, InMemoryProfileStore, InMemorySessionStore};

  // --- fakes ---------------------------------------------------------------

  struct CountingCas {
    answer: Equivalence,
    calls: AtomicUsize,
  }

  #[async_trait]
  impl EquivalenceEngine for CountingCas {
    async fn equivalent(&self, _a: &str, _b: &str) -> Result<Equivalence, EquivalenceError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(self.answer)
    }
  }

  struct CannedJudge {
    payload: String,
    calls: AtomicUsize,
  }

  #[async_trait]
  impl JudgeEngine for CannedJudge {
    async fn complete(&self, _request: &JudgeRequest) -> Result<String, JudgeError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(self.payload.clone())
    }
  }

  /// Signals when called, then waits to be released.
  #[derive(Default)]
  struct GateJudge {
    entered: Notify,
    release: Notify,
  }

  #[async_trait]
  impl JudgeEngine for GateJudge {
    async fn complete(&self, _request: &JudgeRequest) -> Result<String, JudgeError> {
      self.entered.notify_one();
      self.release.notified().await;
      Ok(r#"{"verdict":"correct","confidence":0.9}"#.into())
    }
  }

  /// Reads work; every write fails as unavailable.
  #[derive(Default)]
  struct FlakyProfiles {
    inner: InMemoryProfileStore,
    writes: AtomicUsize,
  }

  impl FlakyProfiles {
    fn fail(&self) -> StoreError {
      self.writes.fetch_add(1, Ordering::SeqCst);
      StoreError::Unavailable("profile db down".into())
    }
  }

  #[async_trait]
  impl ProfileStore for FlakyProfiles {
    async fn get_mastery(&self, l: &str, s: &str) -> Result<Option<MasteryRecord>, StoreError> {
      self.inner.get_mastery(l, s).await
    }
    async fn list_mastery(&self, l: &str) -> Result<Vec<MasteryRecord>, StoreError> {
      self.inner.list_mastery(l).await
    }
    async fn put_mastery(&self, _l: &str, _r: MasteryRecord) -> Result<(), StoreError> {
      Err(self.fail())
    }
    async fn get_misconception(&self, l: &str, t: &str) -> Result<Option<MisconceptionRecord>, StoreError> {
      self.inner.get_misconception(l, t).await
    }
    async fn get_misconceptions(&self, l: &str) -> Result<Vec<MisconceptionRecord>, StoreError> {
      self.inner.get_misconceptions(l).await
    }
    async fn put_misconception(&self, _l: &str, _r: MisconceptionRecord) -> Result<(), StoreError> {
      Err(self.fail())
    }
    async fn get_profile(&self, l: &str) -> Result<LearnerProfile, StoreError> {
      self.inner.get_profile(l).await
    }
    async fn put_profile(&self, _p: LearnerProfile) -> Result<(), StoreError> {
      Err(self.fail())
    }
  }

  /// Every write lands, but the first acknowledgement of each kind is lost.
  #[derive(Default)]
  struct LostAckProfiles {
    inner: InMemoryProfileStore,
    lost: Mutex<HashSet<&'static str>>,
  }

  impl LostAckProfiles {
    fn ack(&self, kind: &'static str) -> Result<(), StoreError> {
      if self.lost.lock().unwrap().insert(kind) {
        return Err(StoreError::Unavailable(format!("{kind}: connection reset")));
      }
      Ok(())
    }
  }

  #[async_trait]
  impl ProfileStore for LostAckProfiles {
    async fn get_mastery(&self, l: &str, s: &str) -> Result<Option<MasteryRecord>, StoreError> {
      self.inner.get_mastery(l, s).await
    }
    async fn list_mastery(&self, l: &str) -> Result<Vec<MasteryRecord>, StoreError> {
      self.inner.list_mastery(l).await
    }
    async fn put_mastery(&self, l: &str, r: MasteryRecord) -> Result<(), StoreError> {
      self.inner.put_mastery(l, r).await?;
      self.ack("mastery")
    }
    async fn get_misconception(&self, l: &str, t: &str) -> Result<Option<MisconceptionRecord>, StoreError> {
      self.inner.get_misconception(l, t).await
    }
    async fn get_misconceptions(&self, l: &str) -> Result<Vec<MisconceptionRecord>, StoreError> {
      self.inner.get_misconceptions(l).await
    }
    async fn put_misconception(&self, l: &str, r: MisconceptionRecord) -> Result<(), StoreError> {
      self.inner.put_misconception(l, r).await?;
      self.ack("misconception")
    }
    async fn get_profile(&self, l: &str) -> Result<LearnerProfile, StoreError> {
      self.inner.get_profile(l).await
    }
    async fn put_profile(&self, p: LearnerProfile) -> Result<(), StoreError> {
      self.inner.put_profile(p).await?;
      self.ack("profile")
    }
  }

  // --- harness -------------------------------------------------------------

  struct Harness {
    engine: SessionEngine,
    profiles: Arc<dyn ProfileStore>,
    sink: BroadcastSink,
  }

  fn settings() -> EngineSettings {
    EngineSettings {
      store_retry: RetryPolicy { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 2 },
      ..EngineSettings::default()
    }
  }

  fn harness_with(
    items: Vec<Item>,
    pipeline: EvaluationPipeline,
    profiles: Arc<dyn ProfileStore>,
    settings: EngineSettings,
  ) -> Harness {
    let sink = BroadcastSink::new(64);
    let engine = SessionEngine::new(
      Arc::new(InMemoryContentStore::new(items)),
      Arc::new(InMemorySessionStore::new()),
      profiles.clone(),
      pipeline,
      Arc::new(sink.clone()),
      settings,
    );
    Harness { engine, profiles, sink }
  }

  fn harness(pipeline: EvaluationPipeline) -> Harness {
    harness_with(seed_items(), pipeline, Arc::new(InMemoryProfileStore::new()), settings())
  }

  fn with_cas(engine: Arc<dyn EquivalenceEngine>, judge: Option<Arc<dyn JudgeEngine>>) -> EvaluationPipeline {
    EvaluationPipeline::new(
      Some(EquivalenceAdjudicator::new(engine, Duration::from_secs(2))),
      judge.map(|j| JudgeAdapter::new(j, Prompts::default(), 1, Duration::from_secs(5))),
    )
  }

  fn judge_only(judge: Arc<dyn JudgeEngine>) -> EvaluationPipeline {
    EvaluationPipeline::new(None, Some(JudgeAdapter::new(judge, Prompts::default(), 1, Duration::from_secs(5))))
  }

  async fn started(h: &Harness, item_id: &str) -> String {
    h.engine.start("learner-1", Some(item_id)).await.unwrap().session.session_id
  }

  // --- scenarios -----------------------------------------------------------

  #[tokio::test]
  async fn correct_literal_advances_without_cas_or_judge() {
    let cas = Arc::new(CountingCas { answer: Equivalence::Equivalent, calls: AtomicUsize::new(0) });
    let judge = Arc::new(CannedJudge { payload: r#"{"verdict":"correct"}"#.into(), calls: AtomicUsize::new(0) });
    let h = harness(with_cas(cas.clone(), Some(judge.clone() as Arc<dyn JudgeEngine>)));
    let id = started(&h, "ALG-S1-E1").await;

    let r = h.engine.step(&id, "s1", "b + 4").await.unwrap();
    assert_eq!((r.outcome, r.resolved_by), (Outcome::Correct, ResolvedBy::Rule));
    assert_eq!(r.hint, None);
    assert_eq!(r.next_step_id.as_deref(), Some("s2"));
    assert!(r.next_prompt.is_some());
    assert_eq!(r.session_status, SessionStatus::Active);
    assert!(r.progress_saved);
    assert_eq!(cas.calls.load(Ordering::SeqCst), 0);
    assert_eq!(judge.calls.load(Ordering::SeqCst), 0);

    let s = h.engine.get(&id).await.unwrap();
    assert_eq!(s.session.current_step_index, 1);
    assert_eq!(s.session.attempts_on_current_step, 0);
    assert_eq!(s.step_id.as_deref(), Some("s2"));

    let m = h.profiles.get_mastery("learner-1", "algebra.expressions").await.unwrap().unwrap();
    assert!(m.score > 0.0);
    assert_eq!(m.attempts, 1);
  }

  #[tokio::test]
  async fn non_equivalent_answer_gets_first_hint() {
    let judge = Arc::new(CannedJudge { payload: r#"{"verdict":"correct"}"#.into(), calls: AtomicUsize::new(0) });
    let h = harness(with_cas(Arc::new(SampledEquivalence::default()), Some(judge.clone() as Arc<dyn JudgeEngine>)));
    let id = started(&h, "ALG-S1-E1").await;

    let r = h.engine.step(&id, "s1", "4b").await.unwrap();
    assert_eq!((r.outcome, r.resolved_by), (Outcome::Incorrect, ResolvedBy::Equivalence));
    assert_eq!(r.attempts, 1);
    let expected = &seed_items()[0].steps[0].hints[0];
    assert_eq!(r.hint.as_ref(), Some(expected));
    assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.engine.get(&id).await.unwrap().session.attempts_on_current_step, 1);
  }

  #[tokio::test]
  async fn hints_cap_at_ladder_top() {
    let h = harness(EvaluationPipeline::default());
    let id = started(&h, "ALG-S1-E1").await;

    let mut levels = vec![];
    for _ in 0..3 {
      let r = h.engine.step(&id, "s1", "4b").await.unwrap();
      assert_eq!(r.outcome, Outcome::Incorrect);
      levels.push(r.hint.unwrap().level);
    }
    assert_eq!(levels, vec![1, 2, 2]);
    let s = h.engine.get(&id).await.unwrap().session;
    assert_eq!(s.attempts_on_current_step, 3);
    assert_eq!(s.hints_shown, 3);
  }

  #[tokio::test]
  async fn stale_step_id_changes_nothing() {
    let h = harness(EvaluationPipeline::default());
    let id = started(&h, "ALG-S1-E1").await;
    h.engine.step(&id, "s1", "4b").await.unwrap();
    let before = h.engine.get(&id).await.unwrap().session;

    let err = h.engine.step(&id, "s2", "10").await.unwrap_err();
    assert!(matches!(err, TutorError::StepMismatch { ref expected, ref got } if expected == "s1" && got == "s2"));

    assert_eq!(h.engine.get(&id).await.unwrap().session, before);
    assert!(h.profiles.get_mastery("learner-1", "algebra.expressions").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn worded_answers_reach_the_judge() {
    let judge = Arc::new(CannedJudge { payload: r#"{"verdict":"correct"}"#.into(), calls: AtomicUsize::new(0) });
    let h = harness(with_cas(Arc::new(SampledEquivalence::default()), Some(judge.clone() as Arc<dyn JudgeEngine>)));

    for answer in ["b plus four", "four more than b", "add four to b"] {
      let id = started(&h, "ALG-S1-E1").await;
      let r = h.engine.step(&id, "s1", answer).await.unwrap();
      assert_eq!((r.outcome, r.resolved_by), (Outcome::Correct, ResolvedBy::Llm), "{answer}");
    }
    assert_eq!(judge.calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn malformed_judge_twice_still_returns_hint() {
    let judge = Arc::new(CannedJudge { payload: "sure, looks right".into(), calls: AtomicUsize::new(0) });
    let h = harness(judge_only(judge.clone()));
    let id = started(&h, "ALG-S1-E1").await;

    let r = h.engine.step(&id, "s1", "four more than b").await.unwrap();
    assert_eq!((r.outcome, r.resolved_by), (Outcome::Incorrect, ResolvedBy::Llm));
    assert_eq!(r.attempts, 1);
    assert_eq!(r.hint.map(|h| h.level), Some(1));
    assert_eq!(judge.calls.load(Ordering::SeqCst), 2);
  }

  // --- lifecycle -----------------------------------------------------------

  #[tokio::test]
  async fn completing_awards_xp_once_and_recommends_next() {
    let h = harness(EvaluationPipeline::default());
    let mut rx = h.sink.subscribe();
    let id = started(&h, "ALG-S1-E1").await;

    h.engine.step(&id, "s1", "4 + b").await.unwrap();
    let last = h.engine.step(&id, "s2", "10").await.unwrap();
    assert_eq!(last.session_status, SessionStatus::Completed);
    assert_eq!(last.next_step_id, None);
    assert_eq!(last.next_item_id.as_deref(), Some("ALG-S1-E2"));
    assert!(last.progress_saved);

    let first = h.engine.end(&id).await.unwrap();
    let again = h.engine.end(&id).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(first.status, SessionStatus::Completed);
    assert_eq!(first.xp_awarded, 15);
    assert_eq!(first.correct_steps, 2);
    assert_eq!(first.total_attempts, 2);
    assert!(first.progress_saved);

    let profile = h.profiles.get_profile("learner-1").await.unwrap();
    assert_eq!(profile.xp, 15);
    assert_eq!(profile.completed_items, vec!["ALG-S1-E1".to_string()]);
    assert_eq!(profile.current_streak, 1);

    let mut ended = 0;
    while let Ok(ev) = rx.try_recv() {
      if matches!(ev, TutorEvent::SessionEnded(_)) {
        ended += 1;
      }
    }
    assert_eq!(ended, 1);

    let err = h.engine.step(&id, "s2", "10").await.unwrap_err();
    assert!(matches!(err, TutorError::InvalidState { status: SessionStatus::Completed, .. }));
  }

  #[tokio::test]
  async fn ending_active_session_abandons_it() {
    let h = harness(EvaluationPipeline::default());
    let mut rx = h.sink.subscribe();
    let id = started(&h, "ALG-S1-E1").await;
    h.engine.step(&id, "s1", "4b").await.unwrap();

    let summary = h.engine.end(&id).await.unwrap();
    assert_eq!(summary.status, SessionStatus::Abandoned);
    assert_eq!(summary.xp_awarded, 0);
    assert_eq!(summary.hints_shown, 1);
    assert_eq!(h.engine.end(&id).await.unwrap(), summary);

    let m = h.profiles.get_mastery("learner-1", "algebra.expressions").await.unwrap().unwrap();
    assert_eq!((m.score, m.attempts), (0.0, 1));
    assert_eq!(h.profiles.get_profile("learner-1").await.unwrap().xp, 0);

    let mut outcomes = vec![];
    while let Ok(ev) = rx.try_recv() {
      if let TutorEvent::StepResolved(e) = ev {
        outcomes.push(e.outcome);
      }
    }
    assert_eq!(outcomes, vec![Outcome::Incorrect, Outcome::Incorrect]);

    let err = h.engine.step(&id, "s1", "b+4").await.unwrap_err();
    assert!(matches!(err, TutorError::InvalidState { status: SessionStatus::Abandoned, .. }));
    assert_eq!(h.engine.get(&id).await.unwrap().prompt, None);
  }

  #[tokio::test]
  async fn judge_tags_feed_misconceptions() {
    let judge = Arc::new(CannedJudge {
      payload: r#"{"verdict":"incorrect","rationale":"multiplied","misconception_tag":"multiplies_instead_of_adds","confidence":0.8}"#.into(),
      calls: AtomicUsize::new(0),
    });
    let h = harness(judge_only(judge));
    let id = started(&h, "ALG-S1-E1").await;
    h.engine.step(&id, "s1", "b times four").await.unwrap();
    h.engine.step(&id, "s1", "four b").await.unwrap();

    let records = h.profiles.get_misconceptions("learner-1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tag, "multiplies_instead_of_adds");
    assert_eq!(records[0].count, 2);

    let s = h.engine.get(&id).await.unwrap().session;
    assert_eq!(s.recent_responses, vec!["b times four".to_string(), "four b".to_string()]);
    assert_eq!(s.last_misconception_tag.as_deref(), Some("multiplies_instead_of_adds"));
  }

  #[tokio::test]
  async fn empty_ladder_falls_back_to_generic_nudge() {
    let item = Item {
      id: "ALG-T-Q1".into(),
      title: "No hints".into(),
      topic: "Algebra".into(),
      sub_topic: "1.1 Intro".into(),
      problem_text: "What is 2 + 2?".into(),
      skill: "arithmetic".into(),
      subskills: BTreeSet::new(),
      scoring: Scoring { base_xp: 5, no_hint_bonus: 0 },
      steps: vec![Step {
        id: "s1".into(),
        prompt: "Answer.".into(),
        rule: EvaluationRule {
          patterns: vec![AnswerPattern::literal("4")],
          commutative: vec![],
          algebraic_equivalence: false,
          llm_fallback: false,
          reference_answer: None,
        },
        hints: vec![],
      }],
    };
    let h = harness_with(vec![item], EvaluationPipeline::default(), Arc::new(InMemoryProfileStore::new()), settings());
    let id = started(&h, "ALG-T-Q1").await;
    let r = h.engine.step(&id, "s1", "5").await.unwrap();
    let hint = r.hint.unwrap();
    assert_eq!(hint.level, 0);
    assert_eq!(hint.text, EngineSettings::default().generic_nudge);
    assert_eq!(h.engine.get(&id).await.unwrap().session.hints_shown, 0);
  }

  #[tokio::test]
  async fn failed_profile_writes_keep_the_verdict() {
    let flaky = Arc::new(FlakyProfiles::default());
    let h = harness_with(seed_items(), EvaluationPipeline::default(), flaky.clone(), settings());
    let id = started(&h, "ALG-S1-E1").await;

    let r = h.engine.step(&id, "s1", "b+4").await.unwrap();
    assert_eq!(r.outcome, Outcome::Correct);
    assert!(!r.progress_saved);
    assert_eq!(flaky.writes.load(Ordering::SeqCst), 2);
    assert_eq!(h.engine.get(&id).await.unwrap().session.current_step_index, 1);

    let last = h.engine.step(&id, "s2", "10").await.unwrap();
    assert_eq!(last.session_status, SessionStatus::Completed);
    assert!(!last.progress_saved);
    assert!(!h.engine.end(&id).await.unwrap().progress_saved);
  }

  #[tokio::test]
  async fn lost_acknowledgements_apply_each_record_once() {
    let store = Arc::new(LostAckProfiles::default());
    let h = harness_with(seed_items(), EvaluationPipeline::default(), store.clone(), settings());
    let id = started(&h, "ALG-S1-E2").await;

    let r = h.engine.step(&id, "s1", "3y").await.unwrap();
    assert_eq!(r.session_status, SessionStatus::Completed);
    assert!(r.progress_saved);

    let m = store.get_mastery("learner-1", "algebra.simplifying").await.unwrap().unwrap();
    assert_eq!(m.attempts, 1);
    assert!((m.score - 0.3).abs() < 1e-12);

    let profile = store.get_profile("learner-1").await.unwrap();
    assert_eq!(profile.xp, 15);
    assert_eq!(profile.sessions_completed, 1);
    assert_eq!(profile.current_streak, 1);
  }

  #[tokio::test]
  async fn lost_acknowledgement_counts_a_misconception_once() {
    let judge = Arc::new(CannedJudge {
      payload: r#"{"verdict":"incorrect","misconception_tag":"sign_error","confidence":0.6}"#.into(),
      calls: AtomicUsize::new(0),
    });
    let store = Arc::new(LostAckProfiles::default());
    let h = harness_with(seed_items(), judge_only(judge), store.clone(), settings());
    let id = started(&h, "ALG-S1-E1").await;

    assert!(h.engine.step(&id, "s1", "b minus four").await.unwrap().progress_saved);
    let records = store.get_misconceptions("learner-1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].count, 1);
  }

  // --- concurrency ---------------------------------------------------------

  #[tokio::test]
  async fn overlapping_calls_on_one_session_are_rejected() {
    let gate = Arc::new(GateJudge::default());
    let h = harness(judge_only(gate.clone()));
    let id = started(&h, "ALG-S1-E1").await;

    let engine = h.engine.clone();
    let first_id = id.clone();
    let first = tokio::spawn(async move { engine.step(&first_id, "s1", "four more than b").await });
    gate.entered.notified().await;

    assert!(matches!(h.engine.step(&id, "s1", "b+4").await, Err(TutorError::SessionBusy(_))));
    assert!(matches!(h.engine.end(&id).await, Err(TutorError::SessionBusy(_))));

    let other = started(&h, "ALG-S1-E1").await;
    assert_eq!(h.engine.step(&other, "s1", "b+4").await.unwrap().outcome, Outcome::Correct);

    gate.release.notify_one();
    let r = first.await.unwrap().unwrap();
    assert_eq!((r.outcome, r.resolved_by), (Outcome::Correct, ResolvedBy::Llm));
    assert_eq!(h.engine.step(&id, "s2", "10").await.unwrap().session_status, SessionStatus::Completed);
  }

  #[tokio::test]
  async fn cancelled_evaluation_applies_nothing() {
    let gate = Arc::new(GateJudge::default());
    let h = harness(judge_only(gate.clone()));
    let id = started(&h, "ALG-S1-E1").await;

    let cancelled = tokio::time::timeout(Duration::from_millis(50), h.engine.step(&id, "s1", "four more than b")).await;
    assert!(cancelled.is_err());

    let s = h.engine.get(&id).await.unwrap().session;
    assert_eq!((s.attempts_on_current_step, s.total_attempts), (0, 0));
    assert!(s.recent_responses.is_empty());

    let r = h.engine.step(&id, "s1", "b + 4").await.unwrap();
    assert_eq!(r.outcome, Outcome::Correct);
  }

  #[tokio::test]
  async fn parallel_sessions_for_one_learner_lose_no_mastery_updates() {
    let h = harness(EvaluationPipeline::default());
    let mut ids = vec![];
    for _ in 0..8 {
      ids.push(started(&h, "ALG-S1-E1").await);
    }
    let tasks: Vec<_> = ids
      .into_iter()
      .map(|id| {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.step(&id, "s1", "b+4").await })
      })
      .collect();
    for t in tasks {
      assert_eq!(t.await.unwrap().unwrap().outcome, Outcome::Correct);
    }
    let m = h.profiles.get_mastery("learner-1", "algebra.expressions").await.unwrap().unwrap();
    assert_eq!(m.attempts, 8);
  }

  // --- caller errors -------------------------------------------------------

  #[tokio::test]
  async fn unknown_ids_are_named_errors() {
    let h = harness(EvaluationPipeline::default());
    assert!(matches!(h.engine.start("l", Some("NOPE")).await, Err(TutorError::ItemNotFound(_))));
    assert!(matches!(h.engine.step("missing", "s1", "x").await, Err(TutorError::SessionNotFound(_))));
    assert!(matches!(h.engine.end("missing").await, Err(TutorError::SessionNotFound(_))));
    assert!(matches!(h.engine.get("missing").await, Err(TutorError::SessionNotFound(_))));
  }

  #[tokio::test]
  async fn start_without_item_follows_progression() {
    let h = harness(EvaluationPipeline::default());

    let first = h.engine.start("learner-1", None).await.unwrap();
    assert_eq!(first.session.item_id, "ALG-S1-E1");
    let id = first.session.session_id;
    h.engine.step(&id, "s1", "b+4").await.unwrap();
    h.engine.step(&id, "s2", "10").await.unwrap();

    let second = h.engine.start("learner-1", None).await.unwrap();
    assert_eq!(second.session.item_id, "ALG-S1-E2");
    h.engine.step(&second.session.session_id, "s1", "3y").await.unwrap();

    assert!(matches!(h.engine.start("learner-1", None).await, Err(TutorError::ItemNotFound(_))));
    assert_eq!(h.engine.start("learner-2", None).await.unwrap().session.item_id, "ALG-S1-E1");
  }

  #[tokio::test]
  async fn start_returns_first_prompt() {
    let h = harness(EvaluationPipeline::default());
    let v = h.engine.start("learner-1", Some("ALG-S1-E1")).await.unwrap();
    assert_eq!(v.session.status, SessionStatus::Active);
    assert_eq!(v.session.current_step_index, 0);
    assert_eq!(v.step_id.as_deref(), Some("s1"));
    assert!(v.problem_text.contains("marbles"));
  }
}
