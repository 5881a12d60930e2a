//! Learning events published by the session engine.
//!
//! The default sink logs every event and fans it out on a broadcast channel;
//! downstream consumers (analytics, streak jobs, tests) subscribe. Emitting
//! never fails: with no subscribers the event is only logged.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::domain::{SessionSummary, StepEvent};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TutorEvent {
  StepResolved(StepEvent),
  SessionEnded(SessionSummary),
}

impl TutorEvent {
  pub fn learner_id(&self) -> &str {
    match self {
      Self::StepResolved(e) => &e.learner_id,
      Self::SessionEnded(s) => &s.learner_id,
    }
  }
}

pub trait EventSink: Send + Sync {
  fn emit(&self, event: TutorEvent);
}

#[derive(Clone)]
pub struct BroadcastSink {
  tx: broadcast::Sender<TutorEvent>,
}

impl BroadcastSink {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<TutorEvent> {
    self.tx.subscribe()
  }
}

impl EventSink for BroadcastSink {
  fn emit(&self, event: TutorEvent) {
    match &event {
      TutorEvent::StepResolved(e) => info!(
        target: "session",
        learner_id = %e.learner_id,
        session_id = %e.session_id,
        item_id = %e.item_id,
        step_id = %e.step_id,
        skill = %e.skill,
        outcome = %e.outcome,
        hints_used = e.hints_used,
        misconception_tag = ?e.misconception_tag,
        mastery_score = ?e.mastery_score,
        "Step resolved"
      ),
      TutorEvent::SessionEnded(s) => info!(
        target: "session",
        learner_id = %s.learner_id,
        session_id = %s.session_id,
        item_id = %s.item_id,
        status = %s.status,
        correct_steps = s.correct_steps,
        total_steps = s.total_steps,
        total_attempts = s.total_attempts,
        hints_shown = s.hints_shown,
        xp_awarded = s.xp_awarded,
        progress_saved = s.progress_saved,
        "Session ended"
      ),
    }
    if self.tx.send(event).is_err() {
      debug!(target: "tutor_backend", "No event subscribers");
    }
  }
}
