//! Per-learner, per-skill mastery estimate.
//!
//! Update rule, with `n` the number of prior updates for the skill:
//!
//! ```text
//! rate   = max(min_rate, learning_rate / (1 + rate_decay * n))
//! target = 1 - min(hint_penalty * hints_used, max_hint_penalty)   (correct)
//!        = 0                                                      (incorrect)
//! score' = clamp(score + rate * (target - score), 0, 1)
//! ```
//!
//! `score'` is a convex combination of two values in `[0, 1]` whenever
//! `rate` is in `(0, 1]`, so the score never leaves the unit interval.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::domain::MasteryRecord;
use crate::error::StoreError;
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::ProfileStore;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MasteryParams {
  pub initial_score: f64,
  pub learning_rate: f64,
  pub rate_decay: f64,
  pub min_rate: f64,
  pub hint_penalty: f64,
  pub max_hint_penalty: f64,
}

impl Default for MasteryParams {
  fn default() -> Self {
    Self {
      initial_score: 0.0,
      learning_rate: 0.3,
      rate_decay: 0.1,
      min_rate: 0.05,
      hint_penalty: 0.15,
      max_hint_penalty: 0.6,
    }
  }
}

impl MasteryParams {
  /// Clamp every constant into the range that keeps the update bounded.
  pub fn sanitized(&self) -> Self {
    let unit = |v: f64, fallback: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { fallback };
    let d = Self::default();
    Self {
      initial_score: unit(self.initial_score, d.initial_score),
      learning_rate: unit(self.learning_rate, d.learning_rate),
      rate_decay: if self.rate_decay.is_finite() { self.rate_decay.max(0.0) } else { d.rate_decay },
      min_rate: unit(self.min_rate, d.min_rate),
      hint_penalty: if self.hint_penalty.is_finite() { self.hint_penalty.max(0.0) } else { d.hint_penalty },
      max_hint_penalty: unit(self.max_hint_penalty, d.max_hint_penalty),
    }
  }

  pub fn next_score(&self, prior_score: f64, prior_attempts: u32, correct: bool, hints_used: u32) -> f64 {
    let rate = (self.learning_rate / (1.0 + self.rate_decay * prior_attempts as f64)).max(self.min_rate);
    let target = if correct {
      1.0 - (self.hint_penalty * hints_used as f64).min(self.max_hint_penalty)
    } else {
      0.0
    };
    let prior = if prior_score.is_finite() { prior_score.clamp(0.0, 1.0) } else { self.initial_score };
    (prior + rate * (target - prior)).clamp(0.0, 1.0)
  }

  pub fn apply(
    &self,
    prior: Option<&MasteryRecord>,
    skill: &str,
    correct: bool,
    hints_used: u32,
    at: DateTime<Utc>,
  ) -> MasteryRecord {
    let (score, attempts) = prior.map(|r| (r.score, r.attempts)).unwrap_or((self.initial_score, 0));
    MasteryRecord {
      skill: skill.to_string(),
      score: self.next_score(score, attempts, correct, hints_used),
      attempts: attempts.saturating_add(1),
      last_updated: at,
    }
  }
}

#[derive(Clone)]
pub struct MasteryEstimator {
  store: Arc<dyn ProfileStore>,
  params: MasteryParams,
  retry: RetryPolicy,
}

impl MasteryEstimator {
  pub fn new(store: Arc<dyn ProfileStore>, params: MasteryParams, retry: RetryPolicy) -> Self {
    Self { store, params: params.sanitized(), retry }
  }

  /// Returns the new score. The record is computed once and only the put is
  /// retried, so a lost acknowledgement cannot apply the update twice.
  /// Callers hold the learner's lock (`store::LearnerLocks`).
  #[instrument(level = "debug", skip(self), fields(%learner_id, %skill))]
  pub async fn update(
    &self,
    learner_id: &str,
    skill: &str,
    correct: bool,
    hints_used: u32,
    at: DateTime<Utc>,
  ) -> Result<f64, StoreError> {
    let prior = with_backoff(&self.retry, "get_mastery", || self.store.get_mastery(learner_id, skill)).await?;
    let record = self.params.apply(prior.as_ref(), skill, correct, hints_used, at);
    with_backoff(&self.retry, "put_mastery", || self.store.put_mastery(learner_id, record.clone())).await?;
    debug!(target: "session", %learner_id, %skill, %correct, hints_used, score = record.score, attempts = record.attempts, "Mastery updated");
    Ok(record.score)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::InMemoryProfileStore;

  #[test]
  fn correct_without_hints_moves_toward_one() {
    let p = MasteryParams::default();
    let s = p.next_score(0.0, 0, true, 0);
    assert!((s - 0.3).abs() < 1e-12);
    assert!(p.next_score(s, 1, true, 0) > s);
  }

  #[test]
  fn hints_reduce_the_gain() {
    let p = MasteryParams::default();
    let clean = p.next_score(0.2, 3, true, 0);
    let hinted = p.next_score(0.2, 3, true, 2);
    let many = p.next_score(0.2, 3, true, 20);
    assert!(clean > hinted);
    assert!(hinted > many);
    assert!(many > 0.2, "capped penalty still rewards a correct answer from a low score");
  }

  #[test]
  fn incorrect_moves_toward_zero() {
    let p = MasteryParams::default();
    assert!(p.next_score(0.8, 2, false, 0) < 0.8);
    assert_eq!(p.next_score(0.0, 2, false, 0), 0.0);
  }

  #[test]
  fn step_size_shrinks_with_attempts_but_not_below_floor() {
    let p = MasteryParams::default();
    let early = p.next_score(0.5, 0, true, 0) - 0.5;
    let late = p.next_score(0.5, 50, true, 0) - 0.5;
    assert!(early > late);
    assert!((late - 0.5 * p.min_rate).abs() < 1e-12);
  }

  #[test]
  fn score_stays_in_unit_interval_for_any_sequence() {
    let wild = MasteryParams {
      initial_score: 7.0,
      learning_rate: 3.0,
      rate_decay: -1.0,
      min_rate: 2.0,
      hint_penalty: 9.0,
      max_hint_penalty: 4.0,
    }
    .sanitized();
    for p in [MasteryParams::default(), wild] {
      let mut record: Option<MasteryRecord> = None;
      for i in 0..500u32 {
        let correct = (i * 7919) % 3 != 0;
        let hints = (i * 31) % 6;
        let next = p.apply(record.as_ref(), "algebra", correct, hints, Utc::now());
        assert!((0.0..=1.0).contains(&next.score), "score {} out of range", next.score);
        record = Some(next);
      }
    }
  }

  #[test]
  fn deterministic_for_same_inputs() {
    let p = MasteryParams::default();
    assert_eq!(p.next_score(0.42, 4, true, 1), p.next_score(0.42, 4, true, 1));
  }

  #[tokio::test]
  async fn update_creates_record_lazily_and_counts_attempts() {
    let store = Arc::new(InMemoryProfileStore::new());
    let estimator = MasteryEstimator::new(store.clone(), MasteryParams::default(), RetryPolicy::default());
    assert!(store.get_mastery("l1", "algebra").await.unwrap().is_none());

    let first = estimator.update("l1", "algebra", true, 0, Utc::now()).await.unwrap();
    let second = estimator.update("l1", "algebra", true, 1, Utc::now()).await.unwrap();
    assert!(second > first);

    let record = store.get_mastery("l1", "algebra").await.unwrap().unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.score, second);
  }
}
