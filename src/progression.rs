//! Item ordering, next-item recommendation and session XP.
//!
//! Items are ordered by topic, then by the decimal prefix of their sub-topic
//! label ("1.2 Simplifying" -> 12), then by the `-Q<n>` number in their id,
//! then by id.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::domain::{Item, Scoring, SessionStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
  id: String,
  topic: String,
  sub_topic_order: u32,
  question: u32,
}

impl Entry {
  fn key(&self) -> (&str, u32, u32, &str) {
    (self.topic.as_str(), self.sub_topic_order, self.question, self.id.as_str())
  }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressionStatus {
  pub total_items: usize,
  pub completed_count: usize,
  pub completion_percentage: f64,
  pub next_item_id: Option<String>,
  pub items: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct Progression {
  entries: Vec<Entry>,
}

impl Progression {
  pub fn new(items: &[Arc<Item>]) -> Self {
    let mut entries: Vec<Entry> = items
      .iter()
      .map(|it| Entry {
        id: it.id.clone(),
        topic: it.topic.to_lowercase(),
        sub_topic_order: sub_topic_order(&it.sub_topic),
        question: question_number(&it.id),
      })
      .collect();
    entries.sort_by(|a, b| a.key().cmp(&b.key()));
    Self { entries }
  }

  /// Ordered ids, optionally restricted to one topic (case-insensitive).
  pub fn ordered(&self, topic: Option<&str>) -> Vec<&str> {
    let topic = topic.map(str::to_lowercase);
    self
      .entries
      .iter()
      .filter(|e| topic.as_deref().map_or(true, |t| e.topic == t))
      .map(|e| e.id.as_str())
      .collect()
  }

  /// First uncompleted item after `current` in its topic; falls back to the
  /// first uncompleted item overall (or in `topic` when given).
  pub fn recommend_next(&self, current: Option<&str>, completed: &[String], topic: Option<&str>) -> Option<String> {
    let done: HashSet<&str> = completed.iter().map(String::as_str).collect();

    let scope = match (topic, current.and_then(|c| self.entries.iter().find(|e| e.id == c))) {
      (Some(t), _) => Some(t.to_lowercase()),
      (None, Some(e)) => Some(e.topic.clone()),
      (None, None) => None,
    };
    let ordered = self.ordered(scope.as_deref());

    let after = current
      .and_then(|c| ordered.iter().position(|id| *id == c))
      .map(|i| i + 1)
      .unwrap_or(0);
    ordered[after..]
      .iter()
      .chain(ordered[..after].iter())
      .find(|id| !done.contains(**id))
      .map(|id| id.to_string())
  }

  pub fn status(&self, completed: &[String], topic: Option<&str>) -> ProgressionStatus {
    let ordered = self.ordered(topic);
    let done: HashSet<&str> = completed.iter().map(String::as_str).collect();
    let completed_count = ordered.iter().filter(|id| done.contains(**id)).count();
    let total_items = ordered.len();
    let last_done = completed.iter().rev().find(|c| ordered.contains(&c.as_str())).map(String::as_str);
    ProgressionStatus {
      total_items,
      completed_count,
      completion_percentage: if total_items == 0 { 0.0 } else { completed_count as f64 * 100.0 / total_items as f64 },
      next_item_id: self.recommend_next(last_done, completed, topic),
      items: ordered.into_iter().map(str::to_string).collect(),
    }
  }
}

/// Leading decimal of a sub-topic label times ten: "1.2 Intro" -> 12.
fn sub_topic_order(label: &str) -> u32 {
  label
    .split_whitespace()
    .next()
    .and_then(|tok| tok.parse::<f64>().ok())
    .filter(|v| v.is_finite() && *v >= 0.0)
    .map(|v| (v * 10.0).round() as u32)
    .unwrap_or(0)
}

/// `ALGEBRA-INTRO-Q5` -> 5; ids without a trailing `-Q<n>` -> 0.
fn question_number(id: &str) -> u32 {
  id.rsplit_once("-Q").and_then(|(_, n)| n.parse().ok()).unwrap_or(0)
}

/// XP for a finished session: completed sessions earn the item's base XP
/// plus the no-hint bonus when no hints were shown; abandoned ones earn 0.
pub fn session_xp(scoring: &Scoring, status: SessionStatus, hints_shown: u32) -> u32 {
  match status {
    SessionStatus::Completed => {
      let bonus = if hints_shown == 0 { scoring.no_hint_bonus } else { 0 };
      scoring.base_xp.saturating_add(bonus)
    }
    SessionStatus::Active | SessionStatus::Abandoned => 0,
  }
}

/// Streak bookkeeping: completion extends the current streak, abandoning resets it.
pub fn next_streak(current: u32, best: u32, status: SessionStatus) -> (u32, u32) {
  match status {
    SessionStatus::Completed => {
      let cur = current.saturating_add(1);
      (cur, best.max(cur))
    }
    _ => (0, best),
  }
}
