//! Domain models used by the tutoring core: problem items and their typed
//! evaluation rules, sessions and their lifecycle, verdicts, and the durable
//! learner records (mastery, misconceptions, profile counters).

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::expr::{parse_statement, BinaryOp, Statement};
use crate::normalize::{compact, normalize};

// ---------------------------------------------------------------------------
// Content (immutable, loaded once)
// ---------------------------------------------------------------------------

/// One problem item: a problem statement split into guided steps.
#[derive(Clone, Debug)]
pub struct Item {
  pub id: String,
  pub title: String,
  pub topic: String,
  /// Authored ordering label such as "1.2 Simplifying expressions".
  pub sub_topic: String,
  pub problem_text: String,
  pub skill: String,
  pub subskills: BTreeSet<String>,
  pub scoring: Scoring,
  pub steps: Vec<Step>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scoring {
  pub base_xp: u32,
  pub no_hint_bonus: u32,
}

#[derive(Clone, Debug)]
pub struct Step {
  pub id: String,
  pub prompt: String,
  pub rule: EvaluationRule,
  /// Sorted by level; levels are 1..=len.
  pub hints: Vec<Hint>,
}

impl Step {
  pub fn max_hint_level(&self) -> u32 {
    self.hints.last().map(|h| h.level).unwrap_or(0)
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
  pub level: u32,
  pub text: String,
}

/// Typed form of the authored per-step rule set.
#[derive(Clone, Debug)]
pub struct EvaluationRule {
  pub patterns: Vec<AnswerPattern>,
  /// Operators whose operands may appear in any order in a literal match.
  pub commutative: Vec<BinaryOp>,
  pub algebraic_equivalence: bool,
  pub llm_fallback: bool,
  /// Worked answer shown to the judge only.
  pub reference_answer: Option<String>,
}

impl EvaluationRule {
  /// Literal answers double as targets for the equivalence engine.
  pub fn equivalence_targets(&self) -> Vec<String> {
    self
      .patterns
      .iter()
      .filter_map(|p| match p {
        AnswerPattern::Literal { text, .. } => Some(text.clone()),
        AnswerPattern::Regex { .. } => None,
      })
      .collect()
  }

  /// What the judge is told the answer is.
  pub fn judge_reference(&self) -> String {
    if let Some(r) = &self.reference_answer {
      return r.clone();
    }
    self
      .patterns
      .iter()
      .map(|p| match p {
        AnswerPattern::Literal { text, .. } => text.clone(),
        AnswerPattern::Regex { source, .. } => format!("/{source}/"),
      })
      .collect::<Vec<_>>()
      .join(" or ")
  }
}

#[derive(Clone, Debug)]
pub enum AnswerPattern {
  /// `text` is normalized; `parsed` is its expression form when it has one.
  Literal { text: String, parsed: Option<Statement> },
  /// Anchored, case-insensitive.
  Regex { source: String, regex: Regex },
}

impl AnswerPattern {
  /// Normalizes and parses an authored answer once, at compile time.
  pub fn literal(raw: &str) -> Self {
    let text = normalize(raw);
    let parsed = parse_statement(&compact(&text)).ok();
    Self::Literal { text, parsed }
  }
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
  Correct,
  Incorrect,
  Inconclusive,
}

impl Outcome {
  pub fn is_conclusive(self) -> bool {
    !matches!(self, Self::Inconclusive)
  }
}

impl fmt::Display for Outcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Correct => write!(f, "correct"),
      Self::Incorrect => write!(f, "incorrect"),
      Self::Inconclusive => write!(f, "inconclusive"),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
  Rule,
  Equivalence,
  Llm,
}

impl fmt::Display for ResolvedBy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Rule => write!(f, "rule"),
      Self::Equivalence => write!(f, "equivalence"),
      Self::Llm => write!(f, "llm"),
    }
  }
}

/// Result of evaluating one submission. Produced once, never stored.
#[derive(Clone, Debug, PartialEq)]
pub struct Verdict {
  pub outcome: Outcome,
  pub resolved_by: ResolvedBy,
  pub misconception_tag: Option<String>,
  pub confidence: Option<f64>,
  /// Judge reasoning; internal only, may reference the answer.
  pub rationale: Option<String>,
}

impl Verdict {
  pub fn new(outcome: Outcome, resolved_by: ResolvedBy) -> Self {
    Self { outcome, resolved_by, misconception_tag: None, confidence: None, rationale: None }
  }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
  Active,
  Completed,
  Abandoned,
}

/// Attempted move out of a terminal state (or into `Active`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidTransition {
  pub from: SessionStatus,
  pub to: SessionStatus,
}

impl SessionStatus {
  /// The only place session transitions are decided.
  pub fn transition(self, to: SessionStatus) -> Result<SessionStatus, InvalidTransition> {
    match (self, to) {
      (Self::Active, Self::Completed) | (Self::Active, Self::Abandoned) => Ok(to),
      _ => Err(InvalidTransition { from: self, to }),
    }
  }
}

impl fmt::Display for SessionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Active => write!(f, "active"),
      Self::Completed => write!(f, "completed"),
      Self::Abandoned => write!(f, "abandoned"),
    }
  }
}

/// Mutable session record. Only the session engine writes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
  pub session_id: String,
  pub learner_id: String,
  pub item_id: String,
  pub current_step_index: usize,
  pub attempts_on_current_step: u32,
  pub status: SessionStatus,
  pub created_at: DateTime<Utc>,
  pub last_activity_at: DateTime<Utc>,

  pub total_attempts: u32,
  pub correct_steps: u32,
  pub hints_shown: u32,
  /// Recent responses on the current step, oldest first. Cleared on advance.
  #[serde(default)]
  pub recent_responses: Vec<String>,
  /// Last misconception the judge tagged on the current step.
  #[serde(default)]
  pub last_misconception_tag: Option<String>,
  /// Archived on the first `end()`.
  #[serde(default)]
  pub summary: Option<SessionSummary>,
}

impl Session {
  pub fn new(session_id: String, learner_id: String, item_id: String, now: DateTime<Utc>) -> Self {
    Self {
      session_id,
      learner_id,
      item_id,
      current_step_index: 0,
      attempts_on_current_step: 0,
      status: SessionStatus::Active,
      created_at: now,
      last_activity_at: now,
      total_attempts: 0,
      correct_steps: 0,
      hints_shown: 0,
      recent_responses: Vec::new(),
      last_misconception_tag: None,
      summary: None,
    }
  }
}

/// Aggregates handed to the scoring collaborator when a session ends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
  pub session_id: String,
  pub learner_id: String,
  pub item_id: String,
  pub skill: String,
  pub status: SessionStatus,
  pub total_steps: u32,
  pub correct_steps: u32,
  pub total_attempts: u32,
  pub hints_shown: u32,
  pub xp_awarded: u32,
  pub progress_saved: bool,
  pub started_at: DateTime<Utc>,
  pub ended_at: DateTime<Utc>,
}

/// Emitted after every resolved step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
  pub learner_id: String,
  pub session_id: String,
  pub item_id: String,
  pub step_id: String,
  pub skill: String,
  pub outcome: Outcome,
  pub hints_used: u32,
  pub misconception_tag: Option<String>,
  pub mastery_score: Option<f64>,
  pub at: DateTime<Utc>,
}

/// What the presentation layer renders after a submission.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepResult {
  pub session_id: String,
  pub step_id: String,
  pub outcome: Outcome,
  pub resolved_by: ResolvedBy,
  pub attempts: u32,
  pub hint: Option<Hint>,
  pub next_step_id: Option<String>,
  pub next_prompt: Option<String>,
  pub session_status: SessionStatus,
  /// False when a learner-profile write failed after retries.
  pub progress_saved: bool,
  pub next_item_id: Option<String>,
}

/// A session plus what to show for its current step.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionView {
  pub session: Session,
  pub title: String,
  pub problem_text: String,
  pub step_id: Option<String>,
  pub prompt: Option<String>,
}

// ---------------------------------------------------------------------------
// Durable learner records
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MasteryRecord {
  pub skill: String,
  pub score: f64,
  pub attempts: u32,
  pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MisconceptionRecord {
  pub tag: String,
  pub count: u32,
  pub first_seen: DateTime<Utc>,
  pub last_seen: DateTime<Utc>,
  pub running_confidence: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LearnerProfile {
  pub learner_id: String,
  pub xp: u64,
  pub completed_items: Vec<String>,
  pub sessions_completed: u32,
  pub current_streak: u32,
  pub best_streak: u32,
}

impl LearnerProfile {
  pub fn new(learner_id: &str) -> Self {
    Self { learner_id: learner_id.to_string(), ..Default::default() }
  }
}
