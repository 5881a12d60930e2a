//! Language-model judge: the last stage of the evaluation pipeline.
//!
//! The adapter owns everything model-agnostic: prompt assembly, the strict
//! JSON verdict schema, the per-call timeout and the bounded retry budget.
//! Providers implement `JudgeEngine` and only move text.
//!
//! Expected payload:
//!
//! ```json
//! {"verdict": "correct", "rationale": "...", "misconception_tag": null, "confidence": 0.9}
//! ```
//!
//! Malformed payloads, out-of-range confidence, transport errors and timeouts
//! all consume one try. When the budget is spent the judge answers
//! `Inconclusive`; it never returns an error to the pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::Prompts;
use crate::domain::Outcome;
use crate::util::{fill_template, trunc_for_log};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JudgeRequest {
  pub system: String,
  pub user: String,
}

#[derive(Debug, Error)]
pub enum JudgeError {
  #[error("judge transport failed: {0}")]
  Transport(String),
  #[error("judge call timed out after {0:?}")]
  Timeout(Duration),
  #[error("judge payload rejected: {0}")]
  Malformed(String),
}

/// A model that answers a rubric prompt with a raw (JSON) payload.
#[async_trait]
pub trait JudgeEngine: Send + Sync {
  async fn complete(&self, request: &JudgeRequest) -> Result<String, JudgeError>;
}

/// What the judge gets to see about the submission.
#[derive(Clone, Debug, Default)]
pub struct JudgeContext {
  pub problem_text: String,
  pub step_prompt: String,
  /// For grading only; the system prompt forbids repeating it.
  pub reference_answer: String,
  pub response: String,
  /// Earlier responses on this step, oldest first.
  pub prior_responses: Vec<String>,
  pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JudgeVerdict {
  pub outcome: Outcome,
  pub rationale: Option<String>,
  pub misconception_tag: Option<String>,
  pub confidence: Option<f64>,
}

impl JudgeVerdict {
  fn inconclusive() -> Self {
    Self { outcome: Outcome::Inconclusive, rationale: None, misconception_tag: None, confidence: None }
  }
}

#[derive(Deserialize)]
struct RawVerdict {
  verdict: String,
  #[serde(default)]
  rationale: Option<String>,
  #[serde(default)]
  misconception_tag: Option<String>,
  #[serde(default)]
  confidence: Option<f64>,
}

#[derive(Clone)]
pub struct JudgeAdapter {
  engine: Arc<dyn JudgeEngine>,
  prompts: Prompts,
  retries: u32,
  call_timeout: Duration,
}

impl JudgeAdapter {
  pub fn new(engine: Arc<dyn JudgeEngine>, prompts: Prompts, retries: u32, call_timeout: Duration) -> Self {
    Self { engine, prompts, retries, call_timeout }
  }

  pub fn build_request(&self, ctx: &JudgeContext) -> JudgeRequest {
    let prior = if ctx.prior_responses.is_empty() {
      "(none)".to_string()
    } else {
      ctx.prior_responses.iter().map(|r| format!("\"{r}\"")).collect::<Vec<_>>().join(", ")
    };
    let attempts = ctx.attempts.to_string();
    let user = fill_template(
      &self.prompts.judge_user_template,
      &[
        ("problem_text", ctx.problem_text.as_str()),
        ("step_prompt", ctx.step_prompt.as_str()),
        ("reference_answer", ctx.reference_answer.as_str()),
        ("response", ctx.response.as_str()),
        ("prior_responses", prior.as_str()),
        ("attempts", attempts.as_str()),
      ],
    );
    JudgeRequest { system: self.prompts.judge_system.clone(), user }
  }

  #[instrument(level = "debug", skip(self, ctx), fields(response_len = ctx.response.len(), attempts = ctx.attempts))]
  pub async fn judge(&self, ctx: &JudgeContext) -> JudgeVerdict {
    let request = self.build_request(ctx);
    let tries = self.retries.saturating_add(1);

    for attempt in 1..=tries {
      let result = match tokio::time::timeout(self.call_timeout, self.engine.complete(&request)).await {
        Ok(r) => r.and_then(|raw| parse_verdict(&raw)),
        Err(_) => Err(JudgeError::Timeout(self.call_timeout)),
      };
      match result {
        Ok(v) => {
          debug!(target: "session", attempt, outcome = %v.outcome, tag = ?v.misconception_tag, "Judge verdict");
          return v;
        }
        Err(e) => warn!(target: "tutor_backend", attempt, tries, error = %e, "Judge call unusable"),
      }
    }
    JudgeVerdict::inconclusive()
  }
}

/// Strict parse of a judge payload. Tolerates a surrounding code fence.
pub fn parse_verdict(raw: &str) -> Result<JudgeVerdict, JudgeError> {
  let body = strip_fence(raw);
  let parsed: RawVerdict = serde_json::from_str(body)
    .map_err(|e| JudgeError::Malformed(format!("{e} in {}", trunc_for_log(body, 160))))?;

  let outcome = match parsed.verdict.trim().to_ascii_lowercase().as_str() {
    "correct" => Outcome::Correct,
    "incorrect" => Outcome::Incorrect,
    "inconclusive" | "unknown" => Outcome::Inconclusive,
    other => return Err(JudgeError::Malformed(format!("unknown verdict '{other}'"))),
  };

  if let Some(c) = parsed.confidence {
    if !c.is_finite() || !(0.0..=1.0).contains(&c) {
      return Err(JudgeError::Malformed(format!("confidence {c} outside [0, 1]")));
    }
  }

  let misconception_tag = match outcome {
    Outcome::Incorrect => parsed.misconception_tag.as_deref().and_then(normalize_tag),
    _ => None,
  };

  Ok(JudgeVerdict {
    outcome,
    rationale: parsed.rationale.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
    misconception_tag,
    confidence: parsed.confidence,
  })
}

fn strip_fence(raw: &str) -> &str {
  let t = raw.trim();
  let Some(rest) = t.strip_prefix("```") else { return t };
  let rest = rest.strip_prefix("json").unwrap_or(rest);
  rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// `"Adds Instead-of Multiplies"` -> `adds_instead_of_multiplies`.
fn normalize_tag(tag: &str) -> Option<String> {
  let mut out = String::with_capacity(tag.len());
  for ch in tag.trim().chars() {
    if ch.is_ascii_alphanumeric() {
      out.push(ch.to_ascii_lowercase());
    } else if !out.is_empty() && !out.ends_with('_') {
      out.push('_');
    }
  }
  while out.ends_with('_') {
    out.pop();
  }
  (!out.is_empty() && out != "null" && out != "none").then_some(out)
}
