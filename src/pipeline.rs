//! Ordered evaluation of one submission.
//!
//! normalize -> rules -> equivalence -> judge. The first stage with a
//! conclusive outcome decides; later stages are never consulted. Stages run
//! strictly one after another. `Inconclusive` never leaves this module: if the
//! last enabled stage cannot decide, the answer is treated as incorrect.
//! Responses longer than `MAX_RESPONSE_CHARS` are rejected before any stage.

use tracing::{debug, instrument};

use crate::domain::{EvaluationRule, Item, Outcome, ResolvedBy, Step, Verdict};
use crate::equivalence::EquivalenceAdjudicator;
use crate::judge::{JudgeAdapter, JudgeContext};
use crate::matcher::match_rules;
use crate::normalize::normalize;

pub const MAX_RESPONSE_CHARS: usize = 1000;

/// Which optional stages may run for one submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnabledStages {
  pub equivalence: bool,
  pub llm: bool,
}

impl EnabledStages {
  /// A stage runs only when both the step and the global switch allow it.
  pub fn for_rule(rule: &EvaluationRule, cas_switch: bool, llm_switch: bool) -> Self {
    Self { equivalence: rule.algebraic_equivalence && cas_switch, llm: rule.llm_fallback && llm_switch }
  }
}

pub struct EvaluationContext<'a> {
  pub item: &'a Item,
  pub step: &'a Step,
  /// Earlier responses on this step, oldest first.
  pub prior_responses: &'a [String],
  /// Including the submission being evaluated.
  pub attempts: u32,
}

#[derive(Clone, Default)]
pub struct EvaluationPipeline {
  equivalence: Option<EquivalenceAdjudicator>,
  judge: Option<JudgeAdapter>,
}

impl EvaluationPipeline {
  pub fn new(equivalence: Option<EquivalenceAdjudicator>, judge: Option<JudgeAdapter>) -> Self {
    Self { equivalence, judge }
  }

  #[instrument(level = "debug", skip_all, fields(item_id = %ctx.item.id, step_id = %ctx.step.id, response_len = response_text.len()))]
  pub async fn evaluate(&self, ctx: &EvaluationContext<'_>, response_text: &str, enabled: EnabledStages) -> Verdict {
    let rule = &ctx.step.rule;
    if response_text.chars().count() > MAX_RESPONSE_CHARS {
      debug!(target: "session", "Response too long to evaluate");
      return Verdict::new(Outcome::Incorrect, ResolvedBy::Rule);
    }
    let normalized = normalize(response_text);

    let mut last = ResolvedBy::Rule;
    if match_rules(&normalized, rule) == Outcome::Correct {
      debug!(target: "session", "Resolved by rule");
      return Verdict::new(Outcome::Correct, ResolvedBy::Rule);
    }

    if enabled.equivalence {
      if let Some(adjudicator) = &self.equivalence {
        last = ResolvedBy::Equivalence;
        let outcome = adjudicator.adjudicate(&normalized, &rule.equivalence_targets()).await;
        if outcome.is_conclusive() {
          debug!(target: "session", %outcome, "Resolved by equivalence");
          return Verdict::new(outcome, ResolvedBy::Equivalence);
        }
      }
    }

    if enabled.llm {
      if let Some(judge) = &self.judge {
        let jctx = JudgeContext {
          problem_text: ctx.item.problem_text.clone(),
          step_prompt: ctx.step.prompt.clone(),
          reference_answer: rule.judge_reference(),
          response: response_text.trim().to_string(),
          prior_responses: ctx.prior_responses.to_vec(),
          attempts: ctx.attempts,
        };
        let v = judge.judge(&jctx).await;
        let outcome = if v.outcome.is_conclusive() { v.outcome } else { Outcome::Incorrect };
        debug!(target: "session", %outcome, judged = %v.outcome, "Resolved by judge");
        return Verdict {
          outcome,
          resolved_by: ResolvedBy::Llm,
          misconception_tag: v.misconception_tag.filter(|_| outcome == Outcome::Incorrect),
          confidence: v.confidence,
          rationale: v.rationale,
        };
      }
    }

    // Literal/regex miss with nothing left to ask.
    Verdict::new(Outcome::Incorrect, last)
  }
}
