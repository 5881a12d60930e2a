//! Loading tutor configuration (judge prompts, engine tuning, item bank) from TOML.
//!
//! See `TutorConfig`, `EngineSettings` and `ItemCfg` for the expected schema.
//! Authored items are validated and compiled into typed `Item`s exactly once,
//! at load time.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use regex::RegexBuilder;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::domain::{AnswerPattern, EvaluationRule, Hint, Item, Scoring, Step};
use crate::error::ItemError;
use crate::expr::BinaryOp;
use crate::mastery::MasteryParams;
use crate::misconceptions::DEFAULT_WEIGHT;
use crate::retry::RetryPolicy;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct TutorConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub engine: EngineSettings,
  #[serde(default)]
  pub items: Vec<ItemCfg>,
}

/// Prompts used by the LLM judge. Defaults target primary-school algebra.
/// Templates accept `{problem_text}`, `{step_prompt}`, `{reference_answer}`,
/// `{response}`, `{prior_responses}` and `{attempts}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub judge_system: String,
  pub judge_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      judge_system: "You are a strict but patient math tutor grading one step of a guided problem. \
        You are told the reference answer so you can grade; you must NEVER repeat, reveal or hint at it \
        in your output. Decide whether the learner's answer is mathematically correct for this step. \
        Reply ONLY with compact JSON: {\"verdict\": \"correct\"|\"incorrect\"|\"inconclusive\", \
        \"rationale\": string, \"misconception_tag\": string|null, \"confidence\": number between 0 and 1}. \
        misconception_tag is a short snake_case label for a recurring error type (e.g. \"adds_instead_of_multiplies\"), \
        or null if none applies."
        .into(),
      judge_user_template: "Problem: {problem_text}\nCurrent step: {step_prompt}\nReference answer (for grading only): {reference_answer}\n\
        Earlier answers on this step: {prior_responses}\nLearner answer: {response}\nAttempts on this step: {attempts}"
        .into(),
    }
  }
}

/// Runtime tuning. Every field has a default; TOML only needs overrides.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
  /// Global switches; a step's own flags must also be set.
  pub cas_enabled: bool,
  pub llm_enabled: bool,

  pub equivalence_timeout_ms: u64,
  pub equivalence_samples: usize,

  pub judge_timeout_ms: u64,
  /// Extra judge calls after a malformed or failed one.
  pub judge_retries: u32,
  pub judge_temperature: f32,

  pub misconception_weight: f64,
  pub mastery: MasteryParams,
  pub store_retry: RetryPolicy,

  /// How many earlier responses on the same step the judge sees.
  pub prior_response_window: usize,
  /// Shown when a step has no hint ladder.
  pub generic_nudge: String,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      cas_enabled: true,
      llm_enabled: true,
      equivalence_timeout_ms: 2_000,
      equivalence_samples: 24,
      judge_timeout_ms: 8_000,
      judge_retries: 1,
      judge_temperature: 0.1,
      misconception_weight: DEFAULT_WEIGHT,
      mastery: MasteryParams::default(),
      store_retry: RetryPolicy::default(),
      prior_response_window: 5,
      generic_nudge: "Not quite. Look at the question again: what is it asking you to find?".into(),
    }
  }
}

impl EngineSettings {
  pub fn equivalence_budget(&self) -> Duration {
    Duration::from_millis(self.equivalence_timeout_ms.max(1))
  }

  pub fn judge_timeout(&self) -> Duration {
    Duration::from_millis(self.judge_timeout_ms.max(1))
  }

  /// `CAS_ENABLED` / `LLM_ENABLED` ("true"/"false"/"1"/"0") override TOML.
  pub fn apply_env_overrides(&mut self) {
    if let Some(v) = env_flag("CAS_ENABLED") {
      self.cas_enabled = v;
    }
    if let Some(v) = env_flag("LLM_ENABLED") {
      self.llm_enabled = v;
    }
  }
}

fn env_flag(name: &str) -> Option<bool> {
  let raw = std::env::var(name).ok()?;
  match raw.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Some(true),
    "0" | "false" | "no" | "off" => Some(false),
    _ => {
      warn!(target: "tutor_backend", %name, value = %raw, "Ignoring unrecognized boolean env value");
      None
    }
  }
}

// ---------------------------------------------------------------------------
// Authored item shape
// ---------------------------------------------------------------------------

/// Item entry as authored in TOML.
#[derive(Clone, Debug, Deserialize)]
pub struct ItemCfg {
  pub id: String,
  #[serde(default)] pub title: String,
  #[serde(default)] pub topic: String,
  #[serde(default)] pub sub_topic: String,
  #[serde(default)] pub problem_text: String,
  pub skill: String,
  #[serde(default)] pub subskills: Vec<String>,
  #[serde(default)] pub scoring: ScoringCfg,
  pub steps: Vec<StepCfg>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScoringCfg {
  #[serde(default = "default_base_xp")] pub base_xp: u32,
  #[serde(default)] pub no_hint_bonus: u32,
}

fn default_base_xp() -> u32 { 10 }

impl Default for ScoringCfg {
  fn default() -> Self {
    Self { base_xp: default_base_xp(), no_hint_bonus: 0 }
  }
}

#[derive(Clone, Debug, Deserialize)]
pub struct StepCfg {
  pub id: String,
  pub prompt: String,
  #[serde(default)] pub hints: Vec<HintCfg>,
  pub evaluation: RulesCfg,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HintCfg {
  pub level: u32,
  pub text: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RulesCfg {
  #[serde(default)] pub patterns: Vec<PatternCfg>,
  /// Operator symbols, e.g. `["+", "*"]`.
  #[serde(default)] pub commutative: Vec<String>,
  #[serde(default)] pub algebraic_equivalence: bool,
  /// Opt-in: a step consults the judge only when this is set.
  #[serde(default)] pub llm_fallback: bool,
  #[serde(default)] pub reference_answer: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PatternCfg {
  pub equivalent_to: String,
  #[serde(default)] pub kind: PatternKind,
}

#[derive(Clone, Copy, Debug, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
  #[default]
  Literal,
  Regex,
}

impl ItemCfg {
  /// Validate and compile into the typed, immutable form.
  pub fn into_item(self) -> Result<Item, ItemError> {
    let item_id = self.id;
    if self.steps.is_empty() {
      return Err(ItemError::NoSteps { item: item_id });
    }

    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(self.steps.len());
    for sc in self.steps {
      if !seen.insert(sc.id.clone()) {
        return Err(ItemError::DuplicateStep { item: item_id, step: sc.id });
      }
      steps.push(compile_step(&item_id, sc)?);
    }

    Ok(Item {
      id: item_id,
      title: self.title,
      topic: self.topic,
      sub_topic: self.sub_topic,
      problem_text: self.problem_text,
      skill: self.skill,
      subskills: self.subskills.into_iter().collect::<BTreeSet<_>>(),
      scoring: Scoring { base_xp: self.scoring.base_xp, no_hint_bonus: self.scoring.no_hint_bonus },
      steps,
    })
  }
}

fn compile_step(item_id: &str, sc: StepCfg) -> Result<Step, ItemError> {
  let step_id = sc.id;
  let rules = sc.evaluation;

  if rules.patterns.iter().all(|p| p.equivalent_to.trim().is_empty()) {
    return Err(ItemError::NoPatterns { item: item_id.into(), step: step_id });
  }

  let mut patterns = Vec::with_capacity(rules.patterns.len());
  for p in rules.patterns {
    let text = p.equivalent_to.trim();
    if text.is_empty() {
      continue;
    }
    match p.kind {
      PatternKind::Literal => patterns.push(AnswerPattern::literal(text)),
      PatternKind::Regex => {
        let regex = RegexBuilder::new(&format!("^(?:{text})$"))
          .case_insensitive(true)
          .build()
          .map_err(|source| ItemError::InvalidRegex {
            item: item_id.into(),
            step: step_id.clone(),
            pattern: text.into(),
            source,
          })?;
        patterns.push(AnswerPattern::Regex { source: text.into(), regex });
      }
    }
  }

  let mut commutative = Vec::new();
  for op in &rules.commutative {
    let parsed = BinaryOp::from_symbol(op).ok_or_else(|| ItemError::UnknownOperator {
      item: item_id.into(),
      step: step_id.clone(),
      op: op.clone(),
    })?;
    if !commutative.contains(&parsed) {
      commutative.push(parsed);
    }
  }

  let mut hints: Vec<Hint> = sc.hints.into_iter().map(|h| Hint { level: h.level, text: h.text }).collect();
  hints.sort_by_key(|h| h.level);
  for (i, h) in hints.iter().enumerate() {
    let expected = i as u32 + 1;
    if h.level != expected {
      return Err(ItemError::HintLadder {
        item: item_id.into(),
        step: step_id,
        detail: format!("expected level {expected}, found {}", h.level),
      });
    }
  }

  Ok(Step {
    id: step_id,
    prompt: sc.prompt,
    rule: EvaluationRule {
      patterns,
      commutative,
      algebraic_equivalence: rules.algebraic_equivalence,
      llm_fallback: rules.llm_fallback,
      reference_answer: rules.reference_answer.filter(|r| !r.trim().is_empty()),
    },
    hints,
  })
}

/// Attempt to load `TutorConfig` from TUTOR_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_tutor_config_from_env() -> Option<TutorConfig> {
  let path = std::env::var("TUTOR_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<TutorConfig>(&s) {
      Ok(cfg) => {
        info!(target: "tutor_backend", %path, items = cfg.items.len(), "Loaded tutor config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "tutor_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "tutor_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = r#"
[engine]
llm_enabled = false
judge_retries = 2

[engine.mastery]
learning_rate = 0.5

[[items]]
id = "ALG-T-1"
title = "Test"
skill = "algebra"
subskills = ["expressions", "expressions"]

[[items.steps]]
id = "s1"
prompt = "Write b plus 4"
hints = [{ level = 2, text = "second" }, { level = 1, text = "first" }]

[items.steps.evaluation]
patterns = [{ equivalent_to = "B + 4" }, { equivalent_to = "4\\+b", kind = "regex" }]
commutative = ["+"]
algebraic_equivalence = true
"#;

  #[test]
  fn parses_overrides_and_keeps_defaults() {
    let cfg: TutorConfig = toml::from_str(SAMPLE).unwrap();
    assert!(!cfg.engine.llm_enabled);
    assert!(cfg.engine.cas_enabled);
    assert_eq!(cfg.engine.judge_retries, 2);
    assert_eq!(cfg.engine.mastery.learning_rate, 0.5);
    assert_eq!(cfg.engine.mastery.min_rate, MasteryParams::default().min_rate);
    assert_eq!(cfg.prompts.judge_system, Prompts::default().judge_system);
  }

  #[test]
  fn compiles_items_into_typed_rules() {
    let cfg: TutorConfig = toml::from_str(SAMPLE).unwrap();
    let item = cfg.items.into_iter().next().unwrap().into_item().unwrap();
    assert_eq!(item.scoring.base_xp, 10);
    assert_eq!(item.subskills.len(), 1);

    let step = &item.steps[0];
    assert_eq!(step.hints.iter().map(|h| h.level).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(step.rule.commutative, vec![BinaryOp::Add]);
    assert!(step.rule.algebraic_equivalence);
    assert!(!step.rule.llm_fallback, "llm_fallback defaults to off");
    assert!(matches!(&step.rule.patterns[0], AnswerPattern::Literal { text, parsed: Some(_) } if text == "b + 4"));
    assert!(matches!(&step.rule.patterns[1], AnswerPattern::Regex { .. }));
    assert_eq!(step.rule.equivalence_targets(), vec!["b + 4".to_string()]);
  }

  fn one_step(hints: Vec<HintCfg>, patterns: Vec<PatternCfg>) -> ItemCfg {
    ItemCfg {
      id: "X".into(),
      title: String::new(),
      topic: String::new(),
      sub_topic: String::new(),
      problem_text: String::new(),
      skill: "algebra".into(),
      subskills: vec![],
      scoring: ScoringCfg::default(),
      steps: vec![StepCfg {
        id: "s1".into(),
        prompt: "p".into(),
        hints,
        evaluation: RulesCfg {
          patterns,
          commutative: vec![],
          algebraic_equivalence: false,
          llm_fallback: false,
          reference_answer: None,
        },
      }],
    }
  }

  fn literal(text: &str) -> PatternCfg {
    PatternCfg { equivalent_to: text.into(), kind: PatternKind::Literal }
  }

  #[test]
  fn rejects_gapped_hint_ladder() {
    let cfg = one_step(
      vec![HintCfg { level: 1, text: "a".into() }, HintCfg { level: 3, text: "c".into() }],
      vec![literal("1")],
    );
    assert!(matches!(cfg.into_item(), Err(ItemError::HintLadder { .. })));
  }

  #[test]
  fn rejects_step_without_patterns() {
    let cfg = one_step(vec![], vec![literal("  ")]);
    assert!(matches!(cfg.into_item(), Err(ItemError::NoPatterns { .. })));
  }

  #[test]
  fn rejects_bad_regex() {
    let cfg = one_step(vec![], vec![PatternCfg { equivalent_to: "(".into(), kind: PatternKind::Regex }]);
    assert!(matches!(cfg.into_item(), Err(ItemError::InvalidRegex { .. })));
  }

  #[test]
  fn rejects_unknown_operator() {
    let mut cfg = one_step(vec![], vec![literal("1")]);
    cfg.steps[0].evaluation.commutative = vec!["%".into()];
    assert!(matches!(cfg.into_item(), Err(ItemError::UnknownOperator { .. })));
  }
}
