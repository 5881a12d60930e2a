//! Application state: stores, evaluation pipeline and the session engine.
//!
//! This module owns:
//!   - the item bank (config items first, then built-in seeds)
//!   - the profile store shared with the session engine
//!   - the evaluation pipeline (built-in equivalence engine, optional OpenAI judge)
//!   - the event sink
//!
//! Invalid authored items are skipped with an error log; the service still
//! starts with whatever validated.

use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::config::{load_tutor_config_from_env, EngineSettings, TutorConfig};
use crate::domain::Item;
use crate::equivalence::{EquivalenceAdjudicator, SampledEquivalence};
use crate::events::BroadcastSink;
use crate::judge::{JudgeAdapter, JudgeEngine};
use crate::openai::OpenAI;
use crate::pipeline::EvaluationPipeline;
use crate::seeds::seed_items;
use crate::session::SessionEngine;
use crate::store::{InMemoryContentStore, InMemoryProfileStore, InMemorySessionStore, ProfileStore};

const EVENT_BUFFER: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub engine: SessionEngine,
    pub profiles: Arc<dyn ProfileStore>,
    pub events: BroadcastSink,
    pub settings: EngineSettings,
    pub item_count: usize,
    pub judge_available: bool,
}

impl AppState {
    /// Build state from env: load config, compile items, init OpenAI judge.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let mut cfg = load_tutor_config_from_env().unwrap_or_default();
        cfg.engine.apply_env_overrides();

        let judge: Option<Arc<dyn JudgeEngine>> = if cfg.engine.llm_enabled {
            match OpenAI::from_env(cfg.engine.judge_temperature, cfg.engine.judge_timeout()) {
                Some(oa) => {
                    info!(target: "tutor_backend", base_url = %oa.base_url, judge_model = %oa.judge_model, "OpenAI judge enabled.");
                    Some(Arc::new(oa))
                }
                None => {
                    info!(target: "tutor_backend", "OpenAI judge disabled (no OPENAI_API_KEY). Unmatched answers fall back to rules and equivalence.");
                    None
                }
            }
        } else {
            info!(target: "tutor_backend", "LLM fallback switched off by configuration.");
            None
        };

        Self::from_config(cfg, judge)
    }

    /// Assemble everything from an already-loaded config.
    pub fn from_config(cfg: TutorConfig, judge: Option<Arc<dyn JudgeEngine>>) -> Self {
        let TutorConfig { prompts, engine: settings, items } = cfg;

        let mut bank: Vec<Item> = Vec::with_capacity(items.len() + 2);
        for ic in items {
            let id = ic.id.clone();
            match ic.into_item() {
                Ok(item) => bank.push(item),
                Err(e) => error!(target: "tutor_backend", %id, error = %e, "Skipping bank item: failed validation."),
            }
        }
        let from_config = bank.len();
        // Built-in seeds never overwrite configured ids.
        bank.extend(seed_items());
        let content = InMemoryContentStore::new(bank);
        let item_count = content.len();
        info!(target: "tutor_backend", from_config, total = item_count, "Startup item inventory");

        let equivalence = settings.cas_enabled.then(|| {
            let engine = SampledEquivalence { samples: settings.equivalence_samples.max(1), ..SampledEquivalence::default() };
            EquivalenceAdjudicator::new(Arc::new(engine), settings.equivalence_budget())
        });
        let judge_available = judge.is_some();
        let judge = judge.map(|j| JudgeAdapter::new(j, prompts, settings.judge_retries, settings.judge_timeout()));
        let pipeline = EvaluationPipeline::new(equivalence, judge);

        let profiles: Arc<dyn ProfileStore> = Arc::new(InMemoryProfileStore::new());
        let events = BroadcastSink::new(EVENT_BUFFER);
        let engine = SessionEngine::new(
            Arc::new(content),
            Arc::new(InMemorySessionStore::new()),
            profiles.clone(),
            pipeline,
            Arc::new(events.clone()),
            settings.clone(),
        );

        Self { engine, profiles, events, settings, item_count, judge_available }
    }
}
