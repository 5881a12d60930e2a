//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.
//!
//! Nothing here carries answer patterns, reference answers or judge
//! rationales: those stay server-side.

use serde::{Deserialize, Serialize};

use crate::domain::{
    Item, LearnerProfile, MasteryRecord, MisconceptionRecord, SessionStatus, SessionSummary, SessionView,
    StepResult,
};
use crate::events::TutorEvent;

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    /// Without `item_id` the learner's recommended next item is started.
    StartSession {
        learner_id: String,
        #[serde(default)]
        item_id: Option<String>,
    },
    SubmitStep {
        session_id: String,
        step_id: String,
        #[serde(alias = "user_response")]
        response: String,
    },
    EndSession {
        session_id: String,
    },
    GetSession {
        session_id: String,
    },
    /// Stream learning events on this socket, optionally for one learner only.
    SubscribeEvents {
        #[serde(default)]
        learner_id: Option<String>,
    },
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Session {
        session: SessionOut,
    },
    StepResult {
        result: StepOut,
    },
    SessionSummary {
        summary: SessionSummary,
    },
    Error {
        error: String,
        message: String,
    },
    Subscribed {
        learner_id: Option<String>,
    },
    Event {
        event: TutorEvent,
    },
}

// --- HTTP bodies ---

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub ok: bool,
    pub items: usize,
    pub cas_enabled: bool,
    pub llm_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct StartIn {
    pub learner_id: String,
    #[serde(default)]
    pub item_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StepIn {
    pub session_id: String,
    pub step_id: String,
    #[serde(alias = "user_response")]
    pub response: String,
}

#[derive(Debug, Deserialize)]
pub struct EndIn {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ProgressionQuery {
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorOut {
    pub error: String,
    pub message: String,
}

/// Session as the client sees it: where the learner is and what to answer next.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionOut {
    pub session_id: String,
    pub learner_id: String,
    pub item_id: String,
    pub title: String,
    pub problem_text: String,
    pub status: SessionStatus,
    pub step_id: Option<String>,
    pub prompt: Option<String>,
    pub current_step_index: usize,
    pub attempts_on_current_step: u32,
    pub summary: Option<SessionSummary>,
}

impl From<SessionView> for SessionOut {
    fn from(v: SessionView) -> Self {
        Self {
            session_id: v.session.session_id,
            learner_id: v.session.learner_id,
            item_id: v.session.item_id,
            title: v.title,
            problem_text: v.problem_text,
            status: v.session.status,
            step_id: v.step_id,
            prompt: v.prompt,
            current_step_index: v.session.current_step_index,
            attempts_on_current_step: v.session.attempts_on_current_step,
            summary: v.session.summary,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepOut {
    pub correct: bool,
    #[serde(flatten)]
    pub result: StepResult,
}

impl From<StepResult> for StepOut {
    fn from(result: StepResult) -> Self {
        Self { correct: result.outcome == crate::domain::Outcome::Correct, result }
    }
}

/// Public view of an item: prompts and hint count only.
#[derive(Debug, Clone, Serialize)]
pub struct ItemOut {
    pub id: String,
    pub title: String,
    pub topic: String,
    pub sub_topic: String,
    pub problem_text: String,
    pub skill: String,
    pub subskills: Vec<String>,
    pub base_xp: u32,
    pub no_hint_bonus: u32,
    pub steps: Vec<ItemStepOut>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemStepOut {
    pub id: String,
    pub prompt: String,
    pub hint_levels: u32,
}

pub fn item_out(item: &Item) -> ItemOut {
    ItemOut {
        id: item.id.clone(),
        title: item.title.clone(),
        topic: item.topic.clone(),
        sub_topic: item.sub_topic.clone(),
        problem_text: item.problem_text.clone(),
        skill: item.skill.clone(),
        subskills: item.subskills.iter().cloned().collect(),
        base_xp: item.scoring.base_xp,
        no_hint_bonus: item.scoring.no_hint_bonus,
        steps: item
            .steps
            .iter()
            .map(|s| ItemStepOut { id: s.id.clone(), prompt: s.prompt.clone(), hint_levels: s.max_hint_level() })
            .collect(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileOut {
    #[serde(flatten)]
    pub profile: LearnerProfile,
    pub mastery: Vec<MasteryRecord>,
    pub misconceptions: Vec<MisconceptionRecord>,
}
