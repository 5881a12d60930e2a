//! Minimal OpenAI client used as the step judge.
//!
//! We only call chat.completions with a strict JSON-object response format and
//! hand the raw text back to `JudgeAdapter`, which owns parsing and retries.
//! Calls are instrumented and log model names, latencies and token usage (not contents).
//!
//! NOTE: We never log the API key or the learner's answer.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::judge::{JudgeEngine, JudgeError, JudgeRequest};

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub judge_model: String,
  pub temperature: f32,
}

impl OpenAI {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env(temperature: f32, timeout: Duration) -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let judge_model =
      std::env::var("OPENAI_JUDGE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());

    let client = match reqwest::Client::builder().timeout(timeout).build() {
      Ok(c) => c,
      Err(e) => {
        warn!(target: "tutor_backend", error = %e, "Failed to build HTTP client for OpenAI");
        return None;
      }
    };

    Some(Self {
      client,
      api_key,
      base_url: base_url.trim_end_matches('/').to_string(),
      judge_model,
      temperature,
    })
  }

  /// JSON-object chat completion; returns the message content untouched.
  #[instrument(level = "info", skip(self, system, user), fields(model = %self.judge_model))]
  async fn chat_json_raw(&self, system: &str, user: &str) -> Result<String, JudgeError> {
    let url = format!("{}/chat/completions", self.base_url);
    let req = ChatCompletionRequest {
      model: self.judge_model.clone(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: system.into() },
        ChatMessageReq { role: "user".into(), content: user.into() },
      ],
      temperature: self.temperature,
      response_format: Some(ResponseFormat { r#type: "json_object".into() }),
      max_tokens: Some(300),
    };

    let start = Instant::now();
    let res = self.client.post(&url)
      .header(USER_AGENT, "stepwise-tutor-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req).send().await.map_err(|e| JudgeError::Transport(e.to_string()))?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or(body);
      return Err(JudgeError::Transport(format!("OpenAI HTTP {}: {}", status, msg)));
    }

    let body: ChatCompletionResponse = res.json().await.map_err(|e| JudgeError::Transport(e.to_string()))?;
    let elapsed = start.elapsed();
    if let Some(usage) = &body.usage {
      info!(?elapsed, prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    body.choices.first()
      .and_then(|c| c.message.content.clone())
      .filter(|t| !t.trim().is_empty())
      .ok_or_else(|| JudgeError::Malformed("empty completion".into()))
  }
}

#[async_trait]
impl JudgeEngine for OpenAI {
  async fn complete(&self, request: &JudgeRequest) -> Result<String, JudgeError> {
    self.chat_json_raw(&request.system, &request.user).await
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: String }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}
