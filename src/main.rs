//! Stepwise math tutor backend
//!
//! - Axum HTTP + WebSocket API over the session engine
//! - Layered answer evaluation: rules, algebraic equivalence, optional OpenAI judge
//! - In-memory content, session and learner-profile stores
//!
//! Important env variables:
//!   PORT                : u16 (default 3000)
//!   TUTOR_CONFIG_PATH   : path to TOML config (prompts, engine settings, item bank)
//!   CAS_ENABLED         : "0"/"false" disables the equivalence stage
//!   LLM_ENABLED         : "0"/"false" disables the judge stage
//!   OPENAI_API_KEY      : enables the OpenAI judge if present
//!   OPENAI_BASE_URL     : default "https://api.openai.com/v1"
//!   OPENAI_JUDGE_MODEL  : default "gpt-4o-mini"
//!   LOG_LEVEL           : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT          : "pretty" (default) or "json"

mod telemetry;
mod util;
mod domain;
mod error;
mod expr;
mod normalize;
mod matcher;
mod equivalence;
mod judge;
mod openai;
mod pipeline;
mod hints;
mod mastery;
mod misconceptions;
mod retry;
mod store;
mod events;
mod progression;
mod session;
mod config;
mod seeds;
mod state;
mod protocol;
mod routes;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Shared application state (stores, evaluation pipeline, session engine).
  let state = Arc::new(AppState::new());

  let app = build_router(state.clone());

  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "tutor_backend", %addr, items = state.item_count, "HTTP server listening");
  axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
  info!(target: "tutor_backend", "Server stopped");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(target: "tutor_backend", error = %e, "Could not install Ctrl-C handler");
    std::future::pending::<()>().await;
  }
  info!(target: "tutor_backend", "Shutdown signal received");
}
