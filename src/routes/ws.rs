//! WebSocket upgrade + message loop. Each client message is parsed as JSON and
//! forwarded to the session engine. We reply with a single JSON message per request.
//! After `subscribe_events` the socket also streams learning events as they happen.

use std::sync::Arc;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing::{debug, error, info, instrument, warn};

use crate::error::TutorError;
use crate::events::TutorEvent;
use crate::protocol::{ClientWsMessage, ServerWsMessage};
use crate::state::AppState;

/// Event stream attached to one socket.
#[derive(Default)]
struct Subscription {
  rx: Option<Receiver<TutorEvent>>,
  learner_id: Option<String>,
}

impl Subscription {
  /// Next matching event. Pending forever while unsubscribed.
  async fn next(&mut self) -> Option<TutorEvent> {
    loop {
      let Some(rx) = self.rx.as_mut() else {
        return std::future::pending().await;
      };
      match rx.recv().await {
        Ok(event) if self.learner_id.as_deref().map_or(true, |l| l == event.learner_id()) => return Some(event),
        Ok(_) => {}
        Err(RecvError::Lagged(skipped)) => warn!(target: "tutor_backend", skipped, "WS event subscriber lagged"),
        Err(RecvError::Closed) => {
          self.rx = None;
          return None;
        }
      }
    }
  }
}

#[instrument(level = "info", skip(state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "tutor_backend", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
  info!(target: "tutor_backend", "WebSocket connected");
  let mut sub = Subscription::default();
  loop {
    let reply_msg = tokio::select! {
      msg = socket.recv() => {
        let Some(Ok(msg)) = msg else { break };
        match msg {
          Message::Text(txt) => match serde_json::from_str::<ClientWsMessage>(&txt) {
            Ok(incoming) => {
              debug!(target: "tutor_backend", "WS received: {:?}", &incoming);
              handle_client_ws(incoming, &state, &mut sub).await
            }
            Err(e) => ServerWsMessage::Error { error: "invalid_message".into(), message: format!("Invalid JSON: {}", e) },
          },
          Message::Ping(payload) => {
            let _ = socket.send(Message::Pong(payload)).await;
            continue;
          }
          Message::Close(_) => break,
          _ => continue,
        }
      }
      Some(event) = sub.next() => ServerWsMessage::Event { event },
    };

    let out = serde_json::to_string(&reply_msg).unwrap_or_else(|e| {
      serde_json::json!({ "type": "error", "error": "serialization", "message": format!("Serialization error: {}", e) })
        .to_string()
    });

    if let Err(e) = socket.send(Message::Text(out)).await {
      error!(target: "tutor_backend", error = %e, "WS send error");
      break;
    }
  }
  info!(target: "tutor_backend", "WebSocket disconnected");
}

fn ws_error(e: TutorError) -> ServerWsMessage {
  warn!(target: "session", code = e.code(), error = %e, "WS request failed");
  ServerWsMessage::Error { error: e.code().to_string(), message: e.to_string() }
}

#[instrument(level = "info", skip(state, sub))]
async fn handle_client_ws(msg: ClientWsMessage, state: &AppState, sub: &mut Subscription) -> ServerWsMessage {
  let engine = &state.engine;
  match msg {
    ClientWsMessage::Ping => ServerWsMessage::Pong,

    ClientWsMessage::StartSession { learner_id, item_id } => match engine.start(&learner_id, item_id.as_deref()).await {
      Ok(view) => ServerWsMessage::Session { session: view.into() },
      Err(e) => ws_error(e),
    },

    ClientWsMessage::SubmitStep { session_id, step_id, response } => {
      match engine.step(&session_id, &step_id, &response).await {
        Ok(result) => ServerWsMessage::StepResult { result: result.into() },
        Err(e) => ws_error(e),
      }
    }

    ClientWsMessage::EndSession { session_id } => match engine.end(&session_id).await {
      Ok(summary) => ServerWsMessage::SessionSummary { summary },
      Err(e) => ws_error(e),
    },

    ClientWsMessage::GetSession { session_id } => match engine.get(&session_id).await {
      Ok(view) => ServerWsMessage::Session { session: view.into() },
      Err(e) => ws_error(e),
    },

    ClientWsMessage::SubscribeEvents { learner_id } => {
      sub.rx = Some(state.events.subscribe());
      sub.learner_id = learner_id.clone();
      info!(target: "tutor_backend", learner_id = ?learner_id, "WS subscribed to events");
      ServerWsMessage::Subscribed { learner_id }
    }
  }
}
