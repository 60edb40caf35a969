//! Client WebSocket handler
//!
//! One bidirectional connection per client: binary frames carry tagged PCM
//! audio, text frames carry JSON control messages, and everything going
//! back to the client funnels through a single sender task so concurrent
//! events never interleave on the socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::events::{handler, Event, EventBus, EventTopic, Speaker};
use crate::pipeline::{Aggregator, HintService, SttService};
use crate::session::{AudioChannel, Session, SessionMode, SessionState};

use super::ServerState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartSession,
    StopSession,
    PauseHints,
    ResumeHints,
    SetMode { mode: String },
    SetPrompt { prompt: String },
    SetKnowledge { workspace: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TranscriptDelta {
        speaker: Speaker,
        text: String,
        segment_id: String,
        timestamp: f64,
    },
    TranscriptCompleted {
        speaker: Speaker,
        text: String,
        segment_id: String,
        timestamp: f64,
    },
    HintToken {
        hint_id: String,
        token: String,
    },
    HintCompleted {
        hint_id: String,
        final_text: String,
        mode: String,
    },
    Status {
        connected: bool,
        stt_mic_state: String,
        stt_system_state: String,
        llm_state: String,
        dropped_frames_count: u64,
        hints_enabled: bool,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(|socket| handle_connection(socket, state))
}

async fn handle_connection(ws: WebSocket, state: ServerState) {
    info!("client connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);

    // Single-writer discipline: all outgoing frames pass through here.
    let sender_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let supervisor = state.supervisor.clone();
    let bus = supervisor.bus();
    let session = supervisor
        .create_session(SessionMode::InterviewAssistant)
        .await;

    subscribe_client_events(&bus, &session.id, &tx).await;
    send_status(&tx, &session).await;

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Binary(data) => handle_audio(&session, &data).await,
            Message::Text(text) => handle_control(&state, &session, &tx, &text).await,
            Message::Close(_) => {
                info!("client disconnected");
                break;
            }
            _ => {}
        }
    }

    unsubscribe_client_events(&bus, &session.id).await;
    supervisor.destroy_session(&session.id).await;
    sender_task.abort();
}

/// Route one binary audio frame into its channel queue.
async fn handle_audio(session: &Arc<Session>, data: &[u8]) {
    if session.state().await != SessionState::Active {
        return;
    }
    if data.len() < 2 {
        return;
    }
    let Some(channel) = AudioChannel::from_tag(data[0]) else {
        return;
    };

    session.stats.record_frame(channel);
    if session.queue(channel).push(data[1..].to_vec()).await {
        session.stats.record_dropped(channel);
    }
}

async fn handle_control(
    state: &ServerState,
    session: &Arc<Session>,
    tx: &mpsc::Sender<String>,
    text: &str,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            // Valid JSON with an unknown tag is ignored; garbage gets an
            // error frame but keeps the connection open.
            if serde_json::from_str::<serde_json::Value>(text).is_ok() {
                warn!("ignoring unrecognized control message: {}", e);
            } else {
                error!("invalid control message: {}", e);
                send_error(tx, "Invalid JSON").await;
            }
            return;
        }
    };

    let supervisor = &state.supervisor;
    match message {
        ClientMessage::StartSession => {
            let was_created = session.state().await == SessionState::Created;
            supervisor.start_session(session).await;
            // Spawn the pipeline only on a real Created -> Active transition
            // so a repeated start cannot double the tasks.
            if was_created && session.state().await == SessionState::Active {
                spawn_pipeline(state, session).await;
                info!(session_id = %session.id, "session pipeline started");
            }
            send_status(tx, session).await;
        }
        ClientMessage::StopSession => {
            supervisor.stop_session(session).await;
            send_status(tx, session).await;
        }
        ClientMessage::PauseHints => {
            supervisor.set_hints_enabled(session, false);
            send_status(tx, session).await;
        }
        ClientMessage::ResumeHints => {
            supervisor.set_hints_enabled(session, true);
            send_status(tx, session).await;
        }
        ClientMessage::SetMode { mode } => match SessionMode::from_wire(&mode) {
            Some(mode) => {
                supervisor.set_mode(session, mode).await;
                send_status(tx, session).await;
            }
            None => warn!(mode = %mode, "invalid session mode"),
        },
        ClientMessage::SetPrompt { prompt } => {
            supervisor.set_custom_prompt(session, prompt).await;
        }
        ClientMessage::SetKnowledge { workspace } => {
            supervisor.set_knowledge_workspace(session, workspace).await;
        }
    }
}

/// Spawn the three pipeline tasks and register them with the session.
async fn spawn_pipeline(state: &ServerState, session: &Arc<Session>) {
    let bus = state.supervisor.bus();

    let stt = SttService::new(session.clone(), bus.clone(), state.settings.clone());
    session.add_task(tokio::spawn(stt.run())).await;

    let aggregator = Aggregator::new(session.clone(), bus.clone());
    session.add_task(tokio::spawn(aggregator.run())).await;

    let hints = HintService::new(
        session.clone(),
        bus,
        state.settings.clone(),
        state.knowledge.clone(),
    );
    session.add_task(tokio::spawn(hints.run())).await;
}

fn subscription_key(session_id: &str, topic: &str) -> String {
    format!("client:{}:{}", session_id, topic)
}

async fn subscribe_client_events(bus: &Arc<EventBus>, session_id: &str, tx: &mpsc::Sender<String>) {
    let tx_delta = tx.clone();
    bus.subscribe(
        EventTopic::TranscriptDelta,
        &subscription_key(session_id, "delta"),
        handler(move |event| {
            let tx = tx_delta.clone();
            async move {
                if let Event::TranscriptDelta(delta) = event {
                    send_message(
                        &tx,
                        &ServerMessage::TranscriptDelta {
                            speaker: delta.speaker,
                            text: delta.text,
                            segment_id: delta.segment_id,
                            timestamp: delta.timestamp,
                        },
                    )
                    .await;
                }
            }
        }),
    )
    .await;

    let tx_completed = tx.clone();
    bus.subscribe(
        EventTopic::TranscriptCompleted,
        &subscription_key(session_id, "completed"),
        handler(move |event| {
            let tx = tx_completed.clone();
            async move {
                if let Event::TranscriptCompleted(completed) = event {
                    send_message(
                        &tx,
                        &ServerMessage::TranscriptCompleted {
                            speaker: completed.speaker,
                            text: completed.text,
                            segment_id: completed.segment_id,
                            timestamp: completed.timestamp,
                        },
                    )
                    .await;
                }
            }
        }),
    )
    .await;

    let tx_token = tx.clone();
    bus.subscribe(
        EventTopic::HintToken,
        &subscription_key(session_id, "hint_token"),
        handler(move |event| {
            let tx = tx_token.clone();
            async move {
                if let Event::HintToken(token) = event {
                    send_message(
                        &tx,
                        &ServerMessage::HintToken {
                            hint_id: token.hint_id,
                            token: token.token,
                        },
                    )
                    .await;
                }
            }
        }),
    )
    .await;

    let tx_hint = tx.clone();
    bus.subscribe(
        EventTopic::HintCompleted,
        &subscription_key(session_id, "hint_completed"),
        handler(move |event| {
            let tx = tx_hint.clone();
            async move {
                if let Event::HintCompleted(hint) = event {
                    send_message(
                        &tx,
                        &ServerMessage::HintCompleted {
                            hint_id: hint.hint_id,
                            final_text: hint.final_text,
                            mode: hint.mode,
                        },
                    )
                    .await;
                }
            }
        }),
    )
    .await;
}

async fn unsubscribe_client_events(bus: &Arc<EventBus>, session_id: &str) {
    bus.unsubscribe(
        EventTopic::TranscriptDelta,
        &subscription_key(session_id, "delta"),
    )
    .await;
    bus.unsubscribe(
        EventTopic::TranscriptCompleted,
        &subscription_key(session_id, "completed"),
    )
    .await;
    bus.unsubscribe(
        EventTopic::HintToken,
        &subscription_key(session_id, "hint_token"),
    )
    .await;
    bus.unsubscribe(
        EventTopic::HintCompleted,
        &subscription_key(session_id, "hint_completed"),
    )
    .await;
}

async fn send_status(tx: &mpsc::Sender<String>, session: &Arc<Session>) {
    let stt_state = if session.is_active().await { "active" } else { "idle" };
    send_message(
        tx,
        &ServerMessage::Status {
            connected: true,
            stt_mic_state: stt_state.to_string(),
            stt_system_state: stt_state.to_string(),
            llm_state: "idle".to_string(),
            dropped_frames_count: session.stats.dropped_frames_count(),
            hints_enabled: session.hints_enabled(),
        },
    )
    .await;
}

async fn send_error(tx: &mpsc::Sender<String>, message: &str) {
    send_message(
        tx,
        &ServerMessage::Error {
            message: message.to_string(),
            code: None,
        },
    )
    .await;
}

async fn send_message(tx: &mpsc::Sender<String>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        // A failed send means the client is gone and the receive loop is
        // about to exit; nothing to do.
        Ok(json) => {
            let _ = tx.send(json).await;
        }
        Err(e) => error!("failed to serialize server message: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_control_messages() {
        let m: ClientMessage = serde_json::from_str(r#"{"type":"start_session"}"#).unwrap();
        assert!(matches!(m, ClientMessage::StartSession));

        let m: ClientMessage =
            serde_json::from_str(r#"{"type":"set_mode","mode":"meeting_assistant"}"#).unwrap();
        assert!(matches!(m, ClientMessage::SetMode { mode } if mode == "meeting_assistant"));

        let m: ClientMessage =
            serde_json::from_str(r#"{"type":"set_knowledge","workspace":"notes"}"#).unwrap();
        assert!(matches!(m, ClientMessage::SetKnowledge { workspace } if workspace == "notes"));
    }

    #[test]
    fn rejects_unknown_control_tags() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn server_messages_are_tagged() {
        let message = ServerMessage::HintToken {
            hint_id: "h1".to_string(),
            token: "- ".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(json["type"], "hint_token");
        assert_eq!(json["hint_id"], "h1");
    }

    #[test]
    fn error_omits_missing_code() {
        let message = ServerMessage::Error {
            message: "Invalid JSON".to_string(),
            code: None,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(!json.contains("code"));
    }

    #[test]
    fn transcript_wire_format() {
        let message = ServerMessage::TranscriptCompleted {
            speaker: Speaker::Them,
            text: "hello".to_string(),
            segment_id: "seg".to_string(),
            timestamp: 12.5,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(json["type"], "transcript_completed");
        assert_eq!(json["speaker"], "THEM");
        assert_eq!(json["timestamp"], 12.5);
    }
}
