//! End-to-end pipeline scenarios against in-process mock upstreams.
//!
//! A mock realtime STT WebSocket server feeds scripted transcription events
//! to both channel clients, and a mock completion endpoint streams canned
//! SSE tokens with a configurable delay so cancellation paths can be
//! exercised deterministically.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message as AxumWsMessage, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use realtime_copilot::config::{LogLevel, Settings};
use realtime_copilot::events::{handler, Event, EventBus, EventTopic, Speaker, TextChunk};
use realtime_copilot::pipeline::{Aggregator, HintService};
use realtime_copilot::server::{router, ServerState};
use realtime_copilot::session::{Session, SessionMode, SessionState};
use realtime_copilot::knowledge::KnowledgeService;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─── Mock upstreams ──────────────────────────────────────────

/// Serve scripted realtime STT events to every connection after it
/// configures its session. The short delay gives the session pipeline time
/// to finish subscribing before transcripts start flowing.
async fn spawn_mock_stt(script: Vec<serde_json::Value>) -> SocketAddr {
    let script = Arc::new(script);
    let app = Router::new().route(
        "/v1/realtime",
        get(move |ws: WebSocketUpgrade| {
            let script = script.clone();
            async move {
                ws.on_upgrade(move |mut socket| async move {
                    while let Some(Ok(message)) = socket.recv().await {
                        if let AxumWsMessage::Text(text) = message {
                            let value: serde_json::Value =
                                serde_json::from_str(&text).unwrap_or_default();
                            if value["type"] == "session.update" {
                                tokio::time::sleep(Duration::from_millis(200)).await;
                                for event in script.iter() {
                                    if socket
                                        .send(AxumWsMessage::Text(event.to_string().into()))
                                        .await
                                        .is_err()
                                    {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                })
            }
        }),
    );

    spawn_router(app).await
}

#[derive(Clone)]
struct MockLlm {
    tokens: Vec<String>,
    token_delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockLlm {
    fn new(tokens: &[&str], token_delay: Duration) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            token_delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Serve a canned `chat/completions` SSE stream, one token per event.
async fn spawn_mock_llm(mock: MockLlm) -> SocketAddr {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let mock = mock.clone();
            async move {
                mock.calls.fetch_add(1, Ordering::SeqCst);

                let lines: Vec<String> = mock
                    .tokens
                    .iter()
                    .map(|token| {
                        format!(
                            "data: {}\n\n",
                            serde_json::json!({"choices": [{"delta": {"content": token}}]})
                        )
                    })
                    .chain(std::iter::once("data: [DONE]\n\n".to_string()))
                    .collect();

                let delay = mock.token_delay;
                let stream = futures::stream::iter(lines).then(move |line| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<String, std::convert::Infallible>(line)
                });

                Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(Body::from_stream(stream))
                    .unwrap()
            }
        }),
    );

    spawn_router(app).await
}

async fn spawn_router(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn test_settings(stt_addr: SocketAddr, llm_addr: SocketAddr, workspaces: &std::path::Path) -> Settings {
    Settings {
        openai_api_key: "test-key".to_string(),
        ollama_base_url: format!("http://{}", llm_addr),
        ollama_model: "test-model".to_string(),
        stt_base_url: format!("ws://{}/v1/realtime", stt_addr),
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        log_level: LogLevel::Info,
        workspaces_dir: workspaces.to_path_buf(),
        debug_save_audio: false,
        debug_audio_path: workspaces.join("debug_audio"),
    }
}

async fn spawn_app(settings: Settings) -> SocketAddr {
    spawn_router(router(ServerState::new(settings))).await
}

async fn connect_client(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("client connect failed");
    ws
}

async fn next_json(ws: &mut WsClient) -> Option<serde_json::Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .ok()??;
        match message {
            Ok(WsMessage::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Read frames until one matches `message_type`, returning everything seen.
async fn read_until(ws: &mut WsClient, message_type: &str) -> Vec<serde_json::Value> {
    let mut seen = Vec::new();
    while let Some(value) = next_json(ws).await {
        let found = value["type"] == message_type;
        seen.push(value);
        if found {
            return seen;
        }
    }
    panic!("connection ended before a '{}' frame; saw {:?}", message_type, seen);
}

fn stt_script(transcript: &str) -> Vec<serde_json::Value> {
    vec![
        serde_json::json!({"type": "session.created", "session": {}}),
        serde_json::json!({"type": "input_audio_buffer.speech_started"}),
        serde_json::json!({
            "type": "conversation.item.input_audio_transcription.delta",
            "delta": transcript,
        }),
        serde_json::json!({"type": "input_audio_buffer.speech_stopped"}),
        serde_json::json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": transcript,
        }),
    ]
}

// ─── Full-stack scenarios ────────────────────────────────────

#[tokio::test]
async fn question_flows_to_a_formatted_hint() {
    let workspace_dir = tempfile::tempdir().unwrap();
    let stt_addr =
        spawn_mock_stt(stt_script("What is your experience with distributed systems?")).await;
    let llm = MockLlm::new(
        &["- Lead with", " the consensus work\n", "- Mention scale numbers\n"],
        Duration::from_millis(5),
    );
    let calls = llm.calls.clone();
    let llm_addr = spawn_mock_llm(llm).await;

    let app_addr = spawn_app(test_settings(stt_addr, llm_addr, workspace_dir.path())).await;
    let mut client = connect_client(app_addr).await;

    // Initial status frame arrives before anything else.
    let status = next_json(&mut client).await.unwrap();
    assert_eq!(status["type"], "status");
    assert_eq!(status["stt_mic_state"], "idle");

    client
        .send(WsMessage::Text(r#"{"type":"start_session"}"#.into()))
        .await
        .unwrap();

    let seen = read_until(&mut client, "hint_completed").await;

    let transcript = seen
        .iter()
        .find(|m| m["type"] == "transcript_completed" && m["speaker"] == "THEM")
        .expect("no THEM transcript_completed frame");
    assert_eq!(
        transcript["text"],
        "What is your experience with distributed systems?"
    );

    let hint = seen.last().unwrap();
    let final_text = hint["final_text"].as_str().unwrap();
    let lines: Vec<&str> = final_text.lines().collect();
    assert!((1..=3).contains(&lines.len()), "bad hint: {:?}", final_text);
    for line in &lines {
        assert!(line.starts_with("- "), "bad bullet: {:?}", line);
    }

    // Tokens for this hint streamed ahead of the completion.
    let token_count = seen
        .iter()
        .filter(|m| m["type"] == "hint_token" && m["hint_id"] == hint["hint_id"])
        .count();
    assert!(token_count > 0);

    // Only the THEM question triggered a completion; the ME copy is gated.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_control_keeps_the_connection_usable() {
    let workspace_dir = tempfile::tempdir().unwrap();
    let stt_addr = spawn_mock_stt(vec![serde_json::json!({"type": "session.created"})]).await;
    let llm_addr = spawn_mock_llm(MockLlm::new(&["- ok\n"], Duration::from_millis(5))).await;

    let app_addr = spawn_app(test_settings(stt_addr, llm_addr, workspace_dir.path())).await;
    let mut client = connect_client(app_addr).await;

    let status = next_json(&mut client).await.unwrap();
    assert_eq!(status["type"], "status");

    client
        .send(WsMessage::Text("not json".into()))
        .await
        .unwrap();
    let error = next_json(&mut client).await.unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "Invalid JSON");

    // The session still starts normally afterwards.
    client
        .send(WsMessage::Text(r#"{"type":"start_session"}"#.into()))
        .await
        .unwrap();
    let status = next_json(&mut client).await.unwrap();
    assert_eq!(status["type"], "status");
    assert_eq!(status["stt_mic_state"], "active");
    assert_eq!(status["stt_system_state"], "active");
}

// ─── Service-level scenarios ─────────────────────────────────

fn them_completed(text: &str, segment_id: &str) -> Event {
    Event::TranscriptCompleted(realtime_copilot::events::TranscriptCompleted {
        speaker: Speaker::Them,
        text: text.to_string(),
        segment_id: segment_id.to_string(),
        timestamp: 0.0,
    })
}

fn chunk(text: &str) -> TextChunk {
    TextChunk {
        speaker: Speaker::Them,
        text: text.to_string(),
        last_context: String::new(),
        global_context: None,
        is_question: true,
    }
}

async fn active_session(mode: SessionMode) -> Arc<Session> {
    let session = Arc::new(Session::new(mode));
    session.set_state(SessionState::Active).await;
    session
}

async fn count_topic(bus: &Arc<EventBus>, topic: EventTopic) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_in = counter.clone();
    let key = format!("test-counter:{:?}", topic);
    bus.subscribe(
        topic,
        &key,
        handler(move |_| {
            let counter = counter_in.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }),
    )
    .await;
    counter
}

#[tokio::test]
async fn meeting_mode_rate_limits_chunk_dispatch() {
    let session = active_session(SessionMode::MeetingAssistant).await;
    let bus = Arc::new(EventBus::new());
    let ready = count_topic(&bus, EventTopic::TextChunkReady).await;

    tokio::spawn(Aggregator::new(session.clone(), bus.clone()).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (i, text) in ["First remark here", "Second remark here", "Third remark here"]
        .iter()
        .enumerate()
    {
        bus.publish(them_completed(text, &format!("seg{}", i))).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    assert_eq!(ready.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn interview_mode_gates_speaker_and_questions() {
    let session = active_session(SessionMode::InterviewAssistant).await;
    let bus = Arc::new(EventBus::new());
    let ready = count_topic(&bus, EventTopic::TextChunkReady).await;

    tokio::spawn(Aggregator::new(session.clone(), bus.clone()).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A ME question and a THEM statement are both gated out.
    bus.publish(Event::TranscriptCompleted(
        realtime_copilot::events::TranscriptCompleted {
            speaker: Speaker::Me,
            text: "What should I say here?".to_string(),
            segment_id: "a".to_string(),
            timestamp: 0.0,
        },
    ))
    .await;
    bus.publish(them_completed("We shipped that feature last quarter.", "b"))
        .await;
    assert_eq!(ready.load(Ordering::SeqCst), 0);

    bus.publish(them_completed("Why did you choose this role?", "c"))
        .await;
    assert_eq!(ready.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pending_text_fires_on_idle_timeout() {
    let session = active_session(SessionMode::InterviewAssistant).await;
    let bus = Arc::new(EventBus::new());
    let ready = count_topic(&bus, EventTopic::TextChunkReady).await;

    tokio::spawn(Aggregator::new(session.clone(), bus.clone()).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    bus.publish(Event::TranscriptDelta(
        realtime_copilot::events::TranscriptDelta {
            speaker: Speaker::Them,
            text: "Tell me about your background".to_string(),
            segment_id: "seg".to_string(),
            timestamp: 0.0,
        },
    ))
    .await;

    // No completion follows; the ~800 ms idle timeout promotes the pending
    // text exactly once.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(ready.load(Ordering::SeqCst), 1);
}

async fn spawn_hint_service(
    session: &Arc<Session>,
    bus: &Arc<EventBus>,
    llm_addr: SocketAddr,
    workspaces: &std::path::Path,
) {
    let settings = Arc::new(test_settings(llm_addr, llm_addr, workspaces));
    let knowledge = Arc::new(KnowledgeService::new(workspaces.to_path_buf()));
    tokio::spawn(HintService::new(session.clone(), bus.clone(), settings, knowledge).run());
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn interview_preempt_abandons_the_first_generation() {
    let workspace_dir = tempfile::tempdir().unwrap();
    let slow_tokens: Vec<String> = (0..10).map(|i| format!("- token {}\n", i)).collect();
    let slow_refs: Vec<&str> = slow_tokens.iter().map(|s| s.as_str()).collect();
    let llm_addr = spawn_mock_llm(MockLlm::new(&slow_refs, Duration::from_millis(120))).await;

    let session = active_session(SessionMode::InterviewAssistant).await;
    let bus = Arc::new(EventBus::new());

    let token_ids = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));
    let completed_ids = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));

    let token_ids_in = token_ids.clone();
    bus.subscribe(
        EventTopic::HintToken,
        "test-tokens",
        handler(move |event| {
            let token_ids = token_ids_in.clone();
            async move {
                if let Event::HintToken(token) = event {
                    token_ids.lock().await.push(token.hint_id);
                }
            }
        }),
    )
    .await;
    let completed_ids_in = completed_ids.clone();
    bus.subscribe(
        EventTopic::HintCompleted,
        "test-completed",
        handler(move |event| {
            let completed_ids = completed_ids_in.clone();
            async move {
                if let Event::HintCompleted(hint) = event {
                    completed_ids.lock().await.push(hint.hint_id);
                }
            }
        }),
    )
    .await;

    spawn_hint_service(&session, &bus, llm_addr, workspace_dir.path()).await;

    bus.publish(Event::TextChunkReady(chunk("Tell me about your background")))
        .await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    bus.publish(Event::TextChunkReady(chunk("Why did you choose this role?")))
        .await;

    tokio::time::sleep(Duration::from_secs(4)).await;

    let completed = completed_ids.lock().await.clone();
    let tokens = token_ids.lock().await.clone();

    // The preempted generation streamed tokens but never completed; only
    // the replacement finished.
    assert_eq!(completed.len(), 1, "completed hints: {:?}", completed);
    let first_token_id = tokens.first().expect("no tokens streamed").clone();
    assert_ne!(completed[0], first_token_id);
    assert_eq!(session.stats.hints_generated.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn meeting_mode_buffers_latest_chunk_without_cancelling() {
    let workspace_dir = tempfile::tempdir().unwrap();
    let tokens: Vec<String> = (0..8).map(|i| format!("- token {}\n", i)).collect();
    let token_refs: Vec<&str> = tokens.iter().map(|s| s.as_str()).collect();
    let llm_addr = spawn_mock_llm(MockLlm::new(&token_refs, Duration::from_millis(100))).await;

    let session = active_session(SessionMode::MeetingAssistant).await;
    let bus = Arc::new(EventBus::new());
    let completed = count_topic(&bus, EventTopic::HintCompleted).await;

    spawn_hint_service(&session, &bus, llm_addr, workspace_dir.path()).await;

    bus.publish(Event::TextChunkReady(chunk("First statement"))).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    bus.publish(Event::TextChunkReady(chunk("Second statement"))).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    bus.publish(Event::TextChunkReady(chunk("Third statement"))).await;

    tokio::time::sleep(Duration::from_secs(4)).await;

    // The first generation runs to completion, then only the latest
    // buffered chunk is generated: two hints, not three.
    assert_eq!(completed.load(Ordering::SeqCst), 2);
    assert_eq!(session.stats.hints_generated.load(Ordering::Relaxed), 2);
}
