//! Realtime STT streaming client
//!
//! Two instances run per session, one per audio channel. Each holds a
//! WebSocket to the OpenAI Realtime transcription endpoint: audio goes out
//! as base64 `input_audio_buffer.append` messages, transcripts come back as
//! delta/completed events keyed by a segment id minted locally when the
//! upstream voice-activity detector reports speech.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::resample_16k_to_24k;
use crate::config::Settings;
use crate::events::{Event, EventBus, Speaker, TranscriptCompleted, TranscriptDelta};
use crate::session::{AudioChannel, Session};

/// Transcription model requested from the realtime endpoint.
pub const STT_MODEL: &str = "gpt-4o-mini-transcribe";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Upstream events we act on, parsed from the realtime wire protocol.
#[derive(Debug, Clone, PartialEq)]
enum UpstreamEvent {
    SessionReady(String),
    SpeechStarted,
    SpeechStopped,
    Delta(String),
    Completed(String),
    Error(String),
    Malformed(String),
    Other(String),
}

fn parse_upstream_event(text: &str) -> UpstreamEvent {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return UpstreamEvent::Malformed(e.to_string()),
    };
    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "session.created" | "session.updated" => UpstreamEvent::SessionReady(event_type.to_string()),
        "input_audio_buffer.speech_started" => UpstreamEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => UpstreamEvent::SpeechStopped,
        "conversation.item.input_audio_transcription.delta" => UpstreamEvent::Delta(
            value
                .get("delta")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        ),
        "conversation.item.input_audio_transcription.completed" => UpstreamEvent::Completed(
            value
                .get("transcript")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        ),
        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown upstream error");
            UpstreamEvent::Error(message.to_string())
        }
        other => UpstreamEvent::Other(other.to_string()),
    }
}

/// Client for one realtime transcription stream.
pub struct RealtimeSttClient {
    speaker: Speaker,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_task: JoinHandle<()>,
    inbound_task: JoinHandle<()>,
}

impl RealtimeSttClient {
    /// Open the stream and send the transcription session configuration.
    pub async fn connect(
        settings: &Settings,
        speaker: Speaker,
        bus: Arc<EventBus>,
        session: Arc<Session>,
    ) -> Result<Self> {
        let url = format!("{}?model={}", settings.stt_base_url, STT_MODEL);
        let mut request = url
            .into_client_request()
            .context("failed to build STT request")?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", settings.openai_api_key)
                .parse()
                .context("invalid authorization header")?,
        );
        request.headers_mut().insert(
            "OpenAI-Beta",
            "realtime=v1".parse().context("invalid beta header")?,
        );

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .context("failed to connect to realtime STT endpoint")?;
        let (mut ws_sink, ws_source) = ws_stream.split();

        let config = serde_json::json!({
            "type": "session.update",
            "session": {
                "input_audio_format": "pcm16",
                "input_audio_transcription": {
                    "model": STT_MODEL,
                },
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": 0.5,
                    "prefix_padding_ms": 300,
                    "silence_duration_ms": 300,
                },
            }
        });
        ws_sink
            .send(WsMessage::Text(config.to_string().into()))
            .await
            .context("failed to send session configuration")?;

        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(256);
        let outbound_task = tokio::spawn(outbound_loop(outbound_rx, ws_sink, speaker));
        let inbound_task = tokio::spawn(inbound_loop(ws_source, speaker, bus, session));

        info!(speaker = ?speaker, "STT client connected");
        Ok(Self {
            speaker,
            outbound_tx,
            outbound_task,
            inbound_task,
        })
    }

    /// Queue 24 kHz PCM for the upstream buffer. Dropped silently once the
    /// connection is gone; the inbound side reports the failure.
    pub async fn send_audio(&self, pcm_bytes: Vec<u8>) {
        if self.outbound_tx.send(pcm_bytes).await.is_err() {
            debug!(speaker = ?self.speaker, "dropping audio, STT connection closed");
        }
    }

    pub async fn disconnect(self) {
        // Closing the channel makes the outbound loop send a Close frame.
        drop(self.outbound_tx);
        let _ = self.outbound_task.await;
        self.inbound_task.abort();
        let _ = self.inbound_task.await;
        info!(speaker = ?self.speaker, "STT client disconnected");
    }
}

async fn outbound_loop(mut rx: mpsc::Receiver<Vec<u8>>, mut sink: WsSink, speaker: Speaker) {
    while let Some(pcm) = rx.recv().await {
        let message = serde_json::json!({
            "type": "input_audio_buffer.append",
            "audio": BASE64.encode(&pcm),
        });
        if sink
            .send(WsMessage::Text(message.to_string().into()))
            .await
            .is_err()
        {
            warn!(speaker = ?speaker, "STT send failed, closing outbound loop");
            return;
        }
    }
    let _ = sink.send(WsMessage::Close(None)).await;
}

async fn inbound_loop(
    mut source: WsSource,
    speaker: Speaker,
    bus: Arc<EventBus>,
    session: Arc<Session>,
) {
    let mut current_segment_id: Option<String> = None;

    while let Some(message) = source.next().await {
        let text = match message {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => {
                info!(speaker = ?speaker, "STT connection closed by upstream");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!(speaker = ?speaker, "STT receive error: {}", e);
                break;
            }
        };

        match parse_upstream_event(&text) {
            UpstreamEvent::SessionReady(kind) => {
                debug!(speaker = ?speaker, kind = %kind, "STT session ready");
            }
            UpstreamEvent::SpeechStarted => {
                let segment_id = uuid::Uuid::new_v4().to_string();
                debug!(speaker = ?speaker, segment_id = %segment_id, "speech started");
                current_segment_id = Some(segment_id);
            }
            UpstreamEvent::SpeechStopped => {
                debug!(speaker = ?speaker, "speech stopped");
            }
            UpstreamEvent::Delta(delta) => {
                if delta.is_empty() {
                    continue;
                }
                // Deltas before the first speech_started have no segment.
                let Some(segment_id) = current_segment_id.clone() else {
                    continue;
                };
                bus.publish(Event::TranscriptDelta(TranscriptDelta {
                    speaker,
                    text: delta,
                    segment_id,
                    timestamp: unix_timestamp(),
                }))
                .await;
            }
            UpstreamEvent::Completed(transcript) => {
                if transcript.is_empty() {
                    current_segment_id = None;
                    continue;
                }
                let segment_id = current_segment_id
                    .take()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                session
                    .stats
                    .transcript_segments
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                bus.publish(Event::TranscriptCompleted(TranscriptCompleted {
                    speaker,
                    text: transcript,
                    segment_id,
                    timestamp: unix_timestamp(),
                }))
                .await;
            }
            UpstreamEvent::Error(message) => {
                error!(speaker = ?speaker, "STT API error: {}", message);
                session
                    .stats
                    .stt_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                bus.publish(Event::SttError(message)).await;
            }
            UpstreamEvent::Malformed(reason) => {
                warn!(speaker = ?speaker, "malformed STT event: {}", reason);
            }
            UpstreamEvent::Other(kind) => {
                debug!(speaker = ?speaker, kind = %kind, "unhandled STT event");
            }
        }
    }
}

fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Drives transcription for both audio channels of one session.
pub struct SttService {
    session: Arc<Session>,
    bus: Arc<EventBus>,
    settings: Arc<Settings>,
}

impl SttService {
    pub fn new(session: Arc<Session>, bus: Arc<EventBus>, settings: Arc<Settings>) -> Self {
        Self {
            session,
            bus,
            settings,
        }
    }

    /// Connect both STT streams and pump audio until the session stops.
    ///
    /// A failed connect publishes `SttError` and returns; the session is
    /// left in `Active` so the client can stop and restart it.
    pub async fn run(self) {
        info!(session_id = %self.session.id, "STT service starting");

        let mic = RealtimeSttClient::connect(
            &self.settings,
            Speaker::Me,
            self.bus.clone(),
            self.session.clone(),
        )
        .await;
        let system = RealtimeSttClient::connect(
            &self.settings,
            Speaker::Them,
            self.bus.clone(),
            self.session.clone(),
        )
        .await;

        let (mic, system) = match (mic, system) {
            (Ok(mic), Ok(system)) => (mic, system),
            (mic, system) => {
                for result in [&mic, &system] {
                    if let Err(e) = result {
                        error!(session_id = %self.session.id, "STT connect failed: {:#}", e);
                    }
                }
                for client in [mic, system].into_iter().flatten() {
                    client.disconnect().await;
                }
                self.session
                    .stats
                    .stt_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.bus
                    .publish(Event::SttError(
                        "failed to connect to transcription endpoint".to_string(),
                    ))
                    .await;
                return;
            }
        };

        let cancel = self.session.cancel_token();
        tokio::join!(
            pump_channel(&self.session, AudioChannel::Mic, &mic, &cancel, &self.settings),
            pump_channel(&self.session, AudioChannel::System, &system, &cancel, &self.settings),
        );

        mic.disconnect().await;
        system.disconnect().await;
        info!(session_id = %self.session.id, "STT service stopped");
    }
}

/// Drain one audio queue into its STT stream until the session stops.
async fn pump_channel(
    session: &Arc<Session>,
    channel: AudioChannel,
    client: &RealtimeSttClient,
    cancel: &CancellationToken,
    settings: &Settings,
) {
    let queue = session.queue(channel);
    let mut debug_file = debug_audio_file(settings, &session.id, channel);

    while !cancel.is_cancelled() {
        // The short timeout keeps cancellation latency bounded.
        let Some(frame) = queue.recv_timeout(Duration::from_millis(100)).await else {
            continue;
        };
        if let Some(file) = debug_file.as_mut() {
            let _ = file.write_all(&frame);
        }
        let resampled = resample_16k_to_24k(&frame);
        client.send_audio(resampled).await;
    }
}

fn debug_audio_file(
    settings: &Settings,
    session_id: &str,
    channel: AudioChannel,
) -> Option<std::fs::File> {
    if !settings.debug_save_audio {
        return None;
    }
    if let Err(e) = std::fs::create_dir_all(&settings.debug_audio_path) {
        warn!("failed to create debug audio dir: {}", e);
        return None;
    }
    let path = settings
        .debug_audio_path
        .join(format!("{}-{}.pcm", session_id, channel.as_str()));
    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), "failed to open debug audio file: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_session_lifecycle() {
        assert_eq!(
            parse_upstream_event(r#"{"type": "session.created", "session": {}}"#),
            UpstreamEvent::SessionReady("session.created".to_string())
        );
        assert_eq!(
            parse_upstream_event(r#"{"type": "session.updated"}"#),
            UpstreamEvent::SessionReady("session.updated".to_string())
        );
    }

    #[test]
    fn parse_speech_boundaries() {
        assert_eq!(
            parse_upstream_event(r#"{"type": "input_audio_buffer.speech_started"}"#),
            UpstreamEvent::SpeechStarted
        );
        assert_eq!(
            parse_upstream_event(r#"{"type": "input_audio_buffer.speech_stopped"}"#),
            UpstreamEvent::SpeechStopped
        );
    }

    #[test]
    fn parse_transcription_delta() {
        let event = parse_upstream_event(
            r#"{"type": "conversation.item.input_audio_transcription.delta", "delta": "hello "}"#,
        );
        assert_eq!(event, UpstreamEvent::Delta("hello ".to_string()));
    }

    #[test]
    fn parse_transcription_completed() {
        let event = parse_upstream_event(
            r#"{"type": "conversation.item.input_audio_transcription.completed", "transcript": "hello world"}"#,
        );
        assert_eq!(event, UpstreamEvent::Completed("hello world".to_string()));
    }

    #[test]
    fn parse_error_event() {
        let event =
            parse_upstream_event(r#"{"type": "error", "error": {"message": "rate limited"}}"#);
        assert_eq!(event, UpstreamEvent::Error("rate limited".to_string()));
    }

    #[test]
    fn parse_unknown_event() {
        let event = parse_upstream_event(r#"{"type": "response.created"}"#);
        assert_eq!(event, UpstreamEvent::Other("response.created".to_string()));
    }

    #[test]
    fn malformed_json_is_flagged_not_fatal() {
        assert!(matches!(
            parse_upstream_event("not json"),
            UpstreamEvent::Malformed(_)
        ));
    }
}
