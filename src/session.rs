//! Session state, statistics, and bounded audio queues
//!
//! A session owns two audio queues (one per client channel), its pipeline
//! tasks, and its statistics. Queues are written only by the connection
//! handler and drained only by the owning STT pump; under backpressure the
//! oldest frame is shed so latency stays bounded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::AUDIO_QUEUE_MAX_FRAMES;

/// Session lifecycle state. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Paused,
    Stopped,
}

/// Hint generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    InterviewAssistant,
    MeetingAssistant,
}

impl SessionMode {
    /// Parse the wire value used by control messages.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "interview_assistant" => Some(SessionMode::InterviewAssistant),
            "meeting_assistant" => Some(SessionMode::MeetingAssistant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::InterviewAssistant => "interview_assistant",
            SessionMode::MeetingAssistant => "meeting_assistant",
        }
    }
}

/// Client audio channel, selected by the first byte of a binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioChannel {
    Mic,
    System,
}

impl AudioChannel {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(AudioChannel::Mic),
            1 => Some(AudioChannel::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioChannel::Mic => "mic",
            AudioChannel::System => "system",
        }
    }
}

/// Monotonic session counters. Each metric has a single producer, so
/// relaxed atomics are enough.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub dropped_frames_mic: AtomicU64,
    pub dropped_frames_system: AtomicU64,
    pub total_frames_mic: AtomicU64,
    pub total_frames_system: AtomicU64,
    pub transcript_segments: AtomicU64,
    pub hints_generated: AtomicU64,
    pub stt_errors: AtomicU64,
    pub llm_errors: AtomicU64,
}

impl SessionStats {
    pub fn record_frame(&self, channel: AudioChannel) {
        match channel {
            AudioChannel::Mic => self.total_frames_mic.fetch_add(1, Ordering::Relaxed),
            AudioChannel::System => self.total_frames_system.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_dropped(&self, channel: AudioChannel) {
        match channel {
            AudioChannel::Mic => self.dropped_frames_mic.fetch_add(1, Ordering::Relaxed),
            AudioChannel::System => self.dropped_frames_system.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn dropped_frames_count(&self) -> u64 {
        self.dropped_frames_mic.load(Ordering::Relaxed)
            + self.dropped_frames_system.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dropped_frames: self.dropped_frames_count(),
            transcript_segments: self.transcript_segments.load(Ordering::Relaxed),
            hints_generated: self.hints_generated.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters exposed over the API.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub dropped_frames: u64,
    pub transcript_segments: u64,
    pub hints_generated: u64,
}

/// Bounded FIFO of PCM frames with drop-oldest overflow behavior.
pub struct AudioQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    capacity: usize,
}

impl AudioQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a frame. When the queue is full the oldest frame is shed to
    /// make room; returns whether a frame was dropped.
    pub async fn push(&self, frame: Vec<u8>) -> bool {
        let dropped = {
            let mut frames = self.frames.lock().await;
            let dropped = if frames.len() >= self.capacity {
                frames.pop_front();
                true
            } else {
                false
            };
            frames.push_back(frame);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Dequeue the oldest frame, waiting at most `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.frames.lock().await.pop_front() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.frames.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.frames.lock().await.is_empty()
    }

    #[cfg(test)]
    pub async fn contents(&self) -> Vec<Vec<u8>> {
        self.frames.lock().await.iter().cloned().collect()
    }
}

/// One connected client's session.
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    mode: Mutex<SessionMode>,
    hints_enabled: AtomicBool,
    custom_prompt: Mutex<Option<String>>,
    knowledge_workspace: Mutex<Option<String>>,
    pub mic_queue: AudioQueue,
    pub system_queue: AudioQueue,
    pub stats: SessionStats,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(mode: SessionMode) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState::Created),
            mode: Mutex::new(mode),
            hints_enabled: AtomicBool::new(true),
            custom_prompt: Mutex::new(None),
            knowledge_workspace: Mutex::new(None),
            mic_queue: AudioQueue::new(AUDIO_QUEUE_MAX_FRAMES),
            system_queue: AudioQueue::new(AUDIO_QUEUE_MAX_FRAMES),
            stats: SessionStats::default(),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub async fn set_state(&self, state: SessionState) {
        *self.state.lock().await = state;
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == SessionState::Active
    }

    pub async fn mode(&self) -> SessionMode {
        *self.mode.lock().await
    }

    pub async fn set_mode(&self, mode: SessionMode) {
        *self.mode.lock().await = mode;
    }

    pub fn hints_enabled(&self) -> bool {
        self.hints_enabled.load(Ordering::Relaxed)
    }

    pub fn set_hints_enabled(&self, enabled: bool) {
        self.hints_enabled.store(enabled, Ordering::Relaxed);
    }

    pub async fn custom_prompt(&self) -> Option<String> {
        self.custom_prompt.lock().await.clone()
    }

    pub async fn set_custom_prompt(&self, prompt: Option<String>) {
        *self.custom_prompt.lock().await = prompt;
    }

    pub async fn knowledge_workspace(&self) -> Option<String> {
        self.knowledge_workspace.lock().await.clone()
    }

    pub async fn set_knowledge_workspace(&self, workspace: Option<String>) {
        *self.knowledge_workspace.lock().await = workspace;
    }

    pub fn queue(&self, channel: AudioChannel) -> &AudioQueue {
        match channel {
            AudioChannel::Mic => &self.mic_queue,
            AudioChannel::System => &self.system_queue,
        }
    }

    /// Token cancelled when the session stops; every pipeline task watches it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a background task owned by this session.
    pub async fn add_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }

    /// Cancel every registered task and wait for each to wind down.
    pub async fn cancel_tasks(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    debug!(session_id = %self.id, "session task ended abnormally: {}", e);
                }
            }
        }
    }

    /// Status view for the API surface.
    pub async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            state: self.state().await,
            mode: self.mode().await,
            hints_enabled: self.hints_enabled(),
            knowledge_workspace: self.knowledge_workspace().await,
            stats: self.stats.snapshot(),
        }
    }
}

/// Point-in-time session view exposed over the API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: SessionState,
    pub mode: SessionMode,
    pub hints_enabled: bool,
    pub knowledge_workspace: Option<String>,
    pub stats: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u32) -> Vec<u8> {
        n.to_le_bytes().to_vec()
    }

    #[tokio::test]
    async fn queue_sheds_oldest_under_backpressure() {
        let queue = AudioQueue::new(200);
        let mut dropped = 0u64;
        for n in 0..250u32 {
            if queue.push(frame(n)).await {
                dropped += 1;
            }
        }

        assert_eq!(dropped, 50);
        assert_eq!(queue.len().await, 200);

        // The survivors are the newest 200 frames, still in FIFO order.
        let contents = queue.contents().await;
        let expected: Vec<Vec<u8>> = (50..250u32).map(frame).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn queue_recv_times_out_when_empty() {
        let queue = AudioQueue::new(4);
        let start = std::time::Instant::now();
        let got = queue.recv_timeout(Duration::from_millis(50)).await;
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn queue_delivers_in_fifo_order() {
        let queue = AudioQueue::new(4);
        queue.push(frame(1)).await;
        queue.push(frame(2)).await;

        assert_eq!(queue.recv_timeout(Duration::from_millis(10)).await, Some(frame(1)));
        assert_eq!(queue.recv_timeout(Duration::from_millis(10)).await, Some(frame(2)));
    }

    #[tokio::test]
    async fn session_ingress_drop_counters() {
        let session = Session::new(SessionMode::InterviewAssistant);
        for n in 0..250u32 {
            session.stats.record_frame(AudioChannel::Mic);
            if session.queue(AudioChannel::Mic).push(frame(n)).await {
                session.stats.record_dropped(AudioChannel::Mic);
            }
        }

        assert_eq!(session.mic_queue.len().await, 200);
        assert_eq!(session.stats.dropped_frames_mic.load(Ordering::Relaxed), 50);
        assert_eq!(session.stats.total_frames_mic.load(Ordering::Relaxed), 250);
        assert_eq!(session.stats.dropped_frames_count(), 50);
    }

    #[test]
    fn mode_wire_values_roundtrip() {
        assert_eq!(
            SessionMode::from_wire("interview_assistant"),
            Some(SessionMode::InterviewAssistant)
        );
        assert_eq!(
            SessionMode::from_wire("meeting_assistant"),
            Some(SessionMode::MeetingAssistant)
        );
        assert_eq!(SessionMode::from_wire("karaoke"), None);
        assert_eq!(SessionMode::MeetingAssistant.as_str(), "meeting_assistant");
    }

    #[test]
    fn channel_tags() {
        assert_eq!(AudioChannel::from_tag(0), Some(AudioChannel::Mic));
        assert_eq!(AudioChannel::from_tag(1), Some(AudioChannel::System));
        assert_eq!(AudioChannel::from_tag(2), None);
    }
}
