//! Transcript aggregation and hint triggering
//!
//! Collects transcript deltas into per-segment partials, keeps a short
//! history of completed utterances, and decides when a chunk is ripe for
//! hint generation: a pending partial fires on word count or idle timeout,
//! and every completed segment is considered directly. Dispatch is gated by
//! session mode: interview mode wants questions from the other side,
//! meeting mode takes any remote utterance under a rate limit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{AGGREGATION_TIMEOUT_MS, AGGREGATION_WORD_THRESHOLD, HINT_RATE_LIMIT_MS};
use crate::events::{
    handler, Event, EventBus, EventTopic, Speaker, TextChunk, TranscriptCompleted, TranscriptDelta,
};
use crate::session::{Session, SessionMode};

/// Leading phrases that mark a question or an invitation to speak.
static QUESTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(what|why|how|when|where|who|which|can you|could you|would you|tell me|explain|describe|walk me through|give me an example)\b",
    )
    .unwrap()
});

/// Detect whether `text` is a question or an invitation to speak.
pub fn is_question(text: &str) -> bool {
    let text = text.trim();
    text.contains('?') || QUESTION_RE.is_match(text)
}

/// A transcript segment with metadata.
#[derive(Debug, Clone)]
pub struct TranscriptSegment {
    pub speaker: Speaker,
    pub text: String,
    pub segment_id: String,
    pub timestamp: f64,
    pub is_complete: bool,
}

const HISTORY_LIMIT: usize = 20;

/// Aggregates transcript deltas into stable chunks.
#[derive(Debug, Default)]
pub struct TextAggregator {
    /// Open segments being built, by segment id.
    current_segments: HashMap<String, TranscriptSegment>,
    /// Most recent completed segments, oldest first.
    history: VecDeque<TranscriptSegment>,
    pending_text: String,
    pending_speaker: Option<Speaker>,
    pending_segment_id: Option<String>,
    last_delta_time: Option<Instant>,
}

impl TextAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a delta into its segment and mark it pending.
    ///
    /// Deltas for segments that already completed are discarded; completed
    /// text is frozen.
    pub fn add_delta(&mut self, event: &TranscriptDelta) {
        if self.history.iter().any(|s| s.segment_id == event.segment_id) {
            debug!(segment_id = %event.segment_id, "discarding delta for completed segment");
            return;
        }

        let segment = self
            .current_segments
            .entry(event.segment_id.clone())
            .or_insert_with(|| TranscriptSegment {
                speaker: event.speaker,
                text: String::new(),
                segment_id: event.segment_id.clone(),
                timestamp: event.timestamp,
                is_complete: false,
            });
        segment.text.push_str(&event.text);

        self.pending_text = segment.text.clone();
        self.pending_speaker = Some(segment.speaker);
        self.pending_segment_id = Some(event.segment_id.clone());
        self.last_delta_time = Some(Instant::now());
    }

    /// Close a segment with its final text and append it to history.
    pub fn complete_segment(&mut self, event: &TranscriptCompleted) -> TranscriptSegment {
        let mut segment = self
            .current_segments
            .remove(&event.segment_id)
            .unwrap_or_else(|| TranscriptSegment {
                speaker: event.speaker,
                text: String::new(),
                segment_id: event.segment_id.clone(),
                timestamp: event.timestamp,
                is_complete: false,
            });
        segment.text = event.text.clone();
        segment.is_complete = true;

        self.history.push_back(segment.clone());
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }

        if self.pending_segment_id.as_deref() == Some(event.segment_id.as_str()) {
            self.clear_pending();
        }

        segment
    }

    /// Up to the last `count` completed utterances by `speaker`, oldest first.
    pub fn last_context(&self, speaker: Speaker, count: usize) -> String {
        let mut texts: Vec<&str> = Vec::new();
        for segment in self.history.iter().rev() {
            if segment.speaker == speaker {
                texts.push(&segment.text);
                if texts.len() >= count {
                    break;
                }
            }
        }
        texts.reverse();
        texts.join(" ")
    }

    /// Recent conversation rendered as tagged lines, newest-first truncation
    /// to `max_chars`, returned in chronological order.
    pub fn global_context(&self, max_chars: usize) -> String {
        let mut lines: Vec<String> = Vec::new();
        let mut total_chars = 0usize;

        for segment in self.history.iter().rev() {
            let prefix = match segment.speaker {
                Speaker::Me => "[ME]",
                Speaker::Them => "[THEM]",
            };
            let line = format!("{} {}", prefix, segment.text);
            let line_chars = line.chars().count();
            if total_chars + line_chars > max_chars {
                break;
            }
            total_chars += line_chars;
            lines.push(line);
        }

        lines.reverse();
        lines.join("\n")
    }

    pub fn should_trigger_timeout(&self) -> bool {
        if self.pending_text.is_empty() {
            return false;
        }
        self.last_delta_time
            .is_some_and(|t| t.elapsed() >= Duration::from_millis(AGGREGATION_TIMEOUT_MS))
    }

    pub fn should_trigger_word_count(&self) -> bool {
        if self.pending_text.is_empty() {
            return false;
        }
        self.pending_text.split_whitespace().count() >= AGGREGATION_WORD_THRESHOLD
    }

    /// Snapshot the pending text as a trigger-ready chunk.
    pub fn pending_chunk(&self) -> Option<TextChunk> {
        let speaker = self.pending_speaker?;
        if self.pending_text.is_empty() {
            return None;
        }
        Some(TextChunk {
            speaker,
            text: self.pending_text.clone(),
            last_context: self.last_context(speaker, 2),
            global_context: Some(self.global_context(500)),
            is_question: is_question(&self.pending_text),
        })
    }

    pub fn clear_pending(&mut self) {
        self.pending_text.clear();
        self.pending_speaker = None;
        self.pending_segment_id = None;
    }

    /// Chunk for a just-completed segment, with context from history.
    fn completed_chunk(&self, segment: &TranscriptSegment) -> TextChunk {
        TextChunk {
            speaker: segment.speaker,
            text: segment.text.clone(),
            last_context: self.last_context(segment.speaker, 2),
            global_context: Some(self.global_context(500)),
            is_question: is_question(&segment.text),
        }
    }
}

struct Inner {
    session: Arc<Session>,
    bus: Arc<EventBus>,
    state: Mutex<TextAggregator>,
    last_hint_time: Mutex<Option<Instant>>,
}

impl Inner {
    async fn on_delta(&self, event: TranscriptDelta) {
        let chunk = {
            let mut state = self.state.lock().await;
            state.add_delta(&event);
            if state.should_trigger_word_count() {
                let chunk = state.pending_chunk();
                state.clear_pending();
                chunk
            } else {
                None
            }
        };
        if let Some(chunk) = chunk {
            self.dispatch(chunk).await;
        }
    }

    async fn on_completed(&self, event: TranscriptCompleted) {
        let chunk = {
            let mut state = self.state.lock().await;
            let segment = state.complete_segment(&event);
            state.completed_chunk(&segment)
        };
        self.dispatch(chunk).await;
    }

    async fn on_tick(&self) {
        let chunk = {
            let mut state = self.state.lock().await;
            if state.should_trigger_timeout() {
                let chunk = state.pending_chunk();
                state.clear_pending();
                chunk
            } else {
                None
            }
        };
        if let Some(chunk) = chunk {
            self.dispatch(chunk).await;
        }
    }

    /// Apply the mode gates and publish surviving chunks.
    async fn dispatch(&self, chunk: TextChunk) {
        if !self.session.hints_enabled() {
            return;
        }

        match self.session.mode().await {
            SessionMode::InterviewAssistant => {
                if chunk.speaker != Speaker::Them || !chunk.is_question {
                    return;
                }
                info!(
                    session_id = %self.session.id,
                    text = %truncate(&chunk.text, 50),
                    "interview question detected"
                );
            }
            SessionMode::MeetingAssistant => {
                if chunk.speaker != Speaker::Them {
                    return;
                }
                let mut last = self.last_hint_time.lock().await;
                if let Some(t) = *last {
                    let elapsed = t.elapsed();
                    if elapsed < Duration::from_millis(HINT_RATE_LIMIT_MS) {
                        debug!(elapsed_ms = elapsed.as_millis() as u64, "rate limited");
                        return;
                    }
                }
                *last = Some(Instant::now());
                info!(
                    session_id = %self.session.id,
                    text = %truncate(&chunk.text, 50),
                    "meeting chunk processed"
                );
            }
        }

        self.bus.publish(Event::TextChunkReady(chunk)).await;
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// The aggregation service for one session.
pub struct Aggregator {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

impl Aggregator {
    pub fn new(session: Arc<Session>, bus: Arc<EventBus>) -> Self {
        let cancel = session.cancel_token();
        Self {
            inner: Arc::new(Inner {
                session,
                bus,
                state: Mutex::new(TextAggregator::new()),
                last_hint_time: Mutex::new(None),
            }),
            cancel,
        }
    }

    /// Subscribe to transcript events and run the idle-timeout tick until
    /// the session stops.
    pub async fn run(self) {
        let session_id = self.inner.session.id.clone();
        info!(session_id = %session_id, "aggregator starting");

        let delta_key = format!("aggregator:delta:{}", session_id);
        let completed_key = format!("aggregator:completed:{}", session_id);

        let inner = self.inner.clone();
        self.inner
            .bus
            .subscribe(
                EventTopic::TranscriptDelta,
                &delta_key,
                handler(move |event| {
                    let inner = inner.clone();
                    async move {
                        if let Event::TranscriptDelta(delta) = event {
                            inner.on_delta(delta).await;
                        }
                    }
                }),
            )
            .await;

        let inner = self.inner.clone();
        self.inner
            .bus
            .subscribe(
                EventTopic::TranscriptCompleted,
                &completed_key,
                handler(move |event| {
                    let inner = inner.clone();
                    async move {
                        if let Event::TranscriptCompleted(completed) = event {
                            inner.on_completed(completed).await;
                        }
                    }
                }),
            )
            .await;

        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => self.inner.on_tick().await,
            }
        }

        self.inner
            .bus
            .unsubscribe(EventTopic::TranscriptDelta, &delta_key)
            .await;
        self.inner
            .bus
            .unsubscribe(EventTopic::TranscriptCompleted, &completed_key)
            .await;
        info!(session_id = %session_id, "aggregator stopped");
    }
}
