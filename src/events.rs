//! Internal event plane
//!
//! Pipeline components talk through an in-process topic bus: the STT
//! clients publish transcripts, the aggregator publishes trigger-ready
//! chunks, the hint streamer publishes tokens and completions, and the
//! connection handler forwards a subset to the client. Handlers for one
//! publish run concurrently; a failing handler never affects the others.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Which side of the conversation a transcript belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Speaker {
    /// The local user (microphone channel).
    #[serde(rename = "ME")]
    Me,
    /// The remote party (system audio channel).
    #[serde(rename = "THEM")]
    Them,
}

/// Partial transcript update for an open segment.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptDelta {
    pub speaker: Speaker,
    pub text: String,
    pub segment_id: String,
    pub timestamp: f64,
}

/// Final transcript for a segment.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptCompleted {
    pub speaker: Speaker,
    pub text: String,
    pub segment_id: String,
    pub timestamp: f64,
}

/// Aggregated text ready for hint generation.
#[derive(Debug, Clone)]
pub struct TextChunk {
    pub speaker: Speaker,
    pub text: String,
    /// Up to the last two completed utterances by the same speaker.
    pub last_context: String,
    /// Recent multi-speaker transcript, capped at ~500 characters.
    pub global_context: Option<String>,
    pub is_question: bool,
}

/// One streamed hint token.
#[derive(Debug, Clone, Serialize)]
pub struct HintToken {
    pub hint_id: String,
    pub token: String,
}

/// A finished, formatted hint.
#[derive(Debug, Clone, Serialize)]
pub struct HintCompleted {
    pub hint_id: String,
    pub final_text: String,
    pub mode: String,
}

/// Every payload that can travel over the bus.
#[derive(Debug, Clone)]
pub enum Event {
    TranscriptDelta(TranscriptDelta),
    TranscriptCompleted(TranscriptCompleted),
    TextChunkReady(TextChunk),
    HintToken(HintToken),
    HintCompleted(HintCompleted),
    SttError(String),
    LlmError(String),
    SessionStarted(String),
    SessionStopped(String),
}

/// The closed set of topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    TranscriptDelta,
    TranscriptCompleted,
    TextChunkReady,
    HintToken,
    HintCompleted,
    SttError,
    LlmError,
    SessionStarted,
    SessionStopped,
}

impl Event {
    pub fn topic(&self) -> EventTopic {
        match self {
            Event::TranscriptDelta(_) => EventTopic::TranscriptDelta,
            Event::TranscriptCompleted(_) => EventTopic::TranscriptCompleted,
            Event::TextChunkReady(_) => EventTopic::TextChunkReady,
            Event::HintToken(_) => EventTopic::HintToken,
            Event::HintCompleted(_) => EventTopic::HintCompleted,
            Event::SttError(_) => EventTopic::SttError,
            Event::LlmError(_) => EventTopic::LlmError,
            Event::SessionStarted(_) => EventTopic::SessionStarted,
            Event::SessionStopped(_) => EventTopic::SessionStopped,
        }
    }
}

/// Async handler invoked for each published event on a subscribed topic.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// In-process publish/subscribe bus.
///
/// Subscriptions are keyed so repeated subscribes with the same
/// (topic, key) pair are idempotent and handlers can be removed again.
pub struct EventBus {
    handlers: Mutex<HashMap<EventTopic, Vec<(String, EventHandler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe `handler` under `key`. A key already registered on this
    /// topic is left untouched.
    pub async fn subscribe(&self, topic: EventTopic, key: &str, handler: EventHandler) {
        let mut handlers = self.handlers.lock().await;
        let entries = handlers.entry(topic).or_default();
        if entries.iter().any(|(k, _)| k == key) {
            return;
        }
        entries.push((key.to_string(), handler));
        debug!(?topic, key, "handler subscribed");
    }

    /// Remove the handler registered under `key`, if any.
    pub async fn unsubscribe(&self, topic: EventTopic, key: &str) {
        let mut handlers = self.handlers.lock().await;
        if let Some(entries) = handlers.get_mut(&topic) {
            entries.retain(|(k, _)| k != key);
            debug!(?topic, key, "handler unsubscribed");
        }
    }

    /// Deliver `event` to the subscribers present when the call starts.
    ///
    /// Handlers run concurrently and are all awaited; a handler that
    /// panics is logged without affecting the rest.
    pub async fn publish(&self, event: Event) {
        let snapshot: Vec<EventHandler> = {
            let handlers = self.handlers.lock().await;
            match handlers.get(&event.topic()) {
                Some(entries) => entries.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        if snapshot.is_empty() {
            return;
        }

        let tasks: Vec<_> = snapshot
            .into_iter()
            .map(|h| tokio::spawn(h(event.clone())))
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("event handler panicked: {}", e);
            }
        }
    }

    /// Drop every subscription.
    pub async fn clear(&self) {
        self.handlers.lock().await.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
