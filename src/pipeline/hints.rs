//! Hint generation
//!
//! Streams chat completions for trigger-ready chunks. At most one
//! generation is in flight; a chunk arriving mid-generation either preempts
//! it (interview mode cancels the current request) or replaces the buffered
//! follow-up (meeting mode, latest wins). The follow-up is consumed by an
//! iterative loop so replacement can never recurse.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{Settings, MAX_HINT_POINTS};
use crate::events::{
    handler, Event, EventBus, EventTopic, HintCompleted, HintToken, TextChunk,
};
use crate::knowledge::KnowledgeService;
use crate::session::{Session, SessionMode};

const INTERVIEW_SYSTEM_PROMPT: &str = r#"You are an interview assistant. The interviewer just asked a question.
Based on the question and context, provide 1-3 bullet points to help the candidate structure their answer.

Be concise. Each point should be 5-15 words.
Focus on: key points to mention, structure suggestion, relevant terms.

Do NOT repeat the question. Do NOT write full answers. Do NOT use numbering.
Output ONLY bullet points starting with "- ".

{knowledge_context}"#;

const MEETING_SYSTEM_PROMPT: &str = r#"You are a meeting assistant. Analyze what was just said and provide helpful context in 1-3 bullet points.

Be concise. Each point should be 5-15 words.
Focus on: term explanations, relevant context, follow-up suggestions.

Do NOT repeat what was said. Do NOT use numbering.
Output ONLY bullet points starting with "- ".

{knowledge_context}"#;

/// Upstream request timeout; completions are short.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Normalize raw completion text to at most [`MAX_HINT_POINTS`] `- ` bullets.
///
/// Bullet markers are unified, numbered items are rewritten, and loose lines
/// are folded into the preceding bullet (or dropped when there is none).
pub fn format_hint(text: &str) -> String {
    let mut bullets: Vec<String> = Vec::new();

    for line in text.trim().lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let marker = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("• "))
            .or_else(|| line.strip_prefix("* "));
        if let Some(rest) = marker {
            bullets.push(format!("- {}", rest.trim_start()));
        } else if line.chars().next().is_some_and(|c| c.is_ascii_digit())
            && line.chars().take(3).any(|c| c == '.')
        {
            if let Some((_, rest)) = line.split_once('.') {
                bullets.push(format!("- {}", rest.trim()));
            }
        } else if let Some(last) = bullets.last_mut() {
            last.push(' ');
            last.push_str(line);
        }
    }

    bullets.truncate(MAX_HINT_POINTS);
    bullets.join("\n")
}

struct GenState {
    generating: bool,
    pending_chunk: Option<TextChunk>,
    current_hint_id: Option<String>,
    cancel: CancellationToken,
}

struct Worker {
    session: Arc<Session>,
    bus: Arc<EventBus>,
    settings: Arc<Settings>,
    knowledge: Arc<KnowledgeService>,
    http: reqwest::Client,
    state: Mutex<GenState>,
}

impl Worker {
    async fn on_chunk(self: Arc<Self>, chunk: TextChunk) {
        if !self.session.hints_enabled() {
            return;
        }

        let mut state = self.state.lock().await;
        if state.generating {
            if self.session.mode().await == SessionMode::InterviewAssistant {
                // A newer question wins; abandon the in-flight answer.
                state.cancel.cancel();
            }
            state.pending_chunk = Some(chunk);
            return;
        }

        state.generating = true;
        state.cancel = self.session.cancel_token().child_token();
        drop(state);

        tokio::spawn(self.generation_loop(chunk));
    }

    /// Generate for `chunk`, then keep consuming the buffered follow-up
    /// until none is left. Iterative by design.
    async fn generation_loop(self: Arc<Self>, mut chunk: TextChunk) {
        loop {
            let (hint_id, cancel) = {
                let mut state = self.state.lock().await;
                let hint_id = uuid::Uuid::new_v4().to_string();
                state.current_hint_id = Some(hint_id.clone());
                (hint_id, state.cancel.clone())
            };

            self.generate(&chunk, &hint_id, &cancel).await;

            let next = {
                let mut state = self.state.lock().await;
                state.current_hint_id = None;
                match state.pending_chunk.take() {
                    Some(pending) => {
                        state.cancel = self.session.cancel_token().child_token();
                        Some(pending)
                    }
                    None => {
                        state.generating = false;
                        None
                    }
                }
            };
            match next {
                Some(pending) => chunk = pending,
                None => break,
            }
        }
    }

    async fn build_system_prompt(&self, chunk: &TextChunk, mode: SessionMode) -> String {
        let mut knowledge_context = String::new();
        if let Some(workspace) = self.session.knowledge_workspace().await {
            let retrieved = self.knowledge.retrieve(&workspace, &chunk.text, 3).await;
            if !retrieved.is_empty() {
                knowledge_context = format!("\nRelevant knowledge:\n{}\n", retrieved);
            }
        }

        let template = match mode {
            SessionMode::InterviewAssistant => INTERVIEW_SYSTEM_PROMPT,
            SessionMode::MeetingAssistant => MEETING_SYSTEM_PROMPT,
        };
        let mut prompt = template.replace("{knowledge_context}", &knowledge_context);

        if let Some(custom) = self.session.custom_prompt().await {
            prompt.push_str(&format!("\n\nAdditional instructions: {}", custom));
        }
        prompt
    }

    async fn generate(&self, chunk: &TextChunk, hint_id: &str, cancel: &CancellationToken) {
        let mode = self.session.mode().await;
        let system_prompt = self.build_system_prompt(chunk, mode).await;

        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": system_prompt,
        })];
        if let Some(global_context) = chunk.global_context.as_deref() {
            if !global_context.is_empty() {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": format!("Recent conversation:\n{}", global_context),
                }));
            }
        }
        let label = match mode {
            SessionMode::InterviewAssistant => "Question",
            SessionMode::MeetingAssistant => "Statement",
        };
        messages.push(serde_json::json!({
            "role": "user",
            "content": format!("{}: {}\n\nProvide 1-3 bullet points:", label, chunk.text),
        }));

        let body = serde_json::json!({
            "model": self.settings.ollama_model,
            "messages": messages,
            "stream": true,
            "options": {
                "temperature": 0.7,
                "top_p": 0.9,
            },
        });

        let url = format!("{}/v1/chat/completions", self.settings.ollama_base_url);
        let response = match self
            .http
            .post(&url)
            .timeout(COMPLETION_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(hint_id, "completion request failed: {}", e);
                self.record_error(e.to_string()).await;
                return;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(hint_id, %status, "completion endpoint error: {}", body);
            self.record_error(format!("completion endpoint returned {}", status))
                .await;
            return;
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut collected = String::new();
        let mut cancelled = false;

        'receive: while let Some(item) = stream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(hint_id, "completion stream error: {}", e);
                    self.record_error(e.to_string()).await;
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                if cancel.is_cancelled() {
                    info!(hint_id, "hint generation cancelled");
                    cancelled = true;
                    break 'receive;
                }

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'receive;
                }

                match serde_json::from_str::<StreamResponse>(data) {
                    Ok(parsed) => {
                        let token = parsed
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.clone())
                            .unwrap_or_default();
                        if !token.is_empty() {
                            collected.push_str(&token);
                            self.bus
                                .publish(Event::HintToken(HintToken {
                                    hint_id: hint_id.to_string(),
                                    token,
                                }))
                                .await;
                        }
                    }
                    Err(e) => {
                        debug!(hint_id, "skipping unparsable SSE chunk: {}", e);
                    }
                }
            }
        }

        if cancelled || cancel.is_cancelled() || collected.is_empty() {
            return;
        }

        let final_text = format_hint(&collected);
        self.session
            .stats
            .hints_generated
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(
            hint_id,
            session_id = %self.session.id,
            length = final_text.len(),
            "hint generated"
        );
        self.bus
            .publish(Event::HintCompleted(HintCompleted {
                hint_id: hint_id.to_string(),
                final_text,
                mode: mode.as_str().to_string(),
            }))
            .await;
    }

    async fn record_error(&self, message: String) {
        self.session
            .stats
            .llm_errors
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.bus.publish(Event::LlmError(message)).await;
    }
}

/// The completion streaming service for one session.
pub struct HintService {
    worker: Arc<Worker>,
    cancel: CancellationToken,
}

impl HintService {
    pub fn new(
        session: Arc<Session>,
        bus: Arc<EventBus>,
        settings: Arc<Settings>,
        knowledge: Arc<KnowledgeService>,
    ) -> Self {
        let cancel = session.cancel_token();
        let child = cancel.child_token();
        Self {
            worker: Arc::new(Worker {
                session,
                bus,
                settings,
                knowledge,
                http: reqwest::Client::new(),
                state: Mutex::new(GenState {
                    generating: false,
                    pending_chunk: None,
                    current_hint_id: None,
                    cancel: child,
                }),
            }),
            cancel,
        }
    }

    /// Subscribe to ready chunks and park until the session stops.
    pub async fn run(self) {
        let session_id = self.worker.session.id.clone();
        info!(session_id = %session_id, "hint service starting");

        let key = format!("hints:{}", session_id);
        let worker = self.worker.clone();
        self.worker
            .bus
            .subscribe(
                EventTopic::TextChunkReady,
                &key,
                handler(move |event| {
                    let worker = worker.clone();
                    async move {
                        if let Event::TextChunkReady(chunk) = event {
                            worker.on_chunk(chunk).await;
                        }
                    }
                }),
            )
            .await;

        self.cancel.cancelled().await;

        self.worker.state.lock().await.cancel.cancel();
        self.worker
            .bus
            .unsubscribe(EventTopic::TextChunkReady, &key)
            .await;
        info!(session_id = %session_id, "hint service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_well_formed_bullets() {
        let text = "- First point\n- Second point\n- Third point";
        assert_eq!(format_hint(text), text);
    }

    #[test]
    fn normalizes_alternate_bullet_markers() {
        let formatted = format_hint("• Star point\n* Asterisk point");
        assert_eq!(formatted, "- Star point\n- Asterisk point");
    }

    #[test]
    fn rewrites_numbered_lists() {
        let formatted = format_hint("1. First item\n2. Second item");
        assert_eq!(formatted, "- First item\n- Second item");
    }

    #[test]
    fn folds_continuations_into_previous_bullet() {
        let formatted = format_hint("- Lead bullet\nwraps onto this line\n- Next");
        assert_eq!(formatted, "- Lead bullet wraps onto this line\n- Next");
    }

    #[test]
    fn drops_preamble_without_a_bullet() {
        let formatted = format_hint("Here are some ideas:\n- Actual point");
        assert_eq!(formatted, "- Actual point");
    }

    #[test]
    fn truncates_to_three_bullets() {
        let formatted = format_hint("- a\n- b\n- c\n- d\n- e");
        assert_eq!(formatted, "- a\n- b\n- c");
    }

    #[test]
    fn formatting_is_idempotent() {
        let raw = "Intro text\n1. One\n• Two\n- Three\ntrailing wrap\n4. Four";
        let once = format_hint(raw);
        assert_eq!(format_hint(&once), once);

        for line in once.lines() {
            assert!(line.starts_with("- "));
        }
        assert!(once.lines().count() <= MAX_HINT_POINTS);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert_eq!(format_hint(""), "");
        assert_eq!(format_hint("   \n  \n"), "");
    }

    #[test]
    fn prompts_contain_the_knowledge_slot() {
        assert!(INTERVIEW_SYSTEM_PROMPT.contains("{knowledge_context}"));
        assert!(MEETING_SYSTEM_PROMPT.contains("{knowledge_context}"));
    }
}
