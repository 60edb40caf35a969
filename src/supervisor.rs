//! Session supervisor
//!
//! Owns the single active session per process and the event bus the
//! pipeline components share. All lifecycle operations serialize through
//! one lock so concurrent control messages cannot race.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::events::{Event, EventBus};
use crate::session::{Session, SessionMode, SessionState};

pub struct SessionSupervisor {
    current: Mutex<Option<Arc<Session>>>,
    bus: Arc<EventBus>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            bus: Arc::new(EventBus::new()),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Create a new session in `Created` state. An already-active session
    /// is stopped first.
    pub async fn create_session(&self, mode: SessionMode) -> Arc<Session> {
        let mut current = self.current.lock().await;
        if let Some(existing) = current.as_ref() {
            if existing.state().await == SessionState::Active {
                warn!(session_id = %existing.id, "session already active, stopping previous session");
                stop(existing).await;
                self.bus
                    .publish(Event::SessionStopped(existing.id.clone()))
                    .await;
            }
        }

        let session = Arc::new(Session::new(mode));
        info!(session_id = %session.id, mode = mode.as_str(), "session created");
        *current = Some(session.clone());
        session
    }

    pub async fn current_session(&self) -> Option<Arc<Session>> {
        self.current.lock().await.clone()
    }

    /// Move a `Created` session to `Active`. Any other state is refused.
    pub async fn start_session(&self, session: &Arc<Session>) {
        let _guard = self.current.lock().await;
        let current_state = session.state().await;
        if current_state != SessionState::Created {
            warn!(session_id = %session.id, state = ?current_state,
                "cannot start session in this state");
            return;
        }
        session.set_state(SessionState::Active).await;
        info!(session_id = %session.id, "session started");
        self.bus
            .publish(Event::SessionStarted(session.id.clone()))
            .await;
    }

    /// Stop a session. Idempotent; cancels and awaits every registered task.
    pub async fn stop_session(&self, session: &Arc<Session>) {
        let _guard = self.current.lock().await;
        if stop(session).await {
            self.bus
                .publish(Event::SessionStopped(session.id.clone()))
                .await;
        }
    }

    /// Stop (if needed) and release the session with the given id.
    pub async fn destroy_session(&self, session_id: &str) {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if session.id == session_id {
                stop(session).await;
                *current = None;
                info!(session_id, "session destroyed");
            }
        }
    }

    pub async fn set_mode(&self, session: &Arc<Session>, mode: SessionMode) {
        session.set_mode(mode).await;
        info!(session_id = %session.id, mode = mode.as_str(), "session mode changed");
    }

    pub fn set_hints_enabled(&self, session: &Arc<Session>, enabled: bool) {
        session.set_hints_enabled(enabled);
        info!(session_id = %session.id, hints_enabled = enabled, "hints toggled");
    }

    pub async fn set_custom_prompt(&self, session: &Arc<Session>, prompt: String) {
        session.set_custom_prompt(Some(prompt)).await;
        info!(session_id = %session.id, "custom prompt set");
    }

    pub async fn set_knowledge_workspace(&self, session: &Arc<Session>, workspace: String) {
        session.set_knowledge_workspace(Some(workspace.clone())).await;
        info!(session_id = %session.id, workspace = %workspace, "knowledge workspace set");
    }

    /// Stop the current session and drop all bus subscriptions.
    pub async fn shutdown(&self) {
        let session = self.current.lock().await.take();
        if let Some(session) = session {
            stop(&session).await;
        }
        self.bus.clear().await;
        info!("session supervisor shutdown complete");
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared stop path. Returns false when the session was already stopped.
async fn stop(session: &Arc<Session>) -> bool {
    if session.state().await == SessionState::Stopped {
        return false;
    }
    session.set_state(SessionState::Stopped).await;
    session.cancel_tasks().await;
    info!(
        session_id = %session.id,
        dropped_frames = session.stats.dropped_frames_count(),
        transcript_segments = session.stats.transcript_segments.load(std::sync::atomic::Ordering::Relaxed),
        hints_generated = session.stats.hints_generated.load(std::sync::atomic::Ordering::Relaxed),
        "session stopped"
    );
    true
}
