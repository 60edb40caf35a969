//! Realtime Copilot - live transcription and AI hints
//!
//! A server that ingests two parallel PCM audio streams (microphone and
//! system/remote) over a single WebSocket, transcribes both through the
//! OpenAI Realtime API, aggregates the transcripts into trigger-ready
//! chunks, and streams short bullet-point hints back to the client from an
//! OpenAI-compatible completion endpoint.
//!
//! # Example
//!
//! ```ignore
//! use realtime_copilot::config::Settings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::from_env()?;
//!     realtime_copilot::server::start(settings).await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod config;
pub mod audio;
pub mod events;
pub mod session;
pub mod supervisor;
pub mod knowledge;
pub mod pipeline;
pub mod server;

// Re-export commonly used types for convenience
pub use config::Settings;
pub use events::{Event, EventBus, EventTopic, Speaker};
pub use session::{Session, SessionMode, SessionState};
pub use supervisor::SessionSupervisor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
