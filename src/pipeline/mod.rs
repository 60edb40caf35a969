//! Session pipeline services
//!
//! Three cooperating tasks per active session: the STT service streams both
//! audio channels to the realtime transcription endpoint, the aggregator
//! turns transcripts into trigger-ready chunks, and the hint service streams
//! completions back for chunks that survive the mode gates.

pub mod aggregator;
pub mod hints;
pub mod stt;

pub use aggregator::Aggregator;
pub use hints::HintService;
pub use stt::SttService;
