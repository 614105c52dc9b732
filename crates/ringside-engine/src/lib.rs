//! Ringside Engine - challenge coordination and fight sessions
//!
//! The engine holds the whole arena in one process: the coordinator owns
//! challenges and sessions, watcher agents feed it samples, policies decide
//! fights, and outcomes land in the stats store. The `ringside` binary in
//! this crate wires it all together.

pub mod config;
pub mod coordinator;
pub mod recording;
pub mod session;
pub mod storage;

pub use config::{ConfigError, EngineConfig};
pub use coordinator::{ChallengeCoordinator, EngineError, RespondAck};
pub use recording::{MemoryRecorder, Recorder, RecordingError};
pub use session::FightSession;
pub use storage::{
    persist_with_retry, DiagnosticsRecord, MemoryStatsStore, SessionRecord, StatsStore,
    StorageError, UserRecord,
};
