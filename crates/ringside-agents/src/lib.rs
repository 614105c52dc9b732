//! Watcher agents for Ringside.
//!
//! A watcher agent sits in a voice channel on the engine's behalf,
//! observing presence and volume for the two fighters. The engine
//! checks agents out of a shared [`AgentPool`] for the lifetime of a
//! session and returns (or quarantines) them when the session ends.

pub mod agent;
pub mod pool;
pub mod simulated;

pub use agent::{AgentError, WatcherAgent};
pub use pool::{AgentLease, AgentPool};
pub use simulated::SimulatedAgent;
