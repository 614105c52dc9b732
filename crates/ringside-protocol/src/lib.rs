//! Ringside Protocol - Core types for the challenge/fight orchestration engine
//!
//! Defines the challenge and session lifecycles, the watcher sample payload,
//! outcomes, and the lifecycle events the engine emits to its collaborators.

pub mod constants;
pub mod error;
pub mod events;
pub mod identity;
pub mod types;

pub use constants::*;
pub use error::*;
pub use events::*;
pub use identity::*;
pub use types::*;
