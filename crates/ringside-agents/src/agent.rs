//! The watcher agent abstraction.

use async_trait::async_trait;
use thiserror::Error;

use ringside_protocol::{ChannelRef, Sample, SessionId, WatcherId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("no watcher agent available")]
    NoAgentAvailable,
    #[error("agent call timed out during {op}")]
    Timeout { op: String },
    #[error("agent failed: {reason}")]
    Failed { reason: String },
    #[error("unknown watcher agent {0}")]
    UnknownAgent(WatcherId),
}

/// An agent that can sit in a voice channel and observe a fight.
///
/// Observation is pull-based: the agent buffers what it sees and the
/// engine drains it with [`poll_samples`](WatcherAgent::poll_samples)
/// on its own schedule. One agent serves one session at a time.
#[async_trait]
pub trait WatcherAgent: Send + Sync {
    fn id(&self) -> &WatcherId;

    /// Join the given voice channel and start observing.
    async fn join(&self, channel: &ChannelRef) -> Result<(), AgentError>;

    /// Leave the channel and stop observing.
    async fn leave(&self, channel: &ChannelRef) -> Result<(), AgentError>;

    /// Drain samples buffered since the last poll. An empty batch means
    /// the agent saw nothing new, not that it failed.
    async fn poll_samples(&self) -> Result<Vec<Sample>, AgentError>;

    /// Begin capturing channel audio for the session.
    async fn start_recording(&self, session: &SessionId) -> Result<(), AgentError>;

    /// Stop capturing channel audio for the session.
    async fn stop_recording(&self, session: &SessionId) -> Result<(), AgentError>;
}
