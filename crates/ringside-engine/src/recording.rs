//! Fight recording.
//!
//! Recording is armed when a fight goes active and stopped when it ends.
//! The engine only needs start/stop plus the resulting [`RecordingMeta`];
//! everything about codecs and storage lives behind the trait.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use ringside_protocol::{ChannelRef, RecordingMeta, SessionId};

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("no recording in progress for session {0}")]
    NotRecording(SessionId),
}

/// Captures channel audio for the duration of a fight.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn start(&self, session: &SessionId, channel: &ChannelRef) -> Result<(), RecordingError>;

    /// Stop and return metadata for the captured segment.
    async fn stop(&self, session: &SessionId) -> Result<RecordingMeta, RecordingError>;
}

/// In-process recorder that tracks start times and fabricates metadata.
/// Stands in for a real capture pipeline in tests and the demo binary.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    active: Mutex<HashMap<SessionId, DateTime<Utc>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Recorder for MemoryRecorder {
    async fn start(&self, session: &SessionId, channel: &ChannelRef) -> Result<(), RecordingError> {
        let mut active = self.active.lock().await;
        active.insert(session.clone(), Utc::now());
        debug!(session_id = %session, channel = %channel, "recording started");
        Ok(())
    }

    async fn stop(&self, session: &SessionId) -> Result<RecordingMeta, RecordingError> {
        let mut active = self.active.lock().await;
        let started_at = active
            .remove(session)
            .ok_or_else(|| RecordingError::NotRecording(session.clone()))?;
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        debug!(session_id = %session, duration_ms, "recording stopped");
        Ok(RecordingMeta {
            session_id: session.clone(),
            started_at,
            duration_ms,
            file_ref: format!("recordings/{session}.ogg"),
            size_bytes: duration_ms.saturating_mul(6),
            format: "ogg/opus".to_string(),
        })
    }
}
