//! In-process watcher agents for tests and the demo runner.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tracing::debug;

use ringside_protocol::{ChannelRef, Sample, SessionId, UserId, WatcherId};

use crate::agent::{AgentError, WatcherAgent};

/// A watcher agent that never talks to a real voice backend.
///
/// Two flavors: [`scripted`](SimulatedAgent::scripted) replays pre-built
/// sample batches in order, [`generated`](SimulatedAgent::generated)
/// fabricates present-and-talking batches from a seeded RNG. Either can
/// be flipped into a failing state to exercise the engine's swap path.
pub struct SimulatedAgent {
    watcher_id: WatcherId,
    inner: Mutex<Inner>,
}

struct Inner {
    channel: Option<ChannelRef>,
    recording: Option<SessionId>,
    script: VecDeque<Vec<Sample>>,
    generator: Option<Generator>,
    failing: bool,
}

struct Generator {
    participants: Vec<UserId>,
    rng: StdRng,
}

impl SimulatedAgent {
    /// Replays `batches` one per poll, then empty batches forever.
    pub fn scripted(watcher_id: WatcherId, batches: Vec<Vec<Sample>>) -> Self {
        Self {
            watcher_id,
            inner: Mutex::new(Inner {
                channel: None,
                recording: None,
                script: batches.into(),
                generator: None,
                failing: false,
            }),
        }
    }

    /// Fabricates one present sample per participant on every poll,
    /// volumes drawn from a seeded RNG so runs are reproducible.
    pub fn generated(watcher_id: WatcherId, participants: Vec<UserId>, seed: u64) -> Self {
        Self {
            watcher_id,
            inner: Mutex::new(Inner {
                channel: None,
                recording: None,
                script: VecDeque::new(),
                generator: Some(Generator {
                    participants,
                    rng: StdRng::seed_from_u64(seed),
                }),
                failing: false,
            }),
        }
    }

    /// Make every subsequent observation call fail, or recover with
    /// `false`. `leave` keeps working so a broken agent can be cleaned up.
    pub async fn set_failing(&self, failing: bool) {
        self.inner.lock().await.failing = failing;
    }

    pub async fn joined_channel(&self) -> Option<ChannelRef> {
        self.inner.lock().await.channel.clone()
    }

    pub async fn recording_session(&self) -> Option<SessionId> {
        self.inner.lock().await.recording.clone()
    }
}

#[async_trait]
impl WatcherAgent for SimulatedAgent {
    fn id(&self) -> &WatcherId {
        &self.watcher_id
    }

    async fn join(&self, channel: &ChannelRef) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.failing {
            return Err(AgentError::Failed {
                reason: "simulated join failure".to_string(),
            });
        }
        inner.channel = Some(channel.clone());
        debug!(watcher_id = %self.watcher_id, channel = %channel, "simulated agent joined");
        Ok(())
    }

    async fn leave(&self, channel: &ChannelRef) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.channel.as_ref() != Some(channel) {
            debug!(
                watcher_id = %self.watcher_id,
                channel = %channel,
                "leave for a channel this agent is not in"
            );
        }
        inner.channel = None;
        inner.recording = None;
        Ok(())
    }

    async fn poll_samples(&self) -> Result<Vec<Sample>, AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.failing {
            return Err(AgentError::Failed {
                reason: "simulated poll failure".to_string(),
            });
        }
        if inner.channel.is_none() {
            return Err(AgentError::Failed {
                reason: "not in a channel".to_string(),
            });
        }
        if let Some(batch) = inner.script.pop_front() {
            return Ok(batch);
        }
        let Some(generator) = inner.generator.as_mut() else {
            return Ok(Vec::new());
        };
        let now = Utc::now().timestamp_millis();
        let Generator { participants, rng } = generator;
        let batch = participants
            .iter()
            .map(|p| Sample::new(p.clone(), now, true, rng.gen_range(0.15..0.95)))
            .collect();
        Ok(batch)
    }

    async fn start_recording(&self, session: &SessionId) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.failing {
            return Err(AgentError::Failed {
                reason: "simulated recording failure".to_string(),
            });
        }
        inner.recording = Some(session.clone());
        Ok(())
    }

    async fn stop_recording(&self, session: &SessionId) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.failing {
            return Err(AgentError::Failed {
                reason: "simulated recording failure".to_string(),
            });
        }
        if inner.recording.as_ref() == Some(session) {
            inner.recording = None;
        }
        Ok(())
    }
}
