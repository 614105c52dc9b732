//! Shared pool of watcher agents with FIFO checkout.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ringside_protocol::WatcherId;

use crate::agent::{AgentError, WatcherAgent};

/// A checked-out agent. Returned to the pool with [`AgentPool::release`]
/// or retired with [`AgentPool::quarantine`]; the lease is consumed
/// either way, so an agent cannot be handed back twice.
pub struct AgentLease {
    watcher_id: WatcherId,
    agent: Arc<dyn WatcherAgent>,
}

impl AgentLease {
    pub fn watcher_id(&self) -> &WatcherId {
        &self.watcher_id
    }

    pub fn agent(&self) -> &Arc<dyn WatcherAgent> {
        &self.agent
    }
}

impl std::fmt::Debug for AgentLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLease")
            .field("watcher_id", &self.watcher_id)
            .finish()
    }
}

#[derive(Default)]
struct PoolInner {
    agents: HashMap<WatcherId, Arc<dyn WatcherAgent>>,
    idle: VecDeque<WatcherId>,
    busy: HashSet<WatcherId>,
    quarantined: HashSet<WatcherId>,
}

/// Fixed set of watcher agents shared by all sessions.
///
/// Checkout is first-in-first-out over the idle queue and a released
/// agent rejoins at the back, so load spreads across the pool.
/// Quarantined agents stay registered but are never handed out again.
#[derive(Clone, Default)]
pub struct AgentPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent to the pool, idle.
    pub async fn register(&self, agent: Arc<dyn WatcherAgent>) {
        let mut inner = self.inner.lock().await;
        let id = agent.id().clone();
        if inner.agents.contains_key(&id) {
            warn!(watcher_id = %id, "agent already registered");
            return;
        }
        inner.agents.insert(id.clone(), agent);
        inner.idle.push_back(id.clone());
        debug!(watcher_id = %id, idle = inner.idle.len(), "agent registered");
    }

    /// Check out the next idle agent.
    pub async fn acquire(&self) -> Result<AgentLease, AgentError> {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.idle.pop_front() else {
            return Err(AgentError::NoAgentAvailable);
        };
        let agent = inner
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAgent(id.clone()))?;
        inner.busy.insert(id.clone());
        debug!(watcher_id = %id, idle = inner.idle.len(), "agent checked out");
        Ok(AgentLease {
            watcher_id: id,
            agent,
        })
    }

    /// Return a checked-out agent to the back of the idle queue.
    pub async fn release(&self, lease: AgentLease) {
        let mut inner = self.inner.lock().await;
        let id = lease.watcher_id;
        if !inner.busy.remove(&id) {
            warn!(watcher_id = %id, "released agent that was not checked out");
            return;
        }
        inner.idle.push_back(id.clone());
        debug!(watcher_id = %id, idle = inner.idle.len(), "agent released");
    }

    /// Retire a checked-out agent after a failure. It stays registered
    /// but is never handed out again.
    pub async fn quarantine(&self, lease: AgentLease) {
        let mut inner = self.inner.lock().await;
        let id = lease.watcher_id;
        inner.busy.remove(&id);
        inner.quarantined.insert(id.clone());
        info!(
            watcher_id = %id,
            quarantined = inner.quarantined.len(),
            "agent quarantined"
        );
    }

    pub async fn idle_count(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    pub async fn busy_count(&self) -> usize {
        self.inner.lock().await.busy.len()
    }

    pub async fn quarantined_count(&self) -> usize {
        self.inner.lock().await.quarantined.len()
    }
}
