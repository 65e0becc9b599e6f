//! Per-session state for the aggregator.
//!
//! A session is created lazily on the first `GET /mcp/{group}` for a new
//! session id and owns the channel feeding that SSE connection. Closing
//! the SSE stream destroys the session and cancels its pending upstream
//! calls; idle sessions expire after a timeout to bound memory.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One outbound SSE frame on a session stream.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub event: &'static str,
    pub data: String,
}

/// State for one aggregator session.
pub struct AggregatorSession {
    pub session_id: String,
    pub group: String,
    tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    last_active: parking_lot::Mutex<Instant>,
}

impl AggregatorSession {
    fn new(session_id: String, group: String, capacity: usize) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let session = Arc::new(Self {
            session_id,
            group,
            tx,
            cancel: CancellationToken::new(),
            last_active: parking_lot::Mutex::new(Instant::now()),
        });
        (session, rx)
    }

    /// Push an event onto the session's SSE stream. A closed stream drops
    /// the event silently.
    pub async fn send(&self, event: &'static str, data: String) -> bool {
        self.touch();
        self.tx.send(SessionEvent { event, data }).await.is_ok()
    }

    /// Token cancelled when the session is destroyed.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

/// Session registry with idle expiry.
pub struct SessionStore {
    sessions: DashMap<String, Arc<AggregatorSession>>,
    idle_timeout: Duration,
    channel_capacity: usize,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration, channel_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
            channel_capacity,
        }
    }

    /// Create (or replace) the session for `session_id`, returning it with
    /// the receiving half of its event channel. Replacing an id cancels
    /// the previous session first, so a reconnecting client never observes
    /// frames from its own stale stream.
    pub fn open(
        &self,
        session_id: &str,
        group: &str,
    ) -> (Arc<AggregatorSession>, mpsc::Receiver<SessionEvent>) {
        let (session, rx) = AggregatorSession::new(
            session_id.to_string(),
            group.to_string(),
            self.channel_capacity,
        );
        if let Some(previous) = self.sessions.insert(session_id.to_string(), session.clone()) {
            previous.cancel.cancel();
            debug!(session = %session_id, "Replaced existing aggregator session");
        }
        info!(session = %session_id, group = %group, "Opened aggregator session");
        (session, rx)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<AggregatorSession>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    /// Destroy a session if it is still the one registered under its id.
    pub fn close(&self, session: &Arc<AggregatorSession>) {
        let removed = self
            .sessions
            .remove_if(&session.session_id, |_, current| {
                Arc::ptr_eq(current, session)
            })
            .is_some();
        if removed {
            session.cancel.cancel();
            info!(session = %session.session_id, "Closed aggregator session");
        }
    }

    /// Drop sessions idle beyond the timeout. Returns the count removed.
    pub fn expire_idle(&self) -> usize {
        let stale: Vec<Arc<AggregatorSession>> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() > self.idle_timeout)
            .map(|e| Arc::clone(e.value()))
            .collect();

        for session in &stale {
            self.close(session);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Spawn the periodic idle-expiry task.
    pub fn spawn_expiry_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let expired = store.expire_idle();
                if expired > 0 {
                    debug!(count = expired, "Expired idle aggregator sessions");
                }
            }
        })
    }
}
