use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use shared::{domain::UserId, protocol::ConnectionStats};
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::describe_failure,
    reshape::{reshape, Connection},
    source::{ChangeNotice, ChangeStream, ConnectionSource},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    Uninitialized,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub phase: FeedPhase,
    /// Newest created first.
    pub connections: Vec<Connection>,
    pub stats: ConnectionStats,
    pub error: Option<String>,
    /// Token of the reload that produced this snapshot; 0 before the first.
    pub generation: u64,
}

impl Default for FeedSnapshot {
    fn default() -> Self {
        Self {
            phase: FeedPhase::Uninitialized,
            connections: Vec::new(),
            stats: ConnectionStats::default(),
            error: None,
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Loading { generation: u64 },
    Updated { generation: u64 },
    Failed { generation: u64, message: String },
    /// The change stream ended; the snapshot no longer refreshes itself.
    SubscriptionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Applied,
    /// A newer reload was started, or the feed was stopped, before this one
    /// finished.
    Discarded,
    Failed,
}

struct FeedShared {
    source: Arc<dyn ConnectionSource>,
    viewer: UserId,
    generation: AtomicU64,
    closed: AtomicBool,
    state: RwLock<FeedSnapshot>,
    events: broadcast::Sender<FeedEvent>,
}

impl FeedShared {
    async fn reload(&self) -> ReloadOutcome {
        let token = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if self.closed.load(Ordering::SeqCst) {
            return ReloadOutcome::Discarded;
        }

        {
            let mut state = self.state.write().await;
            if state.phase != FeedPhase::Ready {
                state.phase = FeedPhase::Loading;
            }
        }
        let _ = self.events.send(FeedEvent::Loading { generation: token });

        let fetched = self.source.list_connections(self.viewer).await;

        let mut state = self.state.write().await;
        if self.closed.load(Ordering::SeqCst)
            || token != self.generation.load(Ordering::SeqCst)
            || token <= state.generation
        {
            debug!(
                user_id = self.viewer.0,
                generation = token,
                "feed: discarding superseded reload"
            );
            return ReloadOutcome::Discarded;
        }

        match fetched {
            Ok(records) => {
                let now = Utc::now();
                let connections: Vec<Connection> = records
                    .into_iter()
                    .map(|record| reshape(record, self.viewer, now))
                    .collect();
                state.stats = connections.iter().map(|c| c.status).collect();
                state.connections = connections;
                state.phase = FeedPhase::Ready;
                state.error = None;
                state.generation = token;
                debug!(
                    user_id = self.viewer.0,
                    generation = token,
                    total = state.stats.total,
                    "feed: reload applied"
                );
                drop(state);
                let _ = self.events.send(FeedEvent::Updated { generation: token });
                ReloadOutcome::Applied
            }
            Err(err) => {
                let message = describe_failure(&err);
                warn!(user_id = self.viewer.0, generation = token, error = %err, "feed: reload failed");
                state.phase = FeedPhase::Error;
                state.error = Some(message.clone());
                state.generation = token;
                drop(state);
                let _ = self.events.send(FeedEvent::Failed {
                    generation: token,
                    message,
                });
                ReloadOutcome::Failed
            }
        }
    }
}

/// Owns the change subscription for one viewer. Dropping the feed stops the
/// listener and discards any reload still in flight.
pub struct ConnectionFeed {
    shared: Arc<FeedShared>,
    listener: JoinHandle<()>,
}

impl ConnectionFeed {
    /// Subscribes, starts listening and performs the initial load. A failed
    /// initial load leaves the feed in [`FeedPhase::Error`]; only a failed
    /// subscription is returned as an error.
    pub async fn start(source: Arc<dyn ConnectionSource>, viewer: UserId) -> Result<Self> {
        let changes = source.subscribe(viewer).await?;
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(FeedShared {
            source,
            viewer,
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            state: RwLock::new(FeedSnapshot::default()),
            events,
        });
        let listener = spawn_listener(Arc::clone(&shared), changes);
        info!(user_id = viewer.0, "feed: started");

        shared.reload().await;
        Ok(Self { shared, listener })
    }

    pub async fn snapshot(&self) -> FeedSnapshot {
        self.shared.state.read().await.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.shared.events.subscribe()
    }

    pub async fn reload(&self) -> ReloadOutcome {
        self.shared.reload().await
    }

    /// Manual reload after an error.
    pub async fn retry(&self) -> ReloadOutcome {
        info!(user_id = self.shared.viewer.0, "feed: retry requested");
        self.shared.reload().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.listener.abort();
            info!(user_id = self.shared.viewer.0, "feed: stopped");
        }
    }
}

impl Drop for ConnectionFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_listener(shared: Arc<FeedShared>, mut changes: ChangeStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notice) = changes.next().await {
            if shared.closed.load(Ordering::SeqCst) {
                return;
            }
            match notice {
                ChangeNotice::Changed(connection_id) => debug!(
                    user_id = shared.viewer.0,
                    connection_id = connection_id.0,
                    "feed: change notice"
                ),
                ChangeNotice::Resync => {
                    info!(user_id = shared.viewer.0, "feed: resync requested")
                }
            }
            let reloading = Arc::clone(&shared);
            tokio::spawn(async move {
                reloading.reload().await;
            });
        }
        warn!(user_id = shared.viewer.0, "feed: change stream ended");
        let _ = shared.events.send(FeedEvent::SubscriptionEnded);
    })
}

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod tests;
