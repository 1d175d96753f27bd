//! Cluster-wide cache invalidation.
//!
//! Each node publishes an [`InvalidationMessage`] after changing an entity
//! and applies the messages of every other node through
//! [`invalidation_listener_task`]. Messages carry the new revision, so they
//! can be applied in any order per key: an older revision arriving late is a
//! no-op against the store's max-revision bookkeeping.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use warden_core::{CacheError, EntityId, EntityKind, Revision, WardenResult};

use super::identity::IdentityCache;

/// What a receiving node does with its cached copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationAction {
    /// Drop a copy older than the message's revision.
    Evict,
    /// Keep the copy's content and move its revision forward.
    Advance,
    /// The entity was deleted: evict it and every cached entry that
    /// references it.
    Remove,
}

/// One invalidation, as sent between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub kind: EntityKind,
    pub id: EntityId,
    pub revision: Revision,
    pub action: InvalidationAction,
    /// Node that published the message.
    pub origin: String,
}

impl InvalidationMessage {
    pub fn evict(kind: EntityKind, id: impl Into<EntityId>, revision: Revision, origin: &str) -> Self {
        Self {
            kind,
            id: id.into(),
            revision,
            action: InvalidationAction::Evict,
            origin: origin.to_string(),
        }
    }

    pub fn advance(
        kind: EntityKind,
        id: impl Into<EntityId>,
        revision: Revision,
        origin: &str,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            revision,
            action: InvalidationAction::Advance,
            origin: origin.to_string(),
        }
    }

    pub fn remove(kind: EntityKind, id: impl Into<EntityId>, revision: Revision, origin: &str) -> Self {
        Self {
            kind,
            id: id.into(),
            revision,
            action: InvalidationAction::Remove,
            origin: origin.to_string(),
        }
    }
}

/// Transport for invalidation messages between nodes.
pub trait InvalidationBus: Send + Sync {
    /// Send `message` to every subscribed node.
    fn publish(&self, message: InvalidationMessage) -> WardenResult<()>;

    /// Receive the messages published from now on.
    fn subscribe(&self) -> broadcast::Receiver<InvalidationMessage>;
}

/// In-process bus over a tokio broadcast channel.
///
/// Every node of a test cluster (or every cache of one process) shares a
/// clone of the same bus.
#[derive(Debug, Clone)]
pub struct BroadcastInvalidationBus {
    sender: broadcast::Sender<InvalidationMessage>,
}

impl BroadcastInvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl InvalidationBus for BroadcastInvalidationBus {
    fn publish(&self, message: InvalidationMessage) -> WardenResult<()> {
        // No subscribers only means no other node is listening yet.
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(message)
            .map(|_| ())
            .map_err(|e| {
                CacheError::Backend {
                    reason: e.to_string(),
                }
                .into()
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<InvalidationMessage> {
        self.sender.subscribe()
    }
}

/// Counters of one listener's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationListenerSnapshot {
    pub applied: u64,
    pub ignored_own: u64,
    pub lag_resets: u64,
}

/// Apply invalidations from other nodes to `cache` until shutdown.
///
/// Messages published by this node are skipped. If the receiver lags behind
/// and messages were lost, every local cache is cleared: the lost messages
/// cannot be replayed, and an empty cache is always correct.
pub async fn invalidation_listener_task(
    cache: Arc<IdentityCache>,
    mut rx: broadcast::Receiver<InvalidationMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> InvalidationListenerSnapshot {
    let mut snapshot = InvalidationListenerSnapshot::default();
    tracing::info!(node_id = %cache.node_id(), "Invalidation listener started");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Invalidation listener shutting down");
                    break;
                }
            }

            received = rx.recv() => {
                match received {
                    Ok(message) if message.origin == cache.node_id() => {
                        snapshot.ignored_own += 1;
                    }
                    Ok(message) => {
                        cache.apply_remote(&message);
                        snapshot.applied += 1;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Invalidation listener lagged, clearing caches");
                        cache.clear();
                        snapshot.lag_resets += 1;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Invalidation bus closed");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(
        applied = snapshot.applied,
        ignored_own = snapshot.ignored_own,
        lag_resets = snapshot.lag_resets,
        "Invalidation listener stopped"
    );
    snapshot
}
