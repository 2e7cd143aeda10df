//! Invalidation event bus connecting the mutable stores to the decision
//! cache. Stores publish plain events after every mutation; the cache
//! subscribes through a spawned listener task.

use tokio::sync::broadcast;

use crate::model::{RoleId, UserId};

/// Published by RoleGraph and AssignmentStore after every mutation.
#[derive(Debug, Clone)]
pub enum InvalidationEvent {
    /// A user's assignments changed; every cached decision for that user
    /// is stale.
    User { user_id: UserId },
    /// A role definition changed; every cached decision whose resolution
    /// touched that role is stale.
    Role { role_id: RoleId },
    /// Blanket invalidation (config reload, bulk import).
    All,
}

pub type InvalidationSender = broadcast::Sender<InvalidationEvent>;
pub type InvalidationReceiver = broadcast::Receiver<InvalidationEvent>;

/// Create the shared invalidation bus. Senders are held by the stores;
/// the cache holds a receiver.
pub fn invalidation_bus() -> InvalidationSender {
    let (tx, _rx) = broadcast::channel(1024);
    tx
}

/// Publish, ignoring the no-subscriber case (valid during startup and in
/// unit tests that exercise a store in isolation).
pub fn publish(tx: &InvalidationSender, event: InvalidationEvent) {
    let _ = tx.send(event);
}
