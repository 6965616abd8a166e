//! Instance state notification.
//!
//! The `Instance` record stays plain data. Subscribers get a
//! `tokio::sync::watch` receiver from the tracker; the controller publishes
//! every state change it applies through the datastore.

use std::collections::HashMap;

use ciao_datastore::InstanceState;
use tokio::sync::{RwLock, watch};
use tracing::debug;

#[derive(Default)]
pub struct StateTracker {
    channels: RwLock<HashMap<String, watch::Sender<InstanceState>>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver for `instance_id`, starting at `current` if the instance is
    /// not tracked yet.
    pub async fn subscribe(&self, instance_id: &str, current: InstanceState) -> watch::Receiver<InstanceState> {
        if let Some(tx) = self.channels.read().await.get(instance_id) {
            return tx.subscribe();
        }
        self.channels
            .write()
            .await
            .entry(instance_id.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    /// Record a new state and wake subscribers. An untracked instance gets
    /// a channel holding `state`, so a later subscriber starts from it.
    pub async fn publish(&self, instance_id: &str, state: InstanceState) {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(instance_id.to_string())
            .or_insert_with(|| watch::channel(state).0);
        tx.send_replace(state);
        debug!(%instance_id, %state, receivers = tx.receiver_count(), "instance state published");
    }

    /// Publish a final state and drop the channel. Receivers see the final
    /// value, then a closed channel.
    pub async fn retire(&self, instance_id: &str, state: InstanceState) {
        if let Some(tx) = self.channels.write().await.remove(instance_id) {
            tx.send_replace(state);
        }
    }

    /// Drop the channel without a final state, for instances that were
    /// never persisted.
    pub async fn forget(&self, instance_id: &str) {
        self.channels.write().await.remove(instance_id);
    }

    pub async fn tracked(&self) -> usize {
        self.channels.read().await.len()
    }
}
