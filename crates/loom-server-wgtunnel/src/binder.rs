// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Write-behind persistence of peer bindings.
//!
//! Connections report node changes and departures here. Only the latest value
//! per peer is kept; a worker reads it at the moment of each write attempt, so
//! a burst of updates collapses into a single write of the final value.

use crate::error::CoordError;
use crate::heartbeats::Heartbeats;
use crate::pubsub::{Pubsub, EVENT_PEER_UPDATE};
use crate::retry::{retry, Backoff};
use crate::workqueue::WorkQueue;
use loom_server_db::{DbError, PeerStatus, TailnetStore};
use loom_wgtunnel_common::{CoordinatorId, Node, PeerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

/// What a connection reports about its own peer.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingUpdate {
	Node(Node),
	/// The connection dropped without saying goodbye.
	Lost,
	/// The peer disconnected gracefully.
	Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
enum Binding {
	Ok(Node),
	Lost(Node),
	Delete,
}

impl Binding {
	/// A lost binding stays cached so a later loss still has a node to keep.
	fn is_delete(&self) -> bool {
		matches!(self, Binding::Delete)
	}
}

pub struct Binder {
	coordinator_id: CoordinatorId,
	store: Arc<dyn TailnetStore>,
	pubsub: Arc<dyn Pubsub>,
	cancel: CancellationToken,
	backoff: Backoff,
	latest: Mutex<HashMap<PeerId, Binding>>,
	queue: WorkQueue<PeerId>,
}

impl Binder {
	pub fn new(
		coordinator_id: CoordinatorId,
		store: Arc<dyn TailnetStore>,
		pubsub: Arc<dyn Pubsub>,
		backoff: Backoff,
		cancel: CancellationToken,
	) -> Arc<Self> {
		Arc::new(Self {
			coordinator_id,
			store,
			pubsub,
			queue: WorkQueue::new(cancel.clone()),
			cancel,
			backoff,
			latest: Mutex::new(HashMap::new()),
		})
	}

	/// Consume updates from `input` and start `workers` writers once the first
	/// heartbeat has been attempted.
	pub fn start(
		self: &Arc<Self>,
		input: mpsc::UnboundedReceiver<(PeerId, BindingUpdate)>,
		heartbeats: Arc<Heartbeats>,
		workers: usize,
	) -> Vec<JoinHandle<()>> {
		let mut handles = vec![tokio::spawn(Arc::clone(self).handle_input(input))];
		for _ in 0..workers {
			handles.push(tokio::spawn(Arc::clone(self).worker(Arc::clone(&heartbeats))));
		}
		handles
	}

	async fn handle_input(self: Arc<Self>, mut input: mpsc::UnboundedReceiver<(PeerId, BindingUpdate)>) {
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => return,
				received = input.recv() => match received {
					Some((peer, update)) => self.store_update(peer, update),
					None => return,
				},
			}
		}
	}

	pub(crate) fn store_update(&self, peer: PeerId, update: BindingUpdate) {
		{
			let mut latest = self.latest.lock();
			let binding = match update {
				BindingUpdate::Node(node) => Binding::Ok(node),
				BindingUpdate::Lost => match latest.get(&peer) {
					Some(Binding::Ok(node)) | Some(Binding::Lost(node)) => Binding::Lost(node.clone()),
					// Nothing was ever bound, so there is nothing to mark lost.
					Some(Binding::Delete) | None => Binding::Delete,
				},
				BindingUpdate::Disconnected => Binding::Delete,
			};
			latest.insert(peer, binding);
		}
		self.queue.enqueue(peer);
	}

	async fn worker(self: Arc<Self>, heartbeats: Arc<Heartbeats>) {
		if heartbeats.wait_first_beat().await.is_err() {
			return;
		}
		while let Ok(peer) = self.queue.acquire().await {
			self.write_binding(peer).await;
			self.queue.done(&peer);
		}
	}

	#[instrument(skip(self), fields(coordinator_id = %self.coordinator_id, peer_id = %peer))]
	async fn write_binding(&self, peer: PeerId) {
		let written = retry(&self.cancel, &self.backoff, "write binding", || {
			let binding = self.latest.lock().get(&peer).cloned();
			let store = Arc::clone(&self.store);
			let coordinator_id = *self.coordinator_id.as_uuid();
			async move {
				let Some(binding) = binding else {
					return Ok(None);
				};
				match &binding {
					Binding::Ok(node) => {
						store
							.upsert_peer(*peer.as_uuid(), coordinator_id, &encode(node)?, PeerStatus::Ok)
							.await?
					}
					Binding::Lost(node) => {
						store
							.upsert_peer(*peer.as_uuid(), coordinator_id, &encode(node)?, PeerStatus::Lost)
							.await?
					}
					Binding::Delete => match store.delete_peer(*peer.as_uuid(), coordinator_id).await {
						Ok(()) => {}
						Err(e) if e.is_not_found() => {}
						Err(e) => return Err(e),
					},
				}
				Ok::<_, DbError>(Some(binding))
			}
		})
		.await;

		let binding = match written {
			Ok(Some(binding)) => binding,
			Ok(None) => return,
			Err(CoordError::Cancelled) => return,
			Err(e) => {
				error!(error = %e, "failed to write binding");
				return;
			}
		};
		debug!(?binding, "wrote peer binding");

		let pubsub = Arc::clone(&self.pubsub);
		let payload = peer.to_string();
		let published = retry(&self.cancel, &self.backoff, "publish peer update", || {
			let pubsub = Arc::clone(&pubsub);
			let payload = payload.clone();
			async move { pubsub.publish(EVENT_PEER_UPDATE, payload.as_bytes()).await }
		})
		.await;
		if let Err(e) = published {
			if !matches!(e, CoordError::Cancelled) {
				error!(error = %e, "failed to publish peer update");
			}
		}

		if binding.is_delete() {
			let mut latest = self.latest.lock();
			if latest.get(&peer) == Some(&binding) {
				latest.remove(&peer);
			}
		}
	}

	#[cfg(test)]
	fn pending(&self) -> usize {
		self.latest.lock().len()
	}
}

fn encode(node: &Node) -> Result<Vec<u8>, DbError> {
	node.to_bytes().map_err(|e| DbError::Internal(format!("encode node: {e}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pubsub::MemoryPubsub;
	use crate::testing::{test_config, FaultStore};
	use std::time::Duration;

	struct Harness {
		binder: Arc<Binder>,
		store: Arc<FaultStore>,
		pubsub: MemoryPubsub,
		heartbeats: Arc<Heartbeats>,
		coordinator: CoordinatorId,
		cancel: CancellationToken,
	}

	async fn harness() -> Harness {
		let store = FaultStore::new_in_memory().await;
		let pubsub = MemoryPubsub::new();
		let cancel = CancellationToken::new();
		let coordinator = CoordinatorId::new();
		let config = test_config();
		let (events, _) = mpsc::unbounded_channel();
		let heartbeats = Heartbeats::new(
			coordinator,
			store.clone(),
			Arc::new(pubsub.clone()),
			&config,
			cancel.clone(),
			events,
		);
		heartbeats.start().await.unwrap();
		heartbeats.wait_first_beat().await.unwrap();
		let binder = Binder::new(
			coordinator,
			store.clone(),
			Arc::new(pubsub.clone()),
			config.backoff(),
			cancel.clone(),
		);
		Harness {
			binder,
			store,
			pubsub,
			heartbeats,
			coordinator,
			cancel,
		}
	}

	async fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
		tokio::time::timeout(Duration::from_secs(2), async {
			while !f() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap_or_else(|_| panic!("timed out waiting for {what}"));
	}

	#[tokio::test]
	async fn burst_collapses_to_latest_value() {
		let h = harness().await;
		let peer = PeerId::new();

		h.binder.store_update(peer, BindingUpdate::Node(Node::new(1, "k1", "d")));
		h.binder.store_update(peer, BindingUpdate::Node(Node::new(2, "k2", "d")));
		h.binder.start(mpsc::unbounded_channel().1, Arc::clone(&h.heartbeats), 2);

		let store = Arc::clone(&h.store);
		wait_for("binding write", || store.peer_writes() >= 1).await;
		tokio::time::sleep(Duration::from_millis(50)).await;

		assert_eq!(h.store.peer_writes(), 1);
		let rows = h.store.inner().get_peers(*peer.as_uuid()).await.unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(Node::from_bytes(&rows[0].node).unwrap().id, 2);
		assert_eq!(rows[0].status, PeerStatus::Ok);
		h.cancel.cancel();
	}

	#[tokio::test]
	async fn lost_keeps_last_node() {
		let h = harness().await;
		let peer = PeerId::new();
		let (tx, rx) = mpsc::unbounded_channel();
		h.binder.start(rx, Arc::clone(&h.heartbeats), 1);

		let mut updates = h.pubsub.subscribe(EVENT_PEER_UPDATE).await.unwrap();
		tx.send((peer, BindingUpdate::Node(Node::new(7, "k", "d")))).unwrap();
		let first = tokio::time::timeout(Duration::from_secs(2), updates.recv()).await.unwrap();
		assert_eq!(first.unwrap().unwrap(), peer.to_string().into_bytes());

		tx.send((peer, BindingUpdate::Lost)).unwrap();
		let store = Arc::clone(&h.store);
		let peer_uuid = *peer.as_uuid();
		tokio::time::timeout(Duration::from_secs(2), async move {
			loop {
				let rows = store.inner().get_peers(peer_uuid).await.unwrap();
				if rows.first().map(|r| r.status) == Some(PeerStatus::Lost) {
					assert_eq!(Node::from_bytes(&rows[0].node).unwrap().id, 7);
					return;
				}
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();

		assert_eq!(h.binder.pending(), 1);
		h.cancel.cancel();
	}

	async fn wait_for_status(store: &FaultStore, peer: PeerId, status: PeerStatus, writes: usize) {
		tokio::time::timeout(Duration::from_secs(2), async {
			loop {
				let rows = store.inner().get_peers(*peer.as_uuid()).await.unwrap();
				if store.peer_writes() >= writes && rows.first().map(|r| r.status) == Some(status) {
					return;
				}
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap_or_else(|_| panic!("timed out waiting for {status:?} after {writes} writes"));
	}

	#[tokio::test]
	async fn second_loss_keeps_lost_row() {
		let h = harness().await;
		let peer = PeerId::new();
		let (tx, rx) = mpsc::unbounded_channel();
		h.binder.start(rx, Arc::clone(&h.heartbeats), 1);

		tx.send((peer, BindingUpdate::Node(Node::new(7, "k", "d")))).unwrap();
		wait_for_status(&h.store, peer, PeerStatus::Ok, 1).await;
		tx.send((peer, BindingUpdate::Lost)).unwrap();
		wait_for_status(&h.store, peer, PeerStatus::Lost, 2).await;

		// Reconnected and dropped again before reporting a node.
		tx.send((peer, BindingUpdate::Lost)).unwrap();
		wait_for_status(&h.store, peer, PeerStatus::Lost, 3).await;

		let rows = h.store.inner().get_peers(*peer.as_uuid()).await.unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].status, PeerStatus::Lost);
		assert_eq!(Node::from_bytes(&rows[0].node).unwrap().id, 7);
		h.cancel.cancel();
	}

	#[tokio::test]
	async fn disconnect_deletes_binding() {
		let h = harness().await;
		let peer = PeerId::new();
		h
			.store
			.inner()
			.upsert_peer(*peer.as_uuid(), *h.coordinator.as_uuid(), b"{}", PeerStatus::Ok)
			.await
			.unwrap();

		h.binder.store_update(peer, BindingUpdate::Disconnected);
		h.binder.start(mpsc::unbounded_channel().1, Arc::clone(&h.heartbeats), 1);

		let binder = Arc::clone(&h.binder);
		wait_for("delete", || binder.pending() == 0).await;
		assert!(h.store.inner().get_peers(*peer.as_uuid()).await.unwrap().is_empty());
		h.cancel.cancel();
	}

	#[tokio::test]
	async fn lost_without_node_deletes_and_tolerates_missing_row() {
		let h = harness().await;
		let peer = PeerId::new();
		h.binder.store_update(peer, BindingUpdate::Lost);
		h.binder.start(mpsc::unbounded_channel().1, Arc::clone(&h.heartbeats), 1);

		let binder = Arc::clone(&h.binder);
		wait_for("delete of missing row", || binder.pending() == 0).await;
		assert_eq!(h.store.peer_writes(), 0);
		h.cancel.cancel();
	}

	#[tokio::test]
	async fn transient_failures_are_retried_with_latest_value() {
		let h = harness().await;
		let peer = PeerId::new();
		h.store.set_fail_peer_writes(true);
		h.binder.start(mpsc::unbounded_channel().1, Arc::clone(&h.heartbeats), 1);

		h.binder.store_update(peer, BindingUpdate::Node(Node::new(1, "k", "d")));
		tokio::time::sleep(Duration::from_millis(100)).await;
		h.binder.store_update(peer, BindingUpdate::Node(Node::new(3, "k", "d")));
		h.store.set_fail_peer_writes(false);

		let store = Arc::clone(&h.store);
		wait_for("write after recovery", || store.peer_writes() >= 1).await;
		let rows = h.store.inner().get_peers(*peer.as_uuid()).await.unwrap();
		assert_eq!(Node::from_bytes(&rows[0].node).unwrap().id, 3);
		h.cancel.cancel();
	}
}
