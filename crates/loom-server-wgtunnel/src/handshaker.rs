// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Relays "ready for handshake" acknowledgements between tunnel endpoints.
//!
//! Best effort: a pair without a tunnel is ignored and failures are only
//! logged.

use crate::error::CoordError;
use crate::heartbeats::Heartbeats;
use crate::pubsub::{Pubsub, EVENT_READY_FOR_HANDSHAKE};
use crate::retry::{retry, Backoff};
use crate::tunneler::tunnel_payload;
use crate::workqueue::WorkQueue;
use loom_server_db::TailnetStore;
use loom_wgtunnel_common::{CoordinatorId, PeerId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// `src` is ready to handshake with `dst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadyForHandshake {
	pub src: PeerId,
	pub dst: PeerId,
}

pub struct Handshaker {
	coordinator_id: CoordinatorId,
	store: Arc<dyn TailnetStore>,
	pubsub: Arc<dyn Pubsub>,
	cancel: CancellationToken,
	backoff: Backoff,
	queue: WorkQueue<ReadyForHandshake>,
}

impl Handshaker {
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
		})
	}

	pub fn start(
		self: &Arc<Self>,
		input: mpsc::UnboundedReceiver<ReadyForHandshake>,
		heartbeats: Arc<Heartbeats>,
		workers: usize,
	) -> Vec<JoinHandle<()>> {
		let mut handles = vec![tokio::spawn(Arc::clone(self).handle_input(input))];
		for _ in 0..workers {
			handles.push(tokio::spawn(Arc::clone(self).worker(Arc::clone(&heartbeats))));
		}
		handles
	}

	async fn handle_input(self: Arc<Self>, mut input: mpsc::UnboundedReceiver<ReadyForHandshake>) {
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => return,
				received = input.recv() => match received {
					Some(ready) => self.queue.enqueue(ready),
					None => return,
				},
			}
		}
	}

	async fn worker(self: Arc<Self>, heartbeats: Arc<Heartbeats>) {
		if heartbeats.wait_first_beat().await.is_err() {
			return;
		}
		while let Ok(ready) = self.queue.acquire().await {
			self.handle(ready).await;
			self.queue.done(&ready);
		}
	}

	#[instrument(skip(self), fields(coordinator_id = %self.coordinator_id, src_id = %ready.src, dst_id = %ready.dst))]
	async fn handle(&self, ready: ReadyForHandshake) {
		let store = Arc::clone(&self.store);
		let src = *ready.src.as_uuid();
		let peers = retry(&self.cancel, &self.backoff, "get tunnel peers", || {
			let store = Arc::clone(&store);
			async move { store.get_tunnel_peer_ids(src).await }
		})
		.await;

		let peers = match peers {
			Ok(peers) => peers,
			Err(CoordError::Cancelled) => return,
			Err(e) => {
				warn!(error = %e, "failed to look up tunnel peers");
				return;
			}
		};
		if !peers.contains(ready.dst.as_uuid()) {
			debug!("ready for handshake without a tunnel, ignoring");
			return;
		}

		// Receivers deliver to the connection of the first peer in the payload.
		let payload = tunnel_payload(&ready.dst, &ready.src);
		if let Err(e) = self
			.pubsub
			.publish(EVENT_READY_FOR_HANDSHAKE, payload.as_bytes())
			.await
		{
			warn!(error = %e, "failed to publish ready for handshake");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pubsub::{MemoryPubsub, Subscription};
	use crate::testing::{test_config, FaultStore};
	use crate::tunneler::parse_peer_pair;
	use std::time::Duration;

	async fn setup() -> (
		Arc<FaultStore>,
		CoordinatorId,
		mpsc::UnboundedSender<ReadyForHandshake>,
		Subscription,
		CancellationToken,
	) {
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

		let handshaker = Handshaker::new(
			coordinator,
			store.clone(),
			Arc::new(pubsub.clone()),
			config.backoff(),
			cancel.clone(),
		);
		let (tx, rx) = mpsc::unbounded_channel();
		handshaker.start(rx, heartbeats, 1);
		let sub = pubsub.subscribe(EVENT_READY_FOR_HANDSHAKE).await.unwrap();
		(store, coordinator, tx, sub, cancel)
	}

	#[tokio::test]
	async fn publishes_for_existing_tunnel() {
		let (store, coordinator, tx, mut sub, cancel) = setup().await;
		let (client, agent) = (PeerId::new(), PeerId::new());
		store
			.inner()
			.upsert_tunnel(*coordinator.as_uuid(), *client.as_uuid(), *agent.as_uuid())
			.await
			.unwrap();

		// The agent acknowledges the client.
		tx.send(ReadyForHandshake {
			src: agent,
			dst: client,
		})
		.unwrap();

		let message = tokio::time::timeout(Duration::from_secs(2), sub.recv())
			.await
			.unwrap()
			.unwrap()
			.unwrap();
		assert_eq!(parse_peer_pair(&message), Some((client, agent)));
		cancel.cancel();
	}

	#[tokio::test]
	async fn ignores_pair_without_tunnel() {
		let (_store, _coordinator, tx, mut sub, cancel) = setup().await;
		tx.send(ReadyForHandshake {
			src: PeerId::new(),
			dst: PeerId::new(),
		})
		.unwrap();

		let result = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
		assert!(result.is_err(), "no notification expected without a tunnel");
		cancel.cancel();
	}
}
