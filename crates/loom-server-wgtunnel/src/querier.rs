// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Turns change notifications into fresh mappings for local connections.
//!
//! The querier owns the set of local mappers. Peer and tunnel notifications
//! are translated into per-peer query work on a shared queue, and each query
//! result is handed to the affected peer's mapper. Lossy delivery triggers a
//! full resync. Health transitions from the heartbeat tracker disconnect or
//! readmit peers.

use crate::connio::ConnIo;
use crate::error::CoordError;
use crate::heartbeats::{Health, HeartbeatEvent};
use crate::mapper::MapperHandle;
use crate::mapping::rows_to_mappings;
use crate::pubsub::{
	Pubsub, PubsubError, Subscription, EVENT_PEER_UPDATE, EVENT_READY_FOR_HANDSHAKE,
	EVENT_TUNNEL_UPDATE,
};
use crate::retry::{retry, Backoff};
use crate::tunneler::parse_peer_pair;
use crate::workqueue::WorkQueue;
use loom_server_db::TailnetStore;
use loom_wgtunnel_common::{
	CoordinateResponse, CoordinatorId, PeerId, PeerUpdate, UpdateKind, CLOSE_COORDINATOR_UNHEALTHY,
	CLOSE_PEER_OVERWRITTEN,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const REASON_READY_FOR_HANDSHAKE: &str = "ready for handshake";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum QueryKey {
	/// Recompute the mapping of a local peer.
	Mapping(PeerId),
	/// A peer's binding changed; recompute every local tunnel partner.
	PeerUpdate(PeerId),
}

/// Subscriptions the querier needs before connections may be served.
pub struct QuerierSubscriptions {
	peers: Subscription,
	tunnels: Subscription,
	handshakes: Subscription,
}

struct QuerierState {
	mappers: HashMap<PeerId, MapperHandle>,
	healthy: bool,
}

pub struct Querier {
	coordinator_id: CoordinatorId,
	store: Arc<dyn TailnetStore>,
	cancel: CancellationToken,
	backoff: Backoff,
	queue: WorkQueue<QueryKey>,
	state: Mutex<QuerierState>,
}

impl Querier {
	pub fn new(
		coordinator_id: CoordinatorId,
		store: Arc<dyn TailnetStore>,
		backoff: Backoff,
		cancel: CancellationToken,
	) -> Arc<Self> {
		Arc::new(Self {
			coordinator_id,
			store,
			queue: WorkQueue::new(cancel.clone()),
			cancel,
			backoff,
			state: Mutex::new(QuerierState {
				mappers: HashMap::new(),
				healthy: true,
			}),
		})
	}

	/// Subscribe to every notification the querier consumes, retrying until
	/// each succeeds or the coordinator is cancelled.
	#[instrument(skip(self, pubsub), fields(coordinator_id = %self.coordinator_id))]
	pub async fn subscribe(&self, pubsub: &Arc<dyn Pubsub>) -> Result<QuerierSubscriptions, CoordError> {
		let peers = self.subscribe_one(pubsub, EVENT_PEER_UPDATE).await?;
		let tunnels = self.subscribe_one(pubsub, EVENT_TUNNEL_UPDATE).await?;
		let handshakes = self.subscribe_one(pubsub, EVENT_READY_FOR_HANDSHAKE).await?;
		debug!("querier subscribed");
		Ok(QuerierSubscriptions {
			peers,
			tunnels,
			handshakes,
		})
	}

	async fn subscribe_one(&self, pubsub: &Arc<dyn Pubsub>, event: &'static str) -> Result<Subscription, CoordError> {
		retry(&self.cancel, &self.backoff, event, || {
			let pubsub = Arc::clone(pubsub);
			async move { pubsub.subscribe(event).await }
		})
		.await
	}

	pub fn start(
		self: &Arc<Self>,
		subscriptions: QuerierSubscriptions,
		heartbeat_events: mpsc::UnboundedReceiver<HeartbeatEvent>,
		workers: usize,
	) -> Vec<JoinHandle<()>> {
		let QuerierSubscriptions {
			peers,
			tunnels,
			handshakes,
		} = subscriptions;
		let mut handles = vec![
			tokio::spawn(Arc::clone(self).listen_peers(peers)),
			tokio::spawn(Arc::clone(self).listen_tunnels(tunnels)),
			tokio::spawn(Arc::clone(self).listen_handshakes(handshakes)),
			tokio::spawn(Arc::clone(self).handle_heartbeat_events(heartbeat_events)),
		];
		for _ in 0..workers {
			handles.push(tokio::spawn(Arc::clone(self).worker()));
		}
		handles
	}

	/// Register a connection's mapper. Returns false while unhealthy. A
	/// previous connection for the same peer is closed as overwritten.
	pub fn new_conn(&self, handle: MapperHandle) -> bool {
		let peer = handle.conn.peer();
		let replaced = {
			let mut state = self.state.lock();
			if !state.healthy {
				return false;
			}
			let conn = Arc::clone(&handle.conn);
			let replaced = state.mappers.insert(peer, handle);
			if let Some(old) = &replaced {
				old.conn.mark_overwritten();
				conn.set_overwrites(old.conn.overwrites() + 1);
			}
			replaced
		};

		if let Some(old) = replaced {
			info!(
				coordinator_id = %self.coordinator_id,
				peer_id = %peer,
				old_name = old.conn.name(),
				"peer connection overwritten"
			);
			old.conn.close(CLOSE_PEER_OVERWRITTEN);
		}
		self.queue.enqueue(QueryKey::Mapping(peer));
		true
	}

	/// Drop the mapper of `conn`, unless a newer connection has replaced it.
	pub fn cleanup_conn(&self, conn: &Arc<ConnIo>) {
		let mut state = self.state.lock();
		let current = state
			.mappers
			.get(&conn.peer())
			.is_some_and(|handle| Arc::ptr_eq(&handle.conn, conn));
		if current {
			state.mappers.remove(&conn.peer());
		}
	}

	pub fn is_healthy(&self) -> bool {
		self.state.lock().healthy
	}

	pub fn connections(&self) -> Vec<Arc<ConnIo>> {
		let state = self.state.lock();
		let mut conns: Vec<_> = state.mappers.values().map(|h| Arc::clone(&h.conn)).collect();
		conns.sort_by_key(|c| c.peer());
		conns
	}

	pub fn close_all(&self, reason: &str) {
		for conn in self.connections() {
			conn.close(reason);
		}
	}

	fn mapper(&self, peer: &PeerId) -> Option<MapperHandle> {
		self.state.lock().mappers.get(peer).cloned()
	}

	fn enqueue_if_local(&self, peer: PeerId) {
		if self.state.lock().mappers.contains_key(&peer) {
			self.queue.enqueue(QueryKey::Mapping(peer));
		}
	}

	fn resync_all(&self) {
		let peers: Vec<PeerId> = self.state.lock().mappers.keys().copied().collect();
		info!(coordinator_id = %self.coordinator_id, peers = peers.len(), "resyncing all mappings");
		for peer in peers {
			self.queue.enqueue(QueryKey::Mapping(peer));
		}
	}

	async fn next(&self, subscription: &mut Subscription) -> Option<Result<Vec<u8>, PubsubError>> {
		tokio::select! {
			_ = self.cancel.cancelled() => None,
			message = subscription.recv() => message,
		}
	}

	async fn listen_peers(self: Arc<Self>, mut subscription: Subscription) {
		while let Some(message) = self.next(&mut subscription).await {
			match message {
				Ok(payload) => {
					let peer = std::str::from_utf8(&payload)
						.ok()
						.and_then(|s| s.trim().parse::<PeerId>().ok());
					match peer {
						Some(peer) => self.queue.enqueue(QueryKey::PeerUpdate(peer)),
						None => error!(
							payload = %String::from_utf8_lossy(&payload),
							"unable to parse peer update"
						),
					}
				}
				Err(PubsubError::DroppedMessages) => {
					warn!(coordinator_id = %self.coordinator_id, "peer update notifications dropped");
					self.resync_all();
				}
				Err(e) => warn!(error = %e, "peer update subscription error"),
			}
		}
		debug!(coordinator_id = %self.coordinator_id, "peer update listener stopped");
	}

	async fn listen_tunnels(self: Arc<Self>, mut subscription: Subscription) {
		while let Some(message) = self.next(&mut subscription).await {
			match message {
				Ok(payload) => match parse_peer_pair(&payload) {
					Some((src, dst)) => {
						self.enqueue_if_local(src);
						self.enqueue_if_local(dst);
					}
					None => error!(
						payload = %String::from_utf8_lossy(&payload),
						"unable to parse tunnel update"
					),
				},
				Err(PubsubError::DroppedMessages) => {
					warn!(coordinator_id = %self.coordinator_id, "tunnel update notifications dropped");
					self.resync_all();
				}
				Err(e) => warn!(error = %e, "tunnel update subscription error"),
			}
		}
		debug!(coordinator_id = %self.coordinator_id, "tunnel update listener stopped");
	}

	async fn listen_handshakes(self: Arc<Self>, mut subscription: Subscription) {
		while let Some(message) = self.next(&mut subscription).await {
			let payload = match message {
				Ok(payload) => payload,
				Err(e) => {
					warn!(error = %e, "ready for handshake subscription error");
					continue;
				}
			};
			let Some((dst, src)) = parse_peer_pair(&payload) else {
				error!(
					payload = %String::from_utf8_lossy(&payload),
					"unable to parse ready for handshake"
				);
				continue;
			};
			let Some(handle) = self.mapper(&dst) else {
				continue;
			};
			let response = CoordinateResponse::updates(vec![PeerUpdate {
				id: src,
				node: None,
				kind: UpdateKind::ReadyForHandshake,
				reason: REASON_READY_FOR_HANDSHAKE.to_string(),
			}]);
			if let Err(e) = handle.conn.enqueue(response) {
				warn!(peer_id = %dst, src_id = %src, error = %e, "failed to enqueue ready for handshake");
			}
		}
	}

	async fn handle_heartbeat_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<HeartbeatEvent>) {
		loop {
			let event = tokio::select! {
				_ = self.cancel.cancelled() => return,
				event = events.recv() => event,
			};
			let Some(event) = event else {
				return;
			};
			match event {
				HeartbeatEvent::FilterChanged => {
					let handles: Vec<MapperHandle> = self.state.lock().mappers.values().cloned().collect();
					for handle in handles {
						handle.trigger_update();
					}
				}
				HeartbeatEvent::Health(Health::Unhealthy) => {
					self.state.lock().healthy = false;
					warn!(coordinator_id = %self.coordinator_id, "unhealthy, disconnecting all peers");
					self.close_all(CLOSE_COORDINATOR_UNHEALTHY);
				}
				HeartbeatEvent::Health(Health::Healthy) => {
					self.state.lock().healthy = true;
					info!(coordinator_id = %self.coordinator_id, "healthy, accepting peers");
				}
			}
		}
	}

	async fn worker(self: Arc<Self>) {
		while let Ok(key) = self.queue.acquire().await {
			match key {
				QueryKey::Mapping(peer) => self.query_mapping(peer).await,
				QueryKey::PeerUpdate(peer) => self.query_peer_update(peer).await,
			}
			self.queue.done(&key);
		}
	}

	#[instrument(skip(self), fields(coordinator_id = %self.coordinator_id, peer_id = %peer))]
	async fn query_mapping(&self, peer: PeerId) {
		let Some(handle) = self.mapper(&peer) else {
			return;
		};
		let store = Arc::clone(&self.store);
		let id = *peer.as_uuid();
		let rows = retry(&self.cancel, &self.backoff, "get tunnel peer bindings", || {
			let store = Arc::clone(&store);
			async move { store.get_tunnel_peer_bindings(id).await }
		})
		.await;

		let rows = match rows {
			Ok(rows) => rows,
			Err(CoordError::Cancelled) => return,
			Err(e) => {
				error!(error = %e, "failed to query mappings");
				return;
			}
		};
		let mappings = rows_to_mappings(rows);
		debug!(count = mappings.len(), "queried mappings");
		handle.send_mappings(mappings).await;
	}

	#[instrument(skip(self), fields(coordinator_id = %self.coordinator_id, peer_id = %peer))]
	async fn query_peer_update(&self, peer: PeerId) {
		let store = Arc::clone(&self.store);
		let id = *peer.as_uuid();
		let partners = retry(&self.cancel, &self.backoff, "get tunnel peer ids", || {
			let store = Arc::clone(&store);
			async move { store.get_tunnel_peer_ids(id).await }
		})
		.await;

		match partners {
			Ok(partners) => {
				for partner in partners {
					self.enqueue_if_local(PeerId::from_uuid(partner));
				}
			}
			Err(CoordError::Cancelled) => {}
			Err(e) => error!(error = %e, "failed to query tunnel peers"),
		}
	}
}
