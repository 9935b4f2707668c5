// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Write-behind persistence of tunnels.
//!
//! Each `(src, dst)` pair is written independently with latest-wins
//! semantics. Removing every tunnel of a source is its own unit of work;
//! pairs re-added while it runs are written again afterwards.

use crate::error::CoordError;
use crate::heartbeats::Heartbeats;
use crate::pubsub::{Pubsub, EVENT_TUNNEL_UPDATE};
use crate::retry::{retry, Backoff};
use crate::workqueue::WorkQueue;
use loom_server_db::{DbError, TailnetStore};
use loom_wgtunnel_common::{CoordinatorId, PeerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelUpdate {
	Add(PeerId),
	Remove(PeerId),
	RemoveAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelRequest {
	pub src: PeerId,
	pub update: TunnelUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TunnelKey {
	Pair(PeerId, PeerId),
	All(PeerId),
}

/// Encode a tunnel notification payload.
pub fn tunnel_payload(src: &PeerId, dst: &PeerId) -> String {
	format!("{src},{dst}")
}

/// Decode a `"a,b"` peer pair payload.
pub fn parse_peer_pair(payload: &[u8]) -> Option<(PeerId, PeerId)> {
	let text = std::str::from_utf8(payload).ok()?;
	let (a, b) = text.split_once(',')?;
	Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

pub struct Tunneler {
	coordinator_id: CoordinatorId,
	store: Arc<dyn TailnetStore>,
	pubsub: Arc<dyn Pubsub>,
	cancel: CancellationToken,
	backoff: Backoff,
	/// src -> dst -> whether the tunnel should exist.
	latest: Mutex<HashMap<PeerId, HashMap<PeerId, bool>>>,
	queue: WorkQueue<TunnelKey>,
}

impl Tunneler {
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

	pub fn start(
		self: &Arc<Self>,
		input: mpsc::UnboundedReceiver<TunnelRequest>,
		heartbeats: Arc<Heartbeats>,
		workers: usize,
	) -> Vec<JoinHandle<()>> {
		let mut handles = vec![tokio::spawn(Arc::clone(self).handle_input(input))];
		for _ in 0..workers {
			handles.push(tokio::spawn(Arc::clone(self).worker(Arc::clone(&heartbeats))));
		}
		handles
	}

	async fn handle_input(self: Arc<Self>, mut input: mpsc::UnboundedReceiver<TunnelRequest>) {
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => return,
				received = input.recv() => match received {
					Some(request) => self.store_update(request),
					None => return,
				},
			}
		}
	}

	pub(crate) fn store_update(&self, request: TunnelRequest) {
		let TunnelRequest { src, update } = request;
		let key = {
			let mut latest = self.latest.lock();
			match update {
				TunnelUpdate::Add(dst) => {
					latest.entry(src).or_default().insert(dst, true);
					TunnelKey::Pair(src, dst)
				}
				TunnelUpdate::Remove(dst) => {
					latest.entry(src).or_default().insert(dst, false);
					TunnelKey::Pair(src, dst)
				}
				TunnelUpdate::RemoveAll => {
					latest.remove(&src);
					TunnelKey::All(src)
				}
			}
		};
		self.queue.enqueue(key);
	}

	async fn worker(self: Arc<Self>, heartbeats: Arc<Heartbeats>) {
		if heartbeats.wait_first_beat().await.is_err() {
			return;
		}
		while let Ok(key) = self.queue.acquire().await {
			match key {
				TunnelKey::Pair(src, dst) => self.write_tunnel(src, dst).await,
				TunnelKey::All(src) => self.remove_all(src).await,
			}
			self.queue.done(&key);
		}
	}

	fn wanted(&self, src: &PeerId, dst: &PeerId) -> bool {
		self
			.latest
			.lock()
			.get(src)
			.and_then(|dsts| dsts.get(dst))
			.copied()
			.unwrap_or(false)
	}

	#[instrument(skip(self), fields(coordinator_id = %self.coordinator_id, src_id = %src, dst_id = %dst))]
	async fn write_tunnel(&self, src: PeerId, dst: PeerId) {
		let coordinator_id = *self.coordinator_id.as_uuid();
		let written = retry(&self.cancel, &self.backoff, "write tunnel", || {
			let wanted = self.wanted(&src, &dst);
			let store = Arc::clone(&self.store);
			async move {
				if wanted {
					store
						.upsert_tunnel(coordinator_id, *src.as_uuid(), *dst.as_uuid())
						.await?;
				} else {
					match store
						.delete_tunnel(coordinator_id, *src.as_uuid(), *dst.as_uuid())
						.await
					{
						Ok(()) => {}
						Err(e) if e.is_not_found() => {}
						Err(e) => return Err(e),
					}
				}
				Ok::<_, DbError>(wanted)
			}
		})
		.await;

		let wanted = match written {
			Ok(wanted) => wanted,
			Err(CoordError::Cancelled) => return,
			Err(e) => {
				error!(error = %e, "failed to write tunnel");
				return;
			}
		};
		debug!(wanted, "wrote tunnel");
		self.publish(&src, &dst).await;

		if !wanted {
			let mut latest = self.latest.lock();
			if let Some(dsts) = latest.get_mut(&src) {
				if dsts.get(&dst) == Some(&false) {
					dsts.remove(&dst);
				}
				if dsts.is_empty() {
					latest.remove(&src);
				}
			}
		}
	}

	#[instrument(skip(self), fields(coordinator_id = %self.coordinator_id, src_id = %src))]
	async fn remove_all(&self, src: PeerId) {
		let coordinator_id = *self.coordinator_id.as_uuid();
		let store = Arc::clone(&self.store);
		let removed = retry(&self.cancel, &self.backoff, "delete all tunnels", || {
			let store = Arc::clone(&store);
			async move { store.delete_all_tunnels(coordinator_id, *src.as_uuid()).await }
		})
		.await;

		let removed = match removed {
			Ok(removed) => removed,
			Err(CoordError::Cancelled) => return,
			Err(e) => {
				error!(error = %e, "failed to delete tunnels");
				return;
			}
		};
		debug!(removed = removed.len(), "deleted all tunnels");

		for dst in removed {
			self.publish(&src, &PeerId::from_uuid(dst)).await;
		}

		// Tunnels added after the removal was requested may have been wiped.
		let readd: Vec<PeerId> = self
			.latest
			.lock()
			.get(&src)
			.map(|dsts| {
				dsts
					.iter()
					.filter(|(_, wanted)| **wanted)
					.map(|(dst, _)| *dst)
					.collect()
			})
			.unwrap_or_default();
		for dst in readd {
			self.queue.enqueue(TunnelKey::Pair(src, dst));
		}
	}

	async fn publish(&self, src: &PeerId, dst: &PeerId) {
		let pubsub = Arc::clone(&self.pubsub);
		let payload = tunnel_payload(src, dst);
		let published = retry(&self.cancel, &self.backoff, "publish tunnel update", || {
			let pubsub = Arc::clone(&pubsub);
			let payload = payload.clone();
			async move { pubsub.publish(EVENT_TUNNEL_UPDATE, payload.as_bytes()).await }
		})
		.await;
		if let Err(e) = published {
			if !matches!(e, CoordError::Cancelled) {
				error!(src_id = %src, dst_id = %dst, error = %e, "failed to publish tunnel update");
			}
		}
	}
}
