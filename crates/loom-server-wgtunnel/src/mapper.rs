// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-connection mapping state.
//!
//! A mapper holds the latest raw mappings for its peer, picks one winner per
//! remote peer and sends only what changed since the last successful send.

use crate::connio::ConnIo;
use crate::heartbeats::Heartbeats;
use crate::mapping::{Mapping, MappingKind};
use loom_wgtunnel_common::{CoordinateResponse, PeerId, PeerUpdate, UpdateKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

pub const REASON_NEW: &str = "new";
pub const REASON_FOUND: &str = "found";
pub const REASON_LOST: &str = "lost";
pub const REASON_UPDATE: &str = "update";
pub const REASON_DISCONNECTED: &str = "disconnected";

/// Pick one mapping per remote peer. An entry only replaces the current pick
/// when it is a `Node`: any `Node` beats a `Lost`, and between two `Node`
/// entries the most recent wins.
pub fn best_mappings(mappings: Vec<Mapping>) -> BTreeMap<PeerId, Mapping> {
	let mut best: BTreeMap<PeerId, Mapping> = BTreeMap::new();
	for mapping in mappings {
		let replace = match best.get(&mapping.peer) {
			None => true,
			Some(current) => match (current.kind, mapping.kind) {
				(MappingKind::Lost, MappingKind::Node) => true,
				(_, MappingKind::Lost) => false,
				(MappingKind::Node, MappingKind::Node) => mapping.updated_at > current.updated_at,
			},
		};
		if replace {
			best.insert(mapping.peer, mapping);
		}
	}
	best
}

fn peer_update(mapping: &Mapping, reason: &str) -> PeerUpdate {
	PeerUpdate {
		id: mapping.peer,
		node: Some(mapping.node.clone()),
		kind: mapping.kind.update_kind(),
		reason: reason.to_string(),
	}
}

/// Compare `best` against what the peer was last told. Returns the updates to
/// send and the state to remember once they have been delivered.
pub fn best_to_update(
	sent: &BTreeMap<PeerId, Mapping>,
	best: &BTreeMap<PeerId, Mapping>,
) -> (Vec<PeerUpdate>, BTreeMap<PeerId, Mapping>) {
	let mut updates = Vec::new();
	let mut next = BTreeMap::new();

	for (peer, mapping) in best {
		let reason = match (sent.get(peer), mapping.kind) {
			// Never told about it, so there is nothing to retract.
			(None, MappingKind::Lost) => continue,
			(None, MappingKind::Node) => Some(REASON_NEW),
			(Some(prev), MappingKind::Node) if prev.kind == MappingKind::Lost => Some(REASON_FOUND),
			(Some(prev), MappingKind::Node) if prev.node == mapping.node => None,
			(Some(_), MappingKind::Node) => Some(REASON_UPDATE),
			(Some(prev), MappingKind::Lost) if prev.kind == MappingKind::Node => Some(REASON_LOST),
			(Some(_), MappingKind::Lost) => None,
		};
		if let Some(reason) = reason {
			updates.push(peer_update(mapping, reason));
		}
		next.insert(*peer, mapping.clone());
	}

	for peer in sent.keys() {
		if !best.contains_key(peer) {
			updates.push(PeerUpdate {
				id: *peer,
				node: None,
				kind: UpdateKind::Disconnected,
				reason: REASON_DISCONNECTED.to_string(),
			});
		}
	}

	(updates, next)
}

/// Querier-side handle to a running mapper.
#[derive(Clone)]
pub struct MapperHandle {
	pub conn: Arc<ConnIo>,
	mappings: mpsc::Sender<Vec<Mapping>>,
	update: mpsc::Sender<()>,
}

impl MapperHandle {
	/// Hand over a fresh snapshot, waiting for the mapper to take it unless
	/// the connection goes away first.
	pub async fn send_mappings(&self, mappings: Vec<Mapping>) {
		tokio::select! {
			_ = self.conn.cancel_token().cancelled() => {}
			result = self.mappings.send(mappings) => {
				if result.is_err() {
					debug!(peer_id = %self.conn.peer(), "mapper gone, dropping mappings");
				}
			}
		}
	}

	/// Ask the mapper to recompute from its latest snapshot. A trigger that is
	/// already pending covers this one.
	pub fn trigger_update(&self) {
		let _ = self.update.try_send(());
	}
}

pub struct Mapper {
	conn: Arc<ConnIo>,
	heartbeats: Arc<Heartbeats>,
	mappings: mpsc::Receiver<Vec<Mapping>>,
	update: mpsc::Receiver<()>,
	latest: Vec<Mapping>,
	sent: BTreeMap<PeerId, Mapping>,
}

impl Mapper {
	pub fn new(conn: Arc<ConnIo>, heartbeats: Arc<Heartbeats>) -> (Self, MapperHandle) {
		let (mappings_tx, mappings) = mpsc::channel(1);
		let (update_tx, update) = mpsc::channel(1);
		let handle = MapperHandle {
			conn: Arc::clone(&conn),
			mappings: mappings_tx,
			update: update_tx,
		};
		let mapper = Self {
			conn,
			heartbeats,
			mappings,
			update,
			latest: Vec::new(),
			sent: BTreeMap::new(),
		};
		(mapper, handle)
	}

	#[instrument(skip(self), fields(peer_id = %self.conn.peer()))]
	pub async fn run(mut self) {
		let cancel = self.conn.cancel_token().clone();
		loop {
			tokio::select! {
				_ = cancel.cancelled() => return,
				mappings = self.mappings.recv() => match mappings {
					Some(mappings) => self.latest = mappings,
					None => return,
				},
				update = self.update.recv() => {
					if update.is_none() {
						return;
					}
				}
			}
			self.send_updates();
		}
	}

	fn send_updates(&mut self) {
		let best = best_mappings(self.heartbeats.filter(self.latest.clone()));
		let (updates, next) = best_to_update(&self.sent, &best);
		if updates.is_empty() {
			debug!("no mapping changes to send");
			return;
		}

		let count = updates.len();
		match self.conn.enqueue(CoordinateResponse::updates(updates)) {
			Ok(()) => {
				debug!(count, "sent peer updates");
				self.sent = next;
			}
			// The next snapshot or trigger recomputes from current state.
			Err(e) => warn!(error = %e, count, "failed to enqueue peer updates"),
		}
	}
}
