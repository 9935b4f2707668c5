// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The coordinator façade: one per replica.

use crate::auth::CoordinateeAuth;
use crate::binder::Binder;
use crate::config::CoordinatorConfig;
use crate::connio::{ConnIo, ConnSinks};
use crate::error::{CoordError, Result};
use crate::handshaker::Handshaker;
use crate::heartbeats::Heartbeats;
use crate::mapper::Mapper;
use crate::mapping::{rows_to_mappings, MappingKind};
use crate::pubsub::Pubsub;
use crate::querier::Querier;
use crate::tunneler::Tunneler;
use chrono::{DateTime, Utc};
use loom_server_db::TailnetStore;
use loom_wgtunnel_common::{
	CoordinateRequest, CoordinateResponse, CoordinatorId, Node, PeerId, CLOSE_COORDINATOR_CLOSED,
	CLOSE_COORDINATOR_UNHEALTHY,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone, Serialize)]
pub struct ConnDebug {
	pub id: PeerId,
	pub name: String,
	pub start: DateTime<Utc>,
	pub last_write: Option<DateTime<Utc>>,
	pub overwrites: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaDebug {
	pub id: CoordinatorId,
	pub last_heartbeat_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
	pub coordinator_id: CoordinatorId,
	pub healthy: bool,
	pub connections: Vec<ConnDebug>,
	pub coordinators: Vec<ReplicaDebug>,
}

pub struct Coordinator {
	id: CoordinatorId,
	config: CoordinatorConfig,
	store: Arc<dyn TailnetStore>,
	cancel: CancellationToken,
	heartbeats: Arc<Heartbeats>,
	querier: Arc<Querier>,
	sinks: ConnSinks,
	send_beats: Mutex<Option<JoinHandle<()>>>,
	closed: AtomicBool,
}

impl Coordinator {
	/// Start a replica. Returns once the replica is subscribed to every
	/// notification it needs and may accept connections.
	#[instrument(skip_all)]
	pub async fn new(
		store: Arc<dyn TailnetStore>,
		pubsub: Arc<dyn Pubsub>,
		config: CoordinatorConfig,
	) -> Result<Self> {
		config.validate()?;
		let id = CoordinatorId::new();
		let cancel = CancellationToken::new();
		let backoff = config.backoff();

		let (hb_events_tx, hb_events_rx) = mpsc::unbounded_channel();
		let heartbeats = Heartbeats::new(
			id,
			Arc::clone(&store),
			Arc::clone(&pubsub),
			&config,
			cancel.clone(),
			hb_events_tx,
		);
		let querier = Querier::new(id, Arc::clone(&store), backoff.clone(), cancel.clone());

		let started = async {
			let tasks = heartbeats.start().await?;
			let subscriptions = querier.subscribe(&pubsub).await?;
			Ok::<_, CoordError>((tasks, subscriptions))
		}
		.await;
		let (tasks, subscriptions) = match started {
			Ok(started) => started,
			Err(e) => {
				cancel.cancel();
				return Err(e);
			}
		};
		querier.start(subscriptions, hb_events_rx, config.querier_workers);

		let (bindings_tx, bindings_rx) = mpsc::unbounded_channel();
		let (tunnels_tx, tunnels_rx) = mpsc::unbounded_channel();
		let (handshakes_tx, handshakes_rx) = mpsc::unbounded_channel();

		Binder::new(id, Arc::clone(&store), Arc::clone(&pubsub), backoff.clone(), cancel.clone()).start(
			bindings_rx,
			Arc::clone(&heartbeats),
			config.binder_workers,
		);
		Tunneler::new(id, Arc::clone(&store), Arc::clone(&pubsub), backoff.clone(), cancel.clone())
			.start(tunnels_rx, Arc::clone(&heartbeats), config.tunneler_workers);
		Handshaker::new(id, Arc::clone(&store), Arc::clone(&pubsub), backoff, cancel.clone()).start(
			handshakes_rx,
			Arc::clone(&heartbeats),
			config.handshaker_workers,
		);

		info!(coordinator_id = %id, "coordinator started");
		Ok(Self {
			id,
			config,
			store,
			cancel,
			heartbeats,
			querier,
			sinks: ConnSinks {
				bindings: bindings_tx,
				tunnels: tunnels_tx,
				handshakes: handshakes_tx,
			},
			send_beats: Mutex::new(Some(tasks.send_beats)),
			closed: AtomicBool::new(false),
		})
	}

	pub fn id(&self) -> CoordinatorId {
		self.id
	}

	/// Open a coordination session for `id`. Requests go into the returned
	/// sender; responses arrive on the receiver, which ends when the
	/// coordinator closes the session. Dropping the sender without a
	/// `disconnect` request is treated as a lost connection.
	pub fn coordinate(
		&self,
		id: PeerId,
		name: impl Into<String>,
		auth: Arc<dyn CoordinateeAuth>,
	) -> (mpsc::Sender<CoordinateRequest>, mpsc::Receiver<CoordinateResponse>) {
		let (req_tx, req_rx) = mpsc::channel(self.config.request_buffer);
		let (resp_tx, resp_rx) = mpsc::channel(self.config.response_buffer);
		let conn = ConnIo::new(
			self.id,
			id,
			name,
			auth,
			self.sinks.clone(),
			resp_tx,
			self.cancel.child_token(),
		);

		if self.cancel.is_cancelled() {
			conn.close(CLOSE_COORDINATOR_CLOSED);
			return (req_tx, resp_rx);
		}

		let querier = Arc::clone(&self.querier);
		let heartbeats = Arc::clone(&self.heartbeats);
		tokio::spawn(async move {
			let (mapper, handle) = Mapper::new(Arc::clone(&conn), heartbeats);
			if !querier.new_conn(handle) {
				debug!(peer_id = %conn.peer(), "refusing connection while unhealthy");
				conn.close(CLOSE_COORDINATOR_UNHEALTHY);
				return;
			}
			let mapper_task = tokio::spawn(mapper.run());

			conn.run(req_rx).await;

			querier.cleanup_conn(&conn);
			conn.shutdown();
			if let Err(e) = mapper_task.await {
				error!(peer_id = %conn.peer(), error = %e, "mapper task failed");
			}
		});

		(req_tx, resp_rx)
	}

	/// The freshest node any live replica holds for `id`.
	#[instrument(skip(self), fields(coordinator_id = %self.id, peer_id = %id))]
	pub async fn node(&self, id: PeerId) -> Result<Option<Node>> {
		let rows = self.store.get_peers(*id.as_uuid()).await?;
		let mappings = self.heartbeats.filter(rows_to_mappings(rows));
		Ok(mappings
			.into_iter()
			.filter(|m| m.kind == MappingKind::Node)
			.max_by_key(|m| m.updated_at)
			.map(|m| m.node))
	}

	pub fn debug_snapshot(&self) -> DebugSnapshot {
		DebugSnapshot {
			coordinator_id: self.id,
			healthy: self.querier.is_healthy(),
			connections: self
				.querier
				.connections()
				.iter()
				.map(|conn| ConnDebug {
					id: conn.peer(),
					name: conn.name().to_string(),
					start: conn.start(),
					last_write: conn.last_write(),
					overwrites: conn.overwrites(),
				})
				.collect(),
			coordinators: self
				.heartbeats
				.live_coordinators()
				.into_iter()
				.map(|(id, since)| ReplicaDebug {
					id,
					last_heartbeat_ms: since.as_millis() as u64,
				})
				.collect(),
		}
	}

	/// Disconnect every local peer, stop all background work and remove this
	/// replica's heartbeat row. Safe to call more than once.
	#[instrument(skip(self), fields(coordinator_id = %self.id))]
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		info!("closing coordinator");
		self.querier.close_all(CLOSE_COORDINATOR_CLOSED);
		self.cancel.cancel();

		let send_beats = self.send_beats.lock().take();
		if let Some(handle) = send_beats {
			if let Err(e) = handle.await {
				error!(error = %e, "heartbeat task failed");
			}
		}
	}
}

impl Drop for Coordinator {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}
