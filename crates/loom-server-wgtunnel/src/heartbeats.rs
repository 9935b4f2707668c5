// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Replica liveness.
//!
//! Each replica upserts its own row every heartbeat period and announces it
//! on [`EVENT_HEARTBEAT`]. Announcements from other replicas keep them in the
//! live set; a replica silent for `missed_heartbeats` periods is evicted and
//! its mappings are reported as lost until it is heard from again.

use crate::config::CoordinatorConfig;
use crate::error::CoordError;
use crate::mapping::{Mapping, MappingKind};
use crate::pubsub::{Pubsub, Subscription, EVENT_HEARTBEAT};
use crate::retry::{retry, Backoff};
use chrono::Utc;
use loom_server_db::TailnetStore;
use loom_wgtunnel_common::CoordinatorId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
	Healthy,
	Unhealthy,
}

/// Signals from the heartbeat tracker to the querier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
	/// The live replica set changed; every mapper must recompute.
	FilterChanged,
	Health(Health),
}

pub struct HeartbeatTasks {
	/// Ends after this replica's row has been deleted.
	pub send_beats: JoinHandle<()>,
	pub background: Vec<JoinHandle<()>>,
}

pub struct Heartbeats {
	self_id: CoordinatorId,
	store: Arc<dyn TailnetStore>,
	pubsub: Arc<dyn Pubsub>,
	cancel: CancellationToken,
	backoff: Backoff,
	period: Duration,
	timeout: Duration,
	unhealthy_after: u32,
	cleanup_period: Duration,
	retention: Duration,
	events: mpsc::UnboundedSender<HeartbeatEvent>,
	coordinators: Mutex<HashMap<CoordinatorId, Instant>>,
	expiry_reset: Notify,
	first_beat: watch::Sender<bool>,
	failures: AtomicU32,
}

impl Heartbeats {
	pub fn new(
		self_id: CoordinatorId,
		store: Arc<dyn TailnetStore>,
		pubsub: Arc<dyn Pubsub>,
		config: &CoordinatorConfig,
		cancel: CancellationToken,
		events: mpsc::UnboundedSender<HeartbeatEvent>,
	) -> Arc<Self> {
		let (first_beat, _) = watch::channel(false);
		Arc::new(Self {
			self_id,
			store,
			pubsub,
			cancel,
			backoff: config.backoff(),
			period: config.heartbeat_period,
			timeout: config.heartbeat_timeout(),
			unhealthy_after: config.unhealthy_after_failures,
			cleanup_period: config.cleanup_period,
			retention: config.retention,
			events,
			coordinators: Mutex::new(HashMap::new()),
			expiry_reset: Notify::new(),
			first_beat,
			failures: AtomicU32::new(0),
		})
	}

	/// Subscribe to announcements, then start beating, expiry checks and the
	/// cleanup sweep.
	#[instrument(skip(self), fields(coordinator_id = %self.self_id))]
	pub async fn start(self: &Arc<Self>) -> Result<HeartbeatTasks, CoordError> {
		let pubsub = Arc::clone(&self.pubsub);
		let subscription = retry(&self.cancel, &self.backoff, "subscribe heartbeats", || {
			let pubsub = Arc::clone(&pubsub);
			async move { pubsub.subscribe(EVENT_HEARTBEAT).await }
		})
		.await?;

		let background = vec![
			tokio::spawn(Arc::clone(self).listen(subscription)),
			tokio::spawn(Arc::clone(self).expiry_loop()),
			tokio::spawn(Arc::clone(self).cleanup_loop()),
		];
		let send_beats = tokio::spawn(Arc::clone(self).send_beats());

		Ok(HeartbeatTasks {
			send_beats,
			background,
		})
	}

	/// Resolves after the first heartbeat write attempt, successful or not.
	pub async fn wait_first_beat(&self) -> Result<(), CoordError> {
		let mut rx = self.first_beat.subscribe();
		let waited = async move { rx.wait_for(|sent| *sent).await.is_ok() };
		tokio::select! {
			ok = waited => if ok { Ok(()) } else { Err(CoordError::Cancelled) },
			_ = self.cancel.cancelled() => Err(CoordError::Cancelled),
		}
	}

	/// Reclassify mappings owned by replicas that are neither this one nor
	/// currently live as [`MappingKind::Lost`].
	pub fn filter(&self, mappings: Vec<Mapping>) -> Vec<Mapping> {
		let coordinators = self.coordinators.lock();
		mappings
			.into_iter()
			.map(|mut mapping| {
				if mapping.coordinator != self.self_id && !coordinators.contains_key(&mapping.coordinator) {
					mapping.kind = MappingKind::Lost;
				}
				mapping
			})
			.collect()
	}

	pub fn is_live(&self, id: &CoordinatorId) -> bool {
		*id == self.self_id || self.coordinators.lock().contains_key(id)
	}

	/// Live remote replicas and the time since each was last heard from.
	pub fn live_coordinators(&self) -> Vec<(CoordinatorId, Duration)> {
		let now = Instant::now();
		let mut live: Vec<_> = self
			.coordinators
			.lock()
			.iter()
			.map(|(id, last)| (*id, now.saturating_duration_since(*last)))
			.collect();
		live.sort_by_key(|(id, _)| *id);
		live
	}

	fn emit(&self, event: HeartbeatEvent) {
		if self.events.send(event).is_err() {
			debug!(?event, "heartbeat event receiver gone");
		}
	}

	async fn listen(self: Arc<Self>, mut subscription: Subscription) {
		loop {
			let message = tokio::select! {
				_ = self.cancel.cancelled() => return,
				message = subscription.recv() => message,
			};

			match message {
				None => {
					warn!(coordinator_id = %self.self_id, "heartbeat subscription closed");
					return;
				}
				Some(Err(e)) => {
					warn!(coordinator_id = %self.self_id, error = %e, "heartbeat notification error");
				}
				Some(Ok(payload)) => {
					let parsed = std::str::from_utf8(&payload)
						.ok()
						.and_then(|s| s.parse::<CoordinatorId>().ok());
					match parsed {
						Some(id) => self.recv_beat(id),
						None => error!(
							coordinator_id = %self.self_id,
							payload = %String::from_utf8_lossy(&payload),
							"unable to parse heartbeat"
						),
					}
				}
			}
		}
	}

	pub(crate) fn recv_beat(&self, id: CoordinatorId) {
		if id == self.self_id {
			return;
		}
		debug!(other_coordinator_id = %id, "got heartbeat");
		let is_new = self.coordinators.lock().insert(id, Instant::now()).is_none();
		if is_new {
			info!(other_coordinator_id = %id, "heartbeats (re)started");
			self.emit(HeartbeatEvent::FilterChanged);
		}
		self.expiry_reset.notify_one();
	}

	fn next_expiry(&self) -> Option<Instant> {
		self
			.coordinators
			.lock()
			.values()
			.min()
			.map(|oldest| *oldest + self.timeout)
	}

	async fn expiry_loop(self: Arc<Self>) {
		loop {
			let deadline = self.next_expiry();
			tokio::select! {
				_ = self.cancel.cancelled() => return,
				_ = self.expiry_reset.notified() => continue,
				_ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
					self.check_expiry();
				}
			}
		}
	}

	fn check_expiry(&self) {
		let now = Instant::now();
		let expired: Vec<(CoordinatorId, Duration)> = {
			let mut coordinators = self.coordinators.lock();
			let expired: Vec<_> = coordinators
				.iter()
				.map(|(id, last)| (*id, now.saturating_duration_since(*last)))
				.filter(|(_, since)| *since >= self.timeout)
				.collect();
			for (id, _) in &expired {
				coordinators.remove(id);
			}
			expired
		};

		for (id, since) in &expired {
			info!(
				other_coordinator_id = %id,
				last_heartbeat_ms = since.as_millis() as u64,
				"coordinator failed heartbeat check"
			);
		}
		if !expired.is_empty() {
			self.emit(HeartbeatEvent::FilterChanged);
		}
	}

	async fn send_beats(self: Arc<Self>) {
		self.send_beat().await;
		self.first_beat.send_replace(true);

		let mut ticker = tokio::time::interval(self.period);
		ticker.tick().await;
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				_ = ticker.tick() => self.send_beat().await,
			}
		}

		debug!(coordinator_id = %self.self_id, "ending heartbeats");
		self.send_delete().await;
	}

	async fn send_beat(&self) {
		let result = tokio::select! {
			result = self.store.upsert_coordinator(*self.self_id.as_uuid()) => result,
			_ = self.cancel.cancelled() => return,
		};

		match result {
			Err(e) => {
				let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
				error!(coordinator_id = %self.self_id, error = %e, failures, "failed to send heartbeat");
				if failures == self.unhealthy_after {
					error!(
						coordinator_id = %self.self_id,
						failures,
						"coordinator failed heartbeats and is unhealthy"
					);
					self.emit(HeartbeatEvent::Health(Health::Unhealthy));
				}
			}
			Ok(()) => {
				debug!(coordinator_id = %self.self_id, "sent heartbeat");
				let failures = self.failures.swap(0, Ordering::SeqCst);
				if failures >= self.unhealthy_after {
					info!(coordinator_id = %self.self_id, "coordinator sent heartbeat and is healthy");
					self.emit(HeartbeatEvent::Health(Health::Healthy));
				}
				let payload = self.self_id.to_string();
				if let Err(e) = self.pubsub.publish(EVENT_HEARTBEAT, payload.as_bytes()).await {
					warn!(coordinator_id = %self.self_id, error = %e, "failed to publish heartbeat");
				}
			}
		}
	}

	async fn send_delete(&self) {
		let delete = self.store.delete_coordinator(*self.self_id.as_uuid());
		match tokio::time::timeout(DELETE_TIMEOUT, delete).await {
			Ok(Ok(())) => debug!(coordinator_id = %self.self_id, "deleted coordinator"),
			Ok(Err(e)) => {
				error!(coordinator_id = %self.self_id, error = %e, "failed to delete coordinator")
			}
			Err(_) => error!(coordinator_id = %self.self_id, "timed out deleting coordinator"),
		}
	}

	async fn cleanup_loop(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(self.cleanup_period);
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => {
					debug!(coordinator_id = %self.self_id, "ending cleanup loop");
					return;
				}
				_ = ticker.tick() => self.cleanup().await,
			}
		}
	}

	/// Idempotent, so replicas do not coordinate who runs it. Failures are
	/// logged and left for the next sweep.
	async fn cleanup(&self) {
		let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::hours(24));
		let cutoff = Utc::now() - retention;

		match self.store.clean_coordinators(cutoff).await {
			Ok(n) => debug!(deleted = n, "cleaned up old coordinators"),
			Err(e) => error!(error = %e, "failed to clean up old coordinators"),
		}
		match self.store.clean_lost_peers(cutoff).await {
			Ok(n) => debug!(deleted = n, "cleaned up lost peers"),
			Err(e) => error!(error = %e, "failed to clean up lost peers"),
		}
		match self.store.clean_tunnels(cutoff).await {
			Ok(n) => debug!(deleted = n, "cleaned up abandoned tunnels"),
			Err(e) => error!(error = %e, "failed to clean up abandoned tunnels"),
		}
	}
}
