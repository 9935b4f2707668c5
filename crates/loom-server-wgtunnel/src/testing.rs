// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Test helpers: a store wrapper with fault injection and a fast config.

use crate::config::CoordinatorConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loom_server_db::testing::create_tailnet_test_pool;
use loom_server_db::{DbError, PeerStatus, TailnetPeer, TailnetRepository, TailnetStore, TailnetTunnel};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Short periods so liveness and retry paths run within a test's timeout.
pub fn test_config() -> CoordinatorConfig {
	CoordinatorConfig {
		heartbeat_period: Duration::from_millis(50),
		missed_heartbeats: 3,
		unhealthy_after_failures: 3,
		cleanup_period: Duration::from_secs(60 * 60),
		retention: Duration::from_secs(24 * 60 * 60),
		querier_workers: 2,
		binder_workers: 2,
		tunneler_workers: 2,
		handshaker_workers: 1,
		max_backoff: Duration::from_millis(50),
		request_buffer: 64,
		response_buffer: 64,
	}
}

/// [`TailnetRepository`] over an in-memory database, with switches that make
/// selected operations fail transiently and counters for selected queries.
pub struct FaultStore {
	inner: TailnetRepository,
	fail_heartbeats: AtomicBool,
	fail_peer_writes: AtomicBool,
	peer_writes: AtomicUsize,
	binding_queries: AtomicUsize,
}

impl FaultStore {
	pub fn new(inner: TailnetRepository) -> Arc<Self> {
		Arc::new(Self {
			inner,
			fail_heartbeats: AtomicBool::new(false),
			fail_peer_writes: AtomicBool::new(false),
			peer_writes: AtomicUsize::new(0),
			binding_queries: AtomicUsize::new(0),
		})
	}

	pub async fn new_in_memory() -> Arc<Self> {
		Self::new(TailnetRepository::new(create_tailnet_test_pool().await))
	}

	pub fn inner(&self) -> &TailnetRepository {
		&self.inner
	}

	/// Make heartbeat upserts fail until switched off again.
	pub fn set_fail_heartbeats(&self, fail: bool) {
		self.fail_heartbeats.store(fail, Ordering::SeqCst);
	}

	/// Make binding upserts and deletes fail until switched off again.
	pub fn set_fail_peer_writes(&self, fail: bool) {
		self.fail_peer_writes.store(fail, Ordering::SeqCst);
	}

	/// Successful binding upserts so far.
	pub fn peer_writes(&self) -> usize {
		self.peer_writes.load(Ordering::SeqCst)
	}

	/// Mapping queries issued so far.
	pub fn binding_queries(&self) -> usize {
		self.binding_queries.load(Ordering::SeqCst)
	}

	fn injected(what: &str) -> DbError {
		DbError::Conflict(format!("injected {what} failure"))
	}
}

#[async_trait]
impl TailnetStore for FaultStore {
	async fn upsert_peer(
		&self,
		id: Uuid,
		coordinator_id: Uuid,
		node: &[u8],
		status: PeerStatus,
	) -> Result<(), DbError> {
		if self.fail_peer_writes.load(Ordering::SeqCst) {
			return Err(Self::injected("peer write"));
		}
		self.inner.upsert_peer(id, coordinator_id, node, status).await?;
		self.peer_writes.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn delete_peer(&self, id: Uuid, coordinator_id: Uuid) -> Result<(), DbError> {
		if self.fail_peer_writes.load(Ordering::SeqCst) {
			return Err(Self::injected("peer delete"));
		}
		self.inner.delete_peer(id, coordinator_id).await
	}

	async fn get_peers(&self, id: Uuid) -> Result<Vec<TailnetPeer>, DbError> {
		self.inner.get_peers(id).await
	}

	async fn upsert_tunnel(
		&self,
		coordinator_id: Uuid,
		src_id: Uuid,
		dst_id: Uuid,
	) -> Result<(), DbError> {
		self.inner.upsert_tunnel(coordinator_id, src_id, dst_id).await
	}

	async fn delete_tunnel(
		&self,
		coordinator_id: Uuid,
		src_id: Uuid,
		dst_id: Uuid,
	) -> Result<(), DbError> {
		self.inner.delete_tunnel(coordinator_id, src_id, dst_id).await
	}

	async fn delete_all_tunnels(
		&self,
		coordinator_id: Uuid,
		src_id: Uuid,
	) -> Result<Vec<Uuid>, DbError> {
		self.inner.delete_all_tunnels(coordinator_id, src_id).await
	}

	async fn list_tunnels_by_src(&self, src_id: Uuid) -> Result<Vec<TailnetTunnel>, DbError> {
		self.inner.list_tunnels_by_src(src_id).await
	}

	async fn get_tunnel_peer_ids(&self, id: Uuid) -> Result<Vec<Uuid>, DbError> {
		self.inner.get_tunnel_peer_ids(id).await
	}

	async fn get_tunnel_peer_bindings(&self, id: Uuid) -> Result<Vec<TailnetPeer>, DbError> {
		self.binding_queries.fetch_add(1, Ordering::SeqCst);
		self.inner.get_tunnel_peer_bindings(id).await
	}

	async fn upsert_coordinator(&self, id: Uuid) -> Result<(), DbError> {
		if self.fail_heartbeats.load(Ordering::SeqCst) {
			return Err(Self::injected("heartbeat"));
		}
		self.inner.upsert_coordinator(id).await
	}

	async fn delete_coordinator(&self, id: Uuid) -> Result<(), DbError> {
		self.inner.delete_coordinator(id).await
	}

	async fn clean_coordinators(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
		self.inner.clean_coordinators(cutoff).await
	}

	async fn clean_lost_peers(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
		self.inner.clean_lost_peers(cutoff).await
	}

	async fn clean_tunnels(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
		self.inner.clean_tunnels(cutoff).await
	}
}
