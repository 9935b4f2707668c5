// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tailnet coordination repository.
//!
//! Three tables back the coordinator:
//! - `tailnet_coordinators`: one heartbeat row per running replica
//! - `tailnet_peers`: peer bindings, written only by the owning replica
//! - `tailnet_tunnels`: directional tunnel intents, read symmetrically
//!
//! Peer and tunnel rows reference their replica and cascade when the replica
//! row is deleted.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePool;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DbError;

pub type PeerRowTuple = (String, String, String, Vec<u8>, String);

pub type TunnelRowTuple = (String, String, String, String);

const SCHEMA: &[&str] = &[
	r#"
	CREATE TABLE IF NOT EXISTS tailnet_coordinators (
		id TEXT PRIMARY KEY,
		heartbeat_at TEXT NOT NULL
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS tailnet_peers (
		id TEXT NOT NULL,
		coordinator_id TEXT NOT NULL REFERENCES tailnet_coordinators(id) ON DELETE CASCADE,
		updated_at TEXT NOT NULL,
		node BLOB NOT NULL,
		status TEXT NOT NULL CHECK (status IN ('ok', 'lost')),
		PRIMARY KEY (id, coordinator_id)
	)
	"#,
	"CREATE INDEX IF NOT EXISTS idx_tailnet_peers_coordinator ON tailnet_peers(coordinator_id)",
	r#"
	CREATE TABLE IF NOT EXISTS tailnet_tunnels (
		coordinator_id TEXT NOT NULL REFERENCES tailnet_coordinators(id) ON DELETE CASCADE,
		src_id TEXT NOT NULL,
		dst_id TEXT NOT NULL,
		updated_at TEXT NOT NULL,
		PRIMARY KEY (coordinator_id, src_id, dst_id)
	)
	"#,
	"CREATE INDEX IF NOT EXISTS idx_tailnet_tunnels_src ON tailnet_tunnels(src_id)",
	"CREATE INDEX IF NOT EXISTS idx_tailnet_tunnels_dst ON tailnet_tunnels(dst_id)",
];

/// Create the tailnet tables if they do not already exist.
#[tracing::instrument(skip(pool))]
pub async fn migrate_tailnet(pool: &SqlitePool) -> Result<(), DbError> {
	for statement in SCHEMA {
		sqlx::query(statement).execute(pool).await?;
	}
	tracing::debug!("tailnet schema ready");
	Ok(())
}

/// Fixed-width RFC 3339 so that stored timestamps compare correctly as text.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
	ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DbError> {
	DateTime::parse_from_rfc3339(s)
		.map(|dt| dt.with_timezone(&Utc))
		.or_else(|_| {
			chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
				.map(|ndt| ndt.and_utc())
				.map_err(|_| DbError::Internal(format!("invalid datetime: {s}")))
		})
}

fn parse_uuid(s: &str) -> Result<Uuid, DbError> {
	Uuid::parse_str(s).map_err(|_| DbError::Internal(format!("invalid uuid: {s}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
	Ok,
	Lost,
}

impl PeerStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Ok => "ok",
			Self::Lost => "lost",
		}
	}
}

impl fmt::Display for PeerStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for PeerStatus {
	type Err = DbError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ok" => Ok(Self::Ok),
			"lost" => Ok(Self::Lost),
			other => Err(DbError::Internal(format!("invalid peer status: {other}"))),
		}
	}
}

/// A peer binding row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailnetPeer {
	pub id: Uuid,
	pub coordinator_id: Uuid,
	pub updated_at: DateTime<Utc>,
	pub node: Vec<u8>,
	pub status: PeerStatus,
}

impl TryFrom<PeerRowTuple> for TailnetPeer {
	type Error = DbError;

	fn try_from(row: PeerRowTuple) -> Result<Self, Self::Error> {
		let (id, coordinator_id, updated_at, node, status) = row;
		Ok(Self {
			id: parse_uuid(&id)?,
			coordinator_id: parse_uuid(&coordinator_id)?,
			updated_at: parse_timestamp(&updated_at)?,
			node,
			status: status.parse()?,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailnetTunnel {
	pub coordinator_id: Uuid,
	pub src_id: Uuid,
	pub dst_id: Uuid,
	pub updated_at: DateTime<Utc>,
}

impl TryFrom<TunnelRowTuple> for TailnetTunnel {
	type Error = DbError;

	fn try_from(row: TunnelRowTuple) -> Result<Self, Self::Error> {
		let (coordinator_id, src_id, dst_id, updated_at) = row;
		Ok(Self {
			coordinator_id: parse_uuid(&coordinator_id)?,
			src_id: parse_uuid(&src_id)?,
			dst_id: parse_uuid(&dst_id)?,
			updated_at: parse_timestamp(&updated_at)?,
		})
	}
}

/// Repository for tailnet coordination database operations.
#[derive(Clone)]
pub struct TailnetRepository {
	pool: SqlitePool,
}

impl TailnetRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	// =========================================================================
	// Peer Operations
	// =========================================================================

	#[tracing::instrument(skip(self, node), fields(%id, %coordinator_id, %status))]
	pub async fn upsert_peer(
		&self,
		id: Uuid,
		coordinator_id: Uuid,
		node: &[u8],
		status: PeerStatus,
	) -> Result<(), DbError> {
		sqlx::query(
			"INSERT INTO tailnet_peers (id, coordinator_id, updated_at, node, status)
			 VALUES (?, ?, ?, ?, ?)
			 ON CONFLICT (id, coordinator_id) DO UPDATE SET
			 	updated_at = excluded.updated_at,
			 	node = excluded.node,
			 	status = excluded.status",
		)
		.bind(id.to_string())
		.bind(coordinator_id.to_string())
		.bind(format_timestamp(Utc::now()))
		.bind(node)
		.bind(status.as_str())
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%id, %coordinator_id))]
	pub async fn delete_peer(&self, id: Uuid, coordinator_id: Uuid) -> Result<(), DbError> {
		let result = sqlx::query("DELETE FROM tailnet_peers WHERE id = ? AND coordinator_id = ?")
			.bind(id.to_string())
			.bind(coordinator_id.to_string())
			.execute(&self.pool)
			.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("tailnet peer {id}")));
		}
		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get_peers(&self, id: Uuid) -> Result<Vec<TailnetPeer>, DbError> {
		let rows: Vec<PeerRowTuple> = sqlx::query_as(
			"SELECT id, coordinator_id, updated_at, node, status
			 FROM tailnet_peers WHERE id = ?
			 ORDER BY updated_at DESC",
		)
		.bind(id.to_string())
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(TailnetPeer::try_from).collect()
	}

	// =========================================================================
	// Tunnel Operations
	// =========================================================================

	#[tracing::instrument(skip(self), fields(%coordinator_id, %src_id, %dst_id))]
	pub async fn upsert_tunnel(
		&self,
		coordinator_id: Uuid,
		src_id: Uuid,
		dst_id: Uuid,
	) -> Result<(), DbError> {
		sqlx::query(
			"INSERT INTO tailnet_tunnels (coordinator_id, src_id, dst_id, updated_at)
			 VALUES (?, ?, ?, ?)
			 ON CONFLICT (coordinator_id, src_id, dst_id) DO UPDATE SET
			 	updated_at = excluded.updated_at",
		)
		.bind(coordinator_id.to_string())
		.bind(src_id.to_string())
		.bind(dst_id.to_string())
		.bind(format_timestamp(Utc::now()))
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%coordinator_id, %src_id, %dst_id))]
	pub async fn delete_tunnel(
		&self,
		coordinator_id: Uuid,
		src_id: Uuid,
		dst_id: Uuid,
	) -> Result<(), DbError> {
		let result = sqlx::query(
			"DELETE FROM tailnet_tunnels WHERE coordinator_id = ? AND src_id = ? AND dst_id = ?",
		)
		.bind(coordinator_id.to_string())
		.bind(src_id.to_string())
		.bind(dst_id.to_string())
		.execute(&self.pool)
		.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("tailnet tunnel {src_id} -> {dst_id}")));
		}
		Ok(())
	}

	/// Delete every tunnel with the given source, returning the destinations
	/// that were removed.
	#[tracing::instrument(skip(self), fields(%coordinator_id, %src_id))]
	pub async fn delete_all_tunnels(
		&self,
		coordinator_id: Uuid,
		src_id: Uuid,
	) -> Result<Vec<Uuid>, DbError> {
		let rows: Vec<(String,)> = sqlx::query_as(
			"DELETE FROM tailnet_tunnels WHERE coordinator_id = ? AND src_id = ?
			 RETURNING dst_id",
		)
		.bind(coordinator_id.to_string())
		.bind(src_id.to_string())
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(|(dst,)| parse_uuid(&dst)).collect()
	}

	#[tracing::instrument(skip(self), fields(%src_id))]
	pub async fn list_tunnels_by_src(&self, src_id: Uuid) -> Result<Vec<TailnetTunnel>, DbError> {
		let rows: Vec<TunnelRowTuple> = sqlx::query_as(
			"SELECT coordinator_id, src_id, dst_id, updated_at
			 FROM tailnet_tunnels WHERE src_id = ?
			 ORDER BY dst_id",
		)
		.bind(src_id.to_string())
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(TailnetTunnel::try_from).collect()
	}

	/// Peers sharing a tunnel with `id`, in either direction.
	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get_tunnel_peer_ids(&self, id: Uuid) -> Result<Vec<Uuid>, DbError> {
		let rows: Vec<(String,)> = sqlx::query_as(
			"SELECT dst_id FROM tailnet_tunnels WHERE src_id = ?
			 UNION
			 SELECT src_id FROM tailnet_tunnels WHERE dst_id = ?",
		)
		.bind(id.to_string())
		.bind(id.to_string())
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(|(peer,)| parse_uuid(&peer)).collect()
	}

	/// Bindings of every peer sharing a tunnel with `id`, from every replica.
	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get_tunnel_peer_bindings(&self, id: Uuid) -> Result<Vec<TailnetPeer>, DbError> {
		let rows: Vec<PeerRowTuple> = sqlx::query_as(
			"SELECT p.id, p.coordinator_id, p.updated_at, p.node, p.status
			 FROM tailnet_peers p
			 INNER JOIN (
			 	SELECT dst_id AS peer_id FROM tailnet_tunnels WHERE src_id = ?
			 	UNION
			 	SELECT src_id AS peer_id FROM tailnet_tunnels WHERE dst_id = ?
			 ) t ON p.id = t.peer_id",
		)
		.bind(id.to_string())
		.bind(id.to_string())
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(TailnetPeer::try_from).collect()
	}

	// =========================================================================
	// Coordinator Operations
	// =========================================================================

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn upsert_coordinator(&self, id: Uuid) -> Result<(), DbError> {
		sqlx::query(
			"INSERT INTO tailnet_coordinators (id, heartbeat_at) VALUES (?, ?)
			 ON CONFLICT (id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at",
		)
		.bind(id.to_string())
		.bind(format_timestamp(Utc::now()))
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn delete_coordinator(&self, id: Uuid) -> Result<(), DbError> {
		sqlx::query("DELETE FROM tailnet_coordinators WHERE id = ?")
			.bind(id.to_string())
			.execute(&self.pool)
			.await?;

		Ok(())
	}

	// =========================================================================
	// Cleanup Operations
	// =========================================================================

	#[tracing::instrument(skip(self))]
	pub async fn clean_coordinators(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
		let result = sqlx::query("DELETE FROM tailnet_coordinators WHERE heartbeat_at < ?")
			.bind(format_timestamp(cutoff))
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self))]
	pub async fn clean_lost_peers(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
		let result = sqlx::query("DELETE FROM tailnet_peers WHERE status = 'lost' AND updated_at < ?")
			.bind(format_timestamp(cutoff))
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}

	/// Delete tunnels older than `cutoff` whose source has no binding on the
	/// same replica.
	#[tracing::instrument(skip(self))]
	pub async fn clean_tunnels(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
		let result = sqlx::query(
			"DELETE FROM tailnet_tunnels
			 WHERE updated_at < ?
			 AND NOT EXISTS (
			 	SELECT 1 FROM tailnet_peers p
			 	WHERE p.id = tailnet_tunnels.src_id
			 	AND p.coordinator_id = tailnet_tunnels.coordinator_id
			 )",
		)
		.bind(format_timestamp(cutoff))
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}
}

#[async_trait]
pub trait TailnetStore: Send + Sync {
	async fn upsert_peer(
		&self,
		id: Uuid,
		coordinator_id: Uuid,
		node: &[u8],
		status: PeerStatus,
	) -> Result<(), DbError>;
	async fn delete_peer(&self, id: Uuid, coordinator_id: Uuid) -> Result<(), DbError>;
	async fn get_peers(&self, id: Uuid) -> Result<Vec<TailnetPeer>, DbError>;
	async fn upsert_tunnel(&self, coordinator_id: Uuid, src_id: Uuid, dst_id: Uuid)
		-> Result<(), DbError>;
	async fn delete_tunnel(&self, coordinator_id: Uuid, src_id: Uuid, dst_id: Uuid)
		-> Result<(), DbError>;
	async fn delete_all_tunnels(&self, coordinator_id: Uuid, src_id: Uuid)
		-> Result<Vec<Uuid>, DbError>;
	async fn list_tunnels_by_src(&self, src_id: Uuid) -> Result<Vec<TailnetTunnel>, DbError>;
	async fn get_tunnel_peer_ids(&self, id: Uuid) -> Result<Vec<Uuid>, DbError>;
	async fn get_tunnel_peer_bindings(&self, id: Uuid) -> Result<Vec<TailnetPeer>, DbError>;
	async fn upsert_coordinator(&self, id: Uuid) -> Result<(), DbError>;
	async fn delete_coordinator(&self, id: Uuid) -> Result<(), DbError>;
	async fn clean_coordinators(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError>;
	async fn clean_lost_peers(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError>;
	async fn clean_tunnels(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError>;
}

#[async_trait]
impl TailnetStore for TailnetRepository {
	async fn upsert_peer(
		&self,
		id: Uuid,
		coordinator_id: Uuid,
		node: &[u8],
		status: PeerStatus,
	) -> Result<(), DbError> {
		self.upsert_peer(id, coordinator_id, node, status).await
	}

	async fn delete_peer(&self, id: Uuid, coordinator_id: Uuid) -> Result<(), DbError> {
		self.delete_peer(id, coordinator_id).await
	}

	async fn get_peers(&self, id: Uuid) -> Result<Vec<TailnetPeer>, DbError> {
		self.get_peers(id).await
	}

	async fn upsert_tunnel(
		&self,
		coordinator_id: Uuid,
		src_id: Uuid,
		dst_id: Uuid,
	) -> Result<(), DbError> {
		self.upsert_tunnel(coordinator_id, src_id, dst_id).await
	}

	async fn delete_tunnel(
		&self,
		coordinator_id: Uuid,
		src_id: Uuid,
		dst_id: Uuid,
	) -> Result<(), DbError> {
		self.delete_tunnel(coordinator_id, src_id, dst_id).await
	}

	async fn delete_all_tunnels(
		&self,
		coordinator_id: Uuid,
		src_id: Uuid,
	) -> Result<Vec<Uuid>, DbError> {
		self.delete_all_tunnels(coordinator_id, src_id).await
	}

	async fn list_tunnels_by_src(&self, src_id: Uuid) -> Result<Vec<TailnetTunnel>, DbError> {
		self.list_tunnels_by_src(src_id).await
	}

	async fn get_tunnel_peer_ids(&self, id: Uuid) -> Result<Vec<Uuid>, DbError> {
		self.get_tunnel_peer_ids(id).await
	}

	async fn get_tunnel_peer_bindings(&self, id: Uuid) -> Result<Vec<TailnetPeer>, DbError> {
		self.get_tunnel_peer_bindings(id).await
	}

	async fn upsert_coordinator(&self, id: Uuid) -> Result<(), DbError> {
		self.upsert_coordinator(id).await
	}

	async fn delete_coordinator(&self, id: Uuid) -> Result<(), DbError> {
		self.delete_coordinator(id).await
	}

	async fn clean_coordinators(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
		self.clean_coordinators(cutoff).await
	}

	async fn clean_lost_peers(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
		self.clean_lost_peers(cutoff).await
	}

	async fn clean_tunnels(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
		self.clean_tunnels(cutoff).await
	}
}
