// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::CoordError;
use chrono::{DateTime, Utc};
use loom_server_db::{PeerStatus, TailnetPeer};
use loom_wgtunnel_common::{CoordinatorId, Node, PeerId, UpdateKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
	Node,
	Lost,
}

impl MappingKind {
	pub fn update_kind(&self) -> UpdateKind {
		match self {
			MappingKind::Node => UpdateKind::Node,
			MappingKind::Lost => UpdateKind::Lost,
		}
	}
}

impl From<PeerStatus> for MappingKind {
	fn from(status: PeerStatus) -> Self {
		match status {
			PeerStatus::Ok => MappingKind::Node,
			PeerStatus::Lost => MappingKind::Lost,
		}
	}
}

/// One replica's view of a remote peer, derived from a binding row.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
	pub peer: PeerId,
	pub coordinator: CoordinatorId,
	pub updated_at: DateTime<Utc>,
	pub node: Node,
	pub kind: MappingKind,
}

impl TryFrom<TailnetPeer> for Mapping {
	type Error = CoordError;

	fn try_from(row: TailnetPeer) -> Result<Self, Self::Error> {
		Ok(Self {
			peer: PeerId::from_uuid(row.id),
			coordinator: CoordinatorId::from_uuid(row.coordinator_id),
			updated_at: row.updated_at,
			node: Node::from_bytes(&row.node)?,
			kind: row.status.into(),
		})
	}
}

/// Convert binding rows, dropping rows whose node cannot be decoded.
pub fn rows_to_mappings(rows: Vec<TailnetPeer>) -> Vec<Mapping> {
	rows
		.into_iter()
		.filter_map(|row| {
			let peer_id = row.id;
			let coordinator_id = row.coordinator_id;
			match Mapping::try_from(row) {
				Ok(mapping) => Some(mapping),
				Err(e) => {
					tracing::error!(
						%peer_id,
						%coordinator_id,
						error = %e,
						"failed to decode stored node"
					);
					None
				}
			}
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use uuid::Uuid;

	fn row(node: Vec<u8>, status: PeerStatus) -> TailnetPeer {
		TailnetPeer {
			id: Uuid::new_v4(),
			coordinator_id: Uuid::new_v4(),
			updated_at: Utc::now(),
			node,
			status,
		}
	}

	#[test]
	fn lost_rows_become_lost_mappings() {
		let node = Node::new(1, "key", "disco");
		let mapping = Mapping::try_from(row(node.to_bytes().unwrap(), PeerStatus::Lost)).unwrap();
		assert_eq!(mapping.kind, MappingKind::Lost);
		assert_eq!(mapping.node, node);
	}

	#[test]
	fn undecodable_rows_are_skipped() {
		let good = Node::new(2, "key", "disco").to_bytes().unwrap();
		let rows = vec![row(b"garbage".to_vec(), PeerStatus::Ok), row(good, PeerStatus::Ok)];
		let mappings = rows_to_mappings(rows);
		assert_eq!(mappings.len(), 1);
		assert_eq!(mappings[0].node.id, 2);
	}
}
