// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies a connected peer (client or agent). Stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	pub fn from_uuid(uuid: Uuid) -> Self {
		Self(uuid)
	}

	pub fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for PeerId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for PeerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::str::FromStr for PeerId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.parse()?))
	}
}

/// Identifies one running coordinator replica. Fresh on every start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoordinatorId(Uuid);

impl CoordinatorId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	pub fn from_uuid(uuid: Uuid) -> Self {
		Self(uuid)
	}

	pub fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for CoordinatorId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for CoordinatorId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::str::FromStr for CoordinatorId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.parse()?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn peer_id_roundtrip() {
		let id = PeerId::new();
		let s = id.to_string();
		let parsed: PeerId = s.parse().unwrap();
		assert_eq!(id, parsed);
	}

	#[test]
	fn coordinator_id_roundtrip() {
		let id = CoordinatorId::new();
		let parsed: CoordinatorId = id.to_string().parse().unwrap();
		assert_eq!(id, parsed);
	}

	#[test]
	fn peer_id_serializes_as_bare_uuid() {
		let uuid = Uuid::new_v4();
		let id = PeerId::from_uuid(uuid);
		let json = serde_json::to_string(&id).unwrap();
		assert_eq!(json, format!("\"{uuid}\""));
	}

	#[test]
	fn invalid_peer_id_rejected() {
		assert!("not-a-uuid".parse::<PeerId>().is_err());
	}
}
