// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Messages exchanged between a peer and the coordinator.

use crate::node::Node;
use crate::peer::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CLOSE_COORDINATOR_CLOSED: &str = "coordinator closed";
pub const CLOSE_COORDINATOR_UNHEALTHY: &str = "coordinator unhealthy";
pub const CLOSE_PEER_OVERWRITTEN: &str = "peer ID overwritten by new connection";

#[derive(Error, Debug)]
pub enum ProtoError {
	#[error("failed to encode message: {0}")]
	Encode(#[source] serde_json::Error),

	#[error("failed to decode message: {0}")]
	Decode(#[source] serde_json::Error),
}

/// A single request from a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinateRequest {
	UpdateSelf { node: Node },
	AddTunnel { id: PeerId },
	RemoveTunnel { id: PeerId },
	Disconnect,
	ReadyForHandshake { id: PeerId },
}

impl CoordinateRequest {
	pub fn kind(&self) -> &'static str {
		match self {
			Self::UpdateSelf { .. } => "update_self",
			Self::AddTunnel { .. } => "add_tunnel",
			Self::RemoveTunnel { .. } => "remove_tunnel",
			Self::Disconnect => "disconnect",
			Self::ReadyForHandshake { .. } => "ready_for_handshake",
		}
	}

	pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
		serde_json::to_vec(self).map_err(ProtoError::Encode)
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
		serde_json::from_slice(bytes).map_err(ProtoError::Decode)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateKind {
	Node,
	Lost,
	Disconnected,
	ReadyForHandshake,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerUpdate {
	pub id: PeerId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub node: Option<Node>,
	pub kind: UpdateKind,
	pub reason: String,
}

/// A batch of peer updates, or a final message carrying a close reason.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinateResponse {
	#[serde(default)]
	pub peer_updates: Vec<PeerUpdate>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl CoordinateResponse {
	pub fn updates(peer_updates: Vec<PeerUpdate>) -> Self {
		Self {
			peer_updates,
			error: None,
		}
	}

	pub fn closed(reason: impl Into<String>) -> Self {
		Self {
			peer_updates: Vec::new(),
			error: Some(reason.into()),
		}
	}

	pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
		serde_json::to_vec(self).map_err(ProtoError::Encode)
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
		serde_json::from_slice(bytes).map_err(ProtoError::Decode)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_is_tagged() {
		let id = PeerId::new();
		let json = String::from_utf8(CoordinateRequest::AddTunnel { id }.to_bytes().unwrap()).unwrap();
		assert_eq!(json, format!(r#"{{"type":"add_tunnel","id":"{id}"}}"#));

		let req = CoordinateRequest::from_bytes(br#"{"type":"disconnect"}"#).unwrap();
		assert_eq!(req, CoordinateRequest::Disconnect);
	}

	#[test]
	fn unknown_request_rejected() {
		let err = CoordinateRequest::from_bytes(br#"{"type":"bogus"}"#).unwrap_err();
		assert!(matches!(err, ProtoError::Decode(_)));
	}

	#[test]
	fn update_kind_wire_names() {
		assert_eq!(serde_json::to_string(&UpdateKind::Node).unwrap(), "\"NODE\"");
		assert_eq!(
			serde_json::to_string(&UpdateKind::ReadyForHandshake).unwrap(),
			"\"READY_FOR_HANDSHAKE\""
		);
	}

	#[test]
	fn closed_response_carries_reason() {
		let resp = CoordinateResponse::closed(CLOSE_COORDINATOR_UNHEALTHY);
		let decoded = CoordinateResponse::from_bytes(&resp.to_bytes().unwrap()).unwrap();
		assert_eq!(decoded.error.as_deref(), Some("coordinator unhealthy"));
		assert!(decoded.peer_updates.is_empty());
	}

	#[test]
	fn request_kind_names() {
		let node = Node::new(1, "k", "d");
		assert_eq!(CoordinateRequest::UpdateSelf { node }.kind(), "update_self");
		assert_eq!(CoordinateRequest::Disconnect.kind(), "disconnect");
	}
}
