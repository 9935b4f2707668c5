// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::proto::ProtoError;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How to reach a peer: keys, discovery info, endpoints and relay preference.
///
/// The coordinator never interprets a node beyond address authorization; it
/// stores the encoded bytes and forwards the decoded value to tunnel partners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
	pub id: i64,
	pub as_of: DateTime<Utc>,
	pub key: String,
	pub disco: String,
	#[serde(default)]
	pub preferred_derp: i32,
	#[serde(default)]
	pub derp_latency: BTreeMap<String, f64>,
	#[serde(default)]
	pub derp_forced_websockets: BTreeMap<i32, String>,
	#[serde(default)]
	pub addresses: Vec<IpNet>,
	#[serde(default)]
	pub allowed_ips: Vec<IpNet>,
	#[serde(default)]
	pub endpoints: Vec<String>,
}

impl Node {
	pub fn new(id: i64, key: impl Into<String>, disco: impl Into<String>) -> Self {
		Self {
			id,
			as_of: Utc::now(),
			key: key.into(),
			disco: disco.into(),
			preferred_derp: 0,
			derp_latency: BTreeMap::new(),
			derp_forced_websockets: BTreeMap::new(),
			addresses: Vec::new(),
			allowed_ips: Vec::new(),
			endpoints: Vec::new(),
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

	fn sample() -> Node {
		let mut node = Node::new(7, "nodekey:abc", "discokey:def");
		node.preferred_derp = 999;
		node.derp_latency.insert("999-v4".to_string(), 0.012);
		node.derp_forced_websockets.insert(999, "proxy".to_string());
		node.addresses.push("fd7a:115c:a1e0::1/128".parse().unwrap());
		node.allowed_ips.push("fd7a:115c:a1e0::1/128".parse().unwrap());
		node.endpoints.push("192.0.2.1:41641".to_string());
		node
	}

	#[test]
	fn bytes_preserve_every_field() {
		let node = sample();
		let decoded = Node::from_bytes(&node.to_bytes().unwrap()).unwrap();
		assert_eq!(node, decoded);
	}

	#[test]
	fn missing_optional_fields_default() {
		let json = br#"{"id":1,"as_of":"2025-01-01T00:00:00Z","key":"k","disco":"d"}"#;
		let node = Node::from_bytes(json).unwrap();
		assert!(node.addresses.is_empty());
		assert_eq!(node.preferred_derp, 0);
	}

	#[test]
	fn garbage_is_decode_error() {
		let err = Node::from_bytes(b"\x00\x01").unwrap_err();
		assert!(matches!(err, ProtoError::Decode(_)));
	}
}
