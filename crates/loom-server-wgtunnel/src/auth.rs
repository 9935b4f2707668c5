// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-connection authorization of coordinate requests.

use ipnet::IpNet;
use loom_wgtunnel_common::{service_net, CoordinateRequest, Node, PeerId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
	#[error("cannot open a tunnel to self")]
	SelfTunnel,

	#[error("tunnel from {src} to {dst} is not allowed")]
	TunnelNotAllowed { src: PeerId, dst: PeerId },

	#[error("invalid node address {0}")]
	InvalidAddress(IpNet),

	#[error("forbidden: {0}")]
	Forbidden(&'static str),
}

/// Decides whether the peer on a connection may issue a request. A rejected
/// request closes the connection.
pub trait CoordinateeAuth: Send + Sync {
	fn authorize(&self, peer: PeerId, request: &CoordinateRequest) -> Result<(), AuthError>;
}

fn reject_self_tunnel(peer: PeerId, request: &CoordinateRequest) -> Result<(), AuthError> {
	match request {
		CoordinateRequest::AddTunnel { id } if *id == peer => Err(AuthError::SelfTunnel),
		_ => Ok(()),
	}
}

/// Every advertised address must be the peer's own service address.
fn validate_addresses(peer: &PeerId, node: &Node) -> Result<(), AuthError> {
	let expected = service_net(peer);
	for addr in node.addresses.iter().chain(node.allowed_ips.iter()) {
		if *addr != expected {
			return Err(AuthError::InvalidAddress(*addr));
		}
	}
	Ok(())
}

/// A client may only reach the one agent it was admitted for.
#[derive(Debug, Clone)]
pub struct ClientCoordinateeAuth {
	pub agent_id: PeerId,
}

impl CoordinateeAuth for ClientCoordinateeAuth {
	fn authorize(&self, peer: PeerId, request: &CoordinateRequest) -> Result<(), AuthError> {
		reject_self_tunnel(peer, request)?;
		match request {
			CoordinateRequest::AddTunnel { id } if *id != self.agent_id => {
				Err(AuthError::TunnelNotAllowed { src: peer, dst: *id })
			}
			CoordinateRequest::UpdateSelf { node } => validate_addresses(&peer, node),
			_ => Ok(()),
		}
	}
}

/// Agents only accept tunnels; they never open them.
#[derive(Debug, Clone)]
pub struct AgentCoordinateeAuth {
	pub id: PeerId,
}

impl CoordinateeAuth for AgentCoordinateeAuth {
	fn authorize(&self, peer: PeerId, request: &CoordinateRequest) -> Result<(), AuthError> {
		if peer != self.id {
			return Err(AuthError::Forbidden("agent ID mismatch"));
		}
		reject_self_tunnel(peer, request)?;
		match request {
			CoordinateRequest::AddTunnel { .. } => Err(AuthError::Forbidden("agents cannot open tunnels")),
			CoordinateRequest::UpdateSelf { node } => validate_addresses(&peer, node),
			_ => Ok(()),
		}
	}
}

type TunnelPredicate = dyn Fn(PeerId, PeerId) -> bool + Send + Sync;

/// Tunnels are checked by an injected `(src, dst)` predicate.
pub struct TunnelCoordinateeAuth {
	allowed: Box<TunnelPredicate>,
}

impl TunnelCoordinateeAuth {
	pub fn new<F>(allowed: F) -> Self
	where
		F: Fn(PeerId, PeerId) -> bool + Send + Sync + 'static,
	{
		Self {
			allowed: Box::new(allowed),
		}
	}

	/// Allows every tunnel except to self.
	pub fn allow_all() -> Self {
		Self::new(|_, _| true)
	}
}

impl CoordinateeAuth for TunnelCoordinateeAuth {
	fn authorize(&self, peer: PeerId, request: &CoordinateRequest) -> Result<(), AuthError> {
		reject_self_tunnel(peer, request)?;
		match request {
			CoordinateRequest::AddTunnel { id } if !(self.allowed)(peer, *id) => {
				Err(AuthError::TunnelNotAllowed { src: peer, dst: *id })
			}
			_ => Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn node_with(addresses: Vec<IpNet>) -> Node {
		let mut node = Node::new(1, "key", "disco");
		node.addresses = addresses.clone();
		node.allowed_ips = addresses;
		node
	}

	#[test]
	fn client_may_only_tunnel_to_its_agent() {
		let (client, agent, other) = (PeerId::new(), PeerId::new(), PeerId::new());
		let auth = ClientCoordinateeAuth { agent_id: agent };

		assert!(auth
			.authorize(client, &CoordinateRequest::AddTunnel { id: agent })
			.is_ok());
		assert_eq!(
			auth.authorize(client, &CoordinateRequest::AddTunnel { id: other }),
			Err(AuthError::TunnelNotAllowed {
				src: client,
				dst: other
			})
		);
		assert!(auth
			.authorize(client, &CoordinateRequest::RemoveTunnel { id: other })
			.is_ok());
	}

	#[test]
	fn client_addresses_must_be_own_service_address() {
		let client = PeerId::new();
		let auth = ClientCoordinateeAuth {
			agent_id: PeerId::new(),
		};

		let good = node_with(vec![service_net(&client)]);
		assert!(auth
			.authorize(client, &CoordinateRequest::UpdateSelf { node: good })
			.is_ok());

		let stolen = service_net(&PeerId::new());
		let bad = node_with(vec![stolen]);
		assert_eq!(
			auth.authorize(client, &CoordinateRequest::UpdateSelf { node: bad }),
			Err(AuthError::InvalidAddress(stolen))
		);
	}

	#[test]
	fn agent_cannot_open_tunnels() {
		let agent = PeerId::new();
		let auth = AgentCoordinateeAuth { id: agent };
		assert!(matches!(
			auth.authorize(agent, &CoordinateRequest::AddTunnel { id: PeerId::new() }),
			Err(AuthError::Forbidden(_))
		));
		assert!(auth
			.authorize(agent, &CoordinateRequest::ReadyForHandshake { id: PeerId::new() })
			.is_ok());
		assert!(matches!(
			auth.authorize(PeerId::new(), &CoordinateRequest::Disconnect),
			Err(AuthError::Forbidden(_))
		));
	}

	#[test]
	fn self_tunnel_is_always_rejected() {
		let peer = PeerId::new();
		let request = CoordinateRequest::AddTunnel { id: peer };
		assert_eq!(
			TunnelCoordinateeAuth::allow_all().authorize(peer, &request),
			Err(AuthError::SelfTunnel)
		);
		assert_eq!(
			ClientCoordinateeAuth { agent_id: peer }.authorize(peer, &request),
			Err(AuthError::SelfTunnel)
		);
	}

	#[test]
	fn tunnel_predicate_is_consulted() {
		let allowed = PeerId::new();
		let auth = TunnelCoordinateeAuth::new(move |_, dst| dst == allowed);
		let src = PeerId::new();
		assert!(auth
			.authorize(src, &CoordinateRequest::AddTunnel { id: allowed })
			.is_ok());
		assert!(auth
			.authorize(src, &CoordinateRequest::AddTunnel { id: PeerId::new() })
			.is_err());
	}
}
