// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared types for the tailnet coordinator.
//!
//! Peers and coordinator replicas are identified by UUID newtypes. A peer
//! describes how to reach it with a [`Node`], and talks to a coordinator
//! through the [`CoordinateRequest`] / [`CoordinateResponse`] message pair.

pub mod addr;
pub mod node;
pub mod peer;
pub mod proto;

pub use addr::{is_service_addr, service_addr, service_net, service_prefix, SERVICE_PREFIX};
pub use node::Node;
pub use peer::{CoordinatorId, PeerId};
pub use proto::{
	CoordinateRequest, CoordinateResponse, PeerUpdate, ProtoError, UpdateKind, CLOSE_COORDINATOR_CLOSED,
	CLOSE_COORDINATOR_UNHEALTHY, CLOSE_PEER_OVERWRITTEN,
};
