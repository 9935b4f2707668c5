// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Multi-replica tailnet coordinator.
//!
//! Every replica shares one [`TailnetStore`](loom_server_db::TailnetStore) and
//! one [`Pubsub`] bus. Peers connect through [`Coordinator::coordinate`]; their
//! self-reported nodes and tunnel requests are persisted by the [`binder`] and
//! [`tunneler`], change notifications fan out over pub/sub, and the
//! [`querier`] recomputes the mapping of every affected local peer and hands it
//! to that peer's [`mapper`], which sends only the delta.
//!
//! Replica liveness is tracked by [`heartbeats`]. A replica that cannot write
//! its own heartbeat declares itself unhealthy and disconnects its peers.

pub mod auth;
pub mod binder;
pub mod config;
pub mod connio;
pub mod coordinator;
pub mod error;
pub mod handshaker;
pub mod heartbeats;
pub mod mapper;
pub mod mapping;
pub mod pubsub;
pub mod querier;
pub mod retry;
pub mod testing;
pub mod tunneler;
pub mod workqueue;

pub use auth::{
	AgentCoordinateeAuth, AuthError, ClientCoordinateeAuth, CoordinateeAuth, TunnelCoordinateeAuth,
};
pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{ConnDebug, Coordinator, DebugSnapshot, ReplicaDebug};
pub use error::{CoordError, Result};
pub use mapping::{Mapping, MappingKind};
pub use pubsub::{MemoryPubsub, Pubsub, PubsubError, Subscription};
pub use retry::{Backoff, RetryableError};
pub use workqueue::WorkQueue;
