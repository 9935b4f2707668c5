// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! # loom-server-db
//!
//! Persistence for the tailnet coordinator using SQLite via sqlx.
//!
//! ## Repository Pattern
//!
//! - **[`TailnetStore`] trait**: the interface the coordinator depends on
//! - **[`TailnetRepository`] struct**: SQLite implementation holding a `SqlitePool`
//!
//! ## Error Handling
//!
//! | Variant | When to use |
//! |---------|-------------|
//! | `NotFound` | Delete of a peer binding or tunnel that does not exist |
//! | `Sqlx` | Let sqlx errors propagate via `?` |
//! | `Internal` | Invalid stored data (unparseable UUID, timestamp or status) |
//!
//! ## Testing
//!
//! Tests use in-memory SQLite with a single connection, see [`testing`].

pub mod error;
pub mod pool;
pub mod tailnet;
pub mod testing;

pub use error::{DbError, Result};
pub use pool::create_pool;
pub use tailnet::{
	format_timestamp, migrate_tailnet, parse_timestamp, PeerStatus, TailnetPeer, TailnetRepository,
	TailnetStore, TailnetTunnel,
};
