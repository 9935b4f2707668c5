// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::pubsub::PubsubError;
use crate::retry::RetryableError;
use loom_server_db::DbError;
use loom_wgtunnel_common::ProtoError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
	#[error("database error: {0}")]
	Database(#[from] DbError),

	#[error("pubsub error: {0}")]
	Pubsub(#[from] PubsubError),

	#[error("coordinator context cancelled")]
	Cancelled,

	#[error("enqueue would block")]
	WouldBlock,

	#[error("connection closed")]
	Closed,

	#[error("unauthorized: {0}")]
	Unauthorized(#[from] AuthError),

	#[error("invalid request: {0}")]
	InvalidRequest(String),

	#[error("decode error: {0}")]
	Decode(#[from] ProtoError),

	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("internal error: {0}")]
	Internal(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;

impl RetryableError for CoordError {
	fn is_retryable(&self) -> bool {
		match self {
			CoordError::Database(e) => e.is_transient(),
			CoordError::Pubsub(e) => e.is_retryable(),
			CoordError::Cancelled
			| CoordError::WouldBlock
			| CoordError::Closed
			| CoordError::Unauthorized(_)
			| CoordError::InvalidRequest(_)
			| CoordError::Decode(_)
			| CoordError::Config(_)
			| CoordError::Internal(_) => false,
		}
	}
}
