// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

#[derive(Debug, thiserror::Error)]
pub enum DbError {
	#[error("Database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	#[error("Not found: {0}")]
	NotFound(String),

	#[error("Conflict: {0}")]
	Conflict(String),

	#[error("Internal: {0}")]
	Internal(String),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl DbError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, DbError::NotFound(_) | DbError::Sqlx(sqlx::Error::RowNotFound))
	}

	/// Errors where the same statement may succeed if issued again later.
	pub fn is_transient(&self) -> bool {
		match self {
			DbError::Sqlx(e) => matches!(
				e,
				sqlx::Error::Io(_)
					| sqlx::Error::PoolTimedOut
					| sqlx::Error::PoolClosed
					| sqlx::Error::WorkerCrashed
					| sqlx::Error::Database(_)
			),
			DbError::Conflict(_) => true,
			DbError::NotFound(_) | DbError::Internal(_) | DbError::Serialization(_) => false,
		}
	}
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn not_found_variants() {
		assert!(DbError::NotFound("peer".into()).is_not_found());
		assert!(DbError::Sqlx(sqlx::Error::RowNotFound).is_not_found());
		assert!(!DbError::Internal("x".into()).is_not_found());
	}

	#[test]
	fn transient_classification() {
		assert!(DbError::Sqlx(sqlx::Error::PoolTimedOut).is_transient());
		assert!(DbError::Conflict("busy".into()).is_transient());
		assert!(!DbError::Internal("corrupt".into()).is_transient());
		assert!(!DbError::NotFound("peer".into()).is_transient());
	}
}
