// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Retry with exponential backoff until success or cancellation.
//!
//! Store writes, store queries and pub/sub subscription setup all retry
//! without an elapsed-time limit. Only a permanent error or cancellation of
//! the coordinator stops the loop.

use crate::error::CoordError;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Backoff {
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub backoff_factor: f64,
	pub jitter: bool,
}

impl Default for Backoff {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(10),
			backoff_factor: 1.5,
			jitter: true,
		}
	}
}

impl Backoff {
	pub fn with_max_delay(max_delay: Duration) -> Self {
		let defaults = Self::default();
		Self {
			base_delay: defaults.base_delay.min(max_delay),
			max_delay,
			..defaults
		}
	}

	pub fn delay(&self, attempt: u32) -> Duration {
		let exponent = attempt.min(64) as i32;
		let exponential_delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
		let capped_delay = exponential_delay.min(self.max_delay.as_secs_f64());

		let final_delay = if self.jitter {
			let jitter_factor = 0.5 + fastrand::f64();
			(capped_delay * jitter_factor).min(self.max_delay.as_secs_f64())
		} else {
			capped_delay
		};

		Duration::from_secs_f64(final_delay)
	}
}

pub trait RetryableError {
	fn is_retryable(&self) -> bool;
}

impl RetryableError for loom_server_db::DbError {
	fn is_retryable(&self) -> bool {
		self.is_transient()
	}
}

impl RetryableError for crate::pubsub::PubsubError {
	fn is_retryable(&self) -> bool {
		crate::pubsub::PubsubError::is_retryable(self)
	}
}

/// Run `f` until it succeeds, returns a non-retryable error, or `cancel`
/// fires. Cancellation yields [`CoordError::Cancelled`].
pub async fn retry<F, Fut, T, E>(
	cancel: &CancellationToken,
	backoff: &Backoff,
	operation: &str,
	mut f: F,
) -> Result<T, CoordError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: RetryableError + Into<CoordError> + fmt::Display,
{
	let mut attempt: u32 = 0;

	loop {
		if cancel.is_cancelled() {
			return Err(CoordError::Cancelled);
		}

		let result = tokio::select! {
			result = f() => result,
			_ = cancel.cancelled() => return Err(CoordError::Cancelled),
		};

		match result {
			Ok(value) => return Ok(value),
			Err(err) => {
				if !err.is_retryable() {
					warn!(error = %err, operation, attempt, "non-retryable error encountered");
					return Err(err.into());
				}

				let delay = backoff.delay(attempt);
				attempt = attempt.saturating_add(1);
				warn!(
					error = %err,
					operation,
					attempt,
					delay_ms = delay.as_millis() as u64,
					"retrying after error"
				);

				tokio::select! {
					_ = tokio::time::sleep(delay) => {}
					_ = cancel.cancelled() => return Err(CoordError::Cancelled),
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::sync::Arc;

	#[derive(Debug)]
	struct MockError {
		retryable: bool,
	}

	impl fmt::Display for MockError {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			write!(f, "mock error (retryable: {})", self.retryable)
		}
	}

	impl RetryableError for MockError {
		fn is_retryable(&self) -> bool {
			self.retryable
		}
	}

	impl From<MockError> for CoordError {
		fn from(e: MockError) -> Self {
			CoordError::Internal(e.to_string())
		}
	}

	fn fast_backoff() -> Backoff {
		Backoff {
			base_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(5),
			backoff_factor: 2.0,
			jitter: false,
		}
	}

	#[tokio::test]
	async fn non_retryable_error_fails_immediately() {
		let attempts = Arc::new(AtomicU32::new(0));
		let cancel = CancellationToken::new();

		let result: Result<(), CoordError> = retry(&cancel, &fast_backoff(), "test", || {
			let attempts = Arc::clone(&attempts);
			async move {
				attempts.fetch_add(1, Ordering::SeqCst);
				Err(MockError { retryable: false })
			}
		})
		.await;

		assert!(matches!(result, Err(CoordError::Internal(_))));
		assert_eq!(attempts.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn succeeds_after_transient_failures() {
		let attempts = Arc::new(AtomicU32::new(0));
		let cancel = CancellationToken::new();

		let result = retry(&cancel, &fast_backoff(), "test", || {
			let attempts = Arc::clone(&attempts);
			async move {
				let n = attempts.fetch_add(1, Ordering::SeqCst);
				if n < 4 {
					Err(MockError { retryable: true })
				} else {
					Ok(n)
				}
			}
		})
		.await
		.unwrap();

		assert_eq!(result, 4);
		assert_eq!(attempts.load(Ordering::SeqCst), 5);
	}

	#[tokio::test]
	async fn cancellation_stops_infinite_retry() {
		let cancel = CancellationToken::new();
		let attempts = Arc::new(AtomicU32::new(0));

		let canceller = cancel.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(30)).await;
			canceller.cancel();
		});

		let result: Result<(), CoordError> = retry(&cancel, &fast_backoff(), "test", || {
			let attempts = Arc::clone(&attempts);
			async move {
				attempts.fetch_add(1, Ordering::SeqCst);
				Err(MockError { retryable: true })
			}
		})
		.await;

		assert!(matches!(result, Err(CoordError::Cancelled)));
		assert!(attempts.load(Ordering::SeqCst) > 1);
	}

	#[tokio::test]
	async fn already_cancelled_never_runs() {
		let cancel = CancellationToken::new();
		cancel.cancel();
		let attempts = AtomicU32::new(0);

		let result: Result<(), CoordError> = retry(&cancel, &fast_backoff(), "test", || {
			attempts.fetch_add(1, Ordering::SeqCst);
			async { Ok::<(), MockError>(()) }
		})
		.await;

		assert!(matches!(result, Err(CoordError::Cancelled)));
		assert_eq!(attempts.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn delay_is_capped() {
		let backoff = Backoff {
			base_delay: Duration::from_millis(100),
			max_delay: Duration::from_secs(1),
			backoff_factor: 2.0,
			jitter: false,
		};
		assert_eq!(backoff.delay(0), Duration::from_millis(100));
		assert_eq!(backoff.delay(1), Duration::from_millis(200));
		assert_eq!(backoff.delay(30), Duration::from_secs(1));
		assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
	}

	#[test]
	fn jitter_never_exceeds_max() {
		let backoff = Backoff::with_max_delay(Duration::from_millis(50));
		for attempt in 0..20 {
			assert!(backoff.delay(attempt) <= Duration::from_millis(50));
		}
	}
}
