// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Publish/subscribe bus shared by coordinator replicas.
//!
//! Delivery is at-least-once and may be lossy. Subscribers learn about loss
//! through [`PubsubError::DroppedMessages`] and must resynchronize.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};

pub const EVENT_HEARTBEAT: &str = "tailnet_coordinator_heartbeat";
pub const EVENT_PEER_UPDATE: &str = "tailnet_peer_update";
pub const EVENT_TUNNEL_UPDATE: &str = "tailnet_tunnel_update";
pub const EVENT_READY_FOR_HANDSHAKE: &str = "tailnet_ready_for_handshake";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PubsubError {
	#[error("pubsub dropped messages")]
	DroppedMessages,

	#[error("pubsub closed")]
	Closed,

	#[error("subscribe failed: {0}")]
	Subscribe(String),

	#[error("publish failed: {0}")]
	Publish(String),
}

impl PubsubError {
	pub fn is_retryable(&self) -> bool {
		matches!(self, PubsubError::Subscribe(_) | PubsubError::Publish(_))
	}
}

pub type Message = Result<Vec<u8>, PubsubError>;

/// An active subscription. Dropping it stops delivery.
pub struct Subscription {
	rx: mpsc::UnboundedReceiver<Message>,
	_guard: DropGuard,
}

impl Subscription {
	pub fn new(rx: mpsc::UnboundedReceiver<Message>, cancel: CancellationToken) -> Self {
		Self {
			rx,
			_guard: cancel.drop_guard(),
		}
	}

	/// Next message or loss signal. `None` once the bus is gone.
	pub async fn recv(&mut self) -> Option<Message> {
		self.rx.recv().await
	}
}

#[async_trait]
pub trait Pubsub: Send + Sync {
	async fn subscribe(&self, event: &str) -> Result<Subscription, PubsubError>;
	async fn publish(&self, event: &str, message: &[u8]) -> Result<(), PubsubError>;
}

/// In-process bus backed by one broadcast channel per event. Replicas in the
/// same process share one instance.
#[derive(Clone)]
pub struct MemoryPubsub {
	channels: Arc<Mutex<HashMap<String, broadcast::Sender<Message>>>>,
	capacity: usize,
}

impl MemoryPubsub {
	pub fn new() -> Self {
		Self::with_capacity(1024)
	}

	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			channels: Arc::new(Mutex::new(HashMap::new())),
			capacity: capacity.max(1),
		}
	}

	fn get_or_create(&self, event: &str) -> broadcast::Sender<Message> {
		let mut channels = self.channels.lock();
		channels
			.entry(event.to_string())
			.or_insert_with(|| broadcast::channel(self.capacity).0)
			.clone()
	}

	/// Deliver a loss signal to every current subscriber of `event`.
	pub fn inject_dropped(&self, event: &str) {
		let _ = self.get_or_create(event).send(Err(PubsubError::DroppedMessages));
		tracing::debug!(event, "injected dropped-messages signal");
	}
}

impl Default for MemoryPubsub {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Pubsub for MemoryPubsub {
	async fn subscribe(&self, event: &str) -> Result<Subscription, PubsubError> {
		let mut receiver = self.get_or_create(event).subscribe();
		let (tx, rx) = mpsc::unbounded_channel();
		let token = CancellationToken::new();
		let task_token = token.clone();
		let event_name = event.to_string();

		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = task_token.cancelled() => break,
					result = receiver.recv() => {
						let message = match result {
							Ok(message) => message,
							Err(broadcast::error::RecvError::Lagged(n)) => {
								tracing::warn!(event = %event_name, lagged = n, "pubsub subscriber lagged");
								Err(PubsubError::DroppedMessages)
							}
							Err(broadcast::error::RecvError::Closed) => break,
						};
						if tx.send(message).is_err() {
							break;
						}
					}
				}
			}
		});

		tracing::debug!(event, "subscribed");
		Ok(Subscription::new(rx, token))
	}

	async fn publish(&self, event: &str, message: &[u8]) -> Result<(), PubsubError> {
		// No subscribers is not an error.
		let _ = self.get_or_create(event).send(Ok(message.to_vec()));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	async fn next(sub: &mut Subscription) -> Message {
		tokio::time::timeout(Duration::from_secs(1), sub.recv())
			.await
			.expect("timed out waiting for message")
			.expect("subscription closed")
	}

	#[tokio::test]
	async fn publish_reaches_all_subscribers() {
		let ps = MemoryPubsub::new();
		let mut a = ps.subscribe(EVENT_PEER_UPDATE).await.unwrap();
		let mut b = ps.subscribe(EVENT_PEER_UPDATE).await.unwrap();

		ps.publish(EVENT_PEER_UPDATE, b"hello").await.unwrap();

		assert_eq!(next(&mut a).await.unwrap(), b"hello".to_vec());
		assert_eq!(next(&mut b).await.unwrap(), b"hello".to_vec());
	}

	#[tokio::test]
	async fn events_are_isolated() {
		let ps = MemoryPubsub::new();
		let mut peers = ps.subscribe(EVENT_PEER_UPDATE).await.unwrap();

		ps.publish(EVENT_TUNNEL_UPDATE, b"a,b").await.unwrap();
		ps.publish(EVENT_PEER_UPDATE, b"p").await.unwrap();

		assert_eq!(next(&mut peers).await.unwrap(), b"p".to_vec());
	}

	#[tokio::test]
	async fn injected_drop_is_delivered_as_error() {
		let ps = MemoryPubsub::new();
		let mut sub = ps.subscribe(EVENT_TUNNEL_UPDATE).await.unwrap();

		ps.inject_dropped(EVENT_TUNNEL_UPDATE);

		assert_eq!(next(&mut sub).await, Err(PubsubError::DroppedMessages));
	}

	#[tokio::test]
	async fn lag_is_reported_as_dropped_messages() {
		let ps = MemoryPubsub::with_capacity(2);
		let mut sub = ps.subscribe(EVENT_HEARTBEAT).await.unwrap();
		for i in 0..5u8 {
			ps.publish(EVENT_HEARTBEAT, &[i]).await.unwrap();
		}

		assert_eq!(next(&mut sub).await, Err(PubsubError::DroppedMessages));
		assert_eq!(next(&mut sub).await.unwrap(), vec![3]);
		assert_eq!(next(&mut sub).await.unwrap(), vec![4]);
	}

	#[tokio::test]
	async fn publish_without_subscribers_succeeds() {
		let ps = MemoryPubsub::new();
		assert!(ps.publish(EVENT_HEARTBEAT, b"id").await.is_ok());
	}

	#[test]
	fn retryable_variants() {
		assert!(PubsubError::Subscribe("x".into()).is_retryable());
		assert!(!PubsubError::DroppedMessages.is_retryable());
	}
}
