// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Deduplicating work queue with at most one in-flight worker per key.

use crate::error::CoordError;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct QueueState<K> {
	pending: VecDeque<K>,
	in_progress: HashSet<K>,
}

/// Keys enqueued while already pending collapse into one unit of work. A key
/// re-enqueued while a worker holds it is handed out again after [`done`].
///
/// [`done`]: WorkQueue::done
pub struct WorkQueue<K> {
	state: Mutex<QueueState<K>>,
	notify: Notify,
	cancel: CancellationToken,
}

impl<K> WorkQueue<K>
where
	K: Clone + Eq + Hash,
{
	pub fn new(cancel: CancellationToken) -> Self {
		Self {
			state: Mutex::new(QueueState {
				pending: VecDeque::new(),
				in_progress: HashSet::new(),
			}),
			notify: Notify::new(),
			cancel,
		}
	}

	pub fn enqueue(&self, key: K) {
		{
			let mut state = self.state.lock();
			if state.pending.contains(&key) {
				return;
			}
			state.pending.push_back(key);
		}
		self.notify.notify_waiters();
	}

	/// Wait for a pending key that no other worker holds. Fails with
	/// [`CoordError::Cancelled`] once the queue's token is cancelled.
	pub async fn acquire(&self) -> Result<K, CoordError> {
		loop {
			if self.cancel.is_cancelled() {
				return Err(CoordError::Cancelled);
			}

			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if let Some(key) = self.take_available() {
				return Ok(key);
			}

			tokio::select! {
				_ = &mut notified => {}
				_ = self.cancel.cancelled() => return Err(CoordError::Cancelled),
			}
		}
	}

	pub fn done(&self, key: &K) {
		{
			let mut state = self.state.lock();
			state.in_progress.remove(key);
		}
		self.notify.notify_waiters();
	}

	pub fn pending_len(&self) -> usize {
		self.state.lock().pending.len()
	}

	fn take_available(&self) -> Option<K> {
		let mut state = self.state.lock();
		let QueueState {
			pending,
			in_progress,
		} = &mut *state;
		let pos = pending.iter().position(|k| !in_progress.contains(k))?;
		let key = pending.remove(pos)?;
		in_progress.insert(key.clone());
		Some(key)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;
	use std::time::Duration;

	#[tokio::test]
	async fn enqueue_coalesces_pending_keys() {
		let queue = WorkQueue::new(CancellationToken::new());
		queue.enqueue(1u32);
		queue.enqueue(1u32);
		queue.enqueue(2u32);
		assert_eq!(queue.pending_len(), 2);

		assert_eq!(queue.acquire().await.unwrap(), 1);
		assert_eq!(queue.acquire().await.unwrap(), 2);
		assert_eq!(queue.pending_len(), 0);
	}

	#[tokio::test]
	async fn in_progress_key_is_not_handed_out_twice() {
		let queue = Arc::new(WorkQueue::new(CancellationToken::new()));
		queue.enqueue("a");
		let first = queue.acquire().await.unwrap();
		assert_eq!(first, "a");

		queue.enqueue("a");
		let blocked = tokio::time::timeout(Duration::from_millis(50), queue.acquire()).await;
		assert!(blocked.is_err(), "key must not be acquired while in progress");

		queue.done(&"a");
		let again = tokio::time::timeout(Duration::from_secs(1), queue.acquire())
			.await
			.expect("re-enqueued key should be handed out after done")
			.unwrap();
		assert_eq!(again, "a");
	}

	#[tokio::test]
	async fn other_keys_proceed_while_one_is_in_progress() {
		let queue = WorkQueue::new(CancellationToken::new());
		queue.enqueue(1u8);
		let held = queue.acquire().await.unwrap();
		queue.enqueue(1u8);
		queue.enqueue(2u8);

		let next = tokio::time::timeout(Duration::from_secs(1), queue.acquire())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(next, 2);
		queue.done(&held);
	}

	#[tokio::test]
	async fn cancel_unblocks_waiters() {
		let cancel = CancellationToken::new();
		let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(cancel.clone()));

		let waiter = {
			let queue = Arc::clone(&queue);
			tokio::spawn(async move { queue.acquire().await })
		};

		tokio::time::sleep(Duration::from_millis(10)).await;
		cancel.cancel();

		let result = tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.unwrap()
			.unwrap();
		assert!(matches!(result, Err(CoordError::Cancelled)));
	}

	#[tokio::test]
	async fn waiter_wakes_on_enqueue() {
		let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(CancellationToken::new()));
		let waiter = {
			let queue = Arc::clone(&queue);
			tokio::spawn(async move { queue.acquire().await })
		};

		tokio::time::sleep(Duration::from_millis(10)).await;
		queue.enqueue(7);

		let key = tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.unwrap()
			.unwrap()
			.unwrap();
		assert_eq!(key, 7);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn at_most_one_worker_per_key_under_contention() {
		let cancel = CancellationToken::new();
		let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(cancel.clone()));
		let active: Arc<Mutex<HashMap<u32, usize>>> = Arc::new(Mutex::new(HashMap::new()));
		let violations = Arc::new(AtomicUsize::new(0));
		let processed = Arc::new(AtomicUsize::new(0));

		let mut workers = Vec::new();
		for _ in 0..8 {
			let queue = Arc::clone(&queue);
			let active = Arc::clone(&active);
			let violations = Arc::clone(&violations);
			let processed = Arc::clone(&processed);
			workers.push(tokio::spawn(async move {
				while let Ok(key) = queue.acquire().await {
					{
						let mut active = active.lock();
						let count = active.entry(key).or_insert(0);
						*count += 1;
						if *count > 1 {
							violations.fetch_add(1, Ordering::SeqCst);
						}
					}
					tokio::task::yield_now().await;
					*active.lock().entry(key).or_insert(1) -= 1;
					processed.fetch_add(1, Ordering::SeqCst);
					queue.done(&key);
				}
			}));
		}

		for round in 0..200u32 {
			queue.enqueue(round % 5);
			if round % 10 == 0 {
				tokio::task::yield_now().await;
			}
		}

		tokio::time::timeout(Duration::from_secs(5), async {
			while queue.pending_len() > 0 {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();

		cancel.cancel();
		for worker in workers {
			worker.await.unwrap();
		}

		assert_eq!(violations.load(Ordering::SeqCst), 0);
		assert!(processed.load(Ordering::SeqCst) >= 5);
	}
}
