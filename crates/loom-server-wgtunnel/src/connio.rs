// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Protocol handling for one peer connection.

use crate::auth::CoordinateeAuth;
use crate::binder::BindingUpdate;
use crate::error::CoordError;
use crate::handshaker::ReadyForHandshake;
use crate::tunneler::{TunnelRequest, TunnelUpdate};
use chrono::{DateTime, Utc};
use loom_wgtunnel_common::{CoordinateRequest, CoordinateResponse, CoordinatorId, PeerId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Senders into the replica-wide write-behind components. Connections report
/// through these so that departures are recorded even after the connection's
/// own token is cancelled.
#[derive(Clone)]
pub struct ConnSinks {
	pub bindings: mpsc::UnboundedSender<(PeerId, BindingUpdate)>,
	pub tunnels: mpsc::UnboundedSender<TunnelRequest>,
	pub handshakes: mpsc::UnboundedSender<ReadyForHandshake>,
}

/// How the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
	/// The peer sent `disconnect`.
	Graceful,
	/// EOF, cancellation or a rejected request.
	Lost,
}

pub struct ConnIo {
	coordinator_id: CoordinatorId,
	peer: PeerId,
	name: String,
	auth: Arc<dyn CoordinateeAuth>,
	sinks: ConnSinks,
	responses: Mutex<Option<mpsc::Sender<CoordinateResponse>>>,
	cancel: CancellationToken,
	start: DateTime<Utc>,
	last_write: Mutex<Option<DateTime<Utc>>>,
	overwrites: AtomicU64,
	overwritten: AtomicBool,
}

impl ConnIo {
	pub fn new(
		coordinator_id: CoordinatorId,
		peer: PeerId,
		name: impl Into<String>,
		auth: Arc<dyn CoordinateeAuth>,
		sinks: ConnSinks,
		responses: mpsc::Sender<CoordinateResponse>,
		cancel: CancellationToken,
	) -> Arc<Self> {
		Arc::new(Self {
			coordinator_id,
			peer,
			name: name.into(),
			auth,
			sinks,
			responses: Mutex::new(Some(responses)),
			cancel,
			start: Utc::now(),
			last_write: Mutex::new(None),
			overwrites: AtomicU64::new(0),
			overwritten: AtomicBool::new(false),
		})
	}

	pub fn peer(&self) -> PeerId {
		self.peer
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn start(&self) -> DateTime<Utc> {
		self.start
	}

	pub fn last_write(&self) -> Option<DateTime<Utc>> {
		*self.last_write.lock()
	}

	pub fn overwrites(&self) -> u64 {
		self.overwrites.load(Ordering::SeqCst)
	}

	pub(crate) fn set_overwrites(&self, n: u64) {
		self.overwrites.store(n, Ordering::SeqCst);
	}

	/// Marks this connection as replaced by a newer one for the same peer.
	/// Its departure then leaves the binding and tunnels to the newcomer.
	pub(crate) fn mark_overwritten(&self) {
		self.overwritten.store(true, Ordering::SeqCst);
	}

	pub fn is_overwritten(&self) -> bool {
		self.overwritten.load(Ordering::SeqCst)
	}

	pub fn cancel_token(&self) -> &CancellationToken {
		&self.cancel
	}

	/// Queue a response without waiting. A full buffer yields
	/// [`CoordError::WouldBlock`]; a closed connection [`CoordError::Closed`].
	pub fn enqueue(&self, response: CoordinateResponse) -> Result<(), CoordError> {
		let responses = self.responses.lock();
		let Some(tx) = responses.as_ref() else {
			return Err(CoordError::Closed);
		};
		match tx.try_send(response) {
			Ok(()) => {
				*self.last_write.lock() = Some(Utc::now());
				Ok(())
			}
			Err(TrySendError::Full(_)) => Err(CoordError::WouldBlock),
			Err(TrySendError::Closed(_)) => Err(CoordError::Closed),
		}
	}

	/// Send a final response carrying `reason`, if there is room, then close
	/// the response stream and stop the connection.
	pub fn close(&self, reason: &str) {
		if let Some(tx) = self.responses.lock().take() {
			if tx.try_send(CoordinateResponse::closed(reason)).is_err() {
				debug!(peer_id = %self.peer, reason, "unable to deliver close reason");
			}
		}
		self.cancel.cancel();
	}

	/// Close the response stream without a reason.
	pub fn shutdown(&self) {
		self.responses.lock().take();
		self.cancel.cancel();
	}

	/// Process requests until the peer leaves, then report its departure.
	#[instrument(skip(self, requests), fields(coordinator_id = %self.coordinator_id, peer_id = %self.peer, name = %self.name))]
	pub async fn run(&self, mut requests: mpsc::Receiver<CoordinateRequest>) -> Departure {
		let departure = loop {
			let request = tokio::select! {
				_ = self.cancel.cancelled() => break Departure::Lost,
				request = requests.recv() => request,
			};
			let Some(request) = request else {
				debug!("request stream ended");
				break Departure::Lost;
			};
			match self.handle_request(request) {
				Ok(Some(departure)) => break departure,
				Ok(None) => {}
				Err(e) => {
					warn!(error = %e, "closing connection after rejected request");
					self.close(&e.to_string());
					break Departure::Lost;
				}
			}
		};

		self.depart(departure);
		departure
	}

	fn handle_request(&self, request: CoordinateRequest) -> Result<Option<Departure>, CoordError> {
		self.auth.authorize(self.peer, &request)?;
		debug!(kind = request.kind(), "handling request");

		let sent = match request {
			CoordinateRequest::UpdateSelf { node } => self
				.sinks
				.bindings
				.send((self.peer, BindingUpdate::Node(node)))
				.is_ok(),
			CoordinateRequest::AddTunnel { id } => self
				.sinks
				.tunnels
				.send(TunnelRequest {
					src: self.peer,
					update: TunnelUpdate::Add(id),
				})
				.is_ok(),
			CoordinateRequest::RemoveTunnel { id } => self
				.sinks
				.tunnels
				.send(TunnelRequest {
					src: self.peer,
					update: TunnelUpdate::Remove(id),
				})
				.is_ok(),
			CoordinateRequest::ReadyForHandshake { id } => self
				.sinks
				.handshakes
				.send(ReadyForHandshake {
					src: self.peer,
					dst: id,
				})
				.is_ok(),
			CoordinateRequest::Disconnect => return Ok(Some(Departure::Graceful)),
		};

		if sent {
			Ok(None)
		} else {
			Err(CoordError::Closed)
		}
	}

	fn depart(&self, departure: Departure) {
		if self.is_overwritten() {
			debug!("connection was overwritten, leaving binding to its replacement");
			return;
		}

		let update = match departure {
			Departure::Graceful => BindingUpdate::Disconnected,
			Departure::Lost => BindingUpdate::Lost,
		};
		if self.sinks.bindings.send((self.peer, update)).is_err() {
			debug!("binder stopped, binding withdrawal skipped");
		}

		// Tunnels outlive an ungraceful loss so a reconnecting peer resumes
		// without re-requesting them.
		if departure == Departure::Graceful {
			let request = TunnelRequest {
				src: self.peer,
				update: TunnelUpdate::RemoveAll,
			};
			if self.sinks.tunnels.send(request).is_err() {
				debug!("tunneler stopped, tunnel withdrawal skipped");
			}
		}
		info!(?departure, "peer departed");
	}
}
