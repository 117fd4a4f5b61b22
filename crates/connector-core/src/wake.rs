//! A request/ack channel used to wake a single-flight background worker
//! and, optionally, block until the worker has observed the request.

use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot};

/// A [`Sender`] whose acknowledgement carries no payload.
pub type AckSender<T> = Sender<T, ()>;

#[derive(Debug)]
pub struct Sender<T, R> {
	tx: mpsc::Sender<(T, oneshot::Sender<R>)>,
}

impl<T, R> Clone for Sender<T, R> {
	fn clone(&self) -> Self {
		Self {
			tx: self.tx.clone(),
		}
	}
}

pub fn new<T, R>(buffer: usize) -> (Sender<T, R>, Receiver<T, R>) {
	let (tx, rx) = mpsc::channel(buffer);
	(Sender { tx }, Receiver { rx })
}

impl<T, R> Sender<T, R>
where
	T: Send + 'static,
	R: Send + std::fmt::Debug + 'static,
{
	/// Send a request and wait for the worker's acknowledgement.
	pub async fn send_and_wait(&self, request: T) -> Result<R, oneshot::error::RecvError> {
		let (ack_tx, ack_rx) = oneshot::channel();
		// The worker is only torn down by `Close`, which it processes from this
		// same queue, so a closed receiver here means the entry is already gone.
		if self.tx.send((request, ack_tx)).await.is_err() {
			return Err(ack_rx.await.unwrap_err());
		}
		ack_rx.await
	}

	/// Send a request without waiting for it to be observed.
	pub fn send_ignore(&self, request: T) -> Result<(), SendError<(T, oneshot::Sender<R>)>> {
		let (ack_tx, _ack_rx) = oneshot::channel();
		self.tx.try_send((request, ack_tx)).map_err(|e| match e {
			mpsc::error::TrySendError::Full((req, ack)) => SendError((req, ack)),
			mpsc::error::TrySendError::Closed((req, ack)) => SendError((req, ack)),
		})
	}
}

pub type AckReceiver<T> = Receiver<T, ()>;

pub struct Receiver<T, R> {
	rx: mpsc::Receiver<(T, oneshot::Sender<R>)>,
}

impl<T, R> Receiver<T, R>
where
	T: Send + 'static,
	R: Send + 'static,
{
	pub async fn recv(&mut self) -> Option<(T, oneshot::Sender<R>)> {
		self.rx.recv().await
	}
}
