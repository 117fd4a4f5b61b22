//! Per-instance refresh state machine (spec §4.4) — the core of the engine.
//! A background worker owns `current`/`next` outright and serialises every
//! refresh attempt through a wake channel, exactly the shape `caclient.rs`
//! uses for its own cert-refresh loop: a `watch` channel publishes the
//! latest state to any number of dialers, while a single task is the only
//! writer.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use connector_core::wake;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::admin::AdminClient;
use crate::error::{ConnectorError, Result};
use crate::ratelimiter::RateLimiter;
use crate::token_source::TokenSource;
use crate::types::{DatabaseEngine, KeyPair, RefreshResult};
use crate::uri::InstanceUri;
use crate::verifier;

/// What a `watch` subscriber observes for one instance.
#[derive(Clone, Debug)]
pub enum EntryState {
	Pending,
	Ready(Arc<RefreshResult>),
	Errored(ConnectorError),
}

/// The minimum time before expiry a background refresh is scheduled, and the
/// remaining-lifetime threshold under which refresh happens immediately
/// instead (spec §4.4 step 1).
const MIN_REFRESH_MARGIN: Duration = Duration::from_secs(4 * 60);
const IMMEDIATE_REFRESH_THRESHOLD: Duration = Duration::from_secs(60 * 60);

enum Signal {
	/// A dialer observed an expired/absent `current` under `LAZY` strategy
	/// (or simply wants to nudge a stuck entry) and is asking for a refresh.
	RefreshNow,
	/// `ForceInvalidate(stale)`; carries the pointer being invalidated so the
	/// worker can tell whether `current` still refers to it.
	Invalidated(Arc<RefreshResult>),
	Close,
}

/// Per-instance refresh state machine, public handle. Cheap to clone-share:
/// cloning the `watch::Receiver` is how dialers subscribe.
pub struct InstanceEntry {
	instance: InstanceUri,
	state_rx: watch::Receiver<EntryState>,
	signal_tx: wake::AckSender<Signal>,
	closing_tx: watch::Sender<bool>,
	worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl InstanceEntry {
	pub fn spawn(
		instance: InstanceUri,
		admin: Arc<dyn AdminClient>,
		key_pair: Arc<KeyPair>,
		token_source: Arc<dyn TokenSource>,
		rate_limiter: Arc<RateLimiter>,
		iam_authn: bool,
		background_refresh: bool,
	) -> Arc<Self> {
		let (state_tx, state_rx) = watch::channel(EntryState::Pending);
		let (signal_tx, signal_rx) = wake::new(8);
		let (closing_tx, closing_rx) = watch::channel(false);
		let worker = RefreshWorker {
			instance: instance.clone(),
			admin,
			key_pair,
			token_source,
			rate_limiter,
			iam_authn,
			background: background_refresh,
			state_tx,
			signal_rx,
			closing_rx,
			current: None,
			pending_invalidate: false,
		};
		let handle = tokio::spawn(worker.run());
		Arc::new(Self {
			instance,
			state_rx,
			signal_tx,
			closing_tx,
			worker: std::sync::Mutex::new(Some(handle)),
		})
	}

	/// Awaits `current` up to `deadline`. Returns synchronously if `current`
	/// already holds an unexpired result.
	pub async fn get_connection_info(&self, deadline: Instant) -> Result<Arc<RefreshResult>> {
		let mut rx = self.state_rx.clone();
		loop {
			{
				let state = rx.borrow();
				match &*state {
					EntryState::Ready(result) if result.expires_at > SystemTime::now() => {
						return Ok(result.clone());
					}
					EntryState::Errored(err) => return Err(err.clone()),
					EntryState::Ready(_) | EntryState::Pending => {
						let _ = self.signal_tx.send_ignore(Signal::RefreshNow);
					}
				}
			}
			tokio::select! {
				changed = rx.changed() => {
					changed.map_err(|_| ConnectorError::Closed)?;
				}
				_ = tokio::time::sleep_until(deadline) => {
					return Err(ConnectorError::Timeout(format!(
						"waiting for credentials for {}",
						self.instance
					)));
				}
			}
		}
	}

	/// Idempotent. If `current` still refers to `stale`, schedules an
	/// immediate refresh; otherwise a no-op (someone already replaced it).
	pub async fn force_invalidate(&self, stale: &Arc<RefreshResult>) -> Result<()> {
		match self.signal_tx.send_and_wait(Signal::Invalidated(stale.clone())).await {
			Ok(()) => Ok(()),
			Err(_) => Err(ConnectorError::Closed),
		}
	}

	pub async fn close(&self) {
		// Set before the `Close` signal is even sent, so a refresh already
		// blocked in `RateLimiter::acquire` is interrupted immediately rather
		// than waiting for the worker to drain back to its `select!` loop.
		let _ = self.closing_tx.send(true);
		let _ = self.signal_tx.send_and_wait(Signal::Close).await;
		let handle = self.worker.lock().unwrap().take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}
}

struct RefreshWorker {
	instance: InstanceUri,
	admin: Arc<dyn AdminClient>,
	key_pair: Arc<KeyPair>,
	token_source: Arc<dyn TokenSource>,
	rate_limiter: Arc<RateLimiter>,
	iam_authn: bool,
	background: bool,
	state_tx: watch::Sender<EntryState>,
	signal_rx: wake::AckReceiver<Signal>,
	closing_rx: watch::Receiver<bool>,
	current: Option<Arc<RefreshResult>>,
	pending_invalidate: bool,
}

impl RefreshWorker {
	async fn run(mut self) {
		let mut next_refresh_at: Option<Instant> = None;
		next_refresh_at = self.refresh_cycle(next_refresh_at).await;

		loop {
			let sleep_for = match next_refresh_at {
				Some(at) => at.saturating_duration_since(Instant::now()),
				// No timer under LAZY strategy or once already at `current`'s cadence;
				// sleep far enough out that only a signal will wake this loop.
				None => Duration::from_secs(60 * 60 * 24 * 365),
			};
			tokio::select! {
				_ = tokio::time::sleep(sleep_for) => {
					next_refresh_at = self.refresh_cycle(next_refresh_at).await;
				}
				received = self.signal_rx.recv() => {
					match received {
						Some((Signal::Close, ack)) => {
							let _ = ack.send(());
							break;
						}
						Some((Signal::RefreshNow, ack)) => {
							if !self.current_is_valid() {
								next_refresh_at = self.refresh_cycle(next_refresh_at).await;
							}
							let _ = ack.send(());
						}
						Some((Signal::Invalidated(stale), ack)) => {
							let still_current = self
								.current
								.as_ref()
								.is_some_and(|current| Arc::ptr_eq(current, &stale));
							if still_current {
								// Publish Pending and drop `current` before acking, so a
								// `GetConnectionInfo` call racing the caller of
								// `ForceInvalidate` blocks on the replacement instead of
								// reading the just-invalidated `Ready(stale)`.
								self.current = None;
								let _ = self.state_tx.send(EntryState::Pending);
								self.pending_invalidate = true;
							}
							let _ = ack.send(());
						}
						None => break,
					}
				}
			}

			if self.pending_invalidate {
				self.pending_invalidate = false;
				next_refresh_at = self.refresh_cycle(next_refresh_at).await;
			}
		}
		debug!(instance = %self.instance, "refresh worker stopped");
	}

	/// Runs one refresh attempt (spec §4.4 steps 2-5) and returns the next
	/// scheduled wake-up, or `None` under `LAZY` strategy.
	async fn refresh_cycle(&mut self, previous_schedule: Option<Instant>) -> Option<Instant> {
		if self.rate_limiter.acquire(wait_for_close(self.closing_rx.clone())).await.is_err() {
			return previous_schedule;
		}

		match self.fetch_and_assemble().await {
			Ok(result) => {
				let result = Arc::new(result);
				info!(instance = %self.instance, expires_at = ?result.expires_at, "refreshed credentials");
				self.current = Some(result.clone());
				let _ = self.state_tx.send(EntryState::Ready(result.clone()));
				self.background.then(|| schedule_next(result.expires_at))
			}
			Err(err) => {
				if self.current_is_valid() {
					warn!(instance = %self.instance, error = %err, "refresh failed, serving cached credentials");
					self.background.then(Instant::now)
				} else {
					warn!(instance = %self.instance, error = %err, "refresh failed with no valid credentials to fall back on");
					let _ = self.state_tx.send(EntryState::Errored(err));
					self
						.background
						.then(|| Instant::now() + Duration::from_secs(1))
				}
			}
		}
	}

	fn current_is_valid(&self) -> bool {
		self
			.current
			.as_ref()
			.is_some_and(|result| result.expires_at > SystemTime::now())
	}

	async fn fetch_and_assemble(&self) -> Result<RefreshResult> {
		let scoped_token = if self.iam_authn {
			Some(self.token_source.database_login_token().await?)
		} else {
			None
		};

		let (metadata, client_chain) = tokio::try_join!(
			self.admin.get_instance_metadata(&self.instance),
			self.admin.sign_client_cert(
				&self.instance,
				&self.key_pair.public_key_der,
				scoped_token.as_ref(),
			),
		)?;

		if self.iam_authn {
			if metadata.database_engine == DatabaseEngine::SqlServer {
				return Err(ConnectorError::ConfigurationInvalid(format!(
					"instance {} is SQL Server, which does not support IAM database authentication",
					self.instance
				)));
			}
			if !metadata.supports_auto_iam_authn {
				return Err(ConnectorError::ConfigurationInvalid(format!(
					"instance {} does not advertise IAM database authentication support",
					self.instance
				)));
			}
		}

		let expires_at = client_chain.leaf_not_after;
		let (tls_config, identity_failure) = verifier::build_client_tls_config(
			&self.instance,
			&metadata,
			&client_chain,
			self.key_pair.private_key.clone_key(),
			self.iam_authn,
		)?;

		Ok(RefreshResult {
			instance: self.instance.clone(),
			metadata,
			client_chain,
			tls_config,
			identity_failure,
			expires_at,
		})
	}
}

/// `expiresAt − max(4min, remainingLifetime/2)`, clamped so refresh never
/// fires later than 4 minutes before expiry and fires immediately once the
/// remaining lifetime drops under an hour (spec §4.4 step 1).
fn schedule_next(expires_at: SystemTime) -> Instant {
	let remaining = expires_at
		.duration_since(SystemTime::now())
		.unwrap_or(Duration::ZERO);
	let margin = if remaining < IMMEDIATE_REFRESH_THRESHOLD {
		remaining
	} else {
		std::cmp::max(MIN_REFRESH_MARGIN, remaining / 2)
	};
	Instant::now() + remaining.saturating_sub(margin)
}

/// Resolves once [`InstanceEntry::close`] has flipped `closing_tx`, so a
/// refresh blocked in [`RateLimiter::acquire`] can be cancelled instead of
/// waiting out the fill interval (SPEC_FULL.md §4.2).
async fn wait_for_close(mut closing_rx: watch::Receiver<bool>) {
	while !*closing_rx.borrow() {
		if closing_rx.changed().await.is_err() {
			return;
		}
	}
}
