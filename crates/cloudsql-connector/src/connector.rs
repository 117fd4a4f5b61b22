//! Process-scoped registry of [`InstanceEntry`] objects (spec §4.5),
//! grounded on `caclient.rs`'s workload-certificate-cache-as-the-one-shared-
//! mutable-thing shape: one small mutex around a map, everything else is
//! reference-counted and lock-free once published.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tracing::info;

use crate::admin::{AdminClient, HttpAdminClient};
use crate::config::{ConnectOptions, ConnectorConfig};
use crate::dialer;
use crate::entry::InstanceEntry;
use crate::error::{ConnectorError, Result};
use crate::keys::KeyProvider;
use crate::ratelimiter::RateLimiter;
use crate::token_source::{AmbientTokenSource, TokenSource};
use crate::types::RefreshResult;
use crate::uri::InstanceUri;

/// A dialed, handshaken connection to an instance's proxy. The caller's
/// database driver speaks the wire protocol over this stream directly; the
/// connector does no framing of its own.
pub type ConnectorStream = TlsStream<tokio::net::TcpStream>;

pub struct Connector {
	config: ConnectorConfig,
	admin: Arc<dyn AdminClient>,
	key_pair: Arc<crate::types::KeyPair>,
	token_source: Arc<dyn TokenSource>,
	rate_limiter: Arc<RateLimiter>,
	entries: Mutex<HashMap<InstanceUri, Arc<InstanceEntry>>>,
	closed: Mutex<bool>,
}

impl Connector {
	/// Generates the client identity keypair (blocking, done once) and
	/// builds the default `reqwest`-backed admin adapter from `config`.
	pub async fn new(config: ConnectorConfig) -> Result<Arc<Self>> {
		let token_source: Arc<dyn TokenSource> = match &config.credentials_source {
			Some(source) => source.clone(),
			None => Arc::new(AmbientTokenSource::new()?),
		};
		let mut admin = HttpAdminClient::new(token_source.clone());
		if let Some(endpoint) = &config.admin_api_endpoint {
			admin = admin.with_base_url(endpoint.clone());
		}
		if let Some(quota_project) = &config.quota_project {
			admin = admin.with_quota_project(quota_project.clone());
		}
		admin = admin.with_user_agent(config.user_agent.clone());
		Self::with_admin_client(config, Arc::new(admin), token_source).await
	}

	/// Like [`Self::new`] but takes an [`AdminClient`] directly, for tests
	/// and embedders fronting a non-HTTP control plane.
	pub async fn with_admin_client(
		config: ConnectorConfig,
		admin: Arc<dyn AdminClient>,
		token_source: Arc<dyn TokenSource>,
	) -> Result<Arc<Self>> {
		let key_pair = tokio::task::spawn_blocking(KeyProvider::generate)
			.await
			.map_err(|e| ConnectorError::ConfigurationInvalid(format!("key generation panicked: {e}")))??;
		Ok(Arc::new(Self {
			config,
			admin,
			key_pair: Arc::new(key_pair.key_pair().clone()),
			token_source,
			rate_limiter: Arc::new(RateLimiter::default_limiter()),
			entries: Mutex::new(HashMap::new()),
			closed: Mutex::new(false),
		}))
	}

	/// Canonicalises `uri`, routes to (or creates) its [`InstanceEntry`],
	/// waits for credentials, selects an IP, and dials.
	pub async fn connect(&self, uri: &str, opts: &ConnectOptions) -> Result<ConnectorStream> {
		let instance: InstanceUri = uri.parse()?;
		self.validate_universe_domain(&instance)?;
		if *self.closed.lock().unwrap() {
			return Err(ConnectorError::Closed);
		}

		let timeout = self.config.effective_handshake_timeout(opts);
		let deadline = Instant::now() + timeout;
		let entry = self.entry_for(&instance, self.config.effective_iam_authn(opts));

		let refresh = entry.get_connection_info(deadline).await?;
		let preference = self.config.effective_ip_preference(opts);
		let remaining = deadline.saturating_duration_since(Instant::now());
		match dialer::dial(&refresh, preference, remaining).await {
			Ok(stream) => Ok(stream),
			Err(err) => {
				if matches!(
					&err,
					ConnectorError::HandshakeFailed(crate::error::HandshakeFailure::PeerIdentity { .. })
				) {
					// The dialer already learned the cached cert doesn't match
					// the server it reached; invalidate so the next caller
					// doesn't retry against the same stale credential.
					let _ = entry.force_invalidate(&refresh).await;
				}
				Err(err)
			}
		}
	}

	/// Closes every entry and stops serving new connects. Safe to call more
	/// than once.
	pub async fn close(&self) {
		let entries: Vec<Arc<InstanceEntry>> = {
			let mut guard = self.entries.lock().unwrap();
			*self.closed.lock().unwrap() = true;
			guard.drain().map(|(_, entry)| entry).collect()
		};
		for entry in entries {
			entry.close().await;
		}
		info!("connector closed");
	}

	/// `ForceInvalidate`, exposed for callers that want to react to a
	/// suspected-stale credential themselves (e.g. a database auth failure)
	/// rather than relying on the dialer's own peer-identity reaction.
	pub async fn force_invalidate(&self, uri: &str, stale: &Arc<RefreshResult>) -> Result<()> {
		let instance: InstanceUri = uri.parse()?;
		let entry = {
			let guard = self.entries.lock().unwrap();
			guard.get(&instance).cloned()
		};
		match entry {
			Some(entry) => entry.force_invalidate(stale).await,
			None => Ok(()),
		}
	}

	/// `iam_authn` only takes effect the first time this instance is seen: the
	/// entry it spawns is then shared by every later caller regardless of
	/// what they pass, the same way the credential mode an instance connects
	/// with is effectively pinned by whoever dials it first upstream.
	fn entry_for(&self, instance: &InstanceUri, iam_authn: bool) -> Arc<InstanceEntry> {
		let mut guard = self.entries.lock().unwrap();
		guard
			.entry(instance.clone())
			.or_insert_with(|| {
				InstanceEntry::spawn(
					instance.clone(),
					self.admin.clone(),
					self.key_pair.clone(),
					self.token_source.clone(),
					self.rate_limiter.clone(),
					iam_authn,
					matches!(self.config.refresh_strategy, crate::config::RefreshStrategy::Background),
				)
			})
			.clone()
	}

	fn validate_universe_domain(&self, instance: &InstanceUri) -> Result<()> {
		if let Some(expected) = &self.config.universe_domain
			&& instance.universe_domain != *expected
		{
			return Err(ConnectorError::ConfigurationInvalid(format!(
				"instance universe domain {:?} does not match configured {:?}",
				instance.universe_domain, expected
			)));
		}
		Ok(())
	}
}
