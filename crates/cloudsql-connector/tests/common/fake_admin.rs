// An in-memory `AdminClient` for integration tests: hands out canned
// metadata/cert-chain responses, counts calls (for the at-most-one-in-
// flight-refresh property), and can be told to fail the next N calls to
// simulate a flapping control plane (spec §8, S3).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use cloudsql_connector::error::{ConnectorError, Result};
use cloudsql_connector::token_source::BearerToken;
use cloudsql_connector::types::{ClientCertChain, InstanceMetadata};
use cloudsql_connector::uri::InstanceUri;
use cloudsql_connector::admin::AdminClient;

use super::shared_ca::get_shared_ca;

pub struct FakeAdminClient {
	metadata: Mutex<InstanceMetadata>,
	cn: Mutex<String>,
	dns_name_for_leaf: Mutex<Option<String>>,
	leaf_lifetime: Mutex<std::time::Duration>,
	fail_next: AtomicUsize,
	sign_calls: AtomicUsize,
	concurrent_signs: AtomicUsize,
	max_concurrent_signs: AtomicUsize,
}

impl FakeAdminClient {
	pub fn new(metadata: InstanceMetadata, cn: impl Into<String>) -> Self {
		Self {
			metadata: Mutex::new(metadata),
			cn: Mutex::new(cn.into()),
			dns_name_for_leaf: Mutex::new(None),
			leaf_lifetime: Mutex::new(std::time::Duration::from_secs(60 * 60)),
			fail_next: AtomicUsize::new(0),
			sign_calls: AtomicUsize::new(0),
			concurrent_signs: AtomicUsize::new(0),
			max_concurrent_signs: AtomicUsize::new(0),
		}
	}

	pub fn fail_next_calls(&self, n: usize) {
		self.fail_next.store(n, Ordering::SeqCst);
	}

	pub fn set_cn(&self, cn: impl Into<String>) {
		*self.cn.lock().unwrap() = cn.into();
	}

	pub fn set_leaf_lifetime(&self, lifetime: std::time::Duration) {
		*self.leaf_lifetime.lock().unwrap() = lifetime;
	}

	pub fn sign_call_count(&self) -> usize {
		self.sign_calls.load(Ordering::SeqCst)
	}

	pub fn max_observed_concurrent_signs(&self) -> usize {
		self.max_concurrent_signs.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl AdminClient for FakeAdminClient {
	async fn get_instance_metadata(&self, _instance: &InstanceUri) -> Result<InstanceMetadata> {
		if self.fail_next.load(Ordering::SeqCst) > 0 {
			self.fail_next.fetch_sub(1, Ordering::SeqCst);
			return Err(ConnectorError::AdminTransient("simulated 503".into()));
		}
		Ok(self.metadata.lock().unwrap().clone())
	}

	async fn sign_client_cert(
		&self,
		_instance: &InstanceUri,
		_public_key_der: &[u8],
		scoped_identity_token: Option<&BearerToken>,
	) -> Result<ClientCertChain> {
		self.sign_calls.fetch_add(1, Ordering::SeqCst);
		let in_flight = self.concurrent_signs.fetch_add(1, Ordering::SeqCst) + 1;
		self
			.max_concurrent_signs
			.fetch_max(in_flight, Ordering::SeqCst);
		// Yield so a second concurrent call (a bug) would actually overlap
		// with this one instead of running start-to-finish uninterrupted.
		tokio::task::yield_now().await;

		if self.fail_next.load(Ordering::SeqCst) > 0 {
			self.fail_next.fetch_sub(1, Ordering::SeqCst);
			self.concurrent_signs.fetch_sub(1, Ordering::SeqCst);
			return Err(ConnectorError::AdminTransient("simulated 503".into()));
		}

		let ca = get_shared_ca();
		let dns_name = self.dns_name_for_leaf.lock().unwrap().clone();
		let (leaf, _key) = ca.issue_leaf(&self.cn.lock().unwrap(), dns_name.as_deref());
		let mut leaf_not_after = SystemTime::now() + *self.leaf_lifetime.lock().unwrap();
		if let Some(token) = scoped_identity_token {
			leaf_not_after = leaf_not_after.min(token.expires_at);
		}
		self.concurrent_signs.fetch_sub(1, Ordering::SeqCst);
		Ok(ClientCertChain {
			certs: vec![leaf, ca.cert_der.clone()],
			leaf_not_after,
		})
	}
}

pub fn sample_metadata(ip_addresses: BTreeMap<cloudsql_connector::types::IpKind, String>) -> InstanceMetadata {
	InstanceMetadata {
		database_engine: cloudsql_connector::types::DatabaseEngine::Postgres,
		version: "POSTGRES_15".into(),
		ip_addresses,
		dns_name: None,
		server_ca_certs: vec![get_shared_ca().cert_der.clone()],
		server_ca_mode: cloudsql_connector::types::ServerCaMode::GoogleManaged,
		supports_auto_iam_authn: true,
		supports_metadata_exchange: false,
	}
}
