use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::error::{ConnectorError, Result};
use crate::pem;
use crate::token_source::{BearerToken, TokenSource};
use crate::types::{ClientCertChain, DatabaseEngine, InstanceMetadata, IpKind, ServerCaMode};
use crate::uri::InstanceUri;

/// Abstracts the two remote operations the refresh engine needs from the
/// control plane (spec §4.1). A concrete implementation MAY batch both
/// operations into a single remote call internally; the engine always
/// issues them concurrently and joins (see [`crate::entry`]).
#[async_trait]
pub trait AdminClient: Send + Sync {
	async fn get_instance_metadata(&self, instance: &InstanceUri) -> Result<InstanceMetadata>;

	async fn sign_client_cert(
		&self,
		instance: &InstanceUri,
		public_key_der: &[u8],
		scoped_identity_token: Option<&BearerToken>,
	) -> Result<ClientCertChain>;
}

/// `reqwest`-backed adapter for the Cloud SQL Admin API, grounded on the
/// pack's `reqwest` + `serde_json` REST-client usage
/// (`akamaotto-poblysh-connectors`) and its bearer-token attachment pattern
/// (`agentgateway`'s `http::auth::gcp::insert_token`).
pub struct HttpAdminClient {
	http: reqwest::Client,
	base_url: String,
	quota_project: Option<String>,
	user_agent: String,
	token_source: Arc<dyn TokenSource>,
}

const DEFAULT_BASE_URL: &str = "https://sqladmin.googleapis.com/sql/v1beta4";

impl HttpAdminClient {
	pub fn new(token_source: Arc<dyn TokenSource>) -> Self {
		Self {
			http: reqwest::Client::new(),
			base_url: DEFAULT_BASE_URL.to_string(),
			quota_project: None,
			user_agent: "cloudsql-connector-rs".to_string(),
			token_source,
		}
	}

	pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
		self.base_url = base_url.into();
		self
	}

	pub fn with_quota_project(mut self, quota_project: impl Into<String>) -> Self {
		self.quota_project = Some(quota_project.into());
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.user_agent = user_agent.into();
		self
	}

	fn request(&self, method: reqwest::Method, url: String, token: &str) -> reqwest::RequestBuilder {
		let mut req = self
			.http
			.request(method, url)
			.bearer_auth(token)
			.header(reqwest::header::USER_AGENT, &self.user_agent);
		if let Some(quota_project) = &self.quota_project {
			req = req.header("X-Goog-User-Project", quota_project);
		}
		req
	}

	async fn admin_token(&self) -> Result<BearerToken> {
		self.token_source.token().await
	}
}

#[async_trait]
impl AdminClient for HttpAdminClient {
	async fn get_instance_metadata(&self, instance: &InstanceUri) -> Result<InstanceMetadata> {
		let token = self.admin_token().await?;
		let url = format!(
			"{}/projects/{}/instances/{}/connectSettings",
			self.base_url, instance.project, instance.instance
		);
		let resp = self
			.request(reqwest::Method::GET, url, &token.value)
			.send()
			.await
			.map_err(classify_transport_error)?;
		let resp = classify_status(resp).await?;
		let body: ConnectSettingsResponse = resp
			.json()
			.await
			.map_err(|e| ConnectorError::AdminPermanent(format!("malformed response: {e}")))?;
		body.try_into_metadata()
	}

	async fn sign_client_cert(
		&self,
		instance: &InstanceUri,
		public_key_der: &[u8],
		scoped_identity_token: Option<&BearerToken>,
	) -> Result<ClientCertChain> {
		let token = self.admin_token().await?;
		let url = format!(
			"{}/projects/{}/instances/{}/generateEphemeralCert",
			self.base_url, instance.project, instance.instance
		);
		let public_key_pem = der_to_pem("PUBLIC KEY", public_key_der);
		let body = GenerateEphemeralCertRequest {
			public_key: public_key_pem,
			access_token: scoped_identity_token.map(|t| t.value.clone()),
		};
		let resp = self
			.request(reqwest::Method::POST, url, &token.value)
			.json(&body)
			.send()
			.await
			.map_err(classify_transport_error)?;
		let resp = classify_status(resp).await?;
		let body: GenerateEphemeralCertResponse = resp
			.json()
			.await
			.map_err(|e| ConnectorError::AdminPermanent(format!("malformed response: {e}")))?;

		let certs = pem::parse_cert_chain(&body.ephemeral_cert.cert)?;
		let mut leaf_not_after = pem::not_after(&certs[0])?;
		if let Some(scoped) = scoped_identity_token {
			leaf_not_after = leaf_not_after.min(scoped.expires_at);
		}
		Ok(ClientCertChain {
			certs,
			leaf_not_after,
		})
	}
}

fn der_to_pem(label: &str, der: &[u8]) -> String {
	let encoded = base64::engine::general_purpose::STANDARD.encode(der);
	let mut pem = format!("-----BEGIN {label}-----\n");
	for chunk in encoded.as_bytes().chunks(64) {
		pem.push_str(std::str::from_utf8(chunk).unwrap());
		pem.push('\n');
	}
	pem.push_str(&format!("-----END {label}-----\n"));
	pem
}

fn classify_transport_error(e: reqwest::Error) -> ConnectorError {
	// Any transport-layer failure (connect, timeout, decode of the transport
	// itself) is transient from the refresh loop's perspective; it is
	// retried by `entry::refresh` without surfacing to a dialer.
	ConnectorError::AdminTransient(e.to_string())
}

async fn classify_status(resp: reqwest::Response) -> Result<reqwest::Response> {
	let status = resp.status();
	if status.is_success() {
		return Ok(resp);
	}
	if status.as_u16() == 401 || status.as_u16() == 403 {
		return Err(ConnectorError::Permission(format!(
			"admin API returned {status}"
		)));
	}
	if status.is_server_error() || status.as_u16() == 429 {
		return Err(ConnectorError::AdminTransient(format!(
			"admin API returned {status}"
		)));
	}
	Err(ConnectorError::AdminPermanent(format!(
		"admin API returned {status}"
	)))
}

#[derive(Deserialize)]
struct ConnectSettingsResponse {
	#[serde(rename = "databaseVersion")]
	database_version: String,
	#[serde(rename = "ipAddresses", default)]
	ip_addresses: Vec<IpMapping>,
	#[serde(rename = "dnsName", default)]
	dns_name: Option<String>,
	#[serde(rename = "serverCaCert")]
	server_ca_cert: ServerCaCert,
	#[serde(rename = "serverCaMode", default)]
	server_ca_mode: Option<String>,
	#[serde(rename = "supportsAutoIamAuthN", default)]
	supports_auto_iam_authn: bool,
}

#[derive(Deserialize)]
struct IpMapping {
	#[serde(rename = "type")]
	kind: String,
	#[serde(rename = "ipAddress")]
	ip_address: String,
}

#[derive(Deserialize)]
struct ServerCaCert {
	cert: String,
}

#[derive(serde::Serialize)]
struct GenerateEphemeralCertRequest {
	#[serde(rename = "public_key")]
	public_key: String,
	#[serde(rename = "access_token", skip_serializing_if = "Option::is_none")]
	access_token: Option<String>,
}

#[derive(Deserialize)]
struct GenerateEphemeralCertResponse {
	#[serde(rename = "ephemeralCert")]
	ephemeral_cert: EphemeralCert,
}

#[derive(Deserialize)]
struct EphemeralCert {
	cert: String,
}

impl ConnectSettingsResponse {
	fn try_into_metadata(self) -> Result<InstanceMetadata> {
		let database_engine = classify_engine(&self.database_version)?;
		let mut ip_addresses = BTreeMap::new();
		for entry in self.ip_addresses {
			if let Some(kind) = classify_ip_kind(&entry.kind) {
				ip_addresses.insert(kind, entry.ip_address);
			}
		}
		if ip_addresses.is_empty() && self.dns_name.is_none() {
			return Err(ConnectorError::AdminPermanent(
				"instance advertises no IP addresses".into(),
			));
		}
		let server_ca_certs = pem::parse_cert_chain(&self.server_ca_cert.cert)?;
		let server_ca_mode = match self.server_ca_mode.as_deref() {
			Some("CUSTOMER_MANAGED_CAS_CA") => ServerCaMode::CustomerManaged,
			_ => ServerCaMode::GoogleManaged,
		};
		Ok(InstanceMetadata {
			database_engine,
			version: self.database_version,
			ip_addresses,
			dns_name: self.dns_name,
			server_ca_certs,
			server_ca_mode,
			supports_auto_iam_authn: self.supports_auto_iam_authn,
			supports_metadata_exchange: false,
		})
	}
}

fn classify_engine(version: &str) -> Result<DatabaseEngine> {
	let upper = version.to_ascii_uppercase();
	if upper.starts_with("MYSQL") {
		Ok(DatabaseEngine::Mysql)
	} else if upper.starts_with("POSTGRES") {
		Ok(DatabaseEngine::Postgres)
	} else if upper.starts_with("SQLSERVER") {
		Ok(DatabaseEngine::SqlServer)
	} else {
		Err(ConnectorError::AdminPermanent(format!(
			"unrecognised database engine: {version}"
		)))
	}
}

fn classify_ip_kind(kind: &str) -> Option<IpKind> {
	match kind {
		"PRIMARY" => Some(IpKind::Public),
		"PRIVATE" => Some(IpKind::Private),
		"PSC" => Some(IpKind::Psc),
		_ => None,
	}
}
