//! Process-wide and per-`Connect` configuration (spec §6), grounded on the
//! pack's `serde::Deserialize` config-struct pattern
//! (`akamaotto-poblysh-connectors::config`, `waypoint-core`'s TOML configs).

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::token_source::TokenSource;
use crate::types::IpKind;

fn default_ip_kind_preference() -> Vec<IpKind> {
	vec![IpKind::Public]
}

fn default_handshake_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_user_agent() -> String {
	concat!("cloudsql-connector-rs/", env!("CARGO_PKG_VERSION")).to_string()
}

/// Whether an [`crate::entry::InstanceEntry`] proactively refreshes ahead of
/// expiry or waits for a dialer to notice a stale `current` (spec §6,
/// `refreshStrategy`; design rationale in `SPEC_FULL.md` §9).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshStrategy {
	Background,
	Lazy,
}

impl Default for RefreshStrategy {
	fn default() -> Self {
		RefreshStrategy::Background
	}
}

/// Process-wide defaults, overridable per [`crate::Connector::connect`] via
/// [`ConnectOptions`].
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
	#[serde(rename = "ipKindPreference", default = "default_ip_kind_preference")]
	pub ip_kind_preference: Vec<IpKind>,
	#[serde(rename = "enableIamAuthN")]
	pub enable_iam_authn: bool,
	#[serde(rename = "adminApiEndpoint")]
	pub admin_api_endpoint: Option<String>,
	#[serde(rename = "universeDomain")]
	pub universe_domain: Option<String>,
	#[serde(rename = "quotaProject")]
	pub quota_project: Option<String>,
	#[serde(rename = "handshakeTimeout", with = "duration_secs", default = "default_handshake_timeout")]
	pub handshake_timeout: Duration,
	#[serde(rename = "refreshStrategy", default)]
	pub refresh_strategy: RefreshStrategy,
	#[serde(rename = "userAgent", default = "default_user_agent")]
	pub user_agent: String,
	#[serde(skip)]
	pub credentials_source: Option<Arc<dyn TokenSource>>,
}

impl std::fmt::Debug for ConnectorConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectorConfig")
			.field("ip_kind_preference", &self.ip_kind_preference)
			.field("enable_iam_authn", &self.enable_iam_authn)
			.field("admin_api_endpoint", &self.admin_api_endpoint)
			.field("universe_domain", &self.universe_domain)
			.field("quota_project", &self.quota_project)
			.field("handshake_timeout", &self.handshake_timeout)
			.field("refresh_strategy", &self.refresh_strategy)
			.field("user_agent", &self.user_agent)
			.field("credentials_source", &self.credentials_source.is_some())
			.finish()
	}
}

impl Default for ConnectorConfig {
	fn default() -> Self {
		Self {
			ip_kind_preference: default_ip_kind_preference(),
			enable_iam_authn: false,
			admin_api_endpoint: None,
			universe_domain: None,
			quota_project: None,
			handshake_timeout: default_handshake_timeout(),
			refresh_strategy: RefreshStrategy::default(),
			user_agent: default_user_agent(),
			credentials_source: None,
		}
	}
}

/// Per-`Connect` overrides layered on top of [`ConnectorConfig`]'s defaults.
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
	pub ip_kind_preference: Option<Vec<IpKind>>,
	pub enable_iam_authn: Option<bool>,
	pub handshake_timeout: Option<Duration>,
}

impl ConnectorConfig {
	pub(crate) fn effective_ip_preference<'a>(&'a self, opts: &'a ConnectOptions) -> &'a [IpKind] {
		opts
			.ip_kind_preference
			.as_deref()
			.unwrap_or(&self.ip_kind_preference)
	}

	pub(crate) fn effective_iam_authn(&self, opts: &ConnectOptions) -> bool {
		opts.enable_iam_authn.unwrap_or(self.enable_iam_authn)
	}

	pub(crate) fn effective_handshake_timeout(&self, opts: &ConnectOptions) -> Duration {
		opts.handshake_timeout.unwrap_or(self.handshake_timeout)
	}
}

mod duration_secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let secs = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(secs))
	}
}
