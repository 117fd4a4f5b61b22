use std::collections::BTreeMap;
use std::time::SystemTime;

use rustls_pki_types::CertificateDer;

use crate::uri::InstanceUri;
use crate::verifier::IdentityFailureSlot;

/// The database engine a Cloud SQL instance runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DatabaseEngine {
	Mysql,
	Postgres,
	SqlServer,
}

/// Which advertised address family to dial.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpKind {
	Public,
	Private,
	Psc,
}

impl IpKind {
	pub fn as_str(self) -> &'static str {
		match self {
			IpKind::Public => "PUBLIC",
			IpKind::Private => "PRIVATE",
			IpKind::Psc => "PSC",
		}
	}
}

/// Which CA issued `server_ca_certs`. Changes which part of the peer-identity
/// check in the dialer applies (see [`crate::verifier`]).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerCaMode {
	GoogleManaged,
	CustomerManaged,
}

/// Instance metadata as returned by the admin control plane. Immutable once
/// constructed; a response missing every advertised IP is rejected by the
/// admin adapter before this type is built (see [`crate::admin`]).
#[derive(Clone, Debug)]
pub struct InstanceMetadata {
	pub database_engine: DatabaseEngine,
	pub version: String,
	pub ip_addresses: BTreeMap<IpKind, String>,
	pub dns_name: Option<String>,
	pub server_ca_certs: Vec<CertificateDer<'static>>,
	pub server_ca_mode: ServerCaMode,
	pub supports_auto_iam_authn: bool,
	/// Capability flag for a versioned metadata-exchange preamble ahead of
	/// the TLS handshake. No admin response in this connector ever sets it;
	/// see `SPEC_FULL.md` §9 for why the write path still exists.
	pub supports_metadata_exchange: bool,
}

impl InstanceMetadata {
	pub fn select_ip(&self, preference: &[IpKind]) -> Option<(IpKind, &str)> {
		preference
			.iter()
			.find_map(|kind| self.ip_addresses.get(kind).map(|ip| (*kind, ip.as_str())))
	}
}

/// Client identity keypair used for every instance's certificate request,
/// generated once per [`crate::Connector`] and reused (see [`crate::keys`]).
pub struct KeyPair {
	pub public_key_der: Vec<u8>,
	pub(crate) private_key: rustls_pki_types::PrivateKeyDer<'static>,
}

impl Clone for KeyPair {
	fn clone(&self) -> Self {
		Self {
			public_key_der: self.public_key_der.clone(),
			private_key: self.private_key.clone_key(),
		}
	}
}

impl std::fmt::Debug for KeyPair {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeyPair")
			.field("public_key_der_len", &self.public_key_der.len())
			.finish_non_exhaustive()
	}
}

/// An ordered client certificate chain; index 0 is the short-lived leaf
/// issued by the instance's CA.
#[derive(Clone, Debug)]
pub struct ClientCertChain {
	pub certs: Vec<CertificateDer<'static>>,
	pub leaf_not_after: SystemTime,
}

/// Immutable, reference-counted bundle of everything a dial needs: the
/// metadata used to pick an IP, the client identity, and a pinned TLS
/// config. Never mutated after construction (see `SPEC_FULL.md` §3).
#[derive(Clone)]
pub struct RefreshResult {
	pub instance: InstanceUri,
	pub metadata: InstanceMetadata,
	pub client_chain: ClientCertChain,
	pub tls_config: std::sync::Arc<rustls::ClientConfig>,
	/// Side channel `build_client_tls_config` wired into `tls_config`'s
	/// verifier; the dialer reads it after a failed handshake to tell a peer
	/// identity mismatch apart from an ordinary TLS error.
	pub identity_failure: IdentityFailureSlot,
	pub expires_at: SystemTime,
}

impl std::fmt::Debug for RefreshResult {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RefreshResult")
			.field("instance", &self.instance.to_string())
			.field("expires_at", &self.expires_at)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	fn metadata_with(kinds: &[IpKind]) -> InstanceMetadata {
		let ip_addresses = kinds
			.iter()
			.map(|kind| (*kind, format!("10.0.0.{}", *kind as u8)))
			.collect();
		InstanceMetadata {
			database_engine: DatabaseEngine::Postgres,
			version: "POSTGRES_15".into(),
			ip_addresses,
			dns_name: None,
			server_ca_certs: vec![],
			server_ca_mode: ServerCaMode::GoogleManaged,
			supports_auto_iam_authn: true,
			supports_metadata_exchange: false,
		}
	}

	#[rstest]
	#[case(&[IpKind::Public], &[IpKind::Public], Some(IpKind::Public))]
	#[case(&[IpKind::Private, IpKind::Public], &[IpKind::Public], Some(IpKind::Public))]
	#[case(&[IpKind::Private, IpKind::Public], &[IpKind::Public, IpKind::Private], Some(IpKind::Public))]
	#[case(&[IpKind::Private], &[IpKind::Public], None)]
	fn select_ip_honours_preference_order(
		#[case] advertised: &[IpKind],
		#[case] preference: &[IpKind],
		#[case] expected: Option<IpKind>,
	) {
		let metadata = metadata_with(advertised);
		let selected = metadata.select_ip(preference).map(|(kind, _)| kind);
		assert_eq!(selected, expected);
	}
}
