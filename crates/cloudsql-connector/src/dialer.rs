//! Opens the TCP + mTLS connection to a Cloud SQL instance's proxy once an
//! [`RefreshResult`] is available (spec §4.3). Grounded on `caclient.rs`'s
//! split between assembling a pinned `ClientConfig` and the transport code
//! that actually dials with it; the raw-TCP-then-handshake shape itself
//! matches the pack's `hbone_server.rs` test harness.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{ConnectorError, HandshakeFailure, Result};
use crate::types::{IpKind, RefreshResult};
use crate::verifier::{IdentityFailureSlot, classify_handshake_error};

/// Every Cloud SQL proxy listens on this port regardless of database engine.
pub const SERVER_PROXY_PORT: u16 = 3307;

/// Version byte written ahead of the TLS `ClientHello` when a metadata
/// exchange preamble is negotiated (`InstanceMetadata::supports_metadata_exchange`).
/// No admin response this connector parses ever sets that flag today, so this
/// path has no real caller outside its unit test; kept so a future admin
/// response can turn it on without a `Dialer` change.
const METADATA_EXCHANGE_VERSION: u8 = 1;

/// Dials the IP `refresh` selected via `preference`, under `timeout`.
///
/// A caller-visible `server_name` is required by the `rustls` API but is
/// never trusted for identity: [`crate::verifier::InstanceIdentityVerifier`]
/// ignores it and binds on CN/SAN instead, so any syntactically valid name
/// works here.
pub async fn dial(
	refresh: &RefreshResult,
	preference: &[IpKind],
	timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
	let (_kind, ip) = refresh.metadata.select_ip(preference).ok_or_else(|| {
		ConnectorError::ConfigurationInvalid(format!(
			"instance {} has no IP matching preference {preference:?}",
			refresh.instance
		))
	})?;
	let addr: SocketAddr = format!("{ip}:{SERVER_PROXY_PORT}")
		.parse()
		.map_err(|e| ConnectorError::ConfigurationInvalid(format!("invalid instance IP {ip:?}: {e}")))?;

	tokio::time::timeout(timeout, dial_addr(addr, refresh))
		.await
		.unwrap_or_else(|_| Err(ConnectorError::Timeout(format!("dial to {addr} timed out"))))
}

async fn dial_addr(addr: SocketAddr, refresh: &RefreshResult) -> Result<TlsStream<TcpStream>> {
	let mut tcp = TcpStream::connect(addr)
		.await
		.map_err(|e| HandshakeFailure::Io(Arc::new(e)))?;
	tcp.set_nodelay(true).ok();

	if refresh.metadata.supports_metadata_exchange {
		tcp
			.write_all(&[METADATA_EXCHANGE_VERSION])
			.await
			.map_err(|e| HandshakeFailure::Io(Arc::new(e)))?;
	}

	// Any valid DNS-ish name; the custom verifier never consults it.
	let server_name = rustls_pki_types::ServerName::try_from("cloudsql-proxy.invalid")
		.expect("static server name is always valid");
	let connector = TlsConnector::from(refresh.tls_config.clone());
	connector
		.connect(server_name, tcp)
		.await
		.map_err(|e| classify_tls_io_error(e, &refresh.identity_failure).into())
}

/// `tokio_rustls` surfaces handshake failures as `io::Error`, boxing the
/// originating `rustls::Error` as its source when the failure happened
/// inside the TLS state machine rather than the socket itself.
fn classify_tls_io_error(e: std::io::Error, failure: &IdentityFailureSlot) -> HandshakeFailure {
	if let Some(tls_err) = e
		.get_ref()
		.and_then(|inner| inner.downcast_ref::<rustls::Error>())
	{
		return classify_handshake_error(tls_err.clone(), failure);
	}
	HandshakeFailure::Io(Arc::new(e))
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;
	use std::sync::Mutex;
	use std::time::SystemTime;

	use super::*;
	use crate::types::{ClientCertChain, DatabaseEngine, InstanceMetadata, ServerCaMode};
	use crate::uri::InstanceUri;

	fn refresh_with(ip_addresses: BTreeMap<IpKind, String>) -> RefreshResult {
		let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
		let tls_config = rustls::ClientConfig::builder_with_provider(provider)
			.with_safe_default_protocol_versions()
			.unwrap()
			.with_root_certificates(rustls::RootCertStore::empty())
			.with_no_client_auth();
		RefreshResult {
			instance: InstanceUri::new("demo-project", "us-central1", "main"),
			metadata: InstanceMetadata {
				database_engine: DatabaseEngine::Postgres,
				version: "POSTGRES_15".into(),
				ip_addresses,
				dns_name: None,
				server_ca_certs: vec![],
				server_ca_mode: ServerCaMode::GoogleManaged,
				supports_auto_iam_authn: false,
				supports_metadata_exchange: false,
			},
			client_chain: ClientCertChain {
				certs: vec![],
				leaf_not_after: SystemTime::now(),
			},
			tls_config: Arc::new(tls_config),
			identity_failure: Arc::new(Mutex::new(None)),
			expires_at: SystemTime::now(),
		}
	}

	#[tokio::test]
	async fn rejects_when_no_ip_matches_preference() {
		let refresh = refresh_with(BTreeMap::new());
		let err = dial(&refresh, &[IpKind::Public], Duration::from_secs(1))
			.await
			.unwrap_err();
		assert!(matches!(err, ConnectorError::ConfigurationInvalid(_)));
	}

	#[tokio::test]
	async fn writes_metadata_exchange_preamble_before_the_handshake() {
		use tokio::io::AsyncReadExt;
		use tokio::net::TcpListener;

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let observed = tokio::spawn(async move {
			let (mut tcp, _) = listener.accept().await.unwrap();
			let mut byte = [0u8; 1];
			tcp.read_exact(&mut byte).await.unwrap();
			byte[0]
		});

		let mut refresh = refresh_with(BTreeMap::new());
		refresh.metadata.supports_metadata_exchange = true;
		// The handshake itself will fail (no server TLS on the other end); only
		// the preamble write, which happens first, is under test here.
		let _ = dial_addr(addr, &refresh).await;

		assert_eq!(observed.await.unwrap(), METADATA_EXCHANGE_VERSION);
	}
}
