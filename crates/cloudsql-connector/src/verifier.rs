//! Custom peer-identity verification layered on top of standard chain
//! validation (spec §4.3). Cloud SQL server certificates are issued for a
//! regional proxy shared by many instances, so standard hostname
//! verification against the dialed IP cannot prove the proxy routed to the
//! instance the caller asked for — the identity baked into the leaf's CN
//! (or its SAN, for customer-managed CAs) is the authoritative binding.
//!
//! Grounded on `caclient.rs`'s `.dangerous().with_custom_certificate_verifier`
//! pattern (delegate to a `WebPkiServerVerifier` built from pinned roots,
//! then add a domain-specific check) and the pack's delegating-verifier
//! shape in `lexe-api`'s `tls::shared_seed` module.

use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::server::ParsedCertificate;
use rustls::{DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::error::{ConnectorError, HandshakeFailure, Result};
use crate::types::{ClientCertChain, InstanceMetadata, ServerCaMode};
use crate::uri::InstanceUri;

/// Set by [`InstanceIdentityVerifier::verify_server_cert`] when the chain is
/// cryptographically valid but the CN/SAN binding fails, so the dialer can
/// surface [`HandshakeFailure::PeerIdentity`] instead of a generic TLS
/// error. `rustls::Error` has no payload slot for this, so the mismatch is
/// smuggled out through a side channel shared with the dialer.
pub type IdentityFailureSlot = Arc<Mutex<Option<(String, String)>>>;

#[derive(Debug)]
pub struct InstanceIdentityVerifier {
	roots: RootCertStore,
	supported_algs: WebPkiSupportedAlgorithms,
	expected_cn: String,
	expected_dns_name: Option<String>,
	server_ca_mode: ServerCaMode,
	failure: IdentityFailureSlot,
}

impl InstanceIdentityVerifier {
	/// `roots` must contain only the instance's own `server_ca_certs` (spec
	/// §4.3): the proxy's leaf is never issued by a public CA, so the system
	/// trust store has no role here.
	pub fn new(
		roots: RootCertStore,
		instance: &InstanceUri,
		metadata: &InstanceMetadata,
	) -> Result<(Arc<Self>, IdentityFailureSlot)> {
		let supported_algs = CryptoProvider::get_default()
			.map(|p| p.signature_verification_algorithms)
			.unwrap_or(rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms);
		let failure: IdentityFailureSlot = Arc::new(Mutex::new(None));
		Ok((
			Arc::new(Self {
				roots,
				supported_algs,
				expected_cn: instance.google_managed_cn(),
				expected_dns_name: metadata.dns_name.clone(),
				server_ca_mode: metadata.server_ca_mode,
				failure: failure.clone(),
			}),
			failure,
		))
	}

	fn check_identity(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), (String, String)> {
		let (_, cert) = x509_parser::parse_x509_certificate(end_entity)
			.map_err(|e| (self.expected_label(), format!("unparseable certificate: {e}")))?;

		let san_dns_names = subject_alt_dns_names(&cert);
		if let Some(expected_dns) = &self.expected_dns_name
			&& san_dns_names
				.iter()
				.any(|san| san.eq_ignore_ascii_case(expected_dns))
		{
			return Ok(());
		}

		if self.server_ca_mode == ServerCaMode::GoogleManaged {
			let cn = common_name(&cert);
			if cn.as_deref() == Some(self.expected_cn.as_str()) {
				return Ok(());
			}
			let actual = cn.unwrap_or_else(|| "<no CN>".to_string());
			return Err((self.expected_label(), actual));
		}

		let actual = if san_dns_names.is_empty() {
			"<no dNSName SAN>".to_string()
		} else {
			san_dns_names.join(",")
		};
		Err((self.expected_label(), actual))
	}

	fn expected_label(&self) -> String {
		match (&self.expected_dns_name, self.server_ca_mode) {
			(Some(dns), _) => dns.clone(),
			(None, ServerCaMode::GoogleManaged) => self.expected_cn.clone(),
			(None, ServerCaMode::CustomerManaged) => "<no dnsName configured>".to_string(),
		}
	}
}

impl ServerCertVerifier for InstanceIdentityVerifier {
	/// Validates the chain against `self.roots` but deliberately skips
	/// webpki's hostname check: Cloud SQL leaf certificates bind an instance,
	/// not a DNS name reachable at the dialed IP, so `server_name` carries no
	/// information this verifier trusts. [`Self::check_identity`] is the
	/// actual binding.
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		now: UnixTime,
	) -> std::result::Result<ServerCertVerified, TlsError> {
		let cert = ParsedCertificate::try_from(end_entity)?;
		verify_server_cert_signed_by_trust_anchor(&cert, &self.roots, intermediates, now, self.supported_algs.all)?;

		self.check_identity(end_entity).map_err(|(expected, actual)| {
			*self.failure.lock().unwrap() = Some((expected, actual));
			TlsError::General("cloudsql peer identity mismatch".to_string())
		})?;
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> std::result::Result<HandshakeSignatureValid, TlsError> {
		verify_tls12_signature(message, cert, dss, &self.supported_algs)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> std::result::Result<HandshakeSignatureValid, TlsError> {
		verify_tls13_signature(message, cert, dss, &self.supported_algs)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.supported_algs.supported_schemes()
	}
}

/// Assembles the pinned `rustls::ClientConfig` a [`crate::dialer`] presents
/// for one instance: custom roots built from the instance's own server CA
/// certs (never the system trust store), this module's identity verifier,
/// and the client's ephemeral certificate as TLS client auth.
///
/// `require_tls13` is set when IAM database authentication is in effect,
/// matching the upstream proxy's requirement that the access-token SNI
/// extension only be negotiated over TLS 1.3.
pub fn build_client_tls_config(
	instance: &InstanceUri,
	metadata: &InstanceMetadata,
	client_chain: &ClientCertChain,
	private_key: PrivateKeyDer<'static>,
	require_tls13: bool,
) -> Result<(Arc<rustls::ClientConfig>, IdentityFailureSlot)> {
	let mut roots = RootCertStore::empty();
	for ca in &metadata.server_ca_certs {
		roots
			.add(ca.clone())
			.map_err(|e| ConnectorError::AdminPermanent(format!("invalid server CA certificate: {e}")))?;
	}
	let (verifier, failure) = InstanceIdentityVerifier::new(roots, instance, metadata)?;

	let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
	let versions: &[&rustls::SupportedProtocolVersion] = if require_tls13 {
		&[&rustls::version::TLS13]
	} else {
		&[&rustls::version::TLS12, &rustls::version::TLS13]
	};
	let config = rustls::ClientConfig::builder_with_provider(provider)
		.with_protocol_versions(versions)
		.map_err(|e| ConnectorError::ConfigurationInvalid(format!("unsupported tls protocol versions: {e}")))?
		.dangerous()
		.with_custom_certificate_verifier(verifier)
		.with_client_auth_cert(client_chain.certs.clone(), private_key)
		.map_err(|e| ConnectorError::ConfigurationInvalid(format!("invalid client certificate: {e}")))?;
	Ok((Arc::new(config), failure))
}

/// Turns whatever the handshake produced plus the identity side-channel
/// into the `HandshakeFailure` taxonomy callers react to.
pub fn classify_handshake_error(err: TlsError, failure: &IdentityFailureSlot) -> HandshakeFailure {
	if let Some((expected, actual)) = failure.lock().unwrap().take() {
		return HandshakeFailure::PeerIdentity { expected, actual };
	}
	HandshakeFailure::Tls(Arc::new(err))
}

fn common_name(cert: &X509Certificate<'_>) -> Option<String> {
	cert
		.subject()
		.iter_common_name()
		.next()
		.and_then(|cn| cn.as_str().ok())
		.map(|s| s.to_string())
}

fn subject_alt_dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
	cert
		.subject_alternative_name()
		.ok()
		.flatten()
		.map(|ext| {
			ext
				.value
				.general_names
				.iter()
				.filter_map(|name| match name {
					GeneralName::DNSName(dns) => Some((*dns).to_string()),
					_ => None,
				})
				.collect()
		})
		.unwrap_or_default()
}
