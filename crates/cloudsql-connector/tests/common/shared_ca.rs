// Shared CA for test certificate generation.
//
// Adapted from the pack's `shared_ca.rs` (OnceLock'd CA, reused across
// tests instead of regenerated per test), swapped from `openssl` to
// `rcgen` since that's what the connector itself signs certificates with.

use std::sync::OnceLock;

use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, SanType};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

static SHARED_CA: OnceLock<SharedCa> = OnceLock::new();

pub struct SharedCa {
	pub cert_der: CertificateDer<'static>,
	issuer_key: KeyPair,
	issuer_params: CertificateParams,
}

impl SharedCa {
	fn new() -> Self {
		let mut params = CertificateParams::new(Vec::new()).unwrap();
		let mut name = DistinguishedName::new();
		name.push(DnType::CommonName, "cloudsql-connector test CA");
		params.distinguished_name = name;
		params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

		let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
		let cert = params.self_signed(&key).unwrap();
		let cert_der = cert.der().clone();
		SharedCa {
			cert_der,
			issuer_key: key,
			issuer_params: params,
		}
	}

	/// Mints a leaf certificate for `cn` (Google-managed CN form) plus an
	/// optional `dns_name` SAN (customer-managed path).
	pub fn issue_leaf(&self, cn: &str, dns_name: Option<&str>) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
		let mut params = CertificateParams::new(Vec::new()).unwrap();
		let mut name = DistinguishedName::new();
		name.push(DnType::CommonName, cn);
		params.distinguished_name = name;
		if let Some(dns) = dns_name {
			params.subject_alt_names = vec![SanType::DnsName(dns.try_into().unwrap())];
		}

		let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
		let issuer = Issuer::new(self.issuer_params.clone(), &self.issuer_key);
		let cert = params.signed_by(&leaf_key, &issuer).unwrap();
		let cert_der = cert.der().clone();
		let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
		(cert_der, key_der)
	}
}

pub fn get_shared_ca() -> &'static SharedCa {
	SHARED_CA.get_or_init(SharedCa::new)
}
