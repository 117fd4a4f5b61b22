use base64::Engine;
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::{ConnectorError, Result};
use crate::types::KeyPair;

/// `rcgen::KeyPair` only exposes the SPKI-DER public key via its PEM
/// encoding, so recover the DER bytes by stripping the PEM armor.
fn spki_der_from_pem(pem: &str) -> Vec<u8> {
	let body: String = pem
		.lines()
		.filter(|line| !line.starts_with("-----"))
		.collect();
	base64::engine::general_purpose::STANDARD
		.decode(body)
		.expect("rcgen-produced PEM is valid base64")
}

/// Generates the one client identity keypair used for the lifetime of a
/// [`crate::Connector`]. Key generation is expensive, so it happens once,
/// synchronously, during `Connector` construction (off the hot dial path)
/// rather than per refresh; every `SignClientCert` call reuses the same
/// public key.
///
/// Grounded on `caclient.rs`'s CSR key generation: ECDSA P-256 via `rcgen`
/// rather than RSA-2048, since `rcgen` has no RSA keygen support and the
/// spec accepts "RSA 2048 or equivalent".
#[derive(Debug)]
pub struct KeyProvider {
	key_pair: KeyPair,
}

impl KeyProvider {
	pub fn generate() -> Result<Self> {
		let kp = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
			.map_err(|e| ConnectorError::ConfigurationInvalid(format!("key generation: {e}")))?;
		let public_key_der = spki_der_from_pem(&kp.public_key_pem());
		let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(kp.serialize_der()));
		Ok(Self {
			key_pair: KeyPair {
				public_key_der,
				private_key,
			},
		})
	}

	pub fn key_pair(&self) -> &KeyPair {
		&self.key_pair
	}
}
