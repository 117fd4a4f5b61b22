//! PEM/X.509 parsing helpers shared by the admin adapter and the dialer.
//!
//! Grounded on `caclient.rs`'s `parse_cert`/`parse_cert_multi`/`expiration`:
//! read PEM blocks with `rustls-pemfile`, then pull the validity window out
//! with `x509-parser` rather than hand-rolling ASN.1 decoding.

use std::io::Cursor;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls_pemfile::Item;
use rustls_pki_types::CertificateDer;

use crate::error::ConnectorError;

pub fn parse_cert_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, ConnectorError> {
	let mut reader = std::io::BufReader::new(Cursor::new(pem.as_bytes()));
	let items: Result<Vec<_>, _> = rustls_pemfile::read_all(&mut reader).collect();
	let items = items.map_err(|e| ConnectorError::AdminPermanent(format!("invalid PEM: {e}")))?;
	items
		.into_iter()
		.filter_map(|item| match item {
			Item::X509Certificate(der) => Some(Ok(der)),
			_ => None,
		})
		.collect::<Result<Vec<_>, ConnectorError>>()
		.and_then(|certs| {
			if certs.is_empty() {
				Err(ConnectorError::AdminPermanent(
					"PEM contained no certificates".into(),
				))
			} else {
				Ok(certs)
			}
		})
}

pub fn not_after(cert: &CertificateDer<'_>) -> Result<SystemTime, ConnectorError> {
	let (_, parsed) = x509_parser::parse_x509_certificate(cert)
		.map_err(|e| ConnectorError::AdminPermanent(format!("invalid certificate: {e}")))?;
	let secs = parsed.validity().not_after.timestamp();
	Ok(UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64))
}
