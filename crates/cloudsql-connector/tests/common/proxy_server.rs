// A bare TCP+TLS stand-in for the Cloud SQL server-side proxy: listens,
// performs a server-side TLS handshake presenting a configurable leaf
// certificate, then echoes whatever bytes it receives. Adapted from the
// pack's `hbone_server.rs` (bind-and-accept-in-a-loop shape), trimmed from
// an HTTP/2 waypoint down to a raw echo since the connector's wire contract
// (spec §6) is "no additional framing".

use std::net::SocketAddr;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::shared_ca::get_shared_ca;

pub struct ProxyServer {
	pub addr: SocketAddr,
}

/// The connector always dials this fixed port (spec §4.3), so the test
/// double binds it directly rather than an ephemeral port. Tests that use
/// this server must run sequentially within one process.
pub const FIXED_PROXY_PORT: u16 = 3307;

impl ProxyServer {
	/// Binds the fixed proxy port and starts serving in the background,
	/// presenting `leaf_cert`/`leaf_key` on every accepted connection.
	pub async fn start(leaf_cert: CertificateDer<'static>, leaf_key: PrivateKeyDer<'static>) -> Self {
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
		let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], FIXED_PROXY_PORT)))
			.await
			.unwrap();
		let addr = listener.local_addr().unwrap();

		let mut roots = rustls::RootCertStore::empty();
		roots.add(get_shared_ca().cert_der.clone()).unwrap();
		let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
			.build()
			.unwrap();
		let config = rustls::ServerConfig::builder()
			.with_client_cert_verifier(client_verifier)
			.with_single_cert(vec![leaf_cert], leaf_key)
			.unwrap();
		let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

		tokio::spawn(Self::serve(listener, acceptor));
		ProxyServer { addr }
	}

	async fn serve(listener: TcpListener, acceptor: tokio_rustls::TlsAcceptor) {
		loop {
			let Ok((tcp, _)) = listener.accept().await else {
				return;
			};
			let acceptor = acceptor.clone();
			tokio::spawn(async move {
				let mut tls = match acceptor.accept(tcp).await {
					Ok(tls) => tls,
					Err(_) => return,
				};
				let mut buf = [0u8; 1024];
				loop {
					match tls.read(&mut buf).await {
						Ok(0) | Err(_) => return,
						Ok(n) => {
							if tls.write_all(&buf[..n]).await.is_err() {
								return;
							}
						}
					}
				}
			});
		}
	}
}
