pub mod fake_admin;
pub mod proxy_server;
pub mod shared_ca;

use std::sync::OnceLock;

use tokio::sync::Mutex;

static PROXY_PORT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// [`proxy_server::ProxyServer`] binds the connector's one fixed dial port,
/// so tests that start one must not run concurrently with each other.
pub async fn proxy_port_guard() -> tokio::sync::MutexGuard<'static, ()> {
	PROXY_PORT_LOCK.get_or_init(|| Mutex::new(())).lock().await
}

static TRACING_INIT: std::sync::Once = std::sync::Once::new();

/// Installs a `RUST_LOG`-driven fmt subscriber once per test binary, so a
/// failing scenario can be re-run with logging on instead of blind.
pub fn init_tracing() {
	TRACING_INIT.call_once(|| {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
			.with_test_writer()
			.try_init();
	});
}
