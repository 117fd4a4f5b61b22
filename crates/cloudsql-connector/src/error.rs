use std::sync::Arc;

/// The reason a handshake failed, distinguished because callers are expected
/// to react differently to a [`HandshakeFailure::PeerIdentity`] mismatch
/// (force-invalidate and retry) than to a plain I/O or TLS failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HandshakeFailure {
	#[error("tcp connect failed: {0}")]
	Io(Arc<std::io::Error>),
	#[error("tls handshake failed: {0}")]
	Tls(Arc<rustls::Error>),
	#[error("peer identity mismatch: expected {expected}, certificate presented {actual}")]
	PeerIdentity { expected: String, actual: String },
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectorError {
	#[error("invalid configuration: {0}")]
	ConfigurationInvalid(String),

	#[error("permission denied: {0}")]
	Permission(String),

	#[error("admin API transient failure: {0}")]
	AdminTransient(String),

	#[error("admin API permanent failure: {0}")]
	AdminPermanent(String),

	#[error("timed out: {0}")]
	Timeout(String),

	#[error(transparent)]
	HandshakeFailed(#[from] HandshakeFailure),

	#[error("connector is closed")]
	Closed,
}

impl ConnectorError {
	pub fn is_retryable_by_refresh_loop(&self) -> bool {
		matches!(self, ConnectorError::AdminTransient(_))
	}
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
