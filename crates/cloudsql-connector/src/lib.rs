//! Authenticated, mutually-TLS-encrypted connections to managed Cloud SQL
//! instances: periodically refreshed instance metadata and a short-lived
//! client certificate, handed off as a ready-to-use encrypted TCP stream
//! whose peer identity has been checked against the instance the caller
//! asked for.

pub mod admin;
pub mod config;
pub mod connector;
mod dialer;
mod entry;
pub mod error;
mod keys;
mod pem;
mod ratelimiter;
pub mod token_source;
pub mod types;
pub mod uri;
mod verifier;

pub use config::{ConnectOptions, ConnectorConfig, RefreshStrategy};
pub use connector::{Connector, ConnectorStream};
pub use entry::EntryState;
pub use error::{ConnectorError, HandshakeFailure, Result};
pub use types::{ClientCertChain, DatabaseEngine, InstanceMetadata, IpKind, KeyPair, RefreshResult, ServerCaMode};
pub use uri::InstanceUri;
