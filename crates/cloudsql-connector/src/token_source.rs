use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use google_cloud_auth::credentials::{self, AccessTokenCredentials};

use crate::error::{ConnectorError, Result};

/// OAuth2 database-login scope requested when IAM database authentication is
/// enabled (see `SPEC_FULL.md` §4.1b).
pub const SQLSERVICE_LOGIN_SCOPE: &str = "https://www.googleapis.com/auth/sqlservice.login";

/// Fallback lifetime assumed for a token whose credential backend doesn't
/// report an expiry. Conservative relative to Google's typical 1h access
/// tokens so the IAM-authN expiry clamp (spec §4.4 step 4) never overshoots.
const ASSUMED_TOKEN_LIFETIME: Duration = Duration::from_secs(55 * 60);

#[derive(Clone, Debug)]
pub struct BearerToken {
	pub value: String,
	pub expires_at: SystemTime,
}

/// Yields OAuth2 bearer tokens for admin API calls and, for IAM database
/// authentication, a second database-login-scoped token. Implementations
/// must report an `expires_at` the engine can trust, since it clamps the
/// issued client certificate's lifetime to it (spec §3, `ClientCertChain`).
#[async_trait]
pub trait TokenSource: Send + Sync {
	async fn token(&self) -> Result<BearerToken>;

	/// A token scoped for IAM database login. Defaults to the same token as
	/// [`TokenSource::token`]; override when admin-API and database-login
	/// scopes diverge.
	async fn database_login_token(&self) -> Result<BearerToken> {
		self.token().await
	}
}

/// Discovers tokens through the standard cloud-credential resolution chain
/// (environment, workload identity, metadata server), matching the pack's
/// `google-cloud-auth`-backed ambient credential lookup.
pub struct AmbientTokenSource {
	creds: AccessTokenCredentials,
}

impl AmbientTokenSource {
	pub fn new() -> Result<Self> {
		let creds = credentials::Builder::default()
			.build_access_token_credentials()
			.map_err(|e| ConnectorError::Permission(format!("no ambient credentials: {e}")))?;
		Ok(Self { creds })
	}
}

#[async_trait]
impl TokenSource for AmbientTokenSource {
	async fn token(&self) -> Result<BearerToken> {
		let token = self
			.creds
			.access_token()
			.await
			.map_err(|e| ConnectorError::Permission(format!("token fetch failed: {e}")))?;
		let expires_at = SystemTime::now() + ASSUMED_TOKEN_LIFETIME;
		Ok(BearerToken {
			value: token.token,
			expires_at,
		})
	}
}

/// A caller-supplied static token, for tests and for embedders that already
/// manage their own credential plumbing (spec §6, `credentialsSource`).
pub struct StaticTokenSource {
	token: BearerToken,
}

impl StaticTokenSource {
	pub fn new(value: impl Into<String>, expires_at: SystemTime) -> Self {
		Self {
			token: BearerToken {
				value: value.into(),
				expires_at,
			},
		}
	}
}

#[async_trait]
impl TokenSource for StaticTokenSource {
	async fn token(&self) -> Result<BearerToken> {
		Ok(self.token.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn static_source_returns_configured_token() {
		let expires_at = SystemTime::now() + Duration::from_secs(600);
		let source = StaticTokenSource::new("tok-123", expires_at);
		let token = source.token().await.unwrap();
		assert_eq!(token.value, "tok-123");
		assert_eq!(token.expires_at, expires_at);
		let login = source.database_login_token().await.unwrap();
		assert_eq!(login.value, "tok-123");
	}
}
