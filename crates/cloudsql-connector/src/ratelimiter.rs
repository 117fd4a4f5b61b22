use std::num::NonZeroU32;
use std::time::Duration;

use governor::{Quota, RateLimiter as GovernorLimiter};

use crate::error::{ConnectorError, Result};

/// Token-bucket gate shared by every [`crate::entry::InstanceEntry`] in a
/// [`crate::Connector`], guarding calls into the [`crate::admin::AdminClient`]
/// (spec §4.2). Grounded on `governor`'s use as an outbound-call limiter in
/// front of a Google OAuth refresh loop (`yeshanjun-pollux`), the same
/// "gate calls into an identity control plane" shape as this refresh loop.
pub struct RateLimiter {
	inner: GovernorLimiter<
		governor::state::direct::NotKeyed,
		governor::state::InMemoryState,
		governor::clock::DefaultClock,
	>,
}

/// `B = 2` burst, one token every 30s (spec §4.2 suggested defaults).
pub const DEFAULT_BURST: u32 = 2;
pub const DEFAULT_FILL_INTERVAL: Duration = Duration::from_secs(30);

impl RateLimiter {
	pub fn new(burst: u32, fill_interval: Duration) -> Result<Self> {
		let burst = NonZeroU32::new(burst)
			.ok_or_else(|| ConnectorError::ConfigurationInvalid("rate limiter burst must be > 0".into()))?;
		let quota = Quota::with_period(fill_interval)
			.ok_or_else(|| {
				ConnectorError::ConfigurationInvalid("rate limiter fill interval must be > 0".into())
			})?
			.allow_burst(burst);
		Ok(Self {
			inner: GovernorLimiter::direct(quota),
		})
	}

	pub fn default_limiter() -> Self {
		Self::new(DEFAULT_BURST, DEFAULT_FILL_INTERVAL).expect("default rate limiter config is valid")
	}

	/// Acquire one token, cancellable via `cancel`. Used before every
	/// refresh attempt (spec §4.4 step 2).
	pub async fn acquire(&self, cancel: impl std::future::Future<Output = ()>) -> Result<()> {
		tokio::select! {
			_ = self.inner.until_ready() => Ok(()),
			_ = cancel => Err(ConnectorError::Timeout("rate limiter acquisition cancelled".into())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::future::pending;

	#[tokio::test(start_paused = true)]
	async fn burst_then_throttled() {
		let limiter = RateLimiter::new(2, Duration::from_secs(30)).unwrap();
		limiter.acquire(pending()).await.unwrap();
		limiter.acquire(pending()).await.unwrap();

		let throttled = tokio::time::timeout(Duration::from_millis(1), limiter.acquire(pending())).await;
		assert!(throttled.is_err(), "third acquisition should block until refill");

		tokio::time::advance(Duration::from_secs(30)).await;
		limiter.acquire(pending()).await.unwrap();
	}

	#[tokio::test]
	async fn cancel_wins_when_limiter_is_exhausted() {
		let limiter = RateLimiter::new(1, Duration::from_secs(3600)).unwrap();
		limiter.acquire(pending()).await.unwrap();

		let result = limiter.acquire(async {}).await;
		assert!(matches!(result, Err(ConnectorError::Timeout(_))));
	}
}
