//! Fixed-window relay ceilings kept in the shared tier.
//!
//! Every gateway worker counts into the same `rate-limit-*` keys, so a
//! ceiling holds for the whole deployment rather than per process. A window
//! starts with the first relay it counts and ends when its key expires.

use std::{
    fmt,
    net::IpAddr,
    time::Duration,
};

use serde::{
    Deserialize,
    Serialize,
};
use tracing::warn;

use crate::cache::TieredCache;

/// Configuration for per-application and per-client relay ceilings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Relays one application or load balancer may send per window. `0`
    /// disables the dimension.
    #[serde(default = "default_application_limit")]
    pub application_limit: u64,
    /// Relays one client IP may send per window. `0` disables the dimension.
    #[serde(default = "default_ip_limit")]
    pub ip_limit: u64,
    /// Window length (milliseconds).
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_application_limit() -> u64 {
    1_000
}

const fn default_ip_limit() -> u64 {
    100
}

const fn default_window_ms() -> u64 {
    1_000
}

const fn default_enabled() -> bool {
    false
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            application_limit: default_application_limit(),
            ip_limit: default_ip_limit(),
            window_ms: default_window_ms(),
            enabled: default_enabled(),
        }
    }
}

impl RateLimitConfig {
    fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms.max(1))
    }

    fn limit_for(&self, key: &RateLimitKey) -> u64 {
        match key {
            RateLimitKey::Application(_) => self.application_limit,
            RateLimitKey::Ip(_) => self.ip_limit,
        }
    }
}

/// Who a relay is accounted to.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub application_id: Option<String>,
    pub client_ip: Option<IpAddr>,
}

impl RequestIdentity {
    fn keys(&self) -> impl Iterator<Item = RateLimitKey> + '_ {
        self.application_id
            .iter()
            .cloned()
            .map(RateLimitKey::Application)
            .chain(self.client_ip.iter().copied().map(RateLimitKey::Ip))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    Application(String),
    Ip(IpAddr),
}

impl RateLimitKey {
    pub fn dimension(&self) -> &'static str {
        match self {
            RateLimitKey::Application(_) => "application",
            RateLimitKey::Ip(_) => "ip",
        }
    }

    fn counter_key(&self) -> String {
        match self {
            RateLimitKey::Application(id) => format!("rate-limit-application-{id}"),
            RateLimitKey::Ip(ip) => format!("rate-limit-ip-{ip}"),
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKey::Application(id) => write!(f, "application {id}"),
            RateLimitKey::Ip(ip) => write!(f, "ip {ip}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Throttled {
    pub key: RateLimitKey,
    pub retry_after: Duration,
}

#[derive(Clone, Debug)]
pub struct RateLimiter {
    cache: TieredCache,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(cache: TieredCache, config: RateLimitConfig) -> Self {
        Self { cache, config }
    }

    /// Counts the relay against every key the identity maps to and rejects it
    /// once a key went over its ceiling in the current window.
    ///
    /// A shared tier that cannot count lets the relay through.
    pub async fn check(&self, identity: &RequestIdentity) -> Result<(), Throttled> {
        if !self.config.enabled {
            return Ok(());
        }

        let window = self.config.window();
        for key in identity.keys() {
            let limit = self.config.limit_for(&key);
            if limit == 0 {
                continue;
            }

            let count = match self.cache.incr_with_ttl(&key.counter_key(), window).await {
                Ok(count) => count,
                Err(error) => {
                    warn!(
                        target: "relay_gateway::rate_limiter",
                        %key,
                        %error,
                        "Failed to count relay, letting it through"
                    );
                    continue;
                }
            };

            if u64::try_from(count).unwrap_or(0) > limit {
                metrics::counter!(
                    "relay_gateway_rate_limit_reject_total",
                    "dimension" => key.dimension()
                )
                .increment(1);
                return Err(Throttled {
                    key,
                    retry_after: window,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(application_limit: u64) -> RateLimitConfig {
        RateLimitConfig {
            application_limit,
            ip_limit: 1,
            window_ms: 1_000,
            enabled: true,
        }
    }

    fn app(id: &str) -> RequestIdentity {
        RequestIdentity {
            application_id: Some(id.to_string()),
            client_ip: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn relays_over_the_ceiling_wait_for_the_next_window() {
        let limiter = RateLimiter::new(TieredCache::in_memory(), config(2));
        assert!(limiter.check(&app("a")).await.is_ok());
        assert!(limiter.check(&app("a")).await.is_ok());

        let throttled = limiter.check(&app("a")).await.unwrap_err();
        assert_eq!(throttled.key, RateLimitKey::Application("a".into()));
        assert_eq!(throttled.retry_after, Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(limiter.check(&app("a")).await.is_ok());
    }

    #[tokio::test]
    async fn limiters_over_one_store_share_the_ceiling() {
        let cache = TieredCache::in_memory();
        let first = RateLimiter::new(cache.clone(), config(3));
        let second = RateLimiter::new(cache, config(3));

        first.check(&app("a")).await.unwrap();
        second.check(&app("a")).await.unwrap();
        first.check(&app("a")).await.unwrap();

        assert!(second.check(&app("a")).await.is_err());
        assert!(first.check(&app("a")).await.is_err());
    }

    #[tokio::test]
    async fn keys_are_limited_independently() {
        let limiter = RateLimiter::new(TieredCache::in_memory(), config(5));
        let identity = RequestIdentity {
            application_id: Some("a".into()),
            client_ip: Some("10.0.0.1".parse().unwrap()),
        };
        limiter.check(&identity).await.unwrap();
        assert!(limiter.check(&app("a")).await.is_ok());

        let throttled = limiter.check(&identity).await.unwrap_err();
        assert_eq!(throttled.key.dimension(), "ip");
    }

    #[tokio::test]
    async fn a_zero_limit_disables_the_dimension() {
        let limiter = RateLimiter::new(TieredCache::in_memory(), config(0));
        for _ in 0..10 {
            assert!(limiter.check(&app("a")).await.is_ok());
        }
    }

    #[tokio::test]
    async fn disabled_limiter_lets_everything_through() {
        let limiter = RateLimiter::new(TieredCache::in_memory(), RateLimitConfig::default());
        for _ in 0..1_000 {
            assert!(limiter.check(&app("a")).await.is_ok());
        }
    }
}
