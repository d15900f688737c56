use std::collections::HashMap;

use serde::{
    Deserialize,
    Serialize,
};
use url::Url;

use crate::{
    cache::CacheConfig,
    error::{
        GatewayError,
        Result,
    },
    health::HealthCheckConfig,
    metrics_recorder::MetricsConfig,
    quality::QualityConfig,
    rate_limiter::RateLimitConfig,
    repository::RepositoryConfig,
    secret::SecretKeyCipher,
    session::SessionConfig,
    sticker::StickinessDefaults,
};

/// Runtime configuration of the relay gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Extra attempts after the first relay attempt fails.
    #[serde(default = "default_relay_retries")]
    pub relay_retries: u32,
    /// Budget of one relay attempt (milliseconds). Chains and load balancers
    /// may override it.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Budget of a whole relay including retries (milliseconds).
    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,
    /// Budget of the altruist fallback request (milliseconds).
    #[serde(default = "default_altruist_timeout_ms")]
    pub altruist_timeout_ms: u64,
    /// Lifetime of a node's rolling error counter (seconds).
    #[serde(default = "default_node_error_ttl_secs")]
    pub node_error_ttl_secs: u64,
    /// Fallback endpoints per chain id.
    #[serde(default)]
    pub altruists: HashMap<String, Vec<Url>>,
    /// Hex AES-256 key decrypting application secrets stored encrypted.
    #[serde(default)]
    pub secret_key_encryption_key: Option<String>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub health: HealthCheckConfig,
    #[serde(default)]
    pub stickiness: StickinessDefaults,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub repositories: RepositoryConfig,
}

const fn default_relay_retries() -> u32 {
    2
}

const fn default_request_timeout_ms() -> u64 {
    6_000
}

const fn default_overall_timeout_ms() -> u64 {
    30_000
}

const fn default_altruist_timeout_ms() -> u64 {
    10_000
}

const fn default_node_error_ttl_secs() -> u64 {
    3_600
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            relay_retries: default_relay_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            overall_timeout_ms: default_overall_timeout_ms(),
            altruist_timeout_ms: default_altruist_timeout_ms(),
            node_error_ttl_secs: default_node_error_ttl_secs(),
            altruists: HashMap::new(),
            secret_key_encryption_key: None,
            cache: CacheConfig::default(),
            quality: QualityConfig::default(),
            session: SessionConfig::default(),
            health: HealthCheckConfig::default(),
            stickiness: StickinessDefaults::default(),
            metrics: MetricsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            repositories: RepositoryConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Validates a configuration loaded from disk or the environment.
    pub fn validate(self) -> Result<Self> {
        if self.request_timeout_ms == 0 || self.overall_timeout_ms == 0 {
            return Err(GatewayError::InvalidConfig(
                "relay timeouts must be positive".to_string(),
            ));
        }
        if self.overall_timeout_ms < self.request_timeout_ms {
            return Err(GatewayError::InvalidConfig(
                "overall_timeout_ms must not be shorter than request_timeout_ms".to_string(),
            ));
        }
        if self.health.lock_ttl_secs == 0 {
            return Err(GatewayError::InvalidConfig(
                "health.lock_ttl_secs must be positive".to_string(),
            ));
        }
        for (chain, urls) in &self.altruists {
            if let Some(url) = urls
                .iter()
                .find(|url| !matches!(url.scheme(), "http" | "https"))
            {
                return Err(GatewayError::InvalidConfig(format!(
                    "altruist for chain {chain} must be http(s), got {url}"
                )));
            }
        }
        self.secret_key_cipher()?;

        Ok(self)
    }

    pub fn secret_key_cipher(&self) -> Result<Option<SecretKeyCipher>> {
        self.secret_key_encryption_key
            .as_deref()
            .map(SecretKeyCipher::from_hex)
            .transpose()
            .map_err(|err| GatewayError::InvalidConfig(err.to_string()))
    }

    pub fn altruists_for(&self, chain: &str) -> &[Url] {
        self.altruists
            .get(chain)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default().validate().unwrap();
        assert_eq!(config.relay_retries, 2);
        assert!(config.altruists_for("0021").is_empty());
    }

    #[test]
    fn rejects_overall_budget_below_attempt_budget() {
        let config = GatewayConfig {
            request_timeout_ms: 5_000,
            overall_timeout_ms: 1_000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(GatewayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_non_http_altruists() {
        let mut config = GatewayConfig::default();
        config.altruists.insert(
            "0021".into(),
            vec![Url::parse("ftp://altruist.example").unwrap()],
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_encryption_keys() {
        let config = GatewayConfig {
            secret_key_encryption_key: Some("not-a-key".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
