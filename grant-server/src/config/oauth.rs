//! OAuth 2.0 authorization server configuration

use confique::Config;
use std::time::Duration;

/// OAuth 2.0 configuration
#[derive(Debug, Config, Clone)]
pub struct OAuthConfig {
    /// Issuer identifier placed in tokens and metadata
    #[config(env = "GRANT_OAUTH_ISSUER", default = "grant-server")]
    pub issuer: String,

    /// Externally reachable base URL, used to build endpoint URLs
    #[config(env = "GRANT_OAUTH_BASE_URL", default = "http://localhost:7788")]
    pub base_url: String,

    /// Lifetime of pushed authorization requests in seconds (default: 15 minutes)
    #[config(env = "GRANT_OAUTH_REQUEST_TTL", default = 900)]
    pub request_ttl: u64,

    /// Lifetime of authorization codes in seconds (default: 10 minutes)
    #[config(env = "GRANT_OAUTH_CODE_TTL", default = 600)]
    pub code_ttl: u64,

    /// Access token TTL in seconds (default: 3600 = 1 hour)
    #[config(env = "GRANT_OAUTH_TOKEN_TTL", default = 3600)]
    pub token_ttl: u64,

    /// Grant lifetime in seconds; 0 keeps grants until revoked
    #[config(env = "GRANT_OAUTH_GRANT_TTL", default = 0)]
    pub grant_ttl: u64,

    /// Interval between sweeps of expired pending requests, in seconds
    #[config(env = "GRANT_OAUTH_SWEEP_INTERVAL", default = 300)]
    pub sweep_interval: u64,

    /// Accept code exchanges for requests pushed without a code challenge
    #[config(env = "GRANT_OAUTH_ALLOW_MISSING_PKCE", default = false)]
    pub allow_missing_pkce: bool,

    /// Base64 encoded 32 byte Ed25519 seed; a random key is generated when empty
    #[config(env = "GRANT_OAUTH_SIGNING_KEY", default = "")]
    pub signing_key: String,
}

impl OAuthConfig {
    pub fn request_ttl(&self) -> Duration {
        Duration::from_secs(self.request_ttl)
    }

    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.code_ttl)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl)
    }

    /// `None` when grants never expire
    pub fn grant_ttl(&self) -> Option<Duration> {
        (self.grant_ttl > 0).then(|| Duration::from_secs(self.grant_ttl))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }

    /// Absolute URL of an endpoint path such as `/authorize`
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OAuthConfig {
        OAuthConfig {
            issuer: "test-issuer".to_string(),
            base_url: "http://auth.example/".to_string(),
            request_ttl: 900,
            code_ttl: 600,
            token_ttl: 3600,
            grant_ttl: 0,
            sweep_interval: 0,
            allow_missing_pkce: false,
            signing_key: String::new(),
        }
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        assert_eq!(config().endpoint("/token"), "http://auth.example/token");
    }

    #[test]
    fn test_zero_grant_ttl_means_never() {
        assert_eq!(config().grant_ttl(), None);
        let config = OAuthConfig {
            grant_ttl: 60,
            ..config()
        };
        assert_eq!(config.grant_ttl(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_sweep_interval_is_never_zero() {
        assert_eq!(config().sweep_interval(), Duration::from_secs(1));
    }
}
