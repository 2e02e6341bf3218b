use super::parse::{parse_bare, parse_keyed, ParseError, ParsedCorrelation};
use crate::config::{IssuanceConfig, IssuanceMode};
use crate::registry::{check_secret, ApplicationRegistry, SecretError};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The secret and lifetime a token is minted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningGrant {
    pub secret: String,
    pub ttl: Duration,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("application key '{0}' is not registered")]
    UnknownApplication(String),
    #[error("registry entry for '{key}' is corrupt: {source}")]
    CorruptSecret {
        key: String,
        #[source]
        source: SecretError,
    },
    #[error("message carries no application key")]
    MissingApplicationKey,
    #[error("registry lookup failed: {0}")]
    Registry(String),
}

/// How comment text is read and which secret signs the resulting token.
pub enum SigningPolicy {
    /// One process-wide secret, long-lived tokens, bare correlation ids.
    GlobalSecret { secret: String, ttl: Duration },
    /// Per-application secrets from the registry, short-lived tokens,
    /// `<id>:<key>` text.
    PerApplication {
        registry: Arc<dyn ApplicationRegistry>,
        ttl: Duration,
    },
}

impl SigningPolicy {
    pub fn from_config(
        config: &IssuanceConfig,
        registry: Arc<dyn ApplicationRegistry>,
    ) -> Result<Self> {
        match config.mode {
            IssuanceMode::GlobalSecret => {
                let secret = config
                    .global_secret
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("JWT_SECRET required!"))?;
                Ok(Self::GlobalSecret {
                    secret: secret.to_string(),
                    ttl: Duration::from_secs(config.global_ttl_secs),
                })
            }
            IssuanceMode::PerApplicationSecret => Ok(Self::PerApplication {
                registry,
                ttl: Duration::from_secs(config.application_ttl_secs),
            }),
        }
    }

    pub fn mode(&self) -> IssuanceMode {
        match self {
            Self::GlobalSecret { .. } => IssuanceMode::GlobalSecret,
            Self::PerApplication { .. } => IssuanceMode::PerApplicationSecret,
        }
    }

    pub fn parse(&self, text: &str) -> Result<ParsedCorrelation, ParseError> {
        match self {
            Self::GlobalSecret { .. } => parse_bare(text),
            Self::PerApplication { .. } => parse_keyed(text),
        }
    }

    /// Pick the signing secret for a parsed correlation.
    pub async fn resolve(&self, application_key: Option<&str>) -> Result<SigningGrant, ResolveError> {
        match self {
            Self::GlobalSecret { secret, ttl } => Ok(SigningGrant {
                secret: secret.clone(),
                ttl: *ttl,
            }),
            Self::PerApplication { registry, ttl } => {
                let key = application_key.ok_or(ResolveError::MissingApplicationKey)?;
                let secret = registry
                    .lookup(key)
                    .await
                    .map_err(|e| ResolveError::Registry(format!("{e:#}")))?
                    .ok_or_else(|| ResolveError::UnknownApplication(key.to_string()))?;
                check_secret(&secret).map_err(|source| ResolveError::CorruptSecret {
                    key: key.to_string(),
                    source,
                })?;
                Ok(SigningGrant { secret, ttl: *ttl })
            }
        }
    }

    /// Secret to verify a presented token with: the caller's own secret when
    /// given, otherwise the global one (global-secret mode only).
    pub fn verification_secret(&self, api_secret: Option<&str>) -> Option<String> {
        let supplied = api_secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);
        match self {
            Self::GlobalSecret { secret, .. } => supplied.or_else(|| Some(secret.clone())),
            Self::PerApplication { .. } => supplied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Credentials, APPLICATION_SECRET_LEN};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FixedRegistry(HashMap<String, String>);

    #[async_trait]
    impl ApplicationRegistry for FixedRegistry {
        async fn lookup(&self, api_key: &str) -> Result<Option<String>> {
            Ok(self.0.get(api_key).cloned())
        }

        async fn create(&self, _ip: &str) -> Result<Credentials> {
            anyhow::bail!("read-only")
        }
    }

    struct BrokenRegistry;

    #[async_trait]
    impl ApplicationRegistry for BrokenRegistry {
        async fn lookup(&self, _api_key: &str) -> Result<Option<String>> {
            anyhow::bail!("database is locked")
        }

        async fn create(&self, _ip: &str) -> Result<Credentials> {
            anyhow::bail!("database is locked")
        }
    }

    fn per_app(entries: &[(&str, &str)]) -> SigningPolicy {
        let map = entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        SigningPolicy::PerApplication {
            registry: Arc::new(FixedRegistry(map)),
            ttl: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn per_application_resolves_registered_secret() {
        let secret = "a".repeat(APPLICATION_SECRET_LEN);
        let policy = per_app(&[("key1", &secret)]);
        let grant = policy.resolve(Some("key1")).await.unwrap();
        assert_eq!(grant.secret, secret);
        assert_eq!(grant.ttl, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn unknown_key_is_rejected() {
        let policy = per_app(&[]);
        assert!(matches!(
            policy.resolve(Some("key9")).await,
            Err(ResolveError::UnknownApplication(k)) if k == "key9"
        ));
        assert!(matches!(
            policy.resolve(None).await,
            Err(ResolveError::MissingApplicationKey)
        ));
    }

    #[tokio::test]
    async fn wrong_length_secret_is_corrupt() {
        let policy = per_app(&[("key1", "0123456789")]);
        let err = policy.resolve(Some("key1")).await.unwrap_err();
        assert!(matches!(err, ResolveError::CorruptSecret { .. }));
        assert!(err.to_string().contains("length 10"));
    }

    #[tokio::test]
    async fn registry_failure_is_reported() {
        let policy = SigningPolicy::PerApplication {
            registry: Arc::new(BrokenRegistry),
            ttl: Duration::from_secs(300),
        };
        let err = policy.resolve(Some("key1")).await.unwrap_err();
        assert!(err.to_string().contains("database is locked"));
    }

    #[tokio::test]
    async fn global_secret_ignores_application_key() {
        let policy = SigningPolicy::GlobalSecret {
            secret: "shh".into(),
            ttl: Duration::from_secs(86_400),
        };
        let grant = policy.resolve(None).await.unwrap();
        assert_eq!(grant.secret, "shh");
        assert_eq!(policy.parse("abc:def").unwrap().correlation_id, "abc:def");
    }

    #[test]
    fn from_config_selects_mode_and_ttl() {
        let registry: Arc<dyn ApplicationRegistry> = Arc::new(FixedRegistry(HashMap::new()));
        let mut config = IssuanceConfig::default();
        let policy = SigningPolicy::from_config(&config, Arc::clone(&registry)).unwrap();
        assert_eq!(policy.mode(), IssuanceMode::PerApplicationSecret);

        config.mode = IssuanceMode::GlobalSecret;
        assert!(SigningPolicy::from_config(&config, Arc::clone(&registry)).is_err());

        config.global_secret = Some("secret".into());
        let policy = SigningPolicy::from_config(&config, registry).unwrap();
        assert!(matches!(
            policy,
            SigningPolicy::GlobalSecret { ttl, .. } if ttl == Duration::from_secs(86_400)
        ));
    }

    #[test]
    fn verification_secret_prefers_caller_secret() {
        let global = SigningPolicy::GlobalSecret {
            secret: "g".into(),
            ttl: Duration::from_secs(1),
        };
        assert_eq!(global.verification_secret(None).as_deref(), Some("g"));
        assert_eq!(global.verification_secret(Some("mine")).as_deref(), Some("mine"));

        let per_app = per_app(&[]);
        assert_eq!(per_app.verification_secret(Some("  ")), None);
        assert_eq!(per_app.verification_secret(Some("mine")).as_deref(), Some("mine"));
    }
}
