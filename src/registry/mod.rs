pub mod sqlite;

pub use sqlite::SqliteRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Random bytes behind an application key (hex-encoded on the wire).
pub const APPLICATION_KEY_BYTES: usize = 16;
/// Random bytes behind an application secret (hex-encoded on the wire).
pub const APPLICATION_SECRET_BYTES: usize = 32;
/// Length of a well-formed, hex-encoded application secret.
pub const APPLICATION_SECRET_LEN: usize = APPLICATION_SECRET_BYTES * 2;

/// A registered application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Application {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "apiSecret")]
    pub api_secret: String,
    #[serde(rename = "registeredFromIP")]
    pub registered_from_ip: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Freshly generated key/secret pair, as returned to the registering client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "apiSecret")]
    pub api_secret: String,
}

impl Credentials {
    /// Draw a new key/secret pair from the OS CSPRNG.
    pub fn generate() -> Self {
        let key: [u8; APPLICATION_KEY_BYTES] = rand::random();
        let secret: [u8; APPLICATION_SECRET_BYTES] = rand::random();
        Self {
            api_key: hex::encode(key),
            api_secret: hex::encode(secret),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    #[error("application secret has length {actual}, expected {expected}")]
    WrongLength { expected: usize, actual: usize },
}

/// Reject secrets that cannot have come from [`Credentials::generate`].
pub fn check_secret(secret: &str) -> Result<(), SecretError> {
    if secret.len() != APPLICATION_SECRET_LEN {
        return Err(SecretError::WrongLength {
            expected: APPLICATION_SECRET_LEN,
            actual: secret.len(),
        });
    }
    Ok(())
}

/// Key → secret store for registered applications
#[async_trait]
pub trait ApplicationRegistry: Send + Sync {
    /// Secret for `api_key`, or `None` when the key is not registered
    async fn lookup(&self, api_key: &str) -> anyhow::Result<Option<String>>;

    /// Register a new application from `ip` and return its credentials
    async fn create(&self, ip: &str) -> anyhow::Result<Credentials>;
}
