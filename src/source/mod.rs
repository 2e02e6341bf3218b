pub mod codepen;

pub use codepen::CodePenSource;

use async_trait::async_trait;

/// A comment as fetched from the external source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: String,
    pub raw_text: String,
    pub poster_id: Option<u64>,
    pub poster_handle: String,
    pub display_name: String,
}

/// External message store the engine polls; implement for any content source
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Human-readable source name (for logs)
    fn name(&self) -> &str;

    /// Fetch every message currently visible on the source
    async fn fetch_all(&self) -> anyhow::Result<Vec<RawMessage>>;

    /// Remove a consumed message
    async fn delete(&self, message_id: &str) -> anyhow::Result<()>;

    /// Renew whatever session material the source needs (cookies, CSRF token)
    async fn refresh_session(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
