use super::{Application, ApplicationRegistry, Credentials};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

/// Attempts before giving up on a create that keeps colliding with existing rows.
const MAX_CREATE_ATTEMPTS: usize = 3;

/// Application registry persisted in a single SQLite file.
#[derive(Clone)]
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create registry directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open registry DB: {}", db_path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory registry")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS applications (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                api_key     TEXT NOT NULL UNIQUE,
                api_secret  TEXT NOT NULL UNIQUE,
                ip          TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );",
        )
        .context("Failed to initialize registry schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .context("Registry task panicked")?
    }

    /// Full row for `api_key`.
    pub async fn get(&self, api_key: &str) -> Result<Option<Application>> {
        let api_key = api_key.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT api_key, api_secret, ip, created_at FROM applications WHERE api_key = ?1",
                params![api_key],
                |row| {
                    Ok::<(String, String, String, String), rusqlite::Error>((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query application")?
            .map(|(api_key, api_secret, registered_from_ip, created_at)| {
                Ok(Application {
                    api_key,
                    api_secret,
                    registered_from_ip,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .transpose()
        })
        .await
    }

    /// Store an existing key/secret pair verbatim.
    #[cfg(test)]
    pub(crate) async fn insert(&self, credentials: Credentials, ip: &str) -> Result<()> {
        let ip = ip.to_string();
        self.blocking(move |conn| {
            insert_row(conn, &credentials, &ip, Utc::now())?;
            Ok(())
        })
        .await
    }

    /// Number of registered applications.
    pub async fn count(&self) -> Result<usize> {
        self.blocking(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM applications", [], |row| row.get(0))
                .context("Failed to count applications")?;
            Ok(usize::try_from(n).unwrap_or(0))
        })
        .await
    }
}

fn insert_row(
    conn: &Connection,
    credentials: &Credentials,
    ip: &str,
    created_at: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO applications (api_key, api_secret, ip, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            credentials.api_key,
            credentials.api_secret,
            ip,
            created_at.to_rfc3339()
        ],
    )
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp in registry: {raw}"))?
        .with_timezone(&Utc))
}

#[async_trait]
impl ApplicationRegistry for SqliteRegistry {
    async fn lookup(&self, api_key: &str) -> Result<Option<String>> {
        let api_key = api_key.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT api_secret FROM applications WHERE api_key = ?1",
                params![api_key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up application secret")
        })
        .await
    }

    async fn create(&self, ip: &str) -> Result<Credentials> {
        let ip = ip.to_string();
        self.blocking(move |conn| {
            for attempt in 1..=MAX_CREATE_ATTEMPTS {
                let credentials = Credentials::generate();
                match insert_row(conn, &credentials, &ip, Utc::now()) {
                    Ok(_) => {
                        tracing::info!(api_key = %credentials.api_key, ip = %ip, "Application registered");
                        return Ok(credentials);
                    }
                    Err(e) if is_unique_violation(&e) => {
                        tracing::warn!(attempt, "Generated application credentials collided, retrying");
                    }
                    Err(e) => return Err(e).context("Failed to insert application"),
                }
            }
            anyhow::bail!("Could not generate unique application credentials after {MAX_CREATE_ATTEMPTS} attempts")
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{check_secret, APPLICATION_SECRET_LEN};
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_then_lookup_returns_secret() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let creds = registry.create("127.0.0.1").await.unwrap();

        let secret = registry.lookup(&creds.api_key).await.unwrap();
        assert_eq!(secret.as_deref(), Some(creds.api_secret.as_str()));
        assert_eq!(creds.api_secret.len(), APPLICATION_SECRET_LEN);
        assert!(check_secret(&creds.api_secret).is_ok());
    }

    #[tokio::test]
    async fn lookup_unknown_key_is_none() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        assert_eq!(registry.lookup("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_records_ip_and_creation_time() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let before = Utc::now();
        let creds = registry.create("10.0.0.7").await.unwrap();

        let app = registry.get(&creds.api_key).await.unwrap().unwrap();
        assert_eq!(app.registered_from_ip, "10.0.0.7");
        assert_eq!(app.api_secret, creds.api_secret);
        assert!(app.created_at >= before - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn duplicate_key_or_secret_is_rejected() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let creds = Credentials {
            api_key: "key1".into(),
            api_secret: "a".repeat(APPLICATION_SECRET_LEN),
        };
        registry.insert(creds.clone(), "ip").await.unwrap();

        let same_key = Credentials {
            api_secret: "b".repeat(APPLICATION_SECRET_LEN),
            ..creds.clone()
        };
        assert!(registry.insert(same_key, "ip").await.is_err());

        let same_secret = Credentials {
            api_key: "key2".into(),
            ..creds
        };
        assert!(registry.insert(same_secret, "ip").await.is_err());
        assert_eq!(registry.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn file_registry_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("apps.db");

        let creds = {
            let registry = SqliteRegistry::open(&path).unwrap();
            registry.create("::1").await.unwrap()
        };

        let reopened = SqliteRegistry::open(&path).unwrap();
        assert_eq!(
            reopened.lookup(&creds.api_key).await.unwrap(),
            Some(creds.api_secret)
        );
    }
}
