use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(feature = "persistence")]
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{AgentError, Result};
use crate::session::Session;

/// Persistence contract for session records, keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Session>>;
    async fn save(&self, session: &Session) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn ids(&self) -> Result<Vec<String>>;
}

pub async fn open_store(cfg: &StorageConfig) -> Result<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match cfg.backend {
        StorageBackend::Memory => Arc::new(InMemorySessionStore::default()),
        StorageBackend::File => Arc::new(FileSessionStore::new(&cfg.file_path)),
        #[cfg(feature = "persistence")]
        StorageBackend::Sqlite => {
            let url = cfg
                .database_url
                .clone()
                .unwrap_or_else(|| "sqlite://sessions.db?mode=rwc".to_string());
            Arc::new(SqlSessionStore::connect(url).await?)
        }
    };
    Ok(store)
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn ids(&self) -> Result<Vec<String>> {
        Ok(self.sessions.read().await.keys().cloned().collect())
    }
}

/// Keeps every session in one JSON object keyed by session id.
pub struct FileSessionStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, Session>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(AgentError::Storage(format!(
                    "failed to read sessions `{}`: {err}",
                    self.path.display()
                )))
            }
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|err| {
            AgentError::Storage(format!(
                "invalid session file `{}`: {err}",
                self.path.display()
            ))
        })
    }

    async fn write_all(&self, sessions: &BTreeMap<String, Session>) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(sessions)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serialized).await.map_err(|err| {
            AgentError::Storage(format!("failed to write `{}`: {err}", tmp.display()))
        })?;
        fs::rename(&tmp, &self.path).await.map_err(|err| {
            AgentError::Storage(format!(
                "failed to replace `{}`: {err}",
                self.path.display()
            ))
        })
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let _guard = self.guard.lock().await;
        Ok(self.read_all().await?.remove(id))
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut sessions = self.read_all().await?;
        sessions.insert(session.id.clone(), session.clone());
        self.write_all(&sessions).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut sessions = self.read_all().await?;
        if sessions.remove(id).is_some() {
            self.write_all(&sessions).await?;
        }
        Ok(())
    }

    async fn ids(&self) -> Result<Vec<String>> {
        let _guard = self.guard.lock().await;
        Ok(self.read_all().await?.into_keys().collect())
    }
}

#[cfg(feature = "persistence")]
pub struct SqlSessionStore {
    pool: SqlitePool,
}

#[cfg(feature = "persistence")]
impl SqlSessionStore {
    const INIT_STATEMENT: &'static str = r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
    "#;

    pub async fn connect(connection_url: impl AsRef<str>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(connection_url.as_ref())
            .await
            .map_err(|err| {
                AgentError::Storage(format!(
                    "failed connecting to SQL backend `{}`: {err}",
                    connection_url.as_ref()
                ))
            })?;

        sqlx::query(Self::INIT_STATEMENT)
            .execute(&pool)
            .await
            .map_err(|err| AgentError::Storage(format!("failed initializing schema: {err}")))?;

        Ok(Self { pool })
    }
}

#[cfg(feature = "persistence")]
#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT payload FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| AgentError::Storage(format!("failed loading session: {err}")))?;

        row.map(|row| {
            let payload: String = row.try_get("payload").map_err(|err| {
                AgentError::Storage(format!("failed decoding session payload: {err}"))
            })?;
            serde_json::from_str(&payload)
                .map_err(|err| AgentError::Storage(format!("invalid session payload: {err}")))
        })
        .transpose()
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let payload = serde_json::to_string(session)?;
        sqlx::query(
            "INSERT INTO sessions (id, payload, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(session.id.as_str())
        .bind(payload)
        .bind(session.last_activity as i64)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|err| AgentError::Storage(format!("failed writing session: {err}")))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| AgentError::Storage(format!("failed deleting session: {err}")))
    }

    async fn ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM sessions ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|err| AgentError::Storage(format!("failed listing sessions: {err}")))?;

        rows.into_iter()
            .map(|row| {
                row.try_get("id")
                    .map_err(|err| AgentError::Storage(format!("failed decoding session id: {err}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_store_keeps_sessions_apart() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("sessions.json"));

        let mut first = Session::new("s1");
        first.push_turn(Role::User, "hello", 10);
        store.save(&first).await.unwrap();
        store.save(&Session::new("s2")).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(store.ids().await.unwrap(), vec!["s1", "s2"]);

        store.remove("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
        assert!(store.load("s2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "not json").unwrap();
        let store = FileSessionStore::new(path);

        assert!(matches!(store.load("s1").await, Err(AgentError::Storage(_))));
    }

    #[cfg(feature = "persistence")]
    #[tokio::test]
    async fn sqlite_store_upserts() {
        let store = SqlSessionStore::connect("sqlite::memory:").await.unwrap();

        let mut session = Session::new("s1");
        store.save(&session).await.unwrap();
        session.awaiting_code = true;
        store.save(&session).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert!(loaded.awaiting_code);
        assert_eq!(store.ids().await.unwrap(), vec!["s1".to_string()]);

        store.remove("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
    }
}
