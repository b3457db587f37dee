//! Per-conversation state: authentication flags, token material and history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::Result;
use crate::storage::SessionStore;

/// Seconds an access token is treated as expired before its real deadline.
const EXPIRY_SKEW_SECS: u64 = 60;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Credentials granted by the provider for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenMaterial {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Unix seconds; `None` when the provider did not report a lifetime.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl TokenMaterial {
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at
            .map(|deadline| now.saturating_add(EXPIRY_SKEW_SECS) >= deadline)
            .unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthState {
    Unauthenticated,
    AwaitingCode,
    Authenticated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub token: Option<TokenMaterial>,
    #[serde(default)]
    pub messages: Vec<HistoryEntry>,
    #[serde(default)]
    pub last_activity: u64,
    #[serde(default)]
    pub awaiting_code: bool,
    /// State value bound into the most recent authorization URL.
    #[serde(default)]
    pub oauth_state: Option<String>,
    #[serde(default)]
    pub auth_code: Option<String>,
    /// Where asynchronous notifications (e.g. callback completion) are delivered.
    #[serde(default)]
    pub sender_address: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            authenticated: false,
            token: None,
            messages: Vec::new(),
            last_activity: unix_now(),
            awaiting_code: false,
            oauth_state: None,
            auth_code: None,
            sender_address: None,
        }
    }

    pub fn state(&self) -> AuthState {
        if self.authenticated && self.token.is_some() {
            AuthState::Authenticated
        } else if self.awaiting_code {
            AuthState::AwaitingCode
        } else {
            AuthState::Unauthenticated
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == AuthState::Authenticated
    }

    pub fn touch(&mut self) {
        self.last_activity = unix_now();
    }

    pub fn is_expired(&self, now: u64, timeout: Duration) -> bool {
        self.last_activity > 0 && now.saturating_sub(self.last_activity) > timeout.as_secs()
    }

    /// Appends a turn and keeps at most `2 * max_history` entries.
    pub fn push_turn(&mut self, role: Role, content: impl Into<String>, max_history: usize) {
        self.messages.push(HistoryEntry {
            role,
            content: content.into(),
        });
        let limit = max_history.saturating_mul(2);
        if self.messages.len() > limit {
            let overflow = self.messages.len() - limit;
            self.messages.drain(..overflow);
        }
    }

    /// Starts a fresh conversation. Granted credentials survive.
    pub fn reset_conversation(&mut self) {
        self.messages.clear();
        self.awaiting_code = false;
        self.oauth_state = None;
        self.auth_code = None;
    }

    pub fn clear_credentials(&mut self) {
        self.authenticated = false;
        self.token = None;
        self.awaiting_code = false;
        self.oauth_state = None;
    }
}

/// Injected owner of all session records. Creates sessions on first use and
/// restarts conversations that sat idle past the timeout.
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    timeout: Duration,
    locks: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Serializes handlers working on the same session id.
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        self.store.load(id).await
    }

    /// Loads the session or creates it. An idle session comes back with a fresh conversation.
    pub async fn open(&self, id: &str) -> Result<Session> {
        match self.store.load(id).await? {
            Some(mut session) => {
                if session.is_expired(unix_now(), self.timeout) {
                    tracing::debug!(session_id = %id, "session idle past timeout, resetting conversation");
                    session.reset_conversation();
                }
                Ok(session)
            }
            None => {
                tracing::debug!(session_id = %id, "creating session");
                Ok(Session::new(id))
            }
        }
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        self.store.save(session).await
    }

    /// Drops idle sessions that never obtained credentials and resets the rest.
    /// Each session is re-checked under its lock, so a handler that is still
    /// working on it wins. Returns the ids that were removed.
    pub async fn purge_expired(&self) -> Result<Vec<String>> {
        let mut purged = Vec::new();
        for id in self.store.ids().await? {
            let guard = self.lock(&id).await;
            let Some(mut session) = self.store.load(&id).await? else {
                continue;
            };
            if !session.is_expired(unix_now(), self.timeout) {
                continue;
            }
            if session.token.is_none() {
                self.store.remove(&id).await?;
                self.release_lock(&id, guard);
                purged.push(id);
            } else if !session.messages.is_empty() || session.awaiting_code {
                session.reset_conversation();
                self.store.save(&session).await?;
            }
        }
        if !purged.is_empty() {
            tracing::info!(purged = purged.len(), "purged expired sessions");
        }
        Ok(purged)
    }

    /// Removes the lock entry for `id` unless another task holds or awaits it.
    fn release_lock(&self, id: &str, guard: OwnedMutexGuard<()>) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference lives in the map and one in `guard`.
        let idle = locks
            .get(id)
            .map(|lock| Arc::strong_count(lock) == 2)
            .unwrap_or(false);
        if idle {
            locks.remove(id);
        }
        drop(guard);
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemorySessionStore;

    fn token(expires_at: Option<u64>) -> TokenMaterial {
        TokenMaterial {
            access_token: "ya29.token".into(),
            refresh_token: Some("1//refresh".into()),
            token_uri: "https://oauth2.googleapis.com/token".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            scopes: vec!["scope".into()],
            expires_at,
        }
    }

    #[test]
    fn state_requires_token_material() {
        let mut session = Session::new("s1");
        assert_eq!(session.state(), AuthState::Unauthenticated);

        session.awaiting_code = true;
        assert_eq!(session.state(), AuthState::AwaitingCode);

        session.authenticated = true;
        assert_eq!(session.state(), AuthState::AwaitingCode);

        session.token = Some(token(None));
        assert_eq!(session.state(), AuthState::Authenticated);
    }

    #[test]
    fn history_is_trimmed_to_window() {
        let mut session = Session::new("s1");
        for i in 0..7 {
            session.push_turn(Role::User, format!("q{i}"), 2);
        }
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.messages[0].content, "q3");
    }

    #[test]
    fn expiry_uses_skew() {
        let material = token(Some(1_000));
        assert!(!material.is_expired_at(900));
        assert!(material.is_expired_at(950));
        assert!(!token(None).is_expired_at(u64::MAX - EXPIRY_SKEW_SECS));
    }

    #[test]
    fn persisted_layout_has_expected_keys() {
        let session = Session::new("s1");
        let value = serde_json::to_value(&session).unwrap();
        for key in ["authenticated", "token", "messages", "last_activity"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn open_resets_idle_conversation_but_keeps_token() {
        let store = Arc::new(InMemorySessionStore::default());
        let registry = SessionRegistry::new(store, Duration::from_secs(60));

        let mut session = Session::new("s1");
        session.authenticated = true;
        session.token = Some(token(None));
        session.push_turn(Role::User, "hello", 10);
        session.last_activity = unix_now() - 120;
        registry.save(&session).await.unwrap();

        let reopened = registry.open("s1").await.unwrap();
        assert!(reopened.messages.is_empty());
        assert!(reopened.is_authenticated());
    }

    #[tokio::test]
    async fn purge_drops_anonymous_idle_sessions() {
        let store = Arc::new(InMemorySessionStore::default());
        let registry = SessionRegistry::new(store, Duration::from_secs(60));

        let mut idle = Session::new("idle");
        idle.last_activity = unix_now() - 3600;
        registry.save(&idle).await.unwrap();

        let mut kept = Session::new("kept");
        kept.authenticated = true;
        kept.token = Some(token(None));
        kept.last_activity = unix_now() - 3600;
        registry.save(&kept).await.unwrap();

        registry.save(&Session::new("fresh")).await.unwrap();

        assert_eq!(registry.purge_expired().await.unwrap(), vec!["idle".to_string()]);
        assert_eq!(registry.tracked_locks(), 2);
        assert!(registry.get("idle").await.unwrap().is_none());
        assert!(registry.get("kept").await.unwrap().is_some());
        assert!(registry.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_waits_for_the_session_lock() {
        let store = Arc::new(InMemorySessionStore::default());
        let registry = SessionRegistry::new(store, Duration::from_secs(60));

        let mut session = Session::new("s1");
        session.authenticated = true;
        session.token = Some(token(None));
        session.push_turn(Role::User, "hello", 10);
        session.last_activity = unix_now() - 3600;
        registry.save(&session).await.unwrap();

        let guard = registry.lock("s1").await;
        let purge = tokio::spawn({
            let registry = registry.clone();
            async move { registry.purge_expired().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!purge.is_finished());

        // The handler holding the lock refreshes the token and keeps talking.
        let mut active = registry.open("s1").await.unwrap();
        if let Some(token) = active.token.as_mut() {
            token.access_token = "ya29.rotated".into();
        }
        active.push_turn(Role::User, "still here", 10);
        active.touch();
        registry.save(&active).await.unwrap();
        drop(guard);

        assert!(purge.await.unwrap().unwrap().is_empty());
        let stored = registry.get("s1").await.unwrap().unwrap();
        assert_eq!(stored.token.unwrap().access_token, "ya29.rotated");
        assert_eq!(stored.messages.len(), 1);
    }

    #[tokio::test]
    async fn lock_entry_survives_while_contended() {
        let registry = SessionRegistry::new(
            Arc::new(InMemorySessionStore::default()),
            Duration::from_secs(60),
        );

        let guard = registry.lock("s1").await;
        let waiter = tokio::spawn({
            let registry = registry.clone();
            async move {
                let _held = registry.lock("s1").await;
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        registry.release_lock("s1", guard);
        assert_eq!(registry.tracked_locks(), 1);
        waiter.await.unwrap();

        let guard = registry.lock("s1").await;
        registry.release_lock("s1", guard);
        assert_eq!(registry.tracked_locks(), 0);
    }
}
