//! Session repository for the intake engine.
//!
//! The store is the only mutable shared resource in the system. Writers go
//! through a compare-and-swap on the session `version`, which is what makes
//! concurrent turns for the same user serializable without holding any lock
//! across the extractor or dispatcher round trips. Keys are spread over a
//! fixed set of shards so turns for unrelated users do not contend on a
//! single lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use frontdesk_core::{Session, UserId};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller's session version no longer matches the stored one.
    /// The losing turn must reload and replay its step, never overwrite.
    #[error("stale session write for `{user_id}`: expected version {expected}, found {found}")]
    Conflict { user_id: String, expected: u64, found: u64 },
    /// A persisted session could not be read back. The only store failure
    /// that is allowed to escape the turn loop as a hard fault.
    #[error("session store corruption: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Missing keys are not an error; callers construct a fresh session.
    async fn get(&self, user_id: &UserId) -> Result<Option<Session>, StoreError>;

    /// Atomic compare-and-swap save. The incoming session must carry the
    /// version it was loaded with (zero for a fresh session); on success the
    /// stored copy gets `version + 1` and is returned.
    async fn upsert(&self, session: Session) -> Result<Session, StoreError>;

    async fn delete(&self, user_id: &UserId) -> Result<(), StoreError>;

    /// Removes sessions idle longer than `idle`, returning how many went.
    async fn sweep_expired(&self, now: DateTime<Utc>, idle: Duration)
        -> Result<usize, StoreError>;
}

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for std::sync::Arc<T> {
    async fn get(&self, user_id: &UserId) -> Result<Option<Session>, StoreError> {
        (**self).get(user_id).await
    }

    async fn upsert(&self, session: Session) -> Result<Session, StoreError> {
        (**self).upsert(session).await
    }

    async fn delete(&self, user_id: &UserId) -> Result<(), StoreError> {
        (**self).delete(user_id).await
    }

    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        idle: Duration,
    ) -> Result<usize, StoreError> {
        (**self).sweep_expired(now, idle).await
    }
}

const SHARD_COUNT: usize = 16;

pub struct InMemorySessionStore {
    shards: [RwLock<HashMap<String, Session>>; SHARD_COUNT],
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self { shards: std::array::from_fn(|_| RwLock::new(HashMap::new())) }
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, user_id: &str) -> &RwLock<HashMap<String, Session>> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, user_id: &UserId) -> Result<Option<Session>, StoreError> {
        let sessions = self.shard(&user_id.0).read().await;
        Ok(sessions.get(&user_id.0).cloned())
    }

    async fn upsert(&self, session: Session) -> Result<Session, StoreError> {
        let mut sessions = self.shard(&session.user_id.0).write().await;

        let current_version = sessions.get(&session.user_id.0).map(|stored| stored.version);
        match current_version {
            None if session.version != 0 => {
                return Err(StoreError::Conflict {
                    user_id: session.user_id.0.clone(),
                    expected: session.version,
                    found: 0,
                });
            }
            Some(found) if found != session.version => {
                return Err(StoreError::Conflict {
                    user_id: session.user_id.0.clone(),
                    expected: session.version,
                    found,
                });
            }
            _ => {}
        }

        let mut stored = session;
        stored.version += 1;
        sessions.insert(stored.user_id.0.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, user_id: &UserId) -> Result<(), StoreError> {
        let mut sessions = self.shard(&user_id.0).write().await;
        sessions.remove(&user_id.0);
        Ok(())
    }

    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        idle: Duration,
    ) -> Result<usize, StoreError> {
        let mut swept = 0;
        for shard in &self.shards {
            let mut sessions = shard.write().await;
            let before = sessions.len();
            sessions.retain(|_, session| !session.is_idle_expired(now, idle));
            swept += before - sessions.len();
        }
        Ok(swept)
    }
}
