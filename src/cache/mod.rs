//! Active session cache
//!
//! Fast lookup of every session currently playing or paused, shared by all
//! pollers. Entries are held serialized under `server:sessionKey`, the same
//! shape a Redis-style cache would hold. An entry that no longer parses is
//! treated as a miss and evicted; the cache never fails a read.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::{cache_key, Session};
use crate::persistence::{PersistenceError, SessionStore};

#[derive(Default)]
pub struct ActiveSessionCache {
    entries: RwLock<HashMap<String, String>>,
}

impl ActiveSessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn decode(key: &str, raw: &str) -> Option<Session> {
        match serde_json::from_str::<Session>(raw) {
            Ok(session) => Some(session),
            Err(e) => {
                log::warn!("Dropping corrupt cache entry {}: {}", key, e);
                None
            }
        }
    }

    /// Decode every entry matching `filter`, evicting the ones that fail to parse
    fn collect<F>(&self, filter: F) -> Vec<Session>
    where
        F: Fn(&Session) -> bool,
    {
        let mut sessions = Vec::new();
        let mut corrupt = Vec::new();

        {
            let entries = self.read();
            for (key, raw) in entries.iter() {
                match Self::decode(key, raw) {
                    Some(session) if filter(&session) => sessions.push(session),
                    Some(_) => {}
                    None => corrupt.push((key.clone(), raw.clone())),
                }
            }
        }
        self.evict(&corrupt);

        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn get_all(&self) -> Vec<Session> {
        self.collect(|_| true)
    }

    pub fn get_by_account(&self, server_user_id: &str) -> Vec<Session> {
        self.collect(|s| s.server_user_id == server_user_id)
    }

    /// Active sessions for the account that started at or after `since`
    pub fn get_by_account_since(&self, server_user_id: &str, since: DateTime<Utc>) -> Vec<Session> {
        self.collect(|s| s.server_user_id == server_user_id && s.started_at >= since)
    }

    pub fn get_by_server(&self, server_id: &str) -> Vec<Session> {
        self.collect(|s| s.server_id == server_id)
    }

    pub fn get(&self, server_id: &str, session_key: &str) -> Option<Session> {
        let key = cache_key(server_id, session_key);
        let raw = self.read().get(&key).cloned()?;
        let session = Self::decode(&key, &raw);
        if session.is_none() {
            self.evict(&[(key, raw)]);
        }
        session
    }

    /// Remove corrupt entries, unless a writer has replaced them since they were read
    fn evict(&self, corrupt: &[(String, String)]) {
        if corrupt.is_empty() {
            return;
        }
        let mut entries = self.write();
        for (key, raw) in corrupt {
            if entries.get(key) == Some(raw) {
                entries.remove(key);
            }
        }
    }

    pub fn upsert(&self, session: &Session) {
        match serde_json::to_string(session) {
            Ok(raw) => {
                self.write().insert(session.cache_key(), raw);
            }
            Err(e) => log::warn!("Failed to cache session {}: {}", session.id, e),
        }
    }

    pub fn remove(&self, server_id: &str, session_key: &str) -> bool {
        self.write().remove(&cache_key(server_id, session_key)).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Replace the cache contents with the active sessions from persistent storage
    ///
    /// On failure the cache is left empty: no active sessions is the safe default.
    pub fn resync(&self, store: &dyn SessionStore) -> Result<usize, PersistenceError> {
        self.write().clear();
        let sessions = store.get_active_sessions()?;
        let count = sessions.len();
        for session in &sessions {
            self.upsert(session);
        }
        log::info!("Resynced {} active session(s) into cache", count);
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &str, raw: &str) {
        self.write().insert(key.to_string(), raw.to_string());
    }
}
