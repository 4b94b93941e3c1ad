//! Persistence module for sessions, rules, violations and trust scores
//!
//! The active session cache fronts this store during a poll cycle; the store
//! is the system of record across restarts.

pub mod sqlite_store;

pub use sqlite_store::SqliteStore;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::RuleSeed;
use crate::models::{Rule, RuleType, Session, Violation};

/// Score every account and identity starts from
pub const DEFAULT_TRUST_SCORE: i64 = 100;

/// Errors that can occur during persistence operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid data in database: {0}")]
    InvalidData(String),
}

/// Trait for persistence backends
pub trait SessionStore: Send + Sync {
    // =====================
    // Sessions
    // =====================

    /// Insert or replace a session by id
    fn upsert_session(&self, session: &Session) -> Result<(), PersistenceError>;

    fn get_session(&self, id: Uuid) -> Result<Option<Session>, PersistenceError>;

    /// Every session not yet stopped, used to resync the cache on startup
    fn get_active_sessions(&self) -> Result<Vec<Session>, PersistenceError>;

    /// Most recent stopped, unwatched session of the same media for the account
    /// that stopped at or after `stopped_since`
    fn find_resumable_session(
        &self,
        server_id: &str,
        server_user_id: &str,
        rating_key: &str,
        stopped_since: DateTime<Utc>,
    ) -> Result<Option<Session>, PersistenceError>;

    /// Sessions for an account that started at or after `since`, oldest first
    fn get_account_sessions_since(
        &self,
        server_user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>, PersistenceError>;

    /// Every session of a play, oldest first
    fn get_play_sessions(&self, reference_id: Uuid) -> Result<Vec<Session>, PersistenceError>;

    // =====================
    // Rules
    // =====================

    fn list_rules(&self) -> Result<Vec<Rule>, PersistenceError>;

    fn save_rule(&self, rule: &Rule) -> Result<(), PersistenceError>;

    fn get_active_rules(&self) -> Result<Vec<Rule>, PersistenceError> {
        Ok(self
            .list_rules()?
            .into_iter()
            .filter(|r| r.is_active)
            .collect())
    }

    // =====================
    // Violations
    // =====================

    fn has_unacknowledged_violation(
        &self,
        server_user_id: &str,
        session_id: Uuid,
        rule_type: RuleType,
    ) -> Result<bool, PersistenceError>;

    /// Store a violation
    ///
    /// Returns false when an unacknowledged violation for the same
    /// (account, session, rule type) already exists.
    fn insert_violation(&self, violation: &Violation) -> Result<bool, PersistenceError>;

    /// Returns false if the violation does not exist or was already acknowledged
    fn acknowledge_violation(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, PersistenceError>;

    fn get_recent_violations(&self, limit: usize) -> Result<Vec<Violation>, PersistenceError>;

    // =====================
    // Trust scores
    // =====================

    fn get_trust_score(&self, server_user_id: &str) -> Result<i64, PersistenceError>;

    /// Apply a delta and return the new score (floored at zero)
    fn adjust_trust_score(&self, server_user_id: &str, delta: i64) -> Result<i64, PersistenceError>;

    /// Attach a server account to a cross-server identity
    fn link_account_identity(
        &self,
        server_user_id: &str,
        identity_id: &str,
    ) -> Result<(), PersistenceError>;

    /// Identity of an account and how many accounts are linked to it
    fn identity_for_account(
        &self,
        server_user_id: &str,
    ) -> Result<Option<(String, usize)>, PersistenceError>;

    fn get_identity_score(&self, identity_id: &str) -> Result<i64, PersistenceError>;

    fn adjust_identity_score(&self, identity_id: &str, delta: i64) -> Result<i64, PersistenceError>;

    // =====================
    // Maintenance
    // =====================

    /// Remove stopped sessions and acknowledged violations older than the cutoff
    fn prune_old_data(&self, before: DateTime<Utc>) -> Result<usize, PersistenceError>;

    /// Clear all data (useful for testing)
    fn clear_all(&self) -> Result<(), PersistenceError>;
}

/// Insert configured rules whose name is not already stored
pub fn seed_rules(store: &dyn SessionStore, seeds: &[RuleSeed]) -> Result<usize, PersistenceError> {
    let existing: Vec<String> = store.list_rules()?.into_iter().map(|r| r.name).collect();
    let mut inserted = 0;
    for seed in seeds {
        if existing.iter().any(|name| name == &seed.name) {
            continue;
        }
        store.save_rule(&seed.to_rule())?;
        inserted += 1;
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_seed_rules_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let seeds = Config::default().rules;

        assert_eq!(seed_rules(&store, &seeds).unwrap(), seeds.len());
        assert_eq!(seed_rules(&store, &seeds).unwrap(), 0);
        assert_eq!(store.list_rules().unwrap().len(), seeds.len());
    }

    #[test]
    fn test_seed_keeps_operator_changes() {
        let store = SqliteStore::in_memory().unwrap();
        let seeds = Config::default().rules;
        seed_rules(&store, &seeds).unwrap();

        let mut rule = store.list_rules().unwrap().remove(0);
        rule.is_active = false;
        store.save_rule(&rule).unwrap();

        seed_rules(&store, &seeds).unwrap();
        let stored = store.list_rules().unwrap();
        assert!(stored.iter().any(|r| r.id == rule.id && !r.is_active));
        assert_eq!(store.get_active_rules().unwrap().len(), seeds.len() - 1);
    }
}
