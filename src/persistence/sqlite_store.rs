//! SQLite implementation of the SessionStore trait

use super::{PersistenceError, SessionStore, DEFAULT_TRUST_SCORE};
use crate::models::{Rule, RuleType, Session, Severity, Violation};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// SQLite-based storage
///
/// All access goes through a single connection behind a mutex, which also
/// serializes concurrent violation inserts from racing pollers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    initial_trust: i64,
}

type ViolationRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
);

impl SqliteStore {
    /// Create a new SQLite store at the specified path
    ///
    /// Creates the database file and initializes the schema if it doesn't exist.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, PersistenceError> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory SQLite database (useful for testing)
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, PersistenceError> {
        let store = SqliteStore {
            conn: Mutex::new(conn),
            initial_trust: DEFAULT_TRUST_SCORE,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Score new accounts and identities start from
    pub fn with_initial_trust(mut self, score: i64) -> Self {
        self.initial_trust = score;
        self
    }

    fn initialize_schema(&self) -> Result<(), PersistenceError> {
        let conn = self.conn();
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves the connection itself usable
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn parse_uuid(s: &str) -> Result<Uuid, PersistenceError> {
        Uuid::parse_str(s).map_err(|_| PersistenceError::InvalidData(format!("Invalid id: {}", s)))
    }

    fn parse_millis(ms: i64) -> Result<DateTime<Utc>, PersistenceError> {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| PersistenceError::InvalidData(format!("Invalid timestamp: {}", ms)))
    }

    fn parse_session(payload: &str) -> Result<Session, PersistenceError> {
        serde_json::from_str(payload)
            .map_err(|e| PersistenceError::InvalidData(format!("Invalid session payload: {}", e)))
    }

    fn load_sessions<P: Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<Session>, PersistenceError> {
        let mut stmt = conn.prepare(sql)?;
        let payloads = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        payloads.iter().map(|p| Self::parse_session(p)).collect()
    }

    fn violation_from_row(row: ViolationRow) -> Result<Violation, PersistenceError> {
        let (id, rule_id, rule_type, user, session_id, severity, data, created_at, acknowledged_at) = row;
        Ok(Violation {
            id: Self::parse_uuid(&id)?,
            rule_id: Self::parse_uuid(&rule_id)?,
            rule_type: RuleType::parse(&rule_type)
                .ok_or_else(|| PersistenceError::InvalidData(format!("Unknown rule type: {}", rule_type)))?,
            server_user_id: user,
            session_id: Self::parse_uuid(&session_id)?,
            severity: Severity::parse(&severity)
                .ok_or_else(|| PersistenceError::InvalidData(format!("Unknown severity: {}", severity)))?,
            data: serde_json::from_str(&data)?,
            created_at: Self::parse_millis(created_at)?,
            acknowledged_at: acknowledged_at.map(Self::parse_millis).transpose()?,
        })
    }

    fn adjust_score(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64, PersistenceError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO {table} ({key_column}, score) VALUES (?1, MAX(0, ?2 + ?3))
                 ON CONFLICT({key_column}) DO UPDATE SET score = MAX(0, score + ?3)"
            ),
            params![key, self.initial_trust, delta],
        )?;
        let score = conn.query_row(
            &format!("SELECT score FROM {table} WHERE {key_column} = ?1"),
            params![key],
            |row| row.get(0),
        )?;
        Ok(score)
    }

    fn read_score(&self, table: &str, key_column: &str, key: &str) -> Result<i64, PersistenceError> {
        let conn = self.conn();
        let score: Option<i64> = conn
            .query_row(
                &format!("SELECT score FROM {table} WHERE {key_column} = ?1"),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(score.unwrap_or(self.initial_trust))
    }
}

const SELECT_SESSION_PAYLOAD: &str = "SELECT payload FROM sessions";

impl SessionStore for SqliteStore {
    fn upsert_session(&self, session: &Session) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(session)?;
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO sessions
             (id, server_id, server_user_id, session_key, state, rating_key,
              started_at, stopped_at, last_seen_at, reference_id, watched, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                session.id.to_string(),
                session.server_id,
                session.server_user_id,
                session.session_key,
                session.state.as_str(),
                session.media.rating_key,
                session.started_at.timestamp_millis(),
                session.stopped_at.map(|t| t.timestamp_millis()),
                session.last_seen_at.timestamp_millis(),
                session.reference_id.map(|r| r.to_string()),
                session.watched,
                payload
            ],
        )?;
        Ok(())
    }

    fn get_session(&self, id: Uuid) -> Result<Option<Session>, PersistenceError> {
        let conn = self.conn();
        let payload: Option<String> = conn
            .query_row(
                &format!("{SELECT_SESSION_PAYLOAD} WHERE id = ?1"),
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        payload.as_deref().map(Self::parse_session).transpose()
    }

    fn get_active_sessions(&self) -> Result<Vec<Session>, PersistenceError> {
        let conn = self.conn();
        Self::load_sessions(
            &conn,
            &format!("{SELECT_SESSION_PAYLOAD} WHERE state != 'stopped' ORDER BY started_at"),
            [],
        )
    }

    fn find_resumable_session(
        &self,
        server_id: &str,
        server_user_id: &str,
        rating_key: &str,
        stopped_since: DateTime<Utc>,
    ) -> Result<Option<Session>, PersistenceError> {
        let conn = self.conn();
        let sessions = Self::load_sessions(
            &conn,
            &format!(
                "{SELECT_SESSION_PAYLOAD}
                 WHERE server_id = ?1 AND server_user_id = ?2 AND rating_key = ?3
                   AND state = 'stopped' AND stopped_at >= ?4 AND watched = 0
                 ORDER BY stopped_at DESC
                 LIMIT 1"
            ),
            params![server_id, server_user_id, rating_key, stopped_since.timestamp_millis()],
        )?;
        Ok(sessions.into_iter().next())
    }

    fn get_account_sessions_since(
        &self,
        server_user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>, PersistenceError> {
        let conn = self.conn();
        Self::load_sessions(
            &conn,
            &format!(
                "{SELECT_SESSION_PAYLOAD}
                 WHERE server_user_id = ?1 AND started_at >= ?2
                 ORDER BY started_at"
            ),
            params![server_user_id, since.timestamp_millis()],
        )
    }

    fn get_play_sessions(&self, reference_id: Uuid) -> Result<Vec<Session>, PersistenceError> {
        let conn = self.conn();
        let id = reference_id.to_string();
        Self::load_sessions(
            &conn,
            &format!(
                "{SELECT_SESSION_PAYLOAD}
                 WHERE reference_id = ?1 OR id = ?1
                 ORDER BY started_at"
            ),
            params![id],
        )
    }

    fn list_rules(&self) -> Result<Vec<Rule>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, rule_type, params, server_user_id, is_active
             FROM rules ORDER BY name",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, rule_type, params, server_user_id, is_active)| {
                Ok(Rule {
                    id: Self::parse_uuid(&id)?,
                    name,
                    rule_type: RuleType::parse(&rule_type).ok_or_else(|| {
                        PersistenceError::InvalidData(format!("Unknown rule type: {}", rule_type))
                    })?,
                    params: serde_json::from_str(&params)?,
                    server_user_id,
                    is_active,
                })
            })
            .collect()
    }

    fn save_rule(&self, rule: &Rule) -> Result<(), PersistenceError> {
        let params_json = serde_json::to_string(&rule.params)?;
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO rules (id, name, rule_type, params, server_user_id, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rule.id.to_string(),
                rule.name,
                rule.rule_type.as_str(),
                params_json,
                rule.server_user_id,
                rule.is_active
            ],
        )?;
        Ok(())
    }

    fn has_unacknowledged_violation(
        &self,
        server_user_id: &str,
        session_id: Uuid,
        rule_type: RuleType,
    ) -> Result<bool, PersistenceError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM violations
             WHERE server_user_id = ?1 AND session_id = ?2 AND rule_type = ?3
               AND acknowledged_at IS NULL",
            params![server_user_id, session_id.to_string(), rule_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn insert_violation(&self, violation: &Violation) -> Result<bool, PersistenceError> {
        let data = serde_json::to_string(&violation.data)?;
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO violations
             (id, rule_id, rule_type, server_user_id, session_id, severity, data,
              created_at, acknowledged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                violation.id.to_string(),
                violation.rule_id.to_string(),
                violation.rule_type.as_str(),
                violation.server_user_id,
                violation.session_id.to_string(),
                violation.severity.as_str(),
                data,
                violation.created_at.timestamp_millis(),
                violation.acknowledged_at.map(|t| t.timestamp_millis())
            ],
        )?;
        Ok(inserted == 1)
    }

    fn acknowledge_violation(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, PersistenceError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE violations SET acknowledged_at = ?1
             WHERE id = ?2 AND acknowledged_at IS NULL",
            params![at.timestamp_millis(), id.to_string()],
        )?;
        Ok(updated > 0)
    }

    fn get_recent_violations(&self, limit: usize) -> Result<Vec<Violation>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, rule_type, server_user_id, session_id, severity, data,
                    created_at, acknowledged_at
             FROM violations
             ORDER BY created_at DESC
             LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit as i64], |row| -> rusqlite::Result<ViolationRow> {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(Self::violation_from_row).collect()
    }

    fn get_trust_score(&self, server_user_id: &str) -> Result<i64, PersistenceError> {
        self.read_score("trust_scores", "server_user_id", server_user_id)
    }

    fn adjust_trust_score(&self, server_user_id: &str, delta: i64) -> Result<i64, PersistenceError> {
        self.adjust_score("trust_scores", "server_user_id", server_user_id, delta)
    }

    fn link_account_identity(
        &self,
        server_user_id: &str,
        identity_id: &str,
    ) -> Result<(), PersistenceError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO trust_scores (server_user_id, score, identity_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(server_user_id) DO UPDATE SET identity_id = excluded.identity_id",
            params![server_user_id, self.initial_trust, identity_id],
        )?;
        Ok(())
    }

    fn identity_for_account(
        &self,
        server_user_id: &str,
    ) -> Result<Option<(String, usize)>, PersistenceError> {
        let conn = self.conn();
        let identity: Option<String> = conn
            .query_row(
                "SELECT identity_id FROM trust_scores WHERE server_user_id = ?1",
                params![server_user_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();

        match identity {
            None => Ok(None),
            Some(identity) => {
                let linked: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM trust_scores WHERE identity_id = ?1",
                    params![identity],
                    |row| row.get(0),
                )?;
                Ok(Some((identity, linked.max(1) as usize)))
            }
        }
    }

    fn get_identity_score(&self, identity_id: &str) -> Result<i64, PersistenceError> {
        self.read_score("identity_scores", "identity_id", identity_id)
    }

    fn adjust_identity_score(&self, identity_id: &str, delta: i64) -> Result<i64, PersistenceError> {
        self.adjust_score("identity_scores", "identity_id", identity_id, delta)
    }

    fn prune_old_data(&self, before: DateTime<Utc>) -> Result<usize, PersistenceError> {
        let conn = self.conn();
        let cutoff = before.timestamp_millis();

        let mut total_deleted = 0usize;

        total_deleted += conn.execute(
            "DELETE FROM sessions WHERE state = 'stopped' AND stopped_at < ?1",
            params![cutoff],
        )?;

        // Open violations are kept regardless of age
        total_deleted += conn.execute(
            "DELETE FROM violations WHERE acknowledged_at IS NOT NULL AND created_at < ?1",
            params![cutoff],
        )?;

        Ok(total_deleted)
    }

    fn clear_all(&self) -> Result<(), PersistenceError> {
        let conn = self.conn();
        conn.execute_batch(
            "DELETE FROM sessions;
             DELETE FROM rules;
             DELETE FROM violations;
             DELETE FROM trust_scores;
             DELETE FROM identity_scores;",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::fixtures::{session, t0};
    use crate::models::{SessionState, ViolationResult};
    use chrono::Duration;
    use serde_json::json;

    fn create_test_store() -> SqliteStore {
        SqliteStore::in_memory().expect("Failed to create in-memory store")
    }

    fn violation_for(s: &Session, rule_type: RuleType) -> Violation {
        Violation::from_result(
            ViolationResult {
                rule_id: Uuid::new_v4(),
                rule_type,
                severity: Severity::Warning,
                data: json!({"uniqueIpCount": 6}),
            },
            &s.server_user_id,
            s.id,
            t0(),
        )
    }

    fn stopped(mut s: Session, at: DateTime<Utc>) -> Session {
        s.state = SessionState::Stopped;
        s.stopped_at = Some(at);
        s
    }

    #[test]
    fn test_session_roundtrip() {
        let store = create_test_store();
        let s = session("alice", "k1", "1.2.3.4", t0());

        assert!(store.get_session(s.id).unwrap().is_none());
        store.upsert_session(&s).unwrap();

        let loaded = store.get_session(s.id).unwrap().unwrap();
        assert_eq!(loaded, s);
    }

    #[test]
    fn test_upsert_replaces() {
        let store = create_test_store();
        let mut s = session("alice", "k1", "1.2.3.4", t0());
        store.upsert_session(&s).unwrap();

        s.progress_ms = 60_000;
        store.upsert_session(&s).unwrap();

        assert_eq!(store.get_session(s.id).unwrap().unwrap().progress_ms, 60_000);
        assert_eq!(store.get_active_sessions().unwrap().len(), 1);
    }

    #[test]
    fn test_active_sessions_exclude_stopped() {
        let store = create_test_store();
        let active = session("alice", "k1", "1.2.3.4", t0());
        let done = stopped(session("alice", "k2", "1.2.3.4", t0()), t0() + Duration::minutes(5));
        store.upsert_session(&active).unwrap();
        store.upsert_session(&done).unwrap();

        let sessions = store.get_active_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, active.id);
    }

    #[test]
    fn test_find_resumable_session() {
        let store = create_test_store();
        let stop_at = t0() + Duration::minutes(10);
        let done = stopped(session("alice", "k1", "1.2.3.4", t0()), stop_at);
        store.upsert_session(&done).unwrap();

        let found = store
            .find_resumable_session("srv1", "alice", "100", stop_at - Duration::minutes(1))
            .unwrap();
        assert_eq!(found.map(|s| s.id), Some(done.id));

        // Too old
        assert!(store
            .find_resumable_session("srv1", "alice", "100", stop_at + Duration::seconds(1))
            .unwrap()
            .is_none());
        // Different media or account
        assert!(store
            .find_resumable_session("srv1", "alice", "999", t0())
            .unwrap()
            .is_none());
        assert!(store
            .find_resumable_session("srv1", "bob", "100", t0())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_watched_sessions_are_not_resumable() {
        let store = create_test_store();
        let mut done = stopped(session("alice", "k1", "1.2.3.4", t0()), t0());
        done.watched = true;
        store.upsert_session(&done).unwrap();

        assert!(store
            .find_resumable_session("srv1", "alice", "100", t0() - Duration::hours(1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_account_sessions_since() {
        let store = create_test_store();
        for (i, minutes) in [0i64, 30, 90].iter().enumerate() {
            let s = session("alice", &format!("k{}", i), "1.2.3.4", t0() + Duration::minutes(*minutes));
            store.upsert_session(&s).unwrap();
        }
        store.upsert_session(&session("bob", "kb", "5.6.7.8", t0())).unwrap();

        let recent = store
            .get_account_sessions_since("alice", t0() + Duration::minutes(15))
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].started_at < recent[1].started_at);
    }

    #[test]
    fn test_play_sessions() {
        let store = create_test_store();
        let first = session("alice", "k1", "1.2.3.4", t0());
        let mut second = session("alice", "k2", "1.2.3.4", t0() + Duration::minutes(20));
        second.reference_id = Some(first.id);
        store.upsert_session(&first).unwrap();
        store.upsert_session(&second).unwrap();
        store.upsert_session(&session("alice", "k3", "1.2.3.4", t0())).unwrap();

        let play = store.get_play_sessions(first.id).unwrap();
        assert_eq!(play.iter().map(|s| s.id).collect::<Vec<_>>(), vec![first.id, second.id]);
    }

    #[test]
    fn test_rules_roundtrip() {
        let store = create_test_store();
        let rule = Rule::new("Streams", RuleType::ConcurrentStreams, json!({"maxStreams": 2}))
            .scoped_to("alice");
        let mut off = Rule::new("Off", RuleType::GeoRestriction, json!({"countries": ["CN"]}));
        off.is_active = false;

        store.save_rule(&rule).unwrap();
        store.save_rule(&off).unwrap();

        assert_eq!(store.list_rules().unwrap().len(), 2);
        let active = store.get_active_rules().unwrap();
        assert_eq!(active, vec![rule]);
    }

    #[test]
    fn test_violation_uniqueness() {
        let store = create_test_store();
        let s = session("alice", "k1", "1.2.3.4", t0());

        let first = violation_for(&s, RuleType::DeviceVelocity);
        assert!(store.insert_violation(&first).unwrap());
        assert!(store
            .has_unacknowledged_violation("alice", s.id, RuleType::DeviceVelocity)
            .unwrap());

        // Same triple, new id: rejected by the partial unique index
        let duplicate = violation_for(&s, RuleType::DeviceVelocity);
        assert!(!store.insert_violation(&duplicate).unwrap());

        // Different rule type is independent
        assert!(store.insert_violation(&violation_for(&s, RuleType::ConcurrentStreams)).unwrap());
        assert_eq!(store.get_recent_violations(10).unwrap().len(), 2);
    }

    #[test]
    fn test_acknowledged_violation_allows_new_one() {
        let store = create_test_store();
        let s = session("alice", "k1", "1.2.3.4", t0());
        let first = violation_for(&s, RuleType::DeviceVelocity);
        store.insert_violation(&first).unwrap();

        assert!(store.acknowledge_violation(first.id, t0()).unwrap());
        assert!(!store.acknowledge_violation(first.id, t0()).unwrap());
        assert!(!store
            .has_unacknowledged_violation("alice", s.id, RuleType::DeviceVelocity)
            .unwrap());

        assert!(store.insert_violation(&violation_for(&s, RuleType::DeviceVelocity)).unwrap());

        let all = store.get_recent_violations(10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|v| v.is_acknowledged()).count(), 1);
    }

    #[test]
    fn test_violation_fields_roundtrip() {
        let store = create_test_store();
        let s = session("alice", "k1", "1.2.3.4", t0());
        let v = violation_for(&s, RuleType::ImpossibleTravel);
        store.insert_violation(&v).unwrap();

        let loaded = store.get_recent_violations(1).unwrap().remove(0);
        assert_eq!(loaded, v);
    }

    #[test]
    fn test_trust_scores() {
        let store = create_test_store();
        assert_eq!(store.get_trust_score("alice").unwrap(), 100);

        assert_eq!(store.adjust_trust_score("alice", -20).unwrap(), 80);
        assert_eq!(store.adjust_trust_score("alice", -5).unwrap(), 75);
        assert_eq!(store.get_trust_score("alice").unwrap(), 75);

        // Floors at zero
        assert_eq!(store.adjust_trust_score("alice", -500).unwrap(), 0);
        assert_eq!(store.get_trust_score("bob").unwrap(), 100);
    }

    #[test]
    fn test_initial_trust_override() {
        let store = SqliteStore::in_memory().unwrap().with_initial_trust(50);
        assert_eq!(store.get_trust_score("alice").unwrap(), 50);
        assert_eq!(store.adjust_trust_score("alice", -10).unwrap(), 40);
    }

    #[test]
    fn test_identity_links() {
        let store = create_test_store();
        assert!(store.identity_for_account("alice@plex").unwrap().is_none());

        store.adjust_trust_score("alice@plex", -10).unwrap();
        store.link_account_identity("alice@plex", "alice").unwrap();
        store.link_account_identity("alice@jellyfin", "alice").unwrap();

        // Linking keeps existing score
        assert_eq!(store.get_trust_score("alice@plex").unwrap(), 90);
        assert_eq!(
            store.identity_for_account("alice@jellyfin").unwrap(),
            Some(("alice".to_string(), 2))
        );

        assert_eq!(store.get_identity_score("alice").unwrap(), 100);
        assert_eq!(store.adjust_identity_score("alice", -10).unwrap(), 90);
    }

    #[test]
    fn test_prune_old_data() {
        let store = create_test_store();
        let old = stopped(session("alice", "k1", "1.2.3.4", t0()), t0());
        let active = session("alice", "k2", "1.2.3.4", t0());
        store.upsert_session(&old).unwrap();
        store.upsert_session(&active).unwrap();

        let acked = violation_for(&old, RuleType::DeviceVelocity);
        store.insert_violation(&acked).unwrap();
        store.acknowledge_violation(acked.id, t0()).unwrap();
        let open = violation_for(&old, RuleType::ConcurrentStreams);
        store.insert_violation(&open).unwrap();

        let deleted = store.prune_old_data(t0() + Duration::days(1)).unwrap();
        assert_eq!(deleted, 2);

        assert!(store.get_session(old.id).unwrap().is_none());
        assert!(store.get_session(active.id).unwrap().is_some());
        assert_eq!(store.get_recent_violations(10).unwrap(), vec![open]);
    }

    #[test]
    fn test_clear_all() {
        let store = create_test_store();
        store.upsert_session(&session("alice", "k1", "1.2.3.4", t0())).unwrap();
        store.adjust_trust_score("alice", -5).unwrap();

        store.clear_all().unwrap();

        assert!(store.get_active_sessions().unwrap().is_empty());
        assert_eq!(store.get_trust_score("alice").unwrap(), 100);
    }

    #[test]
    fn test_corrupt_payload_is_invalid_data() {
        let store = create_test_store();
        {
            let conn = store.conn();
            conn.execute(
                "INSERT INTO sessions (id, server_id, server_user_id, session_key, state, rating_key,
                  started_at, last_seen_at, payload)
                 VALUES ('x', 'srv1', 'alice', 'k', 'playing', '1', 0, 0, '{not json')",
                [],
            )
            .unwrap();
        }
        assert!(matches!(
            store.get_active_sessions(),
            Err(PersistenceError::InvalidData(_))
        ));
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.db");
        let s = session("alice", "k1", "1.2.3.4", t0());
        {
            let store = SqliteStore::new(&path).unwrap();
            store.upsert_session(&s).unwrap();
        }
        let reopened = SqliteStore::new(&path).unwrap();
        assert_eq!(reopened.get_active_sessions().unwrap(), vec![s]);
    }
}
