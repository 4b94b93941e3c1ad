//! Session lifecycle and dedup engine
//!
//! Turns each poll's snapshot set into create/update/close transitions on the
//! tracked sessions of one server, links resumed plays, and closes sessions
//! that stopped being reported.

pub mod state;

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::ActiveSessionCache;
use crate::config::Config;
use crate::events::EventBus;
use crate::models::{CoreEvent, Session, SessionState};
use crate::persistence::{PersistenceError, SessionStore};

/// Tunables resolved from the config
#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub stale_threshold_ms: i64,
    pub resume_window_secs: i64,
    pub min_play_ms: i64,
    pub completion_ratio: f64,
}

impl LifecycleSettings {
    pub fn from_config(config: &Config) -> Self {
        LifecycleSettings {
            stale_threshold_ms: config.stale_threshold_ms(),
            resume_window_secs: config.lifecycle.resume_window_secs,
            min_play_ms: config.lifecycle.min_play_secs * 1000,
            completion_ratio: config.lifecycle.completion_ratio,
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        LifecycleSettings::from_config(&Config::default())
    }
}

#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub session: Session,
    /// Playing/paused flipped on this poll
    pub state_changed: bool,
}

/// What one reconcile pass did, in processing order
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub started: Vec<Session>,
    pub updated: Vec<SessionUpdate>,
    pub stopped: Vec<Session>,
    /// Snapshots that could not be applied
    pub failed: usize,
}

impl ReconcileOutcome {
    /// Sessions rules should look at: new ones and state changes
    pub fn sessions_to_evaluate(&self) -> impl Iterator<Item = &Session> {
        self.started.iter().chain(
            self.updated
                .iter()
                .filter(|u| u.state_changed)
                .map(|u| &u.session),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.updated.is_empty() && self.stopped.is_empty()
    }
}

pub struct LifecycleEngine {
    store: Arc<dyn SessionStore>,
    cache: Arc<ActiveSessionCache>,
    events: EventBus,
    settings: LifecycleSettings,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        cache: Arc<ActiveSessionCache>,
        events: EventBus,
        settings: LifecycleSettings,
    ) -> Self {
        LifecycleEngine {
            store,
            cache,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Apply one poll's snapshots for `server_id`
    ///
    /// Snapshots are handled in the order given. A snapshot that fails to
    /// persist is logged and counted; the rest of the poll still applies.
    pub fn reconcile(
        &self,
        server_id: &str,
        snapshots: &[Session],
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut reported = HashSet::new();

        for snapshot in snapshots {
            if snapshot.server_id != server_id {
                log::warn!(
                    "Ignoring snapshot for server {} in reconcile of {}",
                    snapshot.server_id,
                    server_id
                );
                continue;
            }
            reported.insert(snapshot.session_key.clone());

            if let Err(e) = self.apply_snapshot(snapshot, now, &mut outcome) {
                outcome.failed += 1;
                log::error!(
                    "Failed to apply session {} on server {}: {}",
                    snapshot.session_key,
                    server_id,
                    e
                );
            }
        }

        for tracked in self.cache.get_by_server(server_id) {
            if reported.contains(&tracked.session_key) {
                continue;
            }
            let unseen_ms = (now - tracked.last_seen_at).num_milliseconds();
            if unseen_ms < self.settings.stale_threshold_ms {
                continue;
            }

            log::info!(
                "Closing stale session {} ({}), unseen for {}s",
                tracked.session_key,
                tracked.id,
                unseen_ms / 1000
            );
            let stopped_at = tracked.last_seen_at;
            if let Err(e) = self.close(tracked, stopped_at, false, &mut outcome) {
                outcome.failed += 1;
                log::error!("Failed to close stale session on server {}: {}", server_id, e);
            }
        }

        log::debug!(
            "Reconciled {}: {} started, {} updated, {} stopped",
            server_id,
            outcome.started.len(),
            outcome.updated.len(),
            outcome.stopped.len()
        );
        outcome
    }

    /// Close an active session on operator request
    pub fn force_stop(
        &self,
        server_id: &str,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, PersistenceError> {
        let Some(tracked) = self.cache.get(server_id, session_key) else {
            return Ok(None);
        };

        let mut outcome = ReconcileOutcome::default();
        self.close(tracked, now, true, &mut outcome)?;
        Ok(outcome.stopped.pop())
    }

    fn apply_snapshot(
        &self,
        snapshot: &Session,
        now: DateTime<Utc>,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), PersistenceError> {
        let Some(mut tracked) = self.cache.get(&snapshot.server_id, &snapshot.session_key) else {
            if snapshot.state == SessionState::Stopped {
                log::debug!("Ignoring stop for untracked session {}", snapshot.session_key);
                return Ok(());
            }
            return self.start(snapshot, now, outcome);
        };

        if tracked.media.rating_key != snapshot.media.rating_key {
            log::info!(
                "Session key {} reused for new media {}, closing {}",
                snapshot.session_key,
                snapshot.media.rating_key,
                tracked.id
            );
            let stopped_at = tracked.last_seen_at;
            self.close(tracked, stopped_at, false, outcome)?;
            if snapshot.state == SessionState::Stopped {
                return Ok(());
            }
            return self.start(snapshot, now, outcome);
        }

        let progress_changed = state::merge_snapshot(&mut tracked, snapshot, now);
        let state_changed = state::transition(&mut tracked, snapshot.state, now);
        if progress_changed {
            self.refresh_watched(&mut tracked)?;
        }

        if snapshot.state == SessionState::Stopped {
            return self.close(tracked, now, false, outcome);
        }

        self.store.upsert_session(&tracked)?;
        self.cache.upsert(&tracked);
        self.events.publish(CoreEvent::SessionUpdated(tracked.clone()));
        outcome.updated.push(SessionUpdate {
            session: tracked,
            state_changed,
        });
        Ok(())
    }

    fn start(
        &self,
        snapshot: &Session,
        now: DateTime<Utc>,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), PersistenceError> {
        let mut session = snapshot.clone();
        session.started_at = now;
        session.last_seen_at = now;
        if session.state == SessionState::Paused && session.last_paused_at.is_none() {
            session.last_paused_at = Some(now);
        }

        let since = now - Duration::seconds(self.settings.resume_window_secs);
        let candidate = self.store.find_resumable_session(
            &session.server_id,
            &session.server_user_id,
            &session.media.rating_key,
            since,
        )?;

        session.reference_id = match candidate {
            Some(mut previous) => {
                let chain = match previous.reference_id {
                    Some(chain) => chain,
                    None => {
                        previous.reference_id = Some(previous.id);
                        self.store.upsert_session(&previous)?;
                        previous.id
                    }
                };
                log::info!("Session {} resumes play {}", session.session_key, chain);
                Some(chain)
            }
            None => Some(session.id),
        };

        self.refresh_watched(&mut session)?;

        self.store.upsert_session(&session)?;
        self.cache.upsert(&session);
        log::info!(
            "Session started: {} {} on {} from {}",
            session.server_user_id,
            session.media.title,
            session.server_id,
            session.ip_address
        );
        self.events.publish(CoreEvent::SessionStarted(session.clone()));
        outcome.started.push(session);
        Ok(())
    }

    fn close(
        &self,
        mut session: Session,
        stopped_at: DateTime<Utc>,
        force: bool,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), PersistenceError> {
        state::close(&mut session, stopped_at, self.settings.min_play_ms, force);
        self.refresh_watched(&mut session)?;

        self.store.upsert_session(&session)?;
        self.cache.remove(&session.server_id, &session.session_key);
        log::info!(
            "Session stopped: {} {} after {}s{}",
            session.server_user_id,
            session.media.title,
            session.duration_ms.unwrap_or(0) / 1000,
            if session.force_stopped { " (forced)" } else { "" }
        );
        self.events.publish(CoreEvent::SessionStopped(session.clone()));
        outcome.stopped.push(session);
        Ok(())
    }

    /// Recompute `watched` from the furthest progress across the whole play
    ///
    /// Once a play is watched it stays watched.
    fn refresh_watched(&self, session: &mut Session) -> Result<(), PersistenceError> {
        if session.watched {
            return Ok(());
        }

        let mut progress = session.progress_ms;
        if let Some(chain) = session.reference_id.filter(|chain| *chain != session.id) {
            for earlier in self.store.get_play_sessions(chain)? {
                if earlier.id != session.id {
                    progress = progress.max(earlier.progress_ms);
                }
            }
        }

        session.watched = state::reaches_completion(
            progress,
            session.total_duration_ms,
            self.settings.completion_ratio,
        );
        Ok(())
    }
}
