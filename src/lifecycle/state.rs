//! Pure session state transitions
//!
//! Nothing here touches storage; the engine decides when to apply each step.

use chrono::{DateTime, Utc};

use crate::models::{Session, SessionState};

/// State as far as pause accounting is concerned
///
/// A paused session that lost its pause timestamp counts as playing so the
/// next pause stamps it again.
pub fn effective_state(session: &Session) -> SessionState {
    if session.state == SessionState::Paused && session.last_paused_at.is_none() {
        SessionState::Playing
    } else {
        session.state
    }
}

/// Move `session` to `next`, keeping the pause bookkeeping consistent
///
/// Returns true when the effective state changed.
pub fn transition(session: &mut Session, next: SessionState, now: DateTime<Utc>) -> bool {
    let previous = effective_state(session);

    match (previous, next) {
        (SessionState::Playing, SessionState::Paused) => {
            session.last_paused_at = Some(now);
        }
        (SessionState::Paused, SessionState::Playing) => {
            fold_pause(session, now);
        }
        _ => {}
    }

    if next != SessionState::Stopped {
        session.state = next;
    }
    previous != next
}

/// Add an open pause to the paused total, never past `until`
pub fn fold_pause(session: &mut Session, until: DateTime<Utc>) {
    if let Some(paused_at) = session.last_paused_at.take() {
        let paused = (until - paused_at).num_milliseconds().max(0);
        session.paused_duration_ms += paused;
    }
}

/// Copy the mutable playback details of a fresh snapshot onto a tracked session
pub fn merge_snapshot(session: &mut Session, snapshot: &Session, now: DateTime<Utc>) -> bool {
    let progress_changed = session.progress_ms != snapshot.progress_ms
        || (snapshot.total_duration_ms > 0 && session.total_duration_ms != snapshot.total_duration_ms);

    session.progress_ms = snapshot.progress_ms;
    if snapshot.total_duration_ms > 0 {
        session.total_duration_ms = snapshot.total_duration_ms;
    }
    session.quality = snapshot.quality.clone();
    session.device = snapshot.device.clone();
    session.ip_address = snapshot.ip_address.clone();
    session.geo = snapshot.geo.clone();
    if snapshot.username.is_some() {
        session.username = snapshot.username.clone();
    }
    session.last_seen_at = now;

    progress_changed
}

/// Close a session at `stopped_at`
pub fn close(session: &mut Session, stopped_at: DateTime<Utc>, min_play_ms: i64, force: bool) {
    fold_pause(session, stopped_at);

    let elapsed = (stopped_at - session.started_at).num_milliseconds();
    let duration = (elapsed - session.paused_duration_ms).max(0);

    session.state = SessionState::Stopped;
    session.stopped_at = Some(stopped_at);
    session.duration_ms = Some(duration);
    session.short_session = duration < min_play_ms;
    session.force_stopped = force;
}

/// Whether `progress_ms` reaches the completion threshold
pub fn reaches_completion(progress_ms: i64, total_duration_ms: i64, completion_ratio: f64) -> bool {
    total_duration_ms > 0 && progress_ms as f64 >= completion_ratio * total_duration_ms as f64
}
