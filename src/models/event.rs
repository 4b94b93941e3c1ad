use serde::{Deserialize, Serialize};

use super::session::Session;
use super::violation::Violation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Up,
    Down,
}

/// Events published by the lifecycle engine, the violation recorder and the pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum CoreEvent {
    SessionStarted(Session),
    SessionUpdated(Session),
    SessionStopped(Session),
    ViolationCreated(Violation),
    ServerStatusChanged {
        server_id: String,
        status: ServerStatus,
    },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::SessionStarted(_) => "session_started",
            CoreEvent::SessionUpdated(_) => "session_updated",
            CoreEvent::SessionStopped(_) => "session_stopped",
            CoreEvent::ViolationCreated(_) => "violation_created",
            CoreEvent::ServerStatusChanged { .. } => "server_status_changed",
        }
    }
}
