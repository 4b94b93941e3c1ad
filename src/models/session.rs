//! Canonical playback session shared by every media server backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::geolocation::{is_private_address, GeoInfo, GeoLocation};

/// Lifecycle state of a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Playing,
    Paused,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Playing => "playing",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "playing" => Some(SessionState::Playing),
            "paused" => Some(SessionState::Paused),
            "stopped" => Some(SessionState::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Episode,
    Track,
    Live,
    Photo,
    Unknown,
}

/// What the server is doing with the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDecision {
    DirectPlay,
    /// Direct stream: container remuxed, streams copied
    Copy,
    Transcode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub media_type: MediaType,
    /// Vendor media identifier (Plex ratingKey, Jellyfin item id)
    pub rating_key: String,
    pub title: String,
    /// Show title for episodes, artist for tracks
    pub grandparent_title: Option<String>,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
    pub year: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: Option<String>,
    pub player_name: Option<String>,
    pub product: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuality {
    pub decision: StreamDecision,
    pub video_decision: Option<StreamDecision>,
    pub audio_decision: Option<StreamDecision>,
    pub bitrate_kbps: Option<u64>,
    pub resolution: Option<String>,
}

impl Default for StreamQuality {
    fn default() -> Self {
        StreamQuality {
            decision: StreamDecision::DirectPlay,
            video_decision: None,
            audio_decision: None,
            bitrate_kbps: None,
            resolution: None,
        }
    }
}

/// One tracked playback attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub server_id: String,
    /// Server-scoped account identifier
    pub server_user_id: String,
    /// Display name reported by the server
    pub username: Option<String>,
    pub session_key: String,
    pub state: SessionState,
    pub media: MediaInfo,

    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,

    pub progress_ms: i64,
    pub total_duration_ms: i64,
    /// Playing time excluding pauses, filled in when the session closes
    pub duration_ms: Option<i64>,

    pub last_paused_at: Option<DateTime<Utc>>,
    pub paused_duration_ms: i64,

    pub ip_address: String,
    pub geo: GeoInfo,
    pub device: DeviceInfo,
    pub quality: StreamQuality,

    /// First session of the play this session belongs to
    pub reference_id: Option<Uuid>,
    pub watched: bool,
    pub force_stopped: bool,
    pub short_session: bool,
}

impl Session {
    /// Build a freshly observed session in the given state
    ///
    /// Pause bookkeeping and the stop timestamp are set so the state invariants hold.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: impl Into<String>,
        server_user_id: impl Into<String>,
        session_key: impl Into<String>,
        state: SessionState,
        media: MediaInfo,
        observed_at: DateTime<Utc>,
        ip_address: impl Into<String>,
        geo: GeoInfo,
    ) -> Self {
        Session {
            id: Uuid::new_v4(),
            server_id: server_id.into(),
            server_user_id: server_user_id.into(),
            username: None,
            session_key: session_key.into(),
            state,
            media,
            started_at: observed_at,
            stopped_at: (state == SessionState::Stopped).then_some(observed_at),
            last_seen_at: observed_at,
            progress_ms: 0,
            total_duration_ms: 0,
            duration_ms: None,
            last_paused_at: (state == SessionState::Paused).then_some(observed_at),
            paused_duration_ms: 0,
            ip_address: ip_address.into(),
            geo,
            device: DeviceInfo::default(),
            quality: StreamQuality::default(),
            reference_id: None,
            watched: false,
            force_stopped: false,
            short_session: false,
        }
    }

    /// Cache key: `server:sessionKey`
    pub fn cache_key(&self) -> String {
        cache_key(&self.server_id, &self.session_key)
    }

    pub fn location(&self) -> GeoLocation {
        self.geo.location()
    }

    pub fn is_playing(&self) -> bool {
        self.state == SessionState::Playing
    }

    pub fn is_active(&self) -> bool {
        self.state != SessionState::Stopped
    }

    pub fn has_private_ip(&self) -> bool {
        is_private_address(&self.ip_address) || self.geo.is_local()
    }
}

pub fn cache_key(server_id: &str, session_key: &str) -> String {
    format!("{}:{}", server_id, session_key)
}
