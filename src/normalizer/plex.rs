//! Plex `/status/sessions` mapping

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{account_id, clean_ip, combine_decisions, id_string, NormalizeError};
use crate::config::ServerKind;
use crate::geolocation::GeoResolver;
use crate::models::{
    DeviceInfo, MediaInfo, MediaType, Session, SessionState, StreamDecision, StreamQuality,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlexSession {
    pub session_key: Option<Value>,
    pub rating_key: Option<Value>,
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub subtype: Option<String>,
    pub extra_type: Option<Value>,
    pub live: Option<Value>,
    pub title: Option<String>,
    pub grandparent_title: Option<String>,
    pub parent_index: Option<u32>,
    pub index: Option<u32>,
    pub year: Option<u32>,
    pub duration: Option<i64>,
    pub view_offset: Option<i64>,
    #[serde(rename = "User")]
    pub user: Option<PlexUser>,
    #[serde(rename = "Player")]
    pub player: Option<PlexPlayer>,
    #[serde(rename = "TranscodeSession")]
    pub transcode_session: Option<PlexTranscodeSession>,
    #[serde(rename = "Media")]
    pub media: Vec<PlexMedia>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlexUser {
    pub id: Option<Value>,
    pub title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlexPlayer {
    pub address: Option<String>,
    pub machine_identifier: Option<String>,
    pub title: Option<String>,
    pub product: Option<String>,
    pub platform: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlexTranscodeSession {
    pub video_decision: Option<String>,
    pub audio_decision: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlexMedia {
    pub bitrate: Option<u64>,
    pub video_resolution: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "MediaContainer")]
    container: Container,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Container {
    #[serde(rename = "Metadata")]
    metadata: Vec<Value>,
}

/// Per-session entries of a `/status/sessions` body; an idle server has none
pub fn session_entries(body: &str) -> Result<Vec<Value>, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(body)?;
    Ok(envelope.container.metadata)
}

pub fn normalize(
    server_id: &str,
    payload: &Value,
    observed_at: DateTime<Utc>,
    geo: &dyn GeoResolver,
) -> Result<Option<Session>, NormalizeError> {
    let raw = PlexSession::deserialize(payload).map_err(|source| NormalizeError::Malformed {
        vendor: ServerKind::Plex,
        source,
    })?;

    if is_extra(&raw) {
        return Ok(None);
    }

    let session_key = id_string(raw.session_key.as_ref()).ok_or(NormalizeError::MissingField("sessionKey"))?;
    let rating_key = id_string(raw.rating_key.as_ref()).ok_or(NormalizeError::MissingField("ratingKey"))?;
    let user = raw.user.as_ref().ok_or(NormalizeError::MissingField("User"))?;
    let user_id = id_string(user.id.as_ref()).ok_or(NormalizeError::MissingField("User.id"))?;

    let player = raw.player.unwrap_or_default();
    let state = match player.state.as_deref() {
        Some("paused") => SessionState::Paused,
        Some("stopped") => SessionState::Stopped,
        _ => SessionState::Playing,
    };

    let media = MediaInfo {
        media_type: media_type(raw.media_type.as_deref(), is_live(&raw.live)),
        rating_key,
        title: raw.title.unwrap_or_default(),
        grandparent_title: raw.grandparent_title,
        season_number: raw.parent_index,
        episode_number: raw.index,
        year: raw.year,
    };

    let ip = clean_ip(player.address.as_deref().unwrap_or_default());
    let geo_info = geo.resolve(&ip);

    let mut session = Session::new(
        server_id,
        account_id(server_id, &user_id),
        session_key,
        state,
        media,
        observed_at,
        ip,
        geo_info,
    );
    session.username = user.title.clone();
    session.progress_ms = raw.view_offset.unwrap_or(0).max(0);
    session.total_duration_ms = raw.duration.unwrap_or(0).max(0);
    session.device = DeviceInfo {
        device_id: player.machine_identifier,
        player_name: player.title,
        product: player.product,
        platform: player.platform,
    };
    session.quality = quality(raw.transcode_session.as_ref(), raw.media.first());

    Ok(Some(session))
}

/// Trailers, prerolls and other extras are not user playback
fn is_extra(raw: &PlexSession) -> bool {
    if raw.media_type.as_deref() == Some("clip") {
        return true;
    }
    if matches!(raw.subtype.as_deref(), Some("trailer") | Some("preroll")) {
        return true;
    }
    raw.extra_type.as_ref().is_some_and(|v| !v.is_null())
}

fn is_live(value: &Option<Value>) -> bool {
    match value {
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

fn media_type(kind: Option<&str>, live: bool) -> MediaType {
    if live {
        return MediaType::Live;
    }
    match kind {
        Some("movie") => MediaType::Movie,
        Some("episode") => MediaType::Episode,
        Some("track") => MediaType::Track,
        Some("photo") => MediaType::Photo,
        _ => MediaType::Unknown,
    }
}

fn decision(value: Option<&str>) -> Option<StreamDecision> {
    match value?.to_ascii_lowercase().as_str() {
        "transcode" => Some(StreamDecision::Transcode),
        "copy" => Some(StreamDecision::Copy),
        "directplay" | "direct play" => Some(StreamDecision::DirectPlay),
        _ => None,
    }
}

fn quality(transcode: Option<&PlexTranscodeSession>, media: Option<&PlexMedia>) -> StreamQuality {
    let video_decision = transcode.and_then(|t| decision(t.video_decision.as_deref()));
    let audio_decision = transcode.and_then(|t| decision(t.audio_decision.as_deref()));

    let resolution = media
        .and_then(|m| id_string(m.video_resolution.as_ref()))
        .map(|r| match r.parse::<u32>() {
            Ok(lines) => format!("{}p", lines),
            Err(_) => r,
        });

    StreamQuality {
        decision: combine_decisions(video_decision, audio_decision),
        video_decision,
        audio_decision,
        bitrate_kbps: media.and_then(|m| m.bitrate),
        resolution,
    }
}
