//! Jellyfin and Emby `/Sessions` mapping
//!
//! Both servers share the same session document shape. Positions and runtimes
//! are reported in ticks.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{account_id, clean_ip, combine_decisions, id_string, NormalizeError};
use crate::config::ServerKind;
use crate::geolocation::GeoResolver;
use crate::models::{
    DeviceInfo, MediaInfo, MediaType, Session, SessionState, StreamDecision, StreamQuality,
};

pub const TICKS_PER_MS: i64 = 10_000;

pub fn ticks_to_ms(ticks: i64) -> i64 {
    ticks / TICKS_PER_MS
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct JellyfinSession {
    pub id: Option<Value>,
    pub user_id: Option<Value>,
    pub user_name: Option<String>,
    pub client: Option<String>,
    pub device_name: Option<String>,
    pub device_id: Option<String>,
    pub remote_end_point: Option<String>,
    pub now_playing_item: Option<NowPlayingItem>,
    pub play_state: Option<PlayState>,
    pub transcoding_info: Option<TranscodingInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NowPlayingItem {
    pub id: Option<Value>,
    pub name: Option<String>,
    #[serde(rename = "Type")]
    pub item_type: Option<String>,
    pub extra_type: Option<Value>,
    pub series_name: Option<String>,
    pub album_artist: Option<String>,
    pub parent_index_number: Option<u32>,
    pub index_number: Option<u32>,
    pub production_year: Option<u32>,
    pub run_time_ticks: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PlayState {
    pub position_ticks: Option<i64>,
    pub is_paused: bool,
    pub play_method: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TranscodingInfo {
    pub is_video_direct: Option<bool>,
    pub is_audio_direct: Option<bool>,
    /// Bits per second
    pub bitrate: Option<u64>,
    pub height: Option<u32>,
}

/// Per-session entries of a `/Sessions` body
pub fn session_entries(body: &str) -> Result<Vec<Value>, serde_json::Error> {
    serde_json::from_str(body)
}

pub fn normalize(
    server_id: &str,
    vendor: ServerKind,
    payload: &Value,
    observed_at: DateTime<Utc>,
    geo: &dyn GeoResolver,
) -> Result<Option<Session>, NormalizeError> {
    let raw = JellyfinSession::deserialize(payload)
        .map_err(|source| NormalizeError::Malformed { vendor, source })?;

    // Idle client, nothing playing
    let Some(item) = raw.now_playing_item else {
        return Ok(None);
    };
    if is_extra(&item) {
        return Ok(None);
    }

    let session_key = id_string(raw.id.as_ref()).ok_or(NormalizeError::MissingField("Id"))?;
    let user_id = id_string(raw.user_id.as_ref()).ok_or(NormalizeError::MissingField("UserId"))?;
    let rating_key =
        id_string(item.id.as_ref()).ok_or(NormalizeError::MissingField("NowPlayingItem.Id"))?;

    let play_state = raw.play_state.unwrap_or_default();
    let state = if play_state.is_paused {
        SessionState::Paused
    } else {
        SessionState::Playing
    };

    let media_type = media_type(item.item_type.as_deref());
    let grandparent_title = match media_type {
        MediaType::Track => item.album_artist.or(item.series_name),
        _ => item.series_name,
    };
    let media = MediaInfo {
        media_type,
        rating_key,
        title: item.name.unwrap_or_default(),
        grandparent_title,
        season_number: item.parent_index_number,
        episode_number: item.index_number,
        year: item.production_year,
    };

    let ip = clean_ip(raw.remote_end_point.as_deref().unwrap_or_default());
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
    session.username = raw.user_name;
    session.progress_ms = ticks_to_ms(play_state.position_ticks.unwrap_or(0).max(0));
    session.total_duration_ms = ticks_to_ms(item.run_time_ticks.unwrap_or(0).max(0));
    session.device = DeviceInfo {
        device_id: raw.device_id,
        player_name: raw.device_name,
        product: raw.client,
        platform: None,
    };
    session.quality = quality(play_state.play_method.as_deref(), raw.transcoding_info.as_ref());

    Ok(Some(session))
}

fn is_extra(item: &NowPlayingItem) -> bool {
    if item.item_type.as_deref() == Some("Trailer") {
        return true;
    }
    item.extra_type.as_ref().is_some_and(|v| !v.is_null())
}

fn media_type(kind: Option<&str>) -> MediaType {
    match kind {
        Some("Movie") => MediaType::Movie,
        Some("Episode") => MediaType::Episode,
        Some("Audio") => MediaType::Track,
        Some("TvChannel") | Some("LiveTvChannel") | Some("LiveTvProgram") => MediaType::Live,
        Some("Photo") => MediaType::Photo,
        _ => MediaType::Unknown,
    }
}

fn stream_decision(is_direct: Option<bool>) -> Option<StreamDecision> {
    is_direct.map(|direct| {
        if direct {
            StreamDecision::Copy
        } else {
            StreamDecision::Transcode
        }
    })
}

fn quality(play_method: Option<&str>, transcoding: Option<&TranscodingInfo>) -> StreamQuality {
    let (video_decision, audio_decision) = match transcoding {
        Some(info) => (
            stream_decision(info.is_video_direct),
            stream_decision(info.is_audio_direct),
        ),
        None => (None, None),
    };

    let decision = match play_method {
        Some("Transcode") => StreamDecision::Transcode,
        Some("DirectStream") => StreamDecision::Copy,
        Some("DirectPlay") => StreamDecision::DirectPlay,
        _ => combine_decisions(video_decision, audio_decision),
    };

    StreamQuality {
        decision,
        video_decision,
        audio_decision,
        bitrate_kbps: transcoding.and_then(|t| t.bitrate).map(|bps| bps / 1000),
        resolution: transcoding.and_then(|t| t.height).map(|h| format!("{}p", h)),
    }
}
