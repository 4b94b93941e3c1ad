//! Session normalizer
//!
//! Maps one raw vendor snapshot into the canonical [`Session`]. Each vendor
//! payload is decoded on its own so one malformed entry only drops that
//! entry, never the whole poll.

pub mod jellyfin;
pub mod plex;

use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ServerKind;
use crate::geolocation::GeoResolver;
use crate::models::{Session, StreamDecision};

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("Malformed {vendor:?} session payload: {source}")]
    Malformed {
        vendor: ServerKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),
}

/// One session entry exactly as a media server reported it
#[derive(Debug, Clone, PartialEq)]
pub struct RawSession {
    pub vendor: ServerKind,
    pub payload: serde_json::Value,
}

impl RawSession {
    pub fn new(vendor: ServerKind, payload: serde_json::Value) -> Self {
        RawSession { vendor, payload }
    }
}

/// Split a sessions endpoint response body into raw per-session entries
pub fn split_response(vendor: ServerKind, body: &str) -> Result<Vec<RawSession>, serde_json::Error> {
    let entries = match vendor {
        ServerKind::Plex => plex::session_entries(body)?,
        ServerKind::Jellyfin | ServerKind::Emby => jellyfin::session_entries(body)?,
    };
    Ok(entries
        .into_iter()
        .map(|payload| RawSession::new(vendor, payload))
        .collect())
}

pub struct Normalizer {
    geo: Arc<dyn GeoResolver>,
}

impl Normalizer {
    pub fn new(geo: Arc<dyn GeoResolver>) -> Self {
        Normalizer { geo }
    }

    /// Map one snapshot into a session
    ///
    /// `Ok(None)` means the entry is not a real playback (trailer, preroll,
    /// idle client) and should be ignored.
    pub fn normalize(
        &self,
        server_id: &str,
        raw: &RawSession,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<Session>, NormalizeError> {
        match raw.vendor {
            ServerKind::Plex => plex::normalize(server_id, &raw.payload, observed_at, self.geo.as_ref()),
            ServerKind::Jellyfin | ServerKind::Emby => {
                jellyfin::normalize(server_id, raw.vendor, &raw.payload, observed_at, self.geo.as_ref())
            }
        }
    }

    /// Normalize a whole poll, keeping vendor order and dropping bad entries
    pub fn normalize_all(
        &self,
        server_id: &str,
        raws: &[RawSession],
        observed_at: DateTime<Utc>,
    ) -> Vec<Session> {
        raws.iter()
            .filter_map(|raw| match self.normalize(server_id, raw, observed_at) {
                Ok(session) => session,
                Err(e) => {
                    log::warn!("Dropping snapshot from server {}: {}", server_id, e);
                    None
                }
            })
            .collect()
    }
}

/// Server-scoped account identifier
pub fn account_id(server_id: &str, user_id: &str) -> String {
    format!("{}:{}", server_id, user_id)
}

/// Vendor ids arrive as strings or bare numbers
pub(crate) fn id_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Strip a trailing port from "a.b.c.d:port" style endpoints
pub(crate) fn clean_ip(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.parse::<IpAddr>().is_ok() {
        return endpoint.to_string();
    }
    if let Some((host, _port)) = endpoint.rsplit_once(':') {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.parse::<IpAddr>().is_ok() {
            return host.to_string();
        }
    }
    endpoint.to_string()
}

/// Overall decision from the per-stream ones: any transcode wins, then copy
pub(crate) fn combine_decisions(
    video: Option<StreamDecision>,
    audio: Option<StreamDecision>,
) -> StreamDecision {
    let parts = [video, audio];
    if parts.contains(&Some(StreamDecision::Transcode)) {
        StreamDecision::Transcode
    } else if parts.contains(&Some(StreamDecision::Copy)) {
        StreamDecision::Copy
    } else {
        StreamDecision::DirectPlay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geolocation::NoopResolver;
    use crate::models::session::fixtures::t0;
    use serde_json::json;

    #[test]
    fn test_clean_ip() {
        assert_eq!(clean_ip("1.2.3.4"), "1.2.3.4");
        assert_eq!(clean_ip("1.2.3.4:5555"), "1.2.3.4");
        assert_eq!(clean_ip("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(clean_ip("2001:db8::1"), "2001:db8::1");
        assert_eq!(clean_ip("garbage"), "garbage");
    }

    #[test]
    fn test_id_string() {
        assert_eq!(id_string(Some(&json!("42"))), Some("42".to_string()));
        assert_eq!(id_string(Some(&json!(42))), Some("42".to_string()));
        assert_eq!(id_string(Some(&json!(""))), None);
        assert_eq!(id_string(Some(&json!(null))), None);
        assert_eq!(id_string(None), None);
    }

    #[test]
    fn test_combine_decisions() {
        assert_eq!(combine_decisions(None, None), StreamDecision::DirectPlay);
        assert_eq!(
            combine_decisions(Some(StreamDecision::Copy), Some(StreamDecision::DirectPlay)),
            StreamDecision::Copy
        );
        assert_eq!(
            combine_decisions(Some(StreamDecision::Copy), Some(StreamDecision::Transcode)),
            StreamDecision::Transcode
        );
    }

    #[test]
    fn test_normalize_all_isolates_bad_entries() {
        let normalizer = Normalizer::new(Arc::new(NoopResolver));
        let raws = vec![
            RawSession::new(ServerKind::Plex, json!({"sessionKey": "1"})), // no user, no media id
            RawSession::new(
                ServerKind::Plex,
                json!({
                    "sessionKey": "2",
                    "ratingKey": "500",
                    "type": "movie",
                    "title": "Heat",
                    "User": {"id": "7", "title": "neil"},
                    "Player": {"address": "8.8.8.8", "state": "playing"}
                }),
            ),
            RawSession::new(ServerKind::Jellyfin, json!("not an object")),
        ];

        let sessions = normalizer.normalize_all("plex-main", &raws, t0());
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_key, "2");
        assert_eq!(sessions[0].server_user_id, "plex-main:7");
    }

    #[test]
    fn test_split_response_per_vendor() {
        let plex = r#"{"MediaContainer": {"size": 1, "Metadata": [{"sessionKey": "1"}]}}"#;
        let raws = split_response(ServerKind::Plex, plex).unwrap();
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].vendor, ServerKind::Plex);

        let jf = r#"[{"Id": "a"}, {"Id": "b"}]"#;
        assert_eq!(split_response(ServerKind::Emby, jf).unwrap().len(), 2);

        assert!(split_response(ServerKind::Jellyfin, "<html>").is_err());
    }
}
