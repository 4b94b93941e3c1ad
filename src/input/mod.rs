//! Media server session sources
//!
//! Thin HTTP clients that fetch the current sessions document of a server and
//! split it into raw per-session entries for the normalizer.

pub mod jellyfin;
pub mod plex;

pub use jellyfin::JellyfinClient;
pub use plex::PlexClient;

use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ServerConfig, ServerKind};
use crate::normalizer::RawSession;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unreadable sessions response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One configured media server
pub enum MediaServerClient {
    Plex(PlexClient),
    Jellyfin(JellyfinClient),
    Emby(JellyfinClient),
}

impl MediaServerClient {
    pub fn from_config(server: &ServerConfig, timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(timeout).build()?;
        let client = match server.kind {
            ServerKind::Plex => MediaServerClient::Plex(PlexClient::new(http, &server.url, &server.token)),
            ServerKind::Jellyfin => MediaServerClient::Jellyfin(JellyfinClient::new(
                http,
                ServerKind::Jellyfin,
                &server.url,
                &server.token,
            )),
            ServerKind::Emby => MediaServerClient::Emby(JellyfinClient::new(
                http,
                ServerKind::Emby,
                &server.url,
                &server.token,
            )),
        };
        Ok(client)
    }

    pub fn kind(&self) -> ServerKind {
        match self {
            MediaServerClient::Plex(_) => ServerKind::Plex,
            MediaServerClient::Jellyfin(_) => ServerKind::Jellyfin,
            MediaServerClient::Emby(_) => ServerKind::Emby,
        }
    }

    /// Fetch the sessions currently reported by the server
    pub async fn fetch_sessions(&self) -> Result<Vec<RawSession>, ClientError> {
        match self {
            MediaServerClient::Plex(client) => client.fetch_sessions().await,
            MediaServerClient::Jellyfin(client) | MediaServerClient::Emby(client) => {
                client.fetch_sessions().await
            }
        }
    }
}

/// Read a response body, mapping non-success statuses to errors
pub(crate) async fn read_body(response: reqwest::Response) -> Result<String, ClientError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        });
    }
    Ok(body)
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: ServerKind) -> ServerConfig {
        ServerConfig {
            id: "srv".to_string(),
            name: "Test".to_string(),
            kind,
            url: "http://127.0.0.1:1/".to_string(),
            token: "secret".to_string(),
        }
    }

    #[test]
    fn test_endpoint_joins_paths() {
        assert_eq!(endpoint("http://plex:32400/", "/status/sessions"), "http://plex:32400/status/sessions");
        assert_eq!(endpoint("http://jf:8096", "/Sessions"), "http://jf:8096/Sessions");
    }

    #[test]
    fn test_from_config_picks_variant() {
        let timeout = Duration::from_secs(1);
        for kind in [ServerKind::Plex, ServerKind::Jellyfin, ServerKind::Emby] {
            let client = MediaServerClient::from_config(&server(kind), timeout).unwrap();
            assert_eq!(client.kind(), kind);
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let client = MediaServerClient::from_config(&server(ServerKind::Plex), Duration::from_millis(500)).unwrap();
        let err = client.fetch_sessions().await.unwrap_err();
        assert!(matches!(err, ClientError::Http(_)));
    }
}
