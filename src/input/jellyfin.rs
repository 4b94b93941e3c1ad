use reqwest::header::ACCEPT;
use reqwest::Client;

use super::{endpoint, read_body, ClientError};
use crate::config::ServerKind;
use crate::normalizer::{split_response, RawSession};

const SESSIONS_PATH: &str = "/Sessions";

/// Client for Jellyfin and Emby, which share the sessions API
pub struct JellyfinClient {
    client: Client,
    vendor: ServerKind,
    base_url: String,
    token: String,
}

impl JellyfinClient {
    pub fn new(client: Client, vendor: ServerKind, base_url: &str, token: &str) -> Self {
        JellyfinClient {
            client,
            vendor,
            base_url: base_url.to_string(),
            token: token.to_string(),
        }
    }

    pub async fn fetch_sessions(&self) -> Result<Vec<RawSession>, ClientError> {
        let response = self
            .client
            .get(endpoint(&self.base_url, SESSIONS_PATH))
            .header("X-Emby-Token", &self.token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let body = read_body(response).await?;
        Ok(split_response(self.vendor, &body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::test_server::serve_once;

    #[tokio::test]
    async fn test_fetch_sessions_tags_vendor() {
        let (url, request) = serve_once("200 OK", r#"[{"Id": "a"}]"#).await;

        let client = JellyfinClient::new(Client::new(), ServerKind::Emby, &url, "api-key");
        let sessions = client.fetch_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].vendor, ServerKind::Emby);

        let request = request.await.unwrap().to_lowercase();
        assert!(request.starts_with("get /sessions"));
        assert!(request.contains("x-emby-token: api-key"));
    }

    #[tokio::test]
    async fn test_garbage_body_is_parse_error() {
        let (url, _request) = serve_once("200 OK", "<html>oops</html>").await;
        let client = JellyfinClient::new(Client::new(), ServerKind::Jellyfin, &url, "k");
        let err = client.fetch_sessions().await.unwrap_err();
        assert!(matches!(err, ClientError::Parse(_)));
    }
}
