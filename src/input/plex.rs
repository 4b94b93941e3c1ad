use reqwest::header::ACCEPT;
use reqwest::Client;

use super::{endpoint, read_body, ClientError};
use crate::config::ServerKind;
use crate::normalizer::{split_response, RawSession};

const SESSIONS_PATH: &str = "/status/sessions";

pub struct PlexClient {
    client: Client,
    base_url: String,
    token: String,
}

impl PlexClient {
    pub fn new(client: Client, base_url: &str, token: &str) -> Self {
        PlexClient {
            client,
            base_url: base_url.to_string(),
            token: token.to_string(),
        }
    }

    pub async fn fetch_sessions(&self) -> Result<Vec<RawSession>, ClientError> {
        let response = self
            .client
            .get(endpoint(&self.base_url, SESSIONS_PATH))
            .header("X-Plex-Token", &self.token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let body = read_body(response).await?;
        Ok(split_response(ServerKind::Plex, &body)?)
    }
}
