use std::time::Duration;

use relay_contracts::{CHANGE_MESSAGE_PATH, PROCESS_API_PAYLOAD_PATH};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;

use crate::RelayError;

#[derive(Debug, Clone)]
pub struct CaseApiResponse {
    pub url: String,
    pub status: u16,
    /// Status code with its reason phrase, e.g. `500 Internal Server Error`.
    pub status_line: String,
    pub body: Vec<u8>,
}

pub struct CaseApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl CaseApiClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn process_api_payload(&self, raw: &[u8]) -> Result<CaseApiResponse, RelayError> {
        self.post(PROCESS_API_PAYLOAD_PATH, raw).await
    }

    pub async fn forward_change_message(&self, raw: &[u8]) -> Result<CaseApiResponse, RelayError> {
        self.post(CHANGE_MESSAGE_PATH, raw).await
    }

    /// Sends the event bytes untouched; the API relies on fields this relay never reads.
    async fn post(&self, path: &str, raw: &[u8]) -> Result<CaseApiResponse, RelayError> {
        let token = self.token.as_deref().ok_or(RelayError::MissingCredential)?;
        let url = self.url(path);
        debug!(%url, payload = %String::from_utf8_lossy(raw), "posting to case API");

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(token)
            .body(raw.to_vec())
            .send()
            .await
            .map_err(|e| RelayError::Network {
                url: url.clone(),
                message: e.to_string(),
            })?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| RelayError::Network {
            url: url.clone(),
            message: format!("failed to read body: {e}"),
        })?;

        Ok(CaseApiResponse {
            url,
            status: status.as_u16(),
            status_line: status.to_string(),
            body: body.to_vec(),
        })
    }
}
