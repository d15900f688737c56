//! Plain HTTP fallback towards a trusted endpoint.

use std::time::Duration;

use reqwest::Client;
use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum AltruistError {
    #[error("altruist request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("altruist answered with status {0}")]
    Status(u16),
}

#[derive(Debug, Serialize)]
struct AltruistRequest<'a> {
    data: &'a str,
    method: &'a str,
    path: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AltruistResponse {
    response: String,
}

#[derive(Debug, Clone, Default)]
pub struct AltruistClient {
    http: Client,
}

impl AltruistClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends the relay payload to `url` and returns the raw upstream answer.
    pub async fn relay(
        &self,
        url: &Url,
        data: &str,
        method: &str,
        path: Option<&str>,
        timeout: Duration,
    ) -> Result<String, AltruistError> {
        let response = self
            .http
            .post(url.clone())
            .timeout(timeout)
            .json(&AltruistRequest { data, method, path })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AltruistError::Status(status.as_u16()));
        }
        let body: AltruistResponse = response.json().await?;
        Ok(body.response)
    }
}
