//! HTTP briefing generator.
//!
//! `POST {base_url}/generate` with `{"user_id": …}` and the shared secret in
//! `X-N8N-SECRET`. A 200 carries [`BriefingContent`].

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use firstsip_core::OwnerId;

use super::{BriefingContent, BriefingGenerator, GeneratorError};

pub const SECRET_HEADER: &str = "X-N8N-SECRET";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpGenerator {
    http: Client,
    base_url: String,
    secret: String,
}

impl std::fmt::Debug for HttpGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGenerator")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpGenerator {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> Result<Self, GeneratorError> {
        Self::with_timeout(base_url, secret, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GeneratorError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(GeneratorError::Config("base url must not be empty".into()));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeneratorError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            secret: secret.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/generate", self.base_url)
    }
}

impl BriefingGenerator for HttpGenerator {
    #[instrument(skip(self), fields(url = %self.endpoint()), err)]
    fn generate(&self, owner_id: OwnerId) -> Result<BriefingContent, GeneratorError> {
        let resp = self
            .http
            .post(self.endpoint())
            .header(SECRET_HEADER, &self.secret)
            .json(&serde_json::json!({ "user_id": owner_id.get() }))
            .send()
            .map_err(|e| GeneratorError::Network(e.to_string()))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().unwrap_or_default();
            return Err(GeneratorError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let content = resp
            .json::<BriefingContent>()
            .map_err(|e| GeneratorError::Decode(e.to_string()))?;
        debug!(%owner_id, news = content.news.len(), "briefing content received");
        Ok(content)
    }
}
