//! Briefing content generation.
//!
//! The generate job handler asks a [`BriefingGenerator`] for content. In
//! production that is the external HTTP generator; development and tests use
//! [`StubGenerator`].

pub mod http;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use firstsip_core::OwnerId;

use crate::config::GeneratorConfig;

pub use http::HttpGenerator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    pub summary: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherInfo {
    pub location: String,
    pub temperature: i32,
    pub condition: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSummary {
    #[serde(default)]
    pub today_events: Vec<String>,
    #[serde(default)]
    pub tomorrow_tasks: Vec<String>,
}

/// Content of a generated briefing, stored as JSON on the briefing row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BriefingContent {
    #[serde(default)]
    pub news: Vec<NewsItem>,
    #[serde(default)]
    pub weather: WeatherInfo,
    #[serde(default)]
    pub work: WorkSummary,
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("generator not configured: {0}")]
    Config(String),

    #[error("generator request failed: {0}")]
    Network(String),

    #[error("generator returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to decode generator response: {0}")]
    Decode(String),
}

impl GeneratorError {
    /// Network failures, timeouts, throttling and 5xx may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            GeneratorError::Network(_) => true,
            GeneratorError::Api { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            GeneratorError::Config(_) | GeneratorError::Decode(_) => false,
        }
    }
}

pub trait BriefingGenerator: Send + Sync {
    fn generate(&self, owner_id: OwnerId) -> Result<BriefingContent, GeneratorError>;
}

impl<G> BriefingGenerator for Arc<G>
where
    G: BriefingGenerator + ?Sized,
{
    fn generate(&self, owner_id: OwnerId) -> Result<BriefingContent, GeneratorError> {
        (**self).generate(owner_id)
    }
}

/// Canned content, optionally after a delay that simulates generation time.
#[derive(Debug, Clone, Default)]
pub struct StubGenerator {
    delay: Duration,
}

impl StubGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn content() -> BriefingContent {
        BriefingContent {
            news: vec![
                NewsItem {
                    title: "Breaking: AI Breakthrough Announced".into(),
                    summary: "Researchers report a significant milestone in machine learning.".into(),
                    url: "https://example.com/ai-breakthrough".into(),
                },
                NewsItem {
                    title: "Tech Giant Launches New Product Line".into(),
                    summary: "New consumer devices unveiled at the annual conference.".into(),
                    url: "https://example.com/new-product".into(),
                },
            ],
            weather: WeatherInfo {
                location: "San Francisco".into(),
                temperature: 65,
                condition: "Partly Cloudy".into(),
            },
            work: WorkSummary {
                today_events: vec![
                    "10:00 AM - Team standup meeting".into(),
                    "2:00 PM - Client presentation".into(),
                ],
                tomorrow_tasks: vec![
                    "Review Q1 roadmap document".into(),
                    "Update project dependencies".into(),
                ],
            },
        }
    }
}

impl BriefingGenerator for StubGenerator {
    fn generate(&self, _owner_id: OwnerId) -> Result<BriefingContent, GeneratorError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(Self::content())
    }
}

/// Pick the generator the configuration asks for.
pub fn from_config(config: &GeneratorConfig) -> Result<Arc<dyn BriefingGenerator>, GeneratorError> {
    if config.stub {
        return Ok(Arc::new(StubGenerator::new().with_delay(Duration::from_secs(2))));
    }
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| GeneratorError::Config("GENERATOR_URL is not set".into()))?;
    Ok(Arc::new(HttpGenerator::new(
        url,
        config.secret.clone().unwrap_or_default(),
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(GeneratorError::Network("reset".into()).is_retryable());
        assert!(GeneratorError::Api { status: 503, body: String::new() }.is_retryable());
        assert!(GeneratorError::Api { status: 429, body: String::new() }.is_retryable());
        assert!(!GeneratorError::Api { status: 401, body: String::new() }.is_retryable());
        assert!(!GeneratorError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn content_tolerates_missing_sections() {
        let content: BriefingContent =
            serde_json::from_str(r#"{"news":[{"title":"t","summary":"s","url":"u"}]}"#).unwrap();
        assert_eq!(content.news.len(), 1);
        assert_eq!(content.weather, WeatherInfo::default());
        assert!(content.work.today_events.is_empty());
    }

    #[test]
    fn stub_mode_needs_no_url() {
        let config = GeneratorConfig {
            url: None,
            secret: None,
            stub: true,
        };
        assert!(from_config(&config).is_ok());

        let missing = GeneratorConfig { stub: false, ..config };
        assert!(matches!(from_config(&missing), Err(GeneratorError::Config(_))));
    }
}
