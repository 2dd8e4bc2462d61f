//! Wire format of the bridge streams.
//!
//! Every entry carries four fields:
//!
//! | field            | content                                  |
//! |------------------|------------------------------------------|
//! | `correlation_id` | links request, result and run record     |
//! | `payload`        | JSON body ([`ExecutionRequest`] / [`ExecutionResult`]) |
//! | `published_at`   | unix seconds                             |
//! | `schema_version` | `"v1"`                                   |

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use firstsip_core::{CorrelationId, OwnerId, Settings};

use crate::log::StreamError;

pub const REQUEST_STREAM: &str = "plugin:requests";
pub const RESULT_STREAM: &str = "plugin:results";
pub const DEFAULT_RESULT_GROUP: &str = "briefing-workers";
pub const SCHEMA_VERSION: &str = "v1";

/// Approximate cap applied on every append.
pub const DEFAULT_MAX_LEN: usize = 10_000;

const FIELD_CORRELATION_ID: &str = "correlation_id";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_PUBLISHED_AT: &str = "published_at";
const FIELD_SCHEMA_VERSION: &str = "schema_version";

/// Name of the dead-letter stream paired with `stream`.
pub fn dead_letter_stream(stream: &str) -> String {
    format!("{stream}:dlq")
}

/// Request handed to the external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(alias = "plugin_run_id")]
    pub correlation_id: CorrelationId,
    #[serde(alias = "plugin_name")]
    pub target_name: String,
    #[serde(alias = "user_id")]
    pub owner_id: OwnerId,
    #[serde(default)]
    pub settings: Settings,
}

/// Result reported back by the external executor.
///
/// `status` stays a plain string here; the status projector decides what is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(alias = "plugin_run_id")]
    pub correlation_id: CorrelationId,
    pub status: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// An immutable bridge message as stored in a stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub correlation_id: CorrelationId,
    /// Raw JSON payload.
    pub payload: String,
    pub published_at: DateTime<Utc>,
    pub schema_version: String,
}

impl StreamMessage {
    pub fn new<T: Serialize>(
        correlation_id: CorrelationId,
        payload: &T,
        published_at: DateTime<Utc>,
    ) -> Result<Self, StreamError> {
        let payload =
            serde_json::to_string(payload).map_err(|e| StreamError::Encode(e.to_string()))?;
        Ok(Self {
            correlation_id,
            payload,
            published_at,
            schema_version: SCHEMA_VERSION.to_string(),
        })
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_CORRELATION_ID.to_string(), self.correlation_id.to_string()),
            (FIELD_PAYLOAD.to_string(), self.payload.clone()),
            (
                FIELD_PUBLISHED_AT.to_string(),
                self.published_at.timestamp().to_string(),
            ),
            (FIELD_SCHEMA_VERSION.to_string(), self.schema_version.clone()),
        ]
    }

    /// Decode a stream entry.
    ///
    /// Producers that only write `payload` are tolerated: the correlation id is
    /// then taken from the payload body, a missing timestamp becomes the epoch,
    /// and a missing schema version means `v1`. Any other schema version is rejected.
    pub fn from_fields(fields: &[(String, String)]) -> Result<Self, StreamError> {
        let get = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        let payload = get(FIELD_PAYLOAD)
            .ok_or_else(|| StreamError::Decode("missing payload field".into()))?
            .to_string();

        let schema_version = get(FIELD_SCHEMA_VERSION).unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(StreamError::Decode(format!(
                "unsupported schema_version: {schema_version}"
            )));
        }

        let correlation_id = match get(FIELD_CORRELATION_ID) {
            Some(raw) => raw
                .parse::<CorrelationId>()
                .map_err(|e| StreamError::Decode(e.to_string()))?,
            None => correlation_from_payload(&payload)?,
        };

        let published_at = match get(FIELD_PUBLISHED_AT) {
            Some(raw) => {
                let secs = raw
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| StreamError::Decode(format!("published_at: {e}")))?;
                Utc.timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| StreamError::Decode(format!("published_at out of range: {secs}")))?
            }
            None => DateTime::<Utc>::UNIX_EPOCH,
        };

        Ok(Self {
            correlation_id,
            payload,
            published_at,
            schema_version: schema_version.to_string(),
        })
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, StreamError> {
        serde_json::from_str(&self.payload).map_err(|e| StreamError::Decode(e.to_string()))
    }
}

fn correlation_from_payload(payload: &str) -> Result<CorrelationId, StreamError> {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(alias = "plugin_run_id")]
        correlation_id: CorrelationId,
    }

    serde_json::from_str::<Probe>(payload)
        .map(|p| p.correlation_id)
        .map_err(|e| StreamError::Decode(format!("correlation_id: {e}")))
}
