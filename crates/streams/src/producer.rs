use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use firstsip_core::CorrelationId;

use crate::log::{StreamError, StreamLog};
use crate::message::{DEFAULT_MAX_LEN, ExecutionRequest, REQUEST_STREAM, StreamMessage};

/// Hands execution requests to the external executor.
pub trait RequestPublisher: Send + Sync {
    /// Publish `request`; returns the stream entry id.
    fn publish(&self, request: &ExecutionRequest) -> Result<String, StreamError>;
}

impl<P> RequestPublisher for Arc<P>
where
    P: RequestPublisher + ?Sized,
{
    fn publish(&self, request: &ExecutionRequest) -> Result<String, StreamError> {
        (**self).publish(request)
    }
}

/// Appends messages to a capped stream. Fire-and-forget: nothing waits for a reader.
#[derive(Debug, Clone)]
pub struct Producer<L> {
    log: L,
    stream: String,
    max_len: usize,
}

impl<L: StreamLog> Producer<L> {
    /// Producer for the request stream with the default cap.
    pub fn new(log: L) -> Self {
        Self {
            log,
            stream: REQUEST_STREAM.to_string(),
            max_len: DEFAULT_MAX_LEN,
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Append any payload under `correlation_id`.
    pub fn publish_message<T: Serialize>(
        &self,
        correlation_id: CorrelationId,
        payload: &T,
    ) -> Result<String, StreamError> {
        let message = StreamMessage::new(correlation_id, payload, Utc::now())?;
        let id = self
            .log
            .append(&self.stream, &message.to_fields(), Some(self.max_len))?;

        debug!(
            stream = %self.stream,
            message_id = %id,
            correlation_id = %message.correlation_id,
            "message published"
        );
        Ok(id)
    }
}

impl<L: StreamLog> RequestPublisher for Producer<L> {
    fn publish(&self, request: &ExecutionRequest) -> Result<String, StreamError> {
        self.publish_message(request.correlation_id.clone(), request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryStreamLog;
    use firstsip_core::{OwnerId, Settings};

    #[test]
    fn publish_appends_to_request_stream_and_caps_it() {
        let log = Arc::new(InMemoryStreamLog::new());
        let producer = Producer::new(log.clone()).with_max_len(2);

        for i in 0..3 {
            let req = ExecutionRequest {
                correlation_id: CorrelationId::generate(),
                target_name: format!("plugin-{i}"),
                owner_id: OwnerId::new(1),
                settings: Settings::new(),
            };
            producer.publish(&req).unwrap();
        }

        let entries = log.entries(REQUEST_STREAM);
        assert_eq!(entries.len(), 2);

        let last = StreamMessage::from_fields(&entries[1].fields).unwrap();
        let req: ExecutionRequest = last.decode_payload().unwrap();
        assert_eq!(req.target_name, "plugin-2");
        assert_eq!(last.correlation_id, req.correlation_id);
    }
}
