use std::collections::BTreeMap;

use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::relay::RelayError;

/// A single outbound POST: where to send it and what to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub url: String,
    #[serde(default)]
    pub body: Value,
}

impl RelayRequest {
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        RelayRequest { url: url.into(), body }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub batch: Vec<RelayRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayResponse {
    pub status: StatusCode,
    pub body: Value,
}

/// What came back from relaying one request, tagged with the URL it was sent to.
#[derive(Debug)]
pub struct RelayOutcome {
    pub url: String,
    pub result: Result<RelayResponse, RelayError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessReply {
    pub status_code: String,
    pub body: Value,
}

impl From<RelayResponse> for SuccessReply {
    fn from(response: RelayResponse) -> Self {
        SuccessReply {
            status_code: response.status.as_u16().to_string(),
            body: response.body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
}

impl ErrorReply {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorReply { message: message.into() }
    }
}

/// Outcomes of a batch keyed by URL. A URL is present in at most one of the maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub successes: BTreeMap<String, SuccessReply>,
    pub errors: BTreeMap<String, ErrorReply>,
}

impl BatchResult {
    /// Records an outcome, replacing whatever an earlier outcome for the same URL left in either map.
    pub fn record(&mut self, outcome: RelayOutcome) {
        let RelayOutcome { url, result } = outcome;
        match result {
            Ok(response) => {
                self.errors.remove(&url);
                self.successes.insert(url, response.into());
            }
            Err(err) => {
                self.successes.remove(&url);
                self.errors.insert(url, ErrorReply::new(err.to_string()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.successes.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.successes.is_empty() && self.errors.is_empty()
    }
}

/// Payload of the `onRequest` event emitted for every accepted webhook call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub date: i64,
    pub id: String,
    pub body: Value,
}

impl WebhookEnvelope {
    pub fn new(body: Value) -> Self {
        WebhookEnvelope {
            date: chrono::Utc::now().timestamp(),
            id: uuid::Uuid::new_v4().to_string(),
            body,
        }
    }
}

/// The reply kinds a task can finish with.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Success(SuccessReply),
    Error(ErrorReply),
    Batch(BatchResult),
}

impl TaskOutput {
    pub fn key(&self) -> &'static str {
        match self {
            TaskOutput::Success(_) => "success",
            TaskOutput::Error(_) => "error",
            TaskOutput::Batch(_) => "batch",
        }
    }

    pub fn data(&self) -> serde_json::Result<Value> {
        match self {
            TaskOutput::Success(reply) => serde_json::to_value(reply),
            TaskOutput::Error(reply) => serde_json::to_value(reply),
            TaskOutput::Batch(result) => serde_json::to_value(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn ok(url: &str, status: u16, body: Value) -> RelayOutcome {
        RelayOutcome {
            url: url.to_owned(),
            result: Ok(RelayResponse {
                status: StatusCode::from_u16(status).unwrap(),
                body,
            }),
        }
    }

    fn failed(url: &str) -> RelayOutcome {
        RelayOutcome {
            url: url.to_owned(),
            result: Err(RelayError::Timeout(Duration::from_secs(1))),
        }
    }

    #[test]
    fn batch_result_serializes_with_camel_case_status() {
        let mut result = BatchResult::default();
        result.record(ok("http://a", 200, json!({"x": 1})));
        result.record(failed("http://b"));

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({
                "successes": {"http://a": {"statusCode": "200", "body": {"x": 1}}},
                "errors": {"http://b": {"message": "request timed out after 1s"}}
            })
        );
    }

    #[test]
    fn later_outcome_moves_url_between_maps() {
        let mut result = BatchResult::default();
        result.record(failed("http://a"));
        result.record(ok("http://a", 500, Value::Null));
        assert_eq!(result.len(), 1);
        assert_eq!(result.successes["http://a"].status_code, "500");

        result.record(failed("http://a"));
        assert_eq!(result.len(), 1);
        assert!(result.successes.is_empty());
    }

    #[test]
    fn envelope_has_fresh_id_and_positive_date() {
        let first = WebhookEnvelope::new(json!({"body": "test"}));
        let second = WebhookEnvelope::new(json!({"body": "test"}));
        assert!(first.date > 0);
        assert!(uuid::Uuid::parse_str(&first.id).is_ok());
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn relay_request_body_defaults_to_null() {
        let request: RelayRequest = serde_json::from_str(r#"{"url":"http://a"}"#).unwrap();
        assert_eq!(request, RelayRequest::new("http://a", Value::Null));
    }

    #[test]
    fn task_output_keys() {
        assert_eq!(TaskOutput::Error(ErrorReply::new("x")).key(), "error");
        assert_eq!(TaskOutput::Batch(BatchResult::default()).key(), "batch");
        let data = TaskOutput::Batch(BatchResult::default()).data().unwrap();
        assert_eq!(data, json!({"successes": {}, "errors": {}}));
    }
}
