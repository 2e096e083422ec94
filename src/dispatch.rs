use std::sync::Arc;

use log::{debug, error};
use tokio::task::JoinSet;

use crate::data::{BatchResult, RelayOutcome, RelayRequest};
use crate::relay::Relay;

/// Runs relay requests, one at a time or as a concurrent batch.
#[derive(Clone)]
pub struct Dispatcher {
    relay: Arc<dyn Relay>,
}

impl Dispatcher {
    pub fn new(relay: Arc<dyn Relay>) -> Self {
        Dispatcher { relay }
    }

    pub async fn dispatch_one(&self, request: RelayRequest) -> RelayOutcome {
        relay_request(self.relay.as_ref(), request).await
    }

    /// Sends every request on its own task and waits for all of them.
    ///
    /// A failing call only lands in `errors`; it never cuts the batch short. When a URL
    /// is repeated, whichever of its calls completes last decides its entry.
    pub async fn dispatch_batch(&self, requests: Vec<RelayRequest>) -> BatchResult {
        let mut calls = JoinSet::new();
        for request in requests {
            let relay = Arc::clone(&self.relay);
            calls.spawn(async move { relay_request(relay.as_ref(), request).await });
        }
        debug!("dispatching batch of {} requests", calls.len());

        let mut result = BatchResult::default();
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(outcome) => result.record(outcome),
                Err(err) => error!("relay task did not complete: {}", err),
            }
        }
        result
    }
}

async fn relay_request(relay: &dyn Relay, request: RelayRequest) -> RelayOutcome {
    let result = relay.post(&request.url, &request.body).await;
    RelayOutcome {
        url: request.url,
        result,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use hyper::StatusCode;
    use serde_json::{json, Value};

    use super::*;
    use crate::data::RelayResponse;
    use crate::relay::RelayError;

    /// Answers from a fixed table; unknown URLs time out.
    struct TableRelay {
        replies: HashMap<&'static str, (u16, Value, Duration)>,
    }

    #[async_trait]
    impl Relay for TableRelay {
        async fn post(&self, url: &str, _body: &Value) -> Result<RelayResponse, RelayError> {
            match self.replies.get(url) {
                Some((status, body, delay)) => {
                    tokio::time::sleep(*delay).await;
                    Ok(RelayResponse {
                        status: StatusCode::from_u16(*status).unwrap(),
                        body: body.clone(),
                    })
                }
                None => Err(RelayError::Timeout(Duration::from_millis(10))),
            }
        }
    }

    /// Echoes the request body back with the status taken from it.
    struct EchoRelay;

    #[async_trait]
    impl Relay for EchoRelay {
        async fn post(&self, _url: &str, body: &Value) -> Result<RelayResponse, RelayError> {
            let status = body["status"].as_u64().unwrap_or(200) as u16;
            let delay = body["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(RelayResponse {
                status: StatusCode::from_u16(status).unwrap(),
                body: body.clone(),
            })
        }
    }

    fn dispatcher(relay: impl Relay + 'static) -> Dispatcher {
        Dispatcher::new(Arc::new(relay))
    }

    #[tokio::test]
    async fn dispatch_one_tags_outcome_with_url() {
        let d = dispatcher(EchoRelay);
        let outcome = d
            .dispatch_one(RelayRequest::new("http://a", json!({"status": 201})))
            .await;
        assert_eq!(outcome.url, "http://a");
        let response = outcome.result.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.body, json!({"status": 201}));
    }

    #[tokio::test]
    async fn dispatch_one_is_repeatable() {
        let d = dispatcher(EchoRelay);
        let request = RelayRequest::new("http://a", json!({"k": "v"}));
        let first = d.dispatch_one(request.clone()).await.result.unwrap();
        let second = d.dispatch_one(request).await.result.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn dispatch_one_keeps_relay_error() {
        let d = dispatcher(TableRelay {
            replies: HashMap::new(),
        });
        let outcome = d.dispatch_one(RelayRequest::new("http://b", Value::Null)).await;
        assert_eq!(outcome.url, "http://b");
        assert!(matches!(outcome.result, Err(RelayError::Timeout(_))));
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let d = dispatcher(EchoRelay);
        let result = d.dispatch_batch(Vec::new()).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn batch_splits_successes_and_errors() {
        let mut replies = HashMap::new();
        replies.insert("http://a", (200, json!({"x": 1}), Duration::from_millis(0)));
        let d = dispatcher(TableRelay { replies });

        let result = d
            .dispatch_batch(vec![
                RelayRequest::new("http://a", Value::Null),
                RelayRequest::new("http://b", Value::Null),
            ])
            .await;

        assert_eq!(result.successes.len(), 1);
        assert_eq!(result.successes["http://a"].status_code, "200");
        assert_eq!(result.successes["http://a"].body, json!({"x": 1}));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            result.errors["http://b"].message,
            RelayError::Timeout(Duration::from_millis(10)).to_string()
        );
    }

    #[tokio::test]
    async fn batch_runs_calls_concurrently() {
        let requests = (0..20)
            .map(|i| RelayRequest::new(format!("http://host/{}", i), json!({"delay_ms": 200})))
            .collect();
        let d = dispatcher(EchoRelay);

        let started = Instant::now();
        let result = d.dispatch_batch(requests).await;
        assert_eq!(result.successes.len(), 20);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn batch_waits_for_slowest_call() {
        let mut replies = HashMap::new();
        replies.insert("http://fast", (200, json!(1), Duration::from_millis(0)));
        replies.insert("http://slow", (200, json!(2), Duration::from_millis(300)));
        let d = dispatcher(TableRelay { replies });

        let result = d
            .dispatch_batch(vec![
                RelayRequest::new("http://slow", Value::Null),
                RelayRequest::new("http://fast", Value::Null),
            ])
            .await;
        assert_eq!(result.successes.len(), 2);
        assert_eq!(result.successes["http://slow"].body, json!(2));
    }

    #[tokio::test]
    async fn repeated_url_gets_single_entry() {
        let d = dispatcher(EchoRelay);
        let result = d
            .dispatch_batch(vec![
                RelayRequest::new("http://a", json!({"status": 200})),
                RelayRequest::new("http://a", json!({"status": 404})),
                RelayRequest::new("http://b", json!({})),
            ])
            .await;
        assert_eq!(result.len(), 2);
        let status = &result.successes["http://a"].status_code;
        assert!(status == "200" || status == "404");
    }
}
