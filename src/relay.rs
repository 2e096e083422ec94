use std::time::Duration;

use async_trait::async_trait;
use bytes::Buf as _;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Request};
use hyper_tls::HttpsConnector;
use log::debug;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::data::RelayResponse;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("cannot encode request body: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("cannot build request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("{0}")]
    Transport(#[from] hyper::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("cannot decode response body: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Sends a JSON body somewhere and hands back the status and the decoded JSON reply.
///
/// Non-2xx statuses are not errors; only failing to encode, deliver or decode is.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn post(&self, url: &str, body: &Value) -> Result<RelayResponse, RelayError>;
}

/// [`Relay`] over a shared hyper client. Every call (connect, send, read body) is bounded by one timeout.
pub struct HttpRelay {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    timeout: Duration,
}

impl HttpRelay {
    pub fn new(timeout: Duration) -> Self {
        let https = HttpsConnector::new();
        let client = Client::builder().build::<_, Body>(https);
        HttpRelay { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for HttpRelay {
    fn default() -> Self {
        HttpRelay::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn post(&self, url: &str, body: &Value) -> Result<RelayResponse, RelayError> {
        let url = Url::parse(url)?;
        let payload = serde_json::to_vec(body).map_err(RelayError::Serialization)?;
        let request = Request::post(url.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(payload))?;

        debug!("POST {}", url);
        let exchange = async {
            let res = self.client.request(request).await?;
            let status = res.status();
            let body = hyper::body::aggregate(res.into_body()).await?;
            let body = serde_json::from_reader(body.reader()).map_err(RelayError::Decode)?;
            Ok::<_, RelayError>(RelayResponse { status, body })
        };
        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| RelayError::Timeout(self.timeout))??;
        debug!("POST {} -> {}", url, response.status);
        Ok(response)
    }
}
