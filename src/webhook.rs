use std::convert::Infallible;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::data::ErrorReply;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook server is already running")]
    AlreadyStarted,
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: hyper::Error,
    },
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("json data payload expected")]
    Read(#[source] hyper::Error),
    #[error("json data payload expected")]
    Decode(#[source] serde_json::Error),
    #[error("json data payload expected")]
    Empty,
}

/// Receives every payload the webhook accepted. Runs detached from the HTTP
/// response, which has already been decided by the time it is called.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn on_payload(&self, payload: Value);
}

/// `Starting` only exists while `start` holds the write lock, so readers never
/// see it. `Stopping` is visible while `shutdown` drains the server.
enum State {
    Stopped,
    Starting,
    Listening(Running),
    Stopping,
}

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<Result<(), hyper::Error>>,
    payloads: TaskTracker,
}

/// HTTP server with a single POST endpoint.
///
/// Goes Stopped -> Starting -> Listening -> Stopping -> Stopped. Can be started
/// again once stopped.
pub struct WebhookServer {
    state: RwLock<State>,
}

impl WebhookServer {
    pub fn new() -> Self {
        WebhookServer {
            state: RwLock::new(State::Stopped),
        }
    }

    /// Binds `addr` and starts serving `endpoint` in the background.
    /// Returns the address actually bound.
    pub async fn start(
        &self,
        endpoint: &str,
        addr: SocketAddr,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<SocketAddr, WebhookError> {
        let mut state = self.state.write().await;
        if !matches!(*state, State::Stopped) {
            return Err(WebhookError::AlreadyStarted);
        }
        *state = State::Starting;

        let builder = match Server::try_bind(&addr) {
            Ok(builder) => builder,
            Err(source) => {
                *state = State::Stopped;
                return Err(WebhookError::Bind { addr, source });
            }
        };

        let payloads = TaskTracker::new();
        let route = Arc::new(Route {
            endpoint: endpoint.to_owned(),
            handler,
            payloads: payloads.clone(),
        });
        let service = make_service_fn(move |_: &AddrStream| {
            let route = Arc::clone(&route);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let route = Arc::clone(&route);
                    async move { Ok::<_, Infallible>(route.serve(req).await) }
                }))
            }
        });
        let server = builder.serve(service);
        let local_addr = server.local_addr();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(server.with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        }));

        info!("webhook server started at: {}{}", local_addr, endpoint);
        *state = State::Listening(Running {
            addr: local_addr,
            shutdown: shutdown_tx,
            server,
            payloads,
        });
        Ok(local_addr)
    }

    pub async fn current_address(&self) -> Option<SocketAddr> {
        match &*self.state.read().await {
            State::Listening(running) => Some(running.addr),
            _ => None,
        }
    }

    /// Stops accepting connections and gives in-flight requests, and the handler
    /// calls they triggered, up to `grace` to finish.
    /// Does nothing unless the server is listening.
    pub async fn shutdown(&self, grace: Duration) {
        let running = {
            let mut state = self.state.write().await;
            match mem::replace(&mut *state, State::Stopping) {
                State::Listening(running) => running,
                other => {
                    *state = other;
                    return;
                }
            }
        };

        let deadline = Instant::now() + grace;
        let _ = running.shutdown.send(());
        let mut server = running.server;
        match tokio::time::timeout_at(deadline, &mut server).await {
            Ok(Ok(Ok(()))) => info!("webhook server at {} stopped", running.addr),
            Ok(Ok(Err(e))) => error!("webhook server at {} failed: {}", running.addr, e),
            Ok(Err(e)) => error!("webhook server task failed: {}", e),
            Err(_) => {
                warn!(
                    "webhook server at {} still busy after {:?}, dropping it",
                    running.addr, grace
                );
                server.abort();
            }
        }

        running.payloads.close();
        if tokio::time::timeout_at(deadline, running.payloads.wait())
            .await
            .is_err()
        {
            warn!(
                "{} webhook payloads still being handled after {:?}",
                running.payloads.len(),
                grace
            );
        }
        *self.state.write().await = State::Stopped;
    }
}

impl Default for WebhookServer {
    fn default() -> Self {
        WebhookServer::new()
    }
}

struct Route {
    endpoint: String,
    handler: Arc<dyn WebhookHandler>,
    payloads: TaskTracker,
}

impl Route {
    async fn serve(&self, req: Request<Body>) -> Response<Body> {
        if req.uri().path() != self.endpoint {
            return empty(StatusCode::NOT_FOUND);
        }
        if req.method() != Method::POST {
            let mut res = empty(StatusCode::METHOD_NOT_ALLOWED);
            res.headers_mut().insert(ALLOW, HeaderValue::from_static("POST"));
            return res;
        }

        let payload = match read_payload(req.into_body()).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!("rejected webhook call: {:?}", e);
                return error_response(StatusCode::BAD_REQUEST, &e);
            }
        };
        let handler = Arc::clone(&self.handler);
        self.payloads
            .spawn(async move { handler.on_payload(payload).await });
        empty(StatusCode::ACCEPTED)
    }
}

async fn read_payload(body: Body) -> Result<Value, PayloadError> {
    let bytes = hyper::body::to_bytes(body).await.map_err(PayloadError::Read)?;
    // Only the first JSON value counts; whatever trails it is ignored.
    match serde_json::Deserializer::from_slice(&bytes)
        .into_iter::<Value>()
        .next()
    {
        Some(value) => value.map_err(PayloadError::Decode),
        None => Err(PayloadError::Empty),
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorReply,
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = status;
    res
}

fn error_response(status: StatusCode, err: &PayloadError) -> Response<Body> {
    let body = ErrorBody {
        error: ErrorReply::new(err.to_string()),
    };
    match serde_json::to_vec(&body) {
        Ok(bytes) => {
            let mut res = Response::new(Body::from(bytes));
            *res.status_mut() = status;
            res.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            res
        }
        Err(e) => {
            error!("error while encoding error response: {}", e);
            empty(status)
        }
    }
}
