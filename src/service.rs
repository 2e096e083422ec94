//! Wires the relay, the webhook server and the task runtime together.

use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::data::{BatchRequest, ErrorReply, RelayRequest, TaskOutput, WebhookEnvelope};
use crate::dispatch::Dispatcher;
use crate::relay::{HttpRelay, Relay};
use crate::runtime::{RuntimeError, Task, TaskHandler, TaskRuntime};
use crate::webhook::{WebhookError, WebhookHandler, WebhookServer};

pub const EXECUTE_TASK: &str = "execute";
pub const BATCH_EXECUTE_TASK: &str = "batchExecute";
pub const ON_REQUEST_EVENT: &str = "onRequest";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Answers `execute` and `batchExecute` tasks by relaying them over HTTP.
pub struct TaskAdapter {
    dispatcher: Dispatcher,
}

impl TaskAdapter {
    pub fn new(dispatcher: Dispatcher) -> Self {
        TaskAdapter { dispatcher }
    }

    pub async fn execute(&self, input: &str) -> TaskOutput {
        let request: RelayRequest = match serde_json::from_str(input) {
            Ok(request) => request,
            Err(e) => {
                return TaskOutput::Error(ErrorReply::new(format!(
                    "err while decoding input data: {}",
                    e
                )))
            }
        };
        match self.dispatcher.dispatch_one(request).await.result {
            Ok(response) => TaskOutput::Success(response.into()),
            Err(e) => TaskOutput::Error(ErrorReply::new(format!(
                "err while performing the post request: {}",
                e
            ))),
        }
    }

    pub async fn batch_execute(&self, input: &str) -> TaskOutput {
        match serde_json::from_str::<BatchRequest>(input) {
            Ok(request) => TaskOutput::Batch(self.dispatcher.dispatch_batch(request.batch).await),
            Err(e) => TaskOutput::Error(ErrorReply::new(format!(
                "err while decoding batch input data: {}",
                e
            ))),
        }
    }
}

#[async_trait]
impl TaskHandler for TaskAdapter {
    async fn handle(&self, task: Task) {
        let output = match task.key.as_str() {
            EXECUTE_TASK => self.execute(&task.input).await,
            BATCH_EXECUTE_TASK => self.batch_execute(&task.input).await,
            other => {
                warn!("received unknown task {} ({})", other, task.execution_id);
                TaskOutput::Error(ErrorReply::new(format!("unknown task {}", other)))
            }
        };
        if let Err(e) = task.reply(output).await {
            error!("error while replying to {}: {}", task.execution_id, e);
        }
    }
}

/// Publishes every accepted webhook payload as an `onRequest` event.
pub struct EventForwarder {
    runtime: Arc<dyn TaskRuntime>,
}

impl EventForwarder {
    pub fn new(runtime: Arc<dyn TaskRuntime>) -> Self {
        EventForwarder { runtime }
    }
}

#[async_trait]
impl WebhookHandler for EventForwarder {
    async fn on_payload(&self, payload: Value) {
        let envelope = WebhookEnvelope::new(payload);
        let data = match serde_json::to_value(&envelope) {
            Ok(data) => data,
            Err(e) => {
                error!("error while encoding event {}: {}", envelope.id, e);
                return;
            }
        };
        if let Err(e) = self.runtime.emit_event(ON_REQUEST_EVENT, data).await {
            error!("error while emitting an event: {}", e);
        }
    }
}

pub struct Service {
    config: Config,
    runtime: Arc<dyn TaskRuntime>,
    webhook: WebhookServer,
    adapter: Arc<TaskAdapter>,
    tasks: TaskTracker,
}

impl Service {
    pub fn new(config: Config, runtime: Arc<dyn TaskRuntime>) -> Self {
        let relay = HttpRelay::new(config.timeout);
        Service::with_relay(config, runtime, Arc::new(relay))
    }

    pub fn with_relay(config: Config, runtime: Arc<dyn TaskRuntime>, relay: Arc<dyn Relay>) -> Self {
        Service {
            config,
            runtime,
            webhook: WebhookServer::new(),
            adapter: Arc::new(TaskAdapter::new(Dispatcher::new(relay))),
            tasks: TaskTracker::new(),
        }
    }

    pub fn webhook(&self) -> &WebhookServer {
        &self.webhook
    }

    /// Starts the webhook, then serves tasks until the runtime stops delivering them.
    ///
    /// Tasks still in flight when this returns keep running until [`Service::close`].
    pub async fn start(&self) -> Result<(), ServiceError> {
        let forwarder = Arc::new(EventForwarder::new(Arc::clone(&self.runtime)));
        self.webhook
            .start(&self.config.webhook_endpoint, self.config.webhook_addr, forwarder)
            .await?;
        info!("listening for tasks");
        self.runtime
            .listen_tasks(self.adapter.clone(), self.tasks.clone())
            .await?;
        info!("task runtime finished delivering tasks");
        Ok(())
    }

    /// Stops the webhook, waits for every in-flight task to reply, then closes the runtime.
    pub async fn close(&self) -> Result<(), ServiceError> {
        self.webhook.shutdown(self.config.shutdown_grace).await;
        self.tasks.close();
        if !self.tasks.is_empty() {
            info!("waiting for {} in-flight tasks", self.tasks.len());
        }
        self.tasks.wait().await;
        self.runtime.close().await?;
        Ok(())
    }
}
