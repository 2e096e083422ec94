//! Boundary to the task/event runtime the bridge is plugged into.
//!
//! The runtime delivers tasks, accepts events and collects task results. Two
//! transports are provided: in-process channels and newline-delimited JSON over
//! stdin/stdout.

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::{mpsc, Mutex};
use tokio_util::task::TaskTracker;

use crate::data::TaskOutput;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime connection closed")]
    Closed,
    #[error("tasks are already being listened to")]
    AlreadyListening,
    #[error("cannot encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A task as delivered by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub execution_id: String,
    pub task_key: String,
    /// Encoded task input. Inline JSON values are accepted and re-encoded.
    #[serde(deserialize_with = "input_data")]
    pub input_data: String,
}

fn input_data<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(raw) => raw,
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedEvent {
    pub event_key: String,
    pub event_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedResult {
    pub execution_id: String,
    pub output_key: String,
    pub output_data: Value,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn emit_event(&self, name: &str, data: Value) -> Result<(), RuntimeError>;
}

#[async_trait]
pub trait TaskReplier: Send + Sync {
    async fn submit(&self, result: SubmittedResult) -> Result<(), RuntimeError>;
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task);
}

#[async_trait]
pub trait TaskRuntime: EventPublisher {
    /// Feeds every incoming task to `handler` until the runtime stops delivering.
    ///
    /// Each task runs on `tasks`; returning does not wait for them, so close and
    /// wait on the tracker before tearing the process down.
    async fn listen_tasks(
        &self,
        handler: Arc<dyn TaskHandler>,
        tasks: TaskTracker,
    ) -> Result<(), RuntimeError>;

    async fn close(&self) -> Result<(), RuntimeError>;
}

/// A received task together with the channel its result goes back on.
pub struct Task {
    pub execution_id: String,
    pub key: String,
    pub input: String,
    replier: Arc<dyn TaskReplier>,
}

impl Task {
    pub fn new(message: TaskMessage, replier: Arc<dyn TaskReplier>) -> Self {
        Task {
            execution_id: message.execution_id,
            key: message.task_key,
            input: message.input_data,
            replier,
        }
    }

    pub async fn reply(&self, output: TaskOutput) -> Result<(), RuntimeError> {
        let output_data = output.data().map_err(|source| RuntimeError::Encode {
            what: "task output",
            source,
        })?;
        self.replier
            .submit(SubmittedResult {
                execution_id: self.execution_id.clone(),
                output_key: output.key().to_owned(),
                output_data,
            })
            .await
    }
}

fn spawn_task(tasks: &TaskTracker, handler: &Arc<dyn TaskHandler>, task: Task) {
    let handler = Arc::clone(handler);
    tasks.spawn(async move { handler.handle(task).await });
}

/// Runtime over tokio channels. The other ends live in [`ChannelRuntimeHandle`].
pub struct ChannelRuntime {
    tasks: Mutex<Option<mpsc::Receiver<TaskMessage>>>,
    events: mpsc::Sender<EmittedEvent>,
    replier: Arc<ChannelReplier>,
}

pub struct ChannelRuntimeHandle {
    pub tasks: mpsc::Sender<TaskMessage>,
    pub events: mpsc::Receiver<EmittedEvent>,
    pub results: mpsc::Receiver<SubmittedResult>,
}

struct ChannelReplier {
    results: mpsc::Sender<SubmittedResult>,
}

impl ChannelRuntime {
    pub fn new(capacity: usize) -> (ChannelRuntime, ChannelRuntimeHandle) {
        let (tasks_tx, tasks_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (results_tx, results_rx) = mpsc::channel(capacity);
        let runtime = ChannelRuntime {
            tasks: Mutex::new(Some(tasks_rx)),
            events: events_tx,
            replier: Arc::new(ChannelReplier {
                results: results_tx,
            }),
        };
        let handle = ChannelRuntimeHandle {
            tasks: tasks_tx,
            events: events_rx,
            results: results_rx,
        };
        (runtime, handle)
    }
}

#[async_trait]
impl EventPublisher for ChannelRuntime {
    async fn emit_event(&self, name: &str, data: Value) -> Result<(), RuntimeError> {
        self.events
            .send(EmittedEvent {
                event_key: name.to_owned(),
                event_data: data,
            })
            .await
            .map_err(|_| RuntimeError::Closed)
    }
}

#[async_trait]
impl TaskReplier for ChannelReplier {
    async fn submit(&self, result: SubmittedResult) -> Result<(), RuntimeError> {
        self.results.send(result).await.map_err(|_| RuntimeError::Closed)
    }
}

#[async_trait]
impl TaskRuntime for ChannelRuntime {
    async fn listen_tasks(
        &self,
        handler: Arc<dyn TaskHandler>,
        tasks: TaskTracker,
    ) -> Result<(), RuntimeError> {
        let mut incoming = self
            .tasks
            .lock()
            .await
            .take()
            .ok_or(RuntimeError::AlreadyListening)?;
        let replier: Arc<dyn TaskReplier> = self.replier.clone();
        while let Some(message) = incoming.recv().await {
            spawn_task(&tasks, &handler, Task::new(message, Arc::clone(&replier)));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StdoutLine<'a> {
    Event(&'a EmittedEvent),
    Result(&'a SubmittedResult),
}

/// Runtime speaking newline-delimited JSON: tasks come in on `R` (stdin by
/// default), events and results go out on `W` (stdout by default).
pub struct StdioRuntime<R = BufReader<Stdin>, W = Stdout> {
    input: Mutex<Option<R>>,
    out: Arc<LineSink<W>>,
}

struct LineSink<W> {
    writer: Mutex<W>,
}

impl<W> LineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_line(&self, line: StdoutLine<'_>) -> Result<(), RuntimeError> {
        let mut bytes = serde_json::to_vec(&line).map_err(|source| RuntimeError::Encode {
            what: "output line",
            source,
        })?;
        bytes.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl StdioRuntime {
    pub fn new() -> Self {
        StdioRuntime::with_io(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl Default for StdioRuntime {
    fn default() -> Self {
        StdioRuntime::new()
    }
}

impl<R, W> StdioRuntime<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn with_io(input: R, output: W) -> Self {
        StdioRuntime {
            input: Mutex::new(Some(input)),
            out: Arc::new(LineSink {
                writer: Mutex::new(output),
            }),
        }
    }
}

#[async_trait]
impl<R, W> EventPublisher for StdioRuntime<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn emit_event(&self, name: &str, data: Value) -> Result<(), RuntimeError> {
        let event = EmittedEvent {
            event_key: name.to_owned(),
            event_data: data,
        };
        self.out.write_line(StdoutLine::Event(&event)).await
    }
}

#[async_trait]
impl<W> TaskReplier for LineSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn submit(&self, result: SubmittedResult) -> Result<(), RuntimeError> {
        self.write_line(StdoutLine::Result(&result)).await
    }
}

#[async_trait]
impl<R, W> TaskRuntime for StdioRuntime<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn listen_tasks(
        &self,
        handler: Arc<dyn TaskHandler>,
        tasks: TaskTracker,
    ) -> Result<(), RuntimeError> {
        let input = self
            .input
            .lock()
            .await
            .take()
            .ok_or(RuntimeError::AlreadyListening)?;
        let replier: Arc<dyn TaskReplier> = self.out.clone();
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TaskMessage>(&line) {
                Ok(message) => spawn_task(&tasks, &handler, Task::new(message, Arc::clone(&replier))),
                Err(e) => warn!("ignoring malformed task line: {}", e),
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        self.out.writer.lock().await.flush().await?;
        Ok(())
    }
}
