//! Worker Bridge - compile off the caller's thread over a message protocol
//!
//! Requests: `{"type":"compile","id":..,"payload":..}`
//! Responses: `{"type":"result","id":..,"result":..}` or
//! `{"type":"error","id":..,"error":{"message":..}}`
//!
//! Messages cross the channel as JSON text. The worker handles requests one
//! at a time in arrival order; the caller matches responses by id. A request
//! that times out is forgotten and its late response is dropped.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pipeline::{compile_document, CompilationPipeline, CompileRequest, CompileResult};
use crate::sandbox::ExecutionScope;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Compile request {id} timed out after {}ms", .after.as_millis())]
    Timeout { id: String, after: Duration },

    #[error("Compiler worker is no longer running")]
    WorkerClosed,

    #[error("Compiler worker failed: {message}")]
    Worker { message: String },

    #[error("Malformed worker message: {0}")]
    MalformedMessage(String),

    #[error("Worker scope is already registered")]
    AlreadyRegistered,

    #[error("No async runtime available for the worker bridge")]
    NoRuntime,

    #[error("Could not start compiler worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerRequest {
    Compile { id: String, payload: CompileRequest },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerResponse {
    #[serde(rename = "result")]
    Completed { id: String, result: CompileResult },
    #[serde(rename = "error")]
    Failed { id: String, error: WorkerFailure },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerFailure {
    pub message: String,
}

/// Caller's end of a worker channel.
pub struct WorkerPort {
    to_worker: mpsc::UnboundedSender<String>,
    from_worker: mpsc::UnboundedReceiver<String>,
}

/// Worker's end of a worker channel plus the globals its code can see.
pub struct WorkerScope {
    globals: ExecutionScope,
    inbox: Option<mpsc::UnboundedReceiver<String>>,
    outbox: mpsc::UnboundedSender<String>,
}

impl WorkerScope {
    pub fn globals(&self) -> &ExecutionScope {
        &self.globals
    }

    /// Replace the scope's globals before registration.
    pub fn set_globals(&mut self, globals: ExecutionScope) {
        self.globals = globals;
    }
}

/// A connected pair of worker endpoints.
pub fn worker_channel() -> (WorkerPort, WorkerScope) {
    let (to_worker, inbox) = mpsc::unbounded_channel();
    let (outbox, from_worker) = mpsc::unbounded_channel();
    (
        WorkerPort { to_worker, from_worker },
        WorkerScope { globals: ExecutionScope::new(), inbox: Some(inbox), outbox },
    )
}

pub struct WorkerOptions<'s> {
    pub scope: &'s mut WorkerScope,
    /// Defaults to the built-in formatters and filters.
    pub pipeline: Option<CompilationPipeline>,
}

/// Handle to a registered worker thread.
pub struct WorkerRegistration {
    thread: thread::JoinHandle<()>,
}

impl WorkerRegistration {
    /// Wait for the worker to exit. It exits once every caller port is gone.
    pub fn join(self) -> bool {
        self.thread.join().is_ok()
    }
}

/// Disable the scope's network primitives and start serving compile
/// requests from its inbox on a dedicated thread. The worker's pipeline runs
/// against a clone of the guarded scope.
pub fn register_compiler_worker(options: WorkerOptions<'_>) -> Result<WorkerRegistration, BridgeError> {
    let WorkerOptions { scope, pipeline } = options;
    let inbox = scope.inbox.take().ok_or(BridgeError::AlreadyRegistered)?;
    scope.globals.install_network_guards();

    let outbox = scope.outbox.clone();
    let pipeline = pipeline.unwrap_or_default().with_scope(scope.globals.clone());
    let thread = thread::Builder::new()
        .name("forgedocs-compiler".to_string())
        .spawn(move || serve(inbox, outbox, pipeline))
        .map_err(BridgeError::Spawn)?;

    debug!("compiler worker registered");
    Ok(WorkerRegistration { thread })
}

fn serve(
    mut inbox: mpsc::UnboundedReceiver<String>,
    outbox: mpsc::UnboundedSender<String>,
    pipeline: CompilationPipeline,
) {
    while let Some(raw) = inbox.blocking_recv() {
        let Some(response) = handle_request(&pipeline, &raw) else { continue };
        match serde_json::to_string(&response) {
            Ok(encoded) => {
                if outbox.send(encoded).is_err() {
                    debug!("caller port closed, stopping compiler worker");
                    break;
                }
            }
            Err(e) => warn!(error = %e, "failed to encode worker response"),
        }
    }
    debug!("compiler worker stopped");
}

fn handle_request(pipeline: &CompilationPipeline, raw: &str) -> Option<WorkerResponse> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dropping unparseable request");
            return None;
        }
    };
    if value.get("type").and_then(Value::as_str) != Some("compile") {
        return None;
    }
    let id = message_id(&value);

    let (id, payload) = match serde_json::from_value::<WorkerRequest>(value) {
        Ok(WorkerRequest::Compile { id, payload }) => (id, payload),
        Err(e) => {
            let Some(id) = id else {
                warn!(error = %e, "dropping compile request without id");
                return None;
            };
            return Some(WorkerResponse::Failed {
                id,
                error: WorkerFailure { message: format!("Malformed compile request: {}", e) },
            });
        }
    };

    match panic::catch_unwind(AssertUnwindSafe(|| pipeline.compile(&payload))) {
        Ok(result) => Some(WorkerResponse::Completed { id, result }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "compiler panicked".to_string());
            warn!(request_id = %id, %message, "compile panicked inside worker");
            Some(WorkerResponse::Failed { id, error: WorkerFailure { message } })
        }
    }
}

fn message_id(value: &Value) -> Option<String> {
    value.get("id").and_then(Value::as_str).map(str::to_string)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeOptions {
    pub timeout: Option<Duration>,
}

impl BridgeOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout) }
    }
}

type Settlement = Result<CompileResult, BridgeError>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Settlement>>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Settlement>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a request's listener however its future ends.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(self.id);
    }
}

/// Caller-side bridge to a compiler worker.
pub struct CompilerWorker {
    to_worker: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    dispatcher: JoinHandle<()>,
}

impl CompilerWorker {
    /// Attach to a worker port. Must be called inside a tokio runtime.
    pub fn new(port: WorkerPort) -> Result<Self, BridgeError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher = runtime.spawn(dispatch(port.from_worker, pending.clone()));
        Ok(Self { to_worker: port.to_worker, pending, dispatcher })
    }

    /// Start a sandboxed worker thread and attach to it.
    pub fn spawn(pipeline: Option<CompilationPipeline>) -> Result<(Self, WorkerRegistration), BridgeError> {
        let (port, mut scope) = worker_channel();
        let registration = register_compiler_worker(WorkerOptions { scope: &mut scope, pipeline })?;
        let worker = Self::new(port)?;
        Ok((worker, registration))
    }

    /// Requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    pub async fn compile(&self, payload: &CompileRequest, options: &BridgeOptions) -> Result<CompileResult, BridgeError> {
        let id = Uuid::new_v4().to_string();
        let message = serde_json::to_string(&json!({
            "type": "compile",
            "id": id,
            "payload": payload,
        }))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        let _guard = PendingGuard { pending: &self.pending, id: &id };

        if self.to_worker.send(message).is_err() {
            return Err(BridgeError::WorkerClosed);
        }

        let settled = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(settled) => settled,
                Err(_) => {
                    debug!(request_id = %id, "compile request timed out");
                    return Err(BridgeError::Timeout { id: id.clone(), after: limit });
                }
            },
            None => rx.await,
        };

        settled.unwrap_or(Err(BridgeError::WorkerClosed))
    }
}

impl Drop for CompilerWorker {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(mut from_worker: mpsc::UnboundedReceiver<String>, pending: PendingMap) {
    while let Some(raw) = from_worker.recv().await {
        route_response(&raw, &pending);
    }
    // Dropping the senders settles every in-flight request as WorkerClosed.
    lock(&pending).clear();
}

fn route_response(raw: &str, pending: &PendingMap) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dropping unparseable worker message");
            return;
        }
    };
    if !matches!(value.get("type").and_then(Value::as_str), Some("result") | Some("error")) {
        return;
    }
    let Some(id) = message_id(&value) else {
        warn!("dropping worker response without id");
        return;
    };
    let Some(sender) = lock(pending).remove(&id) else {
        debug!(request_id = %id, "no pending request for response, dropped");
        return;
    };

    let settlement = match serde_json::from_value::<WorkerResponse>(value) {
        Ok(WorkerResponse::Completed { result, .. }) => Ok(result),
        Ok(WorkerResponse::Failed { error, .. }) => Err(BridgeError::Worker { message: error.message }),
        Err(e) => Err(BridgeError::MalformedMessage(e.to_string())),
    };
    let _ = sender.send(settlement);
}

/// Compile through `worker` when one is available, otherwise in-process.
/// Both paths produce the same result for the same payload.
pub async fn compile_with_worker(
    worker: Option<&CompilerWorker>,
    payload: &CompileRequest,
    options: &BridgeOptions,
) -> Result<CompileResult, BridgeError> {
    match worker {
        Some(worker) => worker.compile(payload, options).await,
        None => Ok(compile_document(payload)),
    }
}

/// A worker when one can be started, in-process compilation otherwise.
pub enum CompilerBridge {
    Worker {
        worker: CompilerWorker,
        registration: WorkerRegistration,
    },
    InProcess,
}

impl CompilerBridge {
    pub fn connect() -> Self {
        match CompilerWorker::spawn(None) {
            Ok((worker, registration)) => CompilerBridge::Worker { worker, registration },
            Err(e) => {
                warn!(error = %e, "compiler worker unavailable, compiling in-process");
                CompilerBridge::InProcess
            }
        }
    }

    pub fn is_isolated(&self) -> bool {
        matches!(self, CompilerBridge::Worker { .. })
    }

    pub async fn compile(&self, payload: &CompileRequest, options: &BridgeOptions) -> Result<CompileResult, BridgeError> {
        match self {
            CompilerBridge::Worker { worker, .. } => compile_with_worker(Some(worker), payload, options).await,
            CompilerBridge::InProcess => compile_with_worker(None, payload, options).await,
        }
    }

    /// Stop the worker thread, if any, and wait for it.
    pub fn shutdown(self) {
        if let CompilerBridge::Worker { worker, registration } = self {
            drop(worker);
            registration.join();
        }
    }
}
