//! Worker bridge tests: parity, timeouts, failures and the network sandbox.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use forgedocs_core::{
    compile_document, compile_with_worker, register_compiler_worker, worker_channel,
    document::{Block, BlockMetadata, Document},
    formatters::Formatter,
    sandbox::{ExecutionScope, NetworkApi, NetworkPrimitive},
    BridgeError, BridgeOptions, CompilationPipeline, CompileRequest, CompilerBridge, CompilerWorker, SandboxError,
    SnippetBundle, VariableValue, WorkerOptions,
};

struct SlowFormatter;

impl Formatter for SlowFormatter {
    fn id(&self) -> &str { "slow" }

    fn format(&self, text: &str, _metadata: &BlockMetadata) -> String {
        thread::sleep(Duration::from_millis(300));
        text.to_string()
    }
}

struct PanickingFormatter;

impl Formatter for PanickingFormatter {
    fn id(&self) -> &str { "explode" }

    fn format(&self, _text: &str, _metadata: &BlockMetadata) -> String {
        panic!("formatter exploded");
    }
}

/// Reports whether a beacon left the scope it runs in.
struct BeaconFormatter;

impl Formatter for BeaconFormatter {
    fn id(&self) -> &str { "beacon" }

    fn format(&self, text: &str, _metadata: &BlockMetadata) -> String {
        text.to_string()
    }

    fn format_in(&self, text: &str, _metadata: &BlockMetadata, scope: &ExecutionScope) -> String {
        match scope.send_beacon("https://collector.example/b") {
            Ok(()) => format!("{} [sent]", text),
            Err(e) => format!("{} [{}]", text, e),
        }
    }
}

#[derive(Default)]
struct HostNetwork {
    calls: AtomicUsize,
}

impl NetworkApi for HostNetwork {
    fn call(&self, _primitive: NetworkPrimitive, _target: &str) -> Result<(), SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn sample_request() -> CompileRequest {
    let mut document = Document::new("doc-w", "Worker", "draft");
    document.blocks = vec![
        Block::markdown("b1", 1, "Intro {{greeting}}\n{{> alpha}}"),
        Block::snippet("b2", 2, "missing-snippet"),
        Block::markdown("b3", 3, "fn main() {}").with_metadata(BlockMetadata::formatter("code").with_language("rust")),
    ];
    CompileRequest {
        snippets: vec![SnippetBundle::single("alpha", "Alpha body content {{greeting}}")],
        variables: [("greeting".to_string(), VariableValue::from("Hello"))].into_iter().collect(),
        allowed_statuses: Some(vec!["ready".to_string()]),
        ..CompileRequest::new(document)
    }
}

fn formatted_request(formatter: &str) -> CompileRequest {
    let mut document = Document::new("doc-f", "Formatted", "draft");
    document.blocks = vec![Block::markdown("b1", 1, "body").with_metadata(BlockMetadata::formatter(formatter))];
    CompileRequest::new(document)
}

#[tokio::test]
async fn test_worker_matches_in_process_compile() {
    let (worker, _registration) = CompilerWorker::spawn(None).unwrap();
    let request = sample_request();

    let remote = compile_with_worker(Some(&worker), &request, &BridgeOptions::default()).await.unwrap();
    let local = compile_document(&request);

    assert_eq!(remote, local);
    assert_eq!(worker.pending_requests(), 0);
}

#[tokio::test]
async fn test_fallback_without_worker() {
    let request = sample_request();
    let result = compile_with_worker(None, &request, &BridgeOptions::default()).await.unwrap();
    assert_eq!(result, compile_document(&request));
}

#[tokio::test]
async fn test_concurrent_requests_are_matched_by_id() {
    let (worker, _registration) = CompilerWorker::spawn(None).unwrap();
    let options = BridgeOptions::default();

    let mut a = sample_request();
    a.document.id = "doc-a".to_string();
    let mut b = sample_request();
    b.variables.insert("greeting".to_string(), VariableValue::from("Howdy"));

    let (ra, rb) = tokio::join!(worker.compile(&a, &options), worker.compile(&b, &options));

    assert_eq!(ra.unwrap(), compile_document(&a));
    assert!(rb.unwrap().markdown.starts_with("Intro Howdy"));
    assert_eq!(worker.pending_requests(), 0);
}

#[tokio::test]
async fn test_timeout_removes_listener() {
    let pipeline = CompilationPipeline::new().with_formatter(Box::new(SlowFormatter));
    let (worker, _registration) = CompilerWorker::spawn(Some(pipeline)).unwrap();

    let err = worker
        .compile(&formatted_request("slow"), &BridgeOptions::with_timeout(Duration::from_millis(20)))
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::Timeout { .. }));
    assert_eq!(worker.pending_requests(), 0);

    // The late response is dropped; the next request still gets its own answer.
    let request = sample_request();
    let result = worker.compile(&request, &BridgeOptions::default()).await.unwrap();
    assert_eq!(result, compile_document(&request));
    assert_eq!(worker.pending_requests(), 0);
}

#[tokio::test]
async fn test_worker_failure_is_reported() {
    let pipeline = CompilationPipeline::new().with_formatter(Box::new(PanickingFormatter));
    let (worker, _registration) = CompilerWorker::spawn(Some(pipeline)).unwrap();

    let err = worker.compile(&formatted_request("explode"), &BridgeOptions::default()).await.unwrap_err();
    match err {
        BridgeError::Worker { message } => assert!(message.contains("formatter exploded")),
        other => panic!("expected worker error, got {:?}", other),
    }
    assert_eq!(worker.pending_requests(), 0);

    // The worker survives a failed request.
    assert!(worker.compile(&sample_request(), &BridgeOptions::default()).await.is_ok());
}

#[tokio::test]
async fn test_unregistered_worker_is_closed() {
    let (port, scope) = worker_channel();
    let worker = CompilerWorker::new(port).unwrap();
    drop(scope);

    let err = worker.compile(&sample_request(), &BridgeOptions::default()).await.unwrap_err();
    assert!(matches!(err, BridgeError::WorkerClosed));
    assert_eq!(worker.pending_requests(), 0);
}

#[test]
fn test_registration_disables_network() {
    let (_port, mut scope) = worker_channel();
    assert_eq!(
        scope.globals().fetch("https://example.com"),
        Err(SandboxError::NetworkUnavailable(NetworkPrimitive::Fetch))
    );

    let _registration = register_compiler_worker(WorkerOptions { scope: &mut scope, pipeline: None }).unwrap();
    let globals = scope.globals();

    assert!(globals.is_sandboxed());
    assert_eq!(
        globals.fetch("https://example.com"),
        Err(SandboxError::NetworkDisabled(NetworkPrimitive::Fetch))
    );
    assert_eq!(
        globals.xml_http_request(),
        Err(SandboxError::NetworkDisabled(NetworkPrimitive::XmlHttpRequest))
    );
    assert_eq!(
        globals.web_socket("wss://example.com/socket"),
        Err(SandboxError::NetworkDisabled(NetworkPrimitive::WebSocket))
    );
    assert_eq!(
        globals.send_beacon("https://example.com/beacon"),
        Err(SandboxError::NetworkDisabled(NetworkPrimitive::SendBeacon))
    );
}

#[tokio::test]
async fn test_worker_formatters_see_guarded_scope() {
    let host = Arc::new(HostNetwork::default());
    let pipeline = || {
        CompilationPipeline::new()
            .with_formatter(Box::new(BeaconFormatter))
            .with_scope(ExecutionScope::with_network(host.clone()))
    };
    let request = formatted_request("beacon");

    let local = pipeline().compile(&request);
    assert_eq!(local.markdown, "body [sent]\n");
    assert_eq!(host.calls.load(Ordering::SeqCst), 1);

    let (worker, _registration) = CompilerWorker::spawn(Some(pipeline())).unwrap();
    let remote = worker.compile(&request, &BridgeOptions::default()).await.unwrap();

    assert!(remote.markdown.contains("Network access is disabled"));
    assert!(remote.markdown.contains("navigator.sendBeacon"));
    assert_eq!(host.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bridge_connects_and_shuts_down() {
    let bridge = CompilerBridge::connect();
    assert!(bridge.is_isolated());

    let request = sample_request();
    let result = bridge.compile(&request, &BridgeOptions::default()).await.unwrap();
    assert_eq!(result, compile_document(&request));

    bridge.shutdown();
}
