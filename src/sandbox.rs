//! Sandbox - network-incapable execution scope for the compiler worker
//!
//! The compiler runs snippet content authored by third parties. The scope a
//! worker registers into has every outbound network primitive replaced by a
//! guard that fails immediately.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NetworkPrimitive {
    Fetch,
    XmlHttpRequest,
    WebSocket,
    SendBeacon,
}

impl NetworkPrimitive {
    pub const ALL: [NetworkPrimitive; 4] = [
        NetworkPrimitive::Fetch,
        NetworkPrimitive::XmlHttpRequest,
        NetworkPrimitive::WebSocket,
        NetworkPrimitive::SendBeacon,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            NetworkPrimitive::Fetch => "fetch",
            NetworkPrimitive::XmlHttpRequest => "XMLHttpRequest",
            NetworkPrimitive::WebSocket => "WebSocket",
            NetworkPrimitive::SendBeacon => "navigator.sendBeacon",
        }
    }
}

impl fmt::Display for NetworkPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("Network access is disabled in the compiler sandbox ({0})")]
    NetworkDisabled(NetworkPrimitive),

    #[error("No network implementation available for {0}")]
    NetworkUnavailable(NetworkPrimitive),
}

/// Outbound network surface of an execution scope.
pub trait NetworkApi: Send + Sync {
    fn call(&self, primitive: NetworkPrimitive, target: &str) -> Result<(), SandboxError>;
}

/// Scope default: nothing installed.
pub struct NoNetwork;

impl NetworkApi for NoNetwork {
    fn call(&self, primitive: NetworkPrimitive, _target: &str) -> Result<(), SandboxError> {
        Err(SandboxError::NetworkUnavailable(primitive))
    }
}

/// Guard installed on registration; every call fails.
pub struct DisabledNetwork;

impl NetworkApi for DisabledNetwork {
    fn call(&self, primitive: NetworkPrimitive, _target: &str) -> Result<(), SandboxError> {
        Err(SandboxError::NetworkDisabled(primitive))
    }
}

/// Globals visible to code running in a worker.
#[derive(Clone)]
pub struct ExecutionScope {
    network: Arc<dyn NetworkApi>,
    sandboxed: bool,
}

impl ExecutionScope {
    pub fn new() -> Self {
        Self { network: Arc::new(NoNetwork), sandboxed: false }
    }

    /// Scope backed by a host network implementation.
    pub fn with_network(network: Arc<dyn NetworkApi>) -> Self {
        Self { network, sandboxed: false }
    }

    /// Replace every network primitive with [`DisabledNetwork`]. Idempotent.
    pub fn install_network_guards(&mut self) {
        self.network = Arc::new(DisabledNetwork);
        self.sandboxed = true;
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    pub fn fetch(&self, url: &str) -> Result<(), SandboxError> {
        self.network.call(NetworkPrimitive::Fetch, url)
    }

    pub fn xml_http_request(&self) -> Result<(), SandboxError> {
        self.network.call(NetworkPrimitive::XmlHttpRequest, "")
    }

    pub fn web_socket(&self, url: &str) -> Result<(), SandboxError> {
        self.network.call(NetworkPrimitive::WebSocket, url)
    }

    pub fn send_beacon(&self, url: &str) -> Result<(), SandboxError> {
        self.network.call(NetworkPrimitive::SendBeacon, url)
    }
}

impl Default for ExecutionScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionScope").field("sandboxed", &self.sandboxed).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNetwork {
        calls: AtomicUsize,
    }

    impl NetworkApi for CountingNetwork {
        fn call(&self, _primitive: NetworkPrimitive, _target: &str) -> Result<(), SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_guards_replace_host_network() {
        let host = Arc::new(CountingNetwork::default());
        let mut scope = ExecutionScope::with_network(host.clone());
        assert!(scope.fetch("https://example.com").is_ok());

        scope.install_network_guards();
        assert!(scope.is_sandboxed());
        assert_eq!(
            scope.fetch("https://example.com"),
            Err(SandboxError::NetworkDisabled(NetworkPrimitive::Fetch))
        );
        assert!(scope.xml_http_request().is_err());
        assert!(scope.web_socket("wss://example.com").is_err());
        assert!(scope.send_beacon("https://example.com/b").is_err());
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_names_the_primitive() {
        let err = SandboxError::NetworkDisabled(NetworkPrimitive::SendBeacon);
        assert!(err.to_string().contains("navigator.sendBeacon"));
    }
}
