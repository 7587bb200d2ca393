//! Collaborator interfaces
//!
//! The control plane decides *when* plugins run. How they are launched, how
//! RPC reaches them, which plugins are loaded and which plugin serves which
//! metric all come from implementations of these traits.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{LoadedPlugin, MetricType, PluginType};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failures launching or talking to a plugin process
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn plugin: {0}")]
    Spawn(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failures of RPCs issued through a plugin client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("plugin unreachable: {0}")]
    Unreachable(String),

    #[error("rpc failed: {0}")]
    Rpc(String),
}

/// Metric lookup failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("metric not found: {} (version {version})", .namespace.join("/"))]
    NotFound { namespace: Vec<String>, version: i32 },
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake Response
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome a plugin reports in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Success,
    Failure,
}

/// What the plugin says about itself in the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMeta {
    pub name: String,
    pub version: i32,
    pub plugin_type: PluginType,
}

/// Handshake sent by a plugin process once it has started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub state: ResponseState,
    pub error_message: String,
    pub meta: PluginMeta,
    /// Where the plugin accepts RPCs; opaque to the control plane
    pub listen_address: String,
}

impl Response {
    pub fn success(meta: PluginMeta, listen_address: impl Into<String>) -> Self {
        Self {
            state: ResponseState::Success,
            error_message: String::new(),
            meta,
            listen_address: listen_address.into(),
        }
    }

    pub fn failure(meta: PluginMeta, message: impl Into<String>) -> Self {
        Self {
            state: ResponseState::Failure,
            error_message: message.into(),
            meta,
            listen_address: String::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process Transport
// ─────────────────────────────────────────────────────────────────────────────

/// A plugin process that has been prepared but not necessarily started
#[async_trait]
pub trait ExecutablePlugin: Send {
    async fn start(&mut self) -> Result<(), TransportError>;

    async fn kill(&mut self) -> Result<(), TransportError>;

    /// Wait for the plugin's handshake. `Ok(None)` means the plugin produced
    /// no response at all.
    async fn wait_for_response(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Response>, TransportError>;
}

/// Builds executables and connects clients to started plugins
#[async_trait]
pub trait PluginTransport: Send + Sync {
    fn executable(
        &self,
        args: Vec<String>,
        path: &Path,
    ) -> Result<Box<dyn ExecutablePlugin>, TransportError>;

    async fn connect(&self, response: &Response) -> Result<Arc<dyn PluginClient>, TransportError>;
}

/// RPC handle to one running plugin
///
/// Not meant for overlapping calls from several callers.
#[async_trait]
pub trait PluginClient: Send + Sync {
    async fn ping(&self) -> Result<(), ClientError>;

    /// Ask the plugin to shut down
    async fn kill(&self, reason: &str) -> Result<(), ClientError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Manager & Metric Catalog
// ─────────────────────────────────────────────────────────────────────────────

/// Knows which plugins are loaded and how to launch them
pub trait ManagesPlugins: Send + Sync {
    fn loaded_plugins(&self) -> Vec<LoadedPlugin>;

    /// Command line arguments for launching the plugin at `path`
    fn generate_args(&self, path: &Path) -> Vec<String>;
}

/// Resolves a metric namespace and version to the plugin serving it
pub trait CatalogsMetrics: Send + Sync {
    fn get(&self, namespace: &[String], version: i32) -> Result<MetricType, CatalogError>;
}
