//! Mock collaborators shared by the unit tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_events::{DelegateError, Emitter, Event, EventDelegate, EventHandler};

use crate::external::{
    CatalogError, CatalogsMetrics, ClientError, ExecutablePlugin, ManagesPlugins, PluginClient,
    PluginMeta, PluginTransport, Response, TransportError,
};
use crate::{LoadedPlugin, MetricType, PluginType};

/// Route `tracing` output through the test harness; honours `RUST_LOG`
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockClient {
    pings: AtomicUsize,
    completed: AtomicUsize,
    failing_pings: AtomicU32,
    ping_delay: Mutex<Duration>,
    kill_fails: AtomicBool,
    kills: Mutex<Vec<String>>,
}

impl MockClient {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` pings
    pub fn fail_pings(&self, n: u32) {
        self.failing_pings.store(n, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock() = delay;
    }

    pub fn fail_kill(&self) {
        self.kill_fails.store(true, Ordering::SeqCst);
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn completed_pings(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn kill_reasons(&self) -> Vec<String> {
        self.kills.lock().clone()
    }
}

#[async_trait]
impl PluginClient for MockClient {
    async fn ping(&self) -> Result<(), ClientError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let delay = *self.ping_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);

        let fail = self
            .failing_pings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ClientError::Unreachable("connection refused".into()));
        }
        Ok(())
    }

    async fn kill(&self, reason: &str) -> Result<(), ClientError> {
        if self.kill_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Rpc("kill rejected".into()));
        }
        self.kills.lock().push(reason.to_string());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// How a mock executable answers its handshake
#[derive(Debug, Clone)]
pub enum Handshake {
    Success,
    Rejected(String),
    NoResponse,
    Hang,
    Error(String),
}

#[derive(Default)]
struct TransportShared {
    kills: AtomicUsize,
    starts: AtomicUsize,
}

pub struct MockTransport {
    shared: Arc<TransportShared>,
    start_fails: AtomicBool,
    connect_fails: AtomicBool,
    ping_fails: AtomicBool,
    handshake: Mutex<Handshake>,
    handshake_delay: Mutex<Duration>,
    launches: Mutex<Vec<(Vec<String>, PathBuf)>>,
    clients: Mutex<Vec<Arc<MockClient>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::default(),
            start_fails: AtomicBool::new(false),
            connect_fails: AtomicBool::new(false),
            ping_fails: AtomicBool::new(false),
            handshake: Mutex::new(Handshake::Success),
            handshake_delay: Mutex::new(Duration::ZERO),
            launches: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
        })
    }

    pub fn set_handshake(&self, handshake: Handshake) {
        *self.handshake.lock() = handshake;
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.handshake_delay.lock() = delay;
    }

    pub fn fail_start(&self) {
        self.start_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_connect(&self) {
        self.connect_fails.store(true, Ordering::SeqCst);
    }

    /// Clients handed out from now on fail their first ping
    pub fn fail_ping(&self) {
        self.ping_fails.store(true, Ordering::SeqCst);
    }

    pub fn launches(&self) -> Vec<(Vec<String>, PathBuf)> {
        self.launches.lock().clone()
    }

    pub fn starts(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.shared.kills.load(Ordering::SeqCst)
    }

    pub fn clients(&self) -> Vec<Arc<MockClient>> {
        self.clients.lock().clone()
    }
}

#[async_trait]
impl PluginTransport for MockTransport {
    fn executable(
        &self,
        args: Vec<String>,
        path: &Path,
    ) -> Result<Box<dyn ExecutablePlugin>, TransportError> {
        self.launches.lock().push((args, path.to_path_buf()));
        Ok(Box::new(MockExecutable {
            shared: Arc::clone(&self.shared),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            start_fails: self.start_fails.load(Ordering::SeqCst),
            handshake: self.handshake.lock().clone(),
            handshake_delay: *self.handshake_delay.lock(),
        }))
    }

    async fn connect(&self, response: &Response) -> Result<Arc<dyn PluginClient>, TransportError> {
        if self.connect_fails.load(Ordering::SeqCst) {
            return Err(TransportError::Protocol(format!(
                "cannot dial {}",
                response.listen_address
            )));
        }
        let client = MockClient::healthy();
        if self.ping_fails.load(Ordering::SeqCst) {
            client.fail_pings(1);
        }
        self.clients.lock().push(client.clone());
        Ok(client)
    }
}

pub struct MockExecutable {
    shared: Arc<TransportShared>,
    name: String,
    start_fails: bool,
    handshake: Handshake,
    handshake_delay: Duration,
}

#[async_trait]
impl ExecutablePlugin for MockExecutable {
    async fn start(&mut self) -> Result<(), TransportError> {
        if self.start_fails {
            return Err(TransportError::Spawn("exec format error".into()));
        }
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), TransportError> {
        self.shared.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_response(
        &mut self,
        _timeout: Duration,
    ) -> Result<Option<Response>, TransportError> {
        if !self.handshake_delay.is_zero() {
            tokio::time::sleep(self.handshake_delay).await;
        }
        let meta = PluginMeta {
            name: self.name.clone(),
            version: 1,
            plugin_type: PluginType::Collector,
        };
        match &self.handshake {
            Handshake::Success => Ok(Some(Response::success(meta, "127.0.0.1:8182"))),
            Handshake::Rejected(msg) => Ok(Some(Response::failure(meta, msg.clone()))),
            Handshake::NoResponse => Ok(None),
            Handshake::Hang => std::future::pending().await,
            Handshake::Error(msg) => Err(TransportError::Protocol(msg.clone())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Manager & Catalog
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockManager {
    loaded: Mutex<Vec<LoadedPlugin>>,
}

impl MockManager {
    pub fn with(plugins: impl IntoIterator<Item = LoadedPlugin>) -> Arc<Self> {
        Arc::new(Self {
            loaded: Mutex::new(plugins.into_iter().collect()),
        })
    }
}

impl ManagesPlugins for MockManager {
    fn loaded_plugins(&self) -> Vec<LoadedPlugin> {
        self.loaded.lock().clone()
    }

    fn generate_args(&self, path: &Path) -> Vec<String> {
        vec![format!("--log-path={}.log", path.display())]
    }
}

#[derive(Default)]
pub struct MockCatalog {
    metrics: Mutex<HashMap<(Vec<String>, i32), MetricType>>,
}

impl MockCatalog {
    pub fn with(metrics: impl IntoIterator<Item = MetricType>) -> Arc<Self> {
        let catalog = Self::default();
        {
            let mut map = catalog.metrics.lock();
            for mt in metrics {
                map.insert((mt.namespace.clone(), mt.version), mt);
            }
        }
        Arc::new(catalog)
    }
}

impl CatalogsMetrics for MockCatalog {
    fn get(&self, namespace: &[String], version: i32) -> Result<MetricType, CatalogError> {
        self.metrics
            .lock()
            .get(&(namespace.to_vec(), version))
            .cloned()
            .ok_or_else(|| CatalogError::NotFound {
                namespace: namespace.to_vec(),
                version,
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<Event>>,
}

impl RecordingEmitter {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn namespaces(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(Event::namespace).collect()
    }
}

impl Emitter for RecordingEmitter {
    fn emit(&self, event: Event) -> usize {
        self.events.lock().push(event);
        1
    }
}

/// Delegate whose registration always fails
#[derive(Default)]
pub struct RefusingDelegate;

impl EventDelegate for RefusingDelegate {
    fn register_handler(
        &self,
        name: &str,
        _handler: Arc<dyn EventHandler>,
    ) -> Result<(), DelegateError> {
        Err(DelegateError::AlreadyRegistered(name.to_string()))
    }

    fn unregister_handler(&self, name: &str) -> Result<(), DelegateError> {
        Err(DelegateError::NotRegistered(name.to_string()))
    }
}
