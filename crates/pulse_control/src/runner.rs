//! Runner
//!
//! Handles demand events and controls the running state of plugins
//! accordingly. Admission decisions are serialized on one async mutex so two
//! events for the same plugin key can never both see spare capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use pulse_events::{ControlEvent, DemandEvent, Emitter, Event, EventBody, EventDelegate, EventHandler};

use crate::external::{
    CatalogsMetrics, ExecutablePlugin, ManagesPlugins, PluginTransport, ResponseState,
    TransportError,
};
use crate::{
    AvailablePlugin, ConfigError, ControlConfig, ControlError, ControlResult, IdAllocator,
    LoadedPlugin, Monitor, PluginKey, PluginPool, PluginRegistry, PluginType,
};

/// Name the runner registers its handler under with every delegate
pub const HANDLER_REGISTRATION_NAME: &str = "control.runner";

/// Reason passed to plugins stopped by `Runner::stop`
const RUNNER_STOP_REASON: &str = "runner stopping";

// ─────────────────────────────────────────────────────────────────────────────
// Admission
// ─────────────────────────────────────────────────────────────────────────────

/// Whether another instance of `key` may start
///
/// Admits when no pool exists yet or the pool holds fewer than `max`
/// instances.
pub fn check_pool(pool: Option<&PluginPool>, key: &PluginKey, max: usize) -> bool {
    let count = pool.map_or(0, PluginPool::count);
    if count >= max {
        tracing::debug!(%key, count, max, "Pool is full, not starting another instance");
        return false;
    }
    tracing::debug!(%key, count, max, "Pool has room, starting another instance");
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

/// Turns subscription demand into running plugin instances
///
/// Collaborators are wired in with the `set_*` methods before `start`. The
/// runner must be held in an `Arc` to be registered with delegates.
pub struct Runner {
    config: ControlConfig,
    delegates: RwLock<Vec<Arc<dyn EventDelegate>>>,
    emitter: RwLock<Option<Arc<dyn Emitter>>>,
    metric_catalog: RwLock<Option<Arc<dyn CatalogsMetrics>>>,
    plugin_manager: RwLock<Option<Arc<dyn ManagesPlugins>>>,
    transport: RwLock<Option<Arc<dyn PluginTransport>>>,
    monitor: Monitor,
    available_plugins: Arc<PluginRegistry>,
    ids: IdAllocator,
    /// Set by `stop` under `mutex`; demand arriving afterwards is dropped
    stopping: AtomicBool,
    mutex: tokio::sync::Mutex<()>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self::build(ControlConfig::default())
    }

    /// Runner with non-default tunables; rejects configs `validate` refuses
    pub fn with_config(config: ControlConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: ControlConfig) -> Self {
        Self {
            monitor: Monitor::with_config(&config),
            config,
            delegates: RwLock::new(Vec::new()),
            emitter: RwLock::new(None),
            metric_catalog: RwLock::new(None),
            plugin_manager: RwLock::new(None),
            transport: RwLock::new(None),
            available_plugins: PluginRegistry::new_shared(),
            ids: IdAllocator::new(),
            stopping: AtomicBool::new(false),
            mutex: tokio::sync::Mutex::new(()),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn available_plugins(&self) -> &Arc<PluginRegistry> {
        &self.available_plugins
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn set_emitter(&self, emitter: Arc<dyn Emitter>) {
        *self.emitter.write() = Some(emitter);
    }

    pub fn set_metric_catalog(&self, catalog: Arc<dyn CatalogsMetrics>) {
        *self.metric_catalog.write() = Some(catalog);
    }

    pub fn set_plugin_manager(&self, manager: Arc<dyn ManagesPlugins>) {
        *self.plugin_manager.write() = Some(manager);
    }

    pub fn set_transport(&self, transport: Arc<dyn PluginTransport>) {
        *self.transport.write() = Some(transport);
    }

    /// Delegates the runner registers with on `start` and leaves on `stop`
    pub fn add_delegates(&self, delegates: impl IntoIterator<Item = Arc<dyn EventDelegate>>) {
        self.delegates.write().extend(delegates);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Register with every delegate and start the health monitor
    ///
    /// If any registration fails, registrations already made are undone and
    /// the error is returned.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> ControlResult<()> {
        let delegates = self.delegates.read().clone();
        if delegates.is_empty() {
            return Err(ControlError::NoDelegates);
        }

        self.stopping.store(false, Ordering::SeqCst);
        let handler: Arc<dyn EventHandler> = self.clone();
        for (i, delegate) in delegates.iter().enumerate() {
            if let Err(e) = delegate.register_handler(HANDLER_REGISTRATION_NAME, handler.clone()) {
                tracing::error!(error = %e, "Handler registration failed, rolling back");
                for registered in &delegates[..i] {
                    if let Err(e) = registered.unregister_handler(HANDLER_REGISTRATION_NAME) {
                        tracing::warn!(error = %e, "Rollback of handler registration failed");
                    }
                }
                return Err(e.into());
            }
        }

        self.monitor.set_emitter(self.emitter.read().clone());
        self.monitor.start(Arc::clone(&self.available_plugins));

        tracing::debug!(delegates = delegates.len(), "Runner started");
        Ok(())
    }

    /// Stop handling events and stop every running plugin
    ///
    /// Delegates are left before any plugin is stopped, and demand already in
    /// flight is dropped once the plugins are being torn down. Every failure
    /// is collected; an empty list means a clean stop.
    pub async fn stop(&self) -> Vec<ControlError> {
        let mut errs = Vec::new();

        self.monitor.shutdown().await;

        let delegates = self.delegates.read().clone();
        for delegate in delegates {
            if let Err(e) = delegate.unregister_handler(HANDLER_REGISTRATION_NAME) {
                errs.push(e.into());
            }
        }

        {
            let _guard = self.mutex.lock().await;
            self.stopping.store(true, Ordering::SeqCst);
            let plugins = self.available_plugins.table();
            let results = join_all(
                plugins
                    .iter()
                    .map(|plugin| self.stop_plugin(RUNNER_STOP_REASON, plugin)),
            )
            .await;
            for (plugin, result) in plugins.iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!(plugin = %plugin, error = %e, "Failed to stop plugin");
                    errs.push(e);
                }
            }
        }

        tracing::debug!(errors = errs.len(), "Runner stopped");
        errs
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Demand handling
    // ─────────────────────────────────────────────────────────────────────────

    /// Act on one demand event
    ///
    /// Failures are logged and the event dropped; the registry is left as it
    /// was before the failing step. Capacity is checked against the pool the
    /// new instance would join.
    pub async fn handle_demand(&self, demand: DemandEvent) {
        let _guard = self.mutex.lock().await;
        if self.stopping.load(Ordering::SeqCst) {
            tracing::debug!(event = demand.namespace(), "Runner stopped, ignoring demand event");
            return;
        }

        let result = match &demand {
            DemandEvent::PublisherSubscription {
                plugin_name,
                plugin_version,
            } => {
                self.handle_publisher_subscription(plugin_name, *plugin_version)
                    .await
            }
            DemandEvent::MetricSubscription {
                metric_namespace,
                version,
            } => {
                self.handle_metric_subscription(metric_namespace, *version)
                    .await
            }
        };

        if let Err(e) = result {
            tracing::error!(event = demand.namespace(), error = %e, "Demand event dropped");
        }
    }

    async fn handle_publisher_subscription(&self, name: &str, version: i32) -> ControlResult<()> {
        tracing::debug!(name, version, "Handling publisher subscription event");
        let manager = self.plugin_manager()?;

        for lp in manager.loaded_plugins() {
            if lp.plugin_type != PluginType::Publisher || lp.name != name || lp.version != version {
                continue;
            }

            let key = lp.key();
            let admitted = {
                let tables = self.available_plugins.lock();
                check_pool(
                    tables.get_plugin_pool(&key),
                    &key,
                    self.config.max_running_plugins,
                )
            };
            if !admitted {
                return Ok(());
            }

            self.spawn_plugin(manager.as_ref(), &lp).await?;
        }
        Ok(())
    }

    async fn handle_metric_subscription(&self, namespace: &[String], version: i32) -> ControlResult<()> {
        let metric = namespace.join("/");
        tracing::debug!(%metric, version, "Handling metric subscription event");

        let catalog = self.metric_catalog()?;
        let mt = match catalog.get(namespace, version) {
            Ok(mt) => mt,
            Err(e) => {
                tracing::warn!(%metric, version, error = %e, "Metric not in catalog, ignoring subscription");
                return Ok(());
            }
        };

        let key = mt.plugin.key();
        tracing::debug!(%key, %metric, version, "Metric resolved to plugin");

        let admitted = {
            let tables = self.available_plugins.lock();
            check_pool(
                tables.get_plugin_pool(&key),
                &key,
                self.config.max_running_plugins,
            )
        };
        if !admitted {
            return Ok(());
        }

        let manager = self.plugin_manager()?;
        self.spawn_plugin(manager.as_ref(), &mt.plugin).await?;
        Ok(())
    }

    async fn spawn_plugin(
        &self,
        manager: &dyn ManagesPlugins,
        lp: &LoadedPlugin,
    ) -> ControlResult<Arc<AvailablePlugin>> {
        let transport = self.transport()?;
        let args = manager.generate_args(&lp.path);
        let executable = transport
            .executable(args, &lp.path)
            .map_err(ControlError::StartFailed)?;
        self.start_plugin(executable, lp.key()).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Plugin start / stop
    // ─────────────────────────────────────────────────────────────────────────

    /// Start `executable`, wait for its handshake, ping it and register it
    /// under `key`
    ///
    /// Nothing is registered unless every step succeeds. A process that
    /// started but failed a later step is killed.
    pub async fn start_plugin(
        &self,
        mut executable: Box<dyn ExecutablePlugin>,
        key: PluginKey,
    ) -> ControlResult<Arc<AvailablePlugin>> {
        let transport = self.transport()?;

        if let Err(e) = executable.start().await {
            let err = ControlError::StartFailed(e);
            tracing::error!(%key, error = %err, "Plugin failed to start");
            return Err(err);
        }

        match self.handshake(executable.as_mut(), transport.as_ref(), key).await {
            Ok(plugin) => Ok(plugin),
            Err(e) => {
                if let Err(kill_err) = executable.kill().await {
                    tracing::warn!(error = %kill_err, "Failed to kill plugin after failed start");
                }
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        executable: &mut dyn ExecutablePlugin,
        transport: &dyn PluginTransport,
        key: PluginKey,
    ) -> ControlResult<Arc<AvailablePlugin>> {
        let timeout = self.config.handshake_timeout();
        let response = tokio::time::timeout(timeout, executable.wait_for_response(timeout))
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout)))
            .map_err(ControlError::WaitForResponse)?
            .ok_or(ControlError::NoResponse)?;

        if response.state != ResponseState::Success {
            return Err(ControlError::PluginRejected(response.error_message));
        }
        tracing::trace!(%key, meta = ?response.meta, address = %response.listen_address, "Plugin handshake received");

        let client = transport
            .connect(&response)
            .await
            .map_err(ControlError::Connect)?;
        let plugin = Arc::new(AvailablePlugin::new(self.ids.next(), key, client));

        plugin.client().ping().await.map_err(ControlError::Ping)?;

        self.available_plugins.insert(Arc::clone(&plugin));
        tracing::info!(plugin = %plugin, "Available plugin started");

        self.emit(ControlEvent::AvailablePluginStarted {
            id: plugin.id(),
            name: plugin.key().name.clone(),
            version: plugin.key().version,
            plugin_type: plugin.key().plugin_type.to_string(),
        });
        Ok(plugin)
    }

    /// Ask `plugin` to stop, then remove it from the registry
    ///
    /// A failure in either step is returned as is; the other step is not
    /// rolled back.
    pub async fn stop_plugin(&self, reason: &str, plugin: &AvailablePlugin) -> ControlResult<()> {
        plugin.stop(reason).await.map_err(ControlError::Stop)?;
        self.available_plugins.remove(plugin)?;
        tracing::info!(plugin = %plugin, reason, "Available plugin stopped");

        self.emit(ControlEvent::AvailablePluginStopped {
            id: plugin.id(),
            name: plugin.key().name.clone(),
            version: plugin.key().version,
            reason: reason.to_string(),
        });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn emit(&self, event: ControlEvent) {
        if let Some(emitter) = self.emitter.read().as_ref() {
            emitter.emit(Event::new(event));
        }
    }

    fn plugin_manager(&self) -> ControlResult<Arc<dyn ManagesPlugins>> {
        self.plugin_manager
            .read()
            .clone()
            .ok_or(ControlError::MissingCollaborator("plugin manager"))
    }

    fn metric_catalog(&self) -> ControlResult<Arc<dyn CatalogsMetrics>> {
        self.metric_catalog
            .read()
            .clone()
            .ok_or(ControlError::MissingCollaborator("metric catalog"))
    }

    fn transport(&self) -> ControlResult<Arc<dyn PluginTransport>> {
        self.transport
            .read()
            .clone()
            .ok_or(ControlError::MissingCollaborator("plugin transport"))
    }
}

#[async_trait]
impl EventHandler for Runner {
    async fn handle_event(&self, event: Event) {
        match event.body {
            EventBody::Demand(demand) => self.handle_demand(demand).await,
            EventBody::Control(_) => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
