//! Health Monitor
//!
//! Periodically sweeps the registry and probes every running instance. The
//! sweep only holds the registry lock while it dispatches probes; the probes
//! themselves run as separate tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pulse_events::Emitter;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::{ControlConfig, PluginRegistry};

// ─────────────────────────────────────────────────────────────────────────────
// Monitor State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MonitorState {
    #[default]
    Stopped = 0,
    Started = 1,
}

impl MonitorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Started,
            _ => Self::Stopped,
        }
    }
}

/// Parameters handed to each probe
#[derive(Debug, Clone, Copy)]
struct ProbeSettings {
    timeout: Duration,
    failure_limit: u32,
}

struct MonitorTask {
    quit: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Monitor
// ─────────────────────────────────────────────────────────────────────────────

/// Periodic health checker for available plugins
pub struct Monitor {
    state: AtomicU8,
    interval: Duration,
    probe: ProbeSettings,
    emitter: Mutex<Option<Arc<dyn Emitter>>>,
    task: Mutex<Option<MonitorTask>>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Self::with_config(&ControlConfig::default())
    }

    pub fn with_config(config: &ControlConfig) -> Self {
        Self {
            state: AtomicU8::new(MonitorState::Stopped as u8),
            interval: config.monitor_interval(),
            probe: ProbeSettings {
                timeout: config.health_check_timeout(),
                failure_limit: config.health_check_failure_limit,
            },
            emitter: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Set the sweep period. Takes effect on the next `start`.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Where probe failures are reported. Takes effect on the next `start`.
    pub fn set_emitter(&self, emitter: Option<Arc<dyn Emitter>>) {
        *self.emitter.lock() = emitter;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_started(&self) -> bool {
        self.state() == MonitorState::Started
    }

    /// Begin sweeping `registry` every interval
    ///
    /// The first sweep happens one interval after start. Calling this while
    /// already started does nothing.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, registry: Arc<PluginRegistry>) {
        let mut task = self.task.lock();
        if self.transition(MonitorState::Stopped, MonitorState::Started).is_err() {
            tracing::debug!("Monitor already started");
            return;
        }

        let (quit, quit_rx) = oneshot::channel();
        let interval = self.interval;
        let probe = self.probe;
        let emitter = self.emitter.lock().clone();

        let join_handle = tokio::spawn(async move {
            run_monitor_loop(registry, interval, probe, emitter, quit_rx).await
        });

        *task = Some(MonitorTask { quit, join_handle });
        tracing::debug!(interval = ?interval, "Monitor started");
    }

    /// Stop sweeping
    ///
    /// Probes already dispatched are left to finish. Safe to call any number
    /// of times.
    pub fn stop(&self) {
        // dropping the handle detaches the loop; it still drains its probes
        drop(self.signal_stop());
    }

    /// Stop sweeping and wait for the loop and its outstanding probes
    pub async fn shutdown(&self) {
        if let Some(join_handle) = self.signal_stop() {
            if let Err(e) = join_handle.await {
                tracing::error!(error = ?e, "Monitor task panicked");
            }
        }
    }

    fn signal_stop(&self) -> Option<JoinHandle<()>> {
        let mut task = self.task.lock();
        if self.transition(MonitorState::Started, MonitorState::Stopped).is_err() {
            return None;
        }

        let MonitorTask { quit, join_handle } = task.take()?;
        let _ = quit.send(());
        tracing::debug!("Monitor stopped");
        Some(join_handle)
    }

    fn transition(&self, from: MonitorState, to: MonitorState) -> Result<(), MonitorState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(MonitorState::from_u8)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Monitor Loop
// ─────────────────────────────────────────────────────────────────────────────

async fn run_monitor_loop(
    registry: Arc<PluginRegistry>,
    interval: Duration,
    probe: ProbeSettings,
    emitter: Option<Arc<dyn Emitter>>,
    mut quit: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut probes = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut quit => break,

            _ = ticker.tick() => {
                let dispatched = sweep(&registry, &mut probes, probe, &emitter);
                tracing::trace!(dispatched, "Health sweep dispatched");
            }

            Some(result) = probes.join_next(), if !probes.is_empty() => {
                if let Err(e) = result {
                    tracing::warn!(error = ?e, "Health probe task failed");
                }
            }
        }
    }

    while let Some(result) = probes.join_next().await {
        if let Err(e) = result {
            tracing::warn!(error = ?e, "Health probe task failed");
        }
    }
}

/// Dispatch one probe per running instance, holding the registry lock only
/// while dispatching
fn sweep(
    registry: &PluginRegistry,
    probes: &mut JoinSet<()>,
    probe: ProbeSettings,
    emitter: &Option<Arc<dyn Emitter>>,
) -> usize {
    let tables = registry.lock();
    let mut dispatched = 0;
    for plugin in tables.table() {
        if !plugin.is_running() {
            continue;
        }
        let emitter = emitter.clone();
        probes.spawn(async move {
            plugin
                .check_health(probe.timeout, probe.failure_limit, emitter.as_deref())
                .await;
        });
        dispatched += 1;
    }
    dispatched
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
