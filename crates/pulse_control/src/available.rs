//! Available Plugins
//!
//! An available plugin is one running instance of a plugin, reachable through
//! its client handle.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pulse_events::{ControlEvent, Emitter, Event};

use crate::PluginKey;
use crate::external::{ClientError, PluginClient};

// ─────────────────────────────────────────────────────────────────────────────
// Plugin State
// ─────────────────────────────────────────────────────────────────────────────

/// Current state of an available plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PluginState {
    /// Serving requests (the state every instance starts in)
    #[default]
    Running = 0,
    /// Asked to stop
    Stopped = 1,
    /// Failed too many health checks
    Disabled = 2,
}

impl PluginState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Stopped,
            _ => Self::Disabled,
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginState::Running => write!(f, "running"),
            PluginState::Stopped => write!(f, "stopped"),
            PluginState::Disabled => write!(f, "disabled"),
        }
    }
}

/// Outcome of one health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheck {
    Healthy,
    /// Probe failed; `failures` consecutive failures so far
    Failed { failures: u32 },
    /// Probe failed and the instance has now been disabled
    Disabled { failures: u32 },
}

// ─────────────────────────────────────────────────────────────────────────────
// Available Plugin
// ─────────────────────────────────────────────────────────────────────────────

/// One running plugin instance
pub struct AvailablePlugin {
    id: u64,
    key: PluginKey,
    client: Arc<dyn PluginClient>,
    state: AtomicU8,
    failed_health_checks: AtomicU32,
    started_at: DateTime<Utc>,
}

impl AvailablePlugin {
    pub fn new(id: u64, key: PluginKey, client: Arc<dyn PluginClient>) -> Self {
        Self {
            id,
            key,
            client,
            state: AtomicU8::new(PluginState::Running as u8),
            failed_health_checks: AtomicU32::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PluginKey {
        &self.key
    }

    pub fn client(&self) -> &Arc<dyn PluginClient> {
        &self.client
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> PluginState {
        PluginState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: PluginState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: PluginState, to: PluginState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PluginState::Running
    }

    /// Consecutive failed health checks since the last healthy probe
    pub fn failed_health_checks(&self) -> u32 {
        self.failed_health_checks.load(Ordering::SeqCst)
    }

    /// Ask the plugin process to shut down
    pub async fn stop(&self, reason: &str) -> Result<(), ClientError> {
        tracing::debug!(plugin = %self, reason, "Stopping available plugin");
        self.client.kill(reason).await?;
        self.set_state(PluginState::Stopped);
        Ok(())
    }

    /// Ping the plugin once, recording the outcome
    ///
    /// A ping that errors or exceeds `timeout` counts as a failure. Reaching
    /// `failure_limit` consecutive failures disables the instance. Failures
    /// are reported through `emitter` when one is given.
    pub async fn check_health(
        &self,
        timeout: Duration,
        failure_limit: u32,
        emitter: Option<&dyn Emitter>,
    ) -> HealthCheck {
        let error = match tokio::time::timeout(timeout, self.client.ping()).await {
            Ok(Ok(())) => {
                self.failed_health_checks.store(0, Ordering::SeqCst);
                return HealthCheck::Healthy;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("ping timed out after {timeout:?}"),
        };

        let failures = self.failed_health_checks.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(plugin = %self, failures, error = %error, "Health check failed");
        if let Some(emitter) = emitter {
            emitter.emit(Event::new(ControlEvent::HealthCheckFailed {
                id: self.id,
                name: self.key.name.clone(),
                version: self.key.version,
                failures,
            }));
        }

        if failures < failure_limit {
            return HealthCheck::Failed { failures };
        }

        // only a running instance escalates; a stop that raced the probe wins
        if !self.transition(PluginState::Running, PluginState::Disabled) {
            tracing::debug!(plugin = %self, state = %self.state(), "Not disabling plugin that is no longer running");
            return HealthCheck::Failed { failures };
        }
        tracing::error!(plugin = %self, failures, "Available plugin disabled after repeated health check failures");
        if let Some(emitter) = emitter {
            emitter.emit(Event::new(ControlEvent::DeadAvailablePlugin {
                id: self.id,
                name: self.key.name.clone(),
                version: self.key.version,
                failures,
            }));
        }
        HealthCheck::Disabled { failures }
    }
}

impl fmt::Display for AvailablePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:v{} id:{}",
            self.key.plugin_type, self.key.name, self.key.version, self.id
        )
    }
}

impl fmt::Debug for AvailablePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvailablePlugin")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("failed_health_checks", &self.failed_health_checks())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PluginType;
    use crate::test_support::{MockClient, RecordingEmitter};

    fn plugin(client: Arc<MockClient>) -> AvailablePlugin {
        AvailablePlugin::new(7, PluginKey::new(PluginType::Collector, "foo", 1), client)
    }

    #[test]
    fn test_new_plugin_is_running() {
        let ap = plugin(MockClient::healthy());
        assert_eq!(ap.state(), PluginState::Running);
        assert_eq!(ap.failed_health_checks(), 0);
        assert_eq!(ap.to_string(), "collector:foo:v1 id:7");
    }

    #[tokio::test]
    async fn test_stop_marks_stopped() {
        let client = MockClient::healthy();
        let ap = plugin(client.clone());

        ap.stop("no longer needed").await.unwrap();

        assert_eq!(ap.state(), PluginState::Stopped);
        assert_eq!(client.kill_reasons(), vec!["no longer needed".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_state() {
        let client = MockClient::healthy();
        client.fail_kill();
        let ap = plugin(client);

        assert!(ap.stop("bye").await.is_err());
        assert_eq!(ap.state(), PluginState::Running);
    }

    #[tokio::test]
    async fn test_healthy_probe_resets_failures() {
        let client = MockClient::healthy();
        client.fail_pings(1);
        let ap = plugin(client);

        let first = ap.check_health(Duration::from_secs(1), 3, None).await;
        assert_eq!(first, HealthCheck::Failed { failures: 1 });

        let second = ap.check_health(Duration::from_secs(1), 3, None).await;
        assert_eq!(second, HealthCheck::Healthy);
        assert_eq!(ap.failed_health_checks(), 0);
    }

    #[tokio::test]
    async fn test_repeated_failures_disable() {
        let client = MockClient::healthy();
        client.fail_pings(u32::MAX);
        let ap = plugin(client);
        let emitter = RecordingEmitter::default();

        for expected in 1..3 {
            let check = ap.check_health(Duration::from_secs(1), 3, Some(&emitter)).await;
            assert_eq!(check, HealthCheck::Failed { failures: expected });
            assert!(ap.is_running());
        }

        let last = ap.check_health(Duration::from_secs(1), 3, Some(&emitter)).await;
        assert_eq!(last, HealthCheck::Disabled { failures: 3 });
        assert_eq!(ap.state(), PluginState::Disabled);

        let namespaces = emitter.namespaces();
        assert_eq!(
            namespaces,
            vec![
                "Control.HealthCheckFailed",
                "Control.HealthCheckFailed",
                "Control.HealthCheckFailed",
                "Control.DeadAvailablePlugin",
            ]
        );
    }

    #[tokio::test]
    async fn test_stopped_plugin_is_not_disabled() {
        let client = MockClient::healthy();
        client.fail_pings(u32::MAX);
        let ap = plugin(client);
        let emitter = RecordingEmitter::default();

        ap.check_health(Duration::from_secs(1), 3, Some(&emitter)).await;
        ap.check_health(Duration::from_secs(1), 3, Some(&emitter)).await;
        ap.stop("unsubscribed").await.unwrap();

        let last = ap.check_health(Duration::from_secs(1), 3, Some(&emitter)).await;

        assert_eq!(last, HealthCheck::Failed { failures: 3 });
        assert_eq!(ap.state(), PluginState::Stopped);
        assert!(!emitter.namespaces().contains(&"Control.DeadAvailablePlugin"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_ping_counts_as_failure() {
        let client = MockClient::healthy();
        client.set_ping_delay(Duration::from_secs(5));
        let ap = plugin(client);

        let check = ap.check_health(Duration::from_secs(1), 3, None).await;
        assert_eq!(check, HealthCheck::Failed { failures: 1 });
    }
}
