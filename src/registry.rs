//! Detector registry and plugin lifecycle.
//!
//! Plugins move through `Registered -> Active -> Deactivated`, or into
//! `Error` when a hook fails or exceeds its timeout. Failures are isolated:
//! one plugin going wrong never stops its siblings from activating,
//! deactivating or detecting.

use crate::detector::DetectionResult;
use crate::error::PluginError;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub const DEFAULT_ACTIVATION_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_DEACTIVATION_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Static description of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginMetadata {
    /// Unique plugin id
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    /// Ids of plugins that must be active first
    pub dependencies: BTreeSet<String>,
}

impl PluginMetadata {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: description.into(),
            dependencies: BTreeSet::new(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }
}

/// Runtime configuration of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub enabled: bool,
    pub confidence_threshold: f64,
    /// Stored and reported; detection itself is not debounced
    pub debounce_ms: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            debounce_ms: 0,
        }
    }
}

/// Partial plugin configuration, merged field by field
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfigPatch {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
}

impl PluginConfig {
    pub fn merge(&mut self, patch: &PluginConfigPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(threshold) = patch.confidence_threshold {
            self.confidence_threshold = threshold;
        }
        if let Some(debounce) = patch.debounce_ms {
            self.debounce_ms = debounce;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Registered,
    Active,
    Error,
    Deactivated,
}

/// An agent detector managed by the registry.
///
/// `evaluate` is ungated: the registry only calls it for active, enabled plugins.
#[async_trait]
pub trait AgentPlugin: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    fn evaluate(&self, terminal_id: &str, chunk: &str, threshold: f64) -> DetectionResult;

    async fn activate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn deactivate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Diagnostic snapshot of one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginStatus {
    pub id: String,
    pub name: String,
    pub version: String,
    pub state: PluginState,
    pub config: PluginConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Result of one plugin within `activate_all` / `deactivate_all`
#[derive(Debug)]
pub struct LifecycleOutcome {
    pub id: String,
    pub result: Result<(), PluginError>,
}

struct PluginEntry {
    plugin: Arc<dyn AgentPlugin>,
    state: PluginState,
    config: PluginConfig,
    activated_at: Option<SystemTime>,
    last_error: Option<String>,
    /// Activation hook currently running, shared by overlapping callers
    activating: Option<PendingActivation>,
}

type PendingActivation = Shared<BoxFuture<'static, Result<(), PluginError>>>;

fn run_activation(plugin: Arc<dyn AgentPlugin>, id: String, limit: Duration) -> PendingActivation {
    async move {
        match timeout(limit, plugin.activate()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PluginError::ActivationFailed {
                id,
                message: format!("{:#}", e),
            }),
            Err(_) => Err(PluginError::Timeout {
                id,
                phase: "activation",
                timeout: limit,
            }),
        }
    }
    .boxed()
    .shared()
}

#[derive(Default)]
struct Inner {
    disposed: bool,
    plugins: HashMap<String, PluginEntry>,
    /// Registration order, for deterministic iteration
    order: Vec<String>,
}

impl Inner {
    fn unmet_dependency(&self, id: &str) -> Option<String> {
        let entry = self.plugins.get(id)?;
        entry
            .plugin
            .metadata()
            .dependencies
            .iter()
            .find(|dep| self.plugins.get(dep.as_str()).map(|e| e.state) != Some(PluginState::Active))
            .cloned()
    }

    fn mark_error(&mut self, id: &str, err: &PluginError) {
        if let Some(entry) = self.plugins.get_mut(id) {
            entry.state = PluginState::Error;
            entry.last_error = Some(err.to_string());
        }
    }
}

/// Owns every detector plugin and its lifecycle state
pub struct PluginRegistry {
    inner: Mutex<Inner>,
    activation_timeout: Duration,
    deactivation_timeout: Duration,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVATION_TIMEOUT, DEFAULT_DEACTIVATION_TIMEOUT)
    }
}

impl PluginRegistry {
    pub fn new(activation_timeout: Duration, deactivation_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            activation_timeout,
            deactivation_timeout,
        }
    }

    /// Register a plugin in the `Registered` state. Duplicate ids are rejected.
    pub fn register(&self, plugin: Arc<dyn AgentPlugin>) -> Result<(), PluginError> {
        let mut inner = self.lock()?;
        let id = plugin.metadata().id.clone();
        if inner.plugins.contains_key(&id) {
            warn!("Rejected duplicate plugin registration: {}", id);
            return Err(PluginError::AlreadyRegistered(id));
        }

        info!(
            "Registered plugin {} ({} v{})",
            id,
            plugin.metadata().name,
            plugin.metadata().version
        );
        inner.order.push(id.clone());
        inner.plugins.insert(
            id,
            PluginEntry {
                plugin,
                state: PluginState::Registered,
                config: PluginConfig::default(),
                activated_at: None,
                last_error: None,
                activating: None,
            },
        );
        Ok(())
    }

    /// Run the activation hook under the activation timeout.
    ///
    /// Already active plugins are left alone. A call that overlaps an
    /// activation in flight waits for that attempt and shares its result, so
    /// the hook runs once. Failures leave the plugin in `Error` and are
    /// returned; there is no automatic retry.
    pub async fn activate(&self, id: &str) -> Result<(), PluginError> {
        let attempt = {
            let mut inner = self.lock()?;
            let entry = inner
                .plugins
                .get(id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            if entry.state == PluginState::Active {
                debug!("Plugin {} already active", id);
                return Ok(());
            }
            if let Some(pending) = &entry.activating {
                debug!("Plugin {} activation already in flight", id);
                pending.clone()
            } else {
                let plugin = Arc::clone(&entry.plugin);

                if let Some(dependency) = inner.unmet_dependency(id) {
                    let err = PluginError::DependencyNotActive {
                        id: id.to_string(),
                        dependency,
                    };
                    error!("{}", err);
                    inner.mark_error(id, &err);
                    return Err(err);
                }

                let attempt = run_activation(plugin, id.to_string(), self.activation_timeout);
                if let Some(entry) = inner.plugins.get_mut(id) {
                    entry.activating = Some(attempt.clone());
                }
                attempt
            }
        };

        // The lock is released here; other plugins activate concurrently.
        let outcome = attempt.await;

        let mut inner = self.lock()?;
        // Whichever caller finishes first records the outcome
        let settled = inner
            .plugins
            .get_mut(id)
            .is_some_and(|entry| entry.activating.take().is_some());
        if !settled {
            return outcome;
        }
        match outcome {
            Ok(()) => {
                let entry = inner
                    .plugins
                    .get_mut(id)
                    .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
                entry.state = PluginState::Active;
                entry.activated_at = Some(SystemTime::now());
                entry.last_error = None;
                info!("Activated plugin {}", id);
                Ok(())
            }
            Err(err) => {
                error!("{}", err);
                inner.mark_error(id, &err);
                Err(err)
            }
        }
    }

    /// Run the deactivation hook under the deactivation timeout.
    ///
    /// Only `Active` and `Error` plugins run the hook. A failure is logged,
    /// leaves the plugin in `Error` and is returned.
    pub async fn deactivate(&self, id: &str) -> Result<(), PluginError> {
        let plugin = {
            let inner = self.lock()?;
            let entry = inner
                .plugins
                .get(id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            if !matches!(entry.state, PluginState::Active | PluginState::Error) {
                debug!("Plugin {} not active, nothing to deactivate", id);
                return Ok(());
            }
            Arc::clone(&entry.plugin)
        };

        let outcome = match timeout(self.deactivation_timeout, plugin.deactivate()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PluginError::DeactivationFailed {
                id: id.to_string(),
                message: format!("{:#}", e),
            }),
            Err(_) => Err(PluginError::Timeout {
                id: id.to_string(),
                phase: "deactivation",
                timeout: self.deactivation_timeout,
            }),
        };

        let mut inner = self.lock()?;
        match outcome {
            Ok(()) => {
                if let Some(entry) = inner.plugins.get_mut(id) {
                    entry.state = PluginState::Deactivated;
                    entry.activated_at = None;
                    entry.last_error = None;
                }
                info!("Deactivated plugin {}", id);
                Ok(())
            }
            Err(err) => {
                warn!("{}", err);
                inner.mark_error(id, &err);
                Err(err)
            }
        }
    }

    /// Activate every plugin, dependencies first.
    ///
    /// Plugins whose dependencies are satisfied activate concurrently in
    /// waves. Plugins left with unmet dependencies end in `Error`.
    pub async fn activate_all(&self) -> Result<Vec<LifecycleOutcome>, PluginError> {
        let mut remaining = self.lock()?.order.clone();
        let mut outcomes = Vec::with_capacity(remaining.len());

        loop {
            let ready: Vec<String> = {
                let inner = self.lock()?;
                remaining
                    .iter()
                    .filter(|id| inner.unmet_dependency(id).is_none())
                    .cloned()
                    .collect()
            };
            if ready.is_empty() {
                break;
            }
            remaining.retain(|id| !ready.contains(id));

            let results = join_all(ready.iter().map(|id| self.activate(id))).await;
            for (id, result) in ready.into_iter().zip(results) {
                outcomes.push(LifecycleOutcome { id, result });
            }
        }

        // Unmet dependencies: activate() records the error and fails fast
        for id in remaining {
            let result = self.activate(&id).await;
            outcomes.push(LifecycleOutcome { id, result });
        }

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(
            "Activated {} of {} plugins",
            outcomes.len() - failed,
            outcomes.len()
        );
        Ok(outcomes)
    }

    /// Deactivate every plugin, dependents first. Failures are logged and isolated.
    pub async fn deactivate_all(&self) -> Result<Vec<LifecycleOutcome>, PluginError> {
        let mut remaining: Vec<String> = {
            let inner = self.lock()?;
            inner
                .order
                .iter()
                .filter(|id| {
                    inner.plugins.get(id.as_str()).is_some_and(|e| {
                        matches!(e.state, PluginState::Active | PluginState::Error)
                    })
                })
                .cloned()
                .collect()
        };
        let mut outcomes = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut ready: Vec<String> = {
                let inner = self.lock()?;
                remaining
                    .iter()
                    .filter(|id| {
                        !remaining.iter().any(|other| {
                            inner.plugins.get(other.as_str()).is_some_and(|e| {
                                e.plugin.metadata().dependencies.contains(id.as_str())
                            })
                        })
                    })
                    .cloned()
                    .collect()
            };
            if ready.is_empty() {
                // Dependency cycle: deactivate the rest together
                ready = std::mem::take(&mut remaining);
            } else {
                remaining.retain(|id| !ready.contains(id));
            }

            let results = join_all(ready.iter().map(|id| self.deactivate(id))).await;
            for (id, result) in ready.into_iter().zip(results) {
                outcomes.push(LifecycleOutcome { id, result });
            }
        }

        Ok(outcomes)
    }

    /// Shallow-merge configuration. Takes effect on the next `detect` call.
    pub fn configure(&self, id: &str, patch: PluginConfigPatch) -> Result<PluginConfig, PluginError> {
        if let Some(threshold) = patch.confidence_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(PluginError::InvalidThreshold(threshold));
            }
        }

        let mut inner = self.lock()?;
        let entry = inner
            .plugins
            .get_mut(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        entry.config.merge(&patch);
        info!("Configured plugin {}: {:?}", id, entry.config);
        Ok(entry.config)
    }

    /// Detect with one plugin. Inactive or disabled plugins never detect.
    pub fn detect(
        &self,
        id: &str,
        terminal_id: &str,
        chunk: &str,
    ) -> Result<DetectionResult, PluginError> {
        let (plugin, threshold) = {
            let inner = self.lock()?;
            let entry = inner
                .plugins
                .get(id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            if entry.state != PluginState::Active || !entry.config.enabled {
                return Ok(DetectionResult::none());
            }
            (Arc::clone(&entry.plugin), entry.config.confidence_threshold)
        };
        Ok(plugin.evaluate(terminal_id, chunk, threshold))
    }

    /// Positive detections from every active, enabled plugin, strongest first
    pub fn detect_all(
        &self,
        terminal_id: &str,
        chunk: &str,
    ) -> Result<Vec<DetectionResult>, PluginError> {
        let candidates: Vec<(Arc<dyn AgentPlugin>, f64)> = {
            let inner = self.lock()?;
            inner
                .order
                .iter()
                .filter_map(|id| inner.plugins.get(id))
                .filter(|e| e.state == PluginState::Active && e.config.enabled)
                .map(|e| (Arc::clone(&e.plugin), e.config.confidence_threshold))
                .collect()
        };

        let mut hits: Vec<DetectionResult> = candidates
            .iter()
            .map(|(plugin, threshold)| plugin.evaluate(terminal_id, chunk, *threshold))
            .filter(|result| result.detected)
            .collect();
        hits.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(hits)
    }

    pub fn state(&self, id: &str) -> Result<PluginState, PluginError> {
        let inner = self.lock()?;
        inner
            .plugins
            .get(id)
            .map(|e| e.state)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    pub fn config(&self, id: &str) -> Result<PluginConfig, PluginError> {
        let inner = self.lock()?;
        inner
            .plugins
            .get(id)
            .map(|e| e.config)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .plugins
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status of every plugin in registration order
    pub fn statuses(&self) -> Result<Vec<PluginStatus>, PluginError> {
        let inner = self.lock()?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.plugins.get(id))
            .map(|e| {
                let metadata = e.plugin.metadata();
                PluginStatus {
                    id: metadata.id.clone(),
                    name: metadata.name.clone(),
                    version: metadata.version.clone(),
                    state: e.state,
                    config: e.config,
                    activated_at_ms: e.activated_at.and_then(|t| {
                        t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_millis() as u64)
                    }),
                    last_error: e.last_error.clone(),
                }
            })
            .collect())
    }

    /// Release every plugin without waiting for deactivation.
    ///
    /// Deactivation hooks of active plugins are spawned on the current tokio
    /// runtime (if any) and not awaited. Repeat calls are no-ops.
    pub fn dispose(&self) {
        let entries: Vec<(String, PluginEntry)> = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.order.clear();
            inner.plugins.drain().collect()
        };

        let runtime = tokio::runtime::Handle::try_current().ok();
        let count = entries.len();
        for (id, mut entry) in entries {
            let was_running = matches!(entry.state, PluginState::Active | PluginState::Error);
            entry.state = PluginState::Deactivated;
            if !was_running {
                continue;
            }
            match runtime {
                Some(ref handle) => {
                    let plugin = entry.plugin;
                    let limit = self.deactivation_timeout;
                    handle.spawn(async move {
                        match timeout(limit, plugin.deactivate()).await {
                            Ok(Ok(())) => debug!("Plugin {} deactivated during dispose", id),
                            Ok(Err(e)) => warn!("Plugin {} failed to deactivate: {:#}", id, e),
                            Err(_) => warn!("Plugin {} deactivation timed out during dispose", id),
                        }
                    });
                }
                None => debug!("No runtime available, skipping deactivation hook for {}", id),
            }
        }
        info!("Plugin registry disposed ({} plugins)", count);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disposed
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, PluginError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.disposed {
            return Err(PluginError::Disposed);
        }
        Ok(inner)
    }
}
