//! Selection watchers: cooperative, cancellable tasks that poll a
//! configuration source and drive swaps through a domain bridge.
//!
//! Watchers hold only a non-owning (`Weak`) reference to their bridge —
//! the orchestrator owns the bridge graph, watchers are leaves that stop
//! cleanly once their bridge is gone rather than keeping it alive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::DomainBridge;
use crate::observability::events;

/// Yields the desired `{key → provider}` mapping for one domain. Backed by a
/// config file, an in-memory map, or any other source a host wires up.
#[async_trait]
pub trait SelectionSource: Send + Sync {
    async fn current_selection(&self) -> anyhow::Result<BTreeMap<String, String>>;
}

/// An in-memory selection source, primarily for tests and for embedders
/// that manage selection state themselves rather than via a config file.
#[derive(Default)]
pub struct InMemorySelectionSource {
    selection: Mutex<BTreeMap<String, String>>,
}

impl InMemorySelectionSource {
    pub fn new(selection: BTreeMap<String, String>) -> Self {
        Self { selection: Mutex::new(selection) }
    }

    pub fn set(&self, key: impl Into<String>, provider: impl Into<String>) {
        self.selection.lock().insert(key.into(), provider.into());
    }
}

#[async_trait]
impl SelectionSource for InMemorySelectionSource {
    async fn current_selection(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self.selection.lock().clone())
    }
}

/// A selection source backed by a TOML or JSON file on disk (format chosen
/// by extension). A `notify` watch marks the cached mapping dirty on any
/// filesystem event for the path; [`current_selection`](Self::current_selection)
/// only re-reads and re-parses the file when dirty, so a quiet file costs a
/// clone of the cached map rather than a fresh read+parse on every poll tick.
///
/// The outer poll cadence still comes from [`SelectionWatcher`]'s
/// `tokio::time::interval` — this source never spawns its own loop, it only
/// narrows what each tick actually has to do.
pub struct FileSelectionSource {
    path: PathBuf,
    dirty: Arc<AtomicBool>,
    cached: Mutex<Option<BTreeMap<String, String>>>,
    // Held only to keep the platform watcher alive for the source's lifetime.
    _watcher: Option<RecommendedWatcher>,
}

impl FileSelectionSource {
    /// Watch `path`, treating `.json` extensions as JSON and anything else
    /// as TOML. Missing files are tolerated: `current_selection` returns an
    /// empty mapping until the file appears.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let dirty = Arc::new(AtomicBool::new(true));

        let watcher = {
            let dirty = Arc::clone(&dirty);
            match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if res.is_ok() {
                    dirty.store(true, Ordering::SeqCst);
                }
            }) {
                Ok(mut watcher) => match watcher.watch(&path, RecursiveMode::NonRecursive) {
                    Ok(()) => Some(watcher),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "failed to watch selection file, falling back to poll-only");
                        None
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "failed to create selection file watcher, falling back to poll-only");
                    None
                }
            }
        };

        Self { path, dirty, cached: Mutex::new(None), _watcher: watcher }
    }

    fn parse(path: &Path, text: &str) -> anyhow::Result<BTreeMap<String, String>> {
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            Ok(serde_json::from_str(text)?)
        } else {
            Ok(toml::from_str(text)?)
        }
    }
}

#[async_trait]
impl SelectionSource for FileSelectionSource {
    async fn current_selection(&self) -> anyhow::Result<BTreeMap<String, String>> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            if let Some(cached) = self.cached.lock().clone() {
                return Ok(cached);
            }
        }

        let selection = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Self::parse(&self.path, &text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        *self.cached.lock() = Some(selection.clone());
        Ok(selection)
    }
}

struct RunningTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Polls a [`SelectionSource`] for one domain and funnels changes through
/// its bridge's `use_key`, honoring pause/drain activity state.
pub struct SelectionWatcher {
    bridge: Weak<DomainBridge>,
    source: Arc<dyn SelectionSource>,
    poll_interval: Duration,
    deferral_delay: Duration,
    applied: Mutex<BTreeMap<String, String>>,
    running: Mutex<Option<RunningTask>>,
}

impl SelectionWatcher {
    pub fn new(bridge: Weak<DomainBridge>, source: Arc<dyn SelectionSource>, poll_interval: Duration) -> Self {
        Self {
            bridge,
            source,
            poll_interval,
            deferral_delay: Duration::from_secs(5),
            applied: Mutex::new(BTreeMap::new()),
            running: Mutex::new(None),
        }
    }

    pub fn with_deferral_delay(mut self, delay: Duration) -> Self {
        self.deferral_delay = delay;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start the polling task. Calling `start` while already running is an
    /// error.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            anyhow::bail!("watcher already running");
        }
        let cancel = CancellationToken::new();
        let watcher = Arc::clone(self);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watcher.poll_interval);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = watcher.run_once().await {
                            tracing::warn!(error = %err, "selection watcher poll failed");
                        }
                    }
                }
            }
        });
        *running = Some(RunningTask { handle, cancel });
        Ok(())
    }

    /// Cancel the polling task and await its completion. A no-op if the
    /// watcher is not running.
    pub async fn stop(&self) {
        let task = self.running.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }

    /// Perform one poll cycle: compare the source's current selection
    /// against the last-applied mapping and drive swaps for anything that
    /// changed and is not vetoed by activity state.
    pub async fn run_once(&self) -> anyhow::Result<()> {
        let Some(bridge) = self.bridge.upgrade() else {
            return Ok(());
        };
        let desired = self.source.current_selection().await?;
        let domain = bridge.label().as_str();

        for (key, provider) in &desired {
            let unchanged = self.applied.lock().get(key) == Some(provider);
            if unchanged {
                continue;
            }

            let activity = bridge.activity_snapshot().await.ok();
            let current = activity.as_ref().and_then(|all| all.iter().find(|a| &a.key == key));

            if current.map(|a| a.paused).unwrap_or(false) {
                events::watcher_skipped_paused(domain, key);
                continue;
            }
            if current.map(|a| a.draining).unwrap_or(false) {
                events::watcher_deferred_draining(domain, key, self.deferral_delay.as_millis() as u64);
                continue;
            }

            match bridge.use_key(key, Some(provider.as_str()), false).await {
                Ok(_) => {
                    self.applied.lock().insert(key.clone(), provider.clone());
                }
                Err(err) => {
                    tracing::warn!(domain, key, error = %err, "watcher-driven swap failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityStore;
    use crate::environment::Environment;
    use crate::factory::{ActivatedInstance, ActivationContext, Factory, FactoryRegistry};
    use crate::lifecycle::LifecycleManager;
    use crate::lifecycle::LifecycleTimeouts;
    use crate::registry::Registry;
    use oneiric_model::Candidate;

    struct Echo;
    #[async_trait]
    impl Factory for Echo {
        async fn create(&self, _ctx: &ActivationContext<'_>) -> anyhow::Result<ActivatedInstance> {
            Ok(ActivatedInstance::new(Arc::new(())))
        }
    }

    fn candidate(provider: &str) -> Candidate {
        Candidate {
            domain: "service".into(),
            key: "status".into(),
            provider: provider.into(),
            factory: "factories.echo".into(),
            stack_level: 0,
            priority: 0,
            sequence: 0,
            source: "local".into(),
            version: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn run_once_applies_selection_and_skips_when_paused() {
        let env = Environment::permissive();
        let registry = Arc::new(Registry::new(env.clone()));
        let factories = Arc::new(FactoryRegistry::new());
        factories.register("factories.echo", Arc::new(Echo));
        let lifecycle = Arc::new(LifecycleManager::new(env, Arc::clone(&registry), factories, LifecycleTimeouts::default(), None));
        let activity = Arc::new(ActivityStore::open_in_memory().await.unwrap());
        let bridge = Arc::new(DomainBridge::service(Arc::clone(&registry), lifecycle, Arc::clone(&activity)));

        registry.register(candidate("v1"));
        registry.register(candidate("v2"));

        let source = Arc::new(InMemorySelectionSource::new(BTreeMap::new()));
        source.set("status", "v1");
        let watcher = Arc::new(SelectionWatcher::new(Arc::downgrade(&bridge), source.clone(), Duration::from_secs(60)));

        watcher.run_once().await.unwrap();
        assert_eq!(bridge.list_active()[0].provider, "v1");

        bridge.set_paused("status", Some("deploy window")).await.unwrap();
        source.set("status", "v2");
        watcher.run_once().await.unwrap();
        assert_eq!(bridge.list_active()[0].provider, "v1");

        bridge.clear_activity("status").await.unwrap();
        watcher.run_once().await.unwrap();
        assert_eq!(bridge.list_active()[0].provider, "v2");
    }

    #[tokio::test]
    async fn file_selection_source_reparses_on_change_and_caches_between_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selection.toml");
        std::fs::write(&path, "status = \"v1\"\n").unwrap();

        let source = FileSelectionSource::new(&path);
        let first = source.current_selection().await.unwrap();
        assert_eq!(first.get("status"), Some(&"v1".to_string()));

        std::fs::write(&path, "status = \"v2\"\n").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = source.current_selection().await.unwrap();
        assert_eq!(second.get("status"), Some(&"v2".to_string()));
    }

    #[tokio::test]
    async fn file_selection_source_missing_file_is_empty_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");
        let source = FileSelectionSource::new(&path);
        let selection = source.current_selection().await.unwrap();
        assert!(selection.is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_an_error_and_stop_is_idempotent() {
        let env = Environment::permissive();
        let registry = Arc::new(Registry::new(env.clone()));
        let factories = Arc::new(FactoryRegistry::new());
        let lifecycle = Arc::new(LifecycleManager::new(env, Arc::clone(&registry), factories, LifecycleTimeouts::default(), None));
        let activity = Arc::new(ActivityStore::open_in_memory().await.unwrap());
        let bridge = Arc::new(DomainBridge::service(registry, lifecycle, activity));
        let source = Arc::new(InMemorySelectionSource::default());
        let watcher = Arc::new(SelectionWatcher::new(Arc::downgrade(&bridge), source, Duration::from_secs(60)));

        watcher.start().unwrap();
        assert!(watcher.start().is_err());
        watcher.stop().await;
        watcher.stop().await;
    }
}
