//! File system watcher turning bundle files into plug source events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::loader::{BundleLoader, LoaderConfig, PlugBundle};
use crate::source::PlugSource;

/// Configuration for the plug watcher.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Whether to watch recursively.
    pub recursive: bool,
    /// How bundle files are recognized and read.
    pub loader: LoaderConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            loader: LoaderConfig::default(),
        }
    }
}

impl WatchConfig {
    /// Create a new watch configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set recursive watching.
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Set the bundle loader configuration.
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }
}

// What each bundle file last produced.
#[derive(Default)]
struct WatchState {
    bundles: HashMap<PathBuf, PlugBundle>,
}

impl WatchState {
    fn file_changed(&mut self, loader: &BundleLoader, source: &PlugSource, path: &Path) {
        let bundle = match loader.load(path) {
            Ok(bundle) => bundle,
            Err(e) => {
                // Often a half-written file; the next write retries.
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable plug bundle");
                return;
            }
        };

        match self.bundles.get(path) {
            Some(previous) if *previous == bundle => {
                tracing::trace!(path = %path.display(), "plug bundle unchanged");
                return;
            }
            Some(previous) if previous.name() != bundle.name() => {
                source.unloaded(previous.name());
            }
            _ => {}
        }

        tracing::debug!(path = %path.display(), plug = %bundle.name(), "plug bundle changed");
        self.bundles.insert(path.to_path_buf(), bundle.clone());
        source.loaded(bundle);
    }

    fn file_removed(&mut self, source: &PlugSource, path: &Path) {
        if let Some(previous) = self.bundles.remove(path) {
            tracing::debug!(path = %path.display(), plug = %previous.name(), "plug bundle removed");
            source.unloaded(previous.name());
        }
    }

    fn handle_event(&mut self, loader: &BundleLoader, source: &PlugSource, event: Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        // Renames report both paths; whichever still exists was the target.
        for path in event.paths.iter().filter(|p| loader.is_bundle(p)) {
            if path.is_file() {
                self.file_changed(loader, source, path);
            } else {
                self.file_removed(source, path);
            }
        }
    }
}

/// Watches directories of plug bundles and reports them to a [`PlugSource`].
pub struct PlugWatcher {
    config: WatchConfig,
    loader: Arc<BundleLoader>,
    source: PlugSource,
    watcher: Option<RecommendedWatcher>,
    watched_paths: RwLock<Vec<PathBuf>>,
    state: Arc<Mutex<WatchState>>,
    running: Arc<AtomicBool>,
}

impl PlugWatcher {
    /// Create a watcher reporting to `source`.
    pub fn new(config: WatchConfig, source: PlugSource) -> Self {
        let loader = Arc::new(BundleLoader::new(config.loader.clone()));
        Self {
            config,
            loader,
            source,
            watcher: None,
            watched_paths: RwLock::new(Vec::new()),
            state: Arc::new(Mutex::new(WatchState::default())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the watcher configuration.
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Check if the watcher is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Report every bundle already present in the watched paths.
    pub fn scan(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let mut found = 0;
        for dir in self.watched_paths.read().iter() {
            for bundle in self.loader.scan(dir)? {
                if let Some(origin) = bundle.origin.clone() {
                    state.file_changed(&self.loader, &self.source, &origin);
                    found += 1;
                }
            }
        }
        Ok(found)
    }

    /// Start watching.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let state = self.state.clone();
        let loader = self.loader.clone();
        let source = self.source.clone();
        let running = self.running.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                match res {
                    Ok(event) => state.lock().handle_event(&loader, &source, event),
                    Err(e) => tracing::warn!(error = %e, "watch error"),
                }
            },
            Config::default(),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        let mode = self.mode();
        for path in self.watched_paths.read().iter() {
            watcher
                .watch(path, mode)
                .map_err(|e| Error::Watch(e.to_string()))?;
        }

        self.watcher = Some(watcher);
        self.running.store(true, Ordering::Relaxed);
        tracing::info!(paths = self.watched_paths.read().len(), "plug watcher started");
        Ok(())
    }

    /// Stop watching.
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            self.running.store(false, Ordering::Relaxed);
            tracing::info!("plug watcher stopped");
        }
    }

    /// Watch a path.
    pub fn watch(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        {
            let mut paths = self.watched_paths.write();
            if paths.contains(&path) {
                return Ok(());
            }
            paths.push(path.clone());
        }

        let mode = self.mode();
        if let Some(ref mut watcher) = self.watcher {
            watcher
                .watch(&path, mode)
                .map_err(|e| Error::Watch(e.to_string()))?;
        }
        Ok(())
    }

    /// Unwatch a path.
    pub fn unwatch(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.watched_paths.write().retain(|p| p != path);

        if let Some(ref mut watcher) = self.watcher {
            watcher
                .unwatch(path)
                .map_err(|e| Error::Watch(e.to_string()))?;
        }
        Ok(())
    }

    /// Get watched paths.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watched_paths.read().clone()
    }

    /// Plug name last produced by `path`.
    pub fn plug_for(&self, path: &Path) -> Option<String> {
        self.state
            .lock()
            .bundles
            .get(path)
            .map(|b| b.name().to_string())
    }

    fn mode(&self) -> RecursiveMode {
        if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        }
    }
}

impl std::fmt::Debug for PlugWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlugWatcher")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("watched_paths", &self.watched_paths.read().len())
            .finish()
    }
}

impl Drop for PlugWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
