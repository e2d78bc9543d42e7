//! The system: single authority over plug lifecycle and syscall dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::hooks::Hook;
use crate::lifecycle::{LifecycleEvent, LifecycleListeners};
use crate::loader::PlugBundle;
use crate::manifest::Manifest;
use crate::plug::{Plug, PlugHandle, PlugInfo};
use crate::registry::{PlugRegistry, RegistryStats};
use crate::sandbox::{SandboxFactory, SandboxLimits, SyscallBridge, SyscallHandler};
use crate::source::{PlugSourceEvent, PlugSourceStream};
use crate::syscall::{SyscallContext, SyscallRegistry, SyscallSet};

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::PlugMetrics;

/// Which declared namespaces the host operator grants at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantPolicy {
    /// Grant whatever a manifest declares.
    AllDeclared,
    /// Grant only namespaces listed for the plug.
    Only(HashMap<String, HashSet<String>>),
    /// Grant nothing; plugs declaring any namespace fail to load.
    DenyAll,
}

impl GrantPolicy {
    /// An empty explicit grant table.
    pub fn only() -> Self {
        Self::Only(HashMap::new())
    }

    /// Grant `namespace` to `plug`, switching to an explicit table.
    pub fn allow(self, plug: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut table = match self {
            Self::Only(table) => table,
            Self::AllDeclared | Self::DenyAll => HashMap::new(),
        };
        table
            .entry(plug.into())
            .or_default()
            .insert(namespace.into());
        Self::Only(table)
    }

    fn permits(&self, plug: &str, namespace: &str) -> bool {
        match self {
            Self::AllDeclared => true,
            Self::Only(table) => table.get(plug).map_or(false, |ns| ns.contains(namespace)),
            Self::DenyAll => false,
        }
    }

    /// Grants for `manifest`, or the first declared namespace refused.
    pub fn grant(&self, manifest: &Manifest) -> Result<HashSet<String>> {
        if let Some(refused) = manifest
            .requires
            .iter()
            .find(|ns| !self.permits(&manifest.name, ns))
        {
            return Err(Error::permission_denied(&manifest.name, refused));
        }
        Ok(manifest.requires.iter().cloned().collect())
    }
}

impl Default for GrantPolicy {
    fn default() -> Self {
        Self::AllDeclared
    }
}

/// Configuration for a [`System`].
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Maximum number of loaded plugs.
    pub max_plugs: usize,
    /// Limits applied to every sandbox.
    pub limits: SandboxLimits,
    /// Namespace grant policy.
    pub grants: GrantPolicy,
    /// Path prefix for plug endpoints.
    pub endpoint_prefix: String,
    /// Log a warning when a syscall registration replaces an existing one.
    pub warn_on_syscall_override: bool,
    /// Metrics sink.
    #[cfg(feature = "metrics-prometheus")]
    pub metrics: Option<Arc<PlugMetrics>>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_plugs: 100,
            limits: SandboxLimits::default(),
            grants: GrantPolicy::default(),
            endpoint_prefix: "/_".to_string(),
            warn_on_syscall_override: true,
            #[cfg(feature = "metrics-prometheus")]
            metrics: None,
        }
    }
}

impl SystemConfig {
    /// Create a new system configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of plugs.
    pub fn with_max_plugs(mut self, max: usize) -> Self {
        self.max_plugs = max;
        self
    }

    /// Set sandbox limits.
    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the grant policy.
    pub fn with_grants(mut self, grants: GrantPolicy) -> Self {
        self.grants = grants;
        self
    }

    /// Set the endpoint prefix.
    pub fn with_endpoint_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.endpoint_prefix = prefix.into();
        self
    }

    /// Enable or disable warnings for replaced syscalls.
    pub fn with_syscall_override_warnings(mut self, warn: bool) -> Self {
        self.warn_on_syscall_override = warn;
        self
    }

    /// Record metrics into `metrics`.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_metrics(mut self, metrics: Arc<PlugMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

struct SystemInner {
    config: SystemConfig,
    registry: PlugRegistry,
    syscalls: SyscallRegistry,
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
    listeners: RwLock<LifecycleListeners>,
    // Serializes load/unload per plug name.
    name_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    // Held while hook tables and the registry change together.
    registration: Mutex<()>,
}

impl SystemInner {
    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.name_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // Drops the entry once no other operation holds or waits on it.
    fn release_name_lock(&self, name: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        self.name_locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn syscall_with_context(
        &self,
        ctx: &SyscallContext,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let plug = self
            .registry
            .get(&ctx.plug)
            .ok_or_else(|| Error::plug_not_found(&ctx.plug))?;

        #[cfg(feature = "metrics-prometheus")]
        if let Some(ref metrics) = self.config.metrics {
            metrics.record_syscall();
        }

        self.syscalls.dispatch(ctx, plug.granted(), name, args).await
    }

    fn check_hooks(&self, manifest: &Manifest) -> Result<()> {
        for hook in self.hooks.read().iter() {
            hook.check(manifest)?;
        }
        Ok(())
    }

    async fn load_locked(
        self: &Arc<Self>,
        name: &str,
        bundle: PlugBundle,
        factory: &dyn SandboxFactory,
    ) -> Result<(PlugHandle, bool)> {
        let manifest = bundle.manifest;
        if manifest.name != name {
            return Err(Error::invalid_manifest(format!(
                "bundle declares plug {:?}, expected {:?}",
                manifest.name, name
            )));
        }
        manifest.validate()?;

        let problems: Vec<String> = self
            .hooks
            .read()
            .iter()
            .flat_map(|hook| hook.validate_manifest(&manifest))
            .collect();
        if !problems.is_empty() {
            return Err(Error::invalid_manifest(problems.join("; ")));
        }
        let granted = self.config.grants.grant(&manifest)?;

        // Reload is a full unload followed by a fresh load.
        let replaced = self.unload_locked(name).await;

        self.registry.ensure_room(name)?;
        self.check_hooks(&manifest)?;

        let host: Weak<SystemInner> = Arc::downgrade(self);
        let handler: Weak<dyn SyscallHandler> = host;
        let bridge = SyscallBridge::new(name, handler);
        let sandbox = factory.create(&manifest, bridge, &self.config.limits)?;
        let plug = PlugHandle::new(Plug::new(manifest, granted, sandbox));

        let installed = {
            let _registration = self.registration.lock();
            self.check_hooks(plug.manifest()).and_then(|()| {
                self.registry.insert(plug.clone())?;
                for hook in self.hooks.read().iter() {
                    hook.install(&plug);
                }
                Ok(())
            })
        };
        if let Err(e) = installed {
            plug.shutdown().await;
            return Err(e);
        }

        Ok((plug, replaced))
    }

    async fn unload_locked(&self, name: &str) -> bool {
        let removed = {
            let _registration = self.registration.lock();
            for hook in self.hooks.read().iter() {
                hook.uninstall(name);
            }
            self.registry.remove(name)
        };
        let Some(plug) = removed else {
            return false;
        };

        plug.shutdown().await;
        self.syscalls.forget_plug(name);

        tracing::info!(plug = %name, id = plug.id(), "plug unloaded");
        self.listeners.read().emit_unloaded(name);
        #[cfg(feature = "metrics-prometheus")]
        if let Some(ref metrics) = self.config.metrics {
            metrics.record_unload();
        }
        true
    }
}

#[async_trait]
impl SyscallHandler for SystemInner {
    async fn handle_syscall(
        &self,
        ctx: &SyscallContext,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.syscall_with_context(ctx, name, args).await
    }
}

/// Hosts plugs: loads them into sandboxes, wires them to hooks and mediates
/// every syscall they make.
///
/// Cloning is cheap and yields a handle to the same system.
#[derive(Clone)]
pub struct System {
    inner: Arc<SystemInner>,
}

impl System {
    /// Create a system with no hooks and no syscalls.
    pub fn new(config: SystemConfig) -> Self {
        let registry = PlugRegistry::new(config.max_plugs);
        let syscalls =
            SyscallRegistry::new().with_override_warnings(config.warn_on_syscall_override);
        Self {
            inner: Arc::new(SystemInner {
                config,
                registry,
                syscalls,
                hooks: RwLock::new(Vec::new()),
                listeners: RwLock::new(LifecycleListeners::new()),
                name_locks: DashMap::new(),
                registration: Mutex::new(()),
            }),
        }
    }

    /// Get the system configuration.
    pub fn config(&self) -> &SystemConfig {
        &self.inner.config
    }

    /// Get the plug registry.
    pub fn registry(&self) -> &PlugRegistry {
        &self.inner.registry
    }

    /// Get the syscall registry.
    pub fn syscalls(&self) -> &SyscallRegistry {
        &self.inner.syscalls
    }

    /// Add a lifecycle event listener.
    ///
    /// Listeners run synchronously on the loading task and must not call
    /// back into `on_event`.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.write().on_event(listener);
    }

    /// Attach a hook. Plugs already loaded are installed into it.
    pub fn add_hook(&self, hook: Arc<dyn Hook>) {
        let _registration = self.inner.registration.lock();
        for plug in self.inner.registry.all() {
            match hook.check(plug.manifest()) {
                Ok(()) => hook.install(&plug),
                Err(e) => {
                    tracing::warn!(hook = hook.name(), plug = %plug.name(), error = %e, "plug not installed into hook");
                }
            }
        }
        tracing::debug!(hook = hook.name(), "hook added");
        self.inner.hooks.write().push(hook);
    }

    /// Number of attached hooks.
    pub fn hook_count(&self) -> usize {
        self.inner.hooks.read().len()
    }

    /// Hook bindings currently owned by `plug`, across every hook.
    pub fn registrations(&self, plug: &str) -> usize {
        self.inner
            .hooks
            .read()
            .iter()
            .map(|hook| hook.registrations(plug))
            .sum()
    }

    /// Register syscalls callable only by plugs granted every `required`
    /// namespace. An empty list makes them callable by every plug.
    pub fn register_syscalls<S: AsRef<str>>(&self, required: &[S], set: SyscallSet) -> Result<usize> {
        self.inner.syscalls.register(required, set)
    }

    /// Load `bundle` as plug `name`, replacing any plug of that name.
    ///
    /// Operations on the same name are serialized. A failed load leaves no
    /// trace of the new plug and is reported to listeners.
    pub async fn load(
        &self,
        name: &str,
        bundle: PlugBundle,
        factory: &dyn SandboxFactory,
    ) -> Result<PlugHandle> {
        let lock = self.inner.name_lock(name);
        let result = {
            let _guard = lock.lock().await;
            self.load_serialized(name, bundle, factory).await
        };
        self.inner.release_name_lock(name, lock);
        result
    }

    async fn load_serialized(
        &self,
        name: &str,
        bundle: PlugBundle,
        factory: &dyn SandboxFactory,
    ) -> Result<PlugHandle> {
        let started = Instant::now();
        match self.inner.load_locked(name, bundle, factory).await {
            Ok((plug, replaced)) => {
                tracing::info!(
                    plug = %name,
                    version = %plug.version(),
                    id = plug.id(),
                    replaced,
                    elapsed = ?started.elapsed(),
                    "plug loaded"
                );
                self.inner
                    .listeners
                    .read()
                    .emit_loaded(name, plug.version(), replaced);
                #[cfg(feature = "metrics-prometheus")]
                if let Some(ref metrics) = self.inner.config.metrics {
                    metrics.record_load(started.elapsed().as_secs_f64());
                }
                Ok(plug)
            }
            Err(e) => {
                tracing::error!(plug = %name, error = %e, "plug failed to load");
                self.inner
                    .listeners
                    .read()
                    .emit_load_failed(name, &e.to_string());
                #[cfg(feature = "metrics-prometheus")]
                if let Some(ref metrics) = self.inner.config.metrics {
                    metrics.record_load_failure();
                }
                Err(e)
            }
        }
    }

    /// Load a manifest under its own name.
    pub async fn load_manifest(
        &self,
        manifest: Manifest,
        factory: &dyn SandboxFactory,
    ) -> Result<PlugHandle> {
        let name = manifest.name.clone();
        self.load(&name, PlugBundle::new(manifest), factory).await
    }

    /// Unload `name`: remove its hook bindings, then stop its sandbox.
    ///
    /// Returns whether a plug was unloaded; unknown names are a no-op.
    pub async fn unload(&self, name: &str) -> bool {
        let lock = self.inner.name_lock(name);
        let unloaded = {
            let _guard = lock.lock().await;
            self.inner.unload_locked(name).await
        };
        self.inner.release_name_lock(name, lock);
        unloaded
    }

    /// Run syscall `name` on behalf of `ctx.plug`.
    pub async fn syscall_with_context(
        &self,
        ctx: &SyscallContext,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.inner.syscall_with_context(ctx, name, args).await
    }

    /// Run syscall `name` on behalf of `plug`.
    pub async fn syscall(&self, plug: &str, name: &str, args: Vec<Value>) -> Result<Value> {
        self.syscall_with_context(&SyscallContext::new(plug), name, args)
            .await
    }

    /// Invoke `function` of plug `name`.
    pub async fn invoke(&self, name: &str, function: &str, args: Vec<Value>) -> Result<Value> {
        let plug = self.get(name).ok_or_else(|| Error::plug_not_found(name))?;

        let started = Instant::now();
        let result = plug.invoke(function, args).await;
        #[cfg(feature = "metrics-prometheus")]
        if let Some(ref metrics) = self.inner.config.metrics {
            metrics.record_invoke(name, started.elapsed().as_secs_f64(), result.is_err());
        }
        tracing::trace!(plug = %name, function, elapsed = ?started.elapsed(), "invoked");
        result
    }

    /// Get a plug by name.
    pub fn get(&self, name: &str) -> Option<PlugHandle> {
        self.inner.registry.get(name)
    }

    /// Check if a plug is loaded.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.inner.registry.contains(name)
    }

    /// Names of loaded plugs, sorted.
    pub fn plug_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Snapshot of every loaded plug.
    pub fn plugs(&self) -> Vec<PlugInfo> {
        self.inner.registry.info()
    }

    /// Get plug count.
    pub fn plug_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    /// Follow a plug source: load and unload plugs as it reports them.
    ///
    /// Events for the same name are applied strictly in order, each settling
    /// before the next starts. The returned task ends once the source is
    /// closed and every queued event has been applied.
    pub fn attach_source(
        &self,
        mut stream: PlugSourceStream,
        factory: Arc<dyn SandboxFactory>,
    ) -> JoinHandle<()> {
        let mut queues = SourceQueues::new(self.clone(), factory);
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                queues.push(event);
            }
            queues.finish().await;
            tracing::debug!("plug source closed");
        })
    }

    /// Unload every plug.
    pub async fn shutdown(&self) {
        for name in self.plug_names() {
            self.unload(&name).await;
        }
        tracing::info!("system shut down");
    }
}

struct SourceQueue {
    events: mpsc::UnboundedSender<PlugSourceEvent>,
    applier: JoinHandle<()>,
}

/// Per-name queues of source events, each drained by its own applier task.
///
/// An applier exits as soon as its queue runs dry; the next event for that
/// name starts a fresh applier that first waits for the previous one.
struct SourceQueues {
    system: System,
    factory: Arc<dyn SandboxFactory>,
    queues: HashMap<String, SourceQueue>,
}

impl SourceQueues {
    fn new(system: System, factory: Arc<dyn SandboxFactory>) -> Self {
        Self {
            system,
            factory,
            queues: HashMap::new(),
        }
    }

    fn push(&mut self, event: PlugSourceEvent) {
        self.prune();

        let name = event.name().to_string();
        let event = match self.queues.get(&name) {
            Some(queue) => match queue.events.send(event) {
                Ok(()) => return,
                // The applier closed its queue and is finishing up.
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let previous = self.queues.remove(&name).map(|queue| queue.applier);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = tx.send(event) {
            tracing::warn!(plug = %e.0.name(), "plug source event dropped");
            return;
        }
        let applier = tokio::spawn(apply_source_events(
            self.system.clone(),
            previous,
            rx,
            self.factory.clone(),
        ));
        self.queues.insert(
            name,
            SourceQueue {
                events: tx,
                applier,
            },
        );
    }

    fn prune(&mut self) {
        self.queues.retain(|_, queue| !queue.applier.is_finished());
    }

    fn len(&self) -> usize {
        self.queues.len()
    }

    async fn finish(self) {
        for (name, queue) in self.queues {
            drop(queue.events);
            if let Err(e) = queue.applier.await {
                tracing::error!(plug = %name, error = %e, "plug source applier failed");
            }
        }
    }
}

async fn apply_source_events(
    system: System,
    previous: Option<JoinHandle<()>>,
    mut events: mpsc::UnboundedReceiver<PlugSourceEvent>,
    factory: Arc<dyn SandboxFactory>,
) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            tracing::error!(error = %e, "plug source applier failed");
        }
    }

    loop {
        let event = match events.try_recv() {
            Ok(event) => event,
            Err(_) => {
                // Refuse new events, then apply whatever slipped in.
                events.close();
                match events.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                }
            }
        };
        match event {
            PlugSourceEvent::Loaded { name, bundle } => {
                // Failures are logged and reported to listeners by `load`.
                system.load(&name, bundle, factory.as_ref()).await.ok();
            }
            PlugSourceEvent::Unloaded { name } => {
                system.unload(&name).await;
            }
        }
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new(SystemConfig::default())
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("plug_count", &self.inner.registry.len())
            .field("syscall_count", &self.inner.syscalls.len())
            .field("hook_count", &self.hook_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleEvent;
    use crate::manifest::ManifestBuilder;
    use crate::sandbox::{FunctionTable, WorkerSandboxFactory};
    use crate::syscall::syscall_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn factory() -> WorkerSandboxFactory {
        WorkerSandboxFactory::new().with_module(
            "echo",
            FunctionTable::new()
                .function("echo", |args, _| Ok(args.into_iter().next().unwrap_or(Value::Null)))
                .function("read", |args, ctx| ctx.syscall("fs.read", args)),
        )
    }

    fn echo(name: &str) -> Manifest {
        ManifestBuilder::new(name)
            .module("echo")
            .function("echo")
            .function("read")
            .build_unchecked()
    }

    #[test]
    fn test_grant_policy() {
        let manifest = ManifestBuilder::new("reader").requires("fs").build_unchecked();

        assert!(GrantPolicy::AllDeclared.grant(&manifest).unwrap().contains("fs"));
        assert!(matches!(
            GrantPolicy::DenyAll.grant(&manifest),
            Err(Error::PermissionDenied { .. })
        ));
        assert!(GrantPolicy::only().allow("reader", "fs").grant(&manifest).is_ok());
        assert!(GrantPolicy::only().allow("other", "fs").grant(&manifest).is_err());
        assert!(GrantPolicy::DenyAll.grant(&echo("bare")).unwrap().is_empty());
    }

    #[test]
    fn test_config_builder() {
        let config = SystemConfig::new()
            .with_max_plugs(3)
            .with_endpoint_prefix("/plug")
            .with_grants(GrantPolicy::DenyAll);
        assert_eq!(config.max_plugs, 3);
        assert_eq!(config.endpoint_prefix, "/plug");
        assert_eq!(config.grants, GrantPolicy::DenyAll);
        assert!(config.warn_on_syscall_override);
    }

    #[test]
    fn test_syscall_override_warnings_configurable() {
        assert!(System::default().syscalls().warns_on_override());

        let quiet = System::new(SystemConfig::new().with_syscall_override_warnings(false));
        assert!(!quiet.syscalls().warns_on_override());
    }

    #[tokio::test]
    async fn test_name_locks_released() {
        let system = System::default();
        let factory = factory();

        system.load_manifest(echo("a"), &factory).await.unwrap();
        assert!(system.inner.name_locks.is_empty());
        system.unload("a").await;
        system.unload("never-loaded").await;
        assert!(system.inner.name_locks.is_empty());
    }

    #[tokio::test]
    async fn test_idle_source_queues_are_dropped() {
        let system = System::default();
        let factory: Arc<dyn SandboxFactory> = Arc::new(factory());
        let mut queues = SourceQueues::new(system.clone(), factory);

        let v1 = ManifestBuilder::new("a").module("echo").version("1.0.0").build_unchecked();
        queues.push(PlugSourceEvent::Loaded {
            name: "a".into(),
            bundle: PlugBundle::new(v1),
        });
        assert_eq!(queues.len(), 1);

        let idle = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                queues.prune();
                if queues.len() == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(idle.is_ok(), "applier never went idle");
        assert!(system.is_loaded("a"));

        // A later burst for the same name still applies in order.
        let v2 = ManifestBuilder::new("a").module("echo").version("2.0.0").build_unchecked();
        queues.push(PlugSourceEvent::Unloaded { name: "a".into() });
        queues.push(PlugSourceEvent::Loaded {
            name: "a".into(),
            bundle: PlugBundle::new(v2),
        });
        queues.finish().await;
        assert_eq!(system.get("a").unwrap().version(), "2.0.0");
        assert!(system.inner.name_locks.is_empty());
    }

    #[tokio::test]
    async fn test_load_invoke_unload() {
        let system = System::default();
        let factory = factory();

        system.load_manifest(echo("a"), &factory).await.unwrap();
        assert!(system.is_loaded("a"));
        assert_eq!(
            system.invoke("a", "echo", vec![json!(7)]).await.unwrap(),
            json!(7)
        );

        assert!(system.unload("a").await);
        assert!(!system.unload("a").await);
        assert!(matches!(
            system.invoke("a", "echo", vec![]).await,
            Err(Error::PlugNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_name_mismatch_rejected() {
        let system = System::default();
        let err = system
            .load("b", PlugBundle::new(echo("a")), &factory())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidManifest(_)));
        assert_eq!(system.plug_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_module_fails_load_only() {
        let system = System::default();
        let factory = factory();
        system.load_manifest(echo("a"), &factory).await.unwrap();

        let orphan = ManifestBuilder::new("orphan").module("nothing").build_unchecked();
        let err = system.load_manifest(orphan, &factory).await.unwrap_err();
        assert!(matches!(err, Error::SandboxUnavailable(_)));
        assert!(system.is_loaded("a"));
        assert!(!system.is_loaded("orphan"));
        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_syscall_errors() {
        let system = System::default();
        system
            .register_syscalls(
                &["fs"],
                SyscallSet::new().with("fs.read", syscall_fn(|_, _| async { Ok(json!("data")) })),
            )
            .unwrap();
        system.load_manifest(echo("a"), &factory()).await.unwrap();

        assert!(matches!(
            system.syscall("ghost", "fs.read", vec![]).await,
            Err(Error::PlugNotFound(_))
        ));
        assert!(matches!(
            system.syscall("a", "fs.nope", vec![]).await,
            Err(Error::SyscallNotFound(_))
        ));
        assert!(matches!(
            system.syscall("a", "fs.read", vec![]).await,
            Err(Error::PermissionDenied { .. })
        ));
        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let system = System::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        system.on_event(move |event| seen_clone.lock().push(event.event_name()));

        let factory = factory();
        system.load_manifest(echo("a"), &factory).await.unwrap();
        system.load_manifest(echo("a"), &factory).await.unwrap();
        system.unload("a").await;

        assert_eq!(*seen.lock(), vec!["loaded", "unloaded", "reloaded", "unloaded"]);
    }

    #[tokio::test]
    async fn test_capacity() {
        let system = System::new(SystemConfig::new().with_max_plugs(1));
        let factory = factory();
        system.load_manifest(echo("a"), &factory).await.unwrap();
        assert!(matches!(
            system.load_manifest(echo("b"), &factory).await,
            Err(Error::Registry(_))
        ));
        // Reloading the same name needs no extra room.
        system.load_manifest(echo("a"), &factory).await.unwrap();
        system.shutdown().await;
        assert_eq!(system.plug_count(), 0);
    }

    struct CountingHook {
        installs: AtomicUsize,
        uninstalls: AtomicUsize,
    }

    impl Hook for CountingHook {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn install(&self, _: &PlugHandle) {
            self.installs.fetch_add(1, Ordering::SeqCst);
        }

        fn uninstall(&self, _: &str) {
            self.uninstalls.fetch_add(1, Ordering::SeqCst);
        }

        fn registrations(&self, _: &str) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_add_hook_installs_loaded_plugs() {
        let system = System::default();
        let factory = factory();
        system.load_manifest(echo("a"), &factory).await.unwrap();

        let hook = Arc::new(CountingHook {
            installs: AtomicUsize::new(0),
            uninstalls: AtomicUsize::new(0),
        });
        system.add_hook(hook.clone());
        assert_eq!(hook.installs.load(Ordering::SeqCst), 1);

        system.load_manifest(echo("b"), &factory).await.unwrap();
        assert_eq!(hook.installs.load(Ordering::SeqCst), 2);

        system.shutdown().await;
        assert_eq!(hook.uninstalls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_load_failed_event() {
        let system = System::new(SystemConfig::new().with_grants(GrantPolicy::DenyAll));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let failures_clone = failures.clone();
        system.on_event(move |event| {
            if let LifecycleEvent::LoadFailed { name, .. } = event {
                failures_clone.lock().push(name.clone());
            }
        });

        let manifest = ManifestBuilder::new("reader")
            .module("echo")
            .requires("fs")
            .build_unchecked();
        assert!(system.load_manifest(manifest, &factory()).await.is_err());
        assert_eq!(*failures.lock(), vec!["reader".to_string()]);
    }
}
