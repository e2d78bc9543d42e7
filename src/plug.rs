//! Loaded plugs.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleState;
use crate::manifest::Manifest;
use crate::sandbox::Sandbox;

static NEXT_PLUG_ID: AtomicU64 = AtomicU64::new(1);

/// Snapshot of a loaded plug.
#[derive(Debug, Clone)]
pub struct PlugInfo {
    /// Unique instance ID; a reload yields a new ID.
    pub id: u64,
    /// Plug name from manifest.
    pub name: String,
    /// Plug version from manifest.
    pub version: String,
    /// Namespaces granted at load time, sorted.
    pub granted: Vec<String>,
    /// When this instance was loaded.
    pub loaded_at: Instant,
    /// Total invocation count.
    pub invocation_count: u64,
    /// Invocations that returned an error.
    pub failure_count: u64,
    /// Current lifecycle state.
    pub state: LifecycleState,
}

/// A loaded plug: its manifest, grants and the sandbox running its code.
pub struct Plug {
    id: u64,
    manifest: Manifest,
    granted: HashSet<String>,
    sandbox: Box<dyn Sandbox>,
    loaded_at: Instant,
    state: RwLock<LifecycleState>,
    invocations: AtomicU64,
    failures: AtomicU64,
}

impl Plug {
    pub(crate) fn new(manifest: Manifest, granted: HashSet<String>, sandbox: Box<dyn Sandbox>) -> Self {
        Self {
            id: NEXT_PLUG_ID.fetch_add(1, Ordering::Relaxed),
            manifest,
            granted,
            sandbox,
            loaded_at: Instant::now(),
            state: RwLock::new(LifecycleState::Running),
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Instance ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Plug name.
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Plug version.
    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// Manifest this plug was loaded from.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Namespaces granted to this plug.
    pub fn granted(&self) -> &HashSet<String> {
        &self.granted
    }

    /// Check a namespace grant.
    pub fn is_granted(&self, ns: &str) -> bool {
        self.granted.contains(ns)
    }

    /// Current lifecycle state.
    ///
    /// A plug whose sandbox was terminated under it (timeout, budget
    /// overrun) reports [`LifecycleState::Failed`] until it is unloaded.
    pub fn state(&self) -> LifecycleState {
        let state = *self.state.read();
        if state == LifecycleState::Running && !self.sandbox.is_running() {
            return LifecycleState::Failed;
        }
        state
    }

    /// Snapshot of this plug.
    pub fn info(&self) -> PlugInfo {
        let mut granted: Vec<String> = self.granted.iter().cloned().collect();
        granted.sort();
        PlugInfo {
            id: self.id,
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            granted,
            loaded_at: self.loaded_at,
            invocation_count: self.invocations.load(Ordering::Relaxed),
            failure_count: self.failures.load(Ordering::Relaxed),
            state: self.state(),
        }
    }

    /// Invoke an exported function inside the sandbox.
    pub async fn invoke(&self, function: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke_nested(function, args, Vec::new()).await
    }

    /// Invoke on behalf of `callers`, the plugs blocked on this invocation.
    pub async fn invoke_nested(
        &self,
        function: &str,
        args: Vec<Value>,
        callers: Vec<String>,
    ) -> Result<Value> {
        let state = self.state();
        if !state.can_call() {
            return Err(Error::SandboxStopped);
        }
        if !self.manifest.exports(function) {
            return Err(Error::FunctionNotFound(format!("{}.{}", self.name(), function)));
        }

        self.invocations.fetch_add(1, Ordering::Relaxed);
        let result = self.sandbox.invoke_nested(function, args, callers).await;
        if let Err(ref e) = result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(plug = %self.name(), function, error = %e, "invocation failed");
        }
        result
    }

    /// Refuse new calls and release the sandbox.
    pub(crate) async fn shutdown(&self) {
        *self.state.write() = LifecycleState::Stopping;
        self.sandbox.stop().await;
        *self.state.write() = LifecycleState::Unloaded;
    }

    /// Whether the sandbox still runs.
    pub fn sandbox_running(&self) -> bool {
        self.sandbox.is_running()
    }
}

impl std::fmt::Debug for Plug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plug")
            .field("id", &self.id)
            .field("name", &self.manifest.name)
            .field("version", &self.manifest.version)
            .field("state", &self.state())
            .finish()
    }
}

/// Shared handle to a loaded plug.
#[derive(Clone)]
pub struct PlugHandle {
    plug: Arc<Plug>,
}

impl PlugHandle {
    pub(crate) fn new(plug: Plug) -> Self {
        Self {
            plug: Arc::new(plug),
        }
    }

    /// Whether both handles refer to the same instance.
    pub fn same_instance(&self, other: &PlugHandle) -> bool {
        Arc::ptr_eq(&self.plug, &other.plug)
    }
}

impl Deref for PlugHandle {
    type Target = Plug;

    fn deref(&self) -> &Plug {
        &self.plug
    }
}

impl std::fmt::Debug for PlugHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlugHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
