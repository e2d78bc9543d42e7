//! Syscall registry and the namespace permission model.
//!
//! Syscalls are named `namespace.function` and registered together with the
//! set of namespaces a plug must have been granted to call them. An empty
//! requirement list makes a syscall available to every plug.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;

use crate::error::{Error, Result};

/// Identity attached to every syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallContext {
    /// Name of the calling plug.
    pub plug: String,
    /// Plugs whose invocations are waiting on the caller's, outermost first.
    pub callers: Vec<String>,
}

impl SyscallContext {
    /// Create a context for a plug.
    pub fn new(plug: impl Into<String>) -> Self {
        Self {
            plug: plug.into(),
            callers: Vec::new(),
        }
    }

    /// Set the plugs waiting on this call.
    pub fn with_callers(mut self, callers: Vec<String>) -> Self {
        self.callers = callers;
        self
    }

    /// Every plug with an invocation in flight on this path, caller last.
    pub fn chain(&self) -> Vec<String> {
        let mut chain = self.callers.clone();
        chain.push(self.plug.clone());
        chain
    }

    /// Whether `plug` is busy somewhere on this path.
    pub fn involves(&self, plug: &str) -> bool {
        self.plug == plug || self.callers.iter().any(|c| c == plug)
    }
}

/// A host-implemented function callable by plugs.
#[async_trait]
pub trait Syscall: Send + Sync + 'static {
    /// Run the syscall for `ctx.plug` with positional `args`.
    async fn call(&self, ctx: &SyscallContext, args: Vec<Value>) -> Result<Value>;

    /// Whether concurrent calls from the same plug may overlap.
    ///
    /// Non-reentrant syscalls are serialized per calling plug.
    fn reentrant(&self) -> bool {
        true
    }
}

/// [`Syscall`] backed by an async closure.
pub struct FnSyscall<F> {
    f: F,
    reentrant: bool,
}

impl<F> FnSyscall<F> {
    /// Mark the syscall as not reentrant-safe.
    pub fn exclusive(mut self) -> Self {
        self.reentrant = false;
        self
    }
}

/// Wrap an async closure as a syscall.
pub fn syscall_fn<F, Fut>(f: F) -> FnSyscall<F>
where
    F: Fn(SyscallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    FnSyscall { f, reentrant: true }
}

#[async_trait]
impl<F, Fut> Syscall for FnSyscall<F>
where
    F: Fn(SyscallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, ctx: &SyscallContext, args: Vec<Value>) -> Result<Value> {
        (self.f)(ctx.clone(), args).await
    }

    fn reentrant(&self) -> bool {
        self.reentrant
    }
}

/// Composite registry key: `(namespace, function)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyscallKey {
    /// Namespace part, before the first dot.
    pub namespace: String,
    /// Function part, after the first dot.
    pub function: String,
}

impl SyscallKey {
    /// Split a `namespace.function` name.
    pub fn parse(name: &str) -> Option<Self> {
        let (namespace, function) = name.split_once('.')?;
        if namespace.is_empty() || function.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            function: function.to_string(),
        })
    }
}

impl fmt::Display for SyscallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.function)
    }
}

/// A named group of syscalls registered together.
#[derive(Default)]
pub struct SyscallSet {
    entries: Vec<(String, Arc<dyn Syscall>)>,
}

impl SyscallSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a syscall under its full `namespace.function` name.
    pub fn with(mut self, name: impl Into<String>, syscall: impl Syscall) -> Self {
        self.entries.push((name.into(), Arc::new(syscall)));
        self
    }

    /// Add an already shared syscall.
    pub fn with_shared(mut self, name: impl Into<String>, syscall: Arc<dyn Syscall>) -> Self {
        self.entries.push((name.into(), syscall));
        self
    }

    /// Names in this set.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Number of syscalls in this set.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for SyscallSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallSet")
            .field("names", &self.names())
            .finish()
    }
}

struct SyscallEntry {
    required: Vec<String>,
    implementation: Arc<dyn Syscall>,
    // Per-plug gates, only used for non-reentrant implementations.
    gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SyscallEntry {
    fn gate(&self, plug: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .entry(plug.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Registry mapping `(namespace, function)` to host implementations.
pub struct SyscallRegistry {
    entries: DashMap<SyscallKey, Arc<SyscallEntry>>,
    warn_on_override: bool,
}

impl SyscallRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            warn_on_override: true,
        }
    }

    /// Control whether overriding an existing syscall is logged as a warning.
    pub fn with_override_warnings(mut self, warn: bool) -> Self {
        self.warn_on_override = warn;
        self
    }

    /// Whether overriding an existing syscall is logged as a warning.
    pub fn warns_on_override(&self) -> bool {
        self.warn_on_override
    }

    /// Register every syscall of `set` behind `required` namespaces.
    ///
    /// Registering a name twice replaces the earlier implementation.
    pub fn register<S: AsRef<str>>(&self, required: &[S], set: SyscallSet) -> Result<usize> {
        let required: Vec<String> = required.iter().map(|s| s.as_ref().to_string()).collect();

        // Reject the whole set before touching the table.
        let mut keyed = Vec::with_capacity(set.entries.len());
        for (name, implementation) in set.entries {
            let key = SyscallKey::parse(&name).ok_or_else(|| {
                Error::Registry(format!("syscall name must be namespace.function: {:?}", name))
            })?;
            keyed.push((key, implementation));
        }

        let count = keyed.len();
        for (key, implementation) in keyed {
            let entry = Arc::new(SyscallEntry {
                required: required.clone(),
                implementation,
                gates: DashMap::new(),
            });
            if self.entries.insert(key.clone(), entry).is_some() {
                if self.warn_on_override {
                    tracing::warn!(syscall = %key, "syscall re-registered, previous implementation replaced");
                } else {
                    tracing::debug!(syscall = %key, "syscall re-registered");
                }
            }
        }
        Ok(count)
    }

    /// Required namespaces of a syscall.
    pub fn required_namespaces(&self, name: &str) -> Option<Vec<String>> {
        let key = SyscallKey::parse(name)?;
        self.entries.get(&key).map(|e| e.required.clone())
    }

    /// Check if a syscall is registered.
    pub fn contains(&self, name: &str) -> bool {
        SyscallKey::parse(name)
            .map(|k| self.entries.contains_key(&k))
            .unwrap_or(false)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().to_string()).collect();
        names.sort();
        names
    }

    /// Number of registered syscalls.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no syscall is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `name` and verify `granted` covers its requirements.
    fn authorize(
        &self,
        ctx: &SyscallContext,
        granted: &HashSet<String>,
        name: &str,
    ) -> Result<Arc<SyscallEntry>> {
        let entry = SyscallKey::parse(name)
            .and_then(|key| self.entries.get(&key).map(|e| e.value().clone()))
            .ok_or_else(|| Error::syscall_not_found(name))?;

        if let Some(missing) = entry.required.iter().find(|ns| !granted.contains(*ns)) {
            tracing::warn!(plug = %ctx.plug, syscall = %name, namespace = %missing, "syscall denied");
            return Err(Error::permission_denied(&ctx.plug, missing));
        }
        Ok(entry)
    }

    /// Call `name` on behalf of `ctx.plug`, whose grants are `granted`.
    ///
    /// Host failures, including panics, come back as errors.
    pub async fn dispatch(
        &self,
        ctx: &SyscallContext,
        granted: &HashSet<String>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let entry = self.authorize(ctx, granted, name)?;
        tracing::trace!(plug = %ctx.plug, syscall = %name, "syscall");

        let _guard = if entry.implementation.reentrant() {
            None
        } else {
            Some(entry.gate(&ctx.plug).lock_owned().await)
        };

        match AssertUnwindSafe(entry.implementation.call(ctx, args))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(plug = %ctx.plug, syscall = %name, "syscall implementation panicked");
                Err(Error::syscall(format!("syscall {} panicked", name)))
            }
        }
    }

    /// Drop per-plug state held for `plug`.
    pub fn forget_plug(&self, plug: &str) {
        for entry in self.entries.iter() {
            entry.gates.remove(plug);
        }
    }
}

impl Default for SyscallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SyscallRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallRegistry")
            .field("syscall_count", &self.entries.len())
            .finish()
    }
}
