//! Isolated execution contexts for plug code.
//!
//! A [`Sandbox`] is the only thing that runs plug code. It reaches the host
//! exclusively through its [`SyscallBridge`]; it never holds host resources.
//! Implementations are created by a [`SandboxFactory`], so the system does
//! not depend on any particular isolation backend.

mod module;
mod worker;

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::syscall::SyscallContext;

pub use module::{FunctionTable, PlugModule};
pub use worker::{PlugContext, WorkerSandbox, WorkerSandboxFactory};

/// Resource limits applied to every sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Maximum wall time of one invocation, syscalls included.
    pub invoke_timeout: Duration,
    /// How long `stop` waits for plug code to exit before detaching it.
    pub shutdown_grace: Duration,
    /// Maximum syscalls a single invocation may issue.
    pub max_syscalls_per_invocation: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            invoke_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
            max_syscalls_per_invocation: 10_000,
        }
    }
}

impl SandboxLimits {
    /// Create default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the invocation timeout.
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the per-invocation syscall budget.
    pub fn with_max_syscalls(mut self, max: usize) -> Self {
        self.max_syscalls_per_invocation = max;
        self
    }
}

/// Host side receiver of syscalls issued from sandboxes.
#[async_trait]
pub trait SyscallHandler: Send + Sync {
    /// Execute `name` for the plug identified by `ctx`.
    async fn handle_syscall(
        &self,
        ctx: &SyscallContext,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value>;
}

struct Detached;

#[async_trait]
impl SyscallHandler for Detached {
    async fn handle_syscall(&self, _: &SyscallContext, _: &str, _: Vec<Value>) -> Result<Value> {
        Err(Error::SandboxStopped)
    }
}

/// A sandbox's only route to the host, bound to its plug's identity.
///
/// Holds the host weakly: once the host is gone every call fails with
/// [`Error::SandboxStopped`].
#[derive(Clone)]
pub struct SyscallBridge {
    ctx: SyscallContext,
    handler: Weak<dyn SyscallHandler>,
}

impl SyscallBridge {
    /// Bind `plug` to `handler`.
    pub fn new(plug: impl Into<String>, handler: Weak<dyn SyscallHandler>) -> Self {
        Self {
            ctx: SyscallContext::new(plug),
            handler,
        }
    }

    /// A bridge connected to nothing.
    pub fn detached(plug: impl Into<String>) -> Self {
        let handler: Weak<dyn SyscallHandler> = Weak::<Detached>::new();
        Self::new(plug, handler)
    }

    /// Name of the plug this bridge speaks for.
    pub fn plug(&self) -> &str {
        &self.ctx.plug
    }

    /// Issue a syscall to the host.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.call_from(&[], name, args).await
    }

    /// Issue a syscall made while `callers` wait on the current invocation.
    pub async fn call_from(
        &self,
        callers: &[String],
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let handler = self.handler.upgrade().ok_or(Error::SandboxStopped)?;
        if callers.is_empty() {
            handler.handle_syscall(&self.ctx, name, args).await
        } else {
            let ctx = self.ctx.clone().with_callers(callers.to_vec());
            handler.handle_syscall(&ctx, name, args).await
        }
    }
}

impl std::fmt::Debug for SyscallBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallBridge")
            .field("plug", &self.ctx.plug)
            .field("attached", &(self.handler.strong_count() > 0))
            .finish()
    }
}

/// An isolated execution context owned by exactly one plug.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run an exported function. Concurrent calls are queued, never overlapped.
    async fn invoke(&self, function: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke_nested(function, args, Vec::new()).await
    }

    /// Run an exported function on behalf of `callers`, the plugs whose
    /// invocations wait on this one. Syscalls it makes carry them along.
    async fn invoke_nested(
        &self,
        function: &str,
        args: Vec<Value>,
        callers: Vec<String>,
    ) -> Result<Value>;

    /// Stop the sandbox, aborting any in-flight call.
    ///
    /// Returns once isolation resources are released or the grace period
    /// has elapsed.
    async fn stop(&self);

    /// Whether the sandbox still accepts invocations.
    fn is_running(&self) -> bool;
}

/// Constructs sandboxes for freshly loaded plugs.
pub trait SandboxFactory: Send + Sync {
    /// Create and start a sandbox for `manifest`.
    ///
    /// Failing here means the plug cannot be loaded; it never affects other
    /// plugs.
    fn create(
        &self,
        manifest: &Manifest,
        bridge: SyscallBridge,
        limits: &SandboxLimits,
    ) -> Result<Box<dyn Sandbox>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_builder() {
        let limits = SandboxLimits::new()
            .with_invoke_timeout(Duration::from_millis(50))
            .with_shutdown_grace(Duration::from_millis(10))
            .with_max_syscalls(3);

        assert_eq!(limits.invoke_timeout, Duration::from_millis(50));
        assert_eq!(limits.shutdown_grace, Duration::from_millis(10));
        assert_eq!(limits.max_syscalls_per_invocation, 3);
    }

    #[tokio::test]
    async fn test_detached_bridge() {
        let bridge = SyscallBridge::detached("lonely");
        assert_eq!(bridge.plug(), "lonely");
        let err = bridge.call("space.listPages", vec![]).await.unwrap_err();
        assert_eq!(err, Error::SandboxStopped);
    }
}
