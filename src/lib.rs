//! # plugos-runtime
//!
//! Host runtime for sandboxed plugs: third-party code units that reach the
//! host only through permission-gated syscalls.
//!
//! This crate provides:
//! - **System** - Single authority over plug load, unload and hot reload
//! - **Sandboxes** - Plug code isolated behind a message protocol with timeouts and budgets
//! - **Syscall Registry** - `namespace.function` host calls gated by namespace grants
//! - **Hooks** - Event fan-out, HTTP-style endpoints and scheduled invocations
//! - **Plug Sources** - Load and unload driven by notifications, e.g. a directory watcher
//! - **Gateway** - Transport-agnostic plug, syscall and page routes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plugos_runtime::{
//!     FunctionTable, ManifestBuilder, StandardHooks, System, SystemConfig, WorkerSandboxFactory,
//! };
//! use serde_json::json;
//!
//! let system = System::new(SystemConfig::default());
//! let hooks = StandardHooks::attach(&system)?;
//!
//! let factory = WorkerSandboxFactory::new().with_module(
//!     "greeter",
//!     FunctionTable::new().function("hello", |args, _| {
//!         Ok(json!(format!("Hello, {}", args[0]["name"].as_str().unwrap_or("stranger"))))
//!     }),
//! );
//!
//! let manifest = ManifestBuilder::new("greeter").on_event("hello", "user:join").build()?;
//! system.load_manifest(manifest, &factory).await?;
//!
//! let outcomes = hooks.events.dispatch_event_collect("user:join", json!({"name": "Ada"})).await;
//! ```
//!
//! ## Feature Flags
//!
//! - `toml` (default): TOML manifests and `*.plug.toml` bundles
//! - `watch`: Directory watching for hot reload
//! - `metrics-prometheus`: Prometheus metrics integration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod error;
mod gateway;
mod lifecycle;
mod loader;
mod manifest;
mod plug;
mod registry;
mod source;
mod syscall;
mod system;

pub mod hooks;
pub mod sandbox;
pub mod syscalls;

#[cfg(feature = "watch")]
mod watcher;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use error::{Error, Result};
pub use gateway::{GatewayResponse, PlugGateway};
pub use hooks::{
    CronHook, EndpointHook, EndpointRequest, EndpointResponse, EventHook, EventOutcome, Hook,
    IntervalParser, StandardHooks,
};
pub use lifecycle::{LifecycleEvent, LifecycleListeners, LifecycleState};
pub use loader::{BundleLoader, LoaderConfig, PlugBundle};
pub use manifest::{EndpointDef, FunctionDef, Manifest, ManifestBuilder};
pub use plug::{Plug, PlugHandle, PlugInfo};
pub use registry::{PlugRegistry, RegistryStats};
pub use sandbox::{
    FunctionTable, PlugContext, PlugModule, Sandbox, SandboxFactory, SandboxLimits, SyscallBridge,
    WorkerSandboxFactory,
};
pub use source::{plug_source, PlugSource, PlugSourceEvent, PlugSourceStream};
pub use syscall::{syscall_fn, FnSyscall, Syscall, SyscallContext, SyscallKey, SyscallRegistry, SyscallSet};
pub use system::{GrantPolicy, System, SystemConfig};

#[cfg(feature = "watch")]
pub use watcher::{PlugWatcher, WatchConfig};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{MetricsConfig, PlugMetrics};

pub use serde_json::Value;

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
