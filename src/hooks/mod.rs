//! Hooks bind plug functions to host-triggered occurrences.
//!
//! The system holds hooks only as [`Hook`] trait objects and never inspects
//! their concrete type. Every hook keeps its own registration table keyed by
//! plug name, so a plug's bindings can be removed as a unit.

mod cron;
mod endpoint;
mod event;

use std::sync::Arc;

use crate::error::Result;
use crate::manifest::Manifest;
use crate::plug::PlugHandle;
use crate::system::System;

pub use cron::{CronHook, IntervalParser, Schedule, ScheduleParser};
pub use endpoint::{EndpointHook, EndpointRequest, EndpointResponse};
pub use event::{EventDispatch, EventHook, EventOutcome};

/// A plug-in point into the system.
///
/// `check` and `install` run back to back under the system's registration
/// lock; `install` is only called when `check` succeeded for every hook.
pub trait Hook: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Static problems with `manifest` as seen by this hook.
    fn validate_manifest(&self, _manifest: &Manifest) -> Vec<String> {
        Vec::new()
    }

    /// Verify `manifest`'s bindings could be installed now.
    fn check(&self, _manifest: &Manifest) -> Result<()> {
        Ok(())
    }

    /// Install the bindings of a freshly loaded plug.
    fn install(&self, plug: &PlugHandle);

    /// Remove every binding owned by `plug`. Unknown names are ignored.
    fn uninstall(&self, plug: &str);

    /// Number of bindings currently owned by `plug`.
    fn registrations(&self, plug: &str) -> usize;
}

/// The event, endpoint and cron hooks, attached together.
#[derive(Debug, Clone)]
pub struct StandardHooks {
    /// Event fan-out.
    pub events: Arc<EventHook>,
    /// Routes beneath the system's endpoint prefix.
    pub endpoints: Arc<EndpointHook>,
    /// Scheduled invocations.
    pub cron: Arc<CronHook>,
}

impl StandardHooks {
    /// Create the standard hooks, attach them to `system` and register the
    /// `event.*` syscalls.
    pub fn attach(system: &System) -> Result<Self> {
        let hooks = Self {
            events: Arc::new(EventHook::new()),
            endpoints: Arc::new(EndpointHook::new(system.config().endpoint_prefix.clone())),
            cron: Arc::new(CronHook::new()),
        };
        system.register_syscalls::<&str>(&[], hooks.events.syscalls())?;
        system.add_hook(hooks.events.clone());
        system.add_hook(hooks.endpoints.clone());
        system.add_hook(hooks.cron.clone());
        Ok(hooks)
    }
}
