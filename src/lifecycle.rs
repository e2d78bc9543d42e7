//! Plug lifecycle states and observers.

use std::time::Instant;

/// Plug lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Sandbox running; the plug accepts calls.
    Running,
    /// Sandbox terminated under a loaded plug; calls fail until it is
    /// reloaded or unloaded.
    Failed,
    /// Teardown in progress; new calls are refused.
    Stopping,
    /// Sandbox released.
    Unloaded,
}

impl LifecycleState {
    /// Check if the plug can be called.
    pub fn can_call(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if the plug is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unloaded)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
            Self::Unloaded => "unloaded",
        };
        write!(f, "{}", name)
    }
}

/// Something that happened to a plug.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Plug loaded for the first time under this name.
    Loaded {
        /// Plug name.
        name: String,
        /// Plug version.
        version: String,
        /// Load time.
        at: Instant,
    },
    /// Plug replaced a previous instance of the same name.
    Reloaded {
        /// Plug name.
        name: String,
        /// New version.
        version: String,
        /// Reload time.
        at: Instant,
    },
    /// Plug unloaded and its sandbox released.
    Unloaded {
        /// Plug name.
        name: String,
        /// Unload time.
        at: Instant,
    },
    /// Plug failed to load; the system keeps serving other plugs.
    LoadFailed {
        /// Plug name.
        name: String,
        /// Error message.
        message: String,
        /// Failure time.
        at: Instant,
    },
}

impl LifecycleEvent {
    /// Get the plug name.
    pub fn plug_name(&self) -> &str {
        match self {
            Self::Loaded { name, .. }
            | Self::Reloaded { name, .. }
            | Self::Unloaded { name, .. }
            | Self::LoadFailed { name, .. } => name,
        }
    }

    /// Get the event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Loaded { .. } => "loaded",
            Self::Reloaded { .. } => "reloaded",
            Self::Unloaded { .. } => "unloaded",
            Self::LoadFailed { .. } => "load_failed",
        }
    }
}

type Listener = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Observers of lifecycle events.
#[derive(Default)]
pub struct LifecycleListeners {
    listeners: Vec<Listener>,
}

impl LifecycleListeners {
    /// Create an empty listener list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener.
    pub fn on_event<F>(&mut self, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Notify every listener.
    pub fn emit(&self, event: LifecycleEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
    }

    /// Emit a loaded or reloaded event.
    pub fn emit_loaded(&self, name: &str, version: &str, replaced: bool) {
        let name = name.to_string();
        let version = version.to_string();
        let at = Instant::now();
        self.emit(if replaced {
            LifecycleEvent::Reloaded { name, version, at }
        } else {
            LifecycleEvent::Loaded { name, version, at }
        });
    }

    /// Emit an unloaded event.
    pub fn emit_unloaded(&self, name: &str) {
        self.emit(LifecycleEvent::Unloaded {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a load failure.
    pub fn emit_load_failed(&self, name: &str, message: &str) {
        self.emit(LifecycleEvent::LoadFailed {
            name: name.to_string(),
            message: message.to_string(),
            at: Instant::now(),
        });
    }
}

impl std::fmt::Debug for LifecycleListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleListeners")
            .field("listener_count", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_state_predicates() {
        assert!(LifecycleState::Running.can_call());
        assert!(!LifecycleState::Stopping.can_call());
        assert!(!LifecycleState::Failed.can_call());
        assert!(!LifecycleState::Failed.is_terminal());
        assert_eq!(LifecycleState::Failed.to_string(), "failed");
        assert!(LifecycleState::Unloaded.is_terminal());
        assert_eq!(LifecycleState::Stopping.to_string(), "stopping");
    }

    #[test]
    fn test_listeners() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let mut listeners = LifecycleListeners::new();
        listeners.on_event(move |_| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        listeners.emit_loaded("p", "1.0.0", false);
        listeners.emit_unloaded("p");
        listeners.emit_load_failed("p", "boom");

        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_event_info() {
        let event = LifecycleEvent::Reloaded {
            name: "greeter".to_string(),
            version: "2.0.0".to_string(),
            at: Instant::now(),
        };
        assert_eq!(event.plug_name(), "greeter");
        assert_eq!(event.event_name(), "reloaded");
    }
}
