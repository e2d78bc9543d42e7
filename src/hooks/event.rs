//! Pub/sub fan-out of named events to plug handlers.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::plug::PlugHandle;
use crate::syscall::{syscall_fn, SyscallContext, SyscallSet};

use super::Hook;

/// Result of one handler for one dispatched event.
#[derive(Debug, Clone)]
pub struct EventOutcome {
    /// Plug owning the handler.
    pub plug: String,
    /// Handler function.
    pub function: String,
    /// What the handler returned.
    pub result: Result<Value>,
}

/// Lazy, single-use sequence of handler outcomes, in registration order.
pub type EventDispatch = BoxStream<'static, EventOutcome>;

#[derive(Clone)]
struct Registration {
    event: String,
    plug: PlugHandle,
    function: String,
}

/// Routes dispatched events to every plug function registered for them.
#[derive(Default)]
pub struct EventHook {
    registrations: RwLock<Vec<Registration>>,
}

impl EventHook {
    /// Create an event hook with no registrations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch `name` with `data` to every registered handler.
    ///
    /// Handlers run one after another when the stream is polled; a failing
    /// handler does not stop the rest.
    pub fn dispatch_event(&self, name: &str, data: Value) -> EventDispatch {
        self.dispatch_from(None, name, data)
    }

    /// Dispatch from inside a syscall made by `ctx`. Handlers owned by any
    /// plug on the invocation chain fail instead of waiting on a sandbox that
    /// is blocked on this very dispatch.
    pub fn dispatch_from(
        &self,
        ctx: Option<&SyscallContext>,
        name: &str,
        data: Value,
    ) -> EventDispatch {
        let handlers: Vec<Registration> = self
            .registrations
            .read()
            .iter()
            .filter(|r| r.event == name)
            .cloned()
            .collect();

        tracing::debug!(event = name, handlers = handlers.len(), "dispatching event");

        let ctx = ctx.cloned();
        stream::iter(handlers)
            .then(move |registration| {
                let data = data.clone();
                let ctx = ctx.clone();
                async move {
                    let result = match ctx {
                        Some(ref ctx) if ctx.involves(registration.plug.name()) => {
                            Err(Error::execution_failed(format!(
                                "plug {} is already handling this dispatch chain ({})",
                                registration.plug.name(),
                                ctx.chain().join(" -> ")
                            )))
                        }
                        Some(ref ctx) => {
                            registration
                                .plug
                                .invoke_nested(&registration.function, vec![data], ctx.chain())
                                .await
                        }
                        None => {
                            registration
                                .plug
                                .invoke(&registration.function, vec![data])
                                .await
                        }
                    };
                    if let Err(ref e) = result {
                        tracing::warn!(
                            event = %registration.event,
                            plug = %registration.plug.name(),
                            function = %registration.function,
                            error = %e,
                            "event handler failed"
                        );
                    }
                    EventOutcome {
                        plug: registration.plug.name().to_string(),
                        function: registration.function,
                        result,
                    }
                }
            })
            .boxed()
    }

    /// Dispatch and wait for every outcome.
    pub async fn dispatch_event_collect(&self, name: &str, data: Value) -> Vec<EventOutcome> {
        self.dispatch_event(name, data).collect().await
    }

    /// Every event name with at least one handler, sorted and deduplicated.
    pub fn listened_events(&self) -> Vec<String> {
        let mut events: Vec<String> = self
            .registrations
            .read()
            .iter()
            .map(|r| r.event.clone())
            .collect();
        events.sort();
        events.dedup();
        events
    }

    /// Number of handlers for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.event == event)
            .count()
    }

    /// Ungated `event.*` syscalls backed by this hook.
    ///
    /// `event.dispatch(name, data)` returns the successful handler results;
    /// `event.listEvents()` returns the names with handlers.
    pub fn syscalls(self: &Arc<Self>) -> SyscallSet {
        let dispatch_hook = Arc::clone(self);
        let list_hook = Arc::clone(self);

        SyscallSet::new()
            .with(
                "event.dispatch",
                syscall_fn(move |ctx, args| {
                    let hook = dispatch_hook.clone();
                    async move {
                        let name = args
                            .first()
                            .and_then(Value::as_str)
                            .ok_or_else(|| Error::syscall("event.dispatch: missing event name"))?
                            .to_string();
                        let data = args.get(1).cloned().unwrap_or(Value::Null);
                        let outcomes: Vec<EventOutcome> = hook
                            .dispatch_from(Some(&ctx), &name, data)
                            .collect()
                            .await;
                        let results: Vec<Value> =
                            outcomes.into_iter().filter_map(|o| o.result.ok()).collect();
                        Ok(Value::Array(results))
                    }
                }),
            )
            .with(
                "event.listEvents",
                syscall_fn(move |_, _| {
                    let hook = list_hook.clone();
                    async move { Ok(json!(hook.listened_events())) }
                }),
            )
    }
}

impl Hook for EventHook {
    fn name(&self) -> &'static str {
        "event"
    }

    fn install(&self, plug: &PlugHandle) {
        let mut registrations = self.registrations.write();
        for (event, function) in plug.manifest().event_bindings() {
            registrations.push(Registration {
                event: event.to_string(),
                plug: plug.clone(),
                function: function.to_string(),
            });
        }
    }

    fn uninstall(&self, plug: &str) {
        self.registrations.write().retain(|r| r.plug.name() != plug);
    }

    fn registrations(&self, plug: &str) -> usize {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.plug.name() == plug)
            .count()
    }
}

impl std::fmt::Debug for EventHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHook")
            .field("registration_count", &self.registrations.read().len())
            .finish()
    }
}
