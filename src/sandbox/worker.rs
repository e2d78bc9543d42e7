//! Thread-backed sandbox speaking a message protocol with the host.
//!
//! Each [`WorkerSandbox`] owns one OS thread running plug code. The host and
//! the worker share no memory: the host sends [`HostMessage`]s over a std
//! channel, the worker answers with [`WorkerMessage`]s over a tokio channel
//! drained by a pump task. A syscall is a `Syscall` message followed by the
//! worker blocking until the matching `SyscallResult` arrives.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::manifest::Manifest;

use super::{PlugModule, Sandbox, SandboxFactory, SandboxLimits, SyscallBridge};

#[derive(Debug)]
enum HostMessage {
    Invoke {
        id: u64,
        function: String,
        args: Vec<Value>,
    },
    SyscallResult {
        id: u64,
        result: Result<Value>,
    },
    Shutdown,
}

#[derive(Debug)]
enum WorkerMessage {
    Syscall {
        invocation: u64,
        id: u64,
        name: String,
        args: Vec<Value>,
    },
    Completed {
        id: u64,
        result: Result<Value>,
    },
}

struct WorkerState {
    inbound: std_mpsc::Receiver<HostMessage>,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    // Invocations that arrived while a syscall was awaiting its result.
    deferred: VecDeque<HostMessage>,
    next_syscall: u64,
    stopping: bool,
}

/// Plug code's view of its host during one invocation.
pub struct PlugContext<'a> {
    plug: &'a str,
    invocation: u64,
    state: &'a mut WorkerState,
}

impl PlugContext<'_> {
    /// Name of the plug being executed.
    pub fn plug(&self) -> &str {
        self.plug
    }

    /// Issue a syscall and block until the host answers.
    pub fn syscall(&mut self, name: &str, args: Vec<Value>) -> Result<Value> {
        if self.state.stopping {
            return Err(Error::SandboxStopped);
        }

        let id = self.state.next_syscall;
        self.state.next_syscall += 1;

        let sent = self.state.outbound.send(WorkerMessage::Syscall {
            invocation: self.invocation,
            id,
            name: name.to_string(),
            args,
        });
        if sent.is_err() {
            self.state.stopping = true;
            return Err(Error::SandboxStopped);
        }

        loop {
            match self.state.inbound.recv() {
                Ok(HostMessage::SyscallResult { id: reply, result }) if reply == id => return result,
                Ok(HostMessage::SyscallResult { .. }) => continue,
                Ok(message @ HostMessage::Invoke { .. }) => self.state.deferred.push_back(message),
                Ok(HostMessage::Shutdown) | Err(_) => {
                    self.state.stopping = true;
                    return Err(Error::SandboxStopped);
                }
            }
        }
    }

    /// Issue a syscall and deserialize its result.
    pub fn syscall_as<T: DeserializeOwned>(&mut self, name: &str, args: Vec<Value>) -> Result<T> {
        let value = self.syscall(name, args)?;
        serde_json::from_value(value)
            .map_err(|e| Error::execution_failed(format!("unexpected result from {}: {}", name, e)))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_worker(plug: String, module: Arc<dyn PlugModule>, mut state: WorkerState) {
    tracing::debug!(plug = %plug, "sandbox worker started");

    loop {
        let message = match state.deferred.pop_front() {
            Some(message) => message,
            None => match state.inbound.recv() {
                Ok(message) => message,
                Err(_) => break,
            },
        };

        match message {
            HostMessage::Invoke { id, function, args } => {
                let outcome = {
                    let mut ctx = PlugContext {
                        plug: &plug,
                        invocation: id,
                        state: &mut state,
                    };
                    panic::catch_unwind(AssertUnwindSafe(|| module.call(&function, args, &mut ctx)))
                };
                let result = outcome.unwrap_or_else(|payload| {
                    Err(Error::execution_failed(format!(
                        "{} panicked: {}",
                        function,
                        panic_message(payload.as_ref())
                    )))
                });

                if state.outbound.send(WorkerMessage::Completed { id, result }).is_err()
                    || state.stopping
                {
                    break;
                }
            }
            HostMessage::SyscallResult { .. } => {}
            HostMessage::Shutdown => break,
        }
    }

    tracing::debug!(plug = %plug, "sandbox worker exited");
}

struct Pending {
    reply: oneshot::Sender<Result<Value>>,
    syscalls: usize,
    // Plugs blocked on this invocation, forwarded with its syscalls.
    callers: Vec<String>,
}

struct Shared {
    plug: String,
    running: AtomicBool,
    pending: Mutex<HashMap<u64, Pending>>,
}

impl Shared {
    fn fail_all(&self, error: Error) {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.reply.send(Err(error.clone()));
        }
    }
}

enum Budget {
    Within(Vec<String>),
    Exceeded,
    Abandoned,
}

async fn pump(
    shared: Arc<Shared>,
    bridge: SyscallBridge,
    mut inbound: mpsc::UnboundedReceiver<WorkerMessage>,
    outbound: std_mpsc::Sender<HostMessage>,
    max_syscalls: usize,
) {
    while let Some(message) = inbound.recv().await {
        match message {
            WorkerMessage::Syscall {
                invocation,
                id,
                name,
                args,
            } => {
                let budget = match shared.pending.lock().get_mut(&invocation) {
                    Some(pending) => {
                        pending.syscalls += 1;
                        if pending.syscalls <= max_syscalls {
                            Budget::Within(pending.callers.clone())
                        } else {
                            Budget::Exceeded
                        }
                    }
                    None => Budget::Abandoned,
                };

                let result = match budget {
                    Budget::Within(callers) => bridge.call_from(&callers, &name, args).await,
                    Budget::Exceeded => {
                        let error = Error::exhausted(format!(
                            "more than {} syscalls in one invocation",
                            max_syscalls
                        ));
                        let pending = shared.pending.lock().remove(&invocation);
                        if let Some(pending) = pending {
                            let _ = pending.reply.send(Err(error.clone()));
                        }
                        Err(error)
                    }
                    Budget::Abandoned => Err(Error::execution_failed("invocation abandoned by host")),
                };

                if outbound.send(HostMessage::SyscallResult { id, result }).is_err() {
                    break;
                }
            }
            WorkerMessage::Completed { id, result } => {
                let pending = shared.pending.lock().remove(&id);
                match pending {
                    Some(pending) => {
                        let _ = pending.reply.send(result);
                    }
                    None => tracing::trace!(plug = %shared.plug, invocation = id, "late result dropped"),
                }
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    shared.fail_all(Error::SandboxStopped);
}

/// Sandbox running a [`PlugModule`] on a dedicated thread.
pub struct WorkerSandbox {
    shared: Arc<Shared>,
    limits: SandboxLimits,
    to_worker: Mutex<Option<std_mpsc::Sender<HostMessage>>>,
    invoke_gate: tokio::sync::Mutex<()>,
    next_invocation: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerSandbox {
    /// Start a worker for `module`. Must be called within a tokio runtime.
    pub fn spawn(
        plug: impl Into<String>,
        module: Arc<dyn PlugModule>,
        bridge: SyscallBridge,
        limits: SandboxLimits,
    ) -> Result<Self> {
        let plug = plug.into();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::SandboxUnavailable(e.to_string()))?;

        let (host_tx, host_rx) = std_mpsc::channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();

        let state = WorkerState {
            inbound: host_rx,
            outbound: worker_tx,
            deferred: VecDeque::new(),
            next_syscall: 0,
            stopping: false,
        };

        let thread = thread::Builder::new()
            .name(format!("plug-{}", plug))
            .spawn({
                let plug = plug.clone();
                move || run_worker(plug, module, state)
            })
            .map_err(|e| Error::SandboxUnavailable(e.to_string()))?;

        let shared = Arc::new(Shared {
            plug,
            running: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
        });

        let pump = runtime.spawn(pump(
            shared.clone(),
            bridge,
            worker_rx,
            host_tx.clone(),
            limits.max_syscalls_per_invocation,
        ));

        Ok(Self {
            shared,
            limits,
            to_worker: Mutex::new(Some(host_tx)),
            invoke_gate: tokio::sync::Mutex::new(()),
            next_invocation: AtomicU64::new(1),
            pump: Mutex::new(Some(pump)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Name of the plug this sandbox runs.
    pub fn plug(&self) -> &str {
        &self.shared.plug
    }

    /// Number of invocations awaiting a result.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    fn send(&self, message: HostMessage) -> Result<()> {
        match self.to_worker.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| Error::SandboxStopped),
            None => Err(Error::SandboxStopped),
        }
    }

    async fn terminate(&self) {
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(tx) = self.to_worker.lock().take() {
            let _ = tx.send(HostMessage::Shutdown);
        }
        self.shared.fail_all(Error::SandboxStopped);

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        let thread = self.thread.lock().take();
        let Some(thread) = thread else {
            return;
        };

        let deadline = tokio::time::Instant::now() + self.limits.shutdown_grace;
        while !thread.is_finished() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    plug = %self.shared.plug,
                    grace = ?self.limits.shutdown_grace,
                    "plug code did not exit in time, detaching worker"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _ = thread.join();
        tracing::debug!(plug = %self.shared.plug, "sandbox released");
    }
}

#[async_trait]
impl Sandbox for WorkerSandbox {
    async fn invoke_nested(
        &self,
        function: &str,
        args: Vec<Value>,
        callers: Vec<String>,
    ) -> Result<Value> {
        let _turn = self.invoke_gate.lock().await;
        if !self.is_running() {
            return Err(Error::SandboxStopped);
        }

        let id = self.next_invocation.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .insert(
                id,
                Pending {
                    reply,
                    syscalls: 0,
                    callers,
                },
            );

        if let Err(e) = self.send(HostMessage::Invoke {
            id,
            function: function.to_string(),
            args,
        }) {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.limits.invoke_timeout, response).await {
            Ok(Ok(Err(Error::ResourceExhausted(msg)))) => {
                tracing::warn!(plug = %self.shared.plug, function, reason = %msg, "terminating sandbox");
                self.terminate().await;
                Err(Error::ResourceExhausted(msg))
            }
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::SandboxStopped),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                tracing::warn!(
                    plug = %self.shared.plug,
                    function,
                    timeout = ?self.limits.invoke_timeout,
                    "invocation timed out, terminating sandbox"
                );
                self.terminate().await;
                Err(Error::exhausted(format!(
                    "{} did not complete within {:?}",
                    function, self.limits.invoke_timeout
                )))
            }
        }
    }

    async fn stop(&self) {
        self.terminate().await;
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerSandbox {
    fn drop(&mut self) {
        if let Some(tx) = self.to_worker.lock().take() {
            let _ = tx.send(HostMessage::Shutdown);
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for WorkerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSandbox")
            .field("plug", &self.shared.plug)
            .field("running", &self.is_running())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// [`SandboxFactory`] resolving a manifest's module to registered native code.
#[derive(Default)]
pub struct WorkerSandboxFactory {
    modules: DashMap<String, Arc<dyn PlugModule>>,
}

impl WorkerSandboxFactory {
    /// Create a factory with no modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, module: impl PlugModule) {
        self.modules.insert(name.into(), Arc::new(module));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_module(self, name: impl Into<String>, module: impl PlugModule) -> Self {
        self.register(name, module);
        self
    }

    /// Remove a module. Running sandboxes keep their code.
    pub fn remove(&self, name: &str) -> bool {
        self.modules.remove(name).is_some()
    }

    /// Check if a module is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }
}

impl SandboxFactory for WorkerSandboxFactory {
    fn create(
        &self,
        manifest: &Manifest,
        bridge: SyscallBridge,
        limits: &SandboxLimits,
    ) -> Result<Box<dyn Sandbox>> {
        let module = self
            .modules
            .get(manifest.module_name())
            .map(|m| m.value().clone())
            .ok_or_else(|| {
                Error::SandboxUnavailable(format!(
                    "no module registered as {}",
                    manifest.module_name()
                ))
            })?;

        let sandbox = WorkerSandbox::spawn(&manifest.name, module, bridge, limits.clone())?;
        Ok(Box::new(sandbox))
    }
}

impl std::fmt::Debug for WorkerSandboxFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSandboxFactory")
            .field("module_count", &self.modules.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{FunctionTable, SyscallHandler};
    use crate::syscall::SyscallContext;
    use serde_json::json;
    use std::time::Instant;

    struct TestHost;

    #[async_trait]
    impl SyscallHandler for TestHost {
        async fn handle_syscall(
            &self,
            ctx: &SyscallContext,
            name: &str,
            args: Vec<Value>,
        ) -> Result<Value> {
            match name {
                "test.echo" => Ok(json!({ "plug": ctx.plug, "args": args })),
                "test.chain" => Ok(json!(ctx.chain())),
                "test.hang" => futures::future::pending::<Result<Value>>().await,
                _ => Err(Error::syscall_not_found(name)),
            }
        }
    }

    fn module() -> FunctionTable {
        FunctionTable::new()
            .function("add", |args, _| {
                let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(json!(sum))
            })
            .function("echo", |args, ctx| ctx.syscall("test.echo", args))
            .function("hang", |_, ctx| ctx.syscall("test.hang", vec![]))
            .function("chain", |_, ctx| ctx.syscall("test.chain", vec![]))
            .function("chatty", |_, ctx| {
                for i in 0..5 {
                    ctx.syscall("test.echo", vec![json!(i)])?;
                }
                Ok(Value::Null)
            })
            .function("panic", |_, _| panic!("plug bug"))
            .function("sleep", |args, _| {
                let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(Value::Null)
            })
    }

    fn spawn(host: &Arc<dyn SyscallHandler>, limits: SandboxLimits) -> WorkerSandbox {
        let bridge = SyscallBridge::new("test-plug", Arc::downgrade(host));
        WorkerSandbox::spawn("test-plug", Arc::new(module()), bridge, limits).unwrap()
    }

    fn host() -> Arc<dyn SyscallHandler> {
        Arc::new(TestHost)
    }

    #[tokio::test]
    async fn test_invoke_pure_function() {
        let host = host();
        let sandbox = spawn(&host, SandboxLimits::default());
        let value = sandbox.invoke("add", vec![json!(2), json!(3)]).await.unwrap();
        assert_eq!(value, json!(5));
        sandbox.stop().await;
        assert!(!sandbox.is_running());
    }

    #[tokio::test]
    async fn test_syscall_round_trip() {
        let host = host();
        let sandbox = spawn(&host, SandboxLimits::default());
        let value = sandbox.invoke("echo", vec![json!("hi")]).await.unwrap();
        assert_eq!(value, json!({ "plug": "test-plug", "args": ["hi"] }));
        assert_eq!(sandbox.pending_count(), 0);
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_nested_invoke_carries_callers() {
        let host = host();
        let sandbox = spawn(&host, SandboxLimits::default());

        let value = sandbox
            .invoke_nested("chain", vec![], vec!["outer".into(), "relay".into()])
            .await
            .unwrap();
        assert_eq!(value, json!(["outer", "relay", "test-plug"]));

        // A later top-level call starts a fresh chain.
        let value = sandbox.invoke("chain", vec![]).await.unwrap();
        assert_eq!(value, json!(["test-plug"]));
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let host = host();
        let sandbox = spawn(&host, SandboxLimits::default());
        let err = sandbox.invoke("missing", vec![]).await.unwrap_err();
        assert_eq!(err, Error::FunctionNotFound("missing".into()));
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let host = host();
        let sandbox = spawn(&host, SandboxLimits::default());

        let err = sandbox.invoke("panic", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::SandboxExecution(ref m) if m.contains("plug bug")));

        // The worker survives its plug's panic.
        let value = sandbox.invoke("add", vec![json!(1)]).await.unwrap();
        assert_eq!(value, json!(1));
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_terminates() {
        let host = host();
        let limits = SandboxLimits::new()
            .with_invoke_timeout(Duration::from_millis(50))
            .with_shutdown_grace(Duration::from_millis(10));
        let sandbox = spawn(&host, limits);

        let err = sandbox.invoke("sleep", vec![json!(500)]).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert!(!sandbox.is_running());

        let err = sandbox.invoke("add", vec![]).await.unwrap_err();
        assert_eq!(err, Error::SandboxStopped);
    }

    #[tokio::test]
    async fn test_syscall_budget() {
        let host = host();
        let sandbox = spawn(&host, SandboxLimits::new().with_max_syscalls(2));
        let err = sandbox.invoke("chatty", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert!(!sandbox.is_running());
    }

    #[tokio::test]
    async fn test_stop_aborts_inflight_call() {
        let host = host();
        let sandbox = Arc::new(spawn(&host, SandboxLimits::default()));

        let call = tokio::spawn({
            let sandbox = sandbox.clone();
            async move { sandbox.invoke("hang", vec![]).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        sandbox.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, Error::SandboxStopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_invokes_are_serialized() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let recorded = spans.clone();
        let module = FunctionTable::new().function("work", move |_, _| {
            let entered = Instant::now();
            std::thread::sleep(Duration::from_millis(40));
            recorded.lock().push((entered, Instant::now()));
            Ok(Value::Null)
        });

        let host = host();
        let bridge = SyscallBridge::new("serial", Arc::downgrade(&host));
        let sandbox =
            WorkerSandbox::spawn("serial", Arc::new(module), bridge, SandboxLimits::default())
                .unwrap();

        let (a, b) = tokio::join!(sandbox.invoke("work", vec![]), sandbox.invoke("work", vec![]));
        a.unwrap();
        b.unwrap();

        let spans = spans.lock().clone();
        assert_eq!(spans.len(), 2);
        assert!(spans[1].0 >= spans[0].1);
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_factory_resolves_modules() {
        let factory = WorkerSandboxFactory::new().with_module("math", module());
        let manifest = crate::manifest::ManifestBuilder::new("calc")
            .module("math")
            .build_unchecked();

        let sandbox = factory
            .create(&manifest, SyscallBridge::detached("calc"), &SandboxLimits::default())
            .unwrap();
        assert_eq!(sandbox.invoke("add", vec![json!(4)]).await.unwrap(), json!(4));
        sandbox.stop().await;

        let missing = crate::manifest::Manifest::new("ghost");
        let err = factory
            .create(&missing, SyscallBridge::detached("ghost"), &SandboxLimits::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::SandboxUnavailable(_)));
    }
}
