//! Hot-reload demo for the plugos runtime.
//!
//! Watches `./plugs` for `*.plug.toml` bundles and keeps the system in step:
//! saving a bundle loads or reloads its plug, deleting it unloads the plug.
//! A `user:join` event is dispatched every few seconds so changes are visible.
//!
//! Run with: cargo run --example hot_reload --features "toml,watch"
//!
//! Example bundle (`./plugs/greeter.plug.toml`):
//!
//! ```toml
//! name = "greeter"
//! version = "1.0.0"
//!
//! [functions.hello]
//! events = ["user:join"]
//! ```
//!
//! Add `module = "shouter"` and save to watch the plug reload.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use plugos_runtime::{
    plug_source, FunctionTable, LifecycleEvent, PlugWatcher, StandardHooks, System, SystemConfig,
    WatchConfig, WorkerSandboxFactory,
};
use serde_json::json;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting hot-reload demo");

    let system = System::new(SystemConfig::default());
    let hooks = StandardHooks::attach(&system)?;
    system.on_event(|event: &LifecycleEvent| {
        info!(plug = %event.plug_name(), event = event.event_name(), "lifecycle");
    });

    // Code modules a bundle can name; the bundle decides which triggers run them.
    let factory = Arc::new(
        WorkerSandboxFactory::new()
            .with_module(
                "greeter",
                FunctionTable::new().function("hello", |args, _| {
                    let name = args
                        .first()
                        .and_then(|a| a["name"].as_str())
                        .unwrap_or("stranger");
                    Ok(json!(format!("Hello, {}", name)))
                }),
            )
            .with_module(
                "shouter",
                FunctionTable::new().function("hello", |args, _| {
                    let name = args
                        .first()
                        .and_then(|a| a["name"].as_str())
                        .unwrap_or("stranger");
                    Ok(json!(format!("HELLO, {}!", name.to_uppercase())))
                }),
            ),
    );

    let (source, stream) = plug_source();
    let applier = system.attach_source(stream, factory);

    let plugs_dir = PathBuf::from("./plugs");
    let mut watcher = PlugWatcher::new(WatchConfig::new(), source);
    if plugs_dir.exists() {
        info!("Watching plug directory: {:?}", plugs_dir);
        watcher.watch(&plugs_dir)?;
        let found = watcher.scan()?;
        info!(found, "initial bundles reported");
    } else {
        warn!("Plug directory not found, create ./plugs/ and add *.plug.toml bundles");
    }
    watcher.start()?;

    info!("Watching for changes. Press Ctrl+C to exit.");
    let mut ticker = tokio::time::interval(Duration::from_secs(3));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let outcomes = hooks
                    .events
                    .dispatch_event_collect("user:join", json!({"name": "Ada"}))
                    .await;
                for outcome in outcomes {
                    match outcome.result {
                        Ok(value) => info!(plug = %outcome.plug, %value, "handled user:join"),
                        Err(e) => warn!(plug = %outcome.plug, error = %e, "user:join failed"),
                    }
                }
            }
        }
    }

    watcher.stop();
    drop(watcher);
    applier.await?;
    system.shutdown().await;
    info!("Stopped");
    Ok(())
}
