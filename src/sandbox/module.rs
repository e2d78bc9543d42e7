//! Native plug code.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};

use super::worker::PlugContext;

/// Plug code runnable inside a [`WorkerSandbox`](super::WorkerSandbox).
///
/// Runs on the sandbox's own thread. Everything outside the plug is reached
/// through [`PlugContext::syscall`].
pub trait PlugModule: Send + Sync + 'static {
    /// Execute exported `function` with `args`.
    fn call(&self, function: &str, args: Vec<Value>, ctx: &mut PlugContext<'_>) -> Result<Value>;
}

type PlugFn = dyn Fn(Vec<Value>, &mut PlugContext<'_>) -> Result<Value> + Send + Sync;

/// A [`PlugModule`] built from closures, one per exported function.
#[derive(Default)]
pub struct FunctionTable {
    functions: HashMap<String, Box<PlugFn>>,
}

impl FunctionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `name`.
    pub fn function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, &mut PlugContext<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Box::new(f));
        self
    }

    /// Exported function names.
    pub fn names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).collect()
    }
}

impl PlugModule for FunctionTable {
    fn call(&self, function: &str, args: Vec<Value>, ctx: &mut PlugContext<'_>) -> Result<Value> {
        let f = self
            .functions
            .get(function)
            .ok_or_else(|| Error::FunctionNotFound(function.to_string()))?;
        f(args, ctx)
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTable")
            .field("functions", &self.names())
            .finish()
    }
}
