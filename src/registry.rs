//! Name-keyed table of loaded plugs.

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleState;
use crate::plug::{PlugHandle, PlugInfo};

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Plugs registered.
    pub total: usize,
    /// Plugs accepting calls.
    pub running: usize,
    /// Loaded plugs whose sandbox was terminated.
    pub failed: usize,
    /// Plugs being torn down.
    pub stopping: usize,
}

/// Loaded plugs by name. Only the system mutates it.
pub struct PlugRegistry {
    max_plugs: usize,
    plugs: DashMap<String, PlugHandle>,
}

impl PlugRegistry {
    /// Create a registry holding at most `max_plugs` plugs.
    pub fn new(max_plugs: usize) -> Self {
        Self {
            max_plugs,
            plugs: DashMap::new(),
        }
    }

    /// Maximum number of plugs.
    pub fn capacity(&self) -> usize {
        self.max_plugs
    }

    /// Check there is room for one more plug named `name`.
    pub fn ensure_room(&self, name: &str) -> Result<()> {
        if !self.plugs.contains_key(name) && self.plugs.len() >= self.max_plugs {
            return Err(Error::Registry(format!(
                "registry full: max {} plugs",
                self.max_plugs
            )));
        }
        Ok(())
    }

    /// Insert a plug, returning the instance it replaced.
    pub(crate) fn insert(&self, plug: PlugHandle) -> Result<Option<PlugHandle>> {
        let name = plug.name().to_string();
        self.ensure_room(&name)?;
        Ok(self.plugs.insert(name, plug))
    }

    /// Remove a plug by name.
    pub(crate) fn remove(&self, name: &str) -> Option<PlugHandle> {
        self.plugs.remove(name).map(|(_, plug)| plug)
    }

    /// Get a plug by name.
    pub fn get(&self, name: &str) -> Option<PlugHandle> {
        self.plugs.get(name).map(|r| r.clone())
    }

    /// Check if a plug exists.
    pub fn contains(&self, name: &str) -> bool {
        self.plugs.contains_key(name)
    }

    /// Get all plug names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugs.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    /// Get all plugs.
    pub fn all(&self) -> Vec<PlugHandle> {
        self.plugs.iter().map(|r| r.value().clone()).collect()
    }

    /// Get plug count.
    pub fn len(&self) -> usize {
        self.plugs.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.plugs.is_empty()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.plugs.len(),
            ..Default::default()
        };
        for entry in self.plugs.iter() {
            match entry.state() {
                LifecycleState::Running => stats.running += 1,
                LifecycleState::Failed => stats.failed += 1,
                LifecycleState::Stopping => stats.stopping += 1,
                LifecycleState::Unloaded => {}
            }
        }
        stats
    }

    /// Snapshot of every plug.
    pub fn info(&self) -> Vec<PlugInfo> {
        self.plugs.iter().map(|r| r.info()).collect()
    }

    /// Plugs granted `namespace`.
    pub fn find_by_namespace(&self, namespace: &str) -> Vec<PlugHandle> {
        self.plugs
            .iter()
            .filter(|r| r.is_granted(namespace))
            .map(|r| r.value().clone())
            .collect()
    }
}

impl Default for PlugRegistry {
    fn default() -> Self {
        Self::new(100)
    }
}

impl std::fmt::Debug for PlugRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlugRegistry")
            .field("max_plugs", &self.max_plugs)
            .field("plug_count", &self.plugs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestBuilder;
    use crate::plug::Plug;
    use crate::sandbox::{FunctionTable, SandboxFactory, SandboxLimits, SyscallBridge, WorkerSandboxFactory};
    use std::collections::HashSet;

    fn create_test_plug(name: &str, grants: &[&str]) -> PlugHandle {
        let manifest = ManifestBuilder::new(name).module("noop").build_unchecked();
        let factory = WorkerSandboxFactory::new().with_module("noop", FunctionTable::new());
        let sandbox = factory
            .create(&manifest, SyscallBridge::detached(name), &SandboxLimits::default())
            .unwrap();
        let granted: HashSet<String> = grants.iter().map(|s| s.to_string()).collect();
        PlugHandle::new(Plug::new(manifest, granted, sandbox))
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let registry = PlugRegistry::default();
        assert!(registry.is_empty());

        registry.insert(create_test_plug("a", &[])).unwrap();
        assert!(registry.contains("a"));
        assert_eq!(registry.get("a").unwrap().name(), "a");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_replaces_same_name() {
        let registry = PlugRegistry::default();
        let first = create_test_plug("dup", &[]);
        let second = create_test_plug("dup", &[]);
        let second_id = second.id();

        assert!(registry.insert(first.clone()).unwrap().is_none());
        let replaced = registry.insert(second).unwrap().unwrap();
        assert!(replaced.same_instance(&first));
        assert_eq!(registry.get("dup").unwrap().id(), second_id);
    }

    #[tokio::test]
    async fn test_max_plugs() {
        let registry = PlugRegistry::new(2);
        registry.insert(create_test_plug("p1", &[])).unwrap();
        registry.insert(create_test_plug("p2", &[])).unwrap();

        let result = registry.insert(create_test_plug("p3", &[]));
        assert!(matches!(result, Err(Error::Registry(_))));

        // Replacing an existing name never needs room.
        assert!(registry.insert(create_test_plug("p2", &[])).is_ok());
    }

    #[tokio::test]
    async fn test_stats_and_queries() {
        let registry = PlugRegistry::default();
        registry.insert(create_test_plug("a", &["fs"])).unwrap();
        registry.insert(create_test_plug("b", &["shell"])).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.running, 2);

        let fs = registry.find_by_namespace("fs");
        assert_eq!(fs.len(), 1);
        assert_eq!(fs[0].name(), "a");
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_stats_count_failed_plugs() {
        let manifest = ManifestBuilder::new("sleepy")
            .module("nap")
            .function("nap")
            .build_unchecked();
        let factory = WorkerSandboxFactory::new().with_module(
            "nap",
            FunctionTable::new().function("nap", |_, _| {
                std::thread::sleep(std::time::Duration::from_millis(300));
                Ok(serde_json::Value::Null)
            }),
        );
        let limits = SandboxLimits::new()
            .with_invoke_timeout(std::time::Duration::from_millis(30))
            .with_shutdown_grace(std::time::Duration::from_millis(10));
        let sandbox = factory
            .create(&manifest, SyscallBridge::detached("sleepy"), &limits)
            .unwrap();
        let sleepy = PlugHandle::new(Plug::new(manifest, HashSet::new(), sandbox));

        let registry = PlugRegistry::default();
        registry.insert(sleepy.clone()).unwrap();
        registry.insert(create_test_plug("awake", &[])).unwrap();

        assert!(matches!(
            sleepy.invoke("nap", vec![]).await,
            Err(Error::ResourceExhausted(_))
        ));
        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.failed, 1);
    }
}
