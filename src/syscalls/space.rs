//! `space.*` syscalls over a document store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::hooks::EventHook;
use crate::syscall::{syscall_fn, SyscallSet};

use super::{optional_u64_arg, string_arg};

/// Metadata of one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    /// Page name.
    pub name: String,
    /// Last modification, in milliseconds since the epoch.
    pub last_modified: u64,
}

/// A page with its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageData {
    /// Page text.
    pub text: String,
    /// Page metadata.
    pub meta: PageMeta,
}

/// Every page, as of `now_timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageList {
    /// Store clock when the list was taken.
    pub now_timestamp: u64,
    /// Page metadata, sorted by name.
    pub pages: Vec<PageMeta>,
}

/// Page storage reachable from plugs.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// List every page.
    async fn fetch_list(&self) -> Result<PageList>;

    /// Read a page.
    async fn read(&self, name: &str) -> Result<PageData>;

    /// Write a page.
    ///
    /// Unless `overwrite` is set, a write carrying `expected_last_modified`
    /// fails with [`Error::Conflict`] when the stored page has changed since.
    async fn write(
        &self,
        name: &str,
        text: &str,
        overwrite: bool,
        expected_last_modified: Option<u64>,
    ) -> Result<PageMeta>;

    /// Delete a page.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Metadata of a page.
    async fn get_meta(&self, name: &str) -> Result<PageMeta>;
}

/// In-memory [`DocumentStore`].
#[derive(Default)]
pub struct MemoryStore {
    pages: RwLock<BTreeMap<String, (String, u64)>>,
    clock: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // Wall-clock milliseconds, strictly increasing per store.
    fn tick(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut last = self.clock.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .clock
                .compare_exchange(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    /// Number of pages.
    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    /// Whether the store has no pages.
    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }
}

fn meta(name: &str, last_modified: u64) -> PageMeta {
    PageMeta {
        name: name.to_string(),
        last_modified,
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn fetch_list(&self) -> Result<PageList> {
        let pages = self
            .pages
            .read()
            .iter()
            .map(|(name, (_, modified))| meta(name, *modified))
            .collect();
        Ok(PageList {
            now_timestamp: self.tick(),
            pages,
        })
    }

    async fn read(&self, name: &str) -> Result<PageData> {
        let pages = self.pages.read();
        let (text, modified) = pages
            .get(name)
            .ok_or_else(|| Error::DocumentNotFound(name.to_string()))?;
        Ok(PageData {
            text: text.clone(),
            meta: meta(name, *modified),
        })
    }

    async fn write(
        &self,
        name: &str,
        text: &str,
        overwrite: bool,
        expected_last_modified: Option<u64>,
    ) -> Result<PageMeta> {
        let mut pages = self.pages.write();
        if let (false, Some(expected), Some((_, actual))) =
            (overwrite, expected_last_modified, pages.get(name))
        {
            if *actual != expected {
                return Err(Error::Conflict {
                    name: name.to_string(),
                    expected,
                    actual: *actual,
                });
            }
        }
        let modified = self.tick();
        pages.insert(name.to_string(), (text.to_string(), modified));
        Ok(meta(name, modified))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.pages
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::DocumentNotFound(name.to_string()))
    }

    async fn get_meta(&self, name: &str) -> Result<PageMeta> {
        self.pages
            .read()
            .get(name)
            .map(|(_, modified)| meta(name, *modified))
            .ok_or_else(|| Error::DocumentNotFound(name.to_string()))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("page_count", &self.len())
            .finish()
    }
}

/// Store wrapper announcing changes as `page:saved` and `page:deleted` events.
///
/// Events are dispatched on a separate task once the change is stored, so a
/// plug writing a page can also handle the resulting event.
pub struct EventedStore<S> {
    inner: S,
    events: Arc<EventHook>,
}

impl<S: DocumentStore> EventedStore<S> {
    /// Wrap `inner`, dispatching through `events`.
    pub fn new(inner: S, events: Arc<EventHook>) -> Self {
        Self { inner, events }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn announce(&self, event: &'static str, data: Value) {
        let events = self.events.clone();
        tokio::spawn(async move {
            events.dispatch_event_collect(event, data).await;
        });
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for EventedStore<S> {
    async fn fetch_list(&self) -> Result<PageList> {
        self.inner.fetch_list().await
    }

    async fn read(&self, name: &str) -> Result<PageData> {
        self.inner.read(name).await
    }

    async fn write(
        &self,
        name: &str,
        text: &str,
        overwrite: bool,
        expected_last_modified: Option<u64>,
    ) -> Result<PageMeta> {
        let meta = self
            .inner
            .write(name, text, overwrite, expected_last_modified)
            .await?;
        self.announce("page:saved", json!({ "name": name, "meta": meta }));
        Ok(meta)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name).await?;
        self.announce("page:deleted", json!({ "name": name }));
        Ok(())
    }

    async fn get_meta(&self, name: &str) -> Result<PageMeta> {
        self.inner.get_meta(name).await
    }
}

/// Ungated `space.*` syscalls over `store`.
///
/// `space.listPages()`, `space.readPage(name)`,
/// `space.writePage(name, text, expectedLastModified?)`,
/// `space.deletePage(name)`, `space.getPageMeta(name)`.
pub fn space_syscalls(store: Arc<dyn DocumentStore>) -> SyscallSet {
    let list = store.clone();
    let read = store.clone();
    let write = store.clone();
    let delete = store.clone();
    let get_meta = store;

    SyscallSet::new()
        .with(
            "space.listPages",
            syscall_fn(move |_, _| {
                let store = list.clone();
                async move { Ok(serde_json::to_value(store.fetch_list().await?.pages)?) }
            }),
        )
        .with(
            "space.readPage",
            syscall_fn(move |_, args| {
                let store = read.clone();
                async move {
                    let name = string_arg(&args, 0, "space.readPage", "page name")?;
                    Ok(serde_json::to_value(store.read(&name).await?)?)
                }
            }),
        )
        .with(
            "space.writePage",
            syscall_fn(move |_, args| {
                let store = write.clone();
                async move {
                    let name = string_arg(&args, 0, "space.writePage", "page name")?;
                    let text = string_arg(&args, 1, "space.writePage", "page text")?;
                    let expected = optional_u64_arg(&args, 2, "space.writePage")?;
                    let meta = store.write(&name, &text, false, expected).await?;
                    Ok(serde_json::to_value(meta)?)
                }
            }),
        )
        .with(
            "space.deletePage",
            syscall_fn(move |_, args| {
                let store = delete.clone();
                async move {
                    let name = string_arg(&args, 0, "space.deletePage", "page name")?;
                    store.delete(&name).await?;
                    Ok(Value::Null)
                }
            }),
        )
        .with(
            "space.getPageMeta",
            syscall_fn(move |_, args| {
                let store = get_meta.clone();
                async move {
                    let name = string_arg(&args, 0, "space.getPageMeta", "page name")?;
                    Ok(serde_json::to_value(store.get_meta(&name).await?)?)
                }
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::{SyscallContext, SyscallRegistry};
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let first = store.write("index", "hello", false, None).await.unwrap();
        let page = store.read("index").await.unwrap();
        assert_eq!(page.text, "hello");
        assert_eq!(page.meta, first);

        let second = store.write("index", "again", false, None).await.unwrap();
        assert!(second.last_modified > first.last_modified);

        let list = store.fetch_list().await.unwrap();
        assert_eq!(list.pages, vec![second.clone()]);
        assert!(list.now_timestamp > second.last_modified);

        store.delete("index").await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            store.read("index").await,
            Err(Error::DocumentNotFound(_))
        ));
        assert!(store.delete("index").await.is_err());
    }

    #[tokio::test]
    async fn test_write_conflict() {
        let store = MemoryStore::new();
        let first = store.write("p", "v1", false, None).await.unwrap();
        store
            .write("p", "v2", false, Some(first.last_modified))
            .await
            .unwrap();

        // Stale timestamp.
        let err = store
            .write("p", "v3", false, Some(first.last_modified))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { expected, .. } if expected == first.last_modified));

        // Overwrite ignores it.
        store
            .write("p", "v3", true, Some(first.last_modified))
            .await
            .unwrap();
        assert_eq!(store.read("p").await.unwrap().text, "v3");
    }

    #[tokio::test]
    async fn test_space_syscalls() {
        let registry = SyscallRegistry::new();
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        registry
            .register::<&str>(&[], space_syscalls(store.clone()))
            .unwrap();
        let ctx = SyscallContext::new("editor");
        let none = HashSet::new();

        let meta = registry
            .dispatch(&ctx, &none, "space.writePage", vec![json!("todo"), json!("- [ ] x")])
            .await
            .unwrap();
        assert_eq!(meta["name"], json!("todo"));
        assert!(meta["lastModified"].is_u64());

        let page = registry
            .dispatch(&ctx, &none, "space.readPage", vec![json!("todo")])
            .await
            .unwrap();
        assert_eq!(page["text"], json!("- [ ] x"));

        let pages = registry
            .dispatch(&ctx, &none, "space.listPages", vec![])
            .await
            .unwrap();
        assert_eq!(pages.as_array().unwrap().len(), 1);

        let err = registry
            .dispatch(&ctx, &none, "space.readPage", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Syscall(_)));

        registry
            .dispatch(&ctx, &none, "space.deletePage", vec![json!("todo")])
            .await
            .unwrap();
        assert!(registry
            .dispatch(&ctx, &none, "space.getPageMeta", vec![json!("todo")])
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_evented_store_writes_through() {
        let events = Arc::new(EventHook::new());
        let store = EventedStore::new(MemoryStore::new(), events);
        store.write("a", "text", false, None).await.unwrap();
        assert_eq!(store.inner().len(), 1);
        store.delete("a").await.unwrap();
        assert!(store.inner().is_empty());
    }
}
