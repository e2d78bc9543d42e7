//! Notification stream of plugs appearing and disappearing.
//!
//! A source is whatever discovers plugs (a directory watcher, a test, a
//! remote registry). It only reports; the system decides what to load.

use tokio::sync::mpsc;

use crate::loader::PlugBundle;

/// A change reported by a plug source.
#[derive(Debug, Clone)]
pub enum PlugSourceEvent {
    /// A plug became available or changed.
    Loaded {
        /// Plug name.
        name: String,
        /// Bundle to load.
        bundle: PlugBundle,
    },
    /// A plug went away.
    Unloaded {
        /// Plug name.
        name: String,
    },
}

impl PlugSourceEvent {
    /// Plug name the event is about.
    pub fn name(&self) -> &str {
        match self {
            Self::Loaded { name, .. } | Self::Unloaded { name } => name,
        }
    }
}

/// Sending half of a plug source.
#[derive(Debug, Clone)]
pub struct PlugSource {
    tx: mpsc::UnboundedSender<PlugSourceEvent>,
}

/// Receiving half of a plug source, consumed by the system.
#[derive(Debug)]
pub struct PlugSourceStream {
    rx: mpsc::UnboundedReceiver<PlugSourceEvent>,
}

/// Create a connected source and stream.
pub fn plug_source() -> (PlugSource, PlugSourceStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PlugSource { tx }, PlugSourceStream { rx })
}

impl PlugSource {
    /// Report an event. Returns `false` once the stream is gone.
    pub fn send(&self, event: PlugSourceEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Report that `bundle` is available under its manifest name.
    pub fn loaded(&self, bundle: PlugBundle) -> bool {
        self.send(PlugSourceEvent::Loaded {
            name: bundle.name().to_string(),
            bundle,
        })
    }

    /// Report that `name` went away.
    pub fn unloaded(&self, name: impl Into<String>) -> bool {
        self.send(PlugSourceEvent::Unloaded { name: name.into() })
    }

    /// Whether the stream has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PlugSourceStream {
    /// Next event, or `None` once every source is dropped.
    pub async fn recv(&mut self) -> Option<PlugSourceEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    #[tokio::test]
    async fn test_source_round_trip() {
        let (source, mut stream) = plug_source();
        assert!(source.loaded(PlugBundle::new(Manifest::new("a"))));
        assert!(source.unloaded("a"));
        drop(source);

        let first = stream.recv().await.unwrap();
        assert!(matches!(first, PlugSourceEvent::Loaded { ref name, .. } if name == "a"));
        assert_eq!(stream.recv().await.unwrap().name(), "a");
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn test_closed_source() {
        let (source, stream) = plug_source();
        drop(stream);
        assert!(source.is_closed());
        assert!(!source.unloaded("a"));
    }
}
