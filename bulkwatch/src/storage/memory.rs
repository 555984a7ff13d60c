//! An in-memory storage that fans changes out to open watches.

use super::{
    ChangeEvent, JsonObjectEncoder, Object, ObjectEncoder, ResourceWatch, StopHandle, Storage,
    Watcher,
};
use crate::error::BoxError;
use crate::message::ListOptions;
use crate::selector::{FieldSelector, LabelSelector};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

/// A storage for objects of type `T` kept in process.
///
/// It does not retain objects; it only fans every applied change out to the
/// watches whose namespace and selectors match it. Encoded objects use
/// [`JsonObjectEncoder`].
pub struct MemoryStorage<T> {
    encoder: Arc<JsonObjectEncoder<T>>,
    watches: Arc<Mutex<Watches>>,
    _marker: PhantomData<fn() -> T>,
}

#[derive(Default)]
struct Watches {
    next_id: u64,
    open: HashMap<u64, OpenWatch>,
}

struct OpenWatch {
    namespace: String,
    fields: FieldSelector,
    labels: LabelSelector,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl OpenWatch {
    fn matches(&self, event: &ChangeEvent) -> bool {
        let Some(object) = event.object() else {
            return true;
        };
        let meta = object.meta();

        (self.namespace.is_empty() || self.namespace == meta.namespace)
            && self.fields.matches(|field| meta.field(field))
            && self.labels.matches(&meta.labels)
    }
}

impl<T> MemoryStorage<T>
where
    T: Object + Serialize,
{
    /// Create an empty storage.
    pub fn new() -> Self {
        Self {
            encoder: Arc::new(JsonObjectEncoder::new()),
            watches: Arc::default(),
            _marker: PhantomData,
        }
    }

    /// Report a created object.
    pub fn add(&self, object: T) {
        self.apply(ChangeEvent::Added(Arc::new(object)));
    }

    /// Report an updated object.
    pub fn modify(&self, object: T) {
        self.apply(ChangeEvent::Modified(Arc::new(object)));
    }

    /// Report a removed object.
    pub fn delete(&self, object: T) {
        self.apply(ChangeEvent::Deleted(Arc::new(object)));
    }

    /// Deliver `event` to every matching watch.
    ///
    /// Error events go to all watches.
    pub fn apply(&self, event: ChangeEvent) {
        let mut watches = lock(&self.watches);

        watches.open.retain(|id, watch| {
            if !watch.matches(&event) {
                return true;
            }

            trace!(watch = id, ?event, "fanning out change");
            watch.tx.send(event.clone()).is_ok()
        });
    }

    /// End every open watch, as if the upstream connection was lost.
    pub fn close_watches(&self) {
        let closed = std::mem::take(&mut lock(&self.watches).open);
        debug!(count = closed.len(), "closing all memory watches");
    }

    /// Number of watches currently open.
    pub fn watch_count(&self) -> usize {
        lock(&self.watches).open.len()
    }
}

impl<T> Default for MemoryStorage<T>
where
    T: Object + Serialize,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MemoryStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("type", &std::any::type_name::<T>())
            .finish_non_exhaustive()
    }
}

impl<T> Storage for MemoryStorage<T>
where
    T: Object + Serialize,
{
    fn encoder(&self) -> Arc<dyn ObjectEncoder> {
        self.encoder.clone()
    }

    fn watcher(self: Arc<Self>) -> Option<Arc<dyn Watcher>> {
        Some(self)
    }
}

#[async_trait]
impl<T> Watcher for MemoryStorage<T>
where
    T: Object + Serialize,
{
    async fn watch(
        &self,
        namespace: &str,
        options: &ListOptions,
    ) -> Result<ResourceWatch, BoxError> {
        let fields = FieldSelector::parse(&options.field_selector)?;
        let labels = LabelSelector::parse(&options.label_selector)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut watches = lock(&self.watches);
            let id = watches.next_id;
            watches.next_id += 1;
            watches.open.insert(
                id,
                OpenWatch {
                    namespace: namespace.to_string(),
                    fields,
                    labels,
                    tx,
                },
            );
            id
        };

        debug!(watch = id, namespace, "opened memory watch");

        let watches: Weak<Mutex<Watches>> = Arc::downgrade(&self.watches);
        let stop = StopHandle::new(move || {
            if let Some(watches) = watches.upgrade() {
                if lock(&watches).open.remove(&id).is_some() {
                    debug!(watch = id, "stopped memory watch");
                }
            }
        });

        Ok(ResourceWatch::new(UnboundedReceiverStream::new(rx), stop))
    }
}

fn lock(watches: &Mutex<Watches>) -> MutexGuard<'_, Watches> {
    // The map stays consistent even if a holder panicked.
    watches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
