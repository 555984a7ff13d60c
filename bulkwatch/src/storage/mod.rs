//! Storage collaborator contracts.
//!
//! The engine never knows what a resource looks like. A storage hands out an
//! [`ObjectEncoder`] for its objects and, if it supports watching, a
//! [`Watcher`] that opens change streams.

use crate::error::BoxError;
use crate::message::{EventType, ListOptions};
use crate::selector::{NAMESPACE_FIELD, NAME_FIELD};
use crate::status::Status;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

pub mod memory;

/// Metadata every watchable object exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name.
    pub name: String,
    /// Namespace, empty for cluster-scoped objects.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Labels matched by label selectors.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Opaque version assigned by the storage.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

impl ObjectMeta {
    /// Metadata for a namespaced object.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Look up a field by its selector path.
    pub fn field(&self, path: &str) -> Option<&str> {
        match path {
            NAME_FIELD => Some(&self.name),
            NAMESPACE_FIELD => Some(&self.namespace),
            _ => None,
        }
    }
}

/// A resource object held by a storage.
pub trait Object: Send + Sync + 'static {
    /// The object's metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Upcast for encoders that need the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// One change observed by an underlying watch.
#[derive(Clone)]
pub enum ChangeEvent {
    /// An object was created.
    Added(Arc<dyn Object>),
    /// An object was updated.
    Modified(Arc<dyn Object>),
    /// An object was removed.
    Deleted(Arc<dyn Object>),
    /// The underlying watch failed. It is forwarded and ends the watch.
    Error(Status),
}

impl ChangeEvent {
    /// The kind of change.
    pub fn event_type(&self) -> EventType {
        match self {
            ChangeEvent::Added(_) => EventType::Added,
            ChangeEvent::Modified(_) => EventType::Modified,
            ChangeEvent::Deleted(_) => EventType::Deleted,
            ChangeEvent::Error(_) => EventType::Error,
        }
    }

    /// The changed object, unless this is an error.
    pub fn object(&self) -> Option<&Arc<dyn Object>> {
        match self {
            ChangeEvent::Added(object)
            | ChangeEvent::Modified(object)
            | ChangeEvent::Deleted(object) => Some(object),
            ChangeEvent::Error(_) => None,
        }
    }
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object() {
            Some(object) => f
                .debug_tuple("ChangeEvent")
                .field(&self.event_type())
                .field(object.meta())
                .finish(),
            None => f
                .debug_tuple("ChangeEvent")
                .field(&self.event_type())
                .finish(),
        }
    }
}

/// Serializes a storage's objects into the opaque payload of watch events.
pub trait ObjectEncoder: Send + Sync + 'static {
    /// Encode `object`.
    fn encode(&self, object: &dyn Object) -> Result<Bytes, BoxError>;
}

/// Encodes objects of type `T` as JSON.
pub struct JsonObjectEncoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonObjectEncoder<T> {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonObjectEncoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonObjectEncoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonObjectEncoder")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> ObjectEncoder for JsonObjectEncoder<T>
where
    T: Object + Serialize,
{
    fn encode(&self, object: &dyn Object) -> Result<Bytes, BoxError> {
        let object = object.as_any().downcast_ref::<T>().ok_or_else(|| {
            format!(
                "cannot encode {}/{}: not a {}",
                object.meta().namespace,
                object.meta().name,
                std::any::type_name::<T>()
            )
        })?;

        Ok(serde_json::to_vec(object)?.into())
    }
}

/// Stops an underlying watch. Cloning shares the same callback.
#[derive(Clone)]
pub struct StopHandle(Arc<dyn Fn() + Send + Sync>);

impl StopHandle {
    /// Wrap a stop callback.
    pub fn new(stop: impl Fn() + Send + Sync + 'static) -> Self {
        StopHandle(Arc::new(stop))
    }

    /// A handle that does nothing.
    pub fn noop() -> Self {
        StopHandle::new(|| {})
    }

    /// Run the callback.
    pub fn stop(&self) {
        (self.0)()
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StopHandle")
    }
}

/// Boxed stream of change events.
pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// An open underlying watch: its events and a way to stop it.
///
/// The stream ending means the watch is exhausted, e.g. because the
/// upstream connection was lost.
pub struct ResourceWatch {
    events: ChangeStream,
    stop: StopHandle,
}

impl ResourceWatch {
    /// Create a watch from a stream and its stop callback.
    pub fn new<S>(events: S, stop: StopHandle) -> Self
    where
        S: Stream<Item = ChangeEvent> + Send + 'static,
    {
        Self {
            events: Box::pin(events),
            stop,
        }
    }

    /// Create a watch whose stop only drops the stream.
    pub fn from_stream<S>(events: S) -> Self
    where
        S: Stream<Item = ChangeEvent> + Send + 'static,
    {
        Self::new(events, StopHandle::noop())
    }

    pub(crate) fn into_parts(self) -> (ChangeStream, StopHandle) {
        (self.events, self.stop)
    }
}

impl fmt::Debug for ResourceWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceWatch").finish_non_exhaustive()
    }
}

/// The watch capability of a storage.
#[async_trait]
pub trait Watcher: Send + Sync + 'static {
    /// Open a watch on `namespace` (empty for all) filtered by `options`.
    async fn watch(&self, namespace: &str, options: &ListOptions)
        -> Result<ResourceWatch, BoxError>;
}

/// A storage backend serving one resource type.
pub trait Storage: Send + Sync + 'static {
    /// The encoder for this storage's objects.
    fn encoder(&self) -> Arc<dyn ObjectEncoder>;

    /// The watch capability, if this storage supports watching.
    fn watcher(self: Arc<Self>) -> Option<Arc<dyn Watcher>> {
        None
    }
}
