//! Crate-owned bulk-watch message types.
//!
//! These types are encoding-agnostic and serve as the interface between the
//! session logic and the codec layer. Requests and responses are sum types;
//! the JSON form goes through "raw" structs with one optional field per
//! variant so that a frame carrying zero or several variants is rejected
//! instead of being silently misread.

use crate::error::Error;
use crate::status::Status;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifies what a watch observes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSelector {
    /// API group, empty for the core group.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// API version. Empty selects the server's preferred version for `group`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Plural resource name, e.g. `pods`.
    pub resource: String,
    /// Namespace to watch, empty for all namespaces.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Watch a single object by name.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Additional list options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ListOptions>,
}

impl ResourceSelector {
    /// Create a selector for `resource` in the core group.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Default::default()
        }
    }

    /// Set the API group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Set the API version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Restrict the watch to a single object name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the list options.
    pub fn with_options(mut self, options: ListOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Filters applied by the storage when opening a watch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListOptions {
    /// Equality-based label selector, e.g. `app=web,tier!=db`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub label_selector: String,
    /// Field selector, e.g. `metadata.name=web-0`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub field_selector: String,
    /// Resource version to start watching from; interpretation is up to the storage.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

/// A client-to-server protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBulkRequest", into = "RawBulkRequest")]
pub struct BulkRequest {
    /// Client-assigned id echoed on the direct response.
    pub request_id: Option<String>,
    /// The operation requested.
    pub kind: RequestKind,
}

/// The operations a client can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Open a new watch.
    Watch {
        /// Client-chosen id, unique among the connection's active watches.
        watch_id: String,
        /// What to watch.
        selector: ResourceSelector,
    },
    /// Stop an active watch.
    StopWatch {
        /// Id of the watch to stop.
        watch_id: String,
    },
}

impl BulkRequest {
    /// Build a `Watch` request.
    pub fn watch(watch_id: impl Into<String>, selector: ResourceSelector) -> Self {
        Self {
            request_id: None,
            kind: RequestKind::Watch {
                watch_id: watch_id.into(),
                selector,
            },
        }
    }

    /// Build a `StopWatch` request.
    pub fn stop_watch(watch_id: impl Into<String>) -> Self {
        Self {
            request_id: None,
            kind: RequestKind::StopWatch {
                watch_id: watch_id.into(),
            },
        }
    }

    /// Set the correlation id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// The watch id this request refers to.
    pub fn watch_id(&self) -> &str {
        match &self.kind {
            RequestKind::Watch { watch_id, .. } | RequestKind::StopWatch { watch_id } => watch_id,
        }
    }
}

/// A server-to-client protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBulkResponse", into = "RawBulkResponse")]
pub struct BulkResponse {
    /// Echo of the request id this response answers. Never set on watch events.
    pub request_id: Option<String>,
    /// The response payload.
    pub kind: ResponseKind,
}

/// The responses a server can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// A watch was accepted; its events follow.
    WatchStarted {
        /// Id of the started watch.
        watch_id: String,
    },
    /// A watch terminated; nothing more follows for its id.
    WatchStopped {
        /// Id of the stopped watch.
        watch_id: String,
    },
    /// A change observed by a watch.
    WatchEvent {
        /// Id of the watch that observed the change.
        watch_id: String,
        /// The change.
        event: WatchEvent,
    },
    /// A request was rejected.
    Failure(Status),
}

impl BulkResponse {
    fn new(kind: ResponseKind) -> Self {
        Self {
            request_id: None,
            kind,
        }
    }

    /// Build a `WatchStarted` response.
    pub fn watch_started(watch_id: impl Into<String>) -> Self {
        Self::new(ResponseKind::WatchStarted {
            watch_id: watch_id.into(),
        })
    }

    /// Build a `WatchStopped` response.
    pub fn watch_stopped(watch_id: impl Into<String>) -> Self {
        Self::new(ResponseKind::WatchStopped {
            watch_id: watch_id.into(),
        })
    }

    /// Build a `WatchEvent` response.
    pub fn watch_event(watch_id: impl Into<String>, event: WatchEvent) -> Self {
        Self::new(ResponseKind::WatchEvent {
            watch_id: watch_id.into(),
            event,
        })
    }

    /// Build a `Failure` response.
    pub fn failure(status: Status) -> Self {
        Self::new(ResponseKind::Failure(status))
    }

    /// Correlate this response with a request.
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// The watch id this response refers to, if any.
    pub fn watch_id(&self) -> Option<&str> {
        match &self.kind {
            ResponseKind::WatchStarted { watch_id }
            | ResponseKind::WatchStopped { watch_id }
            | ResponseKind::WatchEvent { watch_id, .. } => Some(watch_id),
            ResponseKind::Failure(_) => None,
        }
    }
}

/// The kind of change a storage reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// An object was created.
    Added,
    /// An object was updated.
    Modified,
    /// An object was removed.
    Deleted,
    /// The watch failed; the payload is a status.
    Error,
}

/// Payload of a `WatchEvent` response.
///
/// Object bytes are produced by the watched resource's own encoder and are
/// opaque to the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// An object was created.
    Added(Bytes),
    /// An object was updated.
    Modified(Bytes),
    /// An object was removed.
    Deleted(Bytes),
    /// The watch failed and terminates after this event.
    Error(Status),
}

impl WatchEvent {
    /// Wrap encoded object bytes as an event of the given type.
    ///
    /// `EventType::Error` carries a status rather than an object, so the
    /// bytes are reported as an internal error in that case.
    pub fn from_object(event_type: EventType, object: Bytes) -> Self {
        match event_type {
            EventType::Added => WatchEvent::Added(object),
            EventType::Modified => WatchEvent::Modified(object),
            EventType::Deleted => WatchEvent::Deleted(object),
            EventType::Error => WatchEvent::Error(Status::internal(
                "error events must carry a status, not an object",
            )),
        }
    }

    /// The event's type.
    pub fn event_type(&self) -> EventType {
        match self {
            WatchEvent::Added(_) => EventType::Added,
            WatchEvent::Modified(_) => EventType::Modified,
            WatchEvent::Deleted(_) => EventType::Deleted,
            WatchEvent::Error(_) => EventType::Error,
        }
    }

    /// The encoded object, unless this is an error event.
    pub fn object(&self) -> Option<&Bytes> {
        match self {
            WatchEvent::Added(object)
            | WatchEvent::Modified(object)
            | WatchEvent::Deleted(object) => Some(object),
            WatchEvent::Error(_) => None,
        }
    }
}

// ===== raw JSON shapes =====

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawBulkRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    watch: Option<RawWatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop_watch: Option<RawWatchRef>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWatch {
    #[serde(default)]
    watch_id: String,
    #[serde(default)]
    selector: ResourceSelector,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWatchRef {
    #[serde(default)]
    watch_id: String,
}

impl TryFrom<RawBulkRequest> for BulkRequest {
    type Error = Error;

    fn try_from(raw: RawBulkRequest) -> Result<Self, Self::Error> {
        let request_id = raw.request_id;
        let invalid = |message: &str| Error::InvalidRequest {
            request_id: request_id.clone(),
            message: message.to_string(),
        };

        let kind = match (raw.watch, raw.stop_watch) {
            (Some(watch), None) => RequestKind::Watch {
                watch_id: watch.watch_id,
                selector: watch.selector,
            },
            (None, Some(stop)) => RequestKind::StopWatch {
                watch_id: stop.watch_id,
            },
            (None, None) => return Err(invalid("request has no operation set")),
            (Some(_), Some(_)) => return Err(invalid("request has more than one operation set")),
        };

        let watch_id = match &kind {
            RequestKind::Watch { watch_id, .. } | RequestKind::StopWatch { watch_id } => watch_id,
        };
        if let Err(message) = validate_watch_id(watch_id) {
            return Err(invalid(message));
        }

        Ok(BulkRequest { request_id, kind })
    }
}

pub(crate) fn validate_watch_id(watch_id: &str) -> Result<(), &'static str> {
    if watch_id.is_empty() {
        return Err("watch id must not be empty");
    }

    Ok(())
}

impl From<BulkRequest> for RawBulkRequest {
    fn from(request: BulkRequest) -> Self {
        let mut raw = RawBulkRequest {
            request_id: request.request_id,
            ..Default::default()
        };

        match request.kind {
            RequestKind::Watch { watch_id, selector } => {
                raw.watch = Some(RawWatch { watch_id, selector })
            }
            RequestKind::StopWatch { watch_id } => raw.stop_watch = Some(RawWatchRef { watch_id }),
        }

        raw
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBulkResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    watch_started: Option<RawWatchRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    watch_stopped: Option<RawWatchRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    watch_event: Option<RawWatchEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<RawFailure>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWatchEvent {
    watch_id: String,
    event: RawEvent,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFailure {
    status: Status,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: EventType,
    /// Standard base64 of the encoded object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<Status>,
}

impl TryFrom<RawEvent> for WatchEvent {
    type Error = Error;

    fn try_from(raw: RawEvent) -> Result<Self, Error> {
        match (raw.event_type, raw.object, raw.status) {
            (EventType::Error, None, Some(status)) => Ok(WatchEvent::Error(status)),
            (EventType::Error, _, _) => Err(Error::Decode(
                "error event must carry only a status".to_string(),
            )),
            (event_type, Some(object), None) => {
                let object = base64::engine::general_purpose::STANDARD
                    .decode(object)
                    .map_err(|e| Error::Decode(format!("invalid event object: {e}")))?;
                Ok(WatchEvent::from_object(event_type, Bytes::from(object)))
            }
            (event_type, _, _) => Err(Error::Decode(format!(
                "{event_type:?} event must carry only an object"
            ))),
        }
    }
}

impl From<WatchEvent> for RawEvent {
    fn from(event: WatchEvent) -> Self {
        let event_type = event.event_type();
        match event {
            WatchEvent::Error(status) => RawEvent {
                event_type,
                object: None,
                status: Some(status),
            },
            WatchEvent::Added(object) | WatchEvent::Modified(object) | WatchEvent::Deleted(object) => {
                RawEvent {
                    event_type,
                    object: Some(base64::engine::general_purpose::STANDARD.encode(object)),
                    status: None,
                }
            }
        }
    }
}

impl TryFrom<RawBulkResponse> for BulkResponse {
    type Error = Error;

    fn try_from(raw: RawBulkResponse) -> Result<Self, Self::Error> {
        let mut kinds = Vec::with_capacity(1);

        if let Some(started) = raw.watch_started {
            kinds.push(ResponseKind::WatchStarted {
                watch_id: started.watch_id,
            });
        }
        if let Some(stopped) = raw.watch_stopped {
            kinds.push(ResponseKind::WatchStopped {
                watch_id: stopped.watch_id,
            });
        }
        if let Some(event) = raw.watch_event {
            kinds.push(ResponseKind::WatchEvent {
                watch_id: event.watch_id,
                event: event.event.try_into()?,
            });
        }
        if let Some(failure) = raw.failure {
            kinds.push(ResponseKind::Failure(failure.status));
        }

        match (kinds.pop(), kinds.is_empty()) {
            (Some(kind), true) => Ok(BulkResponse {
                request_id: raw.request_id,
                kind,
            }),
            (Some(_), false) => Err(Error::Decode(
                "response has more than one variant set".to_string(),
            )),
            (None, _) => Err(Error::Decode("response has no variant set".to_string())),
        }
    }
}

impl From<BulkResponse> for RawBulkResponse {
    fn from(response: BulkResponse) -> Self {
        let mut raw = RawBulkResponse {
            request_id: response.request_id,
            ..Default::default()
        };

        match response.kind {
            ResponseKind::WatchStarted { watch_id } => {
                raw.watch_started = Some(RawWatchRef { watch_id })
            }
            ResponseKind::WatchStopped { watch_id } => {
                raw.watch_stopped = Some(RawWatchRef { watch_id })
            }
            ResponseKind::WatchEvent { watch_id, event } => {
                raw.watch_event = Some(RawWatchEvent {
                    watch_id,
                    event: event.into(),
                })
            }
            ResponseKind::Failure(status) => raw.failure = Some(RawFailure { status }),
        }

        raw
    }
}
