//! A multiplexed bulk-watch protocol engine.
//!
//! One client connection carries many independent resource watches over a
//! single duplex stream of frames. The client opens watches with
//! `Watch{watch_id, selector}` requests and closes them with
//! `StopWatch{watch_id}`; the server answers with `WatchStarted`,
//! `WatchEvent`, `WatchStopped` and `Failure` responses. While a watch is
//! open its permission is rechecked periodically, so a revoked grant ends
//! the watch within one recheck interval.
//!
//! This crate does not implement storage or authorization policy. It
//! consumes them through the [`Storage`], [`Watcher`] and [`Authorizer`]
//! traits, and ships [`MemoryStorage`] for tests and demos.
//!
//! # Example
//!
//! ```no_run
//! use bulkwatch::{
//!     AlwaysAllow, GroupVersionResource, JsonCodec, MemoryStorage, Object, ObjectMeta, Registry,
//!     Session, SessionConfig, UserInfo,
//! };
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! #[derive(serde::Serialize)]
//! struct Pod {
//!     metadata: ObjectMeta,
//! }
//!
//! impl Object for Pod {
//!     fn meta(&self) -> &ObjectMeta {
//!         &self.metadata
//!     }
//!
//!     fn as_any(&self) -> &dyn std::any::Any {
//!         self
//!     }
//! }
//!
//! # async fn example() -> bulkwatch::Result<()> {
//! let pods = Arc::new(MemoryStorage::<Pod>::new());
//! let registry = Registry::builder()
//!     .register(GroupVersionResource::new("", "v1", "pods"), pods.clone())
//!     .build();
//!
//! let session = Session::new(
//!     Arc::new(registry),
//!     Arc::new(AlwaysAllow),
//!     UserInfo::new("alice"),
//!     Arc::new(JsonCodec),
//!     SessionConfig::default(),
//! );
//!
//! // Frames from and to the client; any `FrameSource`/`FrameSink` works.
//! let (_to_server, inbound) = mpsc::channel::<bytes::Bytes>(16);
//! let (outbound, _from_server) = mpsc::channel::<bytes::Bytes>(16);
//! session.run(inbound, outbound).await
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - `transport-tonic`: Enables [`BulkWatchServer`] and [`BulkWatchClient`],
//!   which carry sessions over a bidirectional gRPC method. Enabled by default.

pub mod auth;
pub mod codec;
pub mod error;
pub mod message;
pub mod registry;
pub mod selector;
pub mod session;
pub mod status;
pub mod storage;
pub mod transport;

pub use auth::{AlwaysAllow, Attributes, Authorizer, Decision, PermissionCache, UserInfo};
pub use codec::{BulkCodec, Encoding, JsonCodec, ProstCodec};
pub use error::{BoxError, Error, Result};
pub use message::{
    BulkRequest, BulkResponse, EventType, ListOptions, RequestKind, ResourceSelector,
    ResponseKind, WatchEvent,
};
pub use registry::{LookupError, Registry, RegistryBuilder, WatchTarget};
pub use selector::{GroupVersionResource, ResolvedSelector};
pub use session::{Session, SessionConfig};
pub use status::{Code, Status};
pub use storage::memory::MemoryStorage;
pub use storage::{
    ChangeEvent, JsonObjectEncoder, Object, ObjectEncoder, ObjectMeta, ResourceWatch, StopHandle,
    Storage, Watcher,
};
pub use transport::{FrameSink, FrameSource};

// Tonic transport
#[cfg(feature = "transport-tonic")]
pub use transport::tonic::{BulkWatchClient, BulkWatchServer, BulkWatchStream};
