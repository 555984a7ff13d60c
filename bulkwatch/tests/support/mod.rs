#![allow(dead_code)]

use bulkwatch::{
    AlwaysAllow, Attributes, Authorizer, BoxError, BulkCodec, BulkRequest, BulkResponse,
    ChangeEvent, Decision, GroupVersionResource, JsonCodec, ListOptions, MemoryStorage, Object,
    ObjectEncoder, ObjectMeta, Registry, ResourceWatch, Session, SessionConfig, StopHandle,
    Storage, UserInfo, Watcher,
};
use bytes::Bytes;
use serde::Serialize;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone, Serialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub phase: String,
}

impl Pod {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            phase: "Pending".to_string(),
        }
    }

    pub fn running(mut self) -> Self {
        self.phase = "Running".to_string();
        self
    }
}

impl Object for Pod {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub metadata: ObjectMeta,
}

impl Object for Node {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A storage whose single watch is driven by the test.
pub struct Scripted {
    events: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent>>>,
    stops: Arc<AtomicUsize>,
}

impl Scripted {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let storage = Arc::new(Self {
            events: Mutex::new(Some(rx)),
            stops: Arc::default(),
        });
        (storage, tx)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Storage for Scripted {
    fn encoder(&self) -> Arc<dyn ObjectEncoder> {
        Arc::new(bulkwatch::JsonObjectEncoder::<Pod>::new())
    }

    fn watcher(self: Arc<Self>) -> Option<Arc<dyn Watcher>> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Watcher for Scripted {
    async fn watch(
        &self,
        _namespace: &str,
        _options: &ListOptions,
    ) -> Result<ResourceWatch, BoxError> {
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or("scripted storage supports a single watch")?;

        let stops = self.stops.clone();
        let stop = StopHandle::new(move || {
            stops.fetch_add(1, Ordering::SeqCst);
        });

        Ok(ResourceWatch::new(UnboundedReceiverStream::new(events), stop))
    }
}

/// An authorizer whose answer can be flipped at runtime.
#[derive(Default)]
pub struct Switch {
    denied: AtomicBool,
    calls: AtomicUsize,
}

impl Switch {
    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Authorizer for Switch {
    async fn authorize(&self, _attributes: &Attributes) -> Result<Decision, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.denied.load(Ordering::SeqCst) {
            Ok(Decision::deny("access revoked"))
        } else {
            Ok(Decision::allow())
        }
    }
}

pub fn pods_gvr() -> GroupVersionResource {
    GroupVersionResource::new("", "v1", "pods")
}

pub fn registry(pods: Arc<MemoryStorage<Pod>>) -> Registry {
    Registry::builder().register(pods_gvr(), pods).build()
}

/// A session served over in-memory channels, speaking JSON.
pub struct Harness {
    pub pods: Arc<MemoryStorage<Pod>>,
    pub session: JoinHandle<bulkwatch::Result<()>>,
    to_server: mpsc::Sender<Bytes>,
    from_server: mpsc::Receiver<Bytes>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Arc::new(AlwaysAllow), SessionConfig::default())
    }

    pub fn with(authorizer: Arc<dyn Authorizer>, config: SessionConfig) -> Self {
        let pods = Arc::new(MemoryStorage::new());
        Self::with_registry(pods.clone(), registry(pods), authorizer, config)
    }

    pub fn with_registry(
        pods: Arc<MemoryStorage<Pod>>,
        registry: Registry,
        authorizer: Arc<dyn Authorizer>,
        config: SessionConfig,
    ) -> Self {
        let (to_server, inbound) = mpsc::channel(16);
        let (outbound, from_server) = mpsc::channel(16);

        let session = Session::new(
            Arc::new(registry),
            authorizer,
            UserInfo::new("alice"),
            Arc::new(JsonCodec),
            config,
        );
        let session = tokio::spawn(session.run(inbound, outbound));

        Self {
            pods,
            session,
            to_server,
            from_server,
        }
    }

    pub async fn send(&self, request: BulkRequest) {
        let frame = JsonCodec.encode_request(&request).unwrap();
        self.send_frame(frame).await;
    }

    pub async fn send_frame(&self, frame: impl Into<Bytes>) {
        self.to_server.send(frame.into()).await.unwrap();
    }

    /// Receive the next response, failing the test if none arrives.
    pub async fn recv(&mut self) -> BulkResponse {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.from_server.recv())
            .await
            .expect("timed out waiting for a response")
            .expect("server closed the stream");
        JsonCodec.decode_response(frame).unwrap()
    }

    /// Receive responses until none arrives for a short while.
    pub async fn drain(&mut self) -> Vec<BulkResponse> {
        let mut responses = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(200), self.from_server.recv()).await
        {
            responses.push(JsonCodec.decode_response(frame).unwrap());
        }
        responses
    }

    /// Wait for the server side of the stream to close.
    pub async fn closed(&mut self) {
        while let Some(frame) =
            tokio::time::timeout(Duration::from_secs(5), self.from_server.recv())
                .await
                .expect("timed out waiting for the stream to close")
        {
            drop(frame);
        }
    }

    /// Close the client side and wait for the session to finish.
    pub async fn finish(self) -> bulkwatch::Result<()> {
        let Harness {
            session,
            to_server,
            mut from_server,
            ..
        } = self;
        drop(to_server);
        while from_server.recv().await.is_some() {}
        session.await.unwrap()
    }

    /// Drop the response receiver so further writes fail.
    pub fn stop_reading(&mut self) {
        self.from_server.close();
        while self.from_server.try_recv().is_ok() {}
    }
}

pub fn object_name(object: &Bytes) -> String {
    let value: serde_json::Value = serde_json::from_slice(object).unwrap();
    value["metadata"]["name"].as_str().unwrap().to_string()
}
