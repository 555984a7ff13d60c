//! Connection sessions.
//!
//! A [`Session`] serves one client connection. It runs three kinds of tasks
//! that coordinate through a single outbound queue and a single
//! cancellation token:
//!
//! - the inbound reader, which is the task calling [`Session::run`];
//! - one outbound writer, spawned by `run`;
//! - one event pump per open watch, tracked by a [`TaskTracker`].
//!
//! Every enqueue races the cancellation token, so a stalled writer can never
//! wedge a pump or the reader. Responses for one watch are produced by one
//! task at a time and are therefore strictly ordered.

mod config;
mod subscription;

pub use self::config::{SessionConfig, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_PERMISSION_RECHECK};

use self::subscription::{denied, Pump, Subscription};
use crate::auth::{Attributes, Authorizer, PermissionCache, UserInfo};
use crate::codec::BulkCodec;
use crate::error::{Error, Result};
use crate::message::{validate_watch_id, BulkRequest, BulkResponse, RequestKind, ResourceSelector};
use crate::registry::{LookupError, Registry};
use crate::status::Status;
use crate::transport::{FrameSink, FrameSource};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, debug_span, info_span, trace, warn, Instrument};

/// The protocol state of one client connection.
pub struct Session {
    shared: Arc<Shared>,
    codec: Arc<dyn BulkCodec>,
    outbound: mpsc::Receiver<BulkResponse>,
}

pub(crate) struct Shared {
    registry: Arc<Registry>,
    authorizer: Arc<dyn Authorizer>,
    user: UserInfo,
    config: SessionConfig,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    outbound: mpsc::Sender<BulkResponse>,
    cancel: CancellationToken,
    aborted: AtomicBool,
    cause: Mutex<Option<Error>>,
    last_activity: Mutex<Instant>,
    pumps: TaskTracker,
}

impl Session {
    /// Create a session for a connection authenticated as `user`.
    pub fn new(
        registry: Arc<Registry>,
        authorizer: Arc<dyn Authorizer>,
        user: UserInfo,
        codec: Arc<dyn BulkCodec>,
        config: SessionConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.outbound_capacity.max(1));

        let shared = Arc::new(Shared {
            registry,
            authorizer,
            user,
            config,
            subscriptions: Mutex::default(),
            outbound: tx,
            cancel: CancellationToken::new(),
            aborted: AtomicBool::new(false),
            cause: Mutex::default(),
            last_activity: Mutex::new(Instant::now()),
            pumps: TaskTracker::new(),
        });

        Self {
            shared,
            codec,
            outbound: rx,
        }
    }

    /// The identity this session acts as.
    pub fn user(&self) -> &UserInfo {
        &self.shared.user
    }

    /// A token that ends the session when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Number of currently registered watches.
    pub fn watch_count(&self) -> usize {
        lock(&self.shared.subscriptions).len()
    }

    /// Dispatch one request.
    ///
    /// An `Err` is a rejected request; the caller answers it with a
    /// `Failure` correlated to the request id.
    pub async fn handle(&self, request: BulkRequest) -> Result<(), Status> {
        self.shared.handle(request).await
    }

    /// Serve the connection until the client goes away, the session is
    /// cancelled or a fatal error occurs.
    ///
    /// Every watch is stopped before this returns. A clean close returns
    /// `Ok(())`, otherwise the first fatal error is returned.
    pub async fn run<R, W>(self, mut source: R, sink: W) -> Result<()>
    where
        R: FrameSource,
        W: FrameSink,
    {
        let Session {
            shared,
            codec,
            outbound,
        } = self;

        let span = info_span!("bulkwatch_session", user = %shared.user.name);

        async move {
            debug!("session started");

            let writer = tokio::spawn(
                write_loop(shared.clone(), codec.clone(), outbound, sink).in_current_span(),
            );

            let result = shared.read_loop(&*codec, &mut source).await;
            shared.abort(result.err());

            shared.pumps.close();
            shared.pumps.wait().await;

            if let Err(err) = writer.await {
                warn!(%err, "outbound writer panicked");
            }

            match lock(&shared.cause).take() {
                Some(err) => Err(err),
                None => {
                    debug!("session closed");
                    Ok(())
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.shared.user)
            .field("config", &self.shared.config)
            .field("watches", &self.watch_count())
            .finish()
    }
}

impl Shared {
    async fn handle(self: &Arc<Self>, request: BulkRequest) -> Result<(), Status> {
        validate_watch_id(request.watch_id()).map_err(Status::invalid_argument)?;

        let BulkRequest { request_id, kind } = request;
        match kind {
            RequestKind::Watch { watch_id, selector } => {
                self.start_watch(request_id, watch_id, selector).await
            }
            RequestKind::StopWatch { watch_id } => self.stop_watch(request_id, &watch_id),
        }
    }

    async fn start_watch(
        self: &Arc<Self>,
        request_id: Option<String>,
        watch_id: String,
        selector: ResourceSelector,
    ) -> Result<(), Status> {
        self.check_capacity(&watch_id)?;

        let resolved = selector.resolve(&self.registry)?;
        let target = self.registry.lookup(&resolved.gvr).map_err(|err| match err {
            LookupError::NotFound(_) => Status::not_found(err.to_string()),
            LookupError::NotWatchable(_) => Status::unimplemented(err.to_string()),
        })?;

        let attributes = Attributes::watch(self.user.clone(), &resolved);
        let mut permissions = PermissionCache::new(
            self.authorizer.clone(),
            attributes,
            self.config.permission_recheck,
        );
        match permissions.check().await {
            Ok(decision) if decision.allowed => {}
            Ok(decision) => return Err(denied(permissions.attributes(), &decision)),
            Err(err) => return Err(Status::internal(err.to_string())),
        }

        let watch = target
            .watcher
            .watch(&resolved.namespace, &resolved.options)
            .await
            .map_err(Status::from_error)?;
        let (events, stop) = watch.into_parts();

        let subscription = Arc::new(Subscription::new(
            watch_id.clone(),
            stop,
            self.cancel.child_token(),
        ));

        // The map may have changed while the watch was opening.
        if let Err(status) = self.insert(&subscription) {
            subscription.stop_source();
            return Err(status);
        }

        debug!(
            watch_id = %watch_id,
            gvr = %resolved.gvr,
            namespace = %resolved.namespace,
            "watch started"
        );

        let started = BulkResponse::watch_started(watch_id.as_str()).with_request_id(request_id);
        self.enqueue(started).await;

        let pump = Pump {
            subscription,
            events,
            encoder: target.encoder,
            permissions,
        };
        let span = debug_span!("watch", watch_id = %watch_id);
        self.pumps.spawn(pump.run(self.clone()).instrument(span));

        Ok(())
    }

    fn stop_watch(&self, request_id: Option<String>, watch_id: &str) -> Result<(), Status> {
        let subscription = lock(&self.subscriptions)
            .get(watch_id)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("watch {watch_id:?} not found")))?;

        if !subscription.request_stop(request_id) {
            return Err(Status::not_found(format!(
                "watch {watch_id:?} is already stopping"
            )));
        }

        debug!(watch_id, "watch stop requested");
        Ok(())
    }

    fn check_capacity(&self, watch_id: &str) -> Result<(), Status> {
        let subscriptions = lock(&self.subscriptions);

        if subscriptions.contains_key(watch_id) {
            return Err(Status::already_exists(format!(
                "watch {watch_id:?} already exists"
            )));
        }

        if let Some(max) = self.config.max_watches {
            if subscriptions.len() >= max {
                return Err(Status::resource_exhausted(format!(
                    "connection already has the maximum of {max} watches"
                )));
            }
        }

        Ok(())
    }

    fn insert(&self, subscription: &Arc<Subscription>) -> Result<(), Status> {
        self.check_capacity(subscription.watch_id())?;

        lock(&self.subscriptions).insert(subscription.watch_id().to_string(), subscription.clone());
        Ok(())
    }

    /// Remove `subscription`, unless its id has already been taken over.
    pub(crate) fn remove(&self, subscription: &Arc<Subscription>) {
        let mut subscriptions = lock(&self.subscriptions);

        let same = subscriptions
            .get(subscription.watch_id())
            .is_some_and(|current| Arc::ptr_eq(current, subscription));
        if same {
            subscriptions.remove(subscription.watch_id());
        }
    }

    /// Queue a response for the writer.
    ///
    /// Returns false once the session is shutting down.
    pub(crate) async fn enqueue(&self, response: BulkResponse) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.outbound.send(response) => sent.is_ok(),
        }
    }

    /// Raise the cancellation signal, recording the first fatal cause.
    fn abort(&self, cause: Option<Error>) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            match &cause {
                Some(err) => warn!(%err, "session failed"),
                None => debug!("session closing"),
            }
            *lock(&self.cause) = cause;
        }

        self.cancel.cancel();
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    async fn idle_timeout(&self) -> Error {
        let Some(timeout) = self.config.idle_timeout else {
            return std::future::pending().await;
        };

        loop {
            // A timeout too large to represent never fires.
            let last_activity = *lock(&self.last_activity);
            let Some(deadline) = last_activity.checked_add(timeout) else {
                return std::future::pending().await;
            };
            if Instant::now() >= deadline {
                return Error::IdleTimeout(timeout);
            }
            tokio::time::sleep_until(deadline).await;
        }
    }

    async fn read_loop<R: FrameSource>(
        self: &Arc<Self>,
        codec: &dyn BulkCodec,
        source: &mut R,
    ) -> Result<()> {
        let idle = self.idle_timeout();
        tokio::pin!(idle);

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                err = &mut idle => return Err(err),
                frame = source.recv() => frame?,
            };

            let Some(frame) = frame else {
                debug!("client closed the stream");
                return Ok(());
            };
            self.touch();

            if frame.is_empty() {
                trace!("skipping empty frame");
                continue;
            }

            let request = match codec.decode_request(frame) {
                Ok(request) => request,
                Err(Error::InvalidRequest {
                    request_id,
                    message,
                }) => {
                    debug!(%message, "invalid request");
                    let failure = BulkResponse::failure(Status::invalid_argument(message))
                        .with_request_id(request_id);
                    self.enqueue(failure).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            trace!(?request, "received request");

            let request_id = request.request_id.clone();
            if let Err(status) = self.handle(request).await {
                debug!(%status, "request rejected");
                self.enqueue(BulkResponse::failure(status).with_request_id(request_id))
                    .await;
            }
        }
    }
}

async fn write_loop<W: FrameSink>(
    shared: Arc<Shared>,
    codec: Arc<dyn BulkCodec>,
    mut outbound: mpsc::Receiver<BulkResponse>,
    mut sink: W,
) {
    loop {
        let response = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            response = outbound.recv() => match response {
                Some(response) => response,
                None => break,
            },
        };

        let frame = match codec.encode_response(&response) {
            Ok(frame) => frame,
            Err(err) => {
                shared.abort(Some(err));
                break;
            }
        };

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            sent = sink.send(frame) => {
                if let Err(err) = sent {
                    shared.abort(Some(err));
                    break;
                }
            }
        }

        shared.touch();
    }

    trace!("outbound writer stopped");
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
