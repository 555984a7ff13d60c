//! One open watch and the task that pumps its events.

use super::Shared;
use crate::auth::{Attributes, Decision, PermissionCache};
use crate::message::{BulkResponse, WatchEvent};
use crate::status::Status;
use crate::storage::{ChangeEvent, ChangeStream, ObjectEncoder, StopHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// An active watch as seen by the session map.
pub(crate) struct Subscription {
    watch_id: String,
    stop: StopHandle,
    source_stopped: AtomicBool,
    state: Mutex<StopState>,
    token: CancellationToken,
}

#[derive(Default)]
struct StopState {
    requested: bool,
    finished: bool,
    request_id: Option<String>,
}

impl Subscription {
    pub(crate) fn new(watch_id: String, stop: StopHandle, token: CancellationToken) -> Self {
        Self {
            watch_id,
            stop,
            source_stopped: AtomicBool::new(false),
            state: Mutex::default(),
            token,
        }
    }

    pub(crate) fn watch_id(&self) -> &str {
        &self.watch_id
    }

    /// Ask the pump to stop, remembering `request_id` for its `WatchStopped`.
    ///
    /// Returns false if a stop was already requested or the pump is exiting.
    pub(crate) fn request_stop(&self, request_id: Option<String>) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.requested || state.finished {
                return false;
            }
            state.requested = true;
            state.request_id = request_id;
        }

        self.stop_source();
        self.token.cancel();
        true
    }

    /// Stop the underlying watch. Only the first call has an effect.
    pub(crate) fn stop_source(&self) {
        if !self.source_stopped.swap(true, Ordering::AcqRel) {
            trace!(watch_id = %self.watch_id, "stopping underlying watch");
            self.stop.stop();
        }
    }

    /// Refuse further stop requests and return the one that was accepted.
    fn finish(&self) -> (bool, Option<String>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.finished = true;
        (state.requested, state.request_id.take())
    }
}

/// Why a pump exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    StopRequested,
    SourceExhausted,
    DeliveryFailed,
    SessionClosed,
}

/// Everything a running pump owns besides its [`Subscription`].
pub(crate) struct Pump {
    pub(crate) subscription: Arc<Subscription>,
    pub(crate) events: ChangeStream,
    pub(crate) encoder: Arc<dyn ObjectEncoder>,
    pub(crate) permissions: PermissionCache,
}

impl Pump {
    pub(crate) async fn run(mut self, shared: Arc<Shared>) {
        let exit = self.pump(&shared).await;
        let subscription = &self.subscription;

        let (stop_requested, request_id) = subscription.finish();
        subscription.stop_source();

        debug!(?exit, "watch terminated");

        // The id stays reserved until WatchStopped is queued, so a re-watch
        // under the same id is always answered after it.
        if exit != Exit::SessionClosed {
            // A stop that raced with exhaustion or failure is still answered.
            let request_id = if stop_requested { request_id } else { None };
            let stopped =
                BulkResponse::watch_stopped(subscription.watch_id()).with_request_id(request_id);
            shared.enqueue(stopped).await;
        }

        shared.remove(subscription);
    }

    async fn pump(&mut self, shared: &Shared) -> Exit {
        loop {
            let event = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return Exit::SessionClosed,
                _ = self.subscription.token.cancelled() => return Exit::StopRequested,
                event = self.events.next() => event,
            };

            let Some(event) = event else {
                return Exit::SourceExhausted;
            };

            let response = match self.deliver(event).await {
                Ok(event) => event,
                Err(status) => {
                    warn!(%status, "watch delivery failed");
                    let event = WatchEvent::Error(status);
                    let failed = BulkResponse::watch_event(self.subscription.watch_id(), event);
                    if !shared.enqueue(failed).await {
                        return Exit::SessionClosed;
                    }
                    return Exit::DeliveryFailed;
                }
            };

            let response = BulkResponse::watch_event(self.subscription.watch_id(), response);
            if !shared.enqueue(response).await {
                return Exit::SessionClosed;
            }
        }
    }

    /// Recheck permission and encode one change.
    async fn deliver(&mut self, event: ChangeEvent) -> Result<WatchEvent, Status> {
        let object = match &event {
            ChangeEvent::Error(status) => return Err(status.clone()),
            ChangeEvent::Added(object)
            | ChangeEvent::Modified(object)
            | ChangeEvent::Deleted(object) => object,
        };

        match self.permissions.check().await {
            Ok(decision) if decision.allowed => {}
            Ok(decision) => return Err(denied(self.permissions.attributes(), &decision)),
            Err(err) => return Err(Status::internal(err.to_string())),
        }

        let bytes = self
            .encoder
            .encode(&**object)
            .map_err(|err| Status::internal(format!("failed to encode object: {err}")))?;

        trace!(event_type = ?event.event_type(), "delivering change");

        Ok(WatchEvent::from_object(event.event_type(), bytes))
    }
}

/// The status reported when `attributes` are not allowed.
pub(crate) fn denied(attributes: &Attributes, decision: &Decision) -> Status {
    let mut message = format!(
        "user {:?} cannot watch resource {:?} in API group {:?}",
        attributes.user.name, attributes.resource, attributes.group
    );
    if !attributes.namespace.is_empty() {
        message.push_str(&format!(" in namespace {:?}", attributes.namespace));
    }
    if !decision.reason.is_empty() {
        message.push_str(": ");
        message.push_str(&decision.reason);
    }

    Status::permission_denied(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserInfo;
    use crate::selector::{GroupVersionResource, ResolvedSelector};
    use crate::{Code, ListOptions};
    use std::sync::atomic::AtomicUsize;

    fn counting_subscription() -> (Subscription, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let stop = StopHandle::new({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        let subscription = Subscription::new("w1".to_string(), stop, CancellationToken::new());
        (subscription, calls)
    }

    #[test]
    fn stop_is_idempotent() {
        let (subscription, calls) = counting_subscription();

        assert!(subscription.request_stop(Some("r1".to_string())));
        assert!(!subscription.request_stop(Some("r2".to_string())));
        subscription.stop_source();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(subscription.token.is_cancelled());
        assert_eq!(subscription.finish(), (true, Some("r1".to_string())));
    }

    #[test]
    fn stop_after_finish_is_refused() {
        let (subscription, calls) = counting_subscription();

        assert_eq!(subscription.finish(), (false, None));
        assert!(!subscription.request_stop(None));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn denial_message() {
        let selector = ResolvedSelector {
            gvr: GroupVersionResource::new("apps", "v1", "deployments"),
            namespace: "prod".to_string(),
            name: String::new(),
            options: ListOptions::default(),
        };
        let attributes = Attributes::watch(UserInfo::new("bob"), &selector);

        let status = denied(&attributes, &Decision::deny("no RBAC rule matched"));
        assert_eq!(status.code(), Code::PermissionDenied);
        assert_eq!(
            status.message(),
            r#"user "bob" cannot watch resource "deployments" in API group "apps" in namespace "prod": no RBAC rule matched"#
        );
    }
}
