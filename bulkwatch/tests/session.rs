mod support;

use bulkwatch::{
    AlwaysAllow, BulkRequest, BulkResponse, ChangeEvent, Code, Error, EventType,
    GroupVersionResource, MemoryStorage, Registry, ResourceSelector, ResponseKind, SessionConfig,
    Status,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use support::{object_name, Harness, Node, Pod, Scripted, Switch};

fn pods_in(namespace: &str) -> ResourceSelector {
    ResourceSelector::new("pods").with_namespace(namespace)
}

fn correlated(response: BulkResponse, request_id: &str) -> BulkResponse {
    response.with_request_id(Some(request_id.to_string()))
}

/// Unpack a watch event as `(type, object name)`, or `(Error, message)`.
fn event(response: &BulkResponse) -> (String, EventType, String) {
    let ResponseKind::WatchEvent { watch_id, event } = &response.kind else {
        panic!("expected a watch event, got {response:?}");
    };
    assert_eq!(response.request_id, None, "events are never correlated");

    let detail = match event.object() {
        Some(object) => object_name(object),
        None => match event {
            bulkwatch::WatchEvent::Error(status) => status.to_string(),
            _ => unreachable!(),
        },
    };
    (watch_id.clone(), event.event_type(), detail)
}

fn failure(response: &BulkResponse) -> &Status {
    match &response.kind {
        ResponseKind::Failure(status) => status,
        _ => panic!("expected a failure, got {response:?}"),
    }
}

#[tokio::test]
async fn watch_delivers_changes_in_namespace() {
    let mut harness = Harness::new();

    harness
        .send(BulkRequest::watch("w1", pods_in("default")).with_request_id("r1"))
        .await;
    assert_eq!(
        harness.recv().await,
        correlated(BulkResponse::watch_started("w1"), "r1")
    );

    harness.pods.add(Pod::new("kube-system", "dns"));
    harness.pods.add(Pod::new("default", "web-0"));
    harness.pods.modify(Pod::new("default", "web-0").running());
    harness.pods.delete(Pod::new("default", "web-0"));

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(event(&harness.recv().await));
    }
    let w1 = |ty, name: &str| ("w1".to_string(), ty, name.to_string());
    assert_eq!(
        seen,
        vec![
            w1(EventType::Added, "web-0"),
            w1(EventType::Modified, "web-0"),
            w1(EventType::Deleted, "web-0"),
        ]
    );

    assert!(harness.drain().await.is_empty());
    harness.finish().await.unwrap();
}

#[tokio::test]
async fn stop_ends_the_watch() {
    let mut harness = Harness::new();

    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    harness.recv().await;
    harness.pods.add(Pod::new("default", "web-0"));
    assert_eq!(event(&harness.recv().await).2, "web-0");

    harness
        .send(BulkRequest::stop_watch("w1").with_request_id("r2"))
        .await;
    assert_eq!(
        harness.recv().await,
        correlated(BulkResponse::watch_stopped("w1"), "r2")
    );
    assert_eq!(harness.pods.watch_count(), 0);

    harness.pods.add(Pod::new("default", "web-1"));
    assert!(harness.drain().await.is_empty());

    // The id is free again.
    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    assert_eq!(harness.recv().await, BulkResponse::watch_started("w1"));
}

#[tokio::test]
async fn unknown_resource_fails_without_subscribing() {
    let mut harness = Harness::new();

    harness
        .send(BulkRequest::watch("w2", ResourceSelector::new("widgets")).with_request_id("r3"))
        .await;

    let response = harness.recv().await;
    assert_eq!(response.request_id.as_deref(), Some("r3"));
    let status = failure(&response);
    assert_eq!(status.code(), Code::NotFound);
    assert!(status.message().contains("unsupported resource"), "{status}");
    assert_eq!(harness.pods.watch_count(), 0);

    // The session is still usable.
    harness.send(BulkRequest::watch("w2", pods_in("default"))).await;
    assert_eq!(harness.recv().await, BulkResponse::watch_started("w2"));
}

#[tokio::test(start_paused = true)]
async fn revoked_permission_ends_watch_after_recheck() {
    let switch = Arc::new(Switch::default());
    let config = SessionConfig::default().with_permission_recheck(Duration::from_secs(10));
    let mut harness = Harness::with(switch.clone(), config);

    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    harness.recv().await;
    assert_eq!(switch.calls(), 1);

    harness.pods.add(Pod::new("default", "web-0"));
    assert_eq!(event(&harness.recv().await).2, "web-0");

    // The cached grant still covers this event.
    switch.deny();
    harness.pods.add(Pod::new("default", "web-1"));
    assert_eq!(event(&harness.recv().await).2, "web-1");
    assert_eq!(switch.calls(), 1);

    tokio::time::advance(Duration::from_secs(11)).await;
    harness.pods.add(Pod::new("default", "web-2"));

    let response = harness.recv().await;
    let ResponseKind::WatchEvent {
        event: bulkwatch::WatchEvent::Error(status),
        ..
    } = &response.kind
    else {
        panic!("expected an error event, got {response:?}");
    };
    assert_eq!(status.code(), Code::PermissionDenied);
    assert!(status.message().ends_with("access revoked"), "{status}");
    assert_eq!(switch.calls(), 2);

    assert_eq!(harness.recv().await, BulkResponse::watch_stopped("w1"));

    harness.pods.add(Pod::new("default", "web-3"));
    assert!(harness.drain().await.is_empty());
    assert_eq!(harness.pods.watch_count(), 0);
}

#[tokio::test]
async fn duplicate_id_leaves_existing_watch_alone() {
    let mut harness = Harness::new();

    harness
        .send(BulkRequest::watch("w1", pods_in("default")).with_request_id("r1"))
        .await;
    harness
        .send(BulkRequest::watch("w1", pods_in("other")).with_request_id("r2"))
        .await;

    assert_eq!(
        harness.recv().await,
        correlated(BulkResponse::watch_started("w1"), "r1")
    );
    let response = harness.recv().await;
    assert_eq!(response.request_id.as_deref(), Some("r2"));
    assert_eq!(failure(&response).code(), Code::AlreadyExists);
    assert_eq!(harness.pods.watch_count(), 1);

    harness.pods.add(Pod::new("other", "db-0"));
    harness.pods.add(Pod::new("default", "web-0"));
    assert_eq!(
        event(&harness.recv().await),
        ("w1".to_string(), EventType::Added, "web-0".to_string())
    );
}

#[tokio::test]
async fn unknown_stop_leaves_existing_watch_alone() {
    let mut harness = Harness::new();

    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    harness.recv().await;

    harness
        .send(BulkRequest::stop_watch("w2").with_request_id("r2"))
        .await;
    let response = harness.recv().await;
    assert_eq!(response.request_id.as_deref(), Some("r2"));
    assert_eq!(failure(&response).code(), Code::NotFound);

    harness.pods.add(Pod::new("default", "web-0"));
    assert_eq!(event(&harness.recv().await).0, "w1");
}

fn jobs_harness() -> (Harness, Arc<Scripted>, tokio::sync::mpsc::UnboundedSender<ChangeEvent>) {
    let (jobs, events) = Scripted::new();
    let pods = Arc::new(MemoryStorage::new());
    let registry = Registry::builder()
        .register(GroupVersionResource::new("batch", "v1", "jobs"), jobs.clone())
        .build();

    let harness = Harness::with_registry(
        pods,
        registry,
        Arc::new(AlwaysAllow),
        SessionConfig::default(),
    );
    (harness, jobs, events)
}

fn jobs() -> ResourceSelector {
    ResourceSelector::new("jobs").with_group("batch")
}

#[tokio::test]
async fn repeated_stop_stops_once() {
    let (mut harness, storage, _events) = jobs_harness();

    harness.send(BulkRequest::watch("w1", jobs())).await;
    assert_eq!(harness.recv().await, BulkResponse::watch_started("w1"));

    harness
        .send(BulkRequest::stop_watch("w1").with_request_id("r1"))
        .await;
    harness
        .send(BulkRequest::stop_watch("w1").with_request_id("r2"))
        .await;

    let responses = harness.drain().await;
    assert_eq!(responses.len(), 2, "{responses:?}");
    assert!(responses.contains(&correlated(BulkResponse::watch_stopped("w1"), "r1")));

    let rejected = responses
        .iter()
        .find(|r| r.request_id.as_deref() == Some("r2"))
        .unwrap();
    assert_eq!(failure(rejected).code(), Code::NotFound);

    assert_eq!(storage.stops(), 1);
}

#[tokio::test]
async fn stop_racing_exhaustion_stops_once() {
    let (mut harness, storage, events) = jobs_harness();

    harness.send(BulkRequest::watch("w1", jobs())).await;
    harness.recv().await;

    drop(events);
    harness
        .send(BulkRequest::stop_watch("w1").with_request_id("r1"))
        .await;

    let responses = harness.drain().await;
    let stopped: Vec<_> = responses
        .iter()
        .filter(|r| matches!(r.kind, ResponseKind::WatchStopped { .. }))
        .collect();
    let failures = responses
        .iter()
        .filter(|r| matches!(r.kind, ResponseKind::Failure(_)))
        .count();

    // Either the stop won and is answered by the correlated `WatchStopped`,
    // or the watch ended first and the stop is rejected.
    assert_eq!(stopped.len(), 1, "{responses:?}");
    assert_eq!(
        failures + usize::from(stopped[0].request_id.is_some()),
        1,
        "{responses:?}"
    );
    assert_eq!(storage.stops(), 1);
}

#[tokio::test]
async fn responses_for_each_watch_are_ordered() {
    let mut harness = Harness::new();

    harness.send(BulkRequest::watch("a", pods_in("ns-a"))).await;
    harness.send(BulkRequest::watch("b", pods_in("ns-b"))).await;

    let mut responses = vec![harness.recv().await, harness.recv().await];

    for i in 0..3 {
        harness.pods.add(Pod::new("ns-a", &format!("a-{i}")));
        harness.pods.add(Pod::new("ns-b", &format!("b-{i}")));
    }
    for _ in 0..6 {
        responses.push(harness.recv().await);
    }

    harness.send(BulkRequest::stop_watch("a")).await;
    harness.send(BulkRequest::stop_watch("b")).await;
    responses.extend(harness.drain().await);

    for id in ["a", "b"] {
        let mine: Vec<_> = responses
            .iter()
            .filter(|r| r.watch_id() == Some(id))
            .collect();
        assert_eq!(mine.len(), 5, "{mine:?}");

        assert_eq!(*mine[0], BulkResponse::watch_started(id));
        let names: Vec<_> = mine[1..4].iter().map(|r| event(r).2).collect();
        assert_eq!(names, (0..3).map(|i| format!("{id}-{i}")).collect::<Vec<_>>());
        assert_eq!(*mine[4], BulkResponse::watch_stopped(id));
    }
}

#[tokio::test]
async fn watch_by_name() {
    let mut harness = Harness::new();

    harness
        .send(BulkRequest::watch("w1", pods_in("default").with_name("web-1")))
        .await;
    harness.recv().await;

    harness.pods.add(Pod::new("default", "web-0"));
    harness.pods.add(Pod::new("default", "web-1"));

    assert_eq!(event(&harness.recv().await).2, "web-1");
    assert!(harness.drain().await.is_empty());
}

#[tokio::test]
async fn malformed_frame_ends_session() {
    let mut harness = Harness::new();

    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    harness.recv().await;

    harness.send_frame(&b"{not json"[..]).await;
    harness.closed().await;

    let result = harness.session.await.unwrap();
    assert!(matches!(result, Err(Error::Decode(_))), "{result:?}");
    assert_eq!(harness.pods.watch_count(), 0);
}

#[tokio::test]
async fn invalid_requests_are_answered() {
    let mut harness = Harness::new();

    harness.send_frame(&br#"{"requestId":"r1"}"#[..]).await;
    harness
        .send_frame(
            &br#"{"requestId":"r2","watch":{"watchId":"w1"},"stopWatch":{"watchId":"w1"}}"#[..],
        )
        .await;
    harness
        .send_frame(&br#"{"requestId":"r3","stopWatch":{"watchId":""}}"#[..])
        .await;

    for request_id in ["r1", "r2", "r3"] {
        let response = harness.recv().await;
        assert_eq!(response.request_id.as_deref(), Some(request_id));
        assert_eq!(failure(&response).code(), Code::InvalidArgument);
    }

    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    assert_eq!(harness.recv().await, BulkResponse::watch_started("w1"));
    harness.finish().await.unwrap();
}

#[tokio::test]
async fn empty_frames_are_ignored() {
    let mut harness = Harness::new();

    harness.send_frame(Bytes::new()).await;
    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;

    assert_eq!(harness.recv().await, BulkResponse::watch_started("w1"));
}

#[tokio::test(start_paused = true)]
async fn idle_connection_times_out() {
    let timeout = Duration::from_secs(30);
    let mut harness = Harness::with(
        Arc::new(AlwaysAllow),
        SessionConfig::default().with_idle_timeout(timeout),
    );
    let start = tokio::time::Instant::now();

    tokio::time::sleep(Duration::from_secs(20)).await;
    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    harness.recv().await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!harness.session.is_finished());

    let result = harness.session.await.unwrap();
    assert!(
        matches!(result, Err(Error::IdleTimeout(d)) if d == timeout),
        "{result:?}"
    );
    assert!(start.elapsed() >= Duration::from_secs(50));
    assert_eq!(harness.pods.watch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn outbound_traffic_keeps_connection_alive() {
    let timeout = Duration::from_secs(30);
    let mut harness = Harness::with(
        Arc::new(AlwaysAllow),
        SessionConfig::default().with_idle_timeout(timeout),
    );

    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    harness.recv().await;

    // The client goes quiet; only events flow from here on.
    for i in 0..4 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        let name = format!("web-{i}");
        harness.pods.add(Pod::new("default", &name));
        assert_eq!(event(&harness.recv().await).2, name);
    }
    assert!(!harness.session.is_finished());

    let result = harness.session.await.unwrap();
    assert!(
        matches!(result, Err(Error::IdleTimeout(d)) if d == timeout),
        "{result:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn huge_idle_timeout_never_fires() {
    let mut harness = Harness::with(
        Arc::new(AlwaysAllow),
        SessionConfig::default().with_idle_timeout(Duration::MAX),
    );

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(!harness.session.is_finished());

    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    assert_eq!(harness.recv().await, BulkResponse::watch_started("w1"));
    harness.finish().await.unwrap();
}

#[tokio::test]
async fn write_failure_ends_session() {
    let mut harness = Harness::new();
    harness.stop_reading();

    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;

    let result = harness.session.await.unwrap();
    assert!(matches!(result, Err(Error::StreamClosed)), "{result:?}");
    assert_eq!(harness.pods.watch_count(), 0);
}

#[tokio::test]
async fn encode_failure_ends_only_that_watch() {
    let mut harness = Harness::new();

    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    harness.recv().await;

    harness.pods.apply(ChangeEvent::Added(Arc::new(Node {
        metadata: bulkwatch::ObjectMeta::new("default", "node-1"),
    })));

    let (watch_id, ty, message) = event(&harness.recv().await);
    assert_eq!((watch_id.as_str(), ty), ("w1", EventType::Error));
    assert!(message.contains("failed to encode object"), "{message}");
    assert_eq!(harness.recv().await, BulkResponse::watch_stopped("w1"));

    harness.send(BulkRequest::watch("w2", pods_in("default"))).await;
    assert_eq!(harness.recv().await, BulkResponse::watch_started("w2"));
}

#[tokio::test]
async fn storage_error_is_forwarded_then_watch_ends() {
    let mut harness = Harness::new();

    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    harness.recv().await;

    let upstream = Status::unavailable("etcd leader changed");
    harness.pods.apply(ChangeEvent::Error(upstream.clone()));

    assert_eq!(
        harness.recv().await,
        BulkResponse::watch_event("w1", bulkwatch::WatchEvent::Error(upstream))
    );
    assert_eq!(harness.recv().await, BulkResponse::watch_stopped("w1"));
}

#[tokio::test]
async fn exhausted_source_reports_uncorrelated_stop() {
    let mut harness = Harness::new();

    harness
        .send(BulkRequest::watch("w1", pods_in("default")).with_request_id("r1"))
        .await;
    harness.recv().await;

    harness.pods.close_watches();

    let stopped = harness.recv().await;
    assert_eq!(stopped, BulkResponse::watch_stopped("w1"));
    assert_eq!(stopped.request_id, None);
}

#[tokio::test]
async fn pipelined_rewatch_is_answered_after_stop() {
    let mut harness = Harness::new();

    harness.send(BulkRequest::watch("w1", pods_in("default"))).await;
    harness.recv().await;

    harness
        .send(BulkRequest::stop_watch("w1").with_request_id("r2"))
        .await;
    harness
        .send(BulkRequest::watch("w1", pods_in("other")).with_request_id("r3"))
        .await;

    let responses = [harness.recv().await, harness.recv().await];
    let stopped = responses
        .iter()
        .position(|r| *r == correlated(BulkResponse::watch_stopped("w1"), "r2"))
        .expect("stop is answered");
    let rewatch = responses
        .iter()
        .position(|r| r.request_id.as_deref() == Some("r3"))
        .expect("re-watch is answered");

    match &responses[rewatch].kind {
        ResponseKind::WatchStarted { watch_id } => {
            assert_eq!(watch_id, "w1");
            assert!(stopped < rewatch, "{responses:?}");
        }
        ResponseKind::Failure(status) => assert_eq!(status.code(), Code::AlreadyExists),
        _ => panic!("unexpected response {responses:?}"),
    }
}
