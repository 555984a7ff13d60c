use bulkwatch::{
    Attributes, Authorizer, BoxError, BulkWatchServer, Decision, GroupVersionResource,
    MemoryStorage, Object, ObjectMeta, Registry, SessionConfig, UserInfo,
};
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tonic::{transport::Server, Request, Status};

#[derive(Debug, Clone, Serialize)]
struct Pod {
    metadata: ObjectMeta,
    phase: &'static str,
}

impl Object for Pod {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Lets every authenticated user watch, and nobody else.
struct Authenticated;

#[tonic::async_trait]
impl Authorizer for Authenticated {
    async fn authorize(&self, attributes: &Attributes) -> Result<Decision, BoxError> {
        if attributes.user.name == bulkwatch::auth::ANONYMOUS_USER {
            return Ok(Decision::deny("anonymous access is disabled"));
        }
        Ok(Decision::allow())
    }
}

fn authenticate(mut req: Request<()>) -> Result<Request<()>, Status> {
    let token = match req.metadata().get("authorization") {
        Some(token) => token.to_str().map_err(|_| Status::unauthenticated("bad token"))?,
        None => return Ok(req),
    };

    let user = token
        .strip_prefix("Bearer ")
        .ok_or_else(|| Status::unauthenticated("expected a bearer token"))?
        .to_string();

    req.extensions_mut().insert(UserInfo::new(user));
    Ok(req)
}

/// Cycle a few pods through their life so watchers have something to see.
async fn churn(pods: Arc<MemoryStorage<Pod>>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut generation = 0u64;

    loop {
        interval.tick().await;
        let name = format!("web-{}", generation / 3 % 3);
        let pod = |phase| Pod {
            metadata: ObjectMeta::new("default", name.as_str()).with_label("app", "web"),
            phase,
        };

        match generation % 3 {
            0 => pods.add(pod("Pending")),
            1 => pods.modify(pod("Running")),
            _ => pods.delete(pod("Succeeded")),
        }
        generation += 1;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let addr = "[::1]:50051".parse().unwrap();

    let pods = Arc::new(MemoryStorage::new());
    let registry = Registry::builder()
        .register(GroupVersionResource::new("", "v1", "pods"), pods.clone())
        .build();

    tokio::spawn(churn(pods));

    let service = BulkWatchServer::new(Arc::new(registry), Arc::new(Authenticated)).session_config(
        SessionConfig::default()
            .with_permission_recheck(Duration::from_secs(5))
            .with_max_watches(100),
    );

    tracing::info!(message = "Starting server.", %addr);

    Server::builder()
        .trace_fn(|_| tracing::info_span!("memory_server"))
        .layer(tonic::service::interceptor(authenticate))
        .add_service(service)
        .serve(addr)
        .await?;

    Ok(())
}
