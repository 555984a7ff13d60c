use bulkwatch::{
    BulkRequest, BulkWatchClient, Encoding, ListOptions, ResourceSelector, ResponseKind,
    WatchEvent,
};
use tonic::metadata::MetadataMap;

const EVENTS: usize = 6;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut metadata = MetadataMap::new();
    metadata.insert("authorization", "Bearer alice".parse()?);

    let client = BulkWatchClient::connect("http://[::1]:50051", Encoding::Protobuf)
        .await?
        .with_metadata(metadata);
    let mut stream = client.open().await?;

    let selector = ResourceSelector::new("pods")
        .with_namespace("default")
        .with_options(ListOptions {
            label_selector: "app=web".to_string(),
            ..Default::default()
        });
    stream
        .send(&BulkRequest::watch("web", selector).with_request_id("1"))
        .await?;

    let mut seen = 0;
    while let Some(response) = stream.message().await? {
        match response.kind {
            ResponseKind::WatchStarted { watch_id } => {
                tracing::info!(%watch_id, "watch started");
            }
            ResponseKind::WatchEvent { watch_id, event } => {
                if let WatchEvent::Error(status) = &event {
                    tracing::warn!(%watch_id, %status, "watch failed");
                } else if let Some(object) = event.object() {
                    let object: serde_json::Value = serde_json::from_slice(object)?;
                    tracing::info!(%watch_id, event = ?event.event_type(), %object);
                }

                seen += 1;
                if seen == EVENTS {
                    stream
                        .send(&BulkRequest::stop_watch("web").with_request_id("2"))
                        .await?;
                }
            }
            ResponseKind::WatchStopped { watch_id } => {
                tracing::info!(%watch_id, "watch stopped");
                break;
            }
            ResponseKind::Failure(status) => {
                tracing::error!(request_id = ?response.request_id, %status, "request failed");
                break;
            }
        }
    }

    Ok(())
}
