use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Context};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use photo_upload::utils::{format_bytes, format_duration};
use photo_upload::{
    DestinationId,
    EnqueueOptions,
    HttpTransport,
    JsonFileStore,
    NetworkObserver,
    PhotoPayload,
    StatusAggregator,
    TracingNotifier,
    UploadConfig,
    UploadEvent,
    UploadQueue,
};

const USAGE: &str = "usage: photo-upload <endpoint> <destination> <photo>...";

fn mime_type_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "heic" => Some("image/heic"),
        "heif" => Some("image/heif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(endpoint), Some(destination)) = (args.next(), args.next()) else {
        bail!(USAGE);
    };
    let files: Vec<PathBuf> = args.map(PathBuf::from).collect();
    if files.is_empty() {
        bail!(USAGE);
    }

    let config = match std::env::var("PHOTO_UPLOAD_CONFIG") {
        Ok(path) => UploadConfig::load(&path).with_context(|| format!("failed to load config from {}", path))?,
        Err(_) => UploadConfig::default(),
    };

    let transport = HttpTransport::new(&endpoint)?.with_request_timeout(config.timeout())?;
    let notifier = Arc::new(TracingNotifier);

    let mut builder = UploadQueue::builder(config.clone())
        .transport(Arc::new(transport))
        .network(Arc::new(NetworkObserver::default()))
        .notifier(notifier.clone())
        .on_completed(|item, ack| {
            info!(file = %item.payload.filename, remote_id = %ack.remote_id, "photo delivered");
        });
    if let Ok(path) = std::env::var("PHOTO_UPLOAD_STATE") {
        builder = builder.snapshot_store(Arc::new(JsonFileStore::new(path)));
    }

    let handle = builder.build().await?;
    let queue = handle.queue.clone();
    let aggregator = Arc::new(StatusAggregator::new(&config).with_notifier(notifier));
    let aggregator_handle = aggregator.clone().start(queue.clone());

    let mut events = queue.subscribe_events();
    let mut pending = HashSet::new();

    // 快照恢复的任务也要等待
    for item in queue.get_status().await?.items {
        if !item.status.is_terminal() {
            pending.insert(item.id);
        }
    }

    for path in files {
        let Some(mime_type) = mime_type_for(&path) else {
            warn!(file = %path.display(), "skipping file with unknown image type");
            continue;
        };
        let payload = PhotoPayload::from_file(path.clone(), mime_type)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;

        match queue.enqueue(payload, destination.as_str(), EnqueueOptions::default()).await {
            Ok(id) => {
                pending.insert(id);
            }
            Err(err) if err.is_validation() => {
                warn!(file = %path.display(), "rejected: {}", err);
            }
            Err(err) => return Err(err.into()),
        }
    }

    while !pending.is_empty() {
        match events.recv().await {
            Ok(UploadEvent::Completed { id, .. })
            | Ok(UploadEvent::Failed { id, .. })
            | Ok(UploadEvent::Cancelled { id, .. }) => {
                pending.remove(&id);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {
                let status = queue.get_status().await?;
                pending.retain(|id| status.item(*id).is_some_and(|item| !item.status.is_terminal()));
            }
            Err(RecvError::Closed) => break,
        }
    }

    if let Some(summary) = aggregator.summary(&DestinationId::from(destination)) {
        info!(
            completed = summary.completed,
            failed = summary.failed,
            uploaded = %format_bytes(summary.uploaded_bytes),
            average = %summary
                .average_upload_time_ms
                .map(|ms| format_duration(Duration::from_millis(ms)))
                .unwrap_or_else(|| "-".to_string()),
            "upload finished"
        );
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    aggregator_handle.shutdown().await;
    handle.shutdown().await?;
    Ok(())
}
