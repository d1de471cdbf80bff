use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};
use photo_upload::{
    ConnectionType,
    EnqueueOptions,
    ErrorCategory,
    JsonFileStore,
    NetworkObserver,
    NetworkStatus,
    ObserverNotifier,
    PhotoPayload,
    Priority,
    RemoteAck,
    ServiceNotification,
    StatusAggregator,
    TransportError,
    UploadConfig,
    UploadError,
    UploadEvent,
    UploadQueue,
    UploadQueueHandle,
    UploadRequest,
    UploadStatus,
    UploadTransport,
};
use photo_upload::core::PayloadSource;
use photo_upload::progress::NotifyTrigger;

/// 每次尝试（open 调用）的脚本
#[derive(Debug, Clone)]
enum Step {
    Succeed,
    FailOpen(TransportError),
    FailChunk(TransportError),
    /// 服务端确认的大小少一个字节
    ShortAck,
}

/// 模拟传输层 - 按脚本返回结果，可以用闸门卡住分块
#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    sessions: Mutex<HashMap<String, Step>>,
    opened: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
    next_session: AtomicUsize,
    aborted: AtomicUsize,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self::default()
    }

    fn with_script(steps: impl IntoIterator<Item = Step>) -> Self {
        let transport = Self::new();
        transport.script.lock().extend(steps);
        transport
    }

    /// 每个分块都要先拿到一个许可
    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn opened_files(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

#[async_trait::async_trait]
impl UploadTransport for ScriptedTransport {
    async fn open(&self, request: &UploadRequest) -> Result<String, TransportError> {
        self.opened.lock().push(request.file_name.clone());
        let step = self.script.lock().pop_front().unwrap_or(Step::Succeed);
        if let Step::FailOpen(err) = step {
            return Err(err);
        }

        let session = format!("session-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        self.sessions.lock().insert(session.clone(), step);
        Ok(session)
    }

    async fn send_chunk(&self, session: &str, _offset: u64, _chunk: Bytes) -> Result<(), TransportError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        let step = self.sessions.lock().get(session).cloned();
        match step {
            Some(Step::FailChunk(err)) => Err(err),
            _ => Ok(()),
        }
    }

    async fn verify(&self, session: &str, expected_size: u64) -> Result<RemoteAck, TransportError> {
        let step = self.sessions.lock().get(session).cloned();
        let received_size = match step {
            Some(Step::ShortAck) => expected_size - 1,
            _ => expected_size,
        };

        Ok(RemoteAck {
            remote_id: format!("remote-{}", session),
            received_size,
        })
    }

    async fn abort(&self, _session: &str) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<&'static str>>,
}

impl ObserverNotifier for RecordingNotifier {
    fn notify(&self, notification: &ServiceNotification) {
        self.events.lock().push(notification.event_type());
    }
}

fn config() -> UploadConfig {
    UploadConfig {
        max_concurrent_uploads: 2,
        base_delay_ms: 10,
        max_delay_ms: 50,
        chunk_size_bytes: 4,
        progress_interval_ms: 0,
        timeout_ms: 5_000,
        ..UploadConfig::default()
    }
}

fn photo(name: &str, size: usize) -> PhotoPayload {
    PhotoPayload::from_bytes(vec![7u8; size], "image/jpeg", name)
}

fn wifi() -> Arc<NetworkObserver> {
    Arc::new(NetworkObserver::new(NetworkStatus::connected(ConnectionType::Wifi)))
}

async fn start(config: UploadConfig, transport: Arc<ScriptedTransport>, network: Arc<NetworkObserver>) -> UploadQueueHandle {
    UploadQueue::builder(config)
        .transport(transport)
        .network(network)
        .build()
        .await
        .unwrap()
}

async fn wait_for_event<F>(events: &mut broadcast::Receiver<UploadEvent>, matches: F) -> UploadEvent
where
    F: Fn(&UploadEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream failed: {}", err),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not reached in time");
}

#[tokio::test]
async fn test_enqueue_respects_concurrency_limit() {
    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::new().gated(gate.clone()));
    let handle = start(config(), transport.clone(), wifi()).await;
    let queue = handle.queue.clone();

    for name in ["a.jpg", "b.jpg", "c.jpg"] {
        queue.enqueue(photo(name, 8), "reunion", EnqueueOptions::default()).await.unwrap();
    }

    let status = queue.get_status().await.unwrap();
    assert_eq!(status.uploading, 2);
    assert_eq!(status.queued, 1);
    assert_eq!(status.active_count, 2);
    assert_eq!(status.max_concurrent, 2);

    gate.add_permits(100);
    eventually(|| {
        let queue = queue.clone();
        async move { queue.get_status().await.unwrap().completed == 3 }
    })
    .await;

    let status = queue.get_status().await.unwrap();
    assert!(status.average_upload_time_ms.is_some());
    for item in &status.items {
        assert_eq!(item.progress_bytes, item.total_bytes);
        assert_eq!(item.attempts, 1);
    }

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dispatch_order_is_priority_then_fifo() {
    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::new().gated(gate.clone()));
    let config = UploadConfig {
        max_concurrent_uploads: 1,
        ..config()
    };
    let handle = start(config, transport.clone(), wifi()).await;
    let queue = handle.queue.clone();

    queue.enqueue(photo("first.jpg", 4), "reunion", EnqueueOptions::default()).await.unwrap();
    queue.enqueue(photo("second.jpg", 4), "reunion", EnqueueOptions::default()).await.unwrap();
    queue.enqueue(photo("third.jpg", 4), "reunion", EnqueueOptions::default()).await.unwrap();
    queue
        .enqueue(photo("urgent.jpg", 4), "reunion", EnqueueOptions::default().with_priority(Priority::Urgent))
        .await
        .unwrap();

    gate.add_permits(100);
    eventually(|| {
        let queue = queue.clone();
        async move { queue.get_status().await.unwrap().completed == 4 }
    })
    .await;

    assert_eq!(
        transport.opened_files(),
        vec!["first.jpg", "urgent.jpg", "second.jpg", "third.jpg"]
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_exhaust_attempts() {
    let network_error = TransportError::network("connection reset by peer");
    let transport = Arc::new(ScriptedTransport::with_script(vec![
        Step::FailChunk(network_error.clone()),
        Step::FailChunk(network_error.clone()),
        Step::FailChunk(network_error),
    ]));
    let handle = start(config(), transport.clone(), wifi()).await;
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let id = queue.enqueue(photo("a.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    wait_for_event(&mut events, |event| matches!(event, UploadEvent::Failed { .. })).await;

    let item = queue.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::PermanentlyFailed);
    assert!(item.is_permanent_failure);
    assert_eq!(item.attempts, 3);
    assert_eq!(item.error_history.len(), 3);
    assert!(item.error_history.iter().all(|record| record.category == ErrorCategory::Network));
    let attempts: Vec<_> = item.error_history.iter().map(|record| record.attempt_number).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(transport.aborted.load(Ordering::SeqCst), 3);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_forbidden_fails_without_retry() {
    let transport = Arc::new(ScriptedTransport::with_script(vec![Step::FailOpen(
        TransportError::status(403, "not a member of this event"),
    )]));
    let config = UploadConfig {
        max_attempts: 5,
        ..config()
    };
    let handle = start(config, transport.clone(), wifi()).await;
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let id = queue.enqueue(photo("a.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    let event = wait_for_event(&mut events, |event| {
        matches!(event, UploadEvent::Failed { .. } | UploadEvent::Retrying { .. })
    })
    .await;
    assert!(matches!(event, UploadEvent::Failed { .. }));

    let item = queue.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::PermanentlyFailed);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.error_history.len(), 1);
    assert_eq!(item.error_history[0].category, ErrorCategory::Forbidden);
    assert_eq!(transport.opened_files().len(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_error_retries_then_succeeds() {
    let transport = Arc::new(ScriptedTransport::with_script(vec![Step::FailChunk(
        TransportError::status(503, "busy"),
    )]));
    let handle = start(config(), transport.clone(), wifi()).await;
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let id = queue.enqueue(photo("a.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();

    let retrying = wait_for_event(&mut events, |event| matches!(event, UploadEvent::Retrying { .. })).await;
    if let UploadEvent::Retrying { attempt, delay, error, .. } = retrying {
        assert_eq!(attempt, 1);
        assert!(delay >= Duration::from_millis(10));
        assert!(delay <= Duration::from_millis(11));
        assert_eq!(error.category, ErrorCategory::ServerError);
    }

    let completed = wait_for_event(&mut events, |event| matches!(event, UploadEvent::Completed { .. })).await;
    assert_eq!(completed.id(), id);

    let item = queue.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::Completed);
    assert_eq!(item.attempts, 2);
    assert_eq!(item.error_history.len(), 1);
    assert!(item.remote_id.is_some());
    assert!(item.completed_at.is_some());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_verification_mismatch_is_server_error() {
    let transport = Arc::new(ScriptedTransport::with_script(vec![Step::ShortAck]));
    let config = UploadConfig {
        max_attempts: 1,
        ..config()
    };
    let handle = start(config, transport, wifi()).await;
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let id = queue.enqueue(photo("a.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    wait_for_event(&mut events, |event| matches!(event, UploadEvent::Failed { .. })).await;

    let item = queue.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.error_history[0].category, ErrorCategory::ServerError);
    assert_ne!(item.progress_bytes, item.total_bytes);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_returns_in_flight_upload_to_queue() {
    // 20 字节分 5 块，放行 2 块后停在 40%
    let gate = Arc::new(Semaphore::new(2));
    let transport = Arc::new(ScriptedTransport::new().gated(gate.clone()));
    let network = wifi();
    let handle = start(config(), transport.clone(), network.clone()).await;
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let id = queue.enqueue(photo("big.jpg", 20), "reunion", EnqueueOptions::default()).await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, UploadEvent::Progress { bytes_uploaded: 8, .. })
    })
    .await;

    network.update(NetworkStatus::disconnected());
    wait_for_event(&mut events, |event| matches!(event, UploadEvent::Requeued { .. })).await;

    let item = queue.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::Queued);
    assert_eq!(item.progress_bytes, 0);

    // 放行卡住的分块，执行器在下一个分块边界退出
    gate.add_permits(100);
    eventually(|| {
        let queue = queue.clone();
        async move { queue.get_status().await.unwrap().active_count == 0 }
    })
    .await;

    let item = queue.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::Queued);
    assert_eq!(item.attempts, 0);
    assert!(item.error_history.is_empty());
    assert_eq!(transport.opened_files().len(), 1);

    network.update(NetworkStatus::connected(ConnectionType::Wifi));
    wait_for_event(&mut events, |event| matches!(event, UploadEvent::Completed { .. })).await;

    let item = queue.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::Completed);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.progress_bytes, item.total_bytes);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_keeps_attempt_refund_after_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");
    let gate = Arc::new(Semaphore::new(2));
    let transport = Arc::new(ScriptedTransport::new().gated(gate.clone()));
    let network = wifi();
    let handle = UploadQueue::builder(config())
        .transport(transport)
        .network(network.clone())
        .snapshot_store(Arc::new(JsonFileStore::new(&path)))
        .build()
        .await
        .unwrap();
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let id = queue.enqueue(photo("big.jpg", 20), "reunion", EnqueueOptions::default()).await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, UploadEvent::Progress { bytes_uploaded: 8, .. })
    })
    .await;

    network.update(NetworkStatus::disconnected());
    wait_for_event(&mut events, |event| matches!(event, UploadEvent::Requeued { .. })).await;
    // 执行器仍卡在第三个分块上
    assert_eq!(queue.get_status().await.unwrap().active_count, 1);

    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.add_permits(100);
    });
    handle.shutdown().await.unwrap();
    release.await.unwrap();

    let offline = Arc::new(NetworkObserver::new(NetworkStatus::disconnected()));
    let handle = UploadQueue::builder(config())
        .transport(Arc::new(ScriptedTransport::new()))
        .network(offline)
        .snapshot_store(Arc::new(JsonFileStore::new(&path)))
        .build()
        .await
        .unwrap();

    let item = handle.queue.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::Queued);
    assert_eq!(item.attempts, 0);
    assert!(item.error_history.is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_attempt_timeout_retries_as_timeout() {
    // 分块永远拿不到许可，每次尝试都会超时
    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::new().gated(gate.clone()));
    let config = UploadConfig {
        timeout_ms: 100,
        max_attempts: 2,
        ..config()
    };
    let handle = start(config, transport.clone(), wifi()).await;
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let id = queue.enqueue(photo("slow.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();

    let retrying = wait_for_event(&mut events, |event| matches!(event, UploadEvent::Retrying { .. })).await;
    if let UploadEvent::Retrying { attempt, error, .. } = retrying {
        assert_eq!(attempt, 1);
        assert_eq!(error.category, ErrorCategory::Timeout);
    }

    wait_for_event(&mut events, |event| matches!(event, UploadEvent::Failed { .. })).await;
    let item = queue.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::PermanentlyFailed);
    assert_eq!(item.attempts, 2);
    assert!(item.error_history.iter().all(|record| record.category == ErrorCategory::Timeout));
    assert_eq!(transport.opened_files().len(), 2);

    gate.add_permits(100);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_finished_uploads_release_photo_bytes() {
    let transport = Arc::new(ScriptedTransport::with_script(vec![
        Step::Succeed,
        Step::FailOpen(TransportError::status(403, "not a member of this event")),
    ]));
    let network = wifi();
    let handle = start(config(), transport, network.clone()).await;
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let completed = queue.enqueue(photo("a.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    wait_for_event(&mut events, |event| matches!(event, UploadEvent::Completed { .. })).await;
    let failed = queue.enqueue(photo("b.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    wait_for_event(&mut events, |event| matches!(event, UploadEvent::Failed { .. })).await;

    network.update(NetworkStatus::disconnected());
    let cancelled = queue.enqueue(photo("c.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    assert!(queue.cancel(cancelled).await.unwrap());

    for id in [completed, failed, cancelled] {
        let item = queue.get_item(id).await.unwrap().unwrap();
        assert!(item.status.is_terminal());
        assert!(matches!(&item.payload.source, PayloadSource::Memory(data) if data.is_empty()));
        // 汇总用的大小保留
        assert_eq!(item.payload.size, 8);
        assert_eq!(item.total_bytes, 8);
    }

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_offline_enqueue_waits_for_connection() {
    let transport = Arc::new(ScriptedTransport::new());
    let network = Arc::new(NetworkObserver::new(NetworkStatus::disconnected()));
    let handle = start(config(), transport.clone(), network.clone()).await;
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let id = queue.enqueue(photo("a.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    let status = queue.get_status().await.unwrap();
    assert_eq!(status.queued, 1);
    assert_eq!(status.active_count, 0);
    assert!(!status.network.connected);

    network.update(NetworkStatus::connected(ConnectionType::Cellular));
    let completed = wait_for_event(&mut events, |event| matches!(event, UploadEvent::Completed { .. })).await;
    assert_eq!(completed.id(), id);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disallowed_connection_type_blocks_dispatch() {
    let transport = Arc::new(ScriptedTransport::new());
    let network = Arc::new(NetworkObserver::new(NetworkStatus::connected(ConnectionType::Cellular)));
    let config = UploadConfig {
        required_connection_types: vec![ConnectionType::Wifi],
        ..config()
    };
    let handle = start(config, transport.clone(), network.clone()).await;
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    queue.enqueue(photo("a.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    assert_eq!(queue.get_status().await.unwrap().queued, 1);
    assert!(transport.opened_files().is_empty());

    network.update(NetworkStatus::connected(ConnectionType::Wifi));
    wait_for_event(&mut events, |event| matches!(event, UploadEvent::Completed { .. })).await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_quality_is_readapted_only_while_queued() {
    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::new().gated(gate.clone()));
    let network = wifi();
    let config = UploadConfig {
        max_concurrent_uploads: 1,
        ..config()
    };
    let handle = start(config, transport, network.clone()).await;
    let queue = handle.queue.clone();

    let active = queue.enqueue(photo("a.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    let waiting = queue.enqueue(photo("b.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    assert_eq!(queue.get_item(waiting).await.unwrap().unwrap().adapted_quality, 0.95);

    network.update(NetworkStatus::connected(ConnectionType::Cellular));
    eventually(|| {
        let queue = queue.clone();
        async move { queue.get_item(waiting).await.unwrap().unwrap().adapted_quality == 0.7 }
    })
    .await;
    assert_eq!(queue.get_item(active).await.unwrap().unwrap().adapted_quality, 0.95);

    gate.add_permits(100);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel() {
    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::new().gated(gate.clone()));
    let config = UploadConfig {
        max_concurrent_uploads: 1,
        ..config()
    };
    let handle = start(config, transport.clone(), wifi()).await;
    let queue = handle.queue.clone();

    let active = queue.enqueue(photo("a.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    let waiting = queue.enqueue(photo("b.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();

    assert!(queue.cancel(waiting).await.unwrap());
    assert!(!queue.cancel(waiting).await.unwrap());
    assert!(!queue.cancel(photo_upload::UploadId::new()).await.unwrap());

    assert!(queue.cancel(active).await.unwrap());
    let status = queue.get_status().await.unwrap();
    assert_eq!(status.cancelled, 2);

    // 槽位在执行器退出后释放
    gate.add_permits(100);
    eventually(|| {
        let queue = queue.clone();
        async move { queue.get_status().await.unwrap().active_count == 0 }
    })
    .await;

    let item = queue.get_item(active).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::Cancelled);
    assert_eq!(transport.opened_files(), vec!["a.jpg"]);

    // 已完成的任务不能取消
    let done = queue.enqueue(photo("c.jpg", 4), "reunion", EnqueueOptions::default()).await.unwrap();
    eventually(|| {
        let queue = queue.clone();
        async move { queue.get_item(done).await.unwrap().unwrap().status == UploadStatus::Completed }
    })
    .await;
    assert!(!queue.cancel(done).await.unwrap());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_all_and_clear_finished() {
    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::new().gated(gate.clone()));
    let handle = start(config(), transport, wifi()).await;
    let queue = handle.queue.clone();

    for name in ["a.jpg", "b.jpg", "c.jpg"] {
        queue.enqueue(photo(name, 8), "reunion", EnqueueOptions::default()).await.unwrap();
    }

    let result = queue.cancel_all().await.unwrap();
    assert_eq!(result.cancelled, 3);
    assert_eq!(result.total, 3);

    let result = queue.cancel_all().await.unwrap();
    assert_eq!(result.cancelled, 0);
    assert_eq!(result.total, 3);

    gate.add_permits(100);
    assert_eq!(queue.clear_finished().await.unwrap(), 3);
    assert!(queue.get_status().await.unwrap().items.is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_enqueue_validation() {
    let transport = Arc::new(ScriptedTransport::new());
    let config = UploadConfig {
        max_file_size_bytes: Some(16),
        ..config()
    };
    let handle = start(config, transport.clone(), wifi()).await;
    let queue = handle.queue.clone();

    let err = queue.enqueue(photo("empty.jpg", 0), "reunion", EnqueueOptions::default()).await.unwrap_err();
    assert!(matches!(err, UploadError::EmptyPayload));

    let text = PhotoPayload::from_bytes(vec![1u8; 8], "text/plain", "notes.txt");
    let err = queue.enqueue(text, "reunion", EnqueueOptions::default()).await.unwrap_err();
    assert!(matches!(err, UploadError::UnsupportedMimeType(_)));

    let err = queue.enqueue(photo("huge.jpg", 17), "reunion", EnqueueOptions::default()).await.unwrap_err();
    assert!(matches!(err, UploadError::PayloadTooLarge { size: 17, max: 16 }));
    assert!(err.is_validation());

    // 大小写不敏感
    let upper = PhotoPayload::from_bytes(vec![1u8; 8], "IMAGE/PNG", "a.png");
    queue.enqueue(upper, "reunion", EnqueueOptions::default()).await.unwrap();

    assert_eq!(queue.get_status().await.unwrap().items.len(), 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_aggregator_follows_queue() {
    let transport = Arc::new(ScriptedTransport::with_script(vec![
        Step::FailOpen(TransportError::status(413, "too large")),
        Step::Succeed,
    ]));
    let config = UploadConfig {
        max_concurrent_uploads: 1,
        ..config()
    };
    let aggregator = Arc::new(StatusAggregator::new(&config));
    let handle = start(config, transport, wifi()).await;
    let queue = handle.queue.clone();
    let aggregator_handle = aggregator.clone().start(queue.clone());

    let triggers = Arc::new(Mutex::new(Vec::new()));
    let sink = triggers.clone();
    let _subscription = aggregator.subscribe(move |notification| {
        let summary = &notification.summary;
        assert_eq!(
            summary.completed + summary.failed + summary.queued + summary.uploading,
            summary.total
        );
        sink.lock().push(notification.trigger);
    });

    queue.enqueue(photo("a.jpg", 8), "wedding", EnqueueOptions::default()).await.unwrap();
    queue.enqueue(photo("b.jpg", 12), "wedding", EnqueueOptions::default()).await.unwrap();
    queue.enqueue(photo("c.jpg", 4), "birthday", EnqueueOptions::default()).await.unwrap();

    eventually(|| {
        let aggregator = aggregator.clone();
        async move {
            aggregator
                .summary(&"wedding".into())
                .is_some_and(|summary| summary.completed + summary.failed == 2)
        }
    })
    .await;

    let summary = aggregator.summary(&"wedding".into()).unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.total_bytes, 20);
    assert_eq!(summary.uploaded_bytes, 12);

    let triggers = triggers.lock().clone();
    assert!(triggers.contains(&NotifyTrigger::Completed));
    assert!(triggers.contains(&NotifyTrigger::Failed));

    aggregator_handle.shutdown().await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_restores_unfinished_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");
    let notifier = Arc::new(RecordingNotifier::default());

    let offline = Arc::new(NetworkObserver::new(NetworkStatus::disconnected()));
    let handle = UploadQueue::builder(config())
        .transport(Arc::new(ScriptedTransport::new()))
        .network(offline)
        .snapshot_store(Arc::new(JsonFileStore::new(&path)))
        .notifier(notifier.clone())
        .build()
        .await
        .unwrap();

    let first = handle
        .queue
        .enqueue(photo("a.jpg", 8), "reunion", EnqueueOptions::default().with_metadata("album", "day-1"))
        .await
        .unwrap();
    let second = handle.queue.enqueue(photo("b.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap();
    handle.shutdown().await.unwrap();
    assert_eq!(*notifier.events.lock(), vec!["service_started", "service_stopped"]);

    let transport = Arc::new(ScriptedTransport::new());
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let handle = UploadQueue::builder(config())
        .transport(transport.clone())
        .network(wifi())
        .snapshot_store(Arc::new(JsonFileStore::new(&path)))
        .on_completed(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .await
        .unwrap();
    let queue = handle.queue.clone();

    eventually(|| {
        let queue = queue.clone();
        async move { queue.get_status().await.unwrap().completed == 2 }
    })
    .await;

    let restored = queue.get_item(first).await.unwrap().unwrap();
    assert_eq!(restored.metadata.get("album").map(String::as_str), Some("day-1"));
    assert!(queue.get_item(second).await.unwrap().is_some());
    assert_eq!(transport.opened_files(), vec!["a.jpg", "b.jpg"]);
    assert_eq!(delivered.load(Ordering::SeqCst), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_operations_fail_after_shutdown() {
    let handle = start(config(), Arc::new(ScriptedTransport::new()), wifi()).await;
    let queue = handle.queue.clone();
    handle.shutdown().await.unwrap();

    let err = queue.get_status().await.unwrap_err();
    assert!(matches!(err, UploadError::QueueShutdown));
    let err = queue.enqueue(photo("a.jpg", 8), "reunion", EnqueueOptions::default()).await.unwrap_err();
    assert!(matches!(err, UploadError::QueueShutdown));
}

#[tokio::test]
async fn test_builder_requires_transport() {
    let result = UploadQueue::builder(config()).build().await;
    assert!(matches!(result, Err(UploadError::InvalidConfig(_))));
}
