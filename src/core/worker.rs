use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use crate::config::UploadConfig;
use crate::network::{policy, NetworkEvent, NetworkObserver};
use crate::storage::PersistedItem;
use crate::utils::retry::{classify, RetryPolicy};
use super::executor::{ExecuteError, UploadExecutor};
use super::notify::ServiceNotification;
use super::store::{ItemStore, QueueKey};
use super::traits::{CompletionHook, ObserverNotifier, RemoteAck, SnapshotStore};
use super::types::{
    CancelAllResult,
    DestinationId,
    EnqueueOptions,
    ErrorRecord,
    PhotoPayload,
    ProgressUpdate,
    QueueStatus,
    UploadEvent,
    UploadId,
    UploadItem,
    UploadStatus,
};

/// 关闭时等待进行中尝试退出的最长时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// 队列命令
pub(crate) enum QueueCommand {
    Enqueue {
        payload: PhotoPayload,
        destination: DestinationId,
        options: EnqueueOptions,
        reply: oneshot::Sender<UploadId>,
    },
    Cancel {
        id: UploadId,
        reply: oneshot::Sender<bool>,
    },
    CancelAll {
        reply: oneshot::Sender<CancelAllResult>,
    },
    GetStatus {
        reply: oneshot::Sender<QueueStatus>,
    },
    GetItem {
        id: UploadId,
        reply: oneshot::Sender<Option<UploadItem>>,
    },
    ClearFinished {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// 执行任务和定时器回报给 worker 的事件
enum WorkerEvent {
    Progress {
        id: UploadId,
        update: ProgressUpdate,
    },
    Finished {
        id: UploadId,
        result: Result<RemoteAck, ExecuteError>,
        elapsed: Duration,
    },
    RetryDue {
        id: UploadId,
    },
}

/// 尝试被中断的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Network,
    Cancelled,
    Shutdown,
}

struct ActiveAttempt {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
    queue_key: QueueKey,
    interruption: Option<Interruption>,
}

/// 成功上传耗时的滑动平均
#[derive(Debug, Default)]
struct RunningAverage {
    count: u64,
    mean_ms: f64,
}

impl RunningAverage {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.mean_ms += (sample - self.mean_ms) / self.count as f64;
    }

    fn mean_ms(&self) -> Option<u64> {
        (self.count > 0).then(|| self.mean_ms.round() as u64)
    }
}

pub(crate) struct WorkerParts {
    pub config: Arc<UploadConfig>,
    pub executor: Arc<UploadExecutor>,
    pub network: Arc<NetworkObserver>,
    pub event_tx: broadcast::Sender<UploadEvent>,
    pub snapshot_store: Option<Arc<dyn SnapshotStore>>,
    pub notifier: Option<Arc<dyn ObserverNotifier>>,
    pub completion_hooks: Vec<CompletionHook>,
    pub restored: Vec<UploadItem>,
}

/// 队列 worker：唯一修改任务状态的地方
pub(crate) struct QueueWorker {
    config: Arc<UploadConfig>,
    retry_policy: RetryPolicy,
    executor: Arc<UploadExecutor>,
    network: Arc<NetworkObserver>,
    store: ItemStore,
    active: HashMap<UploadId, ActiveAttempt>,
    retry_timers: HashMap<UploadId, JoinHandle<()>>,
    upload_times: RunningAverage,
    event_tx: broadcast::Sender<UploadEvent>,
    internal_tx: mpsc::UnboundedSender<WorkerEvent>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    notifier: Option<Arc<dyn ObserverNotifier>>,
    completion_hooks: Vec<CompletionHook>,
    dirty: bool,
}

impl QueueWorker {
    pub(crate) async fn run(parts: WorkerParts, mut command_rx: mpsc::Receiver<QueueCommand>) {
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
        let mut network_rx = parts.network.subscribe();
        let mut network_open = true;

        let mut worker = Self {
            retry_policy: RetryPolicy::from_config(&parts.config),
            config: parts.config,
            executor: parts.executor,
            network: parts.network,
            store: ItemStore::new(),
            active: HashMap::new(),
            retry_timers: HashMap::new(),
            upload_times: RunningAverage::default(),
            event_tx: parts.event_tx,
            internal_tx,
            snapshot_store: parts.snapshot_store,
            notifier: parts.notifier,
            completion_hooks: parts.completion_hooks,
            dirty: false,
        };

        worker.restore(parts.restored);
        worker.notify(ServiceNotification::ServiceStarted);
        worker.process_queue();

        // 主事件循环
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(QueueCommand::Shutdown { reply }) => {
                        worker.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => worker.handle_command(command),
                    None => {
                        worker.shutdown().await;
                        break;
                    }
                },
                Some(event) = internal_rx.recv() => {
                    worker.handle_worker_event(event);
                }
                result = network_rx.recv(), if network_open => match result {
                    Ok(event) => worker.handle_network_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "network events lagged, resyncing");
                        worker.resync_network();
                    }
                    Err(RecvError::Closed) => network_open = false,
                },
            }

            worker.process_queue();
            worker.persist_if_dirty().await;
        }
    }

    fn restore(&mut self, restored: Vec<UploadItem>) {
        if restored.is_empty() {
            return;
        }

        let mut restored = restored;
        restored.sort_by_key(|item| item.queued_at);
        info!(items = restored.len(), "restoring queued uploads from snapshot");

        for item in restored {
            let id = item.id;
            let event = UploadEvent::Enqueued {
                id,
                destination: item.destination.clone(),
                total_bytes: item.total_bytes,
                priority: item.priority,
            };
            self.store.insert(item);
            self.store.push_pending(id);
            self.emit(event);
        }
    }

    fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Enqueue { payload, destination, options, reply } => {
                let id = self.enqueue(payload, destination, options);
                // 立即尝试调度，使调用方返回时状态已就绪
                self.process_queue();
                let _ = reply.send(id);
            }
            QueueCommand::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            QueueCommand::CancelAll { reply } => {
                let _ = reply.send(self.cancel_all());
            }
            QueueCommand::GetStatus { reply } => {
                let _ = reply.send(self.status());
            }
            QueueCommand::GetItem { id, reply } => {
                let _ = reply.send(self.store.get(&id).cloned());
            }
            QueueCommand::ClearFinished { reply } => {
                let removed = self.store.remove_finished();
                debug!(removed, "cleared finished uploads");
                let _ = reply.send(removed);
            }
            // 由主循环处理
            QueueCommand::Shutdown { .. } => {}
        }
    }

    fn enqueue(&mut self, payload: PhotoPayload, destination: DestinationId, options: EnqueueOptions) -> UploadId {
        let admission = policy::evaluate(&self.network.current(), &self.config);
        let id = UploadId::new();
        let total_bytes = payload.size;

        let item = UploadItem {
            id,
            payload,
            destination: destination.clone(),
            status: UploadStatus::Queued,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(self.config.max_attempts).max(1),
            priority: options.priority,
            metadata: options.metadata,
            queued_at: Utc::now(),
            last_attempt_at: None,
            completed_at: None,
            progress_bytes: 0,
            total_bytes,
            adapted_quality: admission.quality_factor,
            error_history: Vec::new(),
            is_permanent_failure: false,
            remote_id: None,
        };

        info!(
            upload_id = %id,
            destination = %destination,
            total_bytes,
            priority = ?item.priority,
            quality = item.adapted_quality,
            "upload enqueued"
        );

        self.store.insert(item);
        self.store.push_pending(id);
        self.dirty = true;
        self.emit(UploadEvent::Enqueued {
            id,
            destination,
            total_bytes,
            priority: options.priority,
        });

        id
    }

    /// 在有空闲槽位且网络允许时按顺序启动等待中的任务
    fn process_queue(&mut self) {
        while self.active.len() < self.config.max_concurrent_uploads && self.store.pending_len() > 0 {
            let admission = policy::evaluate(&self.network.current(), &self.config);
            if !admission.allowed {
                break;
            }

            let Some((id, queue_key)) = self.store.pop_next_pending() else {
                break;
            };
            self.start_attempt(id, queue_key);
        }
    }

    fn start_attempt(&mut self, id: UploadId, queue_key: QueueKey) {
        let Some(item) = self.store.get_mut(&id) else {
            return;
        };
        if item.status != UploadStatus::Queued {
            warn!(upload_id = %id, status = %item.status, "skipping non-queued item");
            return;
        }

        item.status = UploadStatus::Uploading;
        item.attempts += 1;
        item.last_attempt_at = Some(Utc::now());
        item.progress_bytes = 0;

        let snapshot = item.clone();
        let attempt = item.attempts;
        info!(upload_id = %id, destination = %item.destination, attempt, "upload started");
        let started_event = UploadEvent::Started {
            id,
            destination: item.destination.clone(),
            total_bytes: item.total_bytes,
            attempt,
            quality: item.adapted_quality,
        };

        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let executor = self.executor.clone();
        let internal_tx = self.internal_tx.clone();
        let timeout = self.config.timeout();

        let join_handle = tokio::spawn(async move {
            let started = Instant::now();
            let progress_tx = internal_tx.clone();
            let result = executor
                .execute(
                    &snapshot,
                    move |update| {
                        let _ = progress_tx.send(WorkerEvent::Progress { id, update });
                    },
                    timeout,
                    &task_token,
                )
                .await;

            // 通知完成
            let _ = internal_tx.send(WorkerEvent::Finished {
                id,
                result,
                elapsed: started.elapsed(),
            });
        });

        self.active.insert(id, ActiveAttempt {
            cancellation_token,
            join_handle,
            queue_key,
            interruption: None,
        });
        self.dirty = true;
        self.emit(started_event);
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Progress { id, update } => self.handle_progress(id, update),
            WorkerEvent::Finished { id, result, elapsed } => self.handle_finished(id, result, elapsed),
            WorkerEvent::RetryDue { id } => self.handle_retry_due(id),
        }
    }

    fn handle_progress(&mut self, id: UploadId, update: ProgressUpdate) {
        let Some(item) = self.store.get_mut(&id) else {
            return;
        };
        // 被中断或取消后迟到的进度直接丢弃
        if item.status != UploadStatus::Uploading {
            return;
        }

        item.progress_bytes = update.bytes_transferred.min(item.total_bytes);
        let event = UploadEvent::Progress {
            id,
            destination: item.destination.clone(),
            bytes_uploaded: item.progress_bytes,
            total_bytes: item.total_bytes,
        };
        self.emit(event);
    }

    fn handle_finished(&mut self, id: UploadId, result: Result<RemoteAck, ExecuteError>, elapsed: Duration) {
        // 执行任务已退出，槽位在此释放
        let Some(attempt) = self.active.remove(&id) else {
            return;
        };
        self.dirty = true;

        match (attempt.interruption, result) {
            (None | Some(Interruption::Network), Ok(ack)) => self.complete(id, ack, elapsed),
            (Some(Interruption::Cancelled), Ok(_)) => {
                warn!(upload_id = %id, "upload finished after cancellation, keeping cancelled");
            }
            (Some(Interruption::Cancelled) | Some(Interruption::Shutdown), Err(_)) | (Some(Interruption::Shutdown), Ok(_)) => {
                debug!(upload_id = %id, "attempt released");
            }
            (Some(Interruption::Network), Err(err)) | (None, Err(err @ ExecuteError::Interrupted { .. })) => {
                self.requeue_interrupted(id, attempt.queue_key, &err);
            }
            (None, Err(err)) => self.fail_attempt(id, err),
        }
    }

    fn complete(&mut self, id: UploadId, ack: RemoteAck, elapsed: Duration) {
        let Some(item) = self.store.get_mut(&id) else {
            return;
        };

        item.status = UploadStatus::Completed;
        item.completed_at = Some(Utc::now());
        item.progress_bytes = item.total_bytes;
        item.remote_id = Some(ack.remote_id.clone());
        self.upload_times.record(elapsed);

        info!(
            upload_id = %id,
            destination = %item.destination,
            remote_id = %ack.remote_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "upload completed"
        );

        let event = UploadEvent::Completed {
            id,
            destination: item.destination.clone(),
            total_bytes: item.total_bytes,
            remote_id: ack.remote_id.clone(),
            upload_time: elapsed,
        };

        for hook in &self.completion_hooks {
            hook(item, &ack);
        }
        item.release_payload();
        self.emit(event);
    }

    fn fail_attempt(&mut self, id: UploadId, err: ExecuteError) {
        let Some(item) = self.store.get_mut(&id) else {
            return;
        };

        let category = classify(&err);
        let record = ErrorRecord {
            category,
            message: err.to_string(),
            timestamp: Utc::now(),
            attempt_number: item.attempts,
        };
        item.error_history.push(record.clone());
        item.progress_bytes = 0;

        let decision = self
            .retry_policy
            .decide_with_limit(item.attempts, item.max_attempts, category);

        if decision.retry {
            item.status = UploadStatus::Retrying;
            warn!(
                upload_id = %id,
                attempt = item.attempts,
                max_attempts = item.max_attempts,
                category = %category,
                delay_ms = decision.delay.as_millis() as u64,
                "upload attempt failed, retrying: {}",
                record.message
            );

            let event = UploadEvent::Retrying {
                id,
                destination: item.destination.clone(),
                total_bytes: item.total_bytes,
                attempt: item.attempts,
                delay: decision.delay,
                error: record,
            };
            self.schedule_retry(id, decision.delay);
            self.emit(event);
        } else {
            item.status = UploadStatus::PermanentlyFailed;
            item.is_permanent_failure = true;
            item.release_payload();
            error!(
                upload_id = %id,
                attempt = item.attempts,
                category = %category,
                "upload permanently failed: {}",
                record.message
            );

            let event = UploadEvent::Failed {
                id,
                destination: item.destination.clone(),
                total_bytes: item.total_bytes,
                error: record,
            };
            self.emit(event);
        }
    }

    /// 退避延迟用定时任务实现，不阻塞 worker
    fn schedule_retry(&mut self, id: UploadId, delay: Duration) {
        let internal_tx = self.internal_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal_tx.send(WorkerEvent::RetryDue { id });
        });

        if let Some(previous) = self.retry_timers.insert(id, timer) {
            previous.abort();
        }
    }

    fn handle_retry_due(&mut self, id: UploadId) {
        self.retry_timers.remove(&id);
        let quality = policy::quality_factor(&self.network.current(), &self.config);

        let Some(item) = self.store.get_mut(&id) else {
            return;
        };
        if item.status != UploadStatus::Retrying {
            return;
        }

        item.status = UploadStatus::Queued;
        item.adapted_quality = quality;
        let event = UploadEvent::Requeued {
            id,
            destination: item.destination.clone(),
            total_bytes: item.total_bytes,
        };

        // 重试排在同优先级队尾
        self.store.push_pending(id);
        self.dirty = true;
        debug!(upload_id = %id, "retry due, requeued");
        self.emit(event);
    }

    fn requeue_interrupted(&mut self, id: UploadId, queue_key: QueueKey, err: &ExecuteError) {
        let Some(item) = self.store.get_mut(&id) else {
            return;
        };

        // 网络中断不计入尝试次数
        item.attempts = item.attempts.saturating_sub(1);
        item.progress_bytes = 0;

        let emit_requeued = item.status != UploadStatus::Queued;
        item.status = UploadStatus::Queued;
        debug!(upload_id = %id, "interrupted attempt released: {}", err);

        let event = UploadEvent::Requeued {
            id,
            destination: item.destination.clone(),
            total_bytes: item.total_bytes,
        };
        self.store.restore_pending(id, queue_key);
        if emit_requeued {
            self.emit(event);
        }
    }

    fn cancel(&mut self, id: UploadId) -> bool {
        let Some(item) = self.store.get_mut(&id) else {
            return false;
        };
        if item.status.is_terminal() {
            return false;
        }

        let previous = item.status;
        item.status = UploadStatus::Cancelled;
        item.release_payload();
        let event = UploadEvent::Cancelled {
            id,
            destination: item.destination.clone(),
            total_bytes: item.total_bytes,
        };

        self.store.remove_pending(&id);
        if let Some(attempt) = self.active.get_mut(&id) {
            // 槽位在执行任务退出后才释放
            attempt.interruption = Some(Interruption::Cancelled);
            attempt.cancellation_token.cancel();
        }
        if let Some(timer) = self.retry_timers.remove(&id) {
            timer.abort();
        }

        info!(upload_id = %id, previous = %previous, "upload cancelled");
        self.dirty = true;
        self.emit(event);
        true
    }

    fn cancel_all(&mut self) -> CancelAllResult {
        let ids = self.store.ids();
        let total = ids.len();
        let cancelled = ids.into_iter().filter(|id| self.cancel(*id)).count();

        CancelAllResult { cancelled, total }
    }

    fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Disconnected(_) => self.interrupt_in_flight(),
            NetworkEvent::Reconnected(status) | NetworkEvent::Changed(status) => {
                if status.connected {
                    self.readapt_quality();
                }
            }
        }
    }

    fn resync_network(&mut self) {
        if self.network.current().connected {
            self.readapt_quality();
        } else {
            self.interrupt_in_flight();
        }
    }

    /// 断网时把进行中的任务退回等待状态
    fn interrupt_in_flight(&mut self) {
        let mut requeued = Vec::new();

        for (id, attempt) in self.active.iter_mut() {
            if attempt.interruption.is_some() {
                continue;
            }
            attempt.interruption = Some(Interruption::Network);
            attempt.cancellation_token.cancel();
            requeued.push(*id);
        }

        for id in requeued {
            let Some(item) = self.store.get_mut(&id) else {
                continue;
            };
            item.status = UploadStatus::Queued;
            item.progress_bytes = 0;
            let event = UploadEvent::Requeued {
                id,
                destination: item.destination.clone(),
                total_bytes: item.total_bytes,
            };
            warn!(upload_id = %id, "network lost, upload returned to queue");
            self.dirty = true;
            self.emit(event);
        }
    }

    /// 只调整仍在等待中的任务
    fn readapt_quality(&mut self) {
        let quality = policy::quality_factor(&self.network.current(), &self.config);
        for item in self.store.items_mut() {
            if item.status == UploadStatus::Queued && item.adapted_quality != quality {
                item.adapted_quality = quality;
            }
        }
    }

    fn status(&self) -> QueueStatus {
        let mut items: Vec<_> = self.store.items().map(|item| item.summary()).collect();
        items.sort_by_key(|item| item.queued_at);

        QueueStatus {
            queued: self.store.count(UploadStatus::Queued),
            uploading: self.store.count(UploadStatus::Uploading),
            retrying: self.store.count(UploadStatus::Retrying),
            completed: self.store.count(UploadStatus::Completed),
            permanently_failed: self.store.count(UploadStatus::PermanentlyFailed),
            cancelled: self.store.count(UploadStatus::Cancelled),
            active_count: self.active.len(),
            max_concurrent: self.config.max_concurrent_uploads,
            average_upload_time_ms: self.upload_times.mean_ms(),
            network: self.network.current(),
            items,
        }
    }

    async fn shutdown(&mut self) {
        info!(active = self.active.len(), "upload queue shutting down");

        for timer in self.retry_timers.values() {
            timer.abort();
        }
        self.retry_timers.clear();

        let mut handles = Vec::new();
        for (id, mut attempt) in self.active.drain() {
            // 断网中断的尝试已退回等待状态，但次数还没退还
            let network_interrupted = attempt.interruption == Some(Interruption::Network);
            attempt.interruption = Some(Interruption::Shutdown);
            attempt.cancellation_token.cancel();
            handles.push(attempt.join_handle);

            // 保存为等待状态，下次启动重新上传
            if let Some(item) = self.store.get_mut(&id) {
                if item.status == UploadStatus::Uploading || network_interrupted {
                    item.status = UploadStatus::Queued;
                    item.attempts = item.attempts.saturating_sub(1);
                    item.progress_bytes = 0;
                }
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("attempt did not stop within shutdown grace period");
                break;
            }
        }

        self.dirty = true;
        self.persist_if_dirty().await;
        self.notify(ServiceNotification::ServiceStopped);
    }

    async fn persist_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;

        let Some(snapshot_store) = &self.snapshot_store else {
            return;
        };

        let items: Vec<PersistedItem> = self
            .store
            .items()
            .filter(|item| !item.status.is_terminal())
            .map(PersistedItem::from_item)
            .collect();

        if let Err(err) = snapshot_store.save_snapshot(&items).await {
            error!("Failed to save queue snapshot: {}", err);
        }
    }

    fn emit(&self, event: UploadEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.event_tx.send(event);
    }

    fn notify(&self, notification: ServiceNotification) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(&notification);
        }
    }
}
