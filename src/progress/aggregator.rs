use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::config::{HealthConfig, UploadConfig};
use crate::core::{
    DestinationId,
    ObserverNotifier,
    QueueStatus,
    ServiceNotification,
    UploadEvent,
    UploadId,
    UploadQueue,
    UploadStatus,
};
use super::health::{self, HealthIssue, HealthSample};

type Callback = Arc<dyn Fn(&StatusNotification) + Send + Sync>;
type SubscriberMap = RwLock<HashMap<u64, Callback>>;

/// 单个目标（活动）的上传汇总
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventUploadSummary {
    pub destination: DestinationId,
    /// 等待中（含等待重试）
    pub queued: usize,
    pub uploading: usize,
    pub completed: usize,
    pub failed: usize,
    /// 已取消的任务不计入 `total`
    pub cancelled: usize,
    pub total: usize,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub average_upload_time_ms: Option<u64>,
    pub estimated_time_remaining_ms: Option<u64>,
    /// 百分比 (0..=100)
    pub overall_progress: f64,
    /// 字节/秒
    pub upload_rate: f64,
    pub first_upload_at: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

/// 通知触发原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyTrigger {
    Interval,
    Completed,
    Failed,
}

/// 推送给订阅者的状态通知
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotification {
    pub destination: DestinationId,
    pub trigger: NotifyTrigger,
    pub summary: EventUploadSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Queued,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl Bucket {
    fn from_status(status: UploadStatus) -> Self {
        match status {
            UploadStatus::Queued | UploadStatus::Retrying => Bucket::Queued,
            UploadStatus::Uploading => Bucket::Uploading,
            UploadStatus::Completed => Bucket::Completed,
            UploadStatus::PermanentlyFailed => Bucket::Failed,
            UploadStatus::Cancelled => Bucket::Cancelled,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Bucket::Completed | Bucket::Failed | Bucket::Cancelled)
    }
}

#[derive(Debug)]
struct TrackedItem {
    bucket: Bucket,
    total_bytes: u64,
    uploaded_bytes: u64,
    finished_at: Option<Instant>,
}

impl TrackedItem {
    fn new(total_bytes: u64) -> Self {
        Self {
            bucket: Bucket::Queued,
            total_bytes,
            uploaded_bytes: 0,
            finished_at: None,
        }
    }

    fn moved_to(&mut self, bucket: Bucket, now: Instant) {
        self.bucket = bucket;
        self.finished_at = bucket.is_terminal().then_some(now);
        self.uploaded_bytes = match bucket {
            Bucket::Completed => self.total_bytes,
            _ => 0,
        };
    }
}

/// 单个目标的账本
struct SummaryBook {
    destination: DestinationId,
    items: HashMap<UploadId, TrackedItem>,
    // 超过保留时间被清理的记录
    pruned_completed: usize,
    pruned_cancelled: usize,
    pruned_bytes: u64,
    // 已计入 pruned_* 的任务，重建账本时不再重复计数
    pruned_ids: HashSet<UploadId>,
    upload_time_total: Duration,
    upload_time_count: u64,
    completed_bytes: u64,
    first_upload_at: Option<DateTime<Utc>>,
    last_update: DateTime<Utc>,
    last_activity: Instant,
    dirty: bool,
    last_notified: Option<Instant>,
}

impl SummaryBook {
    fn new(destination: DestinationId, now: Instant) -> Self {
        Self {
            destination,
            items: HashMap::new(),
            pruned_completed: 0,
            pruned_cancelled: 0,
            pruned_bytes: 0,
            pruned_ids: HashSet::new(),
            upload_time_total: Duration::ZERO,
            upload_time_count: 0,
            completed_bytes: 0,
            first_upload_at: None,
            last_update: Utc::now(),
            last_activity: now,
            dirty: false,
            last_notified: None,
        }
    }

    /// 应用一个事件，返回需要立即通知的原因
    fn apply(&mut self, event: &UploadEvent, now: Instant) -> Option<NotifyTrigger> {
        let tracked = self
            .items
            .entry(event.id())
            .or_insert_with(|| TrackedItem::new(event.total_bytes()));
        self.dirty = true;
        self.last_update = Utc::now();

        match event {
            UploadEvent::Enqueued { .. } | UploadEvent::Retrying { .. } | UploadEvent::Requeued { .. } => {
                tracked.moved_to(Bucket::Queued, now);
                None
            }
            UploadEvent::Started { .. } => {
                tracked.moved_to(Bucket::Uploading, now);
                self.first_upload_at.get_or_insert_with(Utc::now);
                self.last_activity = now;
                None
            }
            UploadEvent::Progress { bytes_uploaded, .. } => {
                if tracked.bucket == Bucket::Uploading {
                    tracked.uploaded_bytes = (*bytes_uploaded).min(tracked.total_bytes);
                }
                self.last_activity = now;
                None
            }
            UploadEvent::Completed { upload_time, .. } => {
                tracked.moved_to(Bucket::Completed, now);
                self.upload_time_total += *upload_time;
                self.upload_time_count += 1;
                self.completed_bytes += tracked.total_bytes;
                self.last_activity = now;
                Some(NotifyTrigger::Completed)
            }
            UploadEvent::Failed { .. } => {
                tracked.moved_to(Bucket::Failed, now);
                self.last_activity = now;
                Some(NotifyTrigger::Failed)
            }
            UploadEvent::Cancelled { .. } => {
                tracked.moved_to(Bucket::Cancelled, now);
                None
            }
        }
    }

    fn summary(&self) -> EventUploadSummary {
        let (mut queued, mut uploading, mut completed, mut failed, mut cancelled) = (0, 0, 0, 0, 0);
        let mut total_bytes = self.pruned_bytes;
        let mut uploaded_bytes = self.pruned_bytes;

        for item in self.items.values() {
            match item.bucket {
                Bucket::Queued => queued += 1,
                Bucket::Uploading => uploading += 1,
                Bucket::Completed => completed += 1,
                Bucket::Failed => failed += 1,
                Bucket::Cancelled => {
                    cancelled += 1;
                    continue;
                }
            }
            total_bytes += item.total_bytes;
            uploaded_bytes += item.uploaded_bytes;
        }
        completed += self.pruned_completed;
        cancelled += self.pruned_cancelled;

        let average_upload_time_ms = (self.upload_time_count > 0)
            .then(|| (self.upload_time_total.as_millis() / self.upload_time_count as u128) as u64);
        let estimated_time_remaining_ms = average_upload_time_ms.map(|average| (queued + uploading) as u64 * average);

        let overall_progress = if total_bytes > 0 {
            (uploaded_bytes as f64 / total_bytes as f64) * 100.0
        } else {
            0.0
        };

        let upload_secs = self.upload_time_total.as_secs_f64();
        let upload_rate = if upload_secs > 0.0 {
            self.completed_bytes as f64 / upload_secs
        } else {
            0.0
        };

        EventUploadSummary {
            destination: self.destination.clone(),
            queued,
            uploading,
            completed,
            failed,
            cancelled,
            total: queued + uploading + completed + failed,
            total_bytes,
            uploaded_bytes,
            average_upload_time_ms,
            estimated_time_remaining_ms,
            overall_progress,
            upload_rate,
            first_upload_at: self.first_upload_at,
            last_update: self.last_update,
        }
    }

    fn take_notification(&mut self, trigger: NotifyTrigger, now: Instant) -> StatusNotification {
        self.dirty = false;
        self.last_notified = Some(now);
        StatusNotification {
            destination: self.destination.clone(),
            trigger,
            summary: self.summary(),
        }
    }

    fn notification_due(&self, now: Instant, update_interval: Duration) -> bool {
        self.dirty
            && self
                .last_notified
                .is_none_or(|at| now.duration_since(at) >= update_interval)
    }

    /// 清理超过保留时间的已完成记录，汇总计数保持不变
    fn prune(&mut self, now: Instant, retention: Duration) -> usize {
        let (mut completed, mut cancelled, mut bytes) = (0, 0, 0);
        let pruned_ids = &mut self.pruned_ids;

        self.items.retain(|id, item| {
            let expired = matches!(item.bucket, Bucket::Completed | Bucket::Cancelled)
                && item
                    .finished_at
                    .is_some_and(|at| now.duration_since(at) >= retention);
            if expired {
                if item.bucket == Bucket::Completed {
                    completed += 1;
                    bytes += item.total_bytes;
                } else {
                    cancelled += 1;
                }
                pruned_ids.insert(*id);
            }
            !expired
        });

        self.pruned_completed += completed;
        self.pruned_cancelled += cancelled;
        self.pruned_bytes += bytes;
        completed + cancelled
    }

    fn health_sample(&self, now: Instant) -> (usize, usize, usize, usize, Duration) {
        let summary = self.summary();
        (
            summary.queued,
            summary.uploading,
            summary.completed,
            summary.failed,
            now.duration_since(self.last_activity),
        )
    }
}

/// 状态聚合器
///
/// 订阅队列事件，为每个目标维护 [`EventUploadSummary`]。完成和失败立即通知，
/// 其余变化按 `status_update_interval_ms` 合并通知。
pub struct StatusAggregator {
    books: Mutex<HashMap<DestinationId, SummaryBook>>,
    subscribers: Arc<SubscriberMap>,
    next_subscriber_id: AtomicU64,
    notifier: Option<Arc<dyn ObserverNotifier>>,
    update_interval: Duration,
    retention: Duration,
    health: HealthConfig,
    reported_issues: Mutex<Vec<HealthIssue>>,
}

impl StatusAggregator {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            books: Mutex::new(HashMap::new()),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(1),
            notifier: None,
            update_interval: config.status_update_interval(),
            retention: config.completed_retention(),
            health: config.health.clone(),
            reported_issues: Mutex::new(Vec::new()),
        }
    }

    /// 同时把通知转发给外部观察者
    pub fn with_notifier(mut self, notifier: Arc<dyn ObserverNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// 订阅状态通知，丢弃返回的 [`Subscription`] 即取消订阅
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StatusNotification) + Send + Sync + 'static,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, Arc::new(callback));

        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn summary(&self, destination: &DestinationId) -> Option<EventUploadSummary> {
        self.books.lock().get(destination).map(SummaryBook::summary)
    }

    pub fn summaries(&self) -> Vec<EventUploadSummary> {
        let mut summaries: Vec<_> = self.books.lock().values().map(SummaryBook::summary).collect();
        summaries.sort_by(|a, b| a.destination.cmp(&b.destination));
        summaries
    }

    /// 记录一个队列事件
    pub fn record(&self, event: &UploadEvent) {
        let now = Instant::now();
        let notification = {
            let mut books = self.books.lock();
            let book = books
                .entry(event.destination().clone())
                .or_insert_with(|| SummaryBook::new(event.destination().clone(), now));

            book.apply(event, now)
                .map(|trigger| book.take_notification(trigger, now))
        };

        if let Some(notification) = notification {
            self.publish(notification);
        }
    }

    /// 按间隔发送合并后的通知，`force` 时忽略间隔
    pub fn flush(&self, force: bool) -> usize {
        let now = Instant::now();
        let notifications: Vec<_> = {
            let mut books = self.books.lock();
            books
                .values_mut()
                .filter(|book| if force { book.dirty } else { book.notification_due(now, self.update_interval) })
                .map(|book| book.take_notification(NotifyTrigger::Interval, now))
                .collect()
        };

        let count = notifications.len();
        for notification in notifications {
            self.publish(notification);
        }
        count
    }

    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let pruned: usize = self
            .books
            .lock()
            .values_mut()
            .map(|book| book.prune(now, self.retention))
            .sum();

        if pruned > 0 {
            debug!(pruned, "pruned finished items from summaries");
        }
        pruned
    }

    /// 检查所有目标的健康状况，问题集合变化时通知
    pub fn check_health(&self) -> Vec<HealthIssue> {
        let now = Instant::now();
        let issues: Vec<HealthIssue> = {
            let books = self.books.lock();
            books
                .values()
                .flat_map(|book| {
                    let (queued, uploading, completed, failed, idle) = book.health_sample(now);
                    let sample = HealthSample {
                        destination: &book.destination,
                        queued,
                        uploading,
                        completed,
                        failed,
                        idle,
                    };
                    health::evaluate(sample, &self.health)
                })
                .collect()
        };

        let changed = {
            let mut reported = self.reported_issues.lock();
            let changed = health::issues_changed(&reported, &issues);
            if changed {
                *reported = issues.clone();
            }
            changed
        };

        if changed && !issues.is_empty() {
            warn!(issues = issues.len(), "upload health issues detected");
            if let Some(notifier) = &self.notifier {
                notifier.notify(&ServiceNotification::HealthIssuesDetected(issues.clone()));
            }
        }
        issues
    }

    /// 事件丢失后按队列快照重建账本
    pub fn resync(&self, status: &QueueStatus) {
        let now = Instant::now();
        let mut books = self.books.lock();
        let mut seen = HashSet::new();

        for item in &status.items {
            seen.insert(item.id);
            let book = books
                .entry(item.destination.clone())
                .or_insert_with(|| SummaryBook::new(item.destination.clone(), now));
            if book.pruned_ids.contains(&item.id) {
                continue;
            }

            let tracked = book
                .items
                .entry(item.id)
                .or_insert_with(|| TrackedItem::new(item.total_bytes));
            let bucket = Bucket::from_status(item.status);
            if tracked.bucket != bucket {
                tracked.moved_to(bucket, now);
            }
            if bucket == Bucket::Uploading {
                tracked.uploaded_bytes = item.progress_bytes.min(tracked.total_bytes);
            }
            book.dirty = true;
            book.last_update = Utc::now();
        }

        // 队列里已经不存在的未结束记录
        for book in books.values_mut() {
            book.items
                .retain(|id, tracked| seen.contains(id) || tracked.bucket.is_terminal());
            book.pruned_ids.retain(|id| seen.contains(id));
        }
    }

    /// 一次定时维护：合并通知、清理、健康检查
    pub fn tick(&self) {
        self.flush(false);
        self.prune();
        self.check_health();
    }

    fn publish(&self, notification: StatusNotification) {
        // 回调在锁外执行
        let callbacks: Vec<Callback> = self.subscribers.read().values().cloned().collect();
        for callback in callbacks {
            callback(&notification);
        }

        if let Some(notifier) = &self.notifier {
            notifier.notify(&ServiceNotification::StatusUpdated(notification));
        }
    }

    /// 启动后台任务消费队列事件
    pub fn start(self: Arc<Self>, queue: UploadQueue) -> AggregatorHandle {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        let mut events = queue.subscribe_events();
        let tick_period = self.update_interval.min(Duration::from_secs(1));
        let aggregator = self.clone();

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval(tick_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = events.recv() => match result {
                        Ok(event) => aggregator.record(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "status aggregator lagged, resyncing from queue");
                            match queue.get_status().await {
                                Ok(status) => aggregator.resync(&status),
                                Err(err) => {
                                    warn!("Failed to resync status aggregator: {}", err);
                                    break;
                                }
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => aggregator.tick(),
                }
            }

            // 退出前发送最后一次汇总
            aggregator.flush(true);
        });

        AggregatorHandle {
            aggregator: self,
            cancellation_token,
            join_handle,
        }
    }
}

/// 订阅句柄，drop 时自动取消订阅
///
/// 只持有订阅表的弱引用，聚合器释放后不会延长其生命周期。
pub struct Subscription {
    id: u64,
    subscribers: Weak<SubscriberMap>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // 由 Drop 完成
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.write().remove(&self.id);
        }
    }
}

pub struct AggregatorHandle {
    pub aggregator: Arc<StatusAggregator>,
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl AggregatorHandle {
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        if let Err(err) = self.join_handle.await {
            warn!("Status aggregator task panicked: {}", err);
        }
    }
}
