use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use crate::config::UploadConfig;
use crate::network::NetworkObserver;
use super::errors::{Result, UploadError};
use super::executor::UploadExecutor;
use super::traits::{CompletionHook, ObserverNotifier, RemoteAck, SnapshotStore, UploadTransport};
use super::types::{
    CancelAllResult,
    DestinationId,
    EnqueueOptions,
    PhotoPayload,
    QueueStatus,
    UploadEvent,
    UploadId,
    UploadItem,
};
use super::worker::{QueueCommand, QueueWorker, WorkerParts};

/// 上传队列（准入控制器）句柄，可以在任务之间克隆
#[derive(Clone)]
pub struct UploadQueue {
    command_tx: mpsc::Sender<QueueCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
    config: Arc<UploadConfig>,
    network: Arc<NetworkObserver>,
}

/// 上传队列句柄 - 包含队列和 worker
pub struct UploadQueueHandle {
    pub queue: UploadQueue,
    pub worker_handle: JoinHandle<()>,
}

impl UploadQueueHandle {
    /// 停止调度，中断进行中的尝试并保存快照
    pub async fn shutdown(self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.queue.command_tx.send(QueueCommand::Shutdown { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
        drop(self.queue);

        if let Err(err) = self.worker_handle.await {
            warn!("Queue worker panicked: {}", err);
        }
        Ok(())
    }
}

impl UploadQueue {
    pub fn builder(config: UploadConfig) -> UploadQueueBuilder {
        UploadQueueBuilder::new(config)
    }

    /// 添加上传任务
    ///
    /// 校验失败时任务不会进入队列。
    pub async fn enqueue(
        &self,
        payload: PhotoPayload,
        destination: impl Into<DestinationId>,
        options: EnqueueOptions,
    ) -> Result<UploadId> {
        self.validate(&payload)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueCommand::Enqueue {
            payload,
            destination: destination.into(),
            options,
            reply: reply_tx,
        })
        .await?;

        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 入队前的校验
    pub fn validate(&self, payload: &PhotoPayload) -> Result<()> {
        if payload.size == 0 {
            return Err(UploadError::EmptyPayload);
        }
        if !self.config.is_mime_allowed(&payload.mime_type) {
            return Err(UploadError::UnsupportedMimeType(payload.mime_type.clone()));
        }
        if let Some(max) = self.config.max_file_size_bytes {
            if payload.size > max {
                return Err(UploadError::PayloadTooLarge {
                    size: payload.size,
                    max,
                });
            }
        }
        Ok(())
    }

    /// 取消任务，任务不存在或已处于终态时返回 false
    pub async fn cancel(&self, id: UploadId) -> Result<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueCommand::Cancel { id, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    pub async fn cancel_all(&self) -> Result<CancelAllResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueCommand::CancelAll { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 获取队列状态快照
    pub async fn get_status(&self) -> Result<QueueStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueCommand::GetStatus { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    pub async fn get_item(&self, id: UploadId) -> Result<Option<UploadItem>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueCommand::GetItem { id, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 移除已完成、已失败和已取消的任务，返回移除数量
    pub async fn clear_finished(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueCommand::ClearFinished { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| UploadError::QueueShutdown)
    }

    /// 订阅事件
    ///
    /// 注意：
    /// - 接收速度跟不上时会丢失事件（lagged error），需要用 `get_status` 重新同步
    /// - 每个订阅者都会收到完整的事件副本
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    pub fn network(&self) -> &Arc<NetworkObserver> {
        &self.network
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    async fn send(&self, command: QueueCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| UploadError::QueueShutdown)
    }
}

/// 上传队列构建器
pub struct UploadQueueBuilder {
    config: UploadConfig,
    transport: Option<Arc<dyn UploadTransport>>,
    network: Option<Arc<NetworkObserver>>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    notifier: Option<Arc<dyn ObserverNotifier>>,
    completion_hooks: Vec<CompletionHook>,
}

impl UploadQueueBuilder {
    pub fn new(config: UploadConfig) -> Self {
        Self {
            config,
            transport: None,
            network: None,
            snapshot_store: None,
            notifier: None,
            completion_hooks: Vec::new(),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn UploadTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn network(mut self, network: Arc<NetworkObserver>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn ObserverNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// 每次上传成功后调用
    pub fn on_completed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&UploadItem, &RemoteAck) + Send + Sync + 'static,
    {
        self.completion_hooks.push(Box::new(hook));
        self
    }

    /// 校验配置，恢复快照并启动 worker
    pub async fn build(self) -> Result<UploadQueueHandle> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| UploadError::invalid_config("transport is required"))?;

        let config = Arc::new(self.config);
        let network = self.network.unwrap_or_default();

        let mut restored = Vec::new();
        if let Some(store) = &self.snapshot_store {
            for persisted in store.load_snapshot().await? {
                let id = persisted.id;
                match persisted.into_item() {
                    Ok(item) => restored.push(item),
                    Err(err) => warn!(upload_id = %id, "Dropping unreadable snapshot entry: {}", err),
                }
            }
        }

        let (command_tx, command_rx) = mpsc::channel(100);
        // 最大缓存 256 个事件
        let (event_tx, _) = broadcast::channel(256);

        let parts = WorkerParts {
            config: config.clone(),
            executor: Arc::new(UploadExecutor::new(transport, &config)),
            network: network.clone(),
            event_tx: event_tx.clone(),
            snapshot_store: self.snapshot_store,
            notifier: self.notifier,
            completion_hooks: self.completion_hooks,
            restored,
        };

        info!(
            max_concurrent = config.max_concurrent_uploads,
            max_attempts = config.max_attempts,
            "starting upload queue"
        );
        let worker_handle = tokio::spawn(QueueWorker::run(parts, command_rx));

        let queue = UploadQueue {
            command_tx,
            event_tx,
            config,
            network,
        };

        Ok(UploadQueueHandle {
            queue,
            worker_handle,
        })
    }
}
