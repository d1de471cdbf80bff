use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::network::NetworkStatus;
use crate::utils::retry::ErrorCategory;
use super::errors::Result;

/// 上传任务唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 上传目标（例如活动 ID）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct DestinationId(String);

impl DestinationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DestinationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DestinationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for DestinationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 上传状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// 等待中（在队列中）
    Queued,
    /// 上传中
    Uploading,
    /// 等待重试
    Retrying,
    /// 已完成
    Completed,
    /// 永久失败
    PermanentlyFailed,
    /// 已取消
    Cancelled,
}

impl UploadStatus {
    /// 终态不会再发生任何迁移
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::PermanentlyFailed | UploadStatus::Cancelled
        )
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            UploadStatus::Queued | UploadStatus::Uploading | UploadStatus::Retrying
        )
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Retrying => "retrying",
            UploadStatus::Completed => "completed",
            UploadStatus::PermanentlyFailed => "permanently_failed",
            UploadStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// 调度优先级，数值越大越先出队
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// 照片数据来源
#[derive(Debug, Clone)]
pub enum PayloadSource {
    /// 内存中的字节
    Memory(Bytes),
    /// 本地文件
    File(PathBuf),
}

/// 调用方提供的照片数据，核心只读取其大小与类型
#[derive(Debug, Clone)]
pub struct PhotoPayload {
    pub source: PayloadSource,
    pub size: u64,
    pub mime_type: String,
    pub filename: String,
}

impl PhotoPayload {
    pub fn from_bytes(data: impl Into<Bytes>, mime_type: impl Into<String>, filename: impl Into<String>) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            source: PayloadSource::Memory(data),
            mime_type: mime_type.into(),
            filename: filename.into(),
        }
    }

    /// 从本地文件构造，大小取自文件元数据
    pub async fn from_file(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            size: metadata.len(),
            source: PayloadSource::File(path),
            mime_type: mime_type.into(),
            filename,
        })
    }
}

/// 一次失败尝试的记录
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attempt_number: u32,
}

/// 上传任务
#[derive(Debug, Clone)]
pub struct UploadItem {
    /// 任务 ID
    pub id: UploadId,
    /// 照片数据
    pub payload: PhotoPayload,
    /// 上传目标
    pub destination: DestinationId,
    /// 当前状态
    pub status: UploadStatus,
    /// 已尝试次数
    pub attempts: u32,
    /// 最大尝试次数
    pub max_attempts: u32,
    pub priority: Priority,
    pub metadata: HashMap<String, String>,
    /// 入队时间
    pub queued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 已上传字节数
    pub progress_bytes: u64,
    pub total_bytes: u64,
    /// 入队时根据网络选择的质量系数 (0..=1)
    pub adapted_quality: f64,
    pub error_history: Vec<ErrorRecord>,
    pub is_permanent_failure: bool,
    /// 服务端分配的 ID
    pub remote_id: Option<String>,
}

impl UploadItem {
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.error_history.last()
    }

    /// 任务结束后释放内存中的照片数据，大小与文件名保留
    pub(crate) fn release_payload(&mut self) {
        if let PayloadSource::Memory(data) = &mut self.payload.source {
            *data = Bytes::new();
        }
    }

    pub fn summary(&self) -> ItemSummary {
        ItemSummary {
            id: self.id,
            destination: self.destination.clone(),
            status: self.status,
            priority: self.priority,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            progress_bytes: self.progress_bytes,
            total_bytes: self.total_bytes,
            adapted_quality: self.adapted_quality,
            filename: self.payload.filename.clone(),
            queued_at: self.queued_at,
            completed_at: self.completed_at,
            last_error: self.last_error().map(|record| record.message.clone()),
        }
    }
}

/// 入队选项
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// 覆盖配置中的最大尝试次数
    pub max_attempts: Option<u32>,
    pub metadata: HashMap<String, String>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 执行器上报的进度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percent: f64,
}

/// 上传事件
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 任务已入队
    Enqueued {
        id: UploadId,
        destination: DestinationId,
        total_bytes: u64,
        priority: Priority,
    },
    /// 开始一次尝试
    Started {
        id: UploadId,
        destination: DestinationId,
        total_bytes: u64,
        attempt: u32,
        quality: f64,
    },
    /// 进度更新
    Progress {
        id: UploadId,
        destination: DestinationId,
        bytes_uploaded: u64,
        total_bytes: u64,
    },
    /// 失败后等待重试
    Retrying {
        id: UploadId,
        destination: DestinationId,
        total_bytes: u64,
        attempt: u32,
        delay: Duration,
        error: ErrorRecord,
    },
    /// 重新回到等待队列（重试到期或网络中断）
    Requeued {
        id: UploadId,
        destination: DestinationId,
        total_bytes: u64,
    },
    /// 任务完成
    Completed {
        id: UploadId,
        destination: DestinationId,
        total_bytes: u64,
        remote_id: String,
        upload_time: Duration,
    },
    /// 永久失败
    Failed {
        id: UploadId,
        destination: DestinationId,
        total_bytes: u64,
        error: ErrorRecord,
    },
    /// 已取消
    Cancelled {
        id: UploadId,
        destination: DestinationId,
        total_bytes: u64,
    },
}

impl UploadEvent {
    pub fn id(&self) -> UploadId {
        match self {
            UploadEvent::Enqueued { id, .. }
            | UploadEvent::Started { id, .. }
            | UploadEvent::Progress { id, .. }
            | UploadEvent::Retrying { id, .. }
            | UploadEvent::Requeued { id, .. }
            | UploadEvent::Completed { id, .. }
            | UploadEvent::Failed { id, .. }
            | UploadEvent::Cancelled { id, .. } => *id,
        }
    }

    pub fn destination(&self) -> &DestinationId {
        match self {
            UploadEvent::Enqueued { destination, .. }
            | UploadEvent::Started { destination, .. }
            | UploadEvent::Progress { destination, .. }
            | UploadEvent::Retrying { destination, .. }
            | UploadEvent::Requeued { destination, .. }
            | UploadEvent::Completed { destination, .. }
            | UploadEvent::Failed { destination, .. }
            | UploadEvent::Cancelled { destination, .. } => destination,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        match self {
            UploadEvent::Enqueued { total_bytes, .. }
            | UploadEvent::Started { total_bytes, .. }
            | UploadEvent::Progress { total_bytes, .. }
            | UploadEvent::Retrying { total_bytes, .. }
            | UploadEvent::Requeued { total_bytes, .. }
            | UploadEvent::Completed { total_bytes, .. }
            | UploadEvent::Failed { total_bytes, .. }
            | UploadEvent::Cancelled { total_bytes, .. } => *total_bytes,
        }
    }
}

/// 单个任务的只读摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSummary {
    pub id: UploadId,
    pub destination: DestinationId,
    pub status: UploadStatus,
    pub priority: Priority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress_bytes: u64,
    pub total_bytes: u64,
    pub adapted_quality: f64,
    pub filename: String,
    pub queued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// 队列状态快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queued: usize,
    pub uploading: usize,
    pub retrying: usize,
    pub completed: usize,
    pub permanently_failed: usize,
    pub cancelled: usize,
    /// 正在占用执行槽位的尝试数
    pub active_count: usize,
    pub max_concurrent: usize,
    pub average_upload_time_ms: Option<u64>,
    pub network: NetworkStatus,
    pub items: Vec<ItemSummary>,
}

impl QueueStatus {
    pub fn count(&self, status: UploadStatus) -> usize {
        match status {
            UploadStatus::Queued => self.queued,
            UploadStatus::Uploading => self.uploading,
            UploadStatus::Retrying => self.retrying,
            UploadStatus::Completed => self.completed,
            UploadStatus::PermanentlyFailed => self.permanently_failed,
            UploadStatus::Cancelled => self.cancelled,
        }
    }

    pub fn item(&self, id: UploadId) -> Option<&ItemSummary> {
        self.items.iter().find(|item| item.id == id)
    }
}

/// 批量取消结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelAllResult {
    pub cancelled: usize,
    pub total: usize,
}

// 静态断言确保类型是 Send的
const _: () = {
    fn assert_send<T: Send + Sync>() {}
    fn assert_types() {
        assert_send::<UploadItem>();
        assert_send::<UploadEvent>();
        assert_send::<QueueStatus>();
    }
};
