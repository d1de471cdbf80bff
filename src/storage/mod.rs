use std::collections::HashMap;
use std::path::PathBuf;
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::core::{
    DestinationId,
    ErrorRecord,
    PayloadSource,
    PhotoPayload,
    Priority,
    Result,
    SnapshotStore,
    UploadId,
    UploadItem,
    UploadStatus,
};

/// 快照中的数据来源
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistedSource {
    File {
        path: PathBuf,
    },
    /// 内存数据以 base64 保存
    Inline {
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PersistedPayload {
    pub source: PersistedSource,
    pub size: u64,
    pub mime_type: String,
    pub filename: String,
}

/// 可持久化的任务记录
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PersistedItem {
    pub id: UploadId,
    pub destination: DestinationId,
    pub status: UploadStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: Priority,
    pub metadata: HashMap<String, String>,
    pub queued_at: DateTime<Utc>,
    pub total_bytes: u64,
    pub adapted_quality: f64,
    pub error_history: Vec<ErrorRecord>,
    pub payload: PersistedPayload,
}

impl PersistedItem {
    pub fn from_item(item: &UploadItem) -> Self {
        let source = match &item.payload.source {
            PayloadSource::File(path) => PersistedSource::File { path: path.clone() },
            PayloadSource::Memory(data) => PersistedSource::Inline {
                data: BASE64_STANDARD.encode(data),
            },
        };

        Self {
            id: item.id,
            destination: item.destination.clone(),
            status: item.status,
            attempts: item.attempts,
            max_attempts: item.max_attempts,
            priority: item.priority,
            metadata: item.metadata.clone(),
            queued_at: item.queued_at,
            total_bytes: item.total_bytes,
            adapted_quality: item.adapted_quality,
            error_history: item.error_history.clone(),
            payload: PersistedPayload {
                source,
                size: item.payload.size,
                mime_type: item.payload.mime_type.clone(),
                filename: item.payload.filename.clone(),
            },
        }
    }

    /// 恢复为等待中的任务
    ///
    /// 保存时正在上传的那次尝试不计入尝试次数。
    pub fn into_item(self) -> Result<UploadItem> {
        let source = match self.payload.source {
            PersistedSource::File { path } => PayloadSource::File(path),
            PersistedSource::Inline { data } => {
                PayloadSource::Memory(Bytes::from(BASE64_STANDARD.decode(data)?))
            }
        };

        let attempts = match self.status {
            UploadStatus::Uploading => self.attempts.saturating_sub(1),
            _ => self.attempts,
        };

        Ok(UploadItem {
            id: self.id,
            payload: PhotoPayload {
                source,
                size: self.payload.size,
                mime_type: self.payload.mime_type,
                filename: self.payload.filename,
            },
            destination: self.destination,
            status: UploadStatus::Queued,
            attempts: attempts.min(self.max_attempts.saturating_sub(1)),
            max_attempts: self.max_attempts,
            priority: self.priority,
            metadata: self.metadata,
            queued_at: self.queued_at,
            last_attempt_at: None,
            completed_at: None,
            progress_bytes: 0,
            total_bytes: self.total_bytes,
            adapted_quality: self.adapted_quality,
            error_history: self.error_history,
            is_permanent_failure: false,
            remote_id: None,
        })
    }
}

/// JSON 文件快照存储
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn save_snapshot(&self, items: &[PersistedItem]) -> Result<()> {
        let data = serde_json::to_string_pretty(items)?;
        // 先写临时文件再替换，避免写到一半的快照
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!(path = %self.path.display(), items = items.len(), "snapshot saved");
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Vec<PersistedItem>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }

        let data = tokio::fs::read_to_string(&self.path).await?;
        let items: Vec<PersistedItem> = serde_json::from_str(&data)?;
        Ok(items)
    }
}
