use std::collections::HashMap;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::config::DeviceInfo;
use crate::storage::PersistedItem;
use super::errors::{Result, TransportError};
use super::notify::ServiceNotification;
use super::types::{DestinationId, UploadItem};

/// 发往后端的上传元数据
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub destination: DestinationId,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub device_info: DeviceInfo,
    /// 调用方/传输层应用的质量系数
    pub quality: f64,
    pub metadata: HashMap<String, String>,
}

/// 后端确认
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAck {
    /// 服务端分配的 ID
    pub remote_id: String,
    /// 服务端实际收到的字节数
    pub received_size: u64,
}

/// 传输层接口 - 后端上传端点的抽象
///
/// 一次尝试的调用顺序：`open` -> 若干次 `send_chunk` -> `verify`，
/// 中途放弃时调用 `abort` 释放会话。
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// 创建上传会话，返回会话标识
    async fn open(&self, request: &UploadRequest) -> std::result::Result<String, TransportError>;

    /// 发送一个分块
    async fn send_chunk(&self, session: &str, offset: u64, chunk: Bytes) -> std::result::Result<(), TransportError>;

    /// 所有分块发送完成后确认服务端收到的内容
    async fn verify(&self, session: &str, expected_size: u64) -> std::result::Result<RemoteAck, TransportError>;

    /// 放弃会话
    async fn abort(&self, _session: &str) {}
}

/// 快照存储接口 - 用于进程重启后恢复未完成的任务
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_snapshot(&self, items: &[PersistedItem]) -> Result<()>;

    async fn load_snapshot(&self) -> Result<Vec<PersistedItem>>;
}

/// 外部通知接口（推送 / UI），不关心投递结果
pub trait ObserverNotifier: Send + Sync {
    fn notify(&self, notification: &ServiceNotification);
}

/// 上传成功后的回调
pub type CompletionHook = Box<dyn Fn(&UploadItem, &RemoteAck) + Send + Sync>;
