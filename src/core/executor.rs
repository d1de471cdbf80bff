use std::future::Future;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use crate::config::{DeviceInfo, UploadConfig};
use crate::utils::ProgressThrottle;
use super::errors::TransportError;
use super::traits::{RemoteAck, UploadRequest, UploadTransport};
use super::types::{PayloadSource, PhotoPayload, ProgressUpdate, UploadItem};

/// 单次尝试的失败原因
#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("Attempt interrupted after {bytes_sent} bytes")]
    Interrupted {
        bytes_sent: u64,
    },

    #[error("Attempt timed out after {elapsed:?}")]
    TimedOut {
        elapsed: Duration,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Verification failed: expected {expected} bytes, server received {actual}")]
    Verification {
        expected: u64,
        actual: u64,
    },

    #[error("Payload unreadable: {0}")]
    Payload(#[from] std::io::Error),
}

/// 上传执行器 - 执行一次分块上传尝试，自身不做重试
pub struct UploadExecutor {
    transport: Arc<dyn UploadTransport>,
    chunk_size: usize,
    progress_interval: Duration,
    progress_step_percent: u8,
    device_info: DeviceInfo,
}

impl UploadExecutor {
    pub fn new(transport: Arc<dyn UploadTransport>, config: &UploadConfig) -> Self {
        Self {
            transport,
            chunk_size: config.chunk_size_bytes,
            progress_interval: config.progress_interval(),
            progress_step_percent: config.progress_step_percent,
            device_info: config.device_info.clone(),
        }
    }

    pub fn build_request(&self, item: &UploadItem) -> UploadRequest {
        UploadRequest {
            destination: item.destination.clone(),
            file_name: item.payload.filename.clone(),
            mime_type: item.payload.mime_type.clone(),
            file_size: item.total_bytes,
            created_at: item.queued_at,
            device_info: self.device_info.clone(),
            quality: item.adapted_quality,
            metadata: item.metadata.clone(),
        }
    }

    /// 执行一次尝试
    ///
    /// 取消只在分块边界检查；超时从尝试开始计时，超时后放弃当前请求。
    pub async fn execute<F>(
        &self,
        item: &UploadItem,
        mut on_progress: F,
        timeout: Duration,
        cancellation_token: &CancellationToken,
    ) -> Result<RemoteAck, ExecuteError>
    where
        F: FnMut(ProgressUpdate) + Send,
    {
        let started = Instant::now();
        let deadline = started + timeout;

        if cancellation_token.is_cancelled() {
            return Err(ExecuteError::Interrupted { bytes_sent: 0 });
        }

        let request = self.build_request(item);
        let session = within_deadline(started, deadline, self.transport.open(&request)).await?;
        debug!(upload_id = %item.id, session = %session, "upload session opened");

        let result = self
            .transfer(item, &session, started, deadline, &mut on_progress, cancellation_token)
            .await;

        if result.is_err() {
            // 释放服务端会话
            self.transport.abort(&session).await;
        }

        result
    }

    async fn transfer<F>(
        &self,
        item: &UploadItem,
        session: &str,
        started: Instant,
        deadline: Instant,
        on_progress: &mut F,
        cancellation_token: &CancellationToken,
    ) -> Result<RemoteAck, ExecuteError>
    where
        F: FnMut(ProgressUpdate) + Send,
    {
        let total_bytes = item.total_bytes;
        let mut reader = ChunkReader::open(&item.payload).await?;
        let mut throttle = ProgressThrottle::new(self.progress_interval, self.progress_step_percent);
        let mut offset = 0u64;

        while offset < total_bytes {
            if cancellation_token.is_cancelled() {
                return Err(ExecuteError::Interrupted { bytes_sent: offset });
            }

            let len = (self.chunk_size as u64).min(total_bytes - offset) as usize;
            let chunk = reader.read_chunk(offset, len).await?;
            within_deadline(started, deadline, self.transport.send_chunk(session, offset, chunk)).await?;

            offset += len as u64;
            trace!(upload_id = %item.id, offset, total_bytes, "chunk sent");

            if let Some(update) = throttle.observe(offset, total_bytes) {
                on_progress(update);
            }
        }

        if cancellation_token.is_cancelled() {
            return Err(ExecuteError::Interrupted { bytes_sent: offset });
        }

        let ack = within_deadline(started, deadline, self.transport.verify(session, total_bytes)).await?;
        if ack.received_size != total_bytes {
            return Err(ExecuteError::Verification {
                expected: total_bytes,
                actual: ack.received_size,
            });
        }

        Ok(ack)
    }
}

async fn within_deadline<T, Fut>(started: Instant, deadline: Instant, future: Fut) -> Result<T, ExecuteError>
where
    Fut: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout_at(deadline, future).await {
        Ok(result) => result.map_err(ExecuteError::from),
        Err(_) => Err(ExecuteError::TimedOut {
            elapsed: started.elapsed(),
        }),
    }
}

/// 按偏移读取分块
enum ChunkReader {
    Memory(Bytes),
    File(File),
}

impl ChunkReader {
    async fn open(payload: &PhotoPayload) -> std::io::Result<Self> {
        match &payload.source {
            PayloadSource::Memory(data) => Ok(ChunkReader::Memory(data.clone())),
            PayloadSource::File(path) => Ok(ChunkReader::File(File::open(path).await?)),
        }
    }

    async fn read_chunk(&mut self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        match self {
            ChunkReader::Memory(data) => {
                let start = offset as usize;
                let end = start + len;
                if end > data.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("payload shorter than declared size ({} < {})", data.len(), end),
                    ));
                }
                Ok(data.slice(start..end))
            }
            ChunkReader::File(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buffer = vec![0u8; len];
                file.read_exact(&mut buffer).await?;
                Ok(Bytes::from(buffer))
            }
        }
    }
}
