pub mod config;
pub mod core;
pub mod network;
pub mod progress;
pub mod storage;
pub mod uploaders;
pub mod utils;

// 重新导出核心类型
pub use crate::config::{DeviceInfo, HealthConfig, UploadConfig};
pub use crate::core::{
    CancelAllResult,
    DestinationId,
    EnqueueOptions,
    ErrorRecord,
    ObserverNotifier,
    PhotoPayload,
    Priority,
    QueueStatus,
    RemoteAck,
    Result,
    ServiceNotification,
    SnapshotStore,
    TracingNotifier,
    TransportError,
    UploadError,
    UploadEvent,
    UploadId,
    UploadItem,
    UploadQueue,
    UploadQueueBuilder,
    UploadQueueHandle,
    UploadRequest,
    UploadStatus,
    UploadTransport,
};
pub use crate::network::{ConnectionType, NetworkEvent, NetworkObserver, NetworkProbe, NetworkStatus};
pub use crate::progress::{EventUploadSummary, HealthIssue, StatusAggregator, StatusNotification, Subscription};
pub use crate::storage::JsonFileStore;
pub use crate::uploaders::HttpTransport;
pub use crate::utils::{ErrorCategory, RetryPolicy};
