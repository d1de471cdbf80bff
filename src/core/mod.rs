mod errors;
mod executor;
mod notify;
mod queue;
mod store;
mod traits;
mod types;
mod worker;

pub use errors::{Result, TransportError, UploadError};
pub use executor::{ExecuteError, UploadExecutor};
pub use notify::{ServiceNotification, TracingNotifier};
pub use queue::{UploadQueue, UploadQueueBuilder, UploadQueueHandle};
pub use traits::{
    CompletionHook,
    ObserverNotifier,
    RemoteAck,
    SnapshotStore,
    UploadRequest,
    UploadTransport,
};
pub use types::{
    CancelAllResult,
    DestinationId,
    EnqueueOptions,
    ErrorRecord,
    ItemSummary,
    PayloadSource,
    PhotoPayload,
    Priority,
    ProgressUpdate,
    QueueStatus,
    UploadEvent,
    UploadId,
    UploadItem,
    UploadStatus,
};
