mod aggregator;
mod health;

pub use aggregator::{
    AggregatorHandle,
    EventUploadSummary,
    NotifyTrigger,
    StatusAggregator,
    StatusNotification,
    Subscription,
};
pub use health::HealthIssue;
