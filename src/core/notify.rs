use serde_json::{json, Value};
use tracing::{info, warn};
use crate::progress::{HealthIssue, StatusNotification};
use super::traits::ObserverNotifier;

/// 发给外部观察者的通知
#[derive(Debug, Clone)]
pub enum ServiceNotification {
    StatusUpdated(StatusNotification),
    HealthIssuesDetected(Vec<HealthIssue>),
    ServiceStarted,
    ServiceStopped,
}

impl ServiceNotification {
    pub fn event_type(&self) -> &'static str {
        match self {
            ServiceNotification::StatusUpdated(_) => "status_updated",
            ServiceNotification::HealthIssuesDetected(_) => "health_issues_detected",
            ServiceNotification::ServiceStarted => "service_started",
            ServiceNotification::ServiceStopped => "service_stopped",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            ServiceNotification::StatusUpdated(status) => {
                serde_json::to_value(status).unwrap_or(Value::Null)
            }
            ServiceNotification::HealthIssuesDetected(issues) => json!({ "issues": issues }),
            ServiceNotification::ServiceStarted | ServiceNotification::ServiceStopped => {
                json!({ "timestamp": chrono::Utc::now() })
            }
        }
    }
}

/// 默认通知实现，只写日志
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl ObserverNotifier for TracingNotifier {
    fn notify(&self, notification: &ServiceNotification) {
        match notification {
            ServiceNotification::HealthIssuesDetected(issues) => {
                warn!(event_type = notification.event_type(), issues = issues.len(), "{}", notification.payload());
            }
            _ => {
                info!(event_type = notification.event_type(), "{}", notification.payload());
            }
        }
    }
}
