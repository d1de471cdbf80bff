use std::time::Duration;
use serde::Serialize;
use crate::config::HealthConfig;
use crate::core::DestinationId;

/// 健康问题
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthIssue {
    /// 已结束任务中失败比例过高
    HighFailureRate {
        destination: DestinationId,
        failure_rate: f64,
        failed: usize,
        finished: usize,
    },
    /// 有等待中的任务，但长时间没有任何上传进展
    Stalled {
        destination: DestinationId,
        queued: usize,
        idle_ms: u64,
    },
}

impl HealthIssue {
    pub fn destination(&self) -> &DestinationId {
        match self {
            HealthIssue::HighFailureRate { destination, .. } | HealthIssue::Stalled { destination, .. } => destination,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HealthIssue::HighFailureRate { .. } => "high_failure_rate",
            HealthIssue::Stalled { .. } => "stalled",
        }
    }

    /// 同一目标的同类问题视为同一个问题
    pub(crate) fn same_issue(&self, other: &HealthIssue) -> bool {
        self.kind() == other.kind() && self.destination() == other.destination()
    }
}

/// 单个目标的健康检查输入
#[derive(Debug, Clone, Copy)]
pub(crate) struct HealthSample<'a> {
    pub destination: &'a DestinationId,
    pub queued: usize,
    pub uploading: usize,
    pub completed: usize,
    pub failed: usize,
    pub idle: Duration,
}

pub(crate) fn evaluate(sample: HealthSample<'_>, config: &HealthConfig) -> Vec<HealthIssue> {
    let mut issues = Vec::new();

    let finished = sample.completed + sample.failed;
    if finished >= config.min_samples.max(1) {
        let failure_rate = sample.failed as f64 / finished as f64;
        if failure_rate > config.failure_rate_threshold {
            issues.push(HealthIssue::HighFailureRate {
                destination: sample.destination.clone(),
                failure_rate,
                failed: sample.failed,
                finished,
            });
        }
    }

    let stall_threshold = Duration::from_millis(config.stall_threshold_ms);
    if sample.queued > 0 && sample.uploading == 0 && sample.idle >= stall_threshold {
        issues.push(HealthIssue::Stalled {
            destination: sample.destination.clone(),
            queued: sample.queued,
            idle_ms: sample.idle.as_millis() as u64,
        });
    }

    issues
}

/// 问题集合是否变化（只比较种类和目标）
pub(crate) fn issues_changed(previous: &[HealthIssue], current: &[HealthIssue]) -> bool {
    previous.len() != current.len()
        || current
            .iter()
            .any(|issue| !previous.iter().any(|old| old.same_issue(issue)))
}
