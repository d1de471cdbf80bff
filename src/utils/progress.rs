use std::time::Duration;
use tokio::time::Instant;
use crate::core::ProgressUpdate;

/// 进度节流器
///
/// 每跨过一个百分比台阶或距上次上报超过间隔才上报一次，完成时总会上报。
pub struct ProgressThrottle {
    interval: Duration,
    step_percent: f64,
    last_emit_at: Option<Instant>,
    last_emit_percent: f64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, step_percent: u8) -> Self {
        Self {
            interval,
            step_percent: f64::from(step_percent.max(1)),
            last_emit_at: None,
            last_emit_percent: 0.0,
        }
    }

    pub fn observe(&mut self, bytes_transferred: u64, total_bytes: u64) -> Option<ProgressUpdate> {
        self.observe_at(bytes_transferred, total_bytes, Instant::now())
    }

    pub fn observe_at(&mut self, bytes_transferred: u64, total_bytes: u64, now: Instant) -> Option<ProgressUpdate> {
        let percent = percentage(bytes_transferred, total_bytes);

        let finished = bytes_transferred >= total_bytes;
        let stepped = percent - self.last_emit_percent >= self.step_percent;
        let elapsed = self
            .last_emit_at
            .map(|at| now.duration_since(at) >= self.interval)
            .unwrap_or(true);

        if !(finished || stepped || elapsed) {
            return None;
        }

        self.last_emit_at = Some(now);
        self.last_emit_percent = percent;

        Some(ProgressUpdate {
            bytes_transferred,
            total_bytes,
            percent,
        })
    }
}

pub fn percentage(bytes: u64, total_bytes: u64) -> f64 {
    if total_bytes > 0 {
        (bytes as f64 / total_bytes as f64 * 100.0).min(100.0)
    } else {
        0.0
    }
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const UNIT_SIZE: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= UNIT_SIZE && unit_index < UNITS.len() - 1 {
        size /= UNIT_SIZE;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 格式化持续时间
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
