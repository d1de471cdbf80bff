use std::time::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use crate::config::UploadConfig;
use crate::core::{ExecuteError, TransportError};

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    ServerError,
    FileTooLarge,
    InvalidFile,
    Forbidden,
    Unknown,
}

impl ErrorCategory {
    /// 永久错误无论尝试次数都不再重试
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorCategory::FileTooLarge | ErrorCategory::InvalidFile | ErrorCategory::Forbidden
        )
    }

    /// 按 HTTP 状态码分类
    pub fn from_status(status_code: u16) -> Self {
        match status_code {
            401 | 403 => ErrorCategory::Forbidden,
            413 => ErrorCategory::FileTooLarge,
            400 | 415 | 422 => ErrorCategory::InvalidFile,
            408 => ErrorCategory::Timeout,
            429 | 500..=599 => ErrorCategory::ServerError,
            _ => ErrorCategory::Unknown,
        }
    }

    /// 按错误消息关键字分类
    pub fn from_message(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        let has = |needle: &str| message.contains(needle);

        if has("forbidden") || has("unauthorized") || has("permission") {
            ErrorCategory::Forbidden
        } else if has("too large") || has("payload too") || has("file size") {
            ErrorCategory::FileTooLarge
        } else if has("invalid") || has("unsupported") || has("corrupt") {
            ErrorCategory::InvalidFile
        } else if has("timeout") || has("timed out") {
            ErrorCategory::Timeout
        } else if has("network") || has("connection") || has("offline") || has("dns") {
            ErrorCategory::Network
        } else if has("server") || has("5xx") || has("internal error") {
            ErrorCategory::ServerError
        } else {
            ErrorCategory::Unknown
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::FileTooLarge => "file_too_large",
            ErrorCategory::InvalidFile => "invalid_file",
            ErrorCategory::Forbidden => "forbidden",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

pub fn classify_transport(error: &TransportError) -> ErrorCategory {
    match error {
        TransportError::Network(_) => ErrorCategory::Network,
        TransportError::Timeout => ErrorCategory::Timeout,
        TransportError::Status { status_code, .. } => ErrorCategory::from_status(*status_code),
        TransportError::InvalidResponse(message) => match ErrorCategory::from_message(message) {
            ErrorCategory::Unknown => ErrorCategory::ServerError,
            category => category,
        },
    }
}

/// 对一次失败的尝试进行分类
pub fn classify(error: &ExecuteError) -> ErrorCategory {
    match error {
        ExecuteError::TimedOut { .. } => ErrorCategory::Timeout,
        ExecuteError::Transport(err) => classify_transport(err),
        // 校验失败按服务端错误处理
        ExecuteError::Verification { .. } => ErrorCategory::ServerError,
        ExecuteError::Payload(_) => ErrorCategory::InvalidFile,
        ExecuteError::Interrupted { .. } => ErrorCategory::Unknown,
    }
}

/// 重试判定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
    pub is_permanent: bool,
    pub category: ErrorCategory,
}

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            multiplier: config.backoff_multiplier,
            jitter_ratio: config.jitter_ratio,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// 第 n 次尝试失败后的延迟（不含抖动）
    ///
    /// `min(base * multiplier^(n-1), max)`
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// 叠加抖动，`sample` 取值 [0, 1)
    pub fn with_jitter(&self, delay: Duration, sample: f64) -> Duration {
        let jitter_ms = delay.as_millis() as f64 * self.jitter_ratio * sample.clamp(0.0, 1.0);
        delay + Duration::from_millis(jitter_ms as u64)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(0.0..1.0);
        self.with_jitter(self.base_delay_for(attempt), sample)
    }

    /// 根据尝试次数与错误分类决定是否重试
    pub fn decide(&self, attempt: u32, category: ErrorCategory) -> RetryDecision {
        self.decide_with_limit(attempt, self.max_attempts, category)
    }

    pub fn decide_with_limit(&self, attempt: u32, max_attempts: u32, category: ErrorCategory) -> RetryDecision {
        let retry = !category.is_permanent() && attempt < max_attempts;
        if !retry {
            return RetryDecision {
                retry: false,
                delay: Duration::ZERO,
                is_permanent: true,
                category,
            };
        }

        RetryDecision {
            retry: true,
            delay: self.delay_for(attempt),
            is_permanent: false,
            category,
        }
    }
}
