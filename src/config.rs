use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::{Result, UploadError};
use crate::network::ConnectionType;

/// 上传子系统配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 最大并发上传数
    pub max_concurrent_uploads: usize,
    /// 每个任务的最大尝试次数
    pub max_attempts: u32,
    /// 退避基础延迟
    pub base_delay_ms: u64,
    /// 退避延迟上限
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 抖动比例，实际抖动为 delay * ratio * uniform(0,1)
    pub jitter_ratio: f64,
    /// 允许开始传输的网络类型
    pub required_connection_types: Vec<ConnectionType>,
    /// 各网络类型对应的质量系数
    pub quality_by_connection_type: HashMap<ConnectionType, f64>,
    /// 延迟超过该值视为慢网络
    pub slow_latency_ms: u32,
    pub slow_quality_factor: f64,
    pub chunk_size_bytes: usize,
    /// 单次尝试超时
    pub timeout_ms: u64,
    pub progress_interval_ms: u64,
    pub progress_step_percent: u8,
    /// 状态聚合通知间隔
    pub status_update_interval_ms: u64,
    /// 已完成任务在聚合器中的保留时长
    pub completed_retention_ms: u64,
    pub allowed_mime_types: Vec<String>,
    pub max_file_size_bytes: Option<u64>,
    pub health: HealthConfig,
    pub device_info: DeviceInfo,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 3,
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.1,
            required_connection_types: vec![
                ConnectionType::Wifi,
                ConnectionType::Ethernet,
                ConnectionType::Cellular,
                ConnectionType::Unknown,
            ],
            quality_by_connection_type: HashMap::from([
                (ConnectionType::Wifi, 0.95),
                (ConnectionType::Ethernet, 0.95),
                (ConnectionType::Cellular, 0.7),
                (ConnectionType::Unknown, 0.5),
            ]),
            slow_latency_ms: 800,
            slow_quality_factor: 0.4,
            chunk_size_bytes: 1024 * 1024, // 1MB
            timeout_ms: 60_000,
            progress_interval_ms: 500,
            progress_step_percent: 10,
            status_update_interval_ms: 10_000,
            completed_retention_ms: 5 * 60 * 1000,
            allowed_mime_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/heic".to_string(),
                "image/heif".to_string(),
                "image/webp".to_string(),
            ],
            max_file_size_bytes: Some(50 * 1024 * 1024),
            health: HealthConfig::default(),
            device_info: DeviceInfo::default(),
        }
    }
}

/// 健康检查阈值
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub failure_rate_threshold: f64,
    /// 至少结束这么多任务才计算失败率
    pub min_samples: usize,
    pub stall_threshold_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.25,
            min_samples: 4,
            stall_threshold_ms: 120_000,
        }
    }
}

/// 随上传请求发送的设备信息
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceInfo {
    pub platform: Option<String>,
    pub model: Option<String>,
    pub app_version: Option<String>,
}

impl UploadConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: UploadConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_uploads == 0 {
            return Err(UploadError::invalid_config("max_concurrent_uploads must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(UploadError::invalid_config("max_attempts must be greater than 0"));
        }
        if self.chunk_size_bytes == 0 {
            return Err(UploadError::invalid_config("chunk_size_bytes must be greater than 0"));
        }
        if self.timeout_ms == 0 {
            return Err(UploadError::invalid_config("timeout_ms must be greater than 0"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(UploadError::invalid_config("backoff_multiplier must be at least 1.0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(UploadError::invalid_config("max_delay_ms must not be less than base_delay_ms"));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(UploadError::invalid_config("jitter_ratio must be within 0..=1"));
        }
        let out_of_range = self
            .quality_by_connection_type
            .iter()
            .find(|(_, factor)| !(0.0..=1.0).contains(*factor));
        if let Some((connection_type, factor)) = out_of_range {
            return Err(UploadError::invalid_config(format!(
                "quality factor {factor} for {connection_type} is outside 0..=1"
            )));
        }
        if !(0.0..=1.0).contains(&self.slow_quality_factor) {
            return Err(UploadError::invalid_config("slow_quality_factor must be within 0..=1"));
        }
        if self.progress_step_percent == 0 || self.progress_step_percent > 100 {
            return Err(UploadError::invalid_config("progress_step_percent must be within 1..=100"));
        }

        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn status_update_interval(&self) -> Duration {
        Duration::from_millis(self.status_update_interval_ms)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.completed_retention_ms)
    }

    pub fn is_mime_allowed(&self, mime_type: &str) -> bool {
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime_type))
    }
}
