use crate::config::UploadConfig;
use super::observer::{ConnectionType, NetworkStatus};

/// 准入判定结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    /// 是否允许开始新的传输
    pub allowed: bool,
    /// 上游压缩使用的质量系数 (0..=1)
    pub quality_factor: f64,
}

/// 质量/准入策略，纯函数，不持有状态
pub fn evaluate(status: &NetworkStatus, config: &UploadConfig) -> Admission {
    let allowed = status.connected
        && config.required_connection_types.contains(&status.connection_type);

    Admission {
        allowed,
        quality_factor: quality_factor(status, config),
    }
}

/// 根据网络类型与延迟计算质量系数
pub fn quality_factor(status: &NetworkStatus, config: &UploadConfig) -> f64 {
    let lookup = |connection_type: ConnectionType| {
        config.quality_by_connection_type.get(&connection_type).copied()
    };

    let mut factor = lookup(status.connection_type)
        .or_else(|| lookup(ConnectionType::Unknown))
        .unwrap_or(config.slow_quality_factor);

    // 慢网络进一步降低质量
    if let Some(latency) = status.latency_ms {
        if latency > config.slow_latency_ms {
            factor = factor.min(config.slow_quality_factor);
        }
    }

    factor.clamp(0.0, 1.0)
}
