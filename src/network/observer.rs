use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Ethernet,
    Cellular,
    Unknown,
    None,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionType::Wifi => "wifi",
            ConnectionType::Ethernet => "ethernet",
            ConnectionType::Cellular => "cellular",
            ConnectionType::Unknown => "unknown",
            ConnectionType::None => "none",
        };
        f.write_str(name)
    }
}

/// 当前网络状态
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub connected: bool,
    pub connection_type: ConnectionType,
    /// 最近一次测得的延迟
    pub latency_ms: Option<u32>,
}

impl NetworkStatus {
    pub fn connected(connection_type: ConnectionType) -> Self {
        Self {
            connected: true,
            connection_type,
            latency_ms: None,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            connection_type: ConnectionType::None,
            latency_ms: None,
        }
    }

    pub fn unknown() -> Self {
        Self::connected(ConnectionType::Unknown)
    }

    pub fn with_latency(mut self, latency_ms: u32) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// 网络变化事件
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NetworkEvent {
    /// 连接状态未变，类型或延迟变化
    Changed(NetworkStatus),
    /// 从断开恢复为连接
    Reconnected(NetworkStatus),
    /// 从连接变为断开
    Disconnected(NetworkStatus),
}

impl NetworkEvent {
    pub fn status(&self) -> NetworkStatus {
        match self {
            NetworkEvent::Changed(status)
            | NetworkEvent::Reconnected(status)
            | NetworkEvent::Disconnected(status) => *status,
        }
    }
}

/// 平台网络状态查询接口
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn query(&self) -> std::result::Result<NetworkStatus, String>;
}

/// 网络观察者
///
/// 最新状态通过 `watch` 共享，只有观察者自身写入；变化事件通过 `broadcast` 发出。
pub struct NetworkObserver {
    state_tx: watch::Sender<NetworkStatus>,
    event_tx: broadcast::Sender<NetworkEvent>,
    probe: Option<Arc<dyn NetworkProbe>>,
}

impl NetworkObserver {
    pub fn new(initial: NetworkStatus) -> Self {
        let (state_tx, _) = watch::channel(initial);
        // 最大缓存 64 个事件
        let (event_tx, _) = broadcast::channel(64);

        Self {
            state_tx,
            event_tx,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn current(&self) -> NetworkStatus {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.event_tx.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.state_tx.subscribe()
    }

    /// 写入新的网络状态，返回产生的事件（状态未变化时为 None）
    pub fn update(&self, status: NetworkStatus) -> Option<NetworkEvent> {
        let previous = self.state_tx.send_replace(status);
        if previous == status {
            return None;
        }

        let event = match (previous.connected, status.connected) {
            (false, true) => {
                info!(connection_type = %status.connection_type, "network reconnected");
                NetworkEvent::Reconnected(status)
            }
            (true, false) => {
                info!("network disconnected");
                NetworkEvent::Disconnected(status)
            }
            _ => {
                debug!(
                    connection_type = %status.connection_type,
                    latency_ms = ?status.latency_ms,
                    "network changed"
                );
                NetworkEvent::Changed(status)
            }
        };

        // 没有订阅者时发送失败，忽略
        let _ = self.event_tx.send(event);
        Some(event)
    }

    /// 通过探针刷新状态，查询失败按 unknown 处理
    pub async fn refresh(&self) -> NetworkStatus {
        let status = match &self.probe {
            Some(probe) => match probe.query().await {
                Ok(status) => status,
                Err(err) => {
                    warn!("network probe failed, treating as unknown: {}", err);
                    NetworkStatus {
                        connected: self.current().connected,
                        connection_type: ConnectionType::Unknown,
                        latency_ms: None,
                    }
                }
            },
            None => self.current(),
        };

        self.update(status);
        status
    }

    /// 定时轮询探针
    pub fn spawn_polling(self: &Arc<Self>, period: Duration, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let observer = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = ticker.tick() => {
                        observer.refresh().await;
                    }
                }
            }
        })
    }
}

impl Default for NetworkObserver {
    fn default() -> Self {
        Self::new(NetworkStatus::unknown())
    }
}
