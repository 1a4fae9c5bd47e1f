use crate::config::DeviceConfig;
use crate::device::{Connector, DeviceClient, PushError};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Persistent sessions, one per device, created before the first cycle.
/// Devices whose session could not be opened are simply absent.
pub struct SessionPool {
    sessions: HashMap<String, Arc<dyn DeviceClient>>,
}

impl SessionPool {
    pub fn open(devices: &[DeviceConfig], connector: &dyn Connector) -> Self {
        let mut sessions = HashMap::with_capacity(devices.len());
        for device in devices {
            match connector.connect(device) {
                Ok(client) => {
                    sessions.insert(device.name.clone(), client);
                }
                Err(err) => {
                    warn!(device = %device.name, error = %err, "не удалось создать сессию");
                }
            }
        }
        info!(
            sessions = sessions.len(),
            devices = devices.len(),
            "сессии с камерами открыты"
        );
        Self { sessions }
    }

    pub fn get(&self, device_name: &str) -> Result<&Arc<dyn DeviceClient>, PushError> {
        self.sessions
            .get(device_name)
            .ok_or_else(|| PushError::Transport(format!("нет сессии для '{device_name}'")))
    }

    /// Consumes the pool, so every session is closed exactly once.
    pub async fn close(self) {
        let count = self.sessions.len();
        join_all(self.sessions.values().map(|client| client.close())).await;
        info!(sessions = count, "сессии закрыты");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub reachable: Vec<String>,
    pub unreachable: Vec<String>,
}

impl ProbeSummary {
    pub fn total(&self) -> usize {
        self.reachable.len() + self.unreachable.len()
    }

    pub fn none_reachable(&self) -> bool {
        self.reachable.is_empty()
    }
}

/// Fetches the first overlay of every device once, concurrently.
pub async fn probe_fleet(
    devices: &[DeviceConfig],
    pool: &SessionPool,
    timeout: Duration,
) -> ProbeSummary {
    info!("проверка доступности камер");

    let checks = devices.iter().map(|device| async move {
        let result = match (pool.get(&device.name), device.overlays.first()) {
            (Ok(client), Some(overlay)) => {
                match tokio::time::timeout(timeout, client.fetch(&overlay.id, timeout)).await {
                    Ok(result) => result.map(|_| ()),
                    Err(_) => Err(PushError::Timeout(timeout)),
                }
            }
            (Err(err), _) => Err(err),
            (Ok(_), None) => Err(PushError::Transport("нет оверлеев для проверки".to_string())),
        };
        (device.name.as_str(), result)
    });

    let mut summary = ProbeSummary::default();
    for (name, result) in join_all(checks).await {
        match result {
            Ok(()) => {
                info!(device = %name, "камера доступна");
                summary.reachable.push(name.to_string());
            }
            Err(err) => {
                warn!(device = %name, error = %err, "камера недоступна");
                summary.unreachable.push(name.to_string());
            }
        }
    }

    if summary.none_reachable() {
        tracing::error!(
            total = summary.total(),
            "все камеры недоступны: проверьте сеть, адреса и учётные данные"
        );
    } else if !summary.unreachable.is_empty() {
        warn!(
            reachable = summary.reachable.len(),
            total = summary.total(),
            "доступны не все камеры, синхронизация запустится с частью парка"
        );
    } else {
        info!(total = summary.total(), "все камеры доступны");
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{device, ScriptedClient, ScriptedConnector};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn failed_sessions_are_left_out_of_the_pool() {
        let a = ScriptedClient::new();
        let connector = ScriptedConnector::default().with("a", a.clone());
        let devices = vec![device("a", &["1"]), device("b", &["1"])];

        let pool = SessionPool::open(&devices, &connector);
        assert!(pool.get("a").is_ok());
        assert!(pool.get("b").is_err());
    }

    #[tokio::test]
    async fn close_reaches_every_session_once() {
        let a = ScriptedClient::new();
        let b = ScriptedClient::new();
        let connector = ScriptedConnector::default()
            .with("a", a.clone())
            .with("b", b.clone());
        let devices = vec![device("a", &["1"]), device("b", &["1"])];

        SessionPool::open(&devices, &connector).close().await;
        assert_eq!(a.closes.load(Ordering::SeqCst), 1);
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn probe_splits_reachable_and_unreachable() {
        let connector = ScriptedConnector::default()
            .with("up", ScriptedClient::new())
            .with("down", ScriptedClient::unreachable());
        let devices = vec![
            device("up", &["1"]),
            device("down", &["1"]),
            device("nosession", &["1"]),
        ];
        let pool = SessionPool::open(&devices, &connector);

        let summary = probe_fleet(&devices, &pool, Duration::from_secs(1)).await;
        assert_eq!(summary.reachable, vec!["up".to_string()]);
        assert_eq!(
            summary.unreachable,
            vec!["down".to_string(), "nosession".to_string()]
        );
        assert!(!summary.none_reachable());
    }

    #[tokio::test]
    async fn probe_with_nothing_reachable() {
        let connector = ScriptedConnector::default().with("down", ScriptedClient::unreachable());
        let devices = vec![device("down", &["1"])];
        let pool = SessionPool::open(&devices, &connector);

        let summary = probe_fleet(&devices, &pool, Duration::from_secs(1)).await;
        assert!(summary.none_reachable());
        assert_eq!(summary.total(), 1);
    }
}
