use crate::config::DeviceConfig;
use crate::device::{Connector, DeviceClient, PushError, PushRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum Behaviour {
    Succeed,
    /// Sleeps, then succeeds. Longer than the push timeout means a timeout.
    Delay(Duration),
    Reject,
    Malformed,
    Panic,
}

#[derive(Debug, Clone)]
pub struct PushRecord {
    pub overlay_id: String,
    pub text: String,
    pub at: Instant,
}

/// Scripted [`DeviceClient`]: per-overlay behaviour, everything recorded.
#[derive(Default)]
pub struct ScriptedClient {
    behaviour: Mutex<HashMap<String, Behaviour>>,
    pub pushes: Mutex<Vec<PushRecord>>,
    pub fetches: AtomicUsize,
    pub closes: AtomicUsize,
    pub fetch_fails: bool,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            fetch_fails: true,
            ..Self::default()
        })
    }

    pub fn set(&self, overlay_id: &str, behaviour: Behaviour) {
        self.behaviour
            .lock()
            .insert(overlay_id.to_string(), behaviour);
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().len()
    }
}

#[async_trait]
impl DeviceClient for ScriptedClient {
    async fn push(&self, req: &PushRequest<'_>) -> Result<(), PushError> {
        self.pushes.lock().push(PushRecord {
            overlay_id: req.overlay_id.to_string(),
            text: req.text.to_string(),
            at: Instant::now(),
        });
        let behaviour = self
            .behaviour
            .lock()
            .get(req.overlay_id)
            .cloned()
            .unwrap_or(Behaviour::Succeed);
        match behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            Behaviour::Reject => Err(PushError::CredentialRejected { status: 401 }),
            Behaviour::Malformed => Err(PushError::MalformedResponse("scripted".into())),
            Behaviour::Panic => panic!("scripted panic in push"),
        }
    }

    async fn fetch(&self, _overlay_id: &str, _timeout: Duration) -> Result<String, PushError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fetch_fails {
            Err(PushError::Transport("connection refused".into()))
        } else {
            Ok("<TextOverlay/>".into())
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out pre-built [`ScriptedClient`]s by device name; unknown names fail to connect.
#[derive(Default)]
pub struct ScriptedConnector {
    clients: HashMap<String, Arc<ScriptedClient>>,
}

impl ScriptedConnector {
    pub fn with(mut self, name: &str, client: Arc<ScriptedClient>) -> Self {
        self.clients.insert(name.to_string(), client);
        self
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, device: &DeviceConfig) -> Result<Arc<dyn DeviceClient>, PushError> {
        match self.clients.get(&device.name) {
            Some(client) => Ok(client.clone() as Arc<dyn DeviceClient>),
            None => Err(PushError::Transport(format!(
                "нет сценария для '{}'",
                device.name
            ))),
        }
    }
}

pub fn device(name: &str, overlay_ids: &[&str]) -> DeviceConfig {
    DeviceConfig {
        name: name.to_string(),
        ip: "192.0.2.1".to_string(),
        port: 80,
        username: "admin".to_string(),
        password: "secret".to_string(),
        channel: 1,
        overlays: overlay_ids
            .iter()
            .map(|id| crate::config::OverlayConfig {
                id: id.to_string(),
                content: format!("{{camera_name}} #{id}"),
                enabled: true,
                position_x: None,
                position_y: None,
            })
            .collect(),
    }
}
