use crate::config::DeviceConfig;
use crate::device::digest::{Challenge, DigestSession};
use crate::device::xml::{minimal_overlay, overlay_ids, rewrite_overlay};
use crate::device::{Connector, DeviceClient, PushError, PushRequest};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Method, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Text overlay client for cameras speaking the ISAPI dialect.
pub struct IsapiClient {
    name: String,
    base_url: String,
    channel: u32,
    http: Client,
    auth: DigestSession,
    closed: AtomicBool,
}

impl IsapiClient {
    pub fn new(device: &DeviceConfig) -> Result<Self, PushError> {
        let http = Client::builder()
            .user_agent(concat!("overlaysyncd/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|err| PushError::Transport(err.to_string()))?;

        Ok(Self {
            name: device.name.clone(),
            base_url: format!("http://{}", device.authority()),
            channel: device.channel,
            http,
            auth: DigestSession::new(device.username.clone(), device.password.clone()),
            closed: AtomicBool::new(false),
        })
    }

    fn overlay_path(&self, overlay_id: &str) -> String {
        format!(
            "/ISAPI/System/Video/inputs/channels/{}/overlays/text/{}",
            self.channel, overlay_id
        )
    }

    fn overlays_path(&self) -> String {
        format!(
            "/ISAPI/System/Video/inputs/channels/{}/overlays",
            self.channel
        )
    }

    /// Text overlay ids the camera exposes on the configured channel.
    pub async fn list_overlays(&self, timeout: Duration) -> Result<Vec<String>, PushError> {
        let document = self
            .send(Method::GET, &self.overlays_path(), None, timeout)
            .await?;
        overlay_ids(&document)
    }

    /// One logical request. A 401 triggers exactly one digest re-challenge;
    /// a second rejection means the credentials are wrong.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        timeout: Duration,
    ) -> Result<String, PushError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PushError::SessionClosed);
        }

        let url = format!("{}{}", self.base_url, path);
        let mut challenged = false;

        loop {
            let mut req = self.http.request(method.clone(), &url).timeout(timeout);
            if let Some(body) = &body {
                req = req
                    .header(CONTENT_TYPE, "application/xml")
                    .body(body.clone());
            }
            if let Some(value) = self.auth.authorize(method.as_str(), path) {
                req = req.header(AUTHORIZATION, value);
            }

            let resp = req.send().await.map_err(|err| classify(err, timeout))?;
            let status = resp.status();

            if status == StatusCode::UNAUTHORIZED && !challenged {
                let challenge = Challenge::from_headers(
                    resp.headers()
                        .get_all(WWW_AUTHENTICATE)
                        .iter()
                        .filter_map(|v| v.to_str().ok()),
                )
                .map_err(|err| PushError::MalformedResponse(err.to_string()))?;
                debug!(device = %self.name, realm = %challenge.realm, "получен digest challenge");
                self.auth.remember(challenge);
                challenged = true;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                self.auth.forget();
                return Err(PushError::CredentialRejected {
                    status: status.as_u16(),
                });
            }
            if !status.is_success() {
                return Err(PushError::UnexpectedStatus(status.as_u16()));
            }

            return resp.text().await.map_err(|err| classify(err, timeout));
        }
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> PushError {
    if err.is_timeout() {
        PushError::Timeout(timeout)
    } else if err.is_decode() || err.is_body() {
        PushError::MalformedResponse(err.to_string())
    } else {
        PushError::Transport(err.to_string())
    }
}

#[async_trait]
impl DeviceClient for IsapiClient {
    async fn push(&self, req: &PushRequest<'_>) -> Result<(), PushError> {
        let path = self.overlay_path(req.overlay_id);
        let body = if req.fast_path && req.position.is_unset() {
            minimal_overlay(req.overlay_id, req.enabled, req.text)
        } else {
            let current = self.send(Method::GET, &path, None, req.timeout).await?;
            rewrite_overlay(&current, req.text, req.enabled, req.position)?
        };
        self.send(Method::PUT, &path, Some(body), req.timeout)
            .await
            .map(|_| ())
    }

    async fn fetch(&self, overlay_id: &str, timeout: Duration) -> Result<String, PushError> {
        let path = self.overlay_path(overlay_id);
        self.send(Method::GET, &path, None, timeout).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.auth.forget();
    }
}

pub struct IsapiConnector;

impl Connector for IsapiConnector {
    fn connect(&self, device: &DeviceConfig) -> Result<Arc<dyn DeviceClient>, PushError> {
        Ok(Arc::new(IsapiClient::new(device)?))
    }
}
