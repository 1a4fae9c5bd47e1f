pub mod digest;
pub mod isapi;
#[cfg(test)]
pub mod mock;
pub mod xml;

use crate::config::DeviceConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure classes of a single push or fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CredentialRejected,
    Timeout,
    Transport,
    MalformedResponse,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::CredentialRejected => "credential_rejected",
            FailureKind::Timeout => "timeout",
            FailureKind::Transport => "transport",
            FailureKind::MalformedResponse => "malformed_response",
        }
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("камера отклонила учётные данные (HTTP {status})")]
    CredentialRejected { status: u16 },
    #[error("таймаут {0:?}")]
    Timeout(Duration),
    #[error("ошибка транспорта: {0}")]
    Transport(String),
    #[error("неожиданный HTTP-статус {0}")]
    UnexpectedStatus(u16),
    #[error("некорректный ответ камеры: {0}")]
    MalformedResponse(String),
    #[error("сессия уже закрыта")]
    SessionClosed,
}

impl PushError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PushError::CredentialRejected { .. } => FailureKind::CredentialRejected,
            PushError::Timeout(_) => FailureKind::Timeout,
            PushError::Transport(_) | PushError::UnexpectedStatus(_) | PushError::SessionClosed => {
                FailureKind::Transport
            }
            PushError::MalformedResponse(_) => FailureKind::MalformedResponse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub x: Option<i64>,
    pub y: Option<i64>,
}

impl Position {
    pub fn is_unset(&self) -> bool {
        self.x.is_none() && self.y.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct PushRequest<'a> {
    pub overlay_id: &'a str,
    pub text: &'a str,
    pub enabled: bool,
    pub position: Position,
    /// Skip the fetch-before-push step. Only honoured when `position` is unset.
    pub fast_path: bool,
    pub timeout: Duration,
}

/// One persistent, authenticated session with a device.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn push(&self, req: &PushRequest<'_>) -> Result<(), PushError>;

    /// Returns the raw overlay document.
    async fn fetch(&self, overlay_id: &str, timeout: Duration) -> Result<String, PushError>;

    async fn close(&self);
}

/// Opens sessions. Kept separate from [`DeviceClient`] so the pool can be
/// built against scripted clients in tests.
pub trait Connector: Send + Sync {
    fn connect(&self, device: &DeviceConfig) -> Result<Arc<dyn DeviceClient>, PushError>;
}
