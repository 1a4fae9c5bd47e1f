use crate::config::{DeviceConfig, OverlayConfig};
use crate::device::{DeviceClient, FailureKind, Position, PushError, PushRequest};
use crate::render::{ContentRenderer, RenderContext};
use crate::session::SessionPool;
use chrono::Local;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    pub overlay_id: String,
    pub success: bool,
    pub failure: Option<FailureKind>,
    pub elapsed: Duration,
}

impl CycleOutcome {
    fn failed(overlay_id: &str, kind: FailureKind, elapsed: Duration) -> Self {
        Self {
            overlay_id: overlay_id.to_string(),
            success: false,
            failure: Some(kind),
            elapsed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCycleResult {
    pub success: u32,
    pub failed: u32,
    pub duration: Duration,
    pub outcomes: Vec<CycleOutcome>,
}

impl DeviceCycleResult {
    fn from_outcomes(outcomes: Vec<CycleOutcome>, duration: Duration) -> Self {
        let success = outcomes.iter().filter(|o| o.success).count() as u32;
        let failed = outcomes.len() as u32 - success;
        Self {
            success,
            failed,
            duration,
            outcomes,
        }
    }

    /// Every overlay of the device counted as failed.
    fn all_failed(device: &DeviceConfig, kind: FailureKind, duration: Duration) -> Self {
        let outcomes = device
            .overlays
            .iter()
            .map(|o| CycleOutcome::failed(&o.id, kind, Duration::ZERO))
            .collect();
        Self::from_outcomes(outcomes, duration)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetCycleResult {
    pub total_success: u32,
    pub total_failed: u32,
    pub duration: Duration,
    pub devices: BTreeMap<String, DeviceCycleResult>,
}

impl FleetCycleResult {
    pub fn failure_kinds(&self) -> impl Iterator<Item = (&str, FailureKind)> + '_ {
        self.devices.iter().flat_map(|(name, result)| {
            result
                .outcomes
                .iter()
                .filter_map(move |o| o.failure.map(|kind| (name.as_str(), kind)))
        })
    }
}

/// Pushes one fleet snapshot. Every failure ends up as a counted outcome;
/// nothing escapes to the caller.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    renderer: ContentRenderer,
    timeout: Duration,
    fast_mode: bool,
}

impl Dispatcher {
    pub fn new(renderer: ContentRenderer, timeout: Duration, fast_mode: bool) -> Self {
        Self {
            renderer,
            timeout,
            fast_mode,
        }
    }

    pub async fn sync_fleet(&self, devices: &[DeviceConfig], pool: &SessionPool) -> FleetCycleResult {
        let started = Instant::now();

        let tasks = devices.iter().map(|device| async move {
            let device_started = Instant::now();
            let result = AssertUnwindSafe(self.sync_device(device, pool))
                .catch_unwind()
                .await;
            (device, result, device_started.elapsed())
        });

        let mut fleet = FleetCycleResult::default();
        for (device, result, elapsed) in join_all(tasks).await {
            let device_result = match result {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    error!(
                        device = %device.name,
                        error = %err,
                        "не удалось синхронизировать камеру, повтор в следующем цикле"
                    );
                    DeviceCycleResult::all_failed(device, err.kind(), elapsed)
                }
                Err(panic) => {
                    error!(
                        device = %device.name,
                        panic = %panic_message(panic.as_ref()),
                        "паника при синхронизации камеры"
                    );
                    DeviceCycleResult::all_failed(device, FailureKind::Transport, elapsed)
                }
            };
            fleet.total_success += device_result.success;
            fleet.total_failed += device_result.failed;
            fleet.devices.insert(device.name.clone(), device_result);
        }

        fleet.duration = started.elapsed();
        fleet
    }

    async fn sync_device(
        &self,
        device: &DeviceConfig,
        pool: &SessionPool,
    ) -> Result<DeviceCycleResult, PushError> {
        let client = pool.get(&device.name)?;
        let started = Instant::now();

        let tasks = device.overlays.iter().map(|overlay| async move {
            let overlay_started = Instant::now();
            match AssertUnwindSafe(self.sync_overlay(client, device, overlay))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => {
                    error!(
                        device = %device.name,
                        overlay = %overlay.id,
                        panic = %panic_message(panic.as_ref()),
                        "паника при обновлении оверлея"
                    );
                    CycleOutcome::failed(
                        &overlay.id,
                        FailureKind::Transport,
                        overlay_started.elapsed(),
                    )
                }
            }
        });

        let outcomes = join_all(tasks).await;
        Ok(DeviceCycleResult::from_outcomes(outcomes, started.elapsed()))
    }

    async fn sync_overlay(
        &self,
        client: &Arc<dyn DeviceClient>,
        device: &DeviceConfig,
        overlay: &OverlayConfig,
    ) -> CycleOutcome {
        let started = Instant::now();
        let ctx = RenderContext::new(Local::now(), &device.name, &overlay.id, device.channel);
        let rendered = self.renderer.render(&overlay.content, &ctx);

        let req = PushRequest {
            overlay_id: &overlay.id,
            text: &rendered.text,
            enabled: overlay.enabled,
            position: Position {
                x: overlay.position_x,
                y: overlay.position_y,
            },
            fast_path: self.fast_mode,
            timeout: self.timeout,
        };

        let result = match tokio::time::timeout(self.timeout, client.push(&req)).await {
            Ok(result) => result,
            Err(_) => Err(PushError::Timeout(self.timeout)),
        };
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                info!(
                    device = %device.name,
                    overlay = %overlay.id,
                    text = %preview(&rendered.text),
                    fallback = rendered.used_fallback,
                    truncated = rendered.truncated_from.is_some(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "✓ оверлей обновлён"
                );
                CycleOutcome {
                    overlay_id: overlay.id.clone(),
                    success: true,
                    failure: None,
                    elapsed,
                }
            }
            Err(err @ PushError::CredentialRejected { .. }) => {
                error!(
                    device = %device.name,
                    overlay = %overlay.id,
                    error = %err,
                    "✗ учётные данные отклонены, проверьте username/password в конфигурации"
                );
                CycleOutcome::failed(&overlay.id, err.kind(), elapsed)
            }
            Err(err) => {
                error!(
                    device = %device.name,
                    overlay = %overlay.id,
                    error = %err,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "✗ не удалось обновить оверлей, повтор в следующем цикле"
                );
                CycleOutcome::failed(&overlay.id, err.kind(), elapsed)
            }
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > 30 {
        format!("{}...", text.chars().take(30).collect::<String>())
    } else {
        text.to_string()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "неизвестная паника".to_string()
    }
}
