use crate::config::{Config, DeviceConfig};
use crate::dispatch::{Dispatcher, FleetCycleResult};
use crate::metrics::Metrics;
use crate::render::ContentRenderer;
use crate::session::SessionPool;
use crate::stats::StatsTracker;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Upper bound on a single sleep of the loop, and so on shutdown latency.
pub const TICK_GRANULARITY: Duration = Duration::from_millis(50);

/// Time from `since_epoch` to the next grid point. Intervals of a second or
/// more use whole seconds as the grid, shorter ones use multiples of the
/// interval itself.
pub fn next_boundary_offset(since_epoch: Duration, interval: Duration) -> Duration {
    let grid = if interval >= Duration::from_secs(1) {
        Duration::from_secs(1)
    } else {
        interval
    };
    let grid = grid.as_nanos();
    if grid == 0 {
        return Duration::ZERO;
    }
    let rem = since_epoch.as_nanos() % grid;
    if rem == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos((grid - rem) as u64)
    }
}

fn aligned_start(interval: Duration) -> Instant {
    let now = Instant::now();
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now + next_boundary_offset(since_epoch, interval)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub skipped_ticks: u64,
    pub stats_emissions: u64,
}

struct CycleDone {
    number: u64,
    drift: Duration,
    result: FleetCycleResult,
}

type InFlight<'a> = Pin<Box<dyn Future<Output = CycleDone> + 'a>>;

async fn poll_in_flight(in_flight: &mut Option<InFlight<'_>>) -> CycleDone {
    match in_flight {
        Some(cycle) => cycle.await,
        None => std::future::pending().await,
    }
}

pub struct Scheduler {
    interval: Duration,
    stats_every: Option<Duration>,
    dispatcher: Dispatcher,
    devices: Vec<DeviceConfig>,
    stats: Arc<RwLock<StatsTracker>>,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    pub fn new(
        interval: Duration,
        stats_every: Option<Duration>,
        dispatcher: Dispatcher,
        devices: Vec<DeviceConfig>,
        stats: Arc<RwLock<StatsTracker>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            interval,
            stats_every,
            dispatcher,
            devices,
            stats,
            metrics,
        }
    }

    pub fn from_config(
        cfg: &Config,
        stats: Arc<RwLock<StatsTracker>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            ContentRenderer::new(cfg.max_text_length),
            cfg.timeout,
            cfg.fast_mode,
        );
        Self::new(
            cfg.sync_interval,
            cfg.stats_interval.resolve(cfg.sync_interval),
            dispatcher,
            cfg.devices.clone(),
            stats,
            metrics,
        )
    }

    /// Runs until `shutdown` flips to `true` (or its sender goes away). The
    /// cycle in flight at that moment is allowed to finish, then every
    /// session is closed.
    pub async fn run(&self, pool: SessionPool, shutdown: watch::Receiver<bool>) -> RunSummary {
        self.run_from(pool, shutdown, aligned_start(self.interval))
            .await
    }

    /// Same as [`Scheduler::run`], with the first boundary given explicitly.
    pub async fn run_from(
        &self,
        pool: SessionPool,
        mut shutdown: watch::Receiver<bool>,
        first_boundary: Instant,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut running = !*shutdown.borrow();
        let mut boundary = first_boundary;
        let mut next_emission = self.stats_every.map(|every| Instant::now() + every);
        let mut in_flight: Option<InFlight<'_>> = None;

        info!(
            interval = %humantime::format_duration(self.interval),
            devices = self.devices.len(),
            first_cycle_in_ms = boundary.saturating_duration_since(Instant::now()).as_millis() as u64,
            "планировщик запущен"
        );

        loop {
            // a cycle that finished exactly on the boundary must not cause a skip
            if let Some(done) = in_flight
                .as_mut()
                .and_then(|cycle| cycle.as_mut().now_or_never())
            {
                in_flight = None;
                self.finish_cycle(done).await;
            }

            if !running && in_flight.is_none() {
                break;
            }

            let now = Instant::now();
            if running && now >= boundary {
                let scheduled = boundary;
                boundary += self.interval;

                if in_flight.is_some() {
                    summary.skipped_ticks += 1;
                    self.stats.write().await.record_skipped();
                    self.metrics.inc_skipped();
                    warn!(
                        cycle = summary.cycles,
                        skipped = summary.skipped_ticks,
                        "предыдущий цикл ещё выполняется, тик пропущен"
                    );
                } else {
                    summary.cycles += 1;
                    self.metrics.inc_cycle();
                    let number = summary.cycles;
                    let drift = now.saturating_duration_since(scheduled);
                    debug!(
                        cycle = number,
                        drift_ms = drift.as_secs_f64() * 1000.0,
                        "запуск цикла"
                    );
                    in_flight = Some(Box::pin(self.cycle(&pool, number, drift)));
                }
                continue;
            }

            if running {
                if let (Some(due), Some(every)) = (next_emission, self.stats_every) {
                    if now >= due {
                        self.emit_stats().await;
                        summary.stats_emissions += 1;
                        next_emission = Some(due + every);
                    }
                }
            }

            let wake = if running {
                boundary.min(now + TICK_GRANULARITY)
            } else {
                now + TICK_GRANULARITY
            };

            tokio::select! {
                biased;

                done = poll_in_flight(&mut in_flight) => {
                    in_flight = None;
                    self.finish_cycle(done).await;
                }
                _ = shutdown.changed(), if running => {
                    running = false;
                    if in_flight.is_some() {
                        info!("получен сигнал остановки, ожидание завершения текущего цикла");
                    } else {
                        info!("получен сигнал остановки");
                    }
                }
                _ = sleep_until(wake) => {}
            }
        }

        drop(in_flight);
        pool.close().await;

        if self.stats_every.is_some() && summary.cycles > 0 {
            self.emit_stats().await;
            summary.stats_emissions += 1;
        }

        info!(
            cycles = summary.cycles,
            skipped = summary.skipped_ticks,
            "планировщик остановлен"
        );
        summary
    }

    async fn cycle<'a>(&'a self, pool: &'a SessionPool, number: u64, drift: Duration) -> CycleDone {
        let result = self.dispatcher.sync_fleet(&self.devices, pool).await;
        CycleDone {
            number,
            drift,
            result,
        }
    }

    async fn finish_cycle(&self, done: CycleDone) {
        let CycleDone {
            number,
            drift,
            result,
        } = done;

        if result.duration > self.interval {
            warn!(
                cycle = number,
                duration = %humantime::format_duration(truncate_millis(result.duration)),
                interval = %humantime::format_duration(self.interval),
                "цикл длился дольше интервала синхронизации"
            );
        }
        info!(
            cycle = number,
            success = result.total_success,
            failed = result.total_failed,
            duration_ms = result.duration.as_millis() as u64,
            drift_ms = drift.as_millis() as u64,
            "цикл завершён"
        );

        self.metrics.observe_cycle(&result, drift);
        self.stats.write().await.record(&result);
    }

    async fn emit_stats(&self) {
        let report = self.stats.read().await.report();
        self.metrics.update_from_report(&report);
        report.log();
    }
}

fn truncate_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{device, Behaviour, ScriptedClient, ScriptedConnector};
    use std::sync::atomic::Ordering;

    struct Harness {
        scheduler: Scheduler,
        pool: SessionPool,
        client: Arc<ScriptedClient>,
        stats: Arc<RwLock<StatsTracker>>,
    }

    fn harness(interval: Duration, stats_every: Option<Duration>, behaviour: Behaviour) -> Harness {
        let client = ScriptedClient::new();
        client.set("1", behaviour);
        let devices = vec![device("cam", &["1"])];
        let connector = ScriptedConnector::default().with("cam", client.clone());
        let pool = SessionPool::open(&devices, &connector);
        let stats = Arc::new(RwLock::new(StatsTracker::new(&devices, 100)));
        let metrics = Metrics::new().expect("инициализация метрик");
        let dispatcher = Dispatcher::new(ContentRenderer::new(44), Duration::from_secs(5), true);
        let scheduler = Scheduler::new(
            interval,
            stats_every,
            dispatcher,
            devices,
            stats.clone(),
            metrics,
        );
        Harness {
            scheduler,
            pool,
            client,
            stats,
        }
    }

    fn stop_after(delay: Duration) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(true);
        });
        rx
    }

    #[test]
    fn offsets_for_whole_second_grid() {
        let interval = Duration::from_secs(5);
        assert_eq!(
            next_boundary_offset(Duration::from_millis(10_250), interval),
            Duration::from_millis(750)
        );
        assert_eq!(
            next_boundary_offset(Duration::from_secs(42), interval),
            Duration::ZERO
        );
    }

    #[test]
    fn offsets_for_sub_second_grid() {
        let interval = Duration::from_millis(200);
        assert_eq!(
            next_boundary_offset(Duration::from_millis(1_050), interval),
            Duration::from_millis(150)
        );
        assert_eq!(
            next_boundary_offset(Duration::from_millis(1_200), interval),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn boundaries_are_exactly_one_interval_apart() {
        let h = harness(
            Duration::from_secs(1),
            None,
            Behaviour::Delay(Duration::from_millis(370)),
        );

        let summary = h
            .scheduler
            .run_from(h.pool, stop_after(Duration::from_millis(5_500)), Instant::now())
            .await;

        let pushes = h.client.pushes.lock().clone();
        assert_eq!(summary.cycles, 6);
        assert_eq!(pushes.len(), 6);
        for pair in pushes.windows(2) {
            assert_eq!(pair[1].at - pair[0].at, Duration::from_secs(1));
        }
        assert_eq!(summary.skipped_ticks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn aligned_run_keeps_whole_interval_spacing() {
        let h = harness(
            Duration::from_secs(1),
            None,
            Behaviour::Delay(Duration::from_millis(370)),
        );

        let summary = h
            .scheduler
            .run(h.pool, stop_after(Duration::from_millis(5_500)))
            .await;

        let pushes = h.client.pushes.lock().clone();
        assert!((5..=6).contains(&summary.cycles), "cycles = {}", summary.cycles);
        for pair in pushes.windows(2) {
            assert_eq!(pair[1].at - pair[0].at, Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_lasting_exactly_one_interval_is_not_skipped() {
        let h = harness(
            Duration::from_secs(1),
            None,
            Behaviour::Delay(Duration::from_secs(1)),
        );

        let summary = h
            .scheduler
            .run_from(h.pool, stop_after(Duration::from_millis(10_500)), Instant::now())
            .await;

        assert_eq!(summary.skipped_ticks, 0);
        assert_eq!(summary.cycles, 11);
        let pushes = h.client.pushes.lock().clone();
        for pair in pushes.windows(2) {
            assert_eq!(pair[1].at - pair[0].at, Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_cycle_skips_the_next_tick_once() {
        let h = harness(
            Duration::from_secs(1),
            None,
            Behaviour::Delay(Duration::from_millis(1_500)),
        );

        let summary = h
            .scheduler
            .run_from(h.pool, stop_after(Duration::from_millis(2_500)), Instant::now())
            .await;

        let pushes = h.client.pushes.lock().clone();
        assert_eq!(summary.cycles, 2);
        assert_eq!(summary.skipped_ticks, 1);
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[1].at - pushes[0].at, Duration::from_secs(2));
        let report = h.stats.read().await.report();
        // the second cycle was still running at shutdown and was recorded anyway
        assert_eq!(report.cycles, 2);
        assert_eq!(report.skipped_ticks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_cycle_finishes_and_closes_once() {
        let h = harness(
            Duration::from_secs(10),
            Some(Duration::from_secs(60)),
            Behaviour::Delay(Duration::from_secs(3)),
        );

        let summary = h
            .scheduler
            .run_from(h.pool, stop_after(Duration::from_millis(1_500)), Instant::now())
            .await;

        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.stats_emissions, 1);
        assert_eq!(h.client.closes.load(Ordering::SeqCst), 1);
        let report = h.stats.read().await.report();
        assert_eq!(report.cycles, 1);
        assert_eq!(report.recent_success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_final_emission_without_cycles() {
        let h = harness(Duration::from_secs(1), Some(Duration::from_secs(1)), Behaviour::Succeed);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let summary = h.scheduler.run(h.pool, rx).await;

        assert_eq!(summary, RunSummary::default());
        assert_eq!(h.client.push_count(), 0);
        assert_eq!(h.client.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_emission_follows_its_own_cadence() {
        let h = harness(
            Duration::from_millis(500),
            Some(Duration::from_secs(2)),
            Behaviour::Succeed,
        );

        let summary = h
            .scheduler
            .run_from(h.pool, stop_after(Duration::from_millis(4_100)), Instant::now())
            .await;

        // two periodic emissions at 2s and 4s, plus the final one
        assert_eq!(summary.stats_emissions, 3);
        assert_eq!(summary.cycles, 9);
    }
}
