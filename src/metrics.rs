use crate::dispatch::FleetCycleResult;
use crate::stats::StatsReport;
use prometheus::core::Collector;
use prometheus::{
    opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub overlay_sync_cycles_total: Counter,
    pub overlay_sync_skipped_ticks_total: Counter,
    pub overlay_sync_push_success_total: CounterVec,
    pub overlay_sync_push_failures_total: CounterVec,
    pub overlay_sync_last_cycle_duration_seconds: Gauge,
    pub overlay_sync_last_cycle_drift_seconds: Gauge,
    pub overlay_sync_last_cycle_success: Gauge,
    pub overlay_sync_last_cycle_failed: Gauge,
    pub overlay_sync_recent_success_ratio: Gauge,
    pub overlay_sync_device_success_ratio: GaugeVec,
    pub overlay_sync_device_overlays: GaugeVec,
    pub overlay_sync_uptime_seconds: Gauge,
    pub overlay_sync_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let overlay_sync_cycles_total = Counter::with_opts(opts!(
            "overlay_sync_cycles_total",
            "Sync cycles launched"
        ))?;
        let overlay_sync_skipped_ticks_total = Counter::with_opts(opts!(
            "overlay_sync_skipped_ticks_total",
            "Scheduled ticks skipped because the previous cycle was still running"
        ))?;
        let overlay_sync_push_success_total = CounterVec::new(
            opts!(
                "overlay_sync_push_success_total",
                "Successful overlay pushes by device"
            ),
            &["device"],
        )?;
        let overlay_sync_push_failures_total = CounterVec::new(
            opts!(
                "overlay_sync_push_failures_total",
                "Failed overlay pushes by device and failure kind"
            ),
            &["device", "kind"],
        )?;
        let overlay_sync_last_cycle_duration_seconds = Gauge::with_opts(opts!(
            "overlay_sync_last_cycle_duration_seconds",
            "Wall time of the last completed cycle"
        ))?;
        let overlay_sync_last_cycle_drift_seconds = Gauge::with_opts(opts!(
            "overlay_sync_last_cycle_drift_seconds",
            "Delay between the scheduled boundary and the actual start of the last cycle"
        ))?;
        let overlay_sync_last_cycle_success = Gauge::with_opts(opts!(
            "overlay_sync_last_cycle_success",
            "Successful pushes in the last completed cycle"
        ))?;
        let overlay_sync_last_cycle_failed = Gauge::with_opts(opts!(
            "overlay_sync_last_cycle_failed",
            "Failed pushes in the last completed cycle"
        ))?;
        let overlay_sync_recent_success_ratio = Gauge::with_opts(opts!(
            "overlay_sync_recent_success_ratio",
            "Success ratio over the rolling window (0..1)"
        ))?;
        let overlay_sync_device_success_ratio = GaugeVec::new(
            opts!(
                "overlay_sync_device_success_ratio",
                "Success ratio over the rolling window by device (0..1)"
            ),
            &["device"],
        )?;
        let overlay_sync_device_overlays = GaugeVec::new(
            opts!(
                "overlay_sync_device_overlays",
                "Configured overlays by device"
            ),
            &["device"],
        )?;
        let overlay_sync_uptime_seconds = Gauge::with_opts(opts!(
            "overlay_sync_uptime_seconds",
            "Daemon uptime in seconds"
        ))?;
        let overlay_sync_scrape_count_total = Counter::with_opts(opts!(
            "overlay_sync_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &overlay_sync_cycles_total)?;
        register(&registry, &overlay_sync_skipped_ticks_total)?;
        register(&registry, &overlay_sync_push_success_total)?;
        register(&registry, &overlay_sync_push_failures_total)?;
        register(&registry, &overlay_sync_last_cycle_duration_seconds)?;
        register(&registry, &overlay_sync_last_cycle_drift_seconds)?;
        register(&registry, &overlay_sync_last_cycle_success)?;
        register(&registry, &overlay_sync_last_cycle_failed)?;
        register(&registry, &overlay_sync_recent_success_ratio)?;
        register(&registry, &overlay_sync_device_success_ratio)?;
        register(&registry, &overlay_sync_device_overlays)?;
        register(&registry, &overlay_sync_uptime_seconds)?;
        register(&registry, &overlay_sync_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            overlay_sync_cycles_total,
            overlay_sync_skipped_ticks_total,
            overlay_sync_push_success_total,
            overlay_sync_push_failures_total,
            overlay_sync_last_cycle_duration_seconds,
            overlay_sync_last_cycle_drift_seconds,
            overlay_sync_last_cycle_success,
            overlay_sync_last_cycle_failed,
            overlay_sync_recent_success_ratio,
            overlay_sync_device_success_ratio,
            overlay_sync_device_overlays,
            overlay_sync_uptime_seconds,
            overlay_sync_scrape_count_total,
        }))
    }

    pub fn inc_cycle(&self) {
        self.overlay_sync_cycles_total.inc();
    }

    pub fn inc_skipped(&self) {
        self.overlay_sync_skipped_ticks_total.inc();
    }

    pub fn observe_cycle(&self, result: &FleetCycleResult, drift: Duration) {
        self.overlay_sync_last_cycle_duration_seconds
            .set(result.duration.as_secs_f64());
        self.overlay_sync_last_cycle_drift_seconds
            .set(drift.as_secs_f64());
        self.overlay_sync_last_cycle_success
            .set(f64::from(result.total_success));
        self.overlay_sync_last_cycle_failed
            .set(f64::from(result.total_failed));

        for (name, device) in &result.devices {
            self.overlay_sync_push_success_total
                .with_label_values(&[name])
                .inc_by(f64::from(device.success));
        }
        for (name, kind) in result.failure_kinds() {
            self.overlay_sync_push_failures_total
                .with_label_values(&[name, kind.as_str()])
                .inc();
        }
    }

    pub fn update_from_report(&self, report: &StatsReport) {
        self.overlay_sync_recent_success_ratio
            .set(report.success_rate);
        self.overlay_sync_uptime_seconds
            .set(report.uptime_secs as f64);

        self.overlay_sync_device_success_ratio.reset();
        self.overlay_sync_device_overlays.reset();
        for device in &report.devices {
            self.overlay_sync_device_success_ratio
                .with_label_values(&[&device.name])
                .set(device.success_rate);
            self.overlay_sync_device_overlays
                .with_label_values(&[&device.name])
                .set(device.overlays as f64);
        }
    }

    pub fn inc_scrape_count(&self) {
        self.overlay_sync_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
