use crate::config::DeviceConfig;
use crate::dispatch::FleetCycleResult;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Fixed-capacity FIFO. Pushing into a full window evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: T) -> Option<T> {
        let evicted = if self.buf.len() == self.capacity {
            self.buf.pop_front()
        } else {
            None
        };
        self.buf.push_back(sample);
        evicted
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.buf.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub success: u32,
    pub failed: u32,
    pub duration: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
struct WindowTotals {
    success: u64,
    failed: u64,
    duration: Duration,
    samples: usize,
}

impl WindowTotals {
    fn of(window: &RollingWindow<Sample>) -> Self {
        window.iter().fold(Self::default(), |mut acc, s| {
            acc.success += u64::from(s.success);
            acc.failed += u64::from(s.failed);
            acc.duration += s.duration;
            acc.samples += 1;
            acc
        })
    }

    fn success_rate(&self) -> f64 {
        let total = self.success + self.failed;
        if total == 0 {
            0.0
        } else {
            self.success as f64 / total as f64
        }
    }

    fn avg_duration(&self) -> Duration {
        if self.samples == 0 {
            Duration::ZERO
        } else {
            self.duration / self.samples as u32
        }
    }
}

#[derive(Debug, Clone)]
struct DeviceStats {
    overlays: usize,
    window: RollingWindow<Sample>,
    lifetime_success: u64,
    lifetime_failed: u64,
}

impl DeviceStats {
    fn new(overlays: usize, capacity: usize) -> Self {
        Self {
            overlays,
            window: RollingWindow::new(capacity),
            lifetime_success: 0,
            lifetime_failed: 0,
        }
    }
}

/// Recent and lifetime sync statistics. Memory stays bounded by the window
/// capacity no matter how long the daemon runs.
#[derive(Debug)]
pub struct StatsTracker {
    started: Instant,
    capacity: usize,
    window: RollingWindow<Sample>,
    devices: BTreeMap<String, DeviceStats>,
    cycles: u64,
    skipped_ticks: u64,
    lifetime_success: u64,
    lifetime_failed: u64,
    min_duration: Option<Duration>,
    max_duration: Option<Duration>,
}

impl StatsTracker {
    pub fn new(devices: &[DeviceConfig], capacity: usize) -> Self {
        Self {
            started: Instant::now(),
            capacity,
            window: RollingWindow::new(capacity),
            devices: devices
                .iter()
                .map(|d| (d.name.clone(), DeviceStats::new(d.overlays.len(), capacity)))
                .collect(),
            cycles: 0,
            skipped_ticks: 0,
            lifetime_success: 0,
            lifetime_failed: 0,
            min_duration: None,
            max_duration: None,
        }
    }

    pub fn record(&mut self, result: &FleetCycleResult) {
        self.cycles += 1;
        self.window.push(Sample {
            success: result.total_success,
            failed: result.total_failed,
            duration: result.duration,
        });
        self.lifetime_success += u64::from(result.total_success);
        self.lifetime_failed += u64::from(result.total_failed);
        self.min_duration = Some(
            self.min_duration
                .map_or(result.duration, |d| d.min(result.duration)),
        );
        self.max_duration = Some(
            self.max_duration
                .map_or(result.duration, |d| d.max(result.duration)),
        );

        let capacity = self.capacity;
        for (name, device) in &result.devices {
            let stats = self.devices.entry(name.clone()).or_insert_with(|| {
                DeviceStats::new((device.success + device.failed) as usize, capacity)
            });
            stats.window.push(Sample {
                success: device.success,
                failed: device.failed,
                duration: device.duration,
            });
            stats.lifetime_success += u64::from(device.success);
            stats.lifetime_failed += u64::from(device.failed);
        }
    }

    pub fn record_skipped(&mut self) {
        self.skipped_ticks += 1;
    }

    pub fn report(&self) -> StatsReport {
        let recent = WindowTotals::of(&self.window);
        let uptime = Duration::from_secs(self.started.elapsed().as_secs());

        let devices = self
            .devices
            .iter()
            .map(|(name, stats)| {
                let totals = WindowTotals::of(&stats.window);
                DeviceReport {
                    name: name.clone(),
                    overlays: stats.overlays,
                    recent_success: totals.success,
                    recent_failed: totals.failed,
                    success_rate: totals.success_rate(),
                    avg_duration_ms: millis(totals.avg_duration()),
                    lifetime_success: stats.lifetime_success,
                    lifetime_failed: stats.lifetime_failed,
                }
            })
            .collect();

        StatsReport {
            uptime_secs: uptime.as_secs(),
            uptime: humantime::format_duration(uptime).to_string(),
            cycles: self.cycles,
            skipped_ticks: self.skipped_ticks,
            window_len: self.window.len(),
            window_capacity: self.window.capacity(),
            recent_success: recent.success,
            recent_failed: recent.failed,
            success_rate: recent.success_rate(),
            avg_duration_ms: millis(recent.avg_duration()),
            min_duration_ms: self.min_duration.map(millis),
            max_duration_ms: self.max_duration.map(millis),
            lifetime_success: self.lifetime_success,
            lifetime_failed: self.lifetime_failed,
            devices,
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub name: String,
    pub overlays: usize,
    pub recent_success: u64,
    pub recent_failed: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub lifetime_success: u64,
    pub lifetime_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub uptime_secs: u64,
    pub uptime: String,
    pub cycles: u64,
    pub skipped_ticks: u64,
    pub window_len: usize,
    pub window_capacity: usize,
    pub recent_success: u64,
    pub recent_failed: u64,
    /// 0.0..=1.0 over the rolling window; 0 when the window is empty.
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub lifetime_success: u64,
    pub lifetime_failed: u64,
    pub devices: Vec<DeviceReport>,
}

impl StatsReport {
    pub fn log(&self) {
        info!(
            uptime = %self.uptime,
            cycles = self.cycles,
            skipped = self.skipped_ticks,
            window = self.window_len,
            success = self.recent_success,
            failed = self.recent_failed,
            success_rate = format_args!("{:.1}%", self.success_rate * 100.0),
            avg_ms = format_args!("{:.0}", self.avg_duration_ms),
            min_ms = format_args!("{:.0}", self.min_duration_ms.unwrap_or_default()),
            max_ms = format_args!("{:.0}", self.max_duration_ms.unwrap_or_default()),
            lifetime_success = self.lifetime_success,
            lifetime_failed = self.lifetime_failed,
            "статистика синхронизации"
        );
        for device in &self.devices {
            info!(
                device = %device.name,
                overlays = device.overlays,
                success = device.recent_success,
                failed = device.recent_failed,
                success_rate = format_args!("{:.1}%", device.success_rate * 100.0),
                avg_ms = format_args!("{:.0}", device.avg_duration_ms),
                "статистика камеры"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::device;
    use crate::dispatch::DeviceCycleResult;

    fn cycle(entries: &[(&str, u32, u32)], duration_ms: u64) -> FleetCycleResult {
        let mut result = FleetCycleResult {
            duration: Duration::from_millis(duration_ms),
            ..FleetCycleResult::default()
        };
        for (name, success, failed) in entries {
            result.total_success += success;
            result.total_failed += failed;
            result.devices.insert(
                name.to_string(),
                DeviceCycleResult {
                    success: *success,
                    failed: *failed,
                    duration: Duration::from_millis(duration_ms),
                    outcomes: Vec::new(),
                },
            );
        }
        result
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let mut window = RollingWindow::new(3);
        for i in 0..10 {
            window.push(i);
            assert!(window.len() <= 3);
        }
        assert_eq!(window.iter().copied().collect::<Vec<_>>(), vec![7, 8, 9]);
    }

    #[test]
    fn push_reports_evicted_sample() {
        let mut window = RollingWindow::new(2);
        assert_eq!(window.push("a"), None);
        assert_eq!(window.push("b"), None);
        assert_eq!(window.push("c"), Some("a"));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut window = RollingWindow::new(0);
        window.push(1);
        window.push(2);
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.len(), 1);
    }

    #[tokio::test]
    async fn first_cycle_evicted_after_capacity_plus_one() {
        let devices = vec![device("a", &["1"])];
        let mut stats = StatsTracker::new(&devices, 5);
        for i in 1..=5u64 {
            stats.record(&cycle(&[("a", 1, 0)], i));
        }
        assert_eq!(stats.window.len(), 5);
        assert_eq!(
            stats.window.iter().next().map(|s| s.duration),
            Some(Duration::from_millis(1))
        );

        stats.record(&cycle(&[("a", 1, 0)], 6));
        assert_eq!(stats.window.len(), 5);
        assert!(stats
            .window
            .iter()
            .all(|s| s.duration != Duration::from_millis(1)));
        assert_eq!(stats.report().cycles, 6);
    }

    #[tokio::test]
    async fn empty_window_reports_zero_rate() {
        let stats = StatsTracker::new(&[device("a", &["1"])], 10);
        let report = stats.report();
        assert_eq!(report.success_rate, 0.0);
        assert_eq!(report.window_len, 0);
        assert_eq!(report.min_duration_ms, None);
        assert_eq!(report.devices[0].success_rate, 0.0);
    }

    #[tokio::test]
    async fn rates_and_lifetime_counters() {
        let devices = vec![device("b", &["1"]), device("a", &["1", "2"])];
        let mut stats = StatsTracker::new(&devices, 2);
        stats.record(&cycle(&[("a", 2, 0), ("b", 0, 1)], 100));
        stats.record(&cycle(&[("a", 1, 1), ("b", 1, 0)], 300));
        stats.record(&cycle(&[("a", 2, 0), ("b", 1, 0)], 200));
        stats.record_skipped();

        let report = stats.report();
        assert_eq!(report.cycles, 3);
        assert_eq!(report.skipped_ticks, 1);
        assert_eq!((report.recent_success, report.recent_failed), (5, 1));
        assert!((report.success_rate - 5.0 / 6.0).abs() < 1e-9);
        assert!((report.avg_duration_ms - 250.0).abs() < 1e-9);
        assert_eq!(report.min_duration_ms, Some(100.0));
        assert_eq!(report.max_duration_ms, Some(300.0));
        assert_eq!((report.lifetime_success, report.lifetime_failed), (7, 2));

        let names: Vec<_> = report.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(report.devices[0].overlays, 2);
        assert!((report.devices[0].success_rate - 0.75).abs() < 1e-9);
        assert_eq!(report.devices[1].lifetime_failed, 1);
    }

    #[tokio::test]
    async fn report_serializes_to_json() {
        let mut stats = StatsTracker::new(&[device("a", &["1"])], 4);
        stats.record(&cycle(&[("a", 1, 0)], 10));
        let json = serde_json::to_value(stats.report()).unwrap();
        assert_eq!(json["cycles"], 1);
        assert_eq!(json["devices"][0]["name"], "a");
    }
}
