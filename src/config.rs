use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "de_duration")]
    pub sync_interval: Duration,
    #[serde(default = "default_timeout", deserialize_with = "de_duration")]
    pub timeout: Duration,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_fast_mode")]
    pub fast_mode: bool,
    #[serde(default, deserialize_with = "de_stats_cadence")]
    pub stats_interval: StatsCadence,
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
    #[serde(alias = "cameras")]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u32,
    pub username: String,
    pub password: String,
    #[serde(default = "default_channel")]
    pub channel: u32,
    pub overlays: Vec<OverlayConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    pub id: String,
    pub content: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub position_x: Option<i64>,
    #[serde(default)]
    pub position_y: Option<i64>,
}

/// How often runtime statistics are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatsCadence {
    #[default]
    Disabled,
    /// The lesser of [`AUTO_STATS_CEILING`] and the sync interval.
    Auto,
    Every(Duration),
}

pub const AUTO_STATS_CEILING: Duration = Duration::from_secs(60);

impl StatsCadence {
    pub fn resolve(self, sync_interval: Duration) -> Option<Duration> {
        match self {
            StatsCadence::Disabled => None,
            StatsCadence::Auto => Some(AUTO_STATS_CEILING.min(sync_interval)),
            StatsCadence::Every(period) => Some(period),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать конфигурацию {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {}", .0.join("; "))]
    Validation(Vec<String>),
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "warning", "error", "critical"];

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg = Self::from_yaml_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.sync_interval.is_zero() {
            errors.push("sync_interval должен быть > 0".to_string());
        }
        if self.timeout.is_zero() {
            errors.push("timeout должен быть > 0".to_string());
        }
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            errors.push(format!(
                "log_level должен быть одним из {:?}, получено '{}'",
                LOG_LEVELS, self.log_level
            ));
        }
        if let StatsCadence::Every(period) = self.stats_interval {
            if period.is_zero() {
                errors.push("stats_interval должен быть > 0".to_string());
            }
        }
        if let Some(listen) = &self.listen {
            if SocketAddr::from_str(listen).is_err() {
                errors.push(format!(
                    "поле listen должно быть корректным адресом host:port, получено '{listen}'"
                ));
            }
        }
        if self.max_text_length == 0 {
            errors.push("max_text_length должен быть > 0".to_string());
        }
        if self.stats_window == 0 {
            errors.push("stats_window должен быть >= 1".to_string());
        }

        validate_devices(&self.devices, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Non-fatal problems worth logging once tracing is up.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.timeout > self.sync_interval {
            out.push(format!(
                "timeout ({:?}) больше sync_interval ({:?}): циклы будут наслаиваться и пропускаться",
                self.timeout, self.sync_interval
            ));
        }
        out
    }

    pub fn total_overlays(&self) -> usize {
        self.devices.iter().map(|d| d.overlays.len()).sum()
    }

    /// `log_level` as an `EnvFilter` directive.
    pub fn log_directive(&self) -> &'static str {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" | "warning" => "warn",
            "error" | "critical" => "error",
            _ => "info",
        }
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl DeviceConfig {
    /// `ip` may already carry a port, in which case `port` is ignored.
    pub fn authority(&self) -> String {
        if self.ip.contains(':') {
            self.ip.clone()
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

fn validate_devices(devices: &[DeviceConfig], errors: &mut Vec<String>) {
    if devices.is_empty() {
        errors.push("список devices не должен быть пустым".to_string());
    }

    let mut names = HashSet::new();
    for device in devices {
        if device.name.trim().is_empty() {
            errors.push("devices[*].name не должен быть пустым".to_string());
        } else if !names.insert(device.name.as_str()) {
            errors.push(format!(
                "имя устройства '{}' должно быть уникальным",
                device.name
            ));
        }
        if device.ip.trim().is_empty() {
            errors.push(format!("устройство '{}': ip не должен быть пустым", device.name));
        }
        if device.username.is_empty() {
            errors.push(format!(
                "устройство '{}': username не должен быть пустым",
                device.name
            ));
        }
        if device.password.is_empty() {
            errors.push(format!(
                "устройство '{}': password не должен быть пустым",
                device.name
            ));
        }
        if !(1..=65535).contains(&device.port) {
            errors.push(format!(
                "устройство '{}': port должен быть в диапазоне 1..65535, получено {}",
                device.name, device.port
            ));
        }
        if device.channel < 1 {
            errors.push(format!(
                "устройство '{}': channel должен быть >= 1",
                device.name
            ));
        }
        validate_overlays(device, errors);
    }
}

fn validate_overlays(device: &DeviceConfig, errors: &mut Vec<String>) {
    if device.overlays.is_empty() {
        errors.push(format!(
            "устройство '{}': список overlays не должен быть пустым",
            device.name
        ));
    }

    let mut ids = HashSet::new();
    for overlay in &device.overlays {
        if overlay.id.trim().is_empty() {
            errors.push(format!(
                "устройство '{}': id оверлея не должен быть пустым",
                device.name
            ));
        } else if !ids.insert(overlay.id.as_str()) {
            errors.push(format!(
                "устройство '{}': id оверлея '{}' должен быть уникальным",
                device.name, overlay.id
            ));
        }
        if overlay.content.is_empty() {
            errors.push(format!(
                "устройство '{}', оверлей '{}': content не должен быть пустым",
                device.name, overlay.id
            ));
        }
        for (field, value) in [("position_x", overlay.position_x), ("position_y", overlay.position_y)] {
            if let Some(v) = value {
                if v < 0 {
                    errors.push(format!(
                        "устройство '{}', оверлей '{}': {field} должен быть >= 0, получено {v}",
                        device.name, overlay.id
                    ));
                }
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Seconds(f64),
    Text(String),
}

impl DurationValue {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            DurationValue::Seconds(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|err| format!("некорректная длительность {secs}: {err}")),
            DurationValue::Text(text) => humantime::parse_duration(text.trim())
                .map_err(|err| format!("некорректная длительность '{text}': {err}")),
        }
    }
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    DurationValue::deserialize(deserializer)?
        .into_duration()
        .map_err(D::Error::custom)
}

fn de_stats_cadence<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StatsCadence, D::Error> {
    match Option::<DurationValue>::deserialize(deserializer)? {
        None => Ok(StatsCadence::Disabled),
        Some(DurationValue::Text(text)) if text.trim().eq_ignore_ascii_case("auto") => {
            Ok(StatsCadence::Auto)
        }
        Some(DurationValue::Text(text))
            if matches!(text.trim().to_ascii_lowercase().as_str(), "off" | "disabled") =>
        {
            Ok(StatsCadence::Disabled)
        }
        Some(value) => {
            let period = value.into_duration().map_err(D::Error::custom)?;
            if period.is_zero() {
                Ok(StatsCadence::Auto)
            } else {
                Ok(StatsCadence::Every(period))
            }
        }
    }
}

const fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_fast_mode() -> bool {
    true
}

const fn default_max_text_length() -> usize {
    44
}

const fn default_stats_window() -> usize {
    10_000
}

const fn default_port() -> u32 {
    80
}

const fn default_channel() -> u32 {
    1
}

const fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
sync_interval: 1
timeout: 2
stats_interval: 0
devices:
  - name: gate
    ip: 10.0.0.5
    username: admin
    password: secret
    overlays:
      - id: "1"
        content: "{timestamp}"
      - id: "2"
        content: "Gate"
        position_x: 16
        position_y: 32
"#;

    fn valid_config() -> Config {
        Config::from_yaml_str(VALID).expect("валидный YAML")
    }

    fn validation_errors(cfg: &Config) -> Vec<String> {
        match cfg.validate() {
            Err(ConfigError::Validation(errors)) => errors,
            other => panic!("ожидалась ошибка валидации, получено {other:?}"),
        }
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = valid_config();
        cfg.validate().expect("конфигурация должна быть валидной");
        assert_eq!(cfg.sync_interval, Duration::from_secs(1));
        assert_eq!(cfg.timeout, Duration::from_secs(2));
        assert!(cfg.fast_mode);
        assert_eq!(cfg.max_text_length, 44);
        assert_eq!(cfg.stats_window, 10_000);
        assert_eq!(cfg.stats_interval, StatsCadence::Auto);
        let device = &cfg.devices[0];
        assert_eq!(device.port, 80);
        assert_eq!(device.channel, 1);
        assert_eq!(device.authority(), "10.0.0.5:80");
        assert!(device.overlays[0].enabled);
        assert_eq!(device.overlays[1].position_x, Some(16));
        assert_eq!(cfg.total_overlays(), 2);
    }

    #[test]
    fn legacy_json_layout_loads() {
        let json = r#"{
            "sync_interval": 0.5,
            "cameras": [{
                "name": "lobby", "ip": "192.168.1.64:8080",
                "username": "u", "password": "p",
                "overlays": [{"id": "1", "content": "Lobby", "enabled": false}]
            }]
        }"#;
        let cfg = Config::from_yaml_str(json).expect("JSON является валидным YAML");
        cfg.validate().expect("конфигурация должна быть валидной");
        assert_eq!(cfg.sync_interval, Duration::from_millis(500));
        assert_eq!(cfg.stats_interval, StatsCadence::Disabled);
        assert_eq!(cfg.devices[0].authority(), "192.168.1.64:8080");
        assert!(!cfg.devices[0].overlays[0].enabled);
    }

    #[test]
    fn humantime_durations_are_accepted() {
        let text = VALID
            .replace("sync_interval: 1", "sync_interval: \"250ms\"")
            .replace("stats_interval: 0", "stats_interval: \"5m\"");
        let cfg = Config::from_yaml_str(&text).expect("валидный YAML");
        assert_eq!(cfg.sync_interval, Duration::from_millis(250));
        assert_eq!(
            cfg.stats_interval,
            StatsCadence::Every(Duration::from_secs(300))
        );
    }

    #[test]
    fn negative_duration_is_a_parse_error() {
        let text = VALID.replace("timeout: 2", "timeout: -1");
        assert!(Config::from_yaml_str(&text).is_err());
    }

    #[test]
    fn stats_cadence_resolution() {
        let interval = Duration::from_secs(5);
        assert_eq!(StatsCadence::Disabled.resolve(interval), None);
        assert_eq!(StatsCadence::Auto.resolve(interval), Some(interval));
        assert_eq!(
            StatsCadence::Auto.resolve(Duration::from_secs(300)),
            Some(AUTO_STATS_CEILING)
        );
        assert_eq!(
            StatsCadence::Every(Duration::from_secs(7)).resolve(interval),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut cfg = valid_config();
        cfg.sync_interval = Duration::ZERO;
        cfg.devices[0].port = 70_000;
        cfg.devices[0].overlays[1].id = "1".to_string();
        cfg.devices[0].overlays[1].content = String::new();
        cfg.devices[0].overlays[1].position_y = Some(-3);
        let mut twin = cfg.devices[0].clone();
        twin.overlays.clear();
        cfg.devices.push(twin);

        let errors = validation_errors(&cfg);
        assert!(errors.iter().any(|e| e.contains("sync_interval")));
        assert!(errors.iter().any(|e| e.contains("port")));
        assert!(errors.iter().any(|e| e.contains("'1' должен быть уникальным")));
        assert!(errors.iter().any(|e| e.contains("content")));
        assert!(errors.iter().any(|e| e.contains("position_y")));
        assert!(errors.iter().any(|e| e.contains("'gate' должно быть уникальным")));
        assert!(errors.iter().any(|e| e.contains("overlays не должен быть пустым")));
    }

    #[test]
    fn empty_fleet_is_rejected() {
        let mut cfg = valid_config();
        cfg.devices.clear();
        let errors = validation_errors(&cfg);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn timeout_above_interval_is_only_a_warning() {
        let mut cfg = valid_config();
        cfg.timeout = Duration::from_secs(30);
        cfg.validate().expect("это не ошибка валидации");
        assert_eq!(cfg.warnings().len(), 1);
    }

    #[test]
    fn log_level_aliases() {
        let mut cfg = valid_config();
        cfg.log_level = "WARNING".to_string();
        cfg.validate().expect("WARNING допустим");
        assert_eq!(cfg.log_directive(), "warn");
        cfg.log_level = "verbose".to_string();
        assert!(validation_errors(&cfg)[0].contains("log_level"));
    }

    #[test]
    fn example_config_is_valid() {
        let cfg = Config::from_yaml_str(Config::example_yaml()).expect("пример разбирается");
        cfg.validate().expect("пример валиден");
    }
}
