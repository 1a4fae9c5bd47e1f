mod config;
mod device;
mod dispatch;
mod http;
mod metrics;
mod render;
mod scheduler;
mod session;
mod stats;

use axum::serve;
use clap::Parser;
use config::{Config, ConfigError};
use device::isapi::{IsapiClient, IsapiConnector};
use dispatch::Dispatcher;
use metrics::Metrics;
use render::ContentRenderer;
use scheduler::Scheduler;
use session::{probe_fleet, SessionPool};
use stats::StatsTracker;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: u8 = 1;
const EXIT_UNREACHABLE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "overlaysyncd")]
#[command(version, about = "Синхронизация текстовых оверлеев на IP-камерах")]
struct Cli {
    /// Путь к файлу конфигурации (YAML или JSON)
    #[arg(default_value = "./config.yaml")]
    config: String,
    /// Только проверить конфигурацию и выйти
    #[arg(short = 'c', long, conflicts_with = "once")]
    validate: bool,
    /// Выполнить один цикл синхронизации и выйти
    #[arg(short = '1', long)]
    once: bool,
    /// Показать id текстовых оверлеев на каждой камере и выйти
    #[arg(short = 'l', long, conflicts_with_all = ["validate", "once"])]
    list: bool,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return ExitCode::SUCCESS;
    }

    if cli.validate {
        return validate_only(&cli.config);
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            init_tracing("info");
            error!(error = %err, "не удалось загрузить конфигурацию");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    init_tracing(cfg.log_directive());
    for warning in cfg.warnings() {
        warn!("{warning}");
    }

    if cli.list {
        return list_overlays(&cfg).await;
    }

    info!(
        config = %cli.config,
        devices = cfg.devices.len(),
        overlays = cfg.total_overlays(),
        interval = %humantime::format_duration(cfg.sync_interval),
        fast_mode = cfg.fast_mode,
        "запуск overlaysyncd"
    );

    let pool = SessionPool::open(&cfg.devices, &IsapiConnector);
    let probe = probe_fleet(&cfg.devices, &pool, cfg.timeout).await;
    if probe.none_reachable() {
        pool.close().await;
        return ExitCode::from(EXIT_UNREACHABLE);
    }

    if cli.once {
        return run_once(&cfg, pool).await;
    }
    run_daemon(cfg, pool).await
}

fn validate_only(path: &str) -> ExitCode {
    match Config::load_from_file(path) {
        Ok(cfg) => {
            println!("Конфигурация {path} корректна");
            println!("  камер: {}", cfg.devices.len());
            println!("  оверлеев: {}", cfg.total_overlays());
            println!(
                "  интервал синхронизации: {}",
                humantime::format_duration(cfg.sync_interval)
            );
            for warning in cfg.warnings() {
                println!("  предупреждение: {warning}");
            }
            ExitCode::SUCCESS
        }
        Err(ConfigError::Validation(errors)) => {
            eprintln!("Конфигурация {path} содержит ошибки:");
            for err in errors {
                eprintln!("  - {err}");
            }
            ExitCode::from(EXIT_FAILURE)
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn list_overlays(cfg: &Config) -> ExitCode {
    let listings = cfg.devices.iter().map(|device| async move {
        let client = IsapiClient::new(device)?;
        client.list_overlays(cfg.timeout).await
    });
    let listings = futures::future::join_all(listings).await;

    let mut failed = 0;
    for (device, listing) in cfg.devices.iter().zip(listings) {
        match listing {
            Ok(ids) => {
                println!(
                    "{} ({}): {}",
                    device.name,
                    device.authority(),
                    ids.join(", ")
                );
                for overlay in &device.overlays {
                    if !ids.contains(&overlay.id) {
                        println!(
                            "  оверлей {} из конфигурации отсутствует на камере",
                            overlay.id
                        );
                    }
                }
            }
            Err(err) => {
                failed += 1;
                error!(
                    device = %device.name,
                    kind = err.kind().as_str(),
                    error = %err,
                    "не удалось получить список оверлеев"
                );
            }
        }
    }

    if failed == 0 {
        ExitCode::SUCCESS
    } else if failed == cfg.devices.len() {
        ExitCode::from(EXIT_UNREACHABLE)
    } else {
        ExitCode::from(EXIT_FAILURE)
    }
}

async fn run_once(cfg: &Config, pool: SessionPool) -> ExitCode {
    let dispatcher = Dispatcher::new(
        ContentRenderer::new(cfg.max_text_length),
        cfg.timeout,
        cfg.fast_mode,
    );
    let result = dispatcher.sync_fleet(&cfg.devices, &pool).await;
    pool.close().await;

    info!(
        success = result.total_success,
        failed = result.total_failed,
        duration_ms = result.duration.as_millis() as u64,
        "однократная синхронизация завершена"
    );
    if result.total_failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILURE)
    }
}

async fn run_daemon(cfg: Config, pool: SessionPool) -> ExitCode {
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            pool.close().await;
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let stats = Arc::new(RwLock::new(StatsTracker::new(
        &cfg.devices,
        cfg.stats_window,
    )));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = cfg.listen.clone().map(|listen| {
        let metrics = metrics.clone();
        let stats = stats.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, stats);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };
            info!(listen = %addr, "HTTP-сервер статуса запущен");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    });

    let signal_task = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let scheduler = Scheduler::from_config(&cfg, stats, metrics);
    let summary = scheduler.run(pool, shutdown_rx).await;

    signal_task.abort();
    if let Some(task) = http_task {
        let _ = task.await;
    }

    info!(
        cycles = summary.cycles,
        skipped = summary.skipped_ticks,
        "overlaysyncd остановлен"
    );
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "не удалось подписаться на SIGTERM");
            wait_for_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = wait_for_ctrl_c() => {}
        _ = terminate.recv() => info!("получен SIGTERM, выполняется остановка"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{default_level},hyper=warn,reqwest=warn"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
