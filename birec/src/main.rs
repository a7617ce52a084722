use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use birec::api::{AppState, build_router};
use birec::notification::Notifier;
use birec::setting::SettingsManager;
use birec::space::SpaceMonitor;
use birec::task::TaskManager;
use birec::webhook::WebhookEmitter;

#[derive(Debug, Parser)]
#[command(name = "birec", version, about = "Bilibili live stream recorder")]
struct Args {
    /// Path to the settings file.
    #[arg(long, default_value = "settings.toml")]
    config: PathBuf,

    /// Override the output directory.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Bind host for the admin API.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port for the admin API.
    #[arg(long, default_value_t = 2233)]
    port: u16,

    /// TLS key file (handed to a fronting proxy; accepted for parity).
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// TLS certificate file.
    #[arg(long)]
    cert_file: Option<PathBuf>,

    /// Require this key in the x-api-key header.
    #[arg(long, env = "BIREC_API_KEY")]
    api_key: Option<String>,

    /// Open the admin page in the default browser after startup.
    #[arg(long)]
    open: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(interrupted) => {
            if interrupted {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn init_logging(settings: &birec::setting::LoggingSettings) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&settings.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&settings.log_dir, "birec.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.console_log_level.clone()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

/// Returns true when shut down by an interrupt signal.
async fn run(args: Args) -> anyhow::Result<bool> {
    let settings_manager =
        Arc::new(SettingsManager::load(&args.config).context("loading settings")?);

    if let Some(out_dir) = &args.out_dir {
        settings_manager
            .apply_patch(&serde_json::json!({"output": {"out_dir": out_dir}}))
            .context("applying --out-dir")?;
    }

    let settings = settings_manager.settings();
    let _log_guard = init_logging(&settings.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "birec starting");

    let manager = TaskManager::new(settings_manager.clone());
    manager.load_all_tasks().await;

    let shutdown = CancellationToken::new();

    // Background sinks.
    let space_monitor = SpaceMonitor::new(settings.output.out_dir.clone(), settings.space.clone());
    tokio::spawn(space_monitor.run(shutdown.child_token()));
    tokio::spawn(WebhookEmitter::new(settings.webhooks.clone()).run(shutdown.child_token()));
    tokio::spawn(Notifier::new(settings.notifier.clone()).run(shutdown.child_token()));

    // Admin surface.
    let state = AppState {
        manager: manager.clone(),
        settings: settings_manager.clone(),
        api_key: args.api_key.clone(),
    };
    let router = build_router(state);
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("parsing bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("admin api listening on http://{addr}");

    if args.open {
        let url = format!("http://{addr}");
        // Fire and forget; a headless host simply has no opener.
        std::process::Command::new(if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        })
        .arg(&url)
        .spawn()
        .ok();
    }

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    // Run until interrupted.
    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        result = server => {
            result.context("server task")?.context("serving admin api")?;
            false
        }
    };

    info!("shutting down");
    shutdown.cancel();
    manager.stop_all_tasks(false).await;
    info!("bye");

    Ok(interrupted)
}
