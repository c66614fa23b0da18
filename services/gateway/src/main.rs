use clap::Parser;
use gateway::{build_router, klippy, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Moonraker - HTTP/WebSocket API gateway for the Klippy host.
#[derive(Debug, Parser)]
#[command(name = "moonraker")]
struct Args {
    /// Host name or IP to bind the web server to
    #[arg(short, long, default_value = "0.0.0.0")]
    address: String,
    /// Port the web server will listen on
    #[arg(short, long, default_value_t = 7125)]
    port: u16,
    /// File name and location for the Unix-domain socket
    #[arg(short, long, default_value = "/tmp/moonraker")]
    socketfile: String,
    /// Log file name and location
    #[arg(short, long, default_value = "/tmp/moonraker.log")]
    logfile: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let logfile = expand_user(&args.logfile);
    let socketfile = expand_user(&args.socketfile);
    init_logging(&logfile);
    info!("starting Moonraker");

    let state = AppState::new(logfile);
    state.install_local_endpoints().await;
    state.start_auth_prune();

    let host_listener = match klippy::bind(&socketfile) {
        Ok(listener) => listener,
        Err(e) => {
            error!(socket = %socketfile.display(), error = %e, "failed to bind host socket");
            std::process::exit(1);
        }
    };
    tokio::spawn(klippy::run(state.clone(), host_listener));

    let bind_addr = format!("{}:{}", args.address, args.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind web server");
            std::process::exit(1);
        }
    };
    info!(addr = %bind_addr, "server listening");

    let router = build_router(state);
    if let Err(e) = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
    info!("server shut down gracefully");
}

fn init_logging(logfile: &std::path::Path) {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logfile);
    match file {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(log_level))
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init(),
        // Fall back to stderr so a bad log path is still diagnosable.
        Err(_) => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(log_level))
            .init(),
    }
}

fn expand_user(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(path)
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
