use smartbed_bridge::config;
use smartbed_bridge::errors::is_socket_or_ble;
use smartbed_bridge::supervisor;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = config::config_path();
    let options = match config::load(&path) {
        Ok(options) => options,
        Err(e) => {
            error!(path = %path.display(), error = %format!("{e:#}"), "configuration invalid");
            std::process::exit(2);
        }
    };

    let result = tokio::select! {
        result = supervisor::run(options) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    match result {
        Ok(()) => {}
        Err(e) if is_socket_or_ble(&e) => {
            error!(error = %format!("{e:#}"), "exiting on socket/BLE failure");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "exiting on unexpected failure");
            std::process::exit(2);
        }
    }
}
