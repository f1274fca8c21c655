//! Run a device that forwards every command to a driver executable
//!
//! ```text
//! TWAINLOCAL_CONFIG=twainlocal.json cargo run --example serve
//! ```

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use twainlocal::{Config, DeviceRegister, DeviceScanner, Dispatcher, IpcDriver, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::var("TWAINLOCAL_CONFIG").unwrap_or_else(|_| "twainlocal.json".to_string());
    let config = Config::load(&path).with_context(|| format!("loading {}", path))?;
    anyhow::ensure!(!config.driver_path.is_empty(), "driverPath is not configured");

    let mut register = DeviceRegister::new();
    if !register.load(&config.register_file)? {
        tracing::warn!("No scanner registered in {}", config.register_file.display());
    }

    let driver = IpcDriver::new(config.driver_path.clone(), config.driver_args.clone());
    let device = DeviceScanner::new(driver, register)
        .with_timeouts(config.timeouts())
        .with_session_timeout(config.session_timeout())
        .with_base_url(config.base_url());
    let device = Arc::new(device);
    let _watcher = device.watch_session_timeout();

    let listener = TcpListener::bind(("0.0.0.0", config.use_port))
        .await
        .with_context(|| format!("binding port {}", config.use_port))?;
    let router = server::router(Dispatcher::new(device));

    server::serve(listener, router, server::shutdown_signal()).await?;

    Ok(())
}
