//! Scan everything a device produces into a folder
//!
//! ```text
//! DEVICE_URL=http://192.168.1.20:55555 cargo run --example scan
//! ```

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use twainlocal::{Client, Config, ScanOptions, scan};
use twainlocal_transport::{HttpTransport, RetryPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load("twainlocal.json")?;
    let url = std::env::var("DEVICE_URL").unwrap_or_else(|_| config.base_url());

    let client = Client::new(HttpTransport::new(url.as_str())?)
        .with_timeouts(config.timeouts())
        .with_retry(RetryPolicy::new(config.retries));

    let info = client.info().await.with_context(|| format!("querying {}", url))?;
    println!("Scanner: {} ({})", info.name, info.device_state);

    client.create_session().await?;
    if let Ok(task) = std::env::var("TWAIN_TASK") {
        let task = serde_json::from_str(&task).context("TWAIN_TASK is not JSON")?;
        client.set_twain_direct_options(task).await?;
    }

    let options = ScanOptions::new(&config.images_folder).with_metadata(true);
    let summary = scan(&client, &options).await;
    if !client.session().await.state().is_idle() {
        client.close_session().await?;
    }

    for image in summary?.images {
        println!("{}", image.display());
    }
    Ok(())
}
