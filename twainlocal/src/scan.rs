//! Client scan loop
//!
//! Drives a ready session through capture, transferring every image block
//! into a folder as `imgNNNNNN.pdf` (plus `_thumbnail.pdf` and `.meta`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use twainlocal_core::constants::SESSION_POLL_INTERVAL;
use twainlocal_core::{ErrorCode, Method, SessionState};

use crate::carrier::CommandCarrier;
use crate::client::Client;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub images_folder: PathBuf,
    pub with_metadata: bool,
    pub with_thumbnail: bool,
    pub poll_interval: Duration,
    /// How long the device may go without any session change while no
    /// block is listed; `None` uses the client's event timeout
    pub event_timeout: Option<Duration>,
}

impl ScanOptions {
    pub fn new(images_folder: impl Into<PathBuf>) -> Self {
        Self {
            images_folder: images_folder.into(),
            with_metadata: false,
            with_thumbnail: false,
            poll_interval: SESSION_POLL_INTERVAL,
            event_timeout: None,
        }
    }

    pub fn with_metadata(mut self, with_thumbnail: bool) -> Self {
        self.with_metadata = true;
        self.with_thumbnail = with_thumbnail;
        self
    }

    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn image_path(&self, block: u64) -> PathBuf {
        self.images_folder.join(format!("img{:06}.pdf", block))
    }

    fn thumbnail_path(&self, block: u64) -> PathBuf {
        self.images_folder.join(format!("img{:06}_thumbnail.pdf", block))
    }

    fn meta_path(&self, block: u64) -> PathBuf {
        self.images_folder.join(format!("img{:06}.meta", block))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSummary {
    /// Image files written, in transfer order
    pub images: Vec<PathBuf>,
}

/// Capture and transfer until the device reports the job drained
pub async fn scan(client: &Client, options: &ScanOptions) -> Result<ScanSummary> {
    tokio::fs::create_dir_all(&options.images_folder).await?;

    if client.session().await.state() == SessionState::Ready {
        client.start_capturing().await?;
    }

    let mut summary = ScanSummary::default();
    while let Some(block) = next_block(client, options).await? {
        debug!("Transferring image block {}", block);

        if options.with_metadata {
            let thumbnail = options.with_thumbnail.then(|| options.thumbnail_path(block));
            let carrier = client
                .read_image_block_metadata(block, options.with_thumbnail, thumbnail)
                .await?;
            write_meta(&carrier, &options.meta_path(block)).await?;
        }

        let image = options.image_path(block);
        client.read_image_block(block, false, image.clone()).await?;
        client.release_image_blocks(block, block).await?;

        info!("Received {}", image.display());
        summary.images.push(image);
    }

    if client.session().await.state().is_capturing() {
        client.stop_capturing().await?;
    }
    info!("Scan finished, {} image(s)", summary.images.len());
    Ok(summary)
}

/// Poll getSession until a block is listed or the job is drained
///
/// Gives up with [`Error::EventTimeout`] only after a full event timeout
/// in which the session revision did not move; a slow feeder that keeps
/// reporting progress is waited for indefinitely.
async fn next_block(client: &Client, options: &ScanOptions) -> Result<Option<u64>> {
    let event_timeout = options.event_timeout.unwrap_or(client.timeouts().event);
    let mut deadline = Instant::now() + event_timeout;
    let mut revision = None;

    loop {
        let session = client.session().await;
        if let Some(block) = session.image_blocks().first() {
            return Ok(Some(*block));
        }
        if session.is_drained() || session.state().is_idle() {
            return Ok(None);
        }
        if revision.is_some_and(|seen| seen != session.revision()) {
            deadline = Instant::now() + event_timeout;
        }
        revision = Some(session.revision());
        if Instant::now() >= deadline {
            warn!("No session change within {:?}", event_timeout);
            return Err(Error::EventTimeout(event_timeout));
        }

        tokio::time::sleep(options.poll_interval).await;
        client.get_session().await?;
    }
}

async fn write_meta(carrier: &CommandCarrier, path: &Path) -> Result<()> {
    let metadata = carrier
        .response()
        .map(|reply| reply.results.metadata.clone())
        .unwrap_or_default();
    let text = serde_json::to_string_pretty(&metadata).map_err(twainlocal_core::Error::from)?;

    let written = match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => tokio::fs::write(path, text).await,
    };
    if let Err(e) = written {
        warn!("Cannot write {}: {}", path.display(), e);
        let mut failed = CommandCarrier::initiator(Method::ReadImageBlockMetadata);
        failed.set_session_id(carrier.session_id().map(str::to_string));
        failed.fail_local(ErrorCode::AccessDenied, e.to_string());
        return Err(Error::Command(Box::new(failed)));
    }
    Ok(())
}
