//! Scanner driver collaborator
//!
//! The device engine never talks to hardware itself; every command is
//! forwarded to a [`ScannerDriver`]. [`IpcDriver`] reaches a driver
//! executable over line delimited JSON on its stdin/stdout.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use twainlocal_core::ipc::{DriverReply, DriverRequest};
use twainlocal_transport::IpcChannel;

use crate::error::{Error, Result};

/// Hardware side of a device
#[async_trait]
pub trait ScannerDriver: Send {
    /// Forward one request and wait for the driver's reply
    async fn call(&mut self, request: DriverRequest, timeout: Duration) -> Result<DriverReply>;

    /// Release the driver once the session is closed
    async fn shutdown(&mut self) -> Result<()>;
}

/// Driver running as a child process
pub struct IpcDriver {
    program: String,
    args: Vec<String>,
    channel: Option<IpcChannel>,
    exit_timeout: Duration,
}

impl IpcDriver {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            channel: None,
            exit_timeout: Duration::from_secs(5),
        }
    }

    /// How long to wait for the child to exit before killing it
    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.channel.is_some()
    }
}

#[async_trait]
impl ScannerDriver for IpcDriver {
    async fn call(&mut self, request: DriverRequest, timeout: Duration) -> Result<DriverReply> {
        // a new session always starts from a fresh process
        if matches!(request, DriverRequest::CreateSession { .. }) {
            self.shutdown().await?;
            self.channel = Some(IpcChannel::spawn(&self.program, &self.args)?);
        }

        let channel = self
            .channel
            .as_mut()
            .ok_or(Error::Transport(twainlocal_transport::Error::ConnectionClosed))?;

        match channel.request(&request, timeout).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!("Driver request failed: {}", e);
                if let Some(channel) = self.channel.take() {
                    let _ = channel.shutdown(Duration::ZERO).await;
                }
                Err(e.into())
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        let Some(mut channel) = self.channel.take() else {
            return Ok(());
        };

        debug!("Stopping driver {}", self.program);
        if let Err(e) = channel.send(&DriverRequest::Exit).await {
            warn!("Failed to send exit to driver: {}", e);
        }
        channel.shutdown(self.exit_timeout).await?;
        Ok(())
    }
}
