//! Line delimited JSON channel to the scanner driver process

use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::*;

/// One JSON object per line over any reader/writer pair
pub struct LineChannel<R, W> {
    reader: Lines<BufReader<R>>,
    writer: W,
}

impl<R, W> LineChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Write one message
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        trace!("ipc>>> {}", line);
        line.push('\n');

        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one message, skipping blank lines
    pub async fn receive<T: DeserializeOwned>(&mut self, wait: Duration) -> Result<T> {
        loop {
            let line = timeout(wait, self.reader.next_line())
                .await
                .map_err(|_| Error::Timeout)??
                .ok_or(Error::ConnectionClosed)?;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            trace!("ipc<<< {}", line);
            return Ok(serde_json::from_str(line)?);
        }
    }

    /// Send a request and wait for its reply
    pub async fn request<Q, P>(&mut self, message: &Q, wait: Duration) -> Result<P>
    where
        Q: Serialize + Sync,
        P: DeserializeOwned,
    {
        self.send(message).await?;
        self.receive(wait).await
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader.into_inner().into_inner(), self.writer)
    }
}

/// Driver child process reached over its stdin/stdout
pub struct IpcChannel {
    child: Child,
    channel: LineChannel<ChildStdout, ChildStdin>,
}

impl IpcChannel {
    /// Spawn `program` with piped stdio
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        debug!("Spawning driver {} {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(Error::ConnectionClosed)?;
        let stdout = child.stdout.take().ok_or(Error::ConnectionClosed)?;

        Ok(Self {
            child,
            channel: LineChannel::new(stdout, stdin),
        })
    }

    pub async fn request<Q, P>(&mut self, message: &Q, wait: Duration) -> Result<P>
    where
        Q: Serialize + Sync,
        P: DeserializeOwned,
    {
        self.channel.request(message, wait).await
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        self.channel.send(message).await
    }

    /// Wait for the child to exit, killing it after `wait`
    pub async fn shutdown(mut self, wait: Duration) -> Result<()> {
        let (_, stdin) = self.channel.into_inner();
        drop(stdin);

        match timeout(wait, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("Driver exited: {}", status);
            }
            Err(_) => {
                warn!("Driver did not exit within {:?}, killing it", wait);
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}
