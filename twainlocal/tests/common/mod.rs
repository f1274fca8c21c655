//! Shared doubles for the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use twainlocal::{CommandCarrier, Dispatcher, InboundRequest, ScannerDriver};
use twainlocal_core::constants::PRIVET_TOKEN_HEADER;
use twainlocal_core::ipc::{DriverReply, DriverRequest, DriverSession};
use twainlocal_transport::{HttpRequest, HttpResponse, Transport};

/// Sends every request straight into a dispatcher
pub struct Loopback {
    pub dispatcher: Dispatcher,
}

#[async_trait]
impl Transport for Loopback {
    async fn execute(
        &self,
        request: &HttpRequest,
        _timeout: Duration,
    ) -> twainlocal_transport::Result<HttpResponse> {
        let (tx, rx) = oneshot::channel();
        let inbound = InboundRequest::new(
            request.path.clone(),
            request.header(PRIVET_TOKEN_HEADER).map(str::to_string),
            request.body.clone(),
        );
        self.dispatcher
            .dispatch(inbound, CommandCarrier::inbound(tx))
            .await;

        let reply = rx.await.map_err(|_| twainlocal_transport::Error::Timeout)?;
        let (status, content_type, body) = reply.into_parts().await;
        Ok(HttpResponse {
            status,
            content_type: Some(content_type),
            body,
        })
    }

    fn base_url(&self) -> String {
        "loopback".to_string()
    }
}

/// Loopback whose target device can be replaced mid-test
#[derive(Clone)]
pub struct Switchable {
    current: Arc<Mutex<Dispatcher>>,
}

impl Switchable {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            current: Arc::new(Mutex::new(dispatcher)),
        }
    }

    pub fn switch(&self, dispatcher: Dispatcher) {
        *self.current.lock().unwrap() = dispatcher;
    }
}

#[async_trait]
impl Transport for Switchable {
    async fn execute(
        &self,
        request: &HttpRequest,
        timeout: Duration,
    ) -> twainlocal_transport::Result<HttpResponse> {
        let dispatcher = self.current.lock().unwrap().clone();
        Loopback { dispatcher }.execute(request, timeout).await
    }

    fn base_url(&self) -> String {
        "switchable".to_string()
    }
}

/// Driver whose feeder holds a stack of pages, all captured on start
pub struct PaperDriver {
    dir: PathBuf,
    pages: u64,
    remaining: Vec<u64>,
    pub shutdowns: Arc<Mutex<u32>>,
}

impl PaperDriver {
    pub fn new(dir: impl Into<PathBuf>, pages: u64) -> Self {
        Self {
            dir: dir.into(),
            pages,
            remaining: Vec::new(),
            shutdowns: Arc::default(),
        }
    }

    fn file(&self, block: u64, suffix: &str) -> String {
        self.dir
            .join(format!("page{}{}", block, suffix))
            .display()
            .to_string()
    }

    fn session(&self) -> DriverReply {
        DriverReply {
            session: Some(DriverSession {
                image_blocks: self.remaining.clone(),
                full: false,
            }),
            end_of_job: Some(true),
            ..DriverReply::success()
        }
    }
}

#[async_trait]
impl ScannerDriver for PaperDriver {
    async fn call(&mut self, request: DriverRequest, _timeout: Duration) -> twainlocal::Result<DriverReply> {
        let reply = match request {
            DriverRequest::StartCapturing => {
                for block in 1..=self.pages {
                    std::fs::write(self.file(block, ".pdf"), format!("%PDF image {}", block))?;
                    std::fs::write(self.file(block, "_thumb.pdf"), format!("%PDF thumb {}", block))?;
                    std::fs::write(
                        self.file(block, ".meta"),
                        format!(r#"{{"metadata":{{"address":{{"imageNumber":{}}}}}}}"#, block),
                    )?;
                }
                self.remaining = (1..=self.pages).collect();
                self.session()
            }
            DriverRequest::GetSession | DriverRequest::StopCapturing => self.session(),
            DriverRequest::ReadImageBlock {
                image_block_num,
                with_metadata,
            } => DriverReply {
                image_file: Some(self.file(image_block_num, ".pdf")),
                meta: with_metadata.then(|| self.file(image_block_num, ".meta")),
                ..DriverReply::success()
            },
            DriverRequest::ReadImageBlockMetadata {
                image_block_num,
                with_thumbnail,
            } => DriverReply {
                thumbnail_file: with_thumbnail.then(|| self.file(image_block_num, "_thumb.pdf")),
                meta: Some(self.file(image_block_num, ".meta")),
                ..DriverReply::success()
            },
            DriverRequest::ReleaseImageBlocks {
                image_block_num,
                last_image_block_num,
            } => {
                self.remaining
                    .retain(|block| *block < image_block_num || *block > last_image_block_num);
                self.session()
            }
            _ => DriverReply::success(),
        };
        Ok(reply)
    }

    async fn shutdown(&mut self) -> twainlocal::Result<()> {
        *self.shutdowns.lock().unwrap() += 1;
        Ok(())
    }
}

/// Driver replaying a queue of replies
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    pub replies: Arc<Mutex<VecDeque<DriverReply>>>,
    pub shutdowns: Arc<Mutex<u32>>,
}

impl ScriptedDriver {
    pub fn push_blocks(&self, blocks: &[u64], end_of_job: bool) {
        self.replies.lock().unwrap().push_back(DriverReply {
            session: Some(DriverSession {
                image_blocks: blocks.to_vec(),
                full: false,
            }),
            end_of_job: Some(end_of_job),
            ..DriverReply::success()
        });
    }
}

#[async_trait]
impl ScannerDriver for ScriptedDriver {
    async fn call(&mut self, _request: DriverRequest, _timeout: Duration) -> twainlocal::Result<DriverReply> {
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(DriverReply::success))
    }

    async fn shutdown(&mut self) -> twainlocal::Result<()> {
        *self.shutdowns.lock().unwrap() += 1;
        Ok(())
    }
}
