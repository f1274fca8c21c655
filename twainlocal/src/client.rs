//! Client role: issue session commands to a device
//!
//! Commands from one client are serialized: each holds the client lock from
//! the local state check until the reply has been applied, so the local
//! session mirror never sees two replies interleave. The `waitForEvents`
//! long poll releases the lock while it is parked on the device; its reply
//! never rolls the mirror back to an older revision.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use serde_json::{Map, Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use twainlocal_core::constants::{CONTENT_TYPE_JSON, INFO_PATH, PRIVET_TOKEN_HEADER, SESSION_PATH};
use twainlocal_core::envelope::PrivetError;
use twainlocal_core::multipart::{self, MultipartEvent, MultipartReader, PartKind};
use twainlocal_core::session::{self, Session};
use twainlocal_core::{CommandReply, CommandRequest, ErrorCode, InfoReply, Method, SessionEvent};
use twainlocal_transport::{BodyStream, HttpRequest, HttpResponse, RetryPolicy, Transport, execute_with_retry};

use crate::carrier::CommandCarrier;
use crate::config::Timeouts;
use crate::error::{Error, Result};

struct ClientState {
    session: Session,
    token: Option<String>,
}

/// Where binary reply parts go
#[derive(Debug, Clone, Default)]
struct Outputs {
    image: Option<PathBuf>,
    thumbnail: Option<PathBuf>,
}

impl Outputs {
    fn path(&self, kind: PartKind) -> Option<&Path> {
        match kind {
            PartKind::Image => self.image.as_deref(),
            PartKind::Thumbnail => self.thumbnail.as_deref(),
            PartKind::Json => None,
        }
    }

    fn paths(&self) -> impl Iterator<Item = &Path> {
        self.image.iter().chain(self.thumbnail.iter()).map(PathBuf::as_path)
    }
}

/// A TWAIN Local client bound to one device
pub struct Client {
    transport: Box<dyn Transport>,
    state: Mutex<ClientState>,
    timeouts: Timeouts,
    retry: RetryPolicy,
}

impl Client {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            state: Mutex::new(ClientState {
                session: Session::new(),
                token: None,
            }),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Snapshot of the local session mirror
    pub async fn session(&self) -> Session {
        self.state.lock().await.session.clone()
    }

    /// Fetch `/privet/info` and keep its token for later commands
    pub async fn info(&self) -> Result<InfoReply> {
        let mut state = self.state.lock().await;
        self.fetch_info(&mut state).await
    }

    pub async fn create_session(&self) -> Result<CommandCarrier> {
        self.send(Method::CreateSession, Map::new(), Outputs::default())
            .await
    }

    pub async fn get_session(&self) -> Result<CommandCarrier> {
        self.send(Method::GetSession, Map::new(), Outputs::default()).await
    }

    pub async fn set_twain_direct_options(&self, task: Value) -> Result<CommandCarrier> {
        let mut params = Map::new();
        params.insert("task".to_string(), task);
        self.send(Method::SetTwainDirectOptions, params, Outputs::default())
            .await
    }

    pub async fn start_capturing(&self) -> Result<CommandCarrier> {
        self.send(Method::StartCapturing, Map::new(), Outputs::default())
            .await
    }

    pub async fn stop_capturing(&self) -> Result<CommandCarrier> {
        self.send(Method::StopCapturing, Map::new(), Outputs::default())
            .await
    }

    /// Transfer one image block into `image_path`
    pub async fn read_image_block(
        &self,
        image_block_num: u64,
        with_metadata: bool,
        image_path: impl Into<PathBuf>,
    ) -> Result<CommandCarrier> {
        let params = object(json!({
            "imageBlockNum": image_block_num,
            "withMetadata": with_metadata,
        }));
        let outputs = Outputs {
            image: Some(image_path.into()),
            thumbnail: None,
        };
        self.send(Method::ReadImageBlock, params, outputs).await
    }

    /// Metadata for one block, with its thumbnail written to `thumbnail_path`
    pub async fn read_image_block_metadata(
        &self,
        image_block_num: u64,
        with_thumbnail: bool,
        thumbnail_path: Option<PathBuf>,
    ) -> Result<CommandCarrier> {
        let params = object(json!({
            "imageBlockNum": image_block_num,
            "withThumbnail": with_thumbnail,
        }));
        let outputs = Outputs {
            image: None,
            thumbnail: thumbnail_path.filter(|_| with_thumbnail),
        };
        self.send(Method::ReadImageBlockMetadata, params, outputs).await
    }

    /// Release blocks `first..=last`
    pub async fn release_image_blocks(&self, first: u64, last: u64) -> Result<CommandCarrier> {
        let params = object(json!({
            "imageBlockNum": first,
            "lastImageBlockNum": last,
        }));
        self.send(Method::ReleaseImageBlocks, params, Outputs::default())
            .await
    }

    pub async fn close_session(&self) -> Result<CommandCarrier> {
        self.send(Method::CloseSession, Map::new(), Outputs::default())
            .await
    }

    /// Long poll for session events newer than the local revision
    ///
    /// Other commands of this client may run while the device holds the
    /// poll. An empty list means nothing changed within the device's window.
    pub async fn wait_for_events(&self) -> Result<Vec<SessionEvent>> {
        let method = Method::WaitForEvents;
        let (carrier, request) = {
            let mut state = self.state.lock().await;
            let mut params = Map::new();
            params.insert("sessionRevision".to_string(), json!(state.session.revision()));
            self.prepare(&mut state, method, params, &Outputs::default())
                .await?
        };

        let (carrier, response) = self.exchange(carrier, &request, method).await?;
        let mut state = self.state.lock().await;
        let carrier = self
            .receive(&mut state, carrier, response, &Outputs::default())
            .await?;

        let events = carrier
            .response()
            .and_then(|reply| reply.results.events.clone())
            .unwrap_or_default();
        for event in &events {
            info!("Session event {} at revision {}", event.event, event.session.revision);
        }
        Ok(events)
    }

    async fn fetch_info(&self, state: &mut ClientState) -> Result<InfoReply> {
        let request = HttpRequest::get(INFO_PATH);
        let response = execute_with_retry(
            self.transport.as_ref(),
            &request,
            self.timeouts.command,
            self.retry,
        )
        .await?;

        if !response.is_success() {
            return Err(Error::InvalidResponse(format!(
                "{} answered HTTP {}",
                INFO_PATH, response.status
            )));
        }
        let body = response.bytes().await?;
        let text = String::from_utf8_lossy(&body);
        let info: InfoReply = serde_json::from_str(&text)
            .map_err(|e| twainlocal_core::Error::from_json(&text, &e))?;

        debug!("Device {} issued a new token", info.name);
        state.token = Some(info.x_privet_token.clone());
        Ok(info)
    }

    async fn send(&self, method: Method, params: Map<String, Value>, outputs: Outputs) -> Result<CommandCarrier> {
        let mut state = self.state.lock().await;
        let (carrier, request) = self.prepare(&mut state, method, params, &outputs).await?;
        let (carrier, response) = self.exchange(carrier, &request, method).await?;
        self.receive(&mut state, carrier, response, &outputs).await
    }

    /// Local checks, token and request body for one command
    async fn prepare(
        &self,
        state: &mut ClientState,
        method: Method,
        mut params: Map<String, Value>,
        outputs: &Outputs,
    ) -> Result<(CommandCarrier, HttpRequest)> {
        let mut carrier = CommandCarrier::initiator(method);
        let session_id = state.session.session_id().map(str::to_string);
        carrier.set_session_id(session_id.clone());

        let current = state.session.state();
        if let Err(code) = session::check(method, current) {
            info!("{} not sent, session is {}", method, current);
            carrier.fail_local(code, format!("{} is not allowed while {}", method, current));
            return Err(Error::Command(Box::new(carrier)));
        }

        for path in outputs.paths() {
            if let Err(e) = remove_stale(path).await {
                warn!("Cannot remove {}: {}", path.display(), e);
                carrier.fail_local(ErrorCode::AccessDenied, e.to_string());
                return Err(Error::Command(Box::new(carrier)));
            }
        }

        if state.token.is_none() {
            if let Err(e) = self.fetch_info(state).await {
                warn!("Failed to fetch a token: {}", e);
                carrier.fail_local(ErrorCode::CommunicationError, e.to_string());
                return Err(Error::Command(Box::new(carrier)));
            }
        }
        let token = state.token.clone().unwrap_or_default();

        if method.requires_session_id() {
            if let Some(id) = session_id {
                params.insert("sessionId".to_string(), Value::String(id));
            }
        }
        let command = CommandRequest::new(carrier.command_id(), method, Value::Object(params));
        let request = HttpRequest::post(SESSION_PATH, command.to_json()?)
            .with_header("Content-Type", CONTENT_TYPE_JSON)
            .with_header(PRIVET_TOKEN_HEADER, token);
        Ok((carrier, request))
    }

    /// One HTTP exchange under the method's timeout, with retries
    async fn exchange(
        &self,
        mut carrier: CommandCarrier,
        request: &HttpRequest,
        method: Method,
    ) -> Result<(CommandCarrier, HttpResponse)> {
        debug!("Sending {}", carrier);
        let timeout = self.timeouts.for_method(method);
        let response = match execute_with_retry(self.transport.as_ref(), request, timeout, self.retry).await {
            Ok(response) => response,
            Err(twainlocal_transport::Error::Timeout) => {
                warn!("{} timed out after {:?}", carrier, timeout);
                carrier.fail_local(ErrorCode::Timeout, "request timed out");
                return Err(Error::Command(Box::new(carrier)));
            }
            Err(e) => {
                warn!("{} failed: {}", carrier, e);
                carrier.fail_local(ErrorCode::CommunicationError, e.to_string());
                return Err(Error::Command(Box::new(carrier)));
            }
        };
        Ok((carrier, response))
    }

    async fn receive(
        &self,
        state: &mut ClientState,
        mut carrier: CommandCarrier,
        response: HttpResponse,
        outputs: &Outputs,
    ) -> Result<CommandCarrier> {
        let status = response.status;

        if !response.is_success() {
            let text = match response.bytes().await {
                Ok(body) => String::from_utf8_lossy(&body).into_owned(),
                Err(e) => e.to_string(),
            };
            let code = match serde_json::from_str::<PrivetError>(&text) {
                Ok(error) if status == 400 => {
                    warn!("Device rejected the token: {}", error.description);
                    state.token = None;
                    ErrorCode::InvalidPrivetToken
                }
                _ => ErrorCode::CommunicationError,
            };
            carrier.fail_http(status, code, text);
            return Err(Error::Command(Box::new(carrier)));
        }

        let boundary = response.content_type.as_deref().and_then(multipart::boundary_of);
        let text = match boundary {
            Some(boundary) => {
                match read_multipart(response.body, &boundary, outputs, &mut carrier).await {
                    Ok(text) => text,
                    Err((code, message)) => {
                        carrier.fail_http(status, code, message);
                        return Err(Error::Command(Box::new(carrier)));
                    }
                }
            }
            None => match response.bytes().await {
                Ok(body) => String::from_utf8_lossy(&body).into_owned(),
                Err(e) => {
                    carrier.fail_http(status, ErrorCode::CommunicationError, e.to_string());
                    return Err(Error::Command(Box::new(carrier)));
                }
            },
        };

        let reply = match CommandReply::parse(&text) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("{}: unparsable reply: {}", carrier, e);
                carrier.set_json_error_offset(e.character_offset());
                carrier.fail_http(status, ErrorCode::InvalidJson, text);
                return Err(Error::Command(Box::new(carrier)));
            }
        };
        let success = reply.results.success;
        let code = reply.results.code.clone();
        let session = reply.results.session.clone();
        carrier.record_reply(status, text, reply);

        let stale = session.as_ref().is_some_and(|session| {
            state.session.session_id() == Some(session.session_id.as_str())
                && session.revision < state.session.revision()
        });
        if stale {
            debug!("{}: reply predates the local revision, not applied", carrier);
        } else if let Some(session) = &session {
            if let Err(e) = state.session.apply_remote(session) {
                warn!("{}: bad session in reply: {}", carrier, e);
                carrier.fail_http(status, ErrorCode::InvalidResponse, e.to_string());
                return Err(Error::Command(Box::new(carrier)));
            }
        }
        carrier.set_end_of_job(state.session.end_of_job());

        if !success {
            if code.as_ref().is_some_and(ErrorCode::resets_session) {
                info!("{}: dropping the local session", carrier);
                state.session.reset();
            }
            return Err(Error::Command(Box::new(carrier)));
        }

        debug!("Completed {}", carrier);
        Ok(carrier)
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn remove_stale(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

type PartResult<T> = std::result::Result<T, (ErrorCode, String)>;

/// Stream a multipart body, writing binary parts to their files
async fn read_multipart(
    mut body: BodyStream,
    boundary: &str,
    outputs: &Outputs,
    carrier: &mut CommandCarrier,
) -> PartResult<String> {
    let mut reader = MultipartReader::new(boundary);
    let mut sink = PartSink {
        outputs,
        file: None,
        json: None,
    };

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| (ErrorCode::CommunicationError, e.to_string()))?;
        let events = reader
            .feed(&chunk)
            .map_err(|e| (ErrorCode::InvalidResponse, e.to_string()))?;
        sink.handle(events, carrier).await?;
    }
    let events = reader
        .finish()
        .map_err(|e| (ErrorCode::InvalidResponse, e.to_string()))?;
    sink.handle(events, carrier).await?;

    sink.json
        .ok_or_else(|| (ErrorCode::InvalidResponse, "multipart reply without JSON".to_string()))
}

struct PartSink<'a> {
    outputs: &'a Outputs,
    file: Option<tokio::fs::File>,
    json: Option<String>,
}

impl PartSink<'_> {
    async fn handle(&mut self, events: Vec<MultipartEvent>, carrier: &mut CommandCarrier) -> PartResult<()> {
        for event in events {
            match event {
                MultipartEvent::Json(text) => self.json = Some(text),
                MultipartEvent::PartStart(kind) => {
                    let Some(path) = self.outputs.path(kind) else {
                        warn!("Discarding unrequested {:?} part", kind);
                        continue;
                    };
                    let file = tokio::fs::File::create(path)
                        .await
                        .map_err(|e| (ErrorCode::AccessDenied, format!("{}: {}", path.display(), e)))?;
                    match kind {
                        PartKind::Thumbnail => carrier.set_thumbnail_file(path.to_path_buf()),
                        _ => carrier.set_image_file(path.to_path_buf()),
                    }
                    self.file = Some(file);
                }
                MultipartEvent::Data(_, data) => {
                    if let Some(file) = self.file.as_mut() {
                        file.write_all(&data)
                            .await
                            .map_err(|e| (ErrorCode::AccessDenied, e.to_string()))?;
                    }
                }
                MultipartEvent::PartEnd(_) => {
                    if let Some(mut file) = self.file.take() {
                        file.flush()
                            .await
                            .map_err(|e| (ErrorCode::AccessDenied, e.to_string()))?;
                    }
                }
            }
        }
        Ok(())
    }
}
