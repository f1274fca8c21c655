//! Device role protocol engine
//!
//! Every session command runs under one lock that covers the session
//! record and the driver call, so commands against a device are applied
//! in a single total order. `waitForEvents` is the exception: it parks
//! without the lock until the session changes.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use twainlocal_core::envelope::{
    EVENT_IMAGE_BLOCKS, EVENT_SESSION_TIMED_OUT, RESERVED_RESULT_KEYS, ReadImageBlockMetadataParams,
    ReadImageBlockParams, ReleaseImageBlocksParams, SessionEvent, SessionParams,
    SetTwainDirectOptionsParams, WaitForEventsParams,
};
use twainlocal_core::ipc::{DriverReply, DriverRequest};
use twainlocal_core::session::{self, Session, SessionState};
use twainlocal_core::{
    CommandRequest, ErrorCode, InfoReply, Method, PROTOCOL_VERSION, PrivetTokenStore, SessionObject,
};
use twainlocal_core::constants::{DEFAULT_SESSION_TIMEOUT, MAX_PENDING_EVENTS, SESSION_PATH};
use twainlocal_types::DeviceRegister;

use crate::config::Timeouts;
use crate::driver::ScannerDriver;

/// Result of an accepted command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub session: SessionObject,
    pub image_file: Option<PathBuf>,
    pub thumbnail_file: Option<PathBuf>,
    /// Merged into `results`
    pub metadata: Map<String, Value>,
    /// Set for `waitForEvents`
    pub events: Option<Vec<SessionEvent>>,
}

/// Result of a rejected command
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub code: ErrorCode,
    pub character_offset: Option<u64>,
    pub json_key: Option<String>,
}

impl Failure {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            character_offset: None,
            json_key: None,
        }
    }

    pub fn invalid_json(offset: u64) -> Self {
        Self {
            character_offset: Some(offset),
            ..Self::new(ErrorCode::InvalidJson)
        }
    }

    fn from_driver(reply: &DriverReply) -> Self {
        Self {
            json_key: reply.json_key.clone(),
            ..Self::new(reply.error_code())
        }
    }
}

impl From<ErrorCode> for Failure {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

type Handled<T> = std::result::Result<T, Failure>;

/// Session events not yet acknowledged by a `waitForEvents`
#[derive(Debug, Default)]
struct EventLog {
    events: VecDeque<SessionEvent>,
}

impl EventLog {
    fn push(&mut self, event: &str, session: SessionObject) {
        if self.events.len() == MAX_PENDING_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SessionEvent {
            event: event.to_string(),
            session,
        });
    }

    /// Forget events up to `revision`, the client has seen them
    fn acknowledge(&mut self, revision: u64) {
        self.events.retain(|event| event.session.revision > revision);
    }

    fn pending(&self) -> Vec<SessionEvent> {
        self.events.iter().cloned().collect()
    }

    fn clear(&mut self) {
        self.events.clear();
    }
}

struct DeviceInner {
    session: Session,
    driver: Box<dyn ScannerDriver>,
    events: EventLog,
    last_activity: tokio::time::Instant,
}

/// A TWAIN Local scanner as seen from the network
pub struct DeviceScanner {
    inner: Mutex<DeviceInner>,
    tokens: PrivetTokenStore,
    register: DeviceRegister,
    timeouts: Timeouts,
    session_timeout: Duration,
    changed: Notify,
    base_url: String,
    started: Instant,
}

impl DeviceScanner {
    pub fn new(driver: impl ScannerDriver + 'static, register: DeviceRegister) -> Self {
        Self {
            inner: Mutex::new(DeviceInner {
                session: Session::new(),
                driver: Box::new(driver),
                events: EventLog::default(),
                last_activity: tokio::time::Instant::now(),
            }),
            tokens: PrivetTokenStore::new(),
            register,
            timeouts: Timeouts::default(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            changed: Notify::new(),
            base_url: String::new(),
            started: Instant::now(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// How long a session may go without a command before it is dropped
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// URL reported by `/privet/info`
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_tokens(mut self, tokens: PrivetTokenStore) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn register(&self) -> &DeviceRegister {
        &self.register
    }

    /// Whether `token` is the currently issued X-Privet-Token
    pub fn is_valid_token(&self, token: Option<&str>) -> bool {
        self.tokens.is_valid(token)
    }

    /// Current session as it would be sent on the wire
    pub async fn session(&self) -> SessionObject {
        self.inner.lock().await.session.to_object()
    }

    /// Answer `/privet/info`, rotating the token while idle
    pub async fn info(&self) -> InfoReply {
        let state = {
            let mut inner = self.inner.lock().await;
            self.expire(&mut inner).await;
            inner.session.state()
        };
        let token = self.tokens.issue(state.is_idle(), Instant::now());
        let device = self.register.device();

        InfoReply {
            version: PROTOCOL_VERSION.to_string(),
            name: device.map(|d| d.ty.clone()).unwrap_or_default(),
            description: device.map(|d| d.note.clone()).unwrap_or_default(),
            url: self.base_url.clone(),
            device_type: "twaindirect".to_string(),
            id: String::new(),
            device_state: state.device_state().to_string(),
            connection_state: "offline".to_string(),
            serial_number: device.map(|d| d.serial_number.clone()).unwrap_or_default(),
            uptime: self.started.elapsed().as_secs(),
            x_privet_token: token,
            api: vec![SESSION_PATH.to_string()],
            ..Default::default()
        }
    }

    /// Run one session command
    ///
    /// `raw` is the request text, used to locate errors in `params.task`.
    pub async fn execute(&self, method: Method, request: &CommandRequest, raw: &str) -> Handled<Outcome> {
        if method == Method::WaitForEvents {
            return self.wait_for_events(request).await;
        }
        let params: SessionParams = request.params().map_err(|_| Failure::invalid_json(0))?;

        let mut inner = self.inner.lock().await;
        self.expire(&mut inner).await;

        if method.requires_session_id() && !inner.session.matches(params.session_id.as_deref()) {
            warn!(
                "{}: sessionId {:?} does not match {:?}",
                method,
                params.session_id,
                inner.session.session_id()
            );
            return Err(ErrorCode::InvalidSessionId.into());
        }

        let state = inner.session.state();
        if let Err(code) = session::check(method, state) {
            info!("{} rejected in state {}: {}", method, state, code);
            return Err(code.into());
        }
        inner.last_activity = tokio::time::Instant::now();

        let timeout = self.timeouts.for_method(method);
        let mut outcome = match method {
            Method::CreateSession => {
                let scanner = self
                    .register
                    .device()
                    .map(|device| device.ty.clone())
                    .unwrap_or_default();
                inner.create_session(scanner, timeout).await?
            }
            Method::GetSession => inner.get_session(timeout).await?,
            Method::SetTwainDirectOptions => {
                let params: SetTwainDirectOptionsParams =
                    request.params().map_err(|_| Failure::invalid_json(0))?;
                let task = validate_task(params.task, raw)?;
                inner.set_twain_direct_options(task, timeout).await?
            }
            Method::StartCapturing => inner.start_capturing(timeout).await?,
            Method::StopCapturing => inner.stop_capturing(timeout).await?,
            Method::ReadImageBlock => {
                let params: ReadImageBlockParams =
                    request.params().map_err(|_| Failure::invalid_json(0))?;
                inner.read_image_block(params, timeout).await?
            }
            Method::ReadImageBlockMetadata => {
                let params: ReadImageBlockMetadataParams =
                    request.params().map_err(|_| Failure::invalid_json(0))?;
                inner.read_image_block_metadata(params, timeout).await?
            }
            Method::ReleaseImageBlocks => {
                let params: ReleaseImageBlocksParams =
                    request.params().map_err(|_| Failure::invalid_json(0))?;
                inner.release_image_blocks(params, timeout).await?
            }
            Method::CloseSession => inner.close_session(timeout).await?,
            Method::WaitForEvents => Outcome::default(),
        };

        if inner.session.state() != state {
            info!("Session {}: {} -> {}", method, state, inner.session.state());
        }
        let revision = inner.session.revision();
        if inner.session.commit() != revision {
            let session = inner.session.to_object();
            inner.events.push(EVENT_IMAGE_BLOCKS, session);
            self.changed.notify_waiters();
        }
        outcome.session = inner.session.to_object();
        Ok(outcome)
    }

    /// Long poll: answer with the unacknowledged events, parking until one
    /// arrives when there are none
    ///
    /// Parks for at most half the event timeout so the reply reaches the
    /// requester inside its own event timeout. Does not count as activity
    /// for the session timeout.
    async fn wait_for_events(&self, request: &CommandRequest) -> Handled<Outcome> {
        let params: WaitForEventsParams = request.params().map_err(|_| Failure::invalid_json(0))?;
        let changed = self.changed.notified();
        tokio::pin!(changed);

        {
            let mut inner = self.inner.lock().await;
            self.expire(&mut inner).await;

            if !inner.session.matches(params.session_id.as_deref()) {
                return Err(ErrorCode::InvalidSessionId.into());
            }
            session::check(Method::WaitForEvents, inner.session.state())?;

            inner.events.acknowledge(params.session_revision);
            let pending = inner.events.pending();
            if !pending.is_empty() {
                return Ok(Outcome {
                    session: inner.session.to_object(),
                    events: Some(pending),
                    ..Default::default()
                });
            }
            // registered before the lock is released, so no change is missed
            changed.as_mut().enable();
        }

        let window = self.timeouts.event / 2;
        if tokio::time::timeout(window, changed).await.is_err() {
            debug!("No session events within {:?}", window);
        }

        let inner = self.inner.lock().await;
        Ok(Outcome {
            session: inner.session.to_object(),
            events: Some(inner.events.pending()),
            ..Default::default()
        })
    }

    /// Drop the session if no command touched it for the session timeout
    ///
    /// Returns `true` when a session was dropped.
    pub async fn expire_idle_session(&self) -> bool {
        let mut inner = self.inner.lock().await;
        self.expire(&mut inner).await
    }

    async fn expire(&self, inner: &mut DeviceInner) -> bool {
        if inner.session.state().is_idle() || inner.last_activity.elapsed() < self.session_timeout {
            return false;
        }

        warn!(
            "Session {:?} timed out after {:?} without a command",
            inner.session.session_id(),
            self.session_timeout
        );
        let mut last = inner.session.to_object();
        last.revision += 1;
        last.state = SessionState::NoSession.wire_name().to_string();
        last.image_blocks = None;
        inner.events.push(EVENT_SESSION_TIMED_OUT, last);

        inner.shutdown_driver().await;
        inner.session.reset();
        self.changed.notify_waiters();
        true
    }

    /// Check the session timeout in the background until the device is dropped
    pub fn watch_session_timeout(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = (self.session_timeout / 10).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(device) = weak.upgrade() else {
                    break;
                };
                device.expire_idle_session().await;
            }
        })
    }
}

/// `params.task` must be present and an object
fn validate_task(task: Option<Value>, raw: &str) -> Handled<Value> {
    match task {
        None => Err(Failure::invalid_json(0)),
        Some(task) if !task.is_object() => {
            let offset = raw.find("\"task\":").map(|index| index + 7).unwrap_or(0);
            Err(Failure::invalid_json(offset as u64))
        }
        Some(task) => Ok(task),
    }
}

async fn existing_file(path: Option<&str>) -> Handled<Option<PathBuf>> {
    let Some(path) = path else {
        return Ok(None);
    };
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(Some(PathBuf::from(path))),
        Err(e) => {
            error!("Driver file {} is not readable: {}", path, e);
            Err(ErrorCode::AccessDenied.into())
        }
    }
}

async fn load_metadata(path: Option<&str>) -> Handled<Map<String, Value>> {
    let Some(path) = path else {
        return Ok(Map::new());
    };
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        error!("Failed to read metadata {}: {}", path, e);
        Failure::new(ErrorCode::AccessDenied)
    })?;

    match serde_json::from_str(&text) {
        Ok(Value::Object(mut map)) => {
            for key in RESERVED_RESULT_KEYS {
                if map.remove(key).is_some() {
                    warn!("Metadata {} may not set results.{}, ignored", path, key);
                }
            }
            Ok(map)
        }
        _ => {
            error!("Metadata {} is not a JSON object", path);
            Err(ErrorCode::CommunicationError.into())
        }
    }
}

impl DeviceInner {
    async fn call(&mut self, request: DriverRequest, timeout: Duration) -> Handled<DriverReply> {
        debug!("Driver request: {:?}", request);
        let reply = self.driver.call(request, timeout).await.map_err(|e| {
            error!("Driver call failed: {}", e);
            Failure::new(ErrorCode::CommunicationError)
        })?;

        if !reply.is_success() {
            warn!("Driver reported {}", reply.status);
            return Err(Failure::from_driver(&reply));
        }
        Ok(reply)
    }

    /// Driver call for commands that end capture locally even when the
    /// driver is gone
    ///
    /// `None` means the driver could not be reached at all.
    async fn call_or_lose(&mut self, request: DriverRequest, timeout: Duration) -> Handled<Option<DriverReply>> {
        debug!("Driver request: {:?}", request);
        match self.driver.call(request, timeout).await {
            Ok(reply) if reply.is_success() => Ok(Some(reply)),
            Ok(reply) => {
                warn!("Driver reported {}", reply.status);
                Err(Failure::from_driver(&reply))
            }
            Err(e) => {
                error!("Driver lost: {}", e);
                Ok(None)
            }
        }
    }

    /// Blocks held by a lost driver can never be read
    fn drop_image_blocks(&mut self) {
        let full = self.session.state() == SessionState::Full;
        self.session.update_image_blocks([], true, full);
    }

    /// Fold the driver's block list into the session; true if it closed
    fn apply(&mut self, reply: &DriverReply) -> bool {
        let end_of_job = reply.end_of_job.unwrap_or(self.session.end_of_job());
        match &reply.session {
            Some(driver) => {
                self.session
                    .update_image_blocks(driver.image_blocks.iter().copied(), end_of_job, driver.full)
            }
            None => {
                let blocks = self.session.image_blocks().to_vec();
                let full = self.session.state() == SessionState::Full;
                self.session.update_image_blocks(blocks, end_of_job, full)
            }
        }
    }

    async fn shutdown_driver(&mut self) {
        if let Err(e) = self.driver.shutdown().await {
            warn!("Driver shutdown failed: {}", e);
        }
    }

    async fn create_session(&mut self, scanner: String, timeout: Duration) -> Handled<Outcome> {
        self.call(DriverRequest::CreateSession { scanner }, timeout).await?;
        self.session.open(Uuid::new_v4().to_string())?;
        self.events.clear();
        Ok(Outcome::default())
    }

    async fn get_session(&mut self, timeout: Duration) -> Handled<Outcome> {
        let reply = self.call(DriverRequest::GetSession, timeout).await?;
        if self.apply(&reply) {
            self.shutdown_driver().await;
        }
        Ok(Outcome::default())
    }

    async fn set_twain_direct_options(&mut self, task: Value, timeout: Duration) -> Handled<Outcome> {
        let reply = self
            .call(DriverRequest::SetTwainDirectOptions { task: task.clone() }, timeout)
            .await?;
        self.session.set_task(reply.task_reply.clone().unwrap_or(task));
        self.apply(&reply);
        Ok(Outcome::default())
    }

    async fn start_capturing(&mut self, timeout: Duration) -> Handled<Outcome> {
        let reply = self.call(DriverRequest::StartCapturing, timeout).await?;
        self.session.start_capturing()?;
        self.apply(&reply);
        Ok(Outcome::default())
    }

    async fn stop_capturing(&mut self, timeout: Duration) -> Handled<Outcome> {
        match self.call_or_lose(DriverRequest::StopCapturing, timeout).await? {
            Some(reply) => {
                self.apply(&reply);
                self.session.stop_capturing()?;
            }
            None => {
                self.drop_image_blocks();
                self.session.stop_capturing()?;
                self.shutdown_driver().await;
            }
        }
        Ok(Outcome::default())
    }

    async fn read_image_block(&mut self, params: ReadImageBlockParams, timeout: Duration) -> Handled<Outcome> {
        let request = DriverRequest::ReadImageBlock {
            image_block_num: params.image_block_num,
            with_metadata: params.with_metadata,
        };
        let reply = self.call(request, timeout).await?;

        let image_file = existing_file(reply.image_file.as_deref()).await?;
        if image_file.is_none() {
            error!("Driver returned no image for block {}", params.image_block_num);
            return Err(ErrorCode::CommunicationError.into());
        }
        let metadata = if params.with_metadata {
            load_metadata(reply.meta.as_deref()).await?
        } else {
            Map::new()
        };

        self.apply(&reply);
        Ok(Outcome {
            image_file,
            metadata,
            ..Default::default()
        })
    }

    async fn read_image_block_metadata(
        &mut self,
        params: ReadImageBlockMetadataParams,
        timeout: Duration,
    ) -> Handled<Outcome> {
        let request = DriverRequest::ReadImageBlockMetadata {
            image_block_num: params.image_block_num,
            with_thumbnail: params.with_thumbnail,
        };
        let reply = self.call(request, timeout).await?;

        let thumbnail_file = if params.with_thumbnail {
            existing_file(reply.thumbnail_file.as_deref()).await?
        } else {
            None
        };
        let metadata = load_metadata(reply.meta.as_deref()).await?;

        self.apply(&reply);
        Ok(Outcome {
            thumbnail_file,
            metadata,
            ..Default::default()
        })
    }

    async fn release_image_blocks(
        &mut self,
        params: ReleaseImageBlocksParams,
        timeout: Duration,
    ) -> Handled<Outcome> {
        let (first, last) = (params.image_block_num, params.last_image_block_num);
        let request = DriverRequest::ReleaseImageBlocks {
            image_block_num: first,
            last_image_block_num: last,
        };
        let reply = self.call(request, timeout).await?;

        let closed = if reply.session.is_some() {
            self.apply(&reply)
        } else {
            let remaining: Vec<u64> = self
                .session
                .image_blocks()
                .iter()
                .copied()
                .filter(|block| *block < first || *block > last)
                .collect();
            let end_of_job = reply.end_of_job.unwrap_or(self.session.end_of_job());
            let full = self.session.state() == SessionState::Full;
            self.session.update_image_blocks(remaining, end_of_job, full)
        };

        if closed {
            self.shutdown_driver().await;
        }
        Ok(Outcome::default())
    }

    async fn close_session(&mut self, timeout: Duration) -> Handled<Outcome> {
        match self.call_or_lose(DriverRequest::CloseSession, timeout).await? {
            Some(reply) => {
                self.apply(&reply);
            }
            None => self.drop_image_blocks(),
        }
        self.session.close()?;

        if self.session.state() == SessionState::Closed {
            self.shutdown_driver().await;
        }
        Ok(Outcome::default())
    }
}
