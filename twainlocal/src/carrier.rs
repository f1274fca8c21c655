//! Command carrier
//!
//! One carrier exists per command, from issue (client) or arrival (device)
//! until its reply has been consumed or sent. A device side carrier owns
//! the reply channel of the HTTP exchange it arrived on and may use it once.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::{StreamExt, stream};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use twainlocal_core::constants::{CONTENT_TYPE_JSON, IMAGE_CHUNK_SIZE, NON_HTTP_STATUS};
use twainlocal_core::envelope::PrivetError;
use twainlocal_core::multipart::{self, PART_TRAILER, PartKind};
use twainlocal_core::{CommandReply, ErrorCode, Method};
use twainlocal_transport::BodyStream;

static COMMAND_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Make a command id of the form `pid-thread-ticks-counter`
pub fn make_command_id() -> String {
    let thread: String = format!("{:?}", std::thread::current().id())
        .chars()
        .filter(char::is_ascii_digit)
        .collect();

    format!(
        "{}-{}-{}-{}",
        std::process::id(),
        thread,
        chrono::Utc::now().timestamp_millis(),
        COMMAND_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Reply sent back over an inbound exchange
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Plain JSON body
    Json { status: u16, body: String },
    /// JSON plus optional thumbnail and image files
    Multipart {
        json: String,
        thumbnail: Option<PathBuf>,
        image: Option<PathBuf>,
    },
    /// HTTP 400 for a missing or stale `X-Privet-Token`
    TokenError,
    /// Status only, empty body
    Empty { status: u16 },
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::Json {
            status: 200,
            body: body.into(),
        }
    }

    /// Status, content type and streamed body for the HTTP layer
    pub async fn into_parts(self) -> (u16, String, BodyStream) {
        match self {
            Self::Json { status, body } => (status, CONTENT_TYPE_JSON.to_string(), once(body)),
            Self::Empty { status } => (status, CONTENT_TYPE_JSON.to_string(), once(Bytes::new())),
            Self::TokenError => {
                let error = PrivetError::invalid_token();
                let body = serde_json::json!({
                    "error": error.error,
                    "description": error.description,
                });
                (400, CONTENT_TYPE_JSON.to_string(), once(body.to_string()))
            }
            Self::Multipart {
                json,
                thumbnail,
                image,
            } => {
                // a file named in the reply that cannot be opened turns the
                // whole reply into a failure
                let (thumbnail, image) = match (
                    open_part(thumbnail.as_deref()).await,
                    open_part(image.as_deref()).await,
                ) {
                    (Ok(thumbnail), Ok(image)) => (thumbnail, image),
                    _ => return access_denied(&json),
                };

                if thumbnail.is_none() && image.is_none() {
                    return (200, CONTENT_TYPE_JSON.to_string(), once(json));
                }

                let mut parts = vec![once(multipart::json_part(&json))];
                if let Some((file, length)) = thumbnail {
                    parts.push(file_part(PartKind::Thumbnail, file, length));
                }
                if let Some((file, length)) = image {
                    parts.push(file_part(PartKind::Image, file, length));
                }
                parts.push(once(multipart::closing_boundary()));

                let body: BodyStream = Box::pin(stream::iter(parts).flatten());
                (200, multipart::content_type(), body)
            }
        }
    }
}

fn once(bytes: impl Into<Bytes>) -> BodyStream {
    Box::pin(stream::iter([Ok::<Bytes, twainlocal_transport::Error>(bytes.into())]))
}

async fn open_part(path: Option<&Path>) -> std::io::Result<Option<(tokio::fs::File, u64)>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let opened = async {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        Ok::<_, std::io::Error>((file, length))
    };
    match opened.await {
        Ok(part) => Ok(Some(part)),
        Err(e) => {
            error!("Failed to open {}: {}", path.display(), e);
            Err(e)
        }
    }
}

/// `accessDenied` envelope answering the command of `json`
fn access_denied(json: &str) -> (u16, String, BodyStream) {
    let body = CommandReply::parse(json)
        .map(|reply| CommandReply::failure(reply.command_id, reply.method, ErrorCode::AccessDenied))
        .and_then(|reply| reply.to_json());
    match body {
        Ok(body) => (200, CONTENT_TYPE_JSON.to_string(), once(body)),
        Err(e) => {
            error!("Failed to build accessDenied reply: {}", e);
            (500, CONTENT_TYPE_JSON.to_string(), once(Bytes::new()))
        }
    }
}

fn file_part(kind: PartKind, file: tokio::fs::File, length: u64) -> BodyStream {
    let payload = ReaderStream::with_capacity(file.take(length), IMAGE_CHUNK_SIZE)
        .map(|chunk| chunk.map_err(twainlocal_transport::Error::from));

    Box::pin(
        once(multipart::binary_part_header(kind, length))
            .chain(payload)
            .chain(once(PART_TRAILER)),
    )
}

#[derive(Debug)]
enum Origin {
    /// Client role: nothing to answer
    Initiator,
    /// Device role: reply channel, taken on first use
    Inbound(Option<oneshot::Sender<Reply>>),
}

/// One command/response pair
#[derive(Debug)]
pub struct CommandCarrier {
    command_id: String,
    method: String,
    session_id: Option<String>,
    origin: Origin,
    success: bool,
    http_status: u32,
    response_code: Option<ErrorCode>,
    response_text: String,
    json_error_offset: i64,
    image_file: Option<PathBuf>,
    thumbnail_file: Option<PathBuf>,
    end_of_job: bool,
    response: Option<CommandReply>,
}

impl CommandCarrier {
    fn new(command_id: String, method: String, origin: Origin) -> Self {
        Self {
            command_id,
            method,
            session_id: None,
            origin,
            success: false,
            http_status: 0,
            response_code: None,
            response_text: String::new(),
            json_error_offset: -1,
            image_file: None,
            thumbnail_file: None,
            end_of_job: false,
            response: None,
        }
    }

    /// Carrier for a command this process issues
    pub fn initiator(method: Method) -> Self {
        Self::new(make_command_id(), method.name().to_string(), Origin::Initiator)
    }

    /// Carrier for a command that arrived with a reply channel
    pub fn inbound(reply: oneshot::Sender<Reply>) -> Self {
        Self::new(String::new(), String::new(), Origin::Inbound(Some(reply)))
    }

    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Session id the command was issued against
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// HTTP status, or [`NON_HTTP_STATUS`] for failures that never hit the wire
    pub fn http_status(&self) -> u32 {
        self.http_status
    }

    pub fn response_code(&self) -> Option<&ErrorCode> {
        self.response_code.as_ref()
    }

    pub fn response_text(&self) -> &str {
        &self.response_text
    }

    /// Offset of a JSON syntax error, -1 when not applicable
    pub fn json_error_offset(&self) -> i64 {
        self.json_error_offset
    }

    pub fn image_file(&self) -> Option<&Path> {
        self.image_file.as_deref()
    }

    pub fn thumbnail_file(&self) -> Option<&Path> {
        self.thumbnail_file.as_deref()
    }

    pub fn end_of_job(&self) -> bool {
        self.end_of_job
    }

    /// Parsed reply, when one was received
    pub fn response(&self) -> Option<&CommandReply> {
        self.response.as_ref()
    }

    pub fn is_inbound(&self) -> bool {
        matches!(self.origin, Origin::Inbound(_))
    }

    pub(crate) fn set_command(&mut self, command_id: &str, method: &str, session_id: Option<String>) {
        self.command_id = command_id.to_string();
        self.method = method.to_string();
        self.session_id = session_id;
    }

    pub(crate) fn set_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    pub(crate) fn set_image_file(&mut self, path: PathBuf) {
        self.image_file = Some(path);
    }

    pub(crate) fn set_thumbnail_file(&mut self, path: PathBuf) {
        self.thumbnail_file = Some(path);
    }

    pub(crate) fn set_end_of_job(&mut self, end_of_job: bool) {
        self.end_of_job = end_of_job;
    }

    /// Record a failure detected before or instead of an HTTP exchange
    pub(crate) fn fail_local(&mut self, code: ErrorCode, text: impl Into<String>) {
        self.success = false;
        self.http_status = NON_HTTP_STATUS;
        self.response_code = Some(code);
        self.response_text = text.into();
    }

    /// Record a failure that came back over HTTP
    pub(crate) fn fail_http(&mut self, status: u16, code: ErrorCode, text: impl Into<String>) {
        self.success = false;
        self.http_status = u32::from(status);
        self.response_code = Some(code);
        self.response_text = text.into();
    }

    pub(crate) fn set_json_error_offset(&mut self, offset: u64) {
        self.json_error_offset = offset as i64;
    }

    /// Record a parsed reply envelope
    pub(crate) fn record_reply(&mut self, status: u16, text: String, reply: CommandReply) {
        self.http_status = u32::from(status);
        self.success = reply.results.success;
        self.response_code = reply.results.code.clone();
        if let Some(offset) = reply.results.character_offset {
            self.json_error_offset = offset as i64;
        }
        self.response_text = text;
        self.response = Some(reply);
    }

    /// Send the reply for an inbound command
    ///
    /// Returns `false` (and logs) when the channel was already used or this
    /// carrier has no channel at all.
    pub fn respond(&mut self, reply: Reply) -> bool {
        match &mut self.origin {
            Origin::Initiator => {
                error!("Command {} was issued locally, there is nobody to answer", self.command_id);
                false
            }
            Origin::Inbound(channel) => match channel.take() {
                Some(sender) => {
                    if sender.send(reply).is_err() {
                        warn!("Command {}: requester went away before the reply", self.command_id);
                    }
                    true
                }
                None => {
                    error!("Command {}: second attempt to respond, ignored", self.command_id);
                    false
                }
            },
        }
    }
}

impl fmt::Display for CommandCarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.method, self.command_id)?;
        match &self.response_code {
            Some(code) => write!(f, " -> {} (HTTP {})", code, self.http_status),
            None if self.success => write!(f, " -> success"),
            None => write!(f, " -> failed (HTTP {})", self.http_status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use twainlocal_core::multipart::{MultipartEvent, MultipartReader};
    use twainlocal_core::constants::MULTIPART_BOUNDARY;

    async fn collect(body: BodyStream) -> Vec<u8> {
        body.map(|chunk| chunk.unwrap().to_vec())
            .concat()
            .await
    }

    #[test]
    fn test_command_ids_unique() {
        let first = make_command_id();
        let second = make_command_id();
        assert_ne!(first, second);
        assert_eq!(first.split('-').count(), 4);
    }

    #[test]
    fn test_respond_only_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut carrier = CommandCarrier::inbound(tx);

        assert!(carrier.respond(Reply::ok("{}")));
        assert!(!carrier.respond(Reply::ok("{\"again\":true}")));
        assert_eq!(rx.try_recv().unwrap(), Reply::ok("{}"));
    }

    #[test]
    fn test_initiator_cannot_respond() {
        let mut carrier = CommandCarrier::initiator(Method::GetSession);
        assert!(!carrier.is_inbound());
        assert!(!carrier.respond(Reply::ok("{}")));
    }

    #[test]
    fn test_fail_local_uses_non_http_status() {
        let mut carrier = CommandCarrier::initiator(Method::StartCapturing);
        carrier.fail_local(ErrorCode::NotReady, "capturing already");
        assert_eq!(carrier.http_status(), NON_HTTP_STATUS);
        assert_eq!(carrier.response_code(), Some(&ErrorCode::NotReady));
        assert_eq!(carrier.json_error_offset(), -1);
        assert_eq!(carrier.to_string(), format!("startCapturing [{}] -> notReady (HTTP 999999999)", carrier.command_id()));
    }

    #[tokio::test]
    async fn test_token_error_reply() {
        let (status, content_type, body) = Reply::TokenError.into_parts().await;
        assert_eq!(status, 400);
        assert_eq!(content_type, CONTENT_TYPE_JSON);
        let value: serde_json::Value = serde_json::from_slice(&collect(body).await).unwrap();
        assert_eq!(value["error"], "invalid_x_privet_token");
    }

    #[tokio::test]
    async fn test_multipart_reply_streams_files() {
        let dir = tempfile::tempdir().unwrap();
        let thumbnail = dir.path().join("thumb.pdf");
        let image = dir.path().join("image.pdf");
        let image_bytes: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&thumbnail, b"thumb\r\n--").unwrap();
        std::fs::write(&image, &image_bytes).unwrap();

        let json = r#"{"kind":"twainlocalscanner"}"#.to_string();
        let reply = Reply::Multipart {
            json: json.clone(),
            thumbnail: Some(thumbnail),
            image: Some(image),
        };
        let (status, content_type, body) = reply.into_parts().await;
        assert_eq!(status, 200);
        assert_eq!(
            multipart::boundary_of(&content_type).as_deref(),
            Some(MULTIPART_BOUNDARY)
        );

        let body = collect(body).await;
        let mut reader = MultipartReader::new(MULTIPART_BOUNDARY);
        let mut events = reader.feed(&body).unwrap();
        events.extend(reader.finish().unwrap());

        let mut decoded_image = Vec::new();
        let mut decoded_thumbnail = Vec::new();
        let mut decoded_json = None;
        for event in events {
            match event {
                MultipartEvent::Json(text) => decoded_json = Some(text),
                MultipartEvent::Data(PartKind::Image, data) => decoded_image.extend_from_slice(&data),
                MultipartEvent::Data(PartKind::Thumbnail, data) => decoded_thumbnail.extend_from_slice(&data),
                _ => {}
            }
        }
        assert_eq!(decoded_json, Some(json));
        assert_eq!(decoded_thumbnail, b"thumb\r\n--".to_vec());
        assert_eq!(decoded_image, image_bytes);
    }

    #[tokio::test]
    async fn test_multipart_without_files_is_plain_json() {
        let reply = Reply::Multipart {
            json: "{}".into(),
            thumbnail: None,
            image: None,
        };
        let (status, content_type, body) = reply.into_parts().await;
        assert_eq!(status, 200);
        assert_eq!(content_type, CONTENT_TYPE_JSON);
        assert_eq!(collect(body).await, b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_unreadable_image_becomes_access_denied() {
        let dir = tempfile::tempdir().unwrap();
        let thumbnail = dir.path().join("thumb.pdf");
        std::fs::write(&thumbnail, b"thumb").unwrap();

        let json = CommandReply::success("12", Method::ReadImageBlock, Default::default())
            .to_json()
            .unwrap();
        let reply = Reply::Multipart {
            json,
            thumbnail: Some(thumbnail),
            image: Some(dir.path().join("vanished.pdf")),
        };
        let (status, content_type, body) = reply.into_parts().await;
        assert_eq!(status, 200);
        assert_eq!(content_type, CONTENT_TYPE_JSON);

        let reply = CommandReply::parse(&String::from_utf8(collect(body).await).unwrap()).unwrap();
        assert_eq!(reply.command_id, "12");
        assert_eq!(reply.method, "readImageBlock");
        assert!(!reply.results.success);
        assert_eq!(reply.results.code, Some(ErrorCode::AccessDenied));
        assert_eq!(reply.results.session, None);
    }
}
