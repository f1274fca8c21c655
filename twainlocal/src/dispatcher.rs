//! Routes inbound HTTP exchanges to the device engine

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, info, warn};

use twainlocal_core::constants::{INFO_PATH, SESSION_PATH};
use twainlocal_core::envelope::SessionParams;
use twainlocal_core::{CommandReply, CommandRequest, Method};

use crate::carrier::{CommandCarrier, Reply};
use crate::device::{DeviceScanner, Failure};

/// The parts of an HTTP request the dispatcher looks at
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub path: String,
    pub token: Option<String>,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn new(path: impl Into<String>, token: Option<String>, body: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            token,
            body: body.into(),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    device: Arc<DeviceScanner>,
}

impl Dispatcher {
    pub fn new(device: Arc<DeviceScanner>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<DeviceScanner> {
        &self.device
    }

    /// How long the HTTP layer waits for the reply to `request`
    ///
    /// Session commands get the timeout of their method's class, so image
    /// transfers and the long poll are not cut off at the command timeout.
    pub fn reply_timeout(&self, request: &InboundRequest) -> Duration {
        #[derive(Deserialize)]
        struct MethodOnly {
            #[serde(default)]
            method: String,
        }

        let timeouts = self.device.timeouts();
        if request.path != SESSION_PATH {
            return timeouts.command;
        }
        serde_json::from_slice::<MethodOnly>(&request.body)
            .ok()
            .and_then(|body| Method::try_from(body.method.as_str()).ok())
            .map(|method| timeouts.for_method(method))
            .unwrap_or(timeouts.command)
    }

    /// Handle one exchange, answering through `carrier`
    ///
    /// A request naming an unknown method gets no answer at all: the carrier
    /// is dropped and the requester runs into its timeout.
    pub async fn dispatch(&self, request: InboundRequest, mut carrier: CommandCarrier) {
        match request.path.as_str() {
            INFO_PATH => {
                let info = self.device.info().await;
                let reply = match serde_json::to_string(&info) {
                    Ok(body) => Reply::ok(body),
                    Err(e) => {
                        warn!("Failed to encode info reply: {}", e);
                        Reply::Empty { status: 500 }
                    }
                };
                carrier.respond(reply);
            }
            SESSION_PATH => self.dispatch_session(request, carrier).await,
            other => {
                info!("Unknown URI {}", other);
                carrier.respond(Reply::Empty { status: 404 });
            }
        }
    }

    async fn dispatch_session(&self, request: InboundRequest, mut carrier: CommandCarrier) {
        if !self.device.is_valid_token(request.token.as_deref()) {
            warn!("Rejecting session command with a bad X-Privet-Token");
            carrier.respond(Reply::TokenError);
            return;
        }

        let raw = match std::str::from_utf8(&request.body) {
            Ok(raw) => raw,
            Err(_) => {
                debug!("Command body is not UTF-8");
                respond_failure(&mut carrier, "", "", &Failure::invalid_json(0));
                return;
            }
        };

        let command = match CommandRequest::parse(raw) {
            Ok(command) => command,
            Err(e) => {
                debug!("Unparsable command: {}", e);
                respond_failure(&mut carrier, "", "", &Failure::invalid_json(e.character_offset()));
                return;
            }
        };

        let session_id = command
            .params::<SessionParams>()
            .ok()
            .and_then(|params| params.session_id);
        carrier.set_command(&command.command_id, &command.method, session_id);

        let method = match command.method() {
            Ok(method) => method,
            Err(e) => {
                warn!("Dropping command {}: {}", command.command_id, e);
                return;
            }
        };

        debug!("Dispatching {}", carrier);
        match self.device.execute(method, &command, raw).await {
            Ok(outcome) => {
                let mut reply = CommandReply::success(&command.command_id, method, outcome.session)
                    .with_metadata(outcome.metadata);
                if let Some(events) = outcome.events {
                    reply = reply.with_events(events);
                }
                let json = match serde_json::to_string(&reply) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode reply for {}: {}", carrier, e);
                        carrier.respond(Reply::Empty { status: 500 });
                        return;
                    }
                };

                let reply = if outcome.image_file.is_some() || outcome.thumbnail_file.is_some() {
                    if let Some(path) = &outcome.image_file {
                        carrier.set_image_file(path.clone());
                    }
                    if let Some(path) = &outcome.thumbnail_file {
                        carrier.set_thumbnail_file(path.clone());
                    }
                    Reply::Multipart {
                        json,
                        thumbnail: outcome.thumbnail_file,
                        image: outcome.image_file,
                    }
                } else {
                    Reply::ok(json)
                };
                carrier.respond(reply);
            }
            Err(failure) => {
                let (id, method) = (command.command_id.clone(), command.method.clone());
                respond_failure(&mut carrier, &id, &method, &failure);
            }
        }
    }
}

fn respond_failure(carrier: &mut CommandCarrier, command_id: &str, method: &str, failure: &Failure) {
    let mut reply = CommandReply::failure(command_id, method, failure.code.clone());
    if let Some(offset) = failure.character_offset {
        reply = reply.with_character_offset(offset);
        carrier.set_json_error_offset(offset);
    }
    if let Some(key) = &failure.json_key {
        reply = reply.with_json_key(key.clone());
    }

    match serde_json::to_string(&reply) {
        Ok(body) => {
            info!("{} failed: {}", if method.is_empty() { "command" } else { method }, failure.code);
            carrier.respond(Reply::ok(body));
        }
        Err(e) => {
            warn!("Failed to encode failure reply: {}", e);
            carrier.respond(Reply::Empty { status: 500 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tokio::sync::oneshot;

    use twainlocal_core::Method;
    use twainlocal_types::DeviceRegister;

    use crate::device::tests::FakeDriver;

    async fn exchange(dispatcher: &Dispatcher, request: InboundRequest) -> Option<Reply> {
        let (tx, rx) = oneshot::channel();
        dispatcher.dispatch(request, CommandCarrier::inbound(tx)).await;
        rx.await.ok()
    }

    async fn token(dispatcher: &Dispatcher) -> String {
        dispatcher.device().info().await.x_privet_token
    }

    fn body(reply: Reply) -> (u16, Value) {
        match reply {
            Reply::Json { status, body } => (status, serde_json::from_str(&body).unwrap()),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(DeviceScanner::new(
            FakeDriver::default(),
            DeviceRegister::new(),
        )))
    }

    #[tokio::test]
    async fn test_info_and_unknown_uri() {
        let dispatcher = dispatcher();

        let reply = exchange(&dispatcher, InboundRequest::new(INFO_PATH, None, "")).await;
        let (status, info) = body(reply.unwrap());
        assert_eq!(status, 200);
        assert_eq!(info["type"], "twaindirect");
        assert!(info["x-privet-token"].as_str().is_some_and(|t| !t.is_empty()));

        let reply = exchange(&dispatcher, InboundRequest::new("/privet/other", None, "")).await;
        assert_eq!(reply, Some(Reply::Empty { status: 404 }));
    }

    #[tokio::test]
    async fn test_bad_token() {
        let dispatcher = dispatcher();
        let command = CommandRequest::new("1", Method::CreateSession, Value::Null);
        let request = InboundRequest::new(SESSION_PATH, Some("stale".into()), command.to_json().unwrap());

        assert_eq!(exchange(&dispatcher, request).await, Some(Reply::TokenError));
    }

    #[tokio::test]
    async fn test_invalid_json_reports_offset() {
        let dispatcher = dispatcher();
        let token = token(&dispatcher).await;

        let request = InboundRequest::new(SESSION_PATH, Some(token), "{\"kind\": }");
        let (status, reply) = body(exchange(&dispatcher, request).await.unwrap());
        assert_eq!(status, 200);
        assert_eq!(reply["results"]["success"], false);
        assert_eq!(reply["results"]["code"], "invalidJson");
        assert_eq!(reply["results"]["characterOffset"], 9);
    }

    #[tokio::test]
    async fn test_create_session_reply() {
        let dispatcher = dispatcher();
        let token = token(&dispatcher).await;
        let command = CommandRequest::new("42", Method::CreateSession, Value::Null);

        let request = InboundRequest::new(SESSION_PATH, Some(token), command.to_json().unwrap());
        let (_, reply) = body(exchange(&dispatcher, request).await.unwrap());
        assert_eq!(reply["commandId"], "42");
        assert_eq!(reply["method"], "createSession");
        assert_eq!(reply["results"]["success"], true);
        assert_eq!(reply["results"]["session"]["state"], "ready");
        assert_eq!(reply["results"]["session"]["revision"], 1);
    }

    #[tokio::test]
    async fn test_state_failure_reply() {
        let dispatcher = dispatcher();
        let token = token(&dispatcher).await;
        let command = CommandRequest::new("7", Method::StopCapturing, json!({"sessionId": "x"}));

        let request = InboundRequest::new(SESSION_PATH, Some(token), command.to_json().unwrap());
        let (status, reply) = body(exchange(&dispatcher, request).await.unwrap());
        assert_eq!(status, 200);
        assert_eq!(reply["commandId"], "7");
        assert_eq!(reply["results"]["code"], "closedSession");
        assert!(reply["results"].get("session").is_none());
    }

    #[test]
    fn test_reply_timeout_follows_method_class() {
        let dispatcher = dispatcher();
        let timeouts = dispatcher.device().timeouts();
        let session = |method: &str| {
            let body = json!({"kind": "twainlocalscanner", "commandId": "1", "method": method});
            InboundRequest::new(SESSION_PATH, None, body.to_string())
        };

        assert_eq!(dispatcher.reply_timeout(&session("readImageBlock")), timeouts.data);
        assert_eq!(dispatcher.reply_timeout(&session("readImageBlockMetadata")), timeouts.data);
        assert_eq!(dispatcher.reply_timeout(&session("waitForEvents")), timeouts.event);
        assert_eq!(dispatcher.reply_timeout(&session("getSession")), timeouts.command);
        assert_eq!(dispatcher.reply_timeout(&session("makeCoffee")), timeouts.command);
        assert_eq!(
            dispatcher.reply_timeout(&InboundRequest::new(SESSION_PATH, None, "{bad")),
            timeouts.command
        );
        assert_eq!(
            dispatcher.reply_timeout(&InboundRequest::new(INFO_PATH, None, "")),
            timeouts.command
        );
    }

    #[tokio::test]
    async fn test_wait_for_events_reply_carries_events() {
        let dispatcher = dispatcher();
        let token = token(&dispatcher).await;

        let command = CommandRequest::new("1", Method::CreateSession, Value::Null);
        let request = InboundRequest::new(SESSION_PATH, Some(token.clone()), command.to_json().unwrap());
        let (_, created) = body(exchange(&dispatcher, request).await.unwrap());
        let id = created["results"]["session"]["sessionId"].clone();

        let command = CommandRequest::new(
            "2",
            Method::WaitForEvents,
            json!({"sessionId": id, "sessionRevision": 0}),
        );
        let request = InboundRequest::new(SESSION_PATH, Some(token), command.to_json().unwrap());
        let (status, reply) = body(exchange(&dispatcher, request).await.unwrap());
        assert_eq!(status, 200);
        assert_eq!(reply["method"], "waitForEvents");
        assert_eq!(reply["results"]["success"], true);
        assert_eq!(reply["results"]["events"][0]["event"], "imageBlocks");
        assert_eq!(reply["results"]["events"][0]["session"]["revision"], 1);
        assert_eq!(reply["results"]["events"][0]["session"]["state"], "ready");
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_answered() {
        let dispatcher = dispatcher();
        let token = token(&dispatcher).await;
        let body = json!({
            "kind": "twainlocalscanner",
            "commandId": "9",
            "method": "makeCoffee",
            "params": {}
        });

        let request = InboundRequest::new(SESSION_PATH, Some(token), body.to_string());
        assert_eq!(exchange(&dispatcher, request).await, None);
    }
}
