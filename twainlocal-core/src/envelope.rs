//! Wire envelopes
//!
//! Requests are decoded in two steps: the envelope first, so the method
//! can be routed, then the method specific `params` into a typed struct.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::KIND;
use crate::error::{Error, ErrorCode, Result};
use crate::method::Method;

/// Command request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub command_id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl CommandRequest {
    pub fn new(command_id: impl Into<String>, method: Method, params: Value) -> Self {
        Self {
            kind: KIND.to_string(),
            command_id: command_id.into(),
            method: method.name().to_string(),
            params,
        }
    }

    /// Parse a request body, reporting the failing character on bad JSON
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::from_json(text, &e))
    }

    pub fn method(&self) -> Result<Method> {
        Method::try_from(self.method.as_str())
    }

    /// Decode `params` into the typed form for this method
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        let params = match &self.params {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };
        serde_json::from_value(params).map_err(|e| Error::InvalidParams(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Params of commands that only carry the session id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadImageBlockParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub image_block_num: u64,
    #[serde(default)]
    pub with_metadata: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadImageBlockMetadataParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub image_block_num: u64,
    #[serde(default)]
    pub with_thumbnail: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseImageBlocksParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub image_block_num: u64,
    pub last_image_block_num: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTwainDirectOptionsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Value>,
}

/// Params of `waitForEvents`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForEventsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Highest revision the client has already seen
    #[serde(default)]
    pub session_revision: u64,
}

/// Session object embedded in `results.session`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionObject {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub state: String,
    /// Absent once the job is drained, `[]` while more blocks may arrive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_blocks: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Value>,
}

/// Event names carried in `results.events`
pub const EVENT_IMAGE_BLOCKS: &str = "imageBlocks";
pub const EVENT_SESSION_TIMED_OUT: &str = "sessionTimedOut";

/// One entry of `results.events`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub session: SessionObject,
}

/// Keys of `results` that driver metadata may not overwrite
pub const RESERVED_RESULT_KEYS: [&str; 6] = [
    "success",
    "code",
    "characterOffset",
    "jsonKey",
    "session",
    "events",
];

/// `results` member of a reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResults {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionObject>,
    /// Pending session events, `waitForEvents` only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<SessionEvent>>,
    /// Image metadata members reported by the driver
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Command reply body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub command_id: String,
    #[serde(default)]
    pub method: String,
    pub results: CommandResults,
}

impl CommandReply {
    pub fn success(command_id: impl Into<String>, method: Method, session: SessionObject) -> Self {
        Self {
            kind: KIND.to_string(),
            command_id: command_id.into(),
            method: method.name().to_string(),
            results: CommandResults {
                success: true,
                session: Some(session),
                ..Default::default()
            },
        }
    }

    pub fn failure(command_id: impl Into<String>, method: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            kind: KIND.to_string(),
            command_id: command_id.into(),
            method: method.into(),
            results: CommandResults {
                success: false,
                code: Some(code),
                ..Default::default()
            },
        }
    }

    pub fn with_character_offset(mut self, offset: u64) -> Self {
        self.results.character_offset = Some(offset);
        self
    }

    pub fn with_json_key(mut self, key: impl Into<String>) -> Self {
        self.results.json_key = Some(key.into());
        self
    }

    /// Merge driver metadata into `results`, skipping reserved keys
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.results.metadata.extend(
            metadata
                .into_iter()
                .filter(|(key, _)| !RESERVED_RESULT_KEYS.contains(&key.as_str())),
        );
        self
    }

    pub fn with_events(mut self, events: Vec<SessionEvent>) -> Self {
        self.results.events = Some(events);
        self
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::from_json(text, &e))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `/privet/info` reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoReply {
    pub version: String,
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub id: String,
    pub device_state: String,
    pub connection_state: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware: String,
    pub uptime: u64,
    pub setup_url: String,
    pub support_url: String,
    pub update_url: String,
    #[serde(rename = "x-privet-token")]
    pub x_privet_token: String,
    pub api: Vec<String>,
    pub semantic_state: String,
}

/// Body of the HTTP 400 sent for a bad `X-Privet-Token`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivetError {
    pub error: String,
    pub description: String,
}

impl PrivetError {
    pub fn invalid_token() -> Self {
        Self {
            error: ErrorCode::InvalidPrivetToken.as_str().to_string(),
            description: "X-Privet-Token missing or invalid...".to_string(),
        }
    }
}
