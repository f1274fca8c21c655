//! Messages exchanged with the scanner driver process
//!
//! One JSON object per line in each direction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// Request sent to the driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum DriverRequest {
    CreateSession {
        scanner: String,
    },
    GetSession,
    SetTwainDirectOptions {
        task: Value,
    },
    StartCapturing,
    StopCapturing,
    #[serde(rename_all = "camelCase")]
    ReadImageBlock {
        image_block_num: u64,
        with_metadata: bool,
    },
    #[serde(rename_all = "camelCase")]
    ReadImageBlockMetadata {
        image_block_num: u64,
        with_thumbnail: bool,
    },
    #[serde(rename_all = "camelCase")]
    ReleaseImageBlocks {
        image_block_num: u64,
        last_image_block_num: u64,
    },
    CloseSession,
    Exit,
}

/// Block list reported by the driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriverSession {
    pub image_blocks: Vec<u64>,
    /// Driver cannot buffer more blocks until some are released
    pub full: bool,
}

/// Reply read back from the driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriverReply {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<DriverSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_of_job: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_reply: Option<Value>,
    /// Path of a file holding a JSON object of image metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_key: Option<String>,
}

impl DriverReply {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    /// Protocol code for a failed reply
    pub fn error_code(&self) -> ErrorCode {
        match self.status.as_str() {
            "invalidCapturingOptions" => ErrorCode::InvalidTwainDirectTask,
            "" => ErrorCode::CommunicationError,
            other => ErrorCode::from(other),
        }
    }

    /// Block list, or `None` if the driver did not report one
    pub fn image_blocks(&self) -> Option<&[u64]> {
        self.session.as_ref().map(|session| session.image_blocks.as_slice())
    }
}
