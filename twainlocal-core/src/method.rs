//! TWAIN Local command methods

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Session commands accepted on `/privet/twaindirect/session`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    CreateSession,
    GetSession,
    SetTwainDirectOptions,
    StartCapturing,
    StopCapturing,
    ReadImageBlock,
    ReadImageBlockMetadata,
    ReleaseImageBlocks,
    CloseSession,
    /// Long poll for session changes
    WaitForEvents,
}

/// Which configured timeout applies to a command
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeoutClass {
    Command,
    Data,
    Event,
}

impl Method {
    pub const ALL: [Method; 10] = [
        Self::CreateSession,
        Self::GetSession,
        Self::SetTwainDirectOptions,
        Self::StartCapturing,
        Self::StopCapturing,
        Self::ReadImageBlock,
        Self::ReadImageBlockMetadata,
        Self::ReleaseImageBlocks,
        Self::CloseSession,
        Self::WaitForEvents,
    ];

    /// Get method name as it appears on the wire
    pub fn name(self) -> &'static str {
        match self {
            Self::CreateSession => "createSession",
            Self::GetSession => "getSession",
            Self::SetTwainDirectOptions => "setTwainDirectOptions",
            Self::StartCapturing => "startCapturing",
            Self::StopCapturing => "stopCapturing",
            Self::ReadImageBlock => "readImageBlock",
            Self::ReadImageBlockMetadata => "readImageBlockMetadata",
            Self::ReleaseImageBlocks => "releaseImageBlocks",
            Self::CloseSession => "closeSession",
            Self::WaitForEvents => "waitForEvents",
        }
    }

    /// Image transfers get the data timeout, the long poll the event
    /// timeout, everything else the command timeout
    pub fn timeout_class(self) -> TimeoutClass {
        match self {
            Self::ReadImageBlock | Self::ReadImageBlockMetadata => TimeoutClass::Data,
            Self::WaitForEvents => TimeoutClass::Event,
            _ => TimeoutClass::Command,
        }
    }

    /// Whether the command must carry the current `sessionId`
    pub fn requires_session_id(self) -> bool {
        !matches!(self, Self::CreateSession)
    }
}

impl TryFrom<&str> for Method {
    type Error = Error;

    fn try_from(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|method| method.name() == name)
            .ok_or_else(|| Error::UnknownMethod(name.to_string()))
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::try_from(s)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
