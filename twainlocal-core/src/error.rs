//! Error types for twainlocal-core

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Result type alias for twainlocal operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core protocol errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Body is not valid JSON
    #[error("Invalid JSON at character {offset}: {message}")]
    InvalidJson {
        offset: u64,
        message: String,
    },

    /// JSON is well formed but does not fit the expected shape
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Unknown command method
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Unknown wire state name
    #[error("Unknown session state: {0}")]
    UnknownState(String),

    /// Malformed multipart body
    #[error("Multipart error: {0}")]
    Multipart(String),

    /// Value could not be encoded as JSON
    #[error("JSON encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an [`Error::InvalidJson`] from a serde_json failure on `text`
    pub fn from_json(text: &str, err: &serde_json::Error) -> Self {
        Self::InvalidJson {
            offset: character_offset(text, err.line(), err.column()),
            message: err.to_string(),
        }
    }

    /// Character offset for `invalidJson` replies, 0 when not applicable
    pub fn character_offset(&self) -> u64 {
        match self {
            Self::InvalidJson { offset, .. } => *offset,
            _ => 0,
        }
    }
}

/// Convert serde_json's 1-based line/column into a 0-based character offset
pub fn character_offset(text: &str, line: usize, column: usize) -> u64 {
    if line == 0 {
        return 0;
    }

    let mut offset = 0usize;
    for (index, current) in text.split('\n').enumerate() {
        if index + 1 == line {
            let column = column.saturating_sub(1);
            offset += current
                .char_indices()
                .take_while(|(byte, _)| *byte < column)
                .count();
            return offset as u64;
        }
        offset += current.chars().count() + 1;
    }

    offset as u64
}

/// Protocol error codes carried in `results.code`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidPrivetToken,
    InvalidJson,
    InvalidSessionId,
    NotReady,
    NotCapturing,
    NewSessionNotAllowed,
    ClosedSession,
    InvalidCapturingOptions,
    InvalidTwainDirectTask,
    AccessDenied,
    CommunicationError,
    InvalidResponse,
    Timeout,
    Critical,
    /// Any other code reported by a driver or device
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidPrivetToken => "invalid_x_privet_token",
            Self::InvalidJson => "invalidJson",
            Self::InvalidSessionId => "invalidSessionId",
            Self::NotReady => "notReady",
            Self::NotCapturing => "notCapturing",
            Self::NewSessionNotAllowed => "newSessionNotAllowed",
            Self::ClosedSession => "closedSession",
            Self::InvalidCapturingOptions => "invalidCapturingOptions",
            Self::InvalidTwainDirectTask => "invalidTwainDirectTask",
            Self::AccessDenied => "accessDenied",
            Self::CommunicationError => "communicationError",
            Self::InvalidResponse => "invalidResponse",
            Self::Timeout => "timeout",
            Self::Critical => "critical",
            Self::Other(code) => code,
        }
    }

    /// Codes after which a client must drop its session
    pub fn resets_session(&self) -> bool {
        matches!(self, Self::InvalidSessionId | Self::Critical)
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "invalid_x_privet_token" => Self::InvalidPrivetToken,
            "invalidJson" => Self::InvalidJson,
            "invalidSessionId" => Self::InvalidSessionId,
            "notReady" => Self::NotReady,
            "notCapturing" => Self::NotCapturing,
            "newSessionNotAllowed" => Self::NewSessionNotAllowed,
            "closedSession" => Self::ClosedSession,
            "invalidCapturingOptions" => Self::InvalidCapturingOptions,
            "invalidTwainDirectTask" => Self::InvalidTwainDirectTask,
            "accessDenied" => Self::AccessDenied,
            "communicationError" => Self::CommunicationError,
            "invalidResponse" => Self::InvalidResponse,
            "timeout" => Self::Timeout,
            "critical" => Self::Critical,
            other => Self::Other(other.to_string()),
        }
    }
}

impl FromStr for ErrorCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(Self::from(code.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_code_round_trip_names() {
        for code in [
            ErrorCode::InvalidPrivetToken,
            ErrorCode::InvalidSessionId,
            ErrorCode::NewSessionNotAllowed,
            ErrorCode::InvalidTwainDirectTask,
        ] {
            assert_eq!(ErrorCode::from(code.as_str()), code);
        }
        assert_eq!(
            ErrorCode::from("paperJam"),
            ErrorCode::Other("paperJam".into())
        );
    }

    #[test]
    fn test_resets_session() {
        assert!(ErrorCode::Critical.resets_session());
        assert!(ErrorCode::InvalidSessionId.resets_session());
        assert!(!ErrorCode::NotReady.resets_session());
    }

    #[test]
    fn test_character_offset_multiline() {
        let text = "{\n  \"a\": ,\n}";
        let err = serde_json::from_str::<serde_json::Value>(text).unwrap_err();
        let offset = Error::from_json(text, &err).character_offset();
        assert_eq!(&text[offset as usize..offset as usize + 1], ",");
    }

    #[test]
    fn test_character_offset_first_line() {
        assert_eq!(character_offset("abc", 1, 3), 2);
        assert_eq!(character_offset("abc", 0, 0), 0);
    }
}
