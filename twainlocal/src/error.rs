//! High-level error types

use std::time::Duration;

use crate::carrier::CommandCarrier;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Core protocol error: {0}")]
    Core(#[from] twainlocal_core::Error),
    
    #[error("Transport error: {0}")]
    Transport(#[from] twainlocal_transport::Error),
    
    #[error("Type error: {0}")]
    Types(#[from] twainlocal_types::Error),

    /// The device (or a local precheck) rejected the command
    #[error("Command failed: {0}")]
    Command(Box<CommandCarrier>),

    #[error("No image block arrived within {0:?}")]
    EventTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    
    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// The carrier of a failed command, if that is what this is
    pub fn carrier(&self) -> Option<&CommandCarrier> {
        match self {
            Self::Command(carrier) => Some(carrier),
            _ => None,
        }
    }
}
