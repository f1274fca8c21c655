//! # twainlocal-core
//!
//! Core protocol implementation for TWAIN Local scanners.
//!
//! This crate provides the protocol primitives shared by both roles:
//! - Session state machine and revision tracking
//! - Command method definitions
//! - Wire envelopes for requests and replies
//! - Multipart reply encoding/decoding
//! - X-Privet-Token generation
//! - Messages exchanged with the scanner driver process

pub mod constants;
pub mod envelope;
pub mod error;
pub mod ipc;
pub mod method;
pub mod multipart;
pub mod session;
pub mod token;

pub use envelope::{CommandReply, CommandRequest, CommandResults, InfoReply, SessionEvent, SessionObject};
pub use error::{Error, ErrorCode, Result};
pub use method::Method;
pub use multipart::{MultipartEvent, MultipartReader, PartKind};
pub use session::{Session, SessionState};
pub use token::PrivetTokenStore;

/// Protocol version reported by `/privet/info`
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default device port
pub const DEFAULT_PORT: u16 = 55555;
