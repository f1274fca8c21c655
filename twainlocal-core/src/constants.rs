//! Protocol constants

use std::time::Duration;

/// `kind` member of every command envelope
pub const KIND: &str = "twainlocalscanner";

/// Device information endpoint
pub const INFO_PATH: &str = "/privet/info";

/// Session command endpoint
pub const SESSION_PATH: &str = "/privet/twaindirect/session";

/// Security token header
pub const PRIVET_TOKEN_HEADER: &str = "X-Privet-Token";

/// Content type of JSON bodies
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=UTF-8";

/// Content type of binary image parts
pub const CONTENT_TYPE_PDF: &str = "application/pdf";

/// Fixed boundary for multipart replies
pub const MULTIPART_BOUNDARY: &str = "WaFfLeSaReTaStY";

/// Image files are streamed in chunks of this size
pub const IMAGE_CHUNK_SIZE: usize = 0x200000;

/// Reported in the HTTP status slot when a failure never reached the wire
pub const NON_HTTP_STATUS: u32 = 999_999_999;

/// HTTP statuses worth another attempt
pub const RETRYABLE_STATUSES: [u16; 6] = [500, 502, 503, 504, 598, 599];

/// Sleep between attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 1;

/// Timeout for ordinary commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Timeout for commands that move image data
pub const DEFAULT_DATA_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Timeout for waiting on session events
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// An untouched session is dropped after this long
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Configured session timeouts below this fall back to the default
pub const MIN_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Session events kept for `waitForEvents` until acknowledged
pub const MAX_PENDING_EVENTS: usize = 64;

/// A token is only rotated once it is older than this
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(120);

/// Interval between getSession polls in the scan loop
pub const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(100);
