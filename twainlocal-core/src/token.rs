//! X-Privet-Token generation
//!
//! The token is `base64(SHA1(seed ":" ticks)) ":" ticks`, where `seed` is
//! random per token and `ticks` is the issue time in milliseconds.

use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::constants::TOKEN_LIFETIME;

/// Create a privet token from a seed and a tick count
///
/// # Examples
///
/// ```
/// use twainlocal_core::token::make_privet_token;
///
/// let token = make_privet_token("seed", 1234);
/// assert!(token.ends_with(":1234"));
/// ```
pub fn make_privet_token(seed: &str, ticks: i64) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{}:{}", seed, ticks).as_bytes());
    let digest = hasher.finalize();

    format!("{}:{}", STANDARD.encode(digest), ticks)
}

fn random_token() -> String {
    let seed: u128 = rand::thread_rng().r#gen();
    make_privet_token(&format!("{:032x}", seed), chrono::Utc::now().timestamp_millis())
}

#[derive(Debug)]
struct TokenInner {
    token: String,
    issued: Option<Instant>,
}

/// Current device token plus the time it was last handed out
#[derive(Debug)]
pub struct PrivetTokenStore {
    inner: Mutex<TokenInner>,
    lifetime: Duration,
}

impl PrivetTokenStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TokenInner {
                token: random_token(),
                issued: None,
            }),
            lifetime: TOKEN_LIFETIME,
        }
    }

    /// Set how long a token survives between `/privet/info` calls
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn current(&self) -> String {
        self.inner.lock().token.clone()
    }

    /// Whether `candidate` is the current token
    pub fn is_valid(&self, candidate: Option<&str>) -> bool {
        candidate.is_some_and(|candidate| candidate == self.inner.lock().token)
    }

    /// Hand the token out from `/privet/info`
    ///
    /// While the device is idle a token older than the lifetime (or never
    /// issued) is replaced first. Every call refreshes the issue time.
    pub fn issue(&self, idle: bool, now: Instant) -> String {
        let mut inner = self.inner.lock();

        let expired = inner
            .issued
            .is_none_or(|issued| now.saturating_duration_since(issued) > self.lifetime);
        if idle && expired {
            inner.token = random_token();
            tracing::debug!("Rotated X-Privet-Token");
        }

        inner.issued = Some(now);
        inner.token.clone()
    }
}

impl Default for PrivetTokenStore {
    fn default() -> Self {
        Self::new()
    }
}
