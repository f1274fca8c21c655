//! Session state machine
//!
//! A session tracks:
//! - Session ID (assigned by the device on createSession)
//! - Revision (bumped whenever the visible session changes)
//! - Current state and the image blocks waiting for transfer
//!
//! [`check`] is the single allowed-state table both roles consult before
//! a command is run.

use std::fmt;

use serde_json::Value;

use crate::envelope::SessionObject;
use crate::error::{Error, ErrorCode, Result};
use crate::method::Method;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session exists
    NoSession,

    /// Session open, not capturing
    Ready,

    /// Scanner is producing image blocks
    Capturing,

    /// Capturing, but the driver has no room for more blocks
    Full,

    /// Session closed while image blocks are still outstanding
    ClosedPending,

    /// Session closed, all blocks released
    Closed,
}

impl SessionState {
    pub const ALL: [SessionState; 6] = [
        Self::NoSession,
        Self::Ready,
        Self::Capturing,
        Self::Full,
        Self::ClosedPending,
        Self::Closed,
    ];

    /// Name used in `session.state`
    ///
    /// `ClosedPending` has no wire name of its own.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::NoSession => "nosession",
            Self::Ready => "ready",
            Self::Capturing => "capturing",
            Self::Full => "full",
            Self::ClosedPending | Self::Closed => "closed",
        }
    }

    /// Parse a wire state, telling `closed` apart by outstanding blocks
    pub fn from_wire(name: &str, has_image_blocks: bool) -> Result<Self> {
        match name {
            "nosession" => Ok(Self::NoSession),
            "ready" => Ok(Self::Ready),
            "capturing" => Ok(Self::Capturing),
            "full" => Ok(Self::Full),
            "closed" if has_image_blocks => Ok(Self::ClosedPending),
            "closed" => Ok(Self::Closed),
            other => Err(Error::UnknownState(other.to_string())),
        }
    }

    /// No live session: a new one may be created
    pub fn is_idle(self) -> bool {
        matches!(self, Self::NoSession | Self::Closed)
    }

    pub fn is_capturing(self) -> bool {
        matches!(self, Self::Capturing | Self::Full)
    }

    /// `device_state` reported by `/privet/info`
    pub fn device_state(self) -> &'static str {
        if self.is_idle() { "idle" } else { "processing" }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoSession => "NoSession",
            Self::Ready => "Ready",
            Self::Capturing => "Capturing",
            Self::Full => "Full",
            Self::ClosedPending => "ClosedPending",
            Self::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Check whether `method` may run while the session is in `state`
pub fn check(method: Method, state: SessionState) -> std::result::Result<(), ErrorCode> {
    use SessionState::*;

    match method {
        Method::CreateSession => match state {
            NoSession | Closed => Ok(()),
            _ => Err(ErrorCode::NewSessionNotAllowed),
        },
        Method::GetSession | Method::SetTwainDirectOptions | Method::WaitForEvents => match state {
            Ready | Capturing | Full | ClosedPending => Ok(()),
            _ => Err(ErrorCode::ClosedSession),
        },
        Method::StartCapturing => match state {
            Ready => Ok(()),
            Capturing | Full => Err(ErrorCode::NotReady),
            _ => Err(ErrorCode::ClosedSession),
        },
        Method::StopCapturing => match state {
            Capturing | Full => Ok(()),
            Ready => Err(ErrorCode::NotCapturing),
            _ => Err(ErrorCode::ClosedSession),
        },
        Method::ReadImageBlock | Method::ReadImageBlockMetadata | Method::ReleaseImageBlocks => {
            match state {
                Capturing | Full | ClosedPending => Ok(()),
                Ready => Err(ErrorCode::NotCapturing),
                _ => Err(ErrorCode::ClosedSession),
            }
        }
        Method::CloseSession => match state {
            Ready | Capturing | Full => Ok(()),
            _ => Err(ErrorCode::ClosedSession),
        },
    }
}

/// Authoritative record of one scan session
#[derive(Debug, Clone)]
pub struct Session {
    session_id: Option<String>,
    revision: u64,
    state: SessionState,
    image_blocks: Vec<u64>,
    end_of_job: bool,
    task: Option<Value>,
    previous_snapshot: Option<SessionObject>,
}

impl Session {
    /// Create a session record in `NoSession`
    pub fn new() -> Self {
        Self {
            session_id: None,
            revision: 0,
            state: SessionState::NoSession,
            image_blocks: Vec::new(),
            end_of_job: true,
            task: None,
            previous_snapshot: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn image_blocks(&self) -> &[u64] {
        &self.image_blocks
    }

    /// True once the driver will produce no further blocks
    pub fn end_of_job(&self) -> bool {
        self.end_of_job
    }

    /// Nothing left to transfer and nothing more coming
    pub fn is_drained(&self) -> bool {
        self.end_of_job && self.image_blocks.is_empty()
    }

    pub fn task(&self) -> Option<&Value> {
        self.task.as_ref()
    }

    /// Whether `session_id` names the live session
    ///
    /// Only enforced while a session is live; idle states accept anything.
    pub fn matches(&self, session_id: Option<&str>) -> bool {
        self.state.is_idle() || self.session_id.as_deref() == session_id
    }

    /// Start a fresh session: `NoSession`/`Closed` -> `Ready`
    pub fn open(&mut self, session_id: impl Into<String>) -> std::result::Result<(), ErrorCode> {
        check(Method::CreateSession, self.state)?;

        *self = Self::new();
        self.session_id = Some(session_id.into());
        self.state = SessionState::Ready;
        Ok(())
    }

    /// `Ready` -> `Capturing`
    pub fn start_capturing(&mut self) -> std::result::Result<(), ErrorCode> {
        check(Method::StartCapturing, self.state)?;

        self.state = SessionState::Capturing;
        self.end_of_job = false;
        Ok(())
    }

    /// `Capturing`/`Full` -> `ClosedPending` with outstanding blocks, else `Ready`
    pub fn stop_capturing(&mut self) -> std::result::Result<(), ErrorCode> {
        check(Method::StopCapturing, self.state)?;

        self.state = if self.image_blocks.is_empty() {
            SessionState::Ready
        } else {
            SessionState::ClosedPending
        };
        self.end_of_job = true;
        Ok(())
    }

    /// `Ready`/`Capturing`/`Full` -> `ClosedPending` with outstanding blocks, else `Closed`
    pub fn close(&mut self) -> std::result::Result<(), ErrorCode> {
        check(Method::CloseSession, self.state)?;

        self.state = if self.image_blocks.is_empty() {
            SessionState::Closed
        } else {
            SessionState::ClosedPending
        };
        self.end_of_job = true;
        Ok(())
    }

    pub fn set_task(&mut self, task: Value) {
        self.task = Some(task);
    }

    /// Apply the block list and backpressure flag reported by the driver
    ///
    /// Returns `true` when this drained a `ClosedPending` session into `Closed`.
    pub fn update_image_blocks(
        &mut self,
        blocks: impl IntoIterator<Item = u64>,
        end_of_job: bool,
        full: bool,
    ) -> bool {
        if self.state.is_idle() {
            return false;
        }

        let mut blocks: Vec<u64> = blocks.into_iter().filter(|block| *block > 0).collect();
        blocks.sort_unstable();
        blocks.dedup();
        self.image_blocks = blocks;

        if self.state.is_capturing() {
            self.state = if full {
                SessionState::Full
            } else {
                SessionState::Capturing
            };
        }
        self.end_of_job = end_of_job || !self.state.is_capturing();

        if self.state == SessionState::ClosedPending && self.image_blocks.is_empty() {
            self.state = SessionState::Closed;
            return true;
        }
        false
    }

    /// Drop the session after a fatal reply (client role)
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Session object as sent on the wire
    pub fn to_object(&self) -> SessionObject {
        let image_blocks = if self.is_drained() {
            None
        } else {
            Some(self.image_blocks.clone())
        };

        SessionObject {
            session_id: self.session_id.clone().unwrap_or_default(),
            revision: self.revision,
            state: self.state.wire_name().to_string(),
            image_blocks,
            task: self.task.clone(),
        }
    }

    /// Bump the revision if the session changed since the last commit
    pub fn commit(&mut self) -> u64 {
        let mut snapshot = self.to_object();
        snapshot.revision = 0;

        if self.previous_snapshot.as_ref() != Some(&snapshot) {
            self.revision += 1;
            self.previous_snapshot = Some(snapshot);
        }
        self.revision
    }

    /// Mirror the session object from a device reply (client role)
    pub fn apply_remote(&mut self, object: &SessionObject) -> Result<()> {
        let has_blocks = object
            .image_blocks
            .as_ref()
            .is_some_and(|blocks| !blocks.is_empty());
        let state = SessionState::from_wire(&object.state, has_blocks)?;

        self.state = state;
        self.session_id = match state {
            SessionState::NoSession => None,
            _ => Some(object.session_id.clone()),
        };
        self.revision = object.revision;
        self.end_of_job = object.image_blocks.is_none();
        self.image_blocks = if state.is_idle() {
            Vec::new()
        } else {
            object.image_blocks.clone().unwrap_or_default()
        };
        if object.task.is_some() {
            self.task = object.task.clone();
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use SessionState::*;

    fn session_in(state: SessionState, blocks: &[u64]) -> Session {
        let mut session = Session::new();
        if state == NoSession {
            return session;
        }
        session.open("s1").unwrap();
        if state == Ready {
            return session;
        }
        session.start_capturing().unwrap();
        session.update_image_blocks(blocks.iter().copied(), false, state == Full);
        match state {
            ClosedPending => session.close().unwrap(),
            Closed => {
                session.update_image_blocks([], true, false);
                session.close().unwrap();
            }
            _ => {}
        }
        assert_eq!(session.state(), state);
        session
    }

    #[test]
    fn test_state_table_complete() {
        let ok = Ok(());
        let expected = [
            (Method::CreateSession, [ok.clone(), Err(ErrorCode::NewSessionNotAllowed), Err(ErrorCode::NewSessionNotAllowed), Err(ErrorCode::NewSessionNotAllowed), Err(ErrorCode::NewSessionNotAllowed), ok.clone()]),
            (Method::GetSession, [Err(ErrorCode::ClosedSession), ok.clone(), ok.clone(), ok.clone(), ok.clone(), Err(ErrorCode::ClosedSession)]),
            (Method::SetTwainDirectOptions, [Err(ErrorCode::ClosedSession), ok.clone(), ok.clone(), ok.clone(), ok.clone(), Err(ErrorCode::ClosedSession)]),
            (Method::StartCapturing, [Err(ErrorCode::ClosedSession), ok.clone(), Err(ErrorCode::NotReady), Err(ErrorCode::NotReady), Err(ErrorCode::ClosedSession), Err(ErrorCode::ClosedSession)]),
            (Method::StopCapturing, [Err(ErrorCode::ClosedSession), Err(ErrorCode::NotCapturing), ok.clone(), ok.clone(), Err(ErrorCode::ClosedSession), Err(ErrorCode::ClosedSession)]),
            (Method::ReadImageBlock, [Err(ErrorCode::ClosedSession), Err(ErrorCode::NotCapturing), ok.clone(), ok.clone(), ok.clone(), Err(ErrorCode::ClosedSession)]),
            (Method::ReadImageBlockMetadata, [Err(ErrorCode::ClosedSession), Err(ErrorCode::NotCapturing), ok.clone(), ok.clone(), ok.clone(), Err(ErrorCode::ClosedSession)]),
            (Method::ReleaseImageBlocks, [Err(ErrorCode::ClosedSession), Err(ErrorCode::NotCapturing), ok.clone(), ok.clone(), ok.clone(), Err(ErrorCode::ClosedSession)]),
            (Method::CloseSession, [Err(ErrorCode::ClosedSession), ok.clone(), ok.clone(), ok.clone(), Err(ErrorCode::ClosedSession), Err(ErrorCode::ClosedSession)]),
            (Method::WaitForEvents, [Err(ErrorCode::ClosedSession), ok.clone(), ok.clone(), ok.clone(), ok.clone(), Err(ErrorCode::ClosedSession)]),
        ];

        assert_eq!(expected.len(), Method::ALL.len());
        for (method, row) in expected {
            for (state, result) in SessionState::ALL.into_iter().zip(row) {
                assert_eq!(check(method, state), result, "{} in {}", method, state);
            }
        }
    }

    #[test]
    fn test_rejected_transition_has_no_effect() {
        let mut session = session_in(Capturing, &[1, 2]);
        let before = session.to_object();

        assert_eq!(session.open("s2"), Err(ErrorCode::NewSessionNotAllowed));
        assert_eq!(session.start_capturing(), Err(ErrorCode::NotReady));
        assert_eq!(session.to_object(), before);
    }

    #[test]
    fn test_close_with_blocks_goes_closed_pending() {
        let mut session = session_in(Capturing, &[3]);
        session.close().unwrap();
        assert_eq!(session.state(), ClosedPending);
        assert_eq!(session.to_object().state, "closed");

        assert!(session.update_image_blocks([], true, false));
        assert_eq!(session.state(), Closed);
        assert!(session.image_blocks().is_empty());
    }

    #[test]
    fn test_stop_capturing_targets() {
        let mut session = session_in(Capturing, &[]);
        session.stop_capturing().unwrap();
        assert_eq!(session.state(), Ready);

        let mut session = session_in(Capturing, &[7]);
        session.stop_capturing().unwrap();
        assert_eq!(session.state(), ClosedPending);
    }

    #[test]
    fn test_full_mirrors_capturing() {
        let mut session = session_in(Capturing, &[1]);
        session.update_image_blocks([1, 2], false, true);
        assert_eq!(session.state(), Full);
        session.update_image_blocks([2], false, false);
        assert_eq!(session.state(), Capturing);
    }

    #[test]
    fn test_commit_bumps_only_on_change() {
        let mut session = session_in(Ready, &[]);
        assert_eq!(session.commit(), 1);
        assert_eq!(session.commit(), 1);

        session.start_capturing().unwrap();
        assert_eq!(session.commit(), 2);

        session.update_image_blocks([], false, false);
        assert_eq!(session.commit(), 2);

        session.update_image_blocks([4], false, false);
        assert_eq!(session.commit(), 3);
    }

    #[test]
    fn test_new_session_resets_revision() {
        let mut session = session_in(Closed, &[]);
        session.commit();
        session.open("s2").unwrap();
        assert_eq!(session.revision(), 0);
        assert_eq!(session.commit(), 1);
        assert_eq!(session.session_id(), Some("s2"));
    }

    #[test]
    fn test_image_blocks_wire_forms() {
        let session = session_in(Capturing, &[]);
        assert_eq!(session.to_object().image_blocks, Some(vec![]));

        let session = session_in(Ready, &[]);
        assert_eq!(session.to_object().image_blocks, None);
    }

    #[test]
    fn test_apply_remote_closed_pending() {
        let mut session = Session::new();
        session
            .apply_remote(&SessionObject {
                session_id: "abc".into(),
                revision: 5,
                state: "closed".into(),
                image_blocks: Some(vec![7]),
                task: None,
            })
            .unwrap();
        assert_eq!(session.state(), ClosedPending);
        assert_eq!(session.image_blocks(), &[7]);
        assert!(!session.is_drained());

        session
            .apply_remote(&SessionObject {
                session_id: "abc".into(),
                revision: 6,
                state: "closed".into(),
                image_blocks: None,
                task: None,
            })
            .unwrap();
        assert_eq!(session.state(), Closed);
        assert!(session.is_drained());
    }

    #[test]
    fn test_apply_remote_unknown_state() {
        let mut session = Session::new();
        let object = SessionObject {
            state: "sleeping".into(),
            ..Default::default()
        };
        assert!(matches!(
            session.apply_remote(&object),
            Err(Error::UnknownState(_))
        ));
    }

    #[test]
    fn test_matches_only_enforced_when_live() {
        let session = Session::new();
        assert!(session.matches(None));

        let session = session_in(Ready, &[]);
        assert!(session.matches(Some("s1")));
        assert!(!session.matches(Some("other")));
        assert!(!session.matches(None));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Open,
        Start,
        Stop,
        Close,
        Blocks(Vec<u64>, bool, bool),
        Task(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Open),
            Just(Op::Start),
            Just(Op::Stop),
            Just(Op::Close),
            (proptest::collection::vec(0u64..6, 0..4), any::<bool>(), any::<bool>())
                .prop_map(|(blocks, eoj, full)| Op::Blocks(blocks, eoj, full)),
            any::<u8>().prop_map(Op::Task),
        ]
    }

    proptest! {
        #[test]
        fn test_revision_monotonic(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let mut session = Session::new();
            let mut last = session.revision();
            let mut id = 0;

            for op in ops {
                let opened = match op {
                    Op::Open => {
                        id += 1;
                        session.open(format!("s{}", id)).is_ok()
                    }
                    Op::Start => { let _ = session.start_capturing(); false }
                    Op::Stop => { let _ = session.stop_capturing(); false }
                    Op::Close => { let _ = session.close(); false }
                    Op::Blocks(blocks, eoj, full) => {
                        session.update_image_blocks(blocks, eoj, full);
                        false
                    }
                    Op::Task(n) => {
                        if !session.state().is_idle() {
                            session.set_task(serde_json::json!({ "n": n }));
                        }
                        false
                    }
                };

                let revision = session.commit();
                if opened {
                    prop_assert_eq!(revision, 1);
                } else {
                    prop_assert!(revision >= last);
                }
                last = revision;

                if session.state().is_idle() {
                    prop_assert!(session.image_blocks().is_empty());
                }
                prop_assert_eq!(
                    session.session_id().is_some(),
                    session.state() != NoSession
                );
            }
        }
    }
}
