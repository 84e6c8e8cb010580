use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{EngineResult, SessionIdUnavailableSnafu};

/// Opaque conversation identifier the remote assistant correlates history by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for SessionId {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw).map(Self)
    }
}

/// Produces fresh session identifiers.
pub trait SessionIdSource: Send {
    fn next_id(&mut self) -> EngineResult<SessionId>;
}

/// Random v4 identifiers drawn from the operating system's entropy source.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandomSessionIds;

impl SessionIdSource for OsRandomSessionIds {
    fn next_id(&mut self) -> EngineResult<SessionId> {
        let mut bytes = [0_u8; 16];
        getrandom::fill(&mut bytes).context(SessionIdUnavailableSnafu {
            stage: "draw-session-entropy",
        })?;
        Ok(SessionId(uuid::Builder::from_random_bytes(bytes).into_uuid()))
    }
}

/// Owns the session identifier for the current user epoch.
///
/// `ensure` is the only mutation point: the identifier changes exactly when the active user
/// changes and is stable for every exchange issued in between.
pub struct SessionController {
    source: Box<dyn SessionIdSource>,
    current: Option<BoundSession>,
}

struct BoundSession {
    user_id: String,
    session_id: SessionId,
}

impl SessionController {
    pub fn new(source: Box<dyn SessionIdSource>) -> Self {
        Self {
            source,
            current: None,
        }
    }

    pub fn with_os_random() -> Self {
        Self::new(Box::new(OsRandomSessionIds))
    }

    pub fn ensure(&mut self, user_id: &str) -> EngineResult<SessionId> {
        if let Some(bound) = &self.current
            && bound.user_id == user_id
        {
            return Ok(bound.session_id);
        }

        let session_id = self.source.next_id()?;
        tracing::info!(
            user_id = %user_id,
            session_id = %session_id,
            previous_session_id = ?self.current.as_ref().map(|bound| bound.session_id.to_string()),
            "started conversation session"
        );
        self.current = Some(BoundSession {
            user_id: user_id.to_string(),
            session_id,
        });
        Ok(session_id)
    }

    pub fn current(&self) -> Option<SessionId> {
        self.current.as_ref().map(|bound| bound.session_id)
    }
}

impl fmt::Debug for SessionController {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SessionController")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}
