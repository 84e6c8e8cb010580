use apothecary_api::UserRole;

use crate::conversation::Message;
use crate::exchange::ExchangeState;
use crate::session::SessionId;

/// Why dependent request lists should be fetched again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshReason {
    ActiveUserChanged,
    ExchangeSettled,
    ExchangeFailed,
}

/// One-shot notification for the external subscriber that owns request lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub reason: RefreshReason,
    pub user_id: String,
    pub role: UserRole,
}

/// Why a submit was dropped without opening an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmitIgnoredReason {
    /// Another exchange is still sending or streaming.
    Busy,
    EmptyText,
    NoActiveUser,
}

/// Everything observers of the engine need to render and react.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Emitted after the active user (or locale) binding completes.
    UserBound {
        user_id: String,
        session_id: SessionId,
    },
    /// Full message list after any mutation.
    ConversationChanged(Vec<Message>),
    /// One streamed piece of the assistant reply, already folded into the conversation.
    Increment(String),
    ExchangeStateChanged(ExchangeState),
    SubmitIgnored {
        text: String,
        reason: SubmitIgnoredReason,
    },
    RefreshRequested(RefreshRequest),
}

impl EngineEvent {
    /// Returns the refresh request carried by this event, if any.
    pub fn as_refresh(&self) -> Option<&RefreshRequest> {
        match self {
            Self::RefreshRequested(request) => Some(request),
            Self::UserBound { .. }
            | Self::ConversationChanged(_)
            | Self::Increment(_)
            | Self::ExchangeStateChanged(_)
            | Self::SubmitIgnored { .. } => None,
        }
    }
}
