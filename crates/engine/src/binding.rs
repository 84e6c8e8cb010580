use apothecary_api::{UserProfile, UserRole};

use crate::conversation::{ConversationStore, Message};
use crate::error::EngineResult;
use crate::events::{RefreshReason, RefreshRequest};
use crate::phrasebook::Phrasebook;
use crate::session::{SessionController, SessionId};

/// Who is chatting, as far as the engine is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveUser {
    pub user_id: String,
    pub display_name: String,
    pub role: UserRole,
    pub locale: String,
}

impl ActiveUser {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        role: UserRole,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
            locale: locale.into(),
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }
}

impl From<&UserProfile> for ActiveUser {
    fn from(profile: &UserProfile) -> Self {
        Self::new(
            profile.id.clone(),
            profile.full_name.clone(),
            profile.role,
            profile.lang.clone(),
        )
    }
}

/// Result of binding a new user context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub session_id: SessionId,
    pub refresh: RefreshRequest,
}

/// Resets session and conversation for `user`.
///
/// The session id changes only when the user id does; a locale-only change keeps it but still
/// re-seeds the conversation with a greeting in the new language.
pub fn bind_active_user(
    sessions: &mut SessionController,
    conversation: &mut ConversationStore,
    phrasebook: &dyn Phrasebook,
    user: &ActiveUser,
) -> EngineResult<Binding> {
    let session_id = sessions.ensure(&user.user_id)?;
    let greeting = phrasebook.greeting(&user.locale, &user.display_name);
    conversation.reset(Message::assistant(greeting));

    tracing::info!(
        user_id = %user.user_id,
        role = user.role.as_str(),
        locale = %user.locale,
        session_id = %session_id,
        "bound active user"
    );

    Ok(Binding {
        session_id,
        refresh: RefreshRequest {
            reason: RefreshReason::ActiveUserChanged,
            user_id: user.user_id.clone(),
            role: user.role,
        },
    })
}
