use apothecary_engine::{
    EngineEvent, Message, RefreshReason, RefreshRequest, Role, SubmitIgnoredReason,
};

/// Turns engine events into terminal text.
///
/// Increments are written as they arrive. Whole messages (greetings, fallbacks) are taken from
/// the latest conversation snapshot once the engine requests a refresh, since that is the
/// point where the conversation has settled for the exchange or binding.
#[derive(Debug, Default)]
pub struct TranscriptRenderer {
    latest: Vec<Message>,
    streaming: bool,
}

impl TranscriptRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, event: &EngineEvent) -> Option<String> {
        match event {
            EngineEvent::UserBound {
                user_id,
                session_id,
            } => {
                // An abandoned reply leaves the cursor mid-line.
                let separator = if std::mem::take(&mut self.streaming) { "\n" } else { "" };
                Some(format!(
                    "{separator}-- chatting as {user_id} (session {session_id})\n"
                ))
            }
            EngineEvent::ConversationChanged(messages) => {
                self.latest.clone_from(messages);
                None
            }
            EngineEvent::Increment(text) => {
                let prefix = if self.streaming { "" } else { "assistant> " };
                self.streaming = true;
                Some(format!("{prefix}{text}"))
            }
            EngineEvent::ExchangeStateChanged(_) => None,
            EngineEvent::SubmitIgnored { reason, .. } => match reason {
                SubmitIgnoredReason::Busy => {
                    Some("-- still answering, message not sent\n".to_string())
                }
                SubmitIgnoredReason::EmptyText | SubmitIgnoredReason::NoActiveUser => None,
            },
            EngineEvent::RefreshRequested(request) => self.settle(request),
        }
    }

    fn settle(&mut self, request: &RefreshRequest) -> Option<String> {
        let streamed = std::mem::take(&mut self.streaming);
        let separator = if streamed { "\n" } else { "" };
        match request.reason {
            RefreshReason::ExchangeSettled => streamed.then(|| separator.to_string()),
            RefreshReason::ExchangeFailed | RefreshReason::ActiveUserChanged => self
                .last_assistant()
                .map(|text| format!("{separator}assistant> {text}\n")),
        }
    }

    fn last_assistant(&self) -> Option<&str> {
        self.latest
            .last()
            .filter(|message| message.role == Role::Assistant)
            .map(|message| message.content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use apothecary_api::UserRole;

    use super::*;

    fn refresh(reason: RefreshReason) -> EngineEvent {
        EngineEvent::RefreshRequested(RefreshRequest {
            reason,
            user_id: "u-1".to_string(),
            role: UserRole::Customer,
        })
    }

    #[test]
    fn streamed_reply_gets_one_prefix_and_a_closing_newline() {
        let mut renderer = TranscriptRenderer::new();

        let output = [
            EngineEvent::Increment("Ibuprofen ".to_string()),
            EngineEvent::Increment("is a pain reliever.".to_string()),
            refresh(RefreshReason::ExchangeSettled),
        ]
        .iter()
        .filter_map(|event| renderer.render(event))
        .collect::<String>();

        assert_eq!(output, "assistant> Ibuprofen is a pain reliever.\n");
    }

    #[test]
    fn failure_prints_the_fallback_message() {
        let mut renderer = TranscriptRenderer::new();
        renderer.render(&EngineEvent::Increment("Partial".to_string()));
        renderer.render(&EngineEvent::ConversationChanged(vec![
            Message::user("question"),
            Message::assistant("Sorry, something went wrong."),
        ]));

        let output = renderer.render(&refresh(RefreshReason::ExchangeFailed));

        assert_eq!(
            output.as_deref(),
            Some("\nassistant> Sorry, something went wrong.\n")
        );
    }

    #[test]
    fn binding_prints_the_greeting() {
        let mut renderer = TranscriptRenderer::new();
        renderer.render(&EngineEvent::ConversationChanged(vec![Message::assistant(
            "Hello Dana! How can I help you today?",
        )]));

        let output = renderer.render(&refresh(RefreshReason::ActiveUserChanged));

        assert_eq!(
            output.as_deref(),
            Some("assistant> Hello Dana! How can I help you today?\n")
        );
    }
}
