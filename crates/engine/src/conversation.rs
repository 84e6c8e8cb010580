/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Ordered message list for the active conversation.
///
/// Messages are append-only except for the trailing assistant message, which streamed
/// increments grow in place and a failure may overwrite. A user message is never rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationStore {
    messages: Vec<Message>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self, greeting: Message) {
        self.messages.clear();
        self.messages.push(greeting);
    }

    pub fn append_user(&mut self, text: impl Into<String>) {
        self.messages.push(Message::user(text));
    }

    /// Folds one streamed increment into the trailing assistant message, opening a new
    /// assistant message when the trailing one belongs to the user.
    pub fn fold_increment(&mut self, text: &str) {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => last.content.push_str(text),
            Some(_) | None => self.messages.push(Message::assistant(text)),
        }
    }

    /// Replaces a partially streamed reply with `text`, or appends it when no reply was opened.
    pub fn replace_or_append_fallback(&mut self, text: impl Into<String>) {
        let text = text.into();
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => last.content = text,
            Some(_) | None => self.messages.push(Message::assistant(text)),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }
}
