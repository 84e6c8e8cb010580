use std::sync::Arc;

use apothecary_api::{ChatRequest, ChatTransport};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, future};
use snafu::IntoError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::binding::{ActiveUser, bind_active_user};
use crate::conversation::ConversationStore;
use crate::error::{DecodeSnafu, EngineResult, EngineStoppedSnafu, ExchangeError, TransportSnafu};
use crate::events::{EngineEvent, RefreshReason, RefreshRequest, SubmitIgnoredReason};
use crate::exchange::{
    ExchangeId, ExchangeState, ExchangeTransition, ExchangeTransitionRejection,
};
use crate::ingest::{StreamShape, ingest};
use crate::phrasebook::{BuiltinPhrasebook, Phrasebook};
use crate::session::{SessionController, SessionIdSource};

/// Commands accepted by a running engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Submit(String),
    BindUser(ActiveUser),
}

/// Cloneable sender side of a running [`ExchangeOrchestrator`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn submit(&self, text: impl Into<String>) -> EngineResult<()> {
        self.commands
            .send(EngineCommand::Submit(text.into()))
            .map_err(|_| EngineStoppedSnafu { stage: "send-submit" }.build())
    }

    pub fn bind_user(&self, user: ActiveUser) -> EngineResult<()> {
        self.commands
            .send(EngineCommand::BindUser(user))
            .map_err(|_| EngineStoppedSnafu { stage: "send-bind-user" }.build())
    }
}

enum ExchangeProgress {
    Opened { shape: StreamShape },
    Increment(String),
    Failed(ExchangeError),
    Finished,
}

enum ExchangeOutcome {
    Settled,
    Failed(ExchangeError),
    /// A new user context arrived mid-exchange.
    Abandoned(ActiveUser),
}

/// Drives chat exchanges one at a time and owns the conversation they mutate.
///
/// The orchestrator runs as a single task. While an exchange is in flight it keeps reading
/// commands so that extra submits are observed and dropped rather than queued.
pub struct ExchangeOrchestrator {
    transport: Arc<dyn ChatTransport>,
    phrasebook: Arc<dyn Phrasebook>,
    sessions: SessionController,
    conversation: ConversationStore,
    state: ExchangeState,
    active_user: Option<ActiveUser>,
    stream_shape: StreamShape,
    next_exchange_id: ExchangeId,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl ExchangeOrchestrator {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            transport,
            phrasebook: Arc::new(BuiltinPhrasebook),
            sessions: SessionController::with_os_random(),
            conversation: ConversationStore::new(),
            state: ExchangeState::Idle,
            active_user: None,
            stream_shape: StreamShape::Auto,
            next_exchange_id: ExchangeId::new(1),
            events,
        }
    }

    pub fn with_phrasebook(mut self, phrasebook: Arc<dyn Phrasebook>) -> Self {
        self.phrasebook = phrasebook;
        self
    }

    pub fn with_session_ids(mut self, source: Box<dyn SessionIdSource>) -> Self {
        self.sessions = SessionController::new(source);
        self
    }

    pub fn with_stream_shape(mut self, shape: StreamShape) -> Self {
        self.stream_shape = shape;
        self
    }

    /// Starts the engine on the current tokio runtime.
    pub fn spawn(self) -> (EngineHandle, JoinHandle<EngineResult<()>>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(commands_rx));
        (
            EngineHandle {
                commands: commands_tx,
            },
            task,
        )
    }

    /// Processes commands until every [`EngineHandle`] is dropped.
    ///
    /// Returns an error only for initialization failures; exchange failures are turned into
    /// fallback messages.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    ) -> EngineResult<()> {
        while let Some(command) = commands.recv().await {
            let mut next = Some(command);
            while let Some(command) = next.take() {
                next = match command {
                    EngineCommand::BindUser(user) => {
                        self.bind_user(user)?;
                        None
                    }
                    EngineCommand::Submit(text) => self.submit(text, &mut commands).await?,
                };
            }
        }

        tracing::info!("command channel closed, conversation engine stopping");
        Ok(())
    }

    fn bind_user(&mut self, user: ActiveUser) -> EngineResult<()> {
        let binding = bind_active_user(
            &mut self.sessions,
            &mut self.conversation,
            self.phrasebook.as_ref(),
            &user,
        )?;

        self.emit(EngineEvent::UserBound {
            user_id: user.user_id.clone(),
            session_id: binding.session_id,
        });
        self.publish_conversation();
        self.active_user = Some(user);
        self.emit(EngineEvent::RefreshRequested(binding.refresh));
        Ok(())
    }

    /// Runs one exchange to completion. Returns a command that must be handled next when the
    /// exchange was abandoned for a new user context.
    async fn submit(
        &mut self,
        text: String,
        commands: &mut mpsc::UnboundedReceiver<EngineCommand>,
    ) -> EngineResult<Option<EngineCommand>> {
        if text.trim().is_empty() {
            self.ignore_submit(text, SubmitIgnoredReason::EmptyText);
            return Ok(None);
        }
        let Some(user) = self.active_user.clone() else {
            self.ignore_submit(text, SubmitIgnoredReason::NoActiveUser);
            return Ok(None);
        };

        let id = self.next_exchange_id;
        if let Err(rejection) = self.try_advance(ExchangeTransition::Begin(id)) {
            tracing::debug!(?rejection, "exchange not started");
            self.ignore_submit(text, SubmitIgnoredReason::Busy);
            return Ok(None);
        }
        self.next_exchange_id = id.next();

        let session_id = self.sessions.ensure(&user.user_id)?;
        let previous = self.conversation.last_user_text().map(str::to_string);
        self.conversation.append_user(text.clone());
        self.publish_conversation();

        tracing::info!(
            exchange_id = %id,
            session_id = %session_id,
            user_id = %user.user_id,
            "sending chat exchange"
        );

        let request = ChatRequest::new(text, session_id.to_string())
            .with_user(user.user_id.clone(), user.role)
            .with_preferred_lang(user.locale.clone())
            .with_prev_user_message(previous);
        let mut progress =
            exchange_progress(Arc::clone(&self.transport), request, self.stream_shape);

        let mut commands_open = true;
        let outcome = loop {
            tokio::select! {
                item = progress.next() => match item {
                    Some(ExchangeProgress::Opened { shape }) => {
                        tracing::debug!(exchange_id = %id, ?shape, "reply stream attached");
                        self.advance(ExchangeTransition::Attach(id));
                    }
                    Some(ExchangeProgress::Increment(increment)) => {
                        self.conversation.fold_increment(&increment);
                        self.emit(EngineEvent::Increment(increment));
                        self.publish_conversation();
                    }
                    Some(ExchangeProgress::Failed(error)) => break ExchangeOutcome::Failed(error),
                    Some(ExchangeProgress::Finished) | None => break ExchangeOutcome::Settled,
                },
                command = commands.recv(), if commands_open => match command {
                    Some(EngineCommand::Submit(text)) => {
                        self.ignore_submit(text, SubmitIgnoredReason::Busy);
                    }
                    Some(EngineCommand::BindUser(next_user)) => {
                        break ExchangeOutcome::Abandoned(next_user);
                    }
                    None => commands_open = false,
                },
            }
        };

        let reason = match outcome {
            ExchangeOutcome::Settled => {
                tracing::info!(exchange_id = %id, "exchange settled");
                self.advance(ExchangeTransition::Complete(id));
                RefreshReason::ExchangeSettled
            }
            ExchangeOutcome::Failed(error) => {
                tracing::warn!(exchange_id = %id, error = %error, "exchange failed");
                self.advance(ExchangeTransition::Fail {
                    id,
                    reason: error.to_string(),
                });
                let fallback = self.phrasebook.error_text(&user.locale);
                self.conversation.replace_or_append_fallback(fallback);
                self.publish_conversation();
                RefreshReason::ExchangeFailed
            }
            ExchangeOutcome::Abandoned(next_user) => {
                tracing::info!(
                    exchange_id = %id,
                    next_user_id = %next_user.user_id,
                    "abandoning exchange for new user context"
                );
                self.advance(ExchangeTransition::Abandon(id));
                return Ok(Some(EngineCommand::BindUser(next_user)));
            }
        };

        self.emit(EngineEvent::RefreshRequested(RefreshRequest {
            reason,
            user_id: user.user_id,
            role: user.role,
        }));
        self.advance(ExchangeTransition::ReturnToIdle);
        Ok(None)
    }

    fn try_advance(
        &mut self,
        transition: ExchangeTransition,
    ) -> Result<(), ExchangeTransitionRejection> {
        let next = self.state.apply(transition)?;
        self.state = next.clone();
        self.emit(EngineEvent::ExchangeStateChanged(next));
        Ok(())
    }

    fn advance(&mut self, transition: ExchangeTransition) {
        if let Err(rejection) = self.try_advance(transition) {
            tracing::error!(state = ?self.state, ?rejection, "illegal exchange transition");
        }
    }

    fn ignore_submit(&self, text: String, reason: SubmitIgnoredReason) {
        tracing::info!(?reason, "ignoring submit");
        self.emit(EngineEvent::SubmitIgnored { text, reason });
    }

    fn publish_conversation(&self) {
        self.emit(EngineEvent::ConversationChanged(self.conversation.snapshot()));
    }

    fn emit(&self, event: EngineEvent) {
        // Observers are optional; a closed receiver must not stop the engine.
        let _ = self.events.send(event);
    }
}

/// Opens the exchange and flattens the reply into progress items.
///
/// Yields `Opened` first on success, then increments, then `Finished`. On failure the last
/// item is `Failed`.
fn exchange_progress(
    transport: Arc<dyn ChatTransport>,
    request: ChatRequest,
    shape: StreamShape,
) -> BoxStream<'static, ExchangeProgress> {
    let opened = async move { transport.open(&request).await };

    stream::once(opened)
        .flat_map(move |opened| match opened {
            Ok(response) => {
                let shape = shape.resolve(response.content_type.as_deref());
                let increments = ingest(response.body, shape).map(|increment| match increment {
                    Ok(text) => ExchangeProgress::Increment(text),
                    Err(source) => ExchangeProgress::Failed(
                        DecodeSnafu {
                            stage: "ingest-reply",
                        }
                        .into_error(source),
                    ),
                });
                stream::once(future::ready(ExchangeProgress::Opened { shape }))
                    .chain(increments)
                    .chain(stream::once(future::ready(ExchangeProgress::Finished)))
                    .boxed()
            }
            Err(source) => stream::once(future::ready(ExchangeProgress::Failed(
                TransportSnafu {
                    stage: "open-exchange",
                }
                .into_error(source),
            )))
            .boxed(),
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use apothecary_api::{ApiError, ApiResult, BoxFuture, ChatResponse, UserRole};
    use bytes::Bytes;
    use futures::channel::mpsc as body_channel;
    use futures::channel::oneshot;

    use super::*;
    use crate::conversation::Message;
    use crate::error::EngineError;
    use crate::session::SessionId;
    use crate::session::tests::{SequentialSessionIds, UnavailableSessionIds};

    const GREETING: &str = "Hello Dana! How can I help you today?";
    const ERROR_TEXT: &str = "Sorry, something went wrong.";

    enum ScriptedReply {
        Body {
            content_type: Option<&'static str>,
            body: apothecary_api::ByteStream,
        },
        /// Opening waits until the paired sender fires, keeping the exchange in `Sending`.
        Held {
            release: oneshot::Receiver<()>,
            body: apothecary_api::ByteStream,
        },
        Fail(ApiError),
    }

    impl ScriptedReply {
        fn chunks(chunks: &[&'static [u8]]) -> Self {
            let chunks = chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk)))
                .collect::<Vec<ApiResult<Bytes>>>();
            Self::Body {
                content_type: Some("text/plain; charset=utf-8"),
                body: stream::iter(chunks).boxed(),
            }
        }

        fn held(chunks: &[&'static [u8]]) -> (Self, oneshot::Sender<()>) {
            let (release_tx, release) = oneshot::channel();
            let chunks = chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk)))
                .collect::<Vec<ApiResult<Bytes>>>();
            let body = stream::iter(chunks).boxed();
            (Self::Held { release, body }, release_tx)
        }

        /// A body the test feeds by hand; dropping the sender ends the stream.
        fn manual() -> (Self, body_channel::UnboundedSender<ApiResult<Bytes>>) {
            let (sender, receiver) = body_channel::unbounded();
            let reply = Self::Body {
                content_type: None,
                body: receiver.boxed(),
            };
            (reply, sender)
        }
    }

    struct ScriptedTransport {
        replies: Mutex<VecDeque<ScriptedReply>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedTransport {
        fn with_replies(replies: Vec<ScriptedReply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    impl ChatTransport for ScriptedTransport {
        fn open<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, ApiResult<ChatResponse>> {
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            let reply = self
                .replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .expect("a scripted reply for every exchange");

            Box::pin(async move {
                match reply {
                    ScriptedReply::Body { content_type, body } => {
                        Ok(ChatResponse::new(content_type.map(str::to_string), body))
                    }
                    ScriptedReply::Held { release, body } => {
                        let _ = release.await;
                        Ok(ChatResponse::new(None, body))
                    }
                    ScriptedReply::Fail(error) => Err(error),
                }
            })
        }
    }

    struct Harness {
        handle: EngineHandle,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        task: JoinHandle<EngineResult<()>>,
        transport: Arc<ScriptedTransport>,
    }

    impl Harness {
        fn start(transport: Arc<ScriptedTransport>) -> Self {
            Self::start_with_ids(transport, Box::new(SequentialSessionIds::default()))
        }

        fn start_with_ids(
            transport: Arc<ScriptedTransport>,
            session_ids: Box<dyn SessionIdSource>,
        ) -> Self {
            let (events_tx, events) = mpsc::unbounded_channel();
            let orchestrator = ExchangeOrchestrator::new(transport.clone(), events_tx)
                .with_session_ids(session_ids);
            let (handle, task) = orchestrator.spawn();
            Self {
                handle,
                events,
                task,
                transport,
            }
        }

        async fn next_event(&mut self) -> EngineEvent {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("engine event within timeout")
                .expect("engine still running")
        }

        /// Waits for the next refresh notification and returns it with the latest conversation.
        async fn until_refresh(&mut self) -> (RefreshRequest, Vec<Message>) {
            let mut conversation = Vec::new();
            loop {
                match self.next_event().await {
                    EngineEvent::ConversationChanged(messages) => conversation = messages,
                    EngineEvent::RefreshRequested(request) => return (request, conversation),
                    _ => {}
                }
            }
        }

        async fn until<F>(&mut self, mut predicate: F) -> EngineEvent
        where
            F: FnMut(&EngineEvent) -> bool,
        {
            loop {
                let event = self.next_event().await;
                if predicate(&event) {
                    return event;
                }
            }
        }

        async fn bind_dana(&mut self) -> SessionId {
            self.handle
                .bind_user(ActiveUser::new("u-1", "Dana", UserRole::Customer, "en"))
                .expect("engine running");
            let bound = self
                .until(|event| matches!(event, EngineEvent::UserBound { .. }))
                .await;
            let (refresh, _) = self.until_refresh().await;
            assert_eq!(refresh.reason, RefreshReason::ActiveUserChanged);
            match bound {
                EngineEvent::UserBound { session_id, .. } => session_id,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn increments_fold_into_one_assistant_message() {
        let transport = ScriptedTransport::with_replies(vec![
            ScriptedReply::chunks(&[b"Ibuprofen ", b"is a pain ", b"reliever."]),
            ScriptedReply::chunks(&[b"Usually every 6 hours."]),
        ]);
        let mut harness = Harness::start(transport);
        let session_id = harness.bind_dana().await;

        harness.handle.submit("What is ibuprofen for?").expect("submit");
        let (refresh, conversation) = harness.until_refresh().await;

        assert_eq!(refresh.reason, RefreshReason::ExchangeSettled);
        assert_eq!(refresh.user_id, "u-1");
        assert_eq!(
            conversation,
            vec![
                Message::assistant(GREETING),
                Message::user("What is ibuprofen for?"),
                Message::assistant("Ibuprofen is a pain reliever."),
            ]
        );

        harness.handle.submit("How often?").expect("submit");
        let (_, conversation) = harness.until_refresh().await;
        assert_eq!(conversation.len(), 5);

        let requests = harness.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].session_id, session_id.to_string());
        assert_eq!(requests[0].user_id.as_deref(), Some("u-1"));
        assert_eq!(requests[0].user_role, Some(UserRole::Customer));
        assert_eq!(requests[0].preferred_lang.as_deref(), Some("en"));
        assert_eq!(requests[0].prev_user_message, None);
        assert_eq!(requests[1].session_id, session_id.to_string());
        assert_eq!(
            requests[1].prev_user_message.as_deref(),
            Some("What is ibuprofen for?")
        );
    }

    #[tokio::test]
    async fn submit_while_streaming_is_ignored() {
        let (reply, body) = ScriptedReply::manual();
        let transport = ScriptedTransport::with_replies(vec![reply]);
        let mut harness = Harness::start(transport);
        harness.bind_dana().await;

        harness.handle.submit("first").expect("submit");
        harness
            .until(|event| {
                matches!(
                    event,
                    EngineEvent::ExchangeStateChanged(ExchangeState::Streaming(_))
                )
            })
            .await;

        harness.handle.submit("second").expect("submit");
        let ignored = harness
            .until(|event| matches!(event, EngineEvent::SubmitIgnored { .. }))
            .await;
        assert_eq!(
            ignored,
            EngineEvent::SubmitIgnored {
                text: "second".to_string(),
                reason: SubmitIgnoredReason::Busy,
            }
        );

        body.unbounded_send(Ok(Bytes::from_static(b"only reply")))
            .expect("body open");
        drop(body);
        let (refresh, conversation) = harness.until_refresh().await;

        assert_eq!(refresh.reason, RefreshReason::ExchangeSettled);
        assert_eq!(
            conversation,
            vec![
                Message::assistant(GREETING),
                Message::user("first"),
                Message::assistant("only reply"),
            ]
        );
        assert_eq!(harness.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn submit_while_sending_is_ignored() {
        let (reply, release) = ScriptedReply::held(&[b"late reply"]);
        let transport = ScriptedTransport::with_replies(vec![reply]);
        let mut harness = Harness::start(transport);
        harness.bind_dana().await;

        harness.handle.submit("first").expect("submit");
        harness
            .until(|event| {
                matches!(
                    event,
                    EngineEvent::ExchangeStateChanged(ExchangeState::Sending(_))
                )
            })
            .await;

        harness.handle.submit("second").expect("submit");
        let ignored = harness
            .until(|event| {
                matches!(
                    event,
                    EngineEvent::SubmitIgnored { .. }
                        | EngineEvent::ExchangeStateChanged(ExchangeState::Streaming(_))
                )
            })
            .await;
        assert_eq!(
            ignored,
            EngineEvent::SubmitIgnored {
                text: "second".to_string(),
                reason: SubmitIgnoredReason::Busy,
            }
        );

        release.send(()).expect("exchange still opening");
        let (refresh, conversation) = harness.until_refresh().await;

        assert_eq!(refresh.reason, RefreshReason::ExchangeSettled);
        assert_eq!(
            conversation,
            vec![
                Message::assistant(GREETING),
                Message::user("first"),
                Message::assistant("late reply"),
            ]
        );
        let requests = harness.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message, "first");
    }

    #[tokio::test]
    async fn transport_failure_appends_error_text() {
        let transport = ScriptedTransport::with_replies(vec![ScriptedReply::Fail(
            ApiError::Status {
                stage: "test-open",
                url: "http://localhost:8000/chat".to_string(),
                status: 500,
                body: "boom".to_string(),
            },
        )]);
        let mut harness = Harness::start(transport);
        harness.bind_dana().await;

        harness.handle.submit("Is paracetamol in stock?").expect("submit");
        let (refresh, conversation) = harness.until_refresh().await;

        assert_eq!(refresh.reason, RefreshReason::ExchangeFailed);
        assert_eq!(
            conversation,
            vec![
                Message::assistant(GREETING),
                Message::user("Is paracetamol in stock?"),
                Message::assistant(ERROR_TEXT),
            ]
        );
    }

    #[tokio::test]
    async fn decode_failure_replaces_partial_reply() {
        let transport = ScriptedTransport::with_replies(vec![ScriptedReply::chunks(&[
            b"Partial ",
            b"answer",
            b"\xff",
        ])]);
        let mut harness = Harness::start(transport);
        harness.bind_dana().await;

        harness.handle.submit("Dosage?").expect("submit");
        let (refresh, conversation) = harness.until_refresh().await;

        assert_eq!(refresh.reason, RefreshReason::ExchangeFailed);
        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation[2], Message::assistant(ERROR_TEXT));
    }

    #[tokio::test]
    async fn event_framed_reply_is_detected_from_content_type() {
        let transport = ScriptedTransport::with_replies(vec![ScriptedReply::Body {
            content_type: Some("text/event-stream"),
            body: stream::iter(vec![
                Ok(Bytes::from_static(b"data: {\"type\":\"delta\",\"text\":\"Hi\"}\n")),
                Ok(Bytes::from_static(b": keep-alive\n")),
                Ok(Bytes::from_static(
                    b"data: {\"type\":\"delta\",\"text\":\" there\"}\n",
                )),
            ])
            .boxed(),
        }]);
        let mut harness = Harness::start(transport);
        harness.bind_dana().await;

        harness.handle.submit("hello").expect("submit");
        let (_, conversation) = harness.until_refresh().await;

        assert_eq!(conversation.last(), Some(&Message::assistant("Hi there")));
    }

    #[tokio::test]
    async fn user_change_resets_conversation_and_session() {
        let transport = ScriptedTransport::with_replies(vec![ScriptedReply::chunks(&[b"ok"])]);
        let mut harness = Harness::start(transport);
        let first_session = harness.bind_dana().await;

        harness.handle.submit("question").expect("submit");
        harness.until_refresh().await;

        harness
            .handle
            .bind_user(ActiveUser::new("u-2", "Avi", UserRole::Pharmacist, "en"))
            .expect("engine running");
        let bound = harness
            .until(|event| matches!(event, EngineEvent::UserBound { .. }))
            .await;
        let (refresh, conversation) = harness.until_refresh().await;

        let EngineEvent::UserBound { session_id, .. } = bound else {
            panic!("expected a user binding");
        };
        assert_ne!(session_id, first_session);
        assert_eq!(refresh.reason, RefreshReason::ActiveUserChanged);
        assert_eq!(refresh.role, UserRole::Pharmacist);
        assert_eq!(
            conversation,
            vec![Message::assistant("Hello Avi! How can I help you today?")]
        );
    }

    #[tokio::test]
    async fn user_change_mid_stream_abandons_the_exchange() {
        let (reply, body) = ScriptedReply::manual();
        let transport = ScriptedTransport::with_replies(vec![reply]);
        let mut harness = Harness::start(transport);
        harness.bind_dana().await;

        harness.handle.submit("first").expect("submit");
        body.unbounded_send(Ok(Bytes::from_static(b"half an ans")))
            .expect("body open");
        harness
            .until(|event| matches!(event, EngineEvent::Increment(_)))
            .await;

        harness
            .handle
            .bind_user(ActiveUser::new("u-2", "Avi", UserRole::Customer, "en"))
            .expect("engine running");
        let state = harness
            .until(|event| matches!(event, EngineEvent::ExchangeStateChanged(_)))
            .await;
        let (refresh, conversation) = harness.until_refresh().await;

        assert_eq!(state, EngineEvent::ExchangeStateChanged(ExchangeState::Idle));
        assert_eq!(refresh.reason, RefreshReason::ActiveUserChanged);
        assert_eq!(
            conversation,
            vec![Message::assistant("Hello Avi! How can I help you today?")]
        );
        drop(body);
    }

    #[tokio::test]
    async fn empty_text_and_missing_user_are_ignored() {
        let transport = ScriptedTransport::with_replies(Vec::new());
        let mut harness = Harness::start(transport);

        harness.handle.submit("hello").expect("submit");
        let ignored = harness.next_event().await;
        assert_eq!(
            ignored,
            EngineEvent::SubmitIgnored {
                text: "hello".to_string(),
                reason: SubmitIgnoredReason::NoActiveUser,
            }
        );

        harness.bind_dana().await;
        harness.handle.submit("   ").expect("submit");
        let ignored = harness
            .until(|event| matches!(event, EngineEvent::SubmitIgnored { .. }))
            .await;
        assert!(matches!(
            ignored,
            EngineEvent::SubmitIgnored {
                reason: SubmitIgnoredReason::EmptyText,
                ..
            }
        ));
        assert!(harness.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn missing_entropy_stops_the_engine() {
        let transport = ScriptedTransport::with_replies(Vec::new());
        let harness = Harness::start_with_ids(transport, Box::new(UnavailableSessionIds));

        harness
            .handle
            .bind_user(ActiveUser::new("u-1", "Dana", UserRole::Customer, "en"))
            .expect("engine running");
        let result = harness.task.await.expect("engine task joins");

        assert!(matches!(result, Err(EngineError::SessionIdUnavailable { .. })));
    }

    #[tokio::test]
    async fn engine_stops_when_handles_drop() {
        let transport = ScriptedTransport::with_replies(Vec::new());
        let Harness { handle, task, .. } = Harness::start(transport);

        drop(handle);

        assert!(matches!(task.await, Ok(Ok(()))));
    }

    struct ClinicPhrasebook;

    impl Phrasebook for ClinicPhrasebook {
        fn greeting(&self, _locale: &str, name: &str) -> String {
            format!("Welcome to the clinic, {name}.")
        }

        fn error_text(&self, locale: &str) -> String {
            format!("[{locale}] The pharmacist will get back to you.")
        }
    }

    #[tokio::test]
    async fn custom_phrasebook_supplies_greeting_and_fallback() {
        let transport = ScriptedTransport::with_replies(vec![ScriptedReply::Fail(
            ApiError::Status {
                stage: "test-open",
                url: "http://localhost:8000/chat".to_string(),
                status: 502,
                body: String::new(),
            },
        )]);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (handle, _task) = ExchangeOrchestrator::new(transport, events_tx)
            .with_session_ids(Box::new(SequentialSessionIds::default()))
            .with_phrasebook(Arc::new(ClinicPhrasebook))
            .spawn();

        handle
            .bind_user(ActiveUser::new("u-1", "Dana", UserRole::Customer, "en"))
            .expect("engine running");
        handle.submit("Refill please").expect("submit");

        let mut conversation = Vec::new();
        let mut refreshes = 0;
        while refreshes < 2 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("engine event within timeout")
                .expect("engine still running");
            match event {
                EngineEvent::ConversationChanged(messages) => conversation = messages,
                EngineEvent::RefreshRequested(_) => refreshes += 1,
                _ => {}
            }
        }

        assert_eq!(
            conversation,
            vec![
                Message::assistant("Welcome to the clinic, Dana."),
                Message::user("Refill please"),
                Message::assistant("[en] The pharmacist will get back to you."),
            ]
        );
        assert_ne!(
            conversation[0].content,
            BuiltinPhrasebook.greeting("en", "Dana")
        );
    }
}
