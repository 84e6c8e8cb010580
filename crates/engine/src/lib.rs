#![deny(unsafe_code)]

//! Streaming conversation engine for the pharmacy assistant.
//!
//! [`ExchangeOrchestrator`] owns the conversation, the session identifier and the exchange
//! lifecycle. Front ends drive it through an [`EngineHandle`] and render [`EngineEvent`]s.
pub mod binding;
pub mod conversation;
pub mod error;
pub mod events;
pub mod exchange;
pub mod ingest;
pub mod orchestrator;
pub mod phrasebook;
pub mod session;

pub use binding::{ActiveUser, Binding, bind_active_user};
pub use conversation::{ConversationStore, Message, Role};
pub use error::{EngineError, EngineResult, ExchangeError, IngestError, IngestResult};
pub use events::{EngineEvent, RefreshReason, RefreshRequest, SubmitIgnoredReason};
pub use exchange::{
    ExchangeId, ExchangeState, ExchangeTransition, ExchangeTransitionRejection,
    ExchangeTransitionResult,
};
pub use ingest::{
    EventFrameDecoder, IncrementStream, StreamShape, Utf8Decoder, drain, ingest, parse_record,
};
pub use orchestrator::{EngineCommand, EngineHandle, ExchangeOrchestrator};
pub use phrasebook::{BuiltinPhrasebook, Phrasebook};
pub use session::{OsRandomSessionIds, SessionController, SessionId, SessionIdSource};
