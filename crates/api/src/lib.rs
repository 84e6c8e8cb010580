#![deny(unsafe_code)]

//! Client for the pharmacy assistant's remote API.
//!
//! The chat endpoint is exposed through [`ChatTransport`] so the conversation engine never
//! depends on `reqwest` directly; directory and request-list endpoints live on
//! [`DirectoryClient`].
pub mod chat;
pub mod directory;
pub mod error;
pub mod types;

pub use chat::{
    BoxFuture, ByteStream, ChatResponse, ChatTransport, DEFAULT_CHAT_PATH, HttpChatTransport,
};
pub use directory::{DEFAULT_PAGE_LIMIT, DirectoryClient, PageQuery};
pub use error::{ApiError, ApiResult};
pub use types::{
    ChatRequest, PharmacistDashboard, PrescriptionRequest, SupportTicket, UserProfile, UserRole,
};

/// Base URL used when no configuration overrides it.
pub const DEFAULT_API_BASE: &str = "http://localhost:8000";

/// Joins a base URL and a path without doubling or dropping the separator.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}
