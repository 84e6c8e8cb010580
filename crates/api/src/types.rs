use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Locale used when a profile carries none.
pub const DEFAULT_LOCALE: &str = "en";

/// Role of a directory user. Unknown role strings fall back to `Customer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum UserRole {
    #[default]
    Customer,
    Pharmacist,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Pharmacist => "pharmacist",
        }
    }

    pub fn is_pharmacist(&self) -> bool {
        matches!(self, Self::Pharmacist)
    }
}

impl From<String> for UserRole {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("pharmacist") {
            Self::Pharmacist
        } else {
            Self::Customer
        }
    }
}

/// One entry of `GET /users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub full_name: String,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default = "default_locale", alias = "preferred_lang")]
    pub lang: String,
}

/// Body of `POST /chat`.
///
/// `prev_user_message` is always serialized (as `null` when absent); the other optional
/// fields are omitted when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<UserRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_lang: Option<String>,
    #[serde(default)]
    pub prev_user_message: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_id: session_id.into(),
            user_id: None,
            user_role: None,
            preferred_lang: None,
            prev_user_message: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>, role: UserRole) -> Self {
        self.user_id = Some(user_id.into());
        self.user_role = Some(role);
        self
    }

    pub fn with_preferred_lang(mut self, lang: impl Into<String>) -> Self {
        self.preferred_lang = Some(lang.into());
        self
    }

    pub fn with_prev_user_message(mut self, previous: Option<String>) -> Self {
        self.prev_user_message = previous;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescriptionRequest {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub medication_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportTicket {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Aggregates served to pharmacists by `GET /pharmacist/dashboard`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PharmacistDashboard {
    #[serde(default)]
    pub prescriptions: Vec<PrescriptionRequest>,
    #[serde(default)]
    pub support_requests: Vec<SupportTicket>,
    #[serde(default)]
    pub medications_sold: Vec<Value>,
}

/// The API wraps most payloads as `{ "data": ... }`, but some routes answer bare.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    pub(crate) fn into_inner(self) -> T {
        match self {
            Self::Wrapped { data } => data,
            Self::Bare(value) => value,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct StatusPatch<'a> {
    pub status: &'a str,
}

fn default_locale() -> String {
    DEFAULT_LOCALE.to_string()
}
