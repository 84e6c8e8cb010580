use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use snafu::{IntoError, ResultExt};

use super::error::{ApiResult, BuildClientSnafu, ReadBodySnafu, SendSnafu, StatusSnafu};
use super::join_url;
use super::types::ChatRequest;

pub const DEFAULT_CHAT_PATH: &str = "/chat";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ByteStream = BoxStream<'static, ApiResult<Bytes>>;

/// An opened chat exchange: the response head has arrived and the body is ready to stream.
pub struct ChatResponse {
    pub content_type: Option<String>,
    pub body: ByteStream,
}

impl ChatResponse {
    pub fn new(content_type: Option<String>, body: ByteStream) -> Self {
        Self { content_type, body }
    }
}

impl std::fmt::Debug for ChatResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ChatResponse")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Opens one streamed chat exchange against the remote assistant.
///
/// Implementations must resolve to an error for non-2xx responses so callers only ever see a
/// body for successful exchanges.
pub trait ChatTransport: Send + Sync {
    fn open<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, ApiResult<ChatResponse>>;
}

pub struct HttpChatTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpChatTransport {
    pub fn new(api_base: &str, chat_path: &str) -> ApiResult<Self> {
        let client = reqwest::Client::builder().build().context(BuildClientSnafu {
            stage: "build-chat-client",
        })?;
        Ok(Self::with_client(client, api_base, chat_path))
    }

    pub fn with_client(client: reqwest::Client, api_base: &str, chat_path: &str) -> Self {
        Self {
            client,
            endpoint: join_url(api_base, chat_path),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn open_inner(&self, request: &ChatRequest) -> ApiResult<ChatResponse> {
        tracing::debug!(
            endpoint = %self.endpoint,
            session_id = %request.session_id,
            "opening chat exchange"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .context(SendSnafu {
                stage: "send-chat-request",
                url: self.endpoint.clone(),
            })?;

        let status = response.status();
        if !status.is_success() {
            // The body is only read for diagnostics; a broken body must not mask the status.
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                stage: "chat-http-status",
                url: self.endpoint.clone(),
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes_stream()
            .map_err(|source| {
                ReadBodySnafu {
                    stage: "read-chat-chunk",
                }
                .into_error(source)
            })
            .boxed();

        Ok(ChatResponse::new(content_type, body))
    }
}

impl ChatTransport for HttpChatTransport {
    fn open<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, ApiResult<ChatResponse>> {
        Box::pin(self.open_inner(request))
    }
}
