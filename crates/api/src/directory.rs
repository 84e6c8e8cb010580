use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use super::error::{
    ApiResult, BuildClientSnafu, DecodePayloadSnafu, ReadBodySnafu, SendSnafu, StatusSnafu,
};
use super::join_url;
use super::types::{
    Envelope, PharmacistDashboard, PrescriptionRequest, StatusPatch, SupportTicket, UserProfile,
};

pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Paging and filtering for request-list endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub limit: u32,
    pub offset: u32,
    pub status_filter: Option<String>,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
            status_filter: None,
        }
    }
}

impl PageQuery {
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status_filter = Some(status.into());
        self
    }

    fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("limit", self.limit.to_string()),
            ("offset", self.offset.to_string()),
        ];
        if let Some(status) = &self.status_filter {
            pairs.push(("status_filter", status.clone()));
        }
        pairs
    }
}

/// Plain request/response access to the user directory and request lists.
#[derive(Clone)]
pub struct DirectoryClient {
    client: reqwest::Client,
    api_base: String,
}

impl DirectoryClient {
    pub fn new(api_base: &str) -> ApiResult<Self> {
        let client = reqwest::Client::builder().build().context(BuildClientSnafu {
            stage: "build-directory-client",
        })?;
        Ok(Self::with_client(client, api_base))
    }

    pub fn with_client(client: reqwest::Client, api_base: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim().to_string(),
        }
    }

    pub async fn fetch_users(&self) -> ApiResult<Vec<UserProfile>> {
        self.get_json("fetch-users", "/users", &[]).await
    }

    pub async fn fetch_user(&self, user_id: &str) -> ApiResult<UserProfile> {
        self.get_json("fetch-user", &format!("/users/{user_id}"), &[]).await
    }

    pub async fn fetch_prescriptions(
        &self,
        user_id: &str,
        page: &PageQuery,
    ) -> ApiResult<Vec<PrescriptionRequest>> {
        self.get_json(
            "fetch-prescriptions",
            &format!("/users/{user_id}/prescriptions"),
            &page.to_pairs(),
        )
        .await
    }

    pub async fn fetch_support_tickets(
        &self,
        user_id: &str,
        page: &PageQuery,
    ) -> ApiResult<Vec<SupportTicket>> {
        self.get_json(
            "fetch-support-tickets",
            &format!("/users/{user_id}/support-tickets"),
            &page.to_pairs(),
        )
        .await
    }

    pub async fn update_prescription_status(
        &self,
        user_id: &str,
        prescription_id: &str,
        status: &str,
    ) -> ApiResult<PrescriptionRequest> {
        self.patch_json(
            "update-prescription-status",
            &format!("/users/{user_id}/prescriptions/{prescription_id}/status"),
            &StatusPatch { status },
        )
        .await
    }

    pub async fn update_support_status(
        &self,
        user_id: &str,
        ticket_id: &str,
        status: &str,
    ) -> ApiResult<SupportTicket> {
        self.patch_json(
            "update-support-status",
            &format!("/users/{user_id}/support-tickets/{ticket_id}/status"),
            &StatusPatch { status },
        )
        .await
    }

    pub async fn fetch_dashboard(&self, user_id: &str) -> ApiResult<PharmacistDashboard> {
        self.get_json(
            "fetch-dashboard",
            "/pharmacist/dashboard",
            &[("user_id", user_id.to_string())],
        )
        .await
    }

    /// Returns `false` on any failure instead of an error.
    pub async fn health_check(&self) -> bool {
        let url = join_url(&self.api_base, "/health");
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::warn!(url = %url, error = %error, "health check failed");
                false
            }
        }
    }

    async fn get_json<T>(
        &self,
        stage: &'static str,
        path: &str,
        query: &[(&'static str, String)],
    ) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let url = join_url(&self.api_base, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .context(SendSnafu {
                stage,
                url: url.clone(),
            })?;
        Self::decode(stage, url, response).await
    }

    async fn patch_json<B, T>(&self, stage: &'static str, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = join_url(&self.api_base, path);
        let response = self
            .client
            .patch(&url)
            .json(body)
            .send()
            .await
            .context(SendSnafu {
                stage,
                url: url.clone(),
            })?;
        Self::decode(stage, url, response).await
    }

    async fn decode<T>(
        stage: &'static str,
        url: String,
        response: reqwest::Response,
    ) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        let payload = response.text().await.context(ReadBodySnafu { stage })?;

        if !status.is_success() {
            tracing::warn!(url = %url, status = status.as_u16(), stage, "api request failed");
            return StatusSnafu {
                stage,
                url,
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        let envelope = serde_json::from_str::<Envelope<T>>(&payload)
            .context(DecodePayloadSnafu { stage, url })?;
        Ok(envelope.into_inner())
    }
}
