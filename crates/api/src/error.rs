use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    Send {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("{url} returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to read response body on `{stage}`: {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to decode payload from {url} on `{stage}`: {source}"))]
    DecodePayload {
        stage: &'static str,
        url: String,
        source: serde_json::Error,
    },
}

impl ApiError {
    /// HTTP status attached to the failure, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::BuildClient { .. }
            | Self::Send { .. }
            | Self::ReadBody { .. }
            | Self::DecodePayload { .. } => None,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
