use apothecary_api::ApiError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("session identifier source unavailable on `{stage}`: {source}"))]
    SessionIdUnavailable {
        stage: &'static str,
        source: getrandom::Error,
    },
    #[snafu(display("conversation engine is no longer running (`{stage}`)"))]
    EngineStopped { stage: &'static str },
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IngestError {
    #[snafu(display("invalid UTF-8 sequence at byte {offset} on `{stage}`"))]
    InvalidUtf8 { stage: &'static str, offset: usize },
    #[snafu(display("stream ended inside a multi-byte character ({pending} bytes pending)"))]
    TruncatedUtf8 { stage: &'static str, pending: usize },
    #[snafu(display("response body failed on `{stage}`: {source}"))]
    Source {
        stage: &'static str,
        source: ApiError,
    },
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Why one exchange ended in the failed state. Never shown to the user.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExchangeError {
    #[snafu(display("chat transport failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: ApiError,
    },
    #[snafu(display("reply stream failed on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: IngestError,
    },
}
