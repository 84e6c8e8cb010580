use apothecary_api::ApiError;
use apothecary_engine::EngineError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to build API client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: ApiError,
    },
    #[snafu(display("failed to load users on `{stage}`: {source}"))]
    LoadUsers {
        stage: &'static str,
        source: ApiError,
    },
    #[snafu(display("the user directory is empty (`{stage}`)"))]
    NoUsers { stage: &'static str },
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("conversation engine failed on `{stage}`: {source}"))]
    Engine {
        stage: &'static str,
        source: EngineError,
    },
    #[snafu(display("conversation engine task aborted on `{stage}`: {source}"))]
    EngineTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

pub type AppResult<T> = Result<T, AppError>;
