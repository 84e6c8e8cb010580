#![deny(unsafe_code)]

use std::process::ExitCode;
use std::sync::Arc;

use apothecary_api::{DirectoryClient, HttpChatTransport, UserProfile};
use apothecary_engine::{ActiveUser, EngineEvent, EngineHandle, ExchangeOrchestrator};
use snafu::{OptionExt, ResultExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::command::{Command, HELP};
use crate::error::{
    AppResult, BuildClientSnafu, EngineSnafu, EngineTaskSnafu, LoadUsersSnafu, NoUsersSnafu,
    ReadInputSnafu,
};
use crate::refresh::RequestsRefresher;
use crate::render::TranscriptRenderer;
use crate::settings::{ClientSettings, SettingsStore};

mod command;
mod error;
mod refresh;
mod render;
mod settings;

/// Terminal front end for the pharmacy assistant.
///
/// Logs go to stderr (filtered by `RUST_LOG`, `info` by default) so stdout carries only the
/// conversation.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "apothecary stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AppResult<()> {
    let store = SettingsStore::load();
    let settings = store.settings();
    tracing::info!(
        api_base = %settings.api_base,
        shape = ?settings.stream_shape,
        config = ?store.config_path(),
        "starting apothecary"
    );

    let directory = DirectoryClient::new(&settings.api_base).context(BuildClientSnafu {
        stage: "build-directory-client",
    })?;
    if !directory.health_check().await {
        tracing::warn!(api_base = %settings.api_base, "assistant API is not healthy");
    }

    let users = directory.fetch_users().await.context(LoadUsersSnafu {
        stage: "fetch-startup-users",
    })?;
    let locale_override = settings.locale.clone();
    let current = startup_user(&users, &settings)
        .map(|user| active_user_for(user, locale_override.as_deref()))
        .context(NoUsersSnafu {
            stage: "select-startup-user",
        })?;

    let transport = HttpChatTransport::new(&settings.api_base, &settings.chat_path).context(
        BuildClientSnafu {
            stage: "build-chat-transport",
        },
    )?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (engine, engine_task) = ExchangeOrchestrator::new(Arc::new(transport), events_tx)
        .with_stream_shape(settings.stream_shape)
        .spawn();

    let refresher = RequestsRefresher::new(directory.clone());
    let printer = tokio::spawn(print_transcript(events_rx, refresher.clone()));

    let mut session = TerminalSession {
        engine,
        directory,
        refresher,
        store,
        users,
        current,
        locale_override,
    };
    session
        .engine
        .bind_user(session.current.clone())
        .context(EngineSnafu {
            stage: "bind-startup-user",
        })?;

    let input_result = session.read_commands().await;

    // Dropping the last handle lets the engine drain and stop.
    drop(session);
    let engine_result = engine_task.await.context(EngineTaskSnafu {
        stage: "join-engine-task",
    })?;
    if let Err(error) = printer.await {
        tracing::warn!(error = %error, "transcript printer aborted");
    }

    input_result?;
    engine_result.context(EngineSnafu {
        stage: "run-engine",
    })
}

fn startup_user<'a>(
    users: &'a [UserProfile],
    settings: &ClientSettings,
) -> Option<&'a UserProfile> {
    let preferred = settings
        .default_user_id
        .as_deref()
        .and_then(|id| users.iter().find(|user| user.id == id));
    if preferred.is_none()
        && let Some(id) = &settings.default_user_id
    {
        tracing::warn!(
            user_id = %id,
            "configured default user not found, using the first user"
        );
    }
    preferred.or_else(|| users.first())
}

/// Binds `profile` in its own language unless a language was forced with `/lang`.
fn active_user_for(profile: &UserProfile, locale_override: Option<&str>) -> ActiveUser {
    let user = ActiveUser::from(profile);
    match locale_override {
        Some(locale) => user.with_locale(locale),
        None => user,
    }
}

struct TerminalSession {
    engine: EngineHandle,
    directory: DirectoryClient,
    refresher: RequestsRefresher,
    store: SettingsStore,
    users: Vec<UserProfile>,
    current: ActiveUser,
    locale_override: Option<String>,
}

impl TerminalSession {
    async fn read_commands(&mut self) -> AppResult<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
            stage: "read-terminal-line",
        })? {
            match Command::parse(&line) {
                Command::Say(text) => self.engine.submit(text).context(EngineSnafu {
                    stage: "submit-terminal-line",
                })?,
                Command::SwitchUser(user_id) => self.switch_user(&user_id).await?,
                Command::SwitchLocale(locale) => self.switch_locale(locale).await?,
                Command::ListUsers => self.list_users().await,
                Command::ShowRequests => {
                    print_line(&format!("-- {}", self.refresher.snapshot().summary())).await;
                }
                Command::Help => print_line(HELP).await,
                Command::Quit => break,
                Command::Unknown(line) => {
                    print_line(&format!("-- unknown command `{line}`, try /help")).await;
                }
            }
        }
        Ok(())
    }

    async fn switch_user(&mut self, user_id: &str) -> AppResult<()> {
        let profile = match self.users.iter().find(|user| user.id == user_id) {
            Some(profile) => profile.clone(),
            None => match self.directory.fetch_user(user_id).await {
                Ok(profile) => profile,
                Err(error) => {
                    tracing::warn!(user_id = %user_id, error = %error, "failed to load user");
                    print_line(&format!("-- no such user `{user_id}`")).await;
                    return Ok(());
                }
            },
        };

        self.current = active_user_for(&profile, self.locale_override.as_deref());
        self.engine
            .bind_user(self.current.clone())
            .context(EngineSnafu {
                stage: "bind-switched-user",
            })
    }

    /// Forces `locale` for every user, or returns to each user's own language on `None`.
    async fn switch_locale(&mut self, locale: Option<String>) -> AppResult<()> {
        let profile = match self.users.iter().find(|user| user.id == self.current.user_id) {
            Some(profile) => profile.clone(),
            None => match self.directory.fetch_user(&self.current.user_id).await {
                Ok(profile) => profile,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to reload the active user");
                    return Ok(());
                }
            },
        };

        self.locale_override = locale;
        let updated = ClientSettings {
            locale: self.locale_override.clone(),
            ..self.store.settings().as_ref().clone()
        };
        if let Err(error) = self.store.update(updated) {
            tracing::warn!(error = %error, "failed to remember the chosen language");
        }

        self.current = active_user_for(&profile, self.locale_override.as_deref());
        self.engine
            .bind_user(self.current.clone())
            .context(EngineSnafu {
                stage: "bind-switched-locale",
            })
    }

    async fn list_users(&mut self) {
        match self.directory.fetch_users().await {
            Ok(users) => self.users = users,
            Err(error) => tracing::warn!(error = %error, "failed to refresh the user list"),
        }

        let listing = self
            .users
            .iter()
            .map(|user| {
                let marker = if user.id == self.current.user_id { "*" } else { " " };
                format!(
                    "{marker} {} {} ({})",
                    user.id,
                    user.full_name,
                    user.role.as_str()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        print_line(&listing).await;
    }
}

async fn print_transcript(
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    refresher: RequestsRefresher,
) {
    let mut renderer = TranscriptRenderer::new();
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        if let Some(request) = event.as_refresh() {
            let refresher = refresher.clone();
            let request = request.clone();
            tokio::spawn(async move {
                refresher.refresh(&request).await;
            });
        }

        let Some(text) = renderer.render(&event) else {
            continue;
        };
        if let Err(error) = write_flush(&mut stdout, &text).await {
            tracing::warn!(error = %error, "failed to write transcript");
        }
    }
}

async fn print_line(text: &str) {
    let mut stdout = tokio::io::stdout();
    if let Err(error) = write_flush(&mut stdout, &format!("{text}\n")).await {
        tracing::warn!(error = %error, "failed to write to terminal");
    }
}

async fn write_flush(stdout: &mut tokio::io::Stdout, text: &str) -> std::io::Result<()> {
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await
}
