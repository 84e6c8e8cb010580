use std::path::{Path, PathBuf};
use std::sync::Arc;

use apothecary_api::{DEFAULT_API_BASE, DEFAULT_CHAT_PATH};
use apothecary_engine::StreamShape;
use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "apothecary";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "APOTHECARY_";

/// Connection and startup settings for the terminal client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default)]
    pub stream_shape: StreamShape,
    /// Conversation language forced for every user; each user's own language when unset.
    #[serde(default)]
    pub locale: Option<String>,
    /// User to bind at startup; the first directory entry is used when unset.
    #[serde(default)]
    pub default_user_id: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            chat_path: default_chat_path(),
            stream_shape: StreamShape::default(),
            locale: None,
            default_user_id: None,
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        self.api_base = non_blank_or(&self.api_base, default_api_base);
        self.chat_path = non_blank_or(&self.chat_path, default_chat_path);
        self.locale = self
            .locale
            .map(|locale| locale.trim().to_ascii_lowercase())
            .filter(|locale| !locale.is_empty());
        self.default_user_id = self
            .default_user_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".apothecary"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(&config_path, Env::prefixed(ENV_PREFIX));
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from(path: &Path, env: Env) -> ClientSettings {
        let mut figment = Figment::from(Serialized::defaults(ClientSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        match figment.merge(env).extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ClientSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        let content = serde_json::to_vec_pretty(settings).context(EncodeSnafu {
            stage: "encode-client-settings",
        })?;

        let directory = self.config_path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(directory).context(SaveSnafu {
            stage: "create-settings-directory",
            path: directory,
        })?;

        // Readers see either the previous file or the complete new one.
        let staged = self.config_path.with_extension("json.tmp");
        std::fs::write(&staged, content).context(SaveSnafu {
            stage: "stage-settings-file",
            path: &staged,
        })?;
        std::fs::rename(&staged, &self.config_path).context(SaveSnafu {
            stage: "swap-settings-file",
            path: &self.config_path,
        })?;

        tracing::info!(path = ?self.config_path, "saved client settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to encode client settings on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to save client settings at {path:?} on `{stage}`: {source}"))]
    Save {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: &str, fallback: fn() -> String) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback()
    } else {
        value.to_string()
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_chat_path() -> String {
    DEFAULT_CHAT_PATH.to_string()
}
