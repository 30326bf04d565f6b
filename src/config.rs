use crate::constants::{
    APP_NAME, COMPILE_TIMEOUT, CONFIG_FILE_NAME, DEFAULT_AUTO_SAVE_INTERVAL,
    DEFAULT_PLANTUML_COMMAND, REFRESH_DEBOUNCE,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Directory shown in the preview list.
    pub diagram_directory: Option<PathBuf>,
    pub auto_save_enabled: bool,
    pub auto_save_interval_secs: u64,
    pub refresh_debounce_ms: u64,
    pub plantuml_command: String,
    pub compile_timeout_secs: u64,
    /// Diagrams that were open when the session manager last shut down.
    pub open_files: Vec<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            diagram_directory: None,
            auto_save_enabled: false,
            auto_save_interval_secs: DEFAULT_AUTO_SAVE_INTERVAL.as_secs(),
            refresh_debounce_ms: REFRESH_DEBOUNCE.as_millis() as u64,
            plantuml_command: DEFAULT_PLANTUML_COMMAND.to_string(),
            compile_timeout_secs: COMPILE_TIMEOUT.as_secs(),
            open_files: Vec::new(),
        }
    }
}

impl AppConfig {
    /// `puml-studio` under the platform config directory, or under the
    /// working directory when the platform has none.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME)
    }

    pub fn config_file() -> PathBuf {
        Self::config_dir().join(CONFIG_FILE_NAME)
    }

    /// Reads the user config. A missing file is created with defaults; an
    /// unreadable one is left alone and defaults are used.
    pub fn load() -> Self {
        let path = Self::config_file();
        match Self::load_from(&path) {
            Ok(Some(config)) => config,
            Ok(None) => {
                let default = Self::default();
                if let Err(e) = default.save() {
                    tracing::warn!("Failed to write default config: {:#}", e);
                }
                default
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable config: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn load_from(file: &Path) -> anyhow::Result<Option<Self>> {
        if !file.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(file).with_context(|| format!("Cannot read {:?}", file))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config in {:?}", file))
            .map(Some)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_file())
    }

    pub fn save_to(&self, file: &Path) -> anyhow::Result<()> {
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir).with_context(|| format!("Cannot create {:?}", dir))?;
        }
        fs::write(file, self.to_toml()?).with_context(|| format!("Cannot write {:?}", file))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_secs(self.auto_save_interval_secs.max(1))
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs.max(1))
    }
}
