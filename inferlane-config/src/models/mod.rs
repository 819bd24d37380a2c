use anyhow::{Context, anyhow};
use inferlane_core::{SchedulerConfig, WatchConfig};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::validation::ConfigGuardRails;

/// Path to a TOML or JSON config file.
pub const CONFIG_PATH_ENV: &str = "INFERLANE_CONFIG_PATH";
/// Inline JSON config, used when no path is given.
pub const CONFIG_JSON_ENV: &str = "INFERLANE_CONFIG_JSON";

const DEFAULT_CANDIDATES: &[&str] = &[
    "inferlane.toml",
    "inferlane.json",
    "config/inferlane.toml",
    "config/inferlane.json",
];

/// Where the loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Everything a deployment can tune. Missing sections and fields fall back to
/// their defaults, so a file may override a single value.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct InferlaneConfig {
    /// Concurrency limits, deadlines, and adaptive latency watermarks. Lower
    /// `processor.max_concurrency` if the backend degrades under parallel
    /// load; the adaptive policy never grows past it.
    pub scheduler: SchedulerConfig,
    /// Debounce window and ignore rules for the change coalescer. Longer
    /// windows batch editor save bursts more aggressively at the cost of
    /// slower re-indexing.
    pub watch: WatchConfig,
}

/// Encodings a config file may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Format named by the file extension, or `None` when it must be sniffed.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "toml" | "tml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl ConfigSource {
    /// Decides where [`InferlaneConfig::load_from_env`] reads from, looking
    /// for default files under `dir`. Nothing is parsed here.
    pub fn locate(dir: &Path) -> Self {
        if let Some(path) = non_empty_var(CONFIG_PATH_ENV) {
            Self::EnvPath(PathBuf::from(path))
        } else if non_empty_var(CONFIG_JSON_ENV).is_some() {
            Self::EnvInline
        } else if let Some(path) = InferlaneConfig::find_default_file_in(dir) {
            Self::File(path)
        } else {
            Self::Default
        }
    }
}

impl InferlaneConfig {
    /// Loads from the first source that is set: `$INFERLANE_CONFIG_PATH`,
    /// then `$INFERLANE_CONFIG_JSON`, then a default file in the working
    /// directory. Falls back to defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        let source = ConfigSource::locate(Path::new("."));
        let config = match &source {
            ConfigSource::Default => Self::default(),
            ConfigSource::EnvPath(path) | ConfigSource::File(path) => Self::load_from_file(path)?,
            ConfigSource::EnvInline => {
                let raw = non_empty_var(CONFIG_JSON_ENV).unwrap_or_default();
                Self::parse_json(&raw)
                    .with_context(|| format!("{CONFIG_JSON_ENV} holds no usable config"))?
            }
        };
        Ok((config, source))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let origin = path.display().to_string();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {origin}"))?;
        Self::decode(&contents, ConfigFormat::from_path(path), &origin)
    }

    /// Decodes config text of unknown format.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        Self::decode(contents, None, origin)
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        Self::decode(raw, Some(ConfigFormat::Json), "inline config")
    }

    /// Unknown formats are read as TOML first, then JSON.
    fn decode(contents: &str, format: Option<ConfigFormat>, origin: &str) -> anyhow::Result<Self> {
        match format {
            Some(ConfigFormat::Toml) => {
                toml::from_str(contents).with_context(|| format!("{origin} is not valid TOML"))
            }
            Some(ConfigFormat::Json) => serde_json::from_str(contents)
                .with_context(|| format!("{origin} is not valid JSON")),
            None => toml::from_str(contents).or_else(|toml_err| {
                serde_json::from_str(contents).map_err(|json_err| {
                    anyhow!("{origin} is neither TOML ({toml_err}) nor JSON ({json_err})")
                })
            }),
        }
    }

    /// First of `inferlane.{toml,json}` and `config/inferlane.{toml,json}`
    /// present under `dir`.
    pub fn find_default_file_in(dir: &Path) -> Option<PathBuf> {
        let found = DEFAULT_CANDIDATES
            .iter()
            .map(|candidate| dir.join(candidate))
            .find(|path| path.is_file())?;
        match found.strip_prefix(".") {
            Ok(relative) => Some(relative.to_path_buf()),
            Err(_) => Some(found),
        }
    }

    /// Rejects settings the scheduler cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigGuardRails::check(self).into_result()?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("config cannot be rendered as TOML")
    }
}
