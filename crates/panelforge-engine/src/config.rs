use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ForgeError;

pub const DEFAULT_API_BASE: &str = "https://ark.cn-beijing.volces.com/api/v3";
pub const DEFAULT_IMAGE_MODEL: &str = "doubao-seedream-4-0-250828";
pub const DEFAULT_TEXT_MODEL: &str = "doubao-seed-1-6-250615";

const API_KEY_VARS: &[&str] = &["ARK_API_KEY", "DOUBAO_API_KEY"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Ark,
    Dryrun,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ark" | "doubao" | "volcengine" => Some(Self::Ark),
            "dryrun" | "dry-run" | "offline" => Some(Self::Dryrun),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ark => "ark",
            Self::Dryrun => "dryrun",
        }
    }

    pub fn needs_credential(self) -> bool {
        matches!(self, Self::Ark)
    }
}

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub image_provider: ProviderKind,
    pub text_provider: ProviderKind,
    pub image_model: String,
    pub text_model: String,
    pub temp_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub styles_dir: PathBuf,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub upstream_retries: u32,
    pub image_timeout: Duration,
    pub text_timeout: Duration,
    pub download_timeout: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ForgeError> {
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ForgeError> {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let provider = |key: &str| -> Result<ProviderKind, ForgeError> {
            match lookup(key) {
                None => Ok(ProviderKind::Ark),
                Some(raw) => ProviderKind::parse(&raw).ok_or_else(|| {
                    ForgeError::Configuration(format!("{key}: unknown provider '{raw}'"))
                }),
            }
        };
        let clamped = |key: &str, default: u64, min: u64, max: u64| -> u64 {
            lookup(key)
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(|value| value.clamp(min, max))
                .unwrap_or(default)
        };

        let config = Self {
            api_key: API_KEY_VARS.iter().find_map(|key| lookup(*key)),
            api_base: lookup("ARK_API_BASE")
                .map(|base| base.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            image_provider: provider("PANELFORGE_IMAGE_PROVIDER")?,
            text_provider: provider("PANELFORGE_TEXT_PROVIDER")?,
            image_model: lookup("PANELFORGE_IMAGE_MODEL")
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            text_model: lookup("PANELFORGE_TEXT_MODEL")
                .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
            temp_dir: lookup("PANELFORGE_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("temp")),
            scripts_dir: lookup("PANELFORGE_SCRIPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("scripts")),
            styles_dir: lookup("PANELFORGE_STYLES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("system_prompts")),
            retention: Duration::from_secs(
                clamped("PANELFORGE_RETENTION_HOURS", 24, 1, 720) * 3600,
            ),
            sweep_interval: Duration::from_secs(
                clamped("PANELFORGE_SWEEP_INTERVAL_MINUTES", 60, 1, 1440) * 60,
            ),
            upstream_retries: clamped("PANELFORGE_UPSTREAM_RETRIES", 3, 1, 6) as u32,
            image_timeout: Duration::from_secs(clamped(
                "PANELFORGE_IMAGE_TIMEOUT_SECS",
                60,
                30,
                60,
            )),
            text_timeout: Duration::from_secs(clamped(
                "PANELFORGE_TEXT_TIMEOUT_SECS",
                60,
                30,
                60,
            )),
            download_timeout: Duration::from_secs(30),
        };
        config.validate()?;
        Ok(config)
    }

    /// Offline configuration rooted at `root`, used by `--dryrun` and tests.
    pub fn dryrun(root: &Path) -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            image_provider: ProviderKind::Dryrun,
            text_provider: ProviderKind::Dryrun,
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            temp_dir: root.join("temp"),
            scripts_dir: root.join("scripts"),
            styles_dir: root.join("system_prompts"),
            retention: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(3600),
            upstream_retries: 3,
            image_timeout: Duration::from_secs(60),
            text_timeout: Duration::from_secs(60),
            download_timeout: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), ForgeError> {
        let needs_key =
            self.image_provider.needs_credential() || self.text_provider.needs_credential();
        if needs_key && self.api_key.is_none() {
            return Err(ForgeError::Configuration(format!(
                "missing API credential: set {}",
                API_KEY_VARS.join(" or ")
            )));
        }
        Ok(())
    }

    pub fn images_endpoint(&self) -> String {
        format!("{}/images/generations", self.api_base)
    }

    pub fn chat_endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
