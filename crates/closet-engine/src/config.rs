use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::extract::{ExtractionSettings, DEFAULT_COMPLETION_CAP, DEFAULT_MAX_RETRIES};
use crate::weather::Location;

pub const DEFAULT_ENV_FILE: &str = "closet.env";
pub const DEFAULT_IMAGE_DIR: &str = "wardrobe_images";
pub const DEFAULT_WARDROBE: &str = "closet.ndjson";
pub const DEFAULT_DEPLOYMENT: &str = "gpt-4o-mini";
pub const DEFAULT_API_VERSION: &str = "2024-08-01-preview";
pub const DEFAULT_CITY: &str = "Toronto";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Azure,
    Dryrun,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "azure" => Ok(Self::Azure),
            "dryrun" | "dry-run" | "offline" => Ok(Self::Dryrun),
            other => bail!("unknown CLOSET_PROVIDER '{other}' (expected azure or dryrun)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AzureVisionSettings {
    pub endpoint: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AzureOpenAiSettings {
    pub endpoint: String,
    pub key: String,
    pub deployment: String,
    pub api_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderSettings {
    Azure {
        vision: AzureVisionSettings,
        openai: AzureOpenAiSettings,
    },
    Dryrun,
}

impl ProviderSettings {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Azure { .. } => ProviderKind::Azure,
            Self::Dryrun => ProviderKind::Dryrun,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub providers: ProviderSettings,
    pub image_dir: PathBuf,
    pub wardrobe_path: PathBuf,
    events_path: Option<PathBuf>,
    pub vision_per_minute: u32,
    pub completion_tokens_per_minute: u32,
    pub stylist_tokens_per_minute: u32,
    pub extraction: ExtractionSettings,
    pub request_timeout: Duration,
    pub city: String,
    pub fallback_location: Location,
}

impl Config {
    /// Reads the process environment after loading `env_file` when it
    /// exists. Variables already set win over the file.
    pub fn from_env(env_file: Option<&Path>) -> Result<Self> {
        if let Some(path) = env_file {
            if path.is_file() {
                dotenv::from_path(path)
                    .with_context(|| format!("failed loading {}", path.display()))?;
                debug!(path = %path.display(), "loaded env file");
            }
        }
        Self::from_lookup(non_empty_env)
    }

    /// Builds a config from an arbitrary variable source. Blank values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let kind = match get("CLOSET_PROVIDER") {
            Some(raw) => raw.parse::<ProviderKind>()?,
            None => ProviderKind::Azure,
        };
        let providers = match kind {
            ProviderKind::Dryrun => ProviderSettings::Dryrun,
            ProviderKind::Azure => {
                let require = |key: &str| {
                    get(key).with_context(|| {
                        format!("{key} is not set (set it, or use CLOSET_PROVIDER=dryrun)")
                    })
                };
                ProviderSettings::Azure {
                    vision: AzureVisionSettings {
                        endpoint: require("AZURE_VISION_ENDPOINT")?,
                        key: require("AZURE_VISION_KEY")?,
                    },
                    openai: AzureOpenAiSettings {
                        endpoint: require("AZURE_OPENAI_ENDPOINT")?,
                        key: require("AZURE_OPENAI_KEY")?,
                        deployment: get("AZURE_OPENAI_DEPLOYMENT")
                            .unwrap_or_else(|| DEFAULT_DEPLOYMENT.to_string()),
                        api_version: get("AZURE_OPENAI_API_VERSION")
                            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
                    },
                }
            }
        };

        let number = |key: &str, default: f64, min: f64, max: f64| {
            value_as_f64(get(key).as_deref(), default, min, max)
        };
        let fallback = Location::toronto();

        Ok(Self {
            providers,
            image_dir: get("CLOSET_IMAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_DIR)),
            wardrobe_path: get("CLOSET_WARDROBE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WARDROBE)),
            events_path: get("CLOSET_EVENTS").map(PathBuf::from),
            vision_per_minute: number("CLOSET_VISION_PER_MINUTE", 20.0, 1.0, 100_000.0) as u32,
            completion_tokens_per_minute: number(
                "CLOSET_COMPLETION_TOKENS_PER_MINUTE",
                1_000.0,
                1.0,
                100_000_000.0,
            ) as u32,
            stylist_tokens_per_minute: number(
                "CLOSET_STYLIST_TOKENS_PER_MINUTE",
                30_000.0,
                1.0,
                100_000_000.0,
            ) as u32,
            extraction: ExtractionSettings {
                max_retries: number("CLOSET_MAX_RETRIES", DEFAULT_MAX_RETRIES as f64, 0.0, 10.0)
                    as usize,
                backoff: Duration::from_secs_f64(number("CLOSET_RETRY_BACKOFF", 2.0, 0.0, 60.0)),
                completion_cap: number(
                    "CLOSET_COMPLETION_CAP",
                    DEFAULT_COMPLETION_CAP as f64,
                    1.0,
                    16_384.0,
                ) as u64,
            },
            request_timeout: Duration::from_secs_f64(number(
                "CLOSET_REQUEST_TIMEOUT",
                60.0,
                1.0,
                600.0,
            )),
            city: get("CLOSET_CITY").unwrap_or_else(|| DEFAULT_CITY.to_string()),
            fallback_location: Location {
                latitude: number("CLOSET_LATITUDE", fallback.latitude, -90.0, 90.0),
                longitude: number("CLOSET_LONGITUDE", fallback.longitude, -180.0, 180.0),
                timezone: get("CLOSET_TIMEZONE").unwrap_or(fallback.timezone),
            },
        })
    }

    /// All-offline configuration rooted at `dir`.
    pub fn dryrun(dir: &Path) -> Self {
        Self {
            providers: ProviderSettings::Dryrun,
            image_dir: dir.join(DEFAULT_IMAGE_DIR),
            wardrobe_path: dir.join(DEFAULT_WARDROBE),
            events_path: None,
            vision_per_minute: 20,
            completion_tokens_per_minute: 1_000,
            stylist_tokens_per_minute: 30_000,
            extraction: ExtractionSettings::default(),
            request_timeout: Duration::from_secs(60),
            city: DEFAULT_CITY.to_string(),
            fallback_location: Location::toronto(),
        }
    }

    pub fn with_image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_dir = dir.into();
        self
    }

    pub fn with_wardrobe_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wardrobe_path = path.into();
        self
    }

    /// `CLOSET_EVENTS`, or `events.jsonl` next to the wardrobe file.
    pub fn events_path(&self) -> PathBuf {
        if let Some(path) = &self.events_path {
            return path.clone();
        }
        match self.wardrobe_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join("events.jsonl"),
            _ => PathBuf::from("events.jsonl"),
        }
    }

    /// `summary.json` next to the event log.
    pub fn summary_path(&self) -> PathBuf {
        self.events_path().with_file_name("summary.json")
    }
}

fn value_as_f64(value: Option<&str>, default: f64, min: f64, max: f64) -> f64 {
    value
        .and_then(|text| text.trim().parse::<f64>().ok())
        .filter(|parsed| parsed.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
