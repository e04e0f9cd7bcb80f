use std::path::PathBuf;

use thiserror::Error;

use crate::http::error_chain_text;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Rate limiter configuration errors. A reservation larger than the bucket
/// can never be satisfied, so it is rejected instead of blocking forever.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("quota class '{class}': reservation of {requested} exceeds bucket capacity {capacity}")]
    ExceedsCapacity {
        class: String,
        requested: u64,
        capacity: f64,
    },
    #[error(
        "quota class '{class}': capacity ({capacity}) and refill rate ({refill_per_sec}/s) must be positive"
    )]
    InvalidQuota {
        class: String,
        capacity: f64,
        refill_per_sec: f64,
    },
}

/// Why one completion could not be turned into a garment record. Recovered
/// locally by retrying.
#[derive(Debug, Error)]
pub enum MalformedOutput {
    #[error("no JSON object found")]
    NoJsonObject,
    #[error("bad JSON ({0})")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("rate limiter misconfigured: {0}")]
    Configuration(#[from] RateLimitError),
    #[error("failed to read image {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image {} rejected: {reason}", path.display())]
    Image { path: PathBuf, reason: String },
    #[error("vision call failed for {image}: {detail}")]
    VisionCall {
        image: String,
        detail: String,
        #[source]
        source: BoxError,
    },
    #[error("completion call failed for {image} on attempt {attempt}: {detail}")]
    CompletionCall {
        image: String,
        attempt: usize,
        detail: String,
        #[source]
        source: BoxError,
    },
    #[error(
        "could not parse garment JSON for {image} after {attempts} attempts; raw response saved to {}",
        raw_path.display()
    )]
    Extraction {
        image: String,
        attempts: usize,
        raw_path: PathBuf,
    },
    #[error("failed to save raw response to {}: {source}", path.display())]
    RawDump {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExtractError {
    pub(crate) fn vision(image: &str, err: anyhow::Error) -> Self {
        Self::VisionCall {
            image: image.to_string(),
            detail: error_chain_text(&err, 512),
            source: err.into(),
        }
    }

    pub(crate) fn completion(image: &str, attempt: usize, err: anyhow::Error) -> Self {
        Self::CompletionCall {
            image: image.to_string(),
            attempt,
            detail: error_chain_text(&err, 512),
            source: err.into(),
        }
    }

    /// Path of the saved raw response, for terminal extraction failures.
    pub fn raw_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Extraction { raw_path, .. } => Some(raw_path),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StylistError {
    #[error("the wardrobe is empty; upload garments and process the wardrobe first")]
    EmptyWardrobe,
    #[error("rate limiter misconfigured: {0}")]
    Configuration(#[from] RateLimitError),
    #[error("failed to read the wardrobe: {detail}")]
    Store {
        detail: String,
        #[source]
        source: BoxError,
    },
    #[error("weather lookup failed for {city}: {detail}")]
    Weather {
        city: String,
        detail: String,
        #[source]
        source: BoxError,
    },
    #[error("stylist completion failed: {detail}")]
    Completion {
        detail: String,
        #[source]
        source: BoxError,
    },
}

impl StylistError {
    pub(crate) fn store(err: anyhow::Error) -> Self {
        Self::Store {
            detail: error_chain_text(&err, 512),
            source: err.into(),
        }
    }

    pub(crate) fn weather(city: &str, err: anyhow::Error) -> Self {
        Self::Weather {
            city: city.to_string(),
            detail: error_chain_text(&err, 512),
            source: err.into(),
        }
    }

    pub(crate) fn completion(err: anyhow::Error) -> Self {
        Self::Completion {
            detail: error_chain_text(&err, 512),
            source: err.into(),
        }
    }
}
