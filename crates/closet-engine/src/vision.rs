use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::Value;

use crate::http::{build_client, response_json_or_error, trim_base_url};
use crate::imaging::image_digest;

pub const NO_CAPTION: &str = "No caption";

/// Caption and tags returned by a visual-analysis call.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct VisionAnalysis {
    pub caption: Option<String>,
    pub tags: Vec<String>,
}

impl VisionAnalysis {
    pub fn caption_or_sentinel(&self) -> &str {
        self.caption.as_deref().unwrap_or(NO_CAPTION)
    }

    /// The two-line block embedded in the extraction prompt.
    pub fn summary(&self) -> String {
        format!(
            "Caption: {}\nTags: {}",
            self.caption_or_sentinel(),
            self.tags.join(", ")
        )
    }
}

pub trait VisionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, image: &[u8]) -> Result<VisionAnalysis>;
}

/// Azure AI Vision "Analyze Image" (v3.2) with the Description and Tags
/// features.
pub struct AzureVisionProvider {
    endpoint: String,
    key: String,
    http: HttpClient,
}

impl AzureVisionProvider {
    pub fn new(endpoint: &str, key: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: trim_base_url(endpoint),
            key: key.trim().to_string(),
            http: build_client(timeout)?,
        })
    }

    fn analyze_url(&self) -> String {
        format!("{}/vision/v3.2/analyze", self.endpoint)
    }

    fn parse_analysis(payload: &Value) -> VisionAnalysis {
        let caption = payload
            .pointer("/description/captions/0/text")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        let tags = payload
            .get("tags")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("name").and_then(Value::as_str))
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        VisionAnalysis { caption, tags }
    }
}

impl VisionProvider for AzureVisionProvider {
    fn name(&self) -> &str {
        "azure-vision"
    }

    fn analyze(&self, image: &[u8]) -> Result<VisionAnalysis> {
        let endpoint = self.analyze_url();
        let response = self
            .http
            .post(&endpoint)
            .query(&[("visualFeatures", "Description,Tags")])
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .with_context(|| format!("Azure Vision request failed ({endpoint})"))?;
        let payload = response_json_or_error("Azure Vision", response)?;
        Ok(Self::parse_analysis(&payload))
    }
}

/// Offline stand-in: a caption keyed by the image digest and fixed tags.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryrunVisionProvider;

impl VisionProvider for DryrunVisionProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn analyze(&self, image: &[u8]) -> Result<VisionAnalysis> {
        let digest = image_digest(image);
        Ok(VisionAnalysis {
            caption: Some(format!("a garment photo {}", &digest[..8])),
            tags: vec!["clothing".to_string(), "garment".to_string()],
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_analysis_reads_first_caption_and_tag_names() {
        let payload = json!({
            "description": {
                "captions": [
                    {"text": "a blue shirt on a hanger", "confidence": 0.91},
                    {"text": "a shirt", "confidence": 0.5}
                ]
            },
            "tags": [{"name": "shirt"}, {"name": "blue"}, {"confidence": 0.2}]
        });
        let analysis = AzureVisionProvider::parse_analysis(&payload);
        assert_eq!(analysis.caption.as_deref(), Some("a blue shirt on a hanger"));
        assert_eq!(analysis.tags, vec!["shirt", "blue"]);
    }

    #[test]
    fn missing_caption_uses_sentinel() {
        let analysis = AzureVisionProvider::parse_analysis(&json!({
            "description": {"captions": []},
            "tags": []
        }));
        assert_eq!(analysis.caption, None);
        assert_eq!(analysis.summary(), "Caption: No caption\nTags: ");
    }

    #[test]
    fn analyze_url_joins_trimmed_endpoint() -> anyhow::Result<()> {
        let provider = AzureVisionProvider::new(
            "https://closet.cognitiveservices.azure.com/",
            "key",
            Duration::from_secs(5),
        )?;
        assert_eq!(
            provider.analyze_url(),
            "https://closet.cognitiveservices.azure.com/vision/v3.2/analyze"
        );
        Ok(())
    }

    #[test]
    fn dryrun_caption_is_stable_per_image() -> anyhow::Result<()> {
        let first = DryrunVisionProvider.analyze(b"shirt-bytes")?;
        let second = DryrunVisionProvider.analyze(b"shirt-bytes")?;
        assert_eq!(first, second);
        assert!(first.summary().starts_with("Caption: a garment photo "));
        Ok(())
    }
}
