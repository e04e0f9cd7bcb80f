use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use crate::http::{build_client, response_json_or_error, trim_base_url};
use crate::prompt::CAPTION_PREFIX;

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u64,
    /// Ask the service to constrain output to one JSON object.
    pub json_mode: bool,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// Prompt plus completion tokens, when the service reports usage.
    pub total_tokens: Option<u64>,
}

pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Azure OpenAI chat completions for one deployment.
pub struct AzureOpenAiProvider {
    endpoint: String,
    key: String,
    deployment: String,
    api_version: String,
    http: HttpClient,
}

impl AzureOpenAiProvider {
    pub fn new(
        endpoint: &str,
        key: &str,
        deployment: &str,
        api_version: &str,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            endpoint: trim_base_url(endpoint),
            key: key.trim().to_string(),
            deployment: deployment.trim().to_string(),
            api_version: api_version.trim().to_string(),
            http: build_client(timeout)?,
        })
    }

    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions",
            self.endpoint, self.deployment
        )
    }

    fn build_payload(request: &CompletionRequest) -> Value {
        let mut payload = json!({
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "max_tokens": request.max_tokens,
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if request.json_mode {
            payload["response_format"] = json!({"type": "json_object"});
        }
        payload
    }

    fn parse_completion(payload: &Value) -> Result<Completion> {
        let Some(text) = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
        else {
            bail!("Azure OpenAI response carried no message content");
        };
        let total_tokens = payload
            .pointer("/usage/total_tokens")
            .and_then(Value::as_u64);
        Ok(Completion {
            text: text.to_string(),
            total_tokens,
        })
    }
}

impl CompletionProvider for AzureOpenAiProvider {
    fn name(&self) -> &str {
        "azure-openai"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let endpoint = self.chat_url();
        let response = self
            .http
            .post(&endpoint)
            .query(&[("api-version", self.api_version.as_str())])
            .header("api-key", &self.key)
            .json(&Self::build_payload(request))
            .send()
            .with_context(|| format!("Azure OpenAI request failed ({endpoint})"))?;
        let payload = response_json_or_error("Azure OpenAI", response)?;
        Self::parse_completion(&payload)
    }
}

/// Offline stand-in. JSON-mode requests get a canned outfit reply, anything
/// else a garment record built from the prompt's caption line.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryrunCompletionProvider;

impl CompletionProvider for DryrunCompletionProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = if request.json_mode {
            json!({
                "occasion": "everyday",
                "items": [],
                "files": [],
                "commentary": "Dry run: no stylist model is configured.",
            })
        } else {
            let caption = request
                .user
                .lines()
                .find_map(|line| line.strip_prefix(CAPTION_PREFIX))
                .map(str::trim)
                .unwrap_or("garment");
            json!({
                "item": "garment",
                "category": "unknown",
                "color": "unknown",
                "visual_description": caption,
            })
        };
        let text = body.to_string();
        let total_tokens = ((request.system.len() + request.user.len() + text.len()) / 4) as u64;
        Ok(Completion {
            text,
            total_tokens: Some(total_tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json_mode: bool) -> CompletionRequest {
        CompletionRequest {
            system: "system".to_string(),
            user: "Visual Info:\nCaption: a red scarf\nTags: scarf".to_string(),
            max_tokens: 180,
            json_mode,
            temperature: None,
        }
    }

    #[test]
    fn payload_includes_cap_and_optional_settings() {
        let plain = AzureOpenAiProvider::build_payload(&request(false));
        assert_eq!(plain["max_tokens"], json!(180));
        assert_eq!(plain["messages"][0]["role"], json!("system"));
        assert_eq!(plain["messages"][1]["content"], json!(request(false).user));
        assert!(plain.get("response_format").is_none());
        assert!(plain.get("temperature").is_none());

        let mut json_request = request(true);
        json_request.temperature = Some(0.5);
        let payload = AzureOpenAiProvider::build_payload(&json_request);
        assert_eq!(payload["response_format"], json!({"type": "json_object"}));
        assert_eq!(payload["temperature"], json!(0.5));
    }

    #[test]
    fn parse_completion_reads_text_and_usage() -> anyhow::Result<()> {
        let parsed = AzureOpenAiProvider::parse_completion(&json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"item\":\"hat\"}"}}],
            "usage": {"prompt_tokens": 200, "completion_tokens": 12, "total_tokens": 212}
        }))?;
        assert_eq!(parsed.text, "{\"item\":\"hat\"}");
        assert_eq!(parsed.total_tokens, Some(212));
        Ok(())
    }

    #[test]
    fn parse_completion_without_content_fails() {
        assert!(AzureOpenAiProvider::parse_completion(&json!({"choices": []})).is_err());
    }

    #[test]
    fn chat_url_targets_deployment() -> anyhow::Result<()> {
        let provider = AzureOpenAiProvider::new(
            "https://closet.openai.azure.com/",
            "key",
            "gpt-4o-mini",
            "2024-08-01-preview",
            Duration::from_secs(5),
        )?;
        assert_eq!(
            provider.chat_url(),
            "https://closet.openai.azure.com/openai/deployments/gpt-4o-mini/chat/completions"
        );
        assert_eq!(provider.deployment(), "gpt-4o-mini");
        Ok(())
    }

    #[test]
    fn dryrun_record_echoes_caption() -> anyhow::Result<()> {
        let completion = DryrunCompletionProvider.complete(&request(false))?;
        let value: Value = serde_json::from_str(&completion.text)?;
        assert_eq!(value["visual_description"], json!("a red scarf"));
        assert!(completion.total_tokens.is_some());
        Ok(())
    }
}
