use std::sync::Arc;

use closet_contracts::events::EventLog;
use closet_contracts::stylist::StylistReply;
use closet_contracts::wardrobe::{GarmentRecord, WardrobeStore};
use serde_json::json;
use tracing::{info, warn};

use crate::completion::{CompletionProvider, CompletionRequest};
use crate::emit_quietly;
use crate::error::StylistError;
use crate::extract::extract_json_object;
use crate::prompt::stylist_system_prompt;
use crate::rate_limit::TokenBucket;
use crate::tokenizer::TokenCounter;
use crate::weather::{Forecast, WeatherProvider};

pub const STYLIST_COMPLETION_CAP: u64 = 600;
pub const STYLIST_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub enum StylistAnswer {
    /// A parsed reply; `files` is already resolved against the wardrobe.
    Structured(StylistReply),
    /// Model output that did not parse as a reply.
    Raw(String),
}

impl StylistAnswer {
    pub fn render(&self) -> String {
        match self {
            Self::Structured(reply) => format!("Assistant:\n{}", reply.render(&[])),
            Self::Raw(text) => format!("Assistant (raw): {text}"),
        }
    }
}

/// Answers outfit questions from the stored wardrobe and tomorrow's weather.
pub struct Stylist {
    store: WardrobeStore,
    weather: Arc<dyn WeatherProvider>,
    completion: Arc<dyn CompletionProvider>,
    tokenizer: Arc<dyn TokenCounter>,
    bucket: Arc<TokenBucket>,
    events: Option<EventLog>,
}

impl Stylist {
    pub fn new(
        store: WardrobeStore,
        weather: Arc<dyn WeatherProvider>,
        completion: Arc<dyn CompletionProvider>,
        tokenizer: Arc<dyn TokenCounter>,
        bucket: Arc<TokenBucket>,
    ) -> Self {
        Self {
            store,
            weather,
            completion,
            tokenizer,
            bucket,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn forecast(&self, city: &str) -> Result<Forecast, StylistError> {
        self.weather
            .forecast(city)
            .map_err(|err| StylistError::weather(city, err))
    }

    pub fn ask(&self, question: &str, city: &str) -> Result<StylistAnswer, StylistError> {
        let wardrobe = self.store.load().map_err(StylistError::store)?;
        if wardrobe.is_empty() {
            return Err(StylistError::EmptyWardrobe);
        }
        let forecast = self.forecast(city)?;

        let request = CompletionRequest {
            system: stylist_system_prompt(),
            user: stylist_user_message(question, &forecast, &wardrobe)
                .map_err(|err| StylistError::store(err.into()))?,
            max_tokens: STYLIST_COMPLETION_CAP,
            json_mode: true,
            temperature: Some(STYLIST_TEMPERATURE),
        };
        let prompt_tokens =
            (self.tokenizer.count(&request.system) + self.tokenizer.count(&request.user)) as u64;
        let reserved = prompt_tokens + STYLIST_COMPLETION_CAP;
        self.bucket.consume(reserved)?;
        let completion = match self.completion.complete(&request) {
            Ok(completion) => completion,
            Err(err) => {
                self.bucket.refund(reserved);
                return Err(StylistError::completion(err));
            }
        };
        let used = completion
            .total_tokens
            .unwrap_or_else(|| prompt_tokens + self.tokenizer.count(&completion.text) as u64);
        self.bucket.refund(reserved.saturating_sub(used));

        let answer = match extract_json_object(&completion.text, |raw| {
            serde_json::from_str::<StylistReply>(raw)
        }) {
            Ok(mut reply) => {
                let unknown = reply.unknown_files(&wardrobe);
                if !unknown.is_empty() {
                    warn!(files = ?unknown, "stylist named files missing from the wardrobe");
                }
                reply.files = reply.resolved_files(&wardrobe);
                StylistAnswer::Structured(reply)
            }
            Err(reason) => {
                warn!("stylist reply was not structured: {reason}");
                StylistAnswer::Raw(completion.text)
            }
        };
        info!(city, wardrobe = wardrobe.len(), used, "stylist answered");
        emit_quietly(
            self.events.as_ref(),
            "stylist_answered",
            json!({
                "question": question,
                "city": city,
                "wardrobe_size": wardrobe.len(),
                "reserved": reserved,
                "used": used,
                "structured": matches!(answer, StylistAnswer::Structured(_)),
            }),
        );
        Ok(answer)
    }
}

fn stylist_user_message(
    question: &str,
    forecast: &Forecast,
    wardrobe: &[GarmentRecord],
) -> serde_json::Result<String> {
    Ok(format!(
        "Question: {}\n\nWeather forecast for tomorrow:\n{}\n\nWardrobe:\n{}",
        question.trim(),
        serde_json::to_string(forecast)?,
        serde_json::to_string(wardrobe)?
    ))
}
