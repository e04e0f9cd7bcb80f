use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use closet_contracts::events::EventLog;
use closet_contracts::wardrobe::GarmentRecord;
use regex::Regex;
use serde::de::IgnoredAny;
use serde_json::json;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::completion::{Completion, CompletionProvider, CompletionRequest};
use crate::emit_quietly;
use crate::error::{ExtractError, MalformedOutput};
use crate::imaging::prepare_image;
use crate::prompt::{extraction_prompt, EXTRACTION_SYSTEM_MSG};
use crate::rate_limit::TokenBucket;
use crate::tokenizer::TokenCounter;
use crate::vision::{VisionAnalysis, VisionProvider};

pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_COMPLETION_CAP: u64 = 180;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionSettings {
    /// Retries after the first attempt; `max_retries + 1` attempts in total.
    pub max_retries: usize,
    /// Delay unit; the wait after attempt `n` is `backoff * n`.
    pub backoff: Duration,
    /// Completion token cap, reserved on top of the prompt tokens.
    pub completion_cap: u64,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
            completion_cap: DEFAULT_COMPLETION_CAP,
        }
    }
}

#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    Parsed(GarmentRecord),
    Malformed { raw: String },
}

#[derive(Debug)]
pub(crate) enum Step {
    Attempt(usize),
    Backoff { next_attempt: usize, delay: Duration },
    Done(GarmentRecord),
    Exhausted { attempts: usize, last_raw: String },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Transition taken once attempt `attempt` (1-based) has an outcome.
    pub fn after(&self, attempt: usize, outcome: AttemptOutcome) -> Step {
        match outcome {
            AttemptOutcome::Parsed(record) => Step::Done(record),
            AttemptOutcome::Malformed { raw } if attempt >= self.max_attempts() => {
                Step::Exhausted {
                    attempts: attempt,
                    last_raw: raw,
                }
            }
            AttemptOutcome::Malformed { .. } => Step::Backoff {
                next_attempt: attempt + 1,
                delay: self.backoff.saturating_mul(u32::try_from(attempt).unwrap_or(u32::MAX)),
            },
        }
    }
}

/// Turns one garment photo into one `GarmentRecord`.
///
/// Vision and completion calls each draw on their own quota bucket. The
/// completion is retried with linear backoff while its output is not a
/// parseable record; vision and transport failures are not retried. The
/// pipeline never touches the wardrobe store.
pub struct ExtractionPipeline {
    vision: Arc<dyn VisionProvider>,
    completion: Arc<dyn CompletionProvider>,
    tokenizer: Arc<dyn TokenCounter>,
    vision_bucket: Arc<TokenBucket>,
    completion_bucket: Arc<TokenBucket>,
    clock: Arc<dyn Clock>,
    settings: ExtractionSettings,
    events: Option<EventLog>,
}

impl ExtractionPipeline {
    pub fn new(
        vision: Arc<dyn VisionProvider>,
        completion: Arc<dyn CompletionProvider>,
        tokenizer: Arc<dyn TokenCounter>,
        vision_bucket: Arc<TokenBucket>,
        completion_bucket: Arc<TokenBucket>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            vision,
            completion,
            tokenizer,
            vision_bucket,
            completion_bucket,
            clock,
            settings: ExtractionSettings::default(),
            events: None,
        }
    }

    pub fn with_settings(mut self, settings: ExtractionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &ExtractionSettings {
        &self.settings
    }

    /// Tokens reserved per completion attempt for this vision result.
    pub fn reservation_for(&self, analysis: &VisionAnalysis) -> u64 {
        self.prompt_tokens(&extraction_prompt(analysis)) + self.settings.completion_cap
    }

    pub fn extract(&self, image: &Path) -> Result<GarmentRecord, ExtractError> {
        let image_name = source_image_name(image);
        let prepared = prepare_image(image)?;

        self.vision_bucket.consume(1)?;
        let analysis = self
            .vision
            .analyze(&prepared.bytes)
            .map_err(|err| ExtractError::vision(&image_name, err))?;
        debug!(image = %image_name, caption = analysis.caption_or_sentinel(), "vision analysis");
        emit_quietly(
            self.events.as_ref(),
            "vision_analyzed",
            json!({
                "image": image_name,
                "image_sha256": prepared.digest,
                "resized": prepared.resized,
                "caption": analysis.caption,
                "tags": analysis.tags,
                "provider": self.vision.name(),
            }),
        );

        let user = extraction_prompt(&analysis);
        let prompt_tokens = self.prompt_tokens(&user);
        let reserved = prompt_tokens + self.settings.completion_cap;
        let request = CompletionRequest {
            system: EXTRACTION_SYSTEM_MSG.to_string(),
            user,
            max_tokens: self.settings.completion_cap,
            json_mode: false,
            temperature: None,
        };
        let policy = RetryPolicy {
            max_retries: self.settings.max_retries,
            backoff: self.settings.backoff,
        };

        let mut step = Step::Attempt(1);
        loop {
            step = match step {
                Step::Attempt(attempt) => {
                    let completion =
                        self.reserved_completion(&request, reserved, prompt_tokens, attempt, &image_name)?;
                    let outcome = match parse_garment(&completion.text) {
                        Ok(record) => AttemptOutcome::Parsed(record),
                        Err(reason) => {
                            warn!(
                                image = %image_name,
                                "{reason}, attempt {attempt}/{}",
                                policy.max_attempts()
                            );
                            emit_quietly(
                                self.events.as_ref(),
                                "malformed_output",
                                json!({
                                    "image": image_name,
                                    "attempt": attempt,
                                    "reason": reason.to_string(),
                                }),
                            );
                            AttemptOutcome::Malformed {
                                raw: completion.text,
                            }
                        }
                    };
                    policy.after(attempt, outcome)
                }
                Step::Backoff {
                    next_attempt,
                    delay,
                } => {
                    self.clock.sleep(delay);
                    Step::Attempt(next_attempt)
                }
                Step::Done(record) => return Ok(record.with_source_image(image_name)),
                Step::Exhausted { attempts, last_raw } => {
                    return Err(self.give_up(image, image_name, attempts, &last_raw))
                }
            };
        }
    }

    fn prompt_tokens(&self, user: &str) -> u64 {
        (self.tokenizer.count(user) + self.tokenizer.count(EXTRACTION_SYSTEM_MSG)) as u64
    }

    /// Reserves the full budget, calls the model and refunds what it did not
    /// use. Over-use is never charged on top of the reservation.
    fn reserved_completion(
        &self,
        request: &CompletionRequest,
        reserved: u64,
        prompt_tokens: u64,
        attempt: usize,
        image_name: &str,
    ) -> Result<Completion, ExtractError> {
        let waited = self.completion_bucket.consume(reserved)?;
        let completion = self
            .completion
            .complete(request)
            .map_err(|err| ExtractError::completion(image_name, attempt, err))?;
        let used = completion
            .total_tokens
            .unwrap_or_else(|| prompt_tokens + self.tokenizer.count(&completion.text) as u64);
        let refunded = reserved.saturating_sub(used);
        self.completion_bucket.refund(refunded);
        emit_quietly(
            self.events.as_ref(),
            "completion_attempt",
            json!({
                "image": image_name,
                "attempt": attempt,
                "reserved": reserved,
                "used": used,
                "refunded": refunded,
                "waited_ms": waited.as_millis() as u64,
                "provider": self.completion.name(),
            }),
        );
        Ok(completion)
    }

    fn give_up(&self, image: &Path, image_name: String, attempts: usize, last_raw: &str) -> ExtractError {
        let raw_path = raw_dump_path(image);
        if let Err(source) = std::fs::write(&raw_path, last_raw) {
            return ExtractError::RawDump {
                path: raw_path,
                source,
            };
        }
        emit_quietly(
            self.events.as_ref(),
            "extraction_failed",
            json!({
                "image": image_name,
                "attempts": attempts,
                "raw_path": raw_path.to_string_lossy(),
            }),
        );
        ExtractError::Extraction {
            image: image_name,
            attempts,
            raw_path,
        }
    }
}

/// Parses the first brace-delimited JSON object in `raw` as a garment record.
pub fn parse_garment(raw: &str) -> Result<GarmentRecord, MalformedOutput> {
    extract_json_object(raw, GarmentRecord::from_json_str)
}

/// Finds the brace-delimited span in `raw` (first `{` through last `}`) and
/// hands it to `parse`. When that span is not valid on its own, the first
/// complete JSON value starting at the same brace is tried instead, so
/// trailing chatter containing braces does not spoil an otherwise good
/// answer.
pub fn extract_json_object<T>(
    raw: &str,
    parse: impl Fn(&str) -> serde_json::Result<T>,
) -> Result<T, MalformedOutput> {
    let Some(candidate) = json_object_pattern().find(raw) else {
        return Err(MalformedOutput::NoJsonObject);
    };
    let greedy_err = match parse(candidate.as_str()) {
        Ok(parsed) => return Ok(parsed),
        Err(err) => err,
    };

    let tail = &raw[candidate.start()..];
    let mut stream = serde_json::Deserializer::from_str(tail).into_iter::<IgnoredAny>();
    match stream.next() {
        Some(Ok(_)) => {
            let end = stream.byte_offset();
            parse(&tail[..end]).map_err(MalformedOutput::InvalidJson)
        }
        _ => Err(MalformedOutput::InvalidJson(greedy_err)),
    }
}

fn json_object_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("static JSON object pattern"))
}

/// `<image path>.raw.txt`, next to the image.
pub fn raw_dump_path(image: &Path) -> PathBuf {
    let mut raw = image.as_os_str().to_os_string();
    raw.push(".raw.txt");
    PathBuf::from(raw)
}

pub(crate) fn source_image_name(image: &Path) -> String {
    image
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| image.to_string_lossy().to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::{anyhow, Result};

    use crate::completion::{Completion, CompletionProvider, CompletionRequest};
    use crate::vision::{VisionAnalysis, VisionProvider};

    pub struct FakeVision {
        pub analysis: Option<VisionAnalysis>,
        pub calls: AtomicUsize,
    }

    impl FakeVision {
        pub fn returning(caption: &str, tags: &[&str]) -> Self {
            Self {
                analysis: Some(VisionAnalysis {
                    caption: Some(caption.to_string()),
                    tags: tags.iter().map(|tag| tag.to_string()).collect(),
                }),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                analysis: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl VisionProvider for FakeVision {
        fn name(&self) -> &str {
            "fake-vision"
        }

        fn analyze(&self, _image: &[u8]) -> Result<VisionAnalysis> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.analysis
                .clone()
                .ok_or_else(|| anyhow!("service unavailable").context("fake vision request failed"))
        }
    }

    /// Replays scripted responses in order, repeating the last one.
    pub struct ScriptedCompletion {
        script: Mutex<VecDeque<Result<Completion, String>>>,
        last: Mutex<Option<Result<Completion, String>>>,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedCompletion {
        pub fn new(script: Vec<Result<Completion, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn texts(texts: &[&str], total_tokens: Option<u64>) -> Self {
            Self::new(
                texts
                    .iter()
                    .map(|text| {
                        Ok(Completion {
                            text: text.to_string(),
                            total_tokens,
                        })
                    })
                    .collect(),
            )
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().map(|rows| rows.len()).unwrap_or(0)
        }
    }

    impl CompletionProvider for ScriptedCompletion {
        fn name(&self) -> &str {
            "scripted"
        }

        fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
            let mut last = self.last.lock().map_err(|_| anyhow!("script lock poisoned"))?;
            if let Some(next) = next {
                *last = Some(next);
            }
            match last.clone() {
                Some(Ok(completion)) => Ok(completion),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Err(anyhow!("empty script")),
            }
        }
    }
}
