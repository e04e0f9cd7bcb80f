pub mod batch;
pub mod clock;
pub mod completion;
pub mod config;
pub mod error;
pub mod extract;
mod http;
pub mod imaging;
pub mod prompt;
pub mod rate_limit;
pub mod stylist;
pub mod tokenizer;
pub mod vision;
pub mod weather;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use closet_contracts::events::EventLog;
use closet_contracts::wardrobe::{GarmentRecord, WardrobeStore};
use serde_json::{Map, Value};
use tracing::{info, warn};

pub use batch::{discover_images, import_images, BatchMode, BatchProcessor, BatchReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::{
    AzureOpenAiProvider, Completion, CompletionProvider, CompletionRequest,
    DryrunCompletionProvider,
};
pub use config::{Config, ProviderKind, ProviderSettings};
pub use error::{ExtractError, MalformedOutput, RateLimitError, StylistError};
pub use extract::{parse_garment, ExtractionPipeline, ExtractionSettings};
pub use rate_limit::TokenBucket;
pub use stylist::{Stylist, StylistAnswer};
pub use tokenizer::{HeuristicCounter, TiktokenCounter, TokenCounter};
pub use vision::{AzureVisionProvider, DryrunVisionProvider, VisionAnalysis, VisionProvider};
pub use weather::{FixedWeatherProvider, Forecast, OpenMeteoProvider, WeatherProvider};

/// Records an event when a log is attached. Logging failures never fail the
/// operation that produced the event.
pub(crate) fn emit_quietly(events: Option<&EventLog>, event_type: &str, fields: Value) {
    let Some(events) = events else {
        return;
    };
    let fields = match fields {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    if let Err(err) = events.emit(event_type, fields) {
        warn!(event = event_type, "failed to record event: {err:#}");
    }
}

/// Provider set the engine talks to.
pub struct Providers {
    pub vision: Arc<dyn VisionProvider>,
    pub completion: Arc<dyn CompletionProvider>,
    pub weather: Arc<dyn WeatherProvider>,
    pub tokenizer: Arc<dyn TokenCounter>,
}

impl Providers {
    pub fn from_config(config: &Config) -> Result<Self> {
        match &config.providers {
            ProviderSettings::Dryrun => Ok(Self::dryrun()),
            ProviderSettings::Azure { vision, openai } => Ok(Self {
                vision: Arc::new(AzureVisionProvider::new(
                    &vision.endpoint,
                    &vision.key,
                    config.request_timeout,
                )?),
                completion: Arc::new(AzureOpenAiProvider::new(
                    &openai.endpoint,
                    &openai.key,
                    &openai.deployment,
                    &openai.api_version,
                    config.request_timeout,
                )?),
                weather: Arc::new(OpenMeteoProvider::new(
                    config.fallback_location.clone(),
                    config.request_timeout,
                )?),
                tokenizer: Arc::new(TiktokenCounter::for_model(&openai.deployment)?),
            }),
        }
    }

    pub fn dryrun() -> Self {
        Self {
            vision: Arc::new(DryrunVisionProvider),
            completion: Arc::new(DryrunCompletionProvider),
            weather: Arc::new(FixedWeatherProvider::default()),
            tokenizer: Arc::new(HeuristicCounter),
        }
    }
}

/// The wardrobe assistant: extraction, the wardrobe store, batch runs and
/// the stylist, sharing one event log and one set of quota buckets.
pub struct Closet {
    config: Config,
    store: WardrobeStore,
    events: EventLog,
    pipeline: ExtractionPipeline,
    stylist: Stylist,
}

impl Closet {
    pub fn new(config: Config) -> Result<Self> {
        let providers = Providers::from_config(&config)?;
        Self::with_providers(config, providers, Arc::new(SystemClock))
    }

    pub fn with_providers(config: Config, providers: Providers, clock: Arc<dyn Clock>) -> Result<Self> {
        let events = EventLog::open(config.events_path());
        let store = WardrobeStore::new(&config.wardrobe_path);
        let vision_bucket = Arc::new(TokenBucket::per_minute(
            "vision",
            config.vision_per_minute,
            clock.clone(),
        )?);
        let completion_bucket = Arc::new(TokenBucket::per_minute(
            "completion",
            config.completion_tokens_per_minute,
            clock.clone(),
        )?);
        let stylist_bucket = Arc::new(TokenBucket::per_minute(
            "stylist",
            config.stylist_tokens_per_minute,
            clock.clone(),
        )?);

        let pipeline = ExtractionPipeline::new(
            providers.vision,
            providers.completion.clone(),
            providers.tokenizer.clone(),
            vision_bucket,
            completion_bucket,
            clock,
        )
        .with_settings(config.extraction)
        .with_events(events.clone());
        let stylist = Stylist::new(
            store.clone(),
            providers.weather,
            providers.completion,
            providers.tokenizer,
            stylist_bucket,
        )
        .with_events(events.clone());

        info!(
            provider = ?config.providers.kind(),
            wardrobe = %config.wardrobe_path.display(),
            session = events.session_id(),
            "closet ready"
        );
        Ok(Self {
            config,
            store,
            events,
            pipeline,
            stylist,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &WardrobeStore {
        &self.store
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn pipeline(&self) -> &ExtractionPipeline {
        &self.pipeline
    }

    /// Extracts one record without touching the wardrobe.
    pub fn describe(&self, image: &Path) -> Result<GarmentRecord, ExtractError> {
        self.pipeline.extract(image)
    }

    /// Processes every image in the configured image directory.
    pub fn process(&self, mode: BatchMode) -> Result<BatchReport> {
        let images = discover_images(&self.config.image_dir)?;
        self.process_images(&images, mode)
    }

    pub fn process_images(&self, images: &[PathBuf], mode: BatchMode) -> Result<BatchReport> {
        BatchProcessor::new(&self.pipeline, &self.store)
            .with_events(self.events.clone())
            .with_summary_path(self.config.summary_path())
            .run(images, mode)
    }

    /// Copies `files` into the image directory and, when asked, processes
    /// the newly saved images.
    pub fn upload(&self, files: &[PathBuf], process: bool) -> Result<(Vec<PathBuf>, Option<BatchReport>)> {
        let saved = import_images(files, &self.config.image_dir)?;
        emit_quietly(
            Some(&self.events),
            "images_uploaded",
            serde_json::json!({
                "saved": saved.iter().map(|path| path.to_string_lossy().to_string()).collect::<Vec<_>>(),
                "process": process,
            }),
        );
        if !process {
            return Ok((saved, None));
        }
        let report = self.process_images(&saved, BatchMode::Incremental)?;
        Ok((saved, Some(report)))
    }

    pub fn wardrobe(&self) -> Result<Vec<GarmentRecord>> {
        self.store.load()
    }

    pub fn upsert(&self, record: GarmentRecord) -> Result<GarmentRecord> {
        let record = self.store.upsert(record)?;
        emit_quietly(
            Some(&self.events),
            "record_upserted",
            serde_json::json!({"id": record.id, "source_image": record.source_image}),
        );
        Ok(record)
    }

    /// Asks the stylist; `city` defaults to the configured one.
    pub fn ask(&self, question: &str, city: Option<&str>) -> Result<StylistAnswer, StylistError> {
        self.stylist.ask(question, city.unwrap_or(&self.config.city))
    }

    pub fn forecast(&self, city: Option<&str>) -> Result<Forecast, StylistError> {
        self.stylist.forecast(city.unwrap_or(&self.config.city))
    }
}
