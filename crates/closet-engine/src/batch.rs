use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use closet_contracts::events::{new_session_id, now_utc_iso, EventLog};
use closet_contracts::summary::{write_summary, BatchSummary, FailedImage};
use closet_contracts::wardrobe::{GarmentRecord, WardrobeStore};
use serde_json::json;
use tracing::{info, warn};

use crate::emit_quietly;
use crate::error::ExtractError;
use crate::extract::{source_image_name, ExtractionPipeline};
use crate::imaging::is_supported_image;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Skip images that already have a record.
    Incremental,
    /// Clear the wardrobe and process every image.
    Rebuild,
}

impl BatchMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Rebuild => "rebuild",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub summary: BatchSummary,
    pub written: Vec<GarmentRecord>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.summary.is_clean()
    }
}

/// Image files directly under `dir`, sorted by path. A missing directory has
/// no images.
pub fn discover_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed listing {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && is_supported_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Copies uploaded files into `dir` and returns their new paths. Files that
/// already live in `dir` are left in place.
pub fn import_images(files: &[PathBuf], dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("failed creating {}", dir.display()))?;
    let mut saved = Vec::with_capacity(files.len());
    for file in files {
        if !file.is_file() {
            bail!("{} is not a file", file.display());
        }
        if !is_supported_image(file) {
            bail!("{} is not a jpg, jpeg, png or webp image", file.display());
        }
        let Some(name) = file.file_name() else {
            bail!("{} has no file name", file.display());
        };
        let dest = dir.join(name);
        let same = match (fs::canonicalize(file), fs::canonicalize(&dest)) {
            (Ok(src), Ok(dst)) => src == dst,
            _ => false,
        };
        if !same {
            fs::copy(file, &dest).with_context(|| {
                format!("failed copying {} to {}", file.display(), dest.display())
            })?;
        }
        saved.push(dest);
    }
    Ok(saved)
}

/// Runs the extraction pipeline over a list of images, appending each record
/// as soon as it is extracted. One image failing does not stop the batch.
pub struct BatchProcessor<'a> {
    pipeline: &'a ExtractionPipeline,
    store: &'a WardrobeStore,
    events: Option<EventLog>,
    summary_path: Option<PathBuf>,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(pipeline: &'a ExtractionPipeline, store: &'a WardrobeStore) -> Self {
        Self {
            pipeline,
            store,
            events: None,
            summary_path: None,
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_summary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_path = Some(path.into());
        self
    }

    /// Processes `images` in order. Store failures and rate limiter
    /// misconfiguration abort the run; every other per-image error is
    /// recorded in the report.
    pub fn run(&self, images: &[PathBuf], mode: BatchMode) -> Result<BatchReport> {
        let session_id = self
            .events
            .as_ref()
            .map(|events| events.session_id().to_string())
            .unwrap_or_else(new_session_id);
        let started_at = now_utc_iso();

        let mut known: HashSet<String> = match mode {
            BatchMode::Incremental => self.store.source_images()?,
            BatchMode::Rebuild => {
                self.store.clear()?;
                HashSet::new()
            }
        };
        info!(images = images.len(), mode = mode.as_str(), "batch started");
        emit_quietly(
            self.events.as_ref(),
            "batch_started",
            json!({
                "images": images.len(),
                "mode": mode.as_str(),
                "wardrobe": self.store.path().to_string_lossy(),
            }),
        );

        let mut processed = Vec::new();
        let mut skipped = Vec::new();
        let mut failed = Vec::new();
        let mut written = Vec::new();
        for image in images {
            let name = source_image_name(image);
            if known.contains(&name) {
                emit_quietly(self.events.as_ref(), "image_skipped", json!({"image": name}));
                skipped.push(name);
                continue;
            }
            match self.pipeline.extract(image) {
                Ok(record) => {
                    let record = self.store.append(record)?;
                    info!(image = %name, item = %record.label(), "record written");
                    emit_quietly(
                        self.events.as_ref(),
                        "record_written",
                        json!({"image": name, "id": record.id}),
                    );
                    known.insert(name.clone());
                    processed.push(name);
                    written.push(record);
                }
                Err(err @ ExtractError::Configuration(_)) => {
                    return Err(err).with_context(|| format!("aborting batch at {name}"));
                }
                Err(err) => {
                    warn!(image = %name, "{err}");
                    emit_quietly(
                        self.events.as_ref(),
                        "image_failed",
                        json!({
                            "image": name,
                            "error": err.to_string(),
                            "raw_path": err.raw_path().map(|path| path.to_string_lossy().to_string()),
                        }),
                    );
                    failed.push(FailedImage {
                        image: name,
                        error: err.to_string(),
                    });
                }
            }
        }

        let summary = BatchSummary {
            session_id,
            started_at,
            finished_at: now_utc_iso(),
            processed,
            skipped,
            failed,
        };
        info!(
            processed = summary.processed.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "batch finished"
        );
        emit_quietly(
            self.events.as_ref(),
            "batch_finished",
            json!({
                "processed": summary.processed.len(),
                "skipped": summary.skipped.len(),
                "failed": summary.failed.len(),
            }),
        );
        if let Some(path) = &self.summary_path {
            let mut extra = serde_json::Map::new();
            extra.insert("mode".to_string(), json!(mode.as_str()));
            write_summary(path, &summary, Some(&extra))?;
        }
        Ok(BatchReport { summary, written })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;

    use super::*;
    use crate::clock::ManualClock;
    use crate::extract::testing::{FakeVision, ScriptedCompletion};
    use crate::imaging::write_test_png;
    use crate::rate_limit::TokenBucket;
    use crate::tokenizer::HeuristicCounter;

    fn pipeline(completion: ScriptedCompletion) -> anyhow::Result<(ExtractionPipeline, Arc<ScriptedCompletion>)> {
        let clock = Arc::new(ManualClock::new());
        let completion = Arc::new(completion);
        let pipeline = ExtractionPipeline::new(
            Arc::new(FakeVision::returning("a garment", &["clothing"])),
            completion.clone(),
            Arc::new(HeuristicCounter),
            Arc::new(TokenBucket::per_minute("vision", 20, clock.clone())?),
            Arc::new(TokenBucket::per_minute("completion", 5_000, clock.clone())?),
            clock,
        );
        Ok((pipeline, completion))
    }

    fn write_images(dir: &Path, names: &[&str]) -> anyhow::Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let mut paths = Vec::new();
        for name in names {
            let path = dir.join(name);
            write_test_png(&path, 64, 64)?;
            paths.push(path);
        }
        Ok(paths)
    }

    #[test]
    fn discover_filters_and_sorts() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = temp.path().join("images");
        write_images(&dir, &["b.png", "a.PNG"])?;
        fs::write(dir.join("notes.txt"), "x")?;
        fs::create_dir_all(dir.join("nested.jpg"))?;

        let found = discover_images(&dir)?;
        assert_eq!(found, vec![dir.join("a.PNG"), dir.join("b.png")]);
        assert!(discover_images(&temp.path().join("missing"))?.is_empty());
        Ok(())
    }

    #[test]
    fn incremental_run_skips_known_images_and_survives_failures() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = temp.path().join("images");
        let mut images = write_images(&dir, &["coat.png", "hat.png"])?;
        let broken = dir.join("broken.jpg");
        fs::write(&broken, b"not an image")?;
        images.insert(0, broken);

        let store = WardrobeStore::new(temp.path().join("closet.ndjson"));
        store.append(GarmentRecord::default().with_source_image("hat.png"))?;
        let (pipeline, completion) = pipeline(ScriptedCompletion::texts(&[r#"{"item":"coat"}"#], Some(50)))?;
        let events = EventLog::new(temp.path().join("events.jsonl"), "session-batch");
        let summary_path = temp.path().join("summary.json");

        let report = BatchProcessor::new(&pipeline, &store)
            .with_events(events.clone())
            .with_summary_path(&summary_path)
            .run(&images, BatchMode::Incremental)?;

        assert_eq!(report.summary.processed, vec!["coat.png"]);
        assert_eq!(report.summary.skipped, vec!["hat.png"]);
        assert_eq!(report.summary.failed.len(), 1);
        assert_eq!(report.summary.failed[0].image, "broken.jpg");
        assert!(!report.is_clean());
        assert_eq!(completion.calls(), 1);

        let stored = store.load()?;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].item.as_deref(), Some("coat"));
        assert_eq!(stored[1].source_image.as_deref(), Some("coat.png"));
        assert!(stored[1].id.is_some());

        let summary: Value = serde_json::from_str(&fs::read_to_string(&summary_path)?)?;
        assert_eq!(summary["session_id"], json!("session-batch"));
        assert_eq!(summary["mode"], json!("incremental"));

        let types: Vec<String> = events
            .read_all()?
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .filter(|kind| kind.starts_with("batch") || kind.starts_with("image") || kind == "record_written")
            .collect();
        assert_eq!(
            types,
            vec!["batch_started", "image_failed", "record_written", "image_skipped", "batch_finished"]
        );
        Ok(())
    }

    #[test]
    fn rebuild_clears_the_store_first() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let images = write_images(&temp.path().join("images"), &["coat.png"])?;
        let store = WardrobeStore::new(temp.path().join("closet.ndjson"));
        store.append(GarmentRecord::default().with_source_image("coat.png"))?;
        store.append(GarmentRecord::default().with_source_image("gone.png"))?;
        let (pipeline, _) = pipeline(ScriptedCompletion::texts(&[r#"{"item":"coat"}"#], Some(50)))?;

        let report = BatchProcessor::new(&pipeline, &store).run(&images, BatchMode::Rebuild)?;

        assert!(report.is_clean());
        let stored = store.load()?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].item.as_deref(), Some("coat"));
        Ok(())
    }

    #[test]
    fn exhausted_image_is_recorded_with_raw_dump() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let images = write_images(&temp.path().join("images"), &["scarf.png"])?;
        let store = WardrobeStore::new(temp.path().join("closet.ndjson"));
        let (pipeline, completion) = pipeline(ScriptedCompletion::texts(&["sorry"], Some(50)))?;

        let report = BatchProcessor::new(&pipeline, &store).run(&images, BatchMode::Incremental)?;

        assert_eq!(completion.calls(), 3);
        assert_eq!(report.summary.failed.len(), 1);
        assert!(report.summary.failed[0].error.contains("scarf.png.raw.txt"));
        assert!(store.load()?.is_empty());
        Ok(())
    }

    #[test]
    fn import_copies_supported_files_only() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let uploads = write_images(&temp.path().join("uploads"), &["dress.png"])?;
        let dir = temp.path().join("images");

        let saved = import_images(&uploads, &dir)?;
        assert_eq!(saved, vec![dir.join("dress.png")]);
        assert!(dir.join("dress.png").is_file());

        let again = import_images(&saved, &dir)?;
        assert_eq!(again, saved);

        let text = temp.path().join("notes.txt");
        fs::write(&text, "x")?;
        assert!(import_images(&[text], &dir).is_err());
        Ok(())
    }
}
