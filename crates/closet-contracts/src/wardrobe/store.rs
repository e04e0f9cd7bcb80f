use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

use super::record::GarmentRecord;

/// Newline-delimited JSON file holding the wardrobe, one record per line.
///
/// Appends never rewrite existing lines. `upsert` and `rewrite` replace the
/// whole file through a sibling temp file. A store assumes a single writer.
#[derive(Debug, Clone)]
pub struct WardrobeStore {
    path: PathBuf,
}

impl WardrobeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Reads every record in file order. A missing file is an empty wardrobe.
    pub fn load(&self) -> anyhow::Result<Vec<GarmentRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", self.path.display()))
            }
        };

        let mut records = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = GarmentRecord::from_json_str(line).with_context(|| {
                format!("{}:{}: invalid wardrobe record", self.path.display(), idx + 1)
            })?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn len(&self) -> anyhow::Result<usize> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Source image names already described in the store.
    pub fn source_images(&self) -> anyhow::Result<HashSet<String>> {
        Ok(self
            .load()?
            .into_iter()
            .filter_map(|record| record.source_image)
            .collect())
    }

    pub fn find_by_source_image(&self, name: &str) -> anyhow::Result<Option<GarmentRecord>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|record| record.source_image.as_deref() == Some(name)))
    }

    pub fn find_by_id(&self, id: &str) -> anyhow::Result<Option<GarmentRecord>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|record| record.id.as_deref() == Some(id)))
    }

    /// Appends one record, assigning an id when it has none.
    pub fn append(&self, record: GarmentRecord) -> anyhow::Result<GarmentRecord> {
        let record = ensure_id(record);
        let line = record.to_json_line()?;
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(record)
    }

    /// Writes `record`, replacing the stored record with the same id in place
    /// or appending it when the id is new. A record without an id takes the
    /// id of the stored record for the same source image.
    pub fn upsert(&self, mut record: GarmentRecord) -> anyhow::Result<GarmentRecord> {
        let mut records = self.load()?;
        if !has_id(&record) {
            if let Some(source) = record.source_image.as_deref() {
                record.id = records
                    .iter()
                    .find(|existing| existing.source_image.as_deref() == Some(source))
                    .and_then(|existing| existing.id.clone());
            }
        }
        let record = ensure_id(record);
        match records.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => {
                if *existing == record {
                    return Ok(record);
                }
                *existing = record.clone();
            }
            None => records.push(record.clone()),
        }
        self.rewrite(&records)?;
        Ok(record)
    }

    pub fn rewrite(&self, records: &[GarmentRecord]) -> anyhow::Result<()> {
        self.ensure_parent()?;
        let mut body = String::new();
        for record in records {
            body.push_str(&record.to_json_line()?);
            body.push('\n');
        }
        let tmp = self.temp_path();
        std::fs::write(&tmp, body).with_context(|| format!("failed writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed replacing {}", self.path.display()))?;
        Ok(())
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        self.rewrite(&[])
    }

    fn ensure_parent(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed creating {}", parent.display()))?;
            }
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("wardrobe.ndjson");
        self.path.with_file_name(format!(".{name}.tmp"))
    }
}

fn has_id(record: &GarmentRecord) -> bool {
    !record.id.as_deref().map(str::trim).unwrap_or("").is_empty()
}

fn ensure_id(mut record: GarmentRecord) -> GarmentRecord {
    if !has_id(&record) {
        record.id = Some(uuid::Uuid::new_v4().to_string());
    }
    record
}
