use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedImage {
    pub image: String,
    pub error: String,
}

/// Outcome of one batch run over an image directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub processed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedImage>,
}

impl BatchSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Writes `summary` as pretty JSON with a `ts` stamp and optional extra keys.
pub fn write_summary(
    path: &Path,
    summary: &BatchSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, BatchSummary, FailedImage};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let summary = BatchSummary {
            session_id: "session-1".to_string(),
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:10:00+00:00".to_string(),
            processed: vec!["shirt.jpg".to_string()],
            skipped: vec!["jeans.jpg".to_string()],
            failed: vec![FailedImage {
                image: "blur.png".to_string(),
                error: "no JSON".to_string(),
            }],
        };
        assert!(!summary.is_clean());

        let mut extra = Map::new();
        extra.insert("wardrobe".to_string(), json!("closet.ndjson"));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["session_id"], json!("session-1"));
        assert_eq!(parsed["processed"], json!(["shirt.jpg"]));
        assert_eq!(parsed["failed"][0]["image"], json!("blur.png"));
        assert_eq!(parsed["wardrobe"], json!("closet.ndjson"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
