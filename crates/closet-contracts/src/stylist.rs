use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::wardrobe::GarmentRecord;

/// Outfit recommendation returned by the stylist completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StylistReply {
    pub occasion: String,
    pub items: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    pub commentary: String,
}

/// JSON schema the stylist prompt asks the model to follow.
pub fn reply_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "occasion":   {"type": "string"},
            "items":      {"type": "array", "items": {"type": "string"}},
            "files":      {"type": "array", "items": {"type": "string"}},
            "commentary": {"type": "string"}
        },
        "required": ["occasion", "items", "files", "commentary"]
    })
}

impl StylistReply {
    /// Files to show for each item. When the model left `files` empty, each
    /// item name is looked up case-insensitively in the wardrobe (`?` when
    /// unknown).
    pub fn resolved_files(&self, wardrobe: &[GarmentRecord]) -> Vec<String> {
        if !self.files.is_empty() {
            return self.files.clone();
        }
        let lookup: HashMap<String, &str> = wardrobe
            .iter()
            .filter_map(|record| {
                let item = record.item.as_deref()?;
                Some((
                    item.to_lowercase(),
                    record.source_image.as_deref().unwrap_or("?"),
                ))
            })
            .collect();
        self.items
            .iter()
            .map(|item| {
                lookup
                    .get(&item.to_lowercase())
                    .copied()
                    .unwrap_or("?")
                    .to_string()
            })
            .collect()
    }

    /// Files named in the reply that no wardrobe record points at.
    pub fn unknown_files(&self, wardrobe: &[GarmentRecord]) -> Vec<String> {
        self.files
            .iter()
            .filter(|file| {
                !wardrobe
                    .iter()
                    .any(|record| record.source_image.as_deref() == Some(file.as_str()))
            })
            .cloned()
            .collect()
    }

    pub fn render(&self, wardrobe: &[GarmentRecord]) -> String {
        let files = self.resolved_files(wardrobe);
        [
            format!("Occasion :  {}", self.occasion),
            format!("Items    :  {}", self.items.join(", ")),
            format!("Files    :  {}", files.join(", ")),
            format!("Notes    :  {}", self.commentary),
        ]
        .join("\n")
    }
}
