use indexmap::IndexMap;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Descriptive fields every garment record may carry, in prompt order.
pub const GARMENT_FIELDS: [&str; 15] = [
    "item",
    "category",
    "color",
    "style",
    "fit",
    "suitable_seasons",
    "warmth_level",
    "coverage",
    "water_resistant",
    "clothing_features",
    "pattern_or_graphics",
    "suggested_occasions",
    "layering_potential",
    "visual_description",
    "visible_accessories",
];

/// Normalized description of one clothing item, derived from one photo.
///
/// Named fields are free-form text. Scalars are stored as text, arrays of
/// scalars are joined with `", "`, and a nested object is rejected so that
/// malformed model output fails at parse time. Keys the model adds beyond
/// the known set land in `extra` in their original order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GarmentRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub fit: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub suitable_seasons: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub warmth_level: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub coverage: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub water_resistant: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub clothing_features: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub pattern_or_graphics: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub suggested_occasions: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub layering_potential: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub visual_description: Option<String>,
    #[serde(default, deserialize_with = "free_text", skip_serializing_if = "Option::is_none")]
    pub visible_accessories: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl GarmentRecord {
    /// Parses one record from JSON text. The top level must be an object.
    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        if !value.is_object() {
            return Err(de::Error::custom(format!(
                "garment record must be a JSON object, found {}",
                json_kind(&value)
            )));
        }
        serde_json::from_value(value)
    }

    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn with_source_image(mut self, source_image: impl Into<String>) -> Self {
        self.source_image = Some(source_image.into());
        self
    }

    /// Looks up a descriptive field by its wire name.
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "item" => &self.item,
            "category" => &self.category,
            "color" => &self.color,
            "style" => &self.style,
            "fit" => &self.fit,
            "suitable_seasons" => &self.suitable_seasons,
            "warmth_level" => &self.warmth_level,
            "coverage" => &self.coverage,
            "water_resistant" => &self.water_resistant,
            "clothing_features" => &self.clothing_features,
            "pattern_or_graphics" => &self.pattern_or_graphics,
            "suggested_occasions" => &self.suggested_occasions,
            "layering_potential" => &self.layering_potential,
            "visual_description" => &self.visual_description,
            "visible_accessories" => &self.visible_accessories,
            "source_image" => &self.source_image,
            "id" => &self.id,
            _ => return self.extra.get(name).and_then(Value::as_str),
        };
        value.as_deref()
    }

    /// Known descriptive fields that are present, in prompt order.
    pub fn described_fields(&self) -> Vec<(&'static str, &str)> {
        GARMENT_FIELDS
            .iter()
            .filter_map(|name| self.field(name).map(|value| (*name, value)))
            .collect()
    }

    /// One-line label used in listings: item, color and source image.
    pub fn label(&self) -> String {
        let item = self.item.as_deref().unwrap_or("unnamed garment");
        let mut label = match self.color.as_deref() {
            Some(color) if !color.is_empty() => format!("{color} {item}"),
            _ => item.to_string(),
        };
        if let Some(source) = self.source_image.as_deref() {
            label.push_str(&format!(" ({source})"));
        }
        label
    }
}

fn free_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    text_from_value(&value).map_err(de::Error::custom)
}

fn text_from_value(value: &Value) -> Result<Option<String>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text.trim().to_string())),
        Value::Bool(flag) => Ok(Some(if *flag { "yes" } else { "no" }.to_string())),
        Value::Number(number) => Ok(Some(number.to_string())),
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Array(_) | Value::Object(_) => {
                        return Err(format!(
                            "expected free-form text, found a list containing {}",
                            json_kind(item)
                        ))
                    }
                    other => {
                        if let Some(text) = text_from_value(other)? {
                            if !text.is_empty() {
                                parts.push(text);
                            }
                        }
                    }
                }
            }
            if parts.is_empty() {
                Ok(None)
            } else {
                Ok(Some(parts.join(", ")))
            }
        }
        Value::Object(_) => Err("expected free-form text, found a nested object".to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_named_fields_and_keeps_unknown_keys() -> anyhow::Result<()> {
        let record = GarmentRecord::from_json_str(
            r#"{"item":"shirt","color":"blue","fabric":"linen","source_image":"a.jpg"}"#,
        )?;
        assert_eq!(record.item.as_deref(), Some("shirt"));
        assert_eq!(record.color.as_deref(), Some("blue"));
        assert_eq!(record.source_image.as_deref(), Some("a.jpg"));
        assert_eq!(record.extra.get("fabric"), Some(&json!("linen")));
        assert_eq!(record.field("fabric"), Some("linen"));
        Ok(())
    }

    #[test]
    fn lists_and_scalars_become_text() -> anyhow::Result<()> {
        let record = GarmentRecord::from_value(json!({
            "suitable_seasons": ["spring", "summer"],
            "water_resistant": false,
            "warmth_level": 2,
            "visible_accessories": [],
        }))?;
        assert_eq!(record.suitable_seasons.as_deref(), Some("spring, summer"));
        assert_eq!(record.water_resistant.as_deref(), Some("no"));
        assert_eq!(record.warmth_level.as_deref(), Some("2"));
        assert_eq!(record.visible_accessories, None);
        Ok(())
    }

    #[test]
    fn nested_objects_are_rejected() {
        let err = GarmentRecord::from_value(json!({"color": {"hex": "#0000ff"}}))
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("nested object"), "unexpected error: {err}");
    }

    #[test]
    fn top_level_must_be_an_object() {
        let err = GarmentRecord::from_json_str(r#"["shirt"]"#)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("must be a JSON object"), "unexpected error: {err}");
    }

    #[test]
    fn serializes_without_absent_fields() -> anyhow::Result<()> {
        let record = GarmentRecord {
            item: Some("jacket".to_string()),
            ..GarmentRecord::default()
        }
        .with_source_image("jacket.png");
        let line = record.to_json_line()?;
        assert_eq!(line, r#"{"item":"jacket","source_image":"jacket.png"}"#);
        assert_eq!(GarmentRecord::from_json_str(&line)?, record);
        Ok(())
    }

    #[test]
    fn described_fields_follow_prompt_order() {
        let record = GarmentRecord {
            fit: Some("slim".to_string()),
            item: Some("jeans".to_string()),
            ..GarmentRecord::default()
        };
        assert_eq!(
            record.described_fields(),
            vec![("item", "jeans"), ("fit", "slim")]
        );
        assert_eq!(record.label(), "jeans");
    }
}
