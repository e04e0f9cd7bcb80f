use closet_contracts::stylist::reply_schema;

use crate::vision::VisionAnalysis;

pub(crate) const CAPTION_PREFIX: &str = "Caption: ";

/// Illustrative values for each garment field; examples, not an enum.
pub const FIELD_GUIDE: &str = "\
- item: e.g. t-shirt, jacket, dress
- category: e.g. outerwear, activewear, loungewear
- color: predominant color, e.g. navy blue, light-gray, bright-red
- style: e.g. casual, formal, sporty, business
- fit: e.g. slim, loose, oversized
- suitable_seasons: e.g. summer, winter, all seasons
- warmth_level: e.g. lightweight, insulated, heavy
- coverage: e.g. full sleeves, sleeveless, cropped
- water_resistant: yes / no, based on visual
- clothing_features: e.g. hood, zipper, buttons, none
- pattern_or_graphics: e.g. solid, striped, graphic print
- suggested_occasions: e.g. gym, party, office, travel
- layering_potential: e.g. base layer, standalone, overlayer
- visual_description: 1-2 sentences describing only the garment's appearance (ignore background, setting, people)
- visible_accessories: e.g. scarf, belt, none";

pub const EXTRACTION_SYSTEM_MSG: &str = "You are a fashion-metadata extractor. \
Return ONLY one JSON object with the 15 fields from the Field Guide. \
Do not wrap the output in markdown, code-fences, or explanations. \
`color` must be free-form text (no hex codes, no nested objects). \
`visual_description` must be a concrete sentence (at most 30 words) about the garment only; ignore background or setting.";

/// User message for one image: the field guide followed by the vision
/// summary.
pub fn extraction_prompt(analysis: &VisionAnalysis) -> String {
    format!("{FIELD_GUIDE}\n\nVisual Info:\n{}", analysis.summary())
}

pub fn stylist_system_prompt() -> String {
    let schema = serde_json::to_string_pretty(&reply_schema()).unwrap_or_else(|_| "{}".to_string());
    format!(
        "You are a personal stylist.\n\n\
* Use the wardrobe list and the weather forecast provided in the message.\n\
* Recommend **only** items that really exist in the wardrobe list.\n\
* For every recommended item, include the matching `source_image`\n  \
filename in the **files** array, in the same order as **items**.\n\
* Your final answer must be **exactly** one JSON object matching:\n{schema}"
    )
}

#[cfg(test)]
mod tests {
    use closet_contracts::wardrobe::GARMENT_FIELDS;

    use super::*;

    #[test]
    fn field_guide_lists_every_garment_field() {
        for field in GARMENT_FIELDS {
            assert!(
                FIELD_GUIDE.contains(&format!("- {field}:")),
                "field guide misses {field}"
            );
        }
        assert_eq!(FIELD_GUIDE.lines().count(), GARMENT_FIELDS.len());
    }

    #[test]
    fn extraction_prompt_embeds_caption_and_tags() {
        let prompt = extraction_prompt(&VisionAnalysis {
            caption: Some("a blue shirt".to_string()),
            tags: vec!["shirt".to_string(), "blue".to_string()],
        });
        assert!(prompt.starts_with("- item:"));
        assert!(prompt.ends_with("Visual Info:\nCaption: a blue shirt\nTags: shirt, blue"));
        assert!(prompt.contains(&format!("\n{CAPTION_PREFIX}a blue shirt")));
    }

    #[test]
    fn stylist_prompt_embeds_schema() {
        let prompt = stylist_system_prompt();
        assert!(prompt.contains("\"commentary\""));
        assert!(prompt.contains("source_image"));
    }
}
