//! Free-text nutrition parser.
//!
//! Backends answer in loosely formatted prose. Each numeric field has an
//! ordered keyword list, and each keyword is tried with an ordered list of
//! extraction strategies; the first hit wins. A field with no hit gets its
//! default, so parsing never fails.

use regex::Regex;
use std::sync::LazyLock;
use strum::Display;

use crate::models::analysis::{NutritionRecord, UNIDENTIFIED_FOOD};

/// Ways a number can be attached to a keyword, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `Calories: 200`
    LabeledColon,
    /// `calories around 200`
    Proximity,
    /// `200 kcal calories`, `10 g protein`
    UnitSuffix,
}

pub const STRATEGIES: &[Strategy] = &[
    Strategy::LabeledColon,
    Strategy::Proximity,
    Strategy::UnitSuffix,
];

const NUMBER: &str = r"(\d+(?:\.\d+)?)";

impl Strategy {
    pub fn pattern(self, keyword: &str) -> String {
        let keyword = regex::escape(keyword);
        match self {
            Strategy::LabeledColon => format!(r"(?i){keyword}[^:\n\d,;]{{0,30}}:\s*{NUMBER}"),
            Strategy::Proximity => format!(r"(?i){keyword}[^\d\n,;]{{0,30}}?{NUMBER}"),
            Strategy::UnitSuffix => {
                format!(r"(?i){NUMBER}\s*(?:g|mg|kcal|cal|%)?\s*{keyword}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum NutrientField {
    Calories,
    Protein,
    Carbs,
    Fat,
    Fiber,
    Confidence,
}

pub struct FieldRule {
    pub field: NutrientField,
    pub keywords: &'static [&'static str],
}

/// Keyword lists per field, most specific first. Spanish and English.
pub const FIELD_RULES: &[FieldRule] = &[
    FieldRule {
        field: NutrientField::Calories,
        keywords: &["calor", "kcal", "cal"],
    },
    FieldRule {
        field: NutrientField::Protein,
        keywords: &["prote", "protein"],
    },
    FieldRule {
        field: NutrientField::Carbs,
        keywords: &["carboh", "carb", "hidrat"],
    },
    FieldRule {
        field: NutrientField::Fat,
        keywords: &["gras", "fat", "lip"],
    },
    FieldRule {
        field: NutrientField::Fiber,
        keywords: &["fibra", "fiber", "fibre"],
    },
    FieldRule {
        field: NutrientField::Confidence,
        keywords: &["confianza", "confidence", "certeza"],
    },
];

/// Labels that introduce the food name, tried in order.
pub const NAME_LABELS: &[&str] = &[
    "food", "comida", "item", "alimento", "dish", "plato", "type", "tipo",
];

/// Lines containing any of these are never taken as the food name.
const NUTRIENT_WORDS: &[&str] = &[
    "calor", "kcal", "prote", "carb", "hidrat", "gras", "fat", "fibra", "fiber", "confianza",
    "confidence",
];

const MAX_NAME_WORDS: usize = 8;

static FIELD_PATTERNS: LazyLock<Vec<(NutrientField, Vec<Regex>)>> = LazyLock::new(|| {
    FIELD_RULES
        .iter()
        .map(|rule| {
            let patterns = rule
                .keywords
                .iter()
                .flat_map(|keyword| {
                    STRATEGIES
                        .iter()
                        .map(move |strategy| strategy.pattern(keyword))
                })
                .map(|pattern| Regex::new(&pattern).expect("valid field pattern"))
                .collect();
            (rule.field, patterns)
        })
        .collect()
});

static NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    NAME_LABELS
        .iter()
        .map(|label| {
            let pattern = format!(r"(?i)\b{}\s*:\s*([^\n\r,;]+)", regex::escape(label));
            Regex::new(&pattern).expect("valid name pattern")
        })
        .collect()
});

/// First number found for `field`, or `None` when no strategy matches.
pub fn extract_value(text: &str, field: NutrientField) -> Option<f64> {
    let (_, patterns) = FIELD_PATTERNS.iter().find(|(f, _)| *f == field)?;
    patterns.iter().find_map(|re| {
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    })
}

fn clean_name(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| c == '*' || c == '_' || c == '"')
        .trim_end_matches(['.', ',', '!', '?'])
        .trim()
        .to_string()
}

/// Food name from labeled fields, else the first non-nutrient line, else
/// the unidentified label.
pub fn extract_food_name(text: &str) -> String {
    for re in NAME_PATTERNS.iter() {
        if let Some(m) = re.captures(text).and_then(|caps| caps.get(1)) {
            let name = clean_name(m.as_str());
            if !name.is_empty() {
                return name;
            }
        }
    }

    for line in text.lines() {
        let line = line.trim().trim_start_matches(['-', '*', '#', ' ']);
        let lowered = line.to_lowercase();
        if line.is_empty() || NUTRIENT_WORDS.iter().any(|kw| lowered.contains(kw)) {
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().take(MAX_NAME_WORDS).collect();
        let name = clean_name(&words.join(" "));
        if !name.is_empty() {
            return name;
        }
    }

    UNIDENTIFIED_FOOD.to_string()
}

/// Parse backend text into a complete record. Missing values take their
/// defaults: 0 for nutrients, `default_confidence` for confidence.
pub fn parse_nutrition(text: &str, default_confidence: f64) -> NutritionRecord {
    let value = |field: NutrientField, default: f64| {
        extract_value(text, field).unwrap_or_else(|| {
            tracing::debug!(field = %field, default, "No value found in analysis text, using default");
            default
        })
    };

    NutritionRecord::new(
        &extract_food_name(text),
        value(NutrientField::Calories, 0.0),
        value(NutrientField::Protein, 0.0),
        value(NutrientField::Carbs, 0.0),
        value(NutrientField::Fat, 0.0),
        value(NutrientField::Fiber, 0.0),
        value(NutrientField::Confidence, default_confidence),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use garde::Validate;

    #[test]
    fn test_single_line_spanish_answer() {
        let record = parse_nutrition(
            "Comida: Ensalada, Calorías: 200 kcal, Proteínas: 10 g",
            85.0,
        );
        assert_eq!(record.food_name, "Ensalada");
        assert_eq!(record.calories_kcal, 200.0);
        assert_eq!(record.protein_g, 10.0);
        assert_eq!(record.carbs_g, 0.0);
        assert_eq!(record.fiber_g, 0.0);
        assert_eq!(record.confidence_pct, 85.0);
    }

    #[test]
    fn test_template_answer_in_english() {
        let text = "Food: Grilled chicken with rice\n\
                    Calories: 520 kcal\n\
                    Protein: 42.5 g\n\
                    Carbohydrates: 55 g\n\
                    Fat: 12 g\n\
                    Fiber: 3 g\n\
                    Confidence: 80%";
        let record = parse_nutrition(text, 90.0);
        assert_eq!(record.food_name, "Grilled chicken with rice");
        assert_eq!(record.calories_kcal, 520.0);
        assert_eq!(record.protein_g, 42.5);
        assert_eq!(record.carbs_g, 55.0);
        assert_eq!(record.fat_g, 12.0);
        assert_eq!(record.fiber_g, 3.0);
        assert_eq!(record.confidence_pct, 80.0);
    }

    #[test]
    fn test_unit_suffix_form() {
        let text = "Estimated: 350 kcal total; 20 g protein; 8 g fat.";
        assert_eq!(extract_value(text, NutrientField::Protein), Some(20.0));
        assert_eq!(extract_value(text, NutrientField::Fat), Some(8.0));
        assert_eq!(extract_value(text, NutrientField::Calories), Some(350.0));
    }

    #[test]
    fn test_labels_do_not_leak_across_lines() {
        let text = "Calories unknown\nProtein: 12 g";
        assert_eq!(extract_value(text, NutrientField::Calories), None);
        assert_eq!(extract_value(text, NutrientField::Protein), Some(12.0));
    }

    #[test]
    fn test_empty_text_yields_complete_defaults() {
        let record = parse_nutrition("", 85.0);
        assert_eq!(record.food_name, UNIDENTIFIED_FOOD);
        assert_eq!(record.calories_kcal, 0.0);
        assert_eq!(record.fat_g, 0.0);
        assert_eq!(record.confidence_pct, 85.0);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_confidence_is_clamped() {
        let record = parse_nutrition("Confidence: 250", 85.0);
        assert_eq!(record.confidence_pct, 100.0);
    }

    #[test]
    fn test_food_name_falls_back_to_first_plain_line() {
        let text = "A bowl of ramen with egg and pork slices in rich broth\nCalories: 600";
        assert_eq!(
            extract_food_name(text),
            "A bowl of ramen with egg and pork"
        );
    }

    #[test]
    fn test_unknown_food_label_is_normalized() {
        let record = parse_nutrition("Food: unknown\nCalories: 100", 85.0);
        assert_eq!(record.food_name, UNIDENTIFIED_FOOD);
    }

    #[test]
    fn test_only_nutrient_lines_gives_unidentified_name() {
        assert_eq!(extract_food_name("Calories: 100\nProtein: 2"), UNIDENTIFIED_FOOD);
    }

    #[test]
    fn test_every_field_has_a_rule() {
        for field in [
            NutrientField::Calories,
            NutrientField::Protein,
            NutrientField::Carbs,
            NutrientField::Fat,
            NutrientField::Fiber,
            NutrientField::Confidence,
        ] {
            assert!(FIELD_RULES.iter().any(|rule| rule.field == field));
        }
    }
}
