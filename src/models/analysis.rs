use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Label used when no food name can be recovered from the analysis text.
pub const UNIDENTIFIED_FOOD: &str = "Unidentified food";

/// Food name placed in error records.
pub const FAILED_FOOD_NAME: &str = "Analysis failed";

/// Recognized "no answer" values for the food name, compared lowercase.
const UNKNOWN_SENTINELS: &[&str] = &[
    "unknown",
    "unidentified",
    "not identified",
    "no identificado",
    "desconocido",
    "n/a",
    "none",
];

/// Structured nutrition estimate for one image.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct NutritionRecord {
    #[garde(length(min = 1))]
    pub food_name: String,

    #[garde(range(min = 0.0))]
    pub calories_kcal: f64,

    #[garde(range(min = 0.0))]
    pub protein_g: f64,

    #[garde(range(min = 0.0))]
    pub carbs_g: f64,

    #[garde(range(min = 0.0))]
    pub fat_g: f64,

    #[garde(range(min = 0.0))]
    pub fiber_g: f64,

    #[garde(range(min = 0.0, max = 100.0))]
    pub confidence_pct: f64,
}

impl NutritionRecord {
    /// Build a record, normalizing the name and clamping every number into range.
    pub fn new(
        food_name: &str,
        calories_kcal: f64,
        protein_g: f64,
        carbs_g: f64,
        fat_g: f64,
        fiber_g: f64,
        confidence_pct: f64,
    ) -> Self {
        Self {
            food_name: normalize_food_name(food_name),
            calories_kcal: non_negative(calories_kcal),
            protein_g: non_negative(protein_g),
            carbs_g: non_negative(carbs_g),
            fat_g: non_negative(fat_g),
            fiber_g: non_negative(fiber_g),
            confidence_pct: non_negative(confidence_pct).min(100.0),
        }
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

/// Trim a food name, mapping blanks and "unknown"-style answers to [`UNIDENTIFIED_FOOD`].
pub fn normalize_food_name(name: &str) -> String {
    let trimmed = name.trim();
    let lowered = trimmed.to_lowercase();
    if trimmed.is_empty() || UNKNOWN_SENTINELS.contains(&lowered.as_str()) {
        UNIDENTIFIED_FOOD.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Terminal status of a stored result. "Processing" is never stored; it is
/// the absence of a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Error,
}

/// Outcome of one task, written once by the worker that processed it.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub task_id: String,
    pub filename: String,
    pub status: ResultStatus,
    pub nutrition: Option<NutritionRecord>,
    pub raw_analysis: String,
    pub backend_name: String,
    pub error_detail: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn completed(
        task_id: &str,
        filename: &str,
        nutrition: NutritionRecord,
        raw_analysis: String,
        backend_name: &str,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            filename: filename.to_string(),
            status: ResultStatus::Completed,
            nutrition: Some(nutrition),
            raw_analysis,
            backend_name: backend_name.to_string(),
            error_detail: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(task_id: &str, filename: &str, backend_name: &str, error: String) -> Self {
        Self {
            task_id: task_id.to_string(),
            filename: filename.to_string(),
            status: ResultStatus::Error,
            nutrition: None,
            raw_analysis: format!("Analysis error: {error}"),
            backend_name: backend_name.to_string(),
            error_detail: Some(error),
            completed_at: Utc::now(),
        }
    }
}

/// One nutrient as exposed to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Nutrient {
    pub value: f64,
    pub unit: String,
    pub description: String,
}

impl Nutrient {
    fn new(value: f64, unit: &str, description: &str) -> Self {
        Self {
            value,
            unit: unit.to_string(),
            description: description.to_string(),
        }
    }
}

/// Stored JSON shape of an [`AnalysisResult`].
///
/// `nombre` and `model` duplicate `food_name` and `backend_name` for older
/// clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultRecord {
    pub task_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub filename: String,
    pub food_name: String,
    #[serde(default)]
    pub nombre: String,
    pub calories: Nutrient,
    pub protein: Nutrient,
    pub carbohydrates: Nutrient,
    pub fat: Nutrient,
    pub fiber: Nutrient,
    pub confidence: Nutrient,
    pub raw_analysis: String,
    pub backend_name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl From<&AnalysisResult> for ResultRecord {
    fn from(result: &AnalysisResult) -> Self {
        let (food_name, calories, protein, carbs, fat, fiber, confidence, note) =
            match &result.nutrition {
                Some(n) => (
                    n.food_name.clone(),
                    n.calories_kcal,
                    n.protein_g,
                    n.carbs_g,
                    n.fat_g,
                    n.fiber_g,
                    n.confidence_pct,
                    None,
                ),
                None => (
                    FAILED_FOOD_NAME.to_string(),
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                    Some("Analysis error"),
                ),
            };

        let describe = |text: &'static str| note.unwrap_or(text);

        Self {
            task_id: result.task_id.clone(),
            status: result.status,
            filename: result.filename.clone(),
            nombre: food_name.clone(),
            food_name,
            calories: Nutrient::new(calories, "kcal", describe("Energy provided by the food")),
            protein: Nutrient::new(protein, "g", describe("Essential for muscle growth and repair")),
            carbohydrates: Nutrient::new(carbs, "g", describe("Main source of energy")),
            fat: Nutrient::new(fat, "g", describe("Needed to absorb vitamins")),
            fiber: Nutrient::new(fiber, "g", describe("Supports digestion and gut health")),
            confidence: Nutrient::new(confidence, "%", describe("Confidence of the analysis")),
            raw_analysis: result.raw_analysis.clone(),
            model: result.backend_name.clone(),
            backend_name: result.backend_name.clone(),
            error: result.error_detail.clone(),
            completed_at: result.completed_at,
        }
    }
}

impl From<ResultRecord> for AnalysisResult {
    fn from(record: ResultRecord) -> Self {
        let nutrition = match record.status {
            ResultStatus::Completed => Some(NutritionRecord::new(
                &record.food_name,
                record.calories.value,
                record.protein.value,
                record.carbohydrates.value,
                record.fat.value,
                record.fiber.value,
                record.confidence.value,
            )),
            ResultStatus::Error => None,
        };

        Self {
            task_id: record.task_id,
            filename: record.filename,
            status: record.status,
            nutrition,
            raw_analysis: record.raw_analysis,
            backend_name: record.backend_name,
            error_detail: record.error,
            completed_at: record.completed_at,
        }
    }
}
