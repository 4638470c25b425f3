use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::completion::TextCompletion;
use crate::diagnostics::{Diagnostics, Stage};

/// Asks the text-completion service for adjusted coordinates. The caller's
/// coordinates are returned whenever the answer is unusable.
pub struct CoordinateRefiner {
    completion: Arc<dyn TextCompletion>,
    diagnostics: Diagnostics,
}

impl CoordinateRefiner {
    pub fn new(completion: Arc<dyn TextCompletion>, diagnostics: Diagnostics) -> Self {
        Self {
            completion,
            diagnostics,
        }
    }

    pub async fn refine(&self, original: &str, normalized: &str, lat: f64, lng: f64) -> (f64, f64) {
        let prompt = refine_prompt(original, normalized, lat, lng);
        let text = match self.completion.complete(&prompt).await {
            Ok(text) => text,
            Err(err) if err.is_rate_limited() => {
                debug!(?err, "coordinate refinement rate limited; keeping geocoder result");
                return (lat, lng);
            }
            Err(err) => {
                self.diagnostics
                    .warn(Stage::Refine, format!("coordinate refinement failed: {err}"));
                return (lat, lng);
            }
        };

        let parsed: Value = match serde_json::from_str(strip_code_fence(&text)) {
            Ok(value) => value,
            Err(err) => {
                debug!(%err, "refinement reply is not JSON; keeping geocoder result");
                return (lat, lng);
            }
        };

        match extract_coordinates(&parsed) {
            Some((refined_lat, refined_lng)) if in_range(refined_lat, refined_lng) => {
                (refined_lat, refined_lng)
            }
            Some((refined_lat, refined_lng)) => {
                self.diagnostics.warn(
                    Stage::Refine,
                    format!("refined coordinates out of range ({refined_lat}, {refined_lng})"),
                );
                (lat, lng)
            }
            None => {
                self.diagnostics.warn(
                    Stage::Refine,
                    "refinement reply is missing numeric \"lat\"/\"lng\" keys",
                );
                (lat, lng)
            }
        }
    }
}

pub fn refine_prompt(original: &str, normalized: &str, lat: f64, lng: f64) -> String {
    format!(
        "以下の情報に基づいて、より正確な緯度と経度をJSON形式で返してください。\n\
         ・元の住所: {original}\n\
         ・Geminiで補正した住所: {normalized}\n\
         ・現在の結果: 緯度 {lat}, 経度 {lng}\n\
         出力は以下のようにしてください: {{\"lat\": 数値, \"lng\": 数値}}"
    )
}

/// Removes surrounding whitespace and a Markdown code fence, if present.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

fn extract_coordinates(value: &Value) -> Option<(f64, f64)> {
    let object = value.as_object()?;
    let lat = object.get("lat")?.as_f64()?;
    let lng = object.get("lng")?.as_f64()?;
    Some((lat, lng))
}

fn in_range(lat: f64, lng: f64) -> bool {
    lat.is_finite() && lng.is_finite() && lat.abs() <= 90.0 && lng.abs() <= 180.0
}
