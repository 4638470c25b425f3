use std::sync::Arc;

use tracing::debug;

use crate::completion::TextCompletion;
use crate::diagnostics::{Diagnostics, Stage};

/// Rewrites free-text addresses into canonical form through a text-completion
/// service. Always yields a usable address: any failure falls back to the input.
pub struct AddressNormalizer {
    completion: Arc<dyn TextCompletion>,
    diagnostics: Diagnostics,
}

impl AddressNormalizer {
    pub fn new(completion: Arc<dyn TextCompletion>, diagnostics: Diagnostics) -> Self {
        Self {
            completion,
            diagnostics,
        }
    }

    pub async fn normalize(&self, raw_address: &str) -> String {
        match self.completion.complete(&normalize_prompt(raw_address)).await {
            Ok(text) => {
                let corrected = text.trim();
                if corrected.is_empty() {
                    raw_address.to_string()
                } else {
                    corrected.to_string()
                }
            }
            Err(err) if err.is_rate_limited() => {
                debug!(?err, "address correction rate limited; using raw address");
                raw_address.to_string()
            }
            Err(err) => {
                self.diagnostics
                    .warn(Stage::Normalize, format!("address correction failed: {err}"));
                raw_address.to_string()
            }
        }
    }
}

pub fn normalize_prompt(raw_address: &str) -> String {
    format!("以下の住所を正確な住所フォーマットに修正してください: {raw_address}")
}
