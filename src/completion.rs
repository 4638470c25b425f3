use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const SERVICE: &str = "gemini";

/// Free-text prompt in, free-text answer out.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, prompt: &str) -> AppResult<String>;
}

pub struct GeminiClient {
    http: Client,
    endpoint: String,
    api_key: SecretString,
}

impl GeminiClient {
    pub fn new(
        api_base: &str,
        model: &str,
        api_key: SecretString,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("batch-geocoder/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: format!(
                "{}/models/{}:generateContent",
                api_base.trim_end_matches('/'),
                model
            ),
            api_key,
        })
    }

    pub fn for_model(config: &AppConfig, model: &str, api_key: SecretString) -> AppResult<Self> {
        Self::new(
            &config.gemini_api_base,
            model,
            api_key,
            Duration::from_secs(config.http_timeout_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TextCompletion for GeminiClient {
    async fn complete(&self, prompt: &str) -> AppResult<String> {
        let body = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited { service: SERVICE });
        }
        if !status.is_success() {
            let message = response
                .json::<ErrorEnvelope>()
                .await
                .ok()
                .and_then(|envelope| envelope.error)
                .and_then(|detail| detail.message)
                .unwrap_or_else(|| "no error detail".to_string());
            return Err(AppError::Service {
                service: SERVICE,
                status: status.to_string(),
                message,
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        let text = parsed.into_text();
        trace!(endpoint = %self.endpoint, chars = text.len(), "gemini completion received");
        Ok(text)
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Deserialize)]
struct ResponseCandidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> String {
        self.candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_first_candidate_parts() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[
                {"content":{"parts":[{"text":"東京都"},{"text":"千代田区"}]}},
                {"content":{"parts":[{"text":"ignored"}]}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(parsed.into_text(), "東京都千代田区");
    }

    #[test]
    fn missing_candidates_yield_empty_text() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"promptFeedback":{}}"#).unwrap();
        assert_eq!(parsed.into_text(), "");

        let parsed: GenerateResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#).unwrap();
        assert_eq!(parsed.into_text(), "");
    }

    #[test]
    fn builds_model_endpoint() {
        let client = GeminiClient::new(
            "https://example.test/v1beta/",
            "gemini-2.0-flash",
            SecretString::new("key".into()),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            client.endpoint(),
            "https://example.test/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }
}
