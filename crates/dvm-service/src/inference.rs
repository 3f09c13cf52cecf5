// SPDX-License-Identifier: MIT OR Apache-2.0
//! The inference backend contract and its HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::ServiceError;

const MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF: f64 = 2.0;

/// Generation knobs passed alongside a prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceParams {
    /// System instruction, if any.
    pub system: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Output token ceiling.
    pub max_tokens: Option<u32>,
}

impl InferenceParams {
    /// Derive generation knobs from decoded job `param` entries.
    ///
    /// Unparseable values fall back to defaults; a customer cannot break a
    /// job by sending `temperature=warm`.
    pub fn from_job_params(params: &std::collections::BTreeMap<String, String>) -> Self {
        Self {
            system: None,
            temperature: params.get("temperature").and_then(|v| v.parse().ok()),
            max_tokens: params.get("max_tokens").and_then(|v| v.parse().ok()),
        }
    }

    /// Set the system instruction.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Narrow contract to the model host: prompt and knobs in, text out.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run one generation.
    async fn generate(&self, prompt: &str, params: &InferenceParams)
        -> Result<String, ServiceError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Inference over a hosted `generateContent`-style REST endpoint.
///
/// Transport and 5xx failures are retried with multiplicative backoff;
/// after the last attempt the error is condensed into
/// [`ServiceError::Inference`].
pub struct HttpInference {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    retry_backoff: f64,
}

impl HttpInference {
    /// Create a client for `endpoint` (base URL without the model path).
    pub fn new(endpoint: String, api_key: String, model: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            endpoint,
            api_key,
            model,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Override the retry backoff factor.
    pub fn backoff(mut self, factor: f64) -> Self {
        self.retry_backoff = factor;
        self
    }

    fn request_body(prompt: &str, params: &InferenceParams) -> Value {
        let mut config = serde_json::Map::new();
        if let Some(t) = params.temperature {
            config.insert("temperature".into(), json!(t));
        }
        if let Some(m) = params.max_tokens {
            config.insert("maxOutputTokens".into(), json!(m));
        }

        let mut body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": Value::Object(config),
        });
        if let Some(system) = &params.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }

    fn extract_text(value: &Value) -> Option<String> {
        let parts = value
            .get("candidates")?
            .get(0)?
            .get("content")?
            .get("parts")?
            .as_array()?;
        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpInference {
    async fn generate(
        &self,
        prompt: &str,
        params: &InferenceParams,
    ) -> Result<String, ServiceError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.endpoint, self.model, self.api_key
        );
        let body = Self::request_body(prompt, params);

        let mut last_error = String::new();
        for attempt in 0..MAX_RETRIES {
            let outcome = async {
                let resp = self
                    .http
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?
                    .error_for_status()
                    .map_err(|e| e.to_string())?;
                let value: Value = resp.json().await.map_err(|e| e.to_string())?;
                Self::extract_text(&value).ok_or_else(|| "model returned no text".to_string())
            }
            .await;

            match outcome {
                Ok(text) => {
                    info!(
                        target: "dvm.inference",
                        prompt_len = prompt.len(),
                        result_len = text.len(),
                        "generation complete"
                    );
                    return Ok(text);
                }
                Err(e) => last_error = e,
            }

            if attempt + 1 < MAX_RETRIES {
                let wait = self.retry_backoff.powi(attempt as i32 + 1);
                warn!(
                    target: "dvm.inference",
                    attempt = attempt + 1,
                    wait,
                    error = %last_error,
                    "inference retry"
                );
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
        }

        Err(ServiceError::Inference(format!(
            "model request failed: {last_error}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Mock implementation
// ---------------------------------------------------------------------------

/// Scripted backend for tests and dry runs: echoes a canned reply and
/// records every prompt it sees.
#[derive(Default)]
pub struct MockInference {
    reply: Option<String>,
    fail_with: Option<String>,
    prompts: std::sync::Mutex<Vec<String>>,
}

impl MockInference {
    /// Backend that always answers `reply`.
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            ..Default::default()
        }
    }

    /// Backend that always fails with the given message.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Default::default()
        }
    }

    /// Prompts observed so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompt lock poisoned").clone()
    }
}

#[async_trait]
impl InferenceBackend for MockInference {
    async fn generate(
        &self,
        prompt: &str,
        _params: &InferenceParams,
    ) -> Result<String, ServiceError> {
        self.prompts
            .lock()
            .expect("prompt lock poisoned")
            .push(prompt.to_string());
        if let Some(message) = &self.fail_with {
            return Err(ServiceError::Inference(message.clone()));
        }
        Ok(self
            .reply
            .clone()
            .unwrap_or_else(|| format!("echo: {prompt}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn candidate_body(text: &str) -> serde_json::Value {
        json!({
            "candidates": [{
                "content": { "parts": [{ "text": text }] }
            }]
        })
    }

    #[tokio::test]
    async fn happy_path_extracts_candidate_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/test-model:generateContent"))
            .and(body_partial_json(json!({
                "contents": [{ "parts": [{ "text": "hello" }] }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(candidate_body("world")))
            .mount(&server)
            .await;

        let backend = HttpInference::new(server.uri(), "key".into(), "test-model".into());
        let out = backend
            .generate("hello", &InferenceParams::default())
            .await
            .unwrap();
        assert_eq!(out, "world");
    }

    #[tokio::test]
    async fn system_and_config_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "systemInstruction": { "parts": [{ "text": "be terse" }] },
                "generationConfig": { "temperature": 0.3 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(candidate_body("ok")))
            .mount(&server)
            .await;

        let backend = HttpInference::new(server.uri(), "key".into(), "m".into());
        let params = InferenceParams::default()
            .with_system("be terse")
            .with_temperature(0.3);
        assert_eq!(backend.generate("p", &params).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn retries_then_reports_inference_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let backend =
            HttpInference::new(server.uri(), "key".into(), "m".into()).backoff(0.01);
        let err = backend
            .generate("p", &InferenceParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Inference(_)));
    }

    #[tokio::test]
    async fn empty_candidates_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
            .mount(&server)
            .await;

        let backend =
            HttpInference::new(server.uri(), "key".into(), "m".into()).backoff(0.01);
        assert!(backend
            .generate("p", &InferenceParams::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn mock_records_prompts() {
        let mock = MockInference::replying("canned");
        let out = mock
            .generate("first", &InferenceParams::default())
            .await
            .unwrap();
        assert_eq!(out, "canned");
        mock.generate("second", &InferenceParams::default())
            .await
            .unwrap();
        assert_eq!(mock.prompts(), vec!["first", "second"]);
    }

    #[test]
    fn job_params_parse_leniently() {
        let mut params = std::collections::BTreeMap::new();
        params.insert("temperature".to_string(), "0.4".to_string());
        params.insert("max_tokens".to_string(), "warm".to_string());
        let p = InferenceParams::from_job_params(&params);
        assert_eq!(p.temperature, Some(0.4));
        assert_eq!(p.max_tokens, None);
    }
}
