// SPDX-License-Identifier: MIT OR Apache-2.0
//! The five shipped services.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use dvm_core::{
    JobInput, KIND_DISCOVERY, KIND_IMAGE_GENERATION, KIND_TEXT_EXTRACTION, KIND_TEXT_GENERATION,
    KIND_TRANSLATION,
};

use crate::{estimate_tokens, DvmService, InferenceBackend, InferenceParams, ServiceError};

fn has_text(input: &JobInput) -> bool {
    !input.primary_text().trim().is_empty()
}

// ---------------------------------------------------------------------------
// Translation (kind 5000)
// ---------------------------------------------------------------------------

/// Text translation between languages.
pub struct TranslationService {
    backend: Arc<dyn InferenceBackend>,
    base_msats: u64,
}

impl TranslationService {
    /// Create the service with its base price.
    pub fn new(backend: Arc<dyn InferenceBackend>, base_msats: u64) -> Self {
        Self { backend, base_msats }
    }
}

#[async_trait]
impl DvmService for TranslationService {
    fn kind(&self) -> u16 {
        KIND_TRANSLATION
    }

    fn name(&self) -> &'static str {
        "Translation"
    }

    fn description(&self) -> &'static str {
        "Text translation between languages"
    }

    fn default_price_msats(&self) -> u64 {
        self.base_msats
    }

    fn validate(&self, input: &JobInput) -> bool {
        has_text(input)
    }

    fn price(&self, input: &JobInput) -> u64 {
        if estimate_tokens(input.primary_text()) > 1000 {
            self.base_msats * 2
        } else {
            self.base_msats
        }
    }

    async fn execute(&self, input: &JobInput) -> Result<String, ServiceError> {
        let text = input.primary_text();
        let target = input
            .params
            .get("language")
            .or_else(|| input.params.get("target"))
            .map(String::as_str)
            .unwrap_or("English");
        let source = input.params.get("source").map(String::as_str).unwrap_or("auto");

        let prompt = if source == "auto" {
            format!("Translate the following text to {target}:\n\n{text}")
        } else {
            format!("Translate the following text from {source} to {target}:\n\n{text}")
        };
        let params = InferenceParams::default()
            .with_system(
                "You are a professional translator. Translate accurately while preserving \
                 meaning and tone.",
            )
            .with_temperature(0.3);
        self.backend.generate(&prompt, &params).await
    }
}

// ---------------------------------------------------------------------------
// Text generation / summarization (kind 5001)
// ---------------------------------------------------------------------------

/// LLM text generation, with an internal summarization sub-route.
///
/// A request selects summarization with `param task summarize` or a
/// `t`-topic of `summarize`; the `task` param takes precedence.
pub struct TextGenerationService {
    backend: Arc<dyn InferenceBackend>,
    base_msats: u64,
    summarize_base_msats: u64,
}

impl TextGenerationService {
    /// Create the service with generation and summarization base prices.
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        base_msats: u64,
        summarize_base_msats: u64,
    ) -> Self {
        Self {
            backend,
            base_msats,
            summarize_base_msats,
        }
    }

    fn is_summarize(input: &JobInput) -> bool {
        if let Some(task) = input.params.get("task") {
            return task == "summarize";
        }
        input.has_topic("summarize")
    }
}

#[async_trait]
impl DvmService for TextGenerationService {
    fn kind(&self) -> u16 {
        KIND_TEXT_GENERATION
    }

    fn name(&self) -> &'static str {
        "Text Generation"
    }

    fn description(&self) -> &'static str {
        "LLM text generation and summarization"
    }

    fn default_price_msats(&self) -> u64 {
        self.base_msats
    }

    fn validate(&self, input: &JobInput) -> bool {
        has_text(input)
    }

    fn price(&self, input: &JobInput) -> u64 {
        let tokens = estimate_tokens(input.primary_text());
        if Self::is_summarize(input) {
            if tokens > 5000 {
                self.summarize_base_msats * 3
            } else if tokens > 1000 {
                self.summarize_base_msats * 2
            } else {
                self.summarize_base_msats
            }
        } else if tokens > 2000 {
            self.base_msats * 3
        } else if tokens > 500 {
            self.base_msats * 2
        } else {
            self.base_msats
        }
    }

    async fn execute(&self, input: &JobInput) -> Result<String, ServiceError> {
        let text = input.primary_text();
        if Self::is_summarize(input) {
            let length = input
                .params
                .get("max_length")
                .map(String::as_str)
                .unwrap_or("concise");
            let prompt = format!("Provide a {length} summary of the following text:\n\n{text}");
            let params = InferenceParams::default()
                .with_system("You are an expert at creating clear, accurate summaries.")
                .with_temperature(0.3);
            return self.backend.generate(&prompt, &params).await;
        }

        let params = InferenceParams::from_job_params(&input.params);
        self.backend.generate(text, &params).await
    }
}

// ---------------------------------------------------------------------------
// URL text extraction (kind 5002)
// ---------------------------------------------------------------------------

/// Upper bound on page content handed to the model.
const EXTRACTION_CONTENT_CAP: usize = 50_000;

/// Extract and analyze content from a URL input.
pub struct UrlExtractionService {
    backend: Arc<dyn InferenceBackend>,
    http: reqwest::Client,
    base_msats: u64,
}

impl UrlExtractionService {
    /// Create the service with its flat price.
    pub fn new(backend: Arc<dyn InferenceBackend>, base_msats: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent("sats.ai DVM Agent/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            backend,
            http,
            base_msats,
        }
    }

    fn url_input(input: &JobInput) -> Option<&str> {
        input
            .input_of_type("url")
            .map(|e| e.value.as_str())
            .filter(|v| v.starts_with("http"))
    }
}

#[async_trait]
impl DvmService for UrlExtractionService {
    fn kind(&self) -> u16 {
        KIND_TEXT_EXTRACTION
    }

    fn name(&self) -> &'static str {
        "Text Extraction"
    }

    fn description(&self) -> &'static str {
        "Extract and analyze content from URLs"
    }

    fn default_price_msats(&self) -> u64 {
        self.base_msats
    }

    fn validate(&self, input: &JobInput) -> bool {
        Self::url_input(input).is_some()
    }

    fn price(&self, _input: &JobInput) -> u64 {
        self.base_msats
    }

    async fn execute(&self, input: &JobInput) -> Result<String, ServiceError> {
        let url = Self::url_input(input)
            .ok_or_else(|| ServiceError::InvalidInput("no URL provided in job inputs".into()))?;

        info!(target: "dvm.service", url, "fetching url");
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|_| ServiceError::Fetch(format!("failed to fetch URL: {url}")))?
            .error_for_status()
            .map_err(|e| {
                let status = e
                    .status()
                    .map(|s| s.as_u16().to_string())
                    .unwrap_or_else(|| "?".into());
                ServiceError::Fetch(format!("HTTP {status} fetching URL: {url}"))
            })?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let raw = resp
            .text()
            .await
            .map_err(|_| ServiceError::Fetch(format!("failed to read URL: {url}")))?;

        let mut content = if content_type.contains("html") {
            strip_html(&raw)
        } else {
            raw
        };
        if content.trim().len() < 10 {
            return Err(ServiceError::InvalidInput(format!(
                "no meaningful content extracted from {url}"
            )));
        }
        if content.len() > EXTRACTION_CONTENT_CAP {
            let mut cut = EXTRACTION_CONTENT_CAP;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
        }

        let prompt = format!(
            "Analyze and extract the key information from the following web page content.\n\
             Source URL: {url}\n\nContent:\n{content}"
        );
        let params = InferenceParams::default()
            .with_system(
                "You are an expert at analyzing and extracting key information from web content.",
            )
            .with_temperature(0.2);
        self.backend.generate(&prompt, &params).await
    }
}

/// Strip scripts, styles, tags, and runs of whitespace from an HTML page.
pub fn strip_html(html: &str) -> String {
    static SCRIPT_STYLE: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();

    let script_style = SCRIPT_STYLE.get_or_init(|| {
        Regex::new(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>")
            .expect("static regex")
    });
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"));
    let whitespace = WHITESPACE.get_or_init(|| Regex::new(r"\s{3,}").expect("static regex"));

    let text = script_style.replace_all(html, "");
    let text = tag.replace_all(&text, " ");
    let text = whitespace.replace_all(&text, "\n\n");
    text.trim().to_string()
}

// ---------------------------------------------------------------------------
// Image generation (kind 5100)
// ---------------------------------------------------------------------------

/// Text-to-image generation.
///
/// The shipped backend contract is text-only, so this service produces a
/// detailed visual rendering prompt the way the upstream model's text
/// fallback does; a future backend returning a data URL passes straight
/// through as result content.
pub struct ImageGenerationService {
    backend: Arc<dyn InferenceBackend>,
    base_msats: u64,
}

impl ImageGenerationService {
    /// Create the service with its flat price.
    pub fn new(backend: Arc<dyn InferenceBackend>, base_msats: u64) -> Self {
        Self { backend, base_msats }
    }
}

#[async_trait]
impl DvmService for ImageGenerationService {
    fn kind(&self) -> u16 {
        KIND_IMAGE_GENERATION
    }

    fn name(&self) -> &'static str {
        "Image Generation"
    }

    fn description(&self) -> &'static str {
        "Text-to-image generation"
    }

    fn default_price_msats(&self) -> u64 {
        self.base_msats
    }

    fn validate(&self, input: &JobInput) -> bool {
        has_text(input)
    }

    fn price(&self, _input: &JobInput) -> u64 {
        self.base_msats
    }

    async fn execute(&self, input: &JobInput) -> Result<String, ServiceError> {
        let prompt = format!(
            "Create a detailed visual description for: {}",
            input.primary_text()
        );
        let params = InferenceParams::default()
            .with_system(
                "You are a creative visual artist. Create a vivid, detailed visual description.",
            )
            .with_temperature(0.8);
        self.backend.generate(&prompt, &params).await
    }
}

// ---------------------------------------------------------------------------
// Content discovery (kind 5300)
// ---------------------------------------------------------------------------

/// Search and curate content from a query.
pub struct DiscoveryService {
    backend: Arc<dyn InferenceBackend>,
    base_msats: u64,
}

impl DiscoveryService {
    /// Create the service with its flat price.
    pub fn new(backend: Arc<dyn InferenceBackend>, base_msats: u64) -> Self {
        Self { backend, base_msats }
    }
}

#[async_trait]
impl DvmService for DiscoveryService {
    fn kind(&self) -> u16 {
        KIND_DISCOVERY
    }

    fn name(&self) -> &'static str {
        "Content Discovery"
    }

    fn description(&self) -> &'static str {
        "Search and curate content using AI"
    }

    fn default_price_msats(&self) -> u64 {
        self.base_msats
    }

    fn validate(&self, input: &JobInput) -> bool {
        has_text(input)
    }

    fn price(&self, _input: &JobInput) -> u64 {
        self.base_msats
    }

    async fn execute(&self, input: &JobInput) -> Result<String, ServiceError> {
        let prompt = format!(
            "You are a content discovery assistant. Based on the following search query, \
             provide a curated list of relevant topics, insights, and recommendations:\n\n\
             Query: {}",
            input.primary_text()
        );
        let params = InferenceParams::from_job_params(&input.params);
        self.backend.generate(&prompt, &params).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockInference;
    use dvm_core::InputEntry;

    fn text_input(text: &str) -> JobInput {
        JobInput {
            event_id: "evt".into(),
            customer: "pk".into(),
            kind: 5001,
            inputs: vec![InputEntry {
                value: text.into(),
                input_type: "text".into(),
                relay: None,
            }],
            ..Default::default()
        }
    }

    fn url_input(url: &str) -> JobInput {
        JobInput {
            event_id: "evt".into(),
            customer: "pk".into(),
            kind: 5002,
            inputs: vec![InputEntry {
                value: url.into(),
                input_type: "url".into(),
                relay: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn empty_input_fails_validation_everywhere() {
        let backend = Arc::new(MockInference::default());
        let empty = JobInput::default();
        assert!(!TranslationService::new(backend.clone(), 300).validate(&empty));
        assert!(!TextGenerationService::new(backend.clone(), 500, 400).validate(&empty));
        assert!(!ImageGenerationService::new(backend.clone(), 2000).validate(&empty));
        assert!(!DiscoveryService::new(backend.clone(), 500).validate(&empty));
        assert!(!UrlExtractionService::new(backend, 200).validate(&empty));
    }

    #[test]
    fn extraction_requires_http_url_input() {
        let backend = Arc::new(MockInference::default());
        let svc = UrlExtractionService::new(backend, 200);
        assert!(svc.validate(&url_input("https://example.com/page")));
        assert!(!svc.validate(&url_input("ftp://example.com")));
        assert!(!svc.validate(&text_input("https://example.com")));
    }

    #[test]
    fn text_generation_pricing_tiers() {
        let backend = Arc::new(MockInference::default());
        let svc = TextGenerationService::new(backend, 500, 400);

        assert_eq!(svc.price(&text_input("short")), 500);
        // ~501 tokens -> 2x.
        assert_eq!(svc.price(&text_input(&"x".repeat(2100))), 1000);
        // ~2001 tokens -> 3x.
        assert_eq!(svc.price(&text_input(&"x".repeat(8100))), 1500);
    }

    #[test]
    fn summarization_sub_route_uses_its_own_tiers() {
        let backend = Arc::new(MockInference::default());
        let svc = TextGenerationService::new(backend, 500, 400);

        let mut input = text_input(&"x".repeat(8100)); // ~2025 tokens
        input.params.insert("task".into(), "summarize".into());
        // Summarize tiers: 2x above 1000 tokens, 3x above 5000.
        assert_eq!(svc.price(&input), 800);

        let mut input = text_input(&"x".repeat(21_000)); // ~5250 tokens
        input.topics.push("summarize".into());
        assert_eq!(svc.price(&input), 1200);
    }

    #[test]
    fn task_param_takes_precedence_over_topic() {
        let backend = Arc::new(MockInference::default());
        let svc = TextGenerationService::new(backend, 500, 400);

        // Topic says summarize, but the explicit task says otherwise.
        let mut input = text_input("hello");
        input.topics.push("summarize".into());
        input.params.insert("task".into(), "generate".into());
        assert_eq!(svc.price(&input), 500);
    }

    #[test]
    fn translation_pricing_doubles_on_long_input() {
        let backend = Arc::new(MockInference::default());
        let svc = TranslationService::new(backend, 300);
        assert_eq!(svc.price(&text_input("bonjour")), 300);
        assert_eq!(svc.price(&text_input(&"x".repeat(4100))), 600);
    }

    #[tokio::test]
    async fn translation_prompt_names_target_language() {
        let backend = Arc::new(MockInference::replying("hallo"));
        let svc = TranslationService::new(backend.clone(), 300);

        let mut input = text_input("hello");
        input.params.insert("language".into(), "German".into());
        let out = svc.execute(&input).await.unwrap();
        assert_eq!(out, "hallo");

        let prompts = backend.prompts();
        assert!(prompts[0].contains("to German"));
        assert!(prompts[0].contains("hello"));
    }

    #[tokio::test]
    async fn summarize_route_builds_summary_prompt() {
        let backend = Arc::new(MockInference::replying("tl;dr"));
        let svc = TextGenerationService::new(backend.clone(), 500, 400);

        let mut input = text_input("a long article");
        input.params.insert("task".into(), "summarize".into());
        svc.execute(&input).await.unwrap();
        assert!(backend.prompts()[0].contains("summary of the following text"));
    }

    #[tokio::test]
    async fn generation_route_passes_prompt_through() {
        let backend = Arc::new(MockInference::replying("out"));
        let svc = TextGenerationService::new(backend.clone(), 500, 400);
        svc.execute(&text_input("write a haiku")).await.unwrap();
        assert_eq!(backend.prompts(), vec!["write a haiku"]);
    }

    #[tokio::test]
    async fn extraction_fetches_strips_and_prompts() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(
                        "<html><head><style>body{}</style></head>\
                         <body><script>var x=1;</script><p>Useful article text here.</p></body></html>",
                    )
                    .insert_header("content-type", "text/html"),
            )
            .mount(&server)
            .await;

        let backend = Arc::new(MockInference::replying("extracted"));
        let svc = UrlExtractionService::new(backend.clone(), 200);
        let input = url_input(&format!("{}/article", server.uri()));
        let out = svc.execute(&input).await.unwrap();
        assert_eq!(out, "extracted");

        let prompt = backend.prompts().remove(0);
        assert!(prompt.contains("Useful article text here."));
        assert!(!prompt.contains("var x=1"));
        assert!(!prompt.contains("body{}"));
    }

    #[tokio::test]
    async fn extraction_rejects_empty_pages() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body></body></html>")
                    .insert_header("content-type", "text/html"),
            )
            .mount(&server)
            .await;

        let backend = Arc::new(MockInference::default());
        let svc = UrlExtractionService::new(backend, 200);
        let input = url_input(&format!("{}/empty", server.uri()));
        let err = svc.execute(&input).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn extraction_reports_http_status() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = Arc::new(MockInference::default());
        let svc = UrlExtractionService::new(backend, 200);
        let input = url_input(&format!("{}/gone", server.uri()));
        let err = svc.execute(&input).await.unwrap_err();
        match err {
            ServiceError::Fetch(msg) => assert!(msg.contains("404")),
            other => panic!("expected Fetch, got {other:?}"),
        }
    }

    #[test]
    fn strip_html_removes_markup() {
        let html = "<html><style>a{}</style><p>Hello   <b>world</b></p><script>x()</script></html>";
        let text = strip_html(html);
        assert!(text.contains("Hello"));
        assert!(text.contains("world"));
        assert!(!text.contains("<p>"));
        assert!(!text.contains("x()"));
        assert!(!text.contains("a{}"));
    }
}
