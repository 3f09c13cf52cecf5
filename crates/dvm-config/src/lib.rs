// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and env overrides for the DVM agent.
//!
//! This crate provides [`Settings`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, applying `DVM_*`
//! environment overrides, and producing advisory [`SettingsWarning`]s.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsWarning {
    /// A recommended optional field is missing or empty.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// The payment timeout is unusually large.
    LargePaymentTimeout {
        /// Timeout value in seconds.
        secs: u64,
    },
}

impl std::fmt::Display for SettingsWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            SettingsWarning::LargePaymentTimeout { secs } => {
                write!(f, "payment timeout is unusually large ({secs}s)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Settings types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the DVM agent.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    /// Nostr secret key (hex or nsec). Usually injected via
    /// `DVM_NOSTR_SECRET_KEY` rather than written to disk.
    #[serde(default)]
    pub nostr_secret_key: String,

    /// Relay WebSocket URLs to connect to.
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,

    /// Lightning address used to mint invoices via LNURL-pay.
    #[serde(default = "default_lightning_address")]
    pub lightning_address: String,

    /// Stable identifier for the NIP-89 `d` tag.
    #[serde(default = "default_agent_identifier")]
    pub agent_identifier: String,

    /// Display name advertised in the handler-information event.
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    /// Path of the sqlite job database.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Log level override (`error`..`trace`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds to wait for payment before a job expires.
    #[serde(default = "default_payment_timeout")]
    pub payment_timeout_secs: u64,

    /// Cadence of the expiry sweeper.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Upper bound on concurrently executing jobs.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: usize,

    /// Inference backend settings.
    #[serde(default)]
    pub inference: InferenceSettings,

    /// Per-service base prices in millisatoshis.
    #[serde(default)]
    pub costs: CostSettings,
}

/// Inference backend connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct InferenceSettings {
    /// API key for the hosted model endpoint. Usually `DVM_LLM_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Base URL of the generateContent-style endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            endpoint: default_endpoint(),
        }
    }
}

/// Base prices per service, in millisatoshis.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CostSettings {
    /// Kind 5000.
    #[serde(default = "default_cost_translation")]
    pub translation_msats: u64,
    /// Kind 5001.
    #[serde(default = "default_cost_text_generation")]
    pub text_generation_msats: u64,
    /// Kind 5001 summarization sub-route.
    #[serde(default = "default_cost_summarization")]
    pub summarization_msats: u64,
    /// Kind 5002.
    #[serde(default = "default_cost_text_extraction")]
    pub text_extraction_msats: u64,
    /// Kind 5100.
    #[serde(default = "default_cost_image_generation")]
    pub image_generation_msats: u64,
    /// Kind 5300 and anything without a dedicated price.
    #[serde(default = "default_cost_default")]
    pub default_msats: u64,
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            translation_msats: default_cost_translation(),
            text_generation_msats: default_cost_text_generation(),
            summarization_msats: default_cost_summarization(),
            text_extraction_msats: default_cost_text_extraction(),
            image_generation_msats: default_cost_image_generation(),
            default_msats: default_cost_default(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            nostr_secret_key: String::new(),
            relays: default_relays(),
            lightning_address: default_lightning_address(),
            agent_identifier: default_agent_identifier(),
            agent_name: default_agent_name(),
            db_path: default_db_path(),
            log_level: default_log_level(),
            payment_timeout_secs: default_payment_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            max_concurrent_jobs: default_max_concurrent(),
            inference: InferenceSettings::default(),
            costs: CostSettings::default(),
        }
    }
}

impl Settings {
    /// LNURL-pay metadata URL derived from the lightning address.
    ///
    /// `user@domain` resolves to
    /// `https://domain/.well-known/lnurlp/user`.
    pub fn lnurlp_url(&self) -> Option<String> {
        let (user, domain) = self.lightning_address.split_once('@')?;
        if user.is_empty() || domain.is_empty() {
            return None;
        }
        Some(format!("https://{domain}/.well-known/lnurlp/{user}"))
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_relays() -> Vec<String> {
    vec![
        "wss://relay.damus.io".to_string(),
        "wss://nos.lol".to_string(),
        "wss://relay.nostr.band".to_string(),
    ]
}

fn default_lightning_address() -> String {
    "satsai@strike.me".to_string()
}

fn default_agent_identifier() -> String {
    "sats-ai-dvm".to_string()
}

fn default_agent_name() -> String {
    "sats.ai DVM Agent".to_string()
}

fn default_db_path() -> String {
    "dvm_agent.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_payment_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    4
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_cost_translation() -> u64 {
    300
}

fn default_cost_text_generation() -> u64 {
    500
}

fn default_cost_summarization() -> u64 {
    400
}

fn default_cost_text_extraction() -> u64 {
    200
}

fn default_cost_image_generation() -> u64 {
    2000
}

fn default_cost_default() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Threshold above which the payment timeout generates a warning.
const LARGE_TIMEOUT_THRESHOLD: u64 = 3_600;

/// Upper bound for the worker pool size.
const MAX_CONCURRENT_JOBS: usize = 64;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load [`Settings`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`Settings::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, SettingsError> {
    let mut settings = match path {
        Some(p) => {
            let content =
                std::fs::read_to_string(p).map_err(|_| SettingsError::FileNotFound {
                    path: p.display().to_string(),
                })?;
            parse_toml(&content)?
        }
        None => Settings::default(),
    };
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Parse a TOML string into [`Settings`].
pub fn parse_toml(content: &str) -> Result<Settings, SettingsError> {
    toml::from_str::<Settings>(content).map_err(|e| SettingsError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `DVM_NOSTR_SECRET_KEY`
/// - `DVM_LLM_API_KEY`
/// - `DVM_RELAYS` (comma-separated)
/// - `DVM_LIGHTNING_ADDRESS`
/// - `DVM_DB_PATH`
/// - `DVM_LOG_LEVEL`
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(val) = std::env::var("DVM_NOSTR_SECRET_KEY") {
        settings.nostr_secret_key = val;
    }
    if let Ok(val) = std::env::var("DVM_LLM_API_KEY") {
        settings.inference.api_key = val;
    }
    if let Ok(val) = std::env::var("DVM_RELAYS") {
        let relays: Vec<String> = val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !relays.is_empty() {
            settings.relays = relays;
        }
    }
    if let Ok(val) = std::env::var("DVM_LIGHTNING_ADDRESS") {
        settings.lightning_address = val;
    }
    if let Ok(val) = std::env::var("DVM_DB_PATH") {
        settings.db_path = val;
    }
    if let Ok(val) = std::env::var("DVM_LOG_LEVEL") {
        settings.log_level = val;
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate parsed settings, returning advisory warnings.
///
/// Hard errors (missing key material, empty relay list, malformed lightning
/// address, out-of-range pool size) come back as a
/// [`SettingsError::ValidationError`]; soft issues come back as warnings.
pub fn validate_settings(settings: &Settings) -> Result<Vec<SettingsWarning>, SettingsError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<SettingsWarning> = Vec::new();

    if settings.nostr_secret_key.trim().is_empty() {
        errors.push("nostr_secret_key must be set (DVM_NOSTR_SECRET_KEY)".into());
    }

    if settings.relays.is_empty() {
        errors.push("relays must contain at least one URL".into());
    }
    for relay in &settings.relays {
        if !relay.starts_with("wss://") && !relay.starts_with("ws://") {
            errors.push(format!("relay '{relay}' is not a websocket URL"));
        }
    }

    if settings.lnurlp_url().is_none() {
        errors.push(format!(
            "lightning_address '{}' is not of the form user@domain",
            settings.lightning_address
        ));
    }

    if !VALID_LOG_LEVELS.contains(&settings.log_level.as_str()) {
        errors.push(format!("invalid log_level '{}'", settings.log_level));
    }

    if settings.payment_timeout_secs == 0 {
        errors.push("payment_timeout_secs must be positive".into());
    } else if settings.payment_timeout_secs > LARGE_TIMEOUT_THRESHOLD {
        warnings.push(SettingsWarning::LargePaymentTimeout {
            secs: settings.payment_timeout_secs,
        });
    }

    if settings.sweep_interval_secs == 0 {
        errors.push("sweep_interval_secs must be positive".into());
    }

    if settings.max_concurrent_jobs == 0 || settings.max_concurrent_jobs > MAX_CONCURRENT_JOBS {
        errors.push(format!(
            "max_concurrent_jobs {} out of range (1..{MAX_CONCURRENT_JOBS})",
            settings.max_concurrent_jobs
        ));
    }

    if settings.inference.api_key.trim().is_empty() {
        warnings.push(SettingsWarning::MissingOptionalField {
            field: "inference.api_key".into(),
            hint: "jobs will fail at execution until DVM_LLM_API_KEY is set".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(SettingsError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn keyed() -> Settings {
        Settings {
            nostr_secret_key: "a".repeat(64),
            ..Default::default()
        }
    }

    // -- 1. Defaults -----------------------------------------------------

    #[test]
    fn default_settings_have_sensible_values() {
        let s = Settings::default();
        assert_eq!(s.payment_timeout_secs, 300);
        assert_eq!(s.sweep_interval_secs, 30);
        assert_eq!(s.max_concurrent_jobs, 4);
        assert_eq!(s.log_level, "info");
        assert_eq!(s.relays.len(), 3);
        assert_eq!(s.costs.image_generation_msats, 2000);
    }

    #[test]
    fn default_settings_fail_validation_without_key() {
        let err = validate_settings(&Settings::default()).unwrap_err();
        assert!(matches!(err, SettingsError::ValidationError { .. }));
    }

    // -- 2. Parsing ------------------------------------------------------

    #[test]
    fn parse_valid_toml() {
        let toml = r#"
            nostr_secret_key = "deadbeef"
            relays = ["wss://relay.example"]
            lightning_address = "alice@getalby.com"
            payment_timeout_secs = 120

            [costs]
            text_generation_msats = 750
        "#;
        let s = parse_toml(toml).unwrap();
        assert_eq!(s.relays, vec!["wss://relay.example"]);
        assert_eq!(s.payment_timeout_secs, 120);
        assert_eq!(s.costs.text_generation_msats, 750);
        // Unset sections keep their defaults.
        assert_eq!(s.costs.translation_msats, 300);
        assert_eq!(s.inference.model, "gemini-2.5-flash");
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let err = parse_toml("this is [not valid toml =").unwrap_err();
        assert!(matches!(err, SettingsError::ParseError { .. }));
    }

    #[test]
    fn parse_wrong_types_gives_parse_error() {
        let err = parse_toml("payment_timeout_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, SettingsError::ParseError { .. }));
    }

    // -- 3. Validation ---------------------------------------------------

    #[test]
    fn validation_catches_empty_relays() {
        let mut s = keyed();
        s.relays.clear();
        let err = validate_settings(&s).unwrap_err();
        match err {
            SettingsError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("at least one URL")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_catches_non_websocket_relay() {
        let mut s = keyed();
        s.relays = vec!["https://relay.example".into()];
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn validation_catches_bad_lightning_address() {
        let mut s = keyed();
        s.lightning_address = "not-an-address".into();
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn validation_catches_zero_timeout_and_pool() {
        let mut s = keyed();
        s.payment_timeout_secs = 0;
        assert!(validate_settings(&s).is_err());

        let mut s = keyed();
        s.max_concurrent_jobs = 0;
        assert!(validate_settings(&s).is_err());

        let mut s = keyed();
        s.max_concurrent_jobs = 1000;
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn validation_catches_invalid_log_level() {
        let mut s = keyed();
        s.log_level = "verbose".into();
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn large_timeout_produces_warning() {
        let mut s = keyed();
        s.inference.api_key = "k".into();
        s.payment_timeout_secs = 7200;
        let warnings = validate_settings(&s).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, SettingsWarning::LargePaymentTimeout { secs: 7200 })));
    }

    #[test]
    fn missing_api_key_is_advisory_only() {
        let warnings = validate_settings(&keyed()).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, SettingsWarning::MissingOptionalField { .. })));
    }

    // -- 4. Env overrides ------------------------------------------------

    #[test]
    fn env_override_relays_splits_on_commas() {
        let mut s = keyed();
        std::env::set_var("DVM_RELAYS", "wss://a.example, wss://b.example ,");
        apply_env_overrides(&mut s);
        std::env::remove_var("DVM_RELAYS");
        assert_eq!(s.relays, vec!["wss://a.example", "wss://b.example"]);
    }

    // -- 5. Derived values -----------------------------------------------

    #[test]
    fn lnurlp_url_derivation() {
        let mut s = keyed();
        s.lightning_address = "alice@getalby.com".into();
        assert_eq!(
            s.lnurlp_url().as_deref(),
            Some("https://getalby.com/.well-known/lnurlp/alice")
        );

        s.lightning_address = "@getalby.com".into();
        assert!(s.lnurlp_url().is_none());
    }

    // -- 6. File loading -------------------------------------------------

    #[test]
    fn load_settings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dvm.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "db_path = \"/tmp/jobs.db\"\nlog_level = \"warn\"").unwrap();
        let s = load_settings(Some(&path)).unwrap();
        assert_eq!(s.db_path, "/tmp/jobs.db");
        assert_eq!(s.log_level, "warn");
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_settings(Some(Path::new("/nonexistent/dvm.toml"))).unwrap_err();
        assert!(matches!(err, SettingsError::FileNotFound { .. }));
    }

    #[test]
    fn toml_roundtrip() {
        let s = keyed();
        let serialized = toml::to_string(&s).unwrap();
        let back: Settings = toml::from_str(&serialized).unwrap();
        assert_eq!(s, back);
    }
}
