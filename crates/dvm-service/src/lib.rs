// SPDX-License-Identifier: MIT OR Apache-2.0
//! Service dispatch for the DVM agent.
//!
//! Each supported request kind maps to a [`DvmService`]: a capability set
//! `{validate, price, execute}`. Execution funnels through the narrow
//! [`InferenceBackend`] contract, so the orchestrator never talks to a
//! model API directly and tests can substitute a mock.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod inference;
mod registry;
mod services;

pub use inference::{HttpInference, InferenceBackend, InferenceParams, MockInference};
pub use registry::ServiceRegistry;
pub use services::{
    DiscoveryService, ImageGenerationService, TextGenerationService, TranslationService,
    UrlExtractionService,
};

use async_trait::async_trait;
use dvm_core::JobInput;

/// Errors surfaced by service validation and execution.
///
/// Messages are published verbatim as `status=error` feedback content, so
/// they stay brief and never carry internals.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The request input cannot be served.
    #[error("{0}")]
    InvalidInput(String),

    /// Fetching an external resource (e.g. a URL input) failed.
    #[error("{0}")]
    Fetch(String),

    /// The inference backend failed after retries.
    #[error("{0}")]
    Inference(String),
}

/// One service capability set, keyed by request kind.
#[async_trait]
pub trait DvmService: Send + Sync {
    /// Request kind this service handles.
    fn kind(&self) -> u16;
    /// Human-readable service name (advertised via NIP-89).
    fn name(&self) -> &'static str;
    /// One-line description.
    fn description(&self) -> &'static str;
    /// Base price in millisatoshis.
    fn default_price_msats(&self) -> u64;

    /// Whether the decoded input is servable. Pure.
    fn validate(&self, input: &JobInput) -> bool;

    /// Price the job from its input alone. Pure; never consults the
    /// network.
    fn price(&self, input: &JobInput) -> u64;

    /// Execute the job and return the result content.
    async fn execute(&self, input: &JobInput) -> Result<String, ServiceError>;
}

/// Rough token count estimate (1 token ~ 4 chars of English text).
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}
