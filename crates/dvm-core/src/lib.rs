// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared vocabulary for the DVM agent.
//!
//! This crate holds the protocol-level types every other crate speaks:
//! the NIP-90 job-input codec ([`JobInput`]), the job lifecycle states
//! ([`JobState`]), and the event-kind constants for requests, results,
//! feedback, and payment receipts.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod input;
mod job;

pub use input::{InputEntry, JobInput};
pub use job::{FeedbackStatus, Job, JobState, JobStateParseError};

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Translation job request.
pub const KIND_TRANSLATION: u16 = 5000;
/// Text generation / summarization job request.
pub const KIND_TEXT_GENERATION: u16 = 5001;
/// URL text-extraction job request.
pub const KIND_TEXT_EXTRACTION: u16 = 5002;
/// Image generation job request.
pub const KIND_IMAGE_GENERATION: u16 = 5100;
/// Content discovery job request.
pub const KIND_DISCOVERY: u16 = 5300;

/// Every job-request kind this agent subscribes to.
pub const JOB_REQUEST_KINDS: [u16; 5] = [
    KIND_TRANSLATION,
    KIND_TEXT_GENERATION,
    KIND_TEXT_EXTRACTION,
    KIND_IMAGE_GENERATION,
    KIND_DISCOVERY,
];

/// Job feedback event (NIP-90).
pub const KIND_JOB_FEEDBACK: u16 = 7000;
/// Zap request (NIP-57), embedded in receipts as the `description` tag.
pub const KIND_ZAP_REQUEST: u16 = 9734;
/// Zap receipt (NIP-57).
pub const KIND_ZAP_RECEIPT: u16 = 9735;
/// Handler-information advertisement (NIP-89).
pub const KIND_HANDLER_INFO: u16 = 31990;

/// Offset between a request kind and its result kind (5xxx -> 6xxx).
pub const RESULT_KIND_OFFSET: u16 = 1000;

/// Result kind for a given request kind.
pub fn result_kind(request_kind: u16) -> u16 {
    request_kind + RESULT_KIND_OFFSET
}

/// Returns `true` if `kind` is one of the job-request kinds this agent serves.
pub fn is_job_request_kind(kind: u16) -> bool {
    JOB_REQUEST_KINDS.contains(&kind)
}

/// Numeric value of a nostr [`Kind`](nostr::Kind).
pub fn kind_number(kind: nostr::Kind) -> u16 {
    kind.as_u32() as u16
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
