// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job lifecycle states and the durable job record.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::JobInput;

/// Lifecycle state of a job.
///
/// Transitions form a DAG: `Received -> WaitingPayment -> Processing ->
/// {Completed, Failed}`, with `WaitingPayment -> Expired` on payment
/// timeout and `Received -> Failed` on invoice failure. Terminal states
/// are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Request observed and stored; no invoice yet.
    Received,
    /// Invoice issued; waiting for a matching zap receipt.
    WaitingPayment,
    /// Payment confirmed; execution in flight.
    Processing,
    /// Execution succeeded; `result` is set.
    Completed,
    /// Invoice creation or execution failed; `error` is set.
    Failed,
    /// Payment never arrived within the timeout.
    Expired,
}

impl JobState {
    /// Stable string form used in the database column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::WaitingPayment => "waiting_payment",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// Whether the `self -> next` edge is in the allowed transition set.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::WaitingPayment)
                | (Self::Received, Self::Failed)
                | (Self::WaitingPayment, Self::Processing)
                | (Self::WaitingPayment, Self::Expired)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`JobState`] from its database string form.
#[derive(Debug, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct JobStateParseError(pub String);

impl std::str::FromStr for JobState {
    type Err = JobStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "waiting_payment" => Ok(Self::WaitingPayment),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(JobStateParseError(other.to_string())),
        }
    }
}

/// A durable job record as held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Request event id (hex), the primary key.
    pub event_id: String,
    /// Requester pubkey (hex).
    pub customer: String,
    /// Request kind.
    pub kind: u16,
    /// Current lifecycle state.
    pub state: JobState,
    /// Decoded input snapshot, when one was stored.
    pub input: Option<JobInput>,
    /// BOLT-11 invoice handed to the customer.
    pub bolt11: Option<String>,
    /// Deterministic lookup hash of the invoice string.
    pub invoice_hash: Option<String>,
    /// Price in millisatoshis.
    pub amount_msats: Option<u64>,
    /// Execution output for completed jobs.
    pub result: Option<String>,
    /// Failure summary for failed jobs.
    pub error: Option<String>,
    /// Creation time, unix seconds.
    pub created_at: i64,
    /// Last mutation time, unix seconds.
    pub updated_at: i64,
}

/// Status values carried by kind-7000 feedback events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackStatus {
    /// Invoice attached; pay to proceed.
    PaymentRequired,
    /// Payment confirmed; execution started.
    Processing,
    /// The job failed; content carries a brief reason.
    Error,
    /// The job finished; the result event follows.
    Success,
}

impl FeedbackStatus {
    /// Wire form used in the `status` tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentRequired => "payment-required",
            Self::Processing => "processing",
            Self::Error => "error",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
