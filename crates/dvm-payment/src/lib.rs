// SPDX-License-Identifier: MIT OR Apache-2.0
//! Payment plumbing for the DVM agent.
//!
//! Two halves, both network-free to verify and narrow to call:
//!
//! * [`verify_zap_receipt`] — a pure function validating a kind-9735 zap
//!   receipt: event signature, embedded kind-9734 request, description-hash
//!   binding against the decoded BOLT-11 invoice, and the paid amount.
//! * [`LnurlPayClient`] — mints BOLT-11 invoices through LNURL-pay and
//!   exposes the [`InvoiceProvider`] contract the orchestrator talks to.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod lnurl;
mod verify;

pub use lnurl::{Invoice, InvoiceProvider, LnurlPayClient};
pub use verify::{verify_zap_receipt, PaymentReceipt};

use sha2::{Digest, Sha256};

/// Deterministic lookup key for an invoice: hex SHA-256 of the bolt11
/// string. Stable across restarts, so a receipt observed after a crash
/// still resolves to its job.
pub fn invoice_lookup_hash(bolt11: &str) -> String {
    hex::encode(Sha256::digest(bolt11.as_bytes()))
}
