// SPDX-License-Identifier: MIT OR Apache-2.0
//! Zap-receipt verification.

use std::str::FromStr;

use lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescription};
use bitcoin::hashes::Hash as _;
use nostr::{Event, JsonUtil};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use dvm_core::{kind_number, KIND_ZAP_RECEIPT, KIND_ZAP_REQUEST};

/// Payment details extracted from a verified zap receipt.
///
/// Transient: produced here, consumed once by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    /// Hex id of the job-request event the payment references (`e` tag).
    pub referenced_event_id: String,
    /// The paid BOLT-11 invoice.
    pub bolt11: String,
    /// Hex SHA-256 of the raw `description` string, already checked
    /// against the hash committed inside the invoice.
    pub description_hash: String,
    /// Amount from the embedded request's `amount` tag, when present.
    pub amount_msats: Option<u64>,
    /// Pubkey of whoever signed the embedded zap request.
    pub payer_pubkey: String,
    /// Pubkey of the receipt author (the LNURL server).
    pub receipt_author: String,
}

/// Validate a kind-9735 zap receipt and extract its payment details.
///
/// Returns `None` on any failure — wrong kind, bad signature, missing or
/// short tags, an embedded request that is not kind 9734, a description
/// hash that does not match the decoded invoice, or (when
/// `expected_msats` is given) an amount strictly below it. Failures are
/// logged and otherwise silent; a forged receipt must never surface as an
/// error to the network.
///
/// This function performs no I/O and no store lookups.
pub fn verify_zap_receipt(event: &Event, expected_msats: Option<u64>) -> Option<PaymentReceipt> {
    let kind = kind_number(event.kind);
    if kind != KIND_ZAP_RECEIPT {
        warn!(target: "dvm.payment", kind, "not a zap receipt");
        return None;
    }

    if let Err(e) = event.verify() {
        warn!(target: "dvm.payment", error = %e, "zap receipt signature invalid");
        return None;
    }

    let bolt11 = tag_value(event, "bolt11")?;
    let description = tag_value(event, "description")?;
    let referenced_event_id = tag_value(event, "e")?;

    // The description must be the serialized kind-9734 zap request.
    let request = match Event::from_json(&description) {
        Ok(req) => req,
        Err(e) => {
            warn!(target: "dvm.payment", error = %e, "zap description is not an event");
            return None;
        }
    };
    if kind_number(request.kind) != KIND_ZAP_REQUEST {
        warn!(
            target: "dvm.payment",
            kind = kind_number(request.kind),
            "embedded request is not a zap request"
        );
        return None;
    }

    // Description-hash binding: SHA-256 of the raw description string must
    // equal the hash committed inside the invoice, otherwise the receipt
    // is trivially forgeable.
    let digest = Sha256::digest(description.as_bytes());
    let invoice = match Bolt11Invoice::from_str(&bolt11) {
        Ok(inv) => inv,
        Err(e) => {
            warn!(target: "dvm.payment", error = %e, "receipt bolt11 does not decode");
            return None;
        }
    };
    let bound = match invoice.description() {
        Bolt11InvoiceDescription::Hash(hash) => {
            hash.0.to_byte_array().as_slice() == digest.as_slice()
        }
        Bolt11InvoiceDescription::Direct(d) => d.to_string() == description,
    };
    if !bound {
        warn!(target: "dvm.payment", "description hash does not match invoice");
        return None;
    }

    let amount_msats = request
        .tags
        .iter()
        .map(|t| t.as_vec())
        .find(|v| v.len() >= 2 && v[0] == "amount")
        .and_then(|v| v[1].parse::<u64>().ok());

    if let Some(expected) = expected_msats {
        match amount_msats {
            Some(paid) if paid >= expected => {}
            _ => {
                warn!(
                    target: "dvm.payment",
                    ?amount_msats,
                    expected,
                    "zap amount below expected"
                );
                return None;
            }
        }
    }

    debug!(
        target: "dvm.payment",
        event_id = %referenced_event_id,
        ?amount_msats,
        "zap receipt verified"
    );

    Some(PaymentReceipt {
        referenced_event_id,
        bolt11,
        description_hash: hex::encode(digest),
        amount_msats,
        payer_pubkey: request.pubkey.to_hex(),
        receipt_author: event.pubkey.to_hex(),
    })
}

/// First tag named `name` with at least two elements, by value.
fn tag_value(event: &Event, name: &str) -> Option<String> {
    let found = event
        .tags
        .iter()
        .map(|t| t.as_vec())
        .find(|v| v.len() >= 2 && v[0] == name)
        .map(|v| v[1].clone());
    if found.is_none() {
        warn!(target: "dvm.payment", tag = name, "zap receipt missing tag");
    }
    found
}
