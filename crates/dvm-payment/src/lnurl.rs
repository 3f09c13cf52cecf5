// SPDX-License-Identifier: MIT OR Apache-2.0
//! LNURL-pay invoice issuance.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::invoice_lookup_hash;

const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: f64 = 1.5;

/// A freshly minted invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    /// BOLT-11 payment request string.
    pub bolt11: String,
    /// Deterministic lookup hash of the bolt11 string; the job store's
    /// receipt-matching key.
    pub payment_hash: String,
    /// Amount the invoice was minted for.
    pub amount_msats: u64,
    /// LNURL-verify URL, when the server offers one.
    pub verify_url: Option<String>,
}

/// The invoice collaborator the orchestrator depends on.
///
/// Failure is expressed as `None`: invoice creation that does not produce
/// a payable invoice fails the job upstream, it never panics the pipeline.
#[async_trait]
pub trait InvoiceProvider: Send + Sync {
    /// Mint an invoice for `amount_msats`, with an optional memo.
    async fn create_invoice(&self, amount_msats: u64, memo: &str) -> Option<Invoice>;

    /// Secondary payment check by lookup hash. Zap receipts are the source
    /// of truth for the job pipeline; this exists for operators.
    async fn check_payment(&self, payment_hash: &str) -> bool;
}

// ---------------------------------------------------------------------------
// LNURL-pay wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayMetadata {
    callback: String,
    #[serde(default = "default_min_sendable")]
    min_sendable: u64,
    #[serde(default = "default_max_sendable")]
    max_sendable: u64,
}

fn default_min_sendable() -> u64 {
    1_000
}

fn default_max_sendable() -> u64 {
    1_000_000_000
}

#[derive(Debug, Deserialize)]
struct CallbackResponse {
    pr: Option<String>,
    verify: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    settled: bool,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// LNURL-pay client bound to a single lightning address endpoint.
///
/// Fetches the `/.well-known/lnurlp/<user>` metadata once and caches it;
/// mints invoices through the advertised callback. Transport errors are
/// retried with multiplicative backoff and ultimately reported as `None`.
pub struct LnurlPayClient {
    http: reqwest::Client,
    lnurlp_url: String,
    metadata: Mutex<Option<PayMetadata>>,
    verify_urls: Mutex<HashMap<String, String>>,
}

impl LnurlPayClient {
    /// Create a client for the given LNURL-pay metadata URL.
    pub fn new(lnurlp_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            lnurlp_url,
            metadata: Mutex::new(None),
            verify_urls: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Option<T> {
        let mut last_error = String::new();
        for attempt in 0..MAX_RETRIES {
            match self.http.get(url).send().await {
                Ok(resp) => match resp.error_for_status() {
                    Ok(resp) => match resp.json::<T>().await {
                        Ok(value) => return Some(value),
                        Err(e) => last_error = e.to_string(),
                    },
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }
            if attempt + 1 < MAX_RETRIES {
                let wait = RETRY_BACKOFF.powi(attempt as i32 + 1);
                warn!(target: "dvm.payment", url, attempt = attempt + 1, wait, "lnurl retry");
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
        }
        warn!(target: "dvm.payment", url, error = %last_error, "lnurl fetch failed");
        None
    }

    async fn pay_metadata(&self) -> Option<PayMetadata> {
        {
            let cached = self.metadata.lock().await;
            if let Some(meta) = cached.as_ref() {
                return Some(meta.clone());
            }
        }
        let meta: PayMetadata = self.fetch_json(&self.lnurlp_url).await?;
        info!(
            target: "dvm.payment",
            min_sendable = meta.min_sendable,
            max_sendable = meta.max_sendable,
            "lnurl-pay metadata fetched"
        );
        let mut cached = self.metadata.lock().await;
        *cached = Some(meta.clone());
        Some(meta)
    }
}

#[async_trait]
impl InvoiceProvider for LnurlPayClient {
    async fn create_invoice(&self, amount_msats: u64, memo: &str) -> Option<Invoice> {
        let meta = self.pay_metadata().await?;

        if amount_msats < meta.min_sendable || amount_msats > meta.max_sendable {
            warn!(
                target: "dvm.payment",
                amount_msats,
                min = meta.min_sendable,
                max = meta.max_sendable,
                "amount outside sendable range"
            );
            return None;
        }

        let separator = if meta.callback.contains('?') { '&' } else { '?' };
        let mut url = format!("{}{}amount={}", meta.callback, separator, amount_msats);
        if !memo.is_empty() {
            url.push_str("&comment=");
            url.push_str(&urlencode(memo));
        }

        let resp: CallbackResponse = self.fetch_json(&url).await?;
        let bolt11 = match resp.pr {
            Some(pr) => pr,
            None => {
                warn!(target: "dvm.payment", "lnurl callback returned no invoice");
                return None;
            }
        };

        let payment_hash = invoice_lookup_hash(&bolt11);
        if let Some(verify) = &resp.verify {
            let mut verify_urls = self.verify_urls.lock().await;
            verify_urls.insert(payment_hash.clone(), verify.clone());
        }

        info!(
            target: "dvm.payment",
            amount_msats,
            hash = %&payment_hash[..16],
            "invoice created"
        );

        Some(Invoice {
            bolt11,
            payment_hash,
            amount_msats,
            verify_url: resp.verify,
        })
    }

    async fn check_payment(&self, payment_hash: &str) -> bool {
        let url = {
            let verify_urls = self.verify_urls.lock().await;
            match verify_urls.get(payment_hash) {
                Some(url) => url.clone(),
                None => return false,
            }
        };
        match self.fetch_json::<VerifyResponse>(&url).await {
            Some(resp) => resp.settled,
            None => false,
        }
    }
}

/// Minimal query-string escaping for the invoice memo.
fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
