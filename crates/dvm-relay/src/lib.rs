// SPDX-License-Identifier: MIT OR Apache-2.0
//! Relay gateway.
//!
//! Owns the connection pool to the configured relays, subscribes to job
//! requests and zap receipts since start-time, deduplicates events across
//! relays (first arrival wins), and delivers a unified [`GatewayEvent`]
//! stream into the orchestrator over an mpsc channel wired at startup.
//!
//! Egress goes through [`JobPublisher`]: events are signed with the agent
//! key and fanned out to every connected relay by the underlying pool.
//! Reconnection and per-relay failures are the pool's problem, never the
//! caller's.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use nostr::{Event, EventBuilder, EventId, Filter, Keys, Kind, PublicKey, Tag, TagKind, Timestamp};
use nostr_sdk::{Client, RelayPoolNotification};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dvm_core::{
    is_job_request_kind, kind_number, result_kind, FeedbackStatus, KIND_ZAP_RECEIPT,
};

/// Bound on the cross-relay dedup cache.
const DEDUP_CAPACITY: usize = 4096;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the relay gateway.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Relay pool failure (connect, publish).
    #[error("relay client error")]
    Client(#[from] nostr_sdk::client::Error),

    /// A stored event id did not parse back into hex.
    #[error("invalid event id")]
    EventId(#[from] nostr::event::id::Error),

    /// A stored pubkey did not parse back into hex.
    #[error("invalid public key")]
    Key(#[from] nostr::key::Error),
}

// ---------------------------------------------------------------------------
// Ingress types
// ---------------------------------------------------------------------------

/// One deduplicated inbound event, classified by kind.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A job request of a kind this agent subscribes to.
    JobRequest(Event),
    /// A kind-9735 zap receipt addressed to this agent.
    ZapReceipt(Event),
}

/// Bounded first-arrival-wins event-id cache.
///
/// Eviction is FIFO by insertion, so a burst of new ids cannot grow the
/// cache without bound while still catching the common case of the same
/// event arriving from every connected relay within a short window.
#[derive(Debug, Default)]
pub struct SeenCache {
    set: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl SeenCache {
    /// Create a cache holding at most `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an id. Returns `true` when it was fresh (first arrival).
    pub fn insert(&mut self, id: EventId) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    /// Number of ids currently tracked.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Egress contract
// ---------------------------------------------------------------------------

/// Egress surface the orchestrator publishes through.
///
/// Implementations sign with the agent key and hand the event to at least
/// one transport before returning. Callers treat failures as log-and-move-on:
/// job state is durable and never rolled back for a publish failure.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Publish a kind-7000 feedback event for a job.
    ///
    /// `amount` attaches a `["amount", <msats>, <bolt11>]` tag, used with
    /// [`FeedbackStatus::PaymentRequired`].
    async fn publish_feedback(
        &self,
        job_event_id: &str,
        customer: &str,
        status: FeedbackStatus,
        content: &str,
        amount: Option<(u64, String)>,
    ) -> Result<(), RelayError>;

    /// Publish the result event (`request_kind + 1000`) for a job.
    async fn publish_result(
        &self,
        job_event_id: &str,
        customer: &str,
        request_kind: u16,
        content: &str,
    ) -> Result<(), RelayError>;
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Connection pool plus subscription state for the configured relays.
pub struct RelayGateway {
    client: Client,
    keys: Keys,
}

impl RelayGateway {
    /// Connect to every configured relay.
    ///
    /// Individual relays may be down; the pool keeps retrying them with
    /// its own backoff and this call does not fail for a cold relay.
    pub async fn connect(keys: Keys, relays: &[String]) -> Result<Self, RelayError> {
        let client = Client::new(&keys);
        for url in relays {
            client.add_relay(url.clone()).await?;
            info!(target: "dvm.relay", url = %url, "relay added");
        }
        client.connect().await;
        info!(target: "dvm.relay", count = relays.len(), "connected to relays");
        Ok(Self { client, keys })
    }

    /// The agent's public key.
    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Subscribe to job requests and zap receipts, both bounded by *now*
    /// so a restart does not replay history through the pipeline.
    pub async fn subscribe_since_now(&self) {
        let now = Timestamp::now();

        let job_filter = Filter::new()
            .kinds(
                dvm_core::JOB_REQUEST_KINDS
                    .iter()
                    .map(|k| Kind::from(*k as u64)),
            )
            .since(now);

        let zap_filter = Filter::new()
            .kind(Kind::from(KIND_ZAP_RECEIPT as u64))
            .pubkey(self.keys.public_key())
            .since(now);

        self.client.subscribe(vec![job_filter, zap_filter]).await;
        info!(
            target: "dvm.relay",
            job_kinds = ?dvm_core::JOB_REQUEST_KINDS,
            "subscribed"
        );
    }

    /// Pump relay notifications into `tx` until the channel closes or the
    /// pool shuts down. Duplicate event ids across relays are dropped here.
    pub async fn run(&self, tx: mpsc::Sender<GatewayEvent>) {
        let mut seen = SeenCache::new(DEDUP_CAPACITY);
        let mut notifications = self.client.notifications();

        loop {
            match notifications.recv().await {
                Ok(RelayPoolNotification::Event { event, .. }) => {
                    if !seen.insert(event.id) {
                        debug!(target: "dvm.relay", event_id = %event.id, "duplicate dropped");
                        continue;
                    }
                    let kind = kind_number(event.kind);
                    let gateway_event = if is_job_request_kind(kind) {
                        GatewayEvent::JobRequest(event)
                    } else if kind == KIND_ZAP_RECEIPT {
                        GatewayEvent::ZapReceipt(event)
                    } else {
                        continue;
                    };
                    if tx.send(gateway_event).await.is_err() {
                        break;
                    }
                }
                Ok(RelayPoolNotification::Shutdown) => break,
                Ok(_) => {}
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "dvm.relay", skipped, "notification stream lagged");
                }
            }
        }
        info!(target: "dvm.relay", "ingress stopped");
    }

    /// Sign and publish an arbitrary event (used for the startup
    /// handler-information advertisement).
    pub async fn publish_event(&self, builder: EventBuilder) -> Result<EventId, RelayError> {
        let event_id = self.client.send_event_builder(builder).await?;
        info!(target: "dvm.relay", event_id = %event_id, "event published");
        Ok(event_id)
    }

    /// Disconnect from all relays.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(target: "dvm.relay", error = %e, "disconnect failed");
        }
    }
}

#[async_trait]
impl JobPublisher for RelayGateway {
    async fn publish_feedback(
        &self,
        job_event_id: &str,
        customer: &str,
        status: FeedbackStatus,
        content: &str,
        amount: Option<(u64, String)>,
    ) -> Result<(), RelayError> {
        let mut tags = vec![
            Tag::event(EventId::from_hex(job_event_id)?),
            Tag::public_key(PublicKey::from_hex(customer)?),
            Tag::Generic(
                TagKind::Custom("status".to_string()),
                vec![status.as_str().to_string()],
            ),
        ];
        if let Some((msats, bolt11)) = amount {
            tags.push(Tag::Amount {
                millisats: msats,
                bolt11: Some(bolt11),
            });
        }

        let builder = EventBuilder::new(Kind::JobFeedback, content, tags);
        self.publish_event(builder).await?;
        info!(target: "dvm.relay", job = %job_event_id, status = %status, "feedback published");
        Ok(())
    }

    async fn publish_result(
        &self,
        job_event_id: &str,
        customer: &str,
        request_kind: u16,
        content: &str,
    ) -> Result<(), RelayError> {
        let tags = vec![
            Tag::event(EventId::from_hex(job_event_id)?),
            Tag::public_key(PublicKey::from_hex(customer)?),
            Tag::Generic(
                TagKind::Custom("status".to_string()),
                vec![FeedbackStatus::Success.as_str().to_string()],
            ),
        ];

        let kind = Kind::from(result_kind(request_kind) as u64);
        let builder = EventBuilder::new(kind, content, tags);
        self.publish_event(builder).await?;
        info!(
            target: "dvm.relay",
            job = %job_event_id,
            result_kind = result_kind(request_kind),
            "result published"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
