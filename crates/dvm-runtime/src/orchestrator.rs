// SPDX-License-Identifier: MIT OR Apache-2.0
//! The job state machine.
//!
//! Consumes decoded job requests and verified payment receipts, drives
//! each job through `Received -> WaitingPayment -> Processing ->
//! {Completed, Failed}` (with `Expired` handled by the sweeper), and
//! coordinates the store, service registry, invoice provider, and relay
//! egress.
//!
//! Every transition commits its store write before any publish; publishes
//! are best-effort and never roll state back.

use std::sync::Arc;
use std::time::Duration;

use nostr::Event;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use dvm_core::{FeedbackStatus, Job, JobInput, JobState};
use dvm_payment::{invoice_lookup_hash, verify_zap_receipt, InvoiceProvider, PaymentReceipt};
use dvm_relay::{GatewayEvent, JobPublisher};
use dvm_service::{DvmService, ServiceRegistry};
use dvm_store::{JobPatch, JobStore, StoreError};

use crate::pool::WorkerPool;
use crate::shutdown::ShutdownToken;

/// How long to wait before re-reading a job that a receipt raced past.
const EARLY_RECEIPT_RETRY: Duration = Duration::from_millis(250);

/// Errors escaping an orchestrator handler.
///
/// A store failure aborts the handler and leaves the job in its prior
/// state; restart reconciliation picks up the pieces. Everything else is
/// policy (drop, feedback) rather than an error.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The job store rejected a read or write.
    #[error("store failure")]
    Store(#[from] StoreError),
}

/// The job lifecycle orchestrator.
pub struct Orchestrator {
    store: Arc<JobStore>,
    registry: Arc<ServiceRegistry>,
    invoices: Arc<dyn InvoiceProvider>,
    publisher: Arc<dyn JobPublisher>,
    pool: Arc<WorkerPool>,
}

impl Orchestrator {
    /// Wire the orchestrator to its collaborators.
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<ServiceRegistry>,
        invoices: Arc<dyn InvoiceProvider>,
        publisher: Arc<dyn JobPublisher>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            store,
            registry,
            invoices,
            publisher,
            pool,
        }
    }

    /// Consume gateway events until the channel closes or shutdown fires.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<GatewayEvent>, shutdown: ShutdownToken) {
        info!(target: "dvm.runtime", services = ?self.registry.kinds(), "orchestrator started");
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_gateway_event(event).await,
                    None => break,
                },
            }
        }
        info!(target: "dvm.runtime", "orchestrator stopped");
    }

    /// Dispatch one inbound event. Handler errors are logged, never fatal
    /// to the ingress loop.
    pub async fn handle_gateway_event(&self, event: GatewayEvent) {
        let outcome = match event {
            GatewayEvent::JobRequest(event) => self.handle_job_request(&event).await,
            GatewayEvent::ZapReceipt(event) => self.handle_zap_receipt(&event).await,
        };
        if let Err(e) = outcome {
            error!(target: "dvm.runtime", error = %e, "handler aborted");
        }
    }

    // -- Job-request ingress ---------------------------------------------

    /// Handle a decoded job-request event.
    pub async fn handle_job_request(&self, event: &Event) -> Result<(), RuntimeError> {
        let input = JobInput::from_event(event);
        let event_id = input.event_id.clone();

        let service = match self.registry.get(input.kind) {
            Some(service) => service,
            None => {
                warn!(target: "dvm.runtime", kind = input.kind, %event_id, "unsupported kind");
                return Ok(());
            }
        };

        if !service.validate(&input) {
            warn!(target: "dvm.runtime", %event_id, "invalid input");
            self.feedback(
                &event_id,
                &input.customer,
                FeedbackStatus::Error,
                "Invalid or missing input data.",
                None,
            )
            .await;
            return Ok(());
        }

        if self
            .store
            .create(&event_id, &input.customer, input.kind, &input)?
            .is_duplicate()
        {
            debug!(target: "dvm.runtime", %event_id, "duplicate request dropped");
            return Ok(());
        }

        let cost = service.price(&input);
        let short_id = event_id.get(..8).unwrap_or(&event_id);
        let memo = format!("sats.ai DVM job {short_id}");

        let invoice = match self.invoices.create_invoice(cost, &memo).await {
            Some(invoice) => invoice,
            None => {
                error!(target: "dvm.runtime", %event_id, "invoice creation failed");
                self.store.transition(
                    &event_id,
                    JobState::Received,
                    JobState::Failed,
                    JobPatch::error("Invoice creation failed".into()),
                )?;
                self.feedback(
                    &event_id,
                    &input.customer,
                    FeedbackStatus::Error,
                    "Invoice creation failed",
                    None,
                )
                .await;
                return Ok(());
            }
        };

        let moved = self.store.transition(
            &event_id,
            JobState::Received,
            JobState::WaitingPayment,
            JobPatch::invoice(invoice.bolt11.clone(), invoice.payment_hash.clone(), cost),
        )?;
        if !moved {
            warn!(target: "dvm.runtime", %event_id, "job left Received before invoice binding");
            return Ok(());
        }

        self.feedback(
            &event_id,
            &input.customer,
            FeedbackStatus::PaymentRequired,
            "",
            Some((cost, invoice.bolt11)),
        )
        .await;
        info!(target: "dvm.runtime", %event_id, amount_msats = cost, "payment required");
        Ok(())
    }

    // -- Receipt ingress --------------------------------------------------

    /// Handle a raw kind-9735 event: verify it, then apply it.
    pub async fn handle_zap_receipt(&self, event: &Event) -> Result<(), RuntimeError> {
        match verify_zap_receipt(event, None) {
            Some(receipt) => self.apply_receipt(receipt).await,
            None => Ok(()),
        }
    }

    /// Bind a verified receipt to its job and start execution.
    pub async fn apply_receipt(&self, receipt: PaymentReceipt) -> Result<(), RuntimeError> {
        let event_id = receipt.referenced_event_id.clone();

        let mut job = match self.store.get(&event_id)? {
            Some(job) => job,
            None => {
                debug!(target: "dvm.runtime", %event_id, "receipt references unknown job");
                return Ok(());
            }
        };

        // A receipt can beat the WaitingPayment write; retry the read once.
        if job.state == JobState::Received {
            tokio::time::sleep(EARLY_RECEIPT_RETRY).await;
            match self.store.get(&event_id)? {
                Some(reread) if reread.state != JobState::Received => job = reread,
                _ => {
                    warn!(target: "dvm.runtime", %event_id, "receipt for job stuck in Received");
                    return Ok(());
                }
            }
        }

        // The paid invoice must be the one we bound to this job.
        let paid_hash = invoice_lookup_hash(&receipt.bolt11);
        if job.invoice_hash.as_deref() != Some(paid_hash.as_str()) {
            warn!(target: "dvm.runtime", %event_id, "receipt invoice does not match job");
            return Ok(());
        }

        // Idempotence gate: duplicate receipts and late payments for
        // expired or finished jobs stop here.
        if job.state != JobState::WaitingPayment {
            info!(
                target: "dvm.runtime",
                %event_id,
                state = %job.state,
                "receipt ignored, job not awaiting payment"
            );
            return Ok(());
        }

        let expected = job.amount_msats.unwrap_or(0);
        match receipt.amount_msats {
            Some(paid) if paid >= expected => {}
            _ => {
                warn!(
                    target: "dvm.runtime",
                    %event_id,
                    expected,
                    paid = ?receipt.amount_msats,
                    "receipt amount below expected"
                );
                return Ok(());
            }
        }

        let moved = self.store.transition(
            &event_id,
            JobState::WaitingPayment,
            JobState::Processing,
            JobPatch::default(),
        )?;
        if !moved {
            info!(target: "dvm.runtime", %event_id, "receipt raced, job already moved");
            return Ok(());
        }

        self.feedback(&event_id, &job.customer, FeedbackStatus::Processing, "", None)
            .await;
        info!(target: "dvm.runtime", %event_id, "payment confirmed, executing");

        let service = match self.registry.get(job.kind) {
            Some(service) => service,
            None => {
                // Registry is immutable after start, so a paid job without
                // a service means the store predates this configuration.
                self.store.transition(
                    &event_id,
                    JobState::Processing,
                    JobState::Failed,
                    JobPatch::error("Service not found".into()),
                )?;
                self.feedback(
                    &event_id,
                    &job.customer,
                    FeedbackStatus::Error,
                    "Service not found",
                    None,
                )
                .await;
                return Ok(());
            }
        };

        let store = Arc::clone(&self.store);
        let publisher = Arc::clone(&self.publisher);
        self.pool
            .spawn(async move {
                execute_job(store, publisher, service, job).await;
            })
            .await;
        Ok(())
    }

    /// Wait for in-flight executions during shutdown.
    pub async fn drain(&self, grace: Duration) {
        self.pool.shutdown(grace).await;
    }

    async fn feedback(
        &self,
        event_id: &str,
        customer: &str,
        status: FeedbackStatus,
        content: &str,
        amount: Option<(u64, String)>,
    ) {
        if let Err(e) = self
            .publisher
            .publish_feedback(event_id, customer, status, content, amount)
            .await
        {
            warn!(
                target: "dvm.runtime",
                %event_id,
                status = %status,
                error = %e,
                "feedback publish failed"
            );
        }
    }
}

/// Detached execution of one paid job.
async fn execute_job(
    store: Arc<JobStore>,
    publisher: Arc<dyn JobPublisher>,
    service: Arc<dyn DvmService>,
    job: Job,
) {
    let event_id = job.event_id.clone();
    let input = match &job.input {
        Some(input) => input.clone(),
        None => {
            fail_job(&store, &publisher, &job, "Job input snapshot missing").await;
            return;
        }
    };

    match service.execute(&input).await {
        Ok(result) => {
            let moved = store.transition(
                &event_id,
                JobState::Processing,
                JobState::Completed,
                JobPatch::result(result.clone()),
            );
            match moved {
                Ok(true) => {
                    if let Err(e) = publisher
                        .publish_result(&event_id, &job.customer, job.kind, &result)
                        .await
                    {
                        warn!(target: "dvm.runtime", %event_id, error = %e, "result publish failed");
                    }
                    info!(target: "dvm.runtime", %event_id, "job completed");
                }
                Ok(false) => {
                    warn!(target: "dvm.runtime", %event_id, "job moved out of Processing underneath us");
                }
                Err(e) => {
                    error!(target: "dvm.runtime", %event_id, error = %e, "completion write failed");
                }
            }
        }
        Err(e) => {
            let message = e.to_string();
            warn!(target: "dvm.runtime", %event_id, error = %message, "execution failed");
            fail_job(&store, &publisher, &job, &message).await;
        }
    }
}

async fn fail_job(store: &JobStore, publisher: &Arc<dyn JobPublisher>, job: &Job, message: &str) {
    match store.transition(
        &job.event_id,
        JobState::Processing,
        JobState::Failed,
        JobPatch::error(message.to_string()),
    ) {
        Ok(true) => {
            if let Err(e) = publisher
                .publish_feedback(
                    &job.event_id,
                    &job.customer,
                    FeedbackStatus::Error,
                    message,
                    None,
                )
                .await
            {
                warn!(
                    target: "dvm.runtime",
                    event_id = %job.event_id,
                    error = %e,
                    "error feedback publish failed"
                );
            }
        }
        Ok(false) => {
            warn!(
                target: "dvm.runtime",
                event_id = %job.event_id,
                "failure write lost a race"
            );
        }
        Err(e) => {
            error!(
                target: "dvm.runtime",
                event_id = %job.event_id,
                error = %e,
                "failure write failed"
            );
        }
    }
}
