//! Publisher: the whole batch as one message on a fixed topic.
//!
//! Publishing is produce, then flush. The flush drains everything enqueued
//! and yields one [`DeliveryReport`] per message, each handed to the
//! caller's completion handler. Whether a failed delivery fails the stage
//! is decided by [`DeliveryPolicy`], never implicitly.

pub mod mqtt;

pub use mqtt::MqttBus;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{error, info, warn};

use crate::error::{PipelineError, Result};
use crate::normalize::IntermediateBatch;

/// What a failed delivery means for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Failures are reported to the handler and counted; the stage still succeeds.
    #[default]
    BestEffort,
    /// Any failed delivery fails the stage with [`PipelineError::DeliveryFailure`].
    AtLeastOnce,
}

impl FromStr for DeliveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "best-effort" => Ok(Self::BestEffort),
            "at-least-once" => Ok(Self::AtLeastOnce),
            other => Err(format!(
                "unknown delivery policy `{other}` (expected best-effort or at-least-once)"
            )),
        }
    }
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BestEffort => f.write_str("best-effort"),
            Self::AtLeastOnce => f.write_str("at-least-once"),
        }
    }
}

/// Final state of one produced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    Delivered { topic: String, packet_id: Option<u16> },
    Failed { topic: String, reason: String },
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// A broker client with an internal delivery queue.
#[async_trait]
pub trait MessageBus: Send {
    /// Enqueues one message. Returning `Ok` says nothing about delivery.
    async fn produce(&mut self, topic: &str, payload: Bytes) -> Result<()>;

    /// Waits for every enqueued message to settle, at most `timeout`.
    /// Messages still pending at the deadline are reported as failed.
    async fn flush(&mut self, timeout: Duration) -> Result<Vec<DeliveryReport>>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// Default completion handler: one log line per delivery report.
pub fn log_delivery(report: &DeliveryReport) {
    match report {
        DeliveryReport::Delivered { topic, packet_id } => {
            info!(topic = %topic, packet_id = ?packet_id, "Message delivered");
        }
        DeliveryReport::Failed { topic, reason } => {
            error!(topic = %topic, reason = %reason, "Message delivery failed");
        }
    }
}

/// Publishes the batch as a single JSON message and drains the bus.
///
/// # Errors
///
/// [`PipelineError::DeliveryFailure`] when the message cannot be enqueued
/// or flushing breaks down, or, under [`DeliveryPolicy::AtLeastOnce`],
/// when any report is a failure.
#[tracing::instrument(skip_all, fields(run_id = %batch.run_id(), topic = %topic, policy = %policy))]
pub async fn publish<B, F>(
    bus: &mut B,
    topic: &str,
    batch: &IntermediateBatch,
    policy: DeliveryPolicy,
    flush_timeout: Duration,
    mut on_delivery: F,
) -> Result<PublishOutcome>
where
    B: MessageBus + ?Sized,
    F: FnMut(&DeliveryReport),
{
    let payload = Bytes::from(batch.to_json_bytes()?);
    let payload_len = payload.len();

    bus.produce(topic, payload).await?;
    let reports = bus.flush(flush_timeout).await?;

    let mut outcome = PublishOutcome::default();
    for report in &reports {
        on_delivery(report);
        if report.is_delivered() {
            outcome.delivered += 1;
        } else {
            outcome.failed += 1;
        }
    }

    info!(
        bytes = payload_len,
        records = batch.len(),
        delivered = outcome.delivered,
        failed = outcome.failed,
        "Batch published"
    );

    if outcome.failed > 0 {
        match policy {
            DeliveryPolicy::BestEffort => {
                warn!(failed = outcome.failed, "Delivery failures tolerated under best-effort policy");
            }
            DeliveryPolicy::AtLeastOnce => {
                return Err(PipelineError::DeliveryFailure(format!(
                    "{} of {} messages to `{topic}` not delivered",
                    outcome.failed,
                    reports.len()
                )));
            }
        }
    }

    Ok(outcome)
}
