//! One ingestion run: fetch, normalize, persist, publish, strictly in order.
//!
//! The batch is handed to both sinks by reference, so they always see the
//! same records. The artifact on disk is the durable copy for stand-alone
//! replays. Runs must not overlap; [`Pipeline::poll`] runs them one at a time.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::fetch::{HttpClient, fetch_positions};
use crate::handoff::HandoffStore;
use crate::normalize::normalize;
use crate::publish::{MessageBus, log_delivery, publish};
use crate::store::{TrainRowStore, persist};

/// What one successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub artifact: PathBuf,
    pub records: usize,
    pub unmapped_status: usize,
    pub unmapped_direction: usize,
    pub rows_inserted: usize,
    pub delivered: usize,
    pub failed_deliveries: usize,
}

/// Totals of a [`Pipeline::poll`] session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub runs: usize,
    pub failures: usize,
}

pub struct Pipeline<C> {
    client: C,
    config: PipelineConfig,
    handoff: HandoffStore,
}

impl<C: HttpClient> Pipeline<C> {
    pub fn new(client: C, config: PipelineConfig) -> Self {
        let handoff = HandoffStore::new(config.handoff_dir.clone(), config.handoff_retain);
        Self {
            client,
            config,
            handoff,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn handoff(&self) -> &HandoffStore {
        &self.handoff
    }

    /// Runs the four stages once.
    ///
    /// Any fetch, normalize, or artifact error ends the run before either
    /// sink is touched. A persistence error ends it before publishing.
    /// Delivery failures only end it under the at-least-once policy.
    pub async fn run_once(
        &self,
        store: &mut dyn TrainRowStore,
        bus: &mut dyn MessageBus,
    ) -> Result<RunSummary> {
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();

        async move {
            let snapshot = fetch_positions(&self.client, &self.config.feed).await?;

            let (batch, report) = normalize(snapshot, run_id);
            let artifact = self.handoff.write(&batch)?;

            let rows_inserted = persist(&batch, store)?;

            let publish_config = &self.config.publish;
            let outcome = publish(
                bus,
                &publish_config.topic,
                &batch,
                publish_config.policy,
                publish_config.flush_timeout,
                log_delivery,
            )
            .await?;

            let summary = RunSummary {
                run_id,
                started_at,
                artifact,
                records: batch.len(),
                unmapped_status: report.unmapped_status,
                unmapped_direction: report.unmapped_direction,
                rows_inserted,
                delivered: outcome.delivered,
                failed_deliveries: outcome.failed,
            };
            info!(
                records = summary.records,
                rows = summary.rows_inserted,
                delivered = summary.delivered,
                failed_deliveries = summary.failed_deliveries,
                elapsed_ms = (Utc::now() - started_at).num_milliseconds(),
                "Run complete"
            );
            Ok(summary)
        }
        .instrument(info_span!("run", run_id = %run_id, line = %self.config.feed.line))
        .await
    }

    /// Runs the pipeline on a fixed cadence, one run at a time.
    ///
    /// `interval` is measured from the start of one run to the start of the
    /// next. A failed run is logged and counted; polling continues. `runs`
    /// of 0 means no limit. Once `shutdown` turns true the loop stops: a run
    /// in progress is finished first, a pending wait is cut short. A new bus
    /// is made for every run.
    pub async fn poll<B, F>(
        &self,
        store: &mut dyn TrainRowStore,
        mut new_bus: F,
        interval: Duration,
        runs: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PollSummary>
    where
        B: MessageBus,
        F: FnMut() -> Result<B>,
    {
        if runs == 0 {
            info!(interval_secs = interval.as_secs(), "Polling infinitely. Press Ctrl+C to stop.");
        } else {
            info!(runs, interval_secs = interval.as_secs(), "Starting polling");
        }

        let mut summary = PollSummary::default();

        loop {
            // Check if we've reached the run limit (0 = infinite)
            if runs > 0 && summary.runs >= runs {
                break;
            }
            if *shutdown.borrow() {
                info!("Shutdown requested, stopping");
                break;
            }
            summary.runs += 1;

            let run_start = Instant::now();
            let mut bus = new_bus()?;
            if let Err(e) = self.run_once(&mut *store, &mut bus).await {
                summary.failures += 1;
                error!(run = summary.runs, error = %e, "Run failed");
            }

            if (runs > 0 && summary.runs >= runs) || *shutdown.borrow() {
                continue;
            }

            let next_start = run_start + interval;
            let wait = next_start.saturating_duration_since(Instant::now());
            info!(wait_secs = wait.as_secs(), "Waiting before next run");
            wait_or_shutdown(next_start, &mut shutdown).await;
        }

        info!(runs = summary.runs, failures = summary.failures, "Polling finished");
        Ok(summary)
    }
}

/// Sleeps until `deadline` unless `shutdown` turns true first. A dropped
/// sender can no longer signal, so the full wait is served.
async fn wait_or_shutdown(deadline: Instant, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = sleep_until(deadline) => {}
        closed = async { shutdown.wait_for(|stop| *stop).await.is_err() } => {
            if closed {
                sleep_until(deadline).await;
            }
        }
    }
}
