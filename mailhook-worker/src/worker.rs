use std::sync::Arc;
use std::time;

use mailhook_common::dedup::Deduplicator;
use mailhook_common::envelope::NotificationEnvelope;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::metrics_consts::{DEDUP_ENTRIES_GAUGE, DEDUP_EVICTED_COUNTER};
use crate::pipeline::{EnvelopeStatus, Pipeline};

/// A worker that consumes batches accepted by the ingress and runs each through the pipeline.
pub struct NotificationWorker {
    /// An identifier for this worker, attached to its logs.
    name: String,
    /// Batches queued by the ingress.
    queue: mpsc::Receiver<Vec<NotificationEnvelope>>,
    pipeline: Pipeline,
}

impl NotificationWorker {
    pub fn new(
        name: &str,
        queue: mpsc::Receiver<Vec<NotificationEnvelope>>,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            pipeline,
        }
    }

    /// Spawn a task per batch until every sender is dropped, then wait for batches in flight.
    pub async fn run(mut self) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                batch = self.queue.recv() => match batch {
                    Some(envelopes) => {
                        let pipeline = self.pipeline.clone();
                        let batch_id = Uuid::now_v7();
                        debug!(worker = %self.name, %batch_id, size = envelopes.len(), "batch dequeued");

                        tasks.spawn(async move {
                            let outcomes = pipeline.process_batch(envelopes).await;
                            let dispatched = outcomes
                                .iter()
                                .filter(|o| matches!(o.status, EnvelopeStatus::Dispatched { .. }))
                                .count();
                            debug!(%batch_id, envelopes = outcomes.len(), dispatched, "batch processed");
                        });
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(worker = %self.name, "batch task failed: {}", e);
                    }
                }
            }
        }

        info!(worker = %self.name, in_flight = tasks.len(), "queue closed, draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(worker = %self.name, "batch task failed: {}", e);
            }
        }
    }
}

/// Evict expired dedup entries every `interval`, forever.
pub async fn sweep_dedup(deduplicator: Arc<Deduplicator>, interval: time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let evicted = deduplicator.evict_expired();
        metrics::counter!(DEDUP_EVICTED_COUNTER).increment(evicted as u64);
        metrics::gauge!(DEDUP_ENTRIES_GAUGE).set(deduplicator.len() as f64);

        if evicted > 0 {
            debug!(evicted, "evicted expired dedup entries");
        }
    }
}
