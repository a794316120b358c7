//! Sequence the processing of a batch of notifications: deduplicate, fetch, match, load
//! attachments when needed, and dispatch.
use std::sync::Arc;
use std::time;

use futures::future::join_all;
use mailhook_common::dedup::Deduplicator;
use mailhook_common::envelope::NotificationEnvelope;
use mailhook_common::matcher::match_targets;
use mailhook_common::target::ConsumerTarget;
use tokio::time::Instant;
use tracing::error;

use crate::dispatcher::{DispatchOutcome, DispatchStatus, Dispatcher};
use crate::events::{EventSink, ProcessingEvent};
use crate::metrics_consts::{
    ATTACHMENT_LOAD_FAILED_COUNTER, ENVELOPE_PROCESSING_TIME, MESSAGE_FETCH_FAILED_COUNTER,
    MESSAGE_UNMATCHED_COUNTER, NOTIFICATIONS_DEDUPLICATED_COUNTER, NOTIFICATIONS_REJECTED_COUNTER,
};
use crate::provider::{AttachmentLoader, MessageFetcher};
use crate::targets::TargetStore;

/// Where processing of one envelope ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeStatus {
    /// Another notification for the same message was processed within the dedup window.
    Skipped,
    /// The resource path could not be parsed.
    Invalid,
    FetchFailed,
    NoMatch,
    /// Delivery was attempted. `outcomes` holds one entry per matched target, in match order.
    Dispatched {
        succeeded: usize,
        failed: usize,
        outcomes: Vec<DispatchOutcome>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeOutcome {
    pub resource: String,
    pub status: EnvelopeStatus,
    pub elapsed: time::Duration,
}

/// The notification processing engine. Cheap to clone: all state is shared.
#[derive(Clone)]
pub struct Pipeline {
    deduplicator: Arc<Deduplicator>,
    fetcher: Arc<dyn MessageFetcher>,
    attachments: Arc<dyn AttachmentLoader>,
    targets: Arc<TargetStore>,
    dispatcher: Dispatcher,
    events: Arc<dyn EventSink>,
}

impl Pipeline {
    pub fn new(
        deduplicator: Arc<Deduplicator>,
        fetcher: Arc<dyn MessageFetcher>,
        attachments: Arc<dyn AttachmentLoader>,
        targets: Arc<TargetStore>,
        dispatcher: Dispatcher,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            deduplicator,
            fetcher,
            attachments,
            targets,
            dispatcher,
            events,
        }
    }

    /// Process every envelope of a batch concurrently. Envelopes are independent: no failure of
    /// one affects another, and there is no batch-wide failure.
    pub async fn process_batch(&self, envelopes: Vec<NotificationEnvelope>) -> Vec<EnvelopeOutcome> {
        let targets = match self.targets.snapshot().await {
            Ok(targets) => targets,
            Err(e) => {
                error!("failed to load consumer targets, no target can match: {}", e);
                Arc::from(Vec::new())
            }
        };

        join_all(
            envelopes
                .iter()
                .map(|envelope| self.process_envelope(envelope, &targets)),
        )
        .await
    }

    async fn process_envelope(
        &self,
        envelope: &NotificationEnvelope,
        targets: &[ConsumerTarget],
    ) -> EnvelopeOutcome {
        let start = Instant::now();
        let status = self.run(envelope, targets, start).await;

        let elapsed = start.elapsed();
        metrics::histogram!(ENVELOPE_PROCESSING_TIME).record(elapsed.as_secs_f64());

        EnvelopeOutcome {
            resource: envelope.resource.clone(),
            status,
            elapsed,
        }
    }

    async fn run(
        &self,
        envelope: &NotificationEnvelope,
        targets: &[ConsumerTarget],
        start: Instant,
    ) -> EnvelopeStatus {
        self.events.emit(ProcessingEvent::Received {
            resource: envelope.resource.clone(),
            change_type: envelope.change_type.clone(),
        });

        let message = match envelope.message_ref() {
            Ok(message) => message,
            Err(e) => {
                metrics::counter!(NOTIFICATIONS_REJECTED_COUNTER).increment(1);
                self.events.emit(ProcessingEvent::Invalid {
                    resource: envelope.resource.clone(),
                    error: e.to_string(),
                });
                return EnvelopeStatus::Invalid;
            }
        };

        let dedup_key = message.dedup_key();
        if !self.deduplicator.should_process(&dedup_key) {
            metrics::counter!(NOTIFICATIONS_DEDUPLICATED_COUNTER).increment(1);
            self.events.emit(ProcessingEvent::Skipped { dedup_key });
            return EnvelopeStatus::Skipped;
        }

        let mut record = match self.fetcher.fetch_message(&message).await {
            Ok(record) => record,
            Err(e) => {
                metrics::counter!(MESSAGE_FETCH_FAILED_COUNTER).increment(1);
                self.events.emit(ProcessingEvent::FetchFailed {
                    resource: envelope.resource.clone(),
                    error: e.to_string(),
                });
                return EnvelopeStatus::FetchFailed;
            }
        };

        self.events.emit(ProcessingEvent::Fetched {
            internet_message_id: record.log_id().to_owned(),
            subject: record.subject.clone(),
            attachments: record.attachment_metadata.len(),
        });

        let matched = match_targets(&record, targets);

        if matched.is_empty() {
            metrics::counter!(MESSAGE_UNMATCHED_COUNTER).increment(1);
            self.events.emit(ProcessingEvent::NoMatch {
                internet_message_id: record.log_id().to_owned(),
            });
            return EnvelopeStatus::NoMatch;
        }

        self.events.emit(ProcessingEvent::Matched {
            internet_message_id: record.log_id().to_owned(),
            targets: matched.iter().map(|t| t.label().to_owned()).collect(),
        });

        if record.has_attachments() {
            match self.attachments.load_attachments(&record).await {
                Ok(attachments) => {
                    self.events.emit(ProcessingEvent::AttachmentsLoaded {
                        internet_message_id: record.log_id().to_owned(),
                        count: attachments.len(),
                    });
                    record.attachments = attachments;
                }
                Err(e) => {
                    metrics::counter!(ATTACHMENT_LOAD_FAILED_COUNTER).increment(1);
                    self.events.emit(ProcessingEvent::AttachmentsFailed {
                        internet_message_id: record.log_id().to_owned(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let outcomes = self.dispatcher.dispatch(&record, &matched).await;

        for outcome in &outcomes {
            let internet_message_id = record.log_id().to_owned();
            let target = outcome.target_name.clone();
            let attempts = outcome.attempts.len();

            self.events.emit(match outcome.status {
                DispatchStatus::Delivered => ProcessingEvent::Delivered {
                    internet_message_id,
                    target,
                    attempts,
                },
                DispatchStatus::Failed(kind) => ProcessingEvent::DeliveryFailed {
                    internet_message_id,
                    target,
                    attempts,
                    kind,
                },
            });
        }

        let succeeded = outcomes.iter().filter(|o| o.is_delivered()).count();
        let failed = outcomes.len() - succeeded;

        self.events.emit(ProcessingEvent::Completed {
            internet_message_id: record.log_id().to_owned(),
            succeeded,
            failed,
            elapsed: start.elapsed(),
        });

        EnvelopeStatus::Dispatched {
            succeeded,
            failed,
            outcomes,
        }
    }
}
