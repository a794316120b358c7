//! Processing events: one per pipeline stage, handed to a sink.
use std::time;

use tracing::{error, info, warn};

use crate::error::FailureKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingEvent {
    Received {
        resource: String,
        change_type: String,
    },
    Invalid {
        resource: String,
        error: String,
    },
    Skipped {
        dedup_key: String,
    },
    FetchFailed {
        resource: String,
        error: String,
    },
    Fetched {
        internet_message_id: String,
        subject: String,
        attachments: usize,
    },
    NoMatch {
        internet_message_id: String,
    },
    Matched {
        internet_message_id: String,
        targets: Vec<String>,
    },
    AttachmentsLoaded {
        internet_message_id: String,
        count: usize,
    },
    AttachmentsFailed {
        internet_message_id: String,
        error: String,
    },
    /// One per target the record was delivered to.
    Delivered {
        internet_message_id: String,
        target: String,
        attempts: usize,
    },
    /// One per target that gave up, with the kind of the last failure.
    DeliveryFailed {
        internet_message_id: String,
        target: String,
        attempts: usize,
        kind: FailureKind,
    },
    Completed {
        internet_message_id: String,
        succeeded: usize,
        failed: usize,
        elapsed: time::Duration,
    },
}

impl ProcessingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessingEvent::Received { .. } => "received",
            ProcessingEvent::Invalid { .. } => "invalid",
            ProcessingEvent::Skipped { .. } => "skipped",
            ProcessingEvent::FetchFailed { .. } => "fetch_failed",
            ProcessingEvent::Fetched { .. } => "fetched",
            ProcessingEvent::NoMatch { .. } => "no_match",
            ProcessingEvent::Matched { .. } => "matched",
            ProcessingEvent::AttachmentsLoaded { .. } => "attachments_loaded",
            ProcessingEvent::AttachmentsFailed { .. } => "attachments_failed",
            ProcessingEvent::Delivered { .. } => "delivered",
            ProcessingEvent::DeliveryFailed { .. } => "delivery_failed",
            ProcessingEvent::Completed { .. } => "completed",
        }
    }
}

/// Receives every processing event. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProcessingEvent);
}

/// Emit each event as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ProcessingEvent) {
        let name = event.name();

        match event {
            ProcessingEvent::Received {
                resource,
                change_type,
            } => info!(event = name, %resource, %change_type, "notification received"),
            ProcessingEvent::Invalid { resource, error } => {
                warn!(event = name, %resource, %error, "notification rejected")
            }
            ProcessingEvent::Skipped { dedup_key } => {
                info!(event = name, %dedup_key, "duplicate notification skipped")
            }
            ProcessingEvent::FetchFailed { resource, error } => {
                error!(event = name, %resource, %error, "failed to fetch message")
            }
            ProcessingEvent::Fetched {
                internet_message_id,
                subject,
                attachments,
            } => info!(
                event = name,
                %internet_message_id,
                %subject,
                attachments,
                "message fetched"
            ),
            ProcessingEvent::NoMatch {
                internet_message_id,
            } => info!(event = name, %internet_message_id, "no target matched"),
            ProcessingEvent::Matched {
                internet_message_id,
                targets,
            } => info!(
                event = name,
                %internet_message_id,
                targets = %targets.join(","),
                "targets matched"
            ),
            ProcessingEvent::AttachmentsLoaded {
                internet_message_id,
                count,
            } => info!(event = name, %internet_message_id, count, "attachments loaded"),
            ProcessingEvent::AttachmentsFailed {
                internet_message_id,
                error,
            } => warn!(
                event = name,
                %internet_message_id,
                %error,
                "failed to load attachments, dispatching metadata only"
            ),
            ProcessingEvent::Delivered {
                internet_message_id,
                target,
                attempts,
            } => info!(event = name, %internet_message_id, %target, attempts, "record delivered"),
            ProcessingEvent::DeliveryFailed {
                internet_message_id,
                target,
                attempts,
                kind,
            } => error!(
                event = name,
                %internet_message_id,
                %target,
                attempts,
                kind = kind.as_str(),
                "delivery failed"
            ),
            ProcessingEvent::Completed {
                internet_message_id,
                succeeded,
                failed,
                elapsed,
            } => info!(
                event = name,
                %internet_message_id,
                succeeded,
                failed,
                elapsed_ms = elapsed.as_millis() as u64,
                "processing completed"
            ),
        }
    }
}

/// Keeps every event in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: std::sync::Mutex<Vec<ProcessingEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<ProcessingEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(ProcessingEvent::name).collect()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn emit(&self, event: ProcessingEvent) {
        self.events.lock().unwrap().push(event);
    }
}
