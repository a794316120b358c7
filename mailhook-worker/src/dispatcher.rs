//! Fan a record out to its matched consumers with bounded concurrency, retries, and isolation
//! between targets.
use std::sync::Arc;
use std::time;

use bytes::Bytes;
use futures::future::join_all;
use http::StatusCode;
use mailhook_common::record::EmailRecord;
use mailhook_common::retry::RetryPolicy;
use mailhook_common::target::ConsumerTarget;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::delivery::Deliver;
use crate::error::{DeliveryError, FailureKind};
use crate::metrics_consts::{
    DELIVERIES_FAILED_COUNTER, DELIVERIES_SUCCEEDED_COUNTER, DELIVERY_ATTEMPTS_COUNTER,
    DELIVERY_ATTEMPT_TIME, DELIVERY_RETRIES_COUNTER, DELIVERY_SATURATION_GAUGE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    TerminalFailure,
}

/// One delivery attempt to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchAttempt {
    /// 1-based.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub latency: time::Duration,
    pub status: Option<StatusCode>,
    pub error: Option<FailureKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Delivered,
    Failed(FailureKind),
}

/// Everything that happened while delivering a record to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub target_id: String,
    pub target_name: String,
    pub attempts: Vec<DispatchAttempt>,
    pub status: DispatchStatus,
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        self.status == DispatchStatus::Delivered
    }
}

/// Delivers records to consumer targets.
///
/// Every attempt holds one permit of a semaphore shared by all records in the process, so the
/// number of in-flight requests is bounded regardless of how many envelopes are being
/// processed. Permits are released while a delivery sleeps between attempts.
#[derive(Clone)]
pub struct Dispatcher {
    delivery: Arc<dyn Deliver>,
    semaphore: Arc<Semaphore>,
    max_concurrent_deliveries: usize,
    retry_policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        delivery: Arc<dyn Deliver>,
        max_concurrent_deliveries: usize,
        retry_policy: RetryPolicy,
    ) -> Self {
        let max_concurrent_deliveries = max_concurrent_deliveries.max(1);

        Self {
            delivery,
            semaphore: Arc::new(Semaphore::new(max_concurrent_deliveries)),
            max_concurrent_deliveries,
            retry_policy,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Deliver `record` to every target concurrently, returning one outcome per target in the
    /// order given. A failing target never affects the others.
    pub async fn dispatch(
        &self,
        record: &EmailRecord,
        targets: &[&ConsumerTarget],
    ) -> Vec<DispatchOutcome> {
        if targets.is_empty() {
            return Vec::new();
        }

        // Serialized once and shared by every target.
        let payload = match serde_json::to_vec(&record.to_payload()) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                error!(
                    internet_message_id = record.log_id(),
                    "failed to serialize delivery payload: {}", e
                );
                return targets
                    .iter()
                    .map(|target| DispatchOutcome {
                        target_id: target.id.clone(),
                        target_name: target.label().to_owned(),
                        attempts: Vec::new(),
                        status: DispatchStatus::Failed(FailureKind::InvalidPayload),
                    })
                    .collect();
            }
        };

        join_all(
            targets
                .iter()
                .map(|target| self.deliver_with_retries(record.log_id(), target, payload.clone())),
        )
        .await
    }

    async fn deliver_with_retries(
        &self,
        log_id: &str,
        target: &ConsumerTarget,
        payload: Bytes,
    ) -> DispatchOutcome {
        let labels = [("target", target.id.clone())];
        let mut attempts = Vec::new();
        let mut attempt = 1;

        loop {
            let start = Instant::now();
            let result = self.attempt(target, payload.clone()).await;
            let latency = start.elapsed();

            metrics::counter!(DELIVERY_ATTEMPTS_COUNTER, &labels).increment(1);
            metrics::histogram!(DELIVERY_ATTEMPT_TIME, &labels).record(latency.as_secs_f64());

            match result {
                Ok(status) => {
                    info!(
                        event = "delivery_succeeded",
                        internet_message_id = log_id,
                        target_name = target.label(),
                        attempt,
                        status = status.as_u16(),
                        latency_ms = latency.as_millis() as u64,
                    );
                    metrics::counter!(DELIVERIES_SUCCEEDED_COUNTER, &labels).increment(1);

                    attempts.push(DispatchAttempt {
                        attempt,
                        outcome: AttemptOutcome::Success,
                        latency,
                        status: Some(status),
                        error: None,
                    });
                    return DispatchOutcome {
                        target_id: target.id.clone(),
                        target_name: target.label().to_owned(),
                        attempts,
                        status: DispatchStatus::Delivered,
                    };
                }
                Err(e) => {
                    let kind = e.kind();
                    let will_retry = e.is_retryable() && self.retry_policy.can_retry(attempt);

                    attempts.push(DispatchAttempt {
                        attempt,
                        outcome: if will_retry {
                            AttemptOutcome::RetryableFailure
                        } else {
                            AttemptOutcome::TerminalFailure
                        },
                        latency,
                        status: status_of(&e),
                        error: Some(kind),
                    });

                    if !will_retry {
                        error!(
                            event = "delivery_failed",
                            internet_message_id = log_id,
                            target_name = target.label(),
                            attempt,
                            error_kind = %kind,
                            "delivery failed permanently: {}", e
                        );
                        metrics::counter!(DELIVERIES_FAILED_COUNTER, &labels).increment(1);

                        return DispatchOutcome {
                            target_id: target.id.clone(),
                            target_name: target.label().to_owned(),
                            attempts,
                            status: DispatchStatus::Failed(kind),
                        };
                    }

                    let retry_interval = self.retry_policy.retry_interval(attempt, e.retry_after());
                    warn!(
                        event = "delivery_retrying",
                        internet_message_id = log_id,
                        target_name = target.label(),
                        attempt,
                        error_kind = %kind,
                        retry_in_ms = retry_interval.as_millis() as u64,
                        "delivery attempt failed: {}", e
                    );
                    metrics::counter!(DELIVERY_RETRIES_COUNTER, &labels).increment(1);

                    tokio::time::sleep(retry_interval).await;
                    attempt += 1;
                }
            }
        }
    }

    /// A single attempt: hold a permit for the duration of the request, and bound it by the
    /// endpoint's timeout.
    async fn attempt(
        &self,
        target: &ConsumerTarget,
        payload: Bytes,
    ) -> Result<StatusCode, DeliveryError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DeliveryError::Connection("delivery slots are closed".to_owned()))?;
        self.report_saturation();

        let timeout = target.endpoint.timeout();
        tokio::time::timeout(timeout, self.delivery.deliver(&target.endpoint, payload))
            .await
            .unwrap_or(Err(DeliveryError::Timeout(timeout)))
    }

    fn report_saturation(&self) {
        metrics::gauge!(DELIVERY_SATURATION_GAUGE).set(
            1f64 - self.semaphore.available_permits() as f64
                / self.max_concurrent_deliveries as f64,
        );
    }
}

fn status_of(error: &DeliveryError) -> Option<StatusCode> {
    match error {
        DeliveryError::Status { status, .. } => Some(*status),
        _ => None,
    }
}
