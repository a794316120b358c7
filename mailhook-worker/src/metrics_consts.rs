pub const NOTIFICATIONS_RECEIVED_COUNTER: &str = "mailhook_notifications_received_total";
pub const NOTIFICATIONS_REJECTED_COUNTER: &str = "mailhook_notifications_rejected_total";
pub const NOTIFICATIONS_DEDUPLICATED_COUNTER: &str = "mailhook_notifications_deduplicated_total";
pub const NOTIFICATION_QUEUE_FULL_COUNTER: &str = "mailhook_notification_queue_full_total";
pub const MESSAGE_FETCH_FAILED_COUNTER: &str = "mailhook_message_fetch_failed_total";
pub const MESSAGE_UNMATCHED_COUNTER: &str = "mailhook_message_unmatched_total";
pub const ATTACHMENT_LOAD_FAILED_COUNTER: &str = "mailhook_attachment_load_failed_total";
pub const ENVELOPE_PROCESSING_TIME: &str = "mailhook_envelope_processing_seconds";

pub const DELIVERY_ATTEMPTS_COUNTER: &str = "mailhook_delivery_attempts_total";
pub const DELIVERY_RETRIES_COUNTER: &str = "mailhook_delivery_retries_total";
pub const DELIVERIES_SUCCEEDED_COUNTER: &str = "mailhook_deliveries_succeeded_total";
pub const DELIVERIES_FAILED_COUNTER: &str = "mailhook_deliveries_failed_total";
pub const DELIVERY_ATTEMPT_TIME: &str = "mailhook_delivery_attempt_seconds";
pub const DELIVERY_SATURATION_GAUGE: &str = "mailhook_delivery_saturation_percent";

pub const TARGETS_LOADED_GAUGE: &str = "mailhook_targets_loaded";
pub const TARGETS_REJECTED_COUNTER: &str = "mailhook_targets_rejected_total";
pub const DEDUP_EVICTED_COUNTER: &str = "mailhook_dedup_evicted_total";
pub const DEDUP_ENTRIES_GAUGE: &str = "mailhook_dedup_entries";
