pub mod dedup;
pub mod envelope;
pub mod matcher;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod rules;
pub mod target;
