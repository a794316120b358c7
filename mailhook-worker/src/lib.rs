pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handlers;
pub mod metrics_consts;
pub mod pipeline;
pub mod provider;
pub mod targets;
pub mod worker;
