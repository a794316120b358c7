//! # Envelope
//!
//! Raw change notifications as delivered by the mail provider, before they are resolved into an
//! `EmailRecord`.
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("{0} is not a valid message resource path")]
    InvalidResource(String),
}

/// The request body the provider POSTs: a batch of notifications under `value`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationBatch {
    #[serde(default)]
    pub value: Vec<NotificationEnvelope>,
}

/// One raw change notification.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    /// Identifies mailbox and message, e.g. `users/{mailbox}/messages/{id}`. Left empty when the
    /// provider omits it, so the envelope fails on its own instead of taking its batch with it.
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub client_state: Option<String>,
    #[serde(default)]
    pub change_type: String,
    #[serde(skip_deserializing, default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl NotificationEnvelope {
    pub fn new(resource: &str, client_state: Option<&str>, change_type: &str) -> Self {
        Self {
            resource: resource.to_owned(),
            client_state: client_state.map(str::to_owned),
            change_type: change_type.to_owned(),
            received_at: Utc::now(),
        }
    }

    pub fn message_ref(&self) -> Result<MessageRef, EnvelopeError> {
        MessageRef::parse(&self.resource)
    }
}

/// The mailbox and provider message id a notification points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub mailbox: String,
    pub message_id: String,
}

impl MessageRef {
    /// Parse `users/{mailbox}/messages/{id}` or `users/{mailbox}/mailFolders/{folder}/messages/{id}`.
    /// The provider is inconsistent about the case of the fixed segments, so they are compared
    /// case-insensitively.
    pub fn parse(resource: &str) -> Result<Self, EnvelopeError> {
        let invalid = || EnvelopeError::InvalidResource(resource.to_owned());
        let parts: Vec<&str> = resource
            .trim_matches('/')
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();

        if parts.len() < 4
            || !parts[0].eq_ignore_ascii_case("users")
            || !parts[parts.len() - 2].eq_ignore_ascii_case("messages")
        {
            return Err(invalid());
        }

        Ok(MessageRef {
            mailbox: parts[1].to_owned(),
            message_id: parts[parts.len() - 1].to_owned(),
        })
    }

    /// Key used for deduplication. Mailbox addresses are case-insensitive, message ids are not.
    pub fn dedup_key(&self) -> String {
        format!("{}/{}", self.mailbox.to_lowercase(), self.message_id)
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "users/{}/messages/{}", self.mailbox, self.message_id)
    }
}
