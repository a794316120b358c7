//! # Record
//!
//! The `EmailRecord` routed through the engine, and the JSON payload it is serialized to for
//! delivery to consumers.
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Name of the folder that marks a message as outgoing.
pub const SENT_ITEMS_FOLDER: &str = "Sent Items";

/// A participant in a message: an address and an optional display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub address: String,
    #[serde(default)]
    pub name: String,
}

impl EmailAddress {
    pub fn new(address: &str, name: &str) -> Self {
        Self {
            address: address.to_owned(),
            name: name.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    Text,
    Html,
}

impl fmt::Display for BodyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BodyType::Text => write!(f, "text"),
            BodyType::Html => write!(f, "html"),
        }
    }
}

/// Whether a message was received into or sent from the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Received,
    Sent,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Received => write!(f, "received"),
            Direction::Sent => write!(f, "sent"),
        }
    }
}

/// Attachment details that are always available after a metadata fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub is_inline: bool,
}

/// An attachment with its binary payload, only present after an explicit load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub is_inline: bool,
    #[serde(serialize_with = "serialize_base64")]
    pub content: Vec<u8>,
}

fn serialize_base64<S>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(content))
}

/// A fully resolved message, ready for matching and dispatch.
///
/// A record is owned by the pipeline invocation that fetched it and is never shared across
/// concurrent invocations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmailRecord {
    pub message_id: String,
    pub internet_message_id: String,
    pub conversation_id: String,
    pub conversation_index: String,
    pub subject: String,
    pub body_preview: String,
    pub body_content: String,
    pub body_type: BodyType,
    pub from: EmailAddress,
    pub to_recipients: Vec<EmailAddress>,
    pub cc_recipients: Vec<EmailAddress>,
    pub bcc_recipients: Vec<EmailAddress>,
    pub received_datetime: Option<DateTime<Utc>>,
    pub sent_datetime: Option<DateTime<Utc>>,
    pub attachment_metadata: Vec<AttachmentMetadata>,
    pub attachments: Vec<Attachment>,
    pub mailbox: String,
    pub folder: String,
}

impl EmailRecord {
    pub fn direction(&self) -> Direction {
        if self.folder == SENT_ITEMS_FOLDER {
            Direction::Sent
        } else {
            Direction::Received
        }
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachment_metadata.is_empty()
    }

    pub fn has_attachment_content(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Addresses of every recipient: to, cc and bcc, in that order.
    pub fn all_recipient_addresses(&self) -> impl Iterator<Item = &str> {
        self.to_recipients
            .iter()
            .chain(self.cc_recipients.iter())
            .chain(self.bcc_recipients.iter())
            .map(|r| r.address.as_str())
    }

    pub fn total_attachment_size(&self) -> u64 {
        self.attachment_metadata.iter().map(|a| a.size).sum()
    }

    /// The identity used in logs: the internet message id, falling back to the provider id.
    pub fn log_id(&self) -> &str {
        if self.internet_message_id.is_empty() {
            &self.message_id
        } else {
            &self.internet_message_id
        }
    }

    pub fn to_payload(&self) -> DeliveryPayload<'_> {
        DeliveryPayload {
            message_id: &self.message_id,
            internet_message_id: &self.internet_message_id,
            conversation_id: &self.conversation_id,
            conversation_index: &self.conversation_index,
            subject: &self.subject,
            body_preview: &self.body_preview,
            body_content: &self.body_content,
            body_type: self.body_type,
            from_address: &self.from.address,
            from_name: &self.from.name,
            to_recipients: &self.to_recipients,
            cc_recipients: &self.cc_recipients,
            bcc_recipients: &self.bcc_recipients,
            received_datetime: self.received_datetime,
            sent_datetime: self.sent_datetime,
            has_attachments: self.has_attachments(),
            attachment_metadata: &self.attachment_metadata,
            attachments: &self.attachments,
            mailbox: &self.mailbox,
            folder: &self.folder,
            direction: self.direction(),
        }
    }
}

/// The body POSTed to every matched consumer.
///
/// Consumers are deployed independently, so the set of keys here is a compatibility contract.
#[derive(Debug, Serialize)]
pub struct DeliveryPayload<'a> {
    pub message_id: &'a str,
    pub internet_message_id: &'a str,
    pub conversation_id: &'a str,
    pub conversation_index: &'a str,
    pub subject: &'a str,
    pub body_preview: &'a str,
    pub body_content: &'a str,
    pub body_type: BodyType,
    pub from_address: &'a str,
    pub from_name: &'a str,
    pub to_recipients: &'a [EmailAddress],
    pub cc_recipients: &'a [EmailAddress],
    pub bcc_recipients: &'a [EmailAddress],
    pub received_datetime: Option<DateTime<Utc>>,
    pub sent_datetime: Option<DateTime<Utc>>,
    pub has_attachments: bool,
    pub attachment_metadata: &'a [AttachmentMetadata],
    pub attachments: &'a [Attachment],
    pub mailbox: &'a str,
    pub folder: &'a str,
    pub direction: Direction,
}
