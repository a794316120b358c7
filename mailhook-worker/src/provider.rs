//! Resolve notifications into records, and load attachment content, from the mail provider.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use http::StatusCode;
use mailhook_common::envelope::MessageRef;
use mailhook_common::record::{Attachment, AttachmentMetadata, BodyType, EmailAddress, EmailRecord};
use reqwest::header;
use serde::{Deserialize, Deserializer};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::FetchError;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const MESSAGE_SELECT: &str = "id,subject,body,bodyPreview,from,toRecipients,ccRecipients,\
bccRecipients,receivedDateTime,sentDateTime,hasAttachments,internetMessageId,conversationId,\
conversationIndex,parentFolderId";
const ATTACHMENT_EXPAND: &str = "attachments($select=id,name,size,contentType,isInline)";
const FILE_ATTACHMENT_TYPE: &str = "#microsoft.graph.fileAttachment";
const DEFAULT_FOLDER: &str = "Inbox";
/// Upper bound on `@odata.nextLink` pages followed for one message's attachments.
const MAX_ATTACHMENT_PAGES: usize = 20;
/// Tokens are refreshed this long before the provider says they expire.
const TOKEN_EXPIRY_MARGIN: time::Duration = time::Duration::from_secs(300);

/// Resolve a notification's message reference into a record with attachment metadata but no
/// attachment content.
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    async fn fetch_message(&self, message: &MessageRef) -> Result<EmailRecord, FetchError>;
}

/// Load the binary content of a record's attachments.
#[async_trait]
pub trait AttachmentLoader: Send + Sync {
    async fn load_attachments(&self, record: &EmailRecord) -> Result<Vec<Attachment>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct GraphCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// A Microsoft Graph client authenticated with the client-credentials flow.
pub struct GraphClient {
    client: reqwest::Client,
    api_base: Url,
    token_url: Url,
    credentials: GraphCredentials,
    token: tokio::sync::Mutex<Option<CachedToken>>,
    /// Folder display names by `mailbox/folder id`.
    folders: Mutex<HashMap<String, String>>,
}

impl GraphClient {
    pub fn new(
        credentials: GraphCredentials,
        api_base_url: &str,
        login_base_url: &str,
        request_timeout: time::Duration,
    ) -> Result<Self, FetchError> {
        let api_base =
            Url::parse(api_base_url).map_err(|_| FetchError::InvalidUrl(api_base_url.to_owned()))?;
        let token_url = Url::parse(&format!(
            "{}/{}/oauth2/v2.0/token",
            login_base_url.trim_end_matches('/'),
            credentials.tenant_id
        ))
        .map_err(|_| FetchError::InvalidUrl(login_base_url.to_owned()))?;

        let client = reqwest::Client::builder()
            .user_agent("Mailhook Worker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            api_base,
            token_url,
            credentials,
            token: tokio::sync::Mutex::new(None),
            folders: Mutex::new(HashMap::new()),
        })
    }

    /// Return a cached access token, or acquire a new one. Concurrent callers wait for a single
    /// refresh.
    async fn access_token(&self) -> Result<String, FetchError> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        info!("fetching new access token from the mail provider");

        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.credentials.client_id)
            .append_pair("client_secret", &self.credentials.client_secret)
            .append_pair("scope", GRAPH_SCOPE)
            .append_pair("grant_type", "client_credentials")
            .finish();

        let response = self
            .client
            .post(self.token_url.clone())
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form)
            .send()
            .await
            .map_err(|e| FetchError::Token(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Token(format!(
                "token endpoint responded with status {status}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Token(e.to_string()))?;

        let lifetime = time::Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }

    fn api_url(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.api_base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<T, FetchError> {
        let token = self.access_token().await?;
        let resource = url.path().to_owned();

        let response = self.client.get(url).bearer_auth(token).send().await?;

        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(resource)),
            status => Err(FetchError::Status { status, resource }),
        }
    }

    /// Resolve a folder id into its display name, falling back to the inbox when the lookup
    /// fails.
    async fn folder_name(&self, mailbox: &str, folder_id: Option<&str>) -> String {
        let Some(folder_id) = folder_id.filter(|id| !id.is_empty()) else {
            return DEFAULT_FOLDER.to_owned();
        };

        let key = format!("{}/{}", mailbox.to_lowercase(), folder_id);
        if let Some(name) = self.folders.lock().ok().and_then(|f| f.get(&key).cloned()) {
            return name;
        }

        let folder = match self.api_url(&["users", mailbox, "mailFolders", folder_id]) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("$select", "displayName");
                self.get::<GraphFolder>(url).await
            }
            Err(e) => Err(e),
        };

        match folder {
            Ok(folder) => {
                if let Ok(mut folders) = self.folders.lock() {
                    folders.insert(key, folder.display_name.clone());
                }
                folder.display_name
            }
            Err(e) => {
                warn!(mailbox, "failed to resolve mail folder, assuming inbox: {}", e);
                DEFAULT_FOLDER.to_owned()
            }
        }
    }
}

#[async_trait]
impl MessageFetcher for GraphClient {
    async fn fetch_message(&self, message: &MessageRef) -> Result<EmailRecord, FetchError> {
        let mut url = self.api_url(&["users", &message.mailbox, "messages", &message.message_id])?;
        url.query_pairs_mut()
            .append_pair("$select", MESSAGE_SELECT)
            .append_pair("$expand", ATTACHMENT_EXPAND);

        let graph_message: GraphMessage = self.get(url).await?;
        let folder = self
            .folder_name(&message.mailbox, graph_message.parent_folder_id.as_deref())
            .await;

        let record = graph_message.into_record(&message.mailbox, folder);
        debug!(
            internet_message_id = record.log_id(),
            attachments = record.attachment_metadata.len(),
            "fetched message"
        );

        Ok(record)
    }
}

#[async_trait]
impl AttachmentLoader for GraphClient {
    async fn load_attachments(&self, record: &EmailRecord) -> Result<Vec<Attachment>, FetchError> {
        let url = self.api_url(&[
            "users",
            &record.mailbox,
            "messages",
            &record.message_id,
            "attachments",
        ])?;

        let mut attachments = Vec::new();
        let mut next = Some(url);
        let mut pages = 0;

        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_ATTACHMENT_PAGES {
                warn!(
                    internet_message_id = record.log_id(),
                    loaded = attachments.len(),
                    "too many attachment pages, keeping what was loaded"
                );
                break;
            }

            let page: GraphList<GraphAttachment> = self.get(url).await?;
            for attachment in page.value {
                attachments.push(attachment.into_attachment()?);
            }

            next = match page.next_link {
                Some(link) => Some(
                    Url::parse(&link).map_err(|_| FetchError::InvalidUrl(link.clone()))?,
                ),
                None => None,
            };
        }

        Ok(attachments)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: u64,
}

fn default_token_lifetime() -> u64 {
    3600
}

/// Graph sends `null` for absent strings and lists; treat those like missing keys.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Deserialize)]
struct GraphList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolder {
    display_name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    #[serde(default, deserialize_with = "nullable")]
    content_type: String,
    #[serde(default, deserialize_with = "nullable")]
    content: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GraphEmailAddress {
    #[serde(default, deserialize_with = "nullable")]
    address: String,
    #[serde(default, deserialize_with = "nullable")]
    name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    #[serde(default, deserialize_with = "nullable")]
    email_address: GraphEmailAddress,
}

impl From<GraphRecipient> for EmailAddress {
    fn from(recipient: GraphRecipient) -> Self {
        EmailAddress {
            address: recipient.email_address.address,
            name: recipient.email_address.name,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttachment {
    #[serde(rename = "@odata.type", default)]
    odata_type: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    id: String,
    #[serde(default, deserialize_with = "nullable")]
    name: String,
    #[serde(default, deserialize_with = "nullable")]
    content_type: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    is_inline: bool,
    #[serde(default)]
    content_bytes: Option<String>,
}

impl GraphAttachment {
    fn metadata(&self) -> AttachmentMetadata {
        AttachmentMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            content_type: self.content_type.clone(),
            is_inline: self.is_inline,
        }
    }

    /// Only file attachments carry content; item and reference attachments load empty.
    fn into_attachment(self) -> Result<Attachment, FetchError> {
        let content = match (self.odata_type.as_deref(), self.content_bytes.as_deref()) {
            (Some(FILE_ATTACHMENT_TYPE), Some(encoded)) => {
                STANDARD
                    .decode(encoded)
                    .map_err(|error| FetchError::Decode {
                        id: self.id.clone(),
                        error,
                    })?
            }
            _ => Vec::new(),
        };

        Ok(Attachment {
            id: self.id,
            name: self.name,
            content_type: self.content_type,
            size: self.size,
            is_inline: self.is_inline,
            content,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    #[serde(default, deserialize_with = "nullable")]
    id: String,
    #[serde(default, deserialize_with = "nullable")]
    internet_message_id: String,
    #[serde(default, deserialize_with = "nullable")]
    conversation_id: String,
    #[serde(default, deserialize_with = "nullable")]
    conversation_index: String,
    #[serde(default, deserialize_with = "nullable")]
    subject: String,
    #[serde(default, deserialize_with = "nullable")]
    body_preview: String,
    #[serde(default, deserialize_with = "nullable")]
    body: GraphBody,
    #[serde(default, deserialize_with = "nullable")]
    from: GraphRecipient,
    #[serde(default, deserialize_with = "nullable")]
    to_recipients: Vec<GraphRecipient>,
    #[serde(default, deserialize_with = "nullable")]
    cc_recipients: Vec<GraphRecipient>,
    #[serde(default, deserialize_with = "nullable")]
    bcc_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    sent_date_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "nullable")]
    attachments: Vec<GraphAttachment>,
    #[serde(default)]
    parent_folder_id: Option<String>,
}

impl GraphMessage {
    fn into_record(self, mailbox: &str, folder: String) -> EmailRecord {
        let body_type = if self.body.content_type.eq_ignore_ascii_case("html") {
            BodyType::Html
        } else {
            BodyType::Text
        };

        EmailRecord {
            message_id: self.id,
            internet_message_id: self.internet_message_id,
            conversation_id: self.conversation_id,
            conversation_index: self.conversation_index,
            subject: self.subject,
            body_preview: self.body_preview,
            body_content: self.body.content,
            body_type,
            from: self.from.into(),
            to_recipients: self.to_recipients.into_iter().map(Into::into).collect(),
            cc_recipients: self.cc_recipients.into_iter().map(Into::into).collect(),
            bcc_recipients: self.bcc_recipients.into_iter().map(Into::into).collect(),
            received_datetime: self.received_date_time,
            sent_datetime: self.sent_date_time,
            attachment_metadata: self.attachments.iter().map(GraphAttachment::metadata).collect(),
            attachments: Vec::new(),
            mailbox: mailbox.to_owned(),
            folder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use mailhook_common::record::Direction;
    use serde_json::json;

    fn client(server: &MockServer) -> GraphClient {
        GraphClient::new(
            GraphCredentials {
                tenant_id: "tenant".to_owned(),
                client_id: "client".to_owned(),
                client_secret: "secret".to_owned(),
            },
            &server.url("/v1.0"),
            &server.url(""),
            time::Duration::from_secs(5),
        )
        .expect("failed to build graph client")
    }

    fn mock_token(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST)
                .path("/tenant/oauth2/v2.0/token")
                .body_contains("grant_type=client_credentials");
            then.status(200)
                .json_body(json!({"access_token": "t0k3n", "expires_in": 3599}));
        })
    }

    fn message_ref() -> MessageRef {
        MessageRef {
            mailbox: "ap@corp.com".to_owned(),
            message_id: "AAMk1".to_owned(),
        }
    }

    #[tokio::test]
    async fn test_fetch_message_builds_record() {
        let server = MockServer::start();
        let token = mock_token(&server);
        let message = server.mock(|when, then| {
            when.method(GET)
                .path("/v1.0/users/ap@corp.com/messages/AAMk1")
                .header("authorization", "Bearer t0k3n");
            then.status(200).json_body(json!({
                "id": "AAMk1",
                "internetMessageId": "<abc@corp.com>",
                "conversationId": "conv",
                "conversationIndex": null,
                "subject": "Invoice #42",
                "bodyPreview": "Please find",
                "body": {"contentType": "HTML", "content": "<p>Please find</p>"},
                "from": {"emailAddress": {"address": "vendor@supplier.com", "name": "Vendor"}},
                "toRecipients": [{"emailAddress": {"address": "ap@corp.com", "name": "AP"}}],
                "ccRecipients": [],
                "bccRecipients": null,
                "receivedDateTime": "2024-05-01T10:00:00Z",
                "sentDateTime": "2024-05-01T09:59:58Z",
                "hasAttachments": true,
                "parentFolderId": "SENT",
                "attachments": [
                    {"id": "att1", "name": "invoice.pdf", "size": 1024,
                     "contentType": "application/pdf", "isInline": false}
                ]
            }));
        });
        let folder = server.mock(|when, then| {
            when.method(GET)
                .path("/v1.0/users/ap@corp.com/mailFolders/SENT");
            then.status(200).json_body(json!({"displayName": "Sent Items"}));
        });

        let graph = client(&server);
        let record = graph
            .fetch_message(&message_ref())
            .await
            .expect("fetch should succeed");

        assert_eq!(record.message_id, "AAMk1");
        assert_eq!(record.internet_message_id, "<abc@corp.com>");
        assert_eq!(record.conversation_index, "");
        assert_eq!(record.body_type, BodyType::Html);
        assert_eq!(
            record.from,
            EmailAddress::new("vendor@supplier.com", "Vendor")
        );
        assert_eq!(record.to_recipients.len(), 1);
        assert!(record.bcc_recipients.is_empty());
        assert_eq!(record.mailbox, "ap@corp.com");
        assert_eq!(record.folder, "Sent Items");
        assert_eq!(record.direction(), Direction::Sent);
        assert!(record.has_attachments());
        assert!(!record.has_attachment_content());
        assert_eq!(record.attachment_metadata[0].name, "invoice.pdf");
        assert_eq!(record.total_attachment_size(), 1024);

        // Second fetch reuses the token and the resolved folder name.
        graph.fetch_message(&message_ref()).await.unwrap();
        token.assert_hits(1);
        message.assert_hits(2);
        folder.assert_hits(1);
    }

    #[tokio::test]
    async fn test_fetch_message_defaults_to_inbox_when_folder_lookup_fails() {
        let server = MockServer::start();
        mock_token(&server);
        server.mock(|when, then| {
            when.method(GET).path("/v1.0/users/ap@corp.com/messages/AAMk1");
            then.status(200)
                .json_body(json!({"id": "AAMk1", "parentFolderId": "GONE"}));
        });
        server.mock(|when, then| {
            when.method(GET)
                .path("/v1.0/users/ap@corp.com/mailFolders/GONE");
            then.status(500);
        });

        let record = client(&server).fetch_message(&message_ref()).await.unwrap();

        assert_eq!(record.folder, "Inbox");
        assert_eq!(record.direction(), Direction::Received);
        assert!(!record.has_attachments());
    }

    #[tokio::test]
    async fn test_fetch_message_not_found() {
        let server = MockServer::start();
        mock_token(&server);
        server.mock(|when, then| {
            when.method(GET).path("/v1.0/users/ap@corp.com/messages/AAMk1");
            then.status(404);
        });

        let error = client(&server)
            .fetch_message(&message_ref())
            .await
            .expect_err("fetch should fail");

        assert!(matches!(error, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_token_failure_is_a_fetch_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/tenant/oauth2/v2.0/token");
            then.status(401);
        });

        let error = client(&server)
            .fetch_message(&message_ref())
            .await
            .expect_err("fetch should fail");

        assert!(matches!(error, FetchError::Token(_)));
    }

    #[tokio::test]
    async fn test_load_attachments_decodes_file_content() {
        let server = MockServer::start();
        mock_token(&server);
        server.mock(|when, then| {
            when.method(GET)
                .path("/v1.0/users/ap@corp.com/messages/AAMk1/attachments");
            then.status(200).json_body(json!({
                "value": [
                    {
                        "@odata.type": "#microsoft.graph.fileAttachment",
                        "id": "att1",
                        "name": "invoice.pdf",
                        "contentType": "application/pdf",
                        "size": 5,
                        "isInline": false,
                        "contentBytes": "JVBERi0="
                    },
                    {
                        "@odata.type": "#microsoft.graph.itemAttachment",
                        "id": "att2",
                        "name": "Forwarded",
                        "size": 2048
                    }
                ]
            }));
        });

        let record = EmailRecord {
            message_id: "AAMk1".to_owned(),
            mailbox: "ap@corp.com".to_owned(),
            ..Default::default()
        };

        let attachments = client(&server)
            .load_attachments(&record)
            .await
            .expect("load should succeed");

        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].content, b"%PDF-".to_vec());
        assert!(attachments[1].content.is_empty());
        assert_eq!(attachments[1].size, 2048);
    }

    #[tokio::test]
    async fn test_load_attachments_follows_next_link() {
        let server = MockServer::start();
        mock_token(&server);
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/v1.0/users/ap@corp.com/messages/AAMk1/attachments");
            then.status(200).json_body(json!({
                "value": [{
                    "@odata.type": "#microsoft.graph.fileAttachment",
                    "id": "att1",
                    "name": "invoice.pdf",
                    "contentBytes": "JVBERi0="
                }],
                "@odata.nextLink": server.url("/v1.0/pages/attachments-2")
            }));
        });
        let second = server.mock(|when, then| {
            when.method(GET).path("/v1.0/pages/attachments-2");
            then.status(200).json_body(json!({
                "value": [{
                    "@odata.type": "#microsoft.graph.fileAttachment",
                    "id": "att2",
                    "name": "remittance.pdf",
                    "contentBytes": "JVBERi0="
                }]
            }));
        });

        let record = EmailRecord {
            message_id: "AAMk1".to_owned(),
            mailbox: "ap@corp.com".to_owned(),
            ..Default::default()
        };

        let attachments = client(&server)
            .load_attachments(&record)
            .await
            .expect("load should succeed");

        let ids: Vec<&str> = attachments.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["att1", "att2"]);
        first.assert_hits(1);
        second.assert_hits(1);
    }

    #[tokio::test]
    async fn test_load_attachments_rejects_corrupt_content() {
        let server = MockServer::start();
        mock_token(&server);
        server.mock(|when, then| {
            when.method(GET)
                .path("/v1.0/users/ap@corp.com/messages/AAMk1/attachments");
            then.status(200).json_body(json!({
                "value": [{
                    "@odata.type": "#microsoft.graph.fileAttachment",
                    "id": "att1",
                    "contentBytes": "not base64!"
                }]
            }));
        });

        let record = EmailRecord {
            message_id: "AAMk1".to_owned(),
            mailbox: "ap@corp.com".to_owned(),
            ..Default::default()
        };

        let error = client(&server)
            .load_attachments(&record)
            .await
            .expect_err("load should fail");

        assert!(matches!(error, FetchError::Decode { id, .. } if id == "att1"));
    }
}
