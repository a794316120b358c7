//! Deliver serialized records to consumer endpoints.
use std::time;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use mailhook_common::target::{Auth, Endpoint};
use reqwest::header;

use crate::error::DeliveryError;

/// The capability of sending one payload to one endpoint, once.
///
/// Implementations classify the result but never retry or time out on their own: the
/// dispatcher owns the attempt budget and the per-endpoint timeout.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, endpoint: &Endpoint, payload: Bytes)
        -> Result<StatusCode, DeliveryError>;
}

/// Deliver over HTTP with a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpDelivery {
    client: reqwest::Client,
}

impl HttpDelivery {
    pub fn new() -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Mailhook Worker")
            .build()?;

        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Deliver for HttpDelivery {
    async fn deliver(
        &self,
        endpoint: &Endpoint,
        payload: Bytes,
    ) -> Result<StatusCode, DeliveryError> {
        let method: http::Method = (&endpoint.method).into();
        let url: reqwest::Url =
            endpoint
                .url
                .parse()
                .map_err(|error| DeliveryError::InvalidUrl {
                    url: endpoint.url.clone(),
                    error,
                })?;
        let headers = auth_headers(&endpoint.auth)?;

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(payload)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    DeliveryError::Timeout(endpoint.timeout())
                } else {
                    DeliveryError::Connection(error.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(status);
        }

        Err(DeliveryError::Status {
            status,
            retry_after: parse_retry_after_header(response.headers()),
        })
    }
}

/// Build the authentication headers for an endpoint. Every `Auth` variant is handled here.
pub fn auth_headers(auth: &Auth) -> Result<header::HeaderMap, DeliveryError> {
    let mut headers = header::HeaderMap::new();

    match auth {
        Auth::None => {}
        Auth::Bearer { token } => {
            let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| DeliveryError::InvalidHeader(header::AUTHORIZATION.to_string()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Auth::ApiKey { header, value } => {
            let name = header::HeaderName::from_bytes(header.as_bytes())
                .map_err(|_| DeliveryError::InvalidHeader(header.clone()))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|_| DeliveryError::InvalidHeader(header.clone()))?;
            headers.insert(name, value);
        }
    }

    Ok(headers)
}

/// Attempt to parse a Duration from a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
pub fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}
