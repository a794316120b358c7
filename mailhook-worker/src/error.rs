use std::fmt;
use std::time;

use http::StatusCode;
use mailhook_common::target::TargetError;
use thiserror::Error;

/// Enumeration of errors that can occur while delivering a record to a consumer endpoint.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("endpoint url {url} is not valid: {error}")]
    InvalidUrl {
        url: String,
        #[source]
        error: url::ParseError,
    },
    #[error("value for header {0} is not valid")]
    InvalidHeader(String),
    #[error("request to consumer could not be sent: {0}")]
    Connection(String),
    #[error("consumer did not respond within {0:?}")]
    Timeout(time::Duration),
    #[error("consumer responded with status {status}")]
    Status {
        status: StatusCode,
        retry_after: Option<time::Duration>,
    },
}

impl DeliveryError {
    /// Transient failures may succeed on a later attempt: connection failures, timeouts, and
    /// any 5XX. Every 4XX and every malformed endpoint is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Connection(_) | DeliveryError::Timeout(_) => true,
            DeliveryError::Status { status, .. } => status.is_server_error(),
            DeliveryError::InvalidUrl { .. } | DeliveryError::InvalidHeader(_) => false,
        }
    }

    /// Interval the consumer asked us to wait before trying again, if any.
    pub fn retry_after(&self) -> Option<time::Duration> {
        match self {
            DeliveryError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            DeliveryError::InvalidUrl { .. } | DeliveryError::InvalidHeader(_) => {
                FailureKind::InvalidEndpoint
            }
            DeliveryError::Connection(_) => FailureKind::Connection,
            DeliveryError::Timeout(_) => FailureKind::Timeout,
            DeliveryError::Status { status, .. } if status.is_server_error() => {
                FailureKind::ServerError
            }
            DeliveryError::Status { .. } => FailureKind::ClientError,
        }
    }
}

/// Classified kind of a failed delivery attempt, used for metric labels and outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidPayload,
    InvalidEndpoint,
    Connection,
    Timeout,
    ClientError,
    ServerError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidPayload => "invalid_payload",
            FailureKind::InvalidEndpoint => "invalid_endpoint",
            FailureKind::Connection => "connection",
            FailureKind::Timeout => "timeout",
            FailureKind::ClientError => "client_error",
            FailureKind::ServerError => "server_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumeration of errors raised while fetching messages or attachments from the mail provider.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("mail provider url {0} is not valid")]
    InvalidUrl(String),
    #[error("failed to acquire an access token: {0}")]
    Token(String),
    #[error("request to the mail provider failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("mail provider responded with status {status} for {resource}")]
    Status { status: StatusCode, resource: String },
    #[error("message {0} was not found")]
    NotFound(String),
    #[error("attachment {id} could not be decoded: {error}")]
    Decode {
        id: String,
        #[source]
        error: base64::DecodeError,
    },
}

/// Enumeration of errors raised while loading the consumer target configuration.
#[derive(Error, Debug)]
pub enum TargetStoreError {
    #[error("failed to read target configuration from {path}: {error}")]
    Io {
        path: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to parse target configuration: {0}")]
    Parse(#[from] TargetError),
}

/// Enumeration of errors related to initialization and running of the service.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("failed to serve ingress: {0}")]
    Serve(#[from] std::io::Error),
    #[error("failed to set up mail provider client: {0}")]
    Provider(#[from] FetchError),
    #[error("notification worker stopped unexpectedly")]
    WorkerStopped,
}
