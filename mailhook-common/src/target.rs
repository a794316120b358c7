//! # Target
//!
//! Consumer targets: where a matched record is delivered, and the rule that decides whether it
//! matches.
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time;

use serde::{de::Visitor, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::rules::RuleExpression;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("{0} is not a valid HttpMethod")]
    ParseHttpMethodError(String),
    #[error("rule configuration is not valid JSON: {0}")]
    InvalidDocument(#[source] serde_json::Error),
    #[error("rule configuration must be an array of targets or an object with a `targets` array")]
    UnexpectedShape,
    #[error("target at index {index} is invalid: {error}")]
    InvalidTarget {
        index: usize,
        #[source]
        error: serde_json::Error,
    },
    #[error("target at index {index} has an empty id")]
    MissingId { index: usize },
    #[error("target id {0} is defined more than once")]
    DuplicateId(String),
}

/// Supported HTTP methods for delivery endpoints.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum HttpMethod {
    DELETE,
    GET,
    PATCH,
    #[default]
    POST,
    PUT,
}

/// Allow casting `HttpMethod` from strings.
impl FromStr for HttpMethod {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_ref() {
            "DELETE" => Ok(HttpMethod::DELETE),
            "GET" => Ok(HttpMethod::GET),
            "PATCH" => Ok(HttpMethod::PATCH),
            "POST" => Ok(HttpMethod::POST),
            "PUT" => Ok(HttpMethod::PUT),
            invalid => Err(TargetError::ParseHttpMethodError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HttpMethod::DELETE => write!(f, "DELETE"),
            HttpMethod::GET => write!(f, "GET"),
            HttpMethod::PATCH => write!(f, "PATCH"),
            HttpMethod::POST => write!(f, "POST"),
            HttpMethod::PUT => write!(f, "PUT"),
        }
    }
}

struct HttpMethodVisitor;

impl Visitor<'_> for HttpMethodVisitor {
    type Value = HttpMethod;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the string representation of HttpMethod")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        match HttpMethod::from_str(s) {
            Ok(method) => Ok(method),
            Err(_) => Err(serde::de::Error::invalid_value(
                serde::de::Unexpected::Str(s),
                &self,
            )),
        }
    }
}

impl<'de> Deserialize<'de> for HttpMethod {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(HttpMethodVisitor)
    }
}

impl Serialize for HttpMethod {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<&HttpMethod> for http::Method {
    fn from(val: &HttpMethod) -> Self {
        match val {
            HttpMethod::DELETE => http::Method::DELETE,
            HttpMethod::GET => http::Method::GET,
            HttpMethod::PATCH => http::Method::PATCH,
            HttpMethod::POST => http::Method::POST,
            HttpMethod::PUT => http::Method::PUT,
        }
    }
}

/// How a consumer endpoint authenticates us. Closed on purpose: header construction in the
/// dispatcher must handle every variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Auth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    ApiKey {
        header: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Endpoint {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Per-call timeout, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default)]
    pub auth: Auth,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Endpoint {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            method: HttpMethod::POST,
            timeout: DEFAULT_TIMEOUT_SECS,
            auth: Auth::None,
        }
    }

    pub fn timeout(&self) -> time::Duration {
        time::Duration::from_secs(self.timeout)
    }
}

/// A downstream consumer with its own rule expression and endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerTarget {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub rule: RuleExpression,
    pub endpoint: Endpoint,
}

fn default_enabled() -> bool {
    true
}

impl ConsumerTarget {
    /// Name for logs: the display name, or the id when no name was configured.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// The result of parsing a rule configuration document: the targets that loaded, and the
/// reasons the others were rejected.
#[derive(Debug, Default)]
pub struct ParsedTargets {
    pub targets: Vec<ConsumerTarget>,
    pub rejected: Vec<TargetError>,
}

/// Parse a rule configuration document.
///
/// Accepts either a bare array of targets or an object holding them under `targets` (or the
/// older `utilities` key). A target that fails to parse is rejected on its own; the remaining
/// targets still load. Only a document that is not JSON at all, or has the wrong shape, is an
/// error.
pub fn parse_targets(document: &str) -> Result<ParsedTargets, TargetError> {
    let document: Value = serde_json::from_str(document).map_err(TargetError::InvalidDocument)?;

    let entries = match document {
        Value::Array(entries) => entries,
        Value::Object(mut object) => match object
            .remove("targets")
            .or_else(|| object.remove("utilities"))
        {
            Some(Value::Array(entries)) => entries,
            _ => return Err(TargetError::UnexpectedShape),
        },
        _ => return Err(TargetError::UnexpectedShape),
    };

    let mut parsed = ParsedTargets::default();
    let mut seen = HashSet::new();

    for (index, entry) in entries.into_iter().enumerate() {
        let target: ConsumerTarget = match serde_json::from_value(entry) {
            Ok(target) => target,
            Err(error) => {
                parsed
                    .rejected
                    .push(TargetError::InvalidTarget { index, error });
                continue;
            }
        };

        if target.id.trim().is_empty() {
            parsed.rejected.push(TargetError::MissingId { index });
            continue;
        }

        if !seen.insert(target.id.clone()) {
            parsed.rejected.push(TargetError::DuplicateId(target.id));
            continue;
        }

        parsed.targets.push(target);
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Logic;

    const DOCUMENT: &str = r#"{
        "targets": [
            {
                "id": "invoices",
                "name": "Invoice processor",
                "enabled": true,
                "group_logic": "OR",
                "condition_groups": [
                    {
                        "name": "subject",
                        "logic": "AND",
                        "conditions": [
                            {"field": "subject", "operator": "contains", "value": "invoice"}
                        ]
                    }
                ],
                "endpoint": {
                    "url": "https://invoices.internal/hook",
                    "method": "post",
                    "timeout": 10,
                    "auth": {"type": "bearer", "token": "t0k3n"}
                }
            },
            {
                "id": "archive",
                "endpoint": {"url": "https://archive.internal/hook"}
            },
            {
                "id": "broken",
                "endpoint": {"url": "https://x", "method": "TELEPORT"}
            },
            {
                "id": "archive",
                "endpoint": {"url": "https://archive.internal/other"}
            }
        ]
    }"#;

    #[test]
    fn test_parse_targets() {
        let parsed = parse_targets(DOCUMENT).expect("document should parse");

        assert_eq!(parsed.targets.len(), 2);
        assert_eq!(parsed.rejected.len(), 2);

        let invoices = &parsed.targets[0];
        assert_eq!(invoices.label(), "Invoice processor");
        assert_eq!(invoices.rule.group_logic, Logic::Or);
        assert_eq!(invoices.rule.condition_groups.len(), 1);
        assert_eq!(invoices.endpoint.method, HttpMethod::POST);
        assert_eq!(invoices.endpoint.timeout(), time::Duration::from_secs(10));
        assert_eq!(
            invoices.endpoint.auth,
            Auth::Bearer {
                token: "t0k3n".to_owned()
            }
        );

        let archive = &parsed.targets[1];
        assert!(archive.enabled);
        assert_eq!(archive.label(), "archive");
        assert!(archive.rule.condition_groups.is_empty());
        assert_eq!(archive.endpoint.auth, Auth::None);
        assert_eq!(archive.endpoint.timeout(), time::Duration::from_secs(30));

        assert!(matches!(
            parsed.rejected[0],
            TargetError::InvalidTarget { index: 2, .. }
        ));
        assert!(matches!(&parsed.rejected[1], TargetError::DuplicateId(id) if id == "archive"));
    }

    #[test]
    fn test_parse_bare_array_and_api_key_auth() {
        let parsed = parse_targets(
            r#"[{"id": "a", "endpoint": {"url": "https://a", "method": "PUT",
                "auth": {"type": "api_key", "header": "X-Api-Key", "value": "k"}}}]"#,
        )
        .unwrap();

        assert!(parsed.rejected.is_empty());
        assert_eq!(parsed.targets[0].endpoint.method, HttpMethod::PUT);
        assert_eq!(
            parsed.targets[0].endpoint.auth,
            Auth::ApiKey {
                header: "X-Api-Key".to_owned(),
                value: "k".to_owned()
            }
        );
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        assert!(matches!(
            parse_targets(r#"{"targets": 3}"#),
            Err(TargetError::UnexpectedShape)
        ));
        assert!(matches!(
            parse_targets("not json"),
            Err(TargetError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_http_method_from_str() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::GET);
        assert!(matches!(
            "TRACE".parse::<HttpMethod>(),
            Err(TargetError::ParseHttpMethodError(m)) if m == "TRACE"
        ));
    }
}
