use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    /// Shared secret every notification's `clientState` must carry.
    pub client_state: NonEmptyString,

    #[envconfig(default = "config/targets.json")]
    pub targets_path: NonEmptyString,

    #[envconfig(default = "300000")]
    pub targets_cache_ttl: EnvMsDuration,

    #[envconfig(default = "300000")]
    pub dedup_ttl: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub dedup_sweep_interval: EnvMsDuration,

    #[envconfig(default = "25")]
    pub max_concurrent_deliveries: usize,

    #[envconfig(default = "3")]
    pub max_delivery_attempts: u32,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "1024")]
    pub queue_capacity: usize,

    #[envconfig(default = "4000000")]
    pub max_body_size: usize,

    #[envconfig(default = "1000")]
    pub max_concurrent_requests: usize,

    #[envconfig(nested = true)]
    pub graph: GraphConfig,

    #[envconfig(default = "text")]
    pub log_format: LogFormat,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "2000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub maximum_interval: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct GraphConfig {
    #[envconfig(from = "GRAPH_TENANT_ID")]
    pub tenant_id: NonEmptyString,

    #[envconfig(from = "GRAPH_CLIENT_ID")]
    pub client_id: NonEmptyString,

    #[envconfig(from = "GRAPH_CLIENT_SECRET")]
    pub client_secret: NonEmptyString,

    #[envconfig(from = "GRAPH_API_BASE_URL", default = "https://graph.microsoft.com/v1.0")]
    pub api_base_url: NonEmptyString,

    #[envconfig(from = "GRAPH_LOGIN_BASE_URL", default = "https://login.microsoftonline.com")]
    pub login_base_url: NonEmptyString,

    #[envconfig(from = "GRAPH_REQUEST_TIMEOUT", default = "30000")]
    pub request_timeout: EnvMsDuration,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ParseLogFormatError(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn required() -> HashMap<String, String> {
        HashMap::from([
            ("CLIENT_STATE".to_owned(), "s3cret".to_owned()),
            ("GRAPH_TENANT_ID".to_owned(), "tenant".to_owned()),
            ("GRAPH_CLIENT_ID".to_owned(), "client".to_owned()),
            ("GRAPH_CLIENT_SECRET".to_owned(), "secret".to_owned()),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&required()).expect("config should load");

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.client_state.as_str(), "s3cret");
        assert_eq!(config.max_concurrent_deliveries, 25);
        assert_eq!(config.max_delivery_attempts, 3);
        assert_eq!(config.dedup_ttl.0, time::Duration::from_secs(300));
        assert_eq!(
            config.retry_policy.initial_interval.0,
            time::Duration::from_secs(2)
        );
        assert_eq!(config.retry_policy.backoff_coefficient, 2);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(
            config.graph.api_base_url.as_str(),
            "https://graph.microsoft.com/v1.0"
        );
    }

    #[test]
    fn test_overrides() {
        let mut env = required();
        env.insert("LOG_FORMAT".to_owned(), "JSON".to_owned());
        env.insert("DEDUP_TTL".to_owned(), "1500".to_owned());
        env.insert("MAX_CONCURRENT_DELIVERIES".to_owned(), "4".to_owned());

        let config = Config::init_from_hashmap(&env).expect("config should load");

        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.dedup_ttl.0, time::Duration::from_millis(1500));
        assert_eq!(config.max_concurrent_deliveries, 4);
    }

    #[test]
    fn test_missing_client_state_is_rejected() {
        let mut env = required();
        env.remove("CLIENT_STATE");

        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn test_env_ms_duration() {
        assert_eq!(
            "250".parse::<EnvMsDuration>().unwrap().0,
            time::Duration::from_millis(250)
        );
        assert!("soon".parse::<EnvMsDuration>().is_err());
    }
}
