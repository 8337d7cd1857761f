use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time;

use analytics_core::error::ValidationError;
use analytics_core::pipeline::PipelineOptions;
use analytics_core::retry::RetryPolicy;
use envconfig::Envconfig;
use url::Url;

use crate::http_client::HttpClient;

pub const DEFAULT_HOST: &str = "https://api.segment.io";
pub const DEFAULT_PATH: &str = "/v1/batch";
pub const DEFAULT_FLUSH_AT: usize = 15;

/// Settings read from the environment. See `Settings` for what each one does.
#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "ANALYTICS_WRITE_KEY")]
    pub write_key: NonEmptyString,

    #[envconfig(from = "ANALYTICS_HOST", default = "https://api.segment.io")]
    pub host: String,

    #[envconfig(from = "ANALYTICS_PATH", default = "/v1/batch")]
    pub path: String,

    #[envconfig(from = "ANALYTICS_MAX_RETRIES", default = "3")]
    pub max_retries: u32,

    #[envconfig(from = "ANALYTICS_FLUSH_AT")]
    pub flush_at: Option<usize>,

    #[envconfig(from = "ANALYTICS_MAX_EVENTS_IN_BATCH")]
    pub max_events_in_batch: Option<usize>,

    #[envconfig(from = "ANALYTICS_FLUSH_INTERVAL", default = "10000")]
    pub flush_interval: EnvMsDuration,

    #[envconfig(from = "ANALYTICS_HTTP_REQUEST_TIMEOUT", default = "10000")]
    pub http_request_timeout: EnvMsDuration,

    #[envconfig(from = "ANALYTICS_DISABLE", default = "false")]
    pub disable: bool,

    #[envconfig(from = "ANALYTICS_MAX_IN_FLIGHT", default = "4")]
    pub max_in_flight: usize,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
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

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "ANALYTICS_RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "ANALYTICS_RETRY_INITIAL_INTERVAL", default = "25")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "ANALYTICS_RETRY_MAXIMUM_INTERVAL", default = "1000")]
    pub maximum_interval: EnvMsDuration,
}

impl From<RetryPolicyConfig> for RetryPolicy {
    fn from(config: RetryPolicyConfig) -> Self {
        RetryPolicy::build(config.backoff_coefficient, config.initial_interval.0)
            .maximum_interval(config.maximum_interval.0)
            .provide()
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
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Everything an `Analytics` client needs to run.
#[derive(Clone)]
pub struct Settings {
    /// Key identifying the source. Sent as the basic auth username of every batch.
    pub write_key: String,
    pub host: String,
    pub path: String,
    /// Attempts made for a batch before its events are failed.
    pub max_retries: u32,
    /// Number of pending events that triggers a flush, and the maximum number of events per
    /// batch.
    pub flush_at: Option<usize>,
    /// Deprecated alias of `flush_at`. Ignored when `flush_at` is set.
    pub max_events_in_batch: Option<usize>,
    /// Maximum time the oldest pending event waits before a flush.
    pub flush_interval: time::Duration,
    pub http_request_timeout: time::Duration,
    /// Validate and settle events without running plugins or making network calls.
    pub disable: bool,
    /// Maximum number of batch requests in flight at once.
    pub max_in_flight: usize,
    pub retry_policy: RetryPolicy,
    pub pipeline: PipelineOptions,
    /// Transport override. Defaults to a `reqwest` client.
    pub http_client: Option<Arc<dyn HttpClient>>,
}

impl Settings {
    pub fn new(write_key: &str) -> Self {
        Self {
            write_key: write_key.to_owned(),
            host: DEFAULT_HOST.to_owned(),
            path: DEFAULT_PATH.to_owned(),
            max_retries: 3,
            flush_at: None,
            max_events_in_batch: None,
            flush_interval: time::Duration::from_millis(10_000),
            http_request_timeout: time::Duration::from_millis(10_000),
            disable: false,
            max_in_flight: 4,
            retry_policy: RetryPolicy::default(),
            pipeline: PipelineOptions::default(),
            http_client: None,
        }
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_owned();
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = path.to_owned();
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn flush_at(mut self, flush_at: usize) -> Self {
        self.flush_at = Some(flush_at);
        self
    }

    pub fn max_events_in_batch(mut self, max_events_in_batch: usize) -> Self {
        self.max_events_in_batch = Some(max_events_in_batch);
        self
    }

    pub fn flush_interval(mut self, flush_interval: time::Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn http_request_timeout(mut self, timeout: time::Duration) -> Self {
        self.http_request_timeout = timeout;
        self
    }

    pub fn disable(mut self, disable: bool) -> Self {
        self.disable = disable;
        self
    }

    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn pipeline(mut self, pipeline: PipelineOptions) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn http_client(mut self, http_client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(http_client);
        self
    }

    /// The effective batch size: `flush_at`, then `max_events_in_batch`, then the default.
    pub fn batch_size(&self) -> usize {
        self.flush_at
            .or(self.max_events_in_batch)
            .unwrap_or(DEFAULT_FLUSH_AT)
    }

    /// The URL batches are posted to.
    pub fn endpoint(&self) -> Result<Url, ValidationError> {
        let host = self.host.trim_end_matches('/');
        let path = self.path.trim_start_matches('/');

        Url::parse(&format!("{}/{}", host, path))
            .map_err(|e| ValidationError::new("host", &format!("invalid endpoint: {}", e)))
    }

    /// How long `close_and_flush` waits for pending events before discarding them.
    pub fn close_timeout(&self) -> time::Duration {
        self.flush_interval.mul_f64(1.25)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.write_key.trim().is_empty() {
            return Err(ValidationError::new("writeKey", "writeKey is required"));
        }
        if self.batch_size() == 0 {
            return Err(ValidationError::new(
                "flushAt",
                "flushAt must be greater than 0",
            ));
        }
        if self.max_in_flight == 0 {
            return Err(ValidationError::new(
                "maxInFlight",
                "maxInFlight must be greater than 0",
            ));
        }
        self.endpoint()?;

        Ok(())
    }
}

impl From<Config> for Settings {
    fn from(config: Config) -> Self {
        Self {
            write_key: config.write_key.0,
            host: config.host,
            path: config.path,
            max_retries: config.max_retries,
            flush_at: config.flush_at,
            max_events_in_batch: config.max_events_in_batch,
            flush_interval: config.flush_interval.0,
            http_request_timeout: config.http_request_timeout.0,
            disable: config.disable,
            max_in_flight: config.max_in_flight,
            retry_policy: config.retry_policy.into(),
            pipeline: PipelineOptions::default(),
            http_client: None,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("write_key", &"<redacted>")
            .field("host", &self.host)
            .field("path", &self.path)
            .field("max_retries", &self.max_retries)
            .field("flush_at", &self.flush_at)
            .field("max_events_in_batch", &self.max_events_in_batch)
            .field("flush_interval", &self.flush_interval)
            .field("http_request_timeout", &self.http_request_timeout)
            .field("disable", &self.disable)
            .field("max_in_flight", &self.max_in_flight)
            .field("retry_policy", &self.retry_policy)
            .field("pipeline", &self.pipeline)
            .field("http_client", &self.http_client.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_ingestion_api() {
        let settings = Settings::new("some-key");

        assert_eq!(settings.batch_size(), 15);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.flush_interval, time::Duration::from_secs(10));
        assert_eq!(settings.http_request_timeout, time::Duration::from_secs(10));
        assert_eq!(
            settings.endpoint().unwrap().as_str(),
            "https://api.segment.io/v1/batch"
        );
        assert_eq!(settings.close_timeout(), time::Duration::from_millis(12_500));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn flush_at_wins_over_the_deprecated_alias() {
        let settings = Settings::new("some-key").max_events_in_batch(5);
        assert_eq!(settings.batch_size(), 5);

        let settings = settings.flush_at(2);
        assert_eq!(settings.batch_size(), 2);
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let err = Settings::new("  ").validate().unwrap_err();
        assert_eq!(err.field, "writeKey");

        let err = Settings::new("key").flush_at(0).validate().unwrap_err();
        assert_eq!(err.field, "flushAt");

        let err = Settings::new("key").max_in_flight(0).validate().unwrap_err();
        assert_eq!(err.field, "maxInFlight");

        let err = Settings::new("key").host("not a url").validate().unwrap_err();
        assert_eq!(err.field, "host");
    }

    #[test]
    fn endpoint_joins_host_and_path() {
        let settings = Settings::new("key")
            .host("http://localhost:3000/proxy/")
            .path("v1/b");

        assert_eq!(
            settings.endpoint().unwrap().as_str(),
            "http://localhost:3000/proxy/v1/b"
        );
    }

    #[test]
    fn debug_output_redacts_the_write_key() {
        let rendered = format!("{:?}", Settings::new("super-secret"));

        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn config_reads_the_environment() {
        let env = HashMap::from([
            ("ANALYTICS_WRITE_KEY".to_owned(), "some-key".to_owned()),
            ("ANALYTICS_MAX_EVENTS_IN_BATCH".to_owned(), "7".to_owned()),
            ("ANALYTICS_FLUSH_INTERVAL".to_owned(), "500".to_owned()),
        ]);
        let settings: Settings = Config::init_from_hashmap(&env).unwrap().into();

        assert_eq!(settings.write_key, "some-key");
        assert_eq!(settings.batch_size(), 7);
        assert_eq!(settings.flush_interval, time::Duration::from_millis(500));
        assert_eq!(settings.max_in_flight, 4);
        assert_eq!(
            settings.retry_policy.maximum_interval,
            Some(time::Duration::from_secs(1))
        );
    }

    #[test]
    fn config_requires_a_write_key() {
        let env = HashMap::from([("ANALYTICS_WRITE_KEY".to_owned(), "".to_owned())]);

        assert!(Config::init_from_hashmap(&env).is_err());
        assert!(Config::init_from_hashmap(&HashMap::new()).is_err());
    }
}
