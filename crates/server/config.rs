//! Server configuration.

use std::str::FromStr;
use std::time::Duration;

use courier_core::{
    CourierError, MalformedPolicy, QueueMap, Result, RetryPolicy, RetryStrategy, WorkerConfig,
    DEFAULT_DRAIN_TIMEOUT, DEFAULT_JOB_TIMEOUT, DEFAULT_RETRY_HEADROOM,
};

/// Configuration for the courier worker server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Broker URI.
    pub amqp_uri: String,
    /// Wait between broker reconnect attempts.
    pub reconnect_delay: Duration,
    /// Queues to run a pool for.
    pub queues: Vec<String>,
    /// Concurrency limit per queue.
    pub concurrency: usize,
    /// Per-job execution timeout.
    pub job_timeout: Duration,
    /// Grace period for in-flight jobs on shutdown.
    pub drain_timeout: Duration,
    /// Retry and dead-letter behaviour.
    pub retry: RetryPolicy,
    /// Extra prefetch for deliveries held by timer retries.
    pub retry_headroom: usize,
    /// Handling of undecodable messages.
    pub malformed: MalformedPolicy,
    /// Handler program followed by its arguments, run once per job.
    pub handler: Vec<String>,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            amqp_uri: "amqp://localhost:5672/%2f".to_string(),
            reconnect_delay: Duration::from_secs(5),
            queues: QueueMap::defaults()
                .queues()
                .into_iter()
                .map(String::from)
                .collect(),
            concurrency: 1,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            retry: RetryPolicy::default(),
            retry_headroom: DEFAULT_RETRY_HEADROOM,
            malformed: MalformedPolicy::default(),
            handler: Vec::new(),
            log_json: false,
        }
    }
}

impl ServerConfig {
    /// Create a new builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Read `COURIER_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<L>(lookup: L) -> Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env { lookup };

        let retry = RetryPolicy {
            max_attempts: env.parse("COURIER_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            base_delay: Duration::from_millis(env.parse(
                "COURIER_RETRY_BASE_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?),
            dead_letter_queue: env.string("COURIER_DEAD_LETTER_QUEUE", &defaults.retry.dead_letter_queue),
            strategy: match env.get("COURIER_RETRY_STRATEGY").as_deref() {
                None | Some("broker") => RetryStrategy::BrokerDelay,
                Some("timer") => RetryStrategy::Timer,
                Some(other) => {
                    return Err(invalid("COURIER_RETRY_STRATEGY", other, "broker or timer"))
                }
            },
        };

        let malformed = match env.get("COURIER_MALFORMED").as_deref() {
            None | Some("dead-letter") => MalformedPolicy::DeadLetter,
            Some("drop") => MalformedPolicy::Drop,
            Some(other) => return Err(invalid("COURIER_MALFORMED", other, "dead-letter or drop")),
        };

        let queues = match env.get("COURIER_QUEUES") {
            Some(list) => split_list(&list),
            None => defaults.queues,
        };

        let config = Self {
            amqp_uri: env.string("COURIER_AMQP_URI", &defaults.amqp_uri),
            reconnect_delay: Duration::from_secs(env.parse(
                "COURIER_RECONNECT_DELAY_SECS",
                defaults.reconnect_delay.as_secs(),
            )?),
            queues,
            concurrency: env.parse("COURIER_CONCURRENCY", defaults.concurrency)?,
            job_timeout: Duration::from_secs(
                env.parse("COURIER_JOB_TIMEOUT_SECS", defaults.job_timeout.as_secs())?,
            ),
            drain_timeout: Duration::from_secs(
                env.parse("COURIER_DRAIN_TIMEOUT_SECS", defaults.drain_timeout.as_secs())?,
            ),
            retry,
            retry_headroom: env.parse("COURIER_RETRY_HEADROOM", defaults.retry_headroom)?,
            malformed,
            handler: env
                .get("COURIER_HANDLER")
                .map(|h| h.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            log_json: env.flag("COURIER_LOG_JSON", defaults.log_json),
        };
        Ok(config)
    }

    /// Check the settings the server cannot start without.
    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(CourierError::Config("No queues configured".to_string()));
        }
        if self.handler.is_empty() {
            return Err(CourierError::Config(
                "COURIER_HANDLER must name the handler program".to_string(),
            ));
        }
        for queue in &self.queues {
            self.worker_config(queue)?;
        }
        Ok(())
    }

    /// Pool configuration for one queue.
    pub fn worker_config(&self, queue: &str) -> Result<WorkerConfig> {
        WorkerConfig::builder()
            .queue(queue)
            .concurrency(self.concurrency)
            .job_timeout(self.job_timeout)
            .drain_timeout(self.drain_timeout)
            .retry(self.retry.clone())
            .retry_headroom(self.retry_headroom)
            .malformed(self.malformed)
            .build()
    }
}

struct Env<L> {
    lookup: L,
}

impl<L: Fn(&str) -> Option<String>> Env<L> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| CourierError::Config(format!("{}={:?}: {}", key, raw, e))),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"))
            .unwrap_or(default)
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn invalid(key: &str, value: &str, expected: &str) -> CourierError {
    CourierError::Config(format!("{}={:?}: expected {}", key, value, expected))
}

/// Builder for ServerConfig.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker URI.
    pub fn amqp_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.amqp_uri = uri.into();
        self
    }

    /// Set the queues to serve.
    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-queue concurrency limit.
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.config.concurrency = limit;
        self
    }

    /// Set the per-job timeout.
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    /// Set the shutdown drain timeout.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set the handler command line.
    pub fn handler<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.handler = command.into_iter().map(Into::into).collect();
        self
    }

    /// Build the ServerConfig.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.amqp_uri, "amqp://localhost:5672/%2f");
        assert_eq!(
            config.queues,
            vec!["email_sending", "image_processing", "reports_generation"]
        );
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.job_timeout, Duration::from_secs(300));
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert!(!config.log_json);
    }

    #[test]
    fn test_from_empty_env_uses_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.malformed, MalformedPolicy::DeadLetter);
        assert!(config.handler.is_empty());
    }

    #[test]
    fn test_from_env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("COURIER_AMQP_URI", "amqp://rabbit:5672/jobs"),
            ("COURIER_QUEUES", "email_sending, reports_generation ,"),
            ("COURIER_CONCURRENCY", "8"),
            ("COURIER_JOB_TIMEOUT_SECS", "60"),
            ("COURIER_DRAIN_TIMEOUT_SECS", "5"),
            ("COURIER_MAX_ATTEMPTS", "5"),
            ("COURIER_RETRY_BASE_MS", "250"),
            ("COURIER_RETRY_STRATEGY", "timer"),
            ("COURIER_RETRY_HEADROOM", "16"),
            ("COURIER_MALFORMED", "drop"),
            ("COURIER_HANDLER", "node handlers/index.js --strict"),
            ("COURIER_LOG_JSON", "true"),
        ]))
        .unwrap();

        assert_eq!(config.amqp_uri, "amqp://rabbit:5672/jobs");
        assert_eq!(config.queues, vec!["email_sending", "reports_generation"]);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.job_timeout, Duration::from_secs(60));
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.strategy, RetryStrategy::Timer);
        assert_eq!(config.retry_headroom, 16);
        assert_eq!(config.worker_config("email_sending").unwrap().prefetch(), 24);
        assert_eq!(config.malformed, MalformedPolicy::Drop);
        assert_eq!(config.handler, vec!["node", "handlers/index.js", "--strict"]);
        assert!(config.log_json);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = ServerConfig::from_lookup(lookup(&[("COURIER_CONCURRENCY", "lots")])).unwrap_err();
        assert!(matches!(err, CourierError::Config(_)));
        assert!(err.to_string().contains("COURIER_CONCURRENCY"));
    }

    #[test]
    fn test_invalid_strategy_is_config_error() {
        let err =
            ServerConfig::from_lookup(lookup(&[("COURIER_RETRY_STRATEGY", "never")])).unwrap_err();
        assert!(err.to_string().contains("broker or timer"));
    }

    #[test]
    fn test_validate_requires_handler() {
        let err = ServerConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("COURIER_HANDLER"));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = ServerConfig::builder()
            .handler(["./handler"])
            .concurrency(0)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_config_per_queue() {
        let config = ServerConfig::builder()
            .queues(["image_processing"])
            .concurrency(3)
            .job_timeout(Duration::from_secs(30))
            .handler(["./handler"])
            .build();
        let worker = config.worker_config("image_processing").unwrap();
        assert_eq!(worker.queue, "image_processing");
        assert_eq!(worker.concurrency, 3);
        assert_eq!(worker.job_timeout, Duration::from_secs(30));
        assert_eq!(worker.drain_timeout, Duration::from_secs(10));
    }
}
