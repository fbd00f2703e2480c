//! NATS-specific options.
//!
//! [`NatsOptions`] carries what the generic [`broker::BrokerOptions`] cannot
//! express: raw client settings, drain-on-disconnect and the JetStream stream
//! definition. Everything deserializes from YAML or JSON so it can live in a
//! config file next to the rest of the application settings.

use std::path::PathBuf;
use std::time::Duration;

use async_nats::jetstream;
use broker::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};

/// Address used when neither the broker nor the client options name one.
pub const DEFAULT_ADDRESS: &str = "nats://127.0.0.1:4222";

/// Default upper bound on a graceful drain, the NATS client default.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connection timeout if not configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Authentication mode used when connecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    None,
    UserPassword,
    Token,
    Nkey,
    /// Client certificate authentication.
    Tls,
    CredsFile,
}

/// Raw client settings.
///
/// When supplied they replace the client defaults wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Used when the broker options carry no address.
    pub servers: Vec<String>,
    /// Connection name reported to the server.
    pub name: Option<String>,
    pub security_mode: SecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    /// Seed given inline. Takes precedence over `nkey_seed_path`.
    pub nkey_seed: Option<String>,
    pub nkey_seed_path: Option<PathBuf>,
    pub creds_file_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub require_tls: bool,
    pub connect_timeout_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    /// `None` keeps reconnecting forever.
    pub max_reconnects: Option<usize>,
}

impl ClientOptions {
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_ms.map(Duration::from_millis)
    }

    /// True when any TLS file is configured.
    pub fn has_tls_material(&self) -> bool {
        self.tls_ca_path.is_some() || self.tls_cert_path.is_some() || self.tls_key_path.is_some()
    }
}

/// How the stream retains messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    #[default]
    File,
    Memory,
}

/// JetStream stream definition. Its presence switches the broker into
/// JetStream mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: Retention,
    pub storage: Storage,
    pub max_age_ms: Option<u64>,
    pub max_messages: Option<i64>,
    pub max_bytes: Option<i64>,
    pub replicas: Option<usize>,
}

impl StreamConfig {
    pub fn new<I, S>(name: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_ms = Some(max_age.as_millis() as u64);
        self
    }

    /// Stream names may not be empty or contain whitespace, `.`, `*` or `>`,
    /// and a stream needs at least one subject.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.name.is_empty() {
            return Err(BrokerError::Config("stream name must not be empty".into()));
        }
        if self
            .name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
        {
            return Err(BrokerError::Config(format!(
                "invalid stream name '{}'",
                self.name
            )));
        }
        if self.subjects.iter().all(|s| s.trim().is_empty()) {
            return Err(BrokerError::Config(format!(
                "stream '{}' needs at least one subject",
                self.name
            )));
        }
        Ok(())
    }
}

impl From<&StreamConfig> for jetstream::stream::Config {
    fn from(config: &StreamConfig) -> Self {
        let mut stream = jetstream::stream::Config {
            name: config.name.clone(),
            subjects: config
                .subjects
                .iter()
                .filter(|s| !s.trim().is_empty())
                .cloned()
                .collect(),
            retention: match config.retention {
                Retention::Limits => jetstream::stream::RetentionPolicy::Limits,
                Retention::Interest => jetstream::stream::RetentionPolicy::Interest,
                Retention::WorkQueue => jetstream::stream::RetentionPolicy::WorkQueue,
            },
            storage: match config.storage {
                Storage::File => jetstream::stream::StorageType::File,
                Storage::Memory => jetstream::stream::StorageType::Memory,
            },
            ..Default::default()
        };
        if let Some(ms) = config.max_age_ms {
            stream.max_age = Duration::from_millis(ms);
        }
        if let Some(max) = config.max_messages {
            stream.max_messages = max;
        }
        if let Some(max) = config.max_bytes {
            stream.max_bytes = max;
        }
        if let Some(replicas) = config.replicas {
            stream.num_replicas = replicas;
        }
        stream
    }
}

/// Adapter-specific broker options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsOptions {
    pub client: Option<ClientOptions>,
    /// Drain subscriptions and flush the connection on disconnect.
    pub drain: bool,
    pub drain_timeout_ms: Option<u64>,
    pub stream: Option<StreamConfig>,
}

impl NatsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_options(mut self, client: ClientOptions) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_drain(mut self) -> Self {
        self.drain = true;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Shorthand for a limits-retention stream.
    pub fn with_jetstream<I, S>(self, name: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_stream(StreamConfig::new(name, subjects))
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn validate(&self) -> BrokerResult<()> {
        match &self.stream {
            Some(stream) => stream.validate(),
            None => Ok(()),
        }
    }
}

/// Drop empty entries, add the `nats://` scheme where none is given and fall
/// back to [`DEFAULT_ADDRESS`] when nothing is left.
pub fn normalize_addrs(addrs: &[String]) -> Vec<String> {
    let normalized: Vec<String> = addrs
        .iter()
        .map(|addr| addr.trim())
        .filter(|addr| !addr.is_empty())
        .map(|addr| {
            if addr.contains("://") {
                addr.to_owned()
            } else {
                format!("nats://{addr}")
            }
        })
        .collect();
    if normalized.is_empty() {
        vec![DEFAULT_ADDRESS.to_owned()]
    } else {
        normalized
    }
}
