//! tracing configuration
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use nats_broker::ReadEnv;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{
        self,
        format::{Format, PrettyFields},
    },
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// env var holding the log format
pub const LOG_FORMAT_VAR: &str = "LOG_FORMAT";
/// env var holding the log filter, e.g. `info,nats_broker=debug`
pub const LOG_FILTER_VAR: &str = "NATS_TRANSPORT_LOG";

/// Output format of the log layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// unstructured single-line output
    #[default]
    Standard,
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "standard" => Ok(Self::Standard),
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => bail!("unknown log format {other:?}, expected standard, json or pretty"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// formatting to apply to logs
    pub format: LogFormat,
    /// `EnvFilter` directives
    pub filter: String,
}

impl Config {
    /// Read `LOG_FORMAT` and `NATS_TRANSPORT_LOG`, falling back to the
    /// standard format and `default_filter`.
    pub fn parse<E: ReadEnv>(env: &E, default_filter: &str) -> Result<Self> {
        let format = match env.var(LOG_FORMAT_VAR).ok() {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("failed to parse {LOG_FORMAT_VAR}"))?,
            None => LogFormat::default(),
        };
        let filter = env
            .var(LOG_FILTER_VAR)
            .ok()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| default_filter.to_owned());
        Ok(Self { format, filter })
    }

    /// Install the global subscriber. Fails if one is already set.
    pub fn init(&self) -> Result<()> {
        // an invalid filter falls back to info rather than failing startup
        let filter = EnvFilter::try_new(&self.filter).or_else(|_| EnvFilter::try_new("info"))?;

        let registry = tracing_subscriber::registry().with(filter);
        let installed = match self.format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .event_format(Format::default().pretty().with_source_location(false))
                        .fmt_fields(PrettyFields::new()),
                )
                .try_init(),
            LogFormat::Standard => registry.with(fmt::layer()).try_init(),
        };
        installed.context("failed to install tracing subscriber")
    }
}
