//! Client options from environment variables.

use std::collections::HashMap;
use std::env::{self, VarError};
use std::path::PathBuf;

use broker::{BrokerError, BrokerResult};

use crate::options::{ClientOptions, SecurityMode};

pub const ENV_NATS_URL: &str = "NATS_URL";
pub const ENV_NATS_CREDS: &str = "NATS_CREDS";
pub const ENV_NATS_NKEY: &str = "NATS_NKEY";
pub const ENV_NATS_USER: &str = "NATS_USER";
pub const ENV_NATS_PASSWORD: &str = "NATS_PASSWORD";
pub const ENV_NATS_TOKEN: &str = "NATS_TOKEN";
pub const ENV_NATS_CONNECT_TIMEOUT_MS: &str = "NATS_CONNECT_TIMEOUT_MS";

/// Source of environment variables.
pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, VarError>;
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, VarError> {
        env::var(key)
    }
}

/// Fixed set of variables, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapEnv(pub HashMap<String, String>);

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl ReadEnv for MapEnv {
    fn var(&self, key: &str) -> Result<String, VarError> {
        self.0.get(key).cloned().ok_or(VarError::NotPresent)
    }
}

impl ClientOptions {
    /// Build client options from `NATS_*` variables.
    ///
    /// `NATS_URL` may list several servers separated by commas. Credentials
    /// are picked in order: creds file, nkey seed, user and password, token.
    pub fn from_env<E: ReadEnv>(env: &E) -> BrokerResult<Self> {
        let mut options = ClientOptions {
            servers: env
                .var(ENV_NATS_URL)
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_owned())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            ..ClientOptions::default()
        };

        if let Ok(creds) = env.var(ENV_NATS_CREDS) {
            options.security_mode = SecurityMode::CredsFile;
            options.creds_file_path = Some(PathBuf::from(creds));
        } else if let Ok(seed) = env.var(ENV_NATS_NKEY) {
            options.security_mode = SecurityMode::Nkey;
            options.nkey_seed = Some(seed);
        } else if let (Ok(user), Ok(password)) =
            (env.var(ENV_NATS_USER), env.var(ENV_NATS_PASSWORD))
        {
            options.security_mode = SecurityMode::UserPassword;
            options.username = Some(user);
            options.password = Some(password);
        } else if let Ok(token) = env.var(ENV_NATS_TOKEN) {
            options.security_mode = SecurityMode::Token;
            options.token = Some(token);
        }

        if let Ok(raw) = env.var(ENV_NATS_CONNECT_TIMEOUT_MS) {
            let ms = raw.trim().parse::<u64>().map_err(|e| {
                BrokerError::Config(format!(
                    "error parsing env var {ENV_NATS_CONNECT_TIMEOUT_MS}: {e}"
                ))
            })?;
            options.connect_timeout_ms = Some(ms);
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_empty_env_gives_defaults() {
        let options = ClientOptions::from_env(&MapEnv::new()).unwrap();
        assert_eq!(options, ClientOptions::default());
    }

    #[test]
    fn test_comma_separated_servers() {
        let env = MapEnv::new().with(ENV_NATS_URL, "host1:4222 , ,host2:4222");
        let options = ClientOptions::from_env(&env).unwrap();
        assert_eq!(options.servers, vec!["host1:4222", "host2:4222"]);
    }

    #[test]
    fn test_credential_priority() {
        let env = MapEnv::new()
            .with(ENV_NATS_CREDS, "/etc/nats/app.creds")
            .with(ENV_NATS_NKEY, "SUAM")
            .with(ENV_NATS_TOKEN, "t");
        let options = ClientOptions::from_env(&env).unwrap();
        assert_eq!(options.security_mode, SecurityMode::CredsFile);
        assert_eq!(
            options.creds_file_path,
            Some(PathBuf::from("/etc/nats/app.creds"))
        );

        let env = MapEnv::new()
            .with(ENV_NATS_USER, "app")
            .with(ENV_NATS_TOKEN, "t");
        let options = ClientOptions::from_env(&env).unwrap();
        assert_eq!(options.security_mode, SecurityMode::Token);

        let env = MapEnv::new()
            .with(ENV_NATS_USER, "app")
            .with(ENV_NATS_PASSWORD, "secret")
            .with(ENV_NATS_TOKEN, "t");
        let options = ClientOptions::from_env(&env).unwrap();
        assert_eq!(options.security_mode, SecurityMode::UserPassword);
        assert_eq!(options.username.as_deref(), Some("app"));
    }

    #[test]
    fn test_connect_timeout() {
        let env = MapEnv::new().with(ENV_NATS_CONNECT_TIMEOUT_MS, "750");
        let options = ClientOptions::from_env(&env).unwrap();
        assert_eq!(options.connect_timeout(), Duration::from_millis(750));

        let env = MapEnv::new().with(ENV_NATS_CONNECT_TIMEOUT_MS, "soon");
        let err = ClientOptions::from_env(&env).unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[test]
    fn test_system_env_delegation() {
        let system = SystemEnv.var("NATS_BROKER_TEST_UNSET_VAR");
        assert_eq!(system, Err(VarError::NotPresent));
    }
}
