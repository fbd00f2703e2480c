//! Connection options for `async-nats`.

use async_nats::ConnectOptions;
use broker::{BrokerError, BrokerOptions, BrokerResult};
use tracing::debug;

use crate::options::{ClientOptions, SecurityMode};

/// Build connect options from merged broker and client options.
///
/// Authentication comes from the client's security mode. TLS material comes
/// from the broker options, which already fall back to the client's files.
pub(crate) async fn build_connect_options(
    client: &ClientOptions,
    broker: &BrokerOptions,
) -> BrokerResult<ConnectOptions> {
    let mut opts = ConnectOptions::new();
    let tls = broker.tls.clone().unwrap_or_default();

    match client.security_mode {
        SecurityMode::None => {}
        SecurityMode::UserPassword => {
            let user = client.username.as_deref().ok_or_else(|| {
                BrokerError::Config("user_password security mode requires 'username'".into())
            })?;
            let pass = client.password.as_deref().ok_or_else(|| {
                BrokerError::Config("user_password security mode requires 'password'".into())
            })?;
            opts = opts.user_and_password(user.into(), pass.into());
        }
        SecurityMode::Token => {
            let token = client.token.as_deref().ok_or_else(|| {
                BrokerError::Config("token security mode requires 'token'".into())
            })?;
            opts = opts.token(token.into());
        }
        SecurityMode::Nkey => {
            let seed = match (&client.nkey_seed, &client.nkey_seed_path) {
                (Some(seed), _) => seed.clone(),
                (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                    BrokerError::Config(format!(
                        "failed to read nkey seed file '{}': {e}",
                        path.display()
                    ))
                })?,
                (None, None) => {
                    return Err(BrokerError::Config(
                        "nkey security mode requires 'nkey_seed' or 'nkey_seed_path'".into(),
                    ));
                }
            };
            opts = opts.nkey(seed.trim().to_string());
        }
        SecurityMode::Tls => {
            if tls.cert_path.is_none() {
                return Err(BrokerError::Config(
                    "tls security mode requires 'tls_cert_path'".into(),
                ));
            }
            if tls.key_path.is_none() {
                return Err(BrokerError::Config(
                    "tls security mode requires 'tls_key_path'".into(),
                ));
            }
        }
        SecurityMode::CredsFile => {
            let creds_path = client.creds_file_path.as_ref().ok_or_else(|| {
                BrokerError::Config("creds_file security mode requires 'creds_file_path'".into())
            })?;
            opts = opts.credentials_file(creds_path).await.map_err(|e| {
                BrokerError::Config(format!(
                    "failed to load credentials file '{}': {e}",
                    creds_path.display()
                ))
            })?;
        }
    }

    if let Some(ca_path) = &tls.ca_path {
        opts = opts.add_root_certificates(ca_path.clone());
    }
    if let (Some(cert_path), Some(key_path)) = (&tls.cert_path, &tls.key_path) {
        opts = opts.add_client_certificate(cert_path.clone(), key_path.clone());
    }
    let secure = broker.secure || broker.tls.is_some();
    if secure {
        opts = opts.require_tls(true);
    }

    if let Some(name) = &client.name {
        opts = opts.name(name);
    }
    if let Some(interval) = client.ping_interval() {
        opts = opts.ping_interval(interval);
    }
    opts = opts
        .connection_timeout(client.connect_timeout())
        .max_reconnects(client.max_reconnects);

    debug!(
        security_mode = ?client.security_mode,
        secure,
        "built nats connect options"
    );
    Ok(opts)
}
