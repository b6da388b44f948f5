//! Dials and authenticates a single SSH session, grounded on the teacher's
//! `ssh_connect`/auth-timeout pattern: wrap connect and auth each in their own
//! timeout so a hung TCP handshake or a stalled auth exchange cannot wedge the pool.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::load_secret_key;

use crate::error::Error;
use crate::options::SshOptions;

use super::handler::XecSshHandler;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn connect(options: &SshOptions) -> Result<Handle<XecSshHandler>, Error> {
    let config = Arc::new(client::Config::default());
    let handler = XecSshHandler {
        strict_host_key_checking: options.strict_host_key_checking,
    };

    let mut session = tokio::time::timeout(
        CONNECT_TIMEOUT,
        client::connect(config, (options.host.as_str(), options.port), handler),
    )
    .await
    .map_err(|_| Error::Connection {
        host: options.host.clone(),
        cause: "connect timed out".to_string(),
        source: None,
    })?
    .map_err(|err| Error::Connection {
        host: options.host.clone(),
        cause: err.to_string(),
        source: Some(Box::new(err)),
    })?;

    tokio::time::timeout(AUTH_TIMEOUT, authenticate(&mut session, options))
        .await
        .map_err(|_| Error::Connection {
            host: options.host.clone(),
            cause: "authentication timed out".to_string(),
            source: None,
        })??;

    Ok(session)
}

async fn authenticate(
    session: &mut Handle<XecSshHandler>,
    options: &SshOptions,
) -> Result<(), Error> {
    if let Some(identity_file) = &options.identity_file {
        let key_pair = load_secret_key(identity_file, options.password.as_deref())
            .map_err(|err| Error::Connection {
                host: options.host.clone(),
                cause: format!("failed to load identity file: {err}"),
                source: None,
            })?;
        let auth = session
            .authenticate_publickey(
                &options.user,
                russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), None),
            )
            .await
            .map_err(|err| Error::Connection {
                host: options.host.clone(),
                cause: err.to_string(),
                source: Some(Box::new(err)),
            })?;
        if !auth.success() {
            return Err(Error::Connection {
                host: options.host.clone(),
                cause: "public key authentication rejected".to_string(),
                source: None,
            });
        }
        return Ok(());
    }

    if let Some(password) = &options.password {
        let auth = session
            .authenticate_password(&options.user, password)
            .await
            .map_err(|err| Error::Connection {
                host: options.host.clone(),
                cause: err.to_string(),
                source: Some(Box::new(err)),
            })?;
        if !auth.success() {
            return Err(Error::Connection {
                host: options.host.clone(),
                cause: "password authentication rejected".to_string(),
                source: None,
            });
        }
        return Ok(());
    }

    Err(Error::Connection {
        host: options.host.clone(),
        cause: "no identity_file or password configured".to_string(),
        source: None,
    })
}
