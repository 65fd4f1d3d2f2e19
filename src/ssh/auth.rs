//! Authentication method selection for a connection descriptor.

use std::sync::Arc;

use russh::client::Handle;
use russh_keys::PrivateKey;

use crate::error::{FleetError, Result};
use crate::ssh::client::ClientHandler;
use crate::ssh::config::ConnInfo;

/// A credential offered to the server during the handshake.
#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    PublicKey(Arc<PrivateKey>),
}

impl AuthMethod {
    fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey(_) => "publickey",
        }
    }
}

/// Build the ordered set of auth methods a descriptor can offer.
///
/// A private key that fails to decode is skipped, not fatal. An empty
/// set is an error.
pub fn auth_methods(info: &ConnInfo) -> Result<Vec<AuthMethod>> {
    let mut methods = Vec::new();

    if !info.password.is_empty() {
        methods.push(AuthMethod::Password(info.password.clone()));
    }

    if let Some(raw) = info.private_key.as_deref().filter(|k| !k.is_empty()) {
        match parse_private_key(raw) {
            Ok(key) => methods.push(AuthMethod::PublicKey(Arc::new(key))),
            Err(e) => tracing::debug!("Skipping private key for {}: {}", info.addr, e),
        }
    }

    if methods.is_empty() {
        return Err(FleetError::NoAuthMethod);
    }

    Ok(methods)
}

fn parse_private_key(raw: &[u8]) -> Result<PrivateKey> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| FleetError::Connect(format!("private key is not valid text: {}", e)))?;

    russh_keys::decode_secret_key(text, None)
        .map_err(|e| FleetError::Connect(format!("failed to decode private key: {}", e)))
}

/// Offer each method in turn until the server accepts one.
pub async fn authenticate(
    session: &mut Handle<ClientHandler>,
    user: &str,
    methods: &[AuthMethod],
) -> Result<()> {
    for method in methods {
        let accepted = match method {
            AuthMethod::Password(password) => {
                session.authenticate_password(user, password).await
            }
            AuthMethod::PublicKey(key) => session.authenticate_publickey(user, key.clone()).await,
        }
        .map_err(|e| FleetError::Connect(format!("{} auth failed: {}", method.name(), e)))?;

        if accepted {
            tracing::debug!("Authenticated {} via {}", user, method.name());
            return Ok(());
        }

        tracing::debug!("Server rejected {} auth for {}", method.name(), user);
    }

    Err(FleetError::Connect(format!(
        "authentication failed for {}",
        user
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openssh_key() -> Arc<[u8]> {
        use ssh_key::{Algorithm, LineEnding};

        let key = ssh_key::PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
        let openssh = key.to_openssh(LineEnding::LF).unwrap();
        Arc::from(openssh.as_bytes())
    }

    #[test]
    fn test_password_and_key_both_offered() {
        let info = ConnInfo::new("addr", "user")
            .with_password("pwd")
            .with_private_key(openssh_key());

        let methods = auth_methods(&info).unwrap();

        assert_eq!(methods.len(), 2);
        assert!(matches!(methods[0], AuthMethod::Password(ref p) if p == "pwd"));
        assert!(matches!(methods[1], AuthMethod::PublicKey(_)));
    }

    #[test]
    fn test_key_only() {
        let info = ConnInfo::new("addr", "user").with_private_key(openssh_key());

        let methods = auth_methods(&info).unwrap();

        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].name(), "publickey");
    }

    #[test]
    fn test_unparseable_key_is_skipped() {
        let info = ConnInfo::new("addr", "user")
            .with_password("pwd")
            .with_private_key(Arc::from(&b"not a key"[..]));

        let methods = auth_methods(&info).unwrap();

        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].name(), "password");
    }

    #[test]
    fn test_no_auth_method() {
        let info = ConnInfo::new("addr", "user").with_private_key(Arc::from(&b""[..]));

        let err = auth_methods(&info).err().unwrap();

        assert!(matches!(err, FleetError::NoAuthMethod));
        assert_eq!(err.to_string(), "no auth info provided");
    }
}
