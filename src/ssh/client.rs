//! SSH client implementation using russh.
//!
//! Provides connection management, direct or through one jump host.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use tokio::net::TcpStream;

use crate::error::{FleetError, Result};
use crate::ssh::auth::{auth_methods, authenticate, AuthMethod};
use crate::ssh::config::{ConnInfo, CONNECT_TIMEOUT};

/// The operations a worker needs from a connected host.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Run a command and return its combined output as log text.
    ///
    /// A remote command that fails is reported inside the returned text;
    /// only infrastructure failures come back as `Err`.
    async fn exec(&self, command: &str) -> Result<String>;

    /// Upload local files into a remote directory.
    async fn copy(&self, sources: &[PathBuf], dest_dir: &str) -> Result<()>;

    /// Tear down the connection.
    async fn close(&self) -> Result<()>;
}

/// Builds a live [`RemoteClient`] for a descriptor.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, info: &ConnInfo) -> Result<Box<dyn RemoteClient>>;
}

/// Connector backed by real SSH connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, info: &ConnInfo) -> Result<Box<dyn RemoteClient>> {
        let client = SshClient::connect(info).await?;
        Ok(Box::new(client))
    }
}

/// SSH client wrapper over russh.
pub struct SshClient {
    session: Handle<ClientHandler>,
    // Keeps the tunnel carrying `session` alive.
    jump: Option<Handle<ClientHandler>>,
    addr: String,
}

impl SshClient {
    /// Connect to a device, tunneling through its proxy if it has one.
    pub async fn connect(info: &ConnInfo) -> Result<Self> {
        let methods = auth_methods(info)?;

        match info.proxy.as_deref() {
            Some(proxy) => Self::connect_via_proxy(info, &methods, proxy).await,
            None => Self::connect_direct(info, &methods).await,
        }
    }

    /// Dial the device over plain TCP.
    async fn connect_direct(info: &ConnInfo, methods: &[AuthMethod]) -> Result<Self> {
        let session = dial(info, methods).await?;

        tracing::debug!("Connected to {}", info.addr);

        Ok(Self {
            session,
            jump: None,
            addr: info.addr.clone(),
        })
    }

    /// Dial the proxy, then run the device's handshake over a direct-tcpip
    /// channel opened on the proxy connection.
    async fn connect_via_proxy(
        info: &ConnInfo,
        methods: &[AuthMethod],
        proxy: &ConnInfo,
    ) -> Result<Self> {
        let proxy_methods = auth_methods(proxy)?;

        if proxy.proxy.is_some() {
            tracing::warn!(
                "Proxy {} has its own proxy configured; only one hop is supported, ignoring it",
                proxy.addr
            );
        }

        let jump = dial(proxy, &proxy_methods).await?;

        let (host, port) = info.host_port();
        let channel = jump
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                FleetError::Connect(format!(
                    "Failed to open tunnel to {} via {}: {}",
                    info.addr, proxy.addr, e
                ))
            })?;

        let session = tokio::time::timeout(
            CONNECT_TIMEOUT,
            handshake(channel.into_stream(), &info.user, methods),
        )
        .await
        .map_err(|_| FleetError::Connect(format!("Timed out connecting to {}", info.addr)))?
        .map_err(|e| connect_error(&info.addr, e))?;

        tracing::debug!("Connected to {} via {}", info.addr, proxy.addr);

        Ok(Self {
            session,
            jump: Some(jump),
            addr: info.addr.clone(),
        })
    }
}

/// TCP dial plus handshake, bounded by [`CONNECT_TIMEOUT`].
async fn dial(info: &ConnInfo, methods: &[AuthMethod]) -> Result<Handle<ClientHandler>> {
    let attempt = async {
        let (host, port) = info.host_port();
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| FleetError::Connect(format!("TCP connection failed: {}", e)))?;

        handshake(stream, &info.user, methods).await
    };

    tokio::time::timeout(CONNECT_TIMEOUT, attempt)
        .await
        .map_err(|_| FleetError::Connect(format!("Timed out connecting to {}", info.addr)))?
        .map_err(|e| connect_error(&info.addr, e))
}

async fn handshake<S>(
    stream: S,
    user: &str,
    methods: &[AuthMethod],
) -> Result<Handle<ClientHandler>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let russh_config = Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(std::time::Duration::from_secs(15)),
        keepalive_max: 4,
        ..Default::default()
    });

    let mut session = client::connect_stream(russh_config, stream, ClientHandler).await?;

    authenticate(&mut session, user, methods).await?;

    Ok(session)
}

fn connect_error(addr: &str, err: FleetError) -> FleetError {
    match err {
        FleetError::Connect(reason) => FleetError::Connect(format!("{}: {}", addr, reason)),
        other => FleetError::Connect(format!("{}: {}", addr, other)),
    }
}

#[async_trait]
impl RemoteClient for SshClient {
    async fn exec(&self, command: &str) -> Result<String> {
        crate::ssh::exec::exec_command(&self.session, command).await
    }

    async fn copy(&self, sources: &[PathBuf], dest_dir: &str) -> Result<()> {
        crate::ssh::scp::copy_files(&self.session, sources, dest_dir).await
    }

    async fn close(&self) -> Result<()> {
        let result = self
            .session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(FleetError::from);

        if let Some(jump) = &self.jump {
            if let Err(e) = jump.disconnect(Disconnect::ByApplication, "", "en").await {
                tracing::debug!("Failed to disconnect proxy for {}: {}", self.addr, e);
            }
        }

        result
    }
}

/// Client handler for russh connection callbacks.
///
/// Host key verification is disabled: every server key is accepted.
pub struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = FleetError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}
