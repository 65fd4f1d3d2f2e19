//! In-process SSH server for exercising the client end to end.
//!
//! Accepts password logins from a fixed list, runs `exec` requests through
//! `sh -c` with the channel wired to the child's stdio, and serves
//! `direct-tcpip` channels so it can act as a jump host.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct TestServer {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<String>>>,
    accept: JoinHandle<()>,
}

impl TestServer {
    /// Listen on an ephemeral loopback port, accepting any of `passwords`.
    pub async fn start(passwords: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = Arc::new(server::Config {
            keys: vec![host_key()],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });
        let accepted: Arc<Vec<String>> =
            Arc::new(passwords.iter().map(|p| p.to_string()).collect());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let shared = seen.clone();
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let handler = ServerHandler {
                    accepted: accepted.clone(),
                    seen: shared.clone(),
                    stdin: HashMap::new(),
                };
                let config = config.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, socket, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });

        Self { addr, seen, accept }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Every password offered so far, in order.
    pub fn seen_passwords(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

fn host_key() -> russh_keys::PrivateKey {
    russh_keys::PrivateKey::random(&mut rand::thread_rng(), russh_keys::Algorithm::Ed25519)
        .unwrap()
}

struct ServerHandler {
    accepted: Arc<Vec<String>>,
    seen: Arc<Mutex<Vec<String>>>,
    stdin: HashMap<ChannelId, mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl server::Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.seen.lock().unwrap().push(password.to_string());

        if self.accepted.iter().any(|p| p == password) {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        let (tx, rx) = mpsc::unbounded_channel();
        self.stdin.insert(channel, tx);

        session.channel_success(channel)?;
        tokio::spawn(run_command(command, channel, rx, session.handle()));
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(stdin) = self.stdin.get(&channel) {
            let _ = stdin.send(data.to_vec());
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender closes the child's stdin
        self.stdin.remove(&channel);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let target = format!("{}:{}", host_to_connect, port_to_connect);
        let Ok(mut upstream) = TcpStream::connect(&target).await else {
            return Ok(false);
        };

        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
        });
        Ok(true)
    }
}

async fn run_command(
    command: String,
    channel: ChannelId,
    mut stdin_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    handle: server::Handle,
) {
    let spawned = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(_) => {
            let _ = handle.exit_status_request(channel, 127).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            while let Some(chunk) = stdin_rx.recv().await {
                if stdin.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump(out, channel, None, handle.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump(err, channel, Some(1), handle.clone())));
    for pump in [stdout, stderr].into_iter().flatten() {
        let _ = pump.await;
    }

    let code = child
        .wait()
        .await
        .ok()
        .and_then(|status| status.code())
        .unwrap_or(255);

    let _ = handle.exit_status_request(channel, code as u32).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

async fn pump<R>(mut reader: R, channel: ChannelId, ext: Option<u32>, handle: server::Handle)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let data = CryptoVec::from_slice(&buf[..n]);
        let sent = match ext {
            Some(ext) => handle.extended_data(channel, ext, data).await,
            None => handle.data(channel, data).await,
        };
        if sent.is_err() {
            break;
        }
    }
}
