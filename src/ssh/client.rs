//! russh-backed collaborators: the production [`Authenticator`],
//! session and channel implementations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use russh::client::{self, Config};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::config::PoolSettings;
use crate::error::PoolError;

use super::key::SessionKey;
use super::remote::{Authenticator, CommandChannel, RemoteSession, SharedBuffer};

/// Client-side handler: host key pinning against the fingerprint carried
/// by the [`SessionKey`], no interactive verification.
pub struct ClientHandler {
    host: String,
    port: u16,
    trusted_fingerprint: Option<String>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, trusted_fingerprint: Option<String>) -> Self {
        Self {
            host,
            port,
            trusted_fingerprint,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = PoolError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let presented = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let trusted = self.trusted_fingerprint.clone();
        let host = self.host.clone();
        let port = self.port;

        async move {
            match trusted {
                Some(expected) if expected == presented => {
                    tracing::debug!("host key verified for {}:{}", host, port);
                    Ok(true)
                }
                Some(expected) => {
                    tracing::warn!(
                        "host key mismatch for {}:{}: expected {}, got {}",
                        host,
                        port,
                        expected,
                        presented
                    );
                    Err(PoolError::HostKeyVerification(format!(
                        "host key mismatch for {host}:{port}: expected {expected}, got {presented}"
                    )))
                }
                None => {
                    // No pinned fingerprint for this target; trust on first use.
                    tracing::debug!(
                        "no pinned host key for {}:{}, accepting {}",
                        host,
                        port,
                        presented
                    );
                    Ok(true)
                }
            }
        }
    }
}

/// Establishes authenticated russh sessions.
pub struct RusshAuthenticator {
    config: Arc<Config>,
}

impl RusshAuthenticator {
    pub fn new(settings: &PoolSettings) -> Self {
        // Treat 0 as "no keepalive" to avoid immediate timeout
        let keepalive = if settings.keepalive_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(settings.keepalive_interval_secs))
        };

        let config = Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval: keepalive,
            keepalive_max: 3,
            ..Default::default()
        };

        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for RusshAuthenticator {
    fn default() -> Self {
        Self::new(&PoolSettings::default())
    }
}

impl Authenticator for RusshAuthenticator {
    type Session = RusshSession;

    async fn create_session(&self, key: &SessionKey) -> Result<RusshSession, PoolError> {
        let addr = format!("{}:{}", key.host(), key.port());
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| PoolError::ConnectionFailed {
                host: key.host().to_string(),
                port: key.port(),
                reason: e.to_string(),
            })?;

        let handler = ClientHandler::new(
            key.host().to_string(),
            key.port(),
            key.host_fingerprint().map(str::to_string),
        );

        let mut handle = client::connect_stream(self.config.clone(), stream, handler)
            .await
            .map_err(|e| match e {
                PoolError::HostKeyVerification(reason) => PoolError::HostKeyVerification(reason),
                other => PoolError::ConnectionFailed {
                    host: key.host().to_string(),
                    port: key.port(),
                    reason: other.to_string(),
                },
            })?;

        authenticate(&mut handle, key).await?;

        tracing::debug!("authenticated {}@{}", key.user(), addr);
        Ok(RusshSession { handle })
    }
}

async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    key: &SessionKey,
) -> Result<(), PoolError> {
    let auth_result = if let Some(password) = key.password() {
        // Expose the secret only at the point of authentication
        handle
            .authenticate_password(key.user(), password.expose_secret())
            .await
            .map_err(|e| PoolError::AuthenticationFailed(e.to_string()))?
    } else if let Some(pem) = key.private_key() {
        let pem = String::from_utf8(pem).map_err(|e| {
            PoolError::AuthenticationFailed(format!("private key is not valid UTF-8: {e}"))
        })?;
        let secret_key = russh::keys::decode_secret_key(&pem, None).map_err(|e| {
            PoolError::AuthenticationFailed(format!("cannot decode private key: {e}"))
        })?;

        // Only use SHA-512 hash algorithm for RSA keys
        let hash_alg = if secret_key.algorithm().is_rsa() {
            Some(HashAlg::Sha512)
        } else {
            None
        };
        let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(secret_key), hash_alg);

        handle
            .authenticate_publickey(key.user(), key_with_alg)
            .await
            .map_err(|e| PoolError::AuthenticationFailed(e.to_string()))?
    } else {
        return Err(PoolError::AuthenticationFailed(
            "session key carries neither a password nor a private key".to_string(),
        ));
    };

    if !auth_result.success() {
        return Err(PoolError::AuthenticationFailed(
            "rejected by server".to_string(),
        ));
    }
    Ok(())
}

/// A live russh connection.
pub struct RusshSession {
    handle: client::Handle<ClientHandler>,
}

impl std::fmt::Debug for RusshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshSession")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RemoteSession for RusshSession {
    type Channel = RusshChannel;

    fn is_connected(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn open_channel(&self) -> Result<RusshChannel, PoolError> {
        let channel = self.handle.channel_open_session().await?;
        Ok(RusshChannel::new(channel))
    }

    async fn disconnect(&self) -> Result<(), PoolError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
            .map_err(|e| PoolError::Channel(e.to_string()))
    }
}

/// One exec channel. After `start`, a spawned pump task owns the russh
/// channel and drains its messages into the shared buffers.
pub struct RusshChannel {
    channel: Option<russh::Channel<client::Msg>>,
    closed: Arc<AtomicBool>,
    exit_status: Arc<Mutex<Option<u32>>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl RusshChannel {
    fn new(channel: russh::Channel<client::Msg>) -> Self {
        Self {
            channel: Some(channel),
            closed: Arc::new(AtomicBool::new(false)),
            exit_status: Arc::new(Mutex::new(None)),
            stop_tx: None,
        }
    }
}

impl CommandChannel for RusshChannel {
    async fn start(
        &mut self,
        command: &str,
        input: Vec<u8>,
        output: SharedBuffer,
        error: SharedBuffer,
    ) -> Result<(), PoolError> {
        let mut channel = self
            .channel
            .take()
            .ok_or_else(|| PoolError::Channel("channel already started".to_string()))?;

        channel.exec(true, command).await?;

        if !input.is_empty() {
            channel
                .data(&input[..])
                .await
                .map_err(|e| PoolError::Channel(format!("failed to send input: {e}")))?;
        }
        channel
            .eof()
            .await
            .map_err(|e| PoolError::Channel(format!("failed to close input: {e}")))?;

        let closed = self.closed.clone();
        let exit_status = self.exit_status.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            output.lock().extend_from_slice(&data);
                        }
                        Some(ChannelMsg::ExtendedData { data, .. }) => {
                            error.lock().extend_from_slice(&data);
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                            *exit_status.lock() = Some(status);
                        }
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
        });

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn exit_status(&self) -> Option<u32> {
        *self.exit_status.lock()
    }

    async fn disconnect(&mut self) -> Result<(), PoolError> {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
