//! SMTP server: accepts connections, drives one protocol session per
//! socket, and hands captured messages to the store.

mod smtp_protocol;

pub use smtp_protocol::{AnyStream, SmtpCommandResult, SmtpProtocol, SmtpState, MAX_LINE_LENGTH};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, trace};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::auth::CredentialVerifier;
use crate::config::Config;
use crate::storage::InMemory;

/// How long a session may sit idle between commands before it is closed
/// with a 421.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// The SMTP listener.
///
/// Holds everything a session needs: the shared store, the credential
/// verifier, the optional TLS acceptor for STARTTLS, the banner hostname,
/// and the process-wide shutdown channel.
pub struct Server {
    config: Config,
    store: Arc<InMemory>,
    verifier: Arc<dyn CredentialVerifier>,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    /// Creates the server, loading TLS material if configured.
    pub fn new(
        config: Config,
        store: Arc<InMemory>,
        verifier: Arc<dyn CredentialVerifier>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Self> {
        let tls_acceptor = match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => Some(
                create_tls_acceptor(cert, key)
                    .context("failed to load STARTTLS certificate")?,
            ),
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "TLS cert and key must be configured together or not at all"
                ))
            }
        };

        Ok(Server {
            config,
            store,
            verifier,
            tls_acceptor,
            shutdown,
        })
    }

    /// Runs the accept loop until the shutdown channel fires.
    ///
    /// Each accepted connection gets its own task; errors inside a session
    /// are logged and contained there, never propagated to the listener.
    ///
    /// # Errors
    ///
    /// Returns an `Err` only if binding the listen address fails.
    pub async fn run(&self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.config.smtp_bind_address, self.config.smtp_port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind SMTP listener to {}", addr))?;

        info!("SMTP server listening on {}", addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("New SMTP connection from {}", peer);
                        let store = Arc::clone(&self.store);
                        let verifier = Arc::clone(&self.verifier);
                        let tls_acceptor = self.tls_acceptor.clone();
                        let hostname = self.config.hostname.clone();
                        let session_shutdown = self.shutdown.subscribe();

                        tokio::spawn(async move {
                            let session = handle_connection(
                                stream,
                                peer,
                                store,
                                verifier,
                                tls_acceptor,
                                hostname,
                                session_shutdown,
                            );
                            if let Err(e) = session.await {
                                error!("SMTP session from {} failed: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting SMTP connection: {:?}", e);
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("SMTP listener stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Drives one SMTP session to completion.
///
/// Commands are processed strictly in order; the session ends on QUIT,
/// EOF, idle timeout, process shutdown, or an I/O error. A message is
/// confirmed to the client only after the store insert, so a 250 always
/// means the message is retrievable.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    store: Arc<InMemory>,
    verifier: Arc<dyn CredentialVerifier>,
    tls_acceptor: Option<TlsAcceptor>,
    hostname: String,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut protocol = SmtpProtocol::new(
        AnyStream::Plain(stream),
        hostname.clone(),
        Arc::clone(&verifier),
        tls_acceptor.is_some(),
        false,
    );
    protocol.send_greeting().await?;

    loop {
        trace!("SMTP({:?}): waiting for command", protocol.state());
        let line = tokio::select! {
            read = tokio::time::timeout(IDLE_TIMEOUT, protocol.read_line()) => match read {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    debug!("Connection from {} closed by client", peer);
                    break;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    protocol
                        .write_line(&format!("421 {} Idle timeout, closing connection", hostname))
                        .await?;
                    protocol.invalidate();
                    break;
                }
            },
            _ = shutdown.recv() => {
                protocol
                    .write_line(&format!("421 {} Service shutting down", hostname))
                    .await?;
                protocol.invalidate();
                break;
            }
        };

        match protocol.process_command(&line).await? {
            SmtpCommandResult::Continue => {}
            SmtpCommandResult::Quit => break,
            SmtpCommandResult::Received(message) => {
                let id = store.insert(*message).await;
                info!("Captured message {} from {}", id, peer);
                protocol
                    .write_line(&format!("250 Ok: queued as {}", id))
                    .await?;
            }
            SmtpCommandResult::StartTls => {
                let acceptor = tls_acceptor
                    .clone()
                    .ok_or_else(|| anyhow!("STARTTLS accepted without TLS configuration"))?;
                let AnyStream::Plain(tcp) = protocol.into_stream() else {
                    return Err(anyhow!("connection already upgraded to TLS"));
                };

                let tls_stream = acceptor
                    .accept(tcp)
                    .await
                    .context("TLS handshake failed")?;
                debug!("TLS established for {}", peer);

                // Per RFC 3207 the server stays silent after the upgrade;
                // the client restarts the conversation with a fresh EHLO.
                protocol = SmtpProtocol::new(
                    AnyStream::Tls(tls_stream),
                    hostname.clone(),
                    Arc::clone(&verifier),
                    true,
                    true,
                );
            }
        }
    }

    debug!("Closing connection from {}", peer);
    Ok(())
}

/// Builds a TLS acceptor from PEM certificate and key files.
fn create_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    use std::fs::File;
    use std::io::BufReader;

    let cert_file = File::open(cert_path)
        .with_context(|| format!("failed to open TLS certificate {}", cert_path))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("invalid TLS certificate")?;

    let key_file = File::open(key_path)
        .with_context(|| format!("failed to open TLS key {}", key_path))?;
    let mut key: Option<PrivateKeyDer<'static>> = None;
    for item in rustls_pemfile::read_all(&mut BufReader::new(key_file)) {
        match item.context("invalid TLS key")? {
            rustls_pemfile::Item::Pkcs1Key(k) => {
                key = Some(PrivateKeyDer::Pkcs1(k));
                break;
            }
            rustls_pemfile::Item::Pkcs8Key(k) => {
                key = Some(PrivateKeyDer::Pkcs8(k));
                break;
            }
            rustls_pemfile::Item::Sec1Key(k) => {
                key = Some(PrivateKeyDer::Sec1(k));
                break;
            }
            _ => {}
        }
    }
    let key = key.ok_or_else(|| anyhow!("no private key found in {}", key_path))?;

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to assemble TLS configuration")?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
