// Connection driver: one task owns the socket and multiplexes the
// outbound queue, inbound parsing, and control commands (StartTLS
// upgrade, SASL layer install, shutdown) over it. Single ownership is
// what lets StartTLS swap the plain TCP stream for a TLS stream in
// place, mid-connection.

use crate::dispatcher::RequestDispatcher;
use crate::error::{LdapError, Result};
use crate::framing::{FrameProcessor, SecurityContext};
use crate::protocol::ProtocolOp;
use crate::session;
use bytes::BytesMut;
use rustls_pki_types::ServerName;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE_DEPTH: usize = 32;
const READ_CHUNK: usize = 8192;

pub enum ConnStream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// Placeholder while the stream is being upgraded. Never polled.
    Detached,
}

impl ConnStream {
    fn detached_error() -> std::io::Error {
        std::io::Error::other("stream detached during upgrade")
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ConnStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ConnStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            ConnStream::Detached => Poll::Ready(Err(Self::detached_error())),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ConnStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ConnStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            ConnStream::Detached => Poll::Ready(Err(Self::detached_error())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ConnStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ConnStream::Tls(s) => Pin::new(s).poll_flush(cx),
            ConnStream::Detached => Poll::Ready(Err(Self::detached_error())),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ConnStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ConnStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            ConnStream::Detached => Poll::Ready(Err(Self::detached_error())),
        }
    }
}

enum DriverCommand {
    UpgradeTls {
        connector: TlsConnector,
        server_name: ServerName<'static>,
        done: oneshot::Sender<Result<()>>,
    },
    InstallSecurity {
        context: Box<dyn SecurityContext>,
        seal: bool,
        done: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the driver task. Cloneable; dropping every clone makes
/// the driver close the socket.
#[derive(Clone)]
pub struct Transport {
    outbound_tx: mpsc::Sender<Vec<u8>>,
    command_tx: mpsc::Sender<DriverCommand>,
}

impl Transport {
    /// Queue one encoded PDU for the wire. Applies backpressure when
    /// the driver's outbound queue is full.
    pub async fn send(&self, pdu: Vec<u8>) -> Result<()> {
        self.outbound_tx
            .send(pdu)
            .await
            .map_err(|_| LdapError::ConnectionClosed("driver task is gone".to_string()))
    }

    /// Swap the plain TCP stream for TLS. The caller must have drained
    /// all outstanding operations first (StartTLS quiescence).
    pub async fn upgrade_tls(
        &self,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        let (done, outcome) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::UpgradeTls {
                connector,
                server_name,
                done,
            })
            .await
            .map_err(|_| LdapError::ConnectionClosed("driver task is gone".to_string()))?;
        outcome
            .await
            .map_err(|_| LdapError::ConnectionClosed("driver task is gone".to_string()))?
    }

    /// Activate a negotiated SASL security layer for all subsequent
    /// traffic in both directions.
    pub async fn install_security(&self, context: Box<dyn SecurityContext>, seal: bool) -> Result<()> {
        let (done, outcome) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::InstallSecurity { context, seal, done })
            .await
            .map_err(|_| LdapError::ConnectionClosed("driver task is gone".to_string()))?;
        outcome
            .await
            .map_err(|_| LdapError::ConnectionClosed("driver task is gone".to_string()))?
    }

    /// Flush pending writes and close the socket. Idempotent in effect;
    /// a second call finds the driver already gone.
    pub async fn shutdown(&self) {
        let (done, closed) = oneshot::channel();
        if self
            .command_tx
            .send(DriverCommand::Shutdown { done })
            .await
            .is_ok()
        {
            let _ = closed.await;
        }
    }
}

/// Start the driver task for an established stream.
pub fn spawn_driver(
    stream: ConnStream,
    dispatcher: Arc<RequestDispatcher>,
    cancel: CancellationToken,
) -> Transport {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let (command_tx, command_rx) = mpsc::channel(4);
    tokio::spawn(drive_connection(
        stream,
        dispatcher,
        cancel,
        outbound_rx,
        command_rx,
    ));
    Transport {
        outbound_tx,
        command_tx,
    }
}

async fn drive_connection(
    mut stream: ConnStream,
    dispatcher: Arc<RequestDispatcher>,
    cancel: CancellationToken,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    mut command_rx: mpsc::Receiver<DriverCommand>,
) {
    let mut frames = FrameProcessor::new();
    let mut plaintext = BytesMut::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    let mut local_close = false;
    let failure = loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(DriverCommand::UpgradeTls { connector, server_name, done }) => {
                        match perform_tls_upgrade(&mut stream, connector, server_name).await {
                            Ok(()) => {
                                info!("TLS layer established over existing connection");
                                let _ = done.send(Ok(()));
                            }
                            Err(err) => {
                                // the plain stream was consumed by the
                                // failed handshake; nothing to salvage
                                let _ = done.send(Err(err.clone()));
                                break Some(err);
                            }
                        }
                    }
                    Some(DriverCommand::InstallSecurity { context, seal, done }) => {
                        let outcome = frames.install(context, seal);
                        if outcome.is_ok() {
                            info!(seal, "SASL security layer active");
                        }
                        let _ = done.send(outcome);
                    }
                    Some(DriverCommand::Shutdown { done }) => {
                        local_close = true;
                        drain_outbound(&mut stream, &frames, &mut outbound_rx).await;
                        let _ = stream.shutdown().await;
                        let _ = done.send(());
                        break Some(LdapError::ConnectionClosed("closed locally".to_string()));
                    }
                    None => {
                        // every Transport handle dropped
                        local_close = true;
                        drain_outbound(&mut stream, &frames, &mut outbound_rx).await;
                        let _ = stream.shutdown().await;
                        break Some(LdapError::ConnectionClosed("closed locally".to_string()));
                    }
                }
            }
            pdu = outbound_rx.recv() => {
                match pdu {
                    Some(pdu) => {
                        let wire = match frames.encode_outbound(&pdu) {
                            Ok(wire) => wire,
                            Err(err) => break Some(err),
                        };
                        if let Err(err) = stream.write_all(&wire).await {
                            break Some(LdapError::from(err));
                        }
                    }
                    None => {
                        local_close = true;
                        let _ = stream.shutdown().await;
                        break Some(LdapError::ConnectionClosed("closed locally".to_string()));
                    }
                }
            }
            read = tokio::io::AsyncReadExt::read(&mut stream, &mut chunk) => {
                match read {
                    Ok(0) => {
                        debug!("peer closed the connection");
                        break Some(LdapError::ConnectionClosed("peer closed the connection".to_string()));
                    }
                    Ok(n) => {
                        if let Some(err) = ingest(&dispatcher, &mut frames, &chunk[..n], &mut plaintext) {
                            break Some(err);
                        }
                    }
                    Err(err) => {
                        break Some(LdapError::from(err));
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = stream.shutdown().await;
                break Some(LdapError::Cancelled);
            }
        }
    };

    if let Some(err) = failure {
        if local_close {
            debug!("connection driver stopped after local close");
        } else if err.is_fatal() {
            warn!(error = %err, "connection driver stopped");
        }
        dispatcher.fail_all(err);
    }
    cancel.cancel();
}

/// Write whatever is still queued before closing. Send can complete
/// before the driver ever polls the queue; a final unbind must not be
/// lost to that race.
async fn drain_outbound(
    stream: &mut ConnStream,
    frames: &FrameProcessor,
    outbound_rx: &mut mpsc::Receiver<Vec<u8>>,
) {
    while let Ok(pdu) = outbound_rx.try_recv() {
        if let Ok(wire) = frames.encode_outbound(&pdu) {
            let _ = stream.write_all(&wire).await;
        }
    }
}

async fn perform_tls_upgrade(
    stream: &mut ConnStream,
    connector: TlsConnector,
    server_name: ServerName<'static>,
) -> Result<()> {
    match std::mem::replace(stream, ConnStream::Detached) {
        ConnStream::Tcp(tcp) => match connector.connect(server_name, tcp).await {
            Ok(tls) => {
                *stream = ConnStream::Tls(Box::new(tls));
                Ok(())
            }
            Err(err) => Err(LdapError::Io(format!("TLS handshake failed: {}", err))),
        },
        other => {
            // already TLS (or mid-upgrade): put it back, refuse
            *stream = other;
            Err(LdapError::InvalidState(
                "connection is not a plain TCP stream".to_string(),
            ))
        }
    }
}

/// Decode freshly read bytes and route complete messages. Returns the
/// fatal error, if any.
fn ingest(
    dispatcher: &RequestDispatcher,
    frames: &mut FrameProcessor,
    data: &[u8],
    plaintext: &mut BytesMut,
) -> Option<LdapError> {
    if let Err(err) = frames.decode_inbound(data, plaintext) {
        return Some(err);
    }
    loop {
        match session::extract_message(plaintext) {
            Ok(None) => return None,
            Ok(Some(message)) => {
                if message.message_id == 0 {
                    if let ProtocolOp::ExtendedResponse(resp) = &message.protocol_op {
                        if resp.is_notice_of_disconnection() {
                            error!(
                                code = %resp.result.result_code,
                                message = %resp.result.diagnostics_message,
                                "server sent notice of disconnection"
                            );
                            return Some(LdapError::Disconnected {
                                code: resp.result.result_code,
                                message: resp.result.diagnostics_message.clone(),
                            });
                        }
                    }
                    debug!("ignoring unsolicited notification");
                    continue;
                }
                dispatcher.deliver(message);
            }
            Err(err) => return Some(err),
        }
    }
}
