//! The per-connection I/O loop: reads SMTP command lines (and raw `DATA`
//! chunks), drives [`SmtpSession`]'s state machine, and owns the
//! [`Stream`] that can be upgraded from plaintext to TLS mid-connection
//! when the session signals `SessionReply::UpgradeTls`.

use smtp_proto::Request;
use std::{
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf},
    net::TcpStream,
    sync::RwLock,
};
use tokio_rustls::{TlsAcceptor, server::TlsStream};
use tracing::{debug, info, trace};

use crate::models::CredentialRepository;
use crate::smtp::limiter::SessionLimiter;
use crate::smtp::session::{DataReply, SessionReply, SmtpSession};
use crate::submission::SubmissionPipeline;
use crate::tenant_context::TenantContextService;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),
    #[error("failed to write tcp stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
}

/// A connection that may be upgraded from plaintext to TLS mid-session via
/// `STARTTLS`, rather than requiring implicit TLS from connection start.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    pub fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

const BUFFER_SIZE: usize = 1024;
const CODE_READY: u16 = 220;

#[allow(clippy::too_many_arguments)]
pub async fn handle(
    stream: TcpStream,
    acceptor: Arc<RwLock<TlsAcceptor>>,
    server_name: &str,
    peer_addr: SocketAddr,
    credentials: CredentialRepository,
    tenant_context: TenantContextService,
    pipeline: SubmissionPipeline,
    limits: SessionLimiter,
) -> Result<(), ConnectionError> {
    let mut stream = Stream::Plain(stream);

    let mut session = SmtpSession::new(peer_addr, credentials, tenant_context, pipeline, limits);

    trace!("handling connection with {}", session.peer());

    'conn: loop {
        let (source, mut sink) = tokio::io::split(stream);
        let mut reader = BufReader::new(source);

        write_reply(CODE_READY, server_name, &mut sink).await?;

        'session: loop {
            let mut buffer = Vec::with_capacity(BUFFER_SIZE);
            read_line(&mut reader, &mut buffer).await?;

            let request = Request::parse(&mut buffer.iter());

            trace!("received request: {:?}", request);

            match session.handle(request).await {
                SessionReply::ReplyAndContinue(code, message) => {
                    write_reply(code, &message, &mut sink).await?;
                    continue;
                }
                SessionReply::ReplyAndStop(code, message) => {
                    write_reply(code, &message, &mut sink).await?;
                    break 'session;
                }
                SessionReply::RawReply(buf) => {
                    sink.write(&buf).await.map_err(ConnectionError::Write)?;
                    continue;
                }
                SessionReply::IngestData(code, message) => {
                    write_reply(code, &message, &mut sink).await?;

                    'data: loop {
                        let mut buffer = Vec::with_capacity(BUFFER_SIZE);
                        read_buf(&mut reader, &mut buffer).await?;

                        match session.handle_data(&buffer).await {
                            DataReply::ContinueIngest => continue 'data,
                            DataReply::ReplyAndContinue(code, message) => {
                                write_reply(code, &message, &mut sink).await?;
                                continue 'session;
                            }
                        }
                    }
                }
                SessionReply::IngestAuth(code, message) => {
                    write_reply(code, &message, &mut sink).await?;

                    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
                    read_buf(&mut reader, &mut buffer).await?;

                    let (code, message) = session.handle_plain_auth(&mut buffer).await;
                    write_reply(code, &message, &mut sink).await?;
                }
                SessionReply::UpgradeTls(code, message) => {
                    write_reply(code, &message, &mut sink).await?;

                    // Reunite the halves and drop the reader here: any
                    // plaintext bytes still sitting in its internal buffer
                    // must never be fed into the post-handshake session
                    // (RFC 3207 plaintext command injection).
                    let plain = reader.into_inner().unsplit(sink);

                    let Stream::Plain(tcp) = plain else {
                        return Err(ConnectionError::Dropped);
                    };

                    let tls = acceptor
                        .read()
                        .await
                        .accept(tcp)
                        .await
                        .map_err(ConnectionError::Accept)?;

                    stream = Stream::Tls(Box::new(tls));
                    session.mark_tls_active();

                    info!("connection upgraded to TLS");
                    continue 'conn;
                }
            }
        }

        info!("connection handled");
        return Ok(());
    }
}

async fn read_buf(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    reader
        .take(BUFFER_SIZE as u64)
        .read_buf(buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| {
            if size > 0 {
                Ok(size)
            } else {
                Err(ConnectionError::Dropped)
            }
        })
}

async fn read_line(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    reader
        .take(BUFFER_SIZE as u64)
        .read_until(b'\n', buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| {
            if size > 0 {
                Ok(size)
            } else {
                Err(ConnectionError::Dropped)
            }
        })
}

async fn write_reply(
    code: u16,
    message: &str,
    mut sink: impl AsyncWriteExt + Unpin,
) -> Result<(), ConnectionError> {
    let n = sink
        .write(format!("{code} {message}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)?;

    if n < 256 {
        debug!("sent: {} {}", code, message);
    } else {
        trace!("sent {} bytes", n);
    }

    Ok(())
}
