//! Secure listener: accept, authenticate, identify, dispatch.
//!
//! Each accepted socket gets its own task. A plain-HTTP peer (a browser
//! that stumbled into the port) is answered with the configured friendly
//! page before any TLS; everyone else must complete a mutual TLS handshake,
//! present a trusted client thumbprint, and open with an identity preamble.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use turnpike_core::{RemoteIdentity, TransportError, TransportResult};

use crate::exchange::MessageExchange;
use crate::framed::FramedStream;
use crate::queue::QueueMap;
use crate::service::RequestHandler;
use crate::tls;
use crate::trust::TrustSet;

/// TLS stream type on the accepting side.
pub type ServerTlsStream = tokio_rustls::server::TlsStream<TcpStream>;

/// Deadline covering the whole connection preamble: HTTP probe, TLS
/// handshake and identity line.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The HTML answer served to HTTP peers.
#[derive(Debug, Clone)]
pub struct FriendlyPage {
    /// Response body.
    pub body: String,
    /// Extra response headers, appended after the built-in ones.
    pub headers: Vec<(String, String)>,
}

impl Default for FriendlyPage {
    fn default() -> Self {
        Self {
            body: "<html><body><h1>RPC endpoint</h1>\
                   <p>This port speaks a TLS RPC protocol, not HTTP.</p>\
                   </body></html>"
                .into(),
            headers: Vec::new(),
        }
    }
}

impl FriendlyPage {
    fn render(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n",
            self.body.len()
        );
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }
}

/// State shared by the accept loop and every connection task.
pub(crate) struct ListenerShared {
    pub tls: Arc<rustls::ServerConfig>,
    pub trust: Arc<TrustSet>,
    pub handler: Arc<dyn RequestHandler>,
    pub queues: Arc<QueueMap>,
    pub friendly_page: Option<FriendlyPage>,
    pub dequeue_wait: Duration,
}

/// A bound listener with its accept loop running.
pub struct SecureListener {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::UnboundedSender<()>,
    accept_handle: Option<JoinHandle<()>>,
}

impl SecureListener {
    /// Bind and start accepting.
    pub(crate) async fn bind(
        addr: impl tokio::net::ToSocketAddrs,
        shared: Arc<ListenerShared>,
    ) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, "listener bound");

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let accept_handle = tokio::spawn(accept_loop(listener, shared, shutdown_rx));

        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_handle: Some(accept_handle),
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to exit. Connections
    /// already being served run to completion on their own tasks.
    pub async fn close(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ListenerShared>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(tcp, peer, shared).await {
                            tracing::debug!(%peer, error = %err, "connection ended with error");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                }
            },
        }
    }
    tracing::debug!("accept loop stopped");
}

enum Accepted {
    FriendlyPageServed,
    Session {
        identity: RemoteIdentity,
        io: FramedStream<ServerTlsStream>,
    },
}

async fn serve_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    shared: Arc<ListenerShared>,
) -> TransportResult<()> {
    let accepted = timeout(HANDSHAKE_TIMEOUT, establish(tcp, peer, &shared))
        .await
        .map_err(|_| TransportError::TransportTimeout {
            after: HANDSHAKE_TIMEOUT,
        })??;

    match accepted {
        Accepted::FriendlyPageServed => Ok(()),
        Accepted::Session { identity, io } => {
            let mut exchange = MessageExchange::new(io);
            exchange
                .exchange_as_server(
                    identity,
                    shared.handler.as_ref(),
                    |subscription| shared.queues.get_or_create(subscription),
                    shared.dequeue_wait,
                )
                .await
        }
    }
}

async fn establish(
    mut tcp: TcpStream,
    peer: SocketAddr,
    shared: &ListenerShared,
) -> TransportResult<Accepted> {
    // A TLS client speaks first with a handshake record (0x16); a plain
    // HTTP request starts with an ASCII method.
    if peek_is_plain_http(&mut tcp).await? {
        tracing::debug!(%peer, "plain HTTP peer; serving friendly page");
        serve_friendly_page(&mut tcp, shared.friendly_page.as_ref()).await?;
        return Ok(Accepted::FriendlyPageServed);
    }

    let acceptor = TlsAcceptor::from(shared.tls.clone());
    let stream = acceptor.accept(tcp).await?;

    let thumbprint = tls::server_peer_thumbprint(&stream)?;
    if !shared.trust.contains(&thumbprint) {
        tracing::warn!(%peer, %thumbprint, "rejecting untrusted client");
        return Err(TransportError::UntrustedClient {
            thumbprint: thumbprint.to_string(),
        });
    }

    let mut io = FramedStream::new(stream);
    let line = io.read_line().await?;
    if looks_like_http_request_line(&line) {
        tracing::debug!(%peer, "HTTP request inside TLS; serving friendly page");
        serve_friendly_page(io.get_mut(), shared.friendly_page.as_ref()).await?;
        return Ok(Accepted::FriendlyPageServed);
    }

    let identity = RemoteIdentity::parse(&line)?;
    tracing::debug!(%peer, identity = %line, "peer identified");
    io.write_line(&RemoteIdentity::Server.to_line()).await?;

    Ok(Accepted::Session { identity, io })
}

async fn peek_is_plain_http(tcp: &mut TcpStream) -> TransportResult<bool> {
    let mut first = [0u8; 1];
    let n = tcp.peek(&mut first).await?;
    Ok(n == 1 && first[0].is_ascii_uppercase())
}

fn looks_like_http_request_line(line: &str) -> bool {
    let mut parts = line.split(' ');
    let method_ok = matches!(
        parts.next(),
        Some("GET" | "POST" | "HEAD" | "PUT" | "DELETE" | "OPTIONS")
    );
    method_ok
        && parts.next().is_some()
        && matches!(parts.next(), Some("HTTP/1.0" | "HTTP/1.1"))
        && parts.next().is_none()
}

async fn serve_friendly_page<S>(stream: &mut S, page: Option<&FriendlyPage>) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(page) = page else {
        // No page configured: just close.
        return Ok(());
    };
    drain_http_request(stream).await;
    stream.write_all(&page.render()).await?;
    stream.flush().await?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Best-effort read of the request head so the peer can finish writing
/// before we answer and close. Bounded by size and time; failures are
/// ignored.
async fn drain_http_request<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut seen = Vec::with_capacity(256);
    let mut buf = [0u8; 512];
    while seen.len() < 4096 {
        match timeout(Duration::from_millis(250), stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => {
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_request_lines_are_recognised() {
        assert!(looks_like_http_request_line("GET / HTTP/1.1"));
        assert!(looks_like_http_request_line("POST /submit HTTP/1.0"));
        assert!(!looks_like_http_request_line("MX-CLIENT 1.0"));
        assert!(!looks_like_http_request_line("GET / HTTP/2"));
        assert!(!looks_like_http_request_line("GET /"));
        assert!(!looks_like_http_request_line(""));
    }

    #[test]
    fn friendly_page_renders_headers_and_body() {
        let page = FriendlyPage {
            body: "<html>hi</html>".into(),
            headers: vec![("X-Powered-By".into(), "turnpike".into())],
        };
        let text = String::from_utf8(page.render()).expect("utf8");

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 15\r\n"));
        assert!(text.contains("X-Powered-By: turnpike\r\n"));
        assert!(text.ends_with("\r\n\r\n<html>hi</html>"));
    }

    #[test]
    fn default_page_mentions_the_protocol() {
        let page = FriendlyPage::default();
        assert!(page.body.contains("TLS"));
    }
}
