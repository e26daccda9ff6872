//! Secure client: dial, pin, identify, and reuse authenticated streams.
//!
//! Checkouts prefer an idle pooled exchange; a miss dials TCP, performs the
//! TLS handshake, verifies the server's leaf thumbprint against the pinned
//! one, and runs the identity exchange as a client. Streams return to the
//! pool only after a clean session; any failure destroys them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use turnpike_core::{
    RemoteIdentity, RequestMessage, ResponseMessage, ServiceEndpoint, TransportError,
    TransportResult,
};

use crate::exchange::MessageExchange;
use crate::framed::FramedStream;
use crate::identity;
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::tls::{self, TlsIdentity};

/// TLS stream type on the dialling side.
pub type ClientTlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct SecureClientConfig {
    /// Deadline for TCP connect and for the TLS handshake, each.
    pub connect_timeout: Duration,
}

impl Default for SecureClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Dial a destination, handshake, and verify the pinned thumbprint.
///
/// Shared by the secure client and the polling client; the caller decides
/// which identity to announce on the returned stream.
pub(crate) async fn dial_pinned(
    tls: &Arc<rustls::ClientConfig>,
    endpoint: &ServiceEndpoint,
    connect_timeout: Duration,
) -> TransportResult<FramedStream<ClientTlsStream>> {
    let (host, port) = endpoint.authority()?;

    let tcp = timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| TransportError::TransportTimeout {
            after: connect_timeout,
        })??;
    tcp.set_nodelay(true)?;

    let connector = TlsConnector::from(tls.clone());
    let stream = timeout(
        connect_timeout,
        connector.connect(tls::server_name(&host)?, tcp),
    )
    .await
    .map_err(|_| TransportError::TransportTimeout {
        after: connect_timeout,
    })??;

    let presented = tls::client_peer_thumbprint(&stream)?;
    if presented != endpoint.thumbprint {
        tracing::warn!(%endpoint, %presented, "server thumbprint mismatch");
        return Err(TransportError::UnknownServerThumbprint {
            pinned: endpoint.thumbprint.to_string(),
            presented: presented.to_string(),
        });
    }

    Ok(FramedStream::new(stream))
}

/// Dialling side of the transport: pooled, pinned, client-identified
/// exchanges.
pub struct SecureClient {
    tls: Arc<rustls::ClientConfig>,
    pool: ConnectionPool<ServiceEndpoint, MessageExchange<ClientTlsStream>>,
    config: SecureClientConfig,
    dials: AtomicU64,
}

impl SecureClient {
    /// Create a client presenting `identity` on every dial.
    pub fn new(
        identity: &TlsIdentity,
        config: SecureClientConfig,
        pool_config: PoolConfig,
    ) -> TransportResult<Self> {
        Ok(Self {
            tls: tls::client_config(identity)?,
            pool: ConnectionPool::new(pool_config),
            config,
            dials: AtomicU64::new(0),
        })
    }

    /// Number of sockets dialled so far (pool hits excluded).
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// Idle pooled connections for an endpoint.
    pub fn idle_connections(&self, endpoint: &ServiceEndpoint) -> usize {
        self.pool.idle_len(endpoint)
    }

    /// Pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The TLS configuration dials are made with.
    pub(crate) fn tls_config(&self) -> Arc<rustls::ClientConfig> {
        self.tls.clone()
    }

    /// Destroy every idle connection and refuse further pooling.
    pub fn dispose(&self) {
        self.pool.dispose();
    }

    /// Run `transaction` against a checked-out exchange for `endpoint`.
    ///
    /// The exchange comes from the pool or a fresh dial; `transaction` is
    /// invoked exactly once. On clean return the exchange is pooled again;
    /// on failure it is destroyed and the error rethrown with the endpoint
    /// attached.
    pub async fn execute_transaction<T, F>(
        &self,
        endpoint: &ServiceEndpoint,
        transaction: F,
    ) -> TransportResult<T>
    where
        F: AsyncFnOnce(&mut MessageExchange<ClientTlsStream>) -> TransportResult<T>,
    {
        let (mut exchange, _pooled) = match self.checkout(endpoint).await {
            Ok(checked_out) => checked_out,
            Err(err) => return Err(enrich(err, endpoint)),
        };
        match transaction(&mut exchange).await {
            Ok(value) => {
                if exchange.is_reusable() {
                    self.pool.put(endpoint.clone(), exchange);
                }
                Ok(value)
            }
            Err(err) => Err(enrich(err, endpoint)),
        }
    }

    /// One request/response burst in its own session.
    ///
    /// A dead idle stream is replaced transparently by one fresh dial; all
    /// other failures surface unmodified.
    pub async fn call(
        &self,
        endpoint: &ServiceEndpoint,
        request: &RequestMessage,
    ) -> TransportResult<ResponseMessage> {
        let (exchange, pooled) = self.checkout(endpoint).await?;
        match self.run_burst(exchange, endpoint, request).await {
            Err(err) if pooled && matches!(err, TransportError::Io { .. }) => {
                tracing::debug!(%endpoint, error = %err, "idle stream was dead; redialling");
                let fresh = self.dial(endpoint).await?;
                self.run_burst(fresh, endpoint, request).await
            }
            other => other,
        }
    }

    async fn run_burst(
        &self,
        mut exchange: MessageExchange<ClientTlsStream>,
        endpoint: &ServiceEndpoint,
        request: &RequestMessage,
    ) -> TransportResult<ResponseMessage> {
        let result = async {
            let response = exchange.exchange_as_client(request).await?;
            exchange.finish_session().await?;
            Ok(response)
        }
        .await;

        match result {
            Ok(response) => {
                if exchange.is_reusable() {
                    self.pool.put(endpoint.clone(), exchange);
                }
                Ok(response)
            }
            Err(err) => Err(err),
        }
    }

    async fn checkout(
        &self,
        endpoint: &ServiceEndpoint,
    ) -> TransportResult<(MessageExchange<ClientTlsStream>, bool)> {
        if let Some(exchange) = self.pool.take(endpoint) {
            tracing::debug!(%endpoint, "reusing pooled connection");
            return Ok((exchange, true));
        }
        Ok((self.dial(endpoint).await?, false))
    }

    async fn dial(&self, endpoint: &ServiceEndpoint) -> TransportResult<MessageExchange<ClientTlsStream>> {
        self.dials.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%endpoint, "dialling");

        let mut io = dial_pinned(&self.tls, endpoint, self.config.connect_timeout).await?;
        identity::announce(&mut io, &RemoteIdentity::Client).await?;
        identity::expect_server_ack(&mut io).await?;
        Ok(MessageExchange::new(io))
    }
}

fn enrich(err: TransportError, endpoint: &ServiceEndpoint) -> TransportError {
    match err {
        TransportError::Io { message } => TransportError::Io {
            message: format!("{}: {message}", endpoint.base_uri),
        },
        other => other,
    }
}
