//! Transport runtime: top-level wiring.
//!
//! Owns the TLS identity, trust set, listeners, polling clients, connection
//! pool, per-subscription queues, route table and service registry, and
//! routes every outbound request by destination scheme: `https` runs a
//! secure-client transaction, `poll` parks the request on the
//! subscription's pending-request queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use url::Url;

use turnpike_core::{
    RequestMessage, ResponseMessage, Scheme, ServiceEndpoint, TransportError, TransportResult,
};

use crate::client::{SecureClient, SecureClientConfig};
use crate::listener::{FriendlyPage, ListenerShared, SecureListener};
use crate::polling::{PollingClient, PollingConfig};
use crate::pool::{PoolConfig, PoolStats};
use crate::queue::QueueMap;
use crate::routes::RouteTable;
use crate::service::{RegistryHandler, RequestHandler, ServiceRegistry};
use crate::tls::{self, TlsIdentity};
use crate::trust::TrustSet;

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Deadline for every outbound request, both direct and polled. While
    /// queued, exceeding it raises `PollingTimeout`; in flight it raises
    /// `TransportTimeout` and destroys the stream.
    pub request_timeout: Duration,

    /// How long a subscriber session waits on an empty queue before the
    /// listener releases it with `END`.
    pub dequeue_wait: Duration,

    /// Connection-pool knobs.
    pub pool: PoolConfig,

    /// Secure-client knobs.
    pub client: SecureClientConfig,

    /// Polling-loop knobs.
    pub polling: PollingConfig,

    /// Page served to HTTP peers; `None` closes them without an answer.
    pub friendly_page: Option<FriendlyPage>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            dequeue_wait: Duration::from_secs(15),
            pool: PoolConfig::default(),
            client: SecureClientConfig::default(),
            polling: PollingConfig::default(),
            friendly_page: Some(FriendlyPage::default()),
        }
    }
}

/// One node of the transport: everything needed to originate and serve
/// requests over both connection directions.
pub struct TransportRuntime {
    trust: Arc<TrustSet>,
    routes: RouteTable,
    queues: Arc<QueueMap>,
    services: Arc<ServiceRegistry>,
    handler: Arc<dyn RequestHandler>,
    client: SecureClient,
    server_tls: Arc<rustls::ServerConfig>,
    listeners: Mutex<Vec<SecureListener>>,
    pollers: Mutex<Vec<PollingClient>>,
    shutting_down: AtomicBool,
    config: RuntimeConfig,
}

impl TransportRuntime {
    /// Create a runtime presenting `identity` on every connection, in both
    /// directions.
    pub fn new(identity: &TlsIdentity, config: RuntimeConfig) -> TransportResult<Self> {
        let services = Arc::new(ServiceRegistry::new());
        let handler: Arc<dyn RequestHandler> = Arc::new(RegistryHandler::new(services.clone()));
        Ok(Self {
            trust: Arc::new(TrustSet::new()),
            routes: RouteTable::new(),
            queues: Arc::new(QueueMap::new()),
            services,
            handler,
            client: SecureClient::new(identity, config.client.clone(), config.pool.clone())?,
            server_tls: tls::server_config(identity)?,
            listeners: Mutex::new(Vec::new()),
            pollers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            config,
        })
    }

    /// The trust set consulted on every accept.
    pub fn trust(&self) -> &TrustSet {
        &self.trust
    }

    /// The service registry inbound requests dispatch against.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Record that traffic for `to` should be sent via `via`. Consulted
    /// once per send, without recursion.
    pub fn route(&self, to: ServiceEndpoint, via: ServiceEndpoint) {
        self.routes.insert(to, via);
    }

    /// Bind a listener and start serving. Returns the bound address.
    pub async fn listen(&self, addr: impl tokio::net::ToSocketAddrs) -> TransportResult<SocketAddr> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        let shared = Arc::new(ListenerShared {
            tls: self.server_tls.clone(),
            trust: self.trust.clone(),
            handler: self.handler.clone(),
            queues: self.queues.clone(),
            friendly_page: self.config.friendly_page.clone(),
            dequeue_wait: self.config.dequeue_wait,
        });
        let listener = SecureListener::bind(addr, shared).await?;
        let local_addr = listener.local_addr();
        self.lock_listeners().push(listener);
        Ok(local_addr)
    }

    /// Start a polling client: dial `endpoint`, announce `subscription`,
    /// and serve the requests the listener drains for it. Runs until
    /// shutdown.
    pub fn poll(&self, subscription: Url, endpoint: ServiceEndpoint) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let poller = PollingClient::spawn(
            subscription,
            endpoint,
            self.client.tls_config(),
            self.handler.clone(),
            self.config.polling.clone(),
        );
        self.lock_pollers().push(poller);
    }

    /// Send a request to its destination and await the response.
    pub async fn send(&self, request: RequestMessage) -> TransportResult<ResponseMessage> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        let destination = self.routes.resolve(&request.destination);
        let deadline = self.config.request_timeout;

        match destination.scheme()? {
            Scheme::Https => timeout(deadline, self.client.call(&destination, &request))
                .await
                .map_err(|_| TransportError::TransportTimeout { after: deadline })?,
            Scheme::Poll => {
                self.queues
                    .get_or_create(&destination.base_uri)
                    .enqueue_and_wait(request, deadline)
                    .await
            }
        }
    }

    /// Dispatch an inbound request to the registered service, as the
    /// listeners and pollers do.
    pub async fn handle_incoming(&self, request: RequestMessage) -> ResponseMessage {
        self.handler.handle(request).await
    }

    /// Number of sockets dialled so far.
    pub fn dial_count(&self) -> u64 {
        self.client.dial_count()
    }

    /// Idle pooled connections for an endpoint.
    pub fn pool_idle(&self, endpoint: &ServiceEndpoint) -> usize {
        self.client.idle_connections(endpoint)
    }

    /// Pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.client.pool_stats()
    }

    /// Requests currently parked for a subscription (in-flight excluded).
    pub fn pending_requests(&self, subscription: &Url) -> usize {
        self.queues
            .get(subscription)
            .map_or(0, |queue| queue.len())
    }

    /// Dispose the runtime: stop listeners and pollers, close every queue
    /// (waiting callers observe `Shutdown`), destroy pooled connections.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("runtime shutting down");

        let listeners = std::mem::take(&mut *self.lock_listeners());
        for mut listener in listeners {
            listener.close().await;
        }
        let pollers = std::mem::take(&mut *self.lock_pollers());
        for mut poller in pollers {
            poller.close().await;
        }

        self.queues.close_all();
        self.client.dispose();
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<SecureListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pollers(&self) -> std::sync::MutexGuard<'_, Vec<PollingClient>> {
        self.pollers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
