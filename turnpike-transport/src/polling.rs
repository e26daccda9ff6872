//! Polling client: the long-lived outbound loop that offers itself as a
//! server.
//!
//! One task per (subscription, endpoint) pair. Each cycle dials the
//! listener with the usual pinned TLS handshake, announces
//! `MX-SUBSCRIBER`, and serves whatever requests the listener drains out
//! of the subscription's queue. A session that ends with a clean `END` is
//! followed by an immediate re-dial; a failed session backs off
//! exponentially before the retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use url::Url;

use turnpike_core::{RemoteIdentity, ServiceEndpoint, TransportResult};

use crate::client::dial_pinned;
use crate::exchange::MessageExchange;
use crate::identity;
use crate::service::RequestHandler;

/// Polling-loop tuning knobs.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Deadline for TCP connect and TLS handshake, each.
    pub connect_timeout: Duration,

    /// Backoff after the first failure.
    pub initial_backoff: Duration,

    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff with reset on success.
#[derive(Debug, Clone)]
struct BackoffState {
    initial: Duration,
    current: Duration,
    failures: u32,
}

impl BackoffState {
    fn new(initial: Duration) -> Self {
        Self {
            initial,
            current: initial,
            failures: 0,
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    /// The delay to apply for this failure; doubles the next one, capped.
    fn bump(&mut self, max: Duration) -> Duration {
        let delay = self.current;
        self.failures += 1;
        self.current = (self.current * 2).min(max);
        delay
    }
}

/// A running polling loop for one (subscription, endpoint) pair.
pub struct PollingClient {
    subscription: Url,
    shutdown_tx: mpsc::UnboundedSender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PollingClient {
    /// Spawn the loop.
    pub(crate) fn spawn(
        subscription: Url,
        endpoint: ServiceEndpoint,
        tls: Arc<rustls::ClientConfig>,
        handler: Arc<dyn RequestHandler>,
        config: PollingConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(poll_loop(
            subscription.clone(),
            endpoint,
            tls,
            handler,
            config,
            shutdown_rx,
        ));
        Self {
            subscription,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// The subscription this loop serves.
    pub fn subscription(&self) -> &Url {
        &self.subscription
    }

    /// Cancel the loop and wait for it to exit. An in-flight dial or
    /// session is aborted.
    pub async fn close(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn poll_loop(
    subscription: Url,
    endpoint: ServiceEndpoint,
    tls: Arc<rustls::ClientConfig>,
    handler: Arc<dyn RequestHandler>,
    config: PollingConfig,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    let mut backoff = BackoffState::new(config.initial_backoff);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = poll_session(&subscription, &endpoint, &tls, handler.as_ref(), &config) => {
                match result {
                    Ok(()) => {
                        tracing::debug!(subscription = %subscription, "polling session drained cleanly");
                        backoff.reset();
                    }
                    Err(err) => {
                        let delay = backoff.bump(config.max_backoff);
                        tracing::warn!(
                            subscription = %subscription,
                            endpoint = %endpoint,
                            error = %err,
                            ?delay,
                            "polling session failed; backing off"
                        );
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
    tracing::debug!(subscription = %subscription, "polling loop stopped");
}

async fn poll_session(
    subscription: &Url,
    endpoint: &ServiceEndpoint,
    tls: &Arc<rustls::ClientConfig>,
    handler: &dyn RequestHandler,
    config: &PollingConfig,
) -> TransportResult<()> {
    let mut io = dial_pinned(tls, endpoint, config.connect_timeout).await?;
    identity::announce(&mut io, &RemoteIdentity::Subscriber(subscription.clone())).await?;
    identity::expect_server_ack(&mut io).await?;

    let mut exchange = MessageExchange::new(io);
    exchange.serve_as_subscriber(handler).await
}
