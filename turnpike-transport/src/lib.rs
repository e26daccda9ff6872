//! # turnpike-transport
//!
//! A secure, bidirectional RPC transport. Two mutually-authenticated peers
//! exchange typed request/response bursts over long-lived,
//! certificate-pinned TLS streams, and either side of a connection may be
//! the one asking. A *listener* accepts connections and serves requests; a
//! *poller* dials out to a listener and then serves requests arriving over
//! that same socket, which is what lets callers reach peers that cannot
//! accept inbound connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                 Application Code                   │
//! │     Registers services, calls runtime.send()       │
//! ├───────────────────────────────────────────────────┤
//! │  TransportRuntime (routing)                        │
//! │  • https:// → pooled secure-client transaction     │
//! │  • poll://  → pending-request queue rendezvous     │
//! ├───────────────────────────────────────────────────┤
//! │  MessageExchange (turn-taking)                     │
//! │  • one burst = request + response                  │
//! │  • NEXT / PROCEED / END between bursts             │
//! ├───────────────────────────────────────────────────┤
//! │  FramedStream over mutual TLS                      │
//! │  • [length:4 BE][compressed typed payload]         │
//! │  • identity decided by certificate thumbprint      │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`FramedStream`] | Typed envelopes and control lines over a byte stream |
//! | [`MessageExchange`] | Turn-taking state machine for request/response bursts |
//! | [`PendingRequestQueue`] | Rendezvous between callers and arriving pollers |
//! | [`ConnectionPool`] | Keyed cache of authenticated idle connections |
//! | [`SecureClient`] | Dial + TLS + thumbprint pin + pool interaction |
//! | [`SecureListener`] | Accept + trust check + dispatch, friendly page for HTTP |
//! | [`PollingClient`] | Outbound loop that offers itself as a server |
//! | [`TransportRuntime`] | Wiring, trust set, route table, request router |
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use turnpike_transport::{RuntimeConfig, TransportRuntime};
//!
//! let runtime = TransportRuntime::new(&identity, RuntimeConfig::default())?;
//! runtime.trust().add(peer_thumbprint);
//! runtime.services().register("calculator", Arc::new(Calculator));
//! let addr = runtime.listen("0.0.0.0:8443").await?;
//!
//! // Elsewhere: direct call...
//! let response = runtime.send(request_to(https_endpoint)).await?;
//! // ...or via a peer that polls us:
//! let response = runtime.send(request_to(poll_endpoint)).await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Secure client: dial, pin, identify, pool.
pub mod client;

/// Message-exchange protocol: the turn-taking state machines.
pub mod exchange;

/// Framed stream: typed envelopes and control lines.
pub mod framed;

/// Identity exchange helpers.
pub mod identity;

/// Secure listener and the friendly HTTP page.
pub mod listener;

/// Polling client loop.
pub mod polling;

/// Generic keyed connection pool.
pub mod pool;

/// Pending-request queues.
pub mod queue;

/// Route table.
pub mod routes;

/// Transport runtime.
pub mod runtime;

/// Service dispatch contract.
pub mod service;

/// TLS assembly and thumbprint identity.
pub mod tls;

/// Trust set.
pub mod trust;

// Re-export the wire-level types so applications need only one dependency.
pub use turnpike_core::{
    ErrorDescriptor, RemoteIdentity, RequestMessage, ResponseMessage, Scheme, ServiceEndpoint,
    Thumbprint, TransportError, TransportResult, TurnToken,
};

pub use client::{ClientTlsStream, SecureClient, SecureClientConfig};
pub use exchange::MessageExchange;
pub use framed::{FrameOrToken, FramedStream};
pub use listener::{FriendlyPage, SecureListener, ServerTlsStream};
pub use polling::{PollingClient, PollingConfig};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use queue::{PendingEntry, PendingRequestQueue};
pub use routes::RouteTable;
pub use runtime::{RuntimeConfig, TransportRuntime};
pub use service::{RegistryHandler, RequestHandler, ServiceHandler, ServiceRegistry};
pub use tls::TlsIdentity;
pub use trust::TrustSet;
