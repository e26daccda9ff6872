//! # turnpike-core
//!
//! Wire-level types for the turnpike secure RPC transport.
//!
//! This crate contains everything two peers must agree on before a single
//! byte of application traffic flows:
//!
//! - [`wire`]: the envelope codec, `[length:4 BE][deflate-compressed
//!   self-describing payload]`
//! - [`identity`]: the role preamble (`MX-CLIENT` / `MX-SERVER` /
//!   `MX-SUBSCRIBER`) and the turn-taking tokens (`NEXT` / `PROCEED` /
//!   `END`)
//! - [`message`]: request and response payloads
//! - [`endpoint`]: destinations (base URI + pinned certificate thumbprint)
//! - [`error`]: the structured failure taxonomy
//!
//! Everything here is synchronous and transport-agnostic; the async
//! machinery lives in `turnpike-transport`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Destination endpoints and certificate thumbprints.
pub mod endpoint;

/// Structured error taxonomy.
pub mod error;

/// Role preamble and turn-taking control lines.
pub mod identity;

/// Request and response payloads.
pub mod message;

/// Envelope codec with length prefix and compression.
pub mod wire;

pub use endpoint::{Scheme, ServiceEndpoint, Thumbprint};
pub use error::{TransportError, TransportResult};
pub use identity::{PROTOCOL_VERSION, RemoteIdentity, TurnToken};
pub use message::{ErrorDescriptor, RequestMessage, ResponseMessage};
pub use wire::{
    LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE, WireError, decode_payload, encode_envelope,
    payload_length,
};
