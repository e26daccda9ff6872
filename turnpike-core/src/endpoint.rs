//! Destination endpoints and certificate thumbprints.
//!
//! A [`ServiceEndpoint`] is the complete description of where a request
//! goes: a base URI plus the thumbprint the remote peer must present. Both
//! fields participate in equality and hashing, so the endpoint doubles as
//! the connection-pool and route-table key.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use url::Url;

use crate::error::{TransportError, TransportResult};

/// Recognised destination URI schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Direct destination: dial, pin, exchange as client.
    Https,
    /// Polling destination: rendezvous through a pending-request queue.
    Poll,
}

impl Scheme {
    /// Parse a scheme string, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns `UnknownScheme` for anything other than `https` or `poll`.
    pub fn parse(scheme: &str) -> TransportResult<Self> {
        if scheme.eq_ignore_ascii_case("https") {
            Ok(Scheme::Https)
        } else if scheme.eq_ignore_ascii_case("poll") {
            Ok(Scheme::Poll)
        } else {
            Err(TransportError::UnknownScheme {
                scheme: scheme.to_string(),
            })
        }
    }
}

/// SHA-1 thumbprint of a peer's leaf certificate.
///
/// Stored as uppercase hex with no separators; parsing accepts any case, so
/// comparison is effectively case-insensitive. Equality runs in constant
/// time: this value stands in for a CA chain and must not leak how many
/// leading characters matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Thumbprint(String);

impl Thumbprint {
    /// Parse a hex thumbprint, normalising to uppercase.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpoint` unless the input is exactly 40 hex digits.
    pub fn parse(text: &str) -> TransportResult<Self> {
        if text.len() != 40 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TransportError::InvalidEndpoint {
                message: format!("thumbprint must be 40 hex digits, got {:?}", text),
            });
        }
        Ok(Thumbprint(text.to_ascii_uppercase()))
    }

    /// Thumbprint of a DER-encoded certificate.
    pub fn of_der(der: &[u8]) -> Self {
        Thumbprint(hex::encode_upper(Sha1::digest(der)))
    }

    /// The uppercase hex text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Thumbprint {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for Thumbprint {}

impl Hash for Thumbprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A destination: base URI plus the pinned remote thumbprint.
///
/// Two endpoints are equal iff both fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Base URI, `https://host:port/` or `poll://<subscription-id>/`.
    pub base_uri: Url,
    /// Thumbprint the remote peer must present.
    pub thumbprint: Thumbprint,
}

impl ServiceEndpoint {
    /// Create an endpoint from already-validated parts.
    pub fn new(base_uri: Url, thumbprint: Thumbprint) -> Self {
        Self {
            base_uri,
            thumbprint,
        }
    }

    /// Parse an endpoint from URI and thumbprint text.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpoint` if either part fails to parse.
    pub fn parse(uri: &str, thumbprint: &str) -> TransportResult<Self> {
        let base_uri = Url::parse(uri).map_err(|e| TransportError::InvalidEndpoint {
            message: format!("{uri:?}: {e}"),
        })?;
        Ok(Self {
            base_uri,
            thumbprint: Thumbprint::parse(thumbprint)?,
        })
    }

    /// The destination scheme.
    ///
    /// # Errors
    ///
    /// Returns `UnknownScheme` if the URI scheme is not recognised.
    pub fn scheme(&self) -> TransportResult<Scheme> {
        Scheme::parse(self.base_uri.scheme())
    }

    /// `host:port` authority for dialling a direct destination.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpoint` if the URI has no host or port.
    pub fn authority(&self) -> TransportResult<(String, u16)> {
        let host = self
            .base_uri
            .host_str()
            .ok_or_else(|| TransportError::InvalidEndpoint {
                message: format!("{} has no host", self.base_uri),
            })?;
        let port =
            self.base_uri
                .port_or_known_default()
                .ok_or_else(|| TransportError::InvalidEndpoint {
                    message: format!("{} has no port", self.base_uri),
                })?;
        Ok((host.to_string(), port))
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.base_uri, self.thumbprint)
    }
}
