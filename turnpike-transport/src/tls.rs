//! TLS assembly: mutual authentication with thumbprint identity.
//!
//! No CA trust is used anywhere. Both verifiers accept whatever certificate
//! the peer presents so the handshake can complete; identity is then
//! established by comparing the leaf certificate's SHA-1 thumbprint. The
//! dialler pins a single expected thumbprint, the listener consults its
//! trust set. A connection whose thumbprint check fails is closed before
//! any payload traffic.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::net::TcpStream;

use turnpike_core::{Thumbprint, TransportError, TransportResult};

/// Local TLS identity: one DER certificate and its PKCS#8 key.
#[derive(Clone)]
pub struct TlsIdentity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
}

impl TlsIdentity {
    /// Build an identity from DER-encoded certificate and PKCS#8 key bytes.
    pub fn from_pkcs8_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        Self { cert_der, key_der }
    }

    /// Thumbprint this identity presents to peers.
    pub fn thumbprint(&self) -> Thumbprint {
        Thumbprint::of_der(&self.cert_der)
    }

    fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(self.cert_der.clone())]
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key_der.clone()).into()
    }
}

/// Listener-side TLS config: present our certificate, demand one from the
/// client, defer its judgement to the trust set.
pub(crate) fn server_config(identity: &TlsIdentity) -> TransportResult<Arc<rustls::ServerConfig>> {
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
        .with_single_cert(identity.cert_chain(), identity.private_key())
        .map_err(|e| TransportError::Io {
            message: format!("server TLS config: {e}"),
        })?;
    Ok(Arc::new(config))
}

/// Dialler-side TLS config: present our certificate, accept any server
/// certificate, defer its judgement to the pinned thumbprint.
pub(crate) fn client_config(identity: &TlsIdentity) -> TransportResult<Arc<rustls::ClientConfig>> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(identity.cert_chain(), identity.private_key())
        .map_err(|e| TransportError::Io {
            message: format!("client TLS config: {e}"),
        })?;
    Ok(Arc::new(config))
}

/// Thumbprint of the server certificate presented on a dialled stream.
pub(crate) fn client_peer_thumbprint(
    stream: &tokio_rustls::client::TlsStream<TcpStream>,
) -> TransportResult<Thumbprint> {
    let (_, connection) = stream.get_ref();
    leaf_thumbprint(connection.peer_certificates())
}

/// Thumbprint of the client certificate presented on an accepted stream.
pub(crate) fn server_peer_thumbprint(
    stream: &tokio_rustls::server::TlsStream<TcpStream>,
) -> TransportResult<Thumbprint> {
    let (_, connection) = stream.get_ref();
    leaf_thumbprint(connection.peer_certificates())
}

fn leaf_thumbprint(certs: Option<&[CertificateDer<'_>]>) -> TransportResult<Thumbprint> {
    let leaf = certs
        .and_then(|chain| chain.first())
        .ok_or_else(|| TransportError::ProtocolViolation {
            message: "peer presented no certificate".into(),
        })?;
    Ok(Thumbprint::of_der(leaf.as_ref()))
}

/// Server name for the TLS client hello. The name plays no role in
/// verification (thumbprints do), but the handshake requires one.
pub(crate) fn server_name(host: &str) -> TransportResult<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| TransportError::InvalidEndpoint {
        message: format!("{host:?}: {e}"),
    })
}

const SUPPORTED_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ED25519,
];

/// Accepts any server certificate; the pinned thumbprint decides after the
/// handshake.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        SUPPORTED_SCHEMES.to_vec()
    }
}

/// Requires a client certificate but accepts any; the trust set decides
/// after the handshake.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        SUPPORTED_SCHEMES.to_vec()
    }
}
