//! Identity exchange: the role preamble that opens every connection.

use tokio::io::{AsyncRead, AsyncWrite};

use turnpike_core::{RemoteIdentity, TransportError, TransportResult};

use crate::framed::FramedStream;

/// Announce our role to the peer.
pub async fn announce<S>(io: &mut FramedStream<S>, identity: &RemoteIdentity) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_line(&identity.to_line()).await
}

/// Consume one preamble line and return the peer's role.
pub async fn read_remote_identity<S>(io: &mut FramedStream<S>) -> TransportResult<RemoteIdentity>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = io.read_line().await?;
    RemoteIdentity::parse(&line)
}

/// Read the listener's acknowledgement line; anything but `MX-SERVER` is a
/// protocol violation.
pub async fn expect_server_ack<S>(io: &mut FramedStream<S>) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_remote_identity(io).await? {
        RemoteIdentity::Server => Ok(()),
        other => Err(TransportError::ProtocolViolation {
            message: format!("expected server acknowledgement, got {:?}", other.to_line()),
        }),
    }
}
