//! Framed stream: typed envelopes and control lines over a byte stream.
//!
//! This module is generic over the transport type: it works with any
//! `AsyncRead + AsyncWrite + Unpin` stream. In production that is a
//! mutually-authenticated TLS stream; tests use in-memory duplex pairs.
//!
//! The framer never buffers past the current message: an envelope is read
//! as an exact-length prefix followed by exactly that many payload bytes,
//! and control lines are read byte by byte up to a hard cap.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use turnpike_core::wire::{LENGTH_PREFIX_SIZE, payload_length};
use turnpike_core::{TransportError, TransportResult, TurnToken, decode_payload, encode_envelope};

/// Hard cap on control-line length. Preamble and token lines are short;
/// anything longer is a protocol violation.
const MAX_LINE_LENGTH: usize = 4096;

/// Outcome of a read at the one protocol state where either an envelope or
/// a control line may arrive.
#[derive(Debug)]
pub enum FrameOrToken<T> {
    /// A typed envelope.
    Message(T),
    /// A turn-taking token line.
    Token(TurnToken),
}

/// Length-delimited, compressed, typed messages plus raw CRLF lines over a
/// byte stream.
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    /// Wrap a stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Unwrap into the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Serialize, compress and send one typed envelope.
    pub async fn send_typed<T: Serialize>(&mut self, value: &T) -> TransportResult<()> {
        let envelope = encode_envelope(value)?;
        self.stream.write_all(&envelope).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one typed envelope.
    pub async fn receive_typed<T: DeserializeOwned>(&mut self) -> TransportResult<T> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.stream.read_exact(&mut prefix).await?;
        self.receive_payload(u32::from_be_bytes(prefix)).await
    }

    /// Receive one typed envelope, or `None` if the peer closed the stream
    /// cleanly before sending any byte of it.
    pub async fn receive_typed_or_eof<T: DeserializeOwned>(&mut self) -> TransportResult<Option<T>> {
        let mut first = [0u8; 1];
        if self.stream.read(&mut first).await? == 0 {
            return Ok(None);
        }
        let mut rest = [0u8; LENGTH_PREFIX_SIZE - 1];
        self.stream.read_exact(&mut rest).await?;
        let length = u32::from_be_bytes([first[0], rest[0], rest[1], rest[2]]);
        Ok(Some(self.receive_payload(length).await?))
    }

    /// Receive either a typed envelope or a turn token.
    ///
    /// Every legal envelope length fits in 24 bits, so an envelope always
    /// begins with a zero byte while token lines are uppercase ASCII; one
    /// byte decides which reader to run.
    pub async fn receive_typed_or_token<T: DeserializeOwned>(
        &mut self,
    ) -> TransportResult<FrameOrToken<T>> {
        let first = self.stream.read_u8().await?;
        if first == 0 {
            let mut rest = [0u8; LENGTH_PREFIX_SIZE - 1];
            self.stream.read_exact(&mut rest).await?;
            let length = u32::from_be_bytes([0, rest[0], rest[1], rest[2]]);
            Ok(FrameOrToken::Message(self.receive_payload(length).await?))
        } else {
            let line = self.finish_line(first).await?;
            Ok(FrameOrToken::Token(TurnToken::parse(&line)?))
        }
    }

    async fn receive_payload<T: DeserializeOwned>(&mut self, length: u32) -> TransportResult<T> {
        let length = payload_length(length)?;
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await?;
        Ok(decode_payload(&payload)?)
    }

    /// Write one CRLF-terminated line.
    pub async fn write_line(&mut self, line: &str) -> TransportResult<()> {
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one line up to and including LF, strip the CRLF terminator.
    pub async fn read_line(&mut self) -> TransportResult<String> {
        let first = self.stream.read_u8().await?;
        self.finish_line(first).await
    }

    async fn finish_line(&mut self, first: u8) -> TransportResult<String> {
        let mut line = Vec::with_capacity(32);
        let mut byte = first;
        loop {
            if byte == b'\n' {
                break;
            }
            line.push(byte);
            if line.len() > MAX_LINE_LENGTH {
                return Err(TransportError::ProtocolViolation {
                    message: format!("control line exceeds {MAX_LINE_LENGTH} bytes"),
                });
            }
            byte = self.stream.read_u8().await?;
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line).map_err(|_| TransportError::ProtocolViolation {
            message: "control line is not valid UTF-8".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::duplex;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        seq: u32,
        text: String,
    }

    #[tokio::test]
    async fn typed_roundtrip() {
        let (left, right) = duplex(64 * 1024);
        let mut sender = FramedStream::new(left);
        let mut receiver = FramedStream::new(right);

        let note = Note {
            seq: 7,
            text: "over the wire".into(),
        };
        sender.send_typed(&note).await.expect("send");

        let decoded: Note = receiver.receive_typed().await.expect("receive");
        assert_eq!(decoded, note);
    }

    #[tokio::test]
    async fn several_envelopes_in_order() {
        let (left, right) = duplex(64 * 1024);
        let mut sender = FramedStream::new(left);
        let mut receiver = FramedStream::new(right);

        for seq in 0..5u32 {
            sender
                .send_typed(&Note {
                    seq,
                    text: "x".repeat(seq as usize * 100),
                })
                .await
                .expect("send");
        }
        for seq in 0..5u32 {
            let note: Note = receiver.receive_typed().await.expect("receive");
            assert_eq!(note.seq, seq);
        }
    }

    #[tokio::test]
    async fn line_roundtrip() {
        let (left, right) = duplex(1024);
        let mut sender = FramedStream::new(left);
        let mut receiver = FramedStream::new(right);

        sender.write_line("MX-CLIENT 1.0").await.expect("write");
        sender.write_line("NEXT").await.expect("write");

        assert_eq!(receiver.read_line().await.expect("read"), "MX-CLIENT 1.0");
        assert_eq!(receiver.read_line().await.expect("read"), "NEXT");
    }

    #[tokio::test]
    async fn frame_or_token_dispatches_on_first_byte() {
        let (left, right) = duplex(64 * 1024);
        let mut sender = FramedStream::new(left);
        let mut receiver = FramedStream::new(right);

        sender
            .send_typed(&Note {
                seq: 1,
                text: "frame".into(),
            })
            .await
            .expect("send frame");
        sender.write_line("END").await.expect("send token");

        match receiver
            .receive_typed_or_token::<Note>()
            .await
            .expect("first")
        {
            FrameOrToken::Message(note) => assert_eq!(note.seq, 1),
            FrameOrToken::Token(token) => panic!("expected frame, got {token:?}"),
        }
        match receiver
            .receive_typed_or_token::<Note>()
            .await
            .expect("second")
        {
            FrameOrToken::Token(TurnToken::End) => {}
            other => panic!("expected END, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_at_boundary_is_clean() {
        let (left, right) = duplex(1024);
        let mut receiver = FramedStream::new(right);
        drop(left);

        let result: Option<Note> = receiver.receive_typed_or_eof().await.expect("eof");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn eof_mid_envelope_is_an_error() {
        let (mut left, right) = duplex(1024);
        let mut receiver = FramedStream::new(right);

        // A length prefix promising 100 bytes, then nothing.
        left.write_all(&100u32.to_be_bytes()).await.expect("write");
        left.write_all(&[1, 2, 3]).await.expect("write");
        drop(left);

        let result: TransportResult<Option<Note>> = receiver.receive_typed_or_eof().await;
        assert!(matches!(result, Err(TransportError::Io { .. })));
    }

    #[tokio::test]
    async fn zero_length_envelope_is_a_violation() {
        let (mut left, right) = duplex(1024);
        let mut receiver = FramedStream::new(right);

        left.write_all(&0u32.to_be_bytes()).await.expect("write");

        let result: TransportResult<Note> = receiver.receive_typed().await;
        assert!(matches!(result, Err(TransportError::Wire(_))));
    }

    #[tokio::test]
    async fn overlong_line_is_a_violation() {
        let (mut left, right) = duplex(64 * 1024);
        let mut receiver = FramedStream::new(right);

        let long = vec![b'A'; MAX_LINE_LENGTH + 10];
        left.write_all(&long).await.expect("write");

        let result = receiver.read_line().await;
        assert!(matches!(
            result,
            Err(TransportError::ProtocolViolation { .. })
        ));
    }
}
