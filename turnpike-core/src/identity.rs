//! Role preamble and turn-taking control lines.
//!
//! The first traffic on every accepted connection is an identity preamble,
//! an ASCII line terminated by CRLF:
//!
//! ```text
//! MX-CLIENT 1.0
//! MX-SUBSCRIBER 1.0 <absolute-url>
//! MX-SERVER 1.0
//! ```
//!
//! Between request/response bursts the peers exchange the `NEXT`, `PROCEED`
//! and `END` tokens, also CRLF lines. One parser serves both directions.

use url::Url;

use crate::error::{TransportError, TransportResult};

/// Protocol version carried by every preamble line.
pub const PROTOCOL_VERSION: &str = "1.0";

const CLIENT_WORD: &str = "MX-CLIENT";
const SERVER_WORD: &str = "MX-SERVER";
const SUBSCRIBER_WORD: &str = "MX-SUBSCRIBER";

/// Role announced by a peer in its preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteIdentity {
    /// Opens a request-bearing session; will originate bursts.
    Client,
    /// The listener's acknowledgement line.
    Server,
    /// A poller registering its subscription inbox; the listener becomes
    /// the requester on this connection.
    Subscriber(Url),
}

impl RemoteIdentity {
    /// Render the preamble line (without the CRLF terminator).
    pub fn to_line(&self) -> String {
        match self {
            RemoteIdentity::Client => format!("{CLIENT_WORD} {PROTOCOL_VERSION}"),
            RemoteIdentity::Server => format!("{SERVER_WORD} {PROTOCOL_VERSION}"),
            RemoteIdentity::Subscriber(url) => {
                format!("{SUBSCRIBER_WORD} {PROTOCOL_VERSION} {url}")
            }
        }
    }

    /// Parse one preamble line (CRLF already stripped).
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` on any format or version mismatch.
    pub fn parse(line: &str) -> TransportResult<Self> {
        let mut parts = line.split_ascii_whitespace();
        let word = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();

        if version != PROTOCOL_VERSION {
            return Err(violation(line));
        }

        let identity = match word {
            CLIENT_WORD => RemoteIdentity::Client,
            SERVER_WORD => RemoteIdentity::Server,
            SUBSCRIBER_WORD => {
                let raw = parts.next().ok_or_else(|| violation(line))?;
                let url = Url::parse(raw).map_err(|_| violation(line))?;
                RemoteIdentity::Subscriber(url)
            }
            _ => return Err(violation(line)),
        };

        if parts.next().is_some() {
            return Err(violation(line));
        }
        Ok(identity)
    }
}

/// Turn-taking tokens exchanged between bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnToken {
    /// "I have another request to send; keep the stream open."
    Next,
    /// "Acknowledged; go ahead with the next burst." Sent only by the side
    /// currently serving requests.
    Proceed,
    /// "I have nothing more; you may close or pool this stream."
    End,
}

impl TurnToken {
    /// The wire text of the token (without the CRLF terminator).
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnToken::Next => "NEXT",
            TurnToken::Proceed => "PROCEED",
            TurnToken::End => "END",
        }
    }

    /// Parse one control line (CRLF already stripped).
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for anything other than the three tokens.
    pub fn parse(line: &str) -> TransportResult<Self> {
        match line {
            "NEXT" => Ok(TurnToken::Next),
            "PROCEED" => Ok(TurnToken::Proceed),
            "END" => Ok(TurnToken::End),
            _ => Err(violation(line)),
        }
    }
}

fn violation(line: &str) -> TransportError {
    TransportError::ProtocolViolation {
        message: format!("unexpected line {line:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_lines_roundtrip() {
        for identity in [
            RemoteIdentity::Client,
            RemoteIdentity::Server,
            RemoteIdentity::Subscriber(Url::parse("poll://inbox-a/").expect("url")),
        ] {
            let line = identity.to_line();
            assert_eq!(RemoteIdentity::parse(&line).expect("parse"), identity);
        }
    }

    #[test]
    fn preamble_texts_match_the_wire() {
        assert_eq!(RemoteIdentity::Client.to_line(), "MX-CLIENT 1.0");
        assert_eq!(RemoteIdentity::Server.to_line(), "MX-SERVER 1.0");
        let sub = RemoteIdentity::Subscriber(Url::parse("poll://inbox-a/").expect("url"));
        assert_eq!(sub.to_line(), "MX-SUBSCRIBER 1.0 poll://inbox-a/");
    }

    #[test]
    fn bad_version_rejected() {
        assert!(RemoteIdentity::parse("MX-CLIENT 2.0").is_err());
        assert!(RemoteIdentity::parse("MX-CLIENT").is_err());
    }

    #[test]
    fn bad_role_rejected() {
        assert!(RemoteIdentity::parse("MX-PEER 1.0").is_err());
        assert!(RemoteIdentity::parse("GET / HTTP/1.1").is_err());
        assert!(RemoteIdentity::parse("").is_err());
    }

    #[test]
    fn subscriber_requires_absolute_url() {
        assert!(RemoteIdentity::parse("MX-SUBSCRIBER 1.0").is_err());
        assert!(RemoteIdentity::parse("MX-SUBSCRIBER 1.0 not a url").is_err());
        assert!(RemoteIdentity::parse("MX-SUBSCRIBER 1.0 /relative").is_err());
    }

    #[test]
    fn trailing_junk_rejected() {
        assert!(RemoteIdentity::parse("MX-CLIENT 1.0 extra").is_err());
    }

    #[test]
    fn tokens_roundtrip() {
        for token in [TurnToken::Next, TurnToken::Proceed, TurnToken::End] {
            assert_eq!(TurnToken::parse(token.as_str()).expect("parse"), token);
        }
    }

    #[test]
    fn token_parse_is_exact() {
        assert!(TurnToken::parse("next").is_err());
        assert!(TurnToken::parse("NEXT ").is_err());
        assert!(TurnToken::parse("CONTINUE").is_err());
    }
}
