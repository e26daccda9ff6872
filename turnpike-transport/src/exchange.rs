//! Message-exchange protocol: the turn-taking state machine that runs on an
//! already-identified stream.
//!
//! One stream carries several request/response bursts to amortise the TLS
//! handshake. Between bursts the peers exchange `NEXT` / `PROCEED` / `END`
//! control lines. The requesting side announces more work with `NEXT` or
//! releases the stream with `END`; the serving side acknowledges `NEXT`
//! with `PROCEED` and never speaks otherwise.
//!
//! Requesting side:
//!
//! ```text
//! Idle ──send request──▶ AwaitResponse ──recv response──▶ Decide
//! Decide ──more──send NEXT──▶ AwaitProceed ──recv PROCEED──▶ Idle
//! Decide ──done──send END──▶ Idle (session boundary; stream poolable)
//! ```
//!
//! Serving side, peer identified as a client:
//!
//! ```text
//! WaitRequest ──recv request──handle──send response──▶ ExpectTurn
//! ExpectTurn ──recv NEXT──send PROCEED──▶ WaitRequest
//! ExpectTurn ──recv END──▶ WaitRequest (next session or EOF)
//! ```
//!
//! Peer identified as a subscriber: the roles invert on the same socket.
//! The listener drains the subscription's pending-request queue:
//!
//! ```text
//! PollQueue ──entry, first──▶ SendRequest
//! PollQueue ──entry, later──▶ Announce ──NEXT/PROCEED──▶ SendRequest
//! SendRequest ──▶ AwaitResponse ──complete entry──▶ PollQueue
//! PollQueue ──empty after wait──send END──▶ done
//! ```
//!
//! Any I/O failure, decode failure, or unexpected token terminates the
//! exchange and poisons the stream: it must be destroyed, never pooled.
//! Deadlines are the caller's responsibility.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use turnpike_core::{
    RemoteIdentity, RequestMessage, ResponseMessage, TransportError, TransportResult, TurnToken,
};

use crate::framed::{FrameOrToken, FramedStream};
use crate::queue::{PendingEntry, PendingRequestQueue};
use crate::service::RequestHandler;

/// Requesting-side turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientTurn {
    /// May open a burst.
    Idle,
    /// Request sent, response outstanding.
    AwaitResponse,
    /// Burst complete; must announce `NEXT` or `END`.
    Decide,
    /// `NEXT` sent, acknowledgement outstanding.
    AwaitProceed,
    /// The stream saw a failure and must be destroyed.
    Terminal,
}

/// Serving-side state for a client-identified connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeState {
    WaitRequest,
    ExpectTurn,
}

/// Listener-side state while draining a subscription queue.
enum DrainState {
    PollQueue { first: bool },
    Announce(PendingEntry),
    SendRequest(PendingEntry),
    AwaitResponse(PendingEntry),
}

/// Poller-side state while serving inbound bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollerState {
    /// The listener either ships a first request or ends the session; this
    /// is the one state where a frame and a control line are both legal.
    AwaitFirst,
    AwaitTurn,
    AwaitRequest,
}

/// One message-exchange instance, bound exclusively to its stream.
pub struct MessageExchange<S> {
    io: FramedStream<S>,
    turn: ClientTurn,
}

impl<S> MessageExchange<S> {
    /// Bind an exchange to an identified stream.
    pub fn new(io: FramedStream<S>) -> Self {
        Self {
            io,
            turn: ClientTurn::Idle,
        }
    }

    /// Whether the stream is at a session boundary and may be pooled.
    pub fn is_reusable(&self) -> bool {
        self.turn == ClientTurn::Idle
    }

    fn require(&self, expected: ClientTurn) -> TransportResult<()> {
        if self.turn == expected {
            Ok(())
        } else {
            Err(TransportError::ProtocolViolation {
                message: format!("operation not legal in exchange state {:?}", self.turn),
            })
        }
    }
}

impl<S> MessageExchange<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run one burst as the requesting side: send `request`, await its
    /// response.
    pub async fn exchange_as_client(
        &mut self,
        request: &RequestMessage,
    ) -> TransportResult<ResponseMessage> {
        self.require(ClientTurn::Idle)?;
        self.turn = ClientTurn::AwaitResponse;

        if let Err(err) = self.io.send_typed(request).await {
            self.turn = ClientTurn::Terminal;
            return Err(err);
        }
        let response = match self.io.receive_typed::<ResponseMessage>().await {
            Ok(response) => response,
            Err(err) => {
                self.turn = ClientTurn::Terminal;
                return Err(err);
            }
        };
        if response.request_id != request.id {
            self.turn = ClientTurn::Terminal;
            return Err(TransportError::ProtocolViolation {
                message: format!(
                    "response answers {:?}, expected {:?}",
                    response.request_id, request.id
                ),
            });
        }

        self.turn = ClientTurn::Decide;
        Ok(response)
    }

    /// Announce another burst: send `NEXT`, await `PROCEED`.
    pub async fn continue_session(&mut self) -> TransportResult<()> {
        self.require(ClientTurn::Decide)?;
        self.turn = ClientTurn::AwaitProceed;

        if let Err(err) = self.io.write_line(TurnToken::Next.as_str()).await {
            self.turn = ClientTurn::Terminal;
            return Err(err);
        }
        match self.read_token().await {
            Ok(TurnToken::Proceed) => {
                self.turn = ClientTurn::Idle;
                Ok(())
            }
            Ok(other) => {
                self.turn = ClientTurn::Terminal;
                Err(TransportError::ProtocolViolation {
                    message: format!("expected PROCEED, got {}", other.as_str()),
                })
            }
            Err(err) => {
                self.turn = ClientTurn::Terminal;
                Err(err)
            }
        }
    }

    /// Release the stream: send `END`. The exchange returns to the session
    /// boundary and may be pooled.
    pub async fn finish_session(&mut self) -> TransportResult<()> {
        self.require(ClientTurn::Decide)?;
        if let Err(err) = self.io.write_line(TurnToken::End.as_str()).await {
            self.turn = ClientTurn::Terminal;
            return Err(err);
        }
        self.turn = ClientTurn::Idle;
        Ok(())
    }

    /// Run the serving side of an identified connection to completion.
    ///
    /// A client-identified peer gets its bursts handled; a
    /// subscriber-identified peer inverts the roles and this side drains the
    /// pending-request queue named by the subscription.
    pub async fn exchange_as_server<H, F>(
        &mut self,
        identity: RemoteIdentity,
        handler: &H,
        queue_for: F,
        dequeue_wait: Duration,
    ) -> TransportResult<()>
    where
        H: RequestHandler + ?Sized,
        F: FnOnce(&Url) -> Arc<PendingRequestQueue>,
    {
        match identity {
            RemoteIdentity::Client => self.serve_requests(handler).await,
            RemoteIdentity::Subscriber(subscription) => {
                let queue = queue_for(&subscription);
                self.drain_queue(&queue, dequeue_wait).await
            }
            RemoteIdentity::Server => Err(TransportError::ProtocolViolation {
                message: "MX-SERVER is not a connecting role".into(),
            }),
        }
    }

    /// Serve bursts from a client-identified peer until it closes the
    /// connection.
    pub async fn serve_requests<H>(&mut self, handler: &H) -> TransportResult<()>
    where
        H: RequestHandler + ?Sized,
    {
        let mut state = ServeState::WaitRequest;
        loop {
            state = match state {
                ServeState::WaitRequest => {
                    match self.io.receive_typed_or_eof::<RequestMessage>().await? {
                        None => return Ok(()),
                        Some(request) => {
                            tracing::debug!(
                                request_id = %request.id,
                                service = %request.service_type,
                                method = %request.method,
                                "serving burst"
                            );
                            let response = handler.handle(request).await;
                            self.io.send_typed(&response).await?;
                            ServeState::ExpectTurn
                        }
                    }
                }
                ServeState::ExpectTurn => match self.read_token().await? {
                    TurnToken::Next => {
                        self.io.write_line(TurnToken::Proceed.as_str()).await?;
                        ServeState::WaitRequest
                    }
                    // Session boundary: the peer may pool the stream and
                    // open another session later, or just go away.
                    TurnToken::End => ServeState::WaitRequest,
                    TurnToken::Proceed => {
                        return Err(TransportError::ProtocolViolation {
                            message: "PROCEED from the requesting side".into(),
                        });
                    }
                },
            };
        }
    }

    /// Drain `queue` toward a subscriber-identified peer until the queue
    /// stays empty past `dequeue_wait`.
    pub async fn drain_queue(
        &mut self,
        queue: &PendingRequestQueue,
        dequeue_wait: Duration,
    ) -> TransportResult<()> {
        let mut state = DrainState::PollQueue { first: true };
        loop {
            state = match state {
                DrainState::PollQueue { first } => match queue.dequeue(dequeue_wait).await {
                    None => {
                        self.io.write_line(TurnToken::End.as_str()).await?;
                        return Ok(());
                    }
                    Some(entry) if first => DrainState::SendRequest(entry),
                    Some(entry) => DrainState::Announce(entry),
                },
                DrainState::Announce(entry) => {
                    if let Err(err) = self.io.write_line(TurnToken::Next.as_str()).await {
                        entry.abandon(err.clone());
                        return Err(err);
                    }
                    match self.read_token().await {
                        Ok(TurnToken::Proceed) => DrainState::SendRequest(entry),
                        Ok(other) => {
                            let err = TransportError::ProtocolViolation {
                                message: format!("expected PROCEED, got {}", other.as_str()),
                            };
                            entry.abandon(err.clone());
                            return Err(err);
                        }
                        Err(err) => {
                            entry.abandon(err.clone());
                            return Err(err);
                        }
                    }
                }
                DrainState::SendRequest(entry) => {
                    tracing::debug!(request_id = %entry.request.id, "shipping queued request");
                    if let Err(err) = self.io.send_typed(&entry.request).await {
                        entry.abandon(err.clone());
                        return Err(err);
                    }
                    DrainState::AwaitResponse(entry)
                }
                DrainState::AwaitResponse(entry) => {
                    match self.io.receive_typed::<ResponseMessage>().await {
                        Err(err) => {
                            entry.abandon(err.clone());
                            return Err(err);
                        }
                        Ok(response) if response.request_id != entry.request.id => {
                            let err = TransportError::ProtocolViolation {
                                message: format!(
                                    "response answers {:?}, expected {:?}",
                                    response.request_id, entry.request.id
                                ),
                            };
                            entry.abandon(err.clone());
                            return Err(err);
                        }
                        Ok(response) => {
                            if entry.complete(response) {
                                DrainState::PollQueue { first: false }
                            } else {
                                tracing::warn!(
                                    "caller abandoned an in-flight burst; destroying stream"
                                );
                                return Err(TransportError::Io {
                                    message: "caller abandoned an in-flight burst".into(),
                                });
                            }
                        }
                    }
                }
            };
        }
    }

    /// Serve bursts as a subscriber: the dialling side that handles
    /// requests arriving from the listener it subscribed with.
    pub async fn serve_as_subscriber<H>(&mut self, handler: &H) -> TransportResult<()>
    where
        H: RequestHandler + ?Sized,
    {
        let mut state = PollerState::AwaitFirst;
        loop {
            state = match state {
                PollerState::AwaitFirst => {
                    match self.io.receive_typed_or_token::<RequestMessage>().await? {
                        FrameOrToken::Message(request) => {
                            self.answer(handler, request).await?;
                            PollerState::AwaitTurn
                        }
                        FrameOrToken::Token(TurnToken::End) => return Ok(()),
                        FrameOrToken::Token(other) => {
                            return Err(TransportError::ProtocolViolation {
                                message: format!(
                                    "expected a request or END, got {}",
                                    other.as_str()
                                ),
                            });
                        }
                    }
                }
                PollerState::AwaitTurn => match self.read_token().await? {
                    TurnToken::Next => {
                        self.io.write_line(TurnToken::Proceed.as_str()).await?;
                        PollerState::AwaitRequest
                    }
                    TurnToken::End => return Ok(()),
                    TurnToken::Proceed => {
                        return Err(TransportError::ProtocolViolation {
                            message: "PROCEED from the requesting side".into(),
                        });
                    }
                },
                PollerState::AwaitRequest => {
                    let request = self.io.receive_typed::<RequestMessage>().await?;
                    self.answer(handler, request).await?;
                    PollerState::AwaitTurn
                }
            };
        }
    }

    async fn answer<H>(&mut self, handler: &H, request: RequestMessage) -> TransportResult<()>
    where
        H: RequestHandler + ?Sized,
    {
        tracing::debug!(request_id = %request.id, method = %request.method, "handling polled burst");
        let response = handler.handle(request).await;
        self.io.send_typed(&response).await
    }

    async fn read_token(&mut self) -> TransportResult<TurnToken> {
        let line = self.io.read_line().await?;
        TurnToken::parse(&line)
    }
}
