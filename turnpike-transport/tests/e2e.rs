//! End-to-end tests over real sockets: two runtimes, mutual TLS with
//! pinned thumbprints, direct and polled calls, the friendly page, and the
//! failure paths a deployment actually hits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use turnpike_transport::{
    ErrorDescriptor, FriendlyPage, PoolConfig, RequestMessage, RuntimeConfig, SecureClient,
    SecureClientConfig, ServiceEndpoint, ServiceHandler, TlsIdentity, TransportError,
    TransportRuntime,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn fresh_identity() -> TlsIdentity {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).expect("cert");
    TlsIdentity::from_pkcs8_der(cert.cert.der().to_vec(), cert.key_pair.serialize_der())
}

struct Calculator;

#[async_trait]
impl ServiceHandler for Calculator {
    fn arity_of(&self, method: &str) -> Option<usize> {
        match method {
            "add" => Some(2),
            "fail" => Some(0),
            _ => None,
        }
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ErrorDescriptor> {
        match method {
            "add" => {
                let a = args[0].as_i64().unwrap_or(0);
                let b = args[1].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            }
            _ => Err(ErrorDescriptor::new("ServiceError", "requested failure")
                .with_stack("calculator::fail")),
        }
    }
}

struct Node {
    runtime: Arc<TransportRuntime>,
    identity: TlsIdentity,
}

impl Node {
    fn new(config: RuntimeConfig) -> Self {
        let identity = fresh_identity();
        let runtime = Arc::new(TransportRuntime::new(&identity, config).expect("runtime"));
        Self { runtime, identity }
    }

    fn with_defaults() -> Self {
        Self::new(RuntimeConfig::default())
    }

    async fn listen(&self) -> SocketAddr {
        self.runtime.listen("127.0.0.1:0").await.expect("listen")
    }

    fn endpoint_at(&self, addr: SocketAddr) -> ServiceEndpoint {
        ServiceEndpoint::new(
            Url::parse(&format!("https://127.0.0.1:{}/", addr.port())).expect("url"),
            self.identity.thumbprint(),
        )
    }
}

fn add_request(endpoint: ServiceEndpoint) -> RequestMessage {
    RequestMessage::new(endpoint, "calculator", "add", vec![json!(2), json!(3)])
}

#[tokio::test]
async fn direct_call_cold_then_warm_pool() {
    let server = Node::with_defaults();
    server.runtime.services().register("calculator", Arc::new(Calculator));
    let addr = server.listen().await;

    let client = Node::with_defaults();
    server.runtime.trust().add(client.identity.thumbprint());

    let endpoint = server.endpoint_at(addr);

    // Cold pool: the call dials once and parks the stream afterwards.
    let response = client
        .runtime
        .send(add_request(endpoint.clone()))
        .await
        .expect("cold call");
    assert_eq!(response.result, Ok(json!(5)));
    assert_eq!(client.runtime.pool_idle(&endpoint), 1);
    assert_eq!(client.runtime.dial_count(), 1);

    // Warm pool: the second call reuses the parked stream.
    let response = client
        .runtime
        .send(add_request(endpoint.clone()))
        .await
        .expect("warm call");
    assert_eq!(response.result, Ok(json!(5)));
    assert_eq!(client.runtime.dial_count(), 1);
    assert_eq!(client.runtime.pool_idle(&endpoint), 1);

    client.runtime.shutdown().await;
    server.runtime.shutdown().await;
}

#[tokio::test]
async fn thumbprint_mismatch_is_fatal_and_never_pooled() {
    let server = Node::with_defaults();
    server.runtime.services().register("calculator", Arc::new(Calculator));
    let addr = server.listen().await;

    let client = Node::with_defaults();
    server.runtime.trust().add(client.identity.thumbprint());

    // Pin somebody else's thumbprint for the server's address.
    let wrong = ServiceEndpoint::new(
        Url::parse(&format!("https://127.0.0.1:{}/", addr.port())).expect("url"),
        fresh_identity().thumbprint(),
    );

    let result = client.runtime.send(add_request(wrong.clone())).await;
    match result {
        Err(TransportError::UnknownServerThumbprint { pinned, presented }) => {
            assert_eq!(pinned, wrong.thumbprint.to_string());
            assert_eq!(presented, server.identity.thumbprint().to_string());
        }
        other => panic!("expected UnknownServerThumbprint, got {other:?}"),
    }
    assert_eq!(client.runtime.pool_idle(&wrong), 0);
    // Fatal means fatal: exactly one dial, no retry.
    assert_eq!(client.runtime.dial_count(), 1);

    client.runtime.shutdown().await;
    server.runtime.shutdown().await;
}

#[tokio::test]
async fn untrusted_client_is_closed_before_any_burst() {
    let server = Node::with_defaults();
    server.runtime.services().register("calculator", Arc::new(Calculator));
    let addr = server.listen().await;

    // The server never learns this client's thumbprint.
    let client = Node::with_defaults();
    let endpoint = server.endpoint_at(addr);

    let result = client.runtime.send(add_request(endpoint.clone())).await;
    assert!(result.is_err(), "untrusted client must not complete a call");
    assert_eq!(client.runtime.pool_idle(&endpoint), 0);

    client.runtime.shutdown().await;
    server.runtime.shutdown().await;
}

#[tokio::test]
async fn one_session_carries_several_bursts() {
    let server = Node::with_defaults();
    server.runtime.services().register("calculator", Arc::new(Calculator));
    let addr = server.listen().await;

    let client_identity = fresh_identity();
    server.runtime.trust().add(client_identity.thumbprint());
    let client = SecureClient::new(
        &client_identity,
        SecureClientConfig::default(),
        PoolConfig::default(),
    )
    .expect("client");

    let endpoint = server.endpoint_at(addr);
    let first = add_request(endpoint.clone());
    let second = add_request(endpoint.clone());

    let (a, b) = client
        .execute_transaction(&endpoint, async |exchange| {
            let a = exchange.exchange_as_client(&first).await?;
            exchange.continue_session().await?;
            let b = exchange.exchange_as_client(&second).await?;
            exchange.finish_session().await?;
            Ok((a, b))
        })
        .await
        .expect("transaction");

    assert_eq!(a.result, Ok(json!(5)));
    assert_eq!(b.result, Ok(json!(5)));
    assert_eq!(client.dial_count(), 1);
    assert_eq!(client.idle_connections(&endpoint), 1);

    server.runtime.shutdown().await;
}

#[tokio::test]
async fn polling_roundtrip_through_an_inverted_connection() {
    init_tracing();

    // A listens and carries the queue; B dials out and serves the requests.
    let node_a = Node::new(RuntimeConfig {
        dequeue_wait: Duration::from_millis(300),
        ..RuntimeConfig::default()
    });
    let addr = node_a.listen().await;

    let node_b = Node::with_defaults();
    node_b.runtime.services().register("calculator", Arc::new(Calculator));
    node_a.runtime.trust().add(node_b.identity.thumbprint());

    let subscription = Url::parse("poll://sub-a/").expect("url");
    node_b
        .runtime
        .poll(subscription.clone(), node_a.endpoint_at(addr));

    // Give the poller a moment to establish its first session.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let destination = ServiceEndpoint::new(subscription.clone(), node_b.identity.thumbprint());

    // A third party on A submits a request for B.
    let response = node_a
        .runtime
        .send(add_request(destination.clone()))
        .await
        .expect("first polled call");
    assert_eq!(response.result, Ok(json!(5)));

    // A second request: depending on timing this flows through the same
    // subscriber session (NEXT/PROCEED) or a fresh one after END.
    let response = node_a
        .runtime
        .send(add_request(destination.clone()))
        .await
        .expect("second polled call");
    assert_eq!(response.result, Ok(json!(5)));

    // Outlive one empty dequeue window so the session ends with END and the
    // poller re-dials, then prove the new session works too.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let response = node_a
        .runtime
        .send(add_request(destination.clone()))
        .await
        .expect("call after session turnover");
    assert_eq!(response.result, Ok(json!(5)));

    assert_eq!(node_a.runtime.pending_requests(&subscription), 0);

    node_b.runtime.shutdown().await;
    node_a.runtime.shutdown().await;
}

#[tokio::test]
async fn polled_service_errors_travel_inside_the_response() {
    init_tracing();

    let node_a = Node::with_defaults();
    let addr = node_a.listen().await;

    let node_b = Node::with_defaults();
    node_b.runtime.services().register("calculator", Arc::new(Calculator));
    node_a.runtime.trust().add(node_b.identity.thumbprint());

    let subscription = Url::parse("poll://sub-err/").expect("url");
    node_b
        .runtime
        .poll(subscription.clone(), node_a.endpoint_at(addr));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let destination = ServiceEndpoint::new(subscription, node_b.identity.thumbprint());
    let request = RequestMessage::new(destination, "calculator", "fail", vec![]);

    let response = node_a.runtime.send(request).await.expect("transport ok");
    let descriptor = response.result.expect_err("service must fail");
    assert_eq!(descriptor.kind, "ServiceError");
    assert_eq!(descriptor.remote_stack.as_deref(), Some("calculator::fail"));

    node_b.runtime.shutdown().await;
    node_a.runtime.shutdown().await;
}

#[tokio::test]
async fn polling_timeout_fires_near_the_deadline_and_empties_the_queue() {
    let node_a = Node::new(RuntimeConfig {
        request_timeout: Duration::from_millis(200),
        ..RuntimeConfig::default()
    });

    // No poller anywhere near this subscription.
    let subscription = Url::parse("poll://sub-nobody/").expect("url");
    let destination = ServiceEndpoint::new(subscription.clone(), fresh_identity().thumbprint());

    let started = Instant::now();
    let result = node_a.runtime.send(add_request(destination)).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(TransportError::PollingTimeout { .. })));
    assert!(
        elapsed >= Duration::from_millis(150) && elapsed <= Duration::from_millis(500),
        "deadline drifted: {elapsed:?}"
    );
    assert_eq!(node_a.runtime.pending_requests(&subscription), 0);

    node_a.runtime.shutdown().await;
}

#[tokio::test]
async fn friendly_page_answers_plain_http() {
    let server = Node::new(RuntimeConfig {
        friendly_page: Some(FriendlyPage {
            body: "<html><body>hello, stray browser</body></html>".into(),
            headers: vec![("X-Friendly".into(), "yes".into())],
        }),
        ..RuntimeConfig::default()
    });
    let addr = server.listen().await;

    let mut tcp = TcpStream::connect(addr).await.expect("connect");
    tcp.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .expect("write");

    let mut answer = Vec::new();
    tcp.read_to_end(&mut answer).await.expect("read");
    let answer = String::from_utf8(answer).expect("utf8");

    assert!(answer.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(answer.contains("X-Friendly: yes\r\n"));
    assert!(answer.ends_with("<html><body>hello, stray browser</body></html>"));

    server.runtime.shutdown().await;
}

#[tokio::test]
async fn shutdown_surfaces_to_parked_callers() {
    let node = Node::with_defaults();
    let subscription = Url::parse("poll://sub-shutdown/").expect("url");
    let destination = ServiceEndpoint::new(subscription, fresh_identity().thumbprint());

    let parked = {
        let runtime = node.runtime.clone();
        let request = add_request(destination);
        tokio::spawn(async move { runtime.send(request).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    node.runtime.shutdown().await;

    let result = parked.await.expect("join");
    assert!(matches!(result, Err(TransportError::Shutdown)));
}
