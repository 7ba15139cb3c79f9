//! End-to-end scenarios over loopback TCP: a real server, a real client,
//! real upgrade handshakes.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ocpp_rpc::{
    AuthOutcome, BackoffOptions, CallOptions, ClientOptions, CloseOptions, ErrorCode, Handshake,
    InboundCall, PeerOptions, PeerState, RpcClient, RpcEvent, RpcServer, ServerEvent,
    ServerOptions, StrictMode, Validator,
};
use serde_json::json;
use tokio::sync::Notify;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_server(options: ServerOptions) -> (RpcServer, SocketAddr) {
    init_tracing();
    let server = RpcServer::new(options).expect("server options");
    let addr = server.listen("127.0.0.1:0").await.expect("listen");
    (server, addr)
}

fn client_options(addr: SocketAddr, identity: &str) -> ClientOptions {
    ClientOptions::new(format!("ws://{addr}/ocpp"), identity).reconnect(false)
}

/// Wait for the next accepted peer on a server event stream.
async fn next_client(
    events: &mut tokio::sync::broadcast::Receiver<ServerEvent>,
) -> ocpp_rpc::RpcPeer {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("client event before timeout")
            .expect("event channel open")
        {
            ServerEvent::Client(peer) => return peer,
            ServerEvent::UpgradeAborted { message, .. } => {
                panic!("unexpected upgrade abort: {message}");
            }
        }
    }
}

#[tokio::test]
async fn happy_path_heartbeat() {
    let (server, addr) = start_server(ServerOptions::new()).await;
    let mut server_events = server.events();

    let client = RpcClient::new(client_options(addr, "dev1")).expect("client options");
    let connect = client.connect();
    let (peer, connected) = tokio::join!(next_client(&mut server_events), connect);
    connected.expect("connected");

    peer.handle("Heartbeat", |_call: InboundCall| async move {
        Ok(json!({"currentTime": "2024-01-01T00:00:00Z"}))
    });

    let reply = client.call("Heartbeat", json!({})).await.expect("result");
    assert_eq!(reply, json!({"currentTime": "2024-01-01T00:00:00Z"}));
    assert_eq!(client.bad_message_count(), 0);
    assert_eq!(peer.bad_message_count(), 0);
    assert_eq!(peer.identity(), "dev1");
    assert_eq!(client.state(), PeerState::Open);

    client.close(CloseOptions::new()).await;
}

#[tokio::test]
async fn unanswered_call_times_out_and_signal_fires_on_disconnect() {
    let (server, addr) = start_server(ServerOptions::new()).await;
    let mut server_events = server.events();

    let client = RpcClient::new(client_options(addr, "dev1")).expect("client options");
    let (peer, connected) = tokio::join!(next_client(&mut server_events), client.connect());
    connected.expect("connected");

    let signal_fired = Arc::new(Notify::new());
    let observer = signal_fired.clone();
    peer.handle("Foo", move |call: InboundCall| {
        let fired = signal_fired.clone();
        async move {
            // Never reply; just wait for the disconnect signal.
            call.signal.cancelled().await;
            fired.notify_one();
            Ok(json!({}))
        }
    });

    let started = std::time::Instant::now();
    let error = client
        .call_with_options(
            "Foo",
            json!({}),
            CallOptions::new().timeout(Duration::from_millis(100)),
        )
        .await
        .expect_err("timeout");
    assert_eq!(error.code, ErrorCode::GenericError);
    assert_eq!(error.description, "Call timeout");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(80), "too fast: {elapsed:?}");

    client
        .close(CloseOptions::new().code(1000).force(true))
        .await;
    tokio::time::timeout(Duration::from_secs(5), observer.notified())
        .await
        .expect("handler signal fired on disconnect");
}

fn ocpp16_validator() -> Arc<Validator> {
    Arc::new(
        Validator::new(
            "ocpp1.6",
            vec![
                json!({
                    "$id": "urn:BootNotification.req",
                    "type": "object",
                    "properties": {
                        "chargePointVendor": {"type": "string"},
                        "chargePointModel": {"type": "string"},
                    },
                    "required": ["chargePointVendor", "chargePointModel"],
                }),
                json!({
                    "$id": "urn:BootNotification.conf",
                    "type": "object",
                    "required": ["status", "currentTime", "interval"],
                }),
                json!({"$id": "urn:Heartbeat.req", "type": "object"}),
                json!({"$id": "urn:Heartbeat.conf", "type": "object"}),
            ],
        )
        .expect("schemas compile"),
    )
}

#[tokio::test]
async fn strict_client_rejects_invalid_inbound_call_without_invoking_handler() {
    let server_options = ServerOptions::new().peer(PeerOptions::new().protocols(["ocpp1.6"]));
    let (server, addr) = start_server(server_options).await;
    let mut server_events = server.events();

    let mut options = client_options(addr, "dev1");
    options.peer = PeerOptions::new()
        .protocols(["ocpp1.6"])
        .strict_mode(StrictMode::All)
        .strict_validators([ocpp16_validator()]);
    let client = RpcClient::new(options).expect("client options");

    let handled = Arc::new(AtomicUsize::new(0));
    let handled_in_handler = handled.clone();
    client.handle("BootNotification", move |_call: InboundCall| {
        let handled = handled_in_handler.clone();
        async move {
            handled.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    });

    let (peer, connected) = tokio::join!(next_client(&mut server_events), client.connect());
    let negotiated = connected.expect("connected");
    assert_eq!(negotiated.as_deref(), Some("ocpp1.6"));

    // Missing required fields: the client must answer with the mapped wire
    // error before any handler runs.
    let error = peer
        .call("BootNotification", json!({"chargePointVendor": "acme"}))
        .await
        .expect_err("schema violation");
    assert_eq!(error.code, ErrorCode::OccurenceConstraintViolation);
    assert_eq!(handled.load(Ordering::SeqCst), 0);

    // A conforming call goes through.
    peer.call(
        "BootNotification",
        json!({"chargePointVendor": "acme", "chargePointModel": "one"}),
    )
    .await
    .expect("valid call");
    assert_eq!(handled.load(Ordering::SeqCst), 1);

    client.close(CloseOptions::new()).await;
}

#[tokio::test]
async fn call_concurrency_caps_in_flight_calls() {
    let server_options = ServerOptions::new().peer(PeerOptions::new().call_concurrency(8));
    let (server, addr) = start_server(server_options).await;
    let mut server_events = server.events();

    let mut options = client_options(addr, "dev1");
    options.peer = PeerOptions::new().call_concurrency(2);
    let client = Arc::new(RpcClient::new(options).expect("client options"));

    let entered = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(tokio::sync::Semaphore::new(0));

    let (peer, connected) = tokio::join!(next_client(&mut server_events), client.connect());
    connected.expect("connected");

    let handler_entered = entered.clone();
    let handler_gate = gate.clone();
    peer.handle("Slow", move |_call: InboundCall| {
        let entered = handler_entered.clone();
        let gate = handler_gate.clone();
        async move {
            entered.fetch_add(1, Ordering::SeqCst);
            let permit = gate.acquire().await.expect("gate open");
            permit.forget();
            Ok(json!({}))
        }
    });

    let mut calls = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client.call("Slow", json!({})).await
        }));
    }

    // Only two calls may be on the wire while none has been answered.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(entered.load(Ordering::SeqCst), 2);

    // Releasing one response lets the third call leave the queue.
    gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(entered.load(Ordering::SeqCst), 3);

    gate.add_permits(2);
    for call in calls {
        call.await.expect("join").expect("call ok");
    }

    client.close(CloseOptions::new()).await;
}

#[tokio::test]
async fn basic_auth_allows_colons_in_identity_and_password() {
    let (server, addr) = start_server(ServerOptions::new()).await;
    let mut server_events = server.events();

    server.auth(|handshake: Handshake| async move {
        if handshake.identity == "dev:1" && handshake.password.as_deref() == Some(b"p:q") {
            AuthOutcome::accept().with_session(Arc::new(String::from("session-1")) as _)
        } else {
            AuthOutcome::reject(401, "Unauthorized")
        }
    });

    let client = RpcClient::new(client_options(addr, "dev:1").password(*b"p:q"))
        .expect("client options");
    let (peer, connected) = tokio::join!(next_client(&mut server_events), client.connect());
    connected.expect("accepted");

    assert_eq!(peer.identity(), "dev:1");
    let session = peer.session().expect("session set");
    let session = session
        .downcast_ref::<String>()
        .expect("session is the string we stored");
    assert_eq!(session, "session-1");

    let handshake = peer.handshake().expect("handshake kept");
    assert_eq!(handshake.password.as_deref(), Some(b"p:q".as_slice()));

    client.close(CloseOptions::new()).await;
}

#[tokio::test]
async fn rejected_auth_surfaces_http_status() {
    let (server, addr) = start_server(ServerOptions::new()).await;

    server.auth(|_handshake: Handshake| async move { AuthOutcome::reject(401, "Unauthorized") });

    let client =
        RpcClient::new(client_options(addr, "dev1").password(b"wrong".to_vec())).expect("options");
    let error = client.connect().await.expect_err("rejected");
    match error {
        ocpp_rpc::Error::Handshake { status, .. } => assert_eq!(status, 401),
        other => panic!("expected handshake rejection, got {other}"),
    }
}

#[tokio::test]
async fn missing_subprotocol_is_fatal_and_gives_up() {
    // The server offers no protocols, so negotiation selects none while the
    // client requires one.
    let (server, addr) = start_server(ServerOptions::new()).await;
    let _keep = server;

    let mut options = client_options(addr, "dev1")
        .reconnect(true)
        .max_reconnects(Some(5));
    options.peer = PeerOptions::new().protocols(["ocpp1.6"]);
    let client = RpcClient::new(options).expect("client options");
    let mut events = client.events();

    let error = client.connect().await.expect_err("no subprotocol");
    assert!(error.is_fatal());
    assert_eq!(error.to_string(), "Server sent no subprotocol");

    // Fatal errors do not reconnect; the client gives up with 1001.
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event")
            .expect("open")
        {
            RpcEvent::Close(info) => {
                assert_eq!(info.code, 1001);
                break;
            }
            RpcEvent::Connecting { attempt } => {
                assert_eq!(attempt, 0, "no reconnect attempts after a fatal error");
            }
            _ => {}
        }
    }
    assert_eq!(client.state(), PeerState::Closed);
}

#[tokio::test]
async fn client_reconnects_after_server_side_drop() {
    let (server, addr) = start_server(ServerOptions::new()).await;
    let mut server_events = server.events();

    let mut options = client_options(addr, "dev1").reconnect(true);
    options.backoff = BackoffOptions {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        factor: 2.0,
        randomisation_factor: 0.0,
    };
    let client = RpcClient::new(options).expect("client options");

    let (first_peer, connected) = tokio::join!(next_client(&mut server_events), client.connect());
    connected.expect("connected");

    // Kill the connection from the server side without a graceful exchange.
    first_peer
        .close(CloseOptions::new().code(1001).force(true))
        .await;

    // The client comes back on its own.
    let second_peer = next_client(&mut server_events).await;
    assert_eq!(second_peer.identity(), "dev1");

    second_peer.handle("Heartbeat", |_call: InboundCall| async move {
        Ok(json!({"currentTime": "2024-01-01T00:00:01Z"}))
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if client.state() == PeerState::Open {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client reopened");

    client
        .call("Heartbeat", json!({}))
        .await
        .expect("call after reconnect");

    client.close(CloseOptions::new()).await;
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    init_tracing();
    // Bind a port, learn it, then drop the listener so connects are refused.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let mut options = client_options(addr, "dev1")
        .reconnect(true)
        .max_reconnects(Some(2));
    options.backoff = BackoffOptions {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(50),
        factor: 2.0,
        randomisation_factor: 0.0,
    };
    let client = RpcClient::new(options).expect("client options");
    let mut events = client.events();

    client.connect().await.expect_err("nothing listening");

    let mut attempts_seen = 0;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event")
            .expect("open")
        {
            RpcEvent::Connecting { attempt } => attempts_seen = attempts_seen.max(attempt),
            RpcEvent::Close(info) => {
                assert_eq!(info.code, 1001);
                assert_eq!(info.reason, "Giving up");
                break;
            }
            _ => {}
        }
    }
    assert_eq!(attempts_seen, 2);
    assert_eq!(client.state(), PeerState::Closed);
}

#[tokio::test]
async fn plain_http_request_gets_404_with_server_header() {
    let (server, addr) = start_server(ServerOptions::new()).await;
    let _keep = server;

    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    tokio::io::AsyncWriteExt::write_all(
        &mut stream,
        b"GET /anything HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await
    .expect("write request");

    let mut response = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut response)
        .await
        .expect("read response");
    let response = String::from_utf8_lossy(&response);
    assert!(
        response.starts_with("HTTP/1.1 404"),
        "fallback must be 404, got: {response}"
    );
    assert!(
        response.to_ascii_lowercase().contains("server: ocpp-rpc/"),
        "missing Server header: {response}"
    );
}

#[tokio::test]
async fn server_close_fans_out_to_all_peers() {
    let (server, addr) = start_server(ServerOptions::new()).await;
    let mut server_events = server.events();

    let client_a = RpcClient::new(client_options(addr, "devA")).expect("options");
    let (_peer_a, connected) = tokio::join!(next_client(&mut server_events), client_a.connect());
    connected.expect("a connected");

    let client_b = RpcClient::new(client_options(addr, "devB")).expect("options");
    let (_peer_b, connected) = tokio::join!(next_client(&mut server_events), client_b.connect());
    connected.expect("b connected");

    assert_eq!(server.clients().len(), 2);
    let infos = server
        .close(CloseOptions::new().code(1001).reason("Shutting down"))
        .await;
    assert_eq!(infos.len(), 2);

    for client in [&client_a, &client_b] {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if client.state() == PeerState::Closed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("client saw the shutdown");
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.clients().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("registry drained");
}
