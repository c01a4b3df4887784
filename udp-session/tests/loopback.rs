//! Integration tests for the async endpoint over the loopback interface.
//!
//! A server endpoint accepts unknown peers and echoes payloads; a client
//! endpoint connects to it.  Both event loops run as tokio tasks.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::timeout;

use udp_session::host::{slot_bit, SERVER_ONLY, SERVER_SLOT};
use udp_session::{Endpoint, EndpointConfig, EndpointHandle, Event, Payload};

const WAIT: Duration = Duration::from_secs(10);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn server() -> EndpointHandle {
    let config = EndpointConfig {
        bind: loopback(),
        accept_unknown: true,
        tick_interval: Duration::from_millis(1),
        ..EndpointConfig::default()
    };
    Endpoint::bind(config).await.expect("bind server").run()
}

async fn client(server: SocketAddr) -> EndpointHandle {
    let config = EndpointConfig {
        bind: loopback(),
        slots: 1,
        local_slot: 1,
        tick_interval: Duration::from_millis(1),
        ..EndpointConfig::default()
    };
    let mut endpoint = Endpoint::bind(config).await.expect("bind client");
    endpoint.connect(SERVER_SLOT, server).expect("connect");
    endpoint.run()
}

/// Wait for the next delivered payload, skipping other events.
async fn next_delivery(handle: &mut EndpointHandle) -> (Option<u8>, Payload) {
    loop {
        match handle.recv().await.expect("endpoint stopped") {
            Event::Delivered(d) => return (d.from, d.payload),
            _ => continue,
        }
    }
}

// ---------------------------------------------------------------------------
// Test 1: echo through a server
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_echo_round_trip() {
    const COUNT: usize = 20;

    let mut server = server().await;
    let server_addr = server.local_addr;

    let echo = tokio::spawn(async move {
        for _ in 0..COUNT {
            let (from, mut payload) = next_delivery(&mut server).await;
            let from = from.expect("payload from a connection");
            payload.distribution = slot_bit(from);
            server.send(payload).await.expect("echo");
        }
        server
    });

    let mut client = client(server_addr).await;
    for i in 0..COUNT {
        let mut payload = Payload::new(7, format!("msg-{i}").into_bytes());
        payload.distribution = SERVER_ONLY;
        client.send(payload).await.expect("send");
    }

    let received = timeout(WAIT, async {
        let mut received = Vec::new();
        while received.len() < COUNT {
            let (from, payload) = next_delivery(&mut client).await;
            assert_eq!(from, Some(SERVER_SLOT));
            received.push(String::from_utf8(payload.data).unwrap());
        }
        received
    })
    .await
    .expect("echoes did not arrive in time");

    let expected: Vec<String> = (0..COUNT).map(|i| format!("msg-{i}")).collect();
    assert_eq!(received, expected);

    let status = client
        .status(SERVER_SLOT)
        .await
        .unwrap()
        .expect("server slot open");
    assert_eq!(status.peer, server_addr);

    let server = timeout(WAIT, echo).await.expect("echo task").unwrap();
    assert!(server.status(1).await.unwrap().is_some());

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test 2: server announces an accepted peer, close is reported
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_accept_and_close_events() {
    let mut server = server().await;
    let client = client(server.local_addr).await;

    let opened = timeout(WAIT, server.recv())
        .await
        .expect("no event")
        .expect("server stopped");
    let slot = match opened {
        Event::Opened { slot, .. } => slot,
        other => panic!("expected Opened, got {other:?}"),
    };
    assert_eq!(slot, 1);

    server.close_slot(slot).await.unwrap();
    let closed = timeout(WAIT, async {
        loop {
            match server.recv().await {
                Some(Event::Closed { slot }) => return slot,
                Some(_) => continue,
                None => panic!("server stopped"),
            }
        }
    })
    .await
    .expect("close not reported");
    assert_eq!(closed, 1);

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let config = EndpointConfig {
        bind: loopback(),
        slots: 0,
        ..EndpointConfig::default()
    };
    assert!(Endpoint::bind(config).await.is_err());
}
