//! Discovery responder: probe in, announcement out, everything else
//! dropped silently.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::UdpSocket;
use wininspectd::backend::{Backend, FakeBackend};
use wininspectd::discovery;
use wininspectd::protocol::DISCOVERY_PROBE;
use wininspectd::state::{Limits, ServerState};

async fn start_responder(tcp_port: u16) -> (std::net::SocketAddr, Arc<ServerState>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let state = Arc::new(ServerState::new(Limits::default(), false, tcp_port));
    let backend: Arc<dyn Backend> = Arc::new(FakeBackend::default());
    tokio::spawn(discovery::serve_discovery(socket, Arc::clone(&state), backend));
    // Give the responder a beat to read env metadata and start listening.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, state)
}

#[tokio::test]
async fn probe_receives_announcement() {
    let (addr, _state) = start_responder(1985).await;

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe.send_to(DISCOVERY_PROBE, addr).await.unwrap();

    let mut buf = [0u8; 512];
    let (len, from) = tokio::time::timeout(Duration::from_secs(2), probe.recv_from(&mut buf))
        .await
        .expect("announcement within the poll timeout")
        .unwrap();
    assert_eq!(from, addr);

    let announcement: Value = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(announcement["type"], "announcement");
    assert_eq!(announcement["port"], 1985);
    assert_eq!(announcement["os"], "windows");
    assert_eq!(announcement["is_wine"], true);
    assert!(announcement["hostname"].is_string());
}

#[tokio::test]
async fn unknown_datagrams_are_dropped() {
    let (addr, _state) = start_responder(1985).await;

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe.send_to(b"NOT_A_PROBE", addr).await.unwrap();
    probe.send_to(DISCOVERY_PROBE, addr).await.unwrap();

    // Only one reply comes back — the one for the real probe.
    let mut buf = [0u8; 512];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), probe.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let announcement: Value = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(announcement["type"], "announcement");

    let silent =
        tokio::time::timeout(Duration::from_millis(200), probe.recv_from(&mut buf)).await;
    assert!(silent.is_err(), "garbage datagram must not be answered");
}

#[tokio::test]
async fn responder_stops_on_shutdown() {
    let (addr, state) = start_responder(1985).await;
    state.shutdown.trigger();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe.send_to(DISCOVERY_PROBE, addr).await.unwrap();
    let mut buf = [0u8; 512];
    let silent =
        tokio::time::timeout(Duration::from_millis(200), probe.recv_from(&mut buf)).await;
    assert!(silent.is_err(), "responder must be gone after shutdown");
}
