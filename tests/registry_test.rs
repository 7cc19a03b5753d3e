//! Multi-component scenarios for the device registry and the tunnel it
//! manages, exercised against real `MuxConnection`s over in-process duplex
//! pipes rather than the registry's internal map directly.

use minibroker_core::handshake;
use minibroker_core::registry::{Registry, TunnelSession};
use minibroker_core::tunnel::{MuxConnection, MuxRole};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn agent_tunnel_pair() -> (MuxConnection, MuxConnection) {
    let (broker_io, agent_io) = tokio::io::duplex(8192);
    (
        MuxConnection::new(broker_io, MuxRole::Client),
        MuxConnection::new(agent_io, MuxRole::Server),
    )
}

/// *Happy path* prerequisite: a registered device can have a fresh stream
/// opened on it, and the handshake exchanged over that stream round-trips
/// exactly as spec.md §9 describes.
#[tokio::test]
async fn open_stream_against_a_registered_device_carries_the_handshake() {
    let registry = Registry::new();
    let (broker_mux, mut agent_mux) = agent_tunnel_pair();
    registry
        .add(
            "default:dev-a".into(),
            TunnelSession::new("default:dev-a".into(), broker_mux),
        )
        .await;

    let agent_side = tokio::spawn(async move {
        let stream = agent_mux.accept_stream().await.expect("stream arrives");
        let (request, mut reader) = handshake::read_request(stream).await.unwrap();
        assert_eq!(
            request,
            handshake::Request::Open {
                session_uid: "sess-1".into()
            }
        );
        handshake::write_ok(&mut reader).await.unwrap();
    });

    let mut stream = registry.open_stream("default:dev-a").await.unwrap();
    stream
        .write_all(handshake::open_request("sess-1").as_bytes())
        .await
        .unwrap();
    stream.flush().await.unwrap();
    handshake::read_ok(&mut stream).await.unwrap();

    agent_side.await.unwrap();
}

/// *Unknown device* scenario: dialing a device id nothing ever registered
/// fails fast with `NotConnected`, never hanging.
#[tokio::test]
async fn open_stream_on_an_unregistered_device_fails_fast() {
    let registry = Registry::new();
    let err = registry.open_stream("default:nowhere").await.unwrap_err();
    assert!(matches!(
        err,
        minibroker_core::error::BrokerError::NotConnected(_)
    ));
}

/// *Reconnect* scenario: a second agent tunnel registering under the same
/// device id displaces the first. Only the new one is reachable afterward,
/// and the old one's transport is observably closed.
#[tokio::test]
async fn a_reconnecting_agent_evicts_its_own_stale_tunnel() {
    let registry = Registry::new();
    let (first_broker, _first_agent) = agent_tunnel_pair();
    let first_closed = first_broker.watch_closed();
    registry
        .add(
            "default:dev-b".into(),
            TunnelSession::new("default:dev-b".into(), first_broker),
        )
        .await;

    let (second_broker, mut second_agent) = agent_tunnel_pair();
    // Register interest in the old tunnel's close signal *before* racing it
    // against the replacement -- `Notify::notify_waiters` only wakes
    // already-registered waiters, so waiting on it after the fact could
    // miss a broadcast that already fired.
    let old_closed = first_closed.notified();
    let add_new = registry.add(
        "default:dev-b".into(),
        TunnelSession::new("default:dev-b".into(), second_broker),
    );
    let ((), closed_result) = tokio::join!(
        add_new,
        tokio::time::timeout(std::time::Duration::from_secs(2), old_closed)
    );
    closed_result.expect("old tunnel closes once displaced");

    // The surviving tunnel is the new one: a stream opened now accepts on
    // the second agent's mux, not the first's.
    let mut opened = registry.open_stream("default:dev-b").await.unwrap();
    opened.write_all(b"ping").await.unwrap();
    opened.flush().await.unwrap();

    let mut accepted = second_agent.accept_stream().await.unwrap();
    let mut buf = [0u8; 4];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    assert!(registry.is_connected("default:dev-b").await);
}
