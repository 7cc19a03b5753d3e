//! Scenario-level coverage for the broker-side session bridge's `Created
//! -> Dialed -> Evaluated` walk, driven against a real registered tunnel
//! rather than mocked registry internals.

use minibroker_core::broker::session::{SessionBridge, SessionState};
use minibroker_core::handshake;
use minibroker_core::registry::{Registry, TunnelSession};
use minibroker_core::sshid::SshId;
use minibroker_core::tunnel::{MuxConnection, MuxRole};

async fn registered_device(registry: &Registry, device_id: &str) -> MuxConnection {
    let (broker_io, agent_io) = tokio::io::duplex(8192);
    let broker_mux = MuxConnection::new(broker_io, MuxRole::Client);
    let agent_mux = MuxConnection::new(agent_io, MuxRole::Server);
    registry
        .add(
            device_id.to_string(),
            TunnelSession::new(device_id.to_string(), broker_mux),
        )
        .await;
    agent_mux
}

/// *Happy path* prerequisite: dialing a registered device walks
/// `Created -> Dialed`, exchanging the exact `GET /ssh/<uid>` / `200 OK`
/// handshake spec.md §9 requires, and `evaluate()` (the policy stub) then
/// advances it to `Evaluated` without altering anything else.
#[tokio::test]
async fn dial_then_evaluate_reaches_evaluated_against_a_live_agent() {
    let registry = Registry::new();
    let mut agent_mux = registered_device(&registry, "default:dev-c").await;

    let mut bridge = SessionBridge::new(
        "session-xyz".into(),
        SshId::parse("root@dev-c"),
        registry.clone(),
    );

    let agent_side = tokio::spawn(async move {
        let stream = agent_mux.accept_stream().await.expect("broker dials in");
        let (request, mut reader) = handshake::read_request(stream).await.unwrap();
        assert_eq!(
            request,
            handshake::Request::Open {
                session_uid: "session-xyz".into()
            }
        );
        handshake::write_ok(&mut reader).await.unwrap();
    });

    bridge.dial().await.expect("dial succeeds against a live tunnel");
    assert_eq!(bridge.state(), SessionState::Dialed);

    bridge.evaluate();
    assert_eq!(bridge.state(), SessionState::Evaluated);

    agent_side.await.unwrap();
}

/// *Bad SSHID falling through to unknown-device* scenario: an unparseable
/// login still produces a usable (if probably unintended) `SshId`, and
/// dialing it against a registry with no matching device fails exactly
/// like a plain unknown-device dial would -- no special-cased panic or
/// hang for the malformed-login path.
#[tokio::test]
async fn a_malformed_login_falls_through_to_the_unknown_device_path() {
    let registry = Registry::new();
    let login = "root@extra@dev-z";
    assert!(!SshId::is_well_formed(login));

    let sshid = SshId::parse(login);
    let mut bridge = SessionBridge::new("session-abc".into(), sshid, registry);

    let err = bridge.dial().await.unwrap_err();
    assert!(matches!(
        err,
        minibroker_core::error::BrokerError::NotConnected(_)
    ));
    assert_eq!(bridge.state(), SessionState::Created);
}

/// A stream opened for a session that the agent never acknowledges (it
/// closes the stream without writing the `200 OK`) surfaces as a dial
/// failure rather than hanging.
#[tokio::test]
async fn dial_fails_if_the_agent_never_acknowledges_the_handshake() {
    let registry = Registry::new();
    let mut agent_mux = registered_device(&registry, "default:dev-d").await;

    let mut bridge = SessionBridge::new(
        "session-no-ack".into(),
        SshId::parse("root@dev-d"),
        registry.clone(),
    );

    let agent_side = tokio::spawn(async move {
        let stream = agent_mux.accept_stream().await.expect("broker dials in");
        // Accept the stream but drop it immediately instead of answering
        // the handshake -- simulates an agent that bridges the stream to
        // nothing.
        drop(stream);
    });

    let err = bridge.dial().await.unwrap_err();
    assert!(matches!(
        err,
        minibroker_core::error::BrokerError::Io(_) | minibroker_core::error::BrokerError::ProtocolError(_)
    ));

    agent_side.await.unwrap();
}
