//! IPC protocol and registry behavior through the public API.

use serde_json::json;
use tokio::sync::mpsc;

use trinityd::ipc::protocol::{self, IpcMessage};
use trinityd::ipc::registry::{
    ConnectionMetadata, ConnectionRegistry, DaemonConnection, OutboundFrame,
};

fn connection(
    id: &str,
    user: &str,
    last_seen: i64,
) -> (DaemonConnection, mpsc::UnboundedReceiver<OutboundFrame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        DaemonConnection {
            connection_id: id.to_string(),
            user_id: user.to_string(),
            outbound: tx,
            connected_at: 0,
            last_seen_at: last_seen,
            metadata: ConnectionMetadata::default(),
        },
        rx,
    )
}

#[test]
fn every_canonical_message_survives_a_round_trip() {
    let samples = vec![
        json!({"type":"hello","clientId":"c","sentAt":"t"}),
        json!({"type":"hello_ack","connectionId":"id","serverTime":"t"}),
        json!({"type":"heartbeat","sentAt":"t"}),
        json!({"type":"event","eventType":"fs","eventId":"e","sentAt":"t","payload":{"k":1}}),
        json!({"type":"command","commandId":"c","name":"restart","issuedAt":"t"}),
        json!({"type":"command_result","commandId":"c","ok":false,"respondedAt":"t","error":"nope"}),
        json!({"type":"error","message":"m","sentAt":"t","code":"invalid_json"}),
    ];
    for sample in samples {
        let msg = protocol::parse(&sample.to_string()).unwrap();
        let reparsed = protocol::parse(&msg.to_wire()).unwrap();
        assert_eq!(msg, reparsed);
    }
}

#[test]
fn unsupported_type_error_is_verbatim() {
    let err = protocol::parse(r#"{"type":"metrics","sentAt":"t"}"#).unwrap_err();
    assert_eq!(err, "Unsupported IPC message type: metrics");
}

#[test]
fn command_fan_out_reaches_exactly_the_target_user() {
    let registry = ConnectionRegistry::new();
    let (a1, mut rx_a1) = connection("a1", "userA", 0);
    let (a2, mut rx_a2) = connection("a2", "userA", 0);
    let (b1, mut rx_b1) = connection("b1", "userB", 0);
    registry.register(a1);
    registry.register(a2);
    registry.register(b1);

    let (command_id, cmd) = protocol::build_command("sync", None);
    let delivery = registry.send_command_to_user("userA", &cmd);

    assert!(delivery.ok);
    assert_eq!(delivery.sent_count, 2);
    let mut ids = delivery.connection_ids.clone();
    ids.sort();
    assert_eq!(ids, vec!["a1", "a2"]);

    for rx in [&mut rx_a1, &mut rx_a2] {
        match rx.try_recv().unwrap() {
            OutboundFrame::Text(wire) => match protocol::parse(&wire).unwrap() {
                IpcMessage::Command {
                    command_id: got, ..
                } => assert_eq!(got, command_id),
                other => panic!("unexpected message: {other:?}"),
            },
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert!(rx_b1.try_recv().is_err(), "userB must receive nothing");
}

#[test]
fn stale_connection_is_reaped_without_disturbing_the_rest() {
    let registry = ConnectionRegistry::new();
    let (stale, mut rx_stale) = connection("stale", "userA", 0);
    let (fresh, _rx_fresh) = connection("fresh", "userA", 110_000);
    registry.register(stale);
    registry.register(fresh);

    // last seen 120_000 ms ago with a 90_000 ms timeout.
    let reaped = registry.sweep(120_000, 90_000);

    assert_eq!(reaped, vec!["stale"]);
    assert_eq!(rx_stale.try_recv().unwrap(), OutboundFrame::Terminate);
    let remaining = registry.list(None);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].connection_id, "fresh");

    // Fan-out still works for the surviving connection.
    let (_, cmd) = protocol::build_command("noop", None);
    assert!(registry.send_command_to_user("userA", &cmd).ok);
}

#[test]
fn double_register_keeps_one_entry() {
    let registry = ConnectionRegistry::new();
    let (first, _rx1) = connection("dup", "userA", 1);
    let (second, _rx2) = connection("dup", "userA", 2);
    registry.register(first);
    registry.register(second);
    assert_eq!(
        registry
            .list(None)
            .iter()
            .filter(|c| c.connection_id == "dup")
            .count(),
        1
    );
}
