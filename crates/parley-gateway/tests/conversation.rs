use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use parley_db::Database;
use parley_gateway::{Gateway, GroupName, SessionState};
use parley_types::events::ServerEvent;
use parley_types::models::{MessageStatus, UserId};

fn setup() -> (Gateway, UserId, UserId) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let a = db.create_user("UserA", "100").unwrap();
    let b = db.create_user("UserB", "200").unwrap();
    (Gateway::local(db), a, b)
}

fn drain(rx: &mut UnboundedReceiver<Arc<str>>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        events.push(serde_json::from_str(&frame).unwrap());
    }
    events
}

fn status_updates(events: &[ServerEvent]) -> Vec<(Vec<i64>, MessageStatus)> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::StatusUpdate { msg_ids, new_status } => Some((msg_ids.clone(), *new_status)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn send_deliver_read_round() {
    let (gw, a, b) = setup();
    let room = GroupName::conversation(a, b);

    let (mut alice, mut alice_rx) = gw.connect(vec![room.clone()]).await;
    alice
        .handle_text(&format!(r#"{{"action":"identify_user","user_id":{a}}}"#))
        .await;

    let (mut bob, mut bob_rx) = gw.connect(vec![room.clone()]).await;
    bob.handle_text(&format!(r#"{{"action":"identify_user","user_id":"{b}"}}"#))
        .await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    // B writes to A while both sit in the room
    bob.handle_text(&format!(
        r#"{{"action":"send_message","message":"hello","sender_id":{b},"receiver_id":{a}}}"#
    ))
    .await;

    let seen_by_alice = drain(&mut alice_rx);
    let seen_by_bob = drain(&mut bob_rx);
    assert_eq!(seen_by_alice, seen_by_bob);
    let msg_id = match seen_by_alice.as_slice() {
        [ServerEvent::ChatMessage { msg_id, message, sender_id, receiver_id, status, .. }] => {
            assert_eq!(message.as_deref(), Some("hello"));
            assert_eq!((*sender_id, *receiver_id), (b, a));
            assert_eq!(*status, MessageStatus::Sent);
            *msg_id
        }
        other => panic!("expected one chat_message, got {:?}", other),
    };

    alice
        .handle_text(&format!(r#"{{"action":"receiver_connected","receiver_id":{a}}}"#))
        .await;
    let events = drain(&mut bob_rx);
    assert_eq!(status_updates(&events), vec![(vec![msg_id], MessageStatus::Delivered)]);

    alice
        .handle_text(&format!(
            r#"{{"action":"mark_read","reader_id":{a},"other_user_id":{b}}}"#
        ))
        .await;
    let events = drain(&mut bob_rx);
    assert_eq!(status_updates(&events), vec![(vec![msg_id], MessageStatus::Read)]);

    // Repeats are no-ops and publish nothing
    alice
        .handle_text(&format!(
            r#"{{"action":"mark_read","reader_id":{a},"other_user_id":{b}}}"#
        ))
        .await;
    assert!(drain(&mut bob_rx).is_empty());

    let stored = gw.delivery().get(msg_id).unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Read);
    assert!(stored.delivered_at.is_some());
    assert!(stored.seen_at.is_some());
}

#[tokio::test]
async fn unidentified_sender_and_both_sides_see_status() {
    let (gw, a, b) = setup();
    let room = GroupName::conversation(a, b);

    let (mut alice, mut alice_rx) = gw.connect(vec![room.clone()]).await;
    alice
        .handle_text(&format!(r#"{{"action":"identify_user","user_id":{a}}}"#))
        .await;
    let (mut bob, mut bob_rx) = gw.connect(vec![room.clone()]).await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    // Bob never identifies; the payload sender is used
    bob.handle_text(&format!(
        r#"{{"action":"send_message","message":"hi A","sender_id":"{b}","receiver_id":{a}}}"#
    ))
    .await;
    assert_eq!(bob.state(), SessionState::Unidentified);

    let msg_id = match drain(&mut alice_rx).as_slice() {
        [ServerEvent::ChatMessage { msg_id, sender_id, receiver_id, status, .. }] => {
            assert_eq!((*sender_id, *receiver_id), (b, a));
            assert_eq!(*status, MessageStatus::Sent);
            *msg_id
        }
        other => panic!("expected one chat_message, got {:?}", other),
    };
    assert_eq!(drain(&mut bob_rx).len(), 1);

    alice
        .handle_text(&format!(r#"{{"action":"receiver_connected","receiver_id":{a}}}"#))
        .await;
    let delivered = vec![(vec![msg_id], MessageStatus::Delivered)];
    assert_eq!(status_updates(&drain(&mut alice_rx)), delivered);
    assert_eq!(status_updates(&drain(&mut bob_rx)), delivered);

    alice
        .handle_text(&format!(
            r#"{{"action":"mark_read","reader_id":{a},"other_user_id":{b}}}"#
        ))
        .await;
    let read = vec![(vec![msg_id], MessageStatus::Read)];
    assert_eq!(status_updates(&drain(&mut alice_rx)), read);
    assert_eq!(status_updates(&drain(&mut bob_rx)), read);
}

#[tokio::test]
async fn heartbeat_before_identify_changes_nothing_visible() {
    let (gw, a, _b) = setup();
    let (mut session, mut rx) = gw.connect(vec![GroupName::global()]).await;

    session
        .handle_text(&format!(r#"{{"action":"heartbeat","user_id":{a}}}"#))
        .await;

    assert_eq!(session.state(), SessionState::Unidentified);
    assert!(drain(&mut rx).is_empty());
    let snapshot = gw.presence().query(a).unwrap().unwrap();
    assert!(!snapshot.online);
    assert!(snapshot.last_seen.is_some());
}

#[tokio::test]
async fn second_device_keeps_user_online() {
    let (gw, a, b) = setup();
    let (mut watcher, mut watcher_rx) = gw.connect(vec![GroupName::global()]).await;
    watcher.handle_text(&format!(r#"{{"action":"identify_user","user_id":{b}}}"#)).await;

    let (mut phone, _phone_rx) = gw.connect(vec![GroupName::global()]).await;
    let (mut laptop, _laptop_rx) = gw.connect(vec![GroupName::global()]).await;
    phone.handle_text(&format!(r#"{{"action":"identify_user","user_id":{a}}}"#)).await;
    laptop.handle_text(&format!(r#"{{"action":"identify_user","user_id":{a}}}"#)).await;
    drain(&mut watcher_rx);

    phone.disconnect().await;
    assert!(drain(&mut watcher_rx).is_empty());
    assert!(gw.presence().query(a).unwrap().unwrap().online);

    laptop.disconnect().await;
    match drain(&mut watcher_rx).as_slice() {
        [ServerEvent::PresenceUpdate { user_id, is_online, last_seen }] => {
            assert_eq!(*user_id, a);
            assert!(!is_online);
            assert!(last_seen.is_some());
        }
        other => panic!("expected one offline presence_update, got {:?}", other),
    }
}

#[tokio::test]
async fn disconnected_session_receives_nothing() {
    let (gw, a, b) = setup();
    let room = GroupName::conversation(a, b);
    let (mut alice, mut alice_rx) = gw.connect(vec![room.clone()]).await;
    let (mut bob, mut bob_rx) = gw.connect(vec![room.clone()]).await;
    bob.handle_text(&format!(r#"{{"action":"identify_user","user_id":{b}}}"#)).await;

    alice.disconnect().await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    bob.handle_text(&format!(
        r#"{{"action":"send_message","message":"anyone?","receiver_id":{a}}}"#
    ))
    .await;

    assert!(alice_rx.try_recv().is_err());
    assert_eq!(drain(&mut bob_rx).len(), 1);
    assert_eq!(gw.registry().sessions_in(&room).await, vec![bob.id()]);
}

#[tokio::test]
async fn redaction_reaches_both_sides() {
    let (gw, a, b) = setup();
    let room = GroupName::conversation(a, b);
    let (mut alice, mut alice_rx) = gw.connect(vec![room.clone()]).await;
    let (_bob, mut bob_rx) = gw.connect(vec![room]).await;
    alice.handle_text(&format!(r#"{{"action":"identify_user","user_id":{a}}}"#)).await;
    alice
        .handle_text(&format!(r#"{{"action":"send_message","message":"oops","receiver_id":{b}}}"#))
        .await;
    let msg_id = match drain(&mut bob_rx).last() {
        Some(ServerEvent::ChatMessage { msg_id, .. }) => *msg_id,
        other => panic!("expected chat_message, got {:?}", other),
    };
    drain(&mut alice_rx);

    alice
        .handle_text(&format!(
            r#"{{"action":"delete_message","msg_id":{msg_id},"for_everyone":true}}"#
        ))
        .await;

    let expected = ServerEvent::DeleteMessage { msg_id, for_everyone: true };
    assert_eq!(drain(&mut alice_rx), vec![expected.clone()]);
    assert_eq!(drain(&mut bob_rx), vec![expected]);

    // Unknown ids publish nothing
    alice
        .handle_text(r#"{"action":"delete_message","msg_id":987654}"#)
        .await;
    assert!(drain(&mut bob_rx).is_empty());
}

#[tokio::test]
async fn cluster_fanout_spans_instances() {
    use std::time::Duration;

    use parley_gateway::fanout::ClusterFanout;
    use parley_gateway::registry::SessionRegistry;
    use tokio::sync::broadcast;

    let db = Arc::new(Database::open_in_memory().unwrap());
    let a = db.create_user("UserA", "100").unwrap();
    let b = db.create_user("UserB", "200").unwrap();
    let room = GroupName::conversation(a, b);

    let (bus, _) = broadcast::channel(64);
    let instance = |bus: broadcast::Sender<_>| {
        let registry = Arc::new(SessionRegistry::new());
        let (fanout, _relay) = ClusterFanout::start(registry.clone(), bus);
        Gateway::new(db.clone(), registry, fanout)
    };
    let gw_one = instance(bus.clone());
    let gw_two = instance(bus.clone());

    let (_alice, mut alice_rx) = gw_one.connect(vec![room.clone()]).await;
    let (mut bob, _bob_rx) = gw_two.connect(vec![room.clone()]).await;

    bob.handle_text(&format!(
        r#"{{"action":"send_message","message":"across","sender_id":{b},"receiver_id":{a}}}"#
    ))
    .await;

    let frame = tokio::time::timeout(Duration::from_secs(2), alice_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match serde_json::from_str::<ServerEvent>(&frame).unwrap() {
        ServerEvent::ChatMessage { message, sender_id, .. } => {
            assert_eq!(message.as_deref(), Some("across"));
            assert_eq!(sender_id, b);
        }
        other => panic!("expected chat_message, got {:?}", other),
    }
}
