use super::*;

use crate::connection::ConnectionState;
use shared::EnvelopeKind;

fn connected_registry() -> (SubscriptionRegistry, watch::Sender<ConnectionStatus>) {
    let (tx, rx) = watch::channel(ConnectionStatus {
        state: ConnectionState::Connected,
        retry_count: 0,
        next_retry: None,
    });
    (SubscriptionRegistry::new(rx), tx)
}

fn envelope(channel: Option<&str>, sender: &str, recipient: Option<&str>) -> EventEnvelope {
    let mut envelope = EventEnvelope::delete("m1");
    envelope.kind = EnvelopeKind::Create;
    envelope.channel_id = channel.map(Into::into);
    envelope.sender_id = Some(sender.into());
    envelope.recipient_id = recipient.map(Into::into);
    envelope.content = "hello".into();
    envelope
}

fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str) -> impl EnvelopeHandler + 'static {
    let log = Arc::clone(log);
    let label = label.to_string();
    move |envelope: &EventEnvelope| -> anyhow::Result<()> {
        log.lock()
            .expect("log")
            .push(format!("{label}:{}", envelope.message_id));
        Ok(())
    }
}

#[test]
fn subscribe_requires_connected_state() {
    let (tx, rx) = watch::channel(ConnectionStatus::default());
    let registry = SubscriptionRegistry::new(rx);
    let log = Arc::new(Mutex::new(Vec::new()));

    assert!(registry
        .subscribe(Topic::channel("A"), HandlerId(1), recorder(&log, "a"))
        .is_none());
    assert_eq!(registry.handler_count(&Topic::channel("A")), 0);

    tx.send_replace(ConnectionStatus {
        state: ConnectionState::Connected,
        ..ConnectionStatus::default()
    });
    let handle = registry
        .subscribe(Topic::channel("A"), HandlerId(1), recorder(&log, "a"))
        .expect("subscribed once connected");
    assert_eq!(handle.topic, Topic::channel("A"));
    assert_eq!(handle.handler_id, HandlerId(1));
}

#[test]
fn channel_handler_never_sees_user_only_envelope() {
    let (registry, _tx) = connected_registry();
    let log = Arc::new(Mutex::new(Vec::new()));
    registry.subscribe(Topic::channel("A"), HandlerId(1), recorder(&log, "channel"));

    let delivered = registry.dispatch(&envelope(None, "C", Some("B")));

    assert_eq!(delivered, 0);
    assert!(log.lock().expect("log").is_empty());
}

#[test]
fn direct_envelope_reaches_sender_and_recipient_topics() {
    let (registry, _tx) = connected_registry();
    let log = Arc::new(Mutex::new(Vec::new()));
    registry.subscribe(Topic::user("B"), HandlerId(1), recorder(&log, "recipient"));
    registry.subscribe(Topic::user("C"), HandlerId(2), recorder(&log, "sender"));
    registry.subscribe(Topic::user("D"), HandlerId(3), recorder(&log, "bystander"));

    assert_eq!(
        SubscriptionRegistry::topics_for(&envelope(None, "C", Some("B"))),
        vec![Topic::user("C"), Topic::user("B")]
    );
    assert_eq!(registry.dispatch(&envelope(None, "C", Some("B"))), 2);
    assert_eq!(
        *log.lock().expect("log"),
        vec!["sender:m1".to_string(), "recipient:m1".to_string()]
    );
}

#[test]
fn handler_on_several_matching_topics_runs_once() {
    let (registry, _tx) = connected_registry();
    let log = Arc::new(Mutex::new(Vec::new()));
    registry.subscribe(Topic::channel("A"), HandlerId(9), recorder(&log, "view"));
    registry.subscribe(Topic::user("B"), HandlerId(9), recorder(&log, "view"));

    assert_eq!(registry.dispatch(&envelope(Some("A"), "C", Some("B"))), 1);
    assert_eq!(log.lock().expect("log").len(), 1);
}

#[test]
fn unsubscribe_only_removes_the_named_handler() {
    let (registry, _tx) = connected_registry();
    let log = Arc::new(Mutex::new(Vec::new()));
    let topic = Topic::channel("A");
    registry.subscribe(topic.clone(), HandlerId(1), recorder(&log, "first"));
    registry.subscribe(topic.clone(), HandlerId(2), recorder(&log, "second"));

    assert!(registry.unsubscribe(&topic, HandlerId(1)));
    assert!(!registry.unsubscribe(&topic, HandlerId(1)));
    assert_eq!(registry.handler_count(&topic), 1);

    registry.dispatch(&envelope(Some("A"), "C", None));
    assert_eq!(*log.lock().expect("log"), vec!["second:m1".to_string()]);
}

#[test]
fn resubscribing_same_id_replaces_in_place() {
    let (registry, _tx) = connected_registry();
    let log = Arc::new(Mutex::new(Vec::new()));
    let topic = Topic::channel("A");
    registry.subscribe(topic.clone(), HandlerId(1), recorder(&log, "old"));
    registry.subscribe(topic.clone(), HandlerId(2), recorder(&log, "other"));
    registry.subscribe(topic.clone(), HandlerId(1), recorder(&log, "new"));

    assert_eq!(registry.handler_count(&topic), 2);
    registry.dispatch(&envelope(Some("A"), "C", None));
    assert_eq!(
        *log.lock().expect("log"),
        vec!["new:m1".to_string(), "other:m1".to_string()]
    );
}

#[test]
fn failing_and_panicking_handlers_do_not_stop_later_ones() {
    let (registry, _tx) = connected_registry();
    let log = Arc::new(Mutex::new(Vec::new()));
    let topic = Topic::channel("A");
    registry.subscribe(topic.clone(), HandlerId(1), |_: &EventEnvelope| -> anyhow::Result<()> {
        Err(anyhow::anyhow!("view is gone"))
    });
    registry.subscribe(topic.clone(), HandlerId(2), |_: &EventEnvelope| -> anyhow::Result<()> {
        panic!("handler bug")
    });
    registry.subscribe(topic.clone(), HandlerId(3), recorder(&log, "last"));

    assert_eq!(registry.dispatch(&envelope(Some("A"), "C", None)), 1);
    assert_eq!(*log.lock().expect("log"), vec!["last:m1".to_string()]);
}

#[test]
fn unsubscribe_all_and_clear_drop_registrations() {
    let (registry, _tx) = connected_registry();
    let log = Arc::new(Mutex::new(Vec::new()));
    registry.subscribe(Topic::channel("A"), HandlerId(1), recorder(&log, "a"));
    registry.subscribe(Topic::user("B"), HandlerId(1), recorder(&log, "b"));
    registry.subscribe(Topic::user("B"), HandlerId(2), recorder(&log, "c"));

    assert_eq!(registry.unsubscribe_all(HandlerId(1)), 2);
    assert_eq!(registry.handler_count(&Topic::channel("A")), 0);
    assert_eq!(registry.handler_count(&Topic::user("B")), 1);

    registry.clear();
    assert_eq!(registry.handler_count(&Topic::user("B")), 0);
}

#[test]
fn handler_ids_are_unique() {
    assert_ne!(HandlerId::next(), HandlerId::next());
}

#[tokio::test]
async fn dispatch_loop_forwards_in_arrival_order() {
    let (registry, _tx) = connected_registry();
    let registry = Arc::new(registry);
    let log = Arc::new(Mutex::new(Vec::new()));
    registry.subscribe(Topic::channel("A"), HandlerId(1), recorder(&log, "a"));

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let task = spawn_dispatch_loop(Arc::clone(&registry), inbound_rx);
    for id in ["1", "2", "3"] {
        let mut next = envelope(Some("A"), "C", None);
        next.message_id = id.into();
        inbound_tx.send(next).expect("send");
    }
    drop(inbound_tx);
    task.await.expect("dispatch loop");

    assert_eq!(
        *log.lock().expect("log"),
        vec!["a:1".to_string(), "a:2".to_string(), "a:3".to_string()]
    );
}
