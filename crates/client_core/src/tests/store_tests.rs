use super::*;
use chrono::{DateTime, TimeZone, Utc};
use shared::domain::{ConversationKey, DeliveryState, UserId};

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

fn message(id: &str, created: i64) -> Message {
    Message {
        id: MessageId::from(id),
        conversation: ConversationKey::new(UserId(1), UserId(2), None),
        sender_id: UserId(2),
        receiver_id: UserId(1),
        body: format!("body {id}"),
        created_at: at(created),
        updated_at: at(created),
        read_at: None,
        delivery_state: DeliveryState::Confirmed,
        client_ref: None,
    }
}

#[test]
fn snapshot_orders_by_creation_then_id() {
    let mut store = MessageStore::new();
    store.upsert(message("c", 20));
    store.upsert(message("b", 10));
    store.upsert(message("a", 10));

    let ids: Vec<_> = store
        .snapshot()
        .into_iter()
        .map(|message| message.id.0)
        .collect();
    assert_eq!(ids, ["a", "b", "c"]);
}

#[test]
fn take_dirty_resets_after_each_read() {
    let mut store = MessageStore::new();
    assert!(!store.take_dirty());
    store.upsert(message("a", 0));
    assert!(store.take_dirty());
    assert!(!store.take_dirty());
}

#[test]
fn removing_absent_id_leaves_store_clean() {
    let mut store = MessageStore::new();
    assert!(store.remove(&MessageId::from("missing")).is_none());
    assert!(!store.take_dirty());
}

#[test]
fn update_only_marks_dirty_when_closure_reports_change() {
    let mut store = MessageStore::new();
    store.upsert(message("a", 0));
    store.take_dirty();

    assert_eq!(store.update(&MessageId::from("a"), |_| false), Some(false));
    assert!(!store.take_dirty());

    assert_eq!(
        store.update(&MessageId::from("a"), |message| message.mark_read(at(5))),
        Some(true)
    );
    assert!(store.take_dirty());
    assert_eq!(store.update(&MessageId::from("zzz"), |_| true), None);
}

#[test]
fn replace_swaps_placeholder_in_one_step() {
    let mut store = MessageStore::new();
    let mut placeholder = message("local-1", 0);
    placeholder.delivery_state = DeliveryState::Pending;
    placeholder.client_ref = Some("ref-1".into());
    store.upsert(placeholder);

    assert!(store.find_pending_by_client_ref("ref-1").is_some());
    let removed = store.replace(&MessageId::from("local-1"), message("srv-1", 0));

    assert_eq!(removed.map(|message| message.id.0), Some("local-1".into()));
    assert_eq!(store.snapshot().len(), 1);
    assert!(store.contains(&MessageId::from("srv-1")));
    assert!(store.find_pending_by_client_ref("ref-1").is_none());
}
