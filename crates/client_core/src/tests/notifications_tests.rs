use super::*;
use chrono::TimeZone;
use shared::domain::MessageId;

fn message(id: &str, conversation: &str, sender: &str, content: &str, seconds: i64) -> Message {
    Message::confirmed(
        MessageId::from(id),
        ConversationId::from(conversation),
        UserId::from(sender),
        format!("{sender}-name"),
        content,
        Utc.timestamp_opt(1_700_000_000 + seconds, 0)
            .single()
            .expect("valid timestamp"),
    )
}

#[test]
fn counts_per_conversation_and_sender() {
    let mut unread = NotificationAggregator::new();
    assert!(unread.on_inbound_message(&message("m-1", "c-1", "ana", "one", 0), false));
    assert!(unread.on_inbound_message(&message("m-2", "c-1", "ana", "two", 5), false));
    assert!(unread.on_inbound_message(&message("m-3", "c-2", "ana", "elsewhere", 3), false));

    let aggregate = unread
        .get(&ConversationId::from("c-1"), &UserId::from("ana"))
        .expect("aggregate");
    assert_eq!(aggregate.count, 2);
    assert_eq!(aggregate.latest_message.as_deref(), Some("two"));
    assert_eq!(unread.total(), 3);
}

#[test]
fn focused_conversation_is_not_counted() {
    let mut unread = NotificationAggregator::new();

    assert!(!unread.on_inbound_message(&message("m-1", "c-1", "ana", "hi", 0), true));
    assert_eq!(unread.total(), 0);
    assert!(!unread.snapshot().has_unread());
}

#[test]
fn out_of_order_arrival_keeps_latest_preview() {
    let mut unread = NotificationAggregator::new();
    unread.on_inbound_message(&message("m-2", "c-1", "ana", "newer", 10), false);
    unread.on_inbound_message(&message("m-1", "c-1", "ana", "older", 1), false);

    let aggregate = unread
        .get(&ConversationId::from("c-1"), &UserId::from("ana"))
        .expect("aggregate");
    assert_eq!(aggregate.count, 2);
    assert_eq!(aggregate.latest_message.as_deref(), Some("newer"));
}

#[test]
fn mark_read_by_conversation_is_idempotent() {
    let mut unread = NotificationAggregator::new();
    unread.on_inbound_message(&message("m-1", "c-1", "ana", "hi", 0), false);
    unread.on_inbound_message(&message("m-2", "c-1", "bo", "yo", 1), false);
    unread.on_inbound_message(&message("m-3", "c-2", "bo", "hey", 2), false);

    let target = ReadTarget::Conversation(ConversationId::from("c-1"));
    assert_eq!(unread.mark_read(&target), vec![ConversationId::from("c-1")]);
    assert_eq!(unread.total(), 1);

    unread.mark_read(&target);
    assert_eq!(unread.total(), 1);
}

#[test]
fn mark_read_by_sender_spans_conversations() {
    let mut unread = NotificationAggregator::new();
    unread.on_inbound_message(&message("m-1", "c-1", "bo", "yo", 0), false);
    unread.on_inbound_message(&message("m-2", "c-2", "bo", "hey", 1), false);
    unread.on_inbound_message(&message("m-3", "c-2", "ana", "hi", 2), false);

    let mut with_bo = unread.conversations_with_unread_from(&UserId::from("bo"));
    with_bo.sort();
    assert_eq!(
        with_bo,
        vec![ConversationId::from("c-1"), ConversationId::from("c-2")]
    );

    unread.mark_read(&ReadTarget::Sender(UserId::from("bo")));

    assert_eq!(unread.total(), 1);
    assert!(unread
        .conversations_with_unread_from(&UserId::from("bo"))
        .is_empty());
}

#[test]
fn snapshot_orders_most_recent_first_and_skips_read_entries() {
    let mut unread = NotificationAggregator::new();
    unread.on_inbound_message(&message("m-1", "c-1", "ana", "early", 0), false);
    unread.on_inbound_message(&message("m-2", "c-2", "bo", "late", 50), false);
    unread.on_inbound_message(&message("m-3", "c-3", "cy", "middle", 20), false);
    unread.mark_read(&ReadTarget::Conversation(ConversationId::from("c-3")));

    let snapshot = unread.snapshot();

    let senders: Vec<&str> = snapshot
        .entries
        .iter()
        .map(|entry| entry.sender_id.as_str())
        .collect();
    assert_eq!(senders, vec!["bo", "ana"]);
    assert_eq!(snapshot.total, 2);
    assert!(snapshot.has_unread());
}

#[test]
fn reconcile_corrects_drift_from_recomputed_tallies() {
    let mut unread = NotificationAggregator::new();
    let conversation = ConversationId::from("c-1");
    unread.on_inbound_message(&message("m-1", "c-1", "ana", "hi", 0), false);
    unread.on_inbound_message(&message("m-2", "c-1", "ana", "again", 1), false);

    let mut tally = UnreadTally::empty("bo-name".into());
    tally.record(&message("m-3", "c-1", "bo", "missed", 2));
    let recomputed = HashMap::from([(UserId::from("bo"), tally)]);

    assert!(unread.reconcile_conversation(&conversation, recomputed.clone()));
    assert_eq!(
        unread
            .get(&conversation, &UserId::from("ana"))
            .map(|aggregate| aggregate.count),
        Some(0)
    );
    assert_eq!(
        unread
            .get(&conversation, &UserId::from("bo"))
            .map(|aggregate| aggregate.count),
        Some(1)
    );

    assert!(!unread.reconcile_conversation(&conversation, recomputed));
}
