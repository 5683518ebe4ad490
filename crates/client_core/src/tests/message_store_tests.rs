use super::*;
use chrono::TimeZone;

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

fn confirmed(id: &str, sender: &str, content: &str, seconds: i64) -> Message {
    Message::confirmed(
        MessageId::from(id),
        ConversationId::from("c-1"),
        UserId::from(sender),
        sender.to_uppercase(),
        content,
        at(seconds),
    )
}

fn draft(content: &str, seconds: i64) -> Draft {
    Draft {
        conversation_id: ConversationId::from("c-1"),
        sender_id: UserId::from("me"),
        sender_name: "Me".into(),
        content: content.into(),
        created_at: at(seconds),
    }
}

fn contents(store: &MessageStore) -> Vec<&str> {
    store
        .messages(&ConversationId::from("c-1"))
        .iter()
        .map(|message| message.content.as_str())
        .collect()
}

#[test]
fn append_keeps_log_sorted_by_timestamp() {
    let mut store = MessageStore::default();
    store.append(confirmed("m-3", "ana", "third", 30));
    store.append(confirmed("m-1", "ana", "first", 10));
    store.append(confirmed("m-2", "bo", "second", 20));

    assert_eq!(contents(&store), vec!["first", "second", "third"]);
}

#[test]
fn redelivered_server_id_is_a_duplicate() {
    let mut store = MessageStore::default();
    assert_eq!(
        store.append(confirmed("m-1", "ana", "hi", 0)),
        AppendOutcome::Inserted
    );
    assert_eq!(
        store.append(confirmed("m-1", "ana", "hi", 0)),
        AppendOutcome::Duplicate
    );
    assert_eq!(store.messages(&ConversationId::from("c-1")).len(), 1);
}

#[test]
fn merge_reports_inserted_and_duplicate_counts() {
    let mut store = MessageStore::default();
    store.append(confirmed("m-2", "ana", "b", 20));

    let report = store.merge(vec![
        confirmed("m-1", "ana", "a", 10),
        confirmed("m-2", "ana", "b", 20),
        confirmed("m-3", "bo", "c", 30),
    ]);

    assert_eq!(report.inserted, 2);
    assert_eq!(report.duplicates, 1);
    assert!(report.superseded.is_empty());
    assert_eq!(contents(&store), vec!["a", "b", "c"]);
}

#[test]
fn reconcile_replaces_optimistic_entry_and_keeps_local_id() {
    let mut store = MessageStore::default();
    let local_id = store.insert_optimistic(LocalId::from("L1"), draft("hello", 5));
    assert_eq!(
        store.messages(&ConversationId::from("c-1"))[0].delivery,
        DeliveryState::Pending
    );

    let outcome = store.reconcile(&local_id, confirmed("m-9", "me", "hello", 6));

    assert_eq!(outcome, ReconcileOutcome::Replaced);
    let log = store.messages(&ConversationId::from("c-1"));
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].key, MessageKey::Server(MessageId::from("m-9")));
    assert_eq!(log[0].local_id, Some(local_id.clone()));
    assert!(log[0].is_confirmed());
    assert!(store.find_unconfirmed(&local_id).is_none());
}

#[test]
fn history_inside_window_supersedes_optimistic_entry() {
    let mut store = MessageStore::default();
    let local_id = store.insert_optimistic(LocalId::from("L1"), draft("hello", 10));

    let report = store.merge(vec![confirmed("m-1", "me", "hello", 11)]);

    assert_eq!(report.superseded, vec![local_id.clone()]);
    let log = store.messages(&ConversationId::from("c-1"));
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].server_id(), Some(&MessageId::from("m-1")));
    assert_eq!(log[0].local_id, Some(local_id));
}

#[test]
fn late_echo_after_history_merge_does_not_duplicate() {
    let mut store = MessageStore::default();
    let local_id = store.insert_optimistic(LocalId::from("L1"), draft("hello", 10));
    store.merge(vec![confirmed("m-1", "me", "hello", 11)]);

    let outcome = store.reconcile(&local_id, confirmed("m-1", "me", "hello", 11));

    assert_eq!(outcome, ReconcileOutcome::AlreadyPresent);
    assert_eq!(store.messages(&ConversationId::from("c-1")).len(), 1);
}

#[test]
fn same_content_outside_window_is_kept_separately() {
    let mut store = MessageStore::default();
    store.insert_optimistic(LocalId::from("L1"), draft("ok", 0));

    let outcome = store.append(confirmed("m-1", "me", "ok", 30));

    assert_eq!(outcome, AppendOutcome::Inserted);
    assert_eq!(store.messages(&ConversationId::from("c-1")).len(), 2);
}

#[test]
fn same_content_from_another_sender_is_not_a_match() {
    let mut store = MessageStore::default();
    store.insert_optimistic(LocalId::from("L1"), draft("ok", 0));

    let outcome = store.append(confirmed("m-1", "ana", "ok", 1));

    assert_eq!(outcome, AppendOutcome::Inserted);
    assert_eq!(store.messages(&ConversationId::from("c-1")).len(), 2);
}

#[test]
fn failed_send_can_be_put_back_to_pending() {
    let mut store = MessageStore::default();
    let local_id = store.insert_optimistic(LocalId::from("L1"), draft("hello", 0));

    assert!(store.mark_failed(&local_id));
    assert!(!store.mark_failed(&local_id));
    assert_eq!(
        store.find_unconfirmed(&local_id).map(|m| m.delivery),
        Some(DeliveryState::Failed)
    );

    assert!(store.mark_pending(&local_id));
    assert_eq!(
        store.find_unconfirmed(&local_id).map(|m| m.delivery),
        Some(DeliveryState::Pending)
    );
}

#[test]
fn remove_unconfirmed_drops_the_entry() {
    let mut store = MessageStore::default();
    let local_id = store.insert_optimistic(LocalId::from("L1"), draft("oops", 0));

    let removed = store.remove_unconfirmed(&local_id).expect("entry removed");

    assert_eq!(removed.content, "oops");
    assert!(store.messages(&ConversationId::from("c-1")).is_empty());
    assert!(store.remove_unconfirmed(&local_id).is_none());
}

#[test]
fn unread_tally_counts_others_not_yet_read() {
    let mut store = MessageStore::default();
    let conversation = ConversationId::from("c-1");
    store.append(confirmed("m-1", "ana", "old", 0));
    store.mark_read(&conversation);
    store.append(confirmed("m-2", "ana", "new one", 10));
    store.append(confirmed("m-3", "ana", "new two", 20));
    store.append(confirmed("m-4", "me", "mine", 30));
    store.insert_optimistic(LocalId::from("L1"), draft("pending", 40));

    let tally = store.unread_tally(&conversation, &UserId::from("me"));

    assert_eq!(tally.len(), 1);
    let ana = &tally[&UserId::from("ana")];
    assert_eq!(ana.count, 2);
    assert_eq!(ana.latest_message.as_deref(), Some("new two"));
    assert_eq!(ana.last_updated, Some(at(20)));
}

#[test]
fn unread_tally_is_empty_after_mark_read() {
    let mut store = MessageStore::default();
    let conversation = ConversationId::from("c-1");
    store.append(confirmed("m-1", "ana", "hi", 0));
    store.append(confirmed("m-2", "bo", "yo", 5));

    store.mark_read(&conversation);

    assert!(store
        .unread_tally(&conversation, &UserId::from("me"))
        .is_empty());
}

#[test]
fn late_message_stamped_before_own_send_stays_unread() {
    let mut store = MessageStore::default();
    let conversation = ConversationId::from("c-1");
    store.insert_optimistic(LocalId::from("L1"), draft("mine", 100));
    store.append(confirmed("m-1", "ana", "seen", 50));
    store.mark_read(&conversation);

    store.append(confirmed("m-2", "ana", "late", 60));

    let tally = store.unread_tally(&conversation, &UserId::from("me"));
    assert_eq!(tally[&UserId::from("ana")].count, 1);
    assert_eq!(
        tally[&UserId::from("ana")].latest_message.as_deref(),
        Some("late")
    );
}

#[test]
fn mark_read_from_only_covers_that_sender() {
    let mut store = MessageStore::default();
    let conversation = ConversationId::from("c-1");
    store.append(confirmed("m-1", "ana", "a", 1));
    store.append(confirmed("m-2", "bo", "b", 2));

    store.mark_read_from(&conversation, &UserId::from("ana"));

    let tally = store.unread_tally(&conversation, &UserId::from("me"));
    assert_eq!(tally.len(), 1);
    assert_eq!(tally[&UserId::from("bo")].count, 1);
}
