use super::*;
use crate::support::{bodies, message_record, state_with_chats, ts, BOB, VIEWER};

fn echo_of(tracker: &OptimisticWriteTracker, temp_id: &TempId, id: i64, offset: i64) -> MessageRecord {
    let write = tracker.get(temp_id).expect("pending write");
    let WriteRequest::SendMessage { chat_id, body, .. } = &write.request else {
        panic!("expected send request");
    };
    let mut record = message_record(id, chat_id.0, VIEWER, body.as_deref().unwrap_or(""), offset);
    record.client_token = Some(temp_id.clone());
    record
}

#[test]
fn send_appends_pending_entry_at_tail() {
    let mut state = state_with_chats(&[1]);
    state
        .messages_mut(ChatId(1))
        .expect("chat")
        .push(Message::from_record(message_record(1, 1, BOB, "earlier", 50)));
    let mut tracker = OptimisticWriteTracker::default();

    // Local clock behind the last message still lands at the tail.
    let temp_id = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "hi"), VIEWER, ts(10))
        .expect("send");

    let messages = state.messages(ChatId(1));
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].key, MessageKey::Pending(temp_id.clone()));
    assert!(messages[1].created_at >= messages[0].created_at);
    assert_eq!(tracker.pending_sends(ChatId(1)), vec![temp_id]);
}

#[test]
fn empty_draft_is_refused() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    let err = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "   "), VIEWER, ts(0))
        .expect_err("empty");
    assert!(matches!(err, SyncError::EmptyDraft));
    assert!(state.messages(ChatId(1)).is_empty());
    assert!(tracker.is_empty());
}

#[test]
fn send_into_unknown_chat_is_an_anomaly() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    let err = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(9), "hi"), VIEWER, ts(0))
        .expect_err("unknown chat");
    assert!(matches!(err, SyncError::Anomaly(Anomaly::UnknownChat(ChatId(9)))));
}

#[test]
fn confirm_replaces_pending_entry_in_place() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    let first = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "one"), VIEWER, ts(1))
        .expect("send");
    let second = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "two"), VIEWER, ts(2))
        .expect("send");

    let record = echo_of(&tracker, &first, 100, 1);
    let outcome = tracker.confirm(&mut state, &first, Some(record));
    assert_eq!(
        outcome,
        ConfirmOutcome::Confirmed {
            chat_id: ChatId(1),
            message_id: MessageId(100)
        }
    );

    let messages = state.messages(ChatId(1));
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].server_id(), Some(MessageId(100)));
    assert_eq!(messages[1].key, MessageKey::Pending(second.clone()));
    let preview = |state: &SyncState| {
        state
            .chat(ChatId(1))
            .and_then(|chat| chat.last_message.clone())
            .expect("preview")
    };
    // The newer pending send still owns the preview.
    assert_eq!(preview(&state).content, "two");
    assert_eq!(preview(&state).message_id, None);

    let record = echo_of(&tracker, &second, 101, 2);
    tracker.confirm(&mut state, &second, Some(record));
    assert_eq!(preview(&state).message_id, Some(MessageId(101)));
}

#[test]
fn confirm_of_unknown_temp_id_is_a_no_op() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "one"), VIEWER, ts(1))
        .expect("send");
    let before = bodies(&state, 1);

    let outcome = tracker.confirm(
        &mut state,
        &TempId("tmp-unknown".into()),
        Some(message_record(5, 1, VIEWER, "one", 1)),
    );

    assert_eq!(outcome, ConfirmOutcome::Missing);
    assert_eq!(bodies(&state, 1), before);
    assert_eq!(tracker.len(), 1);
}

#[test]
fn ack_without_record_waits_for_echo() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    let temp_id = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "one"), VIEWER, ts(1))
        .expect("send");
    assert_eq!(
        tracker.confirm(&mut state, &temp_id, None),
        ConfirmOutcome::AwaitingEcho
    );
    assert!(tracker.get(&temp_id).is_some());
}

#[test]
fn rollback_leaves_no_trace() {
    let mut state = state_with_chats(&[1]);
    state
        .messages_mut(ChatId(1))
        .expect("chat")
        .push(Message::from_record(message_record(1, 1, BOB, "hello", 0)));
    let mut tracker = OptimisticWriteTracker::default();
    let temp_id = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "oops"), VIEWER, ts(5))
        .expect("send");

    let discarded = tracker.rollback(&mut state, &temp_id).expect("pending");
    assert_eq!(discarded.kind(), WriteKind::Send);
    assert_eq!(bodies(&state, 1), vec!["hello".to_string()]);
    assert!(tracker.is_empty());
    assert!(tracker.rollback(&mut state, &temp_id).is_none());
}

#[test]
fn pending_send_moves_its_chat_up_until_rolled_back() {
    let mut state = state_with_chats(&[1, 2]);
    let latest = Message::from_record(message_record(7, 2, BOB, "news", 50));
    state.chat_mut(ChatId(2)).expect("chat").observe_message(&latest);
    state.messages_mut(ChatId(2)).expect("chat").push(latest);
    state.sort_chats();
    let order = |state: &SyncState| state.chats().iter().map(|chat| chat.id).collect::<Vec<_>>();
    assert_eq!(order(&state), vec![ChatId(2), ChatId(1)]);
    let mut tracker = OptimisticWriteTracker::default();

    let temp_id = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "hi"), VIEWER, ts(100))
        .expect("send");
    assert_eq!(order(&state), vec![ChatId(1), ChatId(2)]);
    let preview = state
        .chat(ChatId(1))
        .and_then(|chat| chat.last_message.clone())
        .expect("preview");
    assert_eq!(preview.content, "hi");

    tracker.rollback(&mut state, &temp_id);
    assert_eq!(order(&state), vec![ChatId(2), ChatId(1)]);
    assert!(state.chat(ChatId(1)).expect("chat").last_message.is_none());
}

#[test]
fn retried_send_rolls_back_only_when_every_attempt_failed() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    let temp_id = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "again"), VIEWER, ts(1))
        .expect("send");
    let request = tracker.begin_retry(&temp_id).expect("retry");
    assert!(matches!(request, WriteRequest::SendMessage { .. }));

    assert_eq!(
        tracker.fail_attempt(&mut state, &temp_id),
        AttemptFailure::StillPending
    );
    assert_eq!(state.messages(ChatId(1)).len(), 1);
    assert!(matches!(
        tracker.fail_attempt(&mut state, &temp_id),
        AttemptFailure::RolledBack(_)
    ));
    assert!(state.messages(ChatId(1)).is_empty());
    assert!(matches!(
        tracker.begin_retry(&temp_id),
        Err(SyncError::UnknownPendingWrite(_))
    ));
}

#[test]
fn failure_after_the_echo_settled_the_send_is_not_a_rollback() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    let temp_id = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "hello"), VIEWER, ts(1))
        .expect("send");
    let echo = echo_of(&tracker, &temp_id, 900, 1);
    tracker.confirm(&mut state, &temp_id, Some(echo));

    assert_eq!(
        tracker.fail_attempt(&mut state, &temp_id),
        AttemptFailure::Settled(Some(MessageId(900)))
    );
    assert_eq!(bodies(&state, 1), vec!["hello".to_string()]);
}

#[test]
fn acknowledged_send_is_never_rolled_back_by_a_later_failure() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    let temp_id = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "hello"), VIEWER, ts(1))
        .expect("send");
    tracker.begin_retry(&temp_id).expect("retry");
    assert_eq!(
        tracker.confirm(&mut state, &temp_id, None),
        ConfirmOutcome::AwaitingEcho
    );
    assert_eq!(
        tracker.fail_attempt(&mut state, &temp_id),
        AttemptFailure::StillPending
    );
    assert_eq!(tracker.pending_sends(ChatId(1)), vec![temp_id]);
}

#[test]
fn identical_rapid_sends_match_their_own_tokens() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    let first = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "ok"), VIEWER, ts(1))
        .expect("send");
    let second = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "ok"), VIEWER, ts(1))
        .expect("send");

    // Echo for the second send arrives first.
    let echo = echo_of(&tracker, &second, 201, 1);
    assert_eq!(tracker.match_echo(&echo, VIEWER), Some(second.clone()));
    tracker.confirm(&mut state, &second, Some(echo));

    let echo = echo_of(&tracker, &first, 200, 1);
    assert_eq!(tracker.match_echo(&echo, VIEWER), Some(first.clone()));
    tracker.confirm(&mut state, &first, Some(echo));

    let ids: Vec<_> = state
        .messages(ChatId(1))
        .iter()
        .filter_map(Message::server_id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&MessageId(200)) && ids.contains(&MessageId(201)));
    assert!(tracker.is_empty());
}

#[test]
fn tokenless_echo_falls_back_to_oldest_matching_content() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    let first = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "ok"), VIEWER, ts(1))
        .expect("send");
    tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "ok"), VIEWER, ts(2))
        .expect("send");

    let echo = message_record(300, 1, VIEWER, "ok ", 1);
    assert_eq!(tracker.match_echo(&echo, VIEWER), Some(first));

    let from_bob = message_record(301, 1, BOB, "ok", 1);
    assert_eq!(tracker.match_echo(&from_bob, VIEWER), None);
}

#[test]
fn foreign_token_never_falls_back_to_content() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "ok"), VIEWER, ts(1))
        .expect("send");
    let mut echo = message_record(300, 1, VIEWER, "ok", 1);
    echo.client_token = Some(TempId("tmp-other-device".into()));
    assert_eq!(tracker.match_echo(&echo, VIEWER), None);
}

#[test]
fn confirm_when_server_copy_already_present_keeps_one_entry() {
    let mut state = state_with_chats(&[1]);
    let mut tracker = OptimisticWriteTracker::default();
    let temp_id = tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "hi"), VIEWER, ts(1))
        .expect("send");
    let record = echo_of(&tracker, &temp_id, 7, 1);
    state
        .messages_mut(ChatId(1))
        .expect("chat")
        .push(Message::from_record(record.clone()));

    tracker.confirm(&mut state, &temp_id, Some(record));

    let messages = state.messages(ChatId(1));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].server_id(), Some(MessageId(7)));
}

#[test]
fn failed_edit_restores_previous_body() {
    let mut state = state_with_chats(&[1]);
    state
        .messages_mut(ChatId(1))
        .expect("chat")
        .push(Message::from_record(message_record(5, 1, VIEWER, "draft", 0)));
    let mut tracker = OptimisticWriteTracker::default();

    let temp_id = tracker
        .begin_mutation(
            &mut state,
            MessageId(5),
            MutationOp::Edit("final".into()),
            VIEWER,
            ts(1),
        )
        .expect("edit");
    let edited = state.find_message(ChatId(1), MessageId(5)).expect("message");
    assert_eq!(edited.body.as_deref(), Some("final"));
    assert!(edited.edited);

    tracker.rollback(&mut state, &temp_id);
    let restored = state.find_message(ChatId(1), MessageId(5)).expect("message");
    assert_eq!(restored.body.as_deref(), Some("draft"));
    assert!(!restored.edited);
}

#[test]
fn failed_delete_restores_message_and_preview() {
    let mut state = state_with_chats(&[1]);
    let message = Message::from_record(message_record(5, 1, VIEWER, "keep me", 0));
    state.chat_mut(ChatId(1)).expect("chat").observe_message(&message);
    state.messages_mut(ChatId(1)).expect("chat").push(message);
    let mut tracker = OptimisticWriteTracker::default();

    let temp_id = tracker
        .begin_mutation(&mut state, MessageId(5), MutationOp::Delete, VIEWER, ts(1))
        .expect("delete");
    let preview = |state: &SyncState| {
        state
            .chat(ChatId(1))
            .and_then(|chat| chat.last_message.clone())
            .map(|preview| preview.content)
    };
    assert_eq!(preview(&state).as_deref(), Some(DELETED_MARKER));

    tracker.rollback(&mut state, &temp_id);
    assert_eq!(bodies(&state, 1), vec!["keep me".to_string()]);
    assert_eq!(preview(&state).as_deref(), Some("keep me"));
}

const DELETED_MARKER: &str = crate::state::DELETED_MESSAGE_MARKER;

#[test]
fn reaction_toggle_and_its_undo() {
    let mut state = state_with_chats(&[1]);
    state
        .messages_mut(ChatId(1))
        .expect("chat")
        .push(Message::from_record(message_record(5, 1, BOB, "nice", 0)));
    let mut tracker = OptimisticWriteTracker::default();

    let temp_id = tracker
        .begin_mutation(
            &mut state,
            MessageId(5),
            MutationOp::ToggleReaction("👍".into()),
            VIEWER,
            ts(1),
        )
        .expect("react");
    let reacted = state.find_message(ChatId(1), MessageId(5)).expect("message");
    assert!(reacted.reactions["👍"].contains(&VIEWER));

    tracker.rollback(&mut state, &temp_id);
    let reverted = state.find_message(ChatId(1), MessageId(5)).expect("message");
    assert!(reverted.reactions.is_empty());
}

#[test]
fn mutating_a_deleted_message_is_refused() {
    let mut state = state_with_chats(&[1]);
    let mut record = message_record(5, 1, BOB, "x", 0);
    record.deleted = true;
    state
        .messages_mut(ChatId(1))
        .expect("chat")
        .push(Message::from_record(record));
    let mut tracker = OptimisticWriteTracker::default();

    let err = tracker
        .begin_mutation(&mut state, MessageId(5), MutationOp::TogglePin, VIEWER, ts(1))
        .expect_err("deleted");
    assert!(matches!(err, SyncError::MessageDeleted(MessageId(5))));
    assert!(tracker.is_empty());
}

#[test]
fn removing_a_chat_discards_its_pending_writes() {
    let mut state = state_with_chats(&[1, 2]);
    let mut tracker = OptimisticWriteTracker::default();
    tracker
        .begin_send(&mut state, SendDraft::text(ChatId(1), "a"), VIEWER, ts(1))
        .expect("send");
    tracker
        .begin_send(&mut state, SendDraft::text(ChatId(2), "b"), VIEWER, ts(1))
        .expect("send");
    assert_eq!(tracker.discard_chat(ChatId(1)), 1);
    assert_eq!(tracker.len(), 1);
}
