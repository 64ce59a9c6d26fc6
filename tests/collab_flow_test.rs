//! End-to-end engine flows: join snapshots, update fan-out, lock
//! conflicts, submit/reset barriers, presence and disconnect cleanup.

use chrono::DateTime;
use formshare_collab::collab::CollabEngine;
use formshare_collab::db::{CollabStore, FieldKind, MemStore};
use formshare_collab::models::{
    ClientEvent, FieldUpdateMessage, FormResetMessage, FormSubmitMessage, JoinFormMessage,
    LeaveFormMessage, LockFieldMessage, ServerEvent, TypingMessage, UnlockFieldMessage,
};
use formshare_collab::services::auth_service::AuthUser;
use formshare_collab::SessionHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const GROUP: &str = "ABC123";

async fn engine_with_room() -> (Arc<CollabEngine>, MemStore, Uuid) {
    let store = MemStore::new();
    let form_id = store.add_form("Trip planning", true).await;
    store
        .add_field(form_id, "name", "Full name", FieldKind::Text)
        .await;
    store
        .add_field(form_id, "email", "Email", FieldKind::Email)
        .await;
    store
        .add_field(form_id, "headcount", "Headcount", FieldKind::Number)
        .await;
    let group_id = store.add_group(form_id, GROUP, "Team Rocket", true).await;
    let engine = Arc::new(CollabEngine::new(Arc::new(store.clone()), 60));
    (engine, store, group_id)
}

fn user(n: u32) -> AuthUser {
    AuthUser {
        user_id: format!("user-{}", n),
        email: format!("user{}@example.com", n),
        role: "user".to_string(),
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Join and swallow the join-time traffic so tests start from silence.
async fn join(
    engine: &CollabEngine,
    user: AuthUser,
) -> (SessionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
    let (session, mut rx) = SessionHandle::new(user);
    engine.join_group(&session, GROUP).await.unwrap();
    drain(&mut rx);
    (session, rx)
}

fn lock_field(field_id: &str) -> ClientEvent {
    ClientEvent::LockField(LockFieldMessage {
        group_code: GROUP.to_string(),
        field_id: field_id.to_string(),
    })
}

fn field_update(field_id: &str, value: &str) -> ClientEvent {
    ClientEvent::FieldUpdate(FieldUpdateMessage {
        group_code: GROUP.to_string(),
        field_id: field_id.to_string(),
        value: value.to_string(),
    })
}

#[tokio::test]
async fn late_joiner_gets_group_info_locks_and_draft_in_order() {
    let (engine, _store, _) = engine_with_room().await;

    // An earlier member locks a field and edits another.
    let (first, mut rx1) = join(&engine, user(1)).await;
    engine.handle_event(&first, lock_field("email")).await;
    engine.handle_event(&first, field_update("name", "Ada")).await;
    drain(&mut rx1);

    let (joiner, mut rx2) = SessionHandle::new(user(2));
    engine.join_group(&joiner, GROUP).await.unwrap();

    let events = drain(&mut rx2);
    assert_eq!(events.len(), 5, "expected full join sequence: {:?}", events);

    match &events[0] {
        ServerEvent::GroupInfo(msg) => {
            assert_eq!(msg.group_code, GROUP);
            assert_eq!(msg.group_name, "Team Rocket");
            assert_eq!(msg.form_title, "Trip planning");
        }
        other => panic!("expected group-info first, got {:?}", other),
    }
    match &events[1] {
        ServerEvent::CurrentLocks(msg) => {
            let entry = msg.locks.get("email").expect("lock snapshot entry");
            assert_eq!(entry.user_email, "user1@example.com");
        }
        other => panic!("expected current-locks second, got {:?}", other),
    }
    match &events[2] {
        ServerEvent::FormDataSync(msg) => {
            assert_eq!(msg.form_data.get("name").map(String::as_str), Some("Ada"));
        }
        other => panic!("expected form-data-sync third, got {:?}", other),
    }
    assert!(matches!(&events[3], ServerEvent::UserJoined(msg) if msg.user_email == "user2@example.com"));
    match &events[4] {
        ServerEvent::ActiveUsers(msg) => {
            assert_eq!(
                msg.users,
                vec![
                    "user1@example.com".to_string(),
                    "user2@example.com".to_string()
                ]
            );
        }
        other => panic!("expected active-users fifth, got {:?}", other),
    }

    // The earlier member hears about the join too.
    let peer_events = drain(&mut rx1);
    assert!(peer_events
        .iter()
        .any(|event| matches!(event, ServerEvent::UserJoined(msg) if msg.user_email == "user2@example.com")));
}

#[tokio::test]
async fn joining_an_unknown_group_reports_not_found() {
    let (engine, _, _) = engine_with_room().await;
    let (session, mut rx) = SessionHandle::new(user(1));

    engine
        .handle_event(
            &session,
            ClientEvent::JoinForm(JoinFormMessage {
                group_code: "NOPE42".to_string(),
            }),
        )
        .await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        ServerEvent::Error(msg) if msg.message == "Group not found: NOPE42"
    ));
    assert_eq!(engine.room_count().await, 0);
}

#[tokio::test]
async fn joining_an_inactive_group_or_form_is_rejected() {
    let (engine, store, group_id) = engine_with_room().await;
    let (session, mut rx) = SessionHandle::new(user(1));

    store.set_group_active(group_id, false).await;
    engine
        .handle_event(
            &session,
            ClientEvent::JoinForm(JoinFormMessage {
                group_code: GROUP.to_string(),
            }),
        )
        .await;
    let events = drain(&mut rx);
    assert!(matches!(
        &events[0],
        ServerEvent::Error(msg) if msg.message.contains("no longer active")
    ));

    store.set_group_active(group_id, true).await;
    let form_id = store.group_by_code(GROUP).await.unwrap().unwrap().form_id;
    store.set_form_active(form_id, false).await;
    engine
        .handle_event(
            &session,
            ClientEvent::JoinForm(JoinFormMessage {
                group_code: GROUP.to_string(),
            }),
        )
        .await;
    let events = drain(&mut rx);
    assert!(matches!(
        &events[0],
        ServerEvent::Error(msg) if msg.message.contains("form") && msg.message.contains("no longer active")
    ));
    assert_eq!(engine.room_count().await, 0);
}

#[tokio::test]
async fn update_fans_out_to_others_but_not_the_sender() {
    let (engine, store, group_id) = engine_with_room().await;
    let (editor, mut editor_rx) = join(&engine, user(1)).await;
    let (_peer, mut peer_rx) = join(&engine, user(2)).await;
    drain(&mut editor_rx);

    engine.handle_event(&editor, field_update("name", "Ada")).await;

    assert!(drain(&mut editor_rx).is_empty(), "no echo to the editor");

    let events = drain(&mut peer_rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        ServerEvent::FieldUpdated(msg) => {
            assert_eq!(msg.field_id, "name");
            assert_eq!(msg.value, "Ada");
            assert_eq!(msg.updated_by, "user1@example.com");
            assert_eq!(msg.field_label, "Full name");
            assert_eq!(msg.group_name, "Team Rocket");
        }
        other => panic!("expected field-updated, got {:?}", other),
    }

    // Persisted before it was announced.
    let draft = store.draft_values(group_id).await.unwrap();
    assert_eq!(draft.get("name").map(String::as_str), Some("Ada"));
    assert_eq!(
        store.contribution(group_id, "name", "user-1").await,
        Some("Ada".to_string())
    );
}

#[tokio::test]
async fn invalid_email_is_rejected_without_persisting_or_broadcasting() {
    let (engine, store, group_id) = engine_with_room().await;
    let (editor, mut editor_rx) = join(&engine, user(1)).await;
    let (_peer, mut peer_rx) = join(&engine, user(2)).await;
    drain(&mut editor_rx);

    engine
        .handle_event(&editor, field_update("email", "not-an-email"))
        .await;

    let events = drain(&mut editor_rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        ServerEvent::Error(msg)
            if msg.message == "Invalid value for field email: not a valid email address"
    ));
    assert!(drain(&mut peer_rx).is_empty(), "peers must not see the rejected value");
    assert!(store.draft_values(group_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn clearing_a_field_skips_validation_and_keeps_attribution() {
    let (engine, store, group_id) = engine_with_room().await;
    let (editor, mut editor_rx) = join(&engine, user(1)).await;
    let (_peer, mut peer_rx) = join(&engine, user(2)).await;
    drain(&mut editor_rx);

    engine
        .handle_event(&editor, field_update("email", "ada@example.com"))
        .await;
    // Whitespace-only input clears the field; "" would never pass the
    // email pattern, so clearing must bypass it.
    engine.handle_event(&editor, field_update("email", "   ")).await;

    assert!(drain(&mut editor_rx).is_empty());
    let events = drain(&mut peer_rx);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], ServerEvent::FieldUpdated(msg) if msg.value == "ada@example.com"));
    assert!(matches!(&events[1], ServerEvent::FieldUpdated(msg) if msg.value.is_empty()));

    let draft = store.draft_values(group_id).await.unwrap();
    assert_eq!(draft.get("email").map(String::as_str), Some(""));
    // The clear is not a contribution; the last non-empty value stands.
    assert_eq!(
        store.contribution(group_id, "email", "user-1").await,
        Some("ada@example.com".to_string())
    );
}

#[tokio::test]
async fn updating_an_unknown_field_reports_an_error() {
    let (engine, _, _) = engine_with_room().await;
    let (editor, mut rx) = join(&engine, user(1)).await;

    engine
        .handle_event(&editor, field_update("nickname", "Ada"))
        .await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        ServerEvent::Error(msg) if msg.message == "Unknown field: nickname"
    ));
}

#[tokio::test]
async fn lock_conflict_names_the_current_holder() {
    let (engine, store, group_id) = engine_with_room().await;
    let (holder, mut holder_rx) = join(&engine, user(1)).await;
    let (contender, mut contender_rx) = join(&engine, user(2)).await;
    drain(&mut holder_rx);

    engine.handle_event(&holder, lock_field("name")).await;
    let events = drain(&mut contender_rx);
    assert!(matches!(
        &events[0],
        ServerEvent::FieldLocked(msg)
            if msg.field_id == "name" && msg.user_email == "user1@example.com"
    ));

    engine.handle_event(&contender, lock_field("name")).await;

    let events = drain(&mut contender_rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        ServerEvent::LockFailed(msg) => {
            assert_eq!(msg.field_id, "name");
            assert_eq!(msg.locked_by.as_deref(), Some("user1@example.com"));
            assert_eq!(
                msg.reason,
                "Field is currently locked by user1@example.com"
            );
        }
        other => panic!("expected lock-failed, got {:?}", other),
    }
    // The failed attempt must not disturb the holder's lock.
    assert!(drain(&mut holder_rx).is_empty());
    let lock = store.field_lock(group_id, "name").await.unwrap().unwrap();
    assert_eq!(lock.user_id, "user-1");
}

#[tokio::test]
async fn updates_on_a_field_locked_by_someone_else_are_refused() {
    let (engine, store, group_id) = engine_with_room().await;
    let (holder, mut holder_rx) = join(&engine, user(1)).await;
    let (intruder, mut intruder_rx) = join(&engine, user(2)).await;
    drain(&mut holder_rx);

    engine.handle_event(&holder, lock_field("name")).await;
    drain(&mut intruder_rx);

    engine
        .handle_event(&intruder, field_update("name", "Grace"))
        .await;

    let events = drain(&mut intruder_rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        ServerEvent::LockFailed(msg) if msg.locked_by.as_deref() == Some("user1@example.com")
    ));
    assert!(store.draft_values(group_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn holder_edits_refresh_the_lease() {
    let (engine, store, group_id) = engine_with_room().await;
    let (holder, mut rx) = join(&engine, user(1)).await;

    engine.handle_event(&holder, lock_field("name")).await;
    let before = store
        .field_lock(group_id, "name")
        .await
        .unwrap()
        .unwrap()
        .expires_at;

    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.handle_event(&holder, field_update("name", "Ada")).await;
    drain(&mut rx);

    let after = store
        .field_lock(group_id, "name")
        .await
        .unwrap()
        .unwrap()
        .expires_at;
    assert!(after > before, "edit must extend the lease");
}

#[tokio::test]
async fn unlock_is_holder_only_and_announced_to_others() {
    let (engine, store, group_id) = engine_with_room().await;
    let (holder, mut holder_rx) = join(&engine, user(1)).await;
    let (peer, mut peer_rx) = join(&engine, user(2)).await;
    drain(&mut holder_rx);

    engine.handle_event(&holder, lock_field("name")).await;
    drain(&mut peer_rx);

    // A non-holder unlock is a silent no-op.
    engine
        .handle_event(
            &peer,
            ClientEvent::UnlockField(UnlockFieldMessage {
                group_code: GROUP.to_string(),
                field_id: "name".to_string(),
            }),
        )
        .await;
    assert!(drain(&mut peer_rx).is_empty());
    assert!(drain(&mut holder_rx).is_empty());
    assert!(store.field_lock(group_id, "name").await.unwrap().is_some());

    engine
        .handle_event(
            &holder,
            ClientEvent::UnlockField(UnlockFieldMessage {
                group_code: GROUP.to_string(),
                field_id: "name".to_string(),
            }),
        )
        .await;
    assert!(drain(&mut holder_rx).is_empty(), "no echo to the releaser");
    let events = drain(&mut peer_rx);
    assert!(matches!(
        &events[0],
        ServerEvent::FieldUnlocked(msg) if msg.field_id == "name"
    ));
    assert!(store.field_lock(group_id, "name").await.unwrap().is_none());
}

#[tokio::test]
async fn typing_signals_reach_only_the_rest_of_the_room() {
    let (engine, _, _) = engine_with_room().await;
    let (typist, mut typist_rx) = join(&engine, user(1)).await;
    let (_peer, mut peer_rx) = join(&engine, user(2)).await;
    drain(&mut typist_rx);

    engine
        .handle_event(
            &typist,
            ClientEvent::TypingStart(TypingMessage {
                group_code: GROUP.to_string(),
                field_id: "name".to_string(),
            }),
        )
        .await;
    engine
        .handle_event(
            &typist,
            ClientEvent::TypingStop(TypingMessage {
                group_code: GROUP.to_string(),
                field_id: "name".to_string(),
            }),
        )
        .await;

    assert!(drain(&mut typist_rx).is_empty());
    let events = drain(&mut peer_rx);
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        ServerEvent::UserTyping(msg) if msg.typing && msg.user_email == "user1@example.com"
    ));
    assert!(matches!(&events[1], ServerEvent::UserTyping(msg) if !msg.typing));
}

#[tokio::test]
async fn submit_reaches_every_member_with_identical_payload() {
    let (engine, store, group_id) = engine_with_room().await;
    let (_a, mut rx_a) = join(&engine, user(1)).await;
    let (b, mut rx_b) = join(&engine, user(2)).await;
    let (_c, mut rx_c) = join(&engine, user(3)).await;
    drain(&mut rx_a);
    drain(&mut rx_b);

    let mut form_data = HashMap::new();
    form_data.insert("name".to_string(), "Ada Lovelace".to_string());
    engine
        .handle_event(
            &b,
            ClientEvent::FormSubmit(FormSubmitMessage {
                group_code: GROUP.to_string(),
                submitted_by: Some("spoofed@example.com".to_string()),
                response_id: Some("client-made-up".to_string()),
                form_data,
            }),
        )
        .await;

    let take = |rx: &mut mpsc::UnboundedReceiver<ServerEvent>| -> ServerEvent {
        let mut events = drain(rx);
        assert_eq!(events.len(), 1);
        events.remove(0)
    };
    let to_a = take(&mut rx_a);
    let to_b = take(&mut rx_b);
    let to_c = take(&mut rx_c);
    assert_eq!(to_a, to_b);
    assert_eq!(to_b, to_c);

    match to_a {
        ServerEvent::FormSubmittedAll(msg) => {
            // Server-side identity and response id, not the client's claims.
            assert_eq!(msg.submitted_by, "user2@example.com");
            assert_eq!(msg.form_title, "Trip planning");
            assert_eq!(msg.group_name, "Team Rocket");
            assert_eq!(
                msg.form_data.get("name").map(String::as_str),
                Some("Ada Lovelace")
            );
            assert_eq!(
                store.submitted_responses(group_id).await,
                vec![msg.response_id]
            );
            // The persisted record matches the broadcast: attributed to the
            // actor's user id, holding the finalized values.
            let (submitted_by, final_values) = store
                .submitted_record(msg.response_id)
                .await
                .expect("finalized record");
            assert_eq!(submitted_by, "user-2");
            assert_eq!(
                final_values.get("name").map(String::as_str),
                Some("Ada Lovelace")
            );
        }
        other => panic!("expected form-submitted-all, got {:?}", other),
    }
    // The submitted draft is gone.
    assert!(store.draft_values(group_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn reset_discards_the_draft_for_the_whole_room() {
    let (engine, store, group_id) = engine_with_room().await;
    let (editor, mut rx1) = join(&engine, user(1)).await;
    let (resetter, mut rx2) = join(&engine, user(2)).await;
    drain(&mut rx1);

    engine.handle_event(&editor, field_update("name", "Ada")).await;
    drain(&mut rx2);

    engine
        .handle_event(
            &resetter,
            ClientEvent::FormReset(FormResetMessage {
                group_code: GROUP.to_string(),
                reset_by: None,
            }),
        )
        .await;

    for rx in [&mut rx1, &mut rx2] {
        let events = drain(rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ServerEvent::FormResetAll(msg) if msg.reset_by == "user2@example.com"
        ));
    }
    assert!(store.draft_values(group_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn disconnect_releases_locks_and_updates_presence() {
    let (engine, store, group_id) = engine_with_room().await;
    let (leaver, mut leaver_rx) = join(&engine, user(1)).await;
    let (_stayer, mut stayer_rx) = join(&engine, user(2)).await;
    drain(&mut leaver_rx);

    engine.handle_event(&leaver, lock_field("name")).await;
    engine.handle_event(&leaver, lock_field("email")).await;
    drain(&mut stayer_rx);

    engine.disconnect(&leaver).await;

    let events = drain(&mut stayer_rx);
    let unlocked: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::FieldUnlocked(msg) => Some(msg.field_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(unlocked, vec!["email", "name"]);
    assert!(events
        .iter()
        .any(|event| matches!(event, ServerEvent::UserLeft(msg) if msg.user_email == "user1@example.com")));
    let roster = events.iter().rev().find_map(|event| match event {
        ServerEvent::ActiveUsers(msg) => Some(msg.users.clone()),
        _ => None,
    });
    assert_eq!(roster, Some(vec!["user2@example.com".to_string()]));

    assert!(store.field_lock(group_id, "name").await.unwrap().is_none());
    assert!(store.field_lock(group_id, "email").await.unwrap().is_none());
    assert!(drain(&mut leaver_rx).is_empty(), "the leaver hears nothing");
    assert_eq!(engine.connection_count().await, 1);
}

#[tokio::test]
async fn leaving_a_room_keeps_held_locks_until_they_expire() {
    let (engine, store, group_id) = engine_with_room().await;
    let (leaver, mut leaver_rx) = join(&engine, user(1)).await;
    let (_stayer, mut stayer_rx) = join(&engine, user(2)).await;
    drain(&mut leaver_rx);

    engine.handle_event(&leaver, lock_field("name")).await;
    drain(&mut stayer_rx);

    engine
        .handle_event(
            &leaver,
            ClientEvent::LeaveForm(LeaveFormMessage {
                group_code: GROUP.to_string(),
            }),
        )
        .await;

    let events = drain(&mut stayer_rx);
    assert!(events
        .iter()
        .any(|event| matches!(event, ServerEvent::UserLeft(msg) if msg.user_email == "user1@example.com")));
    // An orderly leave is not a disconnect: the lease stays with the
    // holder until it expires or the connection closes.
    assert!(store.field_lock(group_id, "name").await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_emails_collapse_in_the_roster() {
    let (engine, _, _) = engine_with_room().await;
    let (_first, mut rx1) = join(&engine, user(7)).await;

    // The same account opens a second tab.
    let (second, mut rx2) = SessionHandle::new(user(7));
    engine.join_group(&second, GROUP).await.unwrap();
    drain(&mut rx2);

    let events = drain(&mut rx1);
    let roster = events.iter().rev().find_map(|event| match event {
        ServerEvent::ActiveUsers(msg) => Some(msg.users.clone()),
        _ => None,
    });
    assert_eq!(roster, Some(vec!["user7@example.com".to_string()]));
    assert_eq!(engine.connection_count().await, 2);

    // Closing one tab leaves the email present through the other.
    engine.disconnect(&second).await;
    let events = drain(&mut rx1);
    let roster = events.iter().rev().find_map(|event| match event {
        ServerEvent::ActiveUsers(msg) => Some(msg.users.clone()),
        _ => None,
    });
    assert_eq!(roster, Some(vec!["user7@example.com".to_string()]));
}

#[tokio::test]
async fn ping_answers_with_a_timestamped_pong() {
    let (engine, _, _) = engine_with_room().await;
    let (session, mut rx) = SessionHandle::new(user(1));

    engine.handle_event(&session, ClientEvent::Ping).await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        ServerEvent::Pong(msg) => {
            assert!(DateTime::parse_from_rfc3339(&msg.date).is_ok());
        }
        other => panic!("expected pong, got {:?}", other),
    }
}
