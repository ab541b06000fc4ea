//! Integration tests: dispatcher routing, dedup, bot delivery ordering and the live-agent desk.

mod common;

use common::{creds, event, key, text, Call, Harness, ScriptedNlu};
use handoff::conversation::{ConversationKey, ConversationRecord, ConversationStatus, Sender};
use handoff::credentials::CredentialSource;
use handoff::error::ConversationError;
use handoff::inbound::InboundKind;
use handoff::live_agent::DeskEvent;
use handoff::messaging::EventType;
use handoff::nlu::Fulfillment;
use handoff::routing::{resolve_status, Dispatch};
use std::collections::HashMap;
use std::sync::Arc;

async fn with_credentials(nlu: ScriptedNlu) -> Harness {
    let h = Harness::new(nlu);
    h.store.put_credentials("agent-1", creds(None)).await.unwrap();
    h
}

fn flags_exclusive(record: &ConversationRecord) -> bool {
    !(record.representative().is_some() && record.requested_live_agent())
}

#[tokio::test]
async fn first_contact_creates_bot_record() {
    let h = Harness::new(ScriptedNlu::default());
    let status = resolve_status(&h.store, &key(), "Ada", 100).await.unwrap();
    assert_eq!(status, ConversationStatus::SpeakingWithBot);

    let record = h.store.get(&key()).await.unwrap();
    assert_eq!(record.display_name, "Ada");
    assert!(record.message_ids.is_empty());
    assert!(!record.csat_sent);
    assert!(!record.requested_live_agent());
    assert_eq!(record.last_timestamp, 100);

    // A later resolve does not rename or reset the record.
    resolve_status(&h.store, &key(), "Someone else", 200).await.unwrap();
    assert_eq!(h.store.get(&key()).await.unwrap().display_name, "Ada");
}

#[tokio::test]
async fn duplicate_message_is_processed_once() {
    let h = with_credentials(ScriptedNlu::replying(&["Hello!"])).await;

    let first = h.dispatcher.route_at(text("m-1", "hi"), 100).await.unwrap();
    let second = h.dispatcher.route_at(text("m-1", "hi"), 101).await.unwrap();
    assert_eq!(first, Dispatch::Bot);
    assert_eq!(second, Dispatch::Duplicate);

    let record = h.store.get(&key()).await.unwrap();
    let user_messages: Vec<_> = record
        .messages
        .iter()
        .filter(|m| m.sender == Sender::User)
        .collect();
    assert_eq!(user_messages.len(), 1);
    assert_eq!(h.nlu.queries(), vec!["hi".to_string()]);
    assert_eq!(h.sender.message_texts(), vec!["Hello!".to_string()]);
}

#[tokio::test]
async fn concurrent_redelivery_accepts_exactly_one() {
    let h = Arc::new(with_credentials(ScriptedNlu::replying(&["ok"])).await);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.dispatcher.route_at(text("m-7", "same"), 100).await.unwrap()
        }));
    }
    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() == Dispatch::Bot {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(h.nlu.queries().len(), 1);
}

#[tokio::test]
async fn replies_follow_typing_stop_in_order() {
    let nlu = ScriptedNlu::default();
    *nlu.replies.lock().unwrap() = vec![
        Fulfillment::Payload(serde_json::json!({
            "richCard": {"standaloneCard": {"cardContent": {"title": "cardA"}}}
        })),
        Fulfillment::Text("textB".to_string()),
    ];
    let h = with_credentials(nlu).await;
    h.dispatcher.route_at(text("m-1", "hours?"), 100).await.unwrap();

    let calls = h.sender.calls();
    let stops: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, Call::Event { event_type: EventType::TypingStopped, .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(stops.len(), 1);
    assert!(matches!(
        calls[0],
        Call::Event { event_type: EventType::TypingStarted, .. }
    ));
    assert_eq!(stops[0], 1);
    assert!(matches!(&calls[2], Call::Message { text: None, .. }));
    assert!(matches!(&calls[3], Call::Message { text: Some(t), .. } if t == "textB"));

    let record = h.store.get(&key()).await.unwrap();
    let bot: Vec<_> = record
        .messages
        .iter()
        .filter(|m| m.sender == Sender::Bot)
        .collect();
    assert_eq!(bot.len(), 2);
    assert!(bot.iter().all(|m| m.sent));
    assert_eq!(bot[1].message_info.text.as_deref(), Some("textB"));
}

#[tokio::test]
async fn failed_delivery_stops_the_rest() {
    let h = with_credentials(ScriptedNlu::replying(&["one", "two", "three"])).await;
    *h.sender.fail_messages_after.lock().unwrap() = Some(1);
    h.dispatcher.route_at(text("m-1", "hi"), 100).await.unwrap();

    assert_eq!(h.sender.message_texts(), vec!["one".to_string()]);
    let record = h.store.get(&key()).await.unwrap();
    let sent: Vec<bool> = record
        .messages
        .iter()
        .filter(|m| m.sender == Sender::Bot)
        .map(|m| m.sent)
        .collect();
    assert_eq!(sent, vec![true, false, false]);
}

#[tokio::test]
async fn nlu_failure_still_stops_typing() {
    let nlu = ScriptedNlu::replying(&["never"]);
    *nlu.fail.lock().unwrap() = true;
    let h = with_credentials(nlu).await;
    let dispatch = h.dispatcher.route_at(text("m-1", "hi"), 100).await.unwrap();
    assert_eq!(dispatch, Dispatch::Bot);

    let calls = h.sender.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(
        calls[1],
        Call::Event { event_type: EventType::TypingStopped, .. }
    ));
    // The user message is kept even though no reply went out.
    assert_eq!(h.store.get(&key()).await.unwrap().messages.len(), 1);
}

#[tokio::test]
async fn missing_credentials_route_to_live_agent() {
    let h = Harness::new(ScriptedNlu::replying(&["unused"]));
    let dispatch = h.dispatcher.route_at(text("m-1", "anyone?"), 100).await.unwrap();
    assert_eq!(dispatch, Dispatch::LiveAgent);
    assert!(h.nlu.queries().is_empty());
    assert!(matches!(
        h.transport.events().as_slice(),
        [DeskEvent::UserMessage { text, .. }] if text == "anyone?"
    ));
}

#[tokio::test]
async fn config_credentials_are_used_when_selected() {
    let mut agents = HashMap::new();
    agents.insert("agent-1".to_string(), creds(None));
    let h = Harness::with_agents(ScriptedNlu::replying(&["hi"]), CredentialSource::Config, agents);
    let dispatch = h.dispatcher.route_at(text("m-1", "hello"), 100).await.unwrap();
    assert_eq!(dispatch, Dispatch::Bot);
}

#[tokio::test]
async fn inbound_activity_rearms_survey() {
    let h = with_credentials(ScriptedNlu::replying(&["ok"])).await;
    h.dispatcher.route_at(text("m-1", "hi"), 100).await.unwrap();
    h.store
        .update(&key(), |r| {
            r.csat_sent = true;
            r.user_is_typing = true;
            Ok(())
        })
        .await
        .unwrap();

    h.dispatcher
        .route_at(event(InboundKind::Typing { is_typing: true }), 500)
        .await
        .unwrap();
    let record = h.store.get(&key()).await.unwrap();
    assert!(!record.csat_sent);
    assert_eq!(record.last_timestamp, 500);
    assert!(record.user_is_typing);
}

#[tokio::test]
async fn live_agent_request_then_join_then_leave() {
    let h = with_credentials(ScriptedNlu::replying(&["bot reply"])).await;

    let dispatch = h
        .dispatcher
        .route_at(event(InboundKind::RequestedLiveAgent), 100)
        .await
        .unwrap();
    assert_eq!(dispatch, Dispatch::Bot);
    let record = h.store.get(&key()).await.unwrap();
    assert_eq!(record.status(), ConversationStatus::RequestedLiveAgent);
    assert!(flags_exclusive(&record));
    assert!(matches!(
        h.transport.events().as_slice(),
        [DeskEvent::LiveAgentRequested { .. }]
    ));

    // A second request is rejected and changes nothing.
    let err = h
        .dispatcher
        .route_at(event(InboundKind::RequestedLiveAgent), 110)
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::AlreadyRequested));

    h.desk.join(&key(), "Echo").await.unwrap();
    let record = h.store.get(&key()).await.unwrap();
    assert_eq!(record.representative(), Some("Echo"));
    assert!(flags_exclusive(&record));

    // With a human joined, user text goes to the desk, not the NLU.
    let queries_before = h.nlu.queries().len();
    let dispatch = h.dispatcher.route_at(text("m-2", "hello human"), 200).await.unwrap();
    assert_eq!(dispatch, Dispatch::LiveAgent);
    assert_eq!(h.nlu.queries().len(), queries_before);

    let reply = h.desk.send(&key(), "Hi, Echo here", 210).await.unwrap();
    assert_eq!(reply.text.as_deref(), Some("Hi, Echo here"));
    let record = h.store.get(&key()).await.unwrap();
    let last = record.messages.last().unwrap();
    assert_eq!(last.sender, Sender::Agent);
    assert!(last.sent);

    h.sender.clear();
    h.desk.leave(&key()).await.unwrap();
    let calls = h.sender.calls();
    assert_eq!(
        calls,
        vec![
            Call::Event {
                conversation_id: "conv-1".to_string(),
                event_type: EventType::RepresentativeLeft
            },
            Call::Survey {
                conversation_id: "conv-1".to_string()
            },
        ]
    );
    let record = h.store.get(&key()).await.unwrap();
    assert_eq!(record.status(), ConversationStatus::SpeakingWithBot);
    assert!(record.csat_sent);
    assert!(flags_exclusive(&record));
}

#[tokio::test]
async fn desk_actions_validate_state() {
    let h = with_credentials(ScriptedNlu::default()).await;
    h.dispatcher.route_at(text("m-1", "hi"), 100).await.unwrap();

    assert!(matches!(
        h.desk.leave(&key()).await,
        Err(ConversationError::NoRepresentativePresent)
    ));
    assert!(matches!(
        h.desk.send(&key(), "hello", 110).await,
        Err(ConversationError::NoRepresentativePresent)
    ));
    assert!(matches!(
        h.desk.join(&key(), "  ").await,
        Err(ConversationError::MissingArguments(_))
    ));
    h.desk.join(&key(), "Echo").await.unwrap();
    assert!(matches!(
        h.desk.join(&key(), "Fox").await,
        Err(ConversationError::RepresentativeAlreadyPresent)
    ));

    let missing = ConversationKey::new("agent-1", "nope");
    assert!(matches!(
        h.desk.typing(&missing, true).await,
        Err(ConversationError::ConversationNotFound(_))
    ));
}

fn suggestion(postback: &str) -> handoff::inbound::InboundEvent {
    event(InboundKind::Suggestion {
        postback_data: postback.to_string(),
    })
}

#[tokio::test]
async fn suggestion_reaches_nlu_every_time() {
    let h = with_credentials(ScriptedNlu::replying(&["We open at 9"])).await;

    let first = h.dispatcher.route_at(suggestion("hours"), 100).await.unwrap();
    let second = h.dispatcher.route_at(suggestion("hours"), 101).await.unwrap();
    assert_eq!(first, Dispatch::Bot);
    assert_eq!(second, Dispatch::Bot);
    assert_eq!(h.nlu.queries(), vec!["hours".to_string(), "hours".to_string()]);

    let record = h.store.get(&key()).await.unwrap();
    let user: Vec<_> = record
        .messages
        .iter()
        .filter(|m| m.sender == Sender::User)
        .collect();
    assert_eq!(user.len(), 2);
    assert!(user.iter().all(|m| m.message_info.text.as_deref() == Some("hours")));
    assert!(user.iter().all(|m| m.message_info.message_id.is_none()));
    assert!(record.message_ids.is_empty());
}

#[tokio::test]
async fn suggestion_goes_to_joined_human() {
    let h = with_credentials(ScriptedNlu::replying(&["unused"])).await;
    resolve_status(&h.store, &key(), "Ada", 100).await.unwrap();
    h.desk.join(&key(), "Echo").await.unwrap();

    for at in [200, 201] {
        let dispatch = h.dispatcher.route_at(suggestion("refund"), at).await.unwrap();
        assert_eq!(dispatch, Dispatch::LiveAgent);
    }
    assert!(h.nlu.queries().is_empty());

    let forwarded: Vec<_> = h
        .transport
        .events()
        .into_iter()
        .filter(|e| matches!(e, DeskEvent::UserMessage { text, .. } if text == "refund"))
        .collect();
    assert_eq!(forwarded.len(), 2);

    let record = h.store.get(&key()).await.unwrap();
    let user = record
        .messages
        .iter()
        .filter(|m| m.sender == Sender::User && m.message_info.text.as_deref() == Some("refund"))
        .count();
    assert_eq!(user, 2);
}

#[tokio::test]
async fn leave_still_surveys_when_announcement_fails() {
    let h = with_credentials(ScriptedNlu::default()).await;
    resolve_status(&h.store, &key(), "Ada", 100).await.unwrap();
    *h.sender.fail_events.lock().unwrap() = true;

    // Join is committed and reported as done even though the announcement was lost.
    h.desk.join(&key(), "Echo").await.unwrap();
    assert_eq!(
        h.store.get(&key()).await.unwrap().representative(),
        Some("Echo")
    );

    h.desk.leave(&key()).await.unwrap();
    assert_eq!(h.sender.surveys(), vec!["conv-1".to_string()]);
    let record = h.store.get(&key()).await.unwrap();
    assert_eq!(record.status(), ConversationStatus::SpeakingWithBot);
    assert!(record.csat_sent);
}

#[tokio::test]
async fn failed_leave_survey_stays_armed() {
    let h = with_credentials(ScriptedNlu::default()).await;
    resolve_status(&h.store, &key(), "Ada", 100).await.unwrap();
    h.desk.join(&key(), "Echo").await.unwrap();
    h.sender
        .fail_surveys_for
        .lock()
        .unwrap()
        .push("conv-1".to_string());

    h.desk.leave(&key()).await.unwrap();
    let record = h.store.get(&key()).await.unwrap();
    assert_eq!(record.status(), ConversationStatus::SpeakingWithBot);
    assert!(!record.csat_sent);
}
