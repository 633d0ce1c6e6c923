mod support;

use agency::Replay;
use messaging::MessageSink as _;
use models::{Message, MessageClass, ProtocolType, Recipient, SessionId};
use std::sync::Arc;
use support::*;

/// Replay the journal of one agent on a fresh replica and require its
/// snapshot to match the original's, listeners included.
async fn assert_replays(agency: &agency::Agency, agent_id: &str) {
    let entries = agency.agent_journal(agent_id);
    let original = agency.snapshot_agent_tree(agent_id).unwrap();

    let replay = Replay::new(agency, agent_id);
    replay.apply_all(&entries).await.unwrap();

    assert_eq!(
        replay.snapshot_tree().unwrap(),
        original,
        "replayed snapshot of {agent_id} diverges"
    );
    assert_eq!(
        replay.medium().unwrap().listener_sessions().len(),
        agency
            .medium(agent_id)
            .map(|medium| medium.listener_sessions().len())
            .unwrap_or(0),
        "replayed listener count of {agent_id} diverges"
    );
}

#[tokio::test]
async fn replaying_an_agent_with_a_live_conversation() {
    let agency = test_agency();
    agency.register_protocol(Arc::new(BuyContract));
    agency.register_agent_factory(TestAgentFactory::new(
        "worker",
        AgentConfig {
            interests: vec!["contract:buy".to_string()],
            record_time: true,
            update_descriptor: true,
            ..AgentConfig::default()
        },
    ));

    let medium = agency
        .start_agent(descriptor("w1", "worker"))
        .await
        .unwrap();

    // An announcement opens an interested-side conversation which stays
    // live: the manager never follows up.
    let mut message = Message::new(
        ProtocolType::Contract,
        "buy",
        MessageClass::Announcement,
        agency.get_time().offset(30.0),
        serde_json::json!({"what": "widgets"}),
    );
    message.reply_to = Some(Recipient::new("mgr", "shard"));
    message.sender_id = Some(SessionId::generate());
    assert!(medium.on_message(message).await);
    assert_eq!(medium.listener_sessions().len(), 1);

    assert_replays(&agency, "w1").await;
}

#[tokio::test]
async fn replaying_a_completed_contract_exchange_on_every_side() {
    let agency = test_agency();
    agency.register_protocol(Arc::new(BuyContract));

    agency.register_agent_factory(TestAgentFactory::new(
        "contractor",
        AgentConfig {
            interests: vec!["contract:buy".to_string()],
            ..AgentConfig::default()
        },
    ));
    let managers = TestAgentFactory::new(
        "manager",
        AgentConfig {
            kickoff: Some((
                "contract:buy".to_string(),
                vec![
                    Recipient::new("w2", "shard"),
                    Recipient::new("w3", "shard"),
                ],
                serde_json::json!({"what": "widgets"}),
            )),
            record_time: true,
            ..AgentConfig::default()
        },
    );
    agency.register_agent_factory(managers.clone());

    agency
        .start_agent(descriptor("w2", "contractor"))
        .await
        .unwrap();
    agency
        .start_agent(descriptor("w3", "contractor"))
        .await
        .unwrap();
    agency.start_agent(descriptor("w1", "manager")).await.unwrap();

    let protocol = managers.agent().protocol.lock().unwrap().clone().unwrap();
    finish(&protocol).await.expect("contract completes");

    // Let deferred terminations drain before cutting the journals.
    wait_until("all conversations to close", || {
        ["w1", "w2", "w3"].iter().all(|agent_id| {
            agency
                .medium(agent_id)
                .is_some_and(|medium| medium.listener_sessions().is_empty())
        })
    })
    .await;

    for agent_id in ["w1", "w2", "w3"] {
        assert_replays(&agency, agent_id).await;
    }
}
