mod support;

use agency::{ProtocolFailure, RetryPolicy};
use models::Recipient;
use std::sync::Arc;
use support::*;

#[tokio::test]
async fn contract_net_grants_the_cheapest_bid_and_completes() {
    let agency = test_agency();
    agency.register_protocol(Arc::new(BuyContract));

    let contractors = TestAgentFactory::new(
        "contractor",
        AgentConfig {
            interests: vec!["contract:buy".to_string()],
            ..AgentConfig::default()
        },
    );
    agency.register_agent_factory(contractors);

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
            ..AgentConfig::default()
        },
    );
    agency.register_agent_factory(managers.clone());

    let w2 = agency
        .start_agent(descriptor("w2", "contractor"))
        .await
        .unwrap();
    let w3 = agency
        .start_agent(descriptor("w3", "contractor"))
        .await
        .unwrap();
    agency.start_agent(descriptor("w1", "manager")).await.unwrap();

    let protocol = managers
        .agent()
        .protocol
        .lock()
        .unwrap()
        .clone()
        .expect("manager kicked off the contract");

    let reports = finish(&protocol).await.expect("contract completes");
    let snapshot::Live::List(reports) = reports else {
        panic!("completed contracts resolve with their reports");
    };
    assert_eq!(reports.len(), 1);

    let machine = protocol.as_manager().expect("a contract was initiated");
    assert_eq!(machine.state(), agency::ManagerState::Completed);
    // Both contractors bid; the cheaper one (w2) was granted.
    assert_eq!(machine.bids().len(), 2);

    // Terminal listeners unregister everywhere.
    wait_until("all listeners to unregister", || {
        w2.listener_sessions().is_empty()
            && w3.listener_sessions().is_empty()
            && agency
                .medium("w1")
                .is_some_and(|medium| medium.listener_sessions().is_empty())
    })
    .await;

    // The grant went to w2, the rejection to w3, and both conversations
    // ended in a protocol_deleted journal entry.
    for agent_id in ["w1", "w2", "w3"] {
        let journal = agency.agent_journal(agent_id);
        assert!(
            journal
                .iter()
                .any(|entry| entry.entry_id == "protocol_deleted"),
            "{agent_id} journal lacks protocol_deleted"
        );
    }
    assert!(agency
        .agent_journal("w2")
        .iter()
        .any(|entry| entry.entry_id == "granted"));
    assert!(agency
        .agent_journal("w3")
        .iter()
        .any(|entry| entry.entry_id == "rejected"));
}

#[tokio::test]
async fn refusals_count_toward_closing_the_announce_period() {
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
                // w3 bids 3, above the cap, so it refuses; w2 bids 2.
                serde_json::json!({"what": "widgets", "max_price": 2}),
            )),
            ..AgentConfig::default()
        },
    );
    agency.register_agent_factory(managers.clone());

    agency
        .start_agent(descriptor("w2", "contractor"))
        .await
        .unwrap();
    let w3 = agency
        .start_agent(descriptor("w3", "contractor"))
        .await
        .unwrap();
    agency.start_agent(descriptor("w1", "manager")).await.unwrap();

    let protocol = managers.agent().protocol.lock().unwrap().clone().unwrap();
    finish(&protocol).await.expect("contract completes");

    let machine = protocol.as_manager().unwrap();
    assert_eq!(machine.state(), agency::ManagerState::Completed);
    assert_eq!(machine.bids().len(), 1);

    wait_until("refusing contractor to unregister", || {
        w3.listener_sessions().is_empty()
    })
    .await;
    // The refusal never reached the manager's journal as an entry, and
    // no grant was sent to w3.
    assert!(!agency
        .agent_journal("w3")
        .iter()
        .any(|entry| entry.entry_id == "granted"));
}

#[tokio::test]
async fn cancellation_reaches_engaged_contractors() {
    let agency = test_agency();
    agency.register_protocol(Arc::new(CancelContract));

    agency.register_agent_factory(TestAgentFactory::new(
        "contractor",
        AgentConfig {
            interests: vec!["contract:cancel".to_string()],
            ..AgentConfig::default()
        },
    ));
    let managers = TestAgentFactory::new(
        "manager",
        AgentConfig {
            kickoff: Some((
                "contract:cancel".to_string(),
                vec![Recipient::new("w2", "shard")],
                serde_json::json!({"what": "widgets"}),
            )),
            ..AgentConfig::default()
        },
    );
    agency.register_agent_factory(managers.clone());

    let w2 = agency
        .start_agent(descriptor("w2", "contractor"))
        .await
        .unwrap();
    agency.start_agent(descriptor("w1", "manager")).await.unwrap();

    let protocol = managers.agent().protocol.lock().unwrap().clone().unwrap();
    let failure = finish(&protocol).await.expect_err("exchange was cancelled");
    assert_eq!(failure, ProtocolFailure::Cancelled);
    assert_eq!(
        protocol.as_manager().unwrap().state(),
        agency::ManagerState::Cancelled
    );

    wait_until("contractor to see the cancellation", || {
        agency
            .agent_journal("w2")
            .iter()
            .any(|entry| entry.entry_id == "cancelled")
    })
    .await;
    wait_until("contractor listener to unregister", || {
        w2.listener_sessions().is_empty()
    })
    .await;
}

struct HandoverContract;

impl agency::ProtocolFactory for HandoverContract {
    fn key(&self) -> &str {
        "contract:handover"
    }
    fn protocol_type(&self) -> models::ProtocolType {
        models::ProtocolType::Contract
    }
    fn protocol_id(&self) -> &str {
        "handover"
    }
    fn make_initiator(
        &self,
        _agent: &Arc<dyn agency::Agent>,
    ) -> Option<agency::InitiatorSide> {
        Some(agency::InitiatorSide::Manager(Arc::new(HandoverManager)))
    }
    fn make_interested(
        &self,
        _agent: &Arc<dyn agency::Agent>,
    ) -> Option<agency::InterestedSide> {
        Some(agency::InterestedSide::Contractor(Arc::new(
            BuyContractor::default(),
        )))
    }
}

struct HandoverManager;

#[async_trait::async_trait]
impl agency::ContractManager for HandoverManager {
    async fn initiate(
        &self,
        ctx: &agency::Context,
        medium: &Arc<agency::ManagerMedium>,
        args: serde_json::Value,
    ) -> anyhow::Result<()> {
        medium.announce(ctx, args, 5.0).await?;
        Ok(())
    }

    // Instead of granting ourselves, transfer the grant to another
    // manager.
    async fn closed(
        &self,
        ctx: &agency::Context,
        medium: &Arc<agency::ManagerMedium>,
    ) -> anyhow::Result<()> {
        let bid = medium.bids().first().cloned().expect("one bid");
        let grant = models::Message::reply_to(
            &bid,
            models::MessageClass::Grant,
            bid.expiration_time,
            serde_json::json!({"go": true}),
        );
        medium
            .handover(ctx, Recipient::new("observer", "shard"), grant)
            .await?;
        Ok(())
    }
}

struct Observer(tokio::sync::mpsc::UnboundedSender<models::Message>);

#[async_trait::async_trait]
impl messaging::MessageSink for Observer {
    async fn on_message(&self, message: models::Message) -> bool {
        self.0.send(message).is_ok()
    }
}

#[tokio::test]
async fn handover_forwards_the_grant_without_restamping() {
    let (agency, broker) = test_agency_with_broker();
    agency.register_protocol(Arc::new(HandoverContract));

    agency.register_agent_factory(TestAgentFactory::new(
        "contractor",
        AgentConfig {
            interests: vec!["contract:handover".to_string()],
            ..AgentConfig::default()
        },
    ));
    let managers = TestAgentFactory::new(
        "manager",
        AgentConfig {
            kickoff: Some((
                "contract:handover".to_string(),
                vec![Recipient::new("w2", "shard")],
                serde_json::json!({"what": "widgets"}),
            )),
            ..AgentConfig::default()
        },
    );
    agency.register_agent_factory(managers.clone());

    agency
        .start_agent(descriptor("w2", "contractor"))
        .await
        .unwrap();
    agency.start_agent(descriptor("w1", "manager")).await.unwrap();

    // A bare broker subscriber standing in for the other manager.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let observer: Arc<dyn messaging::MessageSink> = Arc::new(Observer(tx));
    let channel = messaging::ConnectionFactory::get_connection(&broker, Arc::downgrade(&observer))
        .await
        .unwrap();
    channel.personal_binding("observer", "shard").unwrap();

    let protocol = managers.agent().protocol.lock().unwrap().clone().unwrap();
    finish(&protocol).await.expect("handover completes our side");

    let forwarded = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
        .await
        .expect("grant is forwarded")
        .unwrap();
    assert_eq!(forwarded.class, models::MessageClass::Grant);
    // No re-stamping took place: the constructed message still has no
    // return address, and it kept the contractor session as receiver.
    assert!(forwarded.reply_to.is_none());
    assert!(forwarded.receiver_id.is_some());
}

#[tokio::test]
async fn request_exchange_round_trips() {
    let agency = test_agency();
    agency.register_protocol(Arc::new(EchoRequest));

    agency.register_agent_factory(TestAgentFactory::new(
        "replier",
        AgentConfig {
            interests: vec!["request:echo".to_string()],
            ..AgentConfig::default()
        },
    ));
    let requesters = TestAgentFactory::new(
        "requester",
        AgentConfig {
            kickoff: Some((
                "request:echo".to_string(),
                vec![Recipient::new("r1", "shard")],
                serde_json::json!({"text": "marco"}),
            )),
            ..AgentConfig::default()
        },
    );
    agency.register_agent_factory(requesters.clone());

    let replier = agency
        .start_agent(descriptor("r1", "replier"))
        .await
        .unwrap();
    agency.start_agent(descriptor("q1", "requester")).await.unwrap();

    let protocol = requesters
        .agent()
        .protocol
        .lock()
        .unwrap()
        .clone()
        .expect("requester kicked off");

    let reply = finish(&protocol).await.expect("request closes");
    // The reply carries the echoed payload back.
    let reply = message_from(&reply);
    assert_eq!(reply.payload["text"], serde_json::json!("marco"));

    let machine = protocol.as_requester().unwrap();
    assert_eq!(machine.state(), agency::RequestState::Closed);

    wait_until("replier listener to unregister", || {
        replier.listener_sessions().is_empty()
    })
    .await;
}

#[tokio::test]
async fn unanswered_requests_expire() {
    let agency = test_agency();
    agency.register_protocol(Arc::new(EchoRequest));

    let requesters = TestAgentFactory::new(
        "requester",
        AgentConfig {
            kickoff: Some((
                "request:echo".to_string(),
                // Nobody is listening at this address.
                vec![Recipient::new("ghost", "shard")],
                serde_json::json!({"text": "anyone?"}),
            )),
            ..AgentConfig::default()
        },
    );
    agency.register_agent_factory(requesters.clone());
    agency.start_agent(descriptor("q1", "requester")).await.unwrap();

    let protocol = requesters.agent().protocol.lock().unwrap().clone().unwrap();
    let failure = finish(&protocol).await.expect_err("request expires");
    assert_eq!(failure, ProtocolFailure::Expired);
    assert_eq!(
        protocol.as_requester().unwrap().state(),
        agency::RequestState::Expired
    );
}

#[tokio::test]
async fn retrying_protocol_survives_a_flaky_peer() {
    let agency = test_agency();
    let (factory, _failures) = FlakyEchoRequest::new(1);
    agency.register_protocol(factory);

    agency.register_agent_factory(TestAgentFactory::new(
        "replier",
        AgentConfig {
            interests: vec!["request:flaky-echo".to_string()],
            ..AgentConfig::default()
        },
    ));
    let requesters = TestAgentFactory::new(
        "requester",
        AgentConfig {
            kickoff: Some((
                "request:flaky-echo".to_string(),
                vec![Recipient::new("r1", "shard")],
                serde_json::json!({"text": "persist"}),
            )),
            retry: Some(RetryPolicy {
                max_retries: Some(3),
                initial_delay: 0.05,
                max_delay: Some(0.2),
            }),
            ..AgentConfig::default()
        },
    );
    agency.register_agent_factory(requesters.clone());

    agency.start_agent(descriptor("r1", "replier")).await.unwrap();
    agency.start_agent(descriptor("q1", "requester")).await.unwrap();

    let protocol = requesters.agent().protocol.lock().unwrap().clone().unwrap();
    // The first attempt fails and expires; the wrapper retries and the
    // second conversation succeeds.
    let reply = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        protocol.notify_finish(),
    )
    .await
    .expect("retry loop settles")
    .expect("second attempt succeeds");

    assert_eq!(message_from(&reply).payload["text"], serde_json::json!("persist"));
}
