mod support;

use agency::{ProtocolFailure, TaskState};
use std::sync::atomic::Ordering;
use support::*;

#[tokio::test]
async fn tasks_complete_with_their_result() {
    let agency = test_agency();
    agency.register_protocol(SleepTaskProtocol::new("task:quick", 5.0, false));

    let workers = TestAgentFactory::new(
        "worker",
        AgentConfig {
            kickoff: Some((
                "task:quick".to_string(),
                vec![],
                serde_json::json!({"ok": true}),
            )),
            ..AgentConfig::default()
        },
    );
    agency.register_agent_factory(workers.clone());
    let medium = agency
        .start_agent(descriptor("w1", "worker"))
        .await
        .unwrap();

    let protocol = workers.agent().protocol.lock().unwrap().clone().unwrap();
    let value = finish(&protocol).await.expect("task completes");
    assert_eq!(
        value.to_json().unwrap(),
        serde_json::json!({"ok": true})
    );

    let machine = protocol.as_task().unwrap();
    assert_eq!(machine.state(), TaskState::Completed);

    wait_until("task listener to unregister", || {
        medium.listener_sessions().is_empty()
    })
    .await;
    assert!(agency
        .agent_journal("w1")
        .iter()
        .any(|entry| entry.entry_id == "protocol_deleted"));
}

#[tokio::test]
async fn stuck_tasks_expire_and_run_the_hook_once() {
    let agency = test_agency();
    let stuck = SleepTaskProtocol::new("task:stuck", 0.05, true);
    agency.register_protocol(stuck.clone());

    let workers = TestAgentFactory::new(
        "worker",
        AgentConfig {
            kickoff: Some((
                "task:stuck".to_string(),
                vec![],
                serde_json::Value::Null,
            )),
            ..AgentConfig::default()
        },
    );
    agency.register_agent_factory(workers.clone());
    let medium = agency
        .start_agent(descriptor("w1", "worker"))
        .await
        .unwrap();

    let protocol = workers.agent().protocol.lock().unwrap().clone().unwrap();
    let failure = finish(&protocol).await.expect_err("task expires");
    assert_eq!(failure, ProtocolFailure::Expired);

    let machine = protocol.as_task().unwrap();
    assert_eq!(machine.state(), TaskState::Expired);
    assert_eq!(stuck.expired_count.load(Ordering::SeqCst), 1);

    wait_until("task listener to unregister", || {
        medium.listener_sessions().is_empty()
    })
    .await;
    let journal = agency.agent_journal("w1");
    assert!(journal.iter().any(|entry| entry.entry_id == "expired"));
    assert!(journal
        .iter()
        .any(|entry| entry.entry_id == "protocol_deleted"));

    // Well past the deadline: the hook still ran exactly once.
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    assert_eq!(stuck.expired_count.load(Ordering::SeqCst), 1);
}
