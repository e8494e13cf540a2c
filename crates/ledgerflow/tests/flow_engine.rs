//! End-to-end tests driving the state machine manager against in-memory
//! collaborators.

mod support;

use std::sync::Arc;
use std::time::Duration;

use ledgerflow::{
    Change, DatabaseErrorKind, ExistingSessionMessage, ExistingSessionPayload, FlowErrorKind,
    InMemoryCheckpointStorage, InitialSessionMessage, InvocationContext, LedgerTransactionId,
    Party, RecordingFlowMessaging, RemovalOutcome, SerializedBytes, SessionId, SessionMessage,
    StartFlowOptions, StateMachineConfig, StateMachineManager,
};

use support::{
    test_flow_info, wait_until, AsyncOpFlow, BrokenFactory, CommitWaitFlow, CompleteImmediately,
    CountingHandler, FailingFlow, PingFlow, ResponderFactory, SleeperFlow, TestHydrator,
    PING_CLASS,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct TestNode {
    manager: StateMachineManager,
    storage: Arc<InMemoryCheckpointStorage>,
    messaging: Arc<RecordingFlowMessaging>,
}

async fn test_node() -> TestNode {
    test_node_with(StateMachineConfig::default(), Arc::new(InMemoryCheckpointStorage::new())).await
}

async fn test_node_with(
    config: StateMachineConfig,
    storage: Arc<InMemoryCheckpointStorage>,
) -> TestNode {
    let messaging = Arc::new(RecordingFlowMessaging::new());
    let manager = StateMachineManager::builder(Party::new("O=Us"))
        .config(config)
        .storage(Arc::clone(&storage) as Arc<dyn ledgerflow::CheckpointStorage>)
        .messaging(Arc::clone(&messaging) as Arc<dyn ledgerflow::FlowMessaging>)
        .hydrator(Arc::new(TestHydrator))
        .register_initiated_flow(PING_CLASS, Arc::new(ResponderFactory { reply: b"pong".to_vec() }))
        .build();
    manager.start().await.expect("manager start");
    TestNode {
        manager,
        storage,
        messaging,
    }
}

fn start_options(initiating: bool) -> StartFlowOptions {
    StartFlowOptions {
        class_name: PING_CLASS.into(),
        flow_info: initiating.then(test_flow_info),
        timed: false,
        context: InvocationContext::rpc("tests"),
    }
}

fn sent_initial_messages(
    messaging: &RecordingFlowMessaging,
) -> Vec<InitialSessionMessage> {
    messaging
        .sent()
        .into_iter()
        .filter_map(|outbound| match outbound.message {
            SessionMessage::Initial(message) => Some(message),
            _ => None,
        })
        .collect()
}

fn sent_existing_payloads(messaging: &RecordingFlowMessaging) -> Vec<(SessionId, ExistingSessionPayload)> {
    messaging
        .sent()
        .into_iter()
        .filter_map(|outbound| match outbound.message {
            SessionMessage::Existing(message) => {
                Some((message.recipient_session_id, message.payload))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn explicit_flow_runs_to_completion() {
    let node = test_node().await;
    let mut changes = node.manager.subscribe_changes();

    let handle = node
        .manager
        .start_flow(
            start_options(false),
            Box::new(CompleteImmediately {
                result: serde_json::json!("done"),
            }),
        )
        .expect("start flow");

    let result = tokio::time::timeout(TEST_TIMEOUT, handle.result)
        .await
        .expect("result timeout")
        .expect("result channel");
    assert_eq!(result.expect("flow succeeded"), serde_json::json!("done"));

    // No residue: checkpoint gone, flow gone.
    wait_until(TEST_TIMEOUT, || node.storage.is_empty()).await;
    wait_until(TEST_TIMEOUT, || node.manager.live_flow_count() == 0).await;

    let mut saw_added = false;
    let mut saw_removed = false;
    wait_until(TEST_TIMEOUT, || {
        while let Ok(change) = changes.try_recv() {
            match change {
                Change::Added { .. } => saw_added = true,
                Change::Removed {
                    outcome: RemovalOutcome::Success(_),
                    ..
                } => saw_removed = true,
                Change::Removed { .. } => {}
            }
        }
        saw_added && saw_removed
    })
    .await;
}

#[tokio::test]
async fn session_init_for_unknown_class_is_rejected() {
    let node = test_node().await;
    let handler = CountingHandler::flow_start();

    node.manager.on_session_message(
        Party::new("O=Peer"),
        SessionMessage::Initial(InitialSessionMessage {
            initiator_session_id: SessionId::from_raw(5),
            initiation_entropy: 1,
            initiator_flow_class_name: "app.Unknown".into(),
            flow_version: 1,
            app_name: "test-app".into(),
            first_payload: None,
        }),
        handler.clone(),
    );

    wait_until(TEST_TIMEOUT, || {
        sent_existing_payloads(&node.messaging)
            .iter()
            .any(|(recipient, payload)| {
                *recipient == SessionId::from_raw(5)
                    && matches!(
                        payload,
                        ExistingSessionPayload::Reject { message, .. }
                            if message.contains("unknown flow class app.Unknown")
                    )
            })
    })
    .await;
    assert_eq!(handler.acknowledged_count(), 1);
    assert_eq!(node.manager.live_flow_count(), 0);
}

#[tokio::test]
async fn session_init_with_broken_factory_is_rejected() {
    let storage = Arc::new(InMemoryCheckpointStorage::new());
    let messaging = Arc::new(RecordingFlowMessaging::new());
    let manager = StateMachineManager::builder(Party::new("O=Us"))
        .storage(Arc::clone(&storage) as Arc<dyn ledgerflow::CheckpointStorage>)
        .messaging(Arc::clone(&messaging) as Arc<dyn ledgerflow::FlowMessaging>)
        .register_initiated_flow(PING_CLASS, Arc::new(BrokenFactory))
        .build();
    manager.start().await.expect("manager start");

    manager.on_session_message(
        Party::new("O=Peer"),
        SessionMessage::Initial(InitialSessionMessage {
            initiator_session_id: SessionId::from_raw(6),
            initiation_entropy: 1,
            initiator_flow_class_name: PING_CLASS.into(),
            flow_version: 1,
            app_name: "test-app".into(),
            first_payload: None,
        }),
        CountingHandler::flow_start(),
    );

    wait_until(TEST_TIMEOUT, || {
        messaging.sent().iter().any(|outbound| {
            matches!(
                &outbound.message,
                SessionMessage::Existing(ExistingSessionMessage {
                    payload: ExistingSessionPayload::Reject { message, .. },
                    ..
                }) if message.contains("responder construction failed")
            )
        })
    })
    .await;
}

#[tokio::test]
async fn initiator_completes_a_ping_pong_round_trip() {
    let node = test_node().await;

    let handle = node
        .manager
        .start_flow(
            start_options(true),
            Box::new(PingFlow::new("O=Peer", b"ping".to_vec())),
        )
        .expect("start flow");

    // The handshake goes out with the first payload folded in.
    wait_until(TEST_TIMEOUT, || {
        !sent_initial_messages(&node.messaging).is_empty()
    })
    .await;
    let init = sent_initial_messages(&node.messaging).remove(0);
    assert_eq!(init.initiator_flow_class_name, PING_CLASS);
    assert_eq!(init.first_payload, Some(SerializedBytes::new(b"ping".to_vec())));

    // While waiting for the reply the flow reports its counterparty.
    wait_until(TEST_TIMEOUT, || {
        !node.manager.flows_waiting_for(&Party::new("O=Peer")).is_empty()
    })
    .await;

    // Peer confirms, then answers.
    node.manager.on_session_message(
        Party::new("O=Peer"),
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: init.initiator_session_id,
            payload: ExistingSessionPayload::Confirm {
                initiated_session_id: SessionId::from_raw(7000),
                initiated_flow_info: test_flow_info(),
            },
        }),
        CountingHandler::new(),
    );
    node.manager.on_session_message(
        Party::new("O=Peer"),
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: init.initiator_session_id,
            payload: ExistingSessionPayload::Data {
                payload: SerializedBytes::new(b"pong".to_vec()),
            },
        }),
        CountingHandler::new(),
    );

    let result = tokio::time::timeout(TEST_TIMEOUT, handle.result)
        .await
        .expect("result timeout")
        .expect("result channel")
        .expect("flow succeeded");
    assert_eq!(result, serde_json::json!({ "reply": b"pong".to_vec() }));

    // The clean finish also notified the peer's session end.
    let ends: Vec<_> = sent_existing_payloads(&node.messaging)
        .into_iter()
        .filter(|(recipient, payload)| {
            *recipient == SessionId::from_raw(7000)
                && matches!(payload, ExistingSessionPayload::End)
        })
        .collect();
    assert_eq!(ends.len(), 1);
    wait_until(TEST_TIMEOUT, || node.storage.is_empty()).await;
}

#[tokio::test]
async fn responder_confirms_and_answers_with_deterministic_dedup_ids() {
    let node = test_node().await;
    let handler = CountingHandler::flow_start();

    node.manager.on_session_message(
        Party::new("O=Initiator"),
        SessionMessage::Initial(InitialSessionMessage {
            initiator_session_id: SessionId::from_raw(5),
            initiation_entropy: 9,
            initiator_flow_class_name: PING_CLASS.into(),
            flow_version: 1,
            app_name: "test-app".into(),
            first_payload: Some(SerializedBytes::new(b"ping".to_vec())),
        }),
        handler.clone(),
    );

    // Confirmation carries our session id and flow info.
    wait_until(TEST_TIMEOUT, || {
        sent_existing_payloads(&node.messaging)
            .iter()
            .any(|(recipient, payload)| {
                *recipient == SessionId::from_raw(5)
                    && matches!(payload, ExistingSessionPayload::Confirm { .. })
            })
    })
    .await;

    // The responder consumes the handshake payload and answers.
    wait_until(TEST_TIMEOUT, || {
        sent_existing_payloads(&node.messaging)
            .iter()
            .any(|(_, payload)| matches!(payload, ExistingSessionPayload::Data { .. }))
    })
    .await;

    let sent = node.messaging.sent();
    let data = sent
        .iter()
        .find(|outbound| {
            matches!(
                &outbound.message,
                SessionMessage::Existing(ExistingSessionMessage {
                    payload: ExistingSessionPayload::Data { .. },
                    ..
                })
            )
        })
        .expect("data reply");
    // Responder seed D-5-9; reply sent at the second suspension, index 0.
    assert_eq!(data.dedup.deduplication_id.as_str(), "N-D-5-9-2-0");
    assert_eq!(data.destination, Party::new("O=Initiator"));

    // Flow-start delivery was acknowledged after the initial checkpoint.
    wait_until(TEST_TIMEOUT, || handler.acknowledged_count() == 1).await;
    wait_until(TEST_TIMEOUT, || node.storage.is_empty()).await;
}

#[tokio::test]
async fn sleeping_flow_wakes_and_finishes() {
    let node = test_node().await;

    let handle = node
        .manager
        .start_flow(start_options(false), Box::new(SleeperFlow::new(50)))
        .expect("start flow");

    let result = tokio::time::timeout(TEST_TIMEOUT, handle.result)
        .await
        .expect("result timeout")
        .expect("result channel")
        .expect("flow succeeded");
    assert_eq!(result, serde_json::json!("rested"));
}

#[tokio::test]
async fn hospital_bounds_constraint_violation_retries() {
    let node = test_node().await;

    let handle = node
        .manager
        .start_flow(
            start_options(false),
            Box::new(FailingFlow::new(FlowErrorKind::Database {
                kind: DatabaseErrorKind::ConstraintViolation,
                message: "duplicate key".into(),
            })),
        )
        .expect("start flow");

    // Discharged a bounded number of times, then propagated as a failure.
    let result = tokio::time::timeout(TEST_TIMEOUT, handle.result)
        .await
        .expect("result timeout")
        .expect("result channel");
    let error = result.expect_err("flow must fail after bounded retries");
    assert!(matches!(
        error.kind,
        FlowErrorKind::Database {
            kind: DatabaseErrorKind::ConstraintViolation,
            ..
        }
    ));
    wait_until(TEST_TIMEOUT, || node.storage.is_empty()).await;
}

#[tokio::test]
async fn unknown_errors_propagate_immediately() {
    let node = test_node().await;

    let handle = node
        .manager
        .start_flow(
            start_options(false),
            Box::new(FailingFlow::new(FlowErrorKind::FlowException {
                message: "business rule violated".into(),
            })),
        )
        .expect("start flow");

    let result = tokio::time::timeout(TEST_TIMEOUT, handle.result)
        .await
        .expect("result timeout")
        .expect("result channel");
    let error = result.expect_err("flow must fail");
    assert!(matches!(error.kind, FlowErrorKind::FlowException { .. }));
}

#[tokio::test]
async fn kill_flow_interrupts_and_cleans_up() {
    let node = test_node().await;
    let mut changes = node.manager.subscribe_changes();

    let handle = node
        .manager
        .start_flow(start_options(false), Box::new(SleeperFlow::new(60_000)))
        .expect("start flow");
    let flow_id = handle.flow_id;

    // Wait until the sleep checkpoint is persisted.
    wait_until(TEST_TIMEOUT, || !node.storage.is_empty()).await;

    assert!(node.manager.kill_flow(flow_id).await);
    assert!(node.storage.is_empty());
    assert_eq!(node.manager.live_flow_count(), 0);

    let result = tokio::time::timeout(TEST_TIMEOUT, handle.result)
        .await
        .expect("result timeout")
        .expect("result channel");
    assert!(matches!(
        result.expect_err("killed flows fail their result").kind,
        FlowErrorKind::Killed
    ));

    let mut saw_killed = false;
    while let Ok(change) = changes.try_recv() {
        if matches!(
            change,
            Change::Removed {
                outcome: RemovalOutcome::Killed,
                ..
            }
        ) {
            saw_killed = true;
        }
    }
    assert!(saw_killed, "expected a Removed(Killed) notification");

    // Killing again reports the flow as unknown.
    assert!(!node.manager.kill_flow(flow_id).await);
}

#[tokio::test]
async fn soft_shutdown_preserves_suspended_checkpoints() {
    let node = test_node().await;

    let _handle = node
        .manager
        .start_flow(
            start_options(true),
            Box::new(PingFlow::new("O=Peer", b"ping".to_vec())),
        )
        .expect("start flow");

    // Suspended waiting for the reply, checkpoint persisted.
    wait_until(TEST_TIMEOUT, || !node.storage.is_empty()).await;
    wait_until(TEST_TIMEOUT, || {
        !node.manager.flows_waiting_for(&Party::new("O=Peer")).is_empty()
    })
    .await;

    tokio::time::timeout(TEST_TIMEOUT, node.manager.stop(0))
        .await
        .expect("stop timeout")
        .expect("stop");

    assert_eq!(node.manager.live_flow_count(), 0);
    assert_eq!(node.storage.len(), 1);
}

#[tokio::test]
async fn restart_restores_suspended_flow_to_the_same_wait() {
    let storage = Arc::new(InMemoryCheckpointStorage::new());
    let node = test_node_with(StateMachineConfig::default(), Arc::clone(&storage)).await;

    node.manager
        .start_flow(
            start_options(true),
            Box::new(PingFlow::new("O=Peer", b"ping".to_vec())),
        )
        .expect("start flow");
    wait_until(TEST_TIMEOUT, || {
        !sent_initial_messages(&node.messaging).is_empty()
    })
    .await;
    let init = sent_initial_messages(&node.messaging).remove(0);
    tokio::time::timeout(TEST_TIMEOUT, node.manager.stop(0))
        .await
        .expect("stop timeout")
        .expect("stop");

    // A new node over the same storage resumes the flow at its receive.
    let restarted = test_node_with(StateMachineConfig::default(), storage).await;
    let mut changes = restarted.manager.subscribe_changes();
    wait_until(TEST_TIMEOUT, || restarted.manager.live_flow_count() == 1).await;

    restarted.manager.on_session_message(
        Party::new("O=Peer"),
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: init.initiator_session_id,
            payload: ExistingSessionPayload::Confirm {
                initiated_session_id: SessionId::from_raw(8000),
                initiated_flow_info: test_flow_info(),
            },
        }),
        CountingHandler::new(),
    );
    restarted.manager.on_session_message(
        Party::new("O=Peer"),
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: init.initiator_session_id,
            payload: ExistingSessionPayload::Data {
                payload: SerializedBytes::new(b"pong".to_vec()),
            },
        }),
        CountingHandler::new(),
    );

    wait_until(TEST_TIMEOUT, || restarted.storage.is_empty()).await;
    let mut saw_success = false;
    wait_until(TEST_TIMEOUT, || {
        while let Ok(change) = changes.try_recv() {
            if matches!(
                change,
                Change::Removed {
                    outcome: RemovalOutcome::Success(_),
                    ..
                }
            ) {
                saw_success = true;
            }
        }
        saw_success
    })
    .await;
}

#[tokio::test]
async fn paused_flow_buffers_messages_and_resumes() {
    let node = test_node().await;

    let handle = node
        .manager
        .start_flow(
            start_options(true),
            Box::new(PingFlow::new("O=Peer", b"ping".to_vec())),
        )
        .expect("start flow");
    wait_until(TEST_TIMEOUT, || {
        !sent_initial_messages(&node.messaging).is_empty()
    })
    .await;
    let init = sent_initial_messages(&node.messaging).remove(0);

    node.manager.pause_flow(handle.flow_id).expect("pause");
    wait_until(TEST_TIMEOUT, || node.manager.live_flow_count() == 0).await;

    // Messages arriving while paused are buffered, not lost.
    node.manager.on_session_message(
        Party::new("O=Peer"),
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: init.initiator_session_id,
            payload: ExistingSessionPayload::Confirm {
                initiated_session_id: SessionId::from_raw(9000),
                initiated_flow_info: test_flow_info(),
            },
        }),
        CountingHandler::new(),
    );
    node.manager.on_session_message(
        Party::new("O=Peer"),
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: init.initiator_session_id,
            payload: ExistingSessionPayload::Data {
                payload: SerializedBytes::new(b"pong".to_vec()),
            },
        }),
        CountingHandler::new(),
    );

    node.manager
        .resume_paused_flow(handle.flow_id)
        .await
        .expect("resume paused");

    let result = tokio::time::timeout(TEST_TIMEOUT, handle.result)
        .await
        .expect("result timeout")
        .expect("result channel")
        .expect("flow succeeded");
    assert_eq!(result, serde_json::json!({ "reply": b"pong".to_vec() }));
}

#[tokio::test]
async fn ledger_commit_wakes_waiting_flow() {
    let node = test_node().await;

    let handle = node
        .manager
        .start_flow(
            start_options(false),
            Box::new(CommitWaitFlow::new("tx-42")),
        )
        .expect("start flow");

    wait_until(TEST_TIMEOUT, || {
        node.manager
            .flow_snapshot(handle.flow_id)
            .map(|snapshot| snapshot.io_request.as_deref() == Some("wait_for_ledger_commit"))
            .unwrap_or(false)
    })
    .await;

    node.manager
        .notify_ledger_commit(&LedgerTransactionId::new("tx-42"));

    let result = tokio::time::timeout(TEST_TIMEOUT, handle.result)
        .await
        .expect("result timeout")
        .expect("result channel")
        .expect("flow succeeded");
    assert_eq!(result, serde_json::json!({ "committed": "tx-42" }));
}

#[tokio::test]
async fn async_operation_result_is_routed_back() {
    let node = test_node().await;

    let handle = node
        .manager
        .start_flow(
            start_options(false),
            Box::new(AsyncOpFlow::new(serde_json::json!({ "answer": 42 }))),
        )
        .expect("start flow");

    let result = tokio::time::timeout(TEST_TIMEOUT, handle.result)
        .await
        .expect("result timeout")
        .expect("result channel")
        .expect("flow succeeded");
    assert_eq!(result, serde_json::json!({ "answer": 42 }));
}

#[tokio::test]
async fn end_message_for_unknown_session_is_acknowledged() {
    let node = test_node().await;
    let handler = CountingHandler::new();

    node.manager.on_session_message(
        Party::new("O=Peer"),
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: SessionId::from_raw(123_456),
            payload: ExistingSessionPayload::End,
        }),
        handler.clone(),
    );

    wait_until(TEST_TIMEOUT, || handler.acknowledged_count() == 1).await;
    assert_eq!(node.manager.live_flow_count(), 0);
}

#[tokio::test]
async fn timed_flow_retries_after_timeout_and_still_completes() {
    let mut config = StateMachineConfig::default();
    config.flow_timeout.timeout = Duration::from_millis(1);
    config.flow_timeout.backoff_base = 1.0;

    let storage = Arc::new(InMemoryCheckpointStorage::new());
    let messaging = Arc::new(RecordingFlowMessaging::new());
    let hospital = Arc::new(ledgerflow::StaffedFlowHospital::new(
        Arc::new(ledgerflow::SystemClock),
        config.duplicate_discharge_limit,
    ));
    let mut records = hospital.subscribe();
    let manager = StateMachineManager::builder(Party::new("O=Us"))
        .config(config)
        .storage(Arc::clone(&storage) as Arc<dyn ledgerflow::CheckpointStorage>)
        .messaging(Arc::clone(&messaging) as Arc<dyn ledgerflow::FlowMessaging>)
        .hospital(Arc::clone(&hospital) as Arc<dyn ledgerflow::FlowHospital>)
        .hydrator(Arc::new(TestHydrator))
        .build();
    manager.start().await.expect("manager start");
    let node = TestNode {
        manager,
        storage,
        messaging,
    };

    let mut options = start_options(true);
    options.timed = true;
    let handle = node
        .manager
        .start_flow(options, Box::new(PingFlow::new("O=Peer", b"ping".to_vec())))
        .expect("start flow");
    wait_until(TEST_TIMEOUT, || {
        !sent_initial_messages(&node.messaging).is_empty()
    })
    .await;
    let init = sent_initial_messages(&node.messaging).remove(0);

    // The timeout fires (floored at one second) and the hospital discharges
    // the timed flow back to its last safe checkpoint.
    let record = tokio::time::timeout(TEST_TIMEOUT, records.recv())
        .await
        .expect("hospital record timeout")
        .expect("hospital record stream");
    assert_eq!(record.flow_id, handle.flow_id);
    assert_eq!(record.outcome, ledgerflow::Outcome::Discharge);
    assert!(record
        .errors
        .iter()
        .any(|error| matches!(error.kind, FlowErrorKind::FlowTimeout { .. })));

    // The retried flow still owns the same session and completes normally.
    node.manager.on_session_message(
        Party::new("O=Peer"),
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: init.initiator_session_id,
            payload: ExistingSessionPayload::Confirm {
                initiated_session_id: SessionId::from_raw(4000),
                initiated_flow_info: test_flow_info(),
            },
        }),
        CountingHandler::new(),
    );
    node.manager.on_session_message(
        Party::new("O=Peer"),
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: init.initiator_session_id,
            payload: ExistingSessionPayload::Data {
                payload: SerializedBytes::new(b"pong".to_vec()),
            },
        }),
        CountingHandler::new(),
    );

    let result = tokio::time::timeout(TEST_TIMEOUT, handle.result)
        .await
        .expect("result timeout")
        .expect("result channel")
        .expect("flow succeeded");
    assert_eq!(result, serde_json::json!({ "reply": b"pong".to_vec() }));
}
