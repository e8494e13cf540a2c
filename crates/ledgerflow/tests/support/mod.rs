//! Shared fixtures for the engine integration tests: scripted flow logics,
//! a tagged hydrator, a recording deduplication handler and wait helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use async_trait::async_trait;
use ledgerflow::{
    DeduplicationHandler, FlowAsyncOperation, FlowErrorKind, FlowInfo, FlowIoRequest, FlowLogic,
    FlowLogicHydrator, FlowYield, InitiatedFlowFactory, LedgerTransactionId, Party, ResumeValue,
    SerializedBytes, SessionId,
};

pub const PING_CLASS: &str = "test.Ping";

pub fn test_flow_info() -> FlowInfo {
    FlowInfo {
        flow_version: 1,
        app_name: "test-app".into(),
    }
}

/// Serialized form of every scripted logic, so one hydrator can restore
/// any of them from a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestLogic {
    Complete(CompleteImmediately),
    Ping(PingFlow),
    Responder(ResponderFlow),
    Sleeper(SleeperFlow),
    Failing(FailingFlow),
    CommitWait(CommitWaitFlow),
    AsyncOp(AsyncOpFlow),
}

impl TestLogic {
    pub fn into_logic(self) -> Box<dyn FlowLogic> {
        match self {
            TestLogic::Complete(logic) => Box::new(logic),
            TestLogic::Ping(logic) => Box::new(logic),
            TestLogic::Responder(logic) => Box::new(logic),
            TestLogic::Sleeper(logic) => Box::new(logic),
            TestLogic::Failing(logic) => Box::new(logic),
            TestLogic::CommitWait(logic) => Box::new(logic),
            TestLogic::AsyncOp(logic) => Box::new(logic),
        }
    }
}

/// Hydrator over the [`TestLogic`] tag.
pub struct TestHydrator;

impl FlowLogicHydrator for TestHydrator {
    fn hydrate(&self, frozen: &SerializedBytes) -> Result<Box<dyn FlowLogic>, String> {
        let tagged: TestLogic = frozen.to_value().map_err(|e| e.to_string())?;
        Ok(tagged.into_logic())
    }
}

fn snapshot_of(logic: &TestLogic) -> SerializedBytes {
    SerializedBytes::from_value(logic).expect("snapshot serialization")
}

/// Finishes on its first resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteImmediately {
    pub result: serde_json::Value,
}

impl FlowLogic for CompleteImmediately {
    fn resume(&mut self, _value: ResumeValue) -> FlowYield {
        FlowYield::Finish {
            result: self.result.clone(),
        }
    }

    fn snapshot(&self) -> SerializedBytes {
        snapshot_of(&TestLogic::Complete(self.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PingStage {
    Start,
    AwaitSession,
    AwaitSent,
    AwaitReply,
}

/// Initiator side of the test protocol: open a session, send a payload,
/// finish with the reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingFlow {
    pub destination: String,
    pub payload: Vec<u8>,
    pub stage: PingStage,
    pub session: Option<SessionId>,
}

impl PingFlow {
    pub fn new(destination: &str, payload: Vec<u8>) -> Self {
        Self {
            destination: destination.into(),
            payload,
            stage: PingStage::Start,
            session: None,
        }
    }
}

impl FlowLogic for PingFlow {
    fn resume(&mut self, value: ResumeValue) -> FlowYield {
        match self.stage {
            PingStage::Start => {
                self.stage = PingStage::AwaitSession;
                FlowYield::InitiateSession {
                    destination: Party::new(&self.destination),
                }
            }
            PingStage::AwaitSession => {
                let ResumeValue::Session(session_id) = value else {
                    return FlowYield::Errored(FlowErrorKind::Internal {
                        message: format!("expected session handle, got {value:?}"),
                    });
                };
                self.session = Some(session_id);
                self.stage = PingStage::AwaitSent;
                let mut session_to_message = indexmap::IndexMap::new();
                session_to_message.insert(session_id, SerializedBytes::new(self.payload.clone()));
                FlowYield::Suspend {
                    request: FlowIoRequest::Send { session_to_message },
                    may_skip_checkpoint: false,
                }
            }
            PingStage::AwaitSent => {
                self.stage = PingStage::AwaitReply;
                FlowYield::Suspend {
                    request: FlowIoRequest::Receive {
                        sessions: vec![self.session.expect("session set")],
                    },
                    may_skip_checkpoint: false,
                }
            }
            PingStage::AwaitReply => {
                let ResumeValue::Messages(messages) = value else {
                    return FlowYield::Errored(FlowErrorKind::Internal {
                        message: format!("expected messages, got {value:?}"),
                    });
                };
                let reply = messages
                    .first()
                    .map(|(_, payload)| payload.0.clone())
                    .unwrap_or_default();
                FlowYield::Finish {
                    result: serde_json::json!({ "reply": reply }),
                }
            }
        }
    }

    fn snapshot(&self) -> SerializedBytes {
        snapshot_of(&TestLogic::Ping(self.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResponderStage {
    Start,
    AwaitRequest,
    AwaitSent,
}

/// Responder side: receive one payload, answer with `reply`, finish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderFlow {
    pub session: SessionId,
    pub reply: Vec<u8>,
    pub stage: ResponderStage,
}

impl FlowLogic for ResponderFlow {
    fn resume(&mut self, value: ResumeValue) -> FlowYield {
        match self.stage {
            ResponderStage::Start => {
                self.stage = ResponderStage::AwaitRequest;
                FlowYield::Suspend {
                    request: FlowIoRequest::Receive {
                        sessions: vec![self.session],
                    },
                    may_skip_checkpoint: false,
                }
            }
            ResponderStage::AwaitRequest => {
                let ResumeValue::Messages(_) = value else {
                    return FlowYield::Errored(FlowErrorKind::Internal {
                        message: format!("expected messages, got {value:?}"),
                    });
                };
                self.stage = ResponderStage::AwaitSent;
                let mut session_to_message = indexmap::IndexMap::new();
                session_to_message.insert(self.session, SerializedBytes::new(self.reply.clone()));
                FlowYield::Suspend {
                    request: FlowIoRequest::Send { session_to_message },
                    may_skip_checkpoint: false,
                }
            }
            ResponderStage::AwaitSent => FlowYield::Finish {
                result: serde_json::json!("answered"),
            },
        }
    }

    fn snapshot(&self) -> SerializedBytes {
        snapshot_of(&TestLogic::Responder(self.clone()))
    }
}

/// Factory for [`ResponderFlow`], registered under [`PING_CLASS`].
pub struct ResponderFactory {
    pub reply: Vec<u8>,
}

impl InitiatedFlowFactory for ResponderFactory {
    fn create(
        &self,
        session_id: SessionId,
        _peer: &Party,
        _first_payload: Option<&SerializedBytes>,
    ) -> Result<Box<dyn FlowLogic>, String> {
        Ok(Box::new(ResponderFlow {
            session: session_id,
            reply: self.reply.clone(),
            stage: ResponderStage::Start,
        }))
    }

    fn flow_info(&self) -> FlowInfo {
        test_flow_info()
    }
}

/// Factory that always fails to build its flow.
pub struct BrokenFactory;

impl InitiatedFlowFactory for BrokenFactory {
    fn create(
        &self,
        _session_id: SessionId,
        _peer: &Party,
        _first_payload: Option<&SerializedBytes>,
    ) -> Result<Box<dyn FlowLogic>, String> {
        Err("responder construction failed".into())
    }

    fn flow_info(&self) -> FlowInfo {
        test_flow_info()
    }
}

/// Sleeps once, then finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleeperFlow {
    pub sleep_ms: u64,
    pub slept: bool,
}

impl SleeperFlow {
    pub fn new(sleep_ms: u64) -> Self {
        Self {
            sleep_ms,
            slept: false,
        }
    }
}

impl FlowLogic for SleeperFlow {
    fn resume(&mut self, _value: ResumeValue) -> FlowYield {
        if self.slept {
            FlowYield::Finish {
                result: serde_json::json!("rested"),
            }
        } else {
            self.slept = true;
            FlowYield::Suspend {
                request: FlowIoRequest::Sleep {
                    wake_up_after: time::OffsetDateTime::now_utc()
                        + time::Duration::milliseconds(self.sleep_ms as i64),
                },
                may_skip_checkpoint: false,
            }
        }
    }

    fn snapshot(&self) -> SerializedBytes {
        snapshot_of(&TestLogic::Sleeper(self.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FailingStage {
    Start,
    AfterCheckpoint,
}

/// Checkpoints once, then fails with the configured error on every
/// subsequent resume, including resumes after a retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailingFlow {
    pub kind: FlowErrorKind,
    pub stage: FailingStage,
}

impl FailingFlow {
    pub fn new(kind: FlowErrorKind) -> Self {
        Self {
            kind,
            stage: FailingStage::Start,
        }
    }
}

impl FlowLogic for FailingFlow {
    fn resume(&mut self, _value: ResumeValue) -> FlowYield {
        match self.stage {
            FailingStage::Start => {
                self.stage = FailingStage::AfterCheckpoint;
                FlowYield::Suspend {
                    request: FlowIoRequest::ForceCheckpoint,
                    may_skip_checkpoint: false,
                }
            }
            FailingStage::AfterCheckpoint => FlowYield::Errored(self.kind.clone()),
        }
    }

    fn snapshot(&self) -> SerializedBytes {
        snapshot_of(&TestLogic::Failing(self.clone()))
    }
}

/// Waits for one ledger transaction to commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitWaitFlow {
    pub transaction_id: String,
    pub waited: bool,
}

impl CommitWaitFlow {
    pub fn new(transaction_id: &str) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            waited: false,
        }
    }
}

impl FlowLogic for CommitWaitFlow {
    fn resume(&mut self, value: ResumeValue) -> FlowYield {
        if self.waited {
            let ResumeValue::LedgerTransaction(id) = value else {
                return FlowYield::Errored(FlowErrorKind::Internal {
                    message: format!("expected committed transaction, got {value:?}"),
                });
            };
            FlowYield::Finish {
                result: serde_json::json!({ "committed": id.as_str() }),
            }
        } else {
            self.waited = true;
            FlowYield::Suspend {
                request: FlowIoRequest::WaitForLedgerCommit {
                    transaction_id: LedgerTransactionId::new(&self.transaction_id),
                },
                may_skip_checkpoint: false,
            }
        }
    }

    fn snapshot(&self) -> SerializedBytes {
        snapshot_of(&TestLogic::CommitWait(self.clone()))
    }
}

/// Runs one asynchronous operation and finishes with its result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncOpFlow {
    pub value: serde_json::Value,
    pub started: bool,
}

impl AsyncOpFlow {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            started: false,
        }
    }
}

struct EchoOperation {
    value: serde_json::Value,
}

#[async_trait]
impl FlowAsyncOperation for EchoOperation {
    async fn execute(&self, _dedup_id: &str) -> Result<serde_json::Value, FlowErrorKind> {
        Ok(self.value.clone())
    }
}

impl FlowLogic for AsyncOpFlow {
    fn resume(&mut self, value: ResumeValue) -> FlowYield {
        if self.started {
            let ResumeValue::AsyncResult(result) = value else {
                return FlowYield::Errored(FlowErrorKind::Internal {
                    message: format!("expected async result, got {value:?}"),
                });
            };
            FlowYield::Finish { result }
        } else {
            self.started = true;
            FlowYield::Suspend {
                request: FlowIoRequest::ExecuteAsyncOperation {
                    description: "echo".into(),
                },
                may_skip_checkpoint: false,
            }
        }
    }

    fn snapshot(&self) -> SerializedBytes {
        snapshot_of(&TestLogic::AsyncOp(self.clone()))
    }

    fn async_operation(&self) -> Option<Arc<dyn FlowAsyncOperation>> {
        Some(Arc::new(EchoOperation {
            value: self.value.clone(),
        }))
    }
}

/// Deduplication handler counting its hook invocations.
#[derive(Default)]
pub struct CountingHandler {
    pub persisted: AtomicUsize,
    pub acknowledged: AtomicUsize,
    pub flow_start: bool,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn flow_start() -> Arc<Self> {
        Arc::new(Self {
            flow_start: true,
            ..Self::default()
        })
    }

    pub fn acknowledged_count(&self) -> usize {
        self.acknowledged.load(Ordering::SeqCst)
    }
}

impl DeduplicationHandler for CountingHandler {
    fn inside_database_transaction(&self) -> ledgerflow::Result<()> {
        self.persisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn after_database_transaction(&self) -> ledgerflow::Result<()> {
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_flow_start(&self) -> bool {
        self.flow_start
    }
}

/// Poll until `condition` holds or the timeout elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
