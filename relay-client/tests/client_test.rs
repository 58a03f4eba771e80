//! RelayClient integration tests against a scripted in-memory substrate.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use relay_client::{
    CacheReader, ClientConfig, ConfigHandle, MutateOutcome, OutgoingMessage, Payload,
    PendingWrite, ProcessResult, RelayClient, RelayError, RemoteCallRequest, RequestData,
    ResultMessage, Signer, SpawnMessage, SpawnRequest, Substrate, SubstrateError, Tag, TagMap,
};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct TestSigner;

#[async_trait]
impl Signer for TestSigner {
    fn address(&self) -> String {
        "test-owner".to_string()
    }

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SubstrateError> {
        Ok(payload.iter().rev().copied().collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Submit(OutgoingMessage),
    Fetch(String),
    Evaluate { owner: String, compute_url: String },
    Spawn(SpawnMessage),
}

#[derive(Default)]
struct ScriptedSubstrate {
    submits: Mutex<VecDeque<Result<String, SubstrateError>>>,
    fetches: Mutex<VecDeque<Result<ProcessResult, SubstrateError>>>,
    evaluations: Mutex<VecDeque<Result<ProcessResult, SubstrateError>>>,
    spawns: Mutex<VecDeque<Result<String, SubstrateError>>>,
    calls: Mutex<Vec<Call>>,
    latency: Option<Duration>,
}

fn unreachable_error() -> SubstrateError {
    SubstrateError::Transport("scripted".to_string(), "connection refused".to_string())
}

impl ScriptedSubstrate {
    fn slow(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    fn on_submit(self, reply: Result<String, SubstrateError>) -> Self {
        self.submits.lock().unwrap().push_back(reply);
        self
    }

    fn on_fetch(self, reply: Result<ProcessResult, SubstrateError>) -> Self {
        self.fetches.lock().unwrap().push_back(reply);
        self
    }

    fn on_evaluate(self, reply: Result<ProcessResult, SubstrateError>) -> Self {
        self.evaluations.lock().unwrap().push_back(reply);
        self
    }

    fn on_spawn(self, reply: Result<String, SubstrateError>) -> Self {
        self.spawns.lock().unwrap().push_back(reply);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn next<T>(queue: &Mutex<VecDeque<Result<T, SubstrateError>>>) -> Result<T, SubstrateError> {
    queue
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(unreachable_error()))
}

#[async_trait]
impl Substrate for ScriptedSubstrate {
    async fn submit(
        &self,
        _config: &ClientConfig,
        message: &OutgoingMessage,
        _signer: &dyn Signer,
    ) -> Result<String, SubstrateError> {
        self.calls.lock().unwrap().push(Call::Submit(message.clone()));
        self.pause().await;
        next(&self.submits)
    }

    async fn fetch_result(
        &self,
        _config: &ClientConfig,
        _process_id: &str,
        message_id: &str,
    ) -> Result<ProcessResult, SubstrateError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Fetch(message_id.to_string()));
        self.pause().await;
        next(&self.fetches)
    }

    async fn evaluate(
        &self,
        config: &ClientConfig,
        _message: &OutgoingMessage,
        owner: &str,
    ) -> Result<ProcessResult, SubstrateError> {
        self.calls.lock().unwrap().push(Call::Evaluate {
            owner: owner.to_string(),
            compute_url: config.compute_url.clone(),
        });
        self.pause().await;
        next(&self.evaluations)
    }

    async fn spawn_process(
        &self,
        _config: &ClientConfig,
        spawn: &SpawnMessage,
        _signer: &dyn Signer,
    ) -> Result<String, SubstrateError> {
        self.calls.lock().unwrap().push(Call::Spawn(spawn.clone()));
        self.pause().await;
        next(&self.spawns)
    }
}

fn client_with(substrate: &Arc<ScriptedSubstrate>, config: ClientConfig) -> RelayClient {
    RelayClient::new(
        ConfigHandle::new(config),
        substrate.clone(),
        CacheReader::new().unwrap(),
    )
}

fn reply(tags: &[(&str, &str)], data: Option<&str>) -> ResultMessage {
    let message = ResultMessage::with_tags(tags.iter().map(|(n, v)| Tag::new(*n, *v)).collect());
    match data {
        Some(data) => message.with_data(data),
        None => message,
    }
}

fn signed(process_id: &str) -> RemoteCallRequest {
    RemoteCallRequest::new(process_id).signer(Arc::new(TestSigner))
}

// ============================================================================
// Query
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_query_decodes_single_reply() {
    let substrate = Arc::new(ScriptedSubstrate::default().on_evaluate(Ok(
        ProcessResult::from_messages(vec![reply(
            &[("Action", "Get-Role-Response"), ("Status", "200")],
            Some(r#"{"role":"admin"}"#),
        )]),
    )));
    let client = client_with(&substrate, ClientConfig::default());

    let response = client
        .query(RemoteCallRequest::new("proc-1").action("Get-Role").tag("Id", "7"))
        .await
        .unwrap();

    assert_eq!(response.id, None);
    assert_eq!(response.tags.action(), Some("Get-Role-Response"));
    assert_eq!(response.tags.payload(), Some(r#"{"role":"admin"}"#));
    assert_eq!(response.data, Some(Payload::Structured(json!({"role": "admin"}))));
    assert_eq!(
        substrate.calls(),
        vec![Call::Evaluate {
            owner: "anonymous".to_string(),
            compute_url: ClientConfig::default().compute_url,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_query_owner_override() {
    let substrate = Arc::new(
        ScriptedSubstrate::default()
            .on_evaluate(Ok(ProcessResult::from_messages(vec![reply(&[], Some("plain"))]))),
    );
    let client = client_with(&substrate, ClientConfig::default());

    let response = client
        .query(RemoteCallRequest::new("proc-1").action("Info").owner("wallet-9"))
        .await
        .unwrap();

    assert_eq!(response.data, Some(Payload::Text("plain".to_string())));
    assert!(matches!(
        &substrate.calls()[0],
        Call::Evaluate { owner, .. } if owner == "wallet-9"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_query_non_ok_status_is_remote_status_error() {
    let substrate = Arc::new(ScriptedSubstrate::default().on_evaluate(Ok(
        ProcessResult::from_messages(vec![reply(&[("Status", "500")], Some("boom"))]),
    )));
    let client = client_with(&substrate, ClientConfig::default());

    let err = client
        .query(RemoteCallRequest::new("proc-1").action("Get-Role"))
        .await
        .unwrap_err();

    match &err {
        RelayError::RemoteStatus { code, body, context } => {
            assert_eq!(code, "500");
            assert_eq!(body, "boom");
            assert_eq!(context.process_id, "proc-1");
            assert_eq!(context.action.as_deref(), Some("Get-Role"));
            assert!(context.raw_response.is_some());
        }
        other => panic!("expected status error, got {other:?}"),
    }
    assert_eq!(err.code(), "REMOTE_STATUS_ERROR");
}

#[tokio::test(start_paused = true)]
async fn test_query_ambiguous_read() {
    let substrate = Arc::new(ScriptedSubstrate::default().on_evaluate(Ok(
        ProcessResult::from_messages(vec![reply(&[("Action", "A")], None), reply(&[], None)]),
    )));
    let client = client_with(&substrate, ClientConfig::default());

    let err = client
        .query(RemoteCallRequest::new("proc-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::AmbiguousReadResult { count: 2, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_query_empty_and_execution_error() {
    let substrate = Arc::new(
        ScriptedSubstrate::default()
            .on_evaluate(Ok(ProcessResult::default()))
            .on_evaluate(Ok(ProcessResult {
                error: Some(json!("out of gas")),
                ..ProcessResult::default()
            })),
    );
    let client = client_with(&substrate, ClientConfig::default());

    let empty = client.query(RemoteCallRequest::new("p")).await.unwrap_err();
    assert!(matches!(empty, RelayError::NoMessagesReturned { .. }));

    let failed = client.query(RemoteCallRequest::new("p")).await.unwrap_err();
    match failed {
        RelayError::RemoteExecution { error, .. } => assert_eq!(error, "out of gas"),
        other => panic!("expected execution error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_query_recovers_after_transient_failure() {
    let substrate = Arc::new(
        ScriptedSubstrate::default()
            .on_evaluate(Err(unreachable_error()))
            .on_evaluate(Ok(ProcessResult::from_messages(vec![reply(
                &[("Status", "200")],
                None,
            )]))),
    );
    let client = client_with(&substrate, ClientConfig::default());

    let response = client.query(RemoteCallRequest::new("p")).await.unwrap();
    assert_eq!(response.tags.status(), Some("200"));
    assert_eq!(substrate.count(|c| matches!(c, Call::Evaluate { .. })), 2);
}

#[tokio::test(start_paused = true)]
async fn test_query_exhaustion_waits_full_backoff() {
    let substrate = Arc::new(ScriptedSubstrate::default());
    let client = client_with(&substrate, ClientConfig::default());

    let started = Instant::now();
    let err = client.query(RemoteCallRequest::new("p")).await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(matches!(err, RelayError::EvaluateFailed { attempts: 3, .. }));
    assert_eq!(substrate.count(|c| matches!(c, Call::Evaluate { .. })), 3);
}

#[tokio::test(start_paused = true)]
async fn test_error_context_carries_request_payload_and_budget() {
    let substrate = Arc::new(ScriptedSubstrate::default());
    let client = client_with(&substrate, ClientConfig::default());

    let err = client
        .query(
            RemoteCallRequest::new("proc-1")
                .action("Balance")
                .data(r#"{"account":"a-1"}"#)
                .retries(2),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::EvaluateFailed { attempts: 2, .. }));
    let context = err.context().unwrap();
    assert_eq!(context.data.as_deref(), Some(r#"{"account":"a-1"}"#));
    assert_eq!(context.retries, 2);
    assert_eq!(err.to_json()["context"]["retries"], 2);
}

#[tokio::test(start_paused = true)]
async fn test_query_rejects_invalid_tag_name_without_calling() {
    let substrate = Arc::new(ScriptedSubstrate::default());
    let client = client_with(&substrate, ClientConfig::default());

    let err = client
        .query(RemoteCallRequest::new("p").tag("bad name", "x"))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::InvalidRequest { .. }));
    assert!(substrate.calls().is_empty());
}

// ============================================================================
// Mutate
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_mutate_without_signer_never_submits() {
    let substrate = Arc::new(ScriptedSubstrate::default().on_submit(Ok("msg-1".to_string())));
    let client = client_with(&substrate, ClientConfig::default());

    let err = client
        .mutate(RemoteCallRequest::new("proc-1").action("Create-Role"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "NO_SIGNER");
    assert!(substrate.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_mutate_picks_response_among_notifications() {
    let substrate = Arc::new(
        ScriptedSubstrate::default()
            .on_submit(Ok("msg-1".to_string()))
            .on_fetch(Ok(ProcessResult::from_messages(vec![
                reply(&[("Action", "Notify")], Some("role created")),
                reply(
                    &[("Action", "Create-Role-Response"), ("Status", "200")],
                    Some(r#"{"id":"role-42"}"#),
                ),
            ]))),
    );
    let client = client_with(&substrate, ClientConfig::default());

    let outcome = client
        .mutate(
            signed("proc-1")
                .action("Create-Role")
                .tag("Name", "Admin")
                .data(r#"{"permissions":["ban"]}"#),
        )
        .await
        .unwrap();

    let response = outcome.response().unwrap();
    assert_eq!(outcome.message_id(), "msg-1");
    assert_eq!(response.id.as_deref(), Some("msg-1"));
    assert_eq!(response.tags.action(), Some("Create-Role-Response"));
    assert_eq!(response.data, Some(Payload::Structured(json!({"id": "role-42"}))));

    let calls = substrate.calls();
    assert_eq!(calls.len(), 2);
    match &calls[0] {
        Call::Submit(message) => {
            assert_eq!(message.process_id, "proc-1");
            assert_eq!(
                message.tags,
                vec![Tag::new("Name", "Admin"), Tag::new("Action", "Create-Role")]
            );
            assert_eq!(
                message.data,
                Some(RequestData::from(r#"{"permissions":["ban"]}"#))
            );
        }
        other => panic!("expected submit first, got {other:?}"),
    }
    assert_eq!(calls[1], Call::Fetch("msg-1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_mutate_unobserved_result_is_partial_success() {
    let substrate = Arc::new(ScriptedSubstrate::default().on_submit(Ok("msg-7".to_string())));
    let client = client_with(&substrate, ClientConfig::default());

    let outcome = client
        .mutate(signed("proc-1").action("Transfer"))
        .await
        .unwrap();

    match &outcome {
        MutateOutcome::Submitted(pending) => {
            assert_eq!(pending.message_id, "msg-7");
            assert_eq!(pending.process_id, "proc-1");
        }
        other => panic!("expected submitted outcome, got {other:?}"),
    }
    assert!(!outcome.is_confirmed());
    assert_eq!(substrate.count(|c| matches!(c, Call::Fetch(_))), 3);

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["outcome"], "submitted");
    assert_eq!(json["message_id"], "msg-7");
}

#[tokio::test(start_paused = true)]
async fn test_mutate_submit_exhaustion_skips_fetch() {
    let substrate = Arc::new(ScriptedSubstrate::default());
    let client = client_with(&substrate, ClientConfig::default());

    let err = client
        .mutate(signed("proc-1").action("Transfer").retries(2))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::SubmitFailed { attempts: 2, .. }));
    assert_eq!(substrate.count(|c| matches!(c, Call::Submit(_))), 2);
    assert_eq!(substrate.count(|c| matches!(c, Call::Fetch(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_mutate_status_error_keeps_message_id() {
    let substrate = Arc::new(
        ScriptedSubstrate::default()
            .on_submit(Ok("msg-9".to_string()))
            .on_fetch(Ok(ProcessResult::from_messages(vec![reply(
                &[("Action", "Create-Role-Response"), ("Status", "403")],
                Some("forbidden"),
            )]))),
    );
    let config = ClientConfig::default().with_signer(Arc::new(TestSigner));
    let client = client_with(&substrate, config);

    let err = client
        .mutate(RemoteCallRequest::new("proc-1").action("Create-Role"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "REMOTE_STATUS_ERROR");
    let context = err.context().unwrap();
    assert_eq!(context.message_id.as_deref(), Some("msg-9"));
    assert_eq!(err.to_json()["context"]["message_id"], "msg-9");
}

#[tokio::test(start_paused = true)]
async fn test_mutate_binary_data_passes_through() {
    let substrate = Arc::new(
        ScriptedSubstrate::default()
            .on_submit(Ok("msg-b".to_string()))
            .on_fetch(Ok(ProcessResult::from_messages(vec![reply(&[], None)]))),
    );
    let client = client_with(&substrate, ClientConfig::default());

    let outcome = client
        .mutate(signed("p").action("Upload").data(Bytes::from_static(&[0, 159, 255])))
        .await
        .unwrap();

    assert!(outcome.is_confirmed());
    match &substrate.calls()[0] {
        Call::Submit(message) => assert_eq!(
            message.data.as_ref().map(RequestData::as_bytes),
            Some(&[0u8, 159, 255][..])
        ),
        other => panic!("expected submit, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_completes_pending_write() {
    let substrate = Arc::new(ScriptedSubstrate::default().on_fetch(Ok(
        ProcessResult::from_messages(vec![reply(&[("Status", "200")], Some("done"))]),
    )));
    let client = client_with(&substrate, ClientConfig::default());
    let pending = PendingWrite {
        message_id: "msg-3".to_string(),
        process_id: "proc-1".to_string(),
        submitted_at: chrono::Utc::now(),
    };

    let outcome = client
        .reconcile(&pending, 1, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.message_id(), "msg-3");
    assert_eq!(
        outcome.response().unwrap().data,
        Some(Payload::Text("done".to_string()))
    );
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_query_cancel_aborts_in_flight_attempt() {
    let substrate = Arc::new(ScriptedSubstrate::slow(Duration::from_secs(10)));
    let client = client_with(&substrate, ClientConfig::default());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = client
        .query(RemoteCallRequest::new("p").cancel_on(cancel))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(substrate.count(|c| matches!(c, Call::Evaluate { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mutate_cancel_during_fetch_reports_message_id() {
    let substrate = Arc::new(ScriptedSubstrate::default().on_submit(Ok("msg-c".to_string())));
    let client = client_with(&substrate, ClientConfig::default());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        // First fetch fails at once; cancel lands inside the 1s backoff.
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let err = client
        .mutate(signed("p").action("Transfer").cancel_on(cancel))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(
        err.context().and_then(|c| c.message_id.as_deref()),
        Some("msg-c")
    );
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconfiguration_does_not_affect_in_flight_call() {
    let substrate = Arc::new(
        ScriptedSubstrate::default()
            .on_evaluate(Err(unreachable_error()))
            .on_evaluate(Ok(ProcessResult::from_messages(vec![reply(&[], None)])))
            .on_evaluate(Ok(ProcessResult::from_messages(vec![reply(&[], None)]))),
    );
    let config = ClientConfig {
        compute_url: "http://cu-old".to_string(),
        ..ClientConfig::default()
    };
    let client = client_with(&substrate, config);

    let handle = client.config().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.update(|config| config.compute_url = "http://cu-new".to_string());
    });

    client.query(RemoteCallRequest::new("p")).await.unwrap();
    client.query(RemoteCallRequest::new("p")).await.unwrap();

    let urls: Vec<String> = substrate
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Evaluate { compute_url, .. } => Some(compute_url),
            _ => None,
        })
        .collect();
    assert_eq!(urls, vec!["http://cu-old", "http://cu-old", "http://cu-new"]);
}

// ============================================================================
// Spawn
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_spawn_requires_scheduler_and_module() {
    let substrate = Arc::new(ScriptedSubstrate::default());
    let client = client_with(&substrate, ClientConfig::default());

    let err = client
        .spawn(SpawnRequest {
            signer: Some(Arc::new(TestSigner)),
            module: Some("mod-1".to_string()),
            ..SpawnRequest::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::InvalidRequest { .. }));
    assert!(substrate.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_spawn_errors_name_module_and_scheduler() {
    let substrate = Arc::new(ScriptedSubstrate::default());
    let config = ClientConfig {
        scheduler: Some("sched-1".to_string()),
        module: Some("mod-1".to_string()),
        ..ClientConfig::default()
    };
    let client = client_with(&substrate, config);

    let no_signer = client.spawn(SpawnRequest::default()).await.unwrap_err();
    assert_eq!(no_signer.code(), "NO_SIGNER");
    assert!(no_signer
        .to_string()
        .ends_with("spawn of module mod-1 on scheduler sched-1"));

    let failed = client
        .spawn(SpawnRequest {
            signer: Some(Arc::new(TestSigner)),
            retries: Some(1),
            ..SpawnRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(failed, RelayError::SpawnFailed { attempts: 1, .. }));
    assert!(failed
        .to_string()
        .starts_with("spawn of module mod-1 on scheduler sched-1 failed after 1 attempt(s)"));
    let context = failed.context().unwrap();
    assert_eq!(context.scheduler.as_deref(), Some("sched-1"));
    assert_eq!(context.module.as_deref(), Some("mod-1"));
}

#[tokio::test(start_paused = true)]
async fn test_spawn_uses_configured_defaults() {
    let substrate = Arc::new(ScriptedSubstrate::default().on_spawn(Ok("proc-new".to_string())));
    let config = ClientConfig {
        scheduler: Some("sched-1".to_string()),
        module: Some("mod-1".to_string()),
        ..ClientConfig::default()
    }
    .with_signer(Arc::new(TestSigner));
    let client = client_with(&substrate, config);

    let process_id = client
        .spawn(SpawnRequest {
            tags: TagMap::new().with("Name", "registry"),
            ..SpawnRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(process_id, "proc-new");
    assert_eq!(
        substrate.calls(),
        vec![Call::Spawn(SpawnMessage {
            scheduler: "sched-1".to_string(),
            module: "mod-1".to_string(),
            tags: vec![Tag::new("Name", "registry")],
            data: None,
        })]
    );
}
