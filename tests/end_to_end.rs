use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use txn_core::config::{AppConfig, ElectionConfig, SagaConfig};
use txn_core::coordination::{CoordinationStore, MemoryCoordinationStore};
use txn_core::error::{CoreError, Result};
use txn_core::idempotency::{ClaimRequest, IdempotentOutcome, derive_key, request_hash};
use txn_core::locking::MemoryEntityStore;
use txn_core::runtime::CoreServices;
use txn_core::saga::{SagaContext, SagaStatus, SagaStep, StepHandler, StepStatus};
use txn_core::state_machine::TransitionOptions;

/// Helper: config tuned for fast tests
fn fast_config(instance: &str) -> AppConfig {
    AppConfig {
        instance_id: Some(instance.to_string()),
        saga: SagaConfig {
            step_timeout_secs: 2,
            default_max_retries: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            ..SagaConfig::default()
        },
        election: ElectionConfig {
            service_name: "e2e".to_string(),
            heartbeat_interval_ms: 20,
            leader_ttl_ms: 400,
            election_timeout_ms: 120,
            election_window_ms: 10,
            check_interval_ms: 20,
        },
        ..AppConfig::default()
    }
}

/// Helper: one instance on a shared coordination store
fn instance(store: &Arc<MemoryCoordinationStore>, id: &str) -> CoreServices {
    CoreServices::with_stores(
        fast_config(id),
        store.clone(),
        Arc::new(MemoryEntityStore::new()),
        None,
    )
    .unwrap()
}

#[tokio::test]
async fn e2e_escrow_lifecycle_versions() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let core = instance(&store, "node-1");
    let engine = &core.engine;

    engine
        .create_entity(
            "escrow",
            "esc-1",
            "CREATED",
            json!({"amount": "250.00", "currency": "USDT", "seller_id": "seller-9"}),
        )
        .await
        .unwrap();

    // No shortcut past PAYMENT_PENDING
    for target in ["PAYMENT_CONFIRMED", "ACTIVE", "COMPLETED"] {
        let r = engine
            .transition("escrow", "esc-1", target, "skip_ahead", TransitionOptions::by("buyer"))
            .await;
        assert_eq!(r.error_code(), Some("INVALID_TRANSITION"), "CREATED -> {}", target);
    }

    let path = [
        ("PAYMENT_PENDING", "await_payment"),
        ("PAYMENT_CONFIRMED", "confirm_payment"),
        ("ACTIVE", "activate"),
        ("COMPLETED", "release"),
    ];
    for (i, (target, name)) in path.iter().enumerate() {
        let r = engine
            .transition(
                "escrow",
                "esc-1",
                target,
                name,
                TransitionOptions::by("system")
                    .with_amount(Decimal::new(25_000, 2), "USDT")
                    .expect_version(i as i64 + 1),
            )
            .await;
        assert!(r.success, "{} failed: {:?}", target, r.error);
        assert_eq!(r.version_after, Some(i as i64 + 2));
    }

    let escrow = engine.get_entity("escrow", "esc-1").await.unwrap().unwrap();
    assert_eq!(escrow.state, "COMPLETED");
    assert_eq!(escrow.version, 5);

    // Terminal: nothing further without an admin edge
    let r = engine
        .transition("escrow", "esc-1", "DISPUTED", "dispute", TransitionOptions::by("buyer"))
        .await;
    assert_eq!(r.error_code(), Some("TERMINAL_STATE_VIOLATION"));

    let metrics = core.ops.lock_metrics();
    assert_eq!(metrics.commits, 4);
    assert_eq!(metrics.currently_held, 0);
}

#[tokio::test]
async fn e2e_concurrent_same_version_transitions() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let core = Arc::new(instance(&store, "node-1"));
    core.engine
        .create_entity("escrow", "esc-2", "CREATED", json!({}))
        .await
        .unwrap();

    let mut handles = vec![];
    for caller in ["worker-a", "worker-b"] {
        let core = core.clone();
        handles.push(tokio::spawn(async move {
            core.engine
                .transition(
                    "escrow",
                    "esc-2",
                    "PAYMENT_PENDING",
                    "await_payment",
                    TransitionOptions::by(caller).expect_version(1),
                )
                .await
        }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for h in handles {
        let r = h.await.unwrap();
        if r.success {
            successes += 1;
        } else if r.error_code() == Some("VERSION_CONFLICT") {
            conflicts += 1;
        }
    }
    assert_eq!((successes, conflicts), (1, 1));

    let escrow = core.engine.get_entity("escrow", "esc-2").await.unwrap().unwrap();
    assert_eq!(escrow.version, 2);
    assert_eq!(core.ops.lock_metrics().version_conflicts, 1);
}

#[derive(Default)]
struct Rail {
    executed: AtomicU32,
    compensated: AtomicU32,
    always_fail: bool,
}

#[async_trait]
impl StepHandler for Rail {
    async fn execute(&self, params: &Value, _context: &SagaContext) -> Result<Value> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        if self.always_fail {
            return Err(CoreError::StepExecutionFailed {
                step_id: "payout".into(),
                reason: "bank rejected transfer".into(),
            });
        }
        Ok(json!({"ref": format!("tx-{}", params["cashout_id"].as_str().unwrap_or("?"))}))
    }

    async fn compensate(
        &self,
        _params: &Value,
        _context: &SagaContext,
        _original: Option<&Value>,
    ) -> Result<()> {
        self.compensated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn e2e_cashout_saga_compensates_on_payout_failure() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let core = instance(&store, "node-1");

    let reserve = Arc::new(Rail::default());
    let payout = Arc::new(Rail {
        always_fail: true,
        ..Rail::default()
    });
    let notify = Arc::new(Rail::default());
    core.sagas.register_handler("reserve_funds", reserve.clone());
    core.sagas.register_handler("bank_payout", payout.clone());
    core.sagas.register_handler("notify_user", notify.clone());

    let params = json!({"cashout_id": "co-7", "amount": "40.00", "currency": "NGN"});
    let steps = vec![
        SagaStep::new("reserve", "reserve_funds")
            .compensated_by("reserve_funds")
            .with_params(params.clone()),
        SagaStep::new("payout", "bank_payout")
            .compensated_by("bank_payout")
            .with_params(params.clone()),
        SagaStep::new("notify", "notify_user").with_params(params),
    ];

    let saga_id = core
        .sagas
        .start_saga("cashout", steps, SagaContext::new(), Some(Duration::from_secs(30)))
        .await
        .unwrap();
    let saga = core.sagas.wait(&saga_id, Duration::from_secs(10)).await.unwrap();

    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(reserve.executed.load(Ordering::SeqCst), 1);
    assert_eq!(reserve.compensated.load(Ordering::SeqCst), 1);
    assert_eq!(payout.executed.load(Ordering::SeqCst), 3);
    assert_eq!(payout.compensated.load(Ordering::SeqCst), 0);
    assert_eq!(notify.executed.load(Ordering::SeqCst), 0);
    assert_eq!(saga.step("notify").unwrap().status, StepStatus::Skipped);
    assert!(!saga.requires_reconciliation);

    let via_ops = core.ops.saga_status(&saga_id).await.unwrap();
    assert_eq!(via_ops.status, SagaStatus::Compensated);
}

#[tokio::test]
async fn e2e_fail_closed_when_coordination_down() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let core = instance(&store, "node-1");

    let payload = json!({"user": "u1", "amount": "15.00", "currency": "USD"});
    let key = derive_key("cashout", "u1", &payload, None);
    let before = store.write_count();
    store.set_available(false);

    let ran = AtomicU32::new(0);
    let err = core
        .idempotency
        .run_idempotent(ClaimRequest::new(&key, "cashout", request_hash(&payload)), || async {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"paid": true}))
        })
        .await
        .err()
        .unwrap();

    assert_eq!(err.code(), "COORDINATION_UNSAFE");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(store.write_count(), before);

    // Once the store is back the same request goes through exactly once
    store.set_available(true);
    for expect_cached in [false, true] {
        let out = core
            .idempotency
            .run_idempotent(ClaimRequest::new(&key, "cashout", request_hash(&payload)), || async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"paid": true}))
            })
            .await
            .unwrap();
        assert_eq!(matches!(out, IdempotentOutcome::Cached(_)), expect_cached);
    }
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn e2e_single_leader_and_failover() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let nodes: Vec<CoreServices> = (0..3)
        .map(|i| instance(&store, &format!("node-{}", i)))
        .collect();
    for n in &nodes {
        n.start().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let leaders: Vec<&CoreServices> = nodes.iter().filter(|n| n.election.is_leader()).collect();
    assert_eq!(leaders.len(), 1);
    let leader_id = leaders[0].instance_id.clone();
    for n in &nodes {
        let info = n.ops.leader_info().await.unwrap().unwrap();
        assert_eq!(info.instance_id, leader_id);
    }
    let first_term = store
        .get("leader_election:e2e:leader")
        .await
        .unwrap()
        .map(|raw| serde_json::from_str::<Value>(&raw).unwrap()["term"].as_u64().unwrap())
        .unwrap();

    // Leader leaves; a follower takes over with a higher term
    let old = nodes.iter().find(|n| n.instance_id == leader_id).unwrap();
    old.stop().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let survivors: Vec<&CoreServices> = nodes
        .iter()
        .filter(|n| n.instance_id != leader_id && n.election.is_leader())
        .collect();
    assert_eq!(survivors.len(), 1);
    let info = survivors[0].ops.leader_info().await.unwrap().unwrap();
    assert!(info.term > first_term);

    for n in &nodes {
        n.stop().await;
    }
}
