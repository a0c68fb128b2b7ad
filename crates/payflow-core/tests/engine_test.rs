//! End-to-end engine tests: flows driven through the job queue by a
//! worker, resumed by callbacks, status queries, and reversals.

use payflow_core::application::testing::{
    api_call, harness, response, step, two_step_flow, Harness, ScriptedGateway,
};
use payflow_core::{
    ActionCodeRules, CallbackMatcher, CorrelationKey, CreateInstance, CreateOutcome, EngineError,
    FlowDefinition, FlowDefinitionRepository, FlowId, FlowInstance, FlowInstanceRepository,
    InstanceStatus, JobQueueConfig, JobQueueService, JobRepository, JobStatus, JobType, JobWorker,
    MaintenanceConfig, MaintenanceRunner, Payload, ReversalConfig, ReversalController,
    ReversalRepository, StepConfig, StepType, TracingEventHandler, TsqConfig, TsqController,
    TsqRules,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Engine {
    h: Harness,
    queue: Arc<JobQueueService>,
    worker: JobWorker,
    matcher: Arc<CallbackMatcher>,
    maintenance: MaintenanceRunner,
}

/// Wire the full engine: coordinator, controllers, matcher, queue,
/// one worker, and the maintenance runner, all sharing one scripted
/// gateway
fn engine(gateway: ScriptedGateway) -> Engine {
    let h = harness(gateway);
    let coordinator = Arc::new(h.coordinator.clone());

    let queue = Arc::new(JobQueueService::new(
        h.jobs.clone(),
        JobQueueConfig {
            poll_interval: Duration::from_millis(10),
            ..JobQueueConfig::default()
        },
    ));

    let tsq = Arc::new(TsqController::new(
        h.tsqs.clone(),
        h.instances.clone(),
        h.gateway.clone(),
        coordinator.clone(),
        TsqRules::default(),
        TsqConfig {
            retry_interval: Duration::from_secs(0),
            ..TsqConfig::default()
        },
    ));

    let reversal = Arc::new(ReversalController::new(
        h.reversals.clone(),
        h.instances.clone(),
        h.executions.clone(),
        h.callbacks.clone(),
        h.gateway.clone(),
        coordinator.clone(),
        ActionCodeRules::default(),
        ReversalConfig::default(),
    ));

    let matcher = Arc::new(CallbackMatcher::new(
        h.callbacks.clone(),
        h.executions.clone(),
        h.reversals.clone(),
        coordinator.clone(),
        reversal.clone(),
        Arc::new(TracingEventHandler),
        ActionCodeRules::default(),
    ));

    let worker = JobWorker::new("worker-1", queue.clone(), coordinator, tsq, reversal);

    let maintenance = MaintenanceRunner::new(
        matcher.clone(),
        queue.clone(),
        h.tsqs.clone(),
        MaintenanceConfig::default(),
    );

    Engine {
        h,
        queue,
        worker,
        matcher,
        maintenance,
    }
}

fn create(session: &str) -> CreateInstance {
    CreateInstance {
        flow_code: "TRANSFER".to_string(),
        session_id: session.to_string(),
        tracking_number: format!("trk-{}", session),
        payload: Payload::new(json!({"amount": 100, "name": "ada"})),
        callback_url: Some("https://caller.example/hook".to_string()),
    }
}

fn key(session: &str) -> CorrelationKey {
    CorrelationKey {
        session_id: session.to_string(),
        tracking_number: format!("trk-{}", session),
    }
}

/// Claim and process every due job once
async fn drain_jobs(engine: &Engine) {
    loop {
        let batch = engine.queue.claim("worker-1").await.unwrap();
        if batch.is_empty() {
            return;
        }
        for job in batch {
            engine.worker.process(job).await;
        }
    }
}

#[tokio::test]
async fn worker_drives_flow_to_completion() {
    let engine = engine(ScriptedGateway::respond_with(
        "000",
        json!({"action_code": "000", "reference": "REF-1"}),
    ));
    engine.h.definitions.save(&two_step_flow(false)).await.unwrap();

    let outcome = engine
        .h
        .coordinator
        .create_instance(create("s1"))
        .await
        .unwrap();
    let instance_id = match outcome {
        CreateOutcome::Accepted { instance_id } => instance_id,
        other => panic!("unexpected {:?}", other),
    };

    drain_jobs(&engine).await;

    let instance = engine
        .h
        .instances
        .find_by_id(&instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.callback_sent);
    let final_response = instance.final_response.unwrap();
    assert_eq!(final_response.get_str("reference").unwrap(), "REF-1");
    assert_eq!(engine.h.notifier.delivery_count(), 1);
}

#[tokio::test]
async fn callback_resumes_suspended_flow() {
    let engine = engine(ScriptedGateway::respond_with(
        "001",
        json!({"action_code": "001"}),
    ));
    let mut flow = two_step_flow(false);
    flow.steps[1].config.await_callback = true;
    engine.h.definitions.save(&flow).await.unwrap();

    let outcome = engine
        .h
        .coordinator
        .create_instance(create("s1"))
        .await
        .unwrap();
    let instance_id = match outcome {
        CreateOutcome::Accepted { instance_id } => instance_id,
        other => panic!("unexpected {:?}", other),
    };
    drain_jobs(&engine).await;

    let instance = engine
        .h
        .instances
        .find_by_id(&instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::WaitingCallback);

    // The external system answers hours later
    engine
        .matcher
        .ingest(
            key("s1"),
            Payload::new(json!({"action_code": "000", "approval_code": "APP-1"})),
        )
        .await
        .unwrap();

    let instance = engine
        .h
        .instances
        .find_by_id(&instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.payload.get_str("approval_code").unwrap(), "APP-1");
}

#[tokio::test]
async fn callback_timeout_escalates_to_tsq_and_resolves() {
    // Flow call answers "processing"; the TSQ later confirms success
    let engine = engine(ScriptedGateway::new(vec![
        Ok(response("001", json!({"action_code": "001"}))),
        Ok(response("000", json!({"action_code": "000", "settled": true}))),
    ]));
    let mut flow = two_step_flow(false);
    flow.steps[1].config.await_callback = true;
    engine.h.definitions.save(&flow).await.unwrap();

    let outcome = engine
        .h
        .coordinator
        .create_instance(create("s1"))
        .await
        .unwrap();
    let instance_id = match outcome {
        CreateOutcome::Accepted { instance_id } => instance_id,
        other => panic!("unexpected {:?}", other),
    };
    drain_jobs(&engine).await;

    // No callback ever arrives; the deadline passes
    let swept = engine
        .matcher
        .sweep_timeouts(chrono::Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(swept, 1);

    // The sweep raised a TSQ job; the worker resolves it
    drain_jobs(&engine).await;

    let instance = engine
        .h
        .instances
        .find_by_id(&instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.payload.get_path("settled").unwrap(), &json!(true));
}

#[tokio::test]
async fn partial_failure_reverses_and_finalizes() {
    // Leg 1 succeeds, leg 2 hard-fails, the reversal call succeeds
    let engine = engine(ScriptedGateway::new(vec![
        Ok(response("000", json!({"action_code": "000"}))),
        Ok(response("999", json!({"action_code": "999"}))),
        Ok(response("000", json!({"action_code": "000"}))),
    ]));

    let mut leg1 = api_call("DEBIT_LEG", 1);
    leg1.config.leg = Some(1);
    let mut leg2 = api_call("CREDIT_LEG", 2);
    leg2.config.leg = Some(2);
    let flow = FlowDefinition {
        id: FlowId("flow-2".to_string()),
        code: "TRANSFER".to_string(),
        version: 1,
        name: "Two leg".to_string(),
        description: None,
        synchronous: false,
        steps: vec![
            step("START", StepType::Start, 0, StepConfig::default()),
            leg1,
            leg2,
            step("END", StepType::End, 3, StepConfig::default()),
        ],
        transitions: vec![],
    };
    engine.h.definitions.save(&flow).await.unwrap();

    let mut request = create("s1");
    request.payload = Payload::new(json!({
        "debit_account": "1111",
        "credit_account": "2222",
        "amount": 5000
    }));
    let outcome = engine.h.coordinator.create_instance(request).await.unwrap();
    let instance_id = match outcome {
        CreateOutcome::Accepted { instance_id } => instance_id,
        other => panic!("unexpected {:?}", other),
    };

    drain_jobs(&engine).await;

    let instance = engine
        .h
        .instances
        .find_by_id(&instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Reversed);

    let reversals = engine
        .h
        .reversals
        .find_by_instance(&instance_id)
        .await
        .unwrap();
    assert_eq!(reversals.len(), 1);
    // Swapped-leg compensating payload went out
    assert_eq!(reversals[0].payload.get_str("debit_account").unwrap(), "2222");
    assert_eq!(reversals[0].payload.get_str("credit_account").unwrap(), "1111");
    assert_eq!(
        reversals[0].status,
        payflow_core::ReversalStatus::Success
    );
}

#[tokio::test]
async fn exhausted_job_fails_instance_with_attempt_count() {
    let engine = engine(ScriptedGateway::new(vec![]));

    // An instance whose definition is missing: every execution attempt
    // errors, so the job itself burns through its attempts
    let instance = FlowInstance::new(
        FlowId("missing-flow".to_string()),
        "s1".to_string(),
        "trk-s1".to_string(),
        Payload::new(json!({})),
        None,
    );
    let instance_id = instance.id.clone();
    engine.h.instances.save(&instance).await.unwrap();

    let job_id = engine
        .queue
        .enqueue(
            JobType::ExecuteFlow,
            Payload::new(json!({"instance_id": instance_id.0})),
            0,
        )
        .await
        .unwrap();

    // Drive the job through all three attempts
    for _ in 0..3 {
        let mut job = engine.h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
        job.scheduled_for = chrono::Utc::now();
        engine.h.jobs.save(&job).await.unwrap();

        let batch = engine.queue.claim("worker-1").await.unwrap();
        for job in batch {
            engine.worker.process(job).await;
        }
    }

    let job = engine.h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt, 3);

    let instance = engine
        .h
        .instances
        .find_by_id(&instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    let error = instance.last_error.unwrap();
    assert!(error.contains("after 3 attempts"), "got: {}", error);
}

#[tokio::test]
async fn maintenance_tick_reclaims_stale_leases() {
    let engine = engine(ScriptedGateway::new(vec![]));

    let job_id = engine
        .queue
        .enqueue(JobType::ExecuteFlow, Payload::new(json!({})), 0)
        .await
        .unwrap();

    // A worker claims the job and dies
    let claimed = engine.queue.claim("doomed-worker").await.unwrap();
    assert_eq!(claimed.len(), 1);
    let mut job = engine.h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    job.locked_at = Some(chrono::Utc::now() - chrono::Duration::hours(1));
    engine.h.jobs.save(&job).await.unwrap();

    engine.maintenance.tick().await.unwrap();

    let job = engine.h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.locked_by.is_none());
}

#[tokio::test]
async fn worker_shuts_down_gracefully() {
    let engine = engine(ScriptedGateway::new(vec![]));
    let (tx, rx) = tokio::sync::watch::channel(false);

    let worker = Arc::new(engine.worker);
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(rx).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker did not stop on shutdown signal")
        .unwrap();
}

#[tokio::test]
async fn racing_workers_never_share_jobs() {
    let engine = engine(ScriptedGateway::new(vec![]));

    for _ in 0..30 {
        engine
            .queue
            .enqueue(JobType::ExecuteFlow, Payload::new(json!({})), 0)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..6 {
        let queue = engine.queue.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = queue.claim(&format!("racer-{}", worker)).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|j| j.id.0));
            }
            mine
        }));
    }

    let mut seen = std::collections::HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id.clone()), "job {} claimed twice", id);
        }
    }
    assert_eq!(seen.len(), 30);
}

#[tokio::test]
async fn transport_retries_surface_as_transport_error() {
    // Sanity check that the scripted gateway drains responses in order
    let gateway = ScriptedGateway::new(vec![
        Err(EngineError::TransportError("first".into())),
        Ok(response("000", json!({"action_code": "000"}))),
    ]);
    let engine = engine(gateway);
    let mut flow = two_step_flow(false);
    flow.steps[1].retry = payflow_core::RetryPolicy {
        max_attempts: 2,
        retry_interval_ms: 0,
    };
    engine.h.definitions.save(&flow).await.unwrap();

    let outcome = engine
        .h
        .coordinator
        .create_instance(create("s1"))
        .await
        .unwrap();
    let instance_id = match outcome {
        CreateOutcome::Accepted { instance_id } => instance_id,
        other => panic!("unexpected {:?}", other),
    };
    drain_jobs(&engine).await;

    // The transient first attempt was retried to success
    let instance = engine
        .h
        .instances
        .find_by_id(&instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.error_count, 1);
    assert_eq!(engine.h.gateway.call_count(), 2);
}
