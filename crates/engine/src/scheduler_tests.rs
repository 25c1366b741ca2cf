//! End-to-end tests for the orchestrator.
//!
//! Runners are simulated by calling the poll / report / heartbeat API
//! directly, against a `MemoryStore`, so no Postgres and no subprocesses are
//! involved.  Timing-sensitive tests run on tokio's paused clock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use db::MemoryStore;
use futures_util::StreamExt;
use queue::{QueueError, Registration, RunnerStatus, TagSet};
use uuid::Uuid;

use crate::{
    compile_str, Ack, Assignment, EngineError, JobResult, JobStatus, LogIngest, LogLevel,
    Orchestrator, PollRequest, RunStatus, SchedulerConfig, StepResult, StepStatus,
};

const BUILD_TEST: &str = r#"
name: ci
jobs:
  build:
    runs-on: linux
    steps:
      - run: echo hi
  test:
    runs-on: linux
    needs: build
    env:
      MODE: fast
    steps:
      - run: echo ok
"#;

fn orchestrator(config: SchedulerConfig) -> (Orchestrator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (Orchestrator::with_store(store.clone(), config), store)
}

fn workflow(yaml: &str) -> Arc<crate::CompiledWorkflow> {
    Arc::new(compile_str(yaml).expect("workflow should compile"))
}

async fn register(orch: &Orchestrator, runner_id: &str) {
    orch.register_runner(Registration {
        runner_id: runner_id.into(),
        name: runner_id.into(),
        version: "test".into(),
        tags: ["linux".to_string()].into_iter().collect(),
    })
    .await
    .unwrap();
}

fn poll(runner_id: &str) -> PollRequest {
    PollRequest {
        runner_id: runner_id.into(),
        tags: TagSet::new(),
    }
}

fn step_result(a: &Assignment, step_id: Uuid, status: StepStatus) -> StepResult {
    StepResult {
        job_id: a.job_id,
        lease_id: a.lease_id,
        step_id,
        status,
        exit_code: match status {
            StepStatus::Success => Some(0),
            StepStatus::Failed => Some(1),
            _ => None,
        },
        output: String::new(),
        error: String::new(),
        started_at: None,
        finished_at: None,
    }
}

/// Run every step of `a` to `status`, logging `line` from each.
async fn complete(orch: &Orchestrator, a: &Assignment, line: &str, status: StepStatus) -> Ack {
    for step in &a.steps {
        orch.report_step(step_result(a, step.step_id, StepStatus::Running))
            .await
            .unwrap();
        orch.append_log(LogIngest {
            step_id: step.step_id,
            level: LogLevel::Info,
            content: line.into(),
        })
        .await
        .unwrap();
        orch.report_step(step_result(a, step.step_id, status))
            .await
            .unwrap();
    }
    let job_status = if status == StepStatus::Success {
        JobStatus::Success
    } else {
        JobStatus::Failed
    };
    orch.report_job(JobResult {
        job_id: a.job_id,
        lease_id: a.lease_id,
        status: job_status,
        error: None,
    })
    .await
    .unwrap()
}

// ============================================================
// Dependency ordering
// ============================================================

#[tokio::test]
async fn build_then_test_succeeds_with_ordered_logs() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    register(&orch, "r1").await;
    register(&orch, "r2").await;
    let run_id = orch.submit(workflow(BUILD_TEST), BTreeMap::new()).await.unwrap();

    let build = orch.poll(poll("r1")).await.unwrap().expect("build assigned");
    assert_eq!(build.job_name, "build");
    // `test` needs `build`, so nothing else is ready yet.
    assert!(orch.poll(poll("r2")).await.unwrap().is_none());

    assert_eq!(complete(&orch, &build, "hi", StepStatus::Success).await, Ack::Applied);

    let test = orch.poll(poll("r2")).await.unwrap().expect("test assigned");
    assert_eq!(test.job_name, "test");
    assert_eq!(test.env.get("MODE").map(String::as_str), Some("fast"));
    assert_eq!(complete(&orch, &test, "ok", StepStatus::Success).await, Ack::Applied);

    assert_eq!(orch.wait(run_id).await.unwrap(), RunStatus::Success);

    let lines: Vec<String> = orch
        .subscribe_logs(run_id, 0)
        .await
        .unwrap()
        .map(|e| e.content)
        .collect()
        .await;
    assert_eq!(lines, vec!["hi", "ok"]);

    let view = orch.snapshot(run_id).await.unwrap();
    let build_view = view.job("build").unwrap();
    let test_view = view.job("test").unwrap();
    assert!(build_view.finished_at <= test_view.started_at);
    assert_eq!(test_view.needs, vec!["build"]);
    assert_eq!(test_view.steps[0].exit_code, Some(0));
}

#[tokio::test]
async fn failed_job_skips_its_dependents() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    register(&orch, "r1").await;
    let run_id = orch.submit(workflow(BUILD_TEST), BTreeMap::new()).await.unwrap();

    let build = orch.poll(poll("r1")).await.unwrap().unwrap();
    complete(&orch, &build, "boom", StepStatus::Failed).await;

    assert_eq!(orch.wait(run_id).await.unwrap(), RunStatus::Failed);
    assert!(orch.poll(poll("r1")).await.unwrap().is_none());

    let view = orch.snapshot(run_id).await.unwrap();
    let test = view.job("test").unwrap();
    assert_eq!(test.status, JobStatus::Skipped);
    assert_eq!(test.runner_id, None);
    assert_eq!(test.steps[0].status, StepStatus::Skipped);
    assert_eq!(
        view.job("build").unwrap().error.as_deref(),
        Some("step 'step 1' failed with exit code 1")
    );
}

#[tokio::test]
async fn workflow_without_jobs_succeeds_immediately() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    let run_id = orch
        .submit(workflow("name: empty\njobs: {}\n"), BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(orch.wait(run_id).await.unwrap(), RunStatus::Success);
}

#[tokio::test]
async fn jobs_only_go_to_runners_with_matching_tags() {
    let yaml = r#"
name: gpu
jobs:
  train:
    runs-on: [linux, gpu]
    steps: [{ run: "true" }]
"#;
    let (orch, _) = orchestrator(SchedulerConfig::default());
    register(&orch, "cpu-only").await;
    orch.submit(workflow(yaml), BTreeMap::new()).await.unwrap();

    assert!(orch.poll(poll("cpu-only")).await.unwrap().is_none());

    let advertised = PollRequest {
        runner_id: "cpu-only".into(),
        tags: ["linux", "gpu"].iter().map(|t| t.to_string()).collect(),
    };
    assert!(orch.poll(advertised).await.unwrap().is_some());
}

#[tokio::test]
async fn run_inputs_reach_the_runner_environment() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    register(&orch, "r1").await;
    let inputs = BTreeMap::from([("target".to_string(), "prod".to_string())]);
    orch.submit(workflow(BUILD_TEST), inputs).await.unwrap();

    let build = orch.poll(poll("r1")).await.unwrap().unwrap();
    assert_eq!(build.env.get("INPUT_TARGET").map(String::as_str), Some("prod"));
}

// ============================================================
// Leases and delivery
// ============================================================

#[tokio::test]
async fn polling_again_redelivers_the_same_assignment() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    register(&orch, "r1").await;
    orch.submit(workflow(BUILD_TEST), BTreeMap::new()).await.unwrap();

    let first = orch.poll(poll("r1")).await.unwrap().unwrap();
    let again = orch.poll(poll("r1")).await.unwrap().unwrap();
    assert_eq!(first, again);
    assert_eq!(orch.queue().leased(), 1);
}

#[tokio::test]
async fn lost_job_report_is_recovered_on_the_next_poll() {
    let (orch, store) = orchestrator(SchedulerConfig::default());
    register(&orch, "r1").await;
    let run_id = orch.submit(workflow(BUILD_TEST), BTreeMap::new()).await.unwrap();
    let build = orch.poll(poll("r1")).await.unwrap().unwrap();
    let step_id = build.steps[0].step_id;
    orch.report_step(step_result(&build, step_id, StepStatus::Running))
        .await
        .unwrap();
    orch.report_step(step_result(&build, step_id, StepStatus::Success))
        .await
        .unwrap();

    store.set_fail_writes(true);
    let report = JobResult {
        job_id: build.job_id,
        lease_id: build.lease_id,
        status: JobStatus::Success,
        error: None,
    };
    assert!(orch.report_job(report).await.is_err());
    store.set_fail_writes(false);

    // The next poll settles `build` from its steps and hands out `test`.
    let test = orch.poll(poll("r1")).await.unwrap().expect("test assigned");
    assert_eq!(test.job_name, "test");
    let view = orch.snapshot(run_id).await.unwrap();
    assert_eq!(view.job("build").unwrap().status, JobStatus::Success);

    complete(&orch, &test, "ok", StepStatus::Success).await;
    assert_eq!(orch.wait(run_id).await.unwrap(), RunStatus::Success);
    assert_eq!(orch.queue().leased(), 0);
}

#[tokio::test]
async fn job_dropped_part_way_is_leased_again() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    register(&orch, "r1").await;
    let run_id = orch
        .submit(
            workflow("name: two\njobs:\n  build:\n    steps: [{ run: a }, { run: b }]\n"),
            BTreeMap::new(),
        )
        .await
        .unwrap();
    let first = orch.poll(poll("r1")).await.unwrap().unwrap();
    let step_id = first.steps[0].step_id;
    orch.report_step(step_result(&first, step_id, StepStatus::Running))
        .await
        .unwrap();
    orch.report_step(step_result(&first, step_id, StepStatus::Success))
        .await
        .unwrap();

    let second = orch.poll(poll("r1")).await.unwrap().expect("job leased again");
    assert_eq!(second.job_id, first.job_id);
    assert_ne!(second.lease_id, first.lease_id);
    let view = orch.snapshot(run_id).await.unwrap();
    let build = view.job("build").unwrap();
    assert_eq!(build.status, JobStatus::Dispatched);
    assert!(build.steps.iter().all(|s| s.status == StepStatus::Pending));

    let stale = step_result(&first, first.steps[1].step_id, StepStatus::Success);
    assert_eq!(orch.report_step(stale).await.unwrap(), Ack::Discarded);
    complete(&orch, &second, "again", StepStatus::Success).await;
    assert_eq!(orch.wait(run_id).await.unwrap(), RunStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn silent_runner_loses_its_job_to_another_runner() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    register(&orch, "r1").await;
    let run_id = orch.submit(workflow(BUILD_TEST), BTreeMap::new()).await.unwrap();

    let first = orch.poll(poll("r1")).await.unwrap().unwrap();
    let running = step_result(&first, first.steps[0].step_id, StepStatus::Running);
    assert_eq!(orch.report_step(running).await.unwrap(), Ack::Applied);

    // Three missed heartbeats.
    tokio::time::advance(Duration::from_secs(31)).await;
    register(&orch, "r2").await;
    orch.reap().await;
    assert_eq!(orch.registry().get("r1").unwrap().status, RunnerStatus::Offline);

    let second = loop {
        if let Some(a) = orch.poll(poll("r2")).await.unwrap() {
            break a;
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(second.job_id, first.job_id);
    assert_ne!(second.lease_id, first.lease_id);
    assert_eq!(orch.queue().leased(), 1);

    // The first runner's late result no longer counts.
    let late = JobResult {
        job_id: first.job_id,
        lease_id: first.lease_id,
        status: JobStatus::Success,
        error: None,
    };
    assert_eq!(orch.report_job(late).await.unwrap(), Ack::Discarded);
    assert!(matches!(
        orch.heartbeat("r1").await,
        Err(EngineError::Queue(QueueError::RunnerOffline(_)))
    ));

    complete(&orch, &second, "hi", StepStatus::Success).await;
    let view = orch.snapshot(run_id).await.unwrap();
    let build = view.job("build").unwrap();
    assert_eq!(build.status, JobStatus::Success);
    assert_eq!(build.runner_id.as_deref(), Some("r2"));
}

#[tokio::test]
async fn heartbeat_from_unknown_runner_is_rejected() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    assert!(matches!(
        orch.heartbeat("ghost").await,
        Err(EngineError::Queue(QueueError::UnknownRunner(_)))
    ));
}

// ============================================================
// Cancellation and timeouts
// ============================================================

#[tokio::test]
async fn cancelling_a_pending_run_skips_every_job() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    let run_id = orch.create_run(workflow(BUILD_TEST), BTreeMap::new()).await.unwrap();

    orch.cancel(run_id).await.unwrap();
    assert_eq!(orch.wait(run_id).await.unwrap(), RunStatus::Cancelled);

    let view = orch.snapshot(run_id).await.unwrap();
    assert!(view.jobs.iter().all(|j| j.status == JobStatus::Skipped));
    assert!(view
        .jobs
        .iter()
        .flat_map(|j| &j.steps)
        .all(|s| s.status == StepStatus::Skipped && s.started_at.is_none()));

    assert!(matches!(
        orch.cancel(run_id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
        orch.start(run_id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn failed_cancellation_keeps_ready_jobs_in_their_place() {
    let (orch, store) = orchestrator(SchedulerConfig::default());
    register(&orch, "r1").await;
    let single = "name: single\njobs:\n  only:\n    steps: [{ run: \"true\" }]\n";
    let earlier = orch.submit(workflow(single), BTreeMap::new()).await.unwrap();
    let later = orch.submit(workflow(single), BTreeMap::new()).await.unwrap();

    store.set_fail_writes(true);
    assert!(matches!(orch.cancel(earlier).await, Err(EngineError::Database(_))));
    store.set_fail_writes(false);
    assert_eq!(orch.queue().len(), 2);

    let first = orch.poll(poll("r1")).await.unwrap().unwrap();
    assert_eq!(first.run_id, earlier);
    complete(&orch, &first, "first", StepStatus::Success).await;
    let second = orch.poll(poll("r1")).await.unwrap().unwrap();
    assert_eq!(second.run_id, later);
}

#[tokio::test]
async fn cancellation_is_delivered_with_the_heartbeat() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    register(&orch, "r1").await;
    let run_id = orch.submit(workflow(BUILD_TEST), BTreeMap::new()).await.unwrap();
    let build = orch.poll(poll("r1")).await.unwrap().unwrap();
    let step_id = build.steps[0].step_id;
    orch.report_step(step_result(&build, step_id, StepStatus::Running))
        .await
        .unwrap();

    orch.cancel(run_id).await.unwrap();
    assert_eq!(orch.heartbeat("r1").await.unwrap().cancel, vec![build.job_id]);
    assert!(orch.heartbeat("r1").await.unwrap().cancel.is_empty());

    // The runner kills the step; a cancelled step fails its job.
    orch.report_step(step_result(&build, step_id, StepStatus::Cancelled))
        .await
        .unwrap();
    let settled = JobResult {
        job_id: build.job_id,
        lease_id: build.lease_id,
        status: JobStatus::Failed,
        error: Some("cancelled".into()),
    };
    assert_eq!(orch.report_job(settled).await.unwrap(), Ack::Applied);

    assert_eq!(orch.wait(run_id).await.unwrap(), RunStatus::Failed);
    let view = orch.snapshot(run_id).await.unwrap();
    assert_eq!(view.job("test").unwrap().status, JobStatus::Skipped);
    assert_eq!(orch.registry().get("r1").unwrap().status, RunnerStatus::Online);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_cancellation_is_forced_after_the_grace_period() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    register(&orch, "r1").await;
    let run_id = orch.submit(workflow(BUILD_TEST), BTreeMap::new()).await.unwrap();
    let build = orch.poll(poll("r1")).await.unwrap().unwrap();

    orch.cancel(run_id).await.unwrap();
    tokio::time::sleep(orch.config().cancel_grace + Duration::from_secs(1)).await;

    assert_eq!(orch.wait(run_id).await.unwrap(), RunStatus::Cancelled);
    let view = orch.snapshot(run_id).await.unwrap();
    let job = view.job("build").unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.steps[0].status, StepStatus::Cancelled);

    let late = JobResult {
        job_id: build.job_id,
        lease_id: build.lease_id,
        status: JobStatus::Success,
        error: None,
    };
    assert_eq!(orch.report_job(late).await.unwrap(), Ack::Discarded);
    assert_eq!(orch.queue().leased(), 0);
}

#[tokio::test(start_paused = true)]
async fn run_timeout_cancels_the_run() {
    let config = SchedulerConfig {
        run_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    let (orch, _) = orchestrator(config);
    // No runner ever shows up.
    let run_id = orch.submit(workflow(BUILD_TEST), BTreeMap::new()).await.unwrap();

    assert_eq!(orch.wait(run_id).await.unwrap(), RunStatus::Cancelled);
    assert!(orch.queue().is_empty());
}

// ============================================================
// Persistence and lifecycle
// ============================================================

#[tokio::test]
async fn failed_store_write_leaves_state_unchanged() {
    let (orch, store) = orchestrator(SchedulerConfig::default());
    register(&orch, "r1").await;
    let run_id = orch.submit(workflow(BUILD_TEST), BTreeMap::new()).await.unwrap();
    let build = orch.poll(poll("r1")).await.unwrap().unwrap();
    let step_id = build.steps[0].step_id;

    store.set_fail_writes(true);
    assert!(matches!(
        orch.report_step(step_result(&build, step_id, StepStatus::Running)).await,
        Err(EngineError::Database(_))
    ));
    let view = orch.snapshot(run_id).await.unwrap();
    assert_eq!(view.job("build").unwrap().status, JobStatus::Dispatched);

    store.set_fail_writes(false);
    assert_eq!(complete(&orch, &build, "hi", StepStatus::Success).await, Ack::Applied);
    assert_eq!(
        orch.snapshot(run_id).await.unwrap().job("build").unwrap().status,
        JobStatus::Success
    );
}

#[tokio::test]
async fn finished_runs_are_read_back_from_the_store() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    let run_id = orch
        .submit(workflow("name: empty\njobs: {}\n"), BTreeMap::new())
        .await
        .unwrap();
    orch.wait(run_id).await.unwrap();

    assert!(orch.forget(run_id));
    assert_eq!(orch.wait(run_id).await.unwrap(), RunStatus::Success);
    assert_eq!(orch.snapshot(run_id).await.unwrap().status, RunStatus::Success);
    assert!(orch.subscribe_logs(run_id, 0).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn reaper_forgets_runs_after_the_retention() {
    let config = SchedulerConfig {
        run_retention: Duration::from_secs(60),
        ..Default::default()
    };
    let (orch, _) = orchestrator(config);
    let run_id = orch
        .submit(workflow("name: empty\njobs: {}\n"), BTreeMap::new())
        .await
        .unwrap();
    orch.wait(run_id).await.unwrap();
    // Let the actor stop.
    tokio::time::sleep(Duration::from_secs(1)).await;

    orch.reap().await;
    assert!(orch.is_tracked(run_id));

    tokio::time::advance(Duration::from_secs(60)).await;
    orch.reap().await;
    assert!(!orch.is_tracked(run_id));
    assert_eq!(orch.wait(run_id).await.unwrap(), RunStatus::Success);
    assert_eq!(orch.snapshot(run_id).await.unwrap().status, RunStatus::Success);
}

#[tokio::test]
async fn unknown_runs_are_reported() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    let ghost = Uuid::new_v4();
    assert!(matches!(orch.start(ghost).await, Err(EngineError::UnknownRun(_))));
    assert!(matches!(orch.snapshot(ghost).await, Err(EngineError::UnknownRun(_))));
}

#[tokio::test]
async fn shutdown_joins_every_actor() {
    let (orch, _) = orchestrator(SchedulerConfig::default());
    orch.spawn_reaper();
    let run_id = orch.create_run(workflow(BUILD_TEST), BTreeMap::new()).await.unwrap();

    orch.shutdown().await;
    assert!(matches!(orch.wait(run_id).await, Err(EngineError::ActorGone(_))));
}
