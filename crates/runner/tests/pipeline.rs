//! The scheduler and in-process runners executing real shell steps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use db::MemoryStore;
use engine::{
    compile_str, JobStatus, Orchestrator, RunStatus, SchedulerConfig, StepStatus,
};
use futures_util::StreamExt;
use runner::{Agent, AgentConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Cluster {
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
    agents: Vec<JoinHandle<Result<(), runner::RunnerError>>>,
}

impl Cluster {
    fn start(runners: usize) -> Self {
        let config = SchedulerConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let orchestrator = Orchestrator::with_store(Arc::new(MemoryStore::new()), config);
        let shutdown = CancellationToken::new();
        let agents = (0..runners)
            .map(|i| {
                let config = AgentConfig {
                    runner_id: format!("runner-{i}"),
                    name: format!("runner-{i}"),
                    poll_interval: Duration::from_millis(20),
                    heartbeat_interval: Duration::from_millis(50),
                    ..Default::default()
                };
                let agent = Agent::new(config, Arc::new(orchestrator.clone()));
                tokio::spawn(agent.run(shutdown.clone()))
            })
            .collect();
        Self {
            orchestrator,
            shutdown,
            agents,
        }
    }

    async fn submit(&self, yaml: &str) -> Uuid {
        let workflow = Arc::new(compile_str(yaml).unwrap());
        self.orchestrator
            .submit(workflow, BTreeMap::new())
            .await
            .unwrap()
    }

    async fn wait(&self, run_id: Uuid) -> RunStatus {
        tokio::time::timeout(Duration::from_secs(20), self.orchestrator.wait(run_id))
            .await
            .expect("run did not finish in time")
            .unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        for agent in self.agents {
            agent.await.unwrap().unwrap();
        }
        self.orchestrator.shutdown().await;
    }
}

#[tokio::test]
async fn build_then_test_prints_hi_then_ok() {
    let cluster = Cluster::start(2);
    let run_id = cluster
        .submit(
            r#"
name: ci
jobs:
  build:
    runs-on: linux
    steps:
      - run: echo hi
  test:
    runs-on: linux
    needs: build
    steps:
      - run: echo ok
"#,
        )
        .await;

    assert_eq!(cluster.wait(run_id).await, RunStatus::Success);
    let lines: Vec<String> = cluster
        .orchestrator
        .subscribe_logs(run_id, 0)
        .await
        .unwrap()
        .map(|e| e.content)
        .collect()
        .await;
    assert_eq!(lines, vec!["hi", "ok"]);

    let view = cluster.orchestrator.snapshot(run_id).await.unwrap();
    let build = view.job("build").unwrap();
    assert_eq!(build.steps[0].output, "hi\n");
    assert!(build.finished_at <= view.job("test").unwrap().started_at);
    cluster.stop().await;
}

#[tokio::test]
async fn continue_on_error_and_failure_cascade() {
    let cluster = Cluster::start(1);
    let run_id = cluster
        .submit(
            r#"
name: mixed
jobs:
  lint:
    runs-on: shell
    steps:
      - name: flaky
        run: exit 2
        continue-on-error: true
      - name: real
        run: echo linted
  build:
    runs-on: shell
    needs: lint
    steps:
      - run: echo broken >&2; exit 1
      - run: echo unreachable
  deploy:
    runs-on: shell
    needs: [build]
    steps:
      - run: echo never
"#,
        )
        .await;

    assert_eq!(cluster.wait(run_id).await, RunStatus::Failed);
    let view = cluster.orchestrator.snapshot(run_id).await.unwrap();

    let lint = view.job("lint").unwrap();
    assert_eq!(lint.status, JobStatus::Success);
    assert_eq!(lint.steps[0].status, StepStatus::Failed);
    assert_eq!(lint.steps[0].exit_code, Some(2));
    assert_eq!(lint.steps[1].status, StepStatus::Success);

    let build = view.job("build").unwrap();
    assert_eq!(build.status, JobStatus::Failed);
    assert_eq!(build.steps[1].status, StepStatus::Skipped);
    assert!(build.steps[0].error.contains("broken"));

    let deploy = view.job("deploy").unwrap();
    assert_eq!(deploy.status, JobStatus::Skipped);
    assert!(deploy.runner_id.is_none());
    cluster.stop().await;
}

#[tokio::test]
async fn cancelling_stops_the_running_step() {
    let cluster = Cluster::start(1);
    let run_id = cluster
        .submit(
            r#"
name: slow
jobs:
  wait:
    runs-on: linux
    steps:
      - run: sleep 30
      - run: echo never
"#,
        )
        .await;

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let view = cluster.orchestrator.snapshot(run_id).await.unwrap();
            if view.job("wait").unwrap().steps[0].status == StepStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("step never started");

    cluster.orchestrator.cancel(run_id).await.unwrap();
    let status = cluster.wait(run_id).await;
    // A cancelled step fails its job.
    assert_eq!(status, RunStatus::Failed);

    let view = cluster.orchestrator.snapshot(run_id).await.unwrap();
    let job = view.job("wait").unwrap();
    assert!(view.cancel_requested);
    assert_eq!(job.steps[0].status, StepStatus::Cancelled);
    assert_eq!(job.steps[1].status, StepStatus::Skipped);
    cluster.stop().await;
}

#[tokio::test]
async fn working_directory_and_env_reach_the_step() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("version.txt"), "1.2.3").unwrap();

    let cluster = Cluster::start(1);
    let yaml = format!(
        r#"
name: env
jobs:
  show:
    runs-on: linux
    env:
      WHO: job
      LEVEL: job
    steps:
      - run: echo "$WHO $LEVEL $(cat version.txt)"
        working-directory: {}
        env:
          LEVEL: step
"#,
        dir.path().display()
    );
    let run_id = cluster.submit(&yaml).await;

    assert_eq!(cluster.wait(run_id).await, RunStatus::Success);
    let view = cluster.orchestrator.snapshot(run_id).await.unwrap();
    assert_eq!(view.job("show").unwrap().steps[0].output, "job step 1.2.3\n");
    cluster.stop().await;
}

#[tokio::test]
async fn independent_jobs_spread_across_runners() {
    let cluster = Cluster::start(3);
    let run_id = cluster
        .submit(
            r#"
name: fan-out
jobs:
  a:
    runs-on: linux
    steps: [{ run: "sleep 0.2" }]
  b:
    runs-on: linux
    steps: [{ run: "sleep 0.2" }]
  c:
    runs-on: linux
    steps: [{ run: "sleep 0.2" }]
  join:
    runs-on: linux
    needs: [a, b, c]
    steps: [{ run: "echo joined" }]
"#,
        )
        .await;

    assert_eq!(cluster.wait(run_id).await, RunStatus::Success);
    let view = cluster.orchestrator.snapshot(run_id).await.unwrap();
    let join = view.job("join").unwrap();
    for name in ["a", "b", "c"] {
        assert!(view.job(name).unwrap().finished_at <= join.started_at);
    }
    cluster.stop().await;
}
