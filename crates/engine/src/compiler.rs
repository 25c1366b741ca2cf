//! Workflow compilation, run before a run is created.
//!
//! Rules enforced:
//! 1. The workflow has a name and job keys are unique.
//! 2. Every `needs` entry names a declared job.
//! 3. Every step has a shell command (`uses` is rejected).
//! 4. Timeouts are greater than zero and at most thirty days.
//! 5. The `needs` graph is acyclic (topological sort must succeed).
//!
//! Jobs that become orderable together are emitted lowest declaration index
//! first, so the resulting order is deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use queue::TagSet;

use crate::{
    models::{JobSpec, StepAction, StepSpec, Timeout, WorkflowSpec},
    EngineError,
};

/// A step ready to hand to a runner.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStep {
    pub name: String,
    pub action: StepAction,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<String>,
    pub continue_on_error: bool,
    pub timeout: Option<Duration>,
}

/// A job with its dependencies resolved to declaration indices.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledJob {
    /// Key in the workflow's `jobs` mapping.
    pub key: String,
    /// Display name (`name:` or the key).
    pub name: String,
    /// Position in the `jobs` mapping.
    pub declared: usize,
    pub tags: TagSet,
    /// Indices of the jobs this one needs.
    pub needs: Vec<usize>,
    /// Indices of the jobs that need this one.
    pub dependents: Vec<usize>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub steps: Vec<CompiledStep>,
}

/// A validated workflow: the authored spec plus the resolved job graph.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledWorkflow {
    pub spec: Arc<WorkflowSpec>,
    /// Jobs in declaration order.
    pub jobs: Vec<CompiledJob>,
    /// Declaration indices in topological order.
    pub order: Vec<usize>,
    pub timeout: Option<Duration>,
}

impl CompiledWorkflow {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn job(&self, key: &str) -> Option<&CompiledJob> {
        self.jobs.iter().find(|j| j.key == key)
    }

    /// Job keys in topological order.
    pub fn topological_keys(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.jobs[i].key.as_str()).collect()
    }
}

/// Parse a YAML (or JSON) workflow document and compile it.
pub fn compile_str(text: &str) -> Result<CompiledWorkflow, EngineError> {
    let spec: WorkflowSpec =
        serde_yaml_ng::from_str(text).map_err(|e| EngineError::InvalidSpec(e.to_string()))?;
    compile(spec)
}

/// Validate `spec` and resolve its job graph.
///
/// # Errors
/// - [`EngineError::InvalidSpec`] if the workflow has no name.
/// - [`EngineError::DuplicateJob`] if two jobs share a key.
/// - [`EngineError::UnknownDependency`] if a `needs` entry is not declared.
/// - [`EngineError::MissingCommand`] / [`EngineError::UnsupportedStep`] for
///   steps without a usable command.
/// - [`EngineError::InvalidTimeout`] for zero timeouts or ones longer than
///   [`MAX_TIMEOUT`].
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
pub fn compile(spec: WorkflowSpec) -> Result<CompiledWorkflow, EngineError> {
    if spec.name.trim().is_empty() {
        return Err(EngineError::InvalidSpec("workflow name must not be empty".into()));
    }
    let timeout = check_timeout(spec.timeout, || "the workflow".to_owned())?;

    // -----------------------------------------------------------------------
    // 1. Ensure job keys are unique
    // -----------------------------------------------------------------------
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(spec.jobs.len());
    for (i, (key, _)) in spec.jobs.iter().enumerate() {
        if index.insert(key.as_str(), i).is_some() {
            return Err(EngineError::DuplicateJob(key.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Resolve needs and compile each job
    // -----------------------------------------------------------------------
    let mut jobs = Vec::with_capacity(spec.jobs.len());
    for (declared, (key, job)) in spec.jobs.iter().enumerate() {
        let mut needs = Vec::with_capacity(job.needs.len());
        let mut seen = HashSet::new();
        for need in &job.needs {
            let &dep = index
                .get(need.as_str())
                .ok_or_else(|| EngineError::UnknownDependency {
                    job: key.clone(),
                    missing: need.clone(),
                })?;
            if seen.insert(dep) {
                needs.push(dep);
            }
        }
        jobs.push(compile_job(key, declared, job, needs)?);
    }

    for i in 0..jobs.len() {
        for n in jobs[i].needs.clone() {
            jobs[n].dependents.push(i);
        }
    }

    // -----------------------------------------------------------------------
    // 3. Topological sort (Kahn's algorithm, lowest declaration index first)
    // -----------------------------------------------------------------------
    let mut in_degree: Vec<usize> = jobs.iter().map(|j| j.needs.len()).collect();
    let mut ready: BTreeSet<usize> = (0..jobs.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(jobs.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &jobs[i].dependents {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    // Anything left unordered sits on, or behind, a cycle.
    if order.len() != jobs.len() {
        let stuck = jobs
            .iter()
            .filter(|j| in_degree[j.declared] > 0)
            .map(|j| j.key.clone())
            .collect();
        return Err(EngineError::CycleDetected { jobs: stuck });
    }

    Ok(CompiledWorkflow {
        spec: Arc::new(spec),
        jobs,
        order,
        timeout,
    })
}

fn compile_job(
    key: &str,
    declared: usize,
    job: &JobSpec,
    needs: Vec<usize>,
) -> Result<CompiledJob, EngineError> {
    let steps = job
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| compile_step(key, i, step))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledJob {
        key: key.to_owned(),
        name: job.name.clone().unwrap_or_else(|| key.to_owned()),
        declared,
        tags: job.runs_on.iter().cloned().collect(),
        needs,
        dependents: Vec::new(),
        env: job.env.clone(),
        timeout: check_timeout(job.timeout, || format!("job '{key}'"))?,
        steps,
    })
}

fn compile_step(job: &str, position: usize, step: &StepSpec) -> Result<CompiledStep, EngineError> {
    let name = step
        .name
        .clone()
        .unwrap_or_else(|| format!("step {}", position + 1));

    let command = match (&step.run, &step.uses) {
        (Some(run), _) if !run.trim().is_empty() => run.clone(),
        (_, Some(uses)) => {
            return Err(EngineError::UnsupportedStep {
                job: job.to_owned(),
                step: name,
                uses: uses.clone(),
            })
        }
        _ => {
            return Err(EngineError::MissingCommand {
                job: job.to_owned(),
                step: name,
            })
        }
    };

    Ok(CompiledStep {
        timeout: check_timeout(step.timeout, || format!("step '{name}' of job '{job}'"))?,
        name,
        action: StepAction::Shell { command },
        env: step.env.clone(),
        working_directory: step.working_directory.clone(),
        continue_on_error: step.continue_on_error,
    })
}

/// Longest timeout a workflow may ask for.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 3600);

fn check_timeout(
    timeout: Option<Timeout>,
    context: impl FnOnce() -> String,
) -> Result<Option<Duration>, EngineError> {
    match timeout {
        Some(t) if t.as_duration().is_zero() || t.as_duration() > MAX_TIMEOUT => {
            Err(EngineError::InvalidTimeout { context: context() })
        }
        Some(t) => Ok(Some(t.as_duration())),
        None => Ok(None),
    }
}
