//! The dispatch queue: ready jobs waiting for a runner, and the leases of
//! jobs handed out.
//!
//! Ready jobs are grouped by their required tag set.  A runner is offered
//! the earliest-ready job of any class whose tags are a subset of its own;
//! "earliest" is the [`ReadyKey`] order: the enqueue batch first, then the
//! job's declaration index in its workflow.
//!
//! A job is in at most one of two places: waiting in a tag class, or bound
//! to a runner by a [`Lease`].  Moving it from one to the other happens
//! under the queue lock, so two runners can never hold the same job.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::QueueError;

/// Runner capabilities / job requirements.
pub type TagSet = BTreeSet<String>;

/// Dispatch ordering key: FIFO by enqueue batch, ties broken by the job's
/// declaration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadyKey {
    pub batch: u64,
    pub declared: usize,
}

/// A job handed to the queue once its dependencies are satisfied.
#[derive(Debug, Clone)]
pub struct QueuedJob<T> {
    pub job_id: Uuid,
    pub run_id: Uuid,
    /// Declaration index within the workflow.
    pub declared: usize,
    /// Tags a runner must carry to take this job.
    pub tags: TagSet,
    /// Whatever the runner needs to execute the job.
    pub payload: T,
}

/// The binding of a job to one runner.
#[derive(Debug, Clone)]
pub struct Lease<T> {
    pub lease_id: Uuid,
    pub runner_id: String,
    pub job: QueuedJob<T>,
    pub key: ReadyKey,
    /// Set once the runner went silent; the lease then only exists so late
    /// results can be recognised and the job re-queued with its old key.
    pub expired: bool,
}

/// A job pulled out of the queue by [`JobDispatchQueue::withdraw`], kept
/// with its ordering key so it can be reinstated.
#[derive(Debug, Clone)]
pub struct Withdrawn<T> {
    job: QueuedJob<T>,
    key: ReadyKey,
}

impl<T> Withdrawn<T> {
    pub fn job_id(&self) -> Uuid {
        self.job.job_id
    }
}

struct Waiting<T> {
    job: QueuedJob<T>,
    key: ReadyKey,
    since: Instant,
    warned: bool,
}

struct Inner<T> {
    next_batch: u64,
    classes: HashMap<TagSet, BTreeMap<ReadyKey, Uuid>>,
    waiting: HashMap<Uuid, Waiting<T>>,
    leases: HashMap<Uuid, Lease<T>>,
}

impl<T> Inner<T> {
    fn push_waiting(&mut self, job: QueuedJob<T>, key: ReadyKey) {
        self.classes
            .entry(job.tags.clone())
            .or_default()
            .insert(key, job.job_id);
        self.waiting.insert(
            job.job_id,
            Waiting {
                job,
                key,
                since: Instant::now(),
                warned: false,
            },
        );
    }

    fn take_waiting(&mut self, job_id: Uuid) -> Option<Waiting<T>> {
        let waiting = self.waiting.remove(&job_id)?;
        if let Some(class) = self.classes.get_mut(&waiting.job.tags) {
            class.remove(&waiting.key);
            if class.is_empty() {
                self.classes.remove(&waiting.job.tags);
            }
        }
        Some(waiting)
    }
}

/// Ready jobs classified by tag set, plus the leases of dispatched jobs.
pub struct JobDispatchQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> Default for JobDispatchQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> JobDispatchQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_batch: 0,
                classes: HashMap::new(),
                waiting: HashMap::new(),
                leases: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue jobs that became ready together.
    ///
    /// The whole batch shares one FIFO position, so among its members the
    /// declaration index decides.  Nothing is enqueued if any member is
    /// already queued or leased.
    pub fn enqueue(&self, jobs: Vec<QueuedJob<T>>) -> Result<(), QueueError> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut inner = self.lock();
        if let Some(dup) = jobs
            .iter()
            .find(|j| inner.waiting.contains_key(&j.job_id) || inner.leases.contains_key(&j.job_id))
        {
            return Err(QueueError::AlreadyQueued(dup.job_id));
        }

        let batch = inner.next_batch;
        inner.next_batch += 1;
        for job in jobs {
            debug!(job_id = %job.job_id, batch, declared = job.declared, "job enqueued");
            let key = ReadyKey {
                batch,
                declared: job.declared,
            };
            inner.push_waiting(job, key);
        }
        Ok(())
    }

    /// Hand the earliest eligible job to `runner_id`, binding it with a new
    /// lease.  Returns `None` if no waiting job's tags fit `runner_tags`.
    pub fn dispatch(&self, runner_id: &str, runner_tags: &TagSet) -> Option<Lease<T>> {
        let mut inner = self.lock();

        let (_, job_id) = inner
            .classes
            .iter()
            .filter(|(tags, _)| tags.is_subset(runner_tags))
            .filter_map(|(_, class)| class.first_key_value().map(|(key, id)| (*key, *id)))
            .min_by_key(|(key, _)| *key)?;

        let waiting = inner.take_waiting(job_id)?;
        let lease = Lease {
            lease_id: Uuid::new_v4(),
            runner_id: runner_id.to_owned(),
            job: waiting.job,
            key: waiting.key,
            expired: false,
        };
        inner.leases.insert(job_id, lease.clone());

        debug!(%job_id, runner_id, lease_id = %lease.lease_id, "job leased");
        Some(lease)
    }

    /// Remove a job that is still waiting.  Returns `None` if it was
    /// already dispatched (or never queued).
    pub fn withdraw(&self, job_id: Uuid) -> Option<Withdrawn<T>> {
        self.lock().take_waiting(job_id).map(|w| Withdrawn {
            job: w.job,
            key: w.key,
        })
    }

    /// Put withdrawn jobs back where they were.
    pub fn reinstate(&self, withdrawn: Vec<Withdrawn<T>>) {
        let mut inner = self.lock();
        for Withdrawn { job, key } in withdrawn {
            debug!(job_id = %job.job_id, batch = key.batch, "withdrawn job reinstated");
            inner.push_waiting(job, key);
        }
    }

    /// Whether `lease_id` is the job's current, unexpired lease.
    pub fn is_live(&self, job_id: Uuid, lease_id: Uuid) -> bool {
        self.lock()
            .leases
            .get(&job_id)
            .is_some_and(|l| l.lease_id == lease_id && !l.expired)
    }

    /// Finish a job: drop its live lease.
    pub fn complete(&self, job_id: Uuid, lease_id: Uuid) -> Result<Lease<T>, QueueError> {
        let mut inner = self.lock();
        let live = inner
            .leases
            .get(&job_id)
            .is_some_and(|l| l.lease_id == lease_id && !l.expired);
        match live.then(|| inner.leases.remove(&job_id)).flatten() {
            Some(lease) => Ok(lease),
            None => Err(QueueError::LeaseExpired { job_id, lease_id }),
        }
    }

    /// Drop a lease without re-queueing the job, whatever its state.
    /// Used when the assignment is refused or the job is force-settled.
    pub fn release(&self, job_id: Uuid, lease_id: Uuid) -> bool {
        let mut inner = self.lock();
        if inner.leases.get(&job_id).is_some_and(|l| l.lease_id == lease_id) {
            inner.leases.remove(&job_id);
            true
        } else {
            false
        }
    }

    /// Mark every live lease held by `runner_id` as expired and return the
    /// affected `(job_id, lease_id)` pairs.
    pub fn expire_runner(&self, runner_id: &str) -> Vec<(Uuid, Uuid)> {
        let mut inner = self.lock();
        let mut expired = Vec::new();
        for lease in inner.leases.values_mut() {
            if lease.runner_id == runner_id && !lease.expired {
                lease.expired = true;
                expired.push((lease.job.job_id, lease.lease_id));
            }
        }
        expired
    }

    /// Expire a single live lease.  Returns `false` if `lease_id` is not the
    /// job's live lease.
    pub fn expire(&self, job_id: Uuid, lease_id: Uuid) -> bool {
        match self.lock().leases.get_mut(&job_id) {
            Some(lease) if lease.lease_id == lease_id && !lease.expired => {
                lease.expired = true;
                true
            }
            _ => false,
        }
    }

    /// Put an expired job back into its tag class under its original key.
    /// Returns `false` if `lease_id` is not the job's expired lease.
    pub fn requeue(&self, job_id: Uuid, lease_id: Uuid) -> bool {
        let mut inner = self.lock();
        let expired = inner
            .leases
            .get(&job_id)
            .is_some_and(|l| l.lease_id == lease_id && l.expired);
        match expired.then(|| inner.leases.remove(&job_id)).flatten() {
            Some(lease) => {
                debug!(%job_id, runner_id = %lease.runner_id, "job re-queued after lease expiry");
                inner.push_waiting(lease.job, lease.key);
                true
            }
            None => false,
        }
    }

    /// Undo a dispatch that could not be recorded: the job goes back to
    /// waiting under its original key.
    pub fn restore(&self, job_id: Uuid, lease_id: Uuid) -> bool {
        let mut inner = self.lock();
        let held = inner.leases.get(&job_id).is_some_and(|l| l.lease_id == lease_id);
        match held.then(|| inner.leases.remove(&job_id)).flatten() {
            Some(lease) => {
                inner.push_waiting(lease.job, lease.key);
                true
            }
            None => false,
        }
    }

    /// The live lease held by `runner_id`, if any.
    pub fn leased_to(&self, runner_id: &str) -> Option<Lease<T>> {
        self.lock()
            .leases
            .values()
            .find(|l| l.runner_id == runner_id && !l.expired)
            .cloned()
    }

    /// Jobs that have been waiting at least `threshold`, each reported once.
    pub fn stale(&self, threshold: Duration) -> Vec<QueueError> {
        let mut inner = self.lock();
        let now = Instant::now();
        let mut out = Vec::new();
        for (job_id, waiting) in inner.waiting.iter_mut() {
            let waited = now.duration_since(waiting.since);
            if !waiting.warned && waited >= threshold {
                waiting.warned = true;
                out.push(QueueError::AssignmentTimeout {
                    job_id: *job_id,
                    waited,
                });
            }
        }
        out
    }

    /// Number of jobs waiting for a runner.
    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of leases (live or expired) currently held.
    pub fn leased(&self) -> usize {
        self.lock().leases.len()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> TagSet {
        list.iter().map(|t| t.to_string()).collect()
    }

    fn job(run_id: Uuid, declared: usize, required: &[&str]) -> QueuedJob<&'static str> {
        QueuedJob {
            job_id: Uuid::new_v4(),
            run_id,
            declared,
            tags: tags(required),
            payload: "payload",
        }
    }

    #[test]
    fn batch_members_dispatch_in_declaration_order() {
        let queue = JobDispatchQueue::new();
        let run = Uuid::new_v4();
        let (a, b, c) = (job(run, 2, &[]), job(run, 0, &[]), job(run, 1, &[]));
        let expected = vec![b.job_id, c.job_id, a.job_id];
        queue.enqueue(vec![a, b, c]).unwrap();

        let runner_tags = tags(&["linux"]);
        let order: Vec<Uuid> = (0..3)
            .map(|_| queue.dispatch("r1", &runner_tags).unwrap().job.job_id)
            .collect();
        assert_eq!(order, expected);
        assert!(queue.dispatch("r1", &runner_tags).is_none());
    }

    #[test]
    fn earlier_batch_wins_across_tag_classes() {
        let queue = JobDispatchQueue::new();
        let run = Uuid::new_v4();
        let first = job(run, 5, &["linux"]);
        let second = job(run, 0, &[]);
        let first_id = first.job_id;
        queue.enqueue(vec![first]).unwrap();
        queue.enqueue(vec![second]).unwrap();

        let lease = queue.dispatch("r1", &tags(&["linux", "docker"])).unwrap();
        assert_eq!(lease.job.job_id, first_id);
    }

    #[test]
    fn runner_without_required_tags_gets_nothing() {
        let queue = JobDispatchQueue::new();
        queue.enqueue(vec![job(Uuid::new_v4(), 0, &["gpu"])]).unwrap();

        assert!(queue.dispatch("r1", &tags(&["linux"])).is_none());
        assert!(queue.dispatch("r2", &tags(&["gpu", "linux"])).is_some());
    }

    #[test]
    fn a_job_is_never_leased_twice() {
        let queue = JobDispatchQueue::new();
        let j = job(Uuid::new_v4(), 0, &[]);
        let job_id = j.job_id;
        queue.enqueue(vec![j.clone()]).unwrap();

        let lease = queue.dispatch("r1", &TagSet::new()).unwrap();
        assert!(queue.dispatch("r2", &TagSet::new()).is_none());
        assert_eq!(queue.enqueue(vec![j]), Err(QueueError::AlreadyQueued(job_id)));
        assert!(queue.is_live(job_id, lease.lease_id));
    }

    #[test]
    fn expired_lease_requeues_once_and_rejects_late_completion() {
        let queue = JobDispatchQueue::new();
        let j = job(Uuid::new_v4(), 0, &[]);
        let job_id = j.job_id;
        queue.enqueue(vec![j]).unwrap();

        let first = queue.dispatch("r1", &TagSet::new()).unwrap();
        assert_eq!(queue.expire_runner("r1"), vec![(job_id, first.lease_id)]);
        assert!(!queue.is_live(job_id, first.lease_id));
        assert!(queue.requeue(job_id, first.lease_id));
        assert!(!queue.requeue(job_id, first.lease_id));

        let second = queue.dispatch("r2", &TagSet::new()).unwrap();
        assert_eq!(second.job.job_id, job_id);
        assert_eq!(second.key, first.key);
        assert_ne!(second.lease_id, first.lease_id);

        assert!(matches!(
            queue.complete(job_id, first.lease_id),
            Err(QueueError::LeaseExpired { .. })
        ));
        assert!(queue.complete(job_id, second.lease_id).is_ok());
        assert_eq!(queue.leased(), 0);
    }

    #[test]
    fn withdraw_only_removes_waiting_jobs() {
        let queue = JobDispatchQueue::new();
        let run = Uuid::new_v4();
        let (a, b) = (job(run, 0, &[]), job(run, 1, &[]));
        let (a_id, b_id) = (a.job_id, b.job_id);
        queue.enqueue(vec![a, b]).unwrap();

        queue.dispatch("r1", &TagSet::new()).unwrap();
        assert!(queue.withdraw(a_id).is_none());
        assert_eq!(queue.withdraw(b_id).unwrap().job_id(), b_id);
        assert!(queue.is_empty());
    }

    #[test]
    fn reinstated_jobs_keep_their_place() {
        let queue = JobDispatchQueue::new();
        let run = Uuid::new_v4();
        let (a, b) = (job(run, 0, &[]), job(run, 1, &[]));
        let a_id = a.job_id;
        queue.enqueue(vec![a]).unwrap();
        queue.enqueue(vec![b]).unwrap();

        let pulled = queue.withdraw(a_id).unwrap();
        queue.reinstate(vec![pulled]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dispatch("r1", &TagSet::new()).unwrap().job.job_id, a_id);
    }

    #[test]
    fn single_lease_expiry_allows_requeue() {
        let queue = JobDispatchQueue::new();
        let j = job(Uuid::new_v4(), 0, &[]);
        let job_id = j.job_id;
        queue.enqueue(vec![j]).unwrap();

        let lease = queue.dispatch("r1", &TagSet::new()).unwrap();
        assert!(!queue.requeue(job_id, lease.lease_id));
        assert!(!queue.expire(job_id, Uuid::new_v4()));
        assert!(queue.expire(job_id, lease.lease_id));
        assert!(!queue.expire(job_id, lease.lease_id));
        assert!(queue.leased_to("r1").is_none());
        assert!(queue.requeue(job_id, lease.lease_id));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn restored_job_keeps_its_place() {
        let queue = JobDispatchQueue::new();
        let run = Uuid::new_v4();
        let (a, b) = (job(run, 0, &[]), job(run, 1, &[]));
        let a_id = a.job_id;
        queue.enqueue(vec![a, b]).unwrap();

        let lease = queue.dispatch("r1", &TagSet::new()).unwrap();
        assert!(queue.restore(a_id, lease.lease_id));
        assert!(!queue.is_live(a_id, lease.lease_id));
        assert_eq!(queue.dispatch("r2", &TagSet::new()).unwrap().job.job_id, a_id);
    }

    #[test]
    fn leased_to_finds_the_runner_assignment() {
        let queue = JobDispatchQueue::new();
        queue.enqueue(vec![job(Uuid::new_v4(), 0, &[])]).unwrap();
        let lease = queue.dispatch("r1", &TagSet::new()).unwrap();

        assert_eq!(queue.leased_to("r1").unwrap().lease_id, lease.lease_id);
        assert!(queue.leased_to("r2").is_none());
        assert!(queue.release(lease.job.job_id, lease.lease_id));
        assert!(queue.leased_to("r1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_jobs_are_reported_once() {
        let queue = JobDispatchQueue::new();
        queue.enqueue(vec![job(Uuid::new_v4(), 0, &["gpu"])]).unwrap();

        assert!(queue.stale(Duration::from_secs(60)).is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;
        let stale = queue.stale(Duration::from_secs(60));
        assert_eq!(stale.len(), 1);
        assert!(matches!(stale[0], QueueError::AssignmentTimeout { .. }));
        assert!(queue.stale(Duration::from_secs(60)).is_empty());
    }
}
