//! Scheduler: cron/interval job definitions, distributed
//! locking with fencing tokens, retry with exponential backoff and jitter,
//! a dead-letter queue, a per-job circuit breaker, and the tick driver that
//! composes all of them into a single run of a named job.
//!
//! Locking and fencing tokens are built directly on [`KvStore`] (`set_nx`
//! for mutual exclusion, `incr` for the monotonically increasing token) so
//! any store backing the rest of the pipeline also backs the scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::kv::KvStore;

/// A recurring job's schedule: either a cron expression or a fixed interval.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Cron(String),
    Interval(Duration),
}

/// Relative priority among jobs eligible to run at the same tick. The driver
/// in this module doesn't itself reorder work; priority is exposed for an
/// embedding scheduler loop to pick among multiple due jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
}

/// Retry behavior for a single job.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// A unit of work a job runs. Real jobs implement this against the
/// embedding application's state; [`NoopJobHandler`] is a placeholder used
/// where `default_job_table` needs something to run before the caller
/// supplies a real one.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// Always succeeds immediately. Stand-in handler for jobs whose real
/// implementation lives outside this crate.
pub struct NoopJobHandler;

#[async_trait]
impl JobHandler for NoopJobHandler {
    async fn run(&self) -> Result<()> {
        Ok(())
    }
}

/// Static definition of a scheduled job.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: &'static str,
    pub schedule: ScheduleSpec,
    pub handler: Arc<dyn JobHandler>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub max_retries: u32,
    pub priority: JobPriority,
    /// Whether this job must hold the distributed lock for its whole run
    /// (most jobs); non-exclusive jobs (e.g. health checks) run unlocked.
    pub exclusive: bool,
    pub alert_on_failure: bool,
    pub dead_letter_on_failure: bool,
    pub run_on_startup: bool,
}

fn job(
    name: &'static str,
    schedule: ScheduleSpec,
    max_retries: u32,
    priority: JobPriority,
    exclusive: bool,
    alert_on_failure: bool,
    dead_letter_on_failure: bool,
    run_on_startup: bool,
) -> JobDefinition {
    JobDefinition {
        name,
        schedule,
        handler: Arc::new(NoopJobHandler),
        timeout: Duration::from_secs(60),
        retry: RetryPolicy::default(),
        max_retries,
        priority,
        exclusive,
        alert_on_failure,
        dead_letter_on_failure,
        run_on_startup,
    }
}

/// The 12 recurring jobs named by the scheduler. Each ships with
/// [`NoopJobHandler`]; an embedding application overrides `handler` with
/// its own implementation before registering the table with a [`Scheduler`].
pub fn default_job_table() -> Vec<JobDefinition> {
    vec![
        job(
            "memory-decay",
            ScheduleSpec::Cron("0 0 3 * * *".to_string()),
            3,
            JobPriority::Low,
            true,
            true,
            true,
            false,
        ),
        job(
            "spark-reminders",
            ScheduleSpec::Interval(Duration::from_secs(3600)),
            2,
            JobPriority::Normal,
            true,
            false,
            true,
            false,
        ),
        job(
            "goal-deadline-checkins",
            ScheduleSpec::Cron("0 0 9 * * *".to_string()),
            3,
            JobPriority::Normal,
            true,
            false,
            true,
            false,
        ),
        job(
            "session-cleanup",
            ScheduleSpec::Interval(Duration::from_secs(6 * 3600)),
            2,
            JobPriority::Low,
            true,
            false,
            true,
            false,
        ),
        job(
            "conversation-cleanup",
            ScheduleSpec::Cron("0 0 4 * * 0".to_string()),
            2,
            JobPriority::Low,
            true,
            false,
            true,
            false,
        ),
        job(
            "expired-tokens-cleanup",
            ScheduleSpec::Interval(Duration::from_secs(3600)),
            3,
            JobPriority::Normal,
            true,
            false,
            true,
            true,
        ),
        job(
            "metrics-aggregation",
            ScheduleSpec::Interval(Duration::from_secs(300)),
            1,
            JobPriority::Low,
            false,
            false,
            false,
            false,
        ),
        job(
            "health-check",
            ScheduleSpec::Interval(Duration::from_secs(60)),
            1,
            JobPriority::High,
            false,
            true,
            false,
            true,
        ),
        job(
            "daily-curriculum-generation",
            ScheduleSpec::Cron("0 0 0 * * *".to_string()),
            3,
            JobPriority::Normal,
            true,
            true,
            true,
            false,
        ),
        job(
            "reminder-escalation",
            ScheduleSpec::Interval(Duration::from_secs(3 * 3600)),
            2,
            JobPriority::High,
            true,
            true,
            true,
            false,
        ),
        job(
            "day-end-reconciliation",
            ScheduleSpec::Cron("0 0 23 * * *".to_string()),
            3,
            JobPriority::High,
            true,
            true,
            true,
            false,
        ),
        job(
            "retention-enforcement",
            ScheduleSpec::Cron("0 0 3 * * *".to_string()),
            3,
            JobPriority::Normal,
            true,
            true,
            true,
            false,
        ),
    ]
}

/// Validate a job's cron expression eagerly so misconfiguration is caught at
/// startup rather than at first fire.
pub fn validate_schedule(spec: &ScheduleSpec) -> Result<()> {
    match spec {
        ScheduleSpec::Cron(expr) => Schedule::from_str(expr)
            .map(|_| ())
            .map_err(|e| Error::configuration(format!("invalid cron expression '{expr}': {e}"))),
        ScheduleSpec::Interval(d) => {
            if d.as_millis() == 0 {
                Err(Error::configuration("interval must be non-zero"))
            } else {
                Ok(())
            }
        }
    }
}

/// A held distributed lock with a monotonically increasing fencing token.
/// Callers must include `fencing_token` in any side effect so a stale
/// holder (e.g. after a lock timeout) cannot clobber a newer holder's work.
#[derive(Debug, Clone)]
pub struct JobLockHandle {
    pub job_name: String,
    pub fencing_token: i64,
}

/// Acquires/releases per-job locks with fencing tokens on a [`KvStore`].
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    lock_ttl_seconds: u64,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>, lock_ttl_seconds: u64) -> Self {
        Self { kv, lock_ttl_seconds }
    }

    fn lock_key(job_name: &str) -> String {
        format!("scheduler:lock:{job_name}")
    }

    fn fence_key(job_name: &str) -> String {
        format!("scheduler:fence:{job_name}")
    }

    /// Attempt to acquire the lock for `job_name`. Returns `None` if another
    /// runner currently holds it.
    pub async fn try_acquire(&self, job_name: &str) -> Result<Option<JobLockHandle>> {
        let fencing_token = self.kv.incr(&Self::fence_key(job_name)).await?;
        let acquired = self
            .kv
            .set_nx(&Self::lock_key(job_name), &fencing_token.to_string(), self.lock_ttl_seconds)
            .await?;

        if acquired {
            Ok(Some(JobLockHandle {
                job_name: job_name.to_string(),
                fencing_token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Release a held lock, only if it is still this handle's own token.
    pub async fn release(&self, handle: &JobLockHandle) -> Result<()> {
        let expected = handle.fencing_token.to_string();
        self.kv.cas_delete(&Self::lock_key(&handle.job_name), &expected).await?;
        Ok(())
    }
}

/// Circuit breaker state for a job that has been failing repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<std::time::Instant>,
}

/// Per-job circuit breaker: opens after `failure_threshold` consecutive
/// failures, and half-opens for a single trial run after `reset_after`.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_after: Duration,
    jobs: RwLock<HashMap<String, CircuitBreakerState>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_after: Duration) -> Self {
        Self {
            failure_threshold,
            reset_after,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Whether `job_name` is currently allowed to run.
    pub fn allow(&self, job_name: &str) -> bool {
        let mut jobs = self.jobs.write();
        let entry = jobs.entry(job_name.to_string()).or_insert(CircuitBreakerState {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        });

        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if entry.opened_at.map(|at| at.elapsed() >= self.reset_after).unwrap_or(false) {
                    entry.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self, job_name: &str) {
        let mut jobs = self.jobs.write();
        if let Some(entry) = jobs.get_mut(job_name) {
            entry.state = CircuitState::Closed;
            entry.consecutive_failures = 0;
            entry.opened_at = None;
        }
    }

    pub fn record_failure(&self, job_name: &str) {
        let mut jobs = self.jobs.write();
        let entry = jobs.entry(job_name.to_string()).or_insert(CircuitBreakerState {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        });
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.failure_threshold {
            entry.state = CircuitState::Open;
            entry.opened_at = Some(std::time::Instant::now());
        }
    }

    pub fn state_of(&self, job_name: &str) -> CircuitState {
        self.jobs
            .read()
            .get(job_name)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }
}

/// A job that exhausted its retries and was moved to the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_name: String,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: chrono::DateTime<Utc>,
}

/// Append-only dead-letter queue backed by a [`KvStore`] sorted set.
pub struct DeadLetterQueue {
    kv: Arc<dyn KvStore>,
}

impl DeadLetterQueue {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    const INDEX_KEY: &'static str = "scheduler:dead_letter";

    pub async fn push(&self, entry: DeadLetterEntry) -> Result<()> {
        let key = format!("scheduler:dead_letter:{}:{}", entry.job_name, entry.failed_at.timestamp_millis());
        let serialized = serde_json::to_string(&entry)?;
        self.kv.set(&key, &serialized, Some(30 * 86_400)).await?;
        self.kv.zadd(Self::INDEX_KEY, entry.failed_at.timestamp_millis() as f64, &key).await?;
        Ok(())
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<String>> {
        self.kv.zrevrange(Self::INDEX_KEY, 0, limit - 1).await
    }
}

/// Compute a retry delay with full exponential backoff and jitter.
pub fn backoff_with_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempt.min(20));
    let capped = exp.min(max.as_millis());
    let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
    Duration::from_millis(jittered as u64)
}

/// Compute a retry delay from a job's own [`RetryPolicy`]: exponential with
/// a configurable multiplier, capped at `max_delay`, optionally jittered.
/// `attempt` is 1-based (the delay before the 1st retry, not the 1st call).
fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let scaled = policy.initial_delay.as_millis() as f64 * policy.backoff_multiplier.powi(exponent);
    let capped = scaled.min(policy.max_delay.as_millis() as f64).max(0.0);
    if policy.jitter {
        let upper = capped.max(1.0);
        Duration::from_millis(rand::thread_rng().gen_range(0.0..=upper) as u64)
    } else {
        Duration::from_millis(capped as u64)
    }
}

/// Outcome of running a single job at a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    SkippedLockHeld,
    SkippedCircuitOpen,
    DeadLettered,
}

/// Composes locking, the circuit breaker, retry-with-backoff, and the
/// dead-letter queue into the per-tick job-run algorithm: check the
/// breaker, acquire the job's lock if it's exclusive, run the handler under
/// a timeout with retries, record the outcome, and always release the lock.
pub struct Scheduler {
    kv: Arc<dyn KvStore>,
    breaker: CircuitBreaker,
    dead_letters: DeadLetterQueue,
    jobs: Vec<JobDefinition>,
    lock_safety_margin: Duration,
}

const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_CIRCUIT_RESET_AFTER: Duration = Duration::from_secs(300);
const DEFAULT_LOCK_SAFETY_MARGIN: Duration = Duration::from_secs(30);

impl Scheduler {
    pub fn new(kv: Arc<dyn KvStore>, jobs: Vec<JobDefinition>) -> Self {
        Self {
            dead_letters: DeadLetterQueue::new(kv.clone()),
            kv,
            breaker: CircuitBreaker::new(DEFAULT_CIRCUIT_FAILURE_THRESHOLD, DEFAULT_CIRCUIT_RESET_AFTER),
            jobs,
            lock_safety_margin: DEFAULT_LOCK_SAFETY_MARGIN,
        }
    }

    pub fn with_lock_safety_margin(mut self, margin: Duration) -> Self {
        self.lock_safety_margin = margin;
        self
    }

    /// Run every named job due at this tick, in the order given. Unknown
    /// names are silently skipped (an embedding cron loop is expected to
    /// only pass names from its own schedule table).
    pub async fn run_tick(&self, names: &[&str]) -> Vec<(String, JobOutcome)> {
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            if let Some(job) = self.jobs.iter().find(|j| j.name == *name) {
                let outcome = self.run_job(job).await;
                results.push((job.name.to_string(), outcome));
            }
        }
        results
    }

    async fn run_job(&self, job: &JobDefinition) -> JobOutcome {
        if !self.breaker.allow(job.name) {
            return JobOutcome::SkippedCircuitOpen;
        }

        let lock = if job.exclusive {
            let lock_ttl = job.timeout.as_secs() + self.lock_safety_margin.as_secs();
            let manager = LockManager::new(self.kv.clone(), lock_ttl);
            match manager.try_acquire(job.name).await {
                Ok(Some(handle)) => Some((manager, handle)),
                Ok(None) => return JobOutcome::SkippedLockHeld,
                Err(_) => return JobOutcome::SkippedLockHeld,
            }
        } else {
            None
        };

        let outcome = self.run_with_retries(job).await;

        if let Some((manager, handle)) = &lock {
            let _ = manager.release(handle).await;
        }

        outcome
    }

    async fn run_with_retries(&self, job: &JobDefinition) -> JobOutcome {
        let mut attempt = 0u32;
        let mut last_error = String::new();

        loop {
            attempt += 1;
            let run = tokio::time::timeout(job.timeout, job.handler.run()).await;

            match run {
                Ok(Ok(())) => {
                    self.breaker.record_success(job.name);
                    return JobOutcome::Succeeded;
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => last_error = format!("job timed out after {:?}", job.timeout),
            }

            if attempt > job.max_retries {
                self.breaker.record_failure(job.name);
                if job.dead_letter_on_failure {
                    let pushed = self
                        .dead_letters
                        .push(DeadLetterEntry {
                            job_name: job.name.to_string(),
                            attempts: attempt,
                            last_error: last_error.clone(),
                            failed_at: Utc::now(),
                        })
                        .await;
                    if pushed.is_ok() {
                        return JobOutcome::DeadLettered;
                    }
                }
                return JobOutcome::Failed;
            }

            tokio::time::sleep(retry_delay(&job.retry, attempt)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_job_table_has_twelve_jobs_with_valid_schedules() {
        let jobs = default_job_table();
        assert_eq!(jobs.len(), 12);
        for job in &jobs {
            validate_schedule(&job.schedule).unwrap_or_else(|e| panic!("{}: {e}", job.name));
        }
    }

    #[tokio::test]
    async fn lock_manager_is_mutually_exclusive_and_fencing_tokens_increase() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let manager = LockManager::new(kv, 60);

        let first = manager.try_acquire("job-a").await.unwrap().unwrap();
        assert!(manager.try_acquire("job-a").await.unwrap().is_none());

        manager.release(&first).await.unwrap();
        let second = manager.try_acquire("job-a").await.unwrap().unwrap();
        assert!(second.fencing_token > first.fencing_token);
    }

    #[test]
    fn circuit_breaker_opens_after_threshold_and_half_opens_after_reset() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(10));
        assert!(breaker.allow("job-b"));
        breaker.record_failure("job-b");
        breaker.record_failure("job-b");
        breaker.record_failure("job-b");
        assert_eq!(breaker.state_of("job-b"), CircuitState::Open);
        assert!(!breaker.allow("job-b"));

        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow("job-b"));
        assert_eq!(breaker.state_of("job-b"), CircuitState::HalfOpen);

        breaker.record_success("job-b");
        assert_eq!(breaker.state_of("job-b"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dead_letter_queue_roundtrips() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let queue = DeadLetterQueue::new(kv);
        queue
            .push(DeadLetterEntry {
                job_name: "memory-decay".to_string(),
                attempts: 3,
                last_error: "store unavailable".to_string(),
                failed_at: Utc::now(),
            })
            .await
            .unwrap();
        let recent = queue.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn backoff_grows_with_attempt_but_stays_capped() {
        let max = Duration::from_secs(60);
        for attempt in 0..10 {
            let delay = backoff_with_jitter(attempt, Duration::from_millis(100), max);
            assert!(delay <= max);
        }
    }

    #[test]
    fn retry_delay_grows_with_attempt_but_stays_capped() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(retry_delay(&policy, 1), Duration::from_millis(10));
        assert_eq!(retry_delay(&policy, 2), Duration::from_millis(20));
        assert_eq!(retry_delay(&policy, 10), Duration::from_millis(200));
    }

    struct CountingHandler {
        calls: AtomicU32,
        fail_until: u32,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn run(&self) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_until {
                Err(Error::internal("synthetic failure"))
            } else {
                Ok(())
            }
        }
    }

    fn test_job(name: &'static str, handler: Arc<dyn JobHandler>, max_retries: u32) -> JobDefinition {
        JobDefinition {
            name,
            schedule: ScheduleSpec::Interval(Duration::from_secs(60)),
            handler,
            timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                jitter: false,
            },
            max_retries,
            priority: JobPriority::Normal,
            exclusive: true,
            alert_on_failure: false,
            dead_letter_on_failure: true,
            run_on_startup: false,
        }
    }

    #[tokio::test]
    async fn scheduler_runs_job_successfully_and_releases_lock() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let handler = Arc::new(CountingHandler { calls: AtomicU32::new(0), fail_until: 0 });
        let job = test_job("ok-job", handler, 2);
        let scheduler = Scheduler::new(kv.clone(), vec![job]);

        let results = scheduler.run_tick(&["ok-job"]).await;
        assert_eq!(results, vec![("ok-job".to_string(), JobOutcome::Succeeded)]);

        // Lock released: a second tick can acquire it again immediately.
        let second = scheduler.run_tick(&["ok-job"]).await;
        assert_eq!(second, vec![("ok-job".to_string(), JobOutcome::Succeeded)]);
    }

    #[tokio::test]
    async fn scheduler_retries_then_dead_letters_after_max_retries() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let handler = Arc::new(CountingHandler { calls: AtomicU32::new(0), fail_until: 100 });
        let job = test_job("bad-job", handler, 2);
        let scheduler = Scheduler::new(kv.clone(), vec![job]);

        let results = scheduler.run_tick(&["bad-job"]).await;
        assert_eq!(results, vec![("bad-job".to_string(), JobOutcome::DeadLettered)]);

        let dead_letters = DeadLetterQueue::new(kv);
        let recent = dead_letters.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn scheduler_skips_when_circuit_open() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let handler = Arc::new(CountingHandler { calls: AtomicU32::new(0), fail_until: 100 });
        let job = test_job("flaky-job", handler, 0);
        let scheduler = Scheduler::new(kv, vec![job]);

        // Fail enough times to trip the breaker (threshold is 5).
        for _ in 0..DEFAULT_CIRCUIT_FAILURE_THRESHOLD {
            scheduler.run_tick(&["flaky-job"]).await;
        }
        let results = scheduler.run_tick(&["flaky-job"]).await;
        assert_eq!(results, vec![("flaky-job".to_string(), JobOutcome::SkippedCircuitOpen)]);
    }
}
