use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::validation::Violation;

/// Task identifier (`merge_dimension:<ds>`, `merge_facts:<ds>`, `refresh_aggregate:<name>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn merge_dimension(dataset: &str) -> Self {
        Self(format!("merge_dimension:{}", dataset))
    }

    pub fn merge_facts(dataset: &str) -> Self {
        Self(format!("merge_facts:{}", dataset))
    }

    pub fn refresh_aggregate(aggregate: &str) -> Self {
        Self(format!("refresh_aggregate:{}", aggregate))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical schedule slot supplied by the external clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tick(pub u64);

impl Tick {
    /// Tick number of `at` for a fixed schedule interval
    pub fn from_time(at: DateTime<Utc>, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1) as i64;
        Tick((at.timestamp_millis().max(0) / interval_ms) as u64)
    }

    pub fn next(&self) -> Self {
        Tick(self.0 + 1)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// TaskRun status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Skipped => "SKIPPED",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            "SKIPPED" => Ok(TaskStatus::Skipped),
            _ => Err(OrchestratorError::parse(format!("Invalid task status: {}", s))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cursor movement and work done by one attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub cursor_before: Option<u64>,
    pub cursor_after: Option<u64>,
    pub batches: usize,
    pub events_read: usize,
    pub events_applied: usize,
    pub anomalies: usize,
}

/// One attempt of a task for a tick. Never mutated once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub run_id: Uuid,
    pub task_id: TaskId,
    pub tick: Tick,
    /// 1-based; 0 for SKIPPED runs that never dispatched
    pub attempt: u32,
    pub worker_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cursor_before: Option<u64>,
    pub cursor_after: Option<u64>,
    pub events_applied: usize,
    /// Short reason code (`cancelled`, `validation_rejected`, ...)
    pub failure_reason: Option<String>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl TaskRun {
    pub fn pending(task_id: TaskId, tick: Tick, attempt: u32, worker_id: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            task_id,
            tick,
            attempt,
            worker_id: worker_id.to_string(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            cursor_before: None,
            cursor_after: None,
            events_applied: 0,
            failure_reason: None,
            error: None,
            violations: Vec::new(),
        }
    }

    /// Terminal run recorded when predecessors have not succeeded for the tick
    pub fn skipped(task_id: TaskId, tick: Tick, worker_id: &str, reason: String) -> Self {
        let now = Utc::now();
        Self {
            status: TaskStatus::Skipped,
            ended_at: Some(now),
            failure_reason: Some("predecessors_pending".to_string()),
            error: Some(reason),
            ..Self::pending(task_id, tick, 0, worker_id)
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    fn apply_progress(&mut self, progress: &RunProgress) {
        self.cursor_before = progress.cursor_before;
        self.cursor_after = progress.cursor_after;
        self.events_applied = progress.events_applied;
    }
}

/// Task state per tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Scheduled {
        scheduled_at: DateTime<Utc>,
        attempt: u32,
    },
    Running {
        started_at: DateTime<Utc>,
        attempt: u32,
        worker_id: String,
        lease_token: u64,
    },
    Succeeded {
        completed_at: DateTime<Utc>,
        attempt: u32,
    },
    Failed {
        failed_at: DateTime<Utc>,
        attempt: u32,
        error: String,
        error_category: ErrorCategory,
        next_retry_at: Option<DateTime<Utc>>,
    },
    Blocked {
        blocked_at: DateTime<Utc>,
        attempts: u32,
        last_error: String,
    },
}

impl TaskState {
    pub fn state_name(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Scheduled { .. } => "scheduled",
            TaskState::Running { .. } => "running",
            TaskState::Succeeded { .. } => "succeeded",
            TaskState::Failed { .. } => "failed",
            TaskState::Blocked { .. } => "blocked",
        }
    }

    /// No further attempt will be made without outside intervention
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded { .. } | TaskState::Blocked { .. })
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskState::Scheduled { .. } | TaskState::Running { .. })
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, TaskState::Succeeded { .. })
    }
}

/// Everything known about one (task, tick): current state plus attempt history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub tick: Tick,
    pub state: TaskState,
    pub runs: Vec<TaskRun>,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, tick: Tick) -> Self {
        Self {
            task_id,
            tick,
            state: TaskState::Idle,
            runs: Vec::new(),
        }
    }

    /// Attempts dispatched since the last reset (SKIPPED runs do not count)
    pub fn attempts(&self) -> u32 {
        match &self.state {
            TaskState::Idle => 0,
            TaskState::Scheduled { attempt, .. }
            | TaskState::Running { attempt, .. }
            | TaskState::Succeeded { attempt, .. }
            | TaskState::Failed { attempt, .. } => *attempt,
            TaskState::Blocked { attempts, .. } => *attempts,
        }
    }
}

/// Attempt limits and backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl RetryPolicy {
    /// Exponential backoff before attempt `attempt + 1` (base, 2x base, 4x base, ...)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

impl From<&OrchestratorConfig> for RetryPolicy {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base_ms: config.retry_backoff_ms,
        }
    }
}

/// Task state machine for transitions
///
/// `IDLE → SCHEDULED → RUNNING → {SUCCEEDED, FAILED}`, `FAILED → SCHEDULED` while
/// attempts remain, otherwise `FAILED → BLOCKED`.
pub struct TaskStateMachine<'a> {
    record: &'a mut TaskRecord,
    policy: RetryPolicy,
}

impl<'a> TaskStateMachine<'a> {
    pub fn new(record: &'a mut TaskRecord, policy: RetryPolicy) -> Self {
        Self { record, policy }
    }

    pub fn record(&self) -> &TaskRecord {
        self.record
    }

    fn invalid(&self, to: &str) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.record.state.state_name().to_string(),
            to: to.to_string(),
        }
    }

    /// Transition: IDLE | FAILED → SCHEDULED. Creates a PENDING run; returns its attempt.
    pub fn schedule(&mut self, worker_id: &str) -> Result<u32> {
        let attempt = match &self.record.state {
            TaskState::Idle => 1,
            TaskState::Failed { attempt, .. } if *attempt < self.policy.max_attempts => {
                attempt + 1
            }
            TaskState::Failed { attempt, .. } | TaskState::Blocked { attempts: attempt, .. } => {
                return Err(OrchestratorError::TaskBlocked {
                    task_id: self.record.task_id.clone(),
                    tick: self.record.tick,
                    attempts: *attempt,
                })
            }
            _ => return Err(self.invalid("scheduled")),
        };

        self.record.state = TaskState::Scheduled {
            scheduled_at: Utc::now(),
            attempt,
        };
        self.record.runs.push(TaskRun::pending(
            self.record.task_id.clone(),
            self.record.tick,
            attempt,
            worker_id,
        ));
        Ok(attempt)
    }

    /// Transition: SCHEDULED → RUNNING
    pub fn start(&mut self, worker_id: &str, lease_token: u64) -> Result<()> {
        match &self.record.state {
            TaskState::Scheduled { attempt, .. } => {
                let now = Utc::now();
                let attempt = *attempt;
                self.record.state = TaskState::Running {
                    started_at: now,
                    attempt,
                    worker_id: worker_id.to_string(),
                    lease_token,
                };
                if let Some(run) = self.current_run() {
                    run.status = TaskStatus::Running;
                    run.started_at = Some(now);
                    run.worker_id = worker_id.to_string();
                }
                Ok(())
            }
            _ => Err(self.invalid("running")),
        }
    }

    /// Transition: RUNNING → SUCCEEDED
    pub fn succeed(&mut self, progress: &RunProgress) -> Result<()> {
        match &self.record.state {
            TaskState::Running { attempt, .. } => {
                let now = Utc::now();
                let attempt = *attempt;
                self.record.state = TaskState::Succeeded {
                    completed_at: now,
                    attempt,
                };
                if let Some(run) = self.current_run() {
                    run.status = TaskStatus::Succeeded;
                    run.ended_at = Some(now);
                    run.apply_progress(progress);
                }
                Ok(())
            }
            _ => Err(self.invalid("succeeded")),
        }
    }

    /// Transition: SCHEDULED | RUNNING → FAILED, or BLOCKED when no attempts remain
    pub fn fail(&mut self, error: &OrchestratorError, progress: &RunProgress) -> Result<()> {
        let attempt = match &self.record.state {
            TaskState::Scheduled { attempt, .. } | TaskState::Running { attempt, .. } => *attempt,
            _ => return Err(self.invalid("failed")),
        };

        let now = Utc::now();
        let category = error.category();
        let message = error.to_string();

        if let Some(run) = self.current_run() {
            run.status = TaskStatus::Failed;
            run.started_at.get_or_insert(now);
            run.ended_at = Some(now);
            run.failure_reason = Some(error.reason_code().to_string());
            run.error = Some(message.clone());
            run.violations = error.violations().to_vec();
            run.apply_progress(progress);
        }

        if attempt >= self.policy.max_attempts {
            self.record.state = TaskState::Blocked {
                blocked_at: now,
                attempts: attempt,
                last_error: message,
            };
            return Ok(());
        }

        let next_retry_at = if category.is_retryable() {
            chrono::Duration::from_std(self.policy.backoff(attempt))
                .ok()
                .map(|backoff| now + backoff)
        } else {
            None
        };

        self.record.state = TaskState::Failed {
            failed_at: now,
            attempt,
            error: message,
            error_category: category,
            next_retry_at,
        };
        Ok(())
    }

    /// Transition: BLOCKED → IDLE (attempt counter restarts)
    pub fn unblock(&mut self) -> Result<()> {
        match &self.record.state {
            TaskState::Blocked { .. } => {
                self.record.state = TaskState::Idle;
                Ok(())
            }
            _ => Err(self.invalid("idle (unblock)")),
        }
    }

    /// Record a SKIPPED run without leaving IDLE/FAILED
    pub fn skip(&mut self, worker_id: &str, reason: String) -> Result<()> {
        if self.record.state.is_in_flight() || self.record.state.is_terminal() {
            return Err(self.invalid("skipped"));
        }
        self.record.runs.push(TaskRun::skipped(
            self.record.task_id.clone(),
            self.record.tick,
            worker_id,
            reason,
        ));
        Ok(())
    }

    fn current_run(&mut self) -> Option<&mut TaskRun> {
        self.record
            .runs
            .iter_mut()
            .rev()
            .find(|run| !run.status.is_terminal())
    }
}

/// Audit trail of every (task, tick) this orchestrator has seen
#[derive(Debug, Default)]
pub struct RunLedger {
    records: Mutex<BTreeMap<(TaskId, Tick), TaskRecord>>,
}

impl RunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate a record atomically, creating it IDLE on first use
    pub fn update<T>(
        &self,
        task_id: &TaskId,
        tick: Tick,
        f: impl FnOnce(&mut TaskRecord) -> T,
    ) -> T {
        let mut records = self.records.lock();
        let record = records
            .entry((task_id.clone(), tick))
            .or_insert_with(|| TaskRecord::new(task_id.clone(), tick));
        f(record)
    }

    pub fn record(&self, task_id: &TaskId, tick: Tick) -> Option<TaskRecord> {
        self.records.lock().get(&(task_id.clone(), tick)).cloned()
    }

    pub fn state(&self, task_id: &TaskId, tick: Tick) -> TaskState {
        self.records
            .lock()
            .get(&(task_id.clone(), tick))
            .map_or(TaskState::Idle, |r| r.state.clone())
    }

    /// Runs of one (task, tick) in creation order
    pub fn runs(&self, task_id: &TaskId, tick: Tick) -> Vec<TaskRun> {
        self.records
            .lock()
            .get(&(task_id.clone(), tick))
            .map(|r| r.runs.clone())
            .unwrap_or_default()
    }

    /// Every run ordered by (task, tick, creation)
    pub fn all_runs(&self) -> Vec<TaskRun> {
        self.records
            .lock()
            .values()
            .flat_map(|r| r.runs.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
