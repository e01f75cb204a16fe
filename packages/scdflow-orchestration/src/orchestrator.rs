use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scdflow_storage::Cursor;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::catalog::SinkCatalog;
use crate::config::OrchestratorConfig;
use crate::dag::{TaskDag, TaskKind};
use crate::error::{OrchestratorError, Result};
use crate::job::{
    RetryPolicy, RunLedger, RunProgress, TaskId, TaskRecord, TaskRun, TaskState, TaskStateMachine,
    Tick,
};
use crate::lease::LeaseTable;
use crate::pipeline::{AggregateTask, BatchContext, CommitGuard, MergeTask, TaskHandler};
use crate::services::CoreServices;
use crate::telemetry::task_span;

/// Result of one `trigger` call
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Succeeded(TaskRun),
    /// Permanent failure, cancellation, or attempts exhausted (state is then BLOCKED)
    Failed(TaskRun),
    /// Predecessors have not succeeded for this tick
    Skipped(TaskRun),
    /// Nothing to do: the task already succeeded for this tick
    AlreadySucceeded,
    /// Another worker holds the task for this tick
    InFlight,
}

impl TriggerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerOutcome::Succeeded(_) => "succeeded",
            TriggerOutcome::Failed(_) => "failed",
            TriggerOutcome::Skipped(_) => "skipped",
            TriggerOutcome::AlreadySucceeded => "already_succeeded",
            TriggerOutcome::InFlight => "in_flight",
        }
    }

    pub fn run(&self) -> Option<&TaskRun> {
        match self {
            TriggerOutcome::Succeeded(run)
            | TriggerOutcome::Failed(run)
            | TriggerOutcome::Skipped(run) => Some(run),
            TriggerOutcome::AlreadySucceeded | TriggerOutcome::InFlight => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TriggerOutcome::Succeeded(_) | TriggerOutcome::AlreadySucceeded
        )
    }
}

/// Per-task line of a tick report
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub outcome: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<TaskRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub tick: Tick,
    pub tasks: Vec<TaskReport>,
}

impl TickReport {
    pub fn task(&self, task_id: &TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| &t.task_id == task_id)
    }

    pub fn all_succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.state == "succeeded")
    }
}

/// Ledger slice a backfill replays for one dataset (`from` exclusive, `until` inclusive)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub from: u64,
    pub until: Option<u64>,
}

/// Replay a ledger range into a separate catalog
#[derive(Clone)]
pub struct BackfillRequest {
    /// Reusing an id resumes that backfill's cursors
    pub id: String,
    pub tick: Tick,
    pub target: Arc<SinkCatalog>,
    /// Datasets without an entry replay their whole ledger
    pub ranges: HashMap<String, SequenceRange>,
}

impl BackfillRequest {
    pub fn new(id: impl Into<String>, target: Arc<SinkCatalog>) -> Self {
        Self {
            id: id.into(),
            tick: Tick(0),
            target,
            ranges: HashMap::new(),
        }
    }

    pub fn range(mut self, dataset: impl Into<String>, from: u64, until: Option<u64>) -> Self {
        self.ranges.insert(dataset.into(), SequenceRange { from, until });
        self
    }

    pub fn at_tick(mut self, tick: Tick) -> Self {
        self.tick = tick;
        self
    }
}

pub struct BackfillReport {
    pub id: String,
    pub tick_report: TickReport,
    pub runs: Arc<RunLedger>,
    pub target: Arc<SinkCatalog>,
}

impl BackfillReport {
    pub fn succeeded(&self) -> bool {
        self.tick_report.all_succeeded()
    }
}

/// DAG-driven task runner (leases, CAS cursors, retries)
#[derive(Clone)]
pub struct TaskOrchestrator {
    dag: Arc<TaskDag>,
    services: Arc<CoreServices>,
    handlers: HashMap<TaskId, Arc<dyn TaskHandler>>,
    config: OrchestratorConfig,
    batch_size: usize,
    runs: Arc<RunLedger>,
    leases: Arc<LeaseTable>,
    worker_id: String,
    /// Prepended to task ids to form consumer ids
    consumer_prefix: String,
    /// dataset → highest sequence id this orchestrator may read
    read_limits: HashMap<String, u64>,
    cancel: CancellationToken,
}

impl TaskOrchestrator {
    /// Build the DAG and one handler per task from `services.config`
    pub fn new(services: CoreServices) -> Result<Self> {
        let dag = TaskDag::from_config(&services.config)?;

        let handlers = dag
            .task_ids()
            .filter_map(|id| dag.get_task(id))
            .map(|node| {
                let handler: Arc<dyn TaskHandler> = match &node.kind {
                    TaskKind::MergeDimension { dataset } | TaskKind::MergeFacts { dataset } => {
                        Arc::new(MergeTask::new(node.id.clone(), dataset.clone()))
                    }
                    TaskKind::RefreshAggregate {
                        aggregate,
                        fact_dataset,
                    } => Arc::new(AggregateTask::new(
                        node.id.clone(),
                        aggregate.clone(),
                        fact_dataset.clone(),
                    )),
                };
                (node.id.clone(), handler)
            })
            .collect();

        info!("Execution plan:\n{}", dag.execution_plan());

        Ok(Self {
            config: services.config.orchestrator.clone(),
            batch_size: services.config.engine.batch_size,
            dag: Arc::new(dag),
            services: Arc::new(services),
            handlers,
            runs: Arc::new(RunLedger::new()),
            leases: Arc::new(LeaseTable::new()),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            consumer_prefix: String::new(),
            read_limits: HashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Another worker over the same ledger, catalog, run ledger and lease table
    pub fn with_worker_id(&self, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..self.clone()
        }
    }

    /// Replace the handler of an existing task
    pub fn register_handler(&mut self, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let task_id = handler.task_id().clone();
        if self.dag.get_task(&task_id).is_none() {
            return Err(OrchestratorError::TaskNotFound(task_id.to_string()));
        }
        self.handlers.insert(task_id, handler);
        Ok(())
    }

    pub fn dag(&self) -> &TaskDag {
        &self.dag
    }

    pub fn services(&self) -> &CoreServices {
        &self.services
    }

    pub fn runs(&self) -> &RunLedger {
        &self.runs
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Cancels in-flight runs at their next batch boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self, task_id: &TaskId, tick: Tick) -> TaskState {
        self.runs.state(task_id, tick)
    }

    pub fn consumer_id(&self, task_id: &TaskId) -> String {
        format!("{}{}", self.consumer_prefix, task_id)
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Triggering
    // ═══════════════════════════════════════════════════════════════════════

    /// Run `task_id` for `tick`, retrying transient failures with backoff
    pub async fn trigger(&self, task_id: &TaskId, tick: Tick) -> Result<TriggerOutcome> {
        let handler = self
            .handlers
            .get(task_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        let policy = self.policy();
        let ttl = Duration::from_millis(self.config.lease_ttl_ms);

        loop {
            match self.runs.state(task_id, tick) {
                TaskState::Succeeded { .. } => return Ok(TriggerOutcome::AlreadySucceeded),
                TaskState::Scheduled { .. } | TaskState::Running { .. } => {
                    if self.reclaim_expired(task_id, tick) {
                        continue;
                    }
                    return Ok(TriggerOutcome::InFlight);
                }
                TaskState::Blocked { attempts, .. } => {
                    return Err(OrchestratorError::TaskBlocked {
                        task_id: task_id.clone(),
                        tick,
                        attempts,
                    })
                }
                TaskState::Idle | TaskState::Failed { .. } => {}
            }

            let pending: Vec<String> = self
                .dag
                .dependencies(task_id)
                .iter()
                .filter(|dep| !self.runs.state(dep, tick).is_succeeded())
                .map(|dep| dep.to_string())
                .collect();

            if !pending.is_empty() {
                let reason = format!("predecessors not succeeded: {}", pending.join(", "));
                info!("Task {}@{}: skipped ({})", task_id, tick, reason);
                let skipped = self.runs.update(task_id, tick, |record| {
                    TaskStateMachine::new(record, policy).skip(&self.worker_id, reason)?;
                    Ok::<_, OrchestratorError>(record.runs.last().cloned())
                });
                match skipped {
                    Ok(Some(run)) => {
                        #[cfg(feature = "metrics")]
                        crate::metrics::record_run(task_id.as_str(), "skipped");
                        return Ok(TriggerOutcome::Skipped(run));
                    }
                    Ok(None) => continue,
                    Err(OrchestratorError::InvalidStateTransition { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }

            let Some(lease) = self.leases.try_acquire(task_id, tick, &self.worker_id, ttl) else {
                return Ok(TriggerOutcome::InFlight);
            };

            let scheduled = self.runs.update(task_id, tick, |record| {
                let mut sm = TaskStateMachine::new(record, policy);
                let attempt = sm.schedule(&self.worker_id)?;
                sm.start(&self.worker_id, lease.token)?;
                Ok::<_, OrchestratorError>(attempt)
            });
            let attempt = match scheduled {
                Ok(attempt) => attempt,
                Err(e) => {
                    self.leases.release(&lease);
                    match e {
                        // Another worker moved the record between our checks
                        OrchestratorError::InvalidStateTransition { .. } => continue,
                        other => return Err(other),
                    }
                }
            };

            info!(
                "Task {}@{}: attempt {}/{} started on {} (lease token {})",
                task_id, tick, attempt, policy.max_attempts, self.worker_id, lease.token
            );

            let token = lease.token;
            let guard = CommitGuard::new(self.leases.clone(), lease, ttl, self.cancel.clone());
            let mut progress = RunProgress::default();
            let result = self
                .execute_attempt(handler.as_ref(), &guard, &mut progress)
                .instrument(task_span(task_id, tick, &self.worker_id))
                .await;
            guard.release();

            match result {
                Ok(()) => {
                    let run = self.runs.update(task_id, tick, |record| {
                        if !holds_run(record, token) {
                            return Ok(None);
                        }
                        TaskStateMachine::new(record, policy).succeed(&progress)?;
                        Ok::<_, OrchestratorError>(record.runs.last().cloned())
                    })?;
                    let Some(run) = run else {
                        warn!(
                            "Task {}@{}: lease token {} was reclaimed before the run finished, result dropped",
                            task_id, tick, token
                        );
                        return Ok(TriggerOutcome::InFlight);
                    };
                    info!(
                        "Task {}@{}: succeeded - {} batches, {} events applied, cursor {:?} -> {:?}",
                        task_id,
                        tick,
                        progress.batches,
                        progress.events_applied,
                        progress.cursor_before,
                        progress.cursor_after
                    );
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_run(task_id.as_str(), "succeeded");
                    return Ok(TriggerOutcome::Succeeded(run));
                }
                Err(err) => {
                    let failed = self.runs.update(task_id, tick, |record| {
                        if !holds_run(record, token) {
                            return Ok(None);
                        }
                        TaskStateMachine::new(record, policy).fail(&err, &progress)?;
                        Ok::<_, OrchestratorError>(
                            record.runs.last().cloned().map(|run| (record.state.clone(), run)),
                        )
                    })?;
                    let Some((state, run)) = failed else {
                        warn!(
                            "Task {}@{}: lease token {} was reclaimed before the run finished ({})",
                            task_id, tick, token, err
                        );
                        return Ok(TriggerOutcome::InFlight);
                    };

                    #[cfg(feature = "metrics")]
                    crate::metrics::record_run(task_id.as_str(), state.state_name());

                    match state {
                        TaskState::Failed {
                            next_retry_at: Some(_),
                            attempt,
                            ..
                        } if !matches!(err, OrchestratorError::Cancelled) => {
                            let backoff = policy.backoff(attempt);
                            warn!(
                                "Task {}@{}: attempt {} failed ({}), retrying in {:?}",
                                task_id, tick, attempt, err, backoff
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => continue,
                                _ = self.cancel.cancelled() => return Ok(TriggerOutcome::Failed(run)),
                            }
                        }
                        TaskState::Blocked { attempts, .. } => {
                            error!(
                                "Task {}@{}: blocked after {} attempts, last error: {}",
                                task_id, tick, attempts, err
                            );
                            return Ok(TriggerOutcome::Failed(run));
                        }
                        _ => {
                            error!("Task {}@{}: failed: {}", task_id, tick, err);
                            return Ok(TriggerOutcome::Failed(run));
                        }
                    }
                }
            }
        }
    }

    /// Fail an in-flight run whose lease expired or vanished so a new attempt can
    /// take over. `false` while the run's holder still has a live lease.
    fn reclaim_expired(&self, task_id: &TaskId, tick: Tick) -> bool {
        let policy = self.policy();
        let reclaimed = self.runs.update(task_id, tick, |record| {
            let token = match &record.state {
                TaskState::Running { lease_token, .. } => Some(*lease_token),
                TaskState::Scheduled { .. } => None,
                _ => return Ok(None),
            };
            let live = self
                .leases
                .holder(task_id, tick)
                .filter(|lease| !lease.is_expired());
            if live.is_some_and(|lease| token.map_or(true, |t| t == lease.token)) {
                return Ok(None);
            }

            let error = OrchestratorError::LeaseLost {
                task_id: task_id.clone(),
                tick,
                reason: "lease expired before the run finished".to_string(),
            };
            TaskStateMachine::new(record, policy).fail(&error, &RunProgress::default())?;
            Ok::<_, OrchestratorError>(Some(record.state.clone()))
        });

        match reclaimed {
            Ok(Some(state)) => {
                warn!(
                    "Task {}@{}: reclaimed run with expired lease on {} ({})",
                    task_id,
                    tick,
                    self.worker_id,
                    state.state_name()
                );
                #[cfg(feature = "metrics")]
                crate::metrics::record_run(task_id.as_str(), "reclaimed");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Task {}@{}: could not reclaim expired run: {}", task_id, tick, e);
                false
            }
        }
    }

    /// Clear BLOCKED so the next trigger starts over at attempt 1
    pub fn unblock(&self, task_id: &TaskId, tick: Tick) -> Result<()> {
        let policy = self.policy();
        self.runs
            .update(task_id, tick, |record| TaskStateMachine::new(record, policy).unblock())?;
        info!("Task {}@{}: unblocked", task_id, tick);
        Ok(())
    }

    /// Drain the task's ledger in batches until it reaches its read bound
    async fn execute_attempt(
        &self,
        handler: &dyn TaskHandler,
        guard: &CommitGuard,
        progress: &mut RunProgress,
    ) -> Result<()> {
        let services = self.services.as_ref();
        let consumer_id = self.consumer_id(handler.task_id());
        let mut cursor = services.cursors.load(&consumer_id, handler.dataset()).await?;
        progress.cursor_before = Some(cursor.last_sequence_id);
        progress.cursor_after = Some(cursor.last_sequence_id);

        let mut conflicts = 0;
        loop {
            guard.check_cancelled()?;
            match self.process_next_batch(handler, guard, &mut cursor, progress).await {
                Ok(true) => conflicts = 0,
                Ok(false) => break,
                Err(OrchestratorError::MergeConflict { reason, .. })
                    if conflicts < self.config.conflict_retries =>
                {
                    conflicts += 1;
                    warn!(
                        task_id = %handler.task_id(),
                        conflicts,
                        reason = %reason,
                        "Optimistic commit lost, reloading cursor"
                    );
                    cursor = services.cursors.load(&consumer_id, handler.dataset()).await?;
                    progress.cursor_after = Some(cursor.last_sequence_id);
                }
                Err(e) => return Err(e),
            }
        }

        if progress.batches == 0 && handler.runs_on_empty_batch(services) {
            guard.renew()?;
            let ctx = BatchContext {
                services,
                guard,
                cursor: cursor.last_sequence_id,
                as_of: Utc::now(),
            };
            match handler.process_batch(&[], &ctx).await {
                Ok(output) => progress.anomalies += output.anomalies,
                // Another commit already aged the buffer
                Err(OrchestratorError::MergeConflict { reason, .. }) => debug!(
                    task_id = %handler.task_id(),
                    reason = %reason,
                    "Empty batch superseded by a concurrent commit"
                ),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// One batch. `Ok(false)` once there is nothing left to read.
    async fn process_next_batch(
        &self,
        handler: &dyn TaskHandler,
        guard: &CommitGuard,
        cursor: &mut Cursor,
        progress: &mut RunProgress,
    ) -> Result<bool> {
        let services = self.services.as_ref();

        // Output committed but the cursor CAS never happened
        if let Some(committed) = handler.committed_through(services) {
            if committed > cursor.last_sequence_id {
                info!(
                    consumer_id = %cursor.consumer_id,
                    from = cursor.last_sequence_id,
                    to = committed,
                    "Fast-forwarding cursor to committed output"
                );
                *cursor = services.cursors.advance(cursor, committed).await?;
                progress.cursor_after = Some(committed);
            }
        }

        guard.renew()?;

        let mut bound = handler.read_bound(services).await?;
        if let Some(limit) = self.read_limits.get(handler.dataset()) {
            bound = bound.min(*limit);
        }
        if cursor.last_sequence_id >= bound {
            return Ok(false);
        }

        let events = services
            .ledger
            .read_range(handler.dataset(), cursor.last_sequence_id, Some(bound), self.batch_size)
            .collect_all()
            .await?;
        let Some(last) = events.last().map(|e| e.sequence_id) else {
            return Ok(false);
        };

        let ctx = BatchContext {
            services,
            guard,
            cursor: cursor.last_sequence_id,
            as_of: Utc::now(),
        };
        let output = handler.process_batch(&events, &ctx).await?;
        *cursor = services.cursors.advance(cursor, last).await?;

        progress.batches += 1;
        progress.events_read += events.len();
        progress.events_applied += output.events_applied;
        progress.anomalies += output.anomalies;
        progress.cursor_after = Some(last);

        debug!(
            task_id = %handler.task_id(),
            events = events.len(),
            applied = output.events_applied,
            cursor = last,
            "Batch committed"
        );
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ticks
    // ═══════════════════════════════════════════════════════════════════════

    /// Trigger every task for `tick`, phase by phase
    pub async fn run_tick(&self, tick: Tick) -> Result<TickReport> {
        let limiter = Arc::new(Semaphore::new(self.config.max_parallel_tasks.max(1)));
        let mut report = TickReport {
            tick,
            tasks: Vec::with_capacity(self.dag.len()),
        };

        for (phase_idx, group) in self.dag.execution_order().iter().enumerate() {
            info!(
                "Tick {}: Phase {} - {} tasks{}",
                tick,
                phase_idx + 1,
                group.len(),
                if group.len() > 1 { " (parallel)" } else { "" }
            );

            let mut tasks = Vec::with_capacity(group.len());
            for task_id in group {
                let orchestrator = self.clone();
                let limiter = limiter.clone();
                let task_id = task_id.clone();
                tasks.push(tokio::spawn(async move {
                    let _permit = limiter.acquire_owned().await;
                    orchestrator.trigger(&task_id, tick).await
                }));
            }

            let results = futures::future::join_all(tasks).await;

            for (task_id, task_result) in group.iter().zip(results) {
                let entry = match task_result {
                    Ok(Ok(outcome)) => TaskReport {
                        task_id: task_id.clone(),
                        outcome: outcome.as_str().to_string(),
                        state: self.runs.state(task_id, tick).state_name().to_string(),
                        error: outcome.run().and_then(|r| r.error.clone()),
                        run: outcome.run().cloned(),
                    },
                    Ok(Err(e)) => {
                        error!("Tick {}: Task {} failed: {}", tick, task_id, e);
                        TaskReport {
                            task_id: task_id.clone(),
                            outcome: e.reason_code().to_string(),
                            state: self.runs.state(task_id, tick).state_name().to_string(),
                            run: None,
                            error: Some(e.to_string()),
                        }
                    }
                    Err(join_err) => {
                        error!("Tick {}: Task {} panicked: {}", tick, task_id, join_err);
                        self.abandon(task_id, tick, &join_err.to_string());
                        TaskReport {
                            task_id: task_id.clone(),
                            outcome: "panicked".to_string(),
                            state: self.runs.state(task_id, tick).state_name().to_string(),
                            run: None,
                            error: Some(join_err.to_string()),
                        }
                    }
                };
                report.tasks.push(entry);
            }
        }

        Ok(report)
    }

    /// Fail a run whose worker task died without reporting
    fn abandon(&self, task_id: &TaskId, tick: Tick, reason: &str) {
        let policy = self.policy();
        let error = OrchestratorError::Other(anyhow::anyhow!("task panicked: {}", reason));
        let failed = self.runs.update(task_id, tick, |record| {
            let ours = match &record.state {
                TaskState::Running { worker_id, .. } => *worker_id == self.worker_id,
                state => state.is_in_flight(),
            };
            if ours {
                TaskStateMachine::new(record, policy).fail(&error, &RunProgress::default())
            } else {
                Ok(())
            }
        });
        if let Err(e) = failed {
            warn!("Task {}@{}: could not record panic: {}", task_id, tick, e);
        }
        if let Some(lease) = self.leases.holder(task_id, tick) {
            if lease.owner == self.worker_id {
                self.leases.release(&lease);
            }
        }
    }

    /// Run a tick every `interval` until `cancel` fires
    pub async fn run_periodic(&self, interval: Duration, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Periodic scheduler started (interval {:?})", interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Periodic scheduler stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let tick = Tick::from_time(Utc::now(), interval);
                    match self.run_tick(tick).await {
                        Ok(report) if report.all_succeeded() => {
                            debug!("Tick {}: all {} tasks succeeded", tick, report.tasks.len());
                        }
                        Ok(report) => {
                            let pending: Vec<&str> = report
                                .tasks
                                .iter()
                                .filter(|t| t.state != "succeeded")
                                .map(|t| t.task_id.as_str())
                                .collect();
                            warn!("Tick {}: not succeeded: {}", tick, pending.join(", "));
                        }
                        Err(e) => error!("Tick {} failed: {}", tick, e),
                    }
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Backfill
    // ═══════════════════════════════════════════════════════════════════════

    /// Replay ledger ranges through the full DAG into `request.target`.
    ///
    /// Uses its own consumer ids, run ledger and lease table; live cursors and
    /// the live catalog are not touched.
    pub async fn backfill(&self, request: BackfillRequest) -> Result<BackfillReport> {
        if Arc::ptr_eq(&request.target, &self.services.catalog) {
            return Err(OrchestratorError::config(
                "backfill target must not be the live catalog",
            ));
        }

        let services = Arc::new(self.services.with_catalog(request.target.clone()));
        let prefix = format!("backfill:{}:", request.id);

        let mut read_limits = HashMap::new();
        for (dataset, range) in &request.ranges {
            if services.config.dataset(dataset).is_none() {
                return Err(OrchestratorError::UnknownDataset(dataset.clone()));
            }
            if let Some(until) = range.until {
                read_limits.insert(dataset.clone(), until);
            }
        }

        for task_id in self.dag.task_ids() {
            let Some(handler) = self.handlers.get(task_id) else {
                continue;
            };
            if let Some(range) = request.ranges.get(handler.dataset()) {
                let consumer_id = format!("{}{}", prefix, task_id);
                services
                    .cursors
                    .seed(&consumer_id, handler.dataset(), range.from)
                    .await?;
            }
        }

        let runner = Self {
            services,
            runs: Arc::new(RunLedger::new()),
            leases: Arc::new(LeaseTable::new()),
            worker_id: format!("{}-backfill", self.worker_id),
            consumer_prefix: prefix,
            read_limits,
            cancel: self.cancel.child_token(),
            ..self.clone()
        };

        info!(
            "Backfill {}: replaying {} tasks into catalog '{}'",
            request.id,
            self.dag.len(),
            request.target.name()
        );
        let tick_report = runner.run_tick(request.tick).await?;
        info!(
            "Backfill {}: {}",
            request.id,
            if tick_report.all_succeeded() {
                "completed"
            } else {
                "incomplete"
            }
        );

        Ok(BackfillReport {
            id: request.id,
            tick_report,
            runs: runner.runs,
            target: request.target,
        })
    }
}

/// The record is still the run started under `token`
fn holds_run(record: &TaskRecord, token: u64) -> bool {
    matches!(&record.state, TaskState::Running { lease_token, .. } if *lease_token == token)
}
