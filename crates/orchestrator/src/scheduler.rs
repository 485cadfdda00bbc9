//! Priority-tiered execution of installation steps.
//!
//! Steps are grouped into tiers. A tier runs to completion, successful or
//! not, before the next one is considered, so every step of tier `T + 1`
//! observes the effects of all steps in tiers `<= T`. Steps within a tier
//! are independent of each other and may run in parallel.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use events::{Event, EventBus};
use futures::future::BoxFuture;
use futures::FutureExt;
use sandbox_core::{ConcurrencyMode, NodeDescriptor};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

type StepFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// One opaque unit of installation work owned by a node.
pub struct ExecutionStep {
    label: String,
    tier: u32,
    node: Arc<NodeDescriptor>,
    action: StepFn,
}

impl ExecutionStep {
    pub fn new<F, Fut>(node: Arc<NodeDescriptor>, tier: u32, label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            tier,
            node,
            action: Box::new(move || action().boxed()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn tier(&self) -> u32 {
        self.tier
    }

    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }
}

impl fmt::Debug for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStep")
            .field("label", &self.label)
            .field("tier", &self.tier)
            .field("node", &self.node.ordinal)
            .finish()
    }
}

/// All steps of one provisioning run, grouped by tier.
///
/// Within a tier steps are kept in node-ordinal order; steps of the same
/// node keep their insertion order.
#[derive(Debug, Default)]
pub struct ExecutionBatch {
    tiers: BTreeMap<u32, Vec<ExecutionStep>>,
}

impl ExecutionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: ExecutionStep) {
        let steps = self.tiers.entry(step.tier).or_default();
        let ordinal = step.node.ordinal;
        let position = steps.partition_point(|s| s.node.ordinal <= ordinal);
        steps.insert(position, step);
    }

    /// Number of steps across all tiers.
    pub fn len(&self) -> usize {
        self.tiers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Tier numbers in execution order.
    pub fn tiers(&self) -> Vec<u32> {
        self.tiers.keys().copied().collect()
    }

    pub fn steps_in(&self, tier: u32) -> &[ExecutionStep] {
        self.tiers.get(&tier).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn into_tiers(self) -> BTreeMap<u32, Vec<ExecutionStep>> {
        self.tiers
    }
}

impl Extend<ExecutionStep> for ExecutionBatch {
    fn extend<I: IntoIterator<Item = ExecutionStep>>(&mut self, iter: I) {
        for step in iter {
            self.push(step);
        }
    }
}

/// A step that did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub tier: u32,
    pub node: u32,
    pub step: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct TierReport {
    pub tier: u32,
    pub steps: usize,
    pub elapsed: Duration,
}

/// Summary of a fully successful schedule.
#[derive(Debug, Clone, Default)]
pub struct ScheduleReport {
    pub tiers: Vec<TierReport>,
}

impl ScheduleReport {
    pub fn total_steps(&self) -> usize {
        self.tiers.iter().map(|t| t.steps).sum()
    }
}

/// Where step progress is reported.
#[derive(Clone)]
struct StepObserver {
    batch_id: Uuid,
    event_bus: Option<EventBus>,
}

impl StepObserver {
    fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }
}

/// Runs an [`ExecutionBatch`] tier by tier.
///
/// On the first tier with a failing step the scheduler lets the rest of
/// that tier finish, then stops and reports every failure of the tier.
/// Later tiers are never started. Steps are not retried or timed out.
///
/// Cancellation is only observed between tiers: a dispatched step always
/// runs to completion.
#[derive(Debug, Clone)]
pub struct ExecutionScheduler {
    mode: ConcurrencyMode,
    max_parallelism: Option<usize>,
    batch_id: Uuid,
    event_bus: Option<EventBus>,
    cancel: CancellationToken,
}

impl ExecutionScheduler {
    pub fn new(mode: ConcurrencyMode) -> Self {
        Self {
            mode,
            max_parallelism: None,
            batch_id: Uuid::nil(),
            event_bus: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Cap the number of steps running at once. `None` runs a whole tier
    /// at once.
    pub fn with_max_parallelism(mut self, max: Option<usize>) -> Self {
        self.max_parallelism = max;
        self
    }

    pub fn with_batch_id(mut self, batch_id: Uuid) -> Self {
        self.batch_id = batch_id;
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Stop before the next tier once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, batch: ExecutionBatch) -> Result<ScheduleReport> {
        let observer = StepObserver {
            batch_id: self.batch_id,
            event_bus: self.event_bus.clone(),
        };
        let mut report = ScheduleReport::default();

        info!(
            mode = self.mode.as_str(),
            tiers = batch.tiers.len(),
            steps = batch.len(),
            "Running execution batch"
        );

        for (tier, steps) in batch.into_tiers() {
            if self.cancel.is_cancelled() {
                warn!(tier, "Batch cancelled, not starting tier");
                return Err(OrchestratorError::Cancelled(format!("tier {}", tier)));
            }

            let count = steps.len();
            let started = Instant::now();
            info!(tier, steps = count, "Starting tier");
            observer.emit(Event::TierStarted {
                batch_id: self.batch_id,
                tier,
                steps: count,
            });

            let failures = match self.mode {
                ConcurrencyMode::Sequential => run_sequential(&observer, tier, steps).await,
                ConcurrencyMode::Concurrent => {
                    run_concurrent(&observer, tier, steps, self.max_parallelism).await
                }
            };

            observer.emit(Event::TierFinished {
                batch_id: self.batch_id,
                tier,
                failures: failures.len(),
            });

            if !failures.is_empty() {
                warn!(tier, failed = failures.len(), "Tier failed, not starting later tiers");
                return Err(OrchestratorError::ExecutionFailure { tier, failures });
            }

            let elapsed = started.elapsed();
            info!(tier, elapsed_ms = elapsed.as_millis() as u64, "Tier completed");
            report.tiers.push(TierReport {
                tier,
                steps: count,
                elapsed,
            });
        }

        Ok(report)
    }
}

async fn run_sequential(
    observer: &StepObserver,
    tier: u32,
    steps: Vec<ExecutionStep>,
) -> Vec<StepFailure> {
    for step in steps {
        // Nothing else is in flight, so the first failure ends the tier.
        if let Err(failure) = run_step(observer, tier, step).await {
            return vec![failure];
        }
    }
    Vec::new()
}

async fn run_concurrent(
    observer: &StepObserver,
    tier: u32,
    steps: Vec<ExecutionStep>,
    max_parallelism: Option<usize>,
) -> Vec<StepFailure> {
    let width = max_parallelism
        .map_or(steps.len(), |max| max.min(steps.len()))
        .max(1);
    debug!(tier, width, "Dispatching tier to worker pool");

    let semaphore = Arc::new(Semaphore::new(width));
    let mut set = JoinSet::new();

    for step in steps {
        let semaphore = Arc::clone(&semaphore);
        let observer = observer.clone();
        let node = step.node.ordinal;
        let label = step.label.clone();
        set.spawn(async move {
            // Hold the permit until the step finishes.
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    return Err(StepFailure {
                        tier,
                        node,
                        step: label,
                        reason: e.to_string(),
                    })
                }
            };
            run_step(&observer, tier, step).await
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => failures.push(failure),
            Err(e) => failures.push(StepFailure {
                tier,
                node: 0,
                step: "<unknown>".to_string(),
                reason: e.to_string(),
            }),
        }
    }

    failures.sort_by(|a, b| a.node.cmp(&b.node).then_with(|| a.step.cmp(&b.step)));
    failures
}

async fn run_step(
    observer: &StepObserver,
    tier: u32,
    step: ExecutionStep,
) -> std::result::Result<(), StepFailure> {
    let ExecutionStep {
        label, node, action, ..
    } = step;
    let ordinal = node.ordinal;

    info!(tier, node = ordinal, step = %label, "Step started");
    observer.emit(Event::StepStarted {
        batch_id: observer.batch_id,
        tier,
        node: ordinal,
        step: label.clone(),
    });

    let started = Instant::now();
    let outcome = std::panic::AssertUnwindSafe(action())
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(OrchestratorError::Panicked(format!("step '{}'", label))));
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let error = outcome.err().map(|e| e.to_string());
    match &error {
        None => info!(tier, node = ordinal, step = %label, elapsed_ms, "Step finished"),
        Some(reason) => warn!(
            tier,
            node = ordinal,
            step = %label,
            elapsed_ms,
            error = %reason,
            "Step failed"
        ),
    }

    observer.emit(Event::StepFinished {
        batch_id: observer.batch_id,
        tier,
        node: ordinal,
        step: label.clone(),
        success: error.is_none(),
        error: error.clone(),
    });

    match error {
        None => Ok(()),
        Some(reason) => Err(StepFailure {
            tier,
            node: ordinal,
            step: label,
            reason,
        }),
    }
}
