use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::budget::{BudgetLedger, BudgetTracker, CostModel, runs_to_complete};
use crate::catalog::Catalog;
use crate::config::RunConfig;
use crate::domain::{Period, ProgressStatus, ProviderKind, Target, TargetId, Tier, Unit};
use crate::error::BackfillError;
use crate::fetch::{FetchClient, FetchError, Transport};
use crate::normalize::Normalizer;
use crate::providers::Provider;
use crate::queue::{QueuePolicy, build_queue};
use crate::rate_limit::{RateLimiter, Sleeper};
use crate::store::{ProgressSummary, Store};

/// Operator stop request, observed between units.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    QueueDrained,
    BudgetExhausted,
    CircuitBreakerTripped,
    Cancelled,
    StorageFailed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::QueueDrained => "queue drained",
            StopReason::BudgetExhausted => "budget exhausted",
            StopReason::CircuitBreakerTripped => "circuit breaker tripped",
            StopReason::Cancelled => "cancelled",
            StopReason::StorageFailed => "storage failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Completed { observations: usize },
    NoData,
    Failed { error: String },
    RateLimited { error: String },
}

impl UnitOutcome {
    pub fn status(&self) -> ProgressStatus {
        match self {
            UnitOutcome::Completed { .. } => ProgressStatus::Completed,
            UnitOutcome::NoData => ProgressStatus::NoData,
            UnitOutcome::Failed { .. } | UnitOutcome::RateLimited { .. } => ProgressStatus::Failed,
        }
    }
}

/// Published once per attempted unit, after its outcome is recorded.
#[derive(Debug, Clone, Serialize)]
pub struct UnitEvent {
    pub position: usize,
    pub queue_len: usize,
    pub target_id: TargetId,
    pub display_name: String,
    pub period: Period,
    pub tier: Tier,
    pub outcome: UnitOutcome,
    /// Budget charged for this unit; zero when the provider rejected it before serving a page.
    pub charged: f64,
    pub spent: f64,
}

pub trait ProgressSink {
    fn event(&self, event: UnitEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub provider: ProviderKind,
    pub stop_reason: StopReason,
    pub attempted: usize,
    pub completed: usize,
    pub no_data: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub observations_written: usize,
    pub spent: f64,
    pub cap: f64,
    pub queue_len: usize,
    /// Queued targets that got no attempt this run, in catalog order.
    pub untouched_targets: Vec<TargetId>,
    /// Set when the run stopped on a storage failure.
    pub error: Option<String>,
}

/// How far one unit got. A tripped breaker records nothing but may still owe for
/// pages the provider already served.
enum Processed {
    Recorded { outcome: UnitOutcome, charged: f64 },
    CircuitOpen { charged: f64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedUnit {
    pub target_id: TargetId,
    pub display_name: String,
    pub group: String,
    pub period: Period,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierCount {
    pub tier: Tier,
    pub units: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunPlan {
    pub provider: ProviderKind,
    pub targets: usize,
    pub periods: usize,
    pub total_units: usize,
    pub tiers: Vec<TierCount>,
    pub cost_model: CostModel,
    pub cost_per_unit: f64,
    pub total_cost: f64,
    pub budget: f64,
    pub days_to_complete: Option<f64>,
    pub preview: Vec<PlannedUnit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub targets: usize,
    pub total_units: u64,
    pub terminal_units: u64,
    pub percent_done: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub provider: ProviderKind,
    pub first_period: Period,
    pub last_period: Period,
    pub targets: usize,
    pub total_units: u64,
    pub counts: ProgressSummary,
    pub remaining: u64,
    pub percent_done: f64,
    pub cost_per_unit: f64,
    pub budget: f64,
    pub days_remaining: Option<f64>,
    pub groups: Vec<GroupStatus>,
}

pub struct Orchestrator<P: Provider, T: Transport, S: Sleeper + Clone> {
    config: RunConfig,
    targets: Vec<Target>,
    store: Store,
    fetch: FetchClient<P, T, S>,
    limiter: RateLimiter<S>,
    budget: BudgetTracker,
    normalizer: Normalizer,
    cancel: CancelFlag,
}

impl<P: Provider, T: Transport, S: Sleeper + Clone> Orchestrator<P, T, S> {
    pub fn new(
        config: RunConfig,
        catalog: &Catalog,
        store: Store,
        provider: P,
        transport: T,
        sleeper: S,
    ) -> Self {
        let targets = catalog.targets_for(provider.kind());
        let budget = BudgetTracker::new(provider.cost_model());
        let normalizer = Normalizer::for_provider(&provider);
        let limiter = RateLimiter::new(config.rate_limit, sleeper.clone());
        let fetch = FetchClient::new(
            provider,
            transport,
            sleeper,
            config.fetch.clone(),
            config.today,
        );
        Self {
            config,
            targets,
            store,
            fetch,
            limiter,
            budget,
            normalizer,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    fn periods(&self) -> Vec<Period> {
        Period::range_recent_first(self.config.start_year, self.config.today)
    }

    fn queue(&self) -> Result<Vec<Unit>, BackfillError> {
        let terminal = self.store.terminal_periods_by_target()?;
        let counts = self.store.observation_counts()?;
        let policy = QueuePolicy {
            completeness_threshold: self.config.completeness_threshold,
            max_tier: self.config.max_tier,
        };
        Ok(build_queue(
            &self.targets,
            &terminal,
            &counts,
            &self.periods(),
            &policy,
        ))
    }

    /// Drives the queue until it drains, the budget runs out, the provider keeps
    /// refusing, or the operator cancels.
    pub fn run(&mut self, sink: &dyn ProgressSink) -> Result<RunSummary, BackfillError> {
        self.store.register_targets(&self.targets)?;
        let queue = self.queue()?;
        let queue_len = queue.len();
        let mut ledger = BudgetLedger::new(self.config.budget);
        let provider = self.fetch.provider().kind();

        info!(
            provider = %provider,
            targets = self.targets.len(),
            units = queue_len,
            budget = ledger.cap,
            rate_limit_secs = self.limiter.delay().as_secs_f64(),
            "backfill run starting"
        );

        let mut summary = RunSummary {
            provider,
            stop_reason: StopReason::QueueDrained,
            attempted: 0,
            completed: 0,
            no_data: 0,
            failed: 0,
            rate_limited: 0,
            observations_written: 0,
            spent: 0.0,
            cap: ledger.cap,
            queue_len,
            untouched_targets: Vec::new(),
            error: None,
        };
        let mut touched: HashSet<TargetId> = HashSet::new();

        for (index, unit) in queue.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(remaining = queue_len - index, "cancellation requested, stopping");
                summary.stop_reason = StopReason::Cancelled;
                break;
            }

            let cost = self.budget.cost(unit);
            if !self.budget.can_afford(&ledger, cost) {
                info!(
                    spent = ledger.spent,
                    cap = ledger.cap,
                    next_cost = cost,
                    remaining = queue_len - index,
                    "budget exhausted, stopping"
                );
                summary.stop_reason = StopReason::BudgetExhausted;
                break;
            }

            self.limiter.wait_if_needed();
            let processed = match self.process(unit, cost) {
                Ok(processed) => processed,
                Err(err) => {
                    error!(
                        target_id = %unit.target.id,
                        period = %unit.period,
                        error = %err,
                        "storage failed, stopping"
                    );
                    summary.stop_reason = StopReason::StorageFailed;
                    summary.error = Some(err.to_string());
                    break;
                }
            };
            let (outcome, charged) = match processed {
                Processed::Recorded { outcome, charged } => (outcome, charged),
                Processed::CircuitOpen { charged } => {
                    if charged > 0.0 {
                        self.budget.charge(&mut ledger, charged);
                    }
                    summary.stop_reason = StopReason::CircuitBreakerTripped;
                    break;
                }
            };
            if charged > 0.0 {
                self.budget.charge(&mut ledger, charged);
            }

            touched.insert(unit.target.id.clone());
            summary.attempted += 1;
            match &outcome {
                UnitOutcome::Completed { observations } => {
                    summary.completed += 1;
                    summary.observations_written += observations;
                }
                UnitOutcome::NoData => summary.no_data += 1,
                UnitOutcome::Failed { .. } => summary.failed += 1,
                UnitOutcome::RateLimited { .. } => summary.rate_limited += 1,
            }

            sink.event(UnitEvent {
                position: index + 1,
                queue_len,
                target_id: unit.target.id.clone(),
                display_name: unit.target.display_name.clone(),
                period: unit.period,
                tier: unit.tier,
                outcome,
                charged,
                spent: ledger.spent,
            });
        }

        summary.spent = ledger.spent;
        let queued: HashSet<&TargetId> = queue.iter().map(|unit| &unit.target.id).collect();
        summary.untouched_targets = self
            .targets
            .iter()
            .filter(|target| queued.contains(&target.id) && !touched.contains(&target.id))
            .map(|target| target.id.clone())
            .collect();

        info!(
            stop_reason = %summary.stop_reason,
            attempted = summary.attempted,
            completed = summary.completed,
            no_data = summary.no_data,
            failed = summary.failed,
            rate_limited = summary.rate_limited,
            spent = summary.spent,
            "backfill run finished"
        );
        Ok(summary)
    }

    /// Fetches, normalizes and records one unit. Errors are storage failures only.
    fn process(&mut self, unit: &Unit, cost: f64) -> Result<Processed, BackfillError> {
        let target = &unit.target;
        let payload = match self.fetch.fetch(target, unit.period) {
            Ok(payload) => payload,
            Err(FetchError::CircuitOpen { consecutive }) => {
                let pages_served = self.fetch.pages_served();
                warn!(
                    target_id = %target.id,
                    period = %unit.period,
                    consecutive,
                    pages_served,
                    "provider keeps rate limiting, circuit breaker open"
                );
                let charged = if pages_served > 0 { cost } else { 0.0 };
                return Ok(Processed::CircuitOpen { charged });
            }
            Err(err) => {
                let message = err.to_string();
                warn!(target_id = %target.id, period = %unit.period, error = %message, "fetch failed");
                self.store.record_outcome(
                    &target.id,
                    unit.period,
                    ProgressStatus::Failed,
                    0,
                    Some(&message),
                )?;
                // Pages served before a rejection still drew on the provider allowance.
                let charged = if err.charges_budget() || self.fetch.pages_served() > 0 {
                    cost
                } else {
                    0.0
                };
                let outcome = match err {
                    FetchError::RateLimited { .. } => UnitOutcome::RateLimited { error: message },
                    _ => UnitOutcome::Failed { error: message },
                };
                return Ok(Processed::Recorded { outcome, charged });
            }
        };

        let observations =
            match self
                .normalizer
                .normalize(self.fetch.provider(), target, unit.period, &payload)
            {
                Ok(observations) => observations,
                Err(err) => {
                    let message = err.to_string();
                    warn!(target_id = %target.id, period = %unit.period, error = %message, "payload rejected");
                    self.store.record_outcome(
                        &target.id,
                        unit.period,
                        ProgressStatus::Failed,
                        0,
                        Some(&message),
                    )?;
                    return Ok(Processed::Recorded {
                        outcome: UnitOutcome::Failed { error: message },
                        charged: cost,
                    });
                }
            };

        if observations.is_empty() {
            self.store
                .record_outcome(&target.id, unit.period, ProgressStatus::NoData, 0, None)?;
            return Ok(Processed::Recorded {
                outcome: UnitOutcome::NoData,
                charged: cost,
            });
        }

        self.store.persist_unit(
            &target.id,
            unit.period,
            ProgressStatus::Completed,
            &observations,
            None,
        )?;
        Ok(Processed::Recorded {
            outcome: UnitOutcome::Completed {
                observations: observations.len(),
            },
            charged: cost,
        })
    }

    /// Builds the queue and prices it without touching the network.
    pub fn dry_run(&self) -> Result<DryRunPlan, BackfillError> {
        let queue = self.queue()?;
        let cost_per_unit = self.budget.model().unit_cost();
        let total_cost = self.budget.estimate(queue.len());

        let tiers = [Tier::Cold, Tier::Partial, Tier::Covered]
            .into_iter()
            .filter(|tier| tier.rank() <= self.config.max_tier)
            .map(|tier| TierCount {
                tier,
                units: queue.iter().filter(|unit| unit.tier == tier).count(),
            })
            .collect();

        let preview = queue
            .iter()
            .take(self.config.preview_limit)
            .map(|unit| PlannedUnit {
                target_id: unit.target.id.clone(),
                display_name: unit.target.display_name.clone(),
                group: unit.target.group.clone(),
                period: unit.period,
                tier: unit.tier,
            })
            .collect();

        Ok(DryRunPlan {
            provider: self.fetch.provider().kind(),
            targets: self.targets.len(),
            periods: self.periods().len(),
            total_units: queue.len(),
            tiers,
            cost_model: self.budget.model(),
            cost_per_unit,
            total_cost,
            budget: self.config.budget,
            days_to_complete: runs_to_complete(total_cost, self.config.budget),
            preview,
        })
    }

    /// Progress across every target and period in range, read from the store only.
    pub fn status(&self) -> Result<StatusReport, BackfillError> {
        let periods = self.periods();
        let period_count = periods.len() as u64;
        let in_range: HashSet<Period> = periods.iter().copied().collect();
        let group_of: HashMap<&TargetId, &str> = self
            .targets
            .iter()
            .map(|target| (&target.id, target.group.as_str()))
            .collect();

        let mut counts = ProgressSummary::default();
        let mut terminal_by_group: HashMap<&str, u64> = HashMap::new();
        for record in self.store.progress_records()? {
            if !in_range.contains(&record.period) {
                continue;
            }
            let Some(&group) = group_of.get(&record.target_id) else {
                continue;
            };
            counts.add(record.status);
            if record.status.is_terminal() {
                *terminal_by_group.entry(group).or_default() += 1;
            }
        }

        let total_units = self.targets.len() as u64 * period_count;
        let remaining = total_units.saturating_sub(counts.terminal() + counts.failed);
        let cost_per_unit = self.budget.model().unit_cost();
        let outstanding_cost = (remaining + counts.failed) as f64 * cost_per_unit;

        let mut groups: Vec<GroupStatus> = Vec::new();
        for target in &self.targets {
            match groups.iter_mut().find(|group| group.group == target.group) {
                Some(group) => {
                    group.targets += 1;
                    group.total_units += period_count;
                }
                None => groups.push(GroupStatus {
                    group: target.group.clone(),
                    targets: 1,
                    total_units: period_count,
                    terminal_units: 0,
                    percent_done: 0.0,
                }),
            }
        }
        for group in &mut groups {
            group.terminal_units = terminal_by_group
                .get(group.group.as_str())
                .copied()
                .unwrap_or(0);
            group.percent_done = percent(group.terminal_units, group.total_units);
        }

        let first_period = periods.last().copied().unwrap_or(Period::year(self.config.start_year));
        let last_period = periods.first().copied().unwrap_or(first_period);

        Ok(StatusReport {
            provider: self.fetch.provider().kind(),
            first_period,
            last_period,
            targets: self.targets.len(),
            total_units,
            percent_done: percent(counts.terminal(), total_units),
            counts,
            remaining,
            cost_per_unit,
            budget: self.config.budget,
            days_remaining: runs_to_complete(outstanding_cost, self.config.budget),
            groups,
        })
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}
