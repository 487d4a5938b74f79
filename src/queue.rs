use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::domain::{Period, Target, TargetId, Tier, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Targets with fewer stored rows than this are only partially covered.
    pub completeness_threshold: u64,
    /// Highest tier rank to include (1..=3).
    pub max_tier: u8,
}

impl QueuePolicy {
    pub fn tier_for(&self, stored_rows: u64) -> Tier {
        if stored_rows == 0 {
            Tier::Cold
        } else if stored_rows < self.completeness_threshold {
            Tier::Partial
        } else {
            Tier::Covered
        }
    }
}

/// Orders every outstanding unit: coldest tier first, and within a tier one period
/// per target in turn, most recent period first.
pub fn build_queue(
    targets: &[Target],
    terminal: &HashMap<TargetId, BTreeSet<Period>>,
    observation_counts: &HashMap<TargetId, u64>,
    periods: &[Period],
    policy: &QueuePolicy,
) -> Vec<Unit> {
    let mut recent_first = periods.to_vec();
    recent_first.sort_unstable_by(|a, b| b.cmp(a));
    recent_first.dedup();

    let mut queue = Vec::new();
    for tier in [Tier::Cold, Tier::Partial, Tier::Covered] {
        if tier.rank() > policy.max_tier {
            break;
        }
        let lanes: Vec<(&Target, VecDeque<Period>)> = targets
            .iter()
            .filter(|target| {
                let stored = observation_counts.get(&target.id).copied().unwrap_or(0);
                policy.tier_for(stored) == tier
            })
            .map(|target| {
                let done = terminal.get(&target.id);
                let outstanding: VecDeque<Period> = recent_first
                    .iter()
                    .copied()
                    .filter(|period| !done.is_some_and(|done| done.contains(period)))
                    .collect();
                (target, outstanding)
            })
            .filter(|(_, outstanding)| !outstanding.is_empty())
            .collect();

        round_robin(lanes, tier, &mut queue);
    }
    queue
}

fn round_robin(mut lanes: Vec<(&Target, VecDeque<Period>)>, tier: Tier, queue: &mut Vec<Unit>) {
    while !lanes.is_empty() {
        for (target, periods) in lanes.iter_mut() {
            if let Some(period) = periods.pop_front() {
                queue.push(Unit {
                    target: (*target).clone(),
                    period,
                    tier,
                });
            }
        }
        lanes.retain(|(_, periods)| !periods.is_empty());
    }
}
