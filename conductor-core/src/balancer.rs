use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{Move, RebalancePlan, RebalanceReason};

/// An instance eligible to receive work, as seen at snapshot time.
#[derive(Debug, Clone)]
pub struct InstanceLoad {
    pub id: String,
    pub capacity_max: u32,
    pub performance_score: f64,
}

/// One live assignment row. The owner may be an instance that is no longer
/// eligible; the planner treats those streams as displaced.
#[derive(Debug, Clone)]
pub struct AssignmentSlot {
    pub stream_id: i64,
    pub instance_id: String,
    pub assigned_at: DateTime<Utc>,
}

/// Immutable input to the planner. The balancer owns no state: it consumes a
/// snapshot and emits a plan for the stores to apply.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub instances: Vec<InstanceLoad>,
    pub assignments: Vec<AssignmentSlot>,
    pub catalog: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImbalanceReport {
    pub imbalanced: bool,
    pub load_factor_stddev: f64,
    pub stream_spread: u32,
    pub detail: String,
}

/// Target stream count per instance: capacity-proportional shares of the
/// catalog, rounded down, with the leftover handed out one at a time to the
/// best-performing instances (capacity permitting). Deterministic: ties on
/// performance break by ascending id.
pub fn compute_targets(snapshot: &Snapshot) -> BTreeMap<String, usize> {
    let mut targets: BTreeMap<String, usize> = BTreeMap::new();
    let cap_total: u64 = snapshot.instances.iter().map(|i| i.capacity_max as u64).sum();
    if cap_total == 0 || snapshot.instances.is_empty() {
        return targets;
    }

    let n = snapshot.catalog.len() as u64;
    let mut assigned_total: u64 = 0;
    for inst in &snapshot.instances {
        let share = (inst.capacity_max as u64 * n) / cap_total;
        let share = share.min(inst.capacity_max as u64);
        targets.insert(inst.id.clone(), share as usize);
        assigned_total += share;
    }

    // Rounding residuals go to the instances with the highest performance
    // score, skipping any already at capacity.
    let mut order: Vec<&InstanceLoad> = snapshot.instances.iter().collect();
    order.sort_by(|a, b| {
        b.performance_score
            .partial_cmp(&a.performance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut remainder = n.saturating_sub(assigned_total);
    while remainder > 0 {
        let mut gave_any = false;
        for inst in &order {
            if remainder == 0 {
                break;
            }
            let t = targets.get_mut(&inst.id).expect("target exists");
            if (*t as u64) < inst.capacity_max as u64 {
                *t += 1;
                remainder -= 1;
                gave_any = true;
            }
        }
        if !gave_any {
            // Fleet capacity is below catalog size; the rest stays uncovered.
            break;
        }
    }

    targets
}

fn loads(snapshot: &Snapshot) -> HashMap<String, usize> {
    let eligible: HashSet<&str> = snapshot.instances.iter().map(|i| i.id.as_str()).collect();
    let mut loads: HashMap<String, usize> =
        snapshot.instances.iter().map(|i| (i.id.clone(), 0)).collect();
    for a in &snapshot.assignments {
        if eligible.contains(a.instance_id.as_str()) {
            *loads.get_mut(&a.instance_id).expect("eligible") += 1;
        }
    }
    loads
}

/// Drift detection per the two criteria: load-factor dispersion, or an
/// absolute stream-count spread that capacity differences don't explain.
pub fn detect_imbalance(
    snapshot: &Snapshot,
    imbalance_threshold: f64,
    max_stream_difference: u32,
) -> ImbalanceReport {
    let balanced = |detail: &str| ImbalanceReport {
        imbalanced: false,
        load_factor_stddev: 0.0,
        stream_spread: 0,
        detail: detail.to_string(),
    };

    if snapshot.instances.len() < 2 {
        return balanced("fewer than two eligible instances");
    }

    let loads = loads(snapshot);
    let targets = compute_targets(snapshot);

    let factors: Vec<f64> = snapshot
        .instances
        .iter()
        .filter(|i| i.capacity_max > 0)
        .map(|i| loads[&i.id] as f64 / i.capacity_max as f64)
        .collect();
    if factors.is_empty() {
        return balanced("no instance has usable capacity");
    }
    let mean = factors.iter().sum::<f64>() / factors.len() as f64;
    let variance = factors.iter().map(|f| (f - mean).powi(2)).sum::<f64>() / factors.len() as f64;
    let stddev = variance.sqrt();

    let max_load = snapshot.instances.iter().map(|i| loads[&i.id]).max().unwrap_or(0);
    let min_load = snapshot.instances.iter().map(|i| loads[&i.id]).min().unwrap_or(0);
    let spread = (max_load - min_load) as u32;

    // A spread is only actionable if someone actually sits above their
    // capacity-derived target; otherwise the spread is the distribution
    // working as intended.
    let above_target = snapshot
        .instances
        .iter()
        .any(|i| loads[&i.id] > targets.get(&i.id).copied().unwrap_or(0));

    let imbalanced_by_stddev = stddev > imbalance_threshold;
    let imbalanced_by_spread = spread > max_stream_difference && above_target;

    ImbalanceReport {
        imbalanced: imbalanced_by_stddev || imbalanced_by_spread,
        load_factor_stddev: stddev,
        stream_spread: spread,
        detail: if imbalanced_by_stddev {
            format!("load factor stddev {stddev:.3} above {imbalance_threshold}")
        } else if imbalanced_by_spread {
            format!("stream spread {spread} above {max_stream_difference}")
        } else {
            "balanced".to_string()
        },
    }
}

/// Build the minimal ordered move list that takes the snapshot to its target
/// distribution. Displaced streams (owner missing from the eligible set) and
/// uncovered catalog streams are placed first; then donors shed their excess
/// to receivers. Streams that fit nowhere are left out (capacity shortfall).
pub fn plan(snapshot: &Snapshot, reason: RebalanceReason) -> RebalancePlan {
    let targets = compute_targets(snapshot);
    let mut loads = loads(snapshot);
    let eligible: HashSet<&str> = snapshot.instances.iter().map(|i| i.id.as_str()).collect();
    let perf: HashMap<&str, f64> = snapshot
        .instances
        .iter()
        .map(|i| (i.id.as_str(), i.performance_score))
        .collect();

    let catalog: HashSet<i64> = snapshot.catalog.iter().copied().collect();
    let assigned: HashSet<i64> = snapshot.assignments.iter().map(|a| a.stream_id).collect();

    // Streams needing a home: displaced (dead owner) then never-assigned,
    // each in ascending stream id for stable output.
    let mut to_place: Vec<(i64, Option<String>)> = snapshot
        .assignments
        .iter()
        .filter(|a| !eligible.contains(a.instance_id.as_str()) && catalog.contains(&a.stream_id))
        .map(|a| (a.stream_id, Some(a.instance_id.clone())))
        .collect();
    to_place.sort_by_key(|(id, _)| *id);
    let mut unowned: Vec<i64> = snapshot
        .catalog
        .iter()
        .copied()
        .filter(|id| !assigned.contains(id))
        .collect();
    unowned.sort_unstable();
    to_place.extend(unowned.into_iter().map(|id| (id, None)));

    // Receivers ordered by deficit descending, perf descending, id ascending.
    let mut receivers: Vec<String> = snapshot
        .instances
        .iter()
        .filter(|i| loads[&i.id] < targets.get(&i.id).copied().unwrap_or(0))
        .map(|i| i.id.clone())
        .collect();
    receivers.sort_by(|a, b| {
        let deficit =
            |id: &String| targets.get(id).copied().unwrap_or(0) as i64 - loads[id] as i64;
        deficit(b)
            .cmp(&deficit(a))
            .then_with(|| {
                perf[b.as_str()]
                    .partial_cmp(&perf[a.as_str()])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.cmp(b))
    });

    let mut moves: Vec<Move> = Vec::new();
    let mut receive = |loads: &mut HashMap<String, usize>, stream_id: i64, source: Option<String>| {
        for r in &receivers {
            if loads[r] < targets.get(r).copied().unwrap_or(0) {
                *loads.get_mut(r).expect("receiver") += 1;
                moves.push(Move {
                    stream_id,
                    source,
                    target: r.clone(),
                });
                return true;
            }
        }
        false
    };

    for (stream_id, source) in to_place {
        receive(&mut loads, stream_id, source);
    }

    // Donors ordered by excess descending, perf ascending, id ascending.
    let mut donors: Vec<String> = snapshot
        .instances
        .iter()
        .filter(|i| loads[&i.id] > targets.get(&i.id).copied().unwrap_or(0))
        .map(|i| i.id.clone())
        .collect();
    donors.sort_by(|a, b| {
        let excess = |id: &String| loads[id] as i64 - targets.get(id).copied().unwrap_or(0) as i64;
        excess(b)
            .cmp(&excess(a))
            .then_with(|| {
                perf[a.as_str()]
                    .partial_cmp(&perf[b.as_str()])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.cmp(b))
    });

    for donor in donors {
        let target_count = targets.get(&donor).copied().unwrap_or(0);
        let excess = loads[&donor].saturating_sub(target_count);
        if excess == 0 {
            continue;
        }

        // Move the streams the donor has held the shortest time, breaking
        // ties on the lower stream id.
        let mut held: Vec<&AssignmentSlot> = snapshot
            .assignments
            .iter()
            .filter(|a| a.instance_id == donor && catalog.contains(&a.stream_id))
            .collect();
        held.sort_by(|a, b| {
            b.assigned_at
                .cmp(&a.assigned_at)
                .then_with(|| a.stream_id.cmp(&b.stream_id))
        });

        let mut moved = 0usize;
        for slot in held {
            if moved >= excess {
                break;
            }
            if receive(&mut loads, slot.stream_id, Some(donor.clone())) {
                *loads.get_mut(&donor).expect("donor") -= 1;
                moved += 1;
            } else {
                break;
            }
        }
    }

    RebalancePlan { reason, moves }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn inst(id: &str, cap: u32, perf: f64) -> InstanceLoad {
        InstanceLoad {
            id: id.to_string(),
            capacity_max: cap,
            performance_score: perf,
        }
    }

    fn slot(stream_id: i64, instance: &str, minutes_ago: i64) -> AssignmentSlot {
        AssignmentSlot {
            stream_id,
            instance_id: instance.to_string(),
            assigned_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
                - chrono::Duration::minutes(minutes_ago),
        }
    }

    fn counts(plan: &RebalancePlan) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for m in &plan.moves {
            *counts.entry(m.target.clone()).or_default() += 1;
        }
        counts
    }

    #[test]
    fn fresh_start_distributes_uniformly() {
        // Ten streams, three empty instances of equal capacity.
        let snapshot = Snapshot {
            instances: vec![inst("a", 10, 1.0), inst("b", 10, 1.0), inst("c", 10, 1.0)],
            assignments: vec![],
            catalog: (1..=10).collect(),
        };

        let plan = plan(&snapshot, RebalanceReason::Manual);
        assert_eq!(plan.moves.len(), 10);
        assert!(plan.moves.iter().all(|m| m.source.is_none()));

        let counts = counts(&plan);
        let max = counts.values().max().unwrap();
        let min = counts.values().min().unwrap();
        assert!(max - min <= 1, "spread {counts:?}");
        assert!(counts.values().all(|c| *c == 3 || *c == 4));
    }

    #[test]
    fn planning_is_deterministic() {
        let snapshot = Snapshot {
            instances: vec![inst("a", 10, 0.9), inst("b", 10, 0.8), inst("c", 10, 0.95)],
            assignments: vec![slot(1, "a", 30), slot(2, "a", 20), slot(3, "a", 10)],
            catalog: (1..=9).collect(),
        };
        let first = plan(&snapshot, RebalanceReason::Drift);
        let second = plan(&snapshot, RebalanceReason::Drift);
        assert_eq!(first.moves, second.moves);
    }

    #[test]
    fn balanced_snapshot_produces_empty_plan() {
        // 9 streams over three instances, 3 each: already at target.
        let assignments: Vec<AssignmentSlot> = (1..=9)
            .map(|s| slot(s, ["a", "b", "c"][(s as usize - 1) % 3], s))
            .collect();
        let snapshot = Snapshot {
            instances: vec![inst("a", 10, 1.0), inst("b", 10, 1.0), inst("c", 10, 1.0)],
            assignments,
            catalog: (1..=9).collect(),
        };

        let report = detect_imbalance(&snapshot, 0.15, 3);
        assert!(!report.imbalanced, "{report:?}");
        assert!(plan(&snapshot, RebalanceReason::Drift).is_empty());
    }

    #[test]
    fn lost_instance_redistributes_to_survivors() {
        // b owned 2, 5 and 8 but is no longer eligible.
        let assignments: Vec<AssignmentSlot> = (1..=10)
            .map(|s| slot(s, ["a", "b", "c"][((s - 1) % 3) as usize], s))
            .collect();
        let snapshot = Snapshot {
            instances: vec![inst("a", 10, 1.0), inst("c", 10, 1.0)],
            assignments,
            catalog: (1..=10).collect(),
        };

        let plan = plan(&snapshot, RebalanceReason::LostInstance);
        let displaced: Vec<&Move> = plan
            .moves
            .iter()
            .filter(|m| m.source.as_deref() == Some("b"))
            .collect();
        assert_eq!(displaced.len(), 3);
        assert!(displaced.iter().all(|m| m.target == "a" || m.target == "c"));

        // Post-plan loads stay within one stream of each other.
        let mut loads: HashMap<&str, i64> = HashMap::from([("a", 4), ("c", 3)]);
        for m in &plan.moves {
            if let Some(src) = &m.source {
                if let Some(l) = loads.get_mut(src.as_str()) {
                    *l -= 1;
                }
            }
            *loads.get_mut(m.target.as_str()).unwrap() += 1;
        }
        let max = loads.values().max().unwrap();
        let min = loads.values().min().unwrap();
        assert!(max - min <= 1, "{loads:?}");
    }

    #[test]
    fn capacity_squeeze_leaves_overflow_unassigned() {
        // Twelve streams, two instances of five: ten placed, two missing.
        let snapshot = Snapshot {
            instances: vec![inst("a", 5, 1.0), inst("b", 5, 1.0)],
            assignments: vec![],
            catalog: (1..=12).collect(),
        };

        let plan = plan(&snapshot, RebalanceReason::Manual);
        assert_eq!(plan.moves.len(), 10);
        let counts = counts(&plan);
        assert_eq!(counts["a"], 5);
        assert_eq!(counts["b"], 5);
    }

    #[test]
    fn capacity_explained_spread_is_not_drift() {
        // 16 vs 4 streams is exactly the 20:5 capacity ratio at work.
        let mut assignments = Vec::new();
        for s in 1..=16 {
            assignments.push(slot(s, "big", s));
        }
        for s in 17..=20 {
            assignments.push(slot(s, "small", s));
        }
        let snapshot = Snapshot {
            instances: vec![inst("big", 20, 1.0), inst("small", 5, 1.0)],
            assignments,
            catalog: (1..=20).collect(),
        };

        let report = detect_imbalance(&snapshot, 0.15, 3);
        assert!(!report.imbalanced, "{report:?}");
    }

    #[test]
    fn skewed_load_is_drift() {
        let mut assignments = Vec::new();
        for s in 1..=7 {
            assignments.push(slot(s, "a", s));
        }
        assignments.push(slot(8, "b", 8));
        let snapshot = Snapshot {
            instances: vec![inst("a", 10, 1.0), inst("b", 10, 1.0)],
            assignments,
            catalog: (1..=8).collect(),
        };

        let report = detect_imbalance(&snapshot, 0.15, 3);
        assert!(report.imbalanced, "{report:?}");

        let plan = plan(&snapshot, RebalanceReason::Drift);
        // Donor a sheds three streams to b: 7/1 becomes 4/4.
        assert_eq!(plan.moves.len(), 3);
        assert!(plan.moves.iter().all(|m| m.source.as_deref() == Some("a")));
        assert!(plan.moves.iter().all(|m| m.target == "b"));
    }

    #[test]
    fn donors_shed_shortest_tenure_first() {
        let assignments = vec![
            slot(1, "a", 500), // held longest, should stay
            slot(2, "a", 5),
            slot(3, "a", 1), // held shortest, moves first
            slot(4, "a", 50),
        ];
        let snapshot = Snapshot {
            instances: vec![inst("a", 10, 1.0), inst("b", 10, 1.0)],
            assignments,
            catalog: (1..=4).collect(),
        };

        let plan = plan(&snapshot, RebalanceReason::Drift);
        assert_eq!(plan.moves.len(), 2);
        assert_eq!(plan.moves[0].stream_id, 3);
        assert_eq!(plan.moves[1].stream_id, 2);
    }

    #[test]
    fn rounding_residual_goes_to_best_performer() {
        let snapshot = Snapshot {
            instances: vec![inst("slow", 10, 0.4), inst("fast", 10, 0.9)],
            assignments: vec![],
            catalog: (1..=5).collect(),
        };
        let targets = compute_targets(&snapshot);
        assert_eq!(targets["fast"], 3);
        assert_eq!(targets["slow"], 2);
    }

    #[test]
    fn no_instances_means_empty_plan() {
        let snapshot = Snapshot {
            instances: vec![],
            assignments: vec![],
            catalog: (1..=5).collect(),
        };
        assert!(plan(&snapshot, RebalanceReason::Manual).is_empty());
        assert!(compute_targets(&snapshot).is_empty());
    }
}
