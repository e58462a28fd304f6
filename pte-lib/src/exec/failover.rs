use rama::telemetry::tracing;
use rand::{RngExt as _, SeedableRng as _, rngs::StdRng};

use crate::workload::FailoverMethod;

/// Current endpoints of a worker, with optional failover of one slot.
///
/// Only the rotating slot is ever replaced: every other endpoint stays
/// in place so fan-out to the remaining targets is unchanged.
#[derive(Debug)]
pub struct TargetSet {
    current: Vec<String>,
    rotation: Option<Rotation>,
}

#[derive(Debug)]
struct Rotation {
    candidates: Vec<String>,
    /// Candidate index of the endpoint in the rotating slot, if it is one.
    cursor: Option<usize>,
    /// Position in the current set that fails over.
    slot: usize,
    picker: Picker,
}

#[derive(Debug)]
enum Picker {
    RoundRobin,
    Random(StdRng),
}

impl TargetSet {
    pub fn fixed(targets: Vec<String>) -> Self {
        Self {
            current: targets,
            rotation: None,
        }
    }

    /// Targets whose rotating slot moves over `candidates` after a failure.
    ///
    /// The rotating slot is the first current target that is a candidate,
    /// or the first target when none is.
    pub fn with_failover(
        targets: Vec<String>,
        candidates: Vec<String>,
        method: FailoverMethod,
    ) -> Self {
        if targets.is_empty() || candidates.is_empty() {
            return Self::fixed(targets);
        }
        let (slot, cursor) = targets
            .iter()
            .enumerate()
            .find_map(|(slot, target)| {
                candidates
                    .iter()
                    .position(|c| c == target)
                    .map(|cursor| (slot, Some(cursor)))
            })
            .unwrap_or((0, None));
        let picker = match method {
            FailoverMethod::RoundRobin => Picker::RoundRobin,
            FailoverMethod::Random => Picker::Random(StdRng::seed_from_u64(rand::random())),
        };
        Self {
            current: targets,
            rotation: Some(Rotation {
                candidates,
                cursor,
                slot,
                picker,
            }),
        }
    }

    pub fn current(&self) -> &[String] {
        &self.current
    }

    /// Replace the rotating slot with the next candidate. A no-op without
    /// failover or when every other candidate is already targeted.
    pub fn fail_over(&mut self) {
        let Some(rotation) = &mut self.rotation else {
            return;
        };
        let slot = rotation.slot;
        let eligible: Vec<usize> = (0..rotation.candidates.len())
            .filter(|&idx| Some(idx) != rotation.cursor)
            .filter(|&idx| {
                let candidate = &rotation.candidates[idx];
                !self
                    .current
                    .iter()
                    .enumerate()
                    .any(|(pos, target)| pos != slot && target == candidate)
            })
            .collect();
        if eligible.is_empty() {
            tracing::debug!(
                failed = %self.current[slot],
                "no other candidate left, keep current endpoint"
            );
            return;
        }

        let next = match &mut rotation.picker {
            Picker::RoundRobin => {
                let start = rotation.cursor.map_or(0, |cursor| cursor + 1);
                eligible
                    .iter()
                    .copied()
                    .find(|&idx| idx >= start)
                    .unwrap_or(eligible[0])
            }
            Picker::Random(rng) => eligible[rng.random_range(0..eligible.len())],
        };
        rotation.cursor = Some(next);
        let next = rotation.candidates[next].clone();
        tracing::debug!(failed = %self.current[slot], next = %next, "fail over");
        self.current[slot] = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn test_fixed_targets_never_move() {
        let mut targets = TargetSet::fixed(peers(&["p0", "p1"]));
        targets.fail_over();
        assert_eq!(targets.current(), peers(&["p0", "p1"]).as_slice());
    }

    #[test]
    fn test_failover_round_robin() {
        let mut targets = TargetSet::with_failover(
            peers(&["p1"]),
            peers(&["p0", "p1", "p2"]),
            FailoverMethod::RoundRobin,
        );
        assert_eq!(targets.current(), peers(&["p1"]).as_slice());

        let mut seen = Vec::new();
        for _ in 0..4 {
            targets.fail_over();
            seen.push(targets.current()[0].clone());
        }
        assert_eq!(seen, peers(&["p2", "p0", "p1", "p2"]));
    }

    #[test]
    fn test_failover_from_unknown_target_starts_at_first_candidate() {
        let mut targets = TargetSet::with_failover(
            peers(&["x"]),
            peers(&["p0", "p1"]),
            FailoverMethod::RoundRobin,
        );
        targets.fail_over();
        assert_eq!(targets.current(), peers(&["p0"]).as_slice());
        targets.fail_over();
        assert_eq!(targets.current(), peers(&["p1"]).as_slice());
    }

    #[test]
    fn test_failover_replaces_only_the_rotating_slot() {
        let mut targets = TargetSet::with_failover(
            peers(&["q0", "p0", "q1", "p1"]),
            peers(&["p0", "p1", "p2"]),
            FailoverMethod::RoundRobin,
        );

        targets.fail_over();
        assert_eq!(targets.current(), peers(&["q0", "p2", "q1", "p1"]).as_slice());

        // p1 is still targeted by another slot
        targets.fail_over();
        assert_eq!(targets.current(), peers(&["q0", "p0", "q1", "p1"]).as_slice());
    }

    #[test]
    fn test_failover_without_spare_candidate_keeps_targets() {
        let mut targets = TargetSet::with_failover(
            peers(&["p0", "p1"]),
            peers(&["p0", "p1"]),
            FailoverMethod::RoundRobin,
        );
        targets.fail_over();
        assert_eq!(targets.current(), peers(&["p0", "p1"]).as_slice());
    }

    #[test]
    fn test_failover_random_picks_another_free_candidate() {
        let candidates = peers(&["p0", "p1", "p2", "p3", "p4"]);
        let mut targets = TargetSet::with_failover(
            peers(&["p0", "p4"]),
            candidates.clone(),
            FailoverMethod::Random,
        );

        let mut previous = targets.current()[0].clone();
        for _ in 0..50 {
            targets.fail_over();
            let current = targets.current();
            assert_eq!(current.len(), 2);
            assert_eq!(current[1], "p4");
            assert_ne!(current[0], previous);
            assert_ne!(current[0], "p4");
            assert!(candidates.contains(&current[0]));
            previous = current[0].clone();
        }
    }

    #[test]
    fn test_empty_targets_are_fixed() {
        let mut targets =
            TargetSet::with_failover(vec![], peers(&["p0"]), FailoverMethod::RoundRobin);
        targets.fail_over();
        assert!(targets.current().is_empty());
    }
}
