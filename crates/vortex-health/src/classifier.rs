//! Health classification with hysteresis.
//!
//! Each probe is reduced to a [`Verdict`], and the classifier turns the
//! latest verdict plus the run of previous ones into a [`HealthState`].
//! Downgrades need `failure_threshold` consecutive failing probes and
//! upgrades need `recovery_threshold` consecutive passing probes, so a
//! single lost ping never flips a tunnel.

use std::collections::VecDeque;

use vortex_core::{HealthState, ProbeResult};

use crate::probe::ProbeOutcome;

/// Reduced form of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Interface up, address assigned, peer answers ICMP.
    Pass,
    /// The link is there but traffic does not pass: a routing or
    /// filtering symptom rather than a dead link.
    Partial,
    /// No usable signal, or the probe itself failed.
    Dead,
}

impl Verdict {
    pub fn of(result: &ProbeResult) -> Self {
        if result.interface_up && result.ip_assigned && result.icmp_reachable {
            Verdict::Pass
        } else if result.interface_up && (result.ip_assigned || result.arp_present) {
            Verdict::Partial
        } else {
            Verdict::Dead
        }
    }

    /// Probe errors count as failures, never as abstentions.
    pub fn of_outcome(outcome: &ProbeOutcome) -> Self {
        match outcome {
            Ok(result) => Verdict::of(result),
            Err(_) => Verdict::Dead,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Bounded window of recent verdicts, oldest first.
#[derive(Debug, Clone)]
pub struct ProbeWindow {
    verdicts: VecDeque<Verdict>,
    capacity: usize,
}

impl ProbeWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            verdicts: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, verdict: Verdict) {
        if self.verdicts.len() == self.capacity {
            self.verdicts.pop_front();
        }
        self.verdicts.push_back(verdict);
    }

    pub fn clear(&mut self) {
        self.verdicts.clear();
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    /// Length of the most recent run of verdicts matching `pred`.
    fn trailing(&self, pred: impl Fn(Verdict) -> bool) -> u32 {
        self.verdicts
            .iter()
            .rev()
            .take_while(|v| pred(**v))
            .count() as u32
    }
}

/// Pure classifier: `(current state, latest verdict, window) -> state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthClassifier {
    /// Consecutive failures required before a downgrade (N).
    pub failure_threshold: u32,
    /// Consecutive passes required before an upgrade (M).
    pub recovery_threshold: u32,
}

impl Default for HealthClassifier {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 2,
        }
    }
}

impl HealthClassifier {
    pub fn new(failure_threshold: u32, recovery_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_threshold: recovery_threshold.max(1),
        }
    }

    /// Window size large enough to evaluate both thresholds.
    pub fn window_capacity(&self) -> usize {
        self.failure_threshold.max(self.recovery_threshold) as usize
    }

    /// Classify the latest verdict against `history` (which does not yet
    /// contain it).
    pub fn classify(
        &self,
        current: HealthState,
        latest: Verdict,
        history: &ProbeWindow,
    ) -> HealthState {
        if current == HealthState::Failed {
            return HealthState::Failed;
        }

        if latest.is_pass() {
            let passes = 1 + history.trailing(|v| v.is_pass());
            if passes >= self.recovery_threshold {
                return HealthState::Healthy;
            }
            return match current {
                HealthState::Recovering => HealthState::Unreachable,
                other => other,
            };
        }

        if current == HealthState::Recovering {
            return HealthState::Unreachable;
        }

        let failures = 1 + history.trailing(|v| !v.is_pass());
        if failures < self.failure_threshold {
            return current;
        }
        let dead = if latest == Verdict::Dead {
            1 + history.trailing(|v| v == Verdict::Dead)
        } else {
            0
        };
        if dead >= self.failure_threshold {
            HealthState::Unreachable
        } else {
            HealthState::Degraded
        }
    }

    /// Convenience wrapper classifying a raw probe outcome.
    pub fn classify_outcome(
        &self,
        current: HealthState,
        latest: &ProbeOutcome,
        history: &ProbeWindow,
    ) -> HealthState {
        self.classify(current, Verdict::of_outcome(latest), history)
    }
}
