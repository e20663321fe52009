//! Remediation policy.
//!
//! The planner decides what a supervisor should do about a tunnel given
//! its health state, failure counter, backoff level, and remediation
//! history. It reads no clock and touches no host state: `now` is an
//! input, so identical inputs always produce the identical plan.
//!
//! # Policy
//!
//! ```text
//! Healthy                               -> NoAction, backoff reset
//! Failed | Recovering                   -> NoAction
//! failures < N                          -> NoAction  (not yet confirmed)
//! attempts in retry window >= max       -> EscalateFailed
//! backoff since last attempt pending    -> NoAction
//! no routing fix this episode           -> ApplyRoutingFix
//! routing fix still in cooldown         -> NoAction
//! routing fix cooldown elapsed          -> RestartTunnel
//! ```
//!
//! An episode is the run of failures since the last passing probe. A fix
//! belongs to it while it is newer than that probe and inside the retry
//! window. Each episode gets one fix; a restart waits out the fix
//! cooldown.

use std::time::Duration;

use tracing::debug;

use vortex_core::{HealthState, RemediationAction, RemediationRecord, WatchdogSettings};

/// What the supervisor should do this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationPlan {
    NoAction,
    /// Re-apply rp_filter, forwarding, link flags, and the subnet route.
    ApplyRoutingFix,
    /// Tear down and recreate the tunnel session.
    RestartTunnel,
    /// Stop automated recovery and alert.
    EscalateFailed,
}

impl RemediationPlan {
    /// The record kind for an executed plan, if any.
    pub fn action(&self) -> Option<RemediationAction> {
        match self {
            RemediationPlan::NoAction => None,
            RemediationPlan::ApplyRoutingFix => Some(RemediationAction::RoutingFix),
            RemediationPlan::RestartTunnel => Some(RemediationAction::RestartTunnel),
            RemediationPlan::EscalateFailed => Some(RemediationAction::Escalate),
        }
    }
}

/// A plan plus the backoff level the tunnel should carry afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanDecision {
    pub plan: RemediationPlan,
    pub backoff_level: u32,
}

/// Everything the planner looks at.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub tunnel: &'a str,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub backoff_level: u32,
    /// Unix timestamp of the last passing probe.
    pub last_success_at: Option<u64>,
    /// Remediation history, oldest first.
    pub history: &'a [RemediationRecord],
    /// Unix timestamp (seconds) of this cycle.
    pub now: u64,
}

/// Exponential backoff: 0, base, 2·base, 4·base, … capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn delay(&self, level: u32) -> Duration {
        if level == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(level - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemediationPlanner {
    pub failure_threshold: u32,
    pub max_retries: u32,
    pub retry_window: Duration,
    pub fix_cooldown: Duration,
    pub backoff: BackoffPolicy,
}

impl RemediationPlanner {
    pub fn from_settings(settings: &WatchdogSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            max_retries: settings.max_retries,
            retry_window: settings.retry_window,
            fix_cooldown: settings.fix_cooldown,
            backoff: BackoffPolicy {
                base: settings.backoff_base,
                max: settings.backoff_max,
            },
        }
    }

    /// Remediation attempts (fixes and restarts) inside the retry window.
    pub fn attempts_in_window(&self, history: &[RemediationRecord], now: u64) -> u32 {
        let window = self.retry_window.as_secs();
        history
            .iter()
            .filter(|r| r.action.is_attempt() && now.saturating_sub(r.timestamp) < window)
            .count() as u32
    }

    pub fn plan(&self, input: &PlanInput<'_>) -> PlanDecision {
        let hold = |plan| PlanDecision {
            plan,
            backoff_level: input.backoff_level,
        };

        match input.state {
            HealthState::Healthy => {
                return PlanDecision {
                    plan: RemediationPlan::NoAction,
                    backoff_level: 0,
                };
            }
            HealthState::Failed | HealthState::Recovering => {
                return hold(RemediationPlan::NoAction);
            }
            HealthState::Degraded | HealthState::Unreachable => {}
        }

        if input.consecutive_failures < self.failure_threshold {
            return hold(RemediationPlan::NoAction);
        }

        let attempts = self.attempts_in_window(input.history, input.now);
        if attempts >= self.max_retries {
            debug!(tunnel = %input.tunnel, attempts, "retry budget exhausted");
            return hold(RemediationPlan::EscalateFailed);
        }

        if let Some(last) = input.history.iter().rev().find(|r| r.action.is_attempt()) {
            let wait = self.backoff.delay(input.backoff_level).as_secs();
            let due = last.timestamp.saturating_add(wait);
            if input.now < due {
                debug!(
                    tunnel = %input.tunnel,
                    level = input.backoff_level,
                    remaining = due - input.now,
                    "remediation backing off"
                );
                return hold(RemediationPlan::NoAction);
            }
        }

        let window = self.retry_window.as_secs();
        let episode_fix = input.history.iter().rev().find(|r| {
            r.action == RemediationAction::RoutingFix
                && input.now.saturating_sub(r.timestamp) < window
                && input.last_success_at.is_none_or(|at| r.timestamp >= at)
        });

        let plan = match episode_fix {
            None => RemediationPlan::ApplyRoutingFix,
            Some(fix) => {
                let settles_at = fix.timestamp.saturating_add(self.fix_cooldown.as_secs());
                if input.now < settles_at {
                    debug!(
                        tunnel = %input.tunnel,
                        remaining = settles_at - input.now,
                        "waiting for routing fix to settle"
                    );
                    return hold(RemediationPlan::NoAction);
                }
                RemediationPlan::RestartTunnel
            }
        };

        PlanDecision {
            plan,
            backoff_level: input.backoff_level.saturating_add(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vortex_core::RemediationOutcome;

    fn planner() -> RemediationPlanner {
        RemediationPlanner::from_settings(&WatchdogSettings::default())
    }

    fn record(action: RemediationAction, timestamp: u64, level: u32) -> RemediationRecord {
        RemediationRecord {
            action,
            outcome: RemediationOutcome::Failed("still down".to_string()),
            timestamp,
            backoff_level: level,
        }
    }

    fn input<'a>(
        state: HealthState,
        failures: u32,
        level: u32,
        history: &'a [RemediationRecord],
        now: u64,
    ) -> PlanInput<'a> {
        PlanInput {
            tunnel: "t",
            state,
            consecutive_failures: failures,
            backoff_level: level,
            last_success_at: None,
            history,
            now,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = BackoffPolicy {
            base: Duration::from_secs(10),
            max: Duration::from_secs(300),
        };
        let delays: Vec<u64> = (0..8).map(|l| b.delay(l).as_secs()).collect();
        assert_eq!(delays, vec![0, 10, 20, 40, 80, 160, 300, 300]);
        assert_eq!(b.delay(200), Duration::from_secs(300));
    }

    #[test]
    fn healthy_resets_backoff() {
        let d = planner().plan(&input(HealthState::Healthy, 0, 4, &[], 1000));
        assert_eq!(d.plan, RemediationPlan::NoAction);
        assert_eq!(d.backoff_level, 0);
    }

    #[test]
    fn parked_states_do_nothing() {
        for state in [HealthState::Failed, HealthState::Recovering] {
            let d = planner().plan(&input(state, 10, 3, &[], 1000));
            assert_eq!(d, PlanDecision { plan: RemediationPlan::NoAction, backoff_level: 3 });
        }
    }

    #[test]
    fn unconfirmed_failures_wait() {
        let d = planner().plan(&input(HealthState::Unreachable, 2, 0, &[], 1000));
        assert_eq!(d.plan, RemediationPlan::NoAction);
    }

    #[test]
    fn first_failure_gets_routing_fix() {
        for state in [HealthState::Degraded, HealthState::Unreachable] {
            let d = planner().plan(&input(state, 3, 0, &[], 1000));
            assert_eq!(d.plan, RemediationPlan::ApplyRoutingFix);
            assert_eq!(d.backoff_level, 1);
        }
    }

    #[test]
    fn unreachable_after_fix_restarts_once_cooldown_elapsed() {
        let history = [record(RemediationAction::RoutingFix, 1000, 1)];
        // Backoff (10s) has passed but the fix is still settling.
        for now in [1010, 1060, 1119] {
            let d = planner().plan(&input(HealthState::Unreachable, 5, 1, &history, now));
            assert_eq!(d, PlanDecision { plan: RemediationPlan::NoAction, backoff_level: 1 });
        }

        // Cooldown (2m) elapsed: the fix did not help.
        let d = planner().plan(&input(HealthState::Unreachable, 16, 1, &history, 1120));
        assert_eq!(d.plan, RemediationPlan::RestartTunnel);
        assert_eq!(d.backoff_level, 2);

        let d = planner().plan(&input(HealthState::Unreachable, 20, 1, &history, 1130));
        assert_eq!(d.plan, RemediationPlan::RestartTunnel);
    }

    #[test]
    fn fix_is_not_repeated_within_an_episode() {
        let history = [
            record(RemediationAction::RoutingFix, 1000, 1),
            record(RemediationAction::RestartTunnel, 1120, 2),
        ];
        for state in [HealthState::Degraded, HealthState::Unreachable] {
            let d = planner().plan(&input(state, 30, 2, &history, 1300));
            assert_eq!(d.plan, RemediationPlan::RestartTunnel);
            assert_eq!(d.backoff_level, 3);
        }
    }

    #[test]
    fn degraded_waits_out_fix_cooldown() {
        let history = [record(RemediationAction::RoutingFix, 1000, 1)];
        let d = planner().plan(&input(HealthState::Degraded, 6, 1, &history, 1060));
        assert_eq!(d.plan, RemediationPlan::NoAction);

        let d = planner().plan(&input(HealthState::Degraded, 12, 1, &history, 1120));
        assert_eq!(d.plan, RemediationPlan::RestartTunnel);
    }

    #[test]
    fn passing_probe_starts_a_new_episode() {
        let history = [record(RemediationAction::RoutingFix, 1000, 1)];
        let recovered = PlanInput {
            last_success_at: Some(1050),
            ..input(HealthState::Unreachable, 3, 1, &history, 1200)
        };
        let d = planner().plan(&recovered);
        assert_eq!(d.plan, RemediationPlan::ApplyRoutingFix);

        // A fix newer than the last pass still counts.
        let stale_pass = PlanInput {
            last_success_at: Some(900),
            ..recovered
        };
        assert_eq!(planner().plan(&stale_pass).plan, RemediationPlan::RestartTunnel);
    }

    #[test]
    fn exhausted_budget_escalates() {
        let history: Vec<_> = (0..5)
            .map(|i| record(RemediationAction::RestartTunnel, 1000 + i * 60, i as u32 + 1))
            .collect();
        let d = planner().plan(&input(HealthState::Unreachable, 30, 5, &history, 1300));
        assert_eq!(d.plan, RemediationPlan::EscalateFailed);
        assert_eq!(d.backoff_level, 5);
    }

    #[test]
    fn attempts_outside_window_do_not_count() {
        let history: Vec<_> = (0..5)
            .map(|i| record(RemediationAction::RoutingFix, i * 10, 1))
            .collect();
        let p = planner();
        assert_eq!(p.attempts_in_window(&history, 100), 5);
        assert_eq!(p.attempts_in_window(&history, 10_000), 0);

        let d = p.plan(&input(HealthState::Unreachable, 30, 1, &history, 10_000));
        assert_eq!(d.plan, RemediationPlan::ApplyRoutingFix);
    }

    #[test]
    fn escalation_records_do_not_count_as_attempts() {
        let history = [record(RemediationAction::Escalate, 1000, 3)];
        assert_eq!(planner().attempts_in_window(&history, 1001), 0);
    }

    #[test]
    fn planning_is_deterministic() {
        let history = vec![
            record(RemediationAction::RoutingFix, 1000, 1),
            record(RemediationAction::RestartTunnel, 1030, 2),
        ];
        let p = planner();
        for now in [1000, 1015, 1030, 1050, 1100, 2000] {
            for state in [HealthState::Degraded, HealthState::Unreachable] {
                let i = input(state, 7, 2, &history, now);
                assert_eq!(p.plan(&i), p.plan(&i));
            }
        }
    }

    #[test]
    fn backoff_never_decreases_while_failing() {
        let p = planner();
        let mut history = Vec::new();
        let mut level = 0;
        let mut now = 0;
        for failures in 3..40u32 {
            now += 10;
            let d = p.plan(&input(HealthState::Unreachable, failures, level, &history, now));
            assert!(d.backoff_level >= level);
            if let Some(action) = d.plan.action() {
                history.push(record(action, now, d.backoff_level));
            }
            level = d.backoff_level;
            if d.plan == RemediationPlan::EscalateFailed {
                break;
            }
        }
        assert!(level > 0);
    }
}
