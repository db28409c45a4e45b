//! `AvailabilityFSM`: the per-interface state machine promoting an interface
//! between available / unknown / unavailable based on per-item success and
//! failure over a configurable grace window.

use poller_common::{
    AvailabilityDelta, AvailabilityDeltaFlags, AvailabilityState, ErrCode, InterfaceAvailability,
    Timespec,
};
use poller_config::AvailabilityConfig;
use tracing::{info, warn};

/// Identifying context used only for the human-readable log lines; has no
/// bearing on the state transition itself.
#[derive(Debug, Clone, Copy)]
pub struct AvailabilityLogContext<'a> {
    pub interface_type: &'a str,
    pub hostname: &'a str,
    pub item_key: &'a str,
}

/// Result of a transition attempt: the new state, whether anything actually
/// changed, and — when changed — the delta to append to the batch buffer.
#[derive(Debug, Clone)]
pub struct Transition {
    pub out: InterfaceAvailability,
    pub changed: bool,
    pub delta: Option<AvailabilityDelta>,
}

impl Transition {
    fn unchanged(out: InterfaceAvailability) -> Self {
        Self { out, changed: false, delta: None }
    }
}

/// Grace-window tunables plus the pure transition functions. Holds no
/// per-interface state — callers pass the current `InterfaceAvailability` in
/// and receive the next one out, so the FSM itself is `Send + Sync` and
/// trivially shared across poller threads.
#[derive(Debug, Clone, Copy)]
pub struct AvailabilityFsm {
    pub unavailable_delay_secs: i64,
    pub unreachable_period_secs: i64,
    pub unreachable_delay_secs: i64,
}

impl AvailabilityFsm {
    pub fn new(unavailable_delay_secs: i64, unreachable_period_secs: i64, unreachable_delay_secs: i64) -> Self {
        Self { unavailable_delay_secs, unreachable_period_secs, unreachable_delay_secs }
    }

    pub fn from_config(config: &AvailabilityConfig) -> Self {
        Self::new(
            config.unavailable_delay_secs,
            config.unreachable_period_secs,
            config.unreachable_delay_secs,
        )
    }

    /// `Activate`. No-op (changed=false) if already `True`.
    pub fn activate(
        &self,
        interfaceid: u64,
        _ts: Timespec,
        current: &InterfaceAvailability,
        ctx: AvailabilityLogContext,
    ) -> Transition {
        if current.available == AvailabilityState::True {
            return Transition::unchanged(current.clone());
        }

        let was_known = current.available != AvailabilityState::Unknown;
        let out = InterfaceAvailability {
            available: AvailabilityState::True,
            error: String::new(),
            errors_from: 0,
            disable_until: 0,
        };

        if was_known {
            info!(interfaceid, host = ctx.hostname, "resuming {} checks on host {}: connection restored", ctx.interface_type, ctx.hostname);
        } else {
            info!(interfaceid, host = ctx.hostname, "enabling {} checks on host {}: interface became available", ctx.interface_type, ctx.hostname);
        }

        let flags = AvailabilityDeltaFlags {
            available: true,
            error: !current.error.is_empty(),
            errors_from: current.errors_from != 0,
            disable_until: current.disable_until != 0,
        };

        Transition {
            delta: Some(AvailabilityDelta {
                interfaceid,
                flags,
                available: out.available,
                error: out.error.clone(),
                errors_from: out.errors_from,
                disable_until: out.disable_until,
            }),
            out,
            changed: true,
        }
    }

    /// `Deactivate`. Three sub-cases driven by the prior `errors_from`.
    pub fn deactivate(
        &self,
        interfaceid: u64,
        ts: Timespec,
        current: &InterfaceAvailability,
        err_msg: &str,
        ctx: AvailabilityLogContext,
    ) -> Transition {
        let mut out = current.clone();
        let error_changed;

        if current.available == AvailabilityState::False {
            out.disable_until = ts.sec + self.unavailable_delay_secs;
            error_changed = current.error != err_msg;
            if error_changed {
                out.error = err_msg.to_string();
            }
        } else if current.errors_from == 0 {
            out.errors_from = ts.sec;
            out.disable_until = ts.sec + self.unreachable_delay_secs;
            out.error = err_msg.to_string();
            error_changed = true;
            warn!(
                interfaceid,
                host = ctx.hostname,
                "{} item {} on host {} failed: first network error, wait for {} seconds",
                ctx.interface_type,
                ctx.item_key,
                ctx.hostname,
                self.unreachable_delay_secs
            );
        } else if ts.sec - current.errors_from < self.unreachable_period_secs {
            out.disable_until = ts.sec + self.unreachable_delay_secs;
            error_changed = current.error != err_msg;
            if error_changed {
                out.error = err_msg.to_string();
            }
            warn!(
                interfaceid,
                host = ctx.hostname,
                "{} item {} on host {} still failing: wait for {} seconds",
                ctx.interface_type,
                ctx.item_key,
                ctx.hostname,
                self.unreachable_delay_secs
            );
        } else {
            out.available = AvailabilityState::False;
            out.disable_until = ts.sec + self.unavailable_delay_secs;
            out.error = err_msg.to_string();
            error_changed = true;
            warn!(
                interfaceid,
                host = ctx.hostname,
                "temporarily disabling {} checks on host {}: interface unavailable",
                ctx.interface_type,
                ctx.hostname
            );
        }

        debug_assert!(out.errors_from == 0 || out.disable_until >= out.errors_from);

        let flags = AvailabilityDeltaFlags {
            available: out.available != current.available,
            error: error_changed,
            errors_from: out.errors_from != current.errors_from,
            disable_until: out.disable_until != current.disable_until,
        };

        if !flags.any() {
            return Transition::unchanged(out);
        }

        Transition {
            delta: Some(AvailabilityDelta {
                interfaceid,
                flags,
                available: out.available,
                error: out.error.clone(),
                errors_from: out.errors_from,
                disable_until: out.disable_until,
            }),
            out,
            changed: true,
        }
    }

    /// `Observe`: convenience wrapper mapping an errcode to
    /// activate/deactivate/no-op.
    pub fn observe(
        &self,
        interfaceid: u64,
        ts: Timespec,
        errcode: ErrCode,
        current: &InterfaceAvailability,
        err_msg: &str,
        ctx: AvailabilityLogContext,
    ) -> Option<Transition> {
        match errcode {
            ErrCode::Success | ErrCode::NotSupported | ErrCode::AgentError => {
                Some(self.activate(interfaceid, ts, current, ctx))
            }
            ErrCode::NetworkError | ErrCode::GatewayError | ErrCode::TimeoutError => {
                Some(self.deactivate(interfaceid, ts, current, err_msg, ctx))
            }
            ErrCode::ConfigError | ErrCode::SignalError => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>() -> AvailabilityLogContext<'a> {
        AvailabilityLogContext { interface_type: "agent", hostname: "web01", item_key: "agent.ping" }
    }

    fn fsm() -> AvailabilityFsm {
        AvailabilityFsm::new(300, 60, 60)
    }

    /// scenario 1: first failure on a previously-available agent interface.
    #[test]
    fn first_failure_sets_errors_from_and_disable_until() {
        let current = InterfaceAvailability {
            available: AvailabilityState::True,
            error: String::new(),
            errors_from: 0,
            disable_until: 0,
        };
        let ts = Timespec::new(1000, 0);
        let t = fsm().deactivate(1, ts, &current, "connection refused", ctx());

        assert!(t.changed);
        assert_eq!(t.out.available, AvailabilityState::True);
        assert_eq!(t.out.errors_from, 1000);
        assert_eq!(t.out.disable_until, 1060);
    }

    /// scenario 2: promotion to unavailable after the grace window elapses.
    #[test]
    fn promotes_to_unavailable_after_grace_window() {
        let current = InterfaceAvailability {
            available: AvailabilityState::True,
            error: "connection refused".into(),
            errors_from: 1000,
            disable_until: 1060,
        };
        let ts = Timespec::new(1200, 0);
        let t = fsm().deactivate(1, ts, &current, "connection refused", ctx());

        assert!(t.changed);
        assert_eq!(t.out.available, AvailabilityState::False);
        assert_eq!(t.out.disable_until, 1500);
    }

    /// scenario 3: recovery resets errors_from/disable_until/error.
    #[test]
    fn recovery_clears_error_state() {
        let current = InterfaceAvailability {
            available: AvailabilityState::False,
            error: "connection refused".into(),
            errors_from: 1000,
            disable_until: 1500,
        };
        let ts = Timespec::new(1800, 0);
        let t = fsm().activate(1, ts, &current, ctx());

        assert!(t.changed);
        assert_eq!(t.out.available, AvailabilityState::True);
        assert_eq!(t.out.errors_from, 0);
        assert_eq!(t.out.disable_until, 0);
        assert_eq!(t.out.error, "");
    }

    /// monotonicity within the grace window — repeated deactivations
    /// before `unreachable_period` elapses must never flip to False.
    #[test]
    fn stays_true_within_grace_window() {
        let fsm = fsm();
        let mut current = InterfaceAvailability {
            available: AvailabilityState::True,
            error: String::new(),
            errors_from: 0,
            disable_until: 0,
        };

        let t1 = fsm.deactivate(1, Timespec::new(1000, 0), &current, "err", ctx());
        current = t1.out;
        assert_eq!(current.available, AvailabilityState::True);

        let t2 = fsm.deactivate(1, Timespec::new(1030, 0), &current, "err", ctx());
        current = t2.out;
        assert_eq!(current.available, AvailabilityState::True);
        assert_eq!(current.disable_until, 1090);
    }

    /// Activate on an already-True interface is a pure no-op.
    #[test]
    fn activate_when_already_true_is_noop() {
        let mut current = InterfaceAvailability::default();
        current.available = AvailabilityState::True;

        let t = fsm().activate(1, Timespec::new(1000, 0), &current, ctx());
        assert!(!t.changed);
        assert!(t.delta.is_none());
    }

    /// `Observe` dispatches ConfigError/SignalError to a no-op.
    #[test]
    fn observe_is_noop_for_config_and_signal_errors() {
        let current = InterfaceAvailability::default();
        let fsm = fsm();
        assert!(fsm
            .observe(1, Timespec::new(1000, 0), ErrCode::ConfigError, &current, "x", ctx())
            .is_none());
        assert!(fsm
            .observe(1, Timespec::new(1000, 0), ErrCode::SignalError, &current, "x", ctx())
            .is_none());
    }

    #[test]
    fn disable_until_never_precedes_errors_from() {
        let current = InterfaceAvailability::default();
        let t = fsm().deactivate(1, Timespec::new(1000, 0), &current, "err", ctx());
        assert!(t.out.disable_until >= t.out.errors_from);
    }
}
