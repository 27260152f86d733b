// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Cost admission control and accounting, per masterplan.
//!
//! Two caps: soft warns once per run, hard refuses admission. The admission
//! check is a pure query over the ledger; only `record` mutates. A hard
//! breach is sticky until an operator `reset`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::errors::CostError;
use crate::observability::messages::{CostCapCrossed, StructuredLog};

/// Admission decision for a prospective spend.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Ok,
    /// Projected spend crosses the soft cap; execution proceeds with a warn.
    SoftExceeded { accumulated: f64, soft_cap: f64 },
    /// Projected spend crosses the hard cap, or the cap is already breached.
    HardExceeded { accumulated: f64, hard_cap: f64 },
}

/// What a `record` call crossed, so the caller can emit the right events
/// and persist exactly the violations this call appended.
#[derive(Debug, Clone, Default)]
pub struct RecordOutcome {
    pub accumulated: f64,
    /// True only on the first soft crossing of the run.
    pub crossed_soft: bool,
    pub crossed_hard: bool,
    pub per_atom_exceeded: bool,
    pub new_violations: Vec<CostViolation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Soft,
    Hard,
    PerAtom,
}

/// Append-only record of a cap violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostViolation {
    pub masterplan_id: Uuid,
    pub atom_id: Option<Uuid>,
    pub kind: ViolationKind,
    pub observed: f64,
    pub cap: f64,
    pub ts: DateTime<Utc>,
}

/// Persistable ledger state (violations are appended separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub masterplan_id: Uuid,
    pub accumulated: f64,
    pub soft_cap: f64,
    pub hard_cap: f64,
    pub per_atom_cap: Option<f64>,
    pub alert_fired_soft: bool,
    pub hard_breached: bool,
}

#[derive(Debug)]
struct Ledger {
    accumulated: f64,
    soft_cap: f64,
    hard_cap: f64,
    per_atom_cap: Option<f64>,
    alert_fired_soft: bool,
    hard_breached: bool,
    violations: Vec<CostViolation>,
}

/// Registry of per-masterplan ledgers. Each ledger sits behind its own lock
/// so concurrent masterplans never serialize against each other.
pub struct CostGuardrails {
    default_soft: f64,
    default_hard: f64,
    default_per_atom: Option<f64>,
    ledgers: Mutex<HashMap<Uuid, Arc<Mutex<Ledger>>>>,
}

impl CostGuardrails {
    pub fn new(default_soft: f64, default_hard: f64, default_per_atom: Option<f64>) -> Self {
        Self {
            default_soft,
            default_hard,
            default_per_atom,
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    /// Set caps for a masterplan, creating its ledger if needed.
    ///
    /// Zero caps are legal (they refuse all positive spend); negatives and
    /// `soft > hard` are not.
    pub fn set_limits(
        &self,
        masterplan_id: Uuid,
        soft: f64,
        hard: f64,
        per_atom: Option<f64>,
    ) -> Result<(), CostError> {
        if soft < 0.0 || hard < 0.0 || soft > hard {
            return Err(CostError::InvalidLimits { soft, hard });
        }
        if let Some(cap) = per_atom {
            if cap < 0.0 {
                return Err(CostError::InvalidLimits { soft: cap, hard });
            }
        }
        let ledger = self.ledger(masterplan_id);
        let mut guard = ledger.lock().expect("ledger lock poisoned");
        guard.soft_cap = soft;
        guard.hard_cap = hard;
        guard.per_atom_cap = per_atom;
        Ok(())
    }

    /// Pure admission query: would spending `estimated` cross a cap?
    /// Never mutates the ledger.
    pub fn check_before_execution(&self, masterplan_id: Uuid, estimated: f64) -> Admission {
        let ledger = self.ledger(masterplan_id);
        let guard = ledger.lock().expect("ledger lock poisoned");
        let projected = guard.accumulated + estimated.max(0.0);

        if guard.hard_breached || projected > guard.hard_cap {
            return Admission::HardExceeded {
                accumulated: guard.accumulated,
                hard_cap: guard.hard_cap,
            };
        }
        if projected > guard.soft_cap {
            return Admission::SoftExceeded {
                accumulated: guard.accumulated,
                soft_cap: guard.soft_cap,
            };
        }
        Admission::Ok
    }

    /// Record actual spend. Accumulation is monotonic; negative inputs are
    /// clamped to zero. The first soft crossing fires the alert exactly once;
    /// a hard crossing makes all later admission checks refuse.
    pub fn record(&self, masterplan_id: Uuid, atom_id: Uuid, actual_cost: f64) -> RecordOutcome {
        let ledger = self.ledger(masterplan_id);
        let mut guard = ledger.lock().expect("ledger lock poisoned");
        let spend = actual_cost.max(0.0);
        let before = guard.accumulated;
        guard.accumulated = before + spend;

        let mut outcome = RecordOutcome {
            accumulated: guard.accumulated,
            ..RecordOutcome::default()
        };

        if let Some(cap) = guard.per_atom_cap {
            if spend > cap {
                outcome.per_atom_exceeded = true;
                let v = violation(masterplan_id, Some(atom_id), ViolationKind::PerAtom, spend, cap);
                guard.violations.push(v.clone());
                outcome.new_violations.push(v);
            }
        }

        if !guard.alert_fired_soft && before <= guard.soft_cap && guard.accumulated > guard.soft_cap {
            guard.alert_fired_soft = true;
            outcome.crossed_soft = true;
            let cap = guard.soft_cap;
            let observed = guard.accumulated;
            let v = violation(masterplan_id, Some(atom_id), ViolationKind::Soft, observed, cap);
            guard.violations.push(v.clone());
            outcome.new_violations.push(v);
            CostCapCrossed {
                masterplan_id,
                kind: "soft",
                accumulated: observed,
                cap,
            }
            .log();
        }

        if !guard.hard_breached && guard.accumulated > guard.hard_cap {
            guard.hard_breached = true;
            outcome.crossed_hard = true;
            let cap = guard.hard_cap;
            let observed = guard.accumulated;
            let v = violation(masterplan_id, Some(atom_id), ViolationKind::Hard, observed, cap);
            guard.violations.push(v.clone());
            outcome.new_violations.push(v);
            CostCapCrossed {
                masterplan_id,
                kind: "hard",
                accumulated: observed,
                cap,
            }
            .log();
        }

        outcome
    }

    /// Operator action: clear one ledger, or every ledger.
    pub fn reset(&self, masterplan_id: Option<Uuid>) {
        match masterplan_id {
            Some(id) => {
                self.ledgers
                    .lock()
                    .expect("ledger registry lock poisoned")
                    .remove(&id);
            }
            None => {
                self.ledgers
                    .lock()
                    .expect("ledger registry lock poisoned")
                    .clear();
            }
        }
    }

    pub fn snapshot(&self, masterplan_id: Uuid) -> LedgerSnapshot {
        let ledger = self.ledger(masterplan_id);
        let guard = ledger.lock().expect("ledger lock poisoned");
        LedgerSnapshot {
            masterplan_id,
            accumulated: guard.accumulated,
            soft_cap: guard.soft_cap,
            hard_cap: guard.hard_cap,
            per_atom_cap: guard.per_atom_cap,
            alert_fired_soft: guard.alert_fired_soft,
            hard_breached: guard.hard_breached,
        }
    }

    pub fn violations(&self, masterplan_id: Uuid) -> Vec<CostViolation> {
        let ledger = self.ledger(masterplan_id);
        let guard = ledger.lock().expect("ledger lock poisoned");
        guard.violations.clone()
    }

    fn ledger(&self, masterplan_id: Uuid) -> Arc<Mutex<Ledger>> {
        let mut registry = self.ledgers.lock().expect("ledger registry lock poisoned");
        registry
            .entry(masterplan_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Ledger {
                    accumulated: 0.0,
                    soft_cap: self.default_soft,
                    hard_cap: self.default_hard,
                    per_atom_cap: self.default_per_atom,
                    alert_fired_soft: false,
                    hard_breached: false,
                    violations: Vec::new(),
                }))
            })
            .clone()
    }
}

fn violation(
    masterplan_id: Uuid,
    atom_id: Option<Uuid>,
    kind: ViolationKind,
    observed: f64,
    cap: f64,
) -> CostViolation {
    CostViolation {
        masterplan_id,
        atom_id,
        kind,
        observed,
        cap,
        ts: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrails() -> CostGuardrails {
        CostGuardrails::new(50.0, 100.0, None)
    }

    #[test]
    fn admission_is_pure() {
        let guard = guardrails();
        let mp = Uuid::new_v4();
        for _ in 0..5 {
            assert_eq!(guard.check_before_execution(mp, 10.0), Admission::Ok);
        }
        assert_eq!(guard.snapshot(mp).accumulated, 0.0);
    }

    #[test]
    fn soft_alert_fires_exactly_once() {
        let guard = guardrails();
        let mp = Uuid::new_v4();
        guard.set_limits(mp, 10.0, 100.0, None).unwrap();

        let first = guard.record(mp, Uuid::new_v4(), 11.0);
        assert!(first.crossed_soft);
        let second = guard.record(mp, Uuid::new_v4(), 5.0);
        assert!(!second.crossed_soft);

        let soft_violations = guard
            .violations(mp)
            .into_iter()
            .filter(|v| v.kind == ViolationKind::Soft)
            .count();
        assert_eq!(soft_violations, 1);
    }

    #[test]
    fn hard_breach_is_sticky_until_reset() {
        let guard = guardrails();
        let mp = Uuid::new_v4();
        guard.set_limits(mp, 10.0, 15.0, None).unwrap();

        guard.record(mp, Uuid::new_v4(), 16.0);
        assert!(matches!(
            guard.check_before_execution(mp, 0.0),
            Admission::HardExceeded { .. }
        ));

        guard.reset(Some(mp));
        assert_eq!(guard.check_before_execution(mp, 1.0), Admission::Ok);
    }

    #[test]
    fn admission_is_predictive_over_estimate() {
        // Ledger at 8 with hard cap 15: an estimated 8 more must be refused
        // before any spend happens.
        let guard = guardrails();
        let mp = Uuid::new_v4();
        guard.set_limits(mp, 10.0, 15.0, None).unwrap();
        guard.record(mp, Uuid::new_v4(), 8.0);

        assert!(matches!(
            guard.check_before_execution(mp, 8.0),
            Admission::HardExceeded { .. }
        ));
        // A smaller atom still fits.
        assert!(matches!(
            guard.check_before_execution(mp, 1.0),
            Admission::SoftExceeded { .. } | Admission::Ok
        ));
    }

    #[test]
    fn zero_hard_cap_refuses_any_positive_spend() {
        let guard = guardrails();
        let mp = Uuid::new_v4();
        guard.set_limits(mp, 0.0, 0.0, None).unwrap();
        assert!(matches!(
            guard.check_before_execution(mp, 0.01),
            Admission::HardExceeded { .. }
        ));
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let guard = guardrails();
        let mp = Uuid::new_v4();
        assert!(guard.set_limits(mp, 20.0, 10.0, None).is_err());
        assert!(guard.set_limits(mp, -1.0, 10.0, None).is_err());
        assert!(guard.set_limits(mp, 1.0, 10.0, Some(-2.0)).is_err());
    }

    #[test]
    fn per_atom_cap_warns_but_does_not_block() {
        let guard = CostGuardrails::new(50.0, 100.0, Some(2.0));
        let mp = Uuid::new_v4();
        let outcome = guard.record(mp, Uuid::new_v4(), 3.0);
        assert!(outcome.per_atom_exceeded);
        assert!(!outcome.crossed_hard);
        assert_eq!(guard.check_before_execution(mp, 1.0), Admission::Ok);
    }

    #[test]
    fn accumulation_is_monotonic() {
        let guard = guardrails();
        let mp = Uuid::new_v4();
        guard.record(mp, Uuid::new_v4(), 5.0);
        guard.record(mp, Uuid::new_v4(), -3.0); // clamped
        assert_eq!(guard.snapshot(mp).accumulated, 5.0);
    }
}
