//! Weighted operator selection, acceptance bookkeeping and adaptation.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cyanea_core::{CyaneaError, Result};

use crate::operator::{build_operator, Operator, OperatorKind, OperatorSpec};
use crate::rng::ChainRng;
use crate::state::State;

/// How the adaptation step shrinks with the number of trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adaptation {
    /// `1 / n`
    Linear,
    /// `1 / log(n + 1)`
    Log,
    /// `1 / sqrt(n)`
    #[default]
    Sqrt,
}

impl Adaptation {
    fn divisor(self, count: f64) -> f64 {
        match self {
            Adaptation::Linear => count,
            Adaptation::Log => (count + 1.0).ln(),
            Adaptation::Sqrt => count.sqrt(),
        }
    }
}

/// Outcome of one proposal, as recorded against its operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
    /// The operator returned −∞ (invalid move).
    Invalid,
    /// The posterior evaluated to NaN.
    Numeric,
}

/// Acceptance counters for one operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStats {
    pub accepted: u64,
    /// All rejections, including the two categories below.
    pub rejected: u64,
    pub rejected_invalid: u64,
    pub rejected_numeric: u64,
}

impl OperatorStats {
    pub fn trials(&self) -> u64 {
        self.accepted + self.rejected
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.trials() == 0 {
            0.0
        } else {
            self.accepted as f64 / self.trials() as f64
        }
    }
}

/// Replace every operator of kind `from` with kind `to` at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstitutionRule {
    pub from: OperatorKind,
    pub to: OperatorKind,
}

/// Tuning value and counters of one operator, for checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorState {
    pub id: String,
    pub tuning: Option<f64>,
    pub stats: OperatorStats,
}

struct Entry {
    op: Box<dyn Operator>,
    weight: f64,
    stats: OperatorStats,
}

/// The set of operators a chain draws from.
pub struct OperatorSchedule {
    entries: Vec<Entry>,
    cumulative: Vec<f64>,
    rules: Vec<SubstitutionRule>,
    adaptation: Adaptation,
    auto_optimize: bool,
    optimize_delay: u64,
    selections: u64,
}

impl Default for OperatorSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OperatorSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorSchedule")
            .field("operators", &self.entries.iter().map(|e| e.op.id()).collect::<Vec<_>>())
            .field("auto_optimize", &self.auto_optimize)
            .finish()
    }
}

impl OperatorSchedule {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            cumulative: Vec::new(),
            rules: Vec::new(),
            adaptation: Adaptation::default(),
            auto_optimize: true,
            optimize_delay: 0,
            selections: 0,
        }
    }

    pub fn with_auto_optimize(mut self, enabled: bool) -> Self {
        self.auto_optimize = enabled;
        self
    }

    /// Skip adaptation for the first `delay` selections.
    pub fn with_optimize_delay(mut self, delay: u64) -> Self {
        self.optimize_delay = delay;
        self
    }

    pub fn with_adaptation(mut self, adaptation: Adaptation) -> Self {
        self.adaptation = adaptation;
        self
    }

    /// Add a substitution rule. Rules apply to operators registered
    /// afterwards through [`OperatorSchedule::add_spec`].
    pub fn with_substitution(mut self, from: OperatorKind, to: OperatorKind) -> Self {
        self.rules.push(SubstitutionRule { from, to });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register an already built operator.
    pub fn add(&mut self, op: Box<dyn Operator>, weight: f64) -> Result<usize> {
        if !(weight > 0.0 && weight.is_finite()) {
            return Err(CyaneaError::config(
                op.id(),
                format!("operator weight must be positive, got {}", weight),
            ));
        }
        if self.entries.iter().any(|e| e.op.id() == op.id()) {
            return Err(CyaneaError::config(
                op.id(),
                "duplicate operator id in schedule",
            ));
        }
        let total = self.cumulative.last().copied().unwrap_or(0.0) + weight;
        self.cumulative.push(total);
        self.entries.push(Entry {
            op,
            weight,
            stats: OperatorStats::default(),
        });
        Ok(self.entries.len() - 1)
    }

    /// Apply substitution rules, build the operator against `state` and
    /// register it.
    pub fn add_spec(&mut self, spec: &OperatorSpec, state: &State) -> Result<usize> {
        let spec = self.substitute(spec)?;
        let op = build_operator(&spec, state)?;
        self.add(op, spec.weight)
    }

    /// The spec an operator would be registered as, after substitution.
    ///
    /// # Errors
    ///
    /// `Config` naming the operator and role when the replacement kind has
    /// no use for one of the original's inputs.
    pub fn substitute(&self, spec: &OperatorSpec) -> Result<OperatorSpec> {
        let Some(rule) = self.rules.iter().find(|r| r.from == spec.kind) else {
            return Ok(spec.clone());
        };
        let accepted = rule.to.accepted_roles();
        if let Some(bad) = spec.inputs.iter().find(|i| !accepted.contains(&i.role.as_str())) {
            return Err(CyaneaError::config(
                &spec.id,
                format!(
                    "cannot substitute {} for {}: input '{}' ({}) has no counterpart",
                    rule.to, rule.from, bad.role, bad.value
                ),
            ));
        }
        info!(operator = %spec.id, from = %rule.from, to = %rule.to, "substituting operator");
        let mut out = spec.clone();
        out.kind = rule.to;
        Ok(out)
    }

    /// Draw an operator index proportionally to weight.
    pub fn select(&mut self, rng: &mut ChainRng) -> Result<usize> {
        let Some(&total) = self.cumulative.last() else {
            return Err(CyaneaError::config("OperatorSchedule", "no operators registered"));
        };
        self.selections += 1;
        let u = rng.uniform() * total;
        let i = self.cumulative.partition_point(|&c| c <= u);
        Ok(i.min(self.entries.len() - 1))
    }

    pub fn operator(&self, index: usize) -> &dyn Operator {
        self.entries[index].op.as_ref()
    }

    pub fn operator_mut(&mut self, index: usize) -> &mut dyn Operator {
        self.entries[index].op.as_mut()
    }

    pub fn stats(&self, index: usize) -> OperatorStats {
        self.entries[index].stats
    }

    pub fn record(&mut self, index: usize, outcome: Outcome) {
        let s = &mut self.entries[index].stats;
        match outcome {
            Outcome::Accepted => s.accepted += 1,
            Outcome::Rejected => s.rejected += 1,
            Outcome::Invalid => {
                s.rejected += 1;
                s.rejected_invalid += 1;
            }
            Outcome::Numeric => {
                s.rejected += 1;
                s.rejected_numeric += 1;
            }
        }
    }

    /// Diminishing adaptation step:
    /// `(exp(min(log α, 0)) - target) / transform(trials + 1)`.
    pub fn calc_delta(&self, index: usize, log_alpha: f64) -> f64 {
        let entry = &self.entries[index];
        let count = entry.stats.trials() as f64 + 1.0;
        let target = entry.op.target_acceptance();
        let delta = (log_alpha.min(0.0).exp() - target) / self.adaptation.divisor(count);
        if delta.is_finite() {
            delta
        } else {
            0.0
        }
    }

    /// Adapt operator `index` after a proposal with acceptance ratio
    /// `log_alpha`, if adaptation is on and the delay has passed.
    pub fn optimize(&mut self, index: usize, log_alpha: f64) {
        if !self.auto_optimize || self.selections <= self.optimize_delay || log_alpha.is_nan() {
            return;
        }
        if self.entries[index].op.tuning().is_none() {
            return;
        }
        let delta = self.calc_delta(index, log_alpha);
        self.entries[index].op.optimize(delta);
    }

    /// Tuning and counters of every operator.
    pub fn export_state(&self) -> Vec<OperatorState> {
        self.entries
            .iter()
            .map(|e| OperatorState {
                id: e.op.id().to_string(),
                tuning: e.op.tuning(),
                stats: e.stats,
            })
            .collect()
    }

    /// Restore tuning and counters by operator id.
    ///
    /// # Errors
    ///
    /// `Config` if a saved id matches no registered operator.
    pub fn import_state(&mut self, saved: &[OperatorState]) -> Result<()> {
        for s in saved {
            let entry = self
                .entries
                .iter_mut()
                .find(|e| e.op.id() == s.id)
                .ok_or_else(|| {
                    CyaneaError::config("OperatorSchedule", format!("unknown operator '{}'", s.id))
                })?;
            if let Some(t) = s.tuning {
                entry.op.set_tuning(t);
            }
            entry.stats = s.stats;
        }
        self.selections = self.entries.iter().map(|e| e.stats.trials()).sum();
        debug!(operators = saved.len(), "operator state restored");
        Ok(())
    }

    /// Per-operator acceptance rows.
    pub fn report(&self) -> ScheduleReport {
        let total: f64 = self.entries.iter().map(|e| e.weight).sum();
        ScheduleReport {
            rows: self
                .entries
                .iter()
                .map(|e| OperatorReport {
                    id: e.op.id().to_string(),
                    kind: e.op.kind(),
                    tuning: e.op.tuning(),
                    stats: e.stats,
                    selection_probability: e.weight / total,
                    acceptance_rate: e.stats.acceptance_rate(),
                })
                .collect(),
        }
    }
}

/// One row of the operator table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorReport {
    pub id: String,
    pub kind: OperatorKind,
    pub tuning: Option<f64>,
    pub stats: OperatorStats,
    pub selection_probability: f64,
    pub acceptance_rate: f64,
}

/// Operator acceptance table printed at the end of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub rows: Vec<OperatorReport>,
}

impl fmt::Display for ScheduleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<40} {:>10} {:>10} {:>10} {:>8} {:>8} {:>8} {:>10}",
            "Operator", "Tuning", "#accept", "#reject", "#inval", "#nan", "Pr(m)", "Pr(acc|m)"
        )?;
        for r in &self.rows {
            let name = format!("{}({})", r.kind, r.id);
            let tuning = r.tuning.map_or_else(|| "-".to_string(), |t| format!("{:.5}", t));
            writeln!(
                f,
                "{:<40} {:>10} {:>10} {:>10} {:>8} {:>8} {:>8.4} {:>10.4}",
                name,
                tuning,
                r.stats.accepted,
                r.stats.rejected,
                r.stats.rejected_invalid,
                r.stats.rejected_numeric,
                r.selection_probability,
                r.acceptance_rate
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::RealParameter;
    use cyanea_phylo::TimeTree;

    fn state() -> State {
        let mut state = State::new();
        state
            .add(RealParameter::new("x", vec![1.0]).unwrap().with_bounds(0.0, 10.0).unwrap())
            .unwrap();
        state
            .add(TimeTree::from_newick("t", "((A:1,B:1):1,C:2);").unwrap())
            .unwrap();
        state
    }

    #[test]
    fn selection_follows_weights() {
        let state = state();
        let mut schedule = OperatorSchedule::new();
        schedule
            .add_spec(&OperatorSpec::new("a", OperatorKind::RandomWalk, 1.0).input("parameter", "x"), &state)
            .unwrap();
        schedule
            .add_spec(&OperatorSpec::new("b", OperatorKind::Scale, 3.0).input("parameter", "x"), &state)
            .unwrap();
        let mut rng = ChainRng::seed_from_u64(1);
        let mut counts = [0usize; 2];
        for _ in 0..40_000 {
            counts[schedule.select(&mut rng).unwrap()] += 1;
        }
        let frac = counts[1] as f64 / 40_000.0;
        assert!((frac - 0.75).abs() < 0.01, "{}", frac);
    }

    #[test]
    fn empty_schedule_cannot_select() {
        let mut schedule = OperatorSchedule::new();
        let mut rng = ChainRng::seed_from_u64(1);
        assert!(schedule.select(&mut rng).is_err());
    }

    #[test]
    fn substitution_keeps_id_weight_tuning_and_inputs() {
        let state = state();
        let mut schedule =
            OperatorSchedule::new().with_substitution(OperatorKind::RandomWalk, OperatorKind::BactrianRandomWalk);
        let spec = OperatorSpec::new("walk", OperatorKind::RandomWalk, 2.0)
            .input("parameter", "x")
            .tuning(0.3);
        let i = schedule.add_spec(&spec, &state).unwrap();
        let op = schedule.operator(i);
        assert_eq!(op.kind(), OperatorKind::BactrianRandomWalk);
        assert_eq!(op.id(), "walk");
        assert_eq!(op.tuning(), Some(0.3));
        assert_eq!(op.spec().inputs, spec.inputs);
        assert_eq!(schedule.report().rows[0].selection_probability, 1.0);
    }

    #[test]
    fn substitution_fails_loudly_on_unmapped_role() {
        let state = state();
        let mut schedule =
            OperatorSchedule::new().with_substitution(OperatorKind::Scale, OperatorKind::BactrianRandomWalk);
        let spec = OperatorSpec::new("treeScaler", OperatorKind::Scale, 1.0).input("tree", "t");
        let err = schedule.add_spec(&spec, &state).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, CyaneaError::Config { .. }));
        assert!(msg.contains("treeScaler"));
        assert!(msg.contains("'tree'"));
        assert!(schedule.is_empty());
    }

    #[test]
    fn counters_split_rejections() {
        let state = state();
        let mut schedule = OperatorSchedule::new();
        schedule
            .add_spec(&OperatorSpec::new("a", OperatorKind::RandomWalk, 1.0).input("parameter", "x"), &state)
            .unwrap();
        schedule.record(0, Outcome::Accepted);
        schedule.record(0, Outcome::Rejected);
        schedule.record(0, Outcome::Invalid);
        schedule.record(0, Outcome::Numeric);
        let s = schedule.stats(0);
        assert_eq!(s.accepted, 1);
        assert_eq!(s.rejected, 3);
        assert_eq!(s.rejected_invalid, 1);
        assert_eq!(s.rejected_numeric, 1);
        assert_eq!(s.acceptance_rate(), 0.25);
    }

    #[test]
    fn delta_diminishes_with_trials() {
        let state = state();
        let mut schedule = OperatorSchedule::new();
        schedule
            .add_spec(&OperatorSpec::new("a", OperatorKind::RandomWalk, 1.0).input("parameter", "x"), &state)
            .unwrap();
        // Accepted outright: exp(0) = 1, target 0.234, one prior trial.
        schedule.record(0, Outcome::Accepted);
        let d1 = schedule.calc_delta(0, 0.5);
        assert!((d1 - (1.0 - 0.234) / 2f64.sqrt()).abs() < 1e-12);
        for _ in 0..99 {
            schedule.record(0, Outcome::Accepted);
        }
        let d100 = schedule.calc_delta(0, 0.5);
        assert!(d100 < d1);
        assert_eq!(schedule.calc_delta(0, f64::NEG_INFINITY), -0.234 / 101f64.sqrt());
    }

    #[test]
    fn optimize_respects_delay_and_switch() {
        let state = state();
        let spec = OperatorSpec::new("a", OperatorKind::RandomWalk, 1.0)
            .input("parameter", "x")
            .tuning(1.0);
        let mut rng = ChainRng::seed_from_u64(2);

        let mut off = OperatorSchedule::new().with_auto_optimize(false);
        off.add_spec(&spec, &state).unwrap();
        off.select(&mut rng).unwrap();
        off.optimize(0, f64::NEG_INFINITY);
        assert_eq!(off.operator(0).tuning(), Some(1.0));

        let mut delayed = OperatorSchedule::new().with_optimize_delay(2);
        delayed.add_spec(&spec, &state).unwrap();
        delayed.select(&mut rng).unwrap();
        delayed.optimize(0, f64::NEG_INFINITY);
        assert_eq!(delayed.operator(0).tuning(), Some(1.0));
        delayed.select(&mut rng).unwrap();
        delayed.select(&mut rng).unwrap();
        delayed.optimize(0, f64::NEG_INFINITY);
        assert!(delayed.operator(0).tuning().unwrap() < 1.0);
    }

    #[test]
    fn state_export_import() {
        let state = state();
        let spec = OperatorSpec::new("a", OperatorKind::Scale, 1.0)
            .input("parameter", "x")
            .tuning(0.5);
        let mut first = OperatorSchedule::new();
        first.add_spec(&spec, &state).unwrap();
        first.record(0, Outcome::Accepted);
        first.operator_mut(0).set_tuning(0.9);
        let saved = first.export_state();

        let mut second = OperatorSchedule::new();
        second.add_spec(&spec, &state).unwrap();
        second.import_state(&saved).unwrap();
        assert_eq!(second.operator(0).tuning(), Some(0.9));
        assert_eq!(second.stats(0).accepted, 1);

        let unknown = vec![OperatorState {
            id: "zzz".into(),
            tuning: None,
            stats: OperatorStats::default(),
        }];
        assert!(second.import_state(&unknown).is_err());
    }

    #[test]
    fn report_renders_table() {
        let state = state();
        let mut schedule = OperatorSchedule::new();
        schedule
            .add_spec(&OperatorSpec::new("slide", OperatorKind::SubtreeSlide, 1.0).input("tree", "t"), &state)
            .unwrap();
        schedule.record(0, Outcome::Accepted);
        let table = schedule.report().to_string();
        assert!(table.contains("SubtreeSlide(slide)"));
        assert!(table.lines().next().unwrap().starts_with("Operator"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let state = state();
        let spec = OperatorSpec::new("a", OperatorKind::RandomWalk, 1.0).input("parameter", "x");
        let mut schedule = OperatorSchedule::new();
        schedule.add_spec(&spec, &state).unwrap();
        assert!(schedule.add_spec(&spec, &state).is_err());
    }
}
