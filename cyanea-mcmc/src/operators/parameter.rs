//! Operators on real and integer parameters (and whole-tree scaling).

use cyanea_core::{CyaneaError, Result};
use cyanea_phylo::TimeTree;
use tracing::trace;

use super::{bactrian_kernel, log_step, with_tuning};
use crate::kernel::Kernel;
use crate::operator::{Operator, OperatorKind, OperatorSpec};
use crate::parameter::{IntegerParameter, RealParameter, Write};
use crate::rng::ChainRng;
use crate::state::{Handle, State, StateValue};

const REJECT: f64 = f64::NEG_INFINITY;

fn kernel_for(spec: &OperatorSpec, bactrian: bool) -> Result<Kernel> {
    if bactrian {
        bactrian_kernel(spec)
    } else {
        Ok(Kernel::Uniform)
    }
}

// ---------------------------------------------------------------------------
// Random walk
// ---------------------------------------------------------------------------

/// Adds a symmetric step to one element of a real parameter.
///
/// The step is `window * k` where `k` comes from the uniform kernel on
/// `(-1, 1)` or from the Bactrian kernel. The Hastings ratio is zero.
#[derive(Debug)]
pub struct RandomWalk {
    spec: OperatorSpec,
    param: Handle<RealParameter>,
    window: f64,
    kernel: Kernel,
}

impl RandomWalk {
    pub fn from_spec(spec: &OperatorSpec, state: &State) -> Result<Self> {
        let param = state.lookup::<RealParameter>(spec.single("parameter")?)?;
        Ok(Self {
            kernel: kernel_for(spec, spec.kind == OperatorKind::BactrianRandomWalk)?,
            window: spec.tuning.unwrap_or(1.0),
            spec: spec.clone(),
            param,
        })
    }
}

impl Operator for RandomWalk {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn kind(&self) -> OperatorKind {
        self.spec.kind
    }

    fn propose(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<f64> {
        let p = state.get_mut(self.param)?;
        let i = rng.index(p.dimension());
        let old = p.value(i);
        let new = old + self.window * self.kernel.draw(rng);
        if new == old {
            return Ok(REJECT);
        }
        match p.set(i, new)? {
            Write::Rejected => Ok(REJECT),
            Write::Clamped => {
                trace!(operator = %self.spec.id, value = new, "random walk clamped");
                Ok(0.0)
            }
            Write::Applied => Ok(0.0),
        }
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.window)
    }

    fn set_tuning(&mut self, value: f64) {
        self.window = value;
    }

    fn optimize(&mut self, delta: f64) {
        self.window = log_step(self.window, delta);
    }

    fn target_acceptance(&self) -> f64 {
        self.spec
            .options
            .target_acceptance
            .unwrap_or_else(|| self.kernel.target_acceptance())
    }

    fn spec(&self) -> OperatorSpec {
        with_tuning(&self.spec, Some(self.window))
    }
}

// ---------------------------------------------------------------------------
// Scale
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum ScaleTarget {
    Parameter(Handle<RealParameter>),
    Tree(Handle<TimeTree>),
}

/// Multiplies a parameter element, every element, the root height, or
/// every internal node height by a random factor `s`.
///
/// The classic scaler draws `s` uniformly from `[f, 1/f]`; the Bactrian
/// scaler draws `s = exp(f * k)`. Hastings ratios:
///
/// | target | classic | Bactrian |
/// |---|---|---|
/// | one element / root | `-log s` | `log s` |
/// | `n` elements / `n` internal nodes | `(n - 2) log s` | `n log s` |
#[derive(Debug)]
pub struct Scale {
    spec: OperatorSpec,
    target: ScaleTarget,
    factor: f64,
    kernel: Kernel,
}

impl Scale {
    pub fn from_spec(spec: &OperatorSpec, state: &State) -> Result<Self> {
        let has_param = spec.values_for("parameter").next().is_some();
        let has_tree = spec.values_for("tree").next().is_some();
        let target = match (has_param, has_tree) {
            (true, false) => {
                ScaleTarget::Parameter(state.lookup::<RealParameter>(spec.single("parameter")?)?)
            }
            (false, true) => ScaleTarget::Tree(state.lookup::<TimeTree>(spec.single("tree")?)?),
            _ => {
                return Err(CyaneaError::config(
                    &spec.id,
                    "scale operator needs exactly one 'parameter' or 'tree' input",
                ))
            }
        };
        let bactrian = spec.kind == OperatorKind::BactrianScale;
        let factor = spec.tuning.unwrap_or(if bactrian { 0.3 } else { 0.75 });
        if !bactrian && !(factor > 0.0 && factor < 1.0) {
            return Err(CyaneaError::config(
                &spec.id,
                format!("scale factor must lie in (0, 1), got {}", factor),
            ));
        }
        Ok(Self {
            kernel: kernel_for(spec, bactrian)?,
            spec: spec.clone(),
            target,
            factor,
        })
    }

    fn scaler(&self, rng: &mut ChainRng) -> f64 {
        match self.kernel {
            Kernel::Uniform => self.factor + rng.uniform() * (1.0 / self.factor - self.factor),
            Kernel::Bactrian { .. } => (self.factor * self.kernel.draw(rng)).exp(),
        }
    }

    /// Log Hastings ratio for scaling `n` values at once by `s`.
    fn many(&self, n: usize, s: f64) -> f64 {
        match self.kernel {
            Kernel::Uniform => (n as f64 - 2.0) * s.ln(),
            Kernel::Bactrian { .. } => n as f64 * s.ln(),
        }
    }

    /// Log Hastings ratio for scaling one value by `s`.
    fn one(&self, s: f64) -> f64 {
        match self.kernel {
            Kernel::Uniform => -s.ln(),
            Kernel::Bactrian { .. } => s.ln(),
        }
    }
}

impl Operator for Scale {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn kind(&self) -> OperatorKind {
        self.spec.kind
    }

    fn propose(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<f64> {
        let s = self.scaler(rng);
        let opts = &self.spec.options;
        match self.target {
            ScaleTarget::Tree(h) => {
                let tree = state.get_mut(h)?;
                if opts.root_only {
                    let root = tree.root();
                    let new = tree.height(root) * s;
                    if new < tree.max_child_height(root) {
                        return Ok(REJECT);
                    }
                    tree.set_height(root, new)?;
                    Ok(self.one(s))
                } else {
                    let n = tree.scale_internal_heights(s)?;
                    if !tree.heights_valid() {
                        return Ok(REJECT);
                    }
                    Ok(self.many(n, s))
                }
            }
            ScaleTarget::Parameter(h) => {
                let p = state.get_mut(h)?;
                if opts.scale_all {
                    for i in 0..p.dimension() {
                        let v = p.value(i) * s;
                        if p.set(i, v)? == Write::Rejected {
                            return Ok(REJECT);
                        }
                    }
                    Ok(self.many(p.dimension(), s))
                } else {
                    let i = rng.index(p.dimension());
                    let old = p.value(i);
                    if old == 0.0 {
                        return Ok(REJECT);
                    }
                    if p.set(i, old * s)? == Write::Rejected {
                        return Ok(REJECT);
                    }
                    Ok(self.one(s))
                }
            }
        }
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.factor)
    }

    fn set_tuning(&mut self, value: f64) {
        self.factor = value;
    }

    fn optimize(&mut self, delta: f64) {
        if self.kernel.is_bactrian() {
            self.factor = log_step(self.factor, delta).min(10.0);
        } else {
            // Adapt on the logit scale of 1/f - 1 so f stays inside (0, 1).
            let d = delta + (1.0 / self.factor - 1.0).ln();
            self.factor = (1.0 / (d.exp() + 1.0)).clamp(1e-8, 1.0 - 1e-8);
        }
    }

    fn target_acceptance(&self) -> f64 {
        self.spec
            .options
            .target_acceptance
            .unwrap_or_else(|| self.kernel.target_acceptance())
    }

    fn spec(&self) -> OperatorSpec {
        with_tuning(&self.spec, Some(self.factor))
    }
}

// ---------------------------------------------------------------------------
// Up/down
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Scalable {
    Real(Handle<RealParameter>),
    Tree(Handle<TimeTree>),
}

impl Scalable {
    fn resolve(spec: &OperatorSpec, name: &str, state: &State) -> Result<Self> {
        let node = state.lookup_any(name)?;
        match state.value(node)? {
            StateValue::Real(_) => Ok(Scalable::Real(state.lookup(name)?)),
            StateValue::Tree(_) => Ok(Scalable::Tree(state.lookup(name)?)),
            StateValue::Integer(_) => Err(CyaneaError::config(
                &spec.id,
                format!("up/down operator cannot scale integer parameter '{}'", name),
            )),
        }
    }

    /// Multiply by `s`; returns the number of values scaled, or `None` if a
    /// bound or the height ordering was violated.
    fn scale(self, state: &mut State, s: f64) -> Result<Option<usize>> {
        match self {
            Scalable::Real(h) => {
                let p = state.get_mut(h)?;
                for i in 0..p.dimension() {
                    let v = p.value(i) * s;
                    if p.set(i, v)? == Write::Rejected {
                        return Ok(None);
                    }
                }
                Ok(Some(p.dimension()))
            }
            Scalable::Tree(h) => {
                let tree = state.get_mut(h)?;
                let n = tree.scale_internal_heights(s)?;
                Ok(tree.heights_valid().then_some(n))
            }
        }
    }
}

/// Scales the "up" values by `s` and the "down" values by `1/s`, e.g. a
/// clock rate against tree heights. Log Hastings ratio is
/// `(up - down - 2) log s` where `up` and `down` count scaled values.
#[derive(Debug)]
pub struct UpDown {
    spec: OperatorSpec,
    up: Vec<Scalable>,
    down: Vec<Scalable>,
    factor: f64,
}

impl UpDown {
    pub fn from_spec(spec: &OperatorSpec, state: &State) -> Result<Self> {
        let up = spec
            .values_for("up")
            .map(|n| Scalable::resolve(spec, n, state))
            .collect::<Result<Vec<_>>>()?;
        let down = spec
            .values_for("down")
            .map(|n| Scalable::resolve(spec, n, state))
            .collect::<Result<Vec<_>>>()?;
        if up.is_empty() && down.is_empty() {
            return Err(CyaneaError::config(
                &spec.id,
                "up/down operator needs at least one 'up' or 'down' input",
            ));
        }
        let factor = spec.tuning.unwrap_or(0.75);
        if !(factor > 0.0 && factor < 1.0) {
            return Err(CyaneaError::config(
                &spec.id,
                format!("scale factor must lie in (0, 1), got {}", factor),
            ));
        }
        Ok(Self {
            spec: spec.clone(),
            up,
            down,
            factor,
        })
    }
}

impl Operator for UpDown {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::UpDown
    }

    fn propose(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<f64> {
        let s = self.factor + rng.uniform() * (1.0 / self.factor - self.factor);
        let mut going_up = 0usize;
        for target in &self.up {
            match target.scale(state, s)? {
                Some(n) => going_up += n,
                None => return Ok(REJECT),
            }
        }
        let mut going_down = 0usize;
        for target in &self.down {
            match target.scale(state, 1.0 / s)? {
                Some(n) => going_down += n,
                None => return Ok(REJECT),
            }
        }
        Ok((going_up as f64 - going_down as f64 - 2.0) * s.ln())
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.factor)
    }

    fn set_tuning(&mut self, value: f64) {
        self.factor = value;
    }

    fn optimize(&mut self, delta: f64) {
        let d = delta + (1.0 / self.factor - 1.0).ln();
        self.factor = (1.0 / (d.exp() + 1.0)).clamp(1e-8, 1.0 - 1e-8);
    }

    fn target_acceptance(&self) -> f64 {
        self.spec.options.target_acceptance.unwrap_or(0.234)
    }

    fn spec(&self) -> OperatorSpec {
        with_tuning(&self.spec, Some(self.factor))
    }
}

// ---------------------------------------------------------------------------
// Delta exchange
// ---------------------------------------------------------------------------

/// Moves mass between two elements of a parameter, keeping the weighted
/// sum `Σ wᵢ xᵢ` fixed. The Hastings ratio is zero.
#[derive(Debug)]
pub struct DeltaExchange {
    spec: OperatorSpec,
    param: Handle<RealParameter>,
    weights: Vec<f64>,
    delta: f64,
}

impl DeltaExchange {
    pub fn from_spec(spec: &OperatorSpec, state: &State) -> Result<Self> {
        let param = state.lookup::<RealParameter>(spec.single("parameter")?)?;
        let dim = state.get(param)?.dimension();
        if dim < 2 {
            return Err(CyaneaError::config(
                &spec.id,
                "delta exchange needs a parameter with at least two elements",
            ));
        }
        let weights = spec.options.weights.clone().unwrap_or_else(|| vec![1.0; dim]);
        if weights.len() != dim {
            return Err(CyaneaError::config(
                &spec.id,
                format!("{} weights for a parameter of dimension {}", weights.len(), dim),
            ));
        }
        if weights.iter().any(|&w| !(w > 0.0 && w.is_finite())) {
            return Err(CyaneaError::config(&spec.id, "delta-exchange weights must be positive"));
        }
        Ok(Self {
            spec: spec.clone(),
            param,
            weights,
            delta: spec.tuning.unwrap_or(1.0),
        })
    }
}

impl Operator for DeltaExchange {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::DeltaExchange
    }

    fn propose(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<f64> {
        let p = state.get_mut(self.param)?;
        let dim = p.dimension();
        let i = rng.index(dim);
        let mut j = rng.index(dim - 1);
        if j >= i {
            j += 1;
        }
        let d = rng.uniform() * self.delta;
        let new_i = p.value(i) - d;
        let new_j = p.value(j) + d * self.weights[i] / self.weights[j];
        if p.set(i, new_i)? == Write::Rejected || p.set(j, new_j)? == Write::Rejected {
            return Ok(REJECT);
        }
        Ok(0.0)
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.delta)
    }

    fn set_tuning(&mut self, value: f64) {
        self.delta = value;
    }

    fn optimize(&mut self, delta: f64) {
        self.delta = log_step(self.delta, delta);
    }

    fn target_acceptance(&self) -> f64 {
        self.spec.options.target_acceptance.unwrap_or(0.234)
    }

    fn spec(&self) -> OperatorSpec {
        with_tuning(&self.spec, Some(self.delta))
    }
}

// ---------------------------------------------------------------------------
// Integer random walk
// ---------------------------------------------------------------------------

/// Adds a uniform integer in `[-w, w]` to one element. A zero step is
/// rejected. The window is not adapted.
#[derive(Debug)]
pub struct IntegerRandomWalk {
    spec: OperatorSpec,
    param: Handle<IntegerParameter>,
    window: i64,
}

impl IntegerRandomWalk {
    pub fn from_spec(spec: &OperatorSpec, state: &State) -> Result<Self> {
        let param = state.lookup::<IntegerParameter>(spec.single("parameter")?)?;
        let window = spec.tuning.unwrap_or(1.0).round() as i64;
        if window < 1 {
            return Err(CyaneaError::config(&spec.id, "integer window must be at least 1"));
        }
        Ok(Self {
            spec: spec.clone(),
            param,
            window,
        })
    }
}

impl Operator for IntegerRandomWalk {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::IntegerRandomWalk
    }

    fn propose(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<f64> {
        let p = state.get_mut(self.param)?;
        let i = rng.index(p.dimension());
        let step = rng.integer(-self.window, self.window);
        if step == 0 {
            return Ok(REJECT);
        }
        let new = p.value(i).saturating_add(step);
        if p.set(i, new)? == Write::Rejected {
            return Ok(REJECT);
        }
        Ok(0.0)
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.window as f64)
    }

    fn set_tuning(&mut self, value: f64) {
        self.window = (value.round() as i64).max(1);
    }

    fn spec(&self) -> OperatorSpec {
        with_tuning(&self.spec, Some(self.window as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{build_operator, OperatorOptions};
    use cyanea_core::Versioned;

    fn real_state(values: Vec<f64>, lower: f64, upper: f64) -> (State, Handle<RealParameter>) {
        let mut state = State::new();
        let h = state
            .add(
                RealParameter::new("x", values)
                    .unwrap()
                    .with_bounds(lower, upper)
                    .unwrap(),
            )
            .unwrap();
        (state, h)
    }

    #[test]
    fn random_walk_moves_one_element() {
        let (mut state, h) = real_state(vec![0.0, 0.0, 0.0], -100.0, 100.0);
        let spec = OperatorSpec::new("rw", OperatorKind::RandomWalk, 1.0)
            .input("parameter", "x")
            .tuning(0.5);
        let mut op = build_operator(&spec, &state).unwrap();
        let mut rng = ChainRng::seed_from_u64(1);
        let hr = op.propose(&mut state, &mut rng).unwrap();
        assert_eq!(hr, 0.0);
        let values = state.get(h).unwrap().values().to_vec();
        assert_eq!(values.iter().filter(|&&v| v != 0.0).count(), 1);
        assert!(values.iter().all(|v| v.abs() < 0.5));
    }

    #[test]
    fn out_of_bounds_is_immediate_reject() {
        let (mut state, h) = real_state(vec![0.0], 0.0, 1e-9);
        let spec = OperatorSpec::new("rw", OperatorKind::RandomWalk, 1.0)
            .input("parameter", "x")
            .tuning(10.0);
        let mut op = build_operator(&spec, &state).unwrap();
        let mut rng = ChainRng::seed_from_u64(2);
        let mut rejected = 0;
        for _ in 0..20 {
            if op.propose(&mut state, &mut rng).unwrap() == f64::NEG_INFINITY {
                rejected += 1;
            }
            state.rollback_all();
        }
        assert!(rejected >= 19);
        assert!(state.get(h).unwrap().in_bounds());
    }

    #[test]
    fn classic_scale_hastings_ratio() {
        let (mut state, h) = real_state(vec![2.0], 0.0, f64::INFINITY);
        let spec = OperatorSpec::new("sc", OperatorKind::Scale, 1.0)
            .input("parameter", "x")
            .tuning(0.5);
        let mut op = build_operator(&spec, &state).unwrap();
        let mut rng = ChainRng::seed_from_u64(3);
        for _ in 0..50 {
            let hr = op.propose(&mut state, &mut rng).unwrap();
            let s = state.get(h).unwrap().value(0) / 2.0;
            assert!((0.5..=2.0).contains(&s));
            assert!((hr + s.ln()).abs() < 1e-12);
            state.rollback_all();
        }
    }

    #[test]
    fn bactrian_scale_all_hastings_ratio() {
        let (mut state, h) = real_state(vec![1.0, 2.0, 4.0], 0.0, f64::INFINITY);
        let spec = OperatorSpec::new("sc", OperatorKind::BactrianScale, 1.0)
            .input("parameter", "x")
            .options(OperatorOptions {
                scale_all: true,
                ..Default::default()
            });
        let mut op = build_operator(&spec, &state).unwrap();
        let mut rng = ChainRng::seed_from_u64(4);
        let hr = op.propose(&mut state, &mut rng).unwrap();
        let p = state.get(h).unwrap();
        let s = p.value(0);
        assert!((p.value(2) / p.value(0) - 4.0).abs() < 1e-12);
        assert!((hr - 3.0 * s.ln()).abs() < 1e-12);
    }

    #[test]
    fn tree_scale_rejects_invalid_heights() {
        // Dated tips: scaling the internal nodes down far enough pushes the
        // cherry below its older tip.
        let mut state = State::new();
        let tree = TimeTree::from_newick("t", "((A:0.1,B:1.0):0.1,C:1.1);").unwrap();
        let t = state.add(tree).unwrap();
        let spec = OperatorSpec::new("sc", OperatorKind::Scale, 1.0)
            .input("tree", "t")
            .tuning(0.5);
        let mut op = build_operator(&spec, &state).unwrap();
        let mut rng = ChainRng::seed_from_u64(5);
        let before = state.checksum();
        let mut saw_reject = false;
        for _ in 0..50 {
            let hr = op.propose(&mut state, &mut rng).unwrap();
            if hr == f64::NEG_INFINITY {
                saw_reject = true;
            } else {
                assert!(state.get(t).unwrap().heights_valid());
            }
            state.rollback_all();
            assert_eq!(state.checksum(), before);
        }
        assert!(saw_reject);
    }

    #[test]
    fn root_only_scale() {
        let mut state = State::new();
        let t = state
            .add(TimeTree::from_newick("t", "((A:1,B:1):1,C:2);").unwrap())
            .unwrap();
        let spec = OperatorSpec::new("root", OperatorKind::Scale, 1.0)
            .input("tree", "t")
            .options(OperatorOptions {
                root_only: true,
                ..Default::default()
            });
        let mut op = build_operator(&spec, &state).unwrap();
        let mut rng = ChainRng::seed_from_u64(6);
        let hr = op.propose(&mut state, &mut rng).unwrap();
        let tree = state.get(t).unwrap();
        if hr.is_finite() {
            let s = tree.height(tree.root()) / 2.0;
            assert!((hr + s.ln()).abs() < 1e-12);
            let cherry = tree.parent(0).unwrap();
            assert_eq!(tree.height(cherry), 1.0);
        }
    }

    #[test]
    fn scale_needs_one_target() {
        let mut state = State::new();
        state.add(RealParameter::new("x", vec![1.0]).unwrap()).unwrap();
        state.add(TimeTree::from_newick("t", "(A:1,B:1);").unwrap()).unwrap();
        let both = OperatorSpec::new("sc", OperatorKind::Scale, 1.0)
            .input("parameter", "x")
            .input("tree", "t");
        assert!(build_operator(&both, &state).is_err());
        let bad_factor = OperatorSpec::new("sc", OperatorKind::Scale, 1.0)
            .input("parameter", "x")
            .tuning(1.5);
        assert!(build_operator(&bad_factor, &state).is_err());
    }

    #[test]
    fn up_down_moves_in_opposite_directions() {
        let mut state = State::new();
        let rate = state
            .add(RealParameter::new("rate", vec![1.0]).unwrap().with_bounds(0.0, f64::INFINITY).unwrap())
            .unwrap();
        let t = state
            .add(TimeTree::from_newick("t", "((A:1,B:1):1,C:2);").unwrap())
            .unwrap();
        let spec = OperatorSpec::new("ud", OperatorKind::UpDown, 1.0)
            .input("up", "rate")
            .input("down", "t");
        let mut op = build_operator(&spec, &state).unwrap();
        let mut rng = ChainRng::seed_from_u64(7);
        let hr = op.propose(&mut state, &mut rng).unwrap();
        let s = state.get(rate).unwrap().value(0);
        let tree = state.get(t).unwrap();
        assert!((tree.height(tree.root()) - 2.0 / s).abs() < 1e-12);
        // One value up, two internal nodes down.
        assert!((hr - (1.0 - 2.0 - 2.0) * s.ln()).abs() < 1e-12);
    }

    #[test]
    fn delta_exchange_preserves_weighted_sum() {
        let (mut state, h) = real_state(vec![0.2, 0.3, 0.5], 0.0, 1.0);
        let spec = OperatorSpec::new("dx", OperatorKind::DeltaExchange, 1.0)
            .input("parameter", "x")
            .tuning(0.1)
            .options(OperatorOptions {
                weights: Some(vec![1.0, 2.0, 4.0]),
                ..Default::default()
            });
        let mut op = build_operator(&spec, &state).unwrap();
        let mut rng = ChainRng::seed_from_u64(8);
        let weighted = |v: &[f64]| v[0] + 2.0 * v[1] + 4.0 * v[2];
        let before = weighted(state.get(h).unwrap().values());
        for _ in 0..100 {
            let hr = op.propose(&mut state, &mut rng).unwrap();
            if hr.is_finite() {
                let after = weighted(state.get(h).unwrap().values());
                assert!((after - before).abs() < 1e-12);
                state.commit_all();
            } else {
                state.rollback_all();
            }
        }
    }

    #[test]
    fn delta_exchange_dimension_mismatch_is_config_error() {
        let (state, _) = real_state(vec![0.5, 0.5], 0.0, 1.0);
        let spec = OperatorSpec::new("dx", OperatorKind::DeltaExchange, 1.0)
            .input("parameter", "x")
            .options(OperatorOptions {
                weights: Some(vec![1.0, 1.0, 1.0]),
                ..Default::default()
            });
        assert!(matches!(
            build_operator(&spec, &state),
            Err(CyaneaError::Config { .. })
        ));
        let (state, _) = real_state(vec![0.5], 0.0, 1.0);
        let spec = OperatorSpec::new("dx", OperatorKind::DeltaExchange, 1.0).input("parameter", "x");
        assert!(build_operator(&spec, &state).is_err());
    }

    #[test]
    fn integer_walk_never_proposes_no_change() {
        let mut state = State::new();
        let k = state
            .add(IntegerParameter::new("k", vec![5]).unwrap().with_bounds(0, 10).unwrap())
            .unwrap();
        let spec = OperatorSpec::new("iw", OperatorKind::IntegerRandomWalk, 1.0)
            .input("parameter", "k")
            .tuning(2.0);
        let mut op = build_operator(&spec, &state).unwrap();
        let mut rng = ChainRng::seed_from_u64(9);
        for _ in 0..100 {
            let hr = op.propose(&mut state, &mut rng).unwrap();
            let v = state.get(k).unwrap().value(0);
            if hr == 0.0 {
                assert_ne!(v, 5);
                assert!((3..=7).contains(&v));
            }
            state.rollback_all();
            assert!(!state.get(k).unwrap().is_touched());
        }
    }

    #[test]
    fn optimize_moves_tuning_with_delta() {
        let (state, _) = real_state(vec![1.0], 0.0, 10.0);
        let spec = OperatorSpec::new("rw", OperatorKind::RandomWalk, 1.0)
            .input("parameter", "x")
            .tuning(1.0);
        let mut op = build_operator(&spec, &state).unwrap();
        op.optimize(0.5);
        assert!((op.tuning().unwrap() - 0.5f64.exp()).abs() < 1e-12);
        assert_eq!(op.spec().tuning, op.tuning());

        let spec = OperatorSpec::new("sc", OperatorKind::Scale, 1.0)
            .input("parameter", "x")
            .tuning(0.5);
        let mut op = build_operator(&spec, &state).unwrap();
        op.optimize(-1.0);
        // Low acceptance pushes the factor towards 1 (smaller moves).
        assert!(op.tuning().unwrap() > 0.5);
        assert!(op.tuning().unwrap() < 1.0);
    }

    #[test]
    fn scale_tuning_follows_kernel() {
        let (state, _) = real_state(vec![1.0], 0.0, 10.0);
        let spec = OperatorSpec::new("sc", OperatorKind::BactrianScale, 1.0)
            .input("parameter", "x")
            .tuning(0.3);
        let mut op = build_operator(&spec, &state).unwrap();
        op.optimize(2.0);
        assert!((op.tuning().unwrap() - 0.3 * 2.0f64.exp()).abs() < 1e-12);
        op.optimize(20.0);
        assert_eq!(op.tuning(), Some(10.0));

        let spec = OperatorSpec::new("sc", OperatorKind::Scale, 1.0)
            .input("parameter", "x")
            .tuning(0.3);
        let mut op = build_operator(&spec, &state).unwrap();
        op.optimize(20.0);
        let f = op.tuning().unwrap();
        assert!(f > 0.0 && f < 0.3);
    }
}
