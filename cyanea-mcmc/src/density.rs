//! Log-density plug-ins evaluated by graph nodes.

use cyanea_core::Result;
use cyanea_phylo::{TimeTree, TreeLikelihood};

use crate::graph::{CalcId, EvalContext, Input};
use crate::parameter::RealParameter;
use crate::state::Handle;

/// A cached log-density wrapped by a graph node.
///
/// The graph only calls into a density while its node is dirty. `store`,
/// `restore` and `accept` bracket each proposal that reaches the node, so
/// densities with internal caches can keep them in step with the chain.
pub trait LogDensity: Send {
    /// Everything this density reads. Fixed at construction.
    fn inputs(&self) -> Vec<Input>;

    fn calculate_log_density(&mut self, ctx: &EvalContext<'_>) -> Result<f64>;

    /// Whether the cached value is stale. Densities that can prove an
    /// input change does not affect them return `false`.
    fn requires_recalculation(&mut self, _ctx: &EvalContext<'_>) -> bool {
        true
    }

    fn store(&mut self) {}

    fn restore(&mut self) {}

    fn accept(&mut self) {}

    /// Drop internal caches so the next calculation starts from scratch.
    fn invalidate(&mut self) {}

    /// Checksum over internal state, for rollback checks.
    fn checksum(&self) -> Option<u64> {
        None
    }
}

/// Sum of upstream densities, e.g. posterior = prior + likelihood.
#[derive(Debug, Clone)]
pub struct Compound {
    terms: Vec<CalcId>,
}

impl Compound {
    pub fn new(terms: Vec<CalcId>) -> Self {
        Self { terms }
    }
}

impl LogDensity for Compound {
    fn inputs(&self) -> Vec<Input> {
        self.terms.iter().map(|&t| Input::Calc(t)).collect()
    }

    fn calculate_log_density(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
        let mut total = 0.0;
        for &t in &self.terms {
            let v = ctx.value(t)?;
            if v == f64::NEG_INFINITY {
                return Ok(v);
            }
            total += v;
        }
        Ok(total)
    }
}

/// Log-density of one or more real parameters given by a closure over
/// their value slices, in input order.
pub struct ParameterDensity {
    params: Vec<Handle<RealParameter>>,
    f: Box<dyn FnMut(&[&[f64]]) -> f64 + Send>,
}

impl ParameterDensity {
    pub fn new<F>(params: Vec<Handle<RealParameter>>, f: F) -> Self
    where
        F: FnMut(&[&[f64]]) -> f64 + Send + 'static,
    {
        Self {
            params,
            f: Box::new(f),
        }
    }
}

impl LogDensity for ParameterDensity {
    fn inputs(&self) -> Vec<Input> {
        self.params.iter().map(|&h| h.into()).collect()
    }

    fn calculate_log_density(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
        let mut values = Vec::with_capacity(self.params.len());
        for &h in &self.params {
            values.push(ctx.get(h)?.values());
        }
        Ok((self.f)(&values))
    }
}

/// Log-density of a tree given by a closure, e.g. a coalescent prior.
pub struct TreeDensity {
    tree: Handle<TimeTree>,
    f: Box<dyn FnMut(&TimeTree) -> f64 + Send>,
}

impl TreeDensity {
    pub fn new<F>(tree: Handle<TimeTree>, f: F) -> Self
    where
        F: FnMut(&TimeTree) -> f64 + Send + 'static,
    {
        Self {
            tree,
            f: Box::new(f),
        }
    }
}

impl LogDensity for TreeDensity {
    fn inputs(&self) -> Vec<Input> {
        vec![self.tree.into()]
    }

    fn calculate_log_density(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
        let tree = ctx.get(self.tree)?;
        Ok((self.f)(tree))
    }
}

/// Phylogenetic likelihood of the patterns on a tree.
///
/// Reads the tree, an optional strict-clock rate, and an optional vector of
/// substitution-model parameters. Model parameters are pushed into the
/// engine only when they differ from the values last applied, which also
/// covers rollbacks: after a rejected move the restored parameter no
/// longer matches and is pushed again on the next evaluation.
///
/// A cycle that is accepted without the likelihood being evaluated (when
/// sampling from the prior) commits tree changes whose dirt the engine never
/// saw; the next calculation then starts from scratch.
pub struct TreeLikelihoodDensity {
    tree: Handle<TimeTree>,
    clock_rate: Option<Handle<RealParameter>>,
    model_params: Option<Handle<RealParameter>>,
    likelihood: TreeLikelihood,
    applied: Vec<f64>,
    unseen: bool,
}

impl TreeLikelihoodDensity {
    pub fn new(tree: Handle<TimeTree>, likelihood: TreeLikelihood) -> Self {
        Self {
            tree,
            clock_rate: None,
            model_params: None,
            likelihood,
            applied: Vec::new(),
            unseen: false,
        }
    }

    pub fn with_clock_rate(mut self, rate: Handle<RealParameter>) -> Self {
        self.clock_rate = Some(rate);
        self
    }

    pub fn with_model_parameters(mut self, params: Handle<RealParameter>) -> Self {
        self.model_params = Some(params);
        self
    }

    pub fn likelihood(&self) -> &TreeLikelihood {
        &self.likelihood
    }
}

impl LogDensity for TreeLikelihoodDensity {
    fn inputs(&self) -> Vec<Input> {
        let mut inputs = vec![self.tree.into()];
        inputs.extend(self.clock_rate.map(Input::from));
        inputs.extend(self.model_params.map(Input::from));
        inputs
    }

    fn calculate_log_density(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
        let tree = ctx.get(self.tree)?;
        let rate = match self.clock_rate {
            Some(h) => ctx.get(h)?.value(0),
            None => 1.0,
        };
        if let Some(h) = self.model_params {
            let values = ctx.get(h)?.values();
            if values != self.applied.as_slice() {
                self.likelihood.set_model_parameters(values)?;
                self.applied.clear();
                self.applied.extend_from_slice(values);
            }
        }
        let logl = self.likelihood.calculate(tree, rate)?;
        self.unseen = false;
        Ok(logl)
    }

    fn store(&mut self) {
        self.likelihood.store();
        self.unseen = true;
    }

    fn restore(&mut self) {
        self.likelihood.restore();
        self.unseen = false;
    }

    fn accept(&mut self) {
        if self.unseen {
            self.likelihood.force_full_update();
            self.unseen = false;
        }
    }

    fn invalidate(&mut self) {
        self.likelihood.force_full_update();
    }

    fn checksum(&self) -> Option<u64> {
        Some(self.likelihood.log_likelihood().to_bits())
    }
}
