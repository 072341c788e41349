//! Metropolis-Hastings chain driver.
//!
//! One step selects an operator, lets it mutate the state, pushes the
//! touched values through the dependency graph, pulls the target density
//! and either commits or rolls everything back. The chain owns the only
//! PRNG and hands it to operators by `&mut`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use cyanea_core::{CyaneaError, Result};

use crate::checkpoint::{Checkpoint, CheckpointSink, SavedValue};
use crate::config::ChainConfig;
use crate::graph::{CalcId, Graph};
use crate::logger::{SampleLogger, SampleRecord};
use crate::rng::ChainRng;
use crate::schedule::{OperatorSchedule, Outcome, ScheduleReport};
use crate::state::State;

/// Tolerance between a cached and a fully recomputed target density.
const ROBUST_TOLERANCE: f64 = 1e-6;

/// Metropolis-Hastings acceptance probability `min(1, exp(r + h))`.
///
/// NaN ratios give zero.
pub fn acceptance_probability(log_posterior_ratio: f64, log_hastings: f64) -> f64 {
    let log_alpha = log_posterior_ratio + log_hastings;
    if log_alpha.is_nan() {
        0.0
    } else if log_alpha >= 0.0 {
        1.0
    } else {
        log_alpha.exp()
    }
}

/// Collects the pieces of a chain.
pub struct ChainBuilder {
    state: State,
    graph: Graph,
    posterior: CalcId,
    prior: Option<CalcId>,
    likelihood: Option<CalcId>,
    schedule: OperatorSchedule,
    config: ChainConfig,
    loggers: Vec<Box<dyn SampleLogger>>,
    sink: Option<Box<dyn CheckpointSink>>,
}

impl ChainBuilder {
    pub fn new(state: State, graph: Graph, posterior: CalcId) -> Self {
        Self {
            state,
            graph,
            posterior,
            prior: None,
            likelihood: None,
            schedule: OperatorSchedule::new(),
            config: ChainConfig::default(),
            loggers: Vec::new(),
            sink: None,
        }
    }

    pub fn prior(mut self, id: CalcId) -> Self {
        self.prior = Some(id);
        self
    }

    pub fn likelihood(mut self, id: CalcId) -> Self {
        self.likelihood = Some(id);
        self
    }

    pub fn schedule(mut self, schedule: OperatorSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Run configuration. Its `auto_optimize` and `optimize_delay` override
    /// the schedule's own settings.
    pub fn config(mut self, config: ChainConfig) -> Self {
        self.config = config;
        self
    }

    pub fn logger(mut self, logger: Box<dyn SampleLogger>) -> Self {
        self.loggers.push(logger);
        self
    }

    pub fn sink(mut self, sink: Box<dyn CheckpointSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// # Errors
    ///
    /// `Config` for an invalid configuration, an empty schedule, node ids
    /// from another graph, or `sample_from_prior` without a prior node.
    pub fn build(self) -> Result<Chain> {
        self.config.validate()?;
        if self.schedule.is_empty() {
            return Err(CyaneaError::config("Chain", "no operators in schedule"));
        }
        for id in [Some(self.posterior), self.prior, self.likelihood].into_iter().flatten() {
            self.graph
                .node(id)
                .map_err(|e| CyaneaError::config("Chain", e.to_string()))?;
        }
        let target = if self.config.sample_from_prior {
            self.prior.ok_or_else(|| {
                CyaneaError::config("Chain", "sample_from_prior requires a prior node")
            })?
        } else {
            self.posterior
        };
        if self.config.checksums && !cfg!(debug_assertions) {
            warn!("state checksums are only compared in debug builds");
        }
        let schedule = self
            .schedule
            .with_auto_optimize(self.config.auto_optimize)
            .with_optimize_delay(self.config.optimize_delay);
        Ok(Chain {
            rng: ChainRng::seed_from_u64(self.config.seed),
            next_sample: -(self.config.burn_in as i64),
            state: self.state,
            graph: self.graph,
            posterior: self.posterior,
            prior: self.prior,
            likelihood: self.likelihood,
            target,
            schedule,
            config: self.config,
            loggers: self.loggers,
            sink: self.sink,
            current: f64::NAN,
            initialized: false,
            proposals: 0,
            accepted: 0,
        })
    }
}

/// What a finished run reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSummary {
    pub samples: u64,
    pub accepted: u64,
    pub final_posterior: f64,
    pub operators: ScheduleReport,
}

impl ChainSummary {
    pub fn acceptance_rate(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.accepted as f64 / self.samples as f64
        }
    }
}

/// A single Markov chain.
pub struct Chain {
    state: State,
    graph: Graph,
    posterior: CalcId,
    prior: Option<CalcId>,
    likelihood: Option<CalcId>,
    target: CalcId,
    schedule: OperatorSchedule,
    config: ChainConfig,
    rng: ChainRng,
    loggers: Vec<Box<dyn SampleLogger>>,
    sink: Option<Box<dyn CheckpointSink>>,
    next_sample: i64,
    current: f64,
    initialized: bool,
    proposals: u64,
    accepted: u64,
}

impl Chain {
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn schedule(&self) -> &OperatorSchedule {
        &self.schedule
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Index of the next sample `run` will draw. Negative during burn-in.
    pub fn next_sample(&self) -> i64 {
        self.next_sample
    }

    /// Target log density of the current state.
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Evaluate the target once. A chain cannot start from a state whose
    /// target is not finite.
    fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if let Some(id) = self.state.first_invalid() {
            return Err(CyaneaError::config(
                "Chain",
                format!("initial value of '{}' violates its constraints", id),
            ));
        }
        let value = self.graph.evaluate(self.target, &self.state)?;
        if !value.is_finite() {
            let name = self.graph.node(self.target)?.name().to_string();
            return Err(CyaneaError::config(
                "Chain",
                format!("initial {} is {}; choose a starting state with positive density", name, value),
            ));
        }
        self.current = value;
        self.initialized = true;
        Ok(())
    }

    fn debug_checksum(&self) -> Option<(u64, u64)> {
        (cfg!(debug_assertions) && self.config.checksums)
            .then(|| (self.state.checksum(), self.graph.checksum()))
    }

    /// One proposal: propose, evaluate, accept or roll back, adapt.
    pub fn step(&mut self) -> Result<Outcome> {
        self.initialize()?;
        let index = self.schedule.select(&mut self.rng)?;
        let before = self.debug_checksum();

        let log_hr = self
            .schedule
            .operator_mut(index)
            .propose(&mut self.state, &mut self.rng)?;

        let (outcome, log_alpha) = if log_hr == f64::NEG_INFINITY || log_hr.is_nan() {
            self.state.rollback_all();
            (Outcome::Invalid, f64::NAN)
        } else {
            let touched = self.state.touched();
            self.graph.propagate(&touched);
            let mut proposed = if self.state.edits_valid() {
                self.graph.evaluate(self.target, &self.state)?
            } else {
                f64::NEG_INFINITY
            };
            let numeric = proposed.is_nan();
            if numeric {
                warn!(
                    operator = self.schedule.operator(index).id(),
                    "target density evaluated to NaN; rejecting"
                );
                proposed = f64::NEG_INFINITY;
            }

            let log_ratio = proposed - self.current;
            let p = acceptance_probability(log_ratio, log_hr);
            let accept = p >= 1.0 || (p > 0.0 && self.rng.uniform() < p);
            if accept {
                self.state.commit_all();
                self.graph.accept();
                self.current = proposed;
                (Outcome::Accepted, log_ratio + log_hr)
            } else {
                self.state.rollback_all();
                self.graph.restore();
                let outcome = if numeric { Outcome::Numeric } else { Outcome::Rejected };
                (outcome, log_ratio + log_hr)
            }
        };

        if outcome != Outcome::Accepted {
            if let Some(expected) = before {
                let after = (self.state.checksum(), self.graph.checksum());
                if after != expected {
                    return Err(CyaneaError::invariant(
                        "Chain",
                        format!(
                            "rollback after operator '{}' did not restore the previous state",
                            self.schedule.operator(index).id()
                        ),
                    ));
                }
            }
        }

        trace!(
            operator = self.schedule.operator(index).id(),
            ?outcome,
            log_hr,
            current = self.current,
            "proposal"
        );
        self.proposals += 1;
        if outcome == Outcome::Accepted {
            self.accepted += 1;
        }
        self.schedule.record(index, outcome);
        self.schedule.optimize(index, log_alpha);
        Ok(outcome)
    }

    /// Recompute everything from scratch and compare with the cached
    /// target.
    fn robust_check(&mut self, sample: i64) -> Result<()> {
        let cached = self.current;
        self.graph.mark_all_dirty();
        let full = self.graph.evaluate(self.target, &self.state)?;
        self.graph.accept();
        let agree = (full - cached).abs() <= ROBUST_TOLERANCE || full == cached;
        if !agree {
            return Err(CyaneaError::invariant(
                "Chain",
                format!(
                    "sample {}: cached target {} but full recomputation gives {}",
                    sample, cached, full
                ),
            ));
        }
        self.current = full;
        Ok(())
    }

    fn columns(&self) -> Vec<String> {
        self.state.log_columns().into_iter().map(|(c, _)| c).collect()
    }

    fn record(&mut self, sample: i64) -> Result<SampleRecord> {
        let posterior = self.graph.evaluate(self.posterior, &self.state)?;
        let prior = match self.prior {
            Some(id) => Some(self.graph.evaluate(id, &self.state)?),
            None => None,
        };
        let likelihood = match self.likelihood {
            Some(id) => Some(self.graph.evaluate(id, &self.state)?),
            None => None,
        };
        Ok(SampleRecord {
            sample,
            posterior,
            prior,
            likelihood,
            values: self.state.log_columns(),
        })
    }

    fn log_sample(&mut self, sample: i64) -> Result<()> {
        let record = self.record(sample)?;
        debug!(sample, posterior = record.posterior, "logged sample");
        for logger in &mut self.loggers {
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Snapshot of the committed state, the PRNG and the operators.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            sample: self.next_sample - 1,
            values: self.state.values().iter().map(SavedValue::capture).collect(),
            rng: self.rng.clone(),
            operators: self.schedule.export_state(),
        }
    }

    /// Continue from a checkpoint. Values are matched by id; derived
    /// calculations are recomputed.
    ///
    /// # Errors
    ///
    /// `Config` if a saved value has no counterpart of the same kind in
    /// this chain, or names an unknown operator.
    pub fn resume(&mut self, checkpoint: Checkpoint) -> Result<()> {
        for saved in checkpoint.values {
            let node = self.state.lookup_any(saved.id())?;
            self.state.replace(node, saved.restore()?)?;
        }
        self.schedule.import_state(&checkpoint.operators)?;
        self.rng = checkpoint.rng;
        self.next_sample = checkpoint.sample + 1;

        self.graph.mark_all_dirty();
        self.initialized = false;
        self.initialize()?;
        self.graph.accept();
        info!(sample = checkpoint.sample, posterior = self.current, "resumed from checkpoint");
        Ok(())
    }

    /// Run from the next sample to `chain_length`.
    pub fn run(&mut self) -> Result<ChainSummary> {
        self.initialize()?;
        let columns = self.columns();
        for logger in &mut self.loggers {
            logger.init(&columns)?;
        }
        let end = self.config.chain_length as i64;
        info!(
            seed = self.rng.seed(),
            chain_length = self.config.chain_length,
            burn_in = self.config.burn_in,
            start = self.next_sample,
            posterior = self.current,
            "chain started"
        );

        let proposals_before = self.proposals;
        let accepted_before = self.accepted;
        let log_every = self.config.log_every as i64;
        let mut last_logged = None;
        while self.next_sample < end {
            let sample = self.next_sample;
            self.step()?;
            self.next_sample = sample + 1;

            if sample >= 0 && sample % log_every == 0 {
                self.log_sample(sample)?;
                last_logged = Some(sample);
            }
            if let Some(every) = self.config.debug_check_every {
                if sample % every as i64 == 0 {
                    self.robust_check(sample)?;
                }
            }
            if let Some(every) = self.config.store_every {
                if sample >= 0 && sample % every as i64 == 0 {
                    let checkpoint = self.checkpoint();
                    if let Some(sink) = self.sink.as_mut() {
                        sink.save(&checkpoint)?;
                    }
                }
            }
        }
        let last = end - 1;
        if last >= 0 && self.proposals > proposals_before && last_logged != Some(last) {
            self.log_sample(last)?;
        }
        for logger in &mut self.loggers {
            logger.close()?;
        }

        let summary = ChainSummary {
            samples: self.proposals - proposals_before,
            accepted: self.accepted - accepted_before,
            final_posterior: self.graph.evaluate(self.posterior, &self.state)?,
            operators: self.schedule.report(),
        };
        info!(
            samples = summary.samples,
            acceptance = summary.acceptance_rate(),
            posterior = summary.final_posterior,
            "chain finished"
        );
        Ok(summary)
    }
}
