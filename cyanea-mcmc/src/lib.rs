//! Metropolis-Hastings inference over versioned state and a dependency
//! graph of cached log densities.
//!
//! - **State** — [`RealParameter`], [`IntegerParameter`] and time trees
//!   registered in a [`State`] and addressed by typed [`Handle`]s
//! - **Graph** — [`Graph`] nodes wrap [`LogDensity`] plug-ins; touched values
//!   dirty their consumers and only dirty nodes recompute
//! - **Operators** — proposal moves built from declarative [`OperatorSpec`]s
//!   and drawn by an adaptive [`OperatorSchedule`]
//! - **Chain** — [`Chain`] runs the accept/reject loop, logs samples and
//!   writes [`Checkpoint`]s
//!
//! ```no_run
//! use cyanea_mcmc::{
//!     ChainBuilder, ChainConfig, Compound, Graph, OperatorKind, OperatorSchedule,
//!     OperatorSpec, ParameterDensity, RealParameter, State,
//! };
//!
//! # fn main() -> cyanea_core::Result<()> {
//! let mut state = State::new();
//! let x = state.add(RealParameter::new("x", vec![0.0])?)?;
//!
//! let mut graph = Graph::new();
//! let prior = graph.add(
//!     "prior",
//!     Box::new(ParameterDensity::new(vec![x], |v| -0.5 * v[0][0] * v[0][0])),
//! )?;
//! let posterior = graph.add("posterior", Box::new(Compound::new(vec![prior])))?;
//!
//! let mut schedule = OperatorSchedule::new();
//! schedule.add_spec(
//!     &OperatorSpec::new("walk", OperatorKind::RandomWalk, 1.0).input("parameter", "x"),
//!     &state,
//! )?;
//!
//! let mut chain = ChainBuilder::new(state, graph, posterior)
//!     .prior(prior)
//!     .schedule(schedule)
//!     .config(ChainConfig { chain_length: 10_000, ..ChainConfig::default() })
//!     .build()?;
//! let summary = chain.run()?;
//! println!("{}", summary.operators);
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod density;
pub mod graph;
pub mod kernel;
pub mod logger;
pub mod operator;
pub mod operators;
pub mod parameter;
pub mod rng;
pub mod schedule;
pub mod state;

pub use chain::{acceptance_probability, Chain, ChainBuilder, ChainSummary};
pub use checkpoint::{Checkpoint, CheckpointSink, FileSink, SavedValue};
pub use config::ChainConfig;
pub use density::{Compound, LogDensity, ParameterDensity, TreeDensity, TreeLikelihoodDensity};
pub use graph::{CalcId, EvalContext, Graph, Input};
pub use kernel::Kernel;
pub use logger::{ess, MemoryLogger, SampleLogger, SampleRecord, TabLogger};
pub use operator::{build_operator, InputSpec, Operator, OperatorKind, OperatorOptions, OperatorSpec};
pub use parameter::{BoundsPolicy, IntegerParameter, Parameter, RealParameter, Write};
pub use rng::ChainRng;
pub use schedule::{
    Adaptation, OperatorSchedule, OperatorState, OperatorStats, Outcome, ScheduleReport,
    SubstitutionRule,
};
pub use state::{Handle, State, StateNodeId, StateValue};
