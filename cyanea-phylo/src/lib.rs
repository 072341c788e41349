//! Time trees and tree likelihoods for the Cyanea MCMC engine.
//!
//! - **Tree store** — [`TimeTree`], an arena of nodes with heights, O(1)
//!   rewiring and versioned snapshots
//! - **Newick** — read and write time trees
//! - **Substitution models** — Jukes-Cantor, HKY and general reversible
//!   models behind [`SubstitutionModel`]
//! - **Site models** — discrete rate categories, including discretised gamma
//! - **Pruning kernel** — [`LikelihoodCore`] and the incremental
//!   [`TreeLikelihood`] built on it

pub mod likelihood;
pub mod newick;
pub mod patterns;
pub mod site_model;
pub mod subst_model;
pub mod tree;
pub mod tree_likelihood;

pub use likelihood::{LikelihoodCore, Scaling};
pub use patterns::{nucleotide_state, LeafData, PatternSet};
pub use site_model::SiteModel;
pub use subst_model::{Hky, JukesCantor, Reversible, SubstitutionModel};
pub use tree::{Dirt, Node, NodeId, TimeTree, TreeSnapshot};
pub use tree_likelihood::TreeLikelihood;
