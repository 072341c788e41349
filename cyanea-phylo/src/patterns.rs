//! Leaf observations compressed into weighted site patterns.

use std::collections::BTreeMap;

use cyanea_core::{CyaneaError, Result};

/// Observations for one taxon across all patterns.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LeafData {
    /// One fully resolved state per pattern. The value `n_states` stands for
    /// "unknown" (gap or ambiguity) and contributes 1 for every state.
    States(Vec<usize>),
    /// Per-pattern partial likelihoods, `pattern * n_states + state`.
    Partials(Vec<f64>),
}

/// Site patterns shared by all taxa.
#[derive(Debug, Clone)]
pub struct PatternSet {
    n_states: usize,
    taxa: Vec<String>,
    leaves: Vec<LeafData>,
    weights: Vec<f64>,
}

impl PatternSet {
    /// Build from per-taxon observations and per-pattern weights.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if a taxon has the wrong number of patterns, a state
    /// is out of range, or a weight is negative.
    pub fn new(
        n_states: usize,
        taxa: Vec<String>,
        leaves: Vec<LeafData>,
        weights: Vec<f64>,
    ) -> Result<Self> {
        if taxa.len() != leaves.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "{} taxa but {} observation rows",
                taxa.len(),
                leaves.len()
            )));
        }
        let n_patterns = weights.len();
        if weights.iter().any(|&w| !(w >= 0.0)) {
            return Err(CyaneaError::InvalidInput("pattern weights must be non-negative".into()));
        }
        for (taxon, data) in taxa.iter().zip(&leaves) {
            let ok = match data {
                LeafData::States(s) => s.len() == n_patterns && s.iter().all(|&x| x <= n_states),
                LeafData::Partials(p) => {
                    p.len() == n_patterns * n_states && p.iter().all(|&x| x >= 0.0 && x.is_finite())
                }
            };
            if !ok {
                return Err(CyaneaError::InvalidInput(format!(
                    "taxon '{}': observations do not match {} patterns of {} states",
                    taxon, n_patterns, n_states
                )));
            }
        }
        Ok(Self {
            n_states,
            taxa,
            leaves,
            weights,
        })
    }

    /// Compress aligned sequences into unique columns with multiplicities.
    ///
    /// `encode` maps a character to a state index, or to `n_states` for
    /// unknown characters.
    pub fn from_sequences<F>(
        n_states: usize,
        taxa: &[&str],
        sequences: &[&[u8]],
        encode: F,
    ) -> Result<Self>
    where
        F: Fn(u8) -> usize,
    {
        if taxa.len() != sequences.len() || taxa.is_empty() {
            return Err(CyaneaError::InvalidInput(format!(
                "{} taxa but {} sequences",
                taxa.len(),
                sequences.len()
            )));
        }
        let n_sites = sequences[0].len();
        if sequences.iter().any(|s| s.len() != n_sites) {
            return Err(CyaneaError::InvalidInput("sequences must be aligned".into()));
        }

        // Column -> pattern index, in order of first appearance.
        let mut index: BTreeMap<Vec<usize>, usize> = BTreeMap::new();
        let mut columns: Vec<Vec<usize>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        for site in 0..n_sites {
            let column: Vec<usize> = sequences
                .iter()
                .map(|s| encode(s[site]).min(n_states))
                .collect();
            match index.get(&column) {
                Some(&k) => weights[k] += 1.0,
                None => {
                    index.insert(column.clone(), columns.len());
                    columns.push(column);
                    weights.push(1.0);
                }
            }
        }

        let leaves = (0..taxa.len())
            .map(|t| LeafData::States(columns.iter().map(|c| c[t]).collect()))
            .collect();
        Self::new(
            n_states,
            taxa.iter().map(|s| s.to_string()).collect(),
            leaves,
            weights,
        )
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    pub fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn leaf(&self, taxon: usize) -> &LeafData {
        &self.leaves[taxon]
    }

    /// Row of the taxon with the given name.
    pub fn taxon_index(&self, name: &str) -> Option<usize> {
        self.taxa.iter().position(|t| t == name)
    }
}

/// Map a nucleotide character to a state index: A=0, C=1, G=2, T/U=3,
/// anything else 4 (unknown).
pub fn nucleotide_state(base: u8) -> usize {
    match base {
        b'A' | b'a' => 0,
        b'C' | b'c' => 1,
        b'G' | b'g' => 2,
        b'T' | b't' | b'U' | b'u' => 3,
        _ => 4,
    }
}
