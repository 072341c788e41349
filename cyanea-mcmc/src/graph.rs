//! Dependency graph of cached calculations.
//!
//! Calculation nodes live in an arena. A node may only name inputs that
//! already exist when it is added, so index order is a topological order
//! and the graph cannot contain a cycle. Invalidation is pushed forward
//! from the values a proposal touched ([`Graph::propagate`]); evaluation
//! pulls, resolving dirty inputs before their consumers
//! ([`Graph::evaluate`]).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};

use cyanea_core::{CyaneaError, Dirtyable, Result, Versioned};
use tracing::trace;

use crate::density::LogDensity;
use crate::state::{Handle, State, StateKind, StateNodeId};

static NEXT_GRAPH_UID: AtomicU32 = AtomicU32::new(1);

/// Address of a calculation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CalcId {
    graph: u32,
    index: usize,
}

impl CalcId {
    pub fn index(self) -> usize {
        self.index
    }
}

/// Something a calculation node reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Input {
    State(StateNodeId),
    Calc(CalcId),
}

impl<K> From<Handle<K>> for Input {
    fn from(h: Handle<K>) -> Self {
        Input::State(h.node())
    }
}

impl From<StateNodeId> for Input {
    fn from(id: StateNodeId) -> Self {
        Input::State(id)
    }
}

impl From<CalcId> for Input {
    fn from(id: CalcId) -> Self {
        Input::Calc(id)
    }
}

/// Cached output of one density plus its proposal bookkeeping.
#[derive(Debug, Clone)]
pub struct CalcNode {
    name: String,
    inputs: Vec<Input>,
    value: f64,
    stored_value: f64,
    dirty: bool,
    stored_dirty: bool,
    stored: bool,
    changed: bool,
}

impl CalcNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    /// Last computed value, which may be stale if the node is dirty.
    pub fn value(&self) -> f64 {
        self.value
    }
}

impl Dirtyable for CalcNode {
    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// Read-only view handed to a density while it computes.
pub struct EvalContext<'a> {
    state: &'a State,
    nodes: &'a [CalcNode],
    graph: u32,
}

impl<'a> EvalContext<'a> {
    /// A state value by handle.
    pub fn get<K: StateKind>(&self, handle: Handle<K>) -> Result<&'a K> {
        self.state.get(handle)
    }

    /// The resolved value of an upstream calculation.
    pub fn value(&self, id: CalcId) -> Result<f64> {
        let node = self.node(id)?;
        if node.dirty {
            return Err(CyaneaError::invariant(
                "Graph",
                format!("input '{}' read before it was resolved", node.name),
            ));
        }
        Ok(node.value)
    }

    /// Whether `input` changed in the in-flight proposal: a touched state
    /// value, or an upstream node that recomputed.
    pub fn has_changed(&self, input: impl Into<Input>) -> bool {
        match input.into() {
            Input::State(id) => self.state.value(id).map(|v| v.is_touched()).unwrap_or(false),
            Input::Calc(id) => self.node(id).map(|n| n.changed).unwrap_or(false),
        }
    }

    fn node(&self, id: CalcId) -> Result<&'a CalcNode> {
        if id.graph != self.graph || id.index >= self.nodes.len() {
            return Err(CyaneaError::invariant(
                "Graph",
                format!("calculation {}#{} not part of this graph", id.graph, id.index),
            ));
        }
        Ok(&self.nodes[id.index])
    }
}

/// Arena of calculation nodes with a fixed edge list.
pub struct Graph {
    uid: u32,
    state_uid: Option<u32>,
    nodes: Vec<CalcNode>,
    densities: Vec<Box<dyn LogDensity>>,
    state_consumers: HashMap<StateNodeId, Vec<usize>>,
    calc_consumers: Vec<Vec<usize>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("uid", &self.uid)
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            uid: NEXT_GRAPH_UID.fetch_add(1, Ordering::Relaxed),
            state_uid: None,
            nodes: Vec::new(),
            densities: Vec::new(),
            state_consumers: HashMap::new(),
            calc_consumers: Vec::new(),
        }
    }

    /// Add a node computing `density`. Its inputs are the ones the density
    /// declares and must already exist. New nodes start dirty.
    ///
    /// # Errors
    ///
    /// `Config` if an input belongs to another graph, is not yet added, or
    /// refers to a state other than the one earlier nodes read.
    pub fn add(&mut self, name: impl Into<String>, density: Box<dyn LogDensity>) -> Result<CalcId> {
        let name = name.into();
        let inputs = density.inputs();
        for input in &inputs {
            match *input {
                Input::Calc(id) => {
                    if id.graph != self.uid || id.index >= self.nodes.len() {
                        return Err(CyaneaError::config(
                            &name,
                            "calculation input is not an earlier node of this graph",
                        ));
                    }
                }
                Input::State(id) => match self.state_uid {
                    Some(uid) if uid != id.state_uid() => {
                        return Err(CyaneaError::config(
                            &name,
                            "state input belongs to a different state",
                        ));
                    }
                    _ => self.state_uid = Some(id.state_uid()),
                },
            }
        }

        let index = self.nodes.len();
        for input in &inputs {
            match *input {
                Input::Calc(id) => self.calc_consumers[id.index].push(index),
                Input::State(id) => self.state_consumers.entry(id).or_default().push(index),
            }
        }
        self.nodes.push(CalcNode {
            name,
            inputs,
            value: f64::NAN,
            stored_value: f64::NAN,
            dirty: true,
            stored_dirty: true,
            stored: false,
            changed: false,
        });
        self.densities.push(density);
        self.calc_consumers.push(Vec::new());
        Ok(CalcId {
            graph: self.uid,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn check(&self, id: CalcId) -> Result<usize> {
        if id.graph != self.uid || id.index >= self.nodes.len() {
            return Err(CyaneaError::invariant(
                "Graph",
                format!("calculation {}#{} not part of this graph", id.graph, id.index),
            ));
        }
        Ok(id.index)
    }

    pub fn node(&self, id: CalcId) -> Result<&CalcNode> {
        let i = self.check(id)?;
        Ok(&self.nodes[i])
    }

    /// Look up a node by name.
    pub fn find(&self, name: &str) -> Option<CalcId> {
        self.nodes.iter().position(|n| n.name == name).map(|index| CalcId {
            graph: self.uid,
            index,
        })
    }

    pub fn is_dirty(&self, id: CalcId) -> Result<bool> {
        Ok(self.node(id)?.is_dirty())
    }

    fn store_node(&mut self, i: usize) {
        let node = &mut self.nodes[i];
        if !node.stored {
            node.stored_value = node.value;
            node.stored_dirty = node.dirty;
            node.stored = true;
            self.densities[i].store();
        }
    }

    /// Start a proposal cycle: dirty every node that transitively reads a
    /// touched value and store its cache. Returns the number of nodes
    /// affected.
    pub fn propagate(&mut self, touched: &[StateNodeId]) -> usize {
        for node in self.nodes.iter_mut() {
            node.changed = false;
        }
        let mut affected = vec![false; self.nodes.len()];
        for id in touched {
            if let Some(consumers) = self.state_consumers.get(id) {
                for &c in consumers {
                    affected[c] = true;
                }
            }
        }
        // Index order is topological, so one forward sweep reaches the
        // whole downstream closure.
        let mut count = 0;
        for i in 0..self.nodes.len() {
            if !affected[i] {
                continue;
            }
            count += 1;
            self.store_node(i);
            self.nodes[i].mark_dirty();
            for k in 0..self.calc_consumers[i].len() {
                let c = self.calc_consumers[i][k];
                affected[c] = true;
            }
        }
        trace!(touched = touched.len(), affected = count, "propagated");
        count
    }

    /// Value of `id`, recomputing dirty nodes it depends on first.
    ///
    /// # Errors
    ///
    /// `Invariant` if `state` is not the state the graph was built against;
    /// any error a density raises.
    pub fn evaluate(&mut self, id: CalcId, state: &State) -> Result<f64> {
        let target = self.check(id)?;
        if let Some(uid) = self.state_uid {
            if uid != state.uid() {
                return Err(CyaneaError::invariant(
                    "Graph",
                    "evaluated against a state it was not built from",
                ));
            }
        }

        // Dirty ancestors of the target, collected by walking inputs.
        let mut needed = vec![false; target + 1];
        let mut stack = vec![target];
        while let Some(i) = stack.pop() {
            if needed[i] || !self.nodes[i].dirty {
                continue;
            }
            needed[i] = true;
            for input in &self.nodes[i].inputs {
                if let Input::Calc(c) = *input {
                    stack.push(c.index);
                }
            }
        }

        for i in 0..=target {
            if !needed[i] {
                continue;
            }
            let recomputed = {
                let ctx = EvalContext {
                    state,
                    nodes: &self.nodes,
                    graph: self.uid,
                };
                let density = &mut self.densities[i];
                if density.requires_recalculation(&ctx) {
                    Some(density.calculate_log_density(&ctx)?)
                } else {
                    None
                }
            };
            let node = &mut self.nodes[i];
            if let Some(v) = recomputed {
                node.value = v;
                node.changed = true;
            }
            node.dirty = false;
        }
        Ok(self.nodes[target].value)
    }

    /// Cached value of a clean node.
    ///
    /// # Errors
    ///
    /// `Invariant` if the node is dirty.
    pub fn cached(&self, id: CalcId) -> Result<f64> {
        let node = self.node(id)?;
        if node.dirty {
            return Err(CyaneaError::invariant(
                "Graph",
                format!("cached value of dirty node '{}' requested", node.name),
            ));
        }
        Ok(node.value)
    }

    /// Keep everything computed in the in-flight proposal.
    pub fn accept(&mut self) {
        for i in 0..self.nodes.len() {
            if self.nodes[i].stored {
                self.densities[i].accept();
                self.nodes[i].stored = false;
            }
        }
    }

    /// Reinstate every cache stored by [`Graph::propagate`].
    pub fn restore(&mut self) {
        for i in 0..self.nodes.len() {
            let node = &mut self.nodes[i];
            if node.stored {
                node.value = node.stored_value;
                node.dirty = node.stored_dirty;
                node.stored = false;
                node.changed = false;
                self.densities[i].restore();
            }
        }
    }

    /// Dirty every node and ask every density to discard its internal
    /// caches, so the next evaluation recomputes from scratch. Stores
    /// first, so the result can still be accepted or restored.
    pub fn mark_all_dirty(&mut self) {
        for i in 0..self.nodes.len() {
            self.store_node(i);
            self.nodes[i].mark_dirty();
            self.densities[i].invalidate();
        }
    }

    /// Combined checksum over node values and density checksums.
    pub fn checksum(&self) -> u64 {
        let mut h = DefaultHasher::new();
        for (node, density) in self.nodes.iter().zip(&self.densities) {
            node.value.to_bits().hash(&mut h);
            node.dirty.hash(&mut h);
            density.checksum().hash(&mut h);
        }
        h.finish()
    }
}
