//! Registry of the mutable values a chain samples.
//!
//! A [`State`] owns every parameter and tree by value in a flat arena and
//! hands out typed [`Handle`]s. Handles carry the owning state's unique id,
//! so a handle that leaks from one chain to another is caught on first use
//! instead of silently addressing the wrong slot.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use cyanea_core::{CyaneaError, Result, Versioned};
use cyanea_phylo::TimeTree;

use crate::parameter::{IntegerParameter, RealParameter};

static NEXT_STATE_UID: AtomicU32 = AtomicU32::new(1);

/// One sampled value.
#[derive(Debug, Clone)]
pub enum StateValue {
    Real(RealParameter),
    Integer(IntegerParameter),
    Tree(TimeTree),
}

impl StateValue {
    pub fn id(&self) -> &str {
        match self {
            StateValue::Real(p) => p.id(),
            StateValue::Integer(p) => p.id(),
            StateValue::Tree(t) => t.id(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            StateValue::Real(_) => RealParameter::KIND,
            StateValue::Integer(_) => IntegerParameter::KIND,
            StateValue::Tree(_) => TimeTree::KIND,
        }
    }

    pub fn checksum(&self) -> u64 {
        match self {
            StateValue::Real(p) => p.checksum(),
            StateValue::Integer(p) => p.checksum(),
            StateValue::Tree(t) => t.checksum(),
        }
    }

    /// True unless a parameter element lies outside its bounds or a tree
    /// has a child older than its parent.
    pub fn is_valid(&self) -> bool {
        match self {
            StateValue::Real(p) => p.in_bounds(),
            StateValue::Integer(p) => p.in_bounds(),
            StateValue::Tree(t) => t.heights_valid(),
        }
    }

    /// Flat `(column, value)` pairs for trace logging. Multi-dimensional
    /// parameters get `id.1`, `id.2`, ...; trees log their root height.
    pub fn log_columns(&self, out: &mut Vec<(String, f64)>) {
        fn flat<T: crate::parameter::Scalar>(
            id: &str,
            values: &[T],
            out: &mut Vec<(String, f64)>,
        ) {
            if values.len() == 1 {
                out.push((id.to_string(), values[0].to_f64()));
            } else {
                for (i, v) in values.iter().enumerate() {
                    out.push((format!("{}.{}", id, i + 1), v.to_f64()));
                }
            }
        }
        match self {
            StateValue::Real(p) => flat(p.id(), p.values(), out),
            StateValue::Integer(p) => flat(p.id(), p.values(), out),
            StateValue::Tree(t) => out.push((format!("{}.height", t.id()), t.height(t.root()))),
        }
    }
}

impl Versioned for StateValue {
    fn touch(&mut self) {
        match self {
            StateValue::Real(p) => p.touch(),
            StateValue::Integer(p) => p.touch(),
            StateValue::Tree(t) => t.touch(),
        }
    }

    fn commit(&mut self) {
        match self {
            StateValue::Real(p) => p.commit(),
            StateValue::Integer(p) => p.commit(),
            StateValue::Tree(t) => t.commit(),
        }
    }

    fn rollback(&mut self) {
        match self {
            StateValue::Real(p) => p.rollback(),
            StateValue::Integer(p) => p.rollback(),
            StateValue::Tree(t) => t.rollback(),
        }
    }

    fn is_touched(&self) -> bool {
        match self {
            StateValue::Real(p) => p.is_touched(),
            StateValue::Integer(p) => p.is_touched(),
            StateValue::Tree(t) => t.is_touched(),
        }
    }
}

/// Types that can live in a [`State`].
pub trait StateKind: Sized {
    const KIND: &'static str;

    fn id_of(&self) -> &str;
    fn from_value(value: &StateValue) -> Option<&Self>;
    fn from_value_mut(value: &mut StateValue) -> Option<&mut Self>;
    fn into_value(self) -> StateValue;
}

impl StateKind for RealParameter {
    const KIND: &'static str = "real parameter";

    fn id_of(&self) -> &str {
        self.id()
    }

    fn from_value(value: &StateValue) -> Option<&Self> {
        match value {
            StateValue::Real(p) => Some(p),
            _ => None,
        }
    }

    fn from_value_mut(value: &mut StateValue) -> Option<&mut Self> {
        match value {
            StateValue::Real(p) => Some(p),
            _ => None,
        }
    }

    fn into_value(self) -> StateValue {
        StateValue::Real(self)
    }
}

impl StateKind for IntegerParameter {
    const KIND: &'static str = "integer parameter";

    fn id_of(&self) -> &str {
        self.id()
    }

    fn from_value(value: &StateValue) -> Option<&Self> {
        match value {
            StateValue::Integer(p) => Some(p),
            _ => None,
        }
    }

    fn from_value_mut(value: &mut StateValue) -> Option<&mut Self> {
        match value {
            StateValue::Integer(p) => Some(p),
            _ => None,
        }
    }

    fn into_value(self) -> StateValue {
        StateValue::Integer(self)
    }
}

impl StateKind for TimeTree {
    const KIND: &'static str = "tree";

    fn id_of(&self) -> &str {
        self.id()
    }

    fn from_value(value: &StateValue) -> Option<&Self> {
        match value {
            StateValue::Tree(t) => Some(t),
            _ => None,
        }
    }

    fn from_value_mut(value: &mut StateValue) -> Option<&mut Self> {
        match value {
            StateValue::Tree(t) => Some(t),
            _ => None,
        }
    }

    fn into_value(self) -> StateValue {
        StateValue::Tree(self)
    }
}

/// Untyped address of a value inside a particular [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateNodeId {
    state: u32,
    index: usize,
}

impl StateNodeId {
    pub fn index(self) -> usize {
        self.index
    }

    pub(crate) fn state_uid(self) -> u32 {
        self.state
    }
}

/// Typed address of a value inside a particular [`State`].
pub struct Handle<K> {
    node: StateNodeId,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    pub fn node(self) -> StateNodeId {
        self.node
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl<K> Eq for Handle<K> {}

impl<K> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}#{})", self.node.state, self.node.index)
    }
}

/// The set of values a chain samples.
#[derive(Debug)]
pub struct State {
    uid: u32,
    values: Vec<StateValue>,
    edited: Vec<usize>,
    in_edit_list: Vec<bool>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        Self {
            uid: NEXT_STATE_UID.fetch_add(1, Ordering::Relaxed),
            values: Vec::new(),
            edited: Vec::new(),
            in_edit_list: Vec::new(),
        }
    }

    /// Register a value.
    ///
    /// # Errors
    ///
    /// `Config` if another value already uses the same id.
    pub fn add<K: StateKind>(&mut self, value: K) -> Result<Handle<K>> {
        if self.values.iter().any(|v| v.id() == value.id_of()) {
            return Err(CyaneaError::config(
                "State",
                format!("duplicate state value id '{}'", value.id_of()),
            ));
        }
        self.values.push(value.into_value());
        self.in_edit_list.push(false);
        Ok(Handle {
            node: StateNodeId {
                state: self.uid,
                index: self.values.len() - 1,
            },
            _kind: PhantomData,
        })
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn check(&self, node: StateNodeId) -> Result<usize> {
        if node.state != self.uid || node.index >= self.values.len() {
            return Err(CyaneaError::invariant(
                "State",
                format!(
                    "value {}#{} not registered with the active chain",
                    node.state, node.index
                ),
            ));
        }
        Ok(node.index)
    }

    fn mismatch<K: StateKind>(&self, index: usize) -> CyaneaError {
        CyaneaError::invariant(
            "State",
            format!(
                "value '{}' is a {}, not a {}",
                self.values[index].id(),
                self.values[index].kind_name(),
                K::KIND
            ),
        )
    }

    /// Read access. Never snapshots.
    pub fn get<K: StateKind>(&self, handle: Handle<K>) -> Result<&K> {
        let i = self.check(handle.node)?;
        K::from_value(&self.values[i]).ok_or_else(|| self.mismatch::<K>(i))
    }

    /// Write access. The value joins this proposal's edit list; its own
    /// setters take the snapshot on first change.
    pub fn get_mut<K: StateKind>(&mut self, handle: Handle<K>) -> Result<&mut K> {
        let i = self.check(handle.node)?;
        if K::from_value(&self.values[i]).is_none() {
            return Err(self.mismatch::<K>(i));
        }
        if !self.in_edit_list[i] {
            self.in_edit_list[i] = true;
            self.edited.push(i);
        }
        K::from_value_mut(&mut self.values[i])
            .ok_or_else(|| CyaneaError::invariant("State", format!("slot {} changed kind", i)))
    }

    pub fn value(&self, node: StateNodeId) -> Result<&StateValue> {
        let i = self.check(node)?;
        Ok(&self.values[i])
    }

    pub fn values(&self) -> &[StateValue] {
        &self.values
    }

    /// Address of the value registered under `name`. Meant for model
    /// loading, not for per-proposal use.
    pub fn lookup<K: StateKind>(&self, name: &str) -> Result<Handle<K>> {
        let node = self.lookup_any(name)?;
        if K::from_value(&self.values[node.index]).is_none() {
            return Err(CyaneaError::config(
                "State",
                format!(
                    "'{}' is a {}, expected a {}",
                    name,
                    self.values[node.index].kind_name(),
                    K::KIND
                ),
            ));
        }
        Ok(Handle {
            node,
            _kind: PhantomData,
        })
    }

    pub fn lookup_any(&self, name: &str) -> Result<StateNodeId> {
        self.values
            .iter()
            .position(|v| v.id() == name)
            .map(|index| StateNodeId {
                state: self.uid,
                index,
            })
            .ok_or_else(|| CyaneaError::config("State", format!("no state value named '{}'", name)))
    }

    /// Values that actually changed in the in-flight proposal.
    pub fn touched(&self) -> Vec<StateNodeId> {
        self.edited
            .iter()
            .filter(|&&i| self.values[i].is_touched())
            .map(|&index| StateNodeId {
                state: self.uid,
                index,
            })
            .collect()
    }

    /// True if every value edited in the in-flight proposal satisfies its
    /// bounds and ordering constraints.
    pub fn edits_valid(&self) -> bool {
        self.edited.iter().all(|&i| self.values[i].is_valid())
    }

    /// Id of the first value that violates its constraints, if any.
    pub fn first_invalid(&self) -> Option<&str> {
        self.values.iter().find(|v| !v.is_valid()).map(|v| v.id())
    }

    pub fn commit_all(&mut self) {
        for &i in &self.edited {
            self.values[i].commit();
            self.in_edit_list[i] = false;
        }
        self.edited.clear();
    }

    pub fn rollback_all(&mut self) {
        for &i in &self.edited {
            self.values[i].rollback();
            self.in_edit_list[i] = false;
        }
        self.edited.clear();
    }

    /// Replace a value wholesale between proposal cycles, keeping its slot.
    pub(crate) fn replace(&mut self, node: StateNodeId, value: StateValue) -> Result<()> {
        let i = self.check(node)?;
        if std::mem::discriminant(&self.values[i]) != std::mem::discriminant(&value)
            || self.values[i].id() != value.id()
        {
            return Err(CyaneaError::config(
                "State",
                format!(
                    "cannot replace {} '{}' with {} '{}'",
                    self.values[i].kind_name(),
                    self.values[i].id(),
                    value.kind_name(),
                    value.id()
                ),
            ));
        }
        self.values[i] = value;
        Ok(())
    }

    /// Combined checksum over every value.
    pub fn checksum(&self) -> u64 {
        let mut h = DefaultHasher::new();
        for v in &self.values {
            v.checksum().hash(&mut h);
        }
        h.finish()
    }

    /// Flat log columns over every value, in registration order.
    pub fn log_columns(&self) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        for v in &self.values {
            v.log_columns(&mut out);
        }
        out
    }
}
