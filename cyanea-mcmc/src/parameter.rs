//! Bounded, versioned scalar parameters.
//!
//! A [`Parameter`] is an ordered vector of reals or integers with inclusive
//! bounds. Writes go through [`Parameter::set`], which snapshots the vector
//! on the first write of a proposal and reports exactly what happened to an
//! out-of-range value according to the parameter's [`BoundsPolicy`].

use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use cyanea_core::{CyaneaError, Result, Versioned};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Element type of a parameter.
pub trait Scalar:
    Copy + PartialOrd + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Smallest representable bound ("unbounded below").
    const MIN: Self;
    /// Largest representable bound ("unbounded above").
    const MAX: Self;

    fn to_f64(self) -> f64;

    fn hash_bits(self) -> u64;
}

impl Scalar for f64 {
    const MIN: Self = f64::NEG_INFINITY;
    const MAX: Self = f64::INFINITY;

    fn to_f64(self) -> f64 {
        self
    }

    fn hash_bits(self) -> u64 {
        self.to_bits()
    }
}

impl Scalar for i64 {
    const MIN: Self = i64::MIN;
    const MAX: Self = i64::MAX;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn hash_bits(self) -> u64 {
        self as u64
    }
}

/// What a write outside `[lower, upper]` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundsPolicy {
    /// Leave the value alone and report [`Write::Rejected`]; the proposal is
    /// expected to return −∞.
    #[default]
    Reject,
    /// Store the nearest bound and report [`Write::Clamped`].
    Clamp,
}

/// Outcome of a single element write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    Applied,
    Clamped,
    Rejected,
}

/// Real- or integer-valued parameter with versioned snapshots.
#[derive(Debug, Clone)]
pub struct Parameter<T: Scalar> {
    id: String,
    values: Vec<T>,
    stored: Vec<T>,
    lower: T,
    upper: T,
    policy: BoundsPolicy,
    touched: bool,
    clamped: u64,
}

pub type RealParameter = Parameter<f64>;
pub type IntegerParameter = Parameter<i64>;

impl<T: Scalar> Parameter<T> {
    /// Unbounded parameter with the given initial values.
    pub fn new(id: impl Into<String>, values: Vec<T>) -> Result<Self> {
        let id = id.into();
        if values.is_empty() {
            return Err(CyaneaError::config(&id, "parameter needs at least one value"));
        }
        Ok(Self {
            stored: Vec::with_capacity(values.len()),
            id,
            values,
            lower: T::MIN,
            upper: T::MAX,
            policy: BoundsPolicy::Reject,
            touched: false,
            clamped: 0,
        })
    }

    /// Restrict to `[lower, upper]`.
    ///
    /// # Errors
    ///
    /// `Config` if `lower > upper` or a current value lies outside.
    pub fn with_bounds(mut self, lower: T, upper: T) -> Result<Self> {
        if !(lower <= upper) {
            return Err(CyaneaError::config(
                &self.id,
                format!("lower bound {:?} exceeds upper bound {:?}", lower, upper),
            ));
        }
        self.lower = lower;
        self.upper = upper;
        if let Some(v) = self.values.iter().find(|&&v| !self.admits(v)) {
            return Err(CyaneaError::config(
                &self.id,
                format!("initial value {:?} outside [{:?}, {:?}]", v, lower, upper),
            ));
        }
        Ok(self)
    }

    pub fn with_policy(mut self, policy: BoundsPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Value at `i`. Panics if `i` is out of range.
    pub fn value(&self, i: usize) -> T {
        self.values[i]
    }

    pub fn get(&self, i: usize) -> Option<T> {
        self.values.get(i).copied()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn lower(&self) -> T {
        self.lower
    }

    pub fn upper(&self) -> T {
        self.upper
    }

    pub fn policy(&self) -> BoundsPolicy {
        self.policy
    }

    /// Number of writes that were clamped since construction.
    pub fn clamped_writes(&self) -> u64 {
        self.clamped
    }

    fn admits(&self, v: T) -> bool {
        v >= self.lower && v <= self.upper
    }

    /// Write element `i`, touching the parameter first.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `i` is out of range.
    pub fn set(&mut self, i: usize, value: T) -> Result<Write> {
        if i >= self.values.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "parameter '{}': index {} out of range ({})",
                self.id,
                i,
                self.values.len()
            )));
        }
        if self.admits(value) {
            self.touch();
            self.values[i] = value;
            return Ok(Write::Applied);
        }
        // NaN compares false against both bounds and can never be clamped.
        let comparable = value.partial_cmp(&self.lower).is_some();
        match self.policy {
            BoundsPolicy::Clamp if comparable => {
                self.touch();
                self.values[i] = if value < self.lower { self.lower } else { self.upper };
                self.clamped += 1;
                Ok(Write::Clamped)
            }
            _ => Ok(Write::Rejected),
        }
    }

    /// Resize between proposal cycles. New slots repeat the last value.
    pub fn set_dimension(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(CyaneaError::InvalidInput(format!(
                "parameter '{}': dimension must be positive",
                self.id
            )));
        }
        self.touch();
        let last = self.values[self.values.len() - 1];
        self.values.resize(n, last);
        Ok(())
    }

    /// True if every element lies within the bounds.
    pub fn in_bounds(&self) -> bool {
        self.values.iter().all(|&v| self.admits(v))
    }

    pub fn checksum(&self) -> u64 {
        let mut h = DefaultHasher::new();
        for v in &self.values {
            v.hash_bits().hash(&mut h);
        }
        h.finish()
    }

    /// Plain-data copy for checkpoints. Infinite or extreme bounds are
    /// written as absent.
    pub fn snapshot(&self) -> ParameterSnapshot<T> {
        ParameterSnapshot {
            id: self.id.clone(),
            values: self.values.clone(),
            lower: (self.lower != T::MIN).then_some(self.lower),
            upper: (self.upper != T::MAX).then_some(self.upper),
            policy: self.policy,
        }
    }

    /// Rebuild from a checkpoint snapshot.
    pub fn from_snapshot(snapshot: ParameterSnapshot<T>) -> Result<Self> {
        Self::new(snapshot.id, snapshot.values)?
            .with_bounds(snapshot.lower.unwrap_or(T::MIN), snapshot.upper.unwrap_or(T::MAX))
            .map(|p| p.with_policy(snapshot.policy))
    }
}

impl<T: Scalar> Versioned for Parameter<T> {
    fn touch(&mut self) {
        if !self.touched {
            self.stored.clone_from(&self.values);
            self.touched = true;
        }
    }

    fn commit(&mut self) {
        self.touched = false;
    }

    fn rollback(&mut self) {
        if self.touched {
            std::mem::swap(&mut self.values, &mut self.stored);
            self.touched = false;
        }
    }

    fn is_touched(&self) -> bool {
        self.touched
    }
}

/// Serializable parameter state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Scalar")]
pub struct ParameterSnapshot<T> {
    pub id: String,
    pub values: Vec<T>,
    #[serde(default)]
    pub lower: Option<T>,
    #[serde(default)]
    pub upper: Option<T>,
    #[serde(default)]
    pub policy: BoundsPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate() -> RealParameter {
        RealParameter::new("rate", vec![1.0, 2.0])
            .unwrap()
            .with_bounds(0.0, 10.0)
            .unwrap()
    }

    #[test]
    fn reads_do_not_touch() {
        let p = rate();
        assert_eq!(p.value(1), 2.0);
        assert!(!p.is_touched());
    }

    #[test]
    fn rollback_restores_values() {
        let mut p = rate();
        assert_eq!(p.set(0, 5.0).unwrap(), Write::Applied);
        assert!(p.is_touched());
        p.set(1, 6.0).unwrap();
        p.rollback();
        assert_eq!(p.values(), &[1.0, 2.0]);
        assert!(!p.is_touched());
    }

    #[test]
    fn commit_is_final() {
        let mut p = rate();
        p.set(0, 3.0).unwrap();
        p.commit();
        p.rollback();
        assert_eq!(p.values(), &[3.0, 2.0]);
    }

    #[test]
    fn reject_policy_leaves_value() {
        let mut p = rate();
        assert_eq!(p.set(0, 11.0).unwrap(), Write::Rejected);
        assert_eq!(p.value(0), 1.0);
        assert!(!p.is_touched());
        assert_eq!(p.set(0, f64::NAN).unwrap(), Write::Rejected);
    }

    #[test]
    fn clamp_policy_signals() {
        let mut p = rate().with_policy(BoundsPolicy::Clamp);
        assert_eq!(p.set(0, -3.0).unwrap(), Write::Clamped);
        assert_eq!(p.value(0), 0.0);
        assert_eq!(p.set(1, 30.0).unwrap(), Write::Clamped);
        assert_eq!(p.value(1), 10.0);
        assert_eq!(p.clamped_writes(), 2);
        assert_eq!(p.set(1, f64::NAN).unwrap(), Write::Rejected);
        assert!(p.in_bounds());
    }

    #[test]
    fn bad_bounds_are_config_errors() {
        let p = RealParameter::new("x", vec![5.0]).unwrap();
        assert!(matches!(
            p.clone().with_bounds(1.0, 0.0),
            Err(CyaneaError::Config { .. })
        ));
        assert!(p.with_bounds(0.0, 1.0).is_err());
        assert!(RealParameter::new("empty", vec![]).is_err());
    }

    #[test]
    fn index_out_of_range() {
        let mut p = rate();
        assert!(p.set(2, 1.0).is_err());
    }

    #[test]
    fn dimension_change_rolls_back() {
        let mut p = IntegerParameter::new("k", vec![3]).unwrap();
        p.set_dimension(3).unwrap();
        assert_eq!(p.values(), &[3, 3, 3]);
        p.rollback();
        assert_eq!(p.dimension(), 1);
        assert!(p.set_dimension(0).is_err());
    }

    #[test]
    fn snapshot_skips_infinite_bounds() {
        let p = RealParameter::new("x", vec![0.5]).unwrap().with_bounds(0.0, f64::INFINITY).unwrap();
        let snap = p.snapshot();
        assert_eq!(snap.lower, Some(0.0));
        assert_eq!(snap.upper, None);
        let json = serde_json::to_string(&snap).unwrap();
        let back: ParameterSnapshot<f64> = serde_json::from_str(&json).unwrap();
        let q = RealParameter::from_snapshot(back).unwrap();
        assert_eq!(q.upper(), f64::INFINITY);
        assert_eq!(q.checksum(), p.checksum());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn rollback_is_bit_identical(
            init in proptest::collection::vec(-1e6f64..1e6, 1..8),
            writes in proptest::collection::vec((0usize..8, proptest::num::f64::ANY), 0..16),
        ) {
            let mut p = RealParameter::new("x", init.clone()).unwrap();
            let before: Vec<u64> = p.values().iter().map(|v| v.to_bits()).collect();
            for (i, v) in writes {
                let _ = p.set(i % init.len(), v);
            }
            p.rollback();
            let after: Vec<u64> = p.values().iter().map(|v| v.to_bits()).collect();
            prop_assert_eq!(before, after);
        }

        #[test]
        fn commit_then_rollback_keeps_writes(
            init in proptest::collection::vec(-10i64..10, 1..6),
            v in -100i64..100,
        ) {
            let mut p = IntegerParameter::new("k", init).unwrap();
            p.set(0, v).unwrap();
            p.commit();
            let committed = p.values().to_vec();
            p.rollback();
            prop_assert_eq!(p.values(), committed.as_slice());
        }
    }
}
