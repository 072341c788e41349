//! The proposal protocol and the declarative operator description.

use serde::{Deserialize, Serialize};

use cyanea_core::{CyaneaError, Result};

use crate::operators;
use crate::rng::ChainRng;
use crate::state::State;

/// A proposal mechanism.
///
/// `propose` mutates state through the state's setters and returns the log
/// Hastings ratio. `f64::NEG_INFINITY` means "reject without evaluating";
/// the chain then rolls back whatever the operator already changed.
pub trait Operator: Send {
    fn id(&self) -> &str;

    fn kind(&self) -> OperatorKind;

    fn propose(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<f64>;

    /// Current tuning value, for operators that adapt.
    fn tuning(&self) -> Option<f64> {
        None
    }

    fn set_tuning(&mut self, _value: f64) {}

    /// Move the tuning value by `delta` on the operator's own scale.
    fn optimize(&mut self, _delta: f64) {}

    fn target_acceptance(&self) -> f64 {
        0.234
    }

    /// Description that rebuilds this operator, with the current tuning.
    fn spec(&self) -> OperatorSpec;
}

/// Every operator kind the factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    RandomWalk,
    BactrianRandomWalk,
    Scale,
    BactrianScale,
    UpDown,
    DeltaExchange,
    IntegerRandomWalk,
    NodeHeight,
    SubtreeSlide,
    NarrowExchange,
    WideExchange,
    WilsonBalding,
}

impl OperatorKind {
    /// Input roles this kind knows how to use.
    pub fn accepted_roles(self) -> &'static [&'static str] {
        match self {
            OperatorKind::RandomWalk
            | OperatorKind::BactrianRandomWalk
            | OperatorKind::DeltaExchange
            | OperatorKind::IntegerRandomWalk => &["parameter"],
            OperatorKind::Scale | OperatorKind::BactrianScale => &["parameter", "tree"],
            OperatorKind::UpDown => &["up", "down"],
            OperatorKind::NodeHeight
            | OperatorKind::SubtreeSlide
            | OperatorKind::NarrowExchange
            | OperatorKind::WideExchange
            | OperatorKind::WilsonBalding => &["tree"],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OperatorKind::RandomWalk => "RandomWalk",
            OperatorKind::BactrianRandomWalk => "BactrianRandomWalk",
            OperatorKind::Scale => "Scale",
            OperatorKind::BactrianScale => "BactrianScale",
            OperatorKind::UpDown => "UpDown",
            OperatorKind::DeltaExchange => "DeltaExchange",
            OperatorKind::IntegerRandomWalk => "IntegerRandomWalk",
            OperatorKind::NodeHeight => "NodeHeight",
            OperatorKind::SubtreeSlide => "SubtreeSlide",
            OperatorKind::NarrowExchange => "NarrowExchange",
            OperatorKind::WideExchange => "WideExchange",
            OperatorKind::WilsonBalding => "WilsonBalding",
        }
    }
}

impl std::fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A named input: which state value plays which role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub role: String,
    pub value: String,
}

impl InputSpec {
    pub fn new(role: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            value: value.into(),
        }
    }
}

/// Kind-specific switches. Unused fields are ignored by kinds that have
/// no use for them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorOptions {
    /// Scale every element (or every internal node) with one factor.
    pub scale_all: bool,
    /// Tree scalers only move the root.
    pub root_only: bool,
    /// Delta-exchange weights, one per element.
    pub weights: Option<Vec<f64>>,
    /// Subtree slide draws its shift from a normal rather than a uniform.
    pub gaussian: bool,
    /// Shape of the Bactrian kernel.
    pub bactrian_m: Option<f64>,
    /// Override the default acceptance target.
    pub target_acceptance: Option<f64>,
}

/// Declarative operator description, built into an [`Operator`] against a
/// [`State`] by [`build_operator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSpec {
    pub id: String,
    pub kind: OperatorKind,
    pub weight: f64,
    #[serde(default)]
    pub tuning: Option<f64>,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub options: OperatorOptions,
}

impl OperatorSpec {
    pub fn new(id: impl Into<String>, kind: OperatorKind, weight: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            weight,
            tuning: None,
            inputs: Vec::new(),
            options: OperatorOptions::default(),
        }
    }

    pub fn input(mut self, role: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.push(InputSpec::new(role, value));
        self
    }

    pub fn tuning(mut self, tuning: f64) -> Self {
        self.tuning = Some(tuning);
        self
    }

    pub fn options(mut self, options: OperatorOptions) -> Self {
        self.options = options;
        self
    }

    /// Names bound to `role`, in declaration order.
    pub fn values_for<'a: 'r, 'r>(
        &'a self,
        role: &'r str,
    ) -> impl Iterator<Item = &'a str> + 'r {
        self.inputs
            .iter()
            .filter(move |i| i.role == role)
            .map(|i| i.value.as_str())
    }

    /// The single name bound to `role`.
    ///
    /// # Errors
    ///
    /// `Config` if the role is missing or bound more than once.
    pub fn single(&self, role: &str) -> Result<&str> {
        let mut it = self.values_for(role);
        match (it.next(), it.next()) {
            (Some(v), None) => Ok(v),
            (None, _) => Err(CyaneaError::config(
                &self.id,
                format!("{} operator needs a '{}' input", self.kind, role),
            )),
            (Some(_), Some(_)) => Err(CyaneaError::config(
                &self.id,
                format!("{} operator takes one '{}' input", self.kind, role),
            )),
        }
    }

    /// Check the spec is well formed for its kind.
    pub fn validate(&self) -> Result<()> {
        if !(self.weight > 0.0 && self.weight.is_finite()) {
            return Err(CyaneaError::config(
                &self.id,
                format!("operator weight must be positive, got {}", self.weight),
            ));
        }
        if let Some(t) = self.tuning {
            if !(t > 0.0 && t.is_finite()) {
                return Err(CyaneaError::config(
                    &self.id,
                    format!("tuning value must be positive, got {}", t),
                ));
            }
        }
        let accepted = self.kind.accepted_roles();
        if let Some(bad) = self.inputs.iter().find(|i| !accepted.contains(&i.role.as_str())) {
            return Err(CyaneaError::config(
                &self.id,
                format!("{} operator has no '{}' input", self.kind, bad.role),
            ));
        }
        Ok(())
    }
}

/// Build a boxed operator from its description.
///
/// # Errors
///
/// `Config` for malformed specs: unknown roles, missing inputs, inputs of
/// the wrong kind, or coupled inputs with mismatched dimensions.
pub fn build_operator(spec: &OperatorSpec, state: &State) -> Result<Box<dyn Operator>> {
    spec.validate()?;
    use operators::parameter::{DeltaExchange, IntegerRandomWalk, RandomWalk, Scale, UpDown};
    use operators::tree::{NarrowExchange, NodeHeight, SubtreeSlide, WideExchange, WilsonBalding};
    Ok(match spec.kind {
        OperatorKind::RandomWalk | OperatorKind::BactrianRandomWalk => {
            Box::new(RandomWalk::from_spec(spec, state)?)
        }
        OperatorKind::Scale | OperatorKind::BactrianScale => Box::new(Scale::from_spec(spec, state)?),
        OperatorKind::UpDown => Box::new(UpDown::from_spec(spec, state)?),
        OperatorKind::DeltaExchange => Box::new(DeltaExchange::from_spec(spec, state)?),
        OperatorKind::IntegerRandomWalk => Box::new(IntegerRandomWalk::from_spec(spec, state)?),
        OperatorKind::NodeHeight => Box::new(NodeHeight::from_spec(spec, state)?),
        OperatorKind::SubtreeSlide => Box::new(SubtreeSlide::from_spec(spec, state)?),
        OperatorKind::NarrowExchange => Box::new(NarrowExchange::from_spec(spec, state)?),
        OperatorKind::WideExchange => Box::new(WideExchange::from_spec(spec, state)?),
        OperatorKind::WilsonBalding => Box::new(WilsonBalding::from_spec(spec, state)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::RealParameter;

    #[test]
    fn spec_roundtrips_through_json() {
        let spec = OperatorSpec::new("kappaScaler", OperatorKind::Scale, 3.0)
            .input("parameter", "kappa")
            .tuning(0.5);
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"scale\""));
        let back: OperatorSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn minimal_json_gets_defaults() {
        let spec: OperatorSpec = serde_json::from_str(
            r#"{"id":"slide","kind":"subtree_slide","weight":15,"inputs":[{"role":"tree","value":"t"}]}"#,
        )
        .unwrap();
        assert_eq!(spec.tuning, None);
        assert!(!spec.options.gaussian);
        assert_eq!(spec.single("tree").unwrap(), "t");
    }

    #[test]
    fn bound_names_outlive_the_role() {
        let spec = OperatorSpec::new("upDown", OperatorKind::UpDown, 1.0)
            .input("up", "mu")
            .input("up", "rate")
            .input("down", "t");
        let up: Vec<&str> = {
            let role = String::from("up");
            spec.values_for(&role).collect()
        };
        assert_eq!(up, ["mu", "rate"]);
        let down = spec.single(&String::from("down")).unwrap();
        assert_eq!(down, "t");
        assert!(spec.single("up").is_err());
    }

    #[test]
    fn unknown_role_fails_loudly() {
        let spec = OperatorSpec::new("rw", OperatorKind::RandomWalk, 1.0).input("tree", "t");
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("rw"));
        assert!(err.to_string().contains("tree"));
    }

    #[test]
    fn bad_weights_rejected() {
        let spec = OperatorSpec::new("x", OperatorKind::RandomWalk, 0.0).input("parameter", "p");
        assert!(spec.validate().is_err());
        let spec = OperatorSpec::new("x", OperatorKind::RandomWalk, 1.0)
            .input("parameter", "p")
            .tuning(-1.0);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn factory_resolves_inputs() {
        let mut state = State::new();
        state.add(RealParameter::new("p", vec![1.0]).unwrap()).unwrap();
        let spec = OperatorSpec::new("rw", OperatorKind::BactrianRandomWalk, 1.0)
            .input("parameter", "p");
        let op = build_operator(&spec, &state).unwrap();
        assert_eq!(op.kind(), OperatorKind::BactrianRandomWalk);
        assert_eq!(op.target_acceptance(), 0.3);
        assert_eq!(op.id(), "rw");

        let missing = OperatorSpec::new("rw", OperatorKind::RandomWalk, 1.0).input("parameter", "q");
        assert!(matches!(
            build_operator(&missing, &state),
            Err(CyaneaError::Config { .. })
        ));
        let none = OperatorSpec::new("rw", OperatorKind::RandomWalk, 1.0);
        assert!(build_operator(&none, &state).is_err());
    }
}
