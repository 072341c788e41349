//! Concrete proposal operators.
//!
//! Every operator is built from an [`OperatorSpec`](crate::operator::OperatorSpec)
//! and keeps that spec, so the schedule can substitute, persist and report
//! operators without knowing their concrete type.

pub mod parameter;
pub mod tree;

use cyanea_core::{CyaneaError, Result};

use crate::kernel::{Kernel, BACTRIAN_M};
use crate::operator::OperatorSpec;

pub(crate) fn bactrian_kernel(spec: &OperatorSpec) -> Result<Kernel> {
    let m = spec.options.bactrian_m.unwrap_or(BACTRIAN_M);
    if !(0.0..1.0).contains(&m) {
        return Err(CyaneaError::config(
            &spec.id,
            format!("Bactrian shape must lie in [0, 1), got {}", m),
        ));
    }
    Ok(Kernel::Bactrian { m })
}

/// Copy of `spec` carrying `tuning`.
pub(crate) fn with_tuning(spec: &OperatorSpec, tuning: Option<f64>) -> OperatorSpec {
    let mut out = spec.clone();
    out.tuning = tuning;
    out
}

/// `log(x) + delta`, mapped back.
pub(crate) fn log_step(x: f64, delta: f64) -> f64 {
    (x.ln() + delta).exp()
}
