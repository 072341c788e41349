//! Proposal kernels shared by the random-walk and scale operators.

use serde::{Deserialize, Serialize};

use crate::rng::ChainRng;

/// Default Bactrian shape: the two humps sit at ±0.95 standard deviations.
pub const BACTRIAN_M: f64 = 0.95;

/// Shape of a unit-scale proposal step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kernel {
    /// Uniform on `(-1, 1)`.
    Uniform,
    /// Mixture of two normals centred at `±m` with variance `1 - m²`, so the
    /// step has unit variance and rarely lands near zero.
    Bactrian { m: f64 },
}

impl Kernel {
    pub fn bactrian() -> Self {
        Kernel::Bactrian { m: BACTRIAN_M }
    }

    pub fn is_bactrian(&self) -> bool {
        matches!(self, Kernel::Bactrian { .. })
    }

    /// Draw one symmetric step.
    pub fn draw(&self, rng: &mut ChainRng) -> f64 {
        match *self {
            Kernel::Uniform => rng.uniform_in(-1.0, 1.0),
            Kernel::Bactrian { m } => {
                let step = m + rng.normal() * (1.0 - m * m).sqrt();
                if rng.coin() {
                    -step
                } else {
                    step
                }
            }
        }
    }

    /// Acceptance rate adaptation aims for.
    pub fn target_acceptance(&self) -> f64 {
        match self {
            Kernel::Uniform => 0.234,
            Kernel::Bactrian { .. } => 0.3,
        }
    }
}
