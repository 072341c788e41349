//! Among-site rate heterogeneity.
//!
//! A site model is a discrete mixture of relative rates. Each category gets
//! its own transition matrices; the root integrates over categories using
//! their proportions.

use core::f64::consts::PI;

use cyanea_core::{CyaneaError, Result};

/// Rate categories and their mixing proportions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SiteModel {
    rates: Vec<f64>,
    proportions: Vec<f64>,
}

impl SiteModel {
    /// A single category with relative rate 1.
    pub fn single() -> Self {
        Self {
            rates: vec![1.0],
            proportions: vec![1.0],
        }
    }

    /// Arbitrary categories.
    ///
    /// # Errors
    ///
    /// `Config` if the lengths differ, a rate is negative, or the
    /// proportions do not sum to 1.
    pub fn new(rates: Vec<f64>, proportions: Vec<f64>) -> Result<Self> {
        if rates.is_empty() || rates.len() != proportions.len() {
            return Err(CyaneaError::config(
                "SiteModel",
                format!(
                    "{} rates but {} proportions",
                    rates.len(),
                    proportions.len()
                ),
            ));
        }
        if rates.iter().any(|&r| !(r >= 0.0) || !r.is_finite()) {
            return Err(CyaneaError::config("SiteModel", "rates must be finite and non-negative"));
        }
        if proportions.iter().any(|&p| !(p >= 0.0)) {
            return Err(CyaneaError::config("SiteModel", "proportions must be non-negative"));
        }
        let total: f64 = proportions.iter().sum();
        if (total - 1.0).abs() > 1e-8 {
            return Err(CyaneaError::config(
                "SiteModel",
                format!("proportions sum to {}, expected 1", total),
            ));
        }
        Ok(Self { rates, proportions })
    }

    /// Discretised gamma with `n` equiprobable categories, each represented
    /// by the median of its bin, rescaled to mean rate 1.
    pub fn gamma(shape: f64, n: usize) -> Result<Self> {
        if !(shape > 0.0) || !shape.is_finite() {
            return Err(CyaneaError::config(
                "SiteModel",
                format!("gamma shape must be positive, got {}", shape),
            ));
        }
        if n == 0 {
            return Err(CyaneaError::config("SiteModel", "need at least one category"));
        }
        let mut rates = Vec::with_capacity(n);
        for i in 0..n {
            let q = (2 * i + 1) as f64 / (2 * n) as f64;
            // Gamma(shape, rate = shape) has mean 1.
            rates.push(gamma_quantile(shape, q) / shape);
        }
        let mean = rates.iter().sum::<f64>() / n as f64;
        for r in rates.iter_mut() {
            *r /= mean;
        }
        Self::new(rates, vec![1.0 / n as f64; n])
    }

    /// Add an invariant-sites category with proportion `p`, shrinking the
    /// other categories and raising their rates to keep the mean at 1.
    pub fn with_invariant(mut self, p: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(CyaneaError::config(
                "SiteModel",
                format!("invariant proportion must be in [0, 1), got {}", p),
            ));
        }
        for (r, w) in self.rates.iter_mut().zip(self.proportions.iter_mut()) {
            *r /= 1.0 - p;
            *w *= 1.0 - p;
        }
        self.rates.insert(0, 0.0);
        self.proportions.insert(0, p);
        Ok(self)
    }

    pub fn category_count(&self) -> usize {
        self.rates.len()
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn proportions(&self) -> &[f64] {
        &self.proportions
    }
}

impl Default for SiteModel {
    fn default() -> Self {
        Self::single()
    }
}

/// Quantile of the standard Gamma(shape, 1) distribution by bisection.
fn gamma_quantile(shape: f64, q: f64) -> f64 {
    let mut lo = 0.0;
    let mut hi = shape.max(1.0);
    while gamma_p(shape, hi) < q {
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if gamma_p(shape, mid) < q {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-14 * hi.max(1e-300) {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Regularized lower incomplete gamma function P(a, x).
fn gamma_p(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let ln_prefix = a * x.ln() - x - ln_gamma(a);
    if x < a + 1.0 {
        // Series expansion
        let mut sum = 1.0 / a;
        let mut term = sum;
        for n in 1..500 {
            term *= x / (a + n as f64);
            sum += term;
            if term.abs() < sum.abs() * 1e-15 {
                break;
            }
        }
        sum * ln_prefix.exp()
    } else {
        // Continued fraction for Q = 1 - P (modified Lentz)
        let tiny = 1e-300_f64;
        let mut b = x + 1.0 - a;
        let mut c = 1.0 / tiny;
        let mut d = 1.0 / b;
        let mut h = d;
        for i in 1..500 {
            let an = -(i as f64) * (i as f64 - a);
            b += 2.0;
            d = an * d + b;
            if d.abs() < tiny {
                d = tiny;
            }
            c = b + an / c;
            if c.abs() < tiny {
                c = tiny;
            }
            d = 1.0 / d;
            let delta = d * c;
            h *= delta;
            if (delta - 1.0).abs() < 1e-15 {
                break;
            }
        }
        1.0 - h * ln_prefix.exp()
    }
}

/// Natural log of the gamma function via the Lanczos approximation (g=7).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];
    if x < 0.5 {
        (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = 0.99999999999980993_f64;
        for (i, &c) in COEFFS.iter().enumerate() {
            ag += c / (x + i as f64 + 1.0);
        }
        let t = x + 7.5;
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_category() {
        let m = SiteModel::single();
        assert_eq!(m.category_count(), 1);
        assert_eq!(m.rates(), &[1.0]);
    }

    #[test]
    fn gamma_categories_have_mean_one() {
        let m = SiteModel::gamma(0.5, 4).unwrap();
        let mean: f64 = m
            .rates()
            .iter()
            .zip(m.proportions())
            .map(|(r, p)| r * p)
            .sum();
        assert!((mean - 1.0).abs() < 1e-12);
        assert!(m.rates().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn exponential_quantile() {
        // Gamma(1, 1) is Exp(1): median = ln 2.
        assert!((gamma_quantile(1.0, 0.5) - 2f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn invariant_category_preserves_mean() {
        let m = SiteModel::gamma(1.0, 4).unwrap().with_invariant(0.2).unwrap();
        assert_eq!(m.category_count(), 5);
        assert_eq!(m.rates()[0], 0.0);
        let mean: f64 = m.rates().iter().zip(m.proportions()).map(|(r, p)| r * p).sum();
        assert!((mean - 1.0).abs() < 1e-12);
    }

    #[test]
    fn invalid_site_models() {
        assert!(SiteModel::new(vec![1.0], vec![0.5]).is_err());
        assert!(SiteModel::new(vec![1.0, 2.0], vec![1.0]).is_err());
        assert!(SiteModel::new(vec![-1.0], vec![1.0]).is_err());
        assert!(SiteModel::gamma(0.0, 4).is_err());
        assert!(SiteModel::single().with_invariant(1.0).is_err());
    }
}
