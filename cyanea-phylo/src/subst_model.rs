//! Substitution models for N-state characters.
//!
//! A model turns an expected number of substitutions into a row-major
//! transition probability matrix `P(d) = exp(Q d)`. The pruning kernel owns
//! one flat buffer per branch and category and asks the model to fill it.

use cyanea_core::{CyaneaError, Result};

/// Entries more negative than this are treated as a broken model rather than
/// rounding noise.
const NEGATIVE_TOLERANCE: f64 = -1e-12;

/// Trait for substitution models of any state count.
pub trait SubstitutionModel: Send + Sync {
    /// Name used in error messages.
    fn name(&self) -> &str;

    /// Number of character states (2 for binary, 4 for DNA).
    fn n_states(&self) -> usize;

    /// Equilibrium frequencies, one per state.
    fn frequencies(&self) -> &[f64];

    /// Fill `out` (length `n_states²`, row-major, `out[i * n + j]` is the
    /// probability of ending in `j` from `i`) for a branch of the given
    /// length evolving at `rate`.
    fn transition_probabilities(&self, branch_length: f64, rate: f64, out: &mut [f64]);

    /// Replace the model's free parameters.
    ///
    /// # Errors
    ///
    /// `Config` if the values are malformed for this model.
    fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        if values.is_empty() {
            Ok(())
        } else {
            Err(CyaneaError::config(
                self.name(),
                format!("model has no free parameters, got {}", values.len()),
            ))
        }
    }

    /// Number of free parameters in the model (excludes branch lengths).
    fn n_free_params(&self) -> usize {
        0
    }
}

/// Check a freshly computed matrix and snap rounding noise below zero to 0.
///
/// # Errors
///
/// `Config` naming `model` when an entry is NaN or clearly negative.
pub fn validate_matrix(model: &str, matrix: &mut [f64]) -> Result<()> {
    for p in matrix.iter_mut() {
        if p.is_nan() || *p < NEGATIVE_TOLERANCE {
            return Err(CyaneaError::config(
                model,
                format!("invalid transition probability {}", p),
            ));
        }
        if *p < 0.0 {
            *p = 0.0;
        }
    }
    Ok(())
}

fn check_frequencies(model: &str, freqs: &[f64]) -> Result<()> {
    if freqs.iter().any(|&f| !(f > 0.0) || !f.is_finite()) {
        return Err(CyaneaError::config(model, "frequencies must be positive"));
    }
    let sum: f64 = freqs.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        return Err(CyaneaError::config(
            model,
            format!("frequencies sum to {}, expected 1", sum),
        ));
    }
    Ok(())
}

/// Jukes-Cantor model generalized to `n` equiprobable states, normalized to
/// one expected substitution per unit distance.
///
/// For two states this is `P_same(d) = 0.5 + 0.5·exp(-2d)`.
#[derive(Debug, Clone)]
pub struct JukesCantor {
    n: usize,
    freqs: Vec<f64>,
}

impl JukesCantor {
    pub fn new(n_states: usize) -> Result<Self> {
        if n_states < 2 {
            return Err(CyaneaError::config(
                "JukesCantor",
                format!("need at least 2 states, got {}", n_states),
            ));
        }
        Ok(Self {
            n: n_states,
            freqs: vec![1.0 / n_states as f64; n_states],
        })
    }

    /// The classic 4-state nucleotide JC69.
    pub fn nucleotide() -> Self {
        Self {
            n: 4,
            freqs: vec![0.25; 4],
        }
    }
}

impl SubstitutionModel for JukesCantor {
    fn name(&self) -> &str {
        "JukesCantor"
    }

    fn n_states(&self) -> usize {
        self.n
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn transition_probabilities(&self, branch_length: f64, rate: f64, out: &mut [f64]) {
        let n = self.n as f64;
        let e = (-n / (n - 1.0) * branch_length * rate).exp();
        let same = 1.0 / n + (n - 1.0) / n * e;
        let diff = 1.0 / n - e / n;
        for i in 0..self.n {
            for j in 0..self.n {
                out[i * self.n + j] = if i == j { same } else { diff };
            }
        }
    }
}

/// General time-reversible model on `n` states, solved by eigendecomposition
/// of the symmetrized rate matrix.
#[derive(Debug, Clone)]
pub struct Reversible {
    name: String,
    n: usize,
    freqs: Vec<f64>,
    /// Upper-triangle exchangeabilities, row by row.
    rates: Vec<f64>,
    eigenvalues: Vec<f64>,
    /// Column `k` is the k-th eigenvector, row-major `n x n`.
    eigenvectors: Vec<f64>,
    sqrt_pi: Vec<f64>,
}

impl Reversible {
    /// Build a model from the `n(n-1)/2` upper-triangle exchangeabilities
    /// (row by row) and equilibrium frequencies.
    pub fn new(name: impl Into<String>, rates: Vec<f64>, freqs: Vec<f64>) -> Result<Self> {
        let name = name.into();
        let n = freqs.len();
        check_frequencies(&name, &freqs)?;
        let mut model = Self {
            name,
            n,
            sqrt_pi: freqs.iter().map(|f| f.sqrt()).collect(),
            freqs,
            rates: Vec::new(),
            eigenvalues: vec![0.0; n],
            eigenvectors: vec![0.0; n * n],
        };
        model.set_rates(rates)?;
        Ok(model)
    }

    /// Nucleotide GTR with rates in the order AC, AG, AT, CG, CT, GT.
    pub fn gtr(rates: [f64; 6], freqs: [f64; 4]) -> Result<Self> {
        Self::new("GTR", rates.to_vec(), freqs.to_vec())
    }

    fn set_rates(&mut self, rates: Vec<f64>) -> Result<()> {
        let expected = self.n * (self.n - 1) / 2;
        if rates.len() != expected {
            return Err(CyaneaError::config(
                &self.name,
                format!("expected {} exchangeabilities, got {}", expected, rates.len()),
            ));
        }
        if rates.iter().any(|&r| !(r >= 0.0) || !r.is_finite()) {
            return Err(CyaneaError::config(
                &self.name,
                "exchangeabilities must be finite and non-negative",
            ));
        }
        self.rates = rates;
        let q = build_rate_matrix(self.n, &self.rates, &self.freqs);

        // B = diag(sqrt(pi)) * Q * diag(1/sqrt(pi)) is symmetric.
        let n = self.n;
        let mut b = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                b[i * n + j] = self.sqrt_pi[i] * q[i * n + j] / self.sqrt_pi[j];
            }
        }
        let (values, vectors) = eigen_decompose(n, b);
        self.eigenvalues = values;
        self.eigenvectors = vectors;
        Ok(())
    }

    /// Current exchangeabilities.
    pub fn rates(&self) -> &[f64] {
        &self.rates
    }
}

impl SubstitutionModel for Reversible {
    fn name(&self) -> &str {
        &self.name
    }

    fn n_states(&self) -> usize {
        self.n
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    // P(d) = diag(1/sqrt(pi)) * U * exp(Lambda d) * U^T * diag(sqrt(pi))
    fn transition_probabilities(&self, branch_length: f64, rate: f64, out: &mut [f64]) {
        let n = self.n;
        let d = branch_length * rate;
        let exp_l: Vec<f64> = self.eigenvalues.iter().map(|&l| (l * d).exp()).collect();
        let u = &self.eigenvectors;
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for k in 0..n {
                    sum += u[i * n + k] * exp_l[k] * u[j * n + k];
                }
                out[i * n + j] = sum * self.sqrt_pi[j] / self.sqrt_pi[i];
            }
        }
    }

    fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        self.set_rates(values.to_vec())
    }

    fn n_free_params(&self) -> usize {
        self.rates.len() + self.n - 1
    }
}

/// HKY85: transitions happen `kappa` times faster than transversions.
/// States are ordered A, C, G, T.
#[derive(Debug, Clone)]
pub struct Hky {
    kappa: f64,
    inner: Reversible,
}

impl Hky {
    pub fn new(kappa: f64, freqs: [f64; 4]) -> Result<Self> {
        check_kappa(kappa)?;
        Ok(Self {
            kappa,
            inner: Reversible::new("HKY", hky_rates(kappa).to_vec(), freqs.to_vec())?,
        })
    }

    pub fn kappa(&self) -> f64 {
        self.kappa
    }
}

fn check_kappa(kappa: f64) -> Result<()> {
    if !(kappa > 0.0) || !kappa.is_finite() {
        return Err(CyaneaError::config("HKY", format!("kappa must be positive, got {}", kappa)));
    }
    Ok(())
}

fn hky_rates(kappa: f64) -> [f64; 6] {
    // AC, AG, AT, CG, CT, GT
    [1.0, kappa, 1.0, 1.0, kappa, 1.0]
}

impl SubstitutionModel for Hky {
    fn name(&self) -> &str {
        "HKY"
    }

    fn n_states(&self) -> usize {
        4
    }

    fn frequencies(&self) -> &[f64] {
        self.inner.frequencies()
    }

    fn transition_probabilities(&self, branch_length: f64, rate: f64, out: &mut [f64]) {
        self.inner.transition_probabilities(branch_length, rate, out)
    }

    /// Expects a single value, kappa.
    fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        let &[kappa] = values else {
            return Err(CyaneaError::config(
                "HKY",
                format!("expected 1 parameter (kappa), got {}", values.len()),
            ));
        };
        check_kappa(kappa)?;
        self.inner.set_rates(hky_rates(kappa).to_vec())?;
        self.kappa = kappa;
        Ok(())
    }

    fn n_free_params(&self) -> usize {
        // kappa + 3 free frequencies
        4
    }
}

/// Build a rate matrix from upper-triangle exchangeabilities and
/// frequencies, normalized to one expected substitution per unit time.
fn build_rate_matrix(n: usize, rates: &[f64], freqs: &[f64]) -> Vec<f64> {
    let mut q = vec![0.0; n * n];
    let mut k = 0;
    for i in 0..n {
        for j in (i + 1)..n {
            q[i * n + j] = rates[k] * freqs[j];
            q[j * n + i] = rates[k] * freqs[i];
            k += 1;
        }
    }
    for i in 0..n {
        let off: f64 = (0..n).filter(|&j| j != i).map(|j| q[i * n + j]).sum();
        q[i * n + i] = -off;
    }
    let mu: f64 = (0..n).map(|i| -freqs[i] * q[i * n + i]).sum();
    if mu > 0.0 {
        for x in q.iter_mut() {
            *x /= mu;
        }
    }
    q
}

/// Jacobi eigendecomposition of a symmetric `n x n` row-major matrix.
///
/// Returns eigenvalues and a row-major matrix whose column `k` is the
/// eigenvector for eigenvalue `k`.
fn eigen_decompose(n: usize, mut a: Vec<f64>) -> (Vec<f64>, Vec<f64>) {
    let mut v = vec![0.0; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }

    for _ in 0..(50 * n * n).max(200) {
        // Largest off-diagonal element.
        let mut max_val = 0.0f64;
        let (mut p, mut q) = (0, 1);
        for i in 0..n {
            for j in (i + 1)..n {
                if a[i * n + j].abs() > max_val {
                    max_val = a[i * n + j].abs();
                    p = i;
                    q = j;
                }
            }
        }
        if max_val < 1e-15 {
            break;
        }

        let app = a[p * n + p];
        let aqq = a[q * n + q];
        let theta = if (app - aqq).abs() < 1e-30 {
            std::f64::consts::FRAC_PI_4
        } else {
            0.5 * (2.0 * a[p * n + q] / (app - aqq)).atan()
        };
        let (s, c) = theta.sin_cos();

        // Columns p and q, then rows p and q.
        for i in 0..n {
            let aip = a[i * n + p];
            let aiq = a[i * n + q];
            a[i * n + p] = c * aip + s * aiq;
            a[i * n + q] = -s * aip + c * aiq;
        }
        for j in 0..n {
            let apj = a[p * n + j];
            let aqj = a[q * n + j];
            a[p * n + j] = c * apj + s * aqj;
            a[q * n + j] = -s * apj + c * aqj;
        }
        a[p * n + q] = 0.0;
        a[q * n + p] = 0.0;

        for i in 0..n {
            let vip = v[i * n + p];
            let viq = v[i * n + q];
            v[i * n + p] = c * vip + s * viq;
            v[i * n + q] = -s * vip + c * viq;
        }
    }

    ((0..n).map(|i| a[i * n + i]).collect(), v)
}
