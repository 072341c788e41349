//! Sample loggers and trace diagnostics.

use std::io::Write;
use std::sync::{Arc, Mutex};

use cyanea_core::{CyaneaError, Result};

/// One logged sample, flattened to named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub sample: i64,
    pub posterior: f64,
    pub prior: Option<f64>,
    pub likelihood: Option<f64>,
    /// `(column, value)` pairs in state registration order.
    pub values: Vec<(String, f64)>,
}

impl SampleRecord {
    pub fn get(&self, column: &str) -> Option<f64> {
        self.values.iter().find(|(c, _)| c == column).map(|&(_, v)| v)
    }
}

/// Receives samples from a running chain.
pub trait SampleLogger {
    /// Called once before the first sample with the value column names.
    fn init(&mut self, columns: &[String]) -> Result<()>;

    fn log(&mut self, record: &SampleRecord) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared logger, so a caller can read what a chain wrote after the run.
impl<L: SampleLogger + ?Sized> SampleLogger for Arc<Mutex<L>> {
    fn init(&mut self, columns: &[String]) -> Result<()> {
        lock(self)?.init(columns)
    }

    fn log(&mut self, record: &SampleRecord) -> Result<()> {
        lock(self)?.log(record)
    }

    fn close(&mut self) -> Result<()> {
        lock(self)?.close()
    }
}

pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| CyaneaError::Other("shared collaborator lock poisoned".into()))
}

/// Keeps every record in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryLogger {
    pub columns: Vec<String>,
    pub records: Vec<SampleRecord>,
    pub closed: bool,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trace of one column.
    pub fn trace(&self, column: &str) -> Vec<f64> {
        self.records.iter().filter_map(|r| r.get(column)).collect()
    }

    pub fn posterior_trace(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.posterior).collect()
    }
}

impl SampleLogger for MemoryLogger {
    fn init(&mut self, columns: &[String]) -> Result<()> {
        self.columns = columns.to_vec();
        Ok(())
    }

    fn log(&mut self, record: &SampleRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Tab-separated trace writer.
pub struct TabLogger<W: Write> {
    out: W,
    columns: Vec<String>,
}

impl<W: Write> TabLogger<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            columns: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> SampleLogger for TabLogger<W> {
    fn init(&mut self, columns: &[String]) -> Result<()> {
        self.columns = columns.to_vec();
        let mut header = String::from("Sample\tposterior\tprior\tlikelihood");
        for c in columns {
            header.push('\t');
            header.push_str(c);
        }
        writeln!(self.out, "{}", header)?;
        Ok(())
    }

    fn log(&mut self, record: &SampleRecord) -> Result<()> {
        if record.values.len() != self.columns.len() {
            return Err(CyaneaError::invariant(
                "TabLogger",
                format!(
                    "record has {} values for {} columns",
                    record.values.len(),
                    self.columns.len()
                ),
            ));
        }
        let opt = |v: Option<f64>| v.map_or_else(|| "NA".to_string(), |x| x.to_string());
        let mut line = format!(
            "{}\t{}\t{}\t{}",
            record.sample,
            record.posterior,
            opt(record.prior),
            opt(record.likelihood)
        );
        for (_, v) in &record.values {
            line.push('\t');
            line.push_str(&v.to_string());
        }
        writeln!(self.out, "{}", line)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Effective sample size from the initial positive sequence of
/// autocorrelations.
pub fn ess(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return n as f64;
    }

    let mean = values.iter().sum::<f64>() / n as f64;
    let var: f64 = values.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    if var < 1e-30 {
        return n as f64;
    }

    let mut sum_rho = 0.0;
    for lag in 1..n {
        let rho = values[..n - lag]
            .iter()
            .zip(&values[lag..])
            .map(|(a, b)| (a - mean) * (b - mean))
            .sum::<f64>()
            / (n as f64 * var);
        if rho < 0.0 {
            break;
        }
        sum_rho += rho;
    }

    (n as f64 / (1.0 + 2.0 * sum_rho)).max(1.0)
}
