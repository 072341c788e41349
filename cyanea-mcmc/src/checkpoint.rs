//! Chain state persistence.
//!
//! A checkpoint holds everything needed to continue a run bit for bit:
//! every state value (with bounds and policy), the tree topology and
//! heights, the PRNG stream position and the operators' tuning and
//! counters. Derived calculations are not saved; they are recomputed on
//! resume.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use cyanea_core::Result;
use cyanea_phylo::{TimeTree, TreeSnapshot};

use crate::logger::lock;
use crate::parameter::{IntegerParameter, ParameterSnapshot, RealParameter};
use crate::rng::ChainRng;
use crate::schedule::OperatorState;
use crate::state::StateValue;

/// A saved state value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SavedValue {
    Real(ParameterSnapshot<f64>),
    Integer(ParameterSnapshot<i64>),
    Tree(TreeSnapshot),
}

impl SavedValue {
    pub fn id(&self) -> &str {
        match self {
            SavedValue::Real(s) => &s.id,
            SavedValue::Integer(s) => &s.id,
            SavedValue::Tree(s) => &s.id,
        }
    }

    pub fn capture(value: &StateValue) -> Self {
        match value {
            StateValue::Real(p) => SavedValue::Real(p.snapshot()),
            StateValue::Integer(p) => SavedValue::Integer(p.snapshot()),
            StateValue::Tree(t) => SavedValue::Tree(t.snapshot()),
        }
    }

    /// Rebuild the live value, re-checking bounds and tree structure.
    pub fn restore(self) -> Result<StateValue> {
        Ok(match self {
            SavedValue::Real(s) => StateValue::Real(RealParameter::from_snapshot(s)?),
            SavedValue::Integer(s) => StateValue::Integer(IntegerParameter::from_snapshot(s)?),
            SavedValue::Tree(s) => StateValue::Tree(TimeTree::from_snapshot(s)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Index of the last completed sample.
    pub sample: i64,
    pub values: Vec<SavedValue>,
    pub rng: ChainRng,
    #[serde(default)]
    pub operators: Vec<OperatorState>,
}

impl Checkpoint {
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.to_writer(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }
}

/// Receives checkpoints at the configured cadence.
pub trait CheckpointSink {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<()>;
}

impl CheckpointSink for Vec<Checkpoint> {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.push(checkpoint.clone());
        Ok(())
    }
}

impl<S: CheckpointSink + ?Sized> CheckpointSink for Arc<Mutex<S>> {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        lock(self)?.save(checkpoint)
    }
}

/// Overwrites one JSON file with the latest checkpoint.
///
/// Writes go to a sibling `.tmp` file that is renamed over the target, so
/// an interrupted write never leaves a truncated checkpoint behind.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointSink for FileSink {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        checkpoint.save(&tmp)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), sample = checkpoint.sample, "checkpoint written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::BoundsPolicy;

    fn checkpoint() -> Checkpoint {
        let p = RealParameter::new("kappa", vec![2.0])
            .unwrap()
            .with_bounds(0.0, 100.0)
            .unwrap()
            .with_policy(BoundsPolicy::Clamp);
        let n = IntegerParameter::new("k", vec![3, 4]).unwrap();
        let t = TimeTree::from_newick("tree", "((A:1,B:1):1,C:2);").unwrap();
        let mut rng = ChainRng::seed_from_u64(9);
        rng.uniform();
        Checkpoint {
            sample: 500,
            values: vec![
                SavedValue::capture(&StateValue::Real(p)),
                SavedValue::capture(&StateValue::Integer(n)),
                SavedValue::capture(&StateValue::Tree(t)),
            ],
            rng,
            operators: Vec::new(),
        }
    }

    #[test]
    fn json_round_trip_preserves_everything() {
        let cp = checkpoint();
        let mut buf = Vec::new();
        cp.to_writer(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.contains("\"type\": \"tree\""));
        let back = Checkpoint::from_reader(buf.as_slice()).unwrap();
        assert_eq!(back, cp);

        let mut a = cp.rng.clone();
        let mut b = back.rng.clone();
        assert_eq!(a.uniform().to_bits(), b.uniform().to_bits());
    }

    #[test]
    fn restored_values_keep_bounds_and_topology() {
        let cp = checkpoint();
        let ids: Vec<&str> = cp.values.iter().map(|v| v.id()).collect();
        assert_eq!(ids, ["kappa", "k", "tree"]);
        let mut restored = cp.values.into_iter().map(|v| v.restore().unwrap());
        match restored.next().unwrap() {
            StateValue::Real(p) => {
                assert_eq!(p.upper(), 100.0);
                assert_eq!(p.policy(), BoundsPolicy::Clamp);
            }
            other => panic!("unexpected {:?}", other.kind_name()),
        }
        restored.next().unwrap();
        match restored.next().unwrap() {
            StateValue::Tree(t) => {
                assert_eq!(t.leaf_names(), ["A", "B", "C"]);
                assert_eq!(t.height(t.root()), 2.0);
            }
            other => panic!("unexpected {:?}", other.kind_name()),
        }
    }

    #[test]
    fn corrupt_tree_fails_restore() {
        let mut cp = checkpoint();
        if let SavedValue::Tree(s) = &mut cp.values[2] {
            s.nodes[0].height = 10.0;
        }
        let tree = cp.values.pop().unwrap();
        assert!(tree.restore().is_err());
    }

    #[test]
    fn file_sink_overwrites() {
        let dir = std::env::temp_dir().join(format!("cyanea-ckpt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("chain.json");
        let mut sink = FileSink::new(&path);
        let mut cp = checkpoint();
        sink.save(&cp).unwrap();
        cp.sample = 1000;
        sink.save(&cp).unwrap();
        let back = Checkpoint::load(&path).unwrap();
        assert_eq!(back.sample, 1000);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
