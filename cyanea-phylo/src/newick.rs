//! Newick format parser and writer for time trees.
//!
//! Supports the standard Newick grammar:
//! ```text
//! tree     = subtree ';'
//! subtree  = '(' children ')' label | label
//! children = subtree (',' subtree)*
//! label    = name? (':' length)?
//! ```
//!
//! Every non-root node needs a branch length. Heights are measured back from
//! the tip furthest from the root, so tips closer to the root get positive
//! heights (serially sampled data).

use crate::tree::{Node, NodeId, TimeTree};
use cyanea_core::{CyaneaError, Result};

/// Tolerance below which a computed height is snapped to zero.
const HEIGHT_EPSILON: f64 = 1e-12;

/// Parse a Newick string into a `TimeTree` identified by `id`.
pub fn parse(id: impl Into<String>, input: &str) -> Result<TimeTree> {
    let mut parser = Parser::new(input.as_bytes());
    let (raw, root) = parser.parse_tree()?;
    to_time_tree(id.into(), raw, root)
}

/// Serialize a `TimeTree` to a Newick string with branch lengths.
pub fn write(tree: &TimeTree) -> String {
    let mut buf = String::new();
    write_subtree(tree, tree.root(), &mut buf);
    buf.push(';');
    buf
}

fn write_subtree(tree: &TimeTree, id: NodeId, buf: &mut String) {
    let children = tree.children(id);
    if !children.is_empty() {
        buf.push('(');
        for (i, &child) in children.iter().enumerate() {
            if i > 0 {
                buf.push(',');
            }
            write_subtree(tree, child, buf);
        }
        buf.push(')');
    }
    if let Some(name) = tree.get_node(id).and_then(|n| n.name.as_deref()) {
        buf.push_str(name);
    }
    if !tree.is_root(id) {
        buf.push(':');
        // Use enough precision but strip trailing zeros
        let s = format!("{:.10}", tree.branch_length(id));
        let s = s.trim_end_matches('0');
        let s = s.trim_end_matches('.');
        buf.push_str(s);
    }
}

/// A parsed node before heights and ids are assigned.
struct RawNode {
    parent: Option<usize>,
    children: Vec<usize>,
    length: Option<f64>,
    name: Option<String>,
}

/// Renumber leaves first (in reading order), internal nodes after (in
/// postorder), and convert branch lengths to heights.
fn to_time_tree(id: String, raw: Vec<RawNode>, root: usize) -> Result<TimeTree> {
    // Postorder over the raw arena.
    let mut order = Vec::with_capacity(raw.len());
    let mut stack = vec![(root, false)];
    while let Some((n, expanded)) = stack.pop() {
        if expanded {
            order.push(n);
        } else {
            stack.push((n, true));
            for &c in raw[n].children.iter().rev() {
                stack.push((c, false));
            }
        }
    }

    let mut new_id = vec![0usize; raw.len()];
    let leaves: Vec<usize> = order.iter().copied().filter(|&n| raw[n].children.is_empty()).collect();
    let internals: Vec<usize> = order.iter().copied().filter(|&n| !raw[n].children.is_empty()).collect();
    for (i, &n) in leaves.iter().chain(internals.iter()).enumerate() {
        new_id[n] = i;
    }

    // Distance from the root, preorder (reverse postorder).
    let mut depth = vec![0.0f64; raw.len()];
    for &n in order.iter().rev() {
        if let Some(p) = raw[n].parent {
            let len = raw[n].length.ok_or_else(|| {
                CyaneaError::Parse(format!(
                    "branch length missing for node '{}'",
                    raw[n].name.as_deref().unwrap_or("<internal>")
                ))
            })?;
            if len < 0.0 {
                return Err(CyaneaError::Parse(format!("negative branch length {}", len)));
            }
            depth[n] = depth[p] + len;
        }
    }
    let max_depth = leaves.iter().map(|&n| depth[n]).fold(0.0, f64::max);

    let mut nodes: Vec<Node> = (0..raw.len())
        .map(|i| Node {
            id: i,
            parent: None,
            children: Vec::new(),
            height: 0.0,
            name: None,
        })
        .collect();
    for (old, r) in raw.into_iter().enumerate() {
        let node = &mut nodes[new_id[old]];
        node.parent = r.parent.map(|p| new_id[p]);
        node.children = r.children.iter().map(|&c| new_id[c]).collect();
        let h = max_depth - depth[old];
        node.height = if h.abs() < HEIGHT_EPSILON { 0.0 } else { h };
        node.name = r.name;
    }
    TimeTree::from_parts(id, nodes, new_id[root], leaves.len())
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn parse_tree(&mut self) -> Result<(Vec<RawNode>, usize)> {
        self.skip_whitespace();
        let root = self.parse_subtree(None)?;
        self.skip_whitespace();
        if self.peek() != Some(b';') {
            return Err(CyaneaError::Parse("expected ';' at end of Newick string".into()));
        }
        self.pos += 1;
        Ok((std::mem::take(&mut self.nodes), root))
    }

    fn parse_subtree(&mut self, parent: Option<usize>) -> Result<usize> {
        self.skip_whitespace();
        let id = self.alloc_node(parent);

        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                let child = self.parse_subtree(Some(id))?;
                self.nodes[id].children.push(child);
                self.skip_whitespace();
                if self.peek() == Some(b',') {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            if self.peek() != Some(b')') {
                return Err(CyaneaError::Parse("expected ')' in Newick string".into()));
            }
            self.pos += 1;
        }

        self.parse_label(id)?;
        Ok(id)
    }

    fn parse_label(&mut self, id: usize) -> Result<()> {
        self.skip_whitespace();
        let name = self.parse_name();
        if !name.is_empty() {
            self.nodes[id].name = Some(name);
        }
        self.skip_whitespace();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            let len_str = self.parse_float_str();
            if len_str.is_empty() {
                return Err(CyaneaError::Parse("expected number after ':'".into()));
            }
            let len: f64 = len_str.parse().map_err(|_| {
                CyaneaError::Parse(format!("invalid branch length: '{}'", len_str))
            })?;
            self.nodes[id].length = Some(len);
        }
        Ok(())
    }

    fn parse_name(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b':' | b',' | b')' | b'(' | b';' | b' ' | b'\t' | b'\n' | b'\r' => break,
                _ => self.pos += 1,
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn parse_float_str(&mut self) -> String {
        let start = self.pos;
        while let Some(b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E') = self.peek() {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn alloc_node(&mut self, parent: Option<usize>) -> usize {
        self.nodes.push(RawNode {
            parent,
            children: Vec::new(),
            length: None,
            name: None,
        });
        self.nodes.len() - 1
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.peek() {
            self.pos += 1;
        }
    }
}
