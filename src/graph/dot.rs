use crate::{types::NodeId, utils::escape_dot_label};
use std::io::{self, Write};

/// Writes `nodes` as a DOT digraph.
///
/// Each item is a node label together with the ids of its dependents; the
/// position of an item is its node id.
pub(super) fn write_dot<'a, W, I, D>(mut out: W, nodes: I) -> io::Result<()>
where
    W: Write,
    I: Iterator<Item = (&'a str, D)> + Clone,
    D: IntoIterator<Item = NodeId>,
{
    writeln!(out, "digraph G{{")?;
    for (index, (label, _)) in nodes.clone().enumerate() {
        writeln!(out, "  N{index}[label=\"{}\"];", escape_dot_label(label))?;
    }
    for (index, (_, dependents)) in nodes.enumerate() {
        for dependent in dependents {
            writeln!(out, "  N{index}->{dependent};")?;
        }
    }
    writeln!(out, "}}")?;
    out.flush()
}
