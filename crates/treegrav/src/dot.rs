//! Graphviz dump of a piece's local tree, for eyeballing how a partition
//! carved the key space.

use std::io::{self, Write};

use crate::piece::TreePiece;
use crate::sfc::key_bits;
use crate::tree::{NodeKind, TreeNode, NIL};

fn color(node: &TreeNode) -> &'static str {
    match node.kind {
        NodeKind::Bucket | NodeKind::Internal => "black",
        NodeKind::NonLocal => "red",
        NodeKind::Boundary => "purple",
        _ => "yellow",
    }
}

fn label(node: &TreeNode) -> String {
    let bits = key_bits(node.key, node.level);
    match node.kind {
        NodeKind::Bucket => format!("{bits}\\nBucket\\nSize: {}", node.local_count()),
        NodeKind::Internal => format!("{bits}\\nInternal\\nLocal N under: {}", node.local_count()),
        NodeKind::NonLocal => format!(
            "{bits}\\nNonLocal: piece {}\\nRemote N under: {}\\nOwners: {}",
            node.remote_index,
            node.local_count(),
            node.num_owners
        ),
        NodeKind::Boundary => format!(
            "{bits}\\nBoundary\\nTotal N under: {}\\nLocal N under: {}\\nOwners: {}",
            node.remote_index,
            node.local_count(),
            node.num_owners
        ),
        other => format!("{bits}\\n{other:?}"),
    }
}

fn print_node(piece: &TreePiece, idx: usize, os: &mut impl Write) -> io::Result<()> {
    let node = &piece.nodes[idx];
    let id = key_bits(node.key, node.level);
    writeln!(os, "\tnode [color=\"{}\"]", color(node))?;
    writeln!(os, "\t\"{id}\" [label=\"{}\"]", label(node))?;
    if node.parent != NIL {
        let parent = &piece.nodes[node.parent];
        writeln!(os, "\t\"{}\" -> \"{id}\";", key_bits(parent.key, parent.level))?;
    }
    if node.kind == NodeKind::NonLocal || node.kind == NodeKind::Bucket {
        return Ok(());
    }
    for (tag, child) in [("0", node.left_child), ("1", node.right_child)] {
        if child != NIL {
            print_node(piece, child, os)?;
        } else {
            writeln!(os, "\tnode [color=\"green\"]")?;
            writeln!(os, "\t\"{id}{tag}\" [label=\"None\"]")?;
            writeln!(os, "\t\"{id}\" -> \"{id}{tag}\";")?;
        }
    }
    Ok(())
}

/// Write one piece's tree as a digraph.
pub fn write_tree(piece: &TreePiece, os: &mut impl Write) -> io::Result<()> {
    writeln!(os, "digraph G{} {{", piece.index)?;
    writeln!(os, "\tcenter = \"true\"")?;
    writeln!(os, "\tsize = \"7.5,10\"")?;
    writeln!(os, "\tnode [style=\"bold\"]")?;
    writeln!(
        os,
        "\tlabel = \"Piece: {}\\nParticles: {}\"",
        piece.index,
        piece.num_particles()
    )?;
    writeln!(os, "\tfontname = \"Helvetica\"")?;
    print_node(piece, piece.root, os)?;
    writeln!(os, "}}")
}
