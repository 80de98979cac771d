pub mod dominators;
pub mod live_across;

use gridfold_ir::{NodeIndex, Procedure, Variable};

/// Where an operand is read. φ incoming values are read at the end of their
/// predecessor block; terminator operands after every instruction of their
/// block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseSite {
    PhiIncoming { pred: NodeIndex },
    Op { block: NodeIndex, idx: usize },
    Terminator { block: NodeIndex },
}

/// Visit every operand read in the given blocks together with its use site.
pub fn for_each_use(
    proc: &Procedure,
    blocks: &[NodeIndex],
    mut visit: impl FnMut(&Variable, UseSite),
) {
    for &block in blocks {
        let bb = proc.block(block);
        for phi in &bb.phi_nodes {
            for entry in &phi.entries {
                visit(&entry.value, UseSite::PhiIncoming { pred: entry.block });
            }
        }
        for (idx, inst) in bb.ops_in_order() {
            for operand in inst.operation.operands() {
                visit(operand, UseSite::Op { block, idx });
            }
        }
        if let Some(operand) = bb.terminator.operands() {
            visit(operand, UseSite::Terminator { block });
        }
    }
}

/// Visit every operand of a procedure without caring where it is read.
pub fn for_each_operand(proc: &Procedure, mut visit: impl FnMut(&Variable)) {
    let blocks = proc.node_ids();
    for_each_use(proc, &blocks, |var, _| visit(var));
}
