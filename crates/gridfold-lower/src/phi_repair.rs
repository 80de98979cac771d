//! φ-node repair after CFG surgery. When blocks are erased or replaced in a
//! clone, every φ in the surviving blocks must drop incoming entries from
//! erased predecessors and retarget entries whose predecessor was replaced.
//! A φ left with no entries is itself dead: it is removed and its uses become
//! undef.

use hashbrown::{HashMap, HashSet};
use gridfold_ir::{NodeIndex, Procedure, Variable};

/// Rewrite φ incoming lists in one pass over the procedure. Entries from a
/// block in `erased` are dropped; entries from a key of `replaced` move to
/// the mapped block. Returns after replacing uses of any φ that ended up
/// empty with undef.
pub fn repair(
    proc: &mut Procedure,
    erased: &HashSet<NodeIndex>,
    replaced: &HashMap<NodeIndex, NodeIndex>,
) {
    let mut dead: Vec<(gridfold_ir::InstId, Variable)> = Vec::new();
    for block in proc.node_ids() {
        if erased.contains(&block) {
            continue;
        }
        let phis = &mut proc.block_mut(block).phi_nodes;
        for phi in phis.iter_mut() {
            phi.entries.retain(|entry| !erased.contains(&entry.block));
            for entry in &mut phi.entries {
                if let Some(new) = replaced.get(&entry.block) {
                    entry.block = *new;
                }
            }
        }
        phis.retain(|phi| {
            if phi.entries.is_empty() {
                let id = phi.out.as_inst().expect("phi out is an inst");
                dead.push((id, Variable::undef(phi.out.ty.clone())));
                false
            } else {
                true
            }
        });
    }
    for (id, undef) in dead {
        proc.replace_uses(id, &undef);
    }
}
