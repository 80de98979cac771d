//! Live-across analysis: which values cross a subkernel boundary on the
//! wire. For each *destination* subkernel the kernel is cloned, every edge
//! into a post-barrier block is cut into a return, and a synthetic entry is
//! pointed at the destination's entry block; a value used in the destination
//! whose definition does not dominate that use in the cut CFG must be
//! preserved across the barrier — or recomputed, when it is a pure function
//! of the kernel's environment.

use std::collections::BTreeSet;

use hashbrown::{HashMap, HashSet};
use gridfold_ir::{
    DefPos, DefSite, InstId, Module, NodeIndex, Operation, Procedure, Terminator,
};

use crate::subkernels::{SubkernelId, Subkernels};

use super::{dominators::DomTree, for_each_use};

pub struct LiveAcross {
    /// Values to load from the preserved record at each subkernel's entry,
    /// sorted by id.
    pub live_in: Vec<Vec<InstId>>,
    /// Values recomputed at each subkernel's entry instead of preserved.
    pub remat: Vec<Vec<InstId>>,
    /// Dominators of the cut CFG used for each destination; reused by the
    /// synthesis stage for its non-dominated-use filter.
    pub doms: Vec<DomTree>,
    /// Pairwise live-across sets, keyed (from, to); kept for inspection and
    /// invariant checks.
    pub pairs: HashMap<(SubkernelId, SubkernelId), Vec<InstId>>,
}

impl LiveAcross {
    /// The union of every live-across set, deduplicated and sorted.
    pub fn union(&self) -> Vec<InstId> {
        let mut union: BTreeSet<InstId> = BTreeSet::new();
        for set in &self.live_in {
            union.extend(set.iter().copied());
        }
        union.into_iter().collect()
    }
}

/// Clone the kernel and cut every barrier edge: the single predecessor of a
/// post-barrier block gets a bare return. A synthetic entry block branching
/// at `target` becomes the CFG root.
fn cut_kernel(
    kernel: &Procedure,
    post_barrier: &HashSet<NodeIndex>,
    target: NodeIndex,
) -> (Procedure, NodeIndex) {
    let mut cut = kernel.clone();
    for &block in post_barrier {
        for pred in cut.predecessors(block) {
            cut.set_terminator(pred, Terminator::Return { value: None });
        }
    }
    let synthetic = cut.add_block();
    cut.set_terminator(synthetic, Terminator::Branch { target });
    (cut, synthetic)
}

pub fn compute(
    module: &Module,
    kernel: &Procedure,
    post_barrier: &HashSet<NodeIndex>,
    subs: &Subkernels,
) -> LiveAcross {
    let def_sites = kernel.def_sites();

    let mut live_in = Vec::with_capacity(subs.list.len());
    let mut remat = Vec::with_capacity(subs.list.len());
    let mut doms = Vec::with_capacity(subs.list.len());
    let mut pairs: HashMap<(SubkernelId, SubkernelId), Vec<InstId>> = HashMap::new();

    for dest in subs.ids() {
        let sub = &subs.list[dest];
        let (cut, synthetic) = cut_kernel(kernel, post_barrier, sub.entry());
        let dom = DomTree::build(&cut, synthetic);

        let mut live: BTreeSet<InstId> = BTreeSet::new();
        for_each_use(kernel, &sub.blocks, |operand, site| {
            let Some(id) = operand.as_inst() else {
                return;
            };
            let Some(def) = def_sites.get(&id) else {
                return;
            };
            if !dom.dominates_use(*def, site) {
                live.insert(id);
            }
        });

        let (preserved, recomputed): (Vec<InstId>, Vec<InstId>) = live
            .into_iter()
            .partition(|id| !depends_only_on_environment(module, kernel, &def_sites, *id));

        for &id in &preserved {
            let def = def_sites[&id];
            let from = subs.owner_of(def.block).unwrap_or(dest);
            pairs.entry((from, dest)).or_default().push(id);
        }

        log::trace!(
            "kernel @{}: subkernel {dest} live-in {:?}, rematerialised {:?}",
            kernel.name,
            preserved,
            recomputed
        );
        live_in.push(preserved);
        remat.push(recomputed);
        doms.push(dom);
    }

    LiveAcross {
        live_in,
        remat,
        doms,
        pairs,
    }
}

/// Whether a value is a pure function of parameters, globals and constants:
/// no φ-node, no memory access, no allocation and no impure call anywhere in
/// its transitive operand chain. Such values are cheaper to recompute after
/// the barrier than to preserve.
fn depends_only_on_environment(
    module: &Module,
    kernel: &Procedure,
    def_sites: &HashMap<InstId, DefSite>,
    id: InstId,
) -> bool {
    let mut stack = vec![id];
    let mut seen: HashSet<InstId> = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(def) = def_sites.get(&id) else {
            return false;
        };
        let DefPos::Op(idx) = def.pos else {
            // φ-nodes depend on control flow.
            return false;
        };
        let inst = &kernel.block(def.block).ops[idx];
        match &inst.operation {
            Operation::Load { .. }
            | Operation::Store { .. }
            | Operation::StackAlloc { .. }
            | Operation::HeapAlloc { .. }
            | Operation::HeapFree { .. }
            | Operation::LifetimeStart { .. }
            | Operation::LifetimeEnd { .. } => return false,
            Operation::Call { callee, .. } => {
                let pure = module.proc(callee).map(|p| p.pure).unwrap_or(false);
                if !pure {
                    return false;
                }
            }
            _ => {}
        }
        for operand in inst.operation.operands() {
            if let Some(op_id) = operand.as_inst() {
                stack.push(op_id);
            }
        }
    }
    true
}

/// Collect the expression tree of a rematerialisable value in evaluation
/// order (operands before users). Used by the synthesis stage to clone the
/// computation into a subkernel entry.
pub fn remat_tree(
    kernel: &Procedure,
    def_sites: &HashMap<InstId, DefSite>,
    id: InstId,
) -> Vec<InstId> {
    let mut order = Vec::new();
    let mut seen: HashSet<InstId> = HashSet::new();
    fn visit(
        kernel: &Procedure,
        def_sites: &HashMap<InstId, DefSite>,
        id: InstId,
        seen: &mut HashSet<InstId>,
        order: &mut Vec<InstId>,
    ) {
        if !seen.insert(id) {
            return;
        }
        let def = def_sites[&id];
        let DefPos::Op(idx) = def.pos else {
            unreachable!("rematerialised values never come from φ-nodes");
        };
        let inst = &kernel.block(def.block).ops[idx];
        for operand in inst.operation.operands() {
            if let Some(op_id) = operand.as_inst() {
                visit(kernel, def_sites, op_id, seen, order);
            }
        }
        order.push(id);
    }
    visit(kernel, def_sites, id, &mut seen, &mut order);
    order
}
